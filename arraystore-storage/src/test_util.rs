//! Minimal HTTP/1.1 server for backend tests.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

pub(crate) struct TestHttpServer {
    addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl TestHttpServer {
    /// Serves `routes` with every response held back by `delay`.
    pub(crate) async fn start(routes: &[(&str, &[u8])], delay: Duration) -> Self {
        Self::serve(routes, delay, true).await
    }

    /// Serves `routes` but answers every HEAD request with 405.
    pub(crate) async fn start_refusing_head(routes: &[(&str, &[u8])]) -> Self {
        Self::serve(routes, Duration::ZERO, false).await
    }

    async fn serve(routes: &[(&str, &[u8])], delay: Duration, allow_head: bool) -> Self {
        let routes: Arc<HashMap<String, Vec<u8>>> = Arc::new(
            routes
                .iter()
                .map(|(path, body)| (path.to_string(), body.to_vec()))
                .collect(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&request).to_string();
                    let mut parts = head.split_whitespace();
                    let method = parts.next().unwrap_or_default().to_string();
                    let path = parts.next().unwrap_or_default().to_string();

                    tokio::time::sleep(delay).await;

                    let (status, body) = match routes.get(&path) {
                        _ if method == "HEAD" && !allow_head => {
                            ("405 Method Not Allowed", Vec::new())
                        }
                        Some(body) => ("200 OK", body.clone()),
                        None => ("404 Not Found", Vec::new()),
                    };
                    let mut response = format!(
                        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    )
                    .into_bytes();
                    if method != "HEAD" {
                        response.extend_from_slice(&body);
                    }
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { addr, task }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// A URL nothing listens on.
    pub(crate) fn unreachable_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/gone")
    }
}

impl Drop for TestHttpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
