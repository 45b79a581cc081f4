use std::time::Duration;

use arraystore_array::{ElementType, OpenOptions, Scalar, Selection};
use arraystore_lock::{Acquisition, LockOptions, Release};
use arraystore_pool::{ArrayHandle, OperatorPool, PoolOptions};
use arraystore_storage::{Content, ReadMode, StorageError, StorageOptions};
use indexmap::IndexMap;

fn pool_options(workers: usize, scratch: &tempfile::TempDir) -> PoolOptions {
    PoolOptions::default()
        .with_workers(workers)
        .with_worker_executable(env!("CARGO_BIN_EXE_arraystore-worker"))
        .with_storage(StorageOptions::default().with_scratch_root(scratch.path()))
        .with_request_timeout(Some(Duration::from_secs(30)))
}

async fn storage_round(pool: &OperatorPool, root: &str) -> Vec<String> {
    let operator = pool.get_operator();
    let mut entries = IndexMap::new();
    entries.insert(format!("{root}/a.txt"), Content::Text("alpha".into()));
    entries.insert(
        format!("{root}/nested/b.bin"),
        Content::Binary(vec![1u8, 2, 3].into()),
    );
    let writes = operator.write(entries).await;

    let paths = vec![
        format!("{root}/a.txt"),
        format!("{root}/missing.txt"),
        format!("{root}/nested/b.bin"),
    ];
    let exists = operator.exists(paths.clone()).await;
    let reads = operator.read(paths, ReadMode::Binary).await;
    let listing = operator.list_dir(root).await;

    let mut summary = Vec::new();
    summary.push(format!("{:?}", writes.iter().map(Result::is_ok).collect::<Vec<_>>()));
    summary.push(format!("{:?}", exists.into_iter().map(|r| r.ok()).collect::<Vec<_>>()));
    for read in reads {
        summary.push(match read {
            Ok(content) => format!("{:?}", content.as_bytes()),
            Err(StorageError::NotFound { .. }) => "not found".to_string(),
            Err(e) => format!("error: {e}"),
        });
    }
    summary.push(format!("{:?}", listing.ok()));
    summary
}

async fn array_round(pool: &OperatorPool, path: &str) -> Vec<Scalar> {
    let mut array = pool
        .open_array(path, OpenOptions::create(vec![6, 4], vec![4, 4], ElementType::I32))
        .await
        .unwrap();
    array
        .write_range(vec![0..2, 0..4], (0..8i64).map(Scalar::from).collect())
        .await
        .unwrap();
    array.resize(vec![8, 4]).await.unwrap();
    array
        .write_coordinates(vec![vec![7, 3]], vec![Scalar::from(99i64)])
        .await
        .unwrap();
    let values = array.read_range(vec![0..8, 0..4]).await.unwrap();
    array.close().await.unwrap();
    values
}

#[tokio::test]
async fn in_process_and_worker_pools_agree() {
    let data = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let local_root = data.path().join("local");
    let worker_root = data.path().join("workers");

    let local = OperatorPool::new(pool_options(0, &scratch)).await.unwrap();
    let workers = OperatorPool::new(pool_options(3, &scratch)).await.unwrap();
    assert_eq!(local.worker_count(), 0);
    assert_eq!(workers.worker_count(), 3);

    let expected = storage_round(&local, local_root.to_str().unwrap()).await;
    let actual = storage_round(&workers, worker_root.to_str().unwrap()).await;
    assert_eq!(expected, actual);

    let expected = array_round(&local, local_root.join("arr").to_str().unwrap()).await;
    let actual = array_round(&workers, worker_root.join("arr").to_str().unwrap()).await;
    assert_eq!(expected, actual);
    assert_eq!(expected.len(), 32);
    assert_eq!(expected[5], Scalar::Int(5));
    assert_eq!(expected[31], Scalar::Int(99));
    assert_eq!(expected[24], Scalar::Int(0));

    local.shutdown().await.unwrap();
    workers.shutdown().await.unwrap();
}

#[tokio::test]
async fn handles_agree_across_dtypes() {
    let data = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let local = OperatorPool::new(pool_options(0, &scratch)).await.unwrap();
    let workers = OperatorPool::new(pool_options(2, &scratch)).await.unwrap();

    let cases = [
        (
            ElementType::I32,
            Scalar::Int(-3),
            vec![Scalar::Int(-5), Scalar::Int(0), Scalar::Int(7)],
        ),
        (
            ElementType::U8,
            Scalar::UInt(7),
            vec![Scalar::UInt(0), Scalar::UInt(200), Scalar::UInt(7)],
        ),
        (
            ElementType::F64,
            Scalar::Float(0.5),
            vec![Scalar::Float(-1.5), Scalar::Float(0.0), Scalar::Float(2.25)],
        ),
        (
            ElementType::I64,
            Scalar::Int(0),
            vec![Scalar::Int(i64::MIN), Scalar::Int(4), Scalar::Int(1)],
        ),
    ];

    for (case, (dtype, fill, values)) in cases.into_iter().enumerate() {
        let mut handles = Vec::new();
        for (name, pool) in [("local", &local), ("workers", &workers)] {
            let path = data.path().join(format!("{name}-{case}"));
            let options =
                OpenOptions::create(vec![3, 3], vec![2, 2], dtype).with_fill_value(fill);
            let mut handle = pool
                .open_array(path.to_str().unwrap(), options)
                .await
                .unwrap();
            handle
                .write_coordinates(vec![vec![0, 0], vec![1, 2], vec![2, 1]], values.clone())
                .await
                .unwrap();
            handle.resize(vec![4, 3]).await.unwrap();
            handles.push(handle);
        }

        let (direct, proxy) = (&handles[0], &handles[1]);
        assert!(!direct.is_remote());
        assert!(proxy.is_remote());
        assert_eq!(direct.info().node, proxy.info().node, "{dtype}");
        assert_eq!(direct.mode(), proxy.mode());
        assert_eq!(proxy.shape(), Some(vec![4, 3]));
        assert_eq!(proxy.chunks(), Some(vec![2, 2]));
        assert_eq!(proxy.dtype(), Some(dtype));
        assert_eq!(proxy.fill_value(), Some(fill));

        let points = vec![vec![0, 0], vec![1, 2], vec![2, 1], vec![3, 2]];
        let expected = direct.read_coordinates(points.clone()).await.unwrap();
        let actual = proxy.read_coordinates(points).await.unwrap();
        assert_eq!(expected, actual, "{dtype}");
        assert_eq!(&actual[..3], values.as_slice());
        assert_eq!(actual[3], fill);

        let expected = direct.read_range(vec![0..4, 0..3]).await.unwrap();
        assert_eq!(expected, proxy.read_range(vec![0..4, 0..3]).await.unwrap());

        for handle in handles {
            handle.close().await.unwrap();
        }
    }

    local.shutdown().await.unwrap();
    workers.shutdown().await.unwrap();
}

#[tokio::test]
async fn proxy_handles_track_remote_state() {
    let data = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let pool = OperatorPool::new(pool_options(2, &scratch)).await.unwrap();
    let path = data.path().join("grid");
    let path = path.to_str().unwrap();

    let mut array = pool
        .open_array(
            path,
            OpenOptions::create(vec![10, 10], vec![5, 5], ElementType::F64).with_fill_value(-1.0),
        )
        .await
        .unwrap();
    assert!(array.is_remote());
    assert_eq!(array.shape(), Some(vec![10, 10]));
    assert_eq!(array.fill_value(), Some(Scalar::Float(-1.0)));

    array
        .set(
            &Selection::points(vec![vec![0, 0], vec![9, 9]]),
            vec![Scalar::from(1.5), Scalar::from(2.5)],
        )
        .await
        .unwrap();
    array.resize(vec![20, 20]).await.unwrap();
    assert_eq!(array.shape(), Some(vec![20, 20]));

    let values = array
        .read_coordinates(vec![vec![0, 0], vec![9, 9], vec![10, 10]])
        .await
        .unwrap();
    assert_eq!(
        values,
        vec![Scalar::Float(1.5), Scalar::Float(2.5), Scalar::Float(-1.0)]
    );

    let mut attributes = serde_json::Map::new();
    attributes.insert("units".into(), serde_json::json!("m"));
    array.set_attributes(attributes).await.unwrap();
    assert_eq!(
        array.get_attribute("units").await.unwrap(),
        Some(serde_json::json!("m"))
    );

    let err = array
        .read_coordinates(vec![vec![20, 0]])
        .await
        .unwrap_err();
    assert!(err.to_string().to_lowercase().contains("out of bounds"));

    // A direct handle on the same path sees what the worker wrote.
    let direct = OperatorPool::new(pool_options(0, &scratch)).await.unwrap();
    let reader = direct.open_array(path, OpenOptions::read_only()).await.unwrap();
    assert!(matches!(reader, ArrayHandle::Direct(_)));
    assert_eq!(reader.shape(), Some(vec![20, 20]));
    assert_eq!(reader.info().node, array.info().node);
    assert_eq!(
        reader.read_coordinates(vec![vec![9, 9]]).await.unwrap(),
        vec![Scalar::Float(2.5)]
    );

    array.close().await.unwrap();
    direct.shutdown().await.unwrap();
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn reopen_switches_path_and_mode() {
    let data = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let pool = OperatorPool::new(pool_options(1, &scratch)).await.unwrap();
    let first = data.path().join("first");
    let second = data.path().join("second");
    let first = first.to_str().unwrap();
    let second = second.to_str().unwrap();

    for path in [first, second] {
        let handle = pool
            .open_array(path, OpenOptions::create(vec![4], vec![2], ElementType::U8))
            .await
            .unwrap();
        handle.close().await.unwrap();
    }

    let mut handle = pool.open_array(first, OpenOptions::read_only()).await.unwrap();
    handle
        .reopen(first, OpenOptions::read_only(), false)
        .await
        .unwrap();
    assert_eq!(handle.path(), first);

    handle
        .reopen(second, OpenOptions::read_only(), false)
        .await
        .unwrap();
    assert_eq!(handle.path(), second);
    assert!(handle
        .write_range(vec![0..1], vec![Scalar::from(1u64)])
        .await
        .is_err());

    handle.close().await.unwrap();
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn lock_coordinator_runs_through_workers() {
    let data = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let pool = OperatorPool::new(pool_options(2, &scratch)).await.unwrap();
    let lock_path = data.path().join("locks").join("resource");
    let lock_path = lock_path.to_str().unwrap();

    let options = LockOptions::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_confirm_delay(Duration::from_millis(20))
        .with_blocking(false);
    let first = pool.create_lock_coordinator(options);
    let second = pool.create_lock_coordinator(options);

    assert_eq!(
        first.acquire(lock_path).await.unwrap(),
        Acquisition::Acquired
    );
    assert_eq!(
        first.acquire(lock_path).await.unwrap(),
        Acquisition::AlreadyHeld
    );
    assert!(second.acquire(lock_path).await.is_err());
    assert!(second.check(lock_path).await.unwrap());
    assert_eq!(
        second.owner(lock_path).await.unwrap().as_deref(),
        Some(first.identity())
    );

    assert_eq!(second.release(lock_path).await.unwrap(), Release::NotHeld);
    assert_eq!(first.release(lock_path).await.unwrap(), Release::Released);
    assert!(!second.check(lock_path).await.unwrap());
    assert_eq!(
        second.acquire(lock_path).await.unwrap(),
        Acquisition::Acquired
    );
    second.release_all().await.unwrap();

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_invalidates_outstanding_operators() {
    let scratch = tempfile::tempdir().unwrap();
    let pool = OperatorPool::new(pool_options(1, &scratch)).await.unwrap();
    let operator = pool.get_operator();
    pool.shutdown().await.unwrap();

    let results = operator.exists(vec!["/tmp".to_string()]).await;
    assert!(matches!(results[0], Err(StorageError::Unavailable { .. })));
}
