//! Classification of resource identifiers into storage backends.
//!
//! The partition produced here drives the fan-out of every batch operation: each batch is split
//! into one group per backend, processed concurrently, and reassembled in input order.

use serde::{Deserialize, Serialize};

pub const OBJECT_STORAGE_SCHEME: &str = "s3://";
pub const HTTP_SCHEMES: [&str; 2] = ["http://", "https://"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Local,
    ObjectStorage,
    Http,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [
        BackendKind::Local,
        BackendKind::ObjectStorage,
        BackendKind::Http,
    ];
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::ObjectStorage => write!(f, "object-storage"),
            BackendKind::Http => write!(f, "http"),
        }
    }
}

/// Classifies a resource identifier by its prefix. Anything without a known scheme is local.
pub fn classify(id: &str) -> BackendKind {
    if id.starts_with(OBJECT_STORAGE_SCHEME) {
        BackendKind::ObjectStorage
    } else if HTTP_SCHEMES.iter().any(|scheme| id.starts_with(scheme)) {
        BackendKind::Http
    } else {
        BackendKind::Local
    }
}

/// Input indexes grouped per backend, each group in original order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendPartition {
    pub local: Vec<usize>,
    pub object_storage: Vec<usize>,
    pub http: Vec<usize>,
}

impl BackendPartition {
    pub fn new<S: AsRef<str>>(ids: &[S]) -> Self {
        Self::from_ids(ids.iter().map(|id| id.as_ref()))
    }

    pub fn from_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        let mut partition = BackendPartition::default();
        for (index, id) in ids.into_iter().enumerate() {
            match classify(id) {
                BackendKind::Local => partition.local.push(index),
                BackendKind::ObjectStorage => partition.object_storage.push(index),
                BackendKind::Http => partition.http.push(index),
            }
        }
        partition
    }

    pub fn group(&self, kind: BackendKind) -> &[usize] {
        match kind {
            BackendKind::Local => &self.local,
            BackendKind::ObjectStorage => &self.object_storage,
            BackendKind::Http => &self.http,
        }
    }

    /// Non-empty groups only.
    pub fn groups(&self) -> impl Iterator<Item = (BackendKind, &[usize])> + '_ {
        BackendKind::ALL
            .into_iter()
            .map(|kind| (kind, self.group(kind)))
            .filter(|(_, indexes)| !indexes.is_empty())
    }

    pub fn len(&self) -> usize {
        self.local.len() + self.object_storage.len() + self.http.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_prefix() {
        assert_eq!(classify("s3://bucket/key"), BackendKind::ObjectStorage);
        assert_eq!(classify("http://host/a"), BackendKind::Http);
        assert_eq!(classify("https://host/a"), BackendKind::Http);
        assert_eq!(classify("/data/array.zarr"), BackendKind::Local);
        assert_eq!(classify("relative/path"), BackendKind::Local);
        // no implicit rewriting of near misses
        assert_eq!(classify("S3://bucket/key"), BackendKind::Local);
        assert_eq!(classify("s3:/bucket"), BackendKind::Local);
        assert_eq!(classify(""), BackendKind::Local);
    }

    #[test]
    fn partition_reconstructs_input() {
        let ids = vec![
            "s3://b/one",
            "/tmp/two",
            "http://h/three",
            "four",
            "s3://b/five",
            "https://h/six",
            "/tmp/seven",
        ];
        let partition = BackendPartition::new(&ids);

        assert_eq!(partition.local, vec![1, 3, 6]);
        assert_eq!(partition.object_storage, vec![0, 4]);
        assert_eq!(partition.http, vec![2, 5]);

        let mut seen: Vec<usize> = partition
            .groups()
            .flat_map(|(kind, indexes)| {
                indexes.iter().for_each(|&i| assert_eq!(classify(ids[i]), kind));
                indexes.to_vec()
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..ids.len()).collect::<Vec<_>>());
        assert_eq!(partition.len(), ids.len());
    }

    #[test]
    fn empty_groups_are_skipped() {
        let partition = BackendPartition::new(&["a", "b"]);
        let groups: Vec<_> = partition.groups().collect();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, BackendKind::Local);
        assert!(BackendPartition::new::<&str>(&[]).is_empty());
    }
}
