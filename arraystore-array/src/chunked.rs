use std::sync::Arc;

use arraystore_lock::{LockOptions, SpinLock};
use arraystore_storage::{join_path, Attributes, Content, ReadMode, StorageOperations};
use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    dtype::{ElementType, Scalar},
    error::{ArrayError, ArrayResult},
    meta::{chunk_key, parse_chunk_key, ArrayMetadata, GroupMetadata, ARRAY_KEY, GROUP_KEY},
    selection::Selection,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    ReadWriteCreate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Array(ArrayMetadata),
    Group,
}

/// How to open (and possibly create) an array or group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOptions {
    pub mode: AccessMode,
    pub group: bool,
    /// Only used when a new array is created.
    pub shape: Option<Vec<u64>>,
    pub chunks: Option<Vec<u64>>,
    pub dtype: ElementType,
    pub fill_value: Option<Scalar>,
    /// Lock path held while writing, resizing or updating attributes.
    pub synchronizer_path: Option<String>,
    pub lock_options: Option<LockOptions>,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            mode: AccessMode::ReadOnly,
            group: false,
            shape: None,
            chunks: None,
            dtype: ElementType::F64,
            fill_value: None,
            synchronizer_path: None,
            lock_options: None,
        }
    }

    /// Opens an existing array for writing, or creates it with the given geometry.
    pub fn create(shape: Vec<u64>, chunks: Vec<u64>, dtype: ElementType) -> Self {
        Self {
            mode: AccessMode::ReadWriteCreate,
            shape: Some(shape),
            chunks: Some(chunks),
            dtype,
            ..Self::read_only()
        }
    }

    pub fn group(mode: AccessMode) -> Self {
        Self {
            mode,
            group: true,
            ..Self::read_only()
        }
    }

    pub fn with_mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_fill_value(mut self, fill_value: impl Into<Scalar>) -> Self {
        self.fill_value = Some(fill_value.into());
        self
    }

    pub fn with_synchronizer(
        mut self,
        path: impl Into<String>,
        lock_options: Option<LockOptions>,
    ) -> Self {
        self.synchronizer_path = Some(path.into());
        self.lock_options = lock_options;
        self
    }
}

/// Snapshot of a handle's identity and geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleInfo {
    pub path: String,
    pub mode: AccessMode,
    pub synchronizer_path: Option<String>,
    pub node: NodeKind,
}

impl HandleInfo {
    pub fn metadata(&self) -> Option<&ArrayMetadata> {
        match &self.node {
            NodeKind::Array(meta) => Some(meta),
            NodeKind::Group => None,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.node, NodeKind::Group)
    }

    pub fn shape(&self) -> Option<&[u64]> {
        self.metadata().map(|m| m.shape.as_slice())
    }

    pub fn chunks(&self) -> Option<&[u64]> {
        self.metadata().map(|m| m.chunks.as_slice())
    }

    pub fn dtype(&self) -> Option<ElementType> {
        self.metadata().map(|m| m.dtype)
    }

    pub fn fill_value(&self) -> Option<Scalar> {
        self.metadata().map(|m| m.fill())
    }
}

#[derive(Debug)]
struct Synchronizer {
    path: String,
    lock: SpinLock,
    // Serializes mutations issued through this handle; the spin lock alone treats a second
    // acquire from the same coordinator as already held.
    local: tokio::sync::Mutex<()>,
}

/// An open array or group.
#[derive(Debug)]
pub struct ChunkedArray {
    operator: Arc<dyn StorageOperations>,
    path: String,
    mode: AccessMode,
    synchronizer: Option<Synchronizer>,
    node: NodeKind,
}

/// Points grouped by the chunk holding them: chunk path -> (output slot, offset in chunk).
type ChunkPlan = IndexMap<String, Vec<(usize, usize)>>;

impl ChunkedArray {
    pub async fn open(
        operator: Arc<dyn StorageOperations>,
        path: &str,
        options: OpenOptions,
    ) -> ArrayResult<Self> {
        let path = path.trim_end_matches('/').to_string();
        let node = if options.group {
            open_group(operator.as_ref(), &path, options.mode).await?
        } else {
            open_array(operator.as_ref(), &path, &options).await?
        };

        let synchronizer = options.synchronizer_path.map(|sync_path| Synchronizer {
            lock: SpinLock::new(operator.clone(), options.lock_options.unwrap_or_default()),
            path: sync_path,
            local: tokio::sync::Mutex::new(()),
        });

        tracing::debug!(
            path = %path,
            mode = ?options.mode,
            group = options.group,
            "opened chunked array"
        );
        Ok(Self {
            operator,
            path,
            mode: options.mode,
            synchronizer,
            node,
        })
    }

    /// Re-reads the stored metadata, picking up changes made through other handles.
    pub async fn reload(&mut self) -> ArrayResult<()> {
        let options = OpenOptions {
            group: matches!(self.node, NodeKind::Group),
            ..OpenOptions::read_only()
        };
        self.node = if options.group {
            open_group(self.operator.as_ref(), &self.path, AccessMode::ReadOnly).await?
        } else {
            open_array(self.operator.as_ref(), &self.path, &options).await?
        };
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn operator(&self) -> &Arc<dyn StorageOperations> {
        &self.operator
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn node(&self) -> &NodeKind {
        &self.node
    }

    pub fn info(&self) -> HandleInfo {
        HandleInfo {
            path: self.path.clone(),
            mode: self.mode,
            synchronizer_path: self.synchronizer.as_ref().map(|s| s.path.clone()),
            node: self.node.clone(),
        }
    }

    pub fn metadata(&self) -> ArrayResult<&ArrayMetadata> {
        match &self.node {
            NodeKind::Array(meta) => Ok(meta),
            NodeKind::Group => Err(ArrayError::NotAnArray {
                path: self.path.clone(),
            }),
        }
    }

    /// Reads the selected elements in selection order. Elements of absent chunks read as the
    /// fill value.
    pub async fn get(&self, selection: &Selection) -> ArrayResult<Vec<Scalar>> {
        let meta = self.metadata()?;
        let points = selection.resolve(&meta.shape)?;
        let plan = self.plan(meta, &points);
        let chunks = self.read_chunks(meta, plan.keys().cloned().collect()).await?;

        let size = meta.dtype.item_size();
        let mut values = vec![meta.fill(); points.len()];
        for (slots, chunk) in plan.values().zip(chunks) {
            let Some(chunk) = chunk else { continue };
            for &(slot, offset) in slots {
                values[slot] = meta.dtype.decode(&chunk[offset * size..(offset + 1) * size]);
            }
        }
        Ok(values)
    }

    /// Writes `values` to the selected elements, one value per selected point.
    pub async fn set(&self, selection: &Selection, values: Vec<Scalar>) -> ArrayResult<()> {
        self.ensure_writable()?;
        let meta = self.metadata()?;
        let points = selection.resolve(&meta.shape)?;
        if points.len() != values.len() {
            return Err(ArrayError::ValueCountMismatch {
                expected: points.len(),
                actual: values.len(),
            });
        }

        let size = meta.dtype.item_size();
        let mut encoded = Vec::with_capacity(values.len() * size);
        for value in values {
            meta.dtype.encode(value, &mut encoded)?;
        }

        let _guard = self.begin_mutation().await?;
        let result = self.write_points(meta, &points, &encoded).await;
        self.end_mutation().await?;
        result
    }

    /// Changes the shape. Chunks entirely outside the new shape are deleted and the cut-off part
    /// of edge chunks is reset to the fill value, so growing again exposes fill values only.
    pub async fn resize(&mut self, shape: Vec<u64>) -> ArrayResult<()> {
        self.ensure_writable()?;
        let meta = self.metadata()?.clone();
        if shape.len() != meta.ndim() {
            return Err(ArrayError::DimensionMismatch {
                expected: meta.ndim(),
                actual: shape.len(),
            });
        }

        let result = {
            let _guard = self.begin_mutation().await?;
            let result = self.apply_resize(&meta, &shape).await;
            self.end_mutation().await?;
            result
        };
        let resized = result?;
        tracing::debug!(
            path = %self.path,
            from = ?meta.shape,
            to = ?resized.shape,
            "resized array"
        );
        self.node = NodeKind::Array(resized);
        Ok(())
    }

    /// The attribute sidecar, empty when none was written.
    pub async fn attributes(&self) -> ArrayResult<Attributes> {
        match self.operator.get_metadata(&self.path).await {
            Ok(attributes) => Ok(attributes),
            Err(e) if e.is_not_found() => Ok(Attributes::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_attribute(&self, name: &str) -> ArrayResult<Option<serde_json::Value>> {
        Ok(self.attributes().await?.remove(name))
    }

    /// Merges `attributes` into the stored ones, replacing keys that already exist.
    pub async fn set_attributes(&self, attributes: Attributes) -> ArrayResult<()> {
        self.ensure_writable()?;
        let _guard = self.begin_mutation().await?;
        let result: ArrayResult<()> = async {
            let mut merged = self.attributes().await?;
            merged.extend(attributes);
            self.operator.set_metadata(&self.path, merged).await?;
            Ok(())
        }
        .await;
        self.end_mutation().await?;
        result
    }

    fn ensure_writable(&self) -> ArrayResult<()> {
        match self.mode {
            AccessMode::ReadOnly => Err(ArrayError::ReadOnly {
                path: self.path.clone(),
            }),
            AccessMode::ReadWriteCreate => Ok(()),
        }
    }

    async fn begin_mutation(&self) -> ArrayResult<Option<tokio::sync::MutexGuard<'_, ()>>> {
        let Some(sync) = &self.synchronizer else {
            return Ok(None);
        };
        let guard = sync.local.lock().await;
        sync.lock.acquire(&sync.path).await?;
        Ok(Some(guard))
    }

    async fn end_mutation(&self) -> ArrayResult<()> {
        if let Some(sync) = &self.synchronizer {
            sync.lock.release(&sync.path).await?;
        }
        Ok(())
    }

    fn chunk_path(&self, index: &[u64]) -> String {
        join_path(&self.path, &chunk_key(index))
    }

    fn plan(&self, meta: &ArrayMetadata, points: &[Vec<u64>]) -> ChunkPlan {
        let mut plan = ChunkPlan::new();
        for (slot, point) in points.iter().enumerate() {
            let (index, offset) = meta.locate(point);
            plan.entry(self.chunk_path(&index))
                .or_default()
                .push((slot, offset));
        }
        plan
    }

    /// Reads chunk objects in one batch; `None` marks chunks that were never written.
    async fn read_chunks(
        &self,
        meta: &ArrayMetadata,
        paths: Vec<String>,
    ) -> ArrayResult<Vec<Option<Bytes>>> {
        let expected = meta.chunk_bytes();
        let results = self.operator.read(paths.clone(), ReadMode::Binary).await;
        paths
            .into_iter()
            .zip(results)
            .map(|(path, result)| match result {
                Ok(content) => {
                    let bytes = content.into_bytes();
                    if bytes.len() != expected {
                        return Err(ArrayError::invalid_metadata(
                            path,
                            format!("chunk holds {} bytes, expected {expected}", bytes.len()),
                        ));
                    }
                    Ok(Some(bytes))
                }
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e.into()),
            })
            .collect()
    }

    async fn write_chunks(&self, chunks: IndexMap<String, Content>) -> ArrayResult<()> {
        for result in self.operator.write(chunks).await {
            result?;
        }
        Ok(())
    }

    async fn write_points(
        &self,
        meta: &ArrayMetadata,
        points: &[Vec<u64>],
        encoded: &[u8],
    ) -> ArrayResult<()> {
        let size = meta.dtype.item_size();
        let plan = self.plan(meta, points);
        let existing = self.read_chunks(meta, plan.keys().cloned().collect()).await?;

        let mut updated = IndexMap::with_capacity(plan.len());
        for ((path, slots), chunk) in plan.into_iter().zip(existing) {
            let mut buffer = match chunk {
                Some(bytes) => bytes.to_vec(),
                None => meta.fill_chunk()?,
            };
            for (slot, offset) in slots {
                buffer[offset * size..(offset + 1) * size]
                    .copy_from_slice(&encoded[slot * size..(slot + 1) * size]);
            }
            updated.insert(path, Content::Binary(buffer.into()));
        }
        self.write_chunks(updated).await
    }

    async fn apply_resize(
        &self,
        meta: &ArrayMetadata,
        shape: &[u64],
    ) -> ArrayResult<ArrayMetadata> {
        if shape.iter().zip(&meta.shape).any(|(new, old)| new < old) {
            self.discard_outside(meta, shape).await?;
        }

        let mut resized = meta.clone();
        resized.shape = shape.to_vec();
        let document = resized.to_json(&self.path)?;
        self.operator
            .write_one(&join_path(&self.path, ARRAY_KEY), Content::Binary(document.into()))
            .await?;
        Ok(resized)
    }

    async fn discard_outside(&self, meta: &ArrayMetadata, shape: &[u64]) -> ArrayResult<()> {
        let names = match self.operator.list_dir(&self.path).await {
            Ok(names) => names,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let grid = meta.grid_for(shape);
        let mut doomed = Vec::new();
        let mut edges = Vec::new();
        for index in names.iter().filter_map(|name| parse_chunk_key(name, meta.ndim())) {
            if index.iter().zip(&grid).any(|(i, g)| i >= g) {
                doomed.push(self.chunk_path(&index));
            } else if index
                .iter()
                .zip(&meta.chunks)
                .zip(shape)
                .any(|((i, c), len)| (i + 1) * c > *len)
            {
                edges.push(index);
            }
        }

        for result in self.operator.remove(doomed, false).await {
            match result {
                Err(e) if !e.is_not_found() => return Err(e.into()),
                _ => {}
            }
        }

        let paths: Vec<String> = edges.iter().map(|index| self.chunk_path(index)).collect();
        let existing = self.read_chunks(meta, paths.clone()).await?;
        let mut fill = Vec::with_capacity(meta.dtype.item_size());
        meta.dtype.encode(meta.fill(), &mut fill)?;

        let mut cleared = IndexMap::new();
        for ((path, index), chunk) in paths.into_iter().zip(&edges).zip(existing) {
            let Some(chunk) = chunk else { continue };
            let mut buffer = chunk.to_vec();
            clear_outside(meta, index, shape, &fill, &mut buffer);
            cleared.insert(path, Content::Binary(buffer.into()));
        }
        self.write_chunks(cleared).await
    }
}

/// Resets every element of chunk `index` lying outside `shape` to `fill`.
fn clear_outside(
    meta: &ArrayMetadata,
    index: &[u64],
    shape: &[u64],
    fill: &[u8],
    buffer: &mut [u8],
) {
    let size = fill.len();
    for offset in 0..meta.chunk_len() {
        let mut rest = offset as u64;
        let mut outside = false;
        for dim in (0..meta.ndim()).rev() {
            let local = rest % meta.chunks[dim];
            rest /= meta.chunks[dim];
            if index[dim] * meta.chunks[dim] + local >= shape[dim] {
                outside = true;
            }
        }
        if outside {
            buffer[offset * size..(offset + 1) * size].copy_from_slice(fill);
        }
    }
}

async fn open_array(
    operator: &dyn StorageOperations,
    path: &str,
    options: &OpenOptions,
) -> ArrayResult<NodeKind> {
    let key = join_path(path, ARRAY_KEY);
    match operator.read_one(&key, ReadMode::Binary).await {
        Ok(content) => {
            let meta = ArrayMetadata::from_json(path, content.as_bytes())?;
            return Ok(NodeKind::Array(meta));
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    if operator.exists_one(&join_path(path, GROUP_KEY)).await? {
        return Err(ArrayError::NotAnArray {
            path: path.to_string(),
        });
    }

    match (options.mode, &options.shape, &options.chunks) {
        (AccessMode::ReadOnly, _, _) => Err(ArrayError::NotFound {
            path: path.to_string(),
        }),
        (AccessMode::ReadWriteCreate, Some(shape), Some(chunks)) => {
            let meta = ArrayMetadata::new(
                path,
                shape.clone(),
                chunks.clone(),
                options.dtype,
                options.fill_value,
            )?;
            let document = meta.to_json(path)?;
            operator
                .write_one(&key, Content::Binary(document.into()))
                .await?;
            tracing::debug!(
                path = %path,
                shape = ?meta.shape,
                chunks = ?meta.chunks,
                "created array"
            );
            Ok(NodeKind::Array(meta))
        }
        (AccessMode::ReadWriteCreate, _, _) => Err(ArrayError::MissingShape {
            path: path.to_string(),
        }),
    }
}

async fn open_group(
    operator: &dyn StorageOperations,
    path: &str,
    mode: AccessMode,
) -> ArrayResult<NodeKind> {
    let markers = operator
        .exists(vec![join_path(path, GROUP_KEY), join_path(path, ARRAY_KEY)])
        .await;
    let mut markers = markers.into_iter();
    let is_group = markers.next().transpose()?.unwrap_or(false);
    let is_array = markers.next().transpose()?.unwrap_or(false);

    if is_group {
        return Ok(NodeKind::Group);
    }
    if is_array {
        return Err(ArrayError::NotAGroup {
            path: path.to_string(),
        });
    }
    if mode == AccessMode::ReadOnly {
        return Err(ArrayError::NotFound {
            path: path.to_string(),
        });
    }

    let document = serde_json::to_vec(&GroupMetadata::default())
        .map_err(|e| ArrayError::invalid_metadata(path, e.to_string()))?;
    for result in operator.make_dirs(vec![path.to_string()]).await {
        result?;
    }
    operator
        .write_one(&join_path(path, GROUP_KEY), Content::Binary(document.into()))
        .await?;
    tracing::debug!(path = %path, "created group");
    Ok(NodeKind::Group)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use arraystore_storage::{StorageOperator, StorageOptions};

    fn operator(root: &tempfile::TempDir) -> Arc<dyn StorageOperations> {
        let operator = StorageOperator::new(
            StorageOptions::default().with_scratch_root(root.path().join("scratch")),
        )
        .unwrap();
        operator.register_object_store(
            "bucket",
            Arc::new(object_store::memory::InMemory::new()),
        );
        Arc::new(operator)
    }

    fn array_path(root: &tempfile::TempDir, name: &str) -> String {
        root.path().join(name).to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn resize_keeps_data_and_fills_new_region() {
        let root = tempfile::tempdir().unwrap();
        let path = array_path(&root, "grid");
        let mut array = ChunkedArray::open(
            operator(&root),
            &path,
            OpenOptions::create(vec![10, 10], vec![5, 5], ElementType::F64).with_fill_value(-1.0),
        )
        .await
        .unwrap();

        array
            .set(
                &Selection::points(vec![vec![0, 0], vec![9, 9]]),
                vec![Scalar::Float(1.0), Scalar::Float(2.0)],
            )
            .await
            .unwrap();

        array.resize(vec![20, 20]).await.unwrap();
        assert_eq!(array.info().shape(), Some([20u64, 20].as_slice()));

        let values = array
            .get(&Selection::points(vec![vec![0, 0], vec![9, 9], vec![10, 10]]))
            .await
            .unwrap();
        assert_eq!(
            values,
            vec![Scalar::Float(1.0), Scalar::Float(2.0), Scalar::Float(-1.0)]
        );
    }

    #[tokio::test]
    async fn shrinking_discards_cut_off_elements() {
        let root = tempfile::tempdir().unwrap();
        let operator = operator(&root);
        let path = array_path(&root, "shrink");
        let mut array = ChunkedArray::open(
            operator.clone(),
            &path,
            OpenOptions::create(vec![10, 10], vec![5, 5], ElementType::I32),
        )
        .await
        .unwrap();

        let all = Selection::range(vec![0..10, 0..10]);
        array
            .set(&all, (0..100).map(Scalar::Int).collect())
            .await
            .unwrap();
        assert!(operator.exists_one(&join_path(&path, "1.1")).await.unwrap());

        array.resize(vec![4, 4]).await.unwrap();
        assert!(!operator.exists_one(&join_path(&path, "1.1")).await.unwrap());
        assert!(!operator.exists_one(&join_path(&path, "0.1")).await.unwrap());

        array.resize(vec![10, 10]).await.unwrap();
        let values = array.get(&all).await.unwrap();
        for (i, value) in values.into_iter().enumerate() {
            let (row, col) = (i / 10, i % 10);
            let expected = if row < 4 && col < 4 { i as i64 } else { 0 };
            assert_eq!(value, Scalar::Int(expected), "at ({row}, {col})");
        }
    }

    #[tokio::test]
    async fn chunk_objects_use_zarr_layout() {
        let root = tempfile::tempdir().unwrap();
        let operator = operator(&root);
        for path in [array_path(&root, "layout"), "s3://bucket/layout".to_string()] {
            let array = ChunkedArray::open(
                operator.clone(),
                &path,
                OpenOptions::create(vec![4, 3], vec![2, 2], ElementType::U16),
            )
            .await
            .unwrap();
            array
                .set(&Selection::points(vec![vec![3, 2]]), vec![Scalar::UInt(0x0102)])
                .await
                .unwrap();

            let chunk = operator
                .read_one(&join_path(&path, "1.1"), ReadMode::Binary)
                .await
                .unwrap();
            // Element (1, 0) of a 2x2 chunk, little endian.
            assert_eq!(chunk.as_bytes(), &[0, 0, 0, 0, 2, 1, 0, 0]);

            let absent = array
                .get(&Selection::range(vec![0..2, 0..2]))
                .await
                .unwrap();
            assert_eq!(absent, vec![Scalar::UInt(0); 4]);
            assert!(!operator.exists_one(&join_path(&path, "0.0")).await.unwrap());

            let document = operator
                .read_one(&join_path(&path, ARRAY_KEY), ReadMode::Text)
                .await
                .unwrap();
            let document: serde_json::Value =
                serde_json::from_str(document.as_text().unwrap()).unwrap();
            assert_eq!(document["dtype"], "<u2");
            assert_eq!(document["order"], "C");
        }
    }

    #[tokio::test]
    async fn masks_and_ranges_share_storage() {
        let root = tempfile::tempdir().unwrap();
        let array = ChunkedArray::open(
            operator(&root),
            &array_path(&root, "mask"),
            OpenOptions::create(vec![3, 3], vec![2, 2], ElementType::Bool),
        )
        .await
        .unwrap();

        let diagonal = Selection::mask(
            vec![3, 3],
            vec![true, false, false, false, true, false, false, false, true],
        );
        array
            .set(&diagonal, vec![Scalar::Bool(true); 3])
            .await
            .unwrap();
        let row = array.get(&Selection::range(vec![1..2, 0..3])).await.unwrap();
        assert_eq!(
            row,
            vec![Scalar::Bool(false), Scalar::Bool(true), Scalar::Bool(false)]
        );

        assert!(matches!(
            array.set(&diagonal, vec![Scalar::Bool(true)]).await,
            Err(ArrayError::ValueCountMismatch { expected: 3, actual: 1 })
        ));
        assert!(matches!(
            array.set(&diagonal, vec![Scalar::Int(1); 3]).await,
            Err(ArrayError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn open_contract() {
        let root = tempfile::tempdir().unwrap();
        let operator = operator(&root);
        let path = array_path(&root, "contract");

        assert!(matches!(
            ChunkedArray::open(operator.clone(), &path, OpenOptions::read_only()).await,
            Err(ArrayError::NotFound { .. })
        ));
        assert!(matches!(
            ChunkedArray::open(
                operator.clone(),
                &path,
                OpenOptions::read_only().with_mode(AccessMode::ReadWriteCreate)
            )
            .await,
            Err(ArrayError::MissingShape { .. })
        ));

        ChunkedArray::open(
            operator.clone(),
            &path,
            OpenOptions::create(vec![8], vec![4], ElementType::I64),
        )
        .await
        .unwrap();

        // An existing array keeps its geometry.
        let reopened = ChunkedArray::open(
            operator.clone(),
            &path,
            OpenOptions::create(vec![100], vec![10], ElementType::F32),
        )
        .await
        .unwrap();
        assert_eq!(reopened.info().shape(), Some([8u64].as_slice()));
        assert_eq!(reopened.info().dtype(), Some(ElementType::I64));

        let read_only = ChunkedArray::open(operator.clone(), &path, OpenOptions::read_only())
            .await
            .unwrap();
        assert!(matches!(
            read_only
                .set(&Selection::points(vec![vec![0]]), vec![Scalar::Int(1)])
                .await,
            Err(ArrayError::ReadOnly { .. })
        ));

        assert!(matches!(
            ChunkedArray::open(
                operator.clone(),
                &path,
                OpenOptions::group(AccessMode::ReadWriteCreate)
            )
            .await,
            Err(ArrayError::NotAGroup { .. })
        ));
    }

    #[tokio::test]
    async fn groups_carry_attributes() {
        let root = tempfile::tempdir().unwrap();
        let operator = operator(&root);
        let path = array_path(&root, "group");

        let group = ChunkedArray::open(
            operator.clone(),
            &path,
            OpenOptions::group(AccessMode::ReadWriteCreate),
        )
        .await
        .unwrap();
        assert!(group.info().is_group());
        assert!(matches!(
            group.get(&Selection::points(vec![])).await,
            Err(ArrayError::NotAnArray { .. })
        ));
        assert!(group.attributes().await.unwrap().is_empty());

        let mut first = Attributes::new();
        first.insert("title".to_string(), serde_json::json!("survey"));
        first.insert("version".to_string(), serde_json::json!(1));
        group.set_attributes(first).await.unwrap();

        let mut second = Attributes::new();
        second.insert("version".to_string(), serde_json::json!(2));
        group.set_attributes(second).await.unwrap();

        let attributes = group.attributes().await.unwrap();
        assert_eq!(attributes["title"], "survey");
        assert_eq!(attributes["version"], 2);
        assert_eq!(group.get_attribute("missing").await.unwrap(), None);

        assert!(matches!(
            ChunkedArray::open(operator.clone(), &path, OpenOptions::read_only()).await,
            Err(ArrayError::NotAnArray { .. })
        ));
        ChunkedArray::open(operator, &path, OpenOptions::group(AccessMode::ReadOnly))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reload_sees_resize_from_other_handle() {
        let root = tempfile::tempdir().unwrap();
        let operator = operator(&root);
        let path = array_path(&root, "shared");
        let mut writer = ChunkedArray::open(
            operator.clone(),
            &path,
            OpenOptions::create(vec![2], vec![2], ElementType::U8),
        )
        .await
        .unwrap();
        let mut reader = ChunkedArray::open(operator, &path, OpenOptions::read_only())
            .await
            .unwrap();

        writer.resize(vec![6]).await.unwrap();
        assert_eq!(reader.info().shape(), Some([2u64].as_slice()));
        reader.reload().await.unwrap();
        assert_eq!(reader.info().shape(), Some([6u64].as_slice()));
    }

    #[tokio::test]
    async fn synchronized_mutations_release_their_lock() {
        let root = tempfile::tempdir().unwrap();
        let operator = operator(&root);
        let sync_path = array_path(&root, "sync/array");
        let lock_options = LockOptions::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_confirm_delay(Duration::from_millis(5));

        let array = Arc::new(
            ChunkedArray::open(
                operator.clone(),
                &array_path(&root, "synced"),
                OpenOptions::create(vec![4], vec![2], ElementType::I16)
                    .with_synchronizer(&sync_path, Some(lock_options)),
            )
            .await
            .unwrap(),
        );
        assert_eq!(
            array.info().synchronizer_path.as_deref(),
            Some(sync_path.as_str())
        );

        let writers: Vec<_> = (0..4u64)
            .map(|i| {
                let array = array.clone();
                tokio::spawn(async move {
                    array
                        .set(&Selection::points(vec![vec![i]]), vec![Scalar::Int(i as i64 + 10)])
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let values = array.get(&Selection::range(vec![0..4])).await.unwrap();
        assert_eq!(values, (10..14).map(Scalar::Int).collect::<Vec<_>>());
        assert!(!operator
            .exists_one(&join_path(&format!("{sync_path}/"), ".zattrs"))
            .await
            .unwrap());
    }
}
