//! Chunked, attribute-annotated arrays stored through a storage operator.
//!
//! The on-storage layout is zarr v2 without compression: a `.zarray` document, a `.zattrs`
//! attribute sidecar and one raw little-endian chunk object per block, named by its dot-joined
//! chunk indices. Groups carry a `.zgroup` document instead of `.zarray`.

pub mod chunked;
pub mod dtype;
pub mod error;
pub mod meta;
pub mod selection;

pub use chunked::{AccessMode, ChunkedArray, HandleInfo, NodeKind, OpenOptions};
pub use dtype::{ElementType, Scalar};
pub use error::{ArrayError, ArrayResult};
pub use meta::ArrayMetadata;
pub use selection::{BooleanMask, Selection};
