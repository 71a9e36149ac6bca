//! Memory-mapped dense vector index (component A of the system overview).

mod mmap_index;

pub use mmap_index::MmapVectorIndex;
pub use crate::storage::traits::VectorIndex;
