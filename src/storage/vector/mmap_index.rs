//! Memory-mapped dense vector matrix.
//!
//! Persists a single matrix (id array + row-major f32 vectors, L2
//! normalized so cosine similarity reduces to a dot product) to one file.
//! Rebuilds write to a sibling temp file and `rename` it into place, so
//! concurrent readers see either the whole old file or the whole new one.

use memmap2::Mmap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::VectorIndex;
use crate::models::EngramId;
use crate::{Error, Result};

const MAGIC: &[u8; 4] = b"EVI1";
const HEADER_LEN: usize = 4 + 4 + 4; // magic + dims + count

struct Loaded {
    mmap: Mmap,
    dims: usize,
    ids: Vec<EngramId>,
}

impl Loaded {
    fn vectors_offset(&self) -> usize {
        HEADER_LEN + self.ids.len() * 8
    }

    fn row(&self, index: usize) -> &[u8] {
        let row_bytes = self.dims * 4;
        let start = self.vectors_offset() + index * row_bytes;
        &self.mmap[start..start + row_bytes]
    }

    fn dot(&self, index: usize, query: &[f32]) -> f32 {
        let row = self.row(index);
        row.chunks_exact(4)
            .zip(query.iter())
            .map(|(bytes, q)| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) * q)
            .sum()
    }
}

fn load(path: &Path) -> Option<Loaded> {
    let file = File::open(path).ok()?;
    // SAFETY: the file is exclusively owned by this process's data
    // directory and is only ever replaced via rename, never truncated
    // in place, so concurrent mutation of mapped pages cannot occur.
    let mmap = unsafe { Mmap::map(&file).ok()? };

    if mmap.len() < HEADER_LEN || &mmap[0..4] != MAGIC {
        return None;
    }
    let dims = u32::from_le_bytes(mmap[4..8].try_into().ok()?) as usize;
    let count = u32::from_le_bytes(mmap[8..12].try_into().ok()?) as usize;

    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let start = HEADER_LEN + i * 8;
        let raw = i64::from_le_bytes(mmap[start..start + 8].try_into().ok()?);
        ids.push(EngramId::new(raw));
    }

    let expected_len = HEADER_LEN + count * 8 + count * dims * 4;
    if mmap.len() != expected_len {
        return None;
    }

    Some(Loaded { mmap, dims, ids })
}

/// Memory-mapped implementation of [`VectorIndex`], backed by a single
/// file under the engram home directory.
pub struct MmapVectorIndex {
    path: PathBuf,
    dims: usize,
    state: RwLock<Option<Loaded>>,
}

impl MmapVectorIndex {
    /// Opens (or prepares to create) the index file at `path`, fixing the
    /// expected vector dimensionality to `dims`.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>, dims: usize) -> Self {
        let path = path.into();
        let state = RwLock::new(load(&path));
        Self { path, dims, state }
    }
}

impl VectorIndex for MmapVectorIndex {
    fn dimensions(&self) -> usize {
        self.dims
    }

    fn len(&self) -> usize {
        self.state.read().map(|s| s.as_ref().map_or(0, |l| l.ids.len())).unwrap_or(0)
    }

    fn build(&self, items: &[(EngramId, Vec<f32>)]) -> Result<()> {
        let dims = self.dims;
        let filtered: Vec<&(EngramId, Vec<f32>)> =
            items.iter().filter(|(_, v)| v.len() == dims).collect();

        let tmp_path = self.path.with_extension(format!("tmp.{}", std::process::id()));
        {
            let mut file =
                File::create(&tmp_path).map_err(|e| Error::OperationFailed {
                    operation: "vector_index_build".to_string(),
                    cause: e.to_string(),
                })?;

            file.write_all(MAGIC).map_err(io_err)?;
            file.write_all(&(dims as u32).to_le_bytes()).map_err(io_err)?;
            file.write_all(&(filtered.len() as u32).to_le_bytes()).map_err(io_err)?;

            for (id, _) in &filtered {
                file.write_all(&id.as_i64().to_le_bytes()).map_err(io_err)?;
            }

            for (_, vector) in &filtered {
                let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
                for component in vector {
                    let normalized = if norm > 0.0 { component / norm } else { 0.0 };
                    file.write_all(&normalized.to_le_bytes()).map_err(io_err)?;
                }
            }
            file.flush().map_err(io_err)?;
        }

        std::fs::rename(&tmp_path, &self.path).map_err(io_err)?;

        let reloaded = load(&self.path);
        let mut guard = self.state.write().map_err(|_| Error::OperationFailed {
            operation: "vector_index_build".to_string(),
            cause: "index lock poisoned".to_string(),
        })?;
        *guard = reloaded;
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(EngramId, f32)>> {
        let guard = self.state.read().map_err(|_| Error::OperationFailed {
            operation: "vector_index_search".to_string(),
            cause: "index lock poisoned".to_string(),
        })?;

        let Some(loaded) = guard.as_ref() else {
            return Ok(Vec::new());
        };

        if query.len() != loaded.dims {
            return Ok(Vec::new());
        }

        let norm = query.iter().map(|x| x * x).sum::<f32>().sqrt();
        let normalized_query: Vec<f32> =
            if norm > 0.0 { query.iter().map(|x| x / norm).collect() } else { query.to_vec() };

        let mut scored: Vec<(EngramId, f32)> = (0..loaded.ids.len())
            .map(|i| (loaded.ids[i], loaded.dot(i, &normalized_query)))
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        Ok(scored)
    }
}

fn io_err(e: std::io::Error) -> Error {
    Error::OperationFailed { operation: "vector_index_io".to_string(), cause: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_index_search_returns_empty() {
        let dir = TempDir::new().unwrap();
        let index = MmapVectorIndex::open(dir.path().join("vectors.bin"), 3);
        assert!(index.search(&[1.0, 0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn build_then_search_finds_nearest() {
        let dir = TempDir::new().unwrap();
        let index = MmapVectorIndex::open(dir.path().join("vectors.bin"), 2);
        index
            .build(&[
                (EngramId::new(1), vec![1.0, 0.0]),
                (EngramId::new(2), vec![0.0, 1.0]),
                (EngramId::new(3), vec![0.7, 0.7]),
            ])
            .unwrap();

        let results = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(results[0].0, EngramId::new(1));
        assert!(results[0].1 > results[1].1);
    }

    #[test]
    fn dimension_mismatch_returns_empty() {
        let dir = TempDir::new().unwrap();
        let index = MmapVectorIndex::open(dir.path().join("vectors.bin"), 2);
        index.build(&[(EngramId::new(1), vec![1.0, 0.0])]).unwrap();
        assert!(index.search(&[1.0, 0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn rebuild_replaces_prior_contents_atomically() {
        let dir = TempDir::new().unwrap();
        let index = MmapVectorIndex::open(dir.path().join("vectors.bin"), 1);
        index.build(&[(EngramId::new(1), vec![1.0])]).unwrap();
        assert_eq!(index.len(), 1);
        index.build(&[(EngramId::new(2), vec![1.0]), (EngramId::new(3), vec![1.0])]).unwrap();
        assert_eq!(index.len(), 2);
    }
}
