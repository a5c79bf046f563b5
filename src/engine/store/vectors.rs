// ── Zenfeed Store: Vector Matrix ───────────────────────────────────────────
// The dense embedding matrix of one block: a raw row-major float32 file,
// mmap'd read-write while the block is active. Row `id` starts at byte
// offset `id * dim * 4`; the file is always `capacity * dim * 4` bytes.
// Writing a row is a memory copy into the map; growth doubles capacity,
// extends the file and re-maps.

use crate::atoms::error::{EngineError, EngineResult};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::Path;

pub struct VectorFile {
    file: File,
    map: MmapMut,
    dim: usize,
    capacity: u64,
}

impl VectorFile {
    /// Open (creating if absent) with at least `capacity` rows. An existing
    /// file keeps its larger size if it already grew beyond `capacity`.
    pub fn open(path: &Path, dim: usize, capacity: u64) -> EngineResult<Self> {
        if dim == 0 {
            return Err(EngineError::internal("vector dimension must be > 0"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let row_bytes = (dim * 4) as u64;
        let existing_rows = file.metadata()?.len() / row_bytes;
        let capacity = capacity.max(existing_rows).max(1);
        file.set_len(capacity * row_bytes)?;

        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(VectorFile { file, map, dim, capacity })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Borrow row `id` as float32 components.
    ///
    /// Safety invariant: the map is page-aligned and every row offset is a
    /// multiple of 4, so the reinterpret cast is aligned; `id` is checked
    /// against capacity. Components are host little-endian, matching the
    /// on-disk contract.
    pub fn row(&self, id: u64) -> &[f32] {
        assert!(id < self.capacity, "row {} beyond capacity {}", id, self.capacity);
        let start = (id as usize) * self.dim * 4;
        unsafe {
            std::slice::from_raw_parts(self.map[start..].as_ptr() as *const f32, self.dim)
        }
    }

    /// Copy `vector` into row `id`, growing the matrix if `id` is the
    /// first row past the current capacity.
    pub fn write_row(&mut self, id: u64, vector: &[f32]) -> EngineResult<()> {
        if vector.len() != self.dim {
            return Err(EngineError::Internal(format!(
                "vector dimension mismatch: got {}, store is {}",
                vector.len(),
                self.dim
            )));
        }
        if id >= self.capacity {
            self.grow()?;
        }
        let start = (id as usize) * self.dim * 4;
        let bytes: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
        self.map[start..start + bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    /// Double the capacity: flush, extend the file, re-map.
    fn grow(&mut self) -> EngineResult<()> {
        let new_capacity = self.capacity * 2;
        self.map.flush()?;
        self.file.set_len(new_capacity * (self.dim * 4) as u64)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        log::debug!("[store] vector matrix grown to {} rows", new_capacity);
        self.capacity = new_capacity;
        Ok(())
    }

    pub fn flush(&self) -> EngineResult<()> {
        self.map.flush()?;
        Ok(())
    }
}

/// Dot product over two equal-length rows. Vectors are unit-normalized at
/// enrichment, so this is cosine similarity. Four-lane accumulation keeps
/// the loop trivially vectorizable.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = [0.0f32; 4];
    let chunks = a.len() / 4;
    for i in 0..chunks {
        let j = i * 4;
        acc[0] += a[j] * b[j];
        acc[1] += a[j + 1] * b[j + 1];
        acc[2] += a[j + 2] * b[j + 2];
        acc[3] += a[j + 3] * b[j + 3];
    }
    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for j in chunks * 4..a.len() {
        sum += a[j] * b[j];
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut vf = VectorFile::open(&dir.path().join("vectors.bin"), 4, 2).unwrap();
        vf.write_row(0, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        vf.write_row(1, &[-1.0, 0.5, 0.0, 9.0]).unwrap();
        assert_eq!(vf.row(0), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(vf.row(1), &[-1.0, 0.5, 0.0, 9.0]);
    }

    #[test]
    fn growth_preserves_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut vf = VectorFile::open(&dir.path().join("vectors.bin"), 3, 2).unwrap();
        vf.write_row(0, &[1.0, 1.0, 1.0]).unwrap();
        vf.write_row(1, &[2.0, 2.0, 2.0]).unwrap();
        // Row 2 is past capacity 2 — triggers doubling.
        vf.write_row(2, &[3.0, 3.0, 3.0]).unwrap();
        assert_eq!(vf.capacity(), 4);
        assert_eq!(vf.row(0), &[1.0, 1.0, 1.0]);
        assert_eq!(vf.row(1), &[2.0, 2.0, 2.0]);
        assert_eq!(vf.row(2), &[3.0, 3.0, 3.0]);
    }

    #[test]
    fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        {
            let mut vf = VectorFile::open(&path, 2, 4).unwrap();
            vf.write_row(0, &[0.25, -0.75]).unwrap();
            vf.flush().unwrap();
        }
        let vf = VectorFile::open(&path, 2, 4).unwrap();
        assert_eq!(vf.row(0), &[0.25, -0.75]);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut vf = VectorFile::open(&dir.path().join("vectors.bin"), 4, 2).unwrap();
        assert!(vf.write_row(0, &[1.0, 2.0]).is_err());
    }

    #[test]
    fn dot_product_matches_scalar_reference() {
        let a: Vec<f32> = (0..13).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..13).map(|i| (13 - i) as f32 * 0.25).collect();
        let reference: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        assert!((dot(&a, &b) - reference).abs() < 1e-4);
    }

    #[test]
    fn dot_of_zero_vector_is_zero() {
        let zero = vec![0.0f32; 8];
        let other = vec![0.7f32; 8];
        assert_eq!(dot(&zero, &other), 0.0);
    }
}
