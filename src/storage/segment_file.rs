//! Fixed-stride segment files.
//!
//! One file per segment size class. A file is a flat array of slots, each
//! `pages_per_segment * PAGE_SIZE` bytes; slot offsets are multiples of the
//! segment size, so a `SegmentId`'s `page_offset` addresses pages directly.
//! Growth happens with `set_len`, which extends the file with zeros — a
//! fresh slot therefore reads back as free.
//!
//! Reads and writes are positional (`pread`/`pwrite`), so concurrent
//! readers never contend on a shared cursor.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

use super::{PAGE_SIZE, SEGMENT_PAGE_COUNTS};

#[derive(Debug)]
pub struct SegmentFile {
    file: File,
    path: PathBuf,
    pages_per_segment: usize,
    // Number of allocated slots. Guards file growth; reads and writes to
    // already-allocated slots do not take this lock.
    allocated: Mutex<u64>,
}

impl SegmentFile {
    /// File name for a size class, `segment_0` through `segment_4`.
    pub fn file_name(size_class: usize) -> String {
        format!("segment_{size_class}")
    }

    /// Opens (creating if missing) the file for `size_class` in `dir`.
    pub fn open(dir: &Path, size_class: usize) -> Result<SegmentFile> {
        ensure!(
            size_class < SEGMENT_PAGE_COUNTS.len(),
            "invalid segment size class: {size_class}"
        );
        let pages_per_segment = SEGMENT_PAGE_COUNTS[size_class];
        let path = dir.join(Self::file_name(size_class));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open segment file {}", path.display()))?;

        let len = file.metadata()?.len();
        let stride = (pages_per_segment * PAGE_SIZE) as u64;
        ensure!(
            len % stride == 0,
            "segment file {} has length {} not a multiple of its {}-byte stride",
            path.display(),
            len,
            stride
        );

        Ok(SegmentFile {
            file,
            path,
            pages_per_segment,
            allocated: Mutex::new(len / stride),
        })
    }

    pub fn pages_per_segment(&self) -> usize {
        self.pages_per_segment
    }

    pub fn num_segments(&self) -> u64 {
        *self.allocated.lock()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocates a fresh slot at the end of the file and returns its page
    /// offset. The new slot reads back zeroed.
    pub fn allocate_segment(&self) -> Result<u64> {
        let mut allocated = self.allocated.lock();
        let slot = *allocated;
        *allocated += 1;
        let stride = (self.pages_per_segment * PAGE_SIZE) as u64;
        self.file
            .set_len(*allocated * stride)
            .wrap_err_with(|| format!("failed to grow {}", self.path.display()))?;
        Ok(slot * self.pages_per_segment as u64)
    }

    /// Reads `buf.len() / PAGE_SIZE` pages starting at `page_offset`.
    pub fn read_pages(&self, page_offset: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert!(buf.len() % PAGE_SIZE == 0);
        self.file
            .read_exact_at(buf, page_offset * PAGE_SIZE as u64)
            .wrap_err_with(|| {
                format!(
                    "failed to read {} pages at offset {} from {}",
                    buf.len() / PAGE_SIZE,
                    page_offset,
                    self.path.display()
                )
            })
    }

    /// Writes `buf.len() / PAGE_SIZE` pages starting at `page_offset`.
    pub fn write_pages(&self, page_offset: u64, buf: &[u8]) -> Result<()> {
        debug_assert!(buf.len() % PAGE_SIZE == 0);
        self.file
            .write_all_at(buf, page_offset * PAGE_SIZE as u64)
            .wrap_err_with(|| {
                format!(
                    "failed to write {} pages at offset {} to {}",
                    buf.len() / PAGE_SIZE,
                    page_offset,
                    self.path.display()
                )
            })
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .wrap_err_with(|| format!("failed to sync {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_round_trip_pages() {
        let dir = tempfile::tempdir().unwrap();
        let sf = SegmentFile::open(dir.path(), 1).unwrap();
        assert_eq!(sf.pages_per_segment(), 2);
        assert_eq!(sf.num_segments(), 0);

        let first = sf.allocate_segment().unwrap();
        let second = sf.allocate_segment().unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 2);
        assert_eq!(sf.num_segments(), 2);

        let data = vec![0xABu8; 2 * PAGE_SIZE];
        sf.write_pages(second, &data).unwrap();

        let mut out = vec![0u8; 2 * PAGE_SIZE];
        sf.read_pages(second, &mut out).unwrap();
        assert_eq!(out, data);

        // The untouched first slot reads back zeroed.
        sf.read_pages(first, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn reopen_recovers_slot_count() {
        let dir = tempfile::tempdir().unwrap();
        {
            let sf = SegmentFile::open(dir.path(), 0).unwrap();
            sf.allocate_segment().unwrap();
            sf.allocate_segment().unwrap();
            sf.allocate_segment().unwrap();
        }
        let sf = SegmentFile::open(dir.path(), 0).unwrap();
        assert_eq!(sf.num_segments(), 3);
        assert_eq!(sf.allocate_segment().unwrap(), 3);
    }

    #[test]
    fn rejects_invalid_size_class() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SegmentFile::open(dir.path(), 5).is_err());
    }
}
