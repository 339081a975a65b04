//! Low-level record files: append-only logs and random-access binaries.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use memmap2::MmapMut;

/// Marker appended to a log whose last line was torn by a crash. Readers
/// skip any line containing `\x18`.
pub const CORRUPTION_MARKER: &[u8] = b"\x18\r####\x18\n";

// ---------------------------------------------------------------------------
// Append-only logs
// ---------------------------------------------------------------------------

/// An append-only, line-terminated UTF-8 log file.
pub struct ArchiveLogFile {
    file: File,
}

impl ArchiveLogFile {
    /// Open (or create) the log. If the existing file does not end with a
    /// newline, the corruption marker is appended so readers can discard
    /// the torn line.
    pub fn open(path: &Path) -> std::io::Result<ArchiveLogFile> {
        let mut file = OpenOptions::new()
            .append(true)
            .read(true)
            .create(true)
            .open(path)?;
        let len = file.seek(SeekFrom::End(0))?;
        if len > 0 {
            file.seek(SeekFrom::End(-1))?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                file.write_all(CORRUPTION_MARKER)?;
            }
        }
        Ok(ArchiveLogFile { file })
    }

    /// Append one line (the newline is added here).
    pub fn append(&mut self, line: &str) -> std::io::Result<()> {
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")
    }

    /// Append raw bytes that carry their own framing (BCP rows).
    pub fn append_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes)
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }
}

// ---------------------------------------------------------------------------
// Random-access binary files
// ---------------------------------------------------------------------------

/// Window alignment. Generous so the mapping offset satisfies any
/// real page size.
const PAGE: u64 = 65536;

/// A random-access binary file written through a sliding memory-mapped
/// window.
///
/// The file on disk may be temporarily longer than the data written (the
/// window is page-granular); the true logical size is tracked separately
/// and applied by truncation on flush.
pub struct ArchiveBinaryFile {
    file: File,
    /// Physical size on disk.
    current_size: u64,
    /// Logical size: the highest byte ever written (or truncated to).
    real_size: u64,
    window_size: u64,
    map_start: u64,
    map_end: u64,
    map: Option<MmapMut>,
}

impl ArchiveBinaryFile {
    /// Open R/W, creating if missing, never truncating.
    pub fn open(path: &Path, window_size: Option<u64>) -> std::io::Result<ArchiveBinaryFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let current_size = file.metadata()?.len();
        let mut window = PAGE * 2;
        if let Some(requested) = window_size {
            while window < requested {
                window *= 2;
            }
        }
        Ok(ArchiveBinaryFile {
            file,
            current_size,
            real_size: current_size,
            window_size: window,
            map_start: 0,
            map_end: 0,
            map: None,
        })
    }

    pub fn size(&self) -> u64 {
        self.real_size
    }

    /// Set the logical size (applied to disk on flush).
    pub fn truncate(&mut self, size: u64) {
        self.real_size = size;
    }

    /// Write `data` at `pos`. With a mask, only the mask's set bits are
    /// changed.
    pub fn write(&mut self, pos: u64, data: &[u8], mask: Option<&[u8]>) -> std::io::Result<()> {
        let end = pos + data.len() as u64;
        if end > self.real_size {
            self.real_size = end;
        }
        self.map_range(pos, end)?;
        let map = self.map.as_mut().expect("mapped");
        let i = usize::try_from(pos - self.map_start).expect("window offset");
        match mask {
            None => map[i..i + data.len()].copy_from_slice(data),
            Some(mask) => {
                for (j, byte) in data.iter().enumerate() {
                    let m = mask.get(j).copied().unwrap_or(0xff);
                    map[i + j] = (map[i + j] & !m) | (byte & m);
                }
            }
        }
        Ok(())
    }

    /// Drop the window, truncate to the logical size, and sync.
    pub fn flush(&mut self) -> std::io::Result<()> {
        if let Some(map) = self.map.take() {
            map.flush()?;
        }
        self.map_start = 0;
        self.map_end = 0;
        if self.real_size != self.current_size {
            self.file.set_len(self.real_size)?;
            self.current_size = self.real_size;
        }
        self.file.sync_data()
    }

    fn map_range(&mut self, start: u64, end: u64) -> std::io::Result<()> {
        if self.map.is_some() && start >= self.map_start && end <= self.map_end {
            return Ok(());
        }
        if let Some(map) = self.map.take() {
            map.flush()?;
        }
        let mut win_start = start - (start % PAGE);
        let mut win_end = win_start + self.window_size;
        if end > win_end {
            win_end = end.div_ceil(PAGE) * PAGE;
            win_start = win_end.saturating_sub(self.window_size).min(win_start);
        }
        if win_end > self.current_size {
            self.file.set_len(win_end)?;
            self.current_size = win_end;
        }
        let map = unsafe {
            memmap2::MmapOptions::new()
                .offset(win_start)
                .len(usize::try_from(win_end - win_start).expect("window length"))
                .map_mut(&self.file)?
        };
        self.map = Some(map);
        self.map_start = win_start;
        self.map_end = win_end;
        Ok(())
    }
}

impl Drop for ArchiveBinaryFile {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::{ArchiveBinaryFile, ArchiveLogFile, CORRUPTION_MARKER};

    #[test]
    fn torn_log_gets_the_corruption_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("_phi_numerics");
        std::fs::write(&path, b"S100\ntorn line without newline").expect("seed");
        let mut log = ArchiveLogFile::open(&path).expect("open");
        log.append("next").expect("append");
        log.flush().expect("flush");

        let bytes = std::fs::read(&path).expect("read");
        let expected = [
            b"S100\ntorn line without newline".as_slice(),
            CORRUPTION_MARKER,
            b"next\n",
        ]
        .concat();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn clean_log_is_untouched_on_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("_phi_enums");
        {
            let mut log = ArchiveLogFile::open(&path).expect("open");
            log.append("S1").expect("append");
            log.flush().expect("flush");
        }
        let log = ArchiveLogFile::open(&path).expect("reopen");
        drop(log);
        assert_eq!(std::fs::read(&path).expect("read"), b"S1\n");
    }

    #[test]
    fn binary_file_truncates_to_logical_size_on_flush() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("000000000.dat");
        let mut bin = ArchiveBinaryFile::open(&path, None).expect("open");
        bin.write(0, &[1, 2, 3, 4], None).expect("write");
        bin.write(10, &[9, 9], None).expect("write");
        assert_eq!(bin.size(), 12);
        bin.flush().expect("flush");
        let bytes = std::fs::read(&path).expect("read");
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[10..12], &[9, 9]);
    }

    #[test]
    fn masked_writes_merge_with_existing_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seg.dat");
        let mut bin = ArchiveBinaryFile::open(&path, None).expect("open");
        bin.write(0, &[0b1111_0000], None).expect("write");
        bin.write(0, &[0b0000_1010], Some(&[0b0000_1111])).expect("masked");
        bin.flush().expect("flush");
        assert_eq!(std::fs::read(&path).expect("read"), vec![0b1111_1010]);
    }

    #[test]
    fn windows_move_for_distant_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.dat");
        let mut bin = ArchiveBinaryFile::open(&path, None).expect("open");
        bin.write(0, &[7], None).expect("near");
        bin.write(1_000_000, &[8], None).expect("far");
        bin.write(5, &[6], None).expect("back");
        bin.flush().expect("flush");
        let bytes = std::fs::read(&path).expect("read");
        assert_eq!(bytes.len(), 1_000_001);
        assert_eq!(bytes[0], 7);
        assert_eq!(bytes[5], 6);
        assert_eq!(bytes[1_000_000], 8);
    }
}
