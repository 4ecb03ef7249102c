use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::error::StorageError;
use super::Storage;
use crate::metainfo::Info;

/// File-backed storage: one file per torrent entry under a data
/// directory, written sparsely.
pub struct FileStorage {
    files: Vec<StoredFile>,
    piece_length: u64,
    total_length: u64,
}

struct StoredFile {
    /// Byte offset of this file within the torrent's piece space.
    offset: u64,
    length: u64,
    handle: Mutex<File>,
    path: PathBuf,
}

impl FileStorage {
    /// Opens (creating as needed) every file named by `info` under
    /// `data_dir`.
    pub fn open(data_dir: &Path, info: &Info) -> Result<Self, StorageError> {
        let mut files = Vec::with_capacity(info.files.len());
        for entry in &info.files {
            let path = data_dir.join(&entry.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            handle.set_len(entry.length)?;
            files.push(StoredFile {
                offset: entry.offset,
                length: entry.length,
                handle: Mutex::new(handle),
                path,
            });
        }
        Ok(Self {
            files,
            piece_length: info.piece_length,
            total_length: info.total_length,
        })
    }

    /// Files overlapping `[offset, offset + len)`, with the in-file
    /// offset and span length for each.
    fn spans(&self, offset: u64, len: u64) -> Vec<(usize, u64, u64)> {
        let mut out = Vec::new();
        let end = (offset + len).min(self.total_length);
        for (i, f) in self.files.iter().enumerate() {
            let f_end = f.offset + f.length;
            if f_end <= offset || f.offset >= end {
                continue;
            }
            let start = offset.max(f.offset);
            let span = f_end.min(end) - start;
            if span > 0 {
                out.push((i, start - f.offset, span));
            }
        }
        out
    }
}

impl Storage for FileStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        if offset >= self.total_length {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.total_length - offset);
        let mut done = 0u64;
        for (i, file_off, span) in self.spans(offset, want) {
            let mut handle = self.files[i].handle.lock();
            handle.seek(SeekFrom::Start(file_off))?;
            handle.read_exact(&mut buf[done as usize..(done + span) as usize])?;
            done += span;
        }
        Ok(done as usize)
    }

    fn write_chunk(&self, piece_index: u32, begin: u32, data: &[u8]) -> Result<(), StorageError> {
        let offset = piece_index as u64 * self.piece_length + begin as u64;
        let end = offset + data.len() as u64;
        if end > self.total_length {
            return Err(StorageError::OutOfBounds {
                offset: end,
                total: self.total_length,
            });
        }
        let mut done = 0u64;
        for (i, file_off, span) in self.spans(offset, data.len() as u64) {
            let mut handle = self.files[i].handle.lock();
            handle.seek(SeekFrom::Start(file_off))?;
            handle.write_all(&data[done as usize..(done + span) as usize])?;
            done += span;
        }
        Ok(())
    }

    fn open_section(
        &self,
        offset: u64,
        length: u64,
    ) -> Result<Option<Box<dyn Read + Send>>, StorageError> {
        // Sections get their own file handles so they never contend
        // with chunk writes for seek positions.
        let mut parts = Vec::new();
        for (i, file_off, span) in self.spans(offset, length) {
            let mut handle = File::open(&self.files[i].path)?;
            handle.seek(SeekFrom::Start(file_off))?;
            parts.push(handle.take(span));
        }
        Ok(Some(Box::new(SectionReader { parts, current: 0 })))
    }
}

struct SectionReader {
    parts: Vec<std::io::Take<File>>,
    current: usize,
}

impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current < self.parts.len() {
            let n = self.parts[self.current].read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.current += 1;
        }
        Ok(0)
    }
}
