//! Primitive streams: file, temporary spill file, fixed memory, dev-null.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::Stream;

/// A stream over an OS file handle. All capabilities.
pub struct FileStream {
    file: Option<File>,
    path: PathBuf,
    readable: bool,
    writable: bool,
}

impl FileStream {
    /// Open an existing file read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open {} for reading", path.display()))?;
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            readable: true,
            writable: false,
        })
    }

    /// Create (or truncate) a file for writing; reads are also allowed so
    /// the producer can reposition and re-read what it wrote.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            readable: true,
            writable: true,
        })
    }

    /// The path this stream was opened on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&mut self) -> Result<&mut File> {
        match self.file.as_mut() {
            Some(f) => Ok(f),
            None => bail!("file stream {} is closed", self.path.display()),
        }
    }
}

impl Stream for FileStream {
    fn can_read(&self) -> bool {
        self.readable
    }

    fn can_write(&self) -> bool {
        self.writable
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.readable {
            bail!("file stream {} is not readable", self.path.display());
        }
        let path = self.path.clone();
        self.handle()?
            .read(buf)
            .with_context(|| format!("read failed on {}", path.display()))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            bail!("file stream {} is not writable", self.path.display());
        }
        let path = self.path.clone();
        self.handle()?
            .write(buf)
            .with_context(|| format!("write failed on {}", path.display()))
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let path = self.path.clone();
        self.handle()?
            .seek(pos)
            .with_context(|| format!("seek failed on {}", path.display()))
    }

    fn size(&self) -> Result<u64> {
        match &self.file {
            Some(f) => Ok(f.metadata()?.len()),
            None => bail!("file stream {} is closed", self.path.display()),
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(f) = self.file.take() {
            f.sync_all().ok();
        }
        Ok(())
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Default spill threshold for [`TemporaryStream`]: 4 MiB.
pub const DEFAULT_HIGH_WATER: usize = 4 * 1024 * 1024;

enum TempBacking {
    Memory(Vec<u8>),
    File(tempfile::NamedTempFile),
    Closed,
}

/// A read/write/seek stream backed by memory until it crosses a high-water
/// mark, then transparently promoted to a file in the scratch directory.
pub struct TemporaryStream {
    backing: TempBacking,
    scratch_dir: PathBuf,
    high_water: usize,
    pos: u64,
}

impl TemporaryStream {
    pub fn new(scratch_dir: &Path) -> Self {
        Self::with_high_water(scratch_dir, DEFAULT_HIGH_WATER)
    }

    pub fn with_high_water(scratch_dir: &Path, high_water: usize) -> Self {
        Self {
            backing: TempBacking::Memory(Vec::new()),
            scratch_dir: scratch_dir.to_path_buf(),
            high_water,
            pos: 0,
        }
    }

    /// Whether the stream has spilled to a file yet.
    pub fn is_spilled(&self) -> bool {
        matches!(self.backing, TempBacking::File(_))
    }

    fn spill(&mut self) -> Result<()> {
        let TempBacking::Memory(mem) = &self.backing else {
            return Ok(());
        };
        let mut file = tempfile::NamedTempFile::new_in(&self.scratch_dir).with_context(|| {
            format!("failed to create spill file in {}", self.scratch_dir.display())
        })?;
        file.write_all(mem).context("failed to spill buffer")?;
        file.seek(SeekFrom::Start(self.pos))
            .context("failed to reposition spill file")?;
        self.backing = TempBacking::File(file);
        Ok(())
    }
}

impl Stream for TemporaryStream {
    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        true
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.backing {
            TempBacking::Memory(mem) => {
                let start = (self.pos as usize).min(mem.len());
                let n = (mem.len() - start).min(buf.len());
                buf[..n].copy_from_slice(&mem[start..start + n]);
                self.pos += n as u64;
                Ok(n)
            }
            TempBacking::File(f) => {
                let n = f.read(buf).context("temporary stream read failed")?;
                self.pos += n as u64;
                Ok(n)
            }
            TempBacking::Closed => bail!("temporary stream is closed"),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if let TempBacking::Memory(mem) = &self.backing {
            let end = self.pos as usize + buf.len();
            if end.max(mem.len()) > self.high_water {
                self.spill()?;
            }
        }
        match &mut self.backing {
            TempBacking::Memory(mem) => {
                let start = self.pos as usize;
                if start > mem.len() {
                    mem.resize(start, 0);
                }
                let overlap = (mem.len() - start).min(buf.len());
                mem[start..start + overlap].copy_from_slice(&buf[..overlap]);
                mem.extend_from_slice(&buf[overlap..]);
                self.pos += buf.len() as u64;
                Ok(buf.len())
            }
            TempBacking::File(f) => {
                let n = f.write(buf).context("temporary stream write failed")?;
                self.pos += n as u64;
                Ok(n)
            }
            TempBacking::Closed => bail!("temporary stream is closed"),
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let size = self.size()?;
        let new = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::End(o) => size as i64 + o,
            SeekFrom::Current(o) => self.pos as i64 + o,
        };
        if new < 0 {
            bail!("seek before start of temporary stream");
        }
        self.pos = new as u64;
        if let TempBacking::File(f) = &mut self.backing {
            f.seek(SeekFrom::Start(self.pos))
                .context("temporary stream seek failed")?;
        }
        Ok(self.pos)
    }

    fn size(&self) -> Result<u64> {
        match &self.backing {
            TempBacking::Memory(mem) => Ok(mem.len() as u64),
            TempBacking::File(f) => Ok(f.as_file().metadata()?.len()),
            TempBacking::Closed => bail!("temporary stream is closed"),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.backing = TempBacking::Closed;
        Ok(())
    }
}

impl Drop for TemporaryStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A fixed in-memory buffer. Read and seek only.
pub struct MemoryStream {
    data: Vec<u8>,
    pos: u64,
    closed: bool,
}

impl MemoryStream {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            closed: false,
        }
    }
}

impl Stream for MemoryStream {
    fn can_read(&self) -> bool {
        true
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            bail!("memory stream is closed");
        }
        let start = (self.pos as usize).min(self.data.len());
        let n = (self.data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        if self.closed {
            bail!("memory stream is closed");
        }
        let len = self.data.len() as i64;
        let new = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::End(o) => len + o,
            SeekFrom::Current(o) => self.pos as i64 + o,
        };
        if new < 0 {
            bail!("seek before start of memory stream");
        }
        self.pos = new as u64;
        Ok(self.pos)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.data = Vec::new();
        Ok(())
    }
}

/// Discards writes, reads nothing, sizes to zero.
#[derive(Default)]
pub struct DevNull;

impl DevNull {
    pub fn new() -> Self {
        Self
    }
}

impl Stream for DevNull {
    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        true
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(buf.len())
    }

    fn size(&self) -> Result<u64> {
        Ok(0)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
