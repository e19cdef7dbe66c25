//! Windowed read cache over a slow seekable source.

use std::io::SeekFrom;

use anyhow::{Result, bail};

use crate::Stream;

/// Default cache window: 1 MiB.
pub const DEFAULT_WINDOW: usize = 1024 * 1024;

/// Read-only cover over a seekable stream. Keeps a fixed-size window in
/// memory and services reads from it while the requested range stays
/// inside; a read outside the window refills it at the requested offset.
pub struct CacheStream {
    inner: Box<dyn Stream>,
    window: Vec<u8>,
    window_start: u64,
    pos: u64,
    capacity: usize,
}

impl CacheStream {
    pub fn new(inner: Box<dyn Stream>) -> Result<Self> {
        Self::with_window(inner, DEFAULT_WINDOW)
    }

    pub fn with_window(inner: Box<dyn Stream>, capacity: usize) -> Result<Self> {
        if !inner.can_read() || !inner.can_seek() {
            bail!("cache stream requires a readable, seekable source");
        }
        if capacity == 0 {
            bail!("cache window must be non-empty");
        }
        Ok(Self {
            inner,
            window: Vec::new(),
            window_start: 0,
            pos: 0,
            capacity,
        })
    }

    fn refill(&mut self, at: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(at))?;
        self.window.resize(self.capacity, 0);
        let mut filled = 0usize;
        while filled < self.capacity {
            let n = self.inner.read(&mut self.window[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.window.truncate(filled);
        self.window_start = at;
        Ok(())
    }
}

impl Stream for CacheStream {
    fn can_read(&self) -> bool {
        true
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let in_window = self.pos >= self.window_start
            && self.pos < self.window_start + self.window.len() as u64;
        if !in_window {
            self.refill(self.pos)?;
            if self.window.is_empty() {
                return Ok(0);
            }
        }
        let offset = (self.pos - self.window_start) as usize;
        let n = (self.window.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&self.window[offset..offset + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let size = self.inner.size()?;
        let new = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::End(o) => size as i64 + o,
            SeekFrom::Current(o) => self.pos as i64 + o,
        };
        if new < 0 {
            bail!("seek before start of cache stream");
        }
        self.pos = new as u64;
        Ok(self.pos)
    }

    fn size(&self) -> Result<u64> {
        self.inner.size()
    }

    fn close(&mut self) -> Result<()> {
        self.window = Vec::new();
        self.inner.close()
    }
}
