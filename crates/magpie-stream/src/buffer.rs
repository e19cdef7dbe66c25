//! In-memory ring buffer decoupling a producing writer from a consuming
//! reader, with blocking backpressure at the high-water mark.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{Result, anyhow, bail};

use crate::Stream;

struct Ring {
    data: VecDeque<u8>,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
}

struct Shared {
    ring: Mutex<Ring>,
    cond: Condvar,
}

/// Create a connected writer/reader pair over a ring of `capacity` bytes.
///
/// The writer blocks once the ring is full until the reader drains it; the
/// reader blocks on an empty ring until the writer produces or closes.
pub fn ring(capacity: usize) -> (BufferWriter, BufferReader) {
    let shared = Arc::new(Shared {
        ring: Mutex::new(Ring {
            data: VecDeque::with_capacity(capacity),
            capacity,
            writer_closed: false,
            reader_closed: false,
        }),
        cond: Condvar::new(),
    });
    (
        BufferWriter {
            shared: Arc::clone(&shared),
        },
        BufferReader { shared },
    )
}

/// Producing end of a [`ring`]. Write-only.
pub struct BufferWriter {
    shared: Arc<Shared>,
}

impl Stream for BufferWriter {
    fn can_write(&self) -> bool {
        true
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut ring = self
            .shared
            .ring
            .lock()
            .map_err(|_| anyhow!("buffer poisoned"))?;
        loop {
            if ring.writer_closed {
                bail!("buffer writer is closed");
            }
            if ring.reader_closed {
                bail!("buffer reader is gone");
            }
            let space = ring.capacity - ring.data.len();
            if space > 0 {
                let n = space.min(buf.len());
                ring.data.extend(&buf[..n]);
                self.shared.cond.notify_all();
                return Ok(n);
            }
            ring = self
                .shared
                .cond
                .wait(ring)
                .map_err(|_| anyhow!("buffer poisoned"))?;
        }
    }

    fn size(&self) -> Result<u64> {
        let ring = self
            .shared
            .ring
            .lock()
            .map_err(|_| anyhow!("buffer poisoned"))?;
        Ok(ring.data.len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        if let Ok(mut ring) = self.shared.ring.lock() {
            ring.writer_closed = true;
            self.shared.cond.notify_all();
        }
        Ok(())
    }
}

impl Drop for BufferWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Consuming end of a [`ring`]. Read-only; reads return zero once the
/// writer has closed and the ring is drained.
pub struct BufferReader {
    shared: Arc<Shared>,
}

impl Stream for BufferReader {
    fn can_read(&self) -> bool {
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut ring = self
            .shared
            .ring
            .lock()
            .map_err(|_| anyhow!("buffer poisoned"))?;
        loop {
            if !ring.data.is_empty() {
                let n = ring.data.len().min(buf.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = ring.data.pop_front().unwrap_or_default();
                }
                self.shared.cond.notify_all();
                return Ok(n);
            }
            if ring.writer_closed {
                return Ok(0);
            }
            if ring.reader_closed {
                bail!("buffer reader is closed");
            }
            ring = self
                .shared
                .cond
                .wait(ring)
                .map_err(|_| anyhow!("buffer poisoned"))?;
        }
    }

    fn size(&self) -> Result<u64> {
        let ring = self
            .shared
            .ring
            .lock()
            .map_err(|_| anyhow!("buffer poisoned"))?;
        Ok(ring.data.len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        if let Ok(mut ring) = self.shared.ring.lock() {
            ring.reader_closed = true;
            self.shared.cond.notify_all();
        }
        Ok(())
    }
}

impl Drop for BufferReader {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
