//! Composable byte streams for magpie.
//!
//! Everything that moves bytes in the orchestrator - child stdio, staged
//! files, archive entries, embedded bundle payloads - goes through the
//! [`Stream`] trait: a blocking byte stream whose read/write/seek
//! capabilities are independently queryable and whose `close` is idempotent.
//!
//! Primitives live in [`primitives`] (file, temporary spill file, memory,
//! dev-null). Combinators each wrap an inner stream and present the same
//! trait: [`hash::HashStream`] (streaming MD5/SHA1/SHA256),
//! [`xor::XorStream`] (self-inverse 32-bit masking),
//! [`cipher::PasswordCipherStream`] (AES-256-CBC with the compatibility
//! KDF), [`buffer`] (ring buffer with backpressure), [`tee::TeeStream`]
//! (fan-out writes), [`cache::CacheStream`] (windowed read cache) and
//! [`bundle`] (tar bundle entry iteration with XOR-name unmasking).
//!
//! # Example
//!
//! ```
//! use magpie_stream::{Stream, hash::HashStream, primitives::DevNull};
//! use magpie_types::HashSelection;
//!
//! let mut s = HashStream::new(Box::new(DevNull::new()), HashSelection::default());
//! s.write(b"hello").expect("write");
//! s.close().expect("close");
//! let digests = s.digests().expect("finalized");
//! assert!(digests.sha256.is_some());
//! ```

use std::io::SeekFrom;

use anyhow::{Result, bail};

pub mod buffer;
pub mod bundle;
pub mod cache;
pub mod cipher;
pub mod hash;
pub mod primitives;
pub mod tee;
pub mod xor;

/// A blocking byte stream with queryable capabilities.
///
/// Implementations must make `close` idempotent and must release the
/// underlying resource on every exit path; `Drop` implementations call
/// `close` and swallow the error.
pub trait Stream: Send {
    /// Whether `read` is supported.
    fn can_read(&self) -> bool {
        false
    }

    /// Whether `write` is supported.
    fn can_write(&self) -> bool {
        false
    }

    /// Whether `seek` is supported.
    fn can_seek(&self) -> bool {
        false
    }

    /// Read up to `buf.len()` bytes. Zero means end of stream.
    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        bail!("stream is not readable")
    }

    /// Write `buf`, returning the number of bytes accepted.
    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        bail!("stream is not writable")
    }

    /// Reposition the stream, returning the new absolute offset.
    fn seek(&mut self, _pos: SeekFrom) -> Result<u64> {
        bail!("stream is not seekable")
    }

    /// Total size in bytes, where meaningful.
    fn size(&self) -> Result<u64>;

    /// Release the underlying resource. Idempotent.
    fn close(&mut self) -> Result<()>;
}

impl<T: Stream + ?Sized> Stream for &mut T {
    fn can_read(&self) -> bool {
        (**self).can_read()
    }

    fn can_write(&self) -> bool {
        (**self).can_write()
    }

    fn can_seek(&self) -> bool {
        (**self).can_seek()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        (**self).seek(pos)
    }

    fn size(&self) -> Result<u64> {
        (**self).size()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

impl Stream for Box<dyn Stream> {
    fn can_read(&self) -> bool {
        self.as_ref().can_read()
    }

    fn can_write(&self) -> bool {
        self.as_ref().can_write()
    }

    fn can_seek(&self) -> bool {
        self.as_ref().can_seek()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.as_mut().read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.as_mut().write(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.as_mut().seek(pos)
    }

    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// Drain `src` into `dst` in 64 KiB chunks, returning the bytes moved.
pub fn copy_stream(src: &mut dyn Stream, dst: &mut dyn Stream) -> Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        write_all(dst, &buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}

/// Write the whole of `buf`, looping over short writes.
pub fn write_all(dst: &mut dyn Stream, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = dst.write(buf)?;
        if n == 0 {
            bail!("stream refused further writes");
        }
        buf = &buf[n..];
    }
    Ok(())
}

/// Adapter exposing a [`Stream`] as [`std::io::Read`], for handing stream
/// graphs to APIs that want the std trait (archive writers, hash helpers).
pub struct ReadAdapter<S: Stream>(pub S);

impl<S: Stream> std::io::Read for ReadAdapter<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0
            .read(buf)
            .map_err(|e| std::io::Error::other(format!("{e:#}")))
    }
}

/// Adapter exposing a [`Stream`] as [`std::io::Write`].
pub struct WriteAdapter<S: Stream>(pub S);

impl<S: Stream> std::io::Write for WriteAdapter<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .write(buf)
            .map_err(|e| std::io::Error::other(format!("{e:#}")))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{DevNull, MemoryStream};

    struct Unsupported;

    impl Stream for Unsupported {
        fn size(&self) -> Result<u64> {
            Ok(0)
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn default_capabilities_reject_operations() {
        let mut s = Unsupported;
        assert!(!s.can_read());
        assert!(!s.can_write());
        assert!(!s.can_seek());
        assert!(s.read(&mut [0u8; 4]).is_err());
        assert!(s.write(b"x").is_err());
        assert!(s.seek(SeekFrom::Start(0)).is_err());
    }

    #[test]
    fn copy_stream_moves_all_bytes() {
        let mut src = MemoryStream::new(vec![7u8; 200_000]);
        let mut dst = DevNull::new();
        let moved = copy_stream(&mut src, &mut dst).expect("copy");
        assert_eq!(moved, 200_000);
    }
}
