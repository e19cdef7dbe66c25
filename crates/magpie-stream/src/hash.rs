//! Streaming digest computation over a flowing stream.

use std::io::SeekFrom;

use anyhow::{Result, bail};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use magpie_types::{DigestSet, HashSelection};

use crate::Stream;

/// Wraps an inner stream and hashes every byte that flows through it, in
/// either direction. Digests are finalised on `close` and the ordering of
/// `write` (or `read`) calls determines the digest input.
pub struct HashStream {
    inner: Box<dyn Stream>,
    md5: Option<Md5>,
    sha1: Option<Sha1>,
    sha256: Option<Sha256>,
    finalized: Option<DigestSet>,
}

impl HashStream {
    pub fn new(inner: Box<dyn Stream>, selection: HashSelection) -> Self {
        Self {
            inner,
            md5: selection.md5.then(Md5::new),
            sha1: selection.sha1.then(Sha1::new),
            sha256: selection.sha256.then(Sha256::new),
            finalized: None,
        }
    }

    fn absorb(&mut self, data: &[u8]) {
        if let Some(h) = self.md5.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.sha1.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.sha256.as_mut() {
            h.update(data);
        }
    }

    /// The final digests. `None` until the stream has been closed.
    pub fn digests(&self) -> Option<DigestSet> {
        self.finalized.clone()
    }

    /// Give back the inner stream, discarding hash state.
    pub fn into_inner(self) -> Box<dyn Stream> {
        self.inner
    }
}

impl Stream for HashStream {
    fn can_read(&self) -> bool {
        self.inner.can_read()
    }

    fn can_write(&self) -> bool {
        self.inner.can_write()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.finalized.is_some() {
            bail!("hash stream is closed");
        }
        let n = self.inner.read(buf)?;
        self.absorb(&buf[..n]);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.finalized.is_some() {
            bail!("hash stream is closed");
        }
        let n = self.inner.write(buf)?;
        self.absorb(&buf[..n]);
        Ok(n)
    }

    fn seek(&mut self, _pos: SeekFrom) -> Result<u64> {
        // Seeking would corrupt the single-pass digest.
        bail!("hash stream is not seekable")
    }

    fn size(&self) -> Result<u64> {
        self.inner.size()
    }

    fn close(&mut self) -> Result<()> {
        if self.finalized.is_none() {
            self.finalized = Some(DigestSet {
                md5: self.md5.take().map(|h| hex::encode(h.finalize())),
                sha1: self.sha1.take().map(|h| hex::encode(h.finalize())),
                sha256: self.sha256.take().map(|h| hex::encode(h.finalize())),
            });
        }
        self.inner.close()
    }
}

/// One-shot convenience: digest a byte slice with the given selection.
pub fn digest_bytes(data: &[u8], selection: HashSelection) -> DigestSet {
    let mut set = DigestSet::default();
    if selection.md5 {
        set.md5 = Some(hex::encode(Md5::digest(data)));
    }
    if selection.sha1 {
        set.sha1 = Some(hex::encode(Sha1::digest(data)));
    }
    if selection.sha256 {
        set.sha256 = Some(hex::encode(Sha256::digest(data)));
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::DevNull;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";
    const HELLO_SHA1: &str = "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d";

    #[test]
    fn streaming_equals_one_shot() {
        let mut s = HashStream::new(Box::new(DevNull::new()), HashSelection::all());
        // Split the input to prove the digest is order-sensitive streaming.
        s.write(b"he").expect("write");
        s.write(b"llo").expect("write");
        s.close().expect("close");

        let digests = s.digests().expect("digests");
        assert_eq!(digests.sha256.as_deref(), Some(HELLO_SHA256));
        assert_eq!(digests.md5.as_deref(), Some(HELLO_MD5));
        assert_eq!(digests.sha1.as_deref(), Some(HELLO_SHA1));

        let one_shot = digest_bytes(b"hello", HashSelection::all());
        assert_eq!(digests, one_shot);
    }

    #[test]
    fn digests_absent_until_close() {
        let mut s = HashStream::new(Box::new(DevNull::new()), HashSelection::default());
        s.write(b"data").expect("write");
        assert!(s.digests().is_none());
        s.close().expect("close");
        assert!(s.digests().is_some());
    }

    #[test]
    fn close_is_idempotent() {
        let mut s = HashStream::new(Box::new(DevNull::new()), HashSelection::default());
        s.write(b"x").expect("write");
        s.close().expect("close");
        let first = s.digests();
        s.close().expect("close again");
        assert_eq!(s.digests(), first);
    }

    #[test]
    fn zero_byte_input_still_produces_digests() {
        let mut s = HashStream::new(Box::new(DevNull::new()), HashSelection::default());
        s.close().expect("close");
        let digests = s.digests().expect("digests");
        assert_eq!(
            digests.sha256.as_deref(),
            Some("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
    }

    #[test]
    fn unselected_algorithms_stay_none() {
        let mut s = HashStream::new(Box::new(DevNull::new()), HashSelection::default());
        s.write(b"hello").expect("write");
        s.close().expect("close");
        let digests = s.digests().expect("digests");
        assert!(digests.md5.is_none());
        assert!(digests.sha1.is_none());
        assert_eq!(digests.sha256.as_deref(), Some(HELLO_SHA256));
    }
}
