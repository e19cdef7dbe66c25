//! 32-bit repeating XOR masking, self-inverse with the same key.

use anyhow::{Result, bail};

use crate::Stream;

/// Masks data with a repeating 4-byte key as it flows, in both directions.
/// The key cursor follows the byte offset within this stream, so interleaved
/// short reads/writes stay aligned.
pub struct XorStream {
    inner: Box<dyn Stream>,
    key: [u8; 4],
    offset: u64,
}

impl XorStream {
    pub fn new(inner: Box<dyn Stream>, key: u32) -> Self {
        Self {
            inner,
            key: key.to_le_bytes(),
            offset: 0,
        }
    }

    fn mask(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b ^= self.key[(self.offset % 4) as usize];
            self.offset += 1;
        }
    }
}

impl Stream for XorStream {
    fn can_read(&self) -> bool {
        self.inner.can_read()
    }

    fn can_write(&self) -> bool {
        self.inner.can_write()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(buf)?;
        self.mask(&mut buf[..n]);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut masked = buf.to_vec();
        self.mask(&mut masked);
        let n = self.inner.write(&masked)?;
        if n != masked.len() {
            // A short write would desynchronise the key cursor.
            bail!("xor stream: short write ({} of {})", n, masked.len());
        }
        Ok(n)
    }

    fn size(&self) -> Result<u64> {
        self.inner.size()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

/// FNV-1a over UTF-8 bytes; derives the mask key for XOR-prefixed resource
/// names from the remainder of the name itself.
pub fn key_from_name(name: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in name.as_bytes() {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Stream;
    use crate::primitives::MemoryStream;
    use crate::tee;

    fn mask_bytes(data: &[u8], key: u32) -> Vec<u8> {
        let sink = tee::CollectSink::new();
        let handle = sink.buffer();
        let mut s = XorStream::new(Box::new(sink), key);
        crate::write_all(&mut s, data).expect("write");
        s.close().expect("close");
        let out = handle.lock().expect("collect").clone();
        out
    }

    #[test]
    fn xor_is_self_inverse() {
        let original = b"the quick brown fox jumps over 13 lazy dogs".to_vec();
        let key = 0xDEADBEEF;
        let masked = mask_bytes(&original, key);
        assert_ne!(masked, original);
        let unmasked = mask_bytes(&masked, key);
        assert_eq!(unmasked, original);
    }

    #[test]
    fn key_cursor_survives_split_writes() {
        let whole = mask_bytes(b"abcdefgh", 0x01020304);

        let sink = tee::CollectSink::new();
        let handle = sink.buffer();
        let mut s = XorStream::new(Box::new(sink), 0x01020304);
        s.write(b"abc").expect("write");
        s.write(b"defgh").expect("write");
        s.close().expect("close");
        assert_eq!(*handle.lock().expect("collect"), whole);
    }

    #[test]
    fn read_side_unmasks() {
        let masked = mask_bytes(b"payload", 0xCAFEBABE);
        let mut s = XorStream::new(Box::new(MemoryStream::new(masked)), 0xCAFEBABE);
        let mut buf = vec![0u8; 16];
        let n = s.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"payload");
    }

    #[test]
    fn key_from_name_is_stable() {
        assert_eq!(key_from_name("helper"), key_from_name("helper"));
        assert_ne!(key_from_name("helper"), key_from_name("helper2"));
    }

    proptest::proptest! {
        #[test]
        fn masking_is_self_inverse_for_any_input(
            data in proptest::collection::vec(proptest::num::u8::ANY, 0..2048),
            key in proptest::num::u32::ANY,
        ) {
            let masked = mask_bytes(&data, key);
            proptest::prop_assert_eq!(mask_bytes(&masked, key), data);
        }
    }
}
