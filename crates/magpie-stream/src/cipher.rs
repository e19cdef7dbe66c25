//! Password-keyed symmetric cipher combinator.
//!
//! The key derivation is kept bit-compatible with the legacy tooling this
//! orchestrator replaces: a single unsalted SHA-1 over the UTF-16LE code
//! units of the passphrase, expanded to an AES-256 key with the classic
//! 0x36/0x5C pad construction, then AES-256-CBC with a zero IV and PKCS7
//! terminal padding. This KDF is weak by modern standards and is retained
//! for compatibility only; do not reuse it for new formats.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use anyhow::{Result, bail};
use sha1::{Digest, Sha1};

use crate::Stream;

type CbcEnc = cbc::Encryptor<Aes256>;
type CbcDec = cbc::Decryptor<Aes256>;

/// Cipher block size in bytes.
pub const BLOCK_LEN: usize = 16;

/// Which way the combinator transforms bytes written through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    Encrypt,
    Decrypt,
}

/// Derive the AES-256 key from a passphrase.
///
/// SHA-1 over UTF-16LE passphrase bytes, then the two-lane pad expansion
/// (ipad 0x36 / opad 0x5C over a 64-byte block), concatenated and truncated
/// to 32 bytes.
pub fn derive_key(passphrase: &str) -> [u8; 32] {
    let mut utf16 = Vec::with_capacity(passphrase.len() * 2);
    for unit in passphrase.encode_utf16() {
        utf16.extend_from_slice(&unit.to_le_bytes());
    }
    let digest = Sha1::digest(&utf16);

    let mut ipad = [0x36u8; 64];
    let mut opad = [0x5Cu8; 64];
    for (i, b) in digest.iter().enumerate() {
        ipad[i] ^= b;
        opad[i] ^= b;
    }

    let lane1 = Sha1::digest(ipad);
    let lane2 = Sha1::digest(opad);

    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&lane1);
    key[20..].copy_from_slice(&lane2[..12]);
    key
}

enum CipherState {
    Encrypting(CbcEnc),
    Decrypting(CbcDec),
    Closed,
}

/// Write-through cipher: bytes written are transformed and forwarded to the
/// inner stream. Writes buffer until a whole cipher block is available;
/// `close` handles the final (possibly padded) block and closes the inner
/// stream.
pub struct PasswordCipherStream {
    inner: Box<dyn Stream>,
    state: CipherState,
    pending: Vec<u8>,
}

impl PasswordCipherStream {
    pub fn new(inner: Box<dyn Stream>, passphrase: &str, direction: CipherDirection) -> Self {
        let key = derive_key(passphrase);
        let iv = [0u8; BLOCK_LEN];
        let state = match direction {
            CipherDirection::Encrypt => {
                CipherState::Encrypting(CbcEnc::new(&key.into(), &iv.into()))
            }
            CipherDirection::Decrypt => {
                CipherState::Decrypting(CbcDec::new(&key.into(), &iv.into()))
            }
        };
        Self {
            inner,
            state,
            pending: Vec::new(),
        }
    }

    fn drain_full_blocks(&mut self) -> Result<()> {
        match &mut self.state {
            CipherState::Encrypting(enc) => {
                while self.pending.len() >= BLOCK_LEN {
                    let mut block = GenericArray::clone_from_slice(&self.pending[..BLOCK_LEN]);
                    enc.encrypt_block_mut(&mut block);
                    crate::write_all(self.inner.as_mut(), &block)?;
                    self.pending.drain(..BLOCK_LEN);
                }
            }
            CipherState::Decrypting(dec) => {
                // Hold the trailing block back: it may carry the padding.
                while self.pending.len() >= 2 * BLOCK_LEN {
                    let mut block = GenericArray::clone_from_slice(&self.pending[..BLOCK_LEN]);
                    dec.decrypt_block_mut(&mut block);
                    crate::write_all(self.inner.as_mut(), &block)?;
                    self.pending.drain(..BLOCK_LEN);
                }
            }
            CipherState::Closed => bail!("cipher stream is closed"),
        }
        Ok(())
    }
}

impl Stream for PasswordCipherStream {
    fn can_write(&self) -> bool {
        true
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if matches!(self.state, CipherState::Closed) {
            bail!("cipher stream is closed");
        }
        self.pending.extend_from_slice(buf);
        self.drain_full_blocks()?;
        Ok(buf.len())
    }

    fn size(&self) -> Result<u64> {
        self.inner.size()
    }

    fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, CipherState::Closed) {
            CipherState::Encrypting(mut enc) => {
                // PKCS7: always emit a final padded block, even for empty input.
                let pad = BLOCK_LEN - self.pending.len();
                let mut block = [0u8; BLOCK_LEN];
                block[..self.pending.len()].copy_from_slice(&self.pending);
                for slot in block.iter_mut().skip(self.pending.len()) {
                    *slot = pad as u8;
                }
                self.pending.clear();
                let mut block = GenericArray::from(block);
                enc.encrypt_block_mut(&mut block);
                crate::write_all(self.inner.as_mut(), &block)?;
                self.inner.close()
            }
            CipherState::Decrypting(mut dec) => {
                if self.pending.len() != BLOCK_LEN {
                    self.inner.close().ok();
                    bail!(
                        "ciphertext is not a whole number of cipher blocks ({} trailing bytes)",
                        self.pending.len()
                    );
                }
                let mut block = GenericArray::clone_from_slice(&self.pending);
                self.pending.clear();
                dec.decrypt_block_mut(&mut block);
                let pad = block[BLOCK_LEN - 1] as usize;
                if pad == 0 || pad > BLOCK_LEN || block[BLOCK_LEN - pad..].iter().any(|b| *b as usize != pad)
                {
                    self.inner.close().ok();
                    bail!("cipher padding check failed (wrong password or corrupt data)");
                }
                crate::write_all(self.inner.as_mut(), &block[..BLOCK_LEN - pad])?;
                self.inner.close()
            }
            CipherState::Closed => Ok(()),
        }
    }
}

impl Drop for PasswordCipherStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::CollectSink;

    fn transform(data: &[u8], passphrase: &str, direction: CipherDirection) -> Result<Vec<u8>> {
        let sink = CollectSink::new();
        let handle = sink.buffer();
        let mut s = PasswordCipherStream::new(Box::new(sink), passphrase, direction);
        crate::write_all(&mut s, data)?;
        s.close()?;
        let out = handle.lock().expect("collect").clone();
        Ok(out)
    }

    #[test]
    fn roundtrip_across_lengths() {
        // 0, 1-below-block, exactly one block, one-over, and a bulk payload.
        for len in [0usize, 15, 16, 17, 1024 * 1024] {
            let plain: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let cipher = transform(&plain, "hunter2", CipherDirection::Encrypt).expect("encrypt");
            assert_eq!(cipher.len() % BLOCK_LEN, 0);
            assert!(cipher.len() > plain.len());
            let back = transform(&cipher, "hunter2", CipherDirection::Decrypt).expect("decrypt");
            assert_eq!(back, plain, "length {len}");
        }
    }

    #[test]
    fn wrong_password_fails_padding_check() {
        let cipher = transform(b"secret payload", "correct", CipherDirection::Encrypt)
            .expect("encrypt");
        let err = transform(&cipher, "incorrect", CipherDirection::Decrypt)
            .expect_err("wrong password must fail");
        assert!(err.to_string().contains("padding check failed"));
    }

    #[test]
    fn split_writes_match_whole_write() {
        let plain = b"block boundary straddling payload".to_vec();
        let whole = transform(&plain, "pw", CipherDirection::Encrypt).expect("encrypt");

        let sink = CollectSink::new();
        let handle = sink.buffer();
        let mut s = PasswordCipherStream::new(Box::new(sink), "pw", CipherDirection::Encrypt);
        for chunk in plain.chunks(7) {
            crate::write_all(&mut s, chunk).expect("write");
        }
        s.close().expect("close");
        assert_eq!(*handle.lock().expect("collect"), whole);
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let cipher = transform(b"some data", "pw", CipherDirection::Encrypt).expect("encrypt");
        let err = transform(&cipher[..cipher.len() - 1], "pw", CipherDirection::Decrypt)
            .expect_err("truncated input must fail");
        assert!(err.to_string().contains("whole number of cipher blocks"));
    }

    #[test]
    fn derive_key_is_deterministic_and_passphrase_sensitive() {
        assert_eq!(derive_key("alpha"), derive_key("alpha"));
        assert_ne!(derive_key("alpha"), derive_key("beta"));
        // UTF-16 code units, not UTF-8 bytes, feed the hash.
        assert_ne!(derive_key("é"), derive_key("e\u{301}"));
    }

    proptest::proptest! {
        #[test]
        fn any_payload_roundtrips(
            data in proptest::collection::vec(proptest::num::u8::ANY, 0..1024),
            passphrase in "[a-zA-Z0-9]{1,24}",
        ) {
            let cipher = transform(&data, &passphrase, CipherDirection::Encrypt)
                .expect("encrypt");
            let back = transform(&cipher, &passphrase, CipherDirection::Decrypt)
                .expect("decrypt");
            proptest::prop_assert_eq!(back, data);
        }
    }
}
