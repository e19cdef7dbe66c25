//! Container backends behind the builder agent.
//!
//! `Zip` is the general-purpose compressed container: deflate with the
//! plan's compression level, optional AES-256 entry encryption when a
//! password is set. `Tar` is the plain collection container for bit-exact
//! output; with a password its entry bytes go through the password cipher
//! while the container metadata stays in the clear.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};

use magpie_stream::cipher::{CipherDirection, PasswordCipherStream};
use magpie_stream::Stream;
use magpie_types::{ArchiveFormat, CompressionLevel};

/// Serial writer for one container file.
pub trait ContainerWriter: Send {
    /// Append one entry, returning the number of content bytes consumed
    /// from `reader`.
    fn add_entry(&mut self, name: &str, reader: &mut dyn Read) -> Result<u64>;

    /// Finalise the container and return its size in bytes.
    fn finish(self: Box<Self>) -> Result<u64>;
}

fn deflate_level(level: CompressionLevel) -> i64 {
    match level {
        CompressionLevel::Fast => 1,
        CompressionLevel::Normal => 6,
        CompressionLevel::Max => 9,
    }
}

/// Open a writer for `path`, deriving the format from the extension when
/// not given explicitly.
pub fn open_writer(
    path: &Path,
    format: Option<ArchiveFormat>,
    compression: CompressionLevel,
    password: Option<&str>,
) -> Result<Box<dyn ContainerWriter>> {
    let format = match format {
        Some(f) => f,
        None => ArchiveFormat::from_name(&path.to_string_lossy())
            .ok_or_else(|| anyhow!("cannot derive archive format from {}", path.display()))?,
    };

    let file = File::create(path)
        .with_context(|| format!("failed to create archive {}", path.display()))?;

    match format {
        ArchiveFormat::Zip => Ok(Box::new(ZipBackend {
            writer: zip::ZipWriter::new(file),
            path: path.to_path_buf(),
            level: deflate_level(compression),
            password: password.map(str::to_string),
        })),
        ArchiveFormat::Tar => Ok(Box::new(TarBackend {
            builder: tar::Builder::new(file),
            path: path.to_path_buf(),
            password: password.map(str::to_string),
        })),
    }
}

struct ZipBackend {
    writer: zip::ZipWriter<File>,
    path: PathBuf,
    level: i64,
    password: Option<String>,
}

impl ContainerWriter for ZipBackend {
    fn add_entry(&mut self, name: &str, reader: &mut dyn Read) -> Result<u64> {
        let mut options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .compression_level(Some(self.level))
            .large_file(true);
        if let Some(password) = &self.password {
            options = options.with_aes_encryption(zip::AesMode::Aes256, password);
        }
        self.writer
            .start_file(name, options)
            .with_context(|| format!("failed to start zip entry {name}"))?;
        let written = std::io::copy(reader, &mut self.writer)
            .with_context(|| format!("failed to write zip entry {name}"))?;
        Ok(written)
    }

    fn finish(self: Box<Self>) -> Result<u64> {
        let path = self.path.clone();
        let file = self
            .writer
            .finish()
            .with_context(|| format!("failed to finalise zip archive {}", path.display()))?;
        Ok(file.metadata()?.len())
    }
}

struct TarBackend {
    builder: tar::Builder<File>,
    path: PathBuf,
    password: Option<String>,
}

impl ContainerWriter for TarBackend {
    fn add_entry(&mut self, name: &str, reader: &mut dyn Read) -> Result<u64> {
        // Tar headers carry the entry size up front, so entries spool to a
        // temporary before appending. With a password the spooled bytes are
        // the ciphertext; the header stays in the clear.
        let spool = SharedSpool::new();
        let consumed = match &self.password {
            Some(password) => {
                let mut cipher = PasswordCipherStream::new(
                    Box::new(spool.clone()),
                    password,
                    CipherDirection::Encrypt,
                );
                let consumed = copy_into_stream(reader, &mut cipher)
                    .with_context(|| format!("failed to spool tar entry {name}"))?;
                cipher.close()?;
                consumed
            }
            None => {
                let mut sink = spool.clone();
                let consumed = copy_into_stream(reader, &mut sink)
                    .with_context(|| format!("failed to spool tar entry {name}"))?;
                consumed
            }
        };

        let (size, spooled) = spool.into_reader()?;
        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mode(0o644);
        header.set_cksum();
        self.builder
            .append_data(&mut header, name, spooled)
            .with_context(|| format!("failed to append tar entry {name}"))?;
        Ok(consumed)
    }

    fn finish(self: Box<Self>) -> Result<u64> {
        let path = self.path.clone();
        let file = self
            .builder
            .into_inner()
            .with_context(|| format!("failed to finalise tar archive {}", path.display()))?;
        file.sync_all().ok();
        Ok(file.metadata()?.len())
    }
}

fn copy_into_stream(reader: &mut dyn Read, dst: &mut dyn Stream) -> Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).context("entry source read failed")?;
        if n == 0 {
            return Ok(total);
        }
        magpie_stream::write_all(dst, &buf[..n])?;
        total += n as u64;
    }
}

/// Write-side stream over a spooled temporary, cloneable so the spooled
/// bytes survive a cipher combinator that owns its inner stream.
#[derive(Clone)]
struct SharedSpool {
    inner: Arc<Mutex<tempfile::SpooledTempFile>>,
}

impl SharedSpool {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(tempfile::SpooledTempFile::new(
                magpie_stream::primitives::DEFAULT_HIGH_WATER,
            ))),
        }
    }

    fn into_reader(self) -> Result<(u64, SpoolReader)> {
        let mut spool = self
            .inner
            .lock()
            .map_err(|_| anyhow!("spool poisoned"))?;
        let size = spool.seek(SeekFrom::End(0))?;
        spool.seek(SeekFrom::Start(0))?;
        drop(spool);
        Ok((size, SpoolReader { inner: self.inner }))
    }
}

impl Stream for SharedSpool {
    fn can_write(&self) -> bool {
        true
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut spool = self
            .inner
            .lock()
            .map_err(|_| anyhow!("spool poisoned"))?;
        spool.write(buf).context("spool write failed")
    }

    fn size(&self) -> Result<u64> {
        let mut spool = self.inner.lock().map_err(|_| anyhow!("spool poisoned"))?;
        let pos = spool.seek(SeekFrom::Current(0))?;
        let end = spool.seek(SeekFrom::End(0))?;
        spool.seek(SeekFrom::Start(pos))?;
        Ok(end)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct SpoolReader {
    inner: Arc<Mutex<tempfile::SpooledTempFile>>,
}

impl Read for SpoolReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut spool = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::other("spool poisoned"))?;
        spool.read(buf)
    }
}
