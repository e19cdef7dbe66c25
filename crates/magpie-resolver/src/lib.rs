//! Resource resolution for magpie.
//!
//! Collection tools and ancillary data can ship inside a *bundle*: a tar
//! blob either appended to the orchestrator's own binary (terminated by a
//! footer, see [`footer`]) or carried as a side file. Given a
//! [`ResourceRef`], the resolver streams the referenced payload out of its
//! bundle into a scratch directory the caller owns and hands back the
//! concrete path.
//!
//! Extraction is memoised per resolver instance: resolving the same
//! reference twice returns the cached path, and a failed extraction is
//! remembered so later calls fail fast without touching the bundle again.
//! Dropping the resolver removes every file it extracted.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use magpie_stream::bundle;
use magpie_types::{ResourceFormat, ResourceRef};

/// Bundle footer handling: `[u64 little-endian bundle length][b"MAGPKG01"]`
/// at the very end of the carrying file.
pub mod footer {
    use super::*;

    /// Trailing magic identifying an embedded bundle.
    pub const MAGIC: &[u8; 8] = b"MAGPKG01";
    /// Footer length in bytes: length field plus magic.
    pub const LEN: u64 = 16;

    /// Read the bundle embedded in `image`, if any.
    pub fn read_bundle(image: &Path) -> Result<Option<Vec<u8>>> {
        let mut file = fs::File::open(image)
            .with_context(|| format!("failed to open image {}", image.display()))?;
        let total = file.metadata()?.len();
        if total < LEN {
            return Ok(None);
        }

        file.seek(SeekFrom::End(-(LEN as i64)))?;
        let mut trailer = [0u8; 16];
        file.read_exact(&mut trailer)?;
        if &trailer[8..] != MAGIC {
            return Ok(None);
        }

        let bundle_len = u64::from_le_bytes([
            trailer[0], trailer[1], trailer[2], trailer[3], trailer[4], trailer[5], trailer[6],
            trailer[7],
        ]);
        if bundle_len > total - LEN {
            anyhow::bail!(
                "corrupt bundle footer in {}: declared length {} exceeds file",
                image.display(),
                bundle_len
            );
        }

        file.seek(SeekFrom::End(-((LEN + bundle_len) as i64)))?;
        let mut data = vec![0u8; bundle_len as usize];
        file.read_exact(&mut data)?;
        Ok(Some(data))
    }

    /// Append `data` plus a footer to `image`. Used by the packaging step
    /// that turns a bare orchestrator binary into a self-contained one.
    pub fn append_bundle(image: &Path, data: &[u8]) -> Result<()> {
        use std::io::Write;

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(image)
            .with_context(|| format!("failed to open image {} for append", image.display()))?;
        file.write_all(data)?;
        file.write_all(&(data.len() as u64).to_le_bytes())?;
        file.write_all(MAGIC)?;
        Ok(())
    }
}

/// Why a reference could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The module has no bundle, or the bundle has no such entry.
    NotFound(String),
    /// The bundle exists but its container structure fails validation.
    /// Terminal for the reference; the resolver never retries.
    CorruptBundle(String),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::NotFound(what) => write!(f, "resource not found: {what}"),
            ResolveError::CorruptBundle(what) => write!(f, "corrupt bundle: {what}"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Resolves embedded references to extracted files in a scratch directory.
pub struct ResourceResolver {
    scratch: PathBuf,
    self_bundle: Option<PathBuf>,
    bundles: HashMap<String, Option<Vec<u8>>>,
    resolved: HashMap<ResourceRef, Option<PathBuf>>,
    extracted: Vec<PathBuf>,
}

impl ResourceResolver {
    /// A resolver extracting into `scratch`. The `self` module resolves
    /// against the orchestrator's own image unless overridden.
    pub fn new(scratch: &Path) -> Self {
        Self {
            scratch: scratch.to_path_buf(),
            self_bundle: None,
            bundles: HashMap::new(),
            resolved: HashMap::new(),
            extracted: Vec::new(),
        }
    }

    /// Use `path` as the bundle for the `self` module instead of the
    /// running binary (`--bundle`).
    pub fn with_self_bundle(mut self, path: &Path) -> Self {
        self.self_bundle = Some(path.to_path_buf());
        self
    }

    /// Resolve `reference` to a concrete extracted path.
    ///
    /// Results (including failures) are memoised for the lifetime of this
    /// resolver.
    pub fn resolve(&mut self, reference: &ResourceRef) -> Result<PathBuf, ResolveError> {
        if let Some(memo) = self.resolved.get(reference) {
            return match memo {
                Some(path) => Ok(path.clone()),
                None => Err(ResolveError::NotFound(reference.to_string())),
            };
        }

        let outcome = self.extract(reference);
        match &outcome {
            Ok(path) => {
                self.resolved.insert(reference.clone(), Some(path.clone()));
                self.extracted.push(path.clone());
            }
            Err(_) => {
                // Failures memoise as an empty slot; later calls report
                // NotFound without re-reading the bundle.
                self.resolved.insert(reference.clone(), None);
            }
        }
        outcome
    }

    /// Remove every file this resolver extracted. Called by `Drop`.
    pub fn release_all(&mut self) {
        for path in self.extracted.drain(..) {
            if let Ok(meta) = fs::metadata(&path) {
                let mut perms = meta.permissions();
                if perms.readonly() {
                    #[allow(clippy::permissions_set_readonly_false)]
                    perms.set_readonly(false);
                    fs::set_permissions(&path, perms).ok();
                }
            }
            fs::remove_file(&path).ok();
        }
        self.resolved.clear();
    }

    fn bundle_bytes(&mut self, module: &str) -> Result<&[u8], ResolveError> {
        if !self.bundles.contains_key(module) {
            let loaded = self.load_bundle(module)?;
            self.bundles.insert(module.to_string(), loaded);
        }
        match self.bundles.get(module).and_then(|b| b.as_deref()) {
            Some(bytes) => Ok(bytes),
            None => Err(ResolveError::NotFound(format!("module {module}"))),
        }
    }

    fn load_bundle(&self, module: &str) -> Result<Option<Vec<u8>>, ResolveError> {
        if module == "self" {
            let image = match &self.self_bundle {
                Some(path) => path.clone(),
                None => std::env::current_exe().map_err(|e| {
                    ResolveError::NotFound(format!("cannot locate own image: {e}"))
                })?,
            };
            // A side bundle file is raw tar; the running image carries the
            // bundle behind a footer.
            if self.self_bundle.is_some() {
                let data = fs::read(&image).map_err(|e| {
                    ResolveError::NotFound(format!("bundle {}: {e}", image.display()))
                })?;
                return Ok(Some(data));
            }
            return footer::read_bundle(&image)
                .map_err(|e| ResolveError::CorruptBundle(format!("{e:#}")));
        }

        let path = Path::new(module);
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) => Err(ResolveError::NotFound(format!("module {module}: {e}"))),
        }
    }

    fn extract(&mut self, reference: &ResourceRef) -> Result<PathBuf, ResolveError> {
        let scratch = self.scratch.clone();
        let format = reference.format;
        let name = reference.name.clone();
        let inner = reference.inner.clone();
        let bytes = self.bundle_bytes(&reference.module)?.to_vec();

        fs::create_dir_all(&scratch)
            .map_err(|e| ResolveError::NotFound(format!("scratch {}: {e}", scratch.display())))?;

        let (payload_name, data) = match format {
            ResourceFormat::Binary => {
                let data = read_entry(&bytes, &name, reference)?;
                (name, data)
            }
            ResourceFormat::Bundle => {
                let inner_name = inner.ok_or_else(|| {
                    ResolveError::NotFound(format!("{reference}: bundle reference without inner entry"))
                })?;
                let nested = read_entry(&bytes, &name, reference)?;
                let data = read_entry(&nested, &inner_name, reference)?;
                (inner_name, data)
            }
        };

        let dest = scratch.join(&payload_name);
        write_readonly(&dest, &data)
            .map_err(|e| ResolveError::NotFound(format!("{}: {e:#}", dest.display())))?;
        Ok(dest)
    }
}

impl Drop for ResourceResolver {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn read_entry(
    bundle_bytes: &[u8],
    entry: &str,
    reference: &ResourceRef,
) -> Result<Vec<u8>, ResolveError> {
    let mut data = Vec::new();
    match bundle::extract_entry(bundle_bytes, entry, &mut data) {
        Ok(Some(_)) => Ok(data),
        Ok(None) => Err(ResolveError::NotFound(reference.to_string())),
        Err(e) => Err(ResolveError::CorruptBundle(format!("{reference}: {e:#}"))),
    }
}

fn write_readonly(dest: &Path, data: &[u8]) -> Result<()> {
    fs::write(dest, data).with_context(|| format!("failed to write {}", dest.display()))?;

    let mut perms = fs::metadata(dest)?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Extracted tools must be runnable; keep them read-only otherwise.
        perms.set_mode(0o555);
    }
    #[cfg(not(unix))]
    perms.set_readonly(true);
    fs::set_permissions(dest, perms)
        .with_context(|| format!("failed to set permissions on {}", dest.display()))?;
    Ok(())
}
