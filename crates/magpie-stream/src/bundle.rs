//! Bundle entry iteration.
//!
//! Resource bundles are plain tar archives. Entries whose names carry the
//! `xor_` prefix are XOR-masked with a 32-bit key derived from the rest of
//! the name; iteration unmasks both the name and the bytes. Entry readers
//! are forward-only and must be consumed in iteration order, which is what
//! the underlying tar layout gives us for free.

use std::io::Read;

use anyhow::{Context, Result};

use crate::xor::key_from_name;

/// Marker prefix for masked entry names.
pub const XOR_NAME_PREFIX: &str = "xor_";

/// Strip the masking prefix, if any, returning the clean entry name and
/// the mask key derived from it.
pub fn unmask_name(raw: &str) -> (String, Option<u32>) {
    match raw.strip_prefix(XOR_NAME_PREFIX) {
        Some(rest) => (rest.to_string(), Some(key_from_name(rest))),
        None => (raw.to_string(), None),
    }
}

struct XorRead<R: Read> {
    inner: R,
    key: [u8; 4],
    offset: u64,
}

impl<R: Read> Read for XorRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        for b in buf[..n].iter_mut() {
            *b ^= self.key[(self.offset % 4) as usize];
            self.offset += 1;
        }
        Ok(n)
    }
}

/// Walk every regular entry of a bundle, calling `visit` with the unmasked
/// name and a forward-only reader over the unmasked bytes. Return `false`
/// from the visitor to stop early.
pub fn visit_entries<R, F>(reader: R, mut visit: F) -> Result<()>
where
    R: Read,
    F: FnMut(&str, &mut dyn Read) -> Result<bool>,
{
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().context("corrupt bundle: bad header")?;
    for entry in entries {
        let entry = entry.context("corrupt bundle: unreadable entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw_name = entry
            .path()
            .context("corrupt bundle: non-utf8 entry name")?
            .to_string_lossy()
            .into_owned();
        let (name, key) = unmask_name(&raw_name);
        let keep_going = match key {
            Some(key) => {
                let mut masked = XorRead {
                    inner: entry,
                    key: key.to_le_bytes(),
                    offset: 0,
                };
                visit(&name, &mut masked)?
            }
            None => {
                let mut entry = entry;
                visit(&name, &mut entry)?
            }
        };
        if !keep_going {
            break;
        }
    }
    Ok(())
}

/// Names of every regular entry, unmasked, in bundle order.
pub fn entry_names<R: Read>(reader: R) -> Result<Vec<String>> {
    let mut names = Vec::new();
    visit_entries(reader, |name, _| {
        names.push(name.to_string());
        Ok(true)
    })?;
    Ok(names)
}

/// Stream the named entry into `out`. Returns the byte count, or `None`
/// when the bundle holds no such entry. Name matching is against unmasked
/// names.
pub fn extract_entry<R, W>(reader: R, entry_name: &str, out: &mut W) -> Result<Option<u64>>
where
    R: Read,
    W: std::io::Write,
{
    let mut copied: Option<u64> = None;
    visit_entries(reader, |name, data| {
        if name == entry_name {
            let n = std::io::copy(data, out)
                .with_context(|| format!("failed to extract bundle entry {entry_name}"))?;
            copied = Some(n);
            return Ok(false);
        }
        Ok(true)
    })?;
    Ok(copied)
}
