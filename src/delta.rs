//! Static delta naming and enumeration.
//!
//! Delta generation and application belong to the delta codec; the store
//! only needs to name deltas on disk and enumerate them for the summary.
//! A delta between FROM and TO lives at
//! `deltas/<xx>/<rest>/` where `<xx><rest>` is the modified-base64 form of
//! the binary checksums (`/` replaced by `_`), `<from>-<to>` for deltas with
//! a source and just `<to>` for deltas from scratch.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD_NO_PAD};
use camino::Utf8PathBuf;
use fn_error_context::context;

use crate::checksum::Checksum;
use crate::repo::Repo;

/// The superblock file within a delta directory.
pub const SUPERBLOCK: &str = "superblock";

/// Modified base64 of a binary checksum: standard alphabet, no padding,
/// with `/` swapped for `_` so the result is path-safe.
pub fn checksum_to_b64(checksum: &Checksum) -> String {
    BASE64_STANDARD_NO_PAD
        .encode(checksum.as_bytes())
        .replace('/', "_")
}

/// Inverse of [`checksum_to_b64`].
pub fn b64_to_checksum(s: &str) -> Result<Checksum> {
    let bytes = BASE64_STANDARD_NO_PAD
        .decode(s.replace('_', "/"))
        .map_err(|e| anyhow!("invalid base64 checksum {s:?}: {e}"))?;
    Checksum::from_slice(&bytes)
}

/// Parse a delta name, `FROM-TO` or just `TO` in hex.
pub fn parse_delta_name(name: &str) -> Result<(Option<Checksum>, Checksum)> {
    match name.split_once('-') {
        Some((from, to)) => Ok((Some(Checksum::parse(from)?), Checksum::parse(to)?)),
        None => Ok((None, Checksum::parse(name)?)),
    }
}

/// Relative path of a delta directory under the repository root.
pub fn delta_relpath(from: Option<&Checksum>, to: &Checksum) -> Utf8PathBuf {
    let name = match from {
        Some(from) => format!("{}-{}", checksum_to_b64(from), checksum_to_b64(to)),
        None => checksum_to_b64(to),
    };
    format!("deltas/{}/{}", &name[..2], &name[2..]).into()
}

impl Repo {
    /// Enumerate static delta names (hex `FROM-TO` / `TO` forms).
    #[context("Listing static deltas")]
    pub fn list_static_delta_names(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let Some(deltas) = crate::optional(self.repo_dir().open_dir("deltas"))? else {
            return Ok(out);
        };
        for outer in deltas.entries()? {
            let outer = outer?;
            let prefix = outer.file_name();
            let Some(prefix) = prefix.to_str() else { continue };
            if prefix.len() != 2 || !outer.file_type()?.is_dir() {
                continue;
            }
            let outer_dir = deltas.open_dir(prefix)?;
            for inner in outer_dir.entries()? {
                let inner = inner?;
                let rest = inner.file_name();
                let Some(rest) = rest.to_str() else { continue };
                if !inner.file_type()?.is_dir() {
                    continue;
                }
                let mangled = format!("{prefix}{rest}");
                let name = match mangled.split_once('-') {
                    Some((from, to)) => {
                        let (Ok(from), Ok(to)) = (b64_to_checksum(from), b64_to_checksum(to))
                        else {
                            continue;
                        };
                        format!("{from}-{to}")
                    }
                    None => match b64_to_checksum(&mangled) {
                        Ok(to) => to.to_hex(),
                        Err(_) => continue,
                    },
                };
                out.push(name);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Digest every delta superblock, keyed by delta name; the summary
    /// advertises these.
    pub(crate) fn static_delta_superblock_digests(
        &self,
    ) -> Result<BTreeMap<String, Checksum>> {
        let mut out = BTreeMap::new();
        for name in self.list_static_delta_names()? {
            let (from, to) = parse_delta_name(&name)?;
            let path = delta_relpath(from.as_ref(), &to).join(SUPERBLOCK);
            let data = self
                .repo_dir()
                .read(&path)
                .with_context(|| format!("reading {path}"))?;
            out.insert(name, Checksum::digest(&data));
        }
        Ok(out)
    }
}
