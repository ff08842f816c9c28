//! Loose ref enumeration and resolution.
//!
//! This is the slice of the ref database the core consumes: reading and
//! enumerating the loose files under `refs/heads`, `refs/mirrors` and
//! `refs/remotes`.  Each file holds one commit checksum in hex.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use fn_error_context::context;

use crate::checksum::Checksum;
use crate::repo::Repo;

/// Split a refspec into its optional remote component and the ref name.
/// `origin:main` → `(Some("origin"), "main")`; a lone ref has no remote.
pub fn parse_refspec(refspec: &str) -> (Option<&str>, &str) {
    match refspec.split_once(':') {
        Some((remote, rest)) if !remote.is_empty() && !remote.contains('/') => {
            (Some(remote), rest)
        }
        _ => (None, refspec),
    }
}

fn walk_refs(
    dir: &Dir,
    base: &Utf8Path,
    out: &mut BTreeMap<String, Checksum>,
) -> Result<()> {
    for entry in dir.entries()? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let path = if base.as_str().is_empty() {
            Utf8PathBuf::from(name)
        } else {
            base.join(name)
        };
        let ftype = entry.file_type()?;
        if ftype.is_dir() {
            walk_refs(&dir.open_dir(name)?, &path, out)?;
        } else {
            let data = dir
                .read_to_string(name)
                .with_context(|| format!("reading ref {path}"))?;
            let checksum = Checksum::parse(data.trim())
                .with_context(|| format!("parsing ref {path}"))?;
            out.insert(path.into_string(), checksum);
        }
    }
    Ok(())
}

impl Repo {
    fn refs_subdir(&self, name: &str) -> Result<Option<Dir>> {
        crate::optional(self.repo_dir().open_dir(name)).map_err(Into::into)
    }

    /// Enumerate local refs (`refs/heads`), keyed by ref name.
    #[context("Listing refs")]
    pub fn list_refs(&self) -> Result<BTreeMap<String, Checksum>> {
        let mut out = BTreeMap::new();
        if let Some(heads) = self.refs_subdir("refs/heads")? {
            walk_refs(&heads, Utf8Path::new(""), &mut out)?;
        }
        Ok(out)
    }

    /// Enumerate mirrored collection refs (`refs/mirrors/<collection-id>/…`),
    /// keyed by `(collection id, ref name)`.
    #[context("Listing collection refs")]
    pub fn list_mirror_refs(&self) -> Result<BTreeMap<(String, String), Checksum>> {
        let mut out = BTreeMap::new();
        let Some(mirrors) = self.refs_subdir("refs/mirrors")? else {
            return Ok(out);
        };
        for entry in mirrors.entries()? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let collection = entry.file_name();
            let Some(collection) = collection.to_str() else {
                continue;
            };
            let mut refs = BTreeMap::new();
            walk_refs(&mirrors.open_dir(collection)?, Utf8Path::new(""), &mut refs)?;
            for (name, checksum) in refs {
                out.insert((collection.to_string(), name), checksum);
            }
        }
        Ok(out)
    }

    /// Resolve one refspec to a commit checksum, or `None` if no such ref.
    /// Remote-tracking refspecs resolve under `refs/remotes`.
    pub fn resolve_rev(&self, refspec: &str) -> Result<Option<Checksum>> {
        let (remote, ref_name) = parse_refspec(refspec);
        let rel = match remote {
            Some(remote) => format!("refs/remotes/{remote}/{ref_name}"),
            None => format!("refs/heads/{ref_name}"),
        };
        let Some(data) = crate::optional(self.repo_dir().read_to_string(&rel))? else {
            return match self.parent() {
                Some(parent) => parent.resolve_rev(refspec),
                None => Ok(None),
            };
        };
        Ok(Some(
            Checksum::parse(data.trim()).with_context(|| format!("parsing ref {rel}"))?,
        ))
    }

    fn write_ref_file(&self, rel: &str, checksum: &Checksum) -> Result<()> {
        self.require_writable()?;
        let path = Utf8Path::new(rel);
        if let Some(parent) = path.parent() {
            self.repo_dir()
                .create_dir_all(parent)
                .with_context(|| format!("creating {parent}"))?;
        }
        let contents = format!("{checksum}\n");
        self.replace_file_contents(self.repo_dir(), rel, contents.as_bytes())
    }

    /// Point `refs/heads/<ref>` at a commit.
    #[context("Writing ref {ref_name}")]
    pub fn set_ref_immediate(&self, ref_name: &str, checksum: &Checksum) -> Result<()> {
        if ref_name.is_empty() || ref_name.starts_with('/') || ref_name.contains("..") {
            return Err(anyhow!("invalid ref name {ref_name:?}"));
        }
        self.write_ref_file(&format!("refs/heads/{ref_name}"), checksum)
    }

    /// Point `refs/mirrors/<collection>/<ref>` at a commit.
    #[context("Writing collection ref {collection}:{ref_name}")]
    pub fn set_collection_ref_immediate(
        &self,
        collection: &str,
        ref_name: &str,
        checksum: &Checksum,
    ) -> Result<()> {
        self.write_ref_file(&format!("refs/mirrors/{collection}/{ref_name}"), checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::RepoMode;
    use camino::Utf8PathBuf;

    #[test]
    fn test_parse_refspec() {
        assert_eq!(parse_refspec("main"), (None, "main"));
        assert_eq!(parse_refspec("origin:main"), (Some("origin"), "main"));
        assert_eq!(
            parse_refspec("origin:exampleos/x86_64/stable"),
            (Some("origin"), "exampleos/x86_64/stable")
        );
        // A slash before the colon means the "remote" is really a path.
        assert_eq!(
            parse_refspec("example/os:stable"),
            (None, "example/os:stable")
        );
    }

    #[test]
    fn test_refs_roundtrip() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(td.path().join("r")).unwrap();
        let repo = Repo::create(&path, RepoMode::BareUserOnly).unwrap();
        let c1 = Checksum::digest(b"1");
        let c2 = Checksum::digest(b"2");
        repo.set_ref_immediate("main", &c1).unwrap();
        repo.set_ref_immediate("exampleos/x86_64/stable", &c2).unwrap();

        assert_eq!(repo.resolve_rev("main").unwrap(), Some(c1));
        assert_eq!(repo.resolve_rev("absent").unwrap(), None);

        let refs = repo.list_refs().unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs["main"], c1);
        assert_eq!(refs["exampleos/x86_64/stable"], c2);

        repo.set_collection_ref_immediate("org.example.Os", "main", &c2)
            .unwrap();
        let mirrors = repo.list_mirror_refs().unwrap();
        assert_eq!(
            mirrors[&("org.example.Os".to_string(), "main".to_string())],
            c2
        );
    }
}
