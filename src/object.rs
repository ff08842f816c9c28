//! Object identity: types, repository modes, and the loose-path layout.

use std::fmt;

use anyhow::{anyhow, Result};
use camino::Utf8PathBuf;

use crate::checksum::Checksum;
use crate::RepoError;

/// The kinds of objects a repository stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectType {
    /// Regular file or symlink content plus metadata.
    File,
    /// A serialized directory listing.
    DirTree,
    /// Directory ownership/mode/xattrs.
    DirMeta,
    /// A commit.
    Commit,
    /// Detached metadata (e.g. signatures) for a commit.
    CommitMeta,
    /// A marker recording the prior existence of a deleted commit.
    TombstoneCommit,
}

impl ObjectType {
    /// The type tag used in loose file extensions and object names.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::File => "file",
            ObjectType::DirTree => "dirtree",
            ObjectType::DirMeta => "dirmeta",
            ObjectType::Commit => "commit",
            ObjectType::CommitMeta => "commitmeta",
            ObjectType::TombstoneCommit => "tombstone-commit",
        }
    }

    /// Parse a type tag; the inverse of [`Self::as_str`].
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "file" => ObjectType::File,
            "dirtree" => ObjectType::DirTree,
            "dirmeta" => ObjectType::DirMeta,
            "commit" => ObjectType::Commit,
            "commitmeta" => ObjectType::CommitMeta,
            "tombstone-commit" => ObjectType::TombstoneCommit,
            _ => return None,
        })
    }

    /// Whether objects of this type are metadata (identical across storage
    /// modes), as opposed to file content.
    pub fn is_meta(&self) -> bool {
        !matches!(self, ObjectType::File)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a repository stores file content; chosen at creation and immutable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepoMode {
    /// Files stored with their original uid/gid/mode/xattrs.
    Bare,
    /// Files owned by the current user; original metadata in an xattr.
    BareUser,
    /// Files owned by the current user; no metadata preservation.
    BareUserOnly,
    /// Files stored as zlib-compressed framed blobs.
    Archive,
}

impl RepoMode {
    /// The config-file spelling of this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoMode::Bare => "bare",
            RepoMode::BareUser => "bare-user",
            RepoMode::BareUserOnly => "bare-user-only",
            RepoMode::Archive => "archive-z2",
        }
    }

    /// Parse a mode from its config spelling.  `archive` is accepted as an
    /// alias for `archive-z2`.
    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "bare" => RepoMode::Bare,
            "bare-user" => RepoMode::BareUser,
            "bare-user-only" => RepoMode::BareUserOnly,
            "archive-z2" | "archive" => RepoMode::Archive,
            o => {
                return Err(RepoError::InvalidConfig(format!(
                    "invalid mode '{o}' in repository configuration"
                ))
                .into())
            }
        })
    }

    /// Whether file objects are stored as plain files (any of the bare modes).
    pub fn is_bare(&self) -> bool {
        !matches!(self, RepoMode::Archive)
    }

    /// The loose-file extension for the given object type in this mode.
    pub fn loose_extension(&self, objtype: ObjectType) -> &'static str {
        match (objtype, self) {
            (ObjectType::File, RepoMode::Archive) => "filez",
            (t, _) => t.as_str(),
        }
    }
}

/// An object name as used in enumeration results and external APIs: the
/// canonical `(checksum, type)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectName {
    /// The object checksum.
    pub checksum: Checksum,
    /// The object type.
    pub objtype: ObjectType,
}

impl ObjectName {
    /// Construct from parts.
    pub fn new(checksum: Checksum, objtype: ObjectType) -> Self {
        Self { checksum, objtype }
    }

    /// Parse the serialized `<checksum>.<type>` form.
    pub fn parse(s: &str) -> Result<Self> {
        let (csum, ty) = s
            .split_once('.')
            .ok_or_else(|| anyhow!("invalid object name {s}"))?;
        let objtype =
            ObjectType::from_str(ty).ok_or_else(|| anyhow!("invalid object type {ty}"))?;
        Ok(Self {
            checksum: Checksum::parse(csum)?,
            objtype,
        })
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.checksum, self.objtype)
    }
}

/// Compute the loose path of an object relative to `objects/`:
/// `<first two hex digits>/<remaining 62>.<extension>`.
pub fn loose_path(checksum: &Checksum, objtype: ObjectType, mode: RepoMode) -> Utf8PathBuf {
    let hex = checksum.to_hex();
    format!("{}/{}.{}", &hex[..2], &hex[2..], mode.loose_extension(objtype)).into()
}

/// Iterate the 256 two-hex-digit object directory prefixes.
pub fn loose_prefixes() -> impl Iterator<Item = String> {
    (0u32..256).map(|c| format!("{c:02x}"))
}

/// Parse a loose file name (within a prefix directory) back into an object
/// name; returns `None` for names that are not objects of this mode.
pub(crate) fn parse_loose_name(prefix: &str, name: &str, mode: RepoMode) -> Option<ObjectName> {
    let (stem, ext) = name.rsplit_once('.')?;
    let objtype = match ext {
        "filez" if mode == RepoMode::Archive => ObjectType::File,
        "file" if mode.is_bare() => ObjectType::File,
        "dirtree" => ObjectType::DirTree,
        "dirmeta" => ObjectType::DirMeta,
        "commit" => ObjectType::Commit,
        "commitmeta" => ObjectType::CommitMeta,
        "tombstone-commit" => ObjectType::TombstoneCommit,
        _ => return None,
    };
    if stem.len() != 62 {
        return None;
    }
    Checksum::parse(&format!("{prefix}{stem}"))
        .ok()
        .map(|checksum| ObjectName { checksum, objtype })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSUM: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    #[test]
    fn test_mode_strings() {
        for mode in [
            RepoMode::Bare,
            RepoMode::BareUser,
            RepoMode::BareUserOnly,
            RepoMode::Archive,
        ] {
            assert_eq!(RepoMode::from_str(mode.as_str()).unwrap(), mode);
        }
        assert_eq!(RepoMode::from_str("archive").unwrap(), RepoMode::Archive);
        assert!(RepoMode::from_str("bare-split-xattrs").is_err());
    }

    #[test]
    fn test_loose_path() {
        let c = Checksum::parse(CSUM).unwrap();
        assert_eq!(
            loose_path(&c, ObjectType::Commit, RepoMode::Bare).as_str(),
            format!("58/{}.commit", &CSUM[2..])
        );
        assert_eq!(
            loose_path(&c, ObjectType::File, RepoMode::Archive).as_str(),
            format!("58/{}.filez", &CSUM[2..])
        );
        assert_eq!(
            loose_path(&c, ObjectType::File, RepoMode::BareUser).as_str(),
            format!("58/{}.file", &CSUM[2..])
        );
    }

    #[test]
    fn test_parse_loose_name() {
        let name = format!("{}.file", &CSUM[2..]);
        let parsed = parse_loose_name("58", &name, RepoMode::Bare).unwrap();
        assert_eq!(parsed.checksum.to_hex(), CSUM);
        assert_eq!(parsed.objtype, ObjectType::File);
        // filez objects are only valid in archive mode
        let namez = format!("{}.filez", &CSUM[2..]);
        assert!(parse_loose_name("58", &namez, RepoMode::Bare).is_none());
        assert!(parse_loose_name("58", &namez, RepoMode::Archive).is_some());
        // truncated checksum
        assert!(parse_loose_name("58", "abc.commit", RepoMode::Bare).is_none());
    }

    #[test]
    fn test_object_name_roundtrip() {
        let n = ObjectName::parse(&format!("{CSUM}.dirtree")).unwrap();
        assert_eq!(n.to_string(), format!("{CSUM}.dirtree"));
    }

    #[test]
    fn test_prefixes() {
        let v: Vec<_> = loose_prefixes().collect();
        assert_eq!(v.len(), 256);
        assert_eq!(v[0], "00");
        assert_eq!(v[255], "ff");
    }
}
