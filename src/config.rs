//! Core repository configuration: parsing and derived policy.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;

use crate::keyfile::KeyFile;
use crate::object::RepoMode;
use crate::RepoError;

/// Default zlib level for archive repositories.
pub(crate) const DEFAULT_ZLIB_LEVEL: u32 = 6;
/// Seconds before abandoned tmp entries are eligible for cleanup.
pub(crate) const DEFAULT_TMP_EXPIRY_SECS: u64 = 86400;

/// Parsed `[core]` settings with defaults applied.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Storage mode; immutable for the repository's lifetime.
    pub mode: RepoMode,
    /// Whether to maintain `uncompressed-objects-cache/` (archive mode only).
    pub enable_uncompressed_cache: bool,
    /// When true, skip data syncs on the write path.
    pub disable_fsync: bool,
    /// When true, skip xattr read/write in bare mode.
    pub disable_xattrs: bool,
    /// TTL for abandoned tmp entries.
    pub tmp_expiry_secs: u64,
    /// zlib level for archive payloads, clamped to `[1, 9]`.
    pub zlib_level: u32,
    /// Reject writes when free space drops below this percentage.
    pub min_free_space_percent: u32,
    /// Collection id advertised in the summary, if configured.
    pub collection_id: Option<String>,
    /// Parent repository chained on read misses, if configured.
    pub parent_path: Option<Utf8PathBuf>,
    /// Whether deleting a commit writes a tombstone object.
    pub tombstone_commits: bool,
}

/// Validate and derive the runtime policy from a parsed config file.
///
/// `writable` gates the uncompressed-objects cache; a read-only open never
/// maintains it.
pub fn parse_core_config(kf: &KeyFile, writable: bool) -> Result<CoreConfig> {
    let version = kf
        .string("core", "repo_version")
        .context("reading core.repo_version")?;
    if version != "1" {
        return Err(RepoError::InvalidConfig(format!("invalid repository version '{version}'")).into());
    }

    if kf.bool_with_default("core", "archive", false)? {
        return Err(RepoError::Unsupported(
            "this version no longer supports \"archive\" repositories; use archive-z2 instead"
                .to_string(),
        )
        .into());
    }

    let mode = RepoMode::from_str(&kf.string_with_default("core", "mode", "bare"))?;

    let enable_uncompressed_cache = if writable {
        kf.bool_with_default("core", "enable-uncompressed-cache", true)?
    } else {
        false
    };

    let disable_fsync = !kf.bool_with_default("core", "fsync", true)?;
    let disable_xattrs = kf.bool_with_default("core", "disable-xattrs", false)?;

    let tmp_expiry_secs = kf
        .string_with_default("core", "tmp-expiry-secs", &DEFAULT_TMP_EXPIRY_SECS.to_string())
        .parse::<u64>()
        .context("parsing core.tmp-expiry-secs")?;

    let zlib_level = match kf.optional_string("archive", "zlib-level")? {
        Some(v) => v
            .parse::<u32>()
            .context("parsing archive.zlib-level")?
            .clamp(1, 9),
        None => DEFAULT_ZLIB_LEVEL,
    };

    let min_free_space_percent = kf
        .string_with_default("core", "min-free-space-percent", "3")
        .parse::<u32>()
        .context("parsing core.min-free-space-percent")?;
    if min_free_space_percent > 99 {
        return Err(RepoError::InvalidConfig(format!(
            "invalid min-free-space-percent '{min_free_space_percent}'"
        ))
        .into());
    }

    let collection_id = kf.optional_string("core", "collection-id")?;
    let parent_path = kf
        .optional_string("core", "parent")?
        .filter(|p| !p.is_empty())
        .map(Utf8PathBuf::from);
    let tombstone_commits = kf.bool_with_default("core", "tombstone-commits", false)?;

    Ok(CoreConfig {
        mode,
        enable_uncompressed_cache,
        disable_fsync,
        disable_xattrs,
        tmp_expiry_secs,
        zlib_level,
        min_free_space_percent,
        collection_id,
        parent_path,
        tombstone_commits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RepoError;
    use indoc::indoc;

    #[test]
    fn test_defaults() {
        let kf = KeyFile::parse("[core]\nrepo_version=1\nmode=bare\n").unwrap();
        let c = parse_core_config(&kf, true).unwrap();
        assert_eq!(c.mode, RepoMode::Bare);
        assert!(c.enable_uncompressed_cache);
        assert!(!c.disable_fsync);
        assert!(!c.disable_xattrs);
        assert_eq!(c.tmp_expiry_secs, 86400);
        assert_eq!(c.zlib_level, 6);
        assert_eq!(c.min_free_space_percent, 3);
        assert!(c.collection_id.is_none());
        assert!(c.parent_path.is_none());
        assert!(!c.tombstone_commits);
    }

    #[test]
    fn test_version_and_mode_validation() {
        let kf = KeyFile::parse("[core]\nrepo_version=2\n").unwrap();
        assert!(parse_core_config(&kf, true).is_err());

        let kf = KeyFile::parse("[core]\nrepo_version=1\nmode=sideways\n").unwrap();
        let err = parse_core_config(&kf, true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RepoError>(),
            Some(RepoError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_obsolete_archive_flag() {
        let kf = KeyFile::parse("[core]\nrepo_version=1\narchive=true\n").unwrap();
        let err = parse_core_config(&kf, true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RepoError>(),
            Some(RepoError::Unsupported(_))
        ));
    }

    #[test]
    fn test_derived_settings() {
        let kf = KeyFile::parse(indoc! { "
            [core]
            repo_version=1
            mode=archive-z2
            fsync=false
            min-free-space-percent=10
            collection-id=org.example.Os
            tombstone-commits=true

            [archive]
            zlib-level=42
        " })
        .unwrap();
        let c = parse_core_config(&kf, true).unwrap();
        assert_eq!(c.mode, RepoMode::Archive);
        assert!(c.disable_fsync);
        assert_eq!(c.min_free_space_percent, 10);
        assert_eq!(c.collection_id.as_deref(), Some("org.example.Os"));
        assert!(c.tombstone_commits);
        // out-of-range levels clamp rather than error
        assert_eq!(c.zlib_level, 9);
        // read-only opens never enable the cache
        assert!(!parse_core_config(&kf, false).unwrap().enable_uncompressed_cache);
    }

    #[test]
    fn test_min_free_space_range() {
        let kf =
            KeyFile::parse("[core]\nrepo_version=1\nmin-free-space-percent=100\n").unwrap();
        assert!(parse_core_config(&kf, true).is_err());
    }
}
