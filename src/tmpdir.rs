//! Per-boot staging directories under `tmp/`.
//!
//! New objects are staged in `tmp/staging-<boot-id>-<random>/` and renamed
//! into `objects/` at transaction commit.  The boot id prefix is the
//! crash-safety discipline: a leftover staging directory from another boot
//! may contain data that never reached stable storage, so it is discarded
//! rather than reused.  Each staging directory is owned via a non-blocking
//! `flock` on a sibling `<name>-lock` file; the lock lives outside the
//! directory so it can still be held while the directory is unlinked.

use std::fs::File;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use cap_std_ext::cap_std::fs::{Dir, MetadataExt, OpenOptions};
use fn_error_context::context;
use rustix::fs::FlockOperation;

/// Prefix for transaction staging directories (boot id appended).
pub(crate) const STAGING_PREFIX: &str = "staging-";
/// Prefix for pull scratch directories.
pub(crate) const FETCHER_PREFIX: &str = "fetcher-";

const LOCK_SUFFIX: &str = "-lock";

/// Whether a tmp entry participates in the lock-owned tmpdir protocol.
pub(crate) fn is_locked_tmpdir(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX) || name.starts_with(FETCHER_PREFIX)
}

/// Discover the current boot id, honoring the `OSTREE_BOOTID` override.
pub(crate) fn boot_id() -> Result<String> {
    if let Ok(v) = std::env::var("OSTREE_BOOTID") {
        return Ok(v);
    }
    let v = std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .context("reading /proc/sys/kernel/random/boot_id")?;
    Ok(v.trim_end_matches('\n').to_string())
}

/// A held `flock` on a tmpdir's lock file; released on drop.
pub(crate) struct TmpdirLock {
    _file: File,
}

/// An allocated, locked tmpdir.
pub(crate) struct AllocatedTmpdir {
    /// The directory name under `tmp/`.
    pub name: String,
    /// An open handle on the directory.
    pub dir: Dir,
    /// Whether an existing directory was reused.
    pub reused: bool,
    /// The held lock.
    #[allow(dead_code)]
    pub lock: TmpdirLock,
}

/// Try to take the lock protecting `name`; `None` means a contender holds it.
fn try_lock_tmpdir(tmp_dir: &Dir, name: &str) -> Result<Option<TmpdirLock>> {
    let lock_name = format!("{name}{LOCK_SUFFIX}");
    let mut opts = OpenOptions::new();
    opts.create(true).write(true);
    let f = tmp_dir
        .open_with(&lock_name, &opts)
        .with_context(|| format!("opening lock file {lock_name}"))?;
    let f = f.into_std();
    match rustix::fs::flock(&f, FlockOperation::NonBlockingLockExclusive) {
        Ok(()) => Ok(Some(TmpdirLock { _file: f })),
        Err(rustix::io::Errno::WOULDBLOCK) => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context(format!("locking {lock_name}"))),
    }
}

fn random_name(prefix: &str) -> Result<String> {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut buf = [0u8; 6];
    rustix::rand::getrandom(&mut buf, rustix::rand::GetRandomFlags::empty())
        .context("getrandom")?;
    let suffix: String = buf
        .iter()
        .map(|b| CHARS[*b as usize % CHARS.len()] as char)
        .collect();
    Ok(format!("{prefix}{suffix}"))
}

fn touch(dir: &Dir) -> Result<()> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
    let ts = rustix::fs::Timespec {
        tv_sec: now.as_secs() as _,
        tv_nsec: now.subsec_nanos() as _,
    };
    rustix::fs::futimens(
        dir,
        &rustix::fs::Timestamps {
            last_access: ts,
            last_modification: ts,
        },
    )
    .context("futimens")?;
    Ok(())
}

/// Allocate a locked tmpdir with the given prefix, reusing an existing one
/// whose lock is free, else creating a fresh one.
#[context("Allocating tmpdir {prefix}")]
pub(crate) fn allocate_tmpdir(tmp_dir: &Dir, prefix: &str) -> Result<AllocatedTmpdir> {
    debug_assert!(is_locked_tmpdir(prefix));

    // Reuse pass: any same-prefix directory whose lock we can take.
    for entry in tmp_dir.entries().context("reading tmp/")? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(prefix) || name.ends_with(LOCK_SUFFIX) {
            continue;
        }
        let dir = match tmp_dir.open_dir(name) {
            Ok(d) => d,
            // Raced with removal, or a stray non-directory
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound
                    || e.raw_os_error() == Some(libc::ENOTDIR) =>
            {
                continue
            }
            Err(e) => return Err(e).with_context(|| format!("opening tmp/{name}")),
        };
        let Some(lock) = try_lock_tmpdir(tmp_dir, name)? else {
            continue;
        };
        // Keep cleanup from treating the reused directory as abandoned.
        touch(&dir)?;
        tracing::trace!("reusing tmpdir {name}");
        return Ok(AllocatedTmpdir {
            name: name.to_string(),
            dir,
            reused: true,
            lock,
        });
    }

    // Fresh directory; retry if another process races us to its lock.
    loop {
        let name = random_name(prefix)?;
        match tmp_dir.create_dir(&name) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e).with_context(|| format!("creating tmp/{name}")),
        }
        let dir = tmp_dir
            .open_dir(&name)
            .with_context(|| format!("opening tmp/{name}"))?;
        let Some(lock) = try_lock_tmpdir(tmp_dir, &name)? else {
            continue;
        };
        tracing::trace!("created tmpdir {name}");
        return Ok(AllocatedTmpdir {
            name,
            dir,
            reused: false,
            lock,
        });
    }
}

/// Clean `tmp/` on open: discard staging directories from other boots and
/// anything unlocked that has outlived the expiry.
#[context("Cleaning tmp/")]
pub(crate) fn cleanup_tmpdir(tmp_dir: &Dir, stagedir_prefix: &str, expiry_secs: u64) -> Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    for entry in tmp_dir.entries().context("reading tmp/")? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str().map(|s| s.to_string()) else {
            continue;
        };
        if name == "cache" {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("stat tmp/{name}")),
        };
        if is_locked_tmpdir(&name) {
            if name.ends_with(LOCK_SUFFIX) {
                // Handled alongside its directory; orphans are rewritten by
                // the next allocation with the same name.
                continue;
            }
            // Current-boot staging directories are valid for reuse.
            if name.starts_with(stagedir_prefix) {
                continue;
            }
            match try_lock_tmpdir(tmp_dir, &name)? {
                Some(_lock) => {
                    tracing::debug!("removing stale tmpdir {name}");
                    tmp_dir
                        .remove_dir_all(&name)
                        .with_context(|| format!("removing tmp/{name}"))?;
                    crate::optional(tmp_dir.remove_file(format!("{name}{LOCK_SUFFIX}")))
                        .with_context(|| format!("removing tmp/{name}{LOCK_SUFFIX}"))?;
                }
                None => continue,
            }
        } else if now.saturating_sub(meta.mtime()) > expiry_secs as i64 {
            tracing::debug!("removing expired tmp entry {name}");
            if meta.is_dir() {
                tmp_dir.remove_dir_all(&name)
            } else {
                tmp_dir.remove_file(&name)
            }
            .with_context(|| format!("removing tmp/{name}"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::cap_std;

    fn tempdir() -> cap_std_ext::cap_tempfile::TempDir {
        cap_std_ext::cap_tempfile::TempDir::new(cap_std::ambient_authority()).unwrap()
    }

    #[test]
    fn test_allocate_is_mutually_exclusive() {
        let td = tempdir();
        let a = allocate_tmpdir(&td, "staging-feed-").unwrap();
        assert!(!a.reused);
        // The first directory is locked, so a second allocator gets a new one.
        let b = allocate_tmpdir(&td, "staging-feed-").unwrap();
        assert!(!b.reused);
        assert_ne!(a.name, b.name);

        // After releasing, the next allocation reuses one of them.
        drop(a);
        let c = allocate_tmpdir(&td, "staging-feed-").unwrap();
        assert!(c.reused);
    }

    #[test]
    fn test_prefix_isolation() {
        let td = tempdir();
        let a = allocate_tmpdir(&td, "staging-boot1-").unwrap();
        drop(a);
        let b = allocate_tmpdir(&td, "staging-boot2-").unwrap();
        assert!(!b.reused);
    }

    #[test]
    fn test_cleanup_discards_other_boots() {
        let td = tempdir();
        let stale = allocate_tmpdir(&td, "staging-oldboot-").unwrap();
        let name = stale.name.clone();
        stale.dir.write("partial.commit", b"junk").unwrap();
        drop(stale);

        cleanup_tmpdir(&td, "staging-newboot-", 86400).unwrap();
        assert!(!td.try_exists(&name).unwrap());

        // A locked stale directory survives.
        let held = allocate_tmpdir(&td, "staging-oldboot-").unwrap();
        cleanup_tmpdir(&td, "staging-newboot-", 86400).unwrap();
        assert!(td.try_exists(&held.name).unwrap());
    }

    #[test]
    fn test_cleanup_keeps_current_boot() {
        let td = tempdir();
        let cur = allocate_tmpdir(&td, "staging-cur-").unwrap();
        let name = cur.name.clone();
        drop(cur);
        cleanup_tmpdir(&td, "staging-cur-", 86400).unwrap();
        assert!(td.try_exists(&name).unwrap());
    }

    #[test]
    fn test_boot_id_override() {
        std::env::set_var("OSTREE_BOOTID", "feedface");
        assert_eq!(boot_id().unwrap(), "feedface");
        std::env::remove_var("OSTREE_BOOTID");
    }
}
