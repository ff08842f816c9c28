//! The repository handle: open/create, long-lived directory descriptors,
//! transactions, and the dirmeta cache.

use std::collections::HashMap;
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::cap_tempfile::TempFile;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rustix::fs::{Access, AtFlags};

use crate::checksum::Checksum;
use crate::config::{parse_core_config, CoreConfig};
use crate::keyfile::KeyFile;
use crate::object::RepoMode;
use crate::remotes::Remote;
use crate::tmpdir::{self, AllocatedTmpdir};
use crate::variant::DirMeta;
use crate::RepoError;

/// Initial `config` contents written by [`Repo::create`].
const DEFAULT_CONFIG_CONTENTS: &str = "[core]\nrepo_version=1\n";

/// Subdirectories created by [`Repo::create`].
const STATE_DIRS: &[&str] = &[
    "objects",
    "tmp",
    "extensions",
    "state",
    "refs",
    "refs/heads",
    "refs/mirrors",
    "refs/remotes",
];

pub(crate) struct ConfigState {
    pub keyfile: KeyFile,
    pub core: CoreConfig,
}

#[derive(Default)]
struct DirmetaCache {
    refcount: usize,
    map: Option<HashMap<Checksum, DirMeta>>,
}

pub(crate) struct Transaction {
    pub stagedir: AllocatedTmpdir,
}

/// A handle onto a repository.  The handle owns its directory descriptors;
/// the parent repository, if any, is shared.
pub struct Repo {
    path: Utf8PathBuf,
    repo_dir: Dir,
    objects_dir: Dir,
    tmp_dir: Dir,
    #[allow(dead_code)]
    cache_dir: Option<Dir>,
    #[allow(dead_code)]
    uncompressed_objects_dir: Option<Dir>,

    mode: RepoMode,
    writable: bool,
    writable_error: Option<String>,
    owner_uid: u32,
    target_owner: Option<(u32, u32)>,
    stagedir_prefix: String,

    pub(crate) config: Mutex<ConfigState>,
    pub(crate) remotes: Mutex<std::collections::BTreeMap<String, Remote>>,
    dirmeta_cache: Mutex<DirmetaCache>,
    pub(crate) txn: Mutex<Option<Transaction>>,

    parent: Option<Arc<Repo>>,
    sysroot_dir: Option<Utf8PathBuf>,
    remotes_config_dir: Option<Utf8PathBuf>,

    verify_result_hook: Mutex<Option<VerifyResultHook>>,
}

/// Observer invoked after each commit signature verification; registered by
/// the pull engine to surface results as they arrive.
pub type VerifyResultHook =
    Box<dyn Fn(&Checksum, &crate::sign::VerifyResult) + Send + Sync>;

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Repo")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Repo {
    /// Open the repository at `path`.
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Repo> {
        Self::open_with_options(path, None, None)
    }

    /// Open the repository at `path`, with an optional sysroot used to
    /// resolve the per-remote drop-in directory, and an optional override of
    /// that directory.
    #[context("Opening repo")]
    pub fn open_with_options(
        path: impl AsRef<Utf8Path>,
        sysroot_dir: Option<&Utf8Path>,
        remotes_config_dir: Option<&Utf8Path>,
    ) -> Result<Repo> {
        let mut visited = Vec::new();
        Self::open_internal(
            path.as_ref(),
            sysroot_dir.map(|p| p.to_owned()),
            remotes_config_dir.map(|p| p.to_owned()),
            &mut visited,
        )
    }

    /// Open the repository the process is implicitly addressing: the current
    /// directory if it looks like a repository, else `$OSTREE_REPO`, else the
    /// system repository under `sysroot`.
    pub fn open_default(sysroot: &Utf8Path) -> Result<Repo> {
        let cwd = std::env::current_dir().context("getcwd")?;
        let cwd: Utf8PathBuf = cwd.try_into().context("non-UTF-8 cwd")?;
        if cwd.join("objects").is_dir() && cwd.join("config").is_file() {
            return Self::open(&cwd);
        }
        if let Ok(env) = std::env::var("OSTREE_REPO") {
            if !env.is_empty() {
                return Self::open(Utf8Path::new(&env));
            }
        }
        Self::open_with_options(sysroot.join("ostree/repo"), Some(sysroot), None)
    }

    fn open_internal(
        path: &Utf8Path,
        sysroot_dir: Option<Utf8PathBuf>,
        remotes_config_dir: Option<Utf8PathBuf>,
        visited: &mut Vec<Utf8PathBuf>,
    ) -> Result<Repo> {
        let canonical: Utf8PathBuf = path
            .canonicalize()
            .with_context(|| format!("{path}: "))?
            .try_into()
            .context("non-UTF-8 repository path")?;
        if visited.contains(&canonical) {
            return Err(anyhow!(
                "circular parent repository chain detected at {canonical}"
            ));
        }
        visited.push(canonical.clone());

        let boot_id = tmpdir::boot_id()?;
        let stagedir_prefix = format!("{}{}-", tmpdir::STAGING_PREFIX, boot_id);

        let repo_dir = Dir::open_ambient_dir(&canonical, cap_std::ambient_authority())
            .with_context(|| format!("{canonical}: "))?;
        let objects_dir = repo_dir
            .open_dir("objects")
            .context("Opening objects/ directory")?;

        // Latched for later reporting; not an open failure.
        let (writable, writable_error) =
            match rustix::fs::accessat(&objects_dir, ".", Access::WRITE_OK, AtFlags::empty()) {
                Ok(()) => (true, None),
                Err(e) => (false, Some(format!("{canonical}: {e}"))),
            };

        let objects_stat = rustix::fs::fstat(&objects_dir).context("fstat objects/")?;
        let owner_uid = objects_stat.st_uid;
        // When the repository belongs to another user, new objects are
        // chowned to that owner rather than to what their headers say.
        let target_owner = if objects_stat.st_uid != rustix::process::getuid().as_raw()
            || objects_stat.st_gid != rustix::process::getgid().as_raw()
        {
            Some((objects_stat.st_uid, objects_stat.st_gid))
        } else {
            None
        };

        if writable {
            // Recreate tmp/ if someone removed it to free space.
            match repo_dir.create_dir("tmp") {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e).context("mkdir(tmp)"),
            }
        }
        let tmp_dir = repo_dir.open_dir("tmp").context("Opening tmp/")?;
        let cache_dir = if writable {
            repo_dir.create_dir_all("tmp/cache").context("mkdir(tmp/cache)")?;
            Some(tmp_dir.open_dir("cache").context("Opening tmp/cache")?)
        } else {
            None
        };

        let config_data = repo_dir
            .read_to_string("config")
            .with_context(|| format!("{canonical}: reading config"))?;
        let keyfile =
            KeyFile::parse(&config_data).context("Couldn't parse config file")?;
        let core = parse_core_config(&keyfile, writable)?;
        let mode = core.mode;

        let parent = match &core.parent_path {
            Some(parent_path) => {
                let parent = Self::open_internal(
                    parent_path,
                    sysroot_dir.clone(),
                    remotes_config_dir.clone(),
                    visited,
                )
                .with_context(|| {
                    format!("While checking parent repository '{parent_path}': ")
                })?;
                Some(Arc::new(parent))
            }
            None => None,
        };

        let uncompressed_objects_dir = if mode == RepoMode::Archive
            && core.enable_uncompressed_cache
            && writable
        {
            repo_dir
                .create_dir_all("uncompressed-objects-cache")
                .context("mkdir(uncompressed-objects-cache)")?;
            Some(
                repo_dir
                    .open_dir("uncompressed-objects-cache")
                    .context("Opening uncompressed-objects-cache")?,
            )
        } else {
            None
        };

        let repo = Repo {
            path: canonical,
            repo_dir,
            objects_dir,
            tmp_dir,
            cache_dir,
            uncompressed_objects_dir,
            mode,
            writable,
            writable_error,
            owner_uid,
            target_owner,
            stagedir_prefix,
            config: Mutex::new(ConfigState { keyfile, core }),
            remotes: Mutex::new(Default::default()),
            dirmeta_cache: Mutex::new(Default::default()),
            txn: Mutex::new(None),
            parent,
            sysroot_dir,
            remotes_config_dir,
            verify_result_hook: Mutex::new(None),
        };

        crate::remotes::reload_remote_config(&repo)?;

        if repo.writable {
            let expiry = repo.config.lock().unwrap().core.tmp_expiry_secs;
            tmpdir::cleanup_tmpdir(&repo.tmp_dir, &repo.stagedir_prefix, expiry)?;
        }

        tracing::debug!("opened repo at {} mode={:?}", repo.path, repo.mode);
        Ok(repo)
    }

    /// Create the on-disk structure for a repository at `path` (a no-op for
    /// each part that already exists), then open it.  The mode of an
    /// existing repository is retained; a differing `mode` argument is
    /// silently ignored.
    #[context("Creating repo")]
    pub fn create(path: impl AsRef<Utf8Path>, mode: RepoMode) -> Result<Repo> {
        Self::create_with_collection_id(path, mode, None)
    }

    /// As [`Repo::create`], also recording a collection id in the new config.
    pub fn create_with_collection_id(
        path: impl AsRef<Utf8Path>,
        mode: RepoMode,
        collection_id: Option<&str>,
    ) -> Result<Repo> {
        let path = path.as_ref();
        match std::fs::create_dir(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e).with_context(|| format!("mkdir {path}")),
        }
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())
            .with_context(|| format!("{path}: "))?;

        if crate::optional(dir.symlink_metadata("config"))?.is_none() {
            let mut config_data = String::from(DEFAULT_CONFIG_CONTENTS);
            config_data.push_str(&format!("mode={}\n", mode.as_str()));
            if let Some(id) = collection_id {
                config_data.push_str(&format!("collection-id={id}\n"));
            }
            dir.atomic_replace_with("config", |w| -> Result<()> {
                rustix::fs::fchmod(
                    w.get_mut().as_file_mut().as_fd(),
                    rustix::fs::Mode::from_bits_truncate(0o644),
                )
                .context("fchmod")?;
                std::io::Write::write_all(w, config_data.as_bytes())?;
                Ok(())
            })
            .context("writing config")?;
        }

        for elt in STATE_DIRS {
            match dir.create_dir(elt) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e).with_context(|| format!("mkdir {elt}")),
            }
        }

        // Surface missing user-xattr support now rather than on the first
        // object write.
        if mode == RepoMode::BareUser {
            let tmpf = TempFile::new(&dir).context("allocating xattr probe")?;
            crate::content::set_bareuser_metadata(tmpf.as_file(), 0, 0, 0o644, &[])
                .context("repository filesystem does not support user xattrs")?;
        }

        Self::open(path)
    }

    /// The canonicalized repository path.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The storage mode.
    pub fn mode(&self) -> RepoMode {
        self.mode
    }

    /// Whether `objects/` was writable at open time.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Fail with the error latched at open time if the repository is not
    /// writable.
    pub fn require_writable(&self) -> Result<()> {
        if self.writable {
            return Ok(());
        }
        let msg = self
            .writable_error
            .clone()
            .unwrap_or_else(|| self.path.to_string());
        Err(RepoError::NotWritable(msg).into())
    }

    /// The uid owning `objects/`, captured at open.
    pub(crate) fn owner_uid(&self) -> u32 {
        self.owner_uid
    }

    /// The `(uid, gid)` to give new objects when the repository is owned by
    /// a different user; `None` when we are the owner.
    pub(crate) fn target_owner(&self) -> Option<(u32, u32)> {
        self.target_owner
    }

    /// The parent repository consulted on read misses, if configured.
    pub fn parent(&self) -> Option<&Repo> {
        self.parent.as_deref()
    }

    pub(crate) fn repo_dir(&self) -> &Dir {
        &self.repo_dir
    }

    pub(crate) fn objects_dir(&self) -> &Dir {
        &self.objects_dir
    }

    pub(crate) fn tmp_dir(&self) -> &Dir {
        &self.tmp_dir
    }

    pub(crate) fn sysroot_dir(&self) -> Option<&Utf8Path> {
        self.sysroot_dir.as_deref()
    }

    pub(crate) fn remotes_config_dir(&self) -> Option<&Utf8Path> {
        self.remotes_config_dir.as_deref()
    }

    /// A copy of the parsed configuration, for modification and
    /// [`Repo::write_config`].
    pub fn copy_config(&self) -> KeyFile {
        self.config.lock().unwrap().keyfile.clone()
    }

    /// The derived core configuration.
    pub(crate) fn core_config(&self) -> CoreConfig {
        self.config.lock().unwrap().core.clone()
    }

    /// The configured collection id, if any.
    pub fn collection_id(&self) -> Option<String> {
        self.config.lock().unwrap().core.collection_id.clone()
    }

    /// Whether data syncs are disabled on the write path.
    pub fn disable_fsync(&self) -> bool {
        self.config.lock().unwrap().core.disable_fsync
    }

    /// Atomically replace the repository configuration, then reload it and
    /// the remote registry.  The storage mode cannot be changed this way.
    #[context("Writing config")]
    pub fn write_config(&self, keyfile: &KeyFile) -> Result<()> {
        self.require_writable()?;
        let new_core = parse_core_config(keyfile, self.writable)?;
        if new_core.mode != self.mode {
            return Err(RepoError::InvalidConfig(
                "the repository mode is chosen at creation and cannot be changed".to_string(),
            )
            .into());
        }
        self.replace_file_contents(&self.repo_dir, "config", keyfile.to_data().as_bytes())?;
        {
            let mut state = self.config.lock().unwrap();
            state.keyfile = keyfile.clone();
            state.core = new_core;
        }
        crate::remotes::reload_remote_config(self)
    }

    /// Replace `path` under `dir` with `contents`, honoring the fsync policy.
    /// Rename is always used, so observers see whole-file transitions.
    pub(crate) fn replace_file_contents(
        &self,
        dir: &Dir,
        path: &str,
        contents: &[u8],
    ) -> Result<()> {
        let fsync = !self.disable_fsync();
        dir.atomic_replace_with(path, |w| -> Result<()> {
            std::io::Write::write_all(w, contents)?;
            if fsync {
                std::io::Write::flush(w)?;
                rustix::fs::fdatasync(w.get_mut().as_file_mut().as_fd())
                    .context("fdatasync")?;
            }
            Ok(())
        })
        .with_context(|| format!("replacing {path}"))
    }

    /// Touch the repository root's mtime, invalidating summary caches held
    /// by other tooling.
    pub fn update_mtime(&self) -> Result<()> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap();
        let ts = rustix::fs::Timespec {
            tv_sec: now.as_secs() as _,
            tv_nsec: now.subsec_nanos() as _,
        };
        rustix::fs::futimens(
            &self.repo_dir,
            &rustix::fs::Timestamps {
                last_access: ts,
                last_modification: ts,
            },
        )
        .context("futimens")?;
        Ok(())
    }

    // --- transactions -------------------------------------------------------

    /// Begin a transaction: allocate (or reuse) a locked staging directory.
    /// Returns whether an existing staging directory was resumed.
    #[context("Preparing transaction")]
    pub fn prepare_transaction(&self) -> Result<bool> {
        self.require_writable()?;
        let mut txn = self.txn.lock().unwrap();
        if txn.is_some() {
            return Err(anyhow!("a transaction is already in progress"));
        }
        let stagedir = tmpdir::allocate_tmpdir(&self.tmp_dir, &self.stagedir_prefix)?;
        let reused = stagedir.reused;
        *txn = Some(Transaction { stagedir });
        Ok(reused)
    }

    /// Commit the transaction: rename every staged object into `objects/`,
    /// then discard the staging directory.
    #[context("Committing transaction")]
    pub fn commit_transaction(&self) -> Result<()> {
        if test_error_flag("pre-commit") {
            return Err(anyhow!("OSTREE_REPO_TEST_ERROR: pre-commit"));
        }
        let mut txn = self.txn.lock().unwrap();
        let t = txn
            .take()
            .ok_or_else(|| anyhow!("no transaction in progress"))?;
        for entry in t.stagedir.dir.entries().context("reading staging dir")? {
            let entry = entry?;
            let prefix = entry.file_name();
            let Some(prefix) = prefix.to_str().map(|s| s.to_string()) else {
                continue;
            };
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match self.objects_dir.create_dir(&prefix) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e).with_context(|| format!("mkdir objects/{prefix}")),
            }
            let staged = t.stagedir.dir.open_dir(&prefix)?;
            let dest = self.objects_dir.open_dir(&prefix)?;
            for obj in staged.entries()? {
                let obj = obj?;
                let name = obj.file_name();
                let Some(name) = name.to_str().map(|s| s.to_string()) else {
                    continue;
                };
                staged
                    .rename(&name, &dest, &name)
                    .with_context(|| format!("renaming {prefix}/{name}"))?;
            }
        }
        if !self.disable_fsync() {
            rustix::fs::fsync(&self.objects_dir).context("fsync objects/")?;
        }
        self.tmp_dir
            .remove_dir_all(&t.stagedir.name)
            .with_context(|| format!("removing {}", t.stagedir.name))?;
        crate::optional(self.tmp_dir.remove_file(format!("{}-lock", t.stagedir.name)))?;
        tracing::debug!("transaction committed");
        Ok(())
    }

    /// Abandon the transaction.  Staged objects are left in place; the next
    /// allocator pass reclaims or reuses them.
    pub fn abort_transaction(&self) -> Result<()> {
        let mut txn = self.txn.lock().unwrap();
        *txn = None;
        Ok(())
    }

    /// A handle on the open transaction's staging directory, if any.
    pub(crate) fn txn_stagedir(&self) -> Result<Option<Dir>> {
        let txn = self.txn.lock().unwrap();
        match txn.as_ref() {
            Some(t) => Ok(Some(t.stagedir.dir.try_clone()?)),
            None => Ok(None),
        }
    }

    /// Register (or with `None`, clear) the observer called after each
    /// commit signature verification.
    pub fn set_verify_result_hook(&self, hook: Option<VerifyResultHook>) {
        *self.verify_result_hook.lock().unwrap() = hook;
    }

    pub(crate) fn emit_verify_result(&self, checksum: &Checksum, result: &crate::sign::VerifyResult) {
        if let Some(hook) = self.verify_result_hook.lock().unwrap().as_ref() {
            hook(checksum, result);
        }
    }

    // --- dirmeta cache ------------------------------------------------------

    /// Reserve the dirmeta cache.  The cache exists while at least one token
    /// is live; dropping the last token frees it.
    pub fn dirmeta_cache_reservation(&self) -> DirmetaCacheToken<'_> {
        let mut cache = self.dirmeta_cache.lock().unwrap();
        cache.refcount += 1;
        if cache.map.is_none() {
            cache.map = Some(HashMap::new());
        }
        DirmetaCacheToken { repo: self }
    }

    pub(crate) fn dirmeta_cache_lookup(&self, checksum: &Checksum) -> Option<DirMeta> {
        let cache = self.dirmeta_cache.lock().unwrap();
        cache.map.as_ref().and_then(|m| m.get(checksum).cloned())
    }

    pub(crate) fn dirmeta_cache_insert(&self, checksum: Checksum, meta: DirMeta) {
        let mut cache = self.dirmeta_cache.lock().unwrap();
        if let Some(map) = cache.map.as_mut() {
            map.insert(checksum, meta);
        }
    }

    // --- write-path policy --------------------------------------------------

    /// Reject writes when the filesystem is below the configured free-space
    /// threshold.
    pub(crate) fn check_free_space(&self) -> Result<()> {
        let min_percent = self.config.lock().unwrap().core.min_free_space_percent;
        if min_percent == 0 {
            return Ok(());
        }
        let st = rustix::fs::fstatvfs(&self.objects_dir).context("statvfs objects/")?;
        if st.f_blocks == 0 {
            return Ok(());
        }
        let free_percent = st.f_bavail * 100 / st.f_blocks;
        if (free_percent as u32) < min_percent {
            return Err(anyhow!(
                "min-free-space-percent '{min_percent}%' would be exceeded; {free_percent}% available"
            ));
        }
        Ok(())
    }
}

/// A live reservation of the dirmeta cache; see
/// [`Repo::dirmeta_cache_reservation`].
pub struct DirmetaCacheToken<'a> {
    repo: &'a Repo,
}

impl Drop for DirmetaCacheToken<'_> {
    fn drop(&mut self) {
        let mut cache = self.repo.dirmeta_cache.lock().unwrap();
        cache.refcount -= 1;
        if cache.refcount == 0 {
            cache.map = None;
        }
    }
}

/// Whether `OSTREE_REPO_TEST_ERROR` requests the named fault.
fn test_error_flag(flag: &str) -> bool {
    match std::env::var("OSTREE_REPO_TEST_ERROR") {
        Ok(v) => v.split(',').any(|f| f == flag),
        Err(_) => false,
    }
}
