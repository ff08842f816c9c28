//! The remote registry: named peers with per-remote options and keyrings.
//!
//! Remotes come from two places: `[remote "<name>"]` groups in the main
//! config, and per-remote drop-in files `<name>.conf` under a sysroot-aware
//! configuration directory.  A name appearing in both is a configuration
//! error.

use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::keyfile::KeyFile;
use crate::repo::Repo;
use crate::RepoError;

/// Location of per-remote drop-in configuration, relative to the sysroot.
const SYSCONF_REMOTES: &str = "etc/ostree/remotes.d";

/// A configured remote.
#[derive(Clone, Debug)]
pub struct Remote {
    /// The remote name.
    pub name: String,
    /// The config group carrying its options: `remote "<name>"`.
    pub group: String,
    /// The keyring file name: `<name>.trustedkeys.gpg`.
    pub keyring: String,
    /// The option table (a keyfile holding just the remote's group).
    pub options: KeyFile,
    /// The backing drop-in file, when the remote came from one.
    pub file: Option<Utf8PathBuf>,
}

impl Remote {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            group: format!("remote \"{name}\""),
            keyring: format!("{name}.trustedkeys.gpg"),
            options: KeyFile::new(),
            file: None,
        }
    }

    /// Parse a remote out of one keyfile group, if the group denotes one.
    fn from_keyfile_group(kf: &KeyFile, group: &str) -> Option<Remote> {
        let name = group
            .strip_prefix("remote \"")
            .and_then(|r| r.strip_suffix('"'))?;
        if name.is_empty() {
            return None;
        }
        let mut remote = Remote::new(name);
        kf.copy_group_into(group, &mut remote.options);
        Some(remote)
    }

    fn option_string(&self, key: &str) -> Result<Option<String>> {
        self.options.optional_string(&self.group, key)
    }
}

/// Validate a remote name: non-empty, limited to `[A-Za-z0-9._-]`.
pub fn validate_remote_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(anyhow!("invalid remote name: {name:?}"));
    }
    Ok(())
}

/// A remote name that is really a `file://` URL bypasses the registry: all
/// option lookups produce the default, and signature verification is off.
pub(crate) fn remote_name_is_file(name: &str) -> bool {
    name.starts_with("file://")
}

/// The drop-in directory for this handle, if a sysroot (or an explicit
/// override) makes one resolvable.
pub(crate) fn get_remotes_d_dir(repo: &Repo) -> Option<Utf8PathBuf> {
    match (repo.sysroot_dir(), repo.remotes_config_dir()) {
        (Some(sysroot), Some(overridden)) => Some(sysroot.join(overridden)),
        (None, Some(overridden)) => Some(overridden.to_owned()),
        (Some(sysroot), None) => Some(sysroot.join(SYSCONF_REMOTES)),
        (None, None) => None,
    }
}

fn add_remotes_from_keyfile(
    repo: &Repo,
    kf: &KeyFile,
    file: Option<&Utf8Path>,
) -> Result<()> {
    let mut parsed = Vec::new();
    for group in kf.groups() {
        if let Some(mut remote) = Remote::from_keyfile_group(kf, group) {
            remote.file = file.map(|f| f.to_owned());
            parsed.push(remote);
        }
    }
    let mut remotes = repo.remotes.lock().unwrap();
    // All-or-nothing: check every name before registering any.
    for remote in &parsed {
        if remotes.contains_key(&remote.name) {
            return Err(anyhow!(
                "multiple specifications found for remote \"{}\"",
                remote.name
            ));
        }
    }
    for remote in parsed {
        remotes.insert(remote.name.clone(), remote);
    }
    Ok(())
}

/// Rebuild the in-memory registry from the main config and the drop-in dir.
#[context("Reloading remote config")]
pub(crate) fn reload_remote_config(repo: &Repo) -> Result<()> {
    repo.remotes.lock().unwrap().clear();
    let keyfile = repo.copy_config();
    add_remotes_from_keyfile(repo, &keyfile, None)?;

    let Some(remotes_d) = get_remotes_d_dir(repo) else {
        return Ok(());
    };
    let entries = match std::fs::read_dir(&remotes_d) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("reading {remotes_d}")),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(".conf") || !entry.file_type()?.is_file() {
            continue;
        }
        let path = remotes_d.join(name);
        let data = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
        let kf = KeyFile::parse(&data).with_context(|| format!("parsing {path}"))?;
        add_remotes_from_keyfile(repo, &kf, Some(&path))?;
    }
    Ok(())
}

/// The operation for [`Repo::remote_change`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteChange {
    /// Add; error if the name exists.
    Add,
    /// Add; silent success if the name exists.
    AddIfNotExists,
    /// Delete; error if the name is absent.
    Delete,
    /// Delete; silent success if the name is absent.
    DeleteIfExists,
}

impl Repo {
    fn get_remote(&self, name: &str) -> Result<Remote> {
        let remotes = self.remotes.lock().unwrap();
        remotes
            .get(name)
            .cloned()
            .ok_or_else(|| RepoError::not_found(format!("remote \"{name}\"")))
    }

    /// List remote names, unioned with the parent repository, sorted.
    pub fn remote_list(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = {
            let remotes = self.remotes.lock().unwrap();
            remotes.keys().cloned().collect()
        };
        // The lock is released before recursing into the parent.
        if let Some(parent) = self.parent() {
            names.extend(parent.remote_list());
        }
        names.into_iter().collect()
    }

    /// Add or delete a remote.
    #[context("Modifying remote {name}")]
    pub fn remote_change(
        &self,
        change: RemoteChange,
        name: &str,
        url: Option<&str>,
        options: &[(&str, &str)],
    ) -> Result<()> {
        validate_remote_name(name)?;
        match change {
            RemoteChange::Add | RemoteChange::AddIfNotExists => {
                let url = url.ok_or_else(|| anyhow!("adding a remote requires a URL"))?;
                self.remote_add_impl(name, url, options, change == RemoteChange::AddIfNotExists)
            }
            RemoteChange::Delete | RemoteChange::DeleteIfExists => {
                self.remote_delete_impl(name, change == RemoteChange::DeleteIfExists)
            }
        }
    }

    /// Add a remote named `name` pointing at `url`; see [`RemoteChange::Add`].
    pub fn remote_add(&self, name: &str, url: &str, options: &[(&str, &str)]) -> Result<()> {
        self.remote_change(RemoteChange::Add, name, Some(url), options)
    }

    /// Delete a remote; see [`RemoteChange::Delete`].
    pub fn remote_delete(&self, name: &str) -> Result<()> {
        self.remote_change(RemoteChange::Delete, name, None, &[])
    }

    fn remote_add_impl(
        &self,
        name: &str,
        url: &str,
        options: &[(&str, &str)],
        if_not_exists: bool,
    ) -> Result<()> {
        if let Ok(existing) = self.get_remote(name) {
            if if_not_exists {
                return Ok(());
            }
            let place = existing
                .file
                .map(|f| f.to_string())
                .unwrap_or_else(|| "(in config)".to_string());
            return Err(RepoError::AlreadyExists(format!(
                "remote configuration for \"{name}\" ({place})"
            ))
            .into());
        }

        let mut remote = Remote::new(name);
        match url.strip_prefix("metalink=") {
            Some(metalink) => remote.options.set_string(&remote.group, "metalink", metalink),
            None => remote.options.set_string(&remote.group, "url", url),
        }
        for (k, v) in options {
            remote.options.set_string(&remote.group, k, v);
        }

        if let Some(remotes_d) = get_remotes_d_dir(self) {
            std::fs::create_dir_all(&remotes_d)
                .with_context(|| format!("creating {remotes_d}"))?;
            let path = remotes_d.join(format!("{name}.conf"));
            std::fs::write(&path, remote.options.to_data())
                .with_context(|| format!("writing {path}"))?;
            remote.file = Some(path);
            self.remotes
                .lock()
                .unwrap()
                .insert(name.to_string(), remote);
        } else {
            let mut config = self.copy_config();
            remote.options.copy_group_into(&remote.group, &mut config);
            // write_config re-registers every remote, this one included.
            self.write_config(&config)?;
        }
        tracing::debug!("added remote {name}");
        Ok(())
    }

    fn remote_delete_impl(&self, name: &str, if_exists: bool) -> Result<()> {
        let remote = match self.get_remote(name) {
            Ok(r) => r,
            Err(_) if if_exists => return Ok(()),
            Err(e) => return Err(e),
        };

        if let Some(file) = &remote.file {
            std::fs::remove_file(file).with_context(|| format!("unlinking {file}"))?;
            self.remotes.lock().unwrap().remove(name);
        } else {
            let mut config = self.copy_config();
            if config.remove_group(&remote.group) {
                self.write_config(&config)?;
            } else {
                self.remotes.lock().unwrap().remove(name);
            }
        }

        crate::optional(self.repo_dir().remove_file(&remote.keyring))
            .with_context(|| format!("unlinking {}", remote.keyring))?;
        tracing::debug!("deleted remote {name}");
        Ok(())
    }

    /// Get a string option of a remote, consulting the parent repository
    /// when the option (or the whole remote) is absent here.
    pub fn remote_get_option(
        &self,
        name: &str,
        key: &str,
        default: Option<&str>,
    ) -> Result<Option<String>> {
        if remote_name_is_file(name) {
            return Ok(default.map(|s| s.to_string()));
        }
        match self.get_remote(name) {
            Ok(remote) => match remote.option_string(key)? {
                Some(v) => Ok(Some(v)),
                None => {
                    // The parent may define the same remote with this option;
                    // any failure there falls back to the default.
                    if let Some(parent) = self.parent() {
                        if let Ok(v @ Some(_)) = parent.remote_get_option(name, key, None) {
                            return Ok(v);
                        }
                    }
                    Ok(default.map(|s| s.to_string()))
                }
            },
            Err(e) => match self.parent() {
                Some(parent) => parent.remote_get_option(name, key, default),
                None => Err(e),
            },
        }
    }

    /// Get a string-list option of a remote; absent means `None`.
    pub fn remote_get_option_list(&self, name: &str, key: &str) -> Result<Option<Vec<String>>> {
        if remote_name_is_file(name) {
            return Ok(None);
        }
        match self.get_remote(name) {
            Ok(remote) => match remote.options.optional_string_list(&remote.group, key)? {
                Some(v) => Ok(Some(v)),
                None => {
                    if let Some(parent) = self.parent() {
                        if let Ok(v @ Some(_)) = parent.remote_get_option_list(name, key) {
                            return Ok(v);
                        }
                    }
                    Ok(None)
                }
            },
            Err(e) => match self.parent() {
                Some(parent) => parent.remote_get_option_list(name, key),
                None => Err(e),
            },
        }
    }

    /// Get a boolean option of a remote with a default.
    pub fn remote_get_option_bool(&self, name: &str, key: &str, default: bool) -> Result<bool> {
        if remote_name_is_file(name) {
            return Ok(default);
        }
        match self.get_remote(name) {
            Ok(remote) => match remote.options.optional_bool(&remote.group, key)? {
                Some(v) => Ok(v),
                None => {
                    if let Some(parent) = self.parent() {
                        if let Ok(v) = parent.remote_get_option_bool(name, key, default) {
                            return Ok(v);
                        }
                    }
                    Ok(default)
                }
            },
            Err(e) => match self.parent() {
                Some(parent) => parent.remote_get_option_bool(name, key, default),
                None => Err(e),
            },
        }
    }

    /// The remote's URL (or `metalink=<url>` for metalink remotes).
    pub fn remote_get_url(&self, name: &str) -> Result<String> {
        if remote_name_is_file(name) {
            return Ok(name.to_string());
        }
        if let Some(url) = self.remote_get_option(name, "url", None)? {
            return Ok(url);
        }
        if let Some(metalink) = self.remote_get_option(name, "metalink", None)? {
            return Ok(format!("metalink={metalink}"));
        }
        Err(RepoError::not_found(format!("url for remote \"{name}\"")))
    }

    /// Whether commit signature verification is enabled for this remote.
    pub fn remote_get_gpg_verify(&self, name: &str) -> Result<bool> {
        if remote_name_is_file(name) {
            return Ok(false);
        }
        self.remote_get_option_bool(name, "gpg-verify", true)
    }

    /// Whether summary signature verification is enabled for this remote.
    pub fn remote_get_gpg_verify_summary(&self, name: &str) -> Result<bool> {
        if remote_name_is_file(name) {
            return Ok(false);
        }
        self.remote_get_option_bool(name, "gpg-verify-summary", false)
    }

    /// Look up a remote by name, inheriting from the parent chain.
    pub(crate) fn get_remote_inherited(&self, name: &str) -> Result<Remote> {
        match self.get_remote(name) {
            Ok(r) => Ok(r),
            Err(e) => match self.parent() {
                Some(parent) => parent.get_remote_inherited(name),
                None => Err(e),
            },
        }
    }
}
