//! Detached signatures over commits and the summary.
//!
//! The OpenPGP implementation itself is a collaborator behind the [`Signer`]
//! and [`Verifier`] traits; this module owns where signatures are stored
//! (the `ostree.gpgsigs` list in a commit's detached metadata, and
//! `summary.sig`), the append-without-duplicates discipline, and the keyring
//! search order for verification.

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use once_cell::sync::OnceCell;

use crate::checksum::Checksum;
use crate::object::ObjectType;
use crate::repo::Repo;
use crate::variant::{self, VarDict, Variant};
use crate::RepoError;

/// Detached-metadata key holding signature packets (`aay`).
pub const GPGSIGS_KEY: &str = "ostree.gpgsigs";

/// Sentinel remote name requesting the union of all remote keyrings.
pub const ALL_REMOTES: &str = "__OSTREE_ALL_REMOTES__";

/// System-wide trusted keyring directory.
const GLOBAL_KEYRING_DIR: &str = "/usr/share/ostree/trusted.gpg.d";

/// Produces detached signatures.
pub trait Signer {
    /// Produce one detached signature packet over `data` with `key_id`.
    fn sign(&self, data: &[u8], key_id: &str, homedir: Option<&Utf8Path>) -> Result<Vec<u8>>;
}

/// Verifies detached signatures against a set of keyrings.
pub trait Verifier {
    /// Verify concatenated signature packets over `data`.
    fn verify(&self, data: &[u8], signatures: &[u8], keyrings: &Keyrings)
        -> Result<VerifyResult>;
}

/// The key material a verification composes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Keyrings {
    /// Individual keyring files (per-remote `<name>.trustedkeys.gpg` etc.).
    pub keyring_files: Vec<Utf8PathBuf>,
    /// Directories of keyrings.
    pub keyring_dirs: Vec<Utf8PathBuf>,
    /// Loose exported key files (`gpgkeypath`).
    pub key_files: Vec<Utf8PathBuf>,
}

/// One verified (or rejected) signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureInfo {
    /// The signing key id.
    pub key_id: String,
    /// Whether the signature is valid and from a trusted key.
    pub valid: bool,
}

/// The outcome of verifying a signature list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyResult {
    /// One entry per signature packet, in order.
    pub signatures: Vec<SignatureInfo>,
}

impl VerifyResult {
    /// Find the signature made by `key_id`, if any.
    pub fn lookup(&self, key_id: &str) -> Option<&SignatureInfo> {
        self.signatures.iter().find(|s| s.key_id == key_id)
    }

    /// Whether at least one signature is valid.
    pub fn any_valid(&self) -> bool {
        self.signatures.iter().any(|s| s.valid)
    }
}

/// The signing engine performs process-wide initialization on first use;
/// kept explicit here rather than as library-load ambient state.
fn ensure_engine_initialized() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        tracing::trace!("signature engine initialized");
    });
}

/// Extract the signature packet list from detached metadata.
fn signatures_from_metadata(metadata: &VarDict) -> Option<&Vec<Vec<u8>>> {
    match metadata.get(GPGSIGS_KEY) {
        Some(Variant::BytesArray(sigs)) => Some(sigs),
        _ => None,
    }
}

/// Append one signature packet, preserving every other key.
fn detached_metadata_append_sig(metadata: Option<&VarDict>, signature: &[u8]) -> VarDict {
    let mut out = metadata.cloned().unwrap_or_default();
    let mut sigs = match out.remove(GPGSIGS_KEY) {
        Some(Variant::BytesArray(sigs)) => sigs,
        _ => Vec::new(),
    };
    sigs.push(signature.to_vec());
    out.insert(GPGSIGS_KEY.to_string(), Variant::BytesArray(sigs));
    out
}

/// Concatenate packets for the verifier; OpenPGP packet framing is
/// self-delimiting, so a plain concatenation round-trips.
fn concat_packets(sigs: &[Vec<u8>]) -> Vec<u8> {
    sigs.iter().flatten().copied().collect()
}

impl Repo {
    /// Add an externally produced signature to a commit's detached metadata.
    #[context("Appending signature to {checksum}")]
    pub fn append_gpg_signature(&self, checksum: &Checksum, signature: &[u8]) -> Result<()> {
        let existing = self.read_commit_detached_metadata(checksum)?;
        let new = detached_metadata_append_sig(existing.as_ref(), signature);
        self.write_commit_detached_metadata(checksum, Some(&new))
    }

    /// Sign a commit with `key_id`, refusing to double-sign with a key that
    /// already signed it.
    #[context("Signing commit {checksum}")]
    pub fn sign_commit(
        &self,
        signer: &dyn Signer,
        verifier: &dyn Verifier,
        checksum: &Checksum,
        key_id: &str,
        homedir: Option<&Utf8Path>,
    ) -> Result<()> {
        ensure_engine_initialized();
        let commit_data = self
            .load_variant(ObjectType::Commit, checksum)
            .context("Failed to read commit")?;
        let old_metadata = self
            .read_commit_detached_metadata(checksum)
            .context("Failed to read detached metadata")?;

        // Parse any existing signatures just to find out whether this key
        // already signed the commit; "no signatures" is fine.
        if let Some(sigs) = old_metadata.as_ref().and_then(signatures_from_metadata) {
            if !sigs.is_empty() {
                let keyrings = self.verification_keyrings(Some(ALL_REMOTES), None, None)?;
                let result =
                    verifier.verify(&commit_data, &concat_packets(sigs), &keyrings)?;
                if result.lookup(key_id).is_some() {
                    return Err(RepoError::AlreadyExists(format!(
                        "signature from key {key_id}"
                    ))
                    .into());
                }
            }
        }

        let signature = signer.sign(&commit_data, key_id, homedir)?;
        let new = detached_metadata_append_sig(old_metadata.as_ref(), &signature);
        self.write_commit_detached_metadata(checksum, Some(&new))
    }

    /// Sign the current `summary` file, appending to `summary.sig`.
    #[context("Signing summary")]
    pub fn add_gpg_signature_summary(
        &self,
        signer: &dyn Signer,
        key_ids: &[&str],
        homedir: Option<&Utf8Path>,
    ) -> Result<()> {
        ensure_engine_initialized();
        let summary_data = self
            .repo_dir()
            .read("summary")
            .context("reading summary")?;
        let mut metadata = match crate::optional(self.repo_dir().read("summary.sig"))? {
            Some(data) => Some(variant::parse_vardict(&data).context("parsing summary.sig")?),
            None => None,
        };
        for key_id in key_ids {
            let signature = signer.sign(&summary_data, key_id, homedir)?;
            metadata = Some(detached_metadata_append_sig(metadata.as_ref(), &signature));
        }
        let Some(metadata) = metadata else {
            return Err(anyhow!("no key ids provided"));
        };
        self.replace_file_contents(
            self.repo_dir(),
            "summary.sig",
            &variant::serialize_vardict(&metadata),
        )
    }

    /// Delta signing was replaced by summary signing.
    pub fn sign_delta(&self) -> Result<()> {
        Err(RepoError::Unsupported("sign-delta is deprecated; sign the summary instead".into()).into())
    }

    /// Locate a remote's keyring file: in the repository, then the remotes
    /// drop-in directory, then the parent repository.
    fn find_keyring(&self, keyring: &str) -> Result<Option<Utf8PathBuf>> {
        if crate::optional(self.repo_dir().symlink_metadata(keyring))?.is_some() {
            return Ok(Some(self.path().join(keyring)));
        }
        if let Some(remotes_d) = crate::remotes::get_remotes_d_dir(self) {
            let candidate = remotes_d.join(keyring);
            if candidate.exists() {
                return Ok(Some(candidate));
            }
        }
        match self.parent() {
            Some(parent) => parent.find_keyring(keyring),
            None => Ok(None),
        }
    }

    /// Compose the keyrings used to verify data attributed to `remote`.
    #[context("Composing keyrings")]
    pub fn verification_keyrings(
        &self,
        remote: Option<&str>,
        extra_keyring_dir: Option<&Utf8Path>,
        extra_keyring: Option<&Utf8Path>,
    ) -> Result<Keyrings> {
        let mut keyrings = Keyrings::default();
        match remote {
            Some(ALL_REMOTES) => {
                // Union of all remote keyrings.
                let names = self.remote_list();
                for name in names {
                    let remote = self.get_remote_inherited(&name)?;
                    if let Some(path) = self.find_keyring(&remote.keyring)? {
                        keyrings.keyring_files.push(path);
                    }
                }
            }
            Some(name) if !crate::remotes::remote_name_is_file(name) => {
                let remote = self.get_remote_inherited(name)?;
                if let Some(path) = self.find_keyring(&remote.keyring)? {
                    keyrings.keyring_files.push(path);
                }
                if let Some(keypath) = self.remote_get_option(name, "gpgkeypath", None)? {
                    for p in keypath.split([',', ';']) {
                        if !p.is_empty() {
                            keyrings.key_files.push(Utf8PathBuf::from(p));
                        }
                    }
                }
            }
            _ => {}
        }
        keyrings
            .keyring_dirs
            .push(Utf8PathBuf::from(GLOBAL_KEYRING_DIR));
        if let Some(dir) = extra_keyring_dir {
            keyrings.keyring_dirs.push(dir.to_owned());
        }
        if let Some(file) = extra_keyring {
            keyrings.keyring_files.push(file.to_owned());
        }
        Ok(keyrings)
    }

    /// Verify the detached signatures of a commit.  `remote` selects the
    /// keyring search (see [`ALL_REMOTES`]).
    #[context("Verifying commit {checksum}")]
    pub fn verify_commit(
        &self,
        verifier: &dyn Verifier,
        checksum: &Checksum,
        remote: Option<&str>,
        extra_keyring_dir: Option<&Utf8Path>,
        extra_keyring: Option<&Utf8Path>,
    ) -> Result<VerifyResult> {
        ensure_engine_initialized();
        let commit_data = self.load_variant(ObjectType::Commit, checksum)?;
        let metadata = self.read_commit_detached_metadata(checksum)?;
        let sigs = metadata
            .as_ref()
            .and_then(signatures_from_metadata)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RepoError::not_found(format!("signatures for commit {checksum}")))?;
        let keyrings =
            self.verification_keyrings(remote, extra_keyring_dir, extra_keyring)?;
        let result = verifier.verify(&commit_data, &concat_packets(sigs), &keyrings)?;
        self.emit_verify_result(checksum, &result);
        Ok(result)
    }

    /// Verify `summary` against `summary.sig` for the given remote.
    #[context("Verifying summary")]
    pub fn verify_summary(
        &self,
        verifier: &dyn Verifier,
        remote: &str,
        summary: &[u8],
        signatures: &[u8],
    ) -> Result<VerifyResult> {
        ensure_engine_initialized();
        let metadata = variant::parse_vardict(signatures).context("parsing summary signatures")?;
        let sigs = signatures_from_metadata(&metadata)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RepoError::not_found("signatures for summary".to_string()))?;
        let keyrings = self.verification_keyrings(Some(remote), None, None)?;
        verifier.verify(summary, &concat_packets(sigs), &keyrings)
    }
}
