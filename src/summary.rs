//! Regeneration of the `summary` file: the index of refs, deltas and
//! collections peers use to discover available content.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use fn_error_context::context;

use crate::checksum::Checksum;
use crate::refs::parse_refspec;
use crate::repo::Repo;
use crate::variant::{self, Summary, SummaryEntry, VarDict, Variant};
use crate::{check_cancelled, Cancellable};

/// Per-ref metadata key: the commit's timestamp, big-endian u64.
pub const COMMIT_TIMESTAMP: &str = "ostree.commit.timestamp";
/// Top-level key: delta name → superblock digest.
pub const SUMMARY_STATIC_DELTAS: &str = "ostree.static-deltas";
/// Top-level key: regeneration time, big-endian u64 seconds.
pub const SUMMARY_LAST_MODIFIED: &str = "ostree.summary.last-modified";
/// Top-level key: this repository's collection id.
pub const SUMMARY_COLLECTION_ID: &str = "ostree.summary.collection-id";
/// Top-level key: refs grouped by foreign collection id.
pub const SUMMARY_COLLECTION_MAP: &str = "ostree.summary.collection-map";

impl Repo {
    /// Build one summary entry for a local ref.  Remote-tracking refspecs
    /// yield `None`; they are never advertised.
    fn summary_ref_entry(
        &self,
        ref_name: &str,
        checksum: &Checksum,
    ) -> Result<Option<SummaryEntry>> {
        let (remote, _) = parse_refspec(ref_name);
        if remote.is_some() {
            return Ok(None);
        }
        let commit_data = self
            .load_variant(crate::object::ObjectType::Commit, checksum)
            .with_context(|| format!("loading commit for ref {ref_name}"))?;
        let commit = variant::parse_commit(&commit_data)
            .with_context(|| format!("parsing commit for ref {ref_name}"))?;
        let mut metadata = VarDict::new();
        metadata.insert(
            COMMIT_TIMESTAMP.to_string(),
            Variant::U64(commit.timestamp.to_be()),
        );
        Ok(Some(SummaryEntry {
            ref_name: ref_name.to_string(),
            commit_size: commit_data.len() as u64,
            checksum: checksum.as_bytes().to_vec(),
            metadata,
        }))
    }

    /// Regenerate `summary` from the current refs, deltas and collections,
    /// then remove any stale `summary.sig`.  Refs and collection ids are
    /// emitted in lexicographic order.
    #[context("Regenerating summary")]
    pub fn regenerate_summary(
        &self,
        additional_metadata: Option<&VarDict>,
        cancellable: Option<&Cancellable>,
    ) -> Result<()> {
        self.require_writable()?;
        let mut metadata = additional_metadata.cloned().unwrap_or_default();
        let main_collection_id = self.collection_id();

        // Local refs; when a collection id is configured, mirrored refs of
        // that same collection join them for backwards compatibility.
        let mut main_refs: BTreeMap<String, Checksum> = self.list_refs()?;
        let mut collection_map: BTreeMap<String, Vec<SummaryEntry>> = BTreeMap::new();
        if let Some(main_id) = &main_collection_id {
            let mut grouped: BTreeMap<String, BTreeMap<String, Checksum>> = BTreeMap::new();
            for ((collection, ref_name), checksum) in self.list_mirror_refs()? {
                if &collection == main_id {
                    main_refs.insert(ref_name, checksum);
                } else {
                    grouped
                        .entry(collection)
                        .or_default()
                        .insert(ref_name, checksum);
                }
            }
            for (collection, refs) in grouped {
                let mut entries = Vec::with_capacity(refs.len());
                for (ref_name, checksum) in &refs {
                    if let Some(entry) = self.summary_ref_entry(ref_name, checksum)? {
                        entries.push(entry);
                    }
                }
                if !entries.is_empty() {
                    collection_map.insert(collection, entries);
                }
            }
        }

        let mut refs = Vec::with_capacity(main_refs.len());
        for (ref_name, checksum) in &main_refs {
            check_cancelled(cancellable)?;
            if let Some(entry) = self.summary_ref_entry(ref_name, checksum)? {
                refs.push(entry);
            }
        }

        let deltas = self.static_delta_superblock_digests()?;
        if !deltas.is_empty() {
            let mut dict = VarDict::new();
            for (name, digest) in deltas {
                dict.insert(name, Variant::Bytes(digest.as_bytes().to_vec()));
            }
            metadata.insert(SUMMARY_STATIC_DELTAS.to_string(), Variant::Dict(dict));
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        metadata.insert(
            SUMMARY_LAST_MODIFIED.to_string(),
            Variant::U64(now.to_be()),
        );

        if let Some(main_id) = &main_collection_id {
            metadata.insert(
                SUMMARY_COLLECTION_ID.to_string(),
                Variant::Str(main_id.clone()),
            );
        }
        if !collection_map.is_empty() {
            metadata.insert(
                SUMMARY_COLLECTION_MAP.to_string(),
                Variant::CollectionMap(collection_map),
            );
        }

        let summary = Summary { refs, metadata };
        let data = variant::serialize_summary(&summary);
        self.replace_file_contents(self.repo_dir(), "summary", &data)?;
        // Whatever signature existed signed the previous contents.
        crate::optional(self.repo_dir().remove_file("summary.sig"))
            .context("unlinking summary.sig")?;
        tracing::debug!("regenerated summary: {} refs", summary.refs.len());
        Ok(())
    }

    /// Read and decode `summary`, or `None` if the repository has none.
    pub fn load_summary(&self) -> Result<Option<Summary>> {
        let Some(data) = crate::optional(self.repo_dir().read("summary"))? else {
            return Ok(None);
        };
        Ok(Some(variant::parse_summary(&data)?))
    }
}
