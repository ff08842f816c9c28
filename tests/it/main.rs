use std::io::Read;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use treestore::content::FileInfo;
use treestore::keyfile::KeyFile;
use treestore::objects::ListObjectsOptions;
use treestore::variant::{self, Commit, VarDict, Variant};
use treestore::{Checksum, ObjectType, Repo, RepoError, RepoMode};

/// Tests that set process environment (or would observe another test doing
/// so mid-commit) serialize on this.
static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn repo_path(td: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
    Utf8PathBuf::try_from(td.path().join(name)).unwrap()
}

fn write_regfile(repo: &Repo, uid: u32, gid: u32, mode: u32, contents: &[u8]) -> Result<Checksum> {
    let info = FileInfo {
        uid,
        gid,
        mode: libc::S_IFREG | mode,
        symlink_target: None,
        size: contents.len() as u64,
    };
    repo.write_file_object(
        &info,
        &[],
        Some(Box::new(std::io::Cursor::new(contents.to_vec()))),
        None,
        None,
    )
}

fn write_commit_object(repo: &Repo, subject: &str, timestamp: u64) -> Result<Checksum> {
    let commit = Commit {
        metadata: VarDict::new(),
        parent: Vec::new(),
        related: Vec::new(),
        subject: subject.to_string(),
        body: String::new(),
        timestamp,
        root_tree: vec![0u8; 32],
        root_meta: vec![0u8; 32],
    };
    repo.write_metadata(ObjectType::Commit, None, &variant::serialize_commit(&commit))
}

/// bare-user needs user-xattr support in the repo filesystem; tmpfs commonly
/// lacks it, in which case these tests have nothing to exercise.
fn try_create_bare_user(path: &Utf8Path) -> Option<Repo> {
    Repo::create(path, RepoMode::BareUser).ok()
}

#[test]
fn test_bare_user_write_and_read_back() -> Result<()> {
    let td = tempfile::tempdir()?;
    let Some(repo) = try_create_bare_user(&repo_path(&td, "r1")) else {
        eprintln!("skipping: no user xattr support");
        return Ok(());
    };
    let csum = write_regfile(&repo, 1000, 1000, 0o644, b"hello\n")?;

    // Content addressing is deterministic: writing the same logical input
    // again yields the same name and byte-identical storage.
    let csum2 = write_regfile(&repo, 1000, 1000, 0o644, b"hello\n")?;
    assert_eq!(csum, csum2);
    // And any metadata change yields a different name.
    let csum3 = write_regfile(&repo, 1000, 1000, 0o640, b"hello\n")?;
    assert_ne!(csum, csum3);

    let mut loaded = repo.load_file(&csum)?;
    let mut buf = Vec::new();
    loaded.content.as_mut().unwrap().read_to_end(&mut buf)?;
    assert_eq!(buf, b"hello\n");
    assert_eq!(loaded.info.uid, 1000);
    assert_eq!(loaded.info.gid, 1000);
    assert_eq!(loaded.info.mode, libc::S_IFREG | 0o644);
    assert!(loaded.xattrs.is_empty());
    Ok(())
}

#[test]
fn test_bare_user_symlink_is_regular_on_disk() -> Result<()> {
    let td = tempfile::tempdir()?;
    let Some(repo) = try_create_bare_user(&repo_path(&td, "r")) else {
        eprintln!("skipping: no user xattr support");
        return Ok(());
    };
    let info = FileInfo {
        uid: 7,
        gid: 8,
        mode: libc::S_IFLNK | 0o777,
        symlink_target: Some("the/target".to_string()),
        size: 0,
    };
    let csum = repo.write_file_object(&info, &[], None, None, None)?;
    let loose = repo
        .path()
        .join("objects")
        .join(&csum.to_hex()[..2])
        .join(format!("{}.file", &csum.to_hex()[2..]));
    let meta = std::fs::symlink_metadata(&loose)?;
    assert!(meta.is_file(), "bare-user symlinks are stored as files");

    let loaded = repo.load_file(&csum)?;
    assert!(loaded.content.is_none());
    assert_eq!(loaded.info.symlink_target.as_deref(), Some("the/target"));
    assert_eq!(loaded.info.uid, 7);
    Ok(())
}

#[test]
fn test_archive_delete() -> Result<()> {
    let td = tempfile::tempdir()?;
    let repo = Repo::create(repo_path(&td, "r2"), RepoMode::Archive)?;
    let csum = write_regfile(&repo, 0, 0, 0o644, b"compressed content")?;
    assert!(repo.has_object(ObjectType::File, &csum)?);
    let loose = repo
        .path()
        .join("objects")
        .join(&csum.to_hex()[..2])
        .join(format!("{}.filez", &csum.to_hex()[2..]));
    assert!(loose.exists());

    repo.delete_object(ObjectType::File, &csum)?;
    assert!(!repo.has_object(ObjectType::File, &csum)?);
    assert!(!loose.exists());
    Ok(())
}

#[test]
fn test_parent_chain() -> Result<()> {
    let td = tempfile::tempdir()?;
    let parent_path = repo_path(&td, "parent");
    let parent = Repo::create(&parent_path, RepoMode::BareUserOnly)?;
    let commit = write_commit_object(&parent, "in parent", 1111)?;
    let file = write_regfile(&parent, 0, 0, 0o644, b"parent data")?;
    drop(parent);

    let child_path = repo_path(&td, "child");
    let child = Repo::create(&child_path, RepoMode::BareUserOnly)?;
    let mut cfg = child.copy_config();
    cfg.set_string("core", "parent", parent_path.as_str());
    child.write_config(&cfg)?;
    drop(child);
    let child = Repo::open(&child_path)?;

    // Reads fall through to the parent.
    assert!(child.has_object(ObjectType::Commit, &commit)?);
    let loaded = child.load_commit(&commit)?;
    assert_eq!(loaded.subject, "in parent");
    let mut lf = child.load_file(&file)?;
    let mut buf = Vec::new();
    lf.content.as_mut().unwrap().read_to_end(&mut buf)?;
    assert_eq!(buf, b"parent data");

    // The union enumeration equals the union of the loose sets.
    let child_only = write_regfile(&child, 0, 0, 0o644, b"child data")?;
    let all = child.list_objects(ListObjectsOptions::default(), None)?;
    assert!(all.contains_key(&treestore::ObjectName::new(commit, ObjectType::Commit)));
    assert!(all.contains_key(&treestore::ObjectName::new(file, ObjectType::File)));
    assert!(all.contains_key(&treestore::ObjectName::new(child_only, ObjectType::File)));
    let local_only = child.list_objects(ListObjectsOptions { skip_parent: true }, None)?;
    assert_eq!(local_only.len(), 1);

    // Deletes never descend into the parent.
    assert!(child.delete_object(ObjectType::Commit, &commit).is_err());
    let parent = Repo::open(&parent_path)?;
    assert!(parent.has_object(ObjectType::Commit, &commit)?);
    Ok(())
}

#[test]
fn test_remote_add_list_delete() -> Result<()> {
    let td = tempfile::tempdir()?;
    let repo = Repo::create(repo_path(&td, "r4"), RepoMode::BareUserOnly)?;
    repo.remote_add("a", "https://x/a", &[])?;
    repo.remote_add("b", "https://x/b", &[])?;
    assert_eq!(repo.remote_list(), ["a", "b"]);
    repo.remote_delete("a")?;
    assert_eq!(repo.remote_list(), ["b"]);
    let err = repo.remote_delete("a").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RepoError>(),
        Some(RepoError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn test_tombstone_commit() -> Result<()> {
    let td = tempfile::tempdir()?;
    let path = repo_path(&td, "r5");
    let repo = Repo::create(&path, RepoMode::BareUserOnly)?;
    let mut cfg = repo.copy_config();
    cfg.set_bool("core", "tombstone-commits", true);
    repo.write_config(&cfg)?;

    let commit = write_commit_object(&repo, "doomed", 42)?;
    repo.delete_object(ObjectType::Commit, &commit)?;
    assert!(repo.has_object(ObjectType::TombstoneCommit, &commit)?);
    // The tombstone records the commit checksum.
    let data = repo.load_variant(ObjectType::TombstoneCommit, &commit)?;
    let dict = variant::parse_vardict(&data)?;
    let Variant::Bytes(recorded) = &dict["commit"] else {
        panic!("bad tombstone");
    };
    assert_eq!(&recorded[..64], commit.to_hex().as_bytes());
    Ok(())
}

#[test]
fn test_summary_regeneration() -> Result<()> {
    let td = tempfile::tempdir()?;
    let repo = Repo::create(repo_path(&td, "r6"), RepoMode::BareUserOnly)?;
    let c1 = write_commit_object(&repo, "one", 1000)?;
    let c2 = write_commit_object(&repo, "two", 2000)?;
    repo.set_ref_immediate("r2", &c2)?;
    repo.set_ref_immediate("r1", &c1)?;
    std::fs::write(repo.path().join("summary.sig"), b"old signature")?;

    repo.regenerate_summary(None, None)?;

    let summary = repo.load_summary()?.unwrap();
    let names: Vec<_> = summary.refs.iter().map(|e| e.ref_name.as_str()).collect();
    assert_eq!(names, ["r1", "r2"]);
    assert!(summary
        .metadata
        .contains_key("ostree.summary.last-modified"));
    assert!(!repo.path().join("summary.sig").exists());
    Ok(())
}

#[test]
fn test_staging_atomicity_and_boot_id_cleanup() -> Result<()> {
    let _env = env_lock();
    let td = tempfile::tempdir()?;
    let path = repo_path(&td, "r7");
    std::env::set_var("OSTREE_BOOTID", "boot-one");
    let repo = Repo::create(&path, RepoMode::BareUserOnly)?;
    repo.prepare_transaction()?;
    let csum = write_regfile(&repo, 0, 0, 0o644, b"never committed")?;
    assert!(repo.has_object(ObjectType::File, &csum)?);

    // Simulated crash: the handle goes away without committing.
    drop(repo);

    // objects/ was never touched.
    let reopened = Repo::open(&path)?;
    assert!(!reopened.has_object(ObjectType::File, &csum)?);
    let staging: Vec<_> = std::fs::read_dir(path.join("tmp"))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("staging-"))
        .collect();
    assert!(!staging.is_empty());
    drop(reopened);

    // A later boot cannot trust the staged data; open discards it.
    std::env::set_var("OSTREE_BOOTID", "boot-two");
    let _reopened = Repo::open(&path)?;
    let staging: Vec<_> = std::fs::read_dir(path.join("tmp"))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("staging-") && !n.ends_with("-lock"))
        .collect();
    assert!(staging.is_empty(), "stale staging dirs survived: {staging:?}");
    std::env::remove_var("OSTREE_BOOTID");
    Ok(())
}

#[test]
fn test_staging_commit_publishes() -> Result<()> {
    let _env = env_lock();
    let td = tempfile::tempdir()?;
    let repo = Repo::create(repo_path(&td, "r8"), RepoMode::BareUserOnly)?;
    repo.prepare_transaction()?;
    let csum = write_regfile(&repo, 0, 0, 0o644, b"to be committed")?;
    // Another handle on the same path cannot see it yet.
    let other = Repo::open(repo.path())?;
    assert!(!other.has_object(ObjectType::File, &csum)?);
    repo.commit_transaction()?;
    assert!(other.has_object(ObjectType::File, &csum)?);
    Ok(())
}

#[test]
fn test_bareuser_to_bareuseronly_import() -> Result<()> {
    let td = tempfile::tempdir()?;
    let Some(src) = try_create_bare_user(&repo_path(&td, "src")) else {
        eprintln!("skipping: no user xattr support");
        return Ok(());
    };
    let regfile = write_regfile(&src, 1000, 1000, 0o644, b"regular")?;
    let link_info = FileInfo {
        uid: 1000,
        gid: 1000,
        mode: libc::S_IFLNK | 0o777,
        symlink_target: Some("regular-target".to_string()),
        size: 0,
    };
    let symlink = src.write_file_object(&link_info, &[], None, None, None)?;

    let dest = Repo::create(repo_path(&td, "dest"), RepoMode::BareUserOnly)?;
    dest.import_object_from(&src, ObjectType::File, &regfile, true, None)?;
    dest.import_object_from(&src, ObjectType::File, &symlink, true, None)?;

    use std::os::unix::fs::MetadataExt;
    // The regular file was hardlinked...
    let src_loose = src
        .path()
        .join("objects")
        .join(&regfile.to_hex()[..2])
        .join(format!("{}.file", &regfile.to_hex()[2..]));
    assert_eq!(std::fs::metadata(src_loose)?.nlink(), 2);
    // ...but the symlink was materialized as a real symlink via the copy path.
    let dest_loose = dest
        .path()
        .join("objects")
        .join(&symlink.to_hex()[..2])
        .join(format!("{}.file", &symlink.to_hex()[2..]));
    assert!(std::fs::symlink_metadata(dest_loose)?.is_symlink());
    Ok(())
}

#[test]
fn test_untrusted_import_rejects_corruption() -> Result<()> {
    let td = tempfile::tempdir()?;
    let src = Repo::create(repo_path(&td, "src"), RepoMode::BareUserOnly)?;
    let csum = write_regfile(&src, 0, 0, 0o644, b"payload")?;

    // Corrupt the loose object in place.
    let loose = src
        .path()
        .join("objects")
        .join(&csum.to_hex()[..2])
        .join(format!("{}.file", &csum.to_hex()[2..]));
    std::fs::write(&loose, b"tampered")?;

    let dest = Repo::create(repo_path(&td, "dest"), RepoMode::Archive)?;
    let err = dest
        .import_object_from(&src, ObjectType::File, &csum, false, None)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RepoError>(),
        Some(RepoError::ChecksumMismatch { .. })
    ));
    assert!(!dest.has_object(ObjectType::File, &csum)?);
    Ok(())
}

#[test]
fn test_commit_import_carries_detached_metadata() -> Result<()> {
    let td = tempfile::tempdir()?;
    let src = Repo::create(repo_path(&td, "src"), RepoMode::BareUserOnly)?;
    let commit = write_commit_object(&src, "with metadata", 7)?;
    let mut dict = VarDict::new();
    dict.insert(
        "ostree.gpgsigs".to_string(),
        Variant::BytesArray(vec![vec![1, 2, 3]]),
    );
    src.write_commit_detached_metadata(&commit, Some(&dict))?;

    let dest = Repo::create(repo_path(&td, "dest"), RepoMode::Archive)?;
    dest.import_object_from(&src, ObjectType::Commit, &commit, true, None)?;
    let meta = dest.read_commit_detached_metadata(&commit)?.unwrap();
    assert_eq!(meta, dict);
    Ok(())
}

#[test]
fn test_metadata_byte_roundtrip() -> Result<()> {
    // Every metadata object read back must be byte-identical to what was
    // written; peers hash these bytes.
    let td = tempfile::tempdir()?;
    let repo = Repo::create(repo_path(&td, "r"), RepoMode::BareUserOnly)?;

    let mut metadata = VarDict::new();
    metadata.insert("version".into(), Variant::Str("1.2".into()));
    let commit = Commit {
        metadata,
        parent: vec![0xab; 32],
        related: vec![("other".to_string(), vec![0xcd; 32])],
        subject: "subject line".into(),
        body: "longer body\nwith lines".into(),
        timestamp: 1_700_000_000,
        root_tree: vec![1; 32],
        root_meta: vec![2; 32],
    };
    let data = variant::serialize_commit(&commit);
    let csum = repo.write_metadata(ObjectType::Commit, None, &data)?;
    assert_eq!(repo.load_variant(ObjectType::Commit, &csum)?, data);
    assert_eq!(Checksum::digest(&data), csum);
    assert_eq!(repo.load_commit(&csum)?, commit);

    let tree = variant::DirTree {
        files: vec![("f".to_string(), vec![3; 32])],
        dirs: vec![("d".to_string(), vec![4; 32], vec![5; 32])],
    };
    let data = variant::serialize_dirtree(&tree);
    let csum = repo.write_metadata(ObjectType::DirTree, None, &data)?;
    assert_eq!(repo.load_variant(ObjectType::DirTree, &csum)?, data);
    assert_eq!(repo.load_dirtree(&csum)?, tree);
    Ok(())
}

#[test]
fn test_repo_discovery_env() -> Result<()> {
    let _env = env_lock();
    let td = tempfile::tempdir()?;
    let path = repo_path(&td, "discovered");
    Repo::create(&path, RepoMode::BareUserOnly)?;
    std::env::set_var("OSTREE_REPO", path.as_str());
    let sysroot = repo_path(&td, "nonexistent-sysroot");
    let repo = Repo::open_default(&sysroot)?;
    assert_eq!(repo.path(), path.canonicalize_utf8()?);
    std::env::remove_var("OSTREE_REPO");
    Ok(())
}

#[test]
fn test_pre_commit_fault_injection() -> Result<()> {
    let _env = env_lock();
    let td = tempfile::tempdir()?;
    let repo = Repo::create(repo_path(&td, "r"), RepoMode::BareUserOnly)?;
    repo.prepare_transaction()?;
    write_regfile(&repo, 0, 0, 0o644, b"x")?;
    std::env::set_var("OSTREE_REPO_TEST_ERROR", "pre-commit");
    let err = repo.commit_transaction().unwrap_err();
    assert!(format!("{err:#}").contains("pre-commit"));
    std::env::remove_var("OSTREE_REPO_TEST_ERROR");
    // The transaction is still open and can be committed for real.
    repo.commit_transaction()?;
    Ok(())
}

#[test]
fn test_short_prefix_commit_resolution() -> Result<()> {
    let td = tempfile::tempdir()?;
    let repo = Repo::create(repo_path(&td, "r"), RepoMode::BareUserOnly)?;
    let c1 = write_commit_object(&repo, "first", 1)?;
    let _c2 = write_commit_object(&repo, "second", 2)?;
    let hits = repo.list_commit_objects_starting_with(&c1.to_hex()[..10], None)?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits.keys().next().unwrap().checksum.to_hex(), c1.to_hex());
    Ok(())
}

#[test]
fn test_config_keyfile_surface() -> Result<()> {
    let td = tempfile::tempdir()?;
    let repo = Repo::create(repo_path(&td, "r"), RepoMode::Archive)?;
    // The config file on disk is the plain INI contract.
    let raw = std::fs::read_to_string(repo.path().join("config"))?;
    let kf = KeyFile::parse(&raw)?;
    assert_eq!(kf.string("core", "repo_version")?, "1");
    assert_eq!(kf.string("core", "mode")?, "archive-z2");
    Ok(())
}
