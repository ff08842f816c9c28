//! File-object encodings for the storage modes.
//!
//! A file object has one canonical content stream: a big-endian u32 header
//! length, the file header (ownership, mode, symlink target, xattrs), then
//! the raw content.  Checksums are computed over that stream; symlinks have
//! no content portion, their target lives in the header.  Archive
//! repositories persist the compressed sibling of that stream (`.filez`): a
//! zlib header carrying the uncompressed size, then a zlib-compressed
//! payload.  bare-user repositories persist plain user-owned files and stash
//! the original metadata in the `user.ostreemeta` xattr.

use std::fs::File;
use std::io::{Read, Write};

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rustix::fs::XattrFlags;

use crate::checksum::{Checksum, ChecksumWriter};
use crate::variant::{self, DirMeta, FileHeader, Xattr, ZlibFileHeader};

/// The xattr carrying original file metadata in bare-user repositories.
pub(crate) const BAREUSER_META_XATTR: &str = "user.ostreemeta";

/// Upper bound on serialized file headers; headers are metadata-sized, so
/// anything larger indicates corruption.
const MAX_FILE_HEADER_SIZE: u32 = 10 * 1024 * 1024;

/// Synthesized file information returned by the load paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// Owner uid (as recorded for the object, per mode rules).
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Mode including file type bits.
    pub mode: u32,
    /// Symlink target, if the object is a symlink.
    pub symlink_target: Option<String>,
    /// Content size in bytes (zero for symlinks).
    pub size: u64,
}

impl FileInfo {
    /// Whether this object is a symlink.
    pub fn is_symlink(&self) -> bool {
        (self.mode & libc::S_IFMT) == libc::S_IFLNK
    }

    pub(crate) fn to_header(&self, xattrs: &[Xattr]) -> FileHeader {
        FileHeader {
            uid: self.uid,
            gid: self.gid,
            mode: self.mode,
            rdev: 0,
            symlink_target: self.symlink_target.clone().unwrap_or_default(),
            xattrs: xattrs.to_vec(),
        }
    }

    pub(crate) fn from_header(h: &FileHeader, size: u64) -> Self {
        let symlink_target = if (h.mode & libc::S_IFMT) == libc::S_IFLNK {
            Some(h.symlink_target.clone())
        } else {
            None
        };
        Self {
            uid: h.uid,
            gid: h.gid,
            mode: h.mode,
            symlink_target,
            size,
        }
    }
}

/// A loaded file object: content stream (absent for symlinks), file
/// information, and extended attributes.
pub struct LoadedFile {
    /// Content reader for regular files; `None` for symlinks.
    pub content: Option<Box<dyn Read + Send>>,
    /// Synthesized file information.
    pub info: FileInfo,
    /// Extended attributes.
    pub xattrs: Vec<Xattr>,
}

// --- canonical content stream ----------------------------------------------

/// Frame a file header for the canonical content stream.
pub(crate) fn content_header_bytes(h: &FileHeader) -> Vec<u8> {
    let body = variant::serialize_file_header(h);
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Read a framed file header from the front of a content stream.
pub(crate) fn read_content_header(r: &mut impl Read) -> Result<FileHeader> {
    let body = read_framed(r)?;
    variant::parse_file_header(&body)
}

fn read_framed(r: &mut impl Read) -> Result<Vec<u8>> {
    let mut lenbuf = [0u8; 4];
    r.read_exact(&mut lenbuf).context("reading header size")?;
    let len = u32::from_be_bytes(lenbuf);
    if len > MAX_FILE_HEADER_SIZE {
        bail!("file header of {len} bytes exceeds limit");
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).context("reading header")?;
    Ok(body)
}

/// The canonical content stream for the given parts, used for transfer and
/// checksumming, with its total length.  Symlinks contribute no content.
pub(crate) fn content_stream(
    header: &FileHeader,
    content: Option<Box<dyn Read + Send>>,
    content_size: u64,
) -> (Box<dyn Read + Send>, u64) {
    let prefix = content_header_bytes(header);
    let total = prefix.len() as u64 + content_size;
    let r: Box<dyn Read + Send> = match content {
        Some(c) => Box::new(std::io::Cursor::new(prefix).chain(c)),
        None => Box::new(std::io::Cursor::new(prefix)),
    };
    (r, total)
}

/// Compute the checksum of a file object from its header and content,
/// returning the digest and the content size.
pub(crate) fn checksum_file(
    header: &FileHeader,
    content: Option<&mut dyn Read>,
) -> Result<(Checksum, u64)> {
    let mut w = ChecksumWriter::new()?;
    let prefix = content_header_bytes(header);
    w.write_all(&prefix)?;
    let mut content_len = 0;
    if let Some(c) = content {
        content_len = std::io::copy(c, &mut w).context("hashing content")?;
    }
    Ok((w.finish()?, content_len))
}

// --- archive (.filez) objects ----------------------------------------------

/// Write a compressed file object: framed zlib header, then the deflated
/// content.  Returns the number of content bytes consumed.
pub(crate) fn filez_write(
    out: &mut impl Write,
    header: &FileHeader,
    size: u64,
    content: Option<&mut dyn Read>,
    level: u32,
) -> Result<u64> {
    let zheader = ZlibFileHeader {
        size,
        header: header.clone(),
    };
    let body = variant::serialize_zlib_file_header(&zheader);
    out.write_all(&(body.len() as u32).to_be_bytes())?;
    out.write_all(&body)?;
    let mut enc = ZlibEncoder::new(out, Compression::new(level));
    let n = match content {
        Some(c) => std::io::copy(c, &mut enc).context("compressing content")?,
        None => 0,
    };
    enc.finish().context("finishing compression")?;
    if n != size {
        bail!("content size changed underneath us: expected {size}, read {n}");
    }
    Ok(n)
}

/// Open a compressed file object, returning the parsed header and an
/// inflating reader over the payload.
pub(crate) fn filez_parse(f: File) -> Result<(ZlibFileHeader, Box<dyn Read + Send>)> {
    let mut f = std::io::BufReader::new(f);
    let body = read_framed(&mut f)?;
    let header = variant::parse_zlib_file_header(&body)?;
    Ok((header, Box::new(ZlibDecoder::new(f))))
}

// --- bare-user metadata xattr ----------------------------------------------

/// Record the original uid/gid/mode/xattrs on a bare-user loose file.
pub(crate) fn set_bareuser_metadata(
    fd: impl std::os::fd::AsFd,
    uid: u32,
    gid: u32,
    mode: u32,
    xattrs: &[Xattr],
) -> Result<()> {
    let meta = DirMeta {
        uid,
        gid,
        mode,
        xattrs: xattrs.to_vec(),
    };
    let data = variant::serialize_dirmeta(&meta);
    rustix::fs::fsetxattr(fd, BAREUSER_META_XATTR, &data, XattrFlags::empty())
        .context("writing user.ostreemeta")?;
    Ok(())
}

/// Read back the metadata recorded by [`set_bareuser_metadata`].
pub(crate) fn get_bareuser_metadata(fd: impl std::os::fd::AsFd) -> Result<DirMeta> {
    let size = rustix::fs::fgetxattr(&fd, BAREUSER_META_XATTR, &mut [])
        .map_err(|e| anyhow!(e).context("querying user.ostreemeta"))?;
    let mut buf = vec![0u8; size];
    let n = rustix::fs::fgetxattr(&fd, BAREUSER_META_XATTR, &mut buf)
        .map_err(|e| anyhow!(e).context("reading user.ostreemeta"))?;
    buf.truncate(n);
    variant::parse_dirmeta(&buf)
}

// --- filesystem xattrs ------------------------------------------------------

/// Read all extended attributes of an open file.  Names are returned with
/// their trailing NUL, matching the serialized form.
pub(crate) fn read_all_xattrs(fd: impl std::os::fd::AsFd) -> Result<Vec<Xattr>> {
    let len = rustix::fs::flistxattr(&fd, &mut []).context("listing xattrs")?;
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut names = vec![0u8; len];
    let len = rustix::fs::flistxattr(&fd, &mut names).context("listing xattrs")?;
    names.truncate(len);

    let mut out = Vec::new();
    for name in names.split_inclusive(|&b| b == 0) {
        if name == [0] || name.is_empty() {
            continue;
        }
        let name_str = std::str::from_utf8(&name[..name.len() - 1])
            .context("non-UTF-8 xattr name")?;
        let size = rustix::fs::fgetxattr(&fd, name_str, &mut [])
            .with_context(|| format!("querying xattr {name_str}"))?;
        let mut value = vec![0u8; size];
        let size = rustix::fs::fgetxattr(&fd, name_str, &mut value)
            .with_context(|| format!("reading xattr {name_str}"))?;
        value.truncate(size);
        out.push((name.to_vec(), value));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Apply a serialized xattr list to an open file.
pub(crate) fn apply_xattrs(fd: impl std::os::fd::AsFd, xattrs: &[Xattr]) -> Result<()> {
    for (name, value) in xattrs {
        let name_str = std::str::from_utf8(name.strip_suffix(&[0u8]).unwrap_or(name))
            .context("non-UTF-8 xattr name")?;
        rustix::fs::fsetxattr(&fd, name_str, value, XattrFlags::empty())
            .with_context(|| format!("writing xattr {name_str}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regfile_header() -> FileHeader {
        FileHeader {
            uid: 1000,
            gid: 1000,
            mode: libc::S_IFREG | 0o644,
            ..Default::default()
        }
    }

    #[test]
    fn test_content_header_roundtrip() {
        let h = regfile_header();
        let framed = content_header_bytes(&h);
        let mut r = std::io::Cursor::new(&framed);
        assert_eq!(read_content_header(&mut r).unwrap(), h);
        assert_eq!(r.position() as usize, framed.len());
    }

    #[test]
    fn test_checksum_is_over_header_and_content() {
        let h = regfile_header();
        let (c1, n) = checksum_file(&h, Some(&mut "hello\n".as_bytes())).unwrap();
        assert_eq!(n, 6);
        let (c2, _) = checksum_file(&h, Some(&mut "hello!".as_bytes())).unwrap();
        assert_ne!(c1, c2);
        let mut other = regfile_header();
        other.uid = 0;
        let (c3, _) = checksum_file(&other, Some(&mut "hello\n".as_bytes())).unwrap();
        assert_ne!(c1, c3);
        // Deterministic
        let (c4, _) = checksum_file(&h, Some(&mut "hello\n".as_bytes())).unwrap();
        assert_eq!(c1, c4);
    }

    #[test]
    fn test_filez_roundtrip() {
        let h = regfile_header();
        let content = b"some file content that deflates";
        let mut buf = Vec::new();
        let n = filez_write(&mut buf, &h, content.len() as u64, Some(&mut &content[..]), 6)
            .unwrap();
        assert_eq!(n, content.len() as u64);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.filez");
        std::fs::write(&path, &buf).unwrap();
        let (zh, mut payload) = filez_parse(File::open(&path).unwrap()).unwrap();
        assert_eq!(zh.size, content.len() as u64);
        assert_eq!(zh.header, h);
        let mut out = Vec::new();
        payload.read_to_end(&mut out).unwrap();
        assert_eq!(out, content);
    }

    #[test]
    fn test_filez_symlink_has_no_payload() {
        let h = FileHeader {
            mode: libc::S_IFLNK | 0o777,
            symlink_target: "target".to_string(),
            ..Default::default()
        };
        let mut buf = Vec::new();
        filez_write(&mut buf, &h, 0, None, 6).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.filez");
        std::fs::write(&path, &buf).unwrap();
        let (zh, mut payload) = filez_parse(File::open(&path).unwrap()).unwrap();
        assert_eq!(zh.size, 0);
        assert_eq!(zh.header.symlink_target, "target");
        let mut out = Vec::new();
        payload.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_fileinfo_header_conversion() {
        let info = FileInfo {
            uid: 1,
            gid: 2,
            mode: libc::S_IFLNK | 0o777,
            symlink_target: Some("over/there".to_string()),
            size: 0,
        };
        assert!(info.is_symlink());
        let h = info.to_header(&[]);
        assert_eq!(h.symlink_target, "over/there");
        assert_eq!(FileInfo::from_header(&h, 0), info);
    }
}
