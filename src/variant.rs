//! Canonical serialized object forms.
//!
//! Objects are stored in GVariant normal form with fixed signatures; peers
//! require byte-exact round-trips, so this module carries a small serializer
//! and parser for exactly the signatures the store uses rather than another
//! crate.  Integer fields that the wire contract defines as big-endian
//! (uid/gid/mode, sizes, timestamps) are converted at this boundary; the
//! structured types below hold host-order values.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};

/// Type string for a commit object.
pub const GV_COMMIT: &str = "(a{sv}aya(say)sstayay)";
/// Type string for a directory-tree object.
pub const GV_DIRTREE: &str = "(a(say)a(sayay))";
/// Type string for a directory-metadata (and file-metadata) object.
pub const GV_DIRMETA: &str = "(uuua(ayay))";
/// Type string for detached commit metadata, tombstones and signature files.
pub const GV_VARDICT: &str = "a{sv}";
/// Type string for the content-stream file header.
pub const GV_FILE_HEADER: &str = "(uuuusa(ayay))";
/// Type string for the compressed-object file header.
pub const GV_ZLIB_FILE_HEADER: &str = "(tuuuusa(ayay))";
/// Type string for the repository summary.
pub const GV_SUMMARY: &str = "(a(s(taya{sv}))a{sv})";
/// Type string for a collection map inside the summary metadata.
pub const GV_COLLECTION_MAP: &str = "a{sa(s(taya{sv}))}";

/// An extended attribute: name (no trailing NUL) and value.
pub type Xattr = (Vec<u8>, Vec<u8>);

/// A dictionary of string keys to dynamically typed values (`a{sv}`).
pub type VarDict = BTreeMap<String, Variant>;

/// A dynamically typed value inside a [`VarDict`].  Types the store never
/// produces are preserved byte-for-byte as [`Variant::Opaque`] so that
/// rewriting a dictionary (e.g. appending a signature) does not disturb keys
/// written by other tools.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Variant {
    /// `t`: unsigned 64-bit.
    U64(u64),
    /// `s`: string.
    Str(String),
    /// `ay`: byte array.
    Bytes(Vec<u8>),
    /// `aay`: array of byte arrays.
    BytesArray(Vec<Vec<u8>>),
    /// `a{sv}`: nested dictionary.
    Dict(VarDict),
    /// `a{sa(s(taya{sv}))}`: refs grouped by collection id.
    CollectionMap(BTreeMap<String, Vec<SummaryEntry>>),
    /// Any other type, kept as serialized bytes.
    Opaque {
        /// The GVariant type string.
        ty: String,
        /// The serialized child in normal form.
        data: Vec<u8>,
    },
}

/// Directory (or synthesized file) metadata: ownership, mode, xattrs.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DirMeta {
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// File mode including the file-type bits.
    pub mode: u32,
    /// Extended attributes, sorted by name.
    pub xattrs: Vec<Xattr>,
}

/// A directory listing: file entries and subdirectory entries, each carrying
/// raw 32-byte checksums.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DirTree {
    /// `(name, content checksum)` pairs, sorted by name.
    pub files: Vec<(String, Vec<u8>)>,
    /// `(name, tree checksum, meta checksum)` triples, sorted by name.
    pub dirs: Vec<(String, Vec<u8>, Vec<u8>)>,
}

/// A commit object: the root tree pointer plus history and metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    /// Arbitrary metadata dictionary.
    pub metadata: VarDict,
    /// Raw checksum of the parent commit; empty for the first commit.
    pub parent: Vec<u8>,
    /// Related objects (historical, normally empty).
    pub related: Vec<(String, Vec<u8>)>,
    /// One-line subject.
    pub subject: String,
    /// Long-form body.
    pub body: String,
    /// Seconds since the epoch.
    pub timestamp: u64,
    /// Raw checksum of the root dirtree.
    pub root_tree: Vec<u8>,
    /// Raw checksum of the root dirmeta.
    pub root_meta: Vec<u8>,
}

/// The header of a file object in its canonical content stream.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FileHeader {
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// File mode including the file-type bits.
    pub mode: u32,
    /// Device number; always zero (reserved).
    pub rdev: u32,
    /// Symlink target, empty for regular files.
    pub symlink_target: String,
    /// Extended attributes, sorted by name.
    pub xattrs: Vec<Xattr>,
}

/// The header of a compressed (`.filez`) file object; as [`FileHeader`] but
/// carrying the uncompressed content size.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ZlibFileHeader {
    /// Uncompressed content size.
    pub size: u64,
    /// The common header fields.
    pub header: FileHeader,
}

/// One ref entry in the summary: `(s(taya{sv}))`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummaryEntry {
    /// The ref name.
    pub ref_name: String,
    /// Serialized size of the commit object.
    pub commit_size: u64,
    /// Raw checksum of the commit.
    pub checksum: Vec<u8>,
    /// Per-ref metadata.
    pub metadata: VarDict,
}

/// The decoded summary file.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Summary {
    /// Refs in this repository, sorted by name.
    pub refs: Vec<SummaryEntry>,
    /// Top-level metadata.
    pub metadata: VarDict,
}

// --- Serialization ---------------------------------------------------------
//
// GVariant framing in brief: fixed-size values are stored padded to their
// alignment.  Variable-size members of containers get end offsets appended to
// the container (reversed, for tuples; in order, for arrays), stored as
// little-endian integers whose width is the smallest of 1/2/4/8 that lets the
// whole container fit.  Containers are padded to the maximum alignment of
// their children.  Empty containers are empty byte strings.

fn offset_size(total: usize) -> usize {
    match total {
        t if t <= 0xff => 1,
        t if t <= 0xffff => 2,
        t if t <= 0xffff_ffff => 4,
        _ => 8,
    }
}

fn choose_offset_size(body: usize, n_offsets: usize) -> usize {
    for z in [1usize, 2, 4, 8] {
        let total = body + n_offsets * z;
        if offset_size(total) <= z {
            return z;
        }
    }
    unreachable!("offset size is at most 8")
}

fn write_le(out: &mut Vec<u8>, value: usize, z: usize) {
    let bytes = (value as u64).to_le_bytes();
    out.extend_from_slice(&bytes[..z]);
}

fn read_le(data: &[u8], pos: usize, z: usize) -> Result<usize> {
    let end = pos
        .checked_add(z)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| anyhow!("truncated framing offset"))?;
    let mut buf = [0u8; 8];
    buf[..z].copy_from_slice(&data[pos..end]);
    Ok(u64::from_le_bytes(buf) as usize)
}

fn pad_to(out: &mut Vec<u8>, align: usize) {
    while out.len() % align != 0 {
        out.push(0);
    }
}

/// A serialized child: its bytes, alignment, and whether it is fixed-size.
struct Child {
    data: Vec<u8>,
    align: usize,
    fixed: bool,
}

impl Child {
    fn fixed_u32(v: u32) -> Child {
        Child {
            data: v.to_le_bytes().to_vec(),
            align: 4,
            fixed: true,
        }
    }

    fn fixed_u64(v: u64) -> Child {
        Child {
            data: v.to_le_bytes().to_vec(),
            align: 8,
            fixed: true,
        }
    }

    fn string(s: &str) -> Child {
        let mut data = Vec::with_capacity(s.len() + 1);
        data.extend_from_slice(s.as_bytes());
        data.push(0);
        Child {
            data,
            align: 1,
            fixed: false,
        }
    }

    fn bytes(b: &[u8]) -> Child {
        Child {
            data: b.to_vec(),
            align: 1,
            fixed: false,
        }
    }
}

/// Serialize a tuple from already-serialized members.
fn tuple(members: Vec<Child>) -> Child {
    let align = members.iter().map(|m| m.align).max().unwrap_or(1);
    let all_fixed = members.iter().all(|m| m.fixed);
    let mut body = Vec::new();
    let mut var_ends = Vec::new();
    let last = members.len().saturating_sub(1);
    for (i, m) in members.iter().enumerate() {
        pad_to(&mut body, m.align);
        body.extend_from_slice(&m.data);
        if !m.fixed && i != last {
            var_ends.push(body.len());
        }
    }
    if all_fixed {
        pad_to(&mut body, align);
        return Child {
            data: body,
            align,
            fixed: true,
        };
    }
    let z = choose_offset_size(body.len(), var_ends.len());
    for end in var_ends.iter().rev() {
        write_le(&mut body, *end, z);
    }
    Child {
        data: body,
        align,
        fixed: false,
    }
}

/// Serialize an array from already-serialized elements, which must share
/// alignment and fixedness (they are all of the element type).
fn array(elem_align: usize, elem_fixed: bool, elems: Vec<Child>) -> Child {
    let mut body = Vec::new();
    let mut ends = Vec::new();
    for e in &elems {
        pad_to(&mut body, e.align);
        body.extend_from_slice(&e.data);
        ends.push(body.len());
    }
    if !elem_fixed {
        let z = choose_offset_size(body.len(), ends.len());
        for end in &ends {
            write_le(&mut body, *end, z);
        }
    }
    Child {
        data: body,
        align: elem_align,
        fixed: false,
    }
}

fn xattrs_array(xattrs: &[Xattr]) -> Child {
    let elems = xattrs
        .iter()
        .map(|(k, v)| tuple(vec![Child::bytes(k), Child::bytes(v)]))
        .collect();
    array(1, false, elems)
}

fn variant_child(v: &Variant) -> Child {
    let (ty, child) = match v {
        Variant::U64(n) => ("t".to_string(), Child::fixed_u64(*n)),
        Variant::Str(s) => ("s".to_string(), Child::string(s)),
        Variant::Bytes(b) => ("ay".to_string(), Child::bytes(b)),
        Variant::BytesArray(arrs) => (
            "aay".to_string(),
            array(1, false, arrs.iter().map(|a| Child::bytes(a)).collect()),
        ),
        Variant::Dict(d) => (GV_VARDICT.to_string(), vardict(d)),
        Variant::CollectionMap(m) => (GV_COLLECTION_MAP.to_string(), collection_map(m)),
        Variant::Opaque { ty, data } => (
            ty.clone(),
            Child {
                data: data.clone(),
                align: 8,
                fixed: false,
            },
        ),
    };
    let mut data = child.data;
    data.push(0);
    data.extend_from_slice(ty.as_bytes());
    Child {
        data,
        align: 8,
        fixed: false,
    }
}

fn vardict(dict: &VarDict) -> Child {
    let elems = dict
        .iter()
        .map(|(k, v)| tuple(vec![Child::string(k), variant_child(v)]))
        .collect();
    array(8, false, elems)
}

fn summary_entry(e: &SummaryEntry) -> Child {
    let inner = tuple(vec![
        Child::fixed_u64(e.commit_size.to_be()),
        Child::bytes(&e.checksum),
        vardict(&e.metadata),
    ]);
    tuple(vec![Child::string(&e.ref_name), inner])
}

fn collection_map(map: &BTreeMap<String, Vec<SummaryEntry>>) -> Child {
    let elems = map
        .iter()
        .map(|(id, entries)| {
            let list = array(8, false, entries.iter().map(summary_entry).collect());
            tuple(vec![Child::string(id), list])
        })
        .collect();
    array(8, false, elems)
}

/// Serialize a directory-metadata object.
pub fn serialize_dirmeta(m: &DirMeta) -> Vec<u8> {
    tuple(vec![
        Child::fixed_u32(m.uid.to_be()),
        Child::fixed_u32(m.gid.to_be()),
        Child::fixed_u32(m.mode.to_be()),
        xattrs_array(&m.xattrs),
    ])
    .data
}

/// Serialize a directory-tree object.
pub fn serialize_dirtree(t: &DirTree) -> Vec<u8> {
    let files = array(
        1,
        false,
        t.files
            .iter()
            .map(|(name, csum)| tuple(vec![Child::string(name), Child::bytes(csum)]))
            .collect(),
    );
    let dirs = array(
        1,
        false,
        t.dirs
            .iter()
            .map(|(name, tree, meta)| {
                tuple(vec![
                    Child::string(name),
                    Child::bytes(tree),
                    Child::bytes(meta),
                ])
            })
            .collect(),
    );
    tuple(vec![files, dirs]).data
}

/// Serialize a commit object.
pub fn serialize_commit(c: &Commit) -> Vec<u8> {
    let related = array(
        1,
        false,
        c.related
            .iter()
            .map(|(name, csum)| tuple(vec![Child::string(name), Child::bytes(csum)]))
            .collect(),
    );
    tuple(vec![
        vardict(&c.metadata),
        Child::bytes(&c.parent),
        related,
        Child::string(&c.subject),
        Child::string(&c.body),
        Child::fixed_u64(c.timestamp.to_be()),
        Child::bytes(&c.root_tree),
        Child::bytes(&c.root_meta),
    ])
    .data
}

/// Serialize a metadata dictionary (detached commit metadata, tombstones,
/// signature files).
pub fn serialize_vardict(d: &VarDict) -> Vec<u8> {
    vardict(d).data
}

/// Serialize a content-stream file header.
pub fn serialize_file_header(h: &FileHeader) -> Vec<u8> {
    tuple(vec![
        Child::fixed_u32(h.uid.to_be()),
        Child::fixed_u32(h.gid.to_be()),
        Child::fixed_u32(h.mode.to_be()),
        Child::fixed_u32(h.rdev.to_be()),
        Child::string(&h.symlink_target),
        xattrs_array(&h.xattrs),
    ])
    .data
}

/// Serialize a compressed-object file header.
pub fn serialize_zlib_file_header(h: &ZlibFileHeader) -> Vec<u8> {
    tuple(vec![
        Child::fixed_u64(h.size.to_be()),
        Child::fixed_u32(h.header.uid.to_be()),
        Child::fixed_u32(h.header.gid.to_be()),
        Child::fixed_u32(h.header.mode.to_be()),
        Child::fixed_u32(h.header.rdev.to_be()),
        Child::string(&h.header.symlink_target),
        xattrs_array(&h.header.xattrs),
    ])
    .data
}

/// Serialize a summary file.
pub fn serialize_summary(s: &Summary) -> Vec<u8> {
    let refs = array(8, false, s.refs.iter().map(summary_entry).collect());
    tuple(vec![refs, vardict(&s.metadata)]).data
}

// --- Parsing ---------------------------------------------------------------

/// A parse cursor over one serialized container.
struct Frame<'a> {
    data: &'a [u8],
}

impl<'a> Frame<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn z(&self) -> usize {
        offset_size(self.data.len())
    }

    /// End offset of the i-th variable non-last tuple member (1-indexed).
    fn tuple_member_end(&self, i: usize) -> Result<usize> {
        let z = self.z();
        let pos = self
            .data
            .len()
            .checked_sub(i * z)
            .ok_or_else(|| anyhow!("truncated tuple"))?;
        let end = read_le(self.data, pos, z)?;
        if end > pos {
            bail!("tuple member offset {} beyond frame", end);
        }
        Ok(end)
    }

    /// Split an array of variable-size elements into element frames.
    fn array_elements(&self, elem_align: usize) -> Result<Vec<&'a [u8]>> {
        if self.data.is_empty() {
            return Ok(Vec::new());
        }
        let z = self.z();
        let last_end = read_le(self.data, self.data.len() - z, z)?;
        if last_end > self.data.len() {
            bail!("array frame offset {} beyond frame", last_end);
        }
        let offsets_len = self.data.len() - last_end;
        if offsets_len == 0 || offsets_len % z != 0 {
            bail!("malformed array framing");
        }
        let n = offsets_len / z;
        let mut elems = Vec::with_capacity(n);
        let mut start = 0usize;
        for i in 0..n {
            let end = read_le(self.data, last_end + i * z, z)?;
            if end < start || end > last_end {
                bail!("array element offset out of order");
            }
            elems.push(&self.data[start..end]);
            // The next element begins at the aligned position.
            start = end + pad_len(end, elem_align);
        }
        Ok(elems)
    }
}

fn pad_len(pos: usize, align: usize) -> usize {
    (align - pos % align) % align
}

fn parse_u32_at(data: &[u8], pos: usize) -> Result<u32> {
    let end = pos + 4;
    if end > data.len() {
        bail!("truncated u32");
    }
    Ok(u32::from_le_bytes(data[pos..end].try_into().unwrap()))
}

fn parse_u64_at(data: &[u8], pos: usize) -> Result<u64> {
    let end = pos + 8;
    if end > data.len() {
        bail!("truncated u64");
    }
    Ok(u64::from_le_bytes(data[pos..end].try_into().unwrap()))
}

fn parse_string(data: &[u8]) -> Result<String> {
    let Some((&0, body)) = data.split_last() else {
        bail!("string not NUL terminated");
    };
    let s = std::str::from_utf8(body).context("invalid UTF-8 in string")?;
    if s.as_bytes().contains(&0) {
        bail!("embedded NUL in string");
    }
    Ok(s.to_string())
}

/// Parse `a(ayay)` (an xattr list).
fn parse_xattrs(data: &[u8]) -> Result<Vec<Xattr>> {
    let mut out = Vec::new();
    for elem in Frame::new(data).array_elements(1)? {
        let f = Frame::new(elem);
        let name_end = f.tuple_member_end(1)?;
        out.push((
            elem[..name_end].to_vec(),
            elem[name_end..elem.len() - f.z()].to_vec(),
        ));
    }
    Ok(out)
}

/// Parse `a(say)` (name → checksum pairs).
fn parse_name_csum_array(data: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    for elem in Frame::new(data).array_elements(1)? {
        let f = Frame::new(elem);
        let name_end = f.tuple_member_end(1)?;
        let name = parse_string(&elem[..name_end])?;
        out.push((name, elem[name_end..elem.len() - f.z()].to_vec()));
    }
    Ok(out)
}

fn parse_variant(data: &[u8]) -> Result<Variant> {
    let sep = data
        .iter()
        .rposition(|&b| b == 0)
        .ok_or_else(|| anyhow!("missing variant type separator"))?;
    let (child, ty) = (&data[..sep], &data[sep + 1..]);
    let ty = std::str::from_utf8(ty).context("invalid variant type string")?;
    Ok(match ty {
        "t" => Variant::U64(parse_u64_at(child, 0)?),
        "s" => Variant::Str(parse_string(child)?),
        "ay" => Variant::Bytes(child.to_vec()),
        "aay" => Variant::BytesArray(
            Frame::new(child)
                .array_elements(1)?
                .into_iter()
                .map(|e| e.to_vec())
                .collect(),
        ),
        GV_VARDICT => Variant::Dict(parse_vardict(child)?),
        GV_COLLECTION_MAP => Variant::CollectionMap(parse_collection_map(child)?),
        _ => Variant::Opaque {
            ty: ty.to_string(),
            data: child.to_vec(),
        },
    })
}

/// Parse a metadata dictionary.
pub fn parse_vardict(data: &[u8]) -> Result<VarDict> {
    let mut out = VarDict::new();
    for elem in Frame::new(data).array_elements(8)? {
        let f = Frame::new(elem);
        let key_end = f.tuple_member_end(1)?;
        let key = parse_string(&elem[..key_end])?;
        let vstart = key_end + pad_len(key_end, 8);
        let value = parse_variant(&elem[vstart..elem.len() - f.z()])?;
        out.insert(key, value);
    }
    Ok(out)
}

/// Parse a directory-metadata object.
pub fn parse_dirmeta(data: &[u8]) -> Result<DirMeta> {
    // Fixed members only before the final array, so no leading offsets.
    let uid = u32::from_be(parse_u32_at(data, 0)?);
    let gid = u32::from_be(parse_u32_at(data, 4)?);
    let mode = u32::from_be(parse_u32_at(data, 8)?);
    let xattrs = parse_xattrs(&data[12..])?;
    Ok(DirMeta {
        uid,
        gid,
        mode,
        xattrs,
    })
}

/// Parse a directory-tree object.
pub fn parse_dirtree(data: &[u8]) -> Result<DirTree> {
    let f = Frame::new(data);
    let files_end = f.tuple_member_end(1)?;
    let files = parse_name_csum_array(&data[..files_end])?;
    let mut dirs = Vec::new();
    let dirs_data = &data[files_end..data.len() - f.z()];
    for elem in Frame::new(dirs_data).array_elements(1)? {
        let ef = Frame::new(elem);
        let name_end = ef.tuple_member_end(1)?;
        let tree_end = ef.tuple_member_end(2)?;
        let name = parse_string(&elem[..name_end])?;
        dirs.push((
            name,
            elem[name_end..tree_end].to_vec(),
            elem[tree_end..elem.len() - 2 * ef.z()].to_vec(),
        ));
    }
    Ok(DirTree { files, dirs })
}

/// Parse a commit object.
pub fn parse_commit(data: &[u8]) -> Result<Commit> {
    let f = Frame::new(data);
    // Member layout: a{sv} ay a(say) s s t ay ay; six framing offsets, for
    // every variable member but the trailing ay.
    let meta_end = f.tuple_member_end(1)?;
    let parent_end = f.tuple_member_end(2)?;
    let related_end = f.tuple_member_end(3)?;
    let subject_end = f.tuple_member_end(4)?;
    let body_end = f.tuple_member_end(5)?;
    let tree_end = f.tuple_member_end(6)?;

    let metadata = parse_vardict(&data[..meta_end])?;
    let parent = data[meta_end..parent_end].to_vec();
    let related = parse_name_csum_array(&data[parent_end..related_end])?;
    let subject = parse_string(&data[related_end..subject_end])?;
    let body = parse_string(&data[subject_end..body_end])?;
    let ts_start = body_end + pad_len(body_end, 8);
    let timestamp = u64::from_be(parse_u64_at(data, ts_start)?);
    let root_tree = data[ts_start + 8..tree_end].to_vec();
    let root_meta = data[tree_end..data.len() - 6 * f.z()].to_vec();
    Ok(Commit {
        metadata,
        parent,
        related,
        subject,
        body,
        timestamp,
        root_tree,
        root_meta,
    })
}

/// Parse a content-stream file header.
pub fn parse_file_header(data: &[u8]) -> Result<FileHeader> {
    let f = Frame::new(data);
    let target_end = f.tuple_member_end(1)?;
    let uid = u32::from_be(parse_u32_at(data, 0)?);
    let gid = u32::from_be(parse_u32_at(data, 4)?);
    let mode = u32::from_be(parse_u32_at(data, 8)?);
    let rdev = u32::from_be(parse_u32_at(data, 12)?);
    let symlink_target = parse_string(&data[16..target_end])?;
    let xattrs = parse_xattrs(&data[target_end..data.len() - f.z()])?;
    Ok(FileHeader {
        uid,
        gid,
        mode,
        rdev,
        symlink_target,
        xattrs,
    })
}

/// Parse a compressed-object file header.
pub fn parse_zlib_file_header(data: &[u8]) -> Result<ZlibFileHeader> {
    let f = Frame::new(data);
    let target_end = f.tuple_member_end(1)?;
    let size = u64::from_be(parse_u64_at(data, 0)?);
    let uid = u32::from_be(parse_u32_at(data, 8)?);
    let gid = u32::from_be(parse_u32_at(data, 12)?);
    let mode = u32::from_be(parse_u32_at(data, 16)?);
    let rdev = u32::from_be(parse_u32_at(data, 20)?);
    let symlink_target = parse_string(&data[24..target_end])?;
    let xattrs = parse_xattrs(&data[target_end..data.len() - f.z()])?;
    Ok(ZlibFileHeader {
        size,
        header: FileHeader {
            uid,
            gid,
            mode,
            rdev,
            symlink_target,
            xattrs,
        },
    })
}

fn parse_summary_entry(elem: &[u8]) -> Result<SummaryEntry> {
    let f = Frame::new(elem);
    let name_end = f.tuple_member_end(1)?;
    let ref_name = parse_string(&elem[..name_end])?;
    let inner_start = name_end + pad_len(name_end, 8);
    let inner = &elem[inner_start..elem.len() - f.z()];
    let inf = Frame::new(inner);
    let csum_end = inf.tuple_member_end(1)?;
    let commit_size = u64::from_be(parse_u64_at(inner, 0)?);
    let checksum = inner[8..csum_end].to_vec();
    let meta_start = csum_end + pad_len(csum_end, 8);
    let metadata = parse_vardict(&inner[meta_start..inner.len() - inf.z()])?;
    Ok(SummaryEntry {
        ref_name,
        commit_size,
        checksum,
        metadata,
    })
}

fn parse_collection_map(data: &[u8]) -> Result<BTreeMap<String, Vec<SummaryEntry>>> {
    let mut out = BTreeMap::new();
    for elem in Frame::new(data).array_elements(8)? {
        let f = Frame::new(elem);
        let id_end = f.tuple_member_end(1)?;
        let id = parse_string(&elem[..id_end])?;
        let list_start = id_end + pad_len(id_end, 8);
        let list = &elem[list_start..elem.len() - f.z()];
        let entries = Frame::new(list)
            .array_elements(8)?
            .into_iter()
            .map(parse_summary_entry)
            .collect::<Result<Vec<_>>>()?;
        out.insert(id, entries);
    }
    Ok(out)
}

/// Parse a summary file.
pub fn parse_summary(data: &[u8]) -> Result<Summary> {
    let f = Frame::new(data);
    let refs_end = f.tuple_member_end(1)?;
    let refs = Frame::new(&data[..refs_end])
        .array_elements(8)?
        .into_iter()
        .map(parse_summary_entry)
        .collect::<Result<Vec<_>>>()?;
    let metadata = parse_vardict(&data[refs_end..data.len() - f.z()])?;
    Ok(Summary { refs, metadata })
}
