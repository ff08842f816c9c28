//! SHA-256 object names and streaming digest computation.

use std::fmt;
use std::io::Write;

use anyhow::{anyhow, Result};
use openssl::hash::{Hasher, MessageDigest};

/// Length of a binary SHA-256 digest.
pub const DIGEST_LEN: usize = 32;
/// Length of the lowercase-hex textual form.
pub const HEX_LEN: usize = 64;

/// A SHA-256 digest naming an object.  The canonical textual form is 64
/// lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; DIGEST_LEN]);

impl Checksum {
    /// Wrap a raw 32-byte digest.
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse the 64-character hex form, rejecting uppercase and wrong lengths.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != HEX_LEN {
            return Err(anyhow!("invalid checksum length {}: {}", s.len(), s));
        }
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(anyhow!("invalid non-lowercase checksum: {}", s));
        }
        let mut buf = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut buf).map_err(|_| anyhow!("invalid checksum: {}", s))?;
        Ok(Self(buf))
    }

    /// Parse a digest from a byte slice (e.g. out of a summary entry).
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let buf: [u8; DIGEST_LEN] = bytes
            .try_into()
            .map_err(|_| anyhow!("invalid digest length {}", bytes.len()))?;
        Ok(Self(buf))
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// The canonical hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Digest a complete buffer.
    pub fn digest(data: &[u8]) -> Self {
        let digest = openssl::hash::hash(MessageDigest::sha256(), data)
            .expect("openssl sha256 is always available");
        Self(digest.as_ref().try_into().unwrap())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl std::str::FromStr for Checksum {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// An incremental SHA-256 computation implementing [`std::io::Write`], so
/// object streams can be hashed while being copied.
pub struct ChecksumWriter {
    hasher: Hasher,
    len: u64,
}

impl ChecksumWriter {
    /// Begin a new digest computation.
    pub fn new() -> Result<Self> {
        Ok(Self {
            hasher: Hasher::new(MessageDigest::sha256())?,
            len: 0,
        })
    }

    /// Number of bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Finish, returning the digest.
    pub fn finish(mut self) -> Result<Checksum> {
        let digest = self.hasher.finish()?;
        Ok(Checksum(digest.as_ref().try_into().unwrap()))
    }
}

impl Write for ChecksumWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher
            .update(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.len += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
