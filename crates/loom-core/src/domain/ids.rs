//! Domain identifiers (strongly-typed IDs).
//!
//! Task and blob identities are content fingerprints: a blake3 digest of the
//! bytes (blobs) or of the canonical `(function, args)` encoding (tasks).
//! Both share one generic `Digest<T>`; the marker type `T` only exists at
//! compile time, so a `TaskId` can never be passed where a `BlobId` is
//! expected.
//!
//! Workers are not content-addressed; they get a ULID so that ids sort by
//! start time in logs and in the `worker` column.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for digest-based identifiers.
pub trait DigestMarker: Send + Sync + 'static {
    /// Human readable kind, used in error messages.
    fn kind() -> &'static str;
}

/// Hex-encoded blake3 digest tagged with what it identifies.
pub struct Digest<T: DigestMarker> {
    hex: String,
    _marker: PhantomData<T>,
}

/// Error returned when a string is not a 64-char lowercase hex digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} digest: {value:?}")]
pub struct InvalidDigest {
    pub kind: &'static str,
    pub value: String,
}

impl<T: DigestMarker> Digest<T> {
    /// Digest of raw bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self::from_hash(blake3::hash(bytes))
    }

    fn from_hash(hash: blake3::Hash) -> Self {
        Self {
            hex: hash.to_hex().to_string(),
            _marker: PhantomData,
        }
    }

    /// Parse a hex digest, rejecting anything that is not 64 lowercase hex chars.
    pub fn parse(value: &str) -> Result<Self, InvalidDigest> {
        let valid = value.len() == 64
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(InvalidDigest {
                kind: T::kind(),
                value: value.to_string(),
            });
        }
        Ok(Self {
            hex: value.to_string(),
            _marker: PhantomData,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.hex
    }

    /// Short form for log lines: first 10 and last 4 chars.
    pub fn short(&self) -> String {
        format!("{}..{}", &self.hex[..10], &self.hex[self.hex.len() - 4..])
    }
}

// Manual impls: derive would put bounds on `T`, which is an uninhabited marker.
impl<T: DigestMarker> Clone for Digest<T> {
    fn clone(&self) -> Self {
        Self {
            hex: self.hex.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: DigestMarker> PartialEq for Digest<T> {
    fn eq(&self, other: &Self) -> bool {
        self.hex == other.hex
    }
}

impl<T: DigestMarker> Eq for Digest<T> {}

impl<T: DigestMarker> std::hash::Hash for Digest<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hex.hash(state);
    }
}

impl<T: DigestMarker> PartialOrd for Digest<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: DigestMarker> Ord for Digest<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.hex.cmp(&other.hex)
    }
}

impl<T: DigestMarker> fmt::Debug for Digest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", T::kind(), self.short())
    }
}

impl<T: DigestMarker> fmt::Display for Digest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

impl<T: DigestMarker> FromStr for Digest<T> {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<T: DigestMarker> Serialize for Digest<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex)
    }
}

impl<'de, T: DigestMarker> Deserialize<'de> for Digest<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ========================================
// Marker types
// ========================================

/// Marker for task fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl DigestMarker for Task {
    fn kind() -> &'static str {
        "task"
    }
}

/// Marker for content-addressed blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Blob {}

impl DigestMarker for Blob {
    fn kind() -> &'static str {
        "blob"
    }
}

/// Fingerprint of `(function, args)`; primary key of a task record.
pub type TaskId = Digest<Task>;

/// Hash of a blob's bytes.
pub type BlobId = Digest<Blob>;

impl TaskId {
    /// Fingerprint of an already-canonical encoding of `(function, args)`.
    pub(crate) fn of_canonical(encoded: &[u8]) -> Self {
        Self::of_bytes(encoded)
    }
}

/// Identifier of a worker (one executor inside a worker group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(Ulid);

impl WorkerId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("worker-").unwrap_or(s);
        Ulid::from_string(raw).map(Self)
    }
}
