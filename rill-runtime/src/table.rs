//! # Effect Table
//!
//! The binary table a compiled module carries in its `rill.effects` custom
//! section. It is built once at emission time, is read-only at run time, and
//! is parsed by the host runner before any resumable export is invoked.
//!
//! ## Format (version 2, little endian)
//!
//! ```text
//! header   [version:u32][opCount:u32]
//! entries  opCount x 28 bytes:
//!          [effectIdLow:u32][effectIdHigh:u32][effectIdNameOffset:u32]
//!          [opId:u32][resumeKind:u32][signatureHash:u32][labelOffset:u32]
//! blob     NUL-terminated UTF-8 strings referenced by the two offsets
//! ```
//!
//! Offsets are relative to the start of the blob. Identical strings share
//! one blob entry.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::outcome::ResumeKind;
use crate::wire::get_u32;

/// Name of the custom section holding the table.
pub const EFFECT_TABLE_SECTION: &str = "rill.effects";
/// Current table format version.
pub const EFFECT_TABLE_VERSION: u32 = 2;
/// Size of the table header.
pub const HEADER_SIZE: usize = 8;
/// Size of one fixed-size entry.
pub const ENTRY_SIZE: usize = 28;

/// Stable 64-bit identifier of an effect, derived from its name.
pub fn effect_id_hash(effect_name: &str) -> u64 {
    let hash = blake3::hash(effect_name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Stable 32-bit hash of an operation's canonical signature string.
pub fn signature_hash(signature: &str) -> u32 {
    let hash = blake3::hash(signature.as_bytes());
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&hash.as_bytes()[..4]);
    u32::from_le_bytes(bytes)
}

/// One operation in the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectTableEntry {
    /// Hash of the owning effect's name.
    pub effect_id: u64,
    /// Name of the owning effect.
    pub effect_name: String,
    /// Operation index within its effect.
    pub op_id: u32,
    /// Resumption discipline.
    pub resume_kind: ResumeKind,
    /// Hash of the canonical signature.
    pub signature_hash: u32,
    /// Human-readable `Effect.op` label.
    pub label: String,
}

/// Errors from decoding a table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    /// The section is shorter than its header or entries claim.
    #[error("effect table truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },
    /// The table was written by an incompatible compiler.
    #[error("unsupported effect table version {0} (expected {EFFECT_TABLE_VERSION})")]
    UnsupportedVersion(u32),
    /// A string offset points outside the blob or misses its terminator.
    #[error("bad string offset {offset} in entry {entry}")]
    BadOffset {
        /// Entry ordinal.
        entry: usize,
        /// Offending offset.
        offset: u32,
    },
    /// A blob string is not valid UTF-8.
    #[error("entry {0} references a string that is not valid UTF-8")]
    InvalidUtf8(usize),
    /// An entry carries an unknown resume kind.
    #[error("entry {entry} has unknown resume kind {kind}")]
    UnknownResumeKind {
        /// Entry ordinal.
        entry: usize,
        /// Raw value.
        kind: u32,
    },
    /// The recorded effect id does not match the hash of the recorded name.
    #[error("entry {0}: effect id does not match its effect name")]
    EffectIdMismatch(usize),
}

/// An ordered effect table. The position of an entry is its ordinal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectTable {
    entries: Vec<EffectTableEntry>,
}

impl EffectTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, returning its ordinal.
    pub fn push(&mut self, entry: EffectTableEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// All entries in ordinal order.
    pub fn entries(&self) -> &[EffectTableEntry] {
        &self.entries
    }

    /// Entry at an ordinal.
    pub fn get(&self, ordinal: usize) -> Option<&EffectTableEntry> {
        self.entries.get(ordinal)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ordinal of the entry with this effect id and op id.
    pub fn find(&self, effect_id: u64, op_id: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.effect_id == effect_id && e.op_id == op_id)
    }

    /// Serialize into the binary section format.
    pub fn encode(&self) -> Vec<u8> {
        let mut blob: Vec<u8> = Vec::new();
        let mut offsets: FxHashMap<&str, u32> = FxHashMap::default();

        let mut fixed = Vec::with_capacity(HEADER_SIZE + self.entries.len() * ENTRY_SIZE);
        fixed.extend_from_slice(&EFFECT_TABLE_VERSION.to_le_bytes());
        fixed.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            let name_offset = intern(&mut offsets, &mut blob, &entry.effect_name);
            let label_offset = intern(&mut offsets, &mut blob, &entry.label);
            fixed.extend_from_slice(&(entry.effect_id as u32).to_le_bytes());
            fixed.extend_from_slice(&((entry.effect_id >> 32) as u32).to_le_bytes());
            fixed.extend_from_slice(&name_offset.to_le_bytes());
            fixed.extend_from_slice(&entry.op_id.to_le_bytes());
            fixed.extend_from_slice(&entry.resume_kind.as_u32().to_le_bytes());
            fixed.extend_from_slice(&entry.signature_hash.to_le_bytes());
            fixed.extend_from_slice(&label_offset.to_le_bytes());
        }
        fixed.extend_from_slice(&blob);
        fixed
    }

    /// Parse the binary section format.
    pub fn decode(bytes: &[u8]) -> Result<Self, TableError> {
        if bytes.len() < HEADER_SIZE {
            return Err(TableError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let version = get_u32(bytes, 0);
        if version != EFFECT_TABLE_VERSION {
            return Err(TableError::UnsupportedVersion(version));
        }
        let count = get_u32(bytes, 4) as usize;
        let blob_start = HEADER_SIZE + count * ENTRY_SIZE;
        if bytes.len() < blob_start {
            return Err(TableError::Truncated {
                needed: blob_start,
                available: bytes.len(),
            });
        }
        let blob = &bytes[blob_start..];

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = HEADER_SIZE + i * ENTRY_SIZE;
            let low = get_u32(bytes, at) as u64;
            let high = get_u32(bytes, at + 4) as u64;
            let name_offset = get_u32(bytes, at + 8);
            let op_id = get_u32(bytes, at + 12);
            let raw_kind = get_u32(bytes, at + 16);
            let signature_hash = get_u32(bytes, at + 20);
            let label_offset = get_u32(bytes, at + 24);

            let resume_kind = ResumeKind::from_u32(raw_kind).ok_or(TableError::UnknownResumeKind {
                entry: i,
                kind: raw_kind,
            })?;
            let effect_name = read_blob_string(blob, i, name_offset)?;
            let label = read_blob_string(blob, i, label_offset)?;
            let effect_id = low | (high << 32);
            if effect_id != effect_id_hash(&effect_name) {
                return Err(TableError::EffectIdMismatch(i));
            }
            entries.push(EffectTableEntry {
                effect_id,
                effect_name,
                op_id,
                resume_kind,
                signature_hash,
                label,
            });
        }
        Ok(Self { entries })
    }
}

/// Blob offset of `s`, appending it on first use.
fn intern<'a>(offsets: &mut FxHashMap<&'a str, u32>, blob: &mut Vec<u8>, s: &'a str) -> u32 {
    *offsets.entry(s).or_insert_with(|| {
        let at = blob.len() as u32;
        blob.extend_from_slice(s.as_bytes());
        blob.push(0);
        at
    })
}

impl FromIterator<EffectTableEntry> for EffectTable {
    fn from_iter<I: IntoIterator<Item = EffectTableEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn read_blob_string(blob: &[u8], entry: usize, offset: u32) -> Result<String, TableError> {
    let start = offset as usize;
    let bad = TableError::BadOffset { entry, offset };
    if start >= blob.len() {
        return Err(bad);
    }
    let len = blob[start..].iter().position(|&b| b == 0).ok_or(bad)?;
    std::str::from_utf8(&blob[start..start + len])
        .map(str::to_owned)
        .map_err(|_| TableError::InvalidUtf8(entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(effect: &str, op: &str, op_id: u32, kind: ResumeKind) -> EffectTableEntry {
        EffectTableEntry {
            effect_id: effect_id_hash(effect),
            effect_name: effect.to_string(),
            op_id,
            resume_kind: kind,
            signature_hash: signature_hash(&format!("{effect}.{op}(i32)->i32")),
            label: format!("{effect}.{op}"),
        }
    }

    fn tuples(table: &EffectTable) -> Vec<(u64, u32, ResumeKind, u32, String)> {
        table
            .entries()
            .iter()
            .map(|e| (e.effect_id, e.op_id, e.resume_kind, e.signature_hash, e.label.clone()))
            .collect()
    }

    fn table_of(n: usize) -> EffectTable {
        (0..n)
            .map(|i| {
                let kind = if i % 2 == 0 { ResumeKind::Resume } else { ResumeKind::Tail };
                entry(&format!("Effect{}", i / 4), &format!("op{i}"), (i % 4) as u32, kind)
            })
            .collect()
    }

    #[test]
    fn test_roundtrip_sizes() {
        for n in [0usize, 1, 16] {
            let table = table_of(n);
            let bytes = table.encode();
            let decoded = EffectTable::decode(&bytes).unwrap();
            assert_eq!(decoded.len(), n);
            assert_eq!(tuples(&decoded), tuples(&table));
        }
    }

    #[test]
    fn test_empty_table_is_header_only() {
        let bytes = EffectTable::new().encode();
        assert_eq!(bytes, vec![2, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_layout_is_fixed_size() {
        let table = table_of(3);
        let bytes = table.encode();
        // Blob: "Effect0\0Effect0.op0\0Effect0.op1\0Effect0.op2\0" (name shared).
        let blob_len = 8 + 12 * 3;
        assert_eq!(bytes.len(), HEADER_SIZE + 3 * ENTRY_SIZE + blob_len);
        assert_eq!(get_u32(&bytes, 4), 3);
        // Every entry points at the same effect name.
        for i in 0..3 {
            assert_eq!(get_u32(&bytes, HEADER_SIZE + i * ENTRY_SIZE + 8), 0);
        }
    }

    #[test]
    fn test_version_mismatch() {
        let mut bytes = table_of(1).encode();
        bytes[0] = 1;
        assert_eq!(EffectTable::decode(&bytes), Err(TableError::UnsupportedVersion(1)));
    }

    #[test]
    fn test_truncated_entries() {
        let bytes = table_of(2).encode();
        let err = EffectTable::decode(&bytes[..HEADER_SIZE + ENTRY_SIZE]).unwrap_err();
        assert!(matches!(err, TableError::Truncated { .. }));
    }

    #[test]
    fn test_bad_offset() {
        let mut bytes = table_of(1).encode();
        let label_at = HEADER_SIZE + 24;
        bytes[label_at..label_at + 4].copy_from_slice(&9999u32.to_le_bytes());
        assert_eq!(
            EffectTable::decode(&bytes),
            Err(TableError::BadOffset { entry: 0, offset: 9999 })
        );
    }

    #[test]
    fn test_effect_hash_is_stable_and_distinct() {
        assert_eq!(effect_id_hash("Async"), effect_id_hash("Async"));
        assert_ne!(effect_id_hash("Async"), effect_id_hash("State"));
        assert_ne!(signature_hash("a"), signature_hash("b"));
    }

    #[test]
    fn test_find() {
        let table = table_of(16);
        let e = &table.entries()[5];
        assert_eq!(table.find(e.effect_id, e.op_id), Some(5));
        assert_eq!(table.find(0, 0), None);
    }
}
