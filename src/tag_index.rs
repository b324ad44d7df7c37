//! Tag dictionary: interned tag strings with dense integer ids.
//!
//! Maps key strings to dense key-ids and, per key, value strings to dense
//! value-ids. Value-ids are assigned in lexicographic order of the value
//! strings, so integer comparison of two value-ids of the same key mirrors
//! string comparison. This is what makes `width>=2.5`-style predicates
//! resolvable to pure integer comparisons at parse time.
//!
//! A feature's tag set is encoded against the dictionary as:
//! - a key bitset: little-endian bit-string, bit k set iff key-id k is
//!   present, trailing zero bytes trimmed;
//! - a value vector: value-ids in ascending key-id order.
//!
//! Persisted as UTF-8 text, one line per key: `KEY=V1|V2|...`, with literal
//! newlines escaped as `\n`. The dictionary is built once by the importer and
//! loaded read-only for queries. Missing lookups return `None`, never an
//! error.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, Write};

use crate::error::{OsmGridError, Result};

/// File name of the persisted dictionary under the index base directory.
pub const TAG_INDEX_FILE: &str = "tag-index";

// ── Tag set encoding ───────────────────────────────────────────────

/// Encoded tag set of a single feature: key bitset + value vector.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TagSet {
    /// Little-endian bit-string; bit k set iff the feature has key-id k.
    /// Trailing zero bytes are trimmed.
    pub key_bits: Vec<u8>,
    /// Value-ids in ascending key-id order (one per set bit).
    pub values: Vec<u32>,
}

impl TagSet {
    pub fn has_key(&self, key_id: u32) -> bool {
        let byte = (key_id / 8) as usize;
        match self.key_bits.get(byte) {
            Some(b) => b & (1 << (key_id % 8)) != 0,
            None => false,
        }
    }

    /// Value-id for a key, or `None` if the key is not set.
    ///
    /// Indexes the value vector by the rank of the key's bit: the number of
    /// set bits below position `key_id`.
    pub fn value_of(&self, key_id: u32) -> Option<u32> {
        if !self.has_key(key_id) {
            return None;
        }
        let rank = self.rank(key_id);
        self.values.get(rank).copied()
    }

    /// Number of set bits strictly below bit position `key_id`.
    fn rank(&self, key_id: u32) -> usize {
        let full_bytes = (key_id / 8) as usize;
        let mut rank: usize = 0;
        for b in self.key_bits.iter().take(full_bytes) {
            rank += b.count_ones() as usize;
        }
        if let Some(b) = self.key_bits.get(full_bytes) {
            let mask = (1u16 << (key_id % 8)) as u8;
            rank += (b & mask.wrapping_sub(1)).count_ones() as usize;
        }
        rank
    }

    /// Iterate `(key_id, value_id)` pairs in ascending key-id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let mut values = self.values.iter().copied();
        self.set_keys().filter_map(move |k| values.next().map(|v| (k, v)))
    }

    /// Iterate set key-ids in ascending order.
    pub fn set_keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.key_bits.iter().enumerate().flat_map(|(i, &b)| {
            (0..8u32)
                .filter(move |bit| b & (1 << bit) != 0)
                .map(move |bit| i as u32 * 8 + bit)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ── Dictionary ─────────────────────────────────────────────────────

/// Read-only tag dictionary. Built by [`TagIndexBuilder`], loaded from disk
/// for queries, shared freely across scan workers without locking.
#[derive(Debug, Default)]
pub struct TagIndex {
    keys: Vec<String>,
    key_ids: HashMap<String, u32>,
    /// Per key-id, value strings in non-decreasing lexicographic order.
    values: Vec<Vec<String>>,
    value_ids: Vec<HashMap<String, u32>>,
}

impl TagIndex {
    pub fn key_id(&self, key: &str) -> Option<u32> {
        self.key_ids.get(key).copied()
    }

    pub fn value_id(&self, key: &str, value: &str) -> Option<(u32, u32)> {
        let key_id = self.key_id(key)?;
        let value_id = self.value_ids[key_id as usize].get(value).copied()?;
        Some((key_id, value_id))
    }

    /// Key string for a valid key-id. Panics on out-of-range ids; callers
    /// only pass ids they obtained from this dictionary.
    pub fn key_string(&self, key_id: u32) -> &str {
        &self.keys[key_id as usize]
    }

    /// Value string, or `""` when either id is out of bounds.
    pub fn value_string(&self, key_id: u32, value_id: u32) -> &str {
        self.values
            .get(key_id as usize)
            .and_then(|vs| vs.get(value_id as usize))
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn value_count(&self, key_id: u32) -> usize {
        self.values.get(key_id as usize).map_or(0, |vs| vs.len())
    }

    /// Id of the greatest stored value ≤ `value` under the build-time
    /// ordering, plus whether the match is exact. `None` when `value` sorts
    /// below every stored value; the last id when it sorts above all.
    pub fn next_lower_value_id(&self, key_id: u32, value: &str) -> Option<(u32, bool)> {
        let values = self.values.get(key_id as usize)?;
        match values.binary_search_by(|v| v.as_str().cmp(value)) {
            Ok(i) => Some((i as u32, true)),
            Err(0) => None,
            Err(i) => Some(((i - 1) as u32, false)),
        }
    }

    /// Encode a tag list against the dictionary. Tags whose key or value is
    /// not interned are dropped; during import the dictionary is total over
    /// the input, so nothing is dropped there.
    pub fn encode_tags<K: AsRef<str>, V: AsRef<str>>(&self, tags: &[(K, V)]) -> TagSet {
        let mut by_key: BTreeMap<u32, u32> = BTreeMap::new();
        for (key, value) in tags {
            if let Some((key_id, value_id)) = self.value_id(key.as_ref(), value.as_ref()) {
                by_key.insert(key_id, value_id);
            }
        }

        let mut key_bits = Vec::new();
        let mut values = Vec::with_capacity(by_key.len());
        for (&key_id, &value_id) in &by_key {
            let byte = (key_id / 8) as usize;
            if key_bits.len() <= byte {
                key_bits.resize(byte + 1, 0u8);
            }
            key_bits[byte] |= 1 << (key_id % 8);
            values.push(value_id);
        }
        TagSet { key_bits, values }
    }

    /// Decode an encoded tag set back to strings.
    pub fn decode_tags(&self, tags: &TagSet) -> Vec<(&str, &str)> {
        tags.iter()
            .map(|(k, v)| (self.key_string(k), self.value_string(k, v)))
            .collect()
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Write the dictionary as text, one line per key: `KEY=V1|V2|...`.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        for (key_id, key) in self.keys.iter().enumerate() {
            write!(writer, "{}=", escape(key))?;
            for (i, value) in self.values[key_id].iter().enumerate() {
                if i > 0 {
                    writer.write_all(b"|")?;
                }
                write!(writer, "{}", escape(value))?;
            }
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Load a dictionary previously written by [`save`](Self::save).
    /// Corrupt lines are fatal.
    pub fn load<R: BufRead>(reader: R) -> Result<Self> {
        let mut index = TagIndex::default();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let eq = line.find('=').ok_or_else(|| {
                OsmGridError::InvalidFormat(format!(
                    "tag-index line {}: missing '=' separator",
                    line_no + 1
                ))
            })?;
            let key = unescape(&line[..eq]);
            let values: Vec<String> = line[eq + 1..].split('|').map(unescape).collect();

            let key_id = index.keys.len() as u32;
            if index.key_ids.insert(key.clone(), key_id).is_some() {
                return Err(OsmGridError::InvalidFormat(format!(
                    "tag-index line {}: duplicate key '{}'",
                    line_no + 1,
                    key
                )));
            }
            let value_ids: HashMap<String, u32> = values
                .iter()
                .enumerate()
                .map(|(i, v)| (v.clone(), i as u32))
                .collect();
            index.keys.push(key);
            index.values.push(values);
            index.value_ids.push(value_ids);
        }
        Ok(index)
    }
}

fn escape(s: &str) -> String {
    if s.contains('\n') {
        s.replace('\n', "\\n")
    } else {
        s.to_string()
    }
}

fn unescape(s: &str) -> String {
    if s.contains("\\n") {
        s.replace("\\n", "\n")
    } else {
        s.to_string()
    }
}

// ── Builder ────────────────────────────────────────────────────────

/// Write-time dictionary builder used by import pass 1. Interns keys and
/// values in encounter order, then [`finish`](Self::finish) sorts each key's
/// values and rebuilds the value→id maps so the sorted-order invariant holds.
#[derive(Debug, Default)]
pub struct TagIndexBuilder {
    keys: Vec<String>,
    key_ids: HashMap<String, u32>,
    values: Vec<Vec<String>>,
    value_ids: Vec<HashMap<String, u32>>,
}

impl TagIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern one tag. Idempotent per (key, value).
    pub fn insert(&mut self, key: &str, value: &str) {
        let key_id = match self.key_ids.get(key) {
            Some(&id) => id,
            None => {
                let id = self.keys.len() as u32;
                self.keys.push(key.to_string());
                self.key_ids.insert(key.to_string(), id);
                self.values.push(Vec::new());
                self.value_ids.push(HashMap::new());
                id
            }
        } as usize;

        if !self.value_ids[key_id].contains_key(value) {
            let value_id = self.values[key_id].len() as u32;
            self.values[key_id].push(value.to_string());
            self.value_ids[key_id].insert(value.to_string(), value_id);
        }
    }

    /// Sort values per key and produce the read-only dictionary. Fails when a
    /// key carries more distinct values than a 24-bit value-id can address.
    pub fn finish(mut self) -> Result<TagIndex> {
        const MAX_VALUES: usize = (1 << 24) - 1;
        for (key_id, values) in self.values.iter_mut().enumerate() {
            if values.len() > MAX_VALUES {
                return Err(OsmGridError::TooManyValues {
                    key: self.keys[key_id].clone(),
                });
            }
            values.sort_unstable();
            self.value_ids[key_id] = values
                .iter()
                .enumerate()
                .map(|(i, v)| (v.clone(), i as u32))
                .collect();
        }
        Ok(TagIndex {
            keys: self.keys,
            key_ids: self.key_ids,
            values: self.values,
            value_ids: self.value_ids,
        })
    }
}
