//! Immutable on-disk hash tables.
//!
//! A hash file maps byte-string keys to byte-string values. Keys need not be
//! unique: every value written under a key can be read back, in write order.
//! Files are written once by a [`HashWriter`] and then read in place by a
//! [`HashReader`] over a [`FileBytes`] view.
//!
//! # Layout
//!
//! ```text
//! header     "HSH3" | hash type: u8 | reserved: u32 | reserved: u32
//! records    (key len: u32, value len: u32, key, value)*
//! tables     256 x (hash: u32, record position: u64)*
//! directory  256 x (table position: u64, slot count: u32)
//! extras     bincode BTreeMap<String, Vec<u8>>
//! trailer    extras len: u32
//! ```
//!
//! All integers are little-endian. A key's hash picks its table with the low
//! byte; the starting slot is `(hash >> 8) % slots` and collisions probe
//! linearly. Each table has twice as many slots as entries, and `(0, 0)` marks
//! an empty slot since no record can start at position 0.
//!
//! The [`ordered`] and [`fielded`] variants add a sorted position index to the
//! extras so keys can be searched by range as well as by value.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WhorlError};
use crate::storage::{FileBytes, Storage, StorageOutput};

pub mod fielded;
pub mod ordered;

/// Magic bytes at the start of every hash file.
pub const MAGIC: &[u8; 4] = b"HSH3";

/// Size of the fixed header.
pub const HEADER_SIZE: usize = 13;

const BUCKETS: usize = 256;
const DIRECTORY_ENTRY_SIZE: usize = 12;
const SLOT_SIZE: usize = 12;

/// Hash function used to place keys, recorded in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HashType {
    /// The cdb "times 33 xor" hash.
    #[default]
    Cdb,
    /// CRC-32.
    Crc32,
    /// XXH3, truncated to 32 bits.
    Xxh3,
}

impl HashType {
    pub fn code(self) -> u8 {
        match self {
            HashType::Cdb => 0,
            HashType::Crc32 => 1,
            HashType::Xxh3 => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(HashType::Cdb),
            1 => Ok(HashType::Crc32),
            2 => Ok(HashType::Xxh3),
            other => Err(WhorlError::format(format!("unknown hash type {other}"))),
        }
    }

    pub fn hash(self, key: &[u8]) -> u32 {
        match self {
            HashType::Cdb => cdb_hash(key),
            HashType::Crc32 => crc32fast::hash(key),
            HashType::Xxh3 => xxhash_rust::xxh3::xxh3_64(key) as u32,
        }
    }
}

fn cdb_hash(key: &[u8]) -> u32 {
    key.iter().fold(5381u32, |h, &c| h.wrapping_add(h << 5) ^ c as u32)
}

/// Writes a hash file. Nothing is readable until [`HashWriter::close`].
#[derive(Debug)]
pub struct HashWriter {
    output: Box<dyn StorageOutput>,
    hash_type: HashType,
    buckets: Vec<Vec<(u32, u64)>>,
    extras: BTreeMap<String, Vec<u8>>,
    position: u64,
}

impl HashWriter {
    /// Start a hash file on `output` and write its header.
    pub fn new(output: Box<dyn StorageOutput>, hash_type: HashType) -> Result<Self> {
        let mut writer = HashWriter {
            output,
            hash_type,
            buckets: vec![Vec::new(); BUCKETS],
            extras: BTreeMap::new(),
            position: 0,
        };

        writer.output.write_all(MAGIC)?;
        writer.output.write_u8(hash_type.code())?;
        writer.output.write_u32::<LittleEndian>(0)?;
        writer.output.write_u32::<LittleEndian>(0)?;
        writer.position = HEADER_SIZE as u64;
        Ok(writer)
    }

    /// Create `name` in `storage` and start a hash file on it.
    pub fn create(storage: &dyn Storage, name: &str, hash_type: HashType) -> Result<Self> {
        HashWriter::new(storage.create_output(name)?, hash_type)
    }

    /// Position where the next record will start.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Append a record. Duplicate keys are allowed.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let key_len = u32::try_from(key.len())
            .map_err(|_| WhorlError::invalid_argument("key longer than 4 GiB"))?;
        let value_len = u32::try_from(value.len())
            .map_err(|_| WhorlError::invalid_argument("value longer than 4 GiB"))?;

        let position = self.position;
        self.output.write_u32::<LittleEndian>(key_len)?;
        self.output.write_u32::<LittleEndian>(value_len)?;
        self.output.write_all(key)?;
        self.output.write_all(value)?;
        self.position += 8 + key.len() as u64 + value.len() as u64;

        let hash = self.hash_type.hash(key);
        self.buckets[(hash & 0xff) as usize].push((hash, position));
        Ok(())
    }

    pub fn add_all<'a, I>(&mut self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        for (key, value) in items {
            self.add(key, value)?;
        }
        Ok(())
    }

    /// Attach a named blob to the file's extras.
    pub fn set_extra(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.extras.insert(name.into(), value);
    }

    /// Write the tables, directory and extras, then close the output.
    pub fn close(mut self) -> Result<()> {
        let mut directory = Vec::with_capacity(BUCKETS);

        for entries in &self.buckets {
            let numslots = entries.len() * 2;
            directory.push((self.position, numslots as u32));

            let mut slots = vec![(0u32, 0u64); numslots];
            for &(hash, position) in entries {
                let mut slot = (hash >> 8) as usize % numslots;
                while slots[slot].1 != 0 {
                    slot = (slot + 1) % numslots;
                }
                slots[slot] = (hash, position);
            }

            for (hash, position) in slots {
                self.output.write_u32::<LittleEndian>(hash)?;
                self.output.write_u64::<LittleEndian>(position)?;
            }
            self.position += (numslots * SLOT_SIZE) as u64;
        }

        for (position, numslots) in directory {
            self.output.write_u64::<LittleEndian>(position)?;
            self.output.write_u32::<LittleEndian>(numslots)?;
        }

        let extras = bincode::serialize(&self.extras)?;
        let extras_len = u32::try_from(extras.len())
            .map_err(|_| WhorlError::invalid_argument("extras longer than 4 GiB"))?;
        self.output.write_all(&extras)?;
        self.output.write_u32::<LittleEndian>(extras_len)?;

        self.output.flush_and_sync()?;
        self.output.close()
    }
}

/// Location of one record inside a hash file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRange {
    pub key_pos: usize,
    pub key_len: usize,
    pub value_pos: usize,
    pub value_len: usize,
}

impl RecordRange {
    /// Position just past the record.
    pub fn end(&self) -> usize {
        self.value_pos + self.value_len
    }
}

/// Reads a hash file in place.
#[derive(Debug, Clone)]
pub struct HashReader {
    bytes: FileBytes,
    hash_type: HashType,
    directory: Arc<[(u64, u32)]>,
    extras: Arc<BTreeMap<String, Vec<u8>>>,
    data_end: usize,
}

impl HashReader {
    /// Open the hash file `name` from `storage`.
    pub fn open(storage: &dyn Storage, name: &str) -> Result<Self> {
        HashReader::from_bytes(storage.open_bytes(name)?)
    }

    /// Parse the header, trailer and directory of a hash file.
    pub fn from_bytes(bytes: FileBytes) -> Result<Self> {
        let len = bytes.len();
        let min_len = HEADER_SIZE + BUCKETS * DIRECTORY_ENTRY_SIZE + 4;
        if len < min_len {
            return Err(WhorlError::format(format!(
                "hash file too short: {len} bytes"
            )));
        }

        if bytes.get(0..4)? != MAGIC {
            return Err(WhorlError::format("unknown magic number in hash file"));
        }
        let hash_type = HashType::from_code(bytes.read_u8(4)?)?;

        let extras_len = bytes.read_u32(len - 4)? as usize;
        let extras_pos = (len - 4)
            .checked_sub(extras_len)
            .ok_or_else(|| WhorlError::format("hash file extras length out of range"))?;
        let extras: BTreeMap<String, Vec<u8>> =
            bincode::deserialize(bytes.get(extras_pos..len - 4)?)?;

        let dir_pos = extras_pos
            .checked_sub(BUCKETS * DIRECTORY_ENTRY_SIZE)
            .ok_or_else(|| WhorlError::format("hash file directory out of range"))?;
        let mut directory = Vec::with_capacity(BUCKETS);
        for i in 0..BUCKETS {
            let pos = dir_pos + i * DIRECTORY_ENTRY_SIZE;
            directory.push((bytes.read_u64(pos)?, bytes.read_u32(pos + 8)?));
        }

        let data_end = directory[0].0 as usize;
        if data_end < HEADER_SIZE || data_end > dir_pos {
            return Err(WhorlError::format("hash file tables out of range"));
        }

        Ok(HashReader {
            bytes,
            hash_type,
            directory: directory.into(),
            extras: Arc::new(extras),
            data_end,
        })
    }

    pub fn hash_type(&self) -> HashType {
        self.hash_type
    }

    /// The underlying byte view.
    pub fn bytes(&self) -> &FileBytes {
        &self.bytes
    }

    /// Named blobs attached by the writer.
    pub fn extras(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.extras
    }

    pub fn extra(&self, name: &str) -> Option<&[u8]> {
        self.extras.get(name).map(Vec::as_slice)
    }

    /// Total number of records.
    pub fn len(&self) -> usize {
        self.directory
            .iter()
            .map(|&(_, numslots)| numslots as usize / 2)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the record header at `pos`.
    pub fn record_at(&self, pos: usize) -> Result<RecordRange> {
        if pos < HEADER_SIZE || pos + 8 > self.data_end {
            return Err(WhorlError::format(format!("no record at position {pos}")));
        }
        let key_len = self.bytes.read_u32(pos)? as usize;
        let value_len = self.bytes.read_u32(pos + 4)? as usize;
        let range = RecordRange {
            key_pos: pos + 8,
            key_len,
            value_pos: pos + 8 + key_len,
            value_len,
        };
        if range.end() > self.data_end {
            return Err(WhorlError::format(format!("record at {pos} overruns the data")));
        }
        Ok(range)
    }

    pub fn key_of(&self, range: &RecordRange) -> Result<&[u8]> {
        self.bytes.get(range.key_pos..range.key_pos + range.key_len)
    }

    pub fn value_of(&self, range: &RecordRange) -> Result<&[u8]> {
        self.bytes.get(range.value_pos..range.end())
    }

    /// A shareable view of a record's value.
    pub fn value_bytes(&self, range: &RecordRange) -> Result<FileBytes> {
        self.bytes.slice(range.value_pos..range.end())
    }

    /// Locations of every record stored under `key`, in write order.
    pub fn ranges_for_key(&self, key: &[u8]) -> Result<Vec<RecordRange>> {
        let mut found = Vec::new();
        self.probe(key, |range| {
            found.push(range);
            true
        })?;
        Ok(found)
    }

    /// Location of the first record stored under `key`.
    pub fn range_for_key(&self, key: &[u8]) -> Result<Option<RecordRange>> {
        let mut found = None;
        self.probe(key, |range| {
            found = Some(range);
            false
        })?;
        Ok(found)
    }

    // Walks the key's probe sequence, calling `visit` for each matching record
    // until it returns false or an empty slot ends the sequence.
    fn probe<F>(&self, key: &[u8], mut visit: F) -> Result<()>
    where
        F: FnMut(RecordRange) -> bool,
    {
        let hash = self.hash_type.hash(key);
        let (table_pos, numslots) = self.directory[(hash & 0xff) as usize];
        if numslots == 0 {
            return Ok(());
        }

        let table_pos = table_pos as usize;
        let numslots = numslots as usize;
        let start = (hash >> 8) as usize % numslots;
        for i in 0..numslots {
            let slot_pos = table_pos + ((start + i) % numslots) * SLOT_SIZE;
            let slot_hash = self.bytes.read_u32(slot_pos)?;
            let record_pos = self.bytes.read_u64(slot_pos + 4)?;
            if record_pos == 0 {
                break;
            }
            if slot_hash == hash {
                let range = self.record_at(record_pos as usize)?;
                if self.key_of(&range)? == key && !visit(range) {
                    break;
                }
            }
        }
        Ok(())
    }

    /// The first value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        match self.range_for_key(key)? {
            Some(range) => Ok(Some(self.value_of(&range)?)),
            None => Ok(None),
        }
    }

    /// Every value stored under `key`, in write order.
    pub fn all(&self, key: &[u8]) -> Result<Vec<&[u8]>> {
        self.ranges_for_key(key)?
            .iter()
            .map(|range| self.value_of(range))
            .collect()
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.range_for_key(key)?.is_some())
    }

    /// Every record in file order.
    pub fn ranges(&self) -> impl Iterator<Item = Result<RecordRange>> + '_ {
        let mut pos = HEADER_SIZE;
        std::iter::from_fn(move || {
            if pos >= self.data_end {
                return None;
            }
            let result = self.record_at(pos);
            pos = match &result {
                Ok(range) => range.end(),
                Err(_) => self.data_end,
            };
            Some(result)
        })
    }

    /// Every `(key, value)` in file order.
    pub fn items(&self) -> impl Iterator<Item = Result<(&[u8], &[u8])>> + '_ {
        self.ranges().map(move |range| {
            let range = range?;
            Ok((self.key_of(&range)?, self.value_of(&range)?))
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = Result<&[u8]>> + '_ {
        self.ranges().map(move |range| self.key_of(&range?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use proptest::collection::btree_map;
    use proptest::prelude::*;

    fn write_table(storage: &MemoryStorage, hash_type: HashType, items: &[(&[u8], &[u8])]) {
        let mut writer = HashWriter::create(storage, "test.hsh", hash_type).unwrap();
        writer.add_all(items.iter().copied()).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_cdb_hash_values() {
        assert_eq!(HashType::Cdb.hash(b""), 5381);
        assert_eq!(HashType::Cdb.hash(b"a"), (5381u32 * 33) ^ 97);
    }

    #[test]
    fn test_get_and_miss() {
        let storage = MemoryStorage::new_default();
        write_table(
            &storage,
            HashType::Cdb,
            &[(b"alpha", b"1"), (b"beta", b"2"), (b"gamma", b"3")],
        );

        let reader = HashReader::open(&storage, "test.hsh").unwrap();
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.get(b"beta").unwrap(), Some(&b"2"[..]));
        assert_eq!(reader.get(b"delta").unwrap(), None);
        assert!(reader.contains_key(b"alpha").unwrap());
        assert!(!reader.contains_key(b"").unwrap());
    }

    #[test]
    fn test_duplicate_keys_keep_write_order() {
        let storage = MemoryStorage::new_default();
        write_table(
            &storage,
            HashType::Crc32,
            &[(b"k", b"v1"), (b"other", b"x"), (b"k", b"v2"), (b"k", b"v3")],
        );

        let reader = HashReader::open(&storage, "test.hsh").unwrap();
        assert_eq!(reader.get(b"k").unwrap(), Some(&b"v1"[..]));
        assert_eq!(
            reader.all(b"k").unwrap(),
            vec![&b"v1"[..], &b"v2"[..], &b"v3"[..]]
        );
        assert!(reader.all(b"missing").unwrap().is_empty());
    }

    #[test]
    fn test_iteration_is_file_order() {
        let storage = MemoryStorage::new_default();
        write_table(&storage, HashType::Xxh3, &[(b"z", b"1"), (b"a", b"2"), (b"m", b"")]);

        let reader = HashReader::open(&storage, "test.hsh").unwrap();
        let items: Vec<(Vec<u8>, Vec<u8>)> = reader
            .items()
            .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            items,
            vec![
                (b"z".to_vec(), b"1".to_vec()),
                (b"a".to_vec(), b"2".to_vec()),
                (b"m".to_vec(), Vec::new()),
            ]
        );
    }

    #[test]
    fn test_extras_and_empty_table() {
        let storage = MemoryStorage::new_default();
        let mut writer = HashWriter::create(&storage, "empty.hsh", HashType::Cdb).unwrap();
        writer.set_extra("note", b"hello".to_vec());
        writer.close().unwrap();

        let reader = HashReader::open(&storage, "empty.hsh").unwrap();
        assert!(reader.is_empty());
        assert_eq!(reader.extra("note"), Some(&b"hello"[..]));
        assert_eq!(reader.get(b"anything").unwrap(), None);
        assert_eq!(reader.items().count(), 0);
    }

    #[test]
    fn test_bad_magic_is_format_error() {
        let storage = MemoryStorage::new_default();
        write_table(&storage, HashType::Cdb, &[(b"k", b"v")]);

        let mut data = storage.open_bytes("test.hsh").unwrap().as_slice().to_vec();
        data[0] = b'X';
        let result = HashReader::from_bytes(FileBytes::new(data.clone()));
        assert!(matches!(result, Err(WhorlError::Format(_))));

        data[0] = b'H';
        data[4] = 9;
        let result = HashReader::from_bytes(FileBytes::new(data));
        assert!(matches!(result, Err(WhorlError::Format(_))));

        let result = HashReader::from_bytes(FileBytes::new(b"HSH3".to_vec()));
        assert!(matches!(result, Err(WhorlError::Format(_))));
    }

    #[test]
    fn test_many_keys_in_one_bucket() {
        let storage = MemoryStorage::new_default();
        let keys: Vec<Vec<u8>> = (0..2000u32).map(|i| i.to_be_bytes().to_vec()).collect();
        let mut writer = HashWriter::create(&storage, "big.hsh", HashType::Cdb).unwrap();
        for key in &keys {
            writer.add(key, key).unwrap();
        }
        writer.close().unwrap();

        let reader = HashReader::open(&storage, "big.hsh").unwrap();
        assert_eq!(reader.len(), keys.len());
        for key in &keys {
            assert_eq!(reader.get(key).unwrap(), Some(key.as_slice()));
        }
    }

    proptest! {
        #[test]
        fn prop_unique_keys_round_trip(
            items in btree_map(prop::collection::vec(any::<u8>(), 0..12),
                               prop::collection::vec(any::<u8>(), 0..12), 0..64),
            code in 0u8..3,
        ) {
            let storage = MemoryStorage::new_default();
            let hash_type = HashType::from_code(code).unwrap();
            let mut writer = HashWriter::create(&storage, "p.hsh", hash_type).unwrap();
            for (key, value) in &items {
                writer.add(key, value).unwrap();
            }
            writer.close().unwrap();

            let reader = HashReader::open(&storage, "p.hsh").unwrap();
            prop_assert_eq!(reader.len(), items.len());
            prop_assert_eq!(reader.items().count(), items.len());
            for (key, value) in &items {
                prop_assert_eq!(reader.get(key).unwrap(), Some(value.as_slice()));
            }
        }
    }
}
