//! Hash files whose keys are written in sorted order.
//!
//! The writer records each key's record position in a [`GrowableArray`]
//! stored in the extras under `_index`. Readers binary search that array for
//! the closest key at or after a probe, then scan forward.

use std::cmp::Ordering;

use crate::error::{Result, WhorlError};
use crate::hashtable::{HashReader, HashType, HashWriter, RecordRange};
use crate::storage::{FileBytes, Storage, StorageOutput};
use crate::util::array::GrowableArray;

const INDEX_EXTRA: &str = "_index";

/// Writes a hash file whose keys must arrive in strictly increasing order.
#[derive(Debug)]
pub struct OrderedHashWriter {
    inner: HashWriter,
    positions: GrowableArray,
    last_key: Option<Vec<u8>>,
}

impl OrderedHashWriter {
    pub fn new(output: Box<dyn StorageOutput>, hash_type: HashType) -> Result<Self> {
        Ok(OrderedHashWriter {
            inner: HashWriter::new(output, hash_type)?,
            positions: GrowableArray::new(),
            last_key: None,
        })
    }

    pub fn create(storage: &dyn Storage, name: &str, hash_type: HashType) -> Result<Self> {
        OrderedHashWriter::new(storage.create_output(name)?, hash_type)
    }

    /// Append a record. `key` must sort after every key added so far.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key
            && key <= last.as_slice()
        {
            return Err(WhorlError::index(format!(
                "keys out of order: {:?} after {:?}",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(last)
            )));
        }

        self.positions.push(self.inner.position());
        self.inner.add(key, value)?;
        self.last_key = Some(key.to_vec());
        Ok(())
    }

    pub fn set_extra(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.inner.set_extra(name, value);
    }

    pub fn close(mut self) -> Result<()> {
        self.inner
            .set_extra(INDEX_EXTRA, bincode::serialize(&self.positions)?);
        self.inner.close()
    }
}

/// Reads an ordered hash file.
#[derive(Debug, Clone)]
pub struct OrderedHashReader {
    inner: HashReader,
    positions: GrowableArray,
}

impl OrderedHashReader {
    pub fn open(storage: &dyn Storage, name: &str) -> Result<Self> {
        OrderedHashReader::from_bytes(storage.open_bytes(name)?)
    }

    pub fn from_bytes(bytes: FileBytes) -> Result<Self> {
        let inner = HashReader::from_bytes(bytes)?;
        let index = inner
            .extra(INDEX_EXTRA)
            .ok_or_else(|| WhorlError::format("ordered hash file has no key index"))?;
        let positions = bincode::deserialize(index)?;
        Ok(OrderedHashReader { inner, positions })
    }

    /// The unordered view of the same file.
    pub fn hash(&self) -> &HashReader {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        self.inner.get(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        self.inner.contains_key(key)
    }

    /// The record holding the `ordinal`-th smallest key.
    pub fn range_at(&self, ordinal: usize) -> Result<RecordRange> {
        let pos = self.positions.get(ordinal).ok_or_else(|| {
            WhorlError::not_found(format!(
                "key ordinal {ordinal} out of range for {} keys",
                self.len()
            ))
        })?;
        self.inner.record_at(pos as usize)
    }

    /// The `ordinal`-th smallest key.
    pub fn key_at(&self, ordinal: usize) -> Result<&[u8]> {
        self.inner.key_of(&self.range_at(ordinal)?)
    }

    /// Ordinal of the smallest key not less than `key`; `len()` if none.
    pub fn closest_ordinal(&self, key: &[u8]) -> Result<usize> {
        search_keys(&self.positions, 0, self.len(), |pos| {
            let range = self.inner.record_at(pos as usize)?;
            Ok(self.inner.key_of(&range)?.cmp(key))
        })
    }

    /// The smallest key not less than `key`.
    pub fn closest_key(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        let ordinal = self.closest_ordinal(key)?;
        if ordinal < self.len() {
            Ok(Some(self.key_at(ordinal)?))
        } else {
            Ok(None)
        }
    }

    /// Records from the closest key onward, in key order.
    pub fn ranges_from<'a>(
        &'a self,
        key: &[u8],
    ) -> Result<impl Iterator<Item = Result<RecordRange>> + use<'a>> {
        let start = self.closest_ordinal(key)?;
        Ok((start..self.len()).map(move |ordinal| self.range_at(ordinal)))
    }

    pub fn keys_from<'a>(
        &'a self,
        key: &[u8],
    ) -> Result<impl Iterator<Item = Result<&'a [u8]>> + use<'a>> {
        Ok(self
            .ranges_from(key)?
            .map(move |range| self.inner.key_of(&range?)))
    }

    pub fn items_from<'a>(
        &'a self,
        key: &[u8],
    ) -> Result<impl Iterator<Item = Result<(&'a [u8], &'a [u8])>> + use<'a>> {
        Ok(self.ranges_from(key)?.map(move |range| {
            let range = range?;
            Ok((self.inner.key_of(&range)?, self.inner.value_of(&range)?))
        }))
    }

    /// Every key in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = Result<&[u8]>> + '_ {
        (0..self.len()).map(move |ordinal| self.key_at(ordinal))
    }
}

/// Binary search `positions[lo..hi]` for the first entry whose key compares
/// `Greater` or `Equal` to the probe, as reported by `compare`.
pub(crate) fn search_keys<F>(
    positions: &GrowableArray,
    mut lo: usize,
    mut hi: usize,
    mut compare: F,
) -> Result<usize>
where
    F: FnMut(u64) -> Result<Ordering>,
{
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let pos = positions
            .get(mid)
            .ok_or_else(|| WhorlError::format("key index shorter than expected"))?;
        if compare(pos)? == Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use proptest::collection::btree_set;
    use proptest::prelude::*;

    fn write_sorted(storage: &MemoryStorage, keys: &[&[u8]]) -> OrderedHashReader {
        let mut writer = OrderedHashWriter::create(storage, "o.hsh", HashType::Cdb).unwrap();
        for (i, key) in keys.iter().enumerate() {
            writer.add(key, &[i as u8]).unwrap();
        }
        writer.close().unwrap();
        OrderedHashReader::open(storage, "o.hsh").unwrap()
    }

    #[test]
    fn test_out_of_order_keys_rejected() {
        let storage = MemoryStorage::new_default();
        let mut writer = OrderedHashWriter::create(&storage, "o.hsh", HashType::Cdb).unwrap();
        writer.add(b"b", b"").unwrap();
        assert!(matches!(writer.add(b"a", b""), Err(WhorlError::Index(_))));
        assert!(matches!(writer.add(b"b", b""), Err(WhorlError::Index(_))));
        writer.add(b"c", b"").unwrap();
    }

    #[test]
    fn test_closest_key() {
        let storage = MemoryStorage::new_default();
        let reader = write_sorted(&storage, &[b"apple", b"banana", b"cherry"]);

        assert_eq!(reader.closest_key(b"").unwrap(), Some(&b"apple"[..]));
        assert_eq!(reader.closest_key(b"banana").unwrap(), Some(&b"banana"[..]));
        assert_eq!(reader.closest_key(b"bz").unwrap(), Some(&b"cherry"[..]));
        assert_eq!(reader.closest_key(b"d").unwrap(), None);
    }

    #[test]
    fn test_items_from_and_lookup() {
        let storage = MemoryStorage::new_default();
        let reader = write_sorted(&storage, &[b"a", b"ab", b"b", b"ba"]);

        let items: Vec<(Vec<u8>, Vec<u8>)> = reader
            .items_from(b"aa")
            .unwrap()
            .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            items,
            vec![
                (b"ab".to_vec(), vec![1]),
                (b"b".to_vec(), vec![2]),
                (b"ba".to_vec(), vec![3]),
            ]
        );

        assert_eq!(reader.get(b"b").unwrap(), Some(&[2u8][..]));
        assert!(matches!(reader.key_at(4), Err(WhorlError::NotFound(_))));
    }

    #[test]
    fn test_missing_index_is_format_error() {
        let storage = MemoryStorage::new_default();
        let mut writer = HashWriter::create(&storage, "plain.hsh", HashType::Cdb).unwrap();
        writer.add(b"k", b"v").unwrap();
        writer.close().unwrap();

        assert!(matches!(
            OrderedHashReader::open(&storage, "plain.hsh"),
            Err(WhorlError::Format(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_closest_key_is_smallest_not_less(
            keys in btree_set(prop::collection::vec(any::<u8>(), 0..6), 0..40),
            target in prop::collection::vec(any::<u8>(), 0..6),
        ) {
            let storage = MemoryStorage::new_default();
            let sorted: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
            let mut writer = OrderedHashWriter::create(&storage, "o.hsh", HashType::Crc32).unwrap();
            for key in &sorted {
                writer.add(key, b"").unwrap();
            }
            writer.close().unwrap();
            let reader = OrderedHashReader::open(&storage, "o.hsh").unwrap();

            let expected = keys.range(target.clone()..).next().map(Vec::as_slice);
            prop_assert_eq!(reader.closest_key(&target).unwrap(), expected);

            let from: Vec<Vec<u8>> = reader
                .keys_from(&target)
                .unwrap()
                .map(|k| k.unwrap().to_vec())
                .collect();
            let expected_from: Vec<Vec<u8>> = keys.range(target..).cloned().collect();
            prop_assert_eq!(from, expected_from);
        }
    }
}
