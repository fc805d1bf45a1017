//! Ordered hash files partitioned by field.
//!
//! Keys are stored as a big-endian `u16` field number followed by the term
//! bytes, so hash lookups are scoped to one field. Each field has its own
//! sorted position array. Fields are added in name order, so field numbers
//! sort the same way as names and a full scan yields `(field, term)` pairs in
//! lexicographic order.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WhorlError};
use crate::hashtable::ordered::search_keys;
use crate::hashtable::{HashReader, HashType, HashWriter, RecordRange};
use crate::storage::{FileBytes, Storage, StorageOutput};
use crate::util::array::GrowableArray;

const FIELDS_EXTRA: &str = "_fields";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FieldIndex {
    names: Vec<String>,
    positions: Vec<GrowableArray>,
}

fn field_key(fieldnum: usize, term: &[u8]) -> Result<Vec<u8>> {
    let fieldnum = u16::try_from(fieldnum)
        .map_err(|_| WhorlError::index("too many fields in one term file"))?;
    let mut key = Vec::with_capacity(2 + term.len());
    key.extend_from_slice(&fieldnum.to_be_bytes());
    key.extend_from_slice(term);
    Ok(key)
}

/// Writes terms grouped by field, each field's terms in increasing order.
#[derive(Debug)]
pub struct FieldedOrderedHashWriter {
    inner: HashWriter,
    index: FieldIndex,
    last_term: Option<Vec<u8>>,
}

impl FieldedOrderedHashWriter {
    pub fn new(output: Box<dyn StorageOutput>, hash_type: HashType) -> Result<Self> {
        Ok(FieldedOrderedHashWriter {
            inner: HashWriter::new(output, hash_type)?,
            index: FieldIndex::default(),
            last_term: None,
        })
    }

    pub fn create(storage: &dyn Storage, name: &str, hash_type: HashType) -> Result<Self> {
        FieldedOrderedHashWriter::new(storage.create_output(name)?, hash_type)
    }

    /// Begin a new field. Field names must be added in increasing order.
    pub fn start_field(&mut self, name: &str) -> Result<()> {
        if let Some(last) = self.index.names.last()
            && name <= last.as_str()
        {
            return Err(WhorlError::index(format!(
                "field {name:?} started after {last:?}"
            )));
        }
        self.index.names.push(name.to_string());
        self.index.positions.push(GrowableArray::new());
        self.last_term = None;
        Ok(())
    }

    /// Add a term to the current field.
    pub fn add(&mut self, term: &[u8], value: &[u8]) -> Result<()> {
        let fieldnum = self
            .index
            .names
            .len()
            .checked_sub(1)
            .ok_or_else(|| WhorlError::index("term added before any field was started"))?;

        if let Some(last) = &self.last_term
            && term <= last.as_slice()
        {
            return Err(WhorlError::index(format!(
                "terms out of order in field {:?}: {:?} after {:?}",
                self.index.names[fieldnum],
                String::from_utf8_lossy(term),
                String::from_utf8_lossy(last)
            )));
        }

        let key = field_key(fieldnum, term)?;
        self.index.positions[fieldnum].push(self.inner.position());
        self.inner.add(&key, value)?;
        self.last_term = Some(term.to_vec());
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.inner
            .set_extra(FIELDS_EXTRA, bincode::serialize(&self.index)?);
        self.inner.close()
    }
}

/// Reads a field-partitioned ordered hash file.
#[derive(Debug, Clone)]
pub struct FieldedOrderedHashReader {
    inner: HashReader,
    index: FieldIndex,
}

impl FieldedOrderedHashReader {
    pub fn open(storage: &dyn Storage, name: &str) -> Result<Self> {
        FieldedOrderedHashReader::from_bytes(storage.open_bytes(name)?)
    }

    pub fn from_bytes(bytes: FileBytes) -> Result<Self> {
        let inner = HashReader::from_bytes(bytes)?;
        let extra = inner
            .extra(FIELDS_EXTRA)
            .ok_or_else(|| WhorlError::format("fielded hash file has no field index"))?;
        let index: FieldIndex = bincode::deserialize(extra)?;
        if index.names.len() != index.positions.len() {
            return Err(WhorlError::format("fielded hash file index is inconsistent"));
        }
        Ok(FieldedOrderedHashReader { inner, index })
    }

    /// Names of the fields with at least one term, sorted.
    pub fn field_names(&self) -> &[String] {
        &self.index.names
    }

    pub fn field_num(&self, field: &str) -> Option<usize> {
        self.index
            .names
            .binary_search_by(|name| name.as_str().cmp(field))
            .ok()
    }

    /// Number of distinct terms in `field`.
    pub fn term_count(&self, field: &str) -> usize {
        self.field_num(field)
            .map_or(0, |fieldnum| self.index.positions[fieldnum].len())
    }

    /// Total number of terms in every field.
    pub fn len(&self) -> usize {
        self.index.positions.iter().map(GrowableArray::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn term_get(&self, field: &str, term: &[u8]) -> Result<Option<&[u8]>> {
        match self.field_num(field) {
            Some(fieldnum) => self.inner.get(&field_key(fieldnum, term)?),
            None => Ok(None),
        }
    }

    pub fn contains_term(&self, field: &str, term: &[u8]) -> Result<bool> {
        Ok(self.term_get(field, term)?.is_some())
    }

    fn range_at(&self, fieldnum: usize, ordinal: usize) -> Result<RecordRange> {
        let pos = self.index.positions[fieldnum]
            .get(ordinal)
            .ok_or_else(|| WhorlError::not_found(format!("term ordinal {ordinal}")))?;
        self.inner.record_at(pos as usize)
    }

    fn term_of(&self, range: &RecordRange) -> Result<&[u8]> {
        self.inner
            .key_of(range)?
            .get(2..)
            .ok_or_else(|| WhorlError::format("fielded key shorter than its field prefix"))
    }

    fn closest_ordinal(&self, fieldnum: usize, term: &[u8]) -> Result<usize> {
        let positions = &self.index.positions[fieldnum];
        search_keys(positions, 0, positions.len(), |pos| {
            let range = self.inner.record_at(pos as usize)?;
            Ok(self.term_of(&range)?.cmp(term))
        })
    }

    /// Number of terms stored for the field numbered `fieldnum`.
    pub fn field_len(&self, fieldnum: usize) -> usize {
        self.index.positions.get(fieldnum).map_or(0, GrowableArray::len)
    }

    /// The `ordinal`-th term of the field numbered `fieldnum`.
    pub fn term_at(&self, fieldnum: usize, ordinal: usize) -> Result<&[u8]> {
        if fieldnum >= self.index.positions.len() {
            return Err(WhorlError::not_found(format!("field number {fieldnum}")));
        }
        self.term_of(&self.range_at(fieldnum, ordinal)?)
    }

    /// Ordinal of the smallest term of `field` not less than `term`, as
    /// `(fieldnum, ordinal)`; the ordinal equals the field's length when every
    /// term is smaller.
    pub fn seek(&self, field: &str, term: &[u8]) -> Result<Option<(usize, usize)>> {
        match self.field_num(field) {
            Some(fieldnum) => Ok(Some((fieldnum, self.closest_ordinal(fieldnum, term)?))),
            None => Ok(None),
        }
    }

    /// The smallest term of `field` not less than `term`.
    pub fn closest_term(&self, field: &str, term: &[u8]) -> Result<Option<&[u8]>> {
        let Some(fieldnum) = self.field_num(field) else {
            return Ok(None);
        };
        let ordinal = self.closest_ordinal(fieldnum, term)?;
        if ordinal < self.index.positions[fieldnum].len() {
            Ok(Some(self.term_of(&self.range_at(fieldnum, ordinal)?)?))
        } else {
            Ok(None)
        }
    }

    /// `(term, value)` pairs of `field` from the closest term onward.
    pub fn items_from<'a>(
        &'a self,
        field: &str,
        term: &[u8],
    ) -> Result<impl Iterator<Item = Result<(&'a [u8], &'a [u8])>> + use<'a>> {
        let (fieldnum, start, end) = match self.field_num(field) {
            Some(fieldnum) => (
                fieldnum,
                self.closest_ordinal(fieldnum, term)?,
                self.index.positions[fieldnum].len(),
            ),
            None => (0, 0, 0),
        };

        Ok((start..end).map(move |ordinal| {
            let range = self.range_at(fieldnum, ordinal)?;
            Ok((self.term_of(&range)?, self.inner.value_of(&range)?))
        }))
    }

    pub fn terms_from<'a>(
        &'a self,
        field: &str,
        term: &[u8],
    ) -> Result<impl Iterator<Item = Result<&'a [u8]>> + use<'a>> {
        Ok(self.items_from(field, term)?.map(|item| item.map(|(t, _)| t)))
    }

    /// Every term of `field` in order.
    pub fn terms<'a>(
        &'a self,
        field: &str,
    ) -> Result<impl Iterator<Item = Result<&'a [u8]>> + use<'a>> {
        self.terms_from(field, b"")
    }

    /// Every `(field, term, value)` in `(field, term)` order.
    pub fn all_items(&self) -> impl Iterator<Item = Result<(&str, &[u8], &[u8])>> + '_ {
        self.index
            .positions
            .iter()
            .enumerate()
            .flat_map(move |(fieldnum, positions)| {
                (0..positions.len()).map(move |ordinal| {
                    let range = self.range_at(fieldnum, ordinal)?;
                    Ok((
                        self.index.names[fieldnum].as_str(),
                        self.term_of(&range)?,
                        self.inner.value_of(&range)?,
                    ))
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn build(storage: &MemoryStorage) -> FieldedOrderedHashReader {
        let mut writer =
            FieldedOrderedHashWriter::create(storage, "f.trm", HashType::Cdb).unwrap();
        writer.start_field("body").unwrap();
        writer.add(b"alpha", b"b-alpha").unwrap();
        writer.add(b"beta", b"b-beta").unwrap();
        writer.add(b"gamma", b"b-gamma").unwrap();
        writer.start_field("title").unwrap();
        writer.add(b"beta", b"t-beta").unwrap();
        writer.add(b"zeta", b"t-zeta").unwrap();
        writer.close().unwrap();
        FieldedOrderedHashReader::open(storage, "f.trm").unwrap()
    }

    fn collect_terms<'a>(iter: impl Iterator<Item = Result<&'a [u8]>>) -> Vec<Vec<u8>> {
        iter.map(|t| t.unwrap().to_vec()).collect()
    }

    #[test]
    fn test_lookup_is_field_scoped() {
        let storage = MemoryStorage::new_default();
        let reader = build(&storage);

        assert_eq!(reader.field_names(), &["body".to_string(), "title".to_string()]);
        assert_eq!(reader.term_get("body", b"beta").unwrap(), Some(&b"b-beta"[..]));
        assert_eq!(reader.term_get("title", b"beta").unwrap(), Some(&b"t-beta"[..]));
        assert_eq!(reader.term_get("title", b"alpha").unwrap(), None);
        assert_eq!(reader.term_get("missing", b"alpha").unwrap(), None);
        assert_eq!(reader.term_count("body"), 3);
        assert_eq!(reader.len(), 5);
    }

    #[test]
    fn test_ranges_do_not_cross_fields() {
        let storage = MemoryStorage::new_default();
        let reader = build(&storage);

        assert_eq!(reader.closest_term("body", b"b").unwrap(), Some(&b"beta"[..]));
        assert_eq!(reader.closest_term("body", b"h").unwrap(), None);
        assert_eq!(
            collect_terms(reader.terms_from("body", b"b").unwrap()),
            vec![b"beta".to_vec(), b"gamma".to_vec()]
        );
        assert_eq!(
            collect_terms(reader.terms("title").unwrap()),
            vec![b"beta".to_vec(), b"zeta".to_vec()]
        );
        assert_eq!(reader.terms("nope").unwrap().count(), 0);
    }

    #[test]
    fn test_all_items_in_field_term_order() {
        let storage = MemoryStorage::new_default();
        let reader = build(&storage);

        let all: Vec<(String, Vec<u8>)> = reader
            .all_items()
            .map(|item| item.map(|(f, t, _)| (f.to_string(), t.to_vec())))
            .collect::<Result<_>>()
            .unwrap();
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted);
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn test_writer_ordering_errors() {
        let storage = MemoryStorage::new_default();
        let mut writer =
            FieldedOrderedHashWriter::create(&storage, "bad.trm", HashType::Cdb).unwrap();
        assert!(matches!(writer.add(b"x", b""), Err(WhorlError::Index(_))));

        writer.start_field("m").unwrap();
        writer.add(b"b", b"").unwrap();
        assert!(writer.add(b"a", b"").is_err());
        assert!(writer.start_field("a").is_err());

        writer.start_field("n").unwrap();
        writer.add(b"a", b"").unwrap();
    }
}
