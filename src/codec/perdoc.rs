//! Per-document segment files: field lengths, stored fields and columns.
//!
//! - `.fln`: bincode map of field name to one `u32` length per document.
//! - `.sto`: bincode-encoded [`Document`] records, then a `u64` offset per
//!   document, then the document count as `u64`.
//! - `.col`: a hash file keyed by field name whose values are bincode
//!   `Vec<Option<ColumnValue>>`, decoded on first use.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use ahash::AHashMap;
use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::Mutex;

use crate::error::{Result, WhorlError};
use crate::hashtable::{HashReader, HashType, HashWriter};
use crate::schema::{ColumnValue, Document};
use crate::storage::{FileBytes, Storage};

/// Field lengths of every document in a segment.
#[derive(Debug, Clone, Default)]
pub struct LengthsReader {
    lengths: BTreeMap<String, Vec<u32>>,
    totals: BTreeMap<String, u64>,
}

impl LengthsReader {
    pub fn write(storage: &dyn Storage, name: &str, lengths: &BTreeMap<String, Vec<u32>>) -> Result<()> {
        let mut output = storage.create_output(name)?;
        output.write_all(&bincode::serialize(lengths)?)?;
        output.flush_and_sync()?;
        output.close()
    }

    pub fn open(storage: &dyn Storage, name: &str) -> Result<Self> {
        let bytes = storage.open_bytes(name)?;
        let lengths: BTreeMap<String, Vec<u32>> = bincode::deserialize(bytes.as_slice())?;
        let totals = lengths
            .iter()
            .map(|(field, values)| (field.clone(), values.iter().map(|&l| l as u64).sum()))
            .collect();
        Ok(LengthsReader { lengths, totals })
    }

    pub fn doc_field_length(&self, docnum: u64, field: &str) -> u32 {
        self.lengths
            .get(field)
            .and_then(|values| values.get(docnum as usize))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of the field's lengths over every document, deleted or not.
    pub fn field_length(&self, field: &str) -> u64 {
        self.totals.get(field).copied().unwrap_or(0)
    }

    pub fn min_field_length(&self, field: &str) -> u32 {
        self.lengths
            .get(field)
            .and_then(|values| values.iter().copied().filter(|&l| l > 0).min())
            .unwrap_or(0)
    }

    pub fn max_field_length(&self, field: &str) -> u32 {
        self.lengths
            .get(field)
            .and_then(|values| values.iter().copied().max())
            .unwrap_or(0)
    }
}

/// Writes the `.sto` stored-fields file.
pub fn write_stored(storage: &dyn Storage, name: &str, docs: &[Document]) -> Result<()> {
    let mut output = storage.create_output(name)?;
    let mut offsets = Vec::with_capacity(docs.len());
    let mut position = 0u64;
    for doc in docs {
        let bytes = bincode::serialize(doc)?;
        offsets.push(position);
        output.write_all(&bytes)?;
        position += bytes.len() as u64;
    }
    for offset in offsets {
        output.write_u64::<LittleEndian>(offset)?;
    }
    output.write_u64::<LittleEndian>(docs.len() as u64)?;
    output.flush_and_sync()?;
    output.close()
}

/// Random access to stored documents.
#[derive(Debug, Clone)]
pub struct StoredReader {
    bytes: FileBytes,
    count: usize,
    table_start: usize,
}

impl StoredReader {
    pub fn open(storage: &dyn Storage, name: &str) -> Result<Self> {
        let bytes = storage.open_bytes(name)?;
        if bytes.len() < 8 {
            return Err(WhorlError::format(format!("stored fields file {name} is truncated")));
        }
        let count = bytes.read_u64(bytes.len() - 8)? as usize;
        let table_start = (bytes.len() - 8)
            .checked_sub(count * 8)
            .ok_or_else(|| WhorlError::format(format!("bad document count in {name}")))?;
        Ok(StoredReader {
            bytes,
            count,
            table_start,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn document(&self, docnum: u64) -> Result<Document> {
        let docnum = docnum as usize;
        if docnum >= self.count {
            return Err(WhorlError::not_found(format!(
                "document {docnum} out of range for {} documents",
                self.count
            )));
        }
        let start = self.bytes.read_u64(self.table_start + docnum * 8)? as usize;
        let end = if docnum + 1 < self.count {
            self.bytes.read_u64(self.table_start + (docnum + 1) * 8)? as usize
        } else {
            self.table_start
        };
        Ok(bincode::deserialize(self.bytes.get(start..end)?)?)
    }
}

/// Writes the `.col` column file.
pub fn write_columns(
    storage: &dyn Storage,
    name: &str,
    hash_type: HashType,
    columns: &BTreeMap<String, Vec<Option<ColumnValue>>>,
) -> Result<()> {
    let mut writer = HashWriter::create(storage, name, hash_type)?;
    for (field, values) in columns {
        writer.add(field.as_bytes(), &bincode::serialize(values)?)?;
    }
    writer.close()
}

type Column = Arc<Vec<Option<ColumnValue>>>;

/// Per-document column values, decoded one field at a time.
#[derive(Debug)]
pub struct ColumnReader {
    table: HashReader,
    cache: Mutex<AHashMap<String, Option<Column>>>,
}

impl ColumnReader {
    pub fn open(storage: &dyn Storage, name: &str) -> Result<Self> {
        Ok(ColumnReader {
            table: HashReader::open(storage, name)?,
            cache: Mutex::new(AHashMap::new()),
        })
    }

    pub fn has_column(&self, field: &str) -> Result<bool> {
        self.table.contains_key(field.as_bytes())
    }

    pub fn column(&self, field: &str) -> Result<Option<Column>> {
        let mut cache = self.cache.lock();
        if let Some(column) = cache.get(field) {
            return Ok(column.clone());
        }
        let column = match self.table.get(field.as_bytes())? {
            Some(bytes) => Some(Arc::new(bincode::deserialize(bytes)?)),
            None => None,
        };
        cache.insert(field.to_string(), column.clone());
        Ok(column)
    }

    pub fn value(&self, docnum: u64, field: &str) -> Result<Option<ColumnValue>> {
        Ok(self
            .column(field)?
            .and_then(|column| column.get(docnum as usize).cloned().flatten()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    #[test]
    fn test_lengths() {
        let storage = MemoryStorage::new_default();
        let mut lengths = BTreeMap::new();
        lengths.insert("body".to_string(), vec![3, 0, 7]);
        LengthsReader::write(&storage, "s.fln", &lengths).unwrap();

        let reader = LengthsReader::open(&storage, "s.fln").unwrap();
        assert_eq!(reader.doc_field_length(2, "body"), 7);
        assert_eq!(reader.doc_field_length(9, "body"), 0);
        assert_eq!(reader.doc_field_length(0, "title"), 0);
        assert_eq!(reader.field_length("body"), 10);
        assert_eq!(reader.min_field_length("body"), 3);
        assert_eq!(reader.max_field_length("body"), 7);
    }

    #[test]
    fn test_stored_documents() {
        let storage = MemoryStorage::new_default();
        let docs = vec![
            Document::builder().add_text("title", "one").build(),
            Document::new(),
            Document::builder().add_integer("n", 3).build(),
        ];
        write_stored(&storage, "s.sto", &docs).unwrap();

        let reader = StoredReader::open(&storage, "s.sto").unwrap();
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.document(0).unwrap(), docs[0]);
        assert_eq!(reader.document(1).unwrap(), docs[1]);
        assert_eq!(reader.document(2).unwrap(), docs[2]);
        assert!(matches!(reader.document(3), Err(WhorlError::NotFound(_))));
    }

    #[test]
    fn test_columns() {
        let storage = MemoryStorage::new_default();
        let mut columns = BTreeMap::new();
        columns.insert(
            "price".to_string(),
            vec![Some(ColumnValue::Integer(5)), None, Some(ColumnValue::Integer(2))],
        );
        write_columns(&storage, "s.col", HashType::Cdb, &columns).unwrap();

        let reader = ColumnReader::open(&storage, "s.col").unwrap();
        assert!(reader.has_column("price").unwrap());
        assert!(!reader.has_column("title").unwrap());
        assert_eq!(reader.value(0, "price").unwrap(), Some(ColumnValue::Integer(5)));
        assert_eq!(reader.value(1, "price").unwrap(), None);
        assert_eq!(reader.value(0, "title").unwrap(), None);
        assert!(reader.column("price").unwrap().is_some());
    }
}
