//! Per-segment file formats.
//!
//! A segment is written once, by [`SegmentBuilder::write`], as five files
//! sharing the segment's base name:
//!
//! | ext   | contents |
//! |-------|----------|
//! | `trm` | fielded ordered hash: `(field, term)` → [`terminfo::FileTermInfo`] |
//! | `pst` | posting blocks, see [`postings`] |
//! | `fln` | field lengths |
//! | `sto` | stored fields |
//! | `col` | per-document columns |
//!
//! [`SegmentFiles`] opens them again for reading.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use crate::error::Result;
use crate::hashtable::HashType;
use crate::hashtable::fielded::FieldedOrderedHashWriter;
use crate::schema::{ColumnValue, Document, PostingFormat, Schema, Token};
use crate::storage::Storage;

pub mod perdoc;
pub mod postings;
pub mod terminfo;
pub mod terms;

use perdoc::{ColumnReader, LengthsReader, StoredReader};
use postings::{PostingsWriter, RawPosting};
use terms::TermsReader;

pub const TERMS_EXT: &str = "trm";
pub const POSTINGS_EXT: &str = "pst";
pub const LENGTHS_EXT: &str = "fln";
pub const STORED_EXT: &str = "sto";
pub const COLUMNS_EXT: &str = "col";

/// Every file extension a segment writes.
pub const SEGMENT_EXTS: [&str; 5] = [TERMS_EXT, POSTINGS_EXT, LENGTHS_EXT, STORED_EXT, COLUMNS_EXT];

/// Name of one of a segment's files.
pub fn segment_file(base: &str, ext: &str) -> String {
    format!("{base}.{ext}")
}

/// Codec parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Codec {
    pub block_limit: usize,
    pub hash_type: HashType,
}

impl Default for Codec {
    fn default() -> Self {
        Codec {
            block_limit: 128,
            hash_type: HashType::default(),
        }
    }
}

/// A document's per-document data without its postings, as copied by merges.
#[derive(Debug, Clone, Default)]
pub struct RawDocument {
    pub stored: Document,
    pub lengths: BTreeMap<String, u32>,
    pub columns: BTreeMap<String, ColumnValue>,
}

/// An in-memory pool of documents that becomes one segment.
#[derive(Debug)]
pub struct SegmentBuilder {
    schema: Schema,
    postings: BTreeMap<(String, Vec<u8>), Vec<RawPosting>>,
    lengths: BTreeMap<String, Vec<u32>>,
    columns: BTreeMap<String, Vec<Option<ColumnValue>>>,
    stored: Vec<Document>,
}

impl SegmentBuilder {
    pub fn new(schema: Schema) -> Self {
        SegmentBuilder {
            schema,
            postings: BTreeMap::new(),
            lengths: BTreeMap::new(),
            columns: BTreeMap::new(),
            stored: Vec::new(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn doc_count(&self) -> u64 {
        self.stored.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.stored.is_empty()
    }

    /// Tokenize and add a document. Returns its segment-local number.
    pub fn add_document(&mut self, document: &Document) -> Result<u64> {
        self.schema.validate(document)?;
        let docnum = self.doc_count();
        let mut raw = RawDocument::default();

        for (name, value) in document.fields() {
            let field_type = self.schema.field(name)?;
            if field_type.stored {
                raw.stored.add_field(name.clone(), value.clone());
            }
            if let Some(column) = field_type.column_value(value) {
                raw.columns.insert(name.clone(), column);
            }
            if !field_type.is_indexed() {
                continue;
            }

            let tokens = field_type.tokens(value)?;
            // Postings record the same length the scorer will read back.
            let length = if field_type.scorable {
                raw.lengths.insert(name.clone(), tokens.len() as u32);
                tokens.len() as u32
            } else {
                0
            };

            let mut by_term: BTreeMap<&[u8], Vec<&Token>> = BTreeMap::new();
            for token in &tokens {
                by_term.entry(token.term.as_slice()).or_default().push(token);
            }
            for (term, term_tokens) in by_term {
                let (weight, value) = postings::encode_value(field_type.format, &term_tokens);
                self.postings
                    .entry((name.clone(), term.to_vec()))
                    .or_default()
                    .push(RawPosting {
                        id: docnum,
                        weight,
                        value,
                        length,
                    });
            }
        }

        self.add_raw_document(raw);
        Ok(docnum)
    }

    /// Add a document's per-document data. Its postings are added separately
    /// with [`SegmentBuilder::add_posting`].
    pub fn add_raw_document(&mut self, raw: RawDocument) -> u64 {
        let docnum = self.doc_count();
        for (field, length) in raw.lengths {
            let lengths = self.lengths.entry(field).or_default();
            lengths.resize(docnum as usize, 0);
            lengths.push(length);
        }
        for (field, value) in raw.columns {
            let column = self.columns.entry(field).or_default();
            column.resize(docnum as usize, None);
            column.push(Some(value));
        }
        self.stored.push(raw.stored);
        docnum
    }

    /// Add one posting. Postings of a term must arrive in increasing id order.
    pub fn add_posting(&mut self, field: &str, term: &[u8], posting: RawPosting) {
        self.postings
            .entry((field.to_string(), term.to_vec()))
            .or_default()
            .push(posting);
    }

    /// Write the segment's files under `base`.
    pub fn write(mut self, storage: &dyn Storage, base: &str, codec: &Codec) -> Result<()> {
        let doc_count = self.doc_count() as usize;
        let mut dictionary = FieldedOrderedHashWriter::create(
            storage,
            &segment_file(base, TERMS_EXT),
            codec.hash_type,
        )?;
        let mut writer = PostingsWriter::new(
            storage.create_output(&segment_file(base, POSTINGS_EXT))?,
            PostingFormat::Existence,
            codec.block_limit,
        );

        let mut current_field: Option<&str> = None;
        let mut term_count = 0usize;
        for ((field, term), postings) in &self.postings {
            if current_field != Some(field.as_str()) {
                dictionary.start_field(field)?;
                writer.set_format(self.schema.field(field)?.format);
                current_field = Some(field.as_str());
            }
            writer.start_term()?;
            for posting in postings {
                writer.add(posting.id, posting.weight, &posting.value, posting.length)?;
            }
            let info = writer.finish_term()?;
            dictionary.add(term, &bincode::serialize(&info)?)?;
            term_count += 1;
        }
        dictionary.close()?;
        writer.close()?;

        for lengths in self.lengths.values_mut() {
            lengths.resize(doc_count, 0);
        }
        for column in self.columns.values_mut() {
            column.resize(doc_count, None);
        }
        LengthsReader::write(storage, &segment_file(base, LENGTHS_EXT), &self.lengths)?;
        perdoc::write_stored(storage, &segment_file(base, STORED_EXT), &self.stored)?;
        perdoc::write_columns(
            storage,
            &segment_file(base, COLUMNS_EXT),
            codec.hash_type,
            &self.columns,
        )?;

        debug!("wrote segment {base}: {doc_count} documents, {term_count} terms");
        Ok(())
    }
}

/// The opened files of one segment.
#[derive(Debug)]
pub struct SegmentFiles {
    pub terms: Arc<TermsReader>,
    pub lengths: Arc<LengthsReader>,
    pub stored: StoredReader,
    pub columns: ColumnReader,
}

impl SegmentFiles {
    pub fn open(storage: &dyn Storage, base: &str) -> Result<Self> {
        Ok(SegmentFiles {
            terms: Arc::new(TermsReader::open(
                storage,
                &segment_file(base, TERMS_EXT),
                &segment_file(base, POSTINGS_EXT),
            )?),
            lengths: Arc::new(LengthsReader::open(
                storage,
                &segment_file(base, LENGTHS_EXT),
            )?),
            stored: StoredReader::open(storage, &segment_file(base, STORED_EXT))?,
            columns: ColumnReader::open(storage, &segment_file(base, COLUMNS_EXT))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::postings::decode_positions;
    use crate::schema::{FieldType, FieldValue};
    use crate::storage::memory::MemoryStorage;

    fn schema() -> Schema {
        Schema::builder()
            .add_field("title", FieldType::text().with_stored(true))
            .add_field("tag", FieldType::keyword())
            .add_field("price", FieldType::numeric())
            .build()
            .unwrap()
    }

    #[test]
    fn test_write_and_open_segment() {
        let storage = MemoryStorage::new_default();
        let mut builder = SegmentBuilder::new(schema());
        builder
            .add_document(
                &Document::builder()
                    .add_text("title", "red fish blue fish")
                    .add_text("tag", "sea")
                    .add_integer("price", 7)
                    .build(),
            )
            .unwrap();
        builder
            .add_document(&Document::builder().add_text("title", "one fish").build())
            .unwrap();
        builder.write(&storage, "_main_seg", &Codec::default()).unwrap();

        let files = SegmentFiles::open(&storage, "_main_seg").unwrap();
        assert_eq!(files.stored.len(), 2);
        assert_eq!(
            files.stored.document(1).unwrap().get_field("title"),
            Some(&FieldValue::Text("one fish".to_string()))
        );
        assert!(files.stored.document(0).unwrap().get_field("tag").is_none());

        assert_eq!(files.lengths.doc_field_length(0, "title"), 4);
        assert_eq!(files.lengths.doc_field_length(1, "title"), 2);
        assert_eq!(files.lengths.field_length("title"), 6);

        let (info, mut cursor) = files
            .terms
            .cursor("title", b"fish", PostingFormat::Positions)
            .unwrap()
            .unwrap();
        assert_eq!(info.doc_frequency(), 2);
        assert_eq!(info.weight(), 3.0);
        assert_eq!(decode_positions(cursor.value().unwrap()).unwrap(), vec![1, 3]);
        cursor.next().unwrap();
        assert_eq!(cursor.id(), 1);

        assert_eq!(files.columns.value(0, "price").unwrap(), Some(ColumnValue::Integer(7)));
        assert_eq!(files.columns.value(1, "price").unwrap(), None);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut builder = SegmentBuilder::new(schema());
        let doc = Document::builder().add_text("missing", "x").build();
        assert!(builder.add_document(&doc).is_err());
        assert!(builder.is_empty());
    }
}
