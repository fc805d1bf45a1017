//! Index readers.
//!
//! [`IndexReader`] is the read-side view of one TOC generation. A
//! [`SegmentReader`] reads a single segment; a [`MultiReader`] stitches
//! several together, mapping global document numbers to `(segment, local)`
//! pairs; an [`EmptyReader`] stands in for an index without segments.
//!
//! Every operation on a closed reader fails with
//! [`WhorlError::ReaderClosed`](crate::error::WhorlError::ReaderClosed).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::codec::terminfo::TermInfo;
use crate::error::{Result, WhorlError};
use crate::index::toc::Toc;
use crate::matching::Matcher;
use crate::schema::{ColumnValue, Document, Schema};
use crate::scoring::TermWeight;
use crate::storage::Storage;

pub mod multi;
pub mod segment;
#[cfg(test)]
pub(crate) mod testing;

pub use multi::MultiReader;
pub use segment::SegmentReader;

/// A stream of `(field, term)` pairs in order.
pub type TermIterator<'a> = Box<dyn Iterator<Item = Result<(String, Vec<u8>)>> + Send + 'a>;

/// A stream of the terms of one field in order.
pub type FieldTermIterator<'a> = Box<dyn Iterator<Item = Result<Vec<u8>>> + Send + 'a>;

pub trait IndexReader: Send + Sync + fmt::Debug {
    /// Release the reader. Later calls fail with `ReaderClosed`.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// The TOC generation this reader was opened from.
    fn generation(&self) -> u64;

    fn schema(&self) -> Arc<Schema>;

    /// Number of documents including deleted ones.
    fn doc_count_all(&self) -> Result<u64>;

    /// Number of live documents.
    fn doc_count(&self) -> Result<u64>;

    fn has_deletions(&self) -> Result<bool>;

    fn is_deleted(&self, docnum: u64) -> Result<bool>;

    /// Numbers of all live documents, ascending.
    fn all_doc_ids(&self) -> Result<Vec<u64>>;

    fn stored_fields(&self, docnum: u64) -> Result<Document>;

    fn doc_field_length(&self, docnum: u64, field: &str) -> Result<u32>;

    /// Total number of tokens in `field` over all documents.
    fn field_length(&self, field: &str) -> Result<u64>;

    fn min_field_length(&self, field: &str) -> Result<u32>;

    fn max_field_length(&self, field: &str) -> Result<u32>;

    fn avg_field_length(&self, field: &str) -> Result<f32> {
        let docs = self.doc_count_all()?;
        if docs == 0 {
            return Ok(0.0);
        }
        Ok(self.field_length(field)? as f32 / docs as f32)
    }

    fn contains_term(&self, field: &str, term: &[u8]) -> Result<bool>;

    /// Statistics of a term; `TermNotFound` when it does not occur.
    fn term_info(&self, field: &str, term: &[u8]) -> Result<TermInfo>;

    fn doc_frequency(&self, field: &str, term: &[u8]) -> Result<u64> {
        match self.term_info(field, term) {
            Ok(info) => Ok(info.doc_frequency()),
            Err(WhorlError::TermNotFound { .. }) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Total weight of a term over all documents.
    fn frequency(&self, field: &str, term: &[u8]) -> Result<f32> {
        match self.term_info(field, term) {
            Ok(info) => Ok(info.weight()),
            Err(WhorlError::TermNotFound { .. }) => Ok(0.0),
            Err(e) => Err(e),
        }
    }

    /// Every `(field, term)` pair, ordered by field then term.
    fn terms(&self) -> Result<TermIterator<'_>>;

    fn field_terms(&self, field: &str) -> Result<FieldTermIterator<'_>> {
        self.terms_from(field, b"")
    }

    /// Terms of `field` from the first one `>= start`.
    fn terms_from(&self, field: &str, start: &[u8]) -> Result<FieldTermIterator<'_>>;

    /// Terms of `field` starting with `prefix`.
    fn expand_prefix(&self, field: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut terms = Vec::new();
        for term in self.terms_from(field, prefix)? {
            let term = term?;
            if !term.starts_with(prefix) {
                break;
            }
            terms.push(term);
        }
        Ok(terms)
    }

    /// A matcher over the postings of a term, scored with `weight` when
    /// given. `TermNotFound` when the term does not occur.
    fn postings(&self, field: &str, term: &[u8], weight: Option<&TermWeight>) -> Result<Matcher>;

    fn column_value(&self, docnum: u64, field: &str) -> Result<Option<ColumnValue>>;

    fn has_column(&self, field: &str) -> Result<bool>;

    /// The segment readers under this reader, each with the offset of its
    /// first document.
    fn leaf_readers(&self) -> Result<Vec<(SegmentReader, u64)>>;
}

/// Open a reader over the segments of `toc`.
pub fn open_reader(storage: &Arc<dyn Storage>, toc: &Toc) -> Result<Arc<dyn IndexReader>> {
    let schema = Arc::new(toc.schema.clone());
    let mut readers = Vec::with_capacity(toc.segments.len());
    for segment in &toc.segments {
        readers.push(SegmentReader::open(
            storage,
            Arc::clone(&schema),
            segment.clone(),
            toc.generation,
        )?);
    }
    Ok(match readers.len() {
        0 => Arc::new(EmptyReader::new(schema, toc.generation)),
        1 => Arc::new(readers.remove(0)),
        _ => Arc::new(MultiReader::new(readers, schema, toc.generation)),
    })
}

/// A reader over an index with no segments.
#[derive(Debug)]
pub struct EmptyReader {
    schema: Arc<Schema>,
    generation: u64,
    closed: AtomicBool,
}

impl EmptyReader {
    pub fn new(schema: Arc<Schema>, generation: u64) -> Self {
        EmptyReader {
            schema,
            generation,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(WhorlError::ReaderClosed)
        } else {
            Ok(())
        }
    }
}

impl IndexReader for EmptyReader {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    fn doc_count_all(&self) -> Result<u64> {
        self.check_open().map(|_| 0)
    }

    fn doc_count(&self) -> Result<u64> {
        self.check_open().map(|_| 0)
    }

    fn has_deletions(&self) -> Result<bool> {
        self.check_open().map(|_| false)
    }

    fn is_deleted(&self, docnum: u64) -> Result<bool> {
        self.check_open()?;
        Err(WhorlError::not_found(format!("document {docnum}")))
    }

    fn all_doc_ids(&self) -> Result<Vec<u64>> {
        self.check_open().map(|_| Vec::new())
    }

    fn stored_fields(&self, docnum: u64) -> Result<Document> {
        self.check_open()?;
        Err(WhorlError::not_found(format!("document {docnum}")))
    }

    fn doc_field_length(&self, docnum: u64, _field: &str) -> Result<u32> {
        self.check_open()?;
        Err(WhorlError::not_found(format!("document {docnum}")))
    }

    fn field_length(&self, _field: &str) -> Result<u64> {
        self.check_open().map(|_| 0)
    }

    fn min_field_length(&self, _field: &str) -> Result<u32> {
        self.check_open().map(|_| 0)
    }

    fn max_field_length(&self, _field: &str) -> Result<u32> {
        self.check_open().map(|_| 0)
    }

    fn contains_term(&self, _field: &str, _term: &[u8]) -> Result<bool> {
        self.check_open().map(|_| false)
    }

    fn term_info(&self, field: &str, term: &[u8]) -> Result<TermInfo> {
        self.check_open()?;
        Err(WhorlError::term_not_found(field, term))
    }

    fn terms(&self) -> Result<TermIterator<'_>> {
        self.check_open()?;
        Ok(Box::new(std::iter::empty()))
    }

    fn terms_from(&self, _field: &str, _start: &[u8]) -> Result<FieldTermIterator<'_>> {
        self.check_open()?;
        Ok(Box::new(std::iter::empty()))
    }

    fn postings(&self, field: &str, term: &[u8], _weight: Option<&TermWeight>) -> Result<Matcher> {
        self.check_open()?;
        Err(WhorlError::term_not_found(field, term))
    }

    fn column_value(&self, docnum: u64, _field: &str) -> Result<Option<ColumnValue>> {
        self.check_open()?;
        Err(WhorlError::not_found(format!("document {docnum}")))
    }

    fn has_column(&self, _field: &str) -> Result<bool> {
        self.check_open().map(|_| false)
    }

    fn leaf_readers(&self) -> Result<Vec<(SegmentReader, u64)>> {
        self.check_open().map(|_| Vec::new())
    }
}
