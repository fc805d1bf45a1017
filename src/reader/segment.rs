//! Reader over a single segment.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bit_vec::BitVec;
use log::debug;

use crate::codec::SegmentFiles;
use crate::codec::perdoc::LengthsReader;
use crate::codec::terminfo::TermInfo;
use crate::error::{Result, WhorlError};
use crate::index::segment::Segment;
use crate::matching::{FilterMatcher, Matcher, PostingsMatcher};
use crate::reader::{FieldTermIterator, IndexReader, TermIterator};
use crate::schema::{ColumnValue, Document, Schema};
use crate::scoring::TermWeight;
use crate::storage::Storage;

#[derive(Debug)]
struct SegmentData {
    segment: Segment,
    schema: Arc<Schema>,
    files: SegmentFiles,
    deleted: Option<Arc<BitVec>>,
    generation: u64,
}

/// Reads one segment. Clones share the underlying files and the closed flag.
#[derive(Debug, Clone)]
pub struct SegmentReader {
    inner: Arc<SegmentData>,
    closed: Arc<AtomicBool>,
}

impl SegmentReader {
    pub fn open(
        storage: &Arc<dyn Storage>,
        schema: Arc<Schema>,
        segment: Segment,
        generation: u64,
    ) -> Result<Self> {
        let segment_storage = segment.storage_for(storage)?;
        let files = SegmentFiles::open(segment_storage.as_ref(), &segment.base_name())?;
        let deleted = segment
            .deleted()
            .filter(|_| segment.has_deletions())
            .map(|bits| Arc::new(bits.clone()));
        debug!(
            "opened segment {} ({} documents, {} deleted)",
            segment.segment_id(),
            segment.doc_count_all(),
            segment.deleted_count()
        );

        Ok(SegmentReader {
            inner: Arc::new(SegmentData {
                segment,
                schema,
                files,
                deleted,
                generation,
            }),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn segment(&self) -> &Segment {
        &self.inner.segment
    }

    /// The deletion bitmap, if any document is deleted.
    pub fn deleted(&self) -> Option<Arc<BitVec>> {
        self.inner.deleted.clone()
    }

    pub fn lengths(&self) -> Arc<LengthsReader> {
        Arc::clone(&self.inner.files.lengths)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(WhorlError::ReaderClosed)
        } else {
            Ok(())
        }
    }

    fn check_docnum(&self, docnum: u64) -> Result<()> {
        self.check_open()?;
        if docnum >= self.inner.segment.doc_count_all() {
            return Err(WhorlError::not_found(format!(
                "document {docnum} in segment {}",
                self.inner.segment.segment_id()
            )));
        }
        Ok(())
    }
}

impl IndexReader for SegmentReader {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn generation(&self) -> u64 {
        self.inner.generation
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.inner.schema)
    }

    fn doc_count_all(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.inner.segment.doc_count_all())
    }

    fn doc_count(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.inner.segment.doc_count())
    }

    fn has_deletions(&self) -> Result<bool> {
        self.check_open()?;
        Ok(self.inner.deleted.is_some())
    }

    fn is_deleted(&self, docnum: u64) -> Result<bool> {
        self.check_docnum(docnum)?;
        Ok(self.inner.segment.is_deleted(docnum))
    }

    fn all_doc_ids(&self) -> Result<Vec<u64>> {
        self.check_open()?;
        let segment = &self.inner.segment;
        Ok((0..segment.doc_count_all())
            .filter(|&docnum| !segment.is_deleted(docnum))
            .collect())
    }

    fn stored_fields(&self, docnum: u64) -> Result<Document> {
        self.check_docnum(docnum)?;
        self.inner.files.stored.document(docnum)
    }

    fn doc_field_length(&self, docnum: u64, field: &str) -> Result<u32> {
        self.check_docnum(docnum)?;
        Ok(self.inner.files.lengths.doc_field_length(docnum, field))
    }

    fn field_length(&self, field: &str) -> Result<u64> {
        self.check_open()?;
        Ok(self.inner.files.lengths.field_length(field))
    }

    fn min_field_length(&self, field: &str) -> Result<u32> {
        self.check_open()?;
        Ok(self.inner.files.lengths.min_field_length(field))
    }

    fn max_field_length(&self, field: &str) -> Result<u32> {
        self.check_open()?;
        Ok(self.inner.files.lengths.max_field_length(field))
    }

    fn contains_term(&self, field: &str, term: &[u8]) -> Result<bool> {
        self.check_open()?;
        self.inner.files.terms.contains_term(field, term)
    }

    fn term_info(&self, field: &str, term: &[u8]) -> Result<TermInfo> {
        self.check_open()?;
        self.inner.files.terms.term_info(field, term)
    }

    fn terms(&self) -> Result<TermIterator<'_>> {
        self.check_open()?;
        Ok(Box::new(self.inner.files.terms.iter_all()))
    }

    fn terms_from(&self, field: &str, start: &[u8]) -> Result<FieldTermIterator<'_>> {
        self.check_open()?;
        let iter = self.inner.files.terms.iter_field_from(field, start)?;
        Ok(Box::new(iter.map(|item| item.map(|(_, term)| term))))
    }

    fn postings(&self, field: &str, term: &[u8], weight: Option<&TermWeight>) -> Result<Matcher> {
        self.check_open()?;
        let Some(field_type) = self.inner.schema.get_field(field) else {
            return Err(WhorlError::term_not_found(field, term));
        };
        let Some((info, cursor)) = self.inner.files.terms.cursor(field, term, field_type.format)?
        else {
            return Err(WhorlError::term_not_found(field, term));
        };

        let scorer = weight.map(|w| w.bind(self.lengths()));
        let matcher = Matcher::Postings(PostingsMatcher::new(field, term, info, cursor, scorer));
        match &self.inner.deleted {
            Some(deleted) => FilterMatcher::new(matcher, Arc::clone(deleted), false),
            None => Ok(matcher),
        }
    }

    fn column_value(&self, docnum: u64, field: &str) -> Result<Option<ColumnValue>> {
        self.check_docnum(docnum)?;
        self.inner.files.columns.value(docnum, field)
    }

    fn has_column(&self, field: &str) -> Result<bool> {
        self.check_open()?;
        self.inner.files.columns.has_column(field)
    }

    fn leaf_readers(&self) -> Result<Vec<(SegmentReader, u64)>> {
        self.check_open()?;
        Ok(vec![(self.clone(), 0)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, SegmentBuilder};
    use crate::schema::{FieldType, FieldValue};
    use crate::storage::memory::MemoryStorage;

    fn build(docs: &[&str], deleted: &[u64]) -> SegmentReader {
        let schema = Schema::builder()
            .add_field("body", FieldType::text().with_stored(true))
            .build()
            .unwrap();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let mut builder = SegmentBuilder::new(schema.clone());
        for text in docs {
            builder
                .add_document(&Document::builder().add_text("body", *text).build())
                .unwrap();
        }
        let mut segment = Segment::new("main", docs.len() as u64, false);
        builder
            .write(storage.as_ref(), &segment.base_name(), &Codec::default())
            .unwrap();
        for &docnum in deleted {
            segment.delete_document(docnum).unwrap();
        }
        SegmentReader::open(&storage, Arc::new(schema), segment, 1).unwrap()
    }

    #[test]
    fn test_reader_basics() {
        let reader = build(&["alpha gamma", "beta gamma", "gamma"], &[]);
        assert_eq!(reader.doc_count_all().unwrap(), 3);
        assert_eq!(reader.doc_frequency("body", b"gamma").unwrap(), 3);
        assert_eq!(reader.doc_frequency("body", b"delta").unwrap(), 0);
        assert_eq!(reader.field_length("body").unwrap(), 5);
        assert!((reader.avg_field_length("body").unwrap() - 5.0 / 3.0).abs() < 1e-6);
        assert_eq!(
            reader.stored_fields(1).unwrap().get_field("body"),
            Some(&FieldValue::Text("beta gamma".to_string()))
        );

        let terms: Vec<_> = reader.terms().unwrap().map(|t| t.unwrap().1).collect();
        assert_eq!(terms, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);
        assert_eq!(
            reader.expand_prefix("body", b"b").unwrap(),
            vec![b"beta".to_vec()]
        );

        let mut postings = reader.postings("body", b"gamma", None).unwrap();
        assert_eq!(postings.all_ids().unwrap(), vec![0, 1, 2]);
        assert!(matches!(
            reader.postings("body", b"delta", None),
            Err(WhorlError::TermNotFound { .. })
        ));
    }

    #[test]
    fn test_deleted_documents_filtered() {
        let reader = build(&["alpha gamma", "beta gamma", "gamma"], &[1]);
        assert!(reader.has_deletions().unwrap());
        assert_eq!(reader.doc_count().unwrap(), 2);
        assert_eq!(reader.all_doc_ids().unwrap(), vec![0, 2]);
        let mut postings = reader.postings("body", b"gamma", None).unwrap();
        assert_eq!(postings.all_ids().unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_closed_reader() {
        let reader = build(&["alpha"], &[]);
        let leaf = reader.leaf_readers().unwrap().remove(0).0;
        reader.close();
        assert!(matches!(reader.doc_count(), Err(WhorlError::ReaderClosed)));
        assert!(matches!(
            reader.postings("body", b"alpha", None),
            Err(WhorlError::ReaderClosed)
        ));
        assert!(leaf.is_closed());
    }
}
