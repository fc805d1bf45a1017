//! Reader over several segments.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::codec::terminfo::TermInfo;
use crate::error::{Result, WhorlError};
use crate::matching::{Matcher, MultiMatcher};
use crate::reader::{FieldTermIterator, IndexReader, SegmentReader, TermIterator};
use crate::schema::{ColumnValue, Document, Schema};
use crate::scoring::TermWeight;

/// Presents several segment readers as one index.
///
/// Global document numbers are assigned by concatenating the segments in
/// order: segment `i` owns `offsets[i]..offsets[i] + doc_count_all(i)`.
#[derive(Debug)]
pub struct MultiReader {
    readers: Vec<SegmentReader>,
    offsets: Vec<u64>,
    doc_count_all: u64,
    schema: Arc<Schema>,
    generation: u64,
    closed: AtomicBool,
}

impl MultiReader {
    pub fn new(readers: Vec<SegmentReader>, schema: Arc<Schema>, generation: u64) -> Self {
        let mut offsets = Vec::with_capacity(readers.len());
        let mut total = 0;
        for reader in &readers {
            offsets.push(total);
            total += reader.segment().doc_count_all();
        }
        MultiReader {
            readers,
            offsets,
            doc_count_all: total,
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

    /// Map a global document number to `(segment index, local number)`.
    pub fn locate(&self, docnum: u64) -> Result<(usize, u64)> {
        self.check_open()?;
        if docnum >= self.doc_count_all {
            return Err(WhorlError::not_found(format!("document {docnum}")));
        }
        let index = self.offsets.partition_point(|&offset| offset <= docnum) - 1;
        Ok((index, docnum - self.offsets[index]))
    }

    /// The global number of a segment-local document.
    pub fn global_docnum(&self, segment: usize, docnum: u64) -> u64 {
        self.offsets[segment] + docnum
    }

    fn leaf(&self, docnum: u64) -> Result<(&SegmentReader, u64)> {
        let (index, local) = self.locate(docnum)?;
        Ok((&self.readers[index], local))
    }
}

impl IndexReader for MultiReader {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for reader in &self.readers {
            reader.close();
        }
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
        self.check_open()?;
        Ok(self.doc_count_all)
    }

    fn doc_count(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.readers.iter().map(|r| r.segment().doc_count()).sum())
    }

    fn has_deletions(&self) -> Result<bool> {
        self.check_open()?;
        Ok(self.readers.iter().any(|r| r.segment().has_deletions()))
    }

    fn is_deleted(&self, docnum: u64) -> Result<bool> {
        let (reader, local) = self.leaf(docnum)?;
        reader.is_deleted(local)
    }

    fn all_doc_ids(&self) -> Result<Vec<u64>> {
        self.check_open()?;
        let mut ids = Vec::new();
        for (reader, &offset) in self.readers.iter().zip(&self.offsets) {
            ids.extend(reader.all_doc_ids()?.into_iter().map(|id| id + offset));
        }
        Ok(ids)
    }

    fn stored_fields(&self, docnum: u64) -> Result<Document> {
        let (reader, local) = self.leaf(docnum)?;
        reader.stored_fields(local)
    }

    fn doc_field_length(&self, docnum: u64, field: &str) -> Result<u32> {
        let (reader, local) = self.leaf(docnum)?;
        reader.doc_field_length(local, field)
    }

    fn field_length(&self, field: &str) -> Result<u64> {
        self.check_open()?;
        let mut total = 0;
        for reader in &self.readers {
            total += reader.field_length(field)?;
        }
        Ok(total)
    }

    fn min_field_length(&self, field: &str) -> Result<u32> {
        self.check_open()?;
        let mut min = None;
        for reader in &self.readers {
            let length = reader.min_field_length(field)?;
            if length > 0 {
                min = Some(min.map_or(length, |m: u32| m.min(length)));
            }
        }
        Ok(min.unwrap_or(0))
    }

    fn max_field_length(&self, field: &str) -> Result<u32> {
        self.check_open()?;
        let mut max = 0;
        for reader in &self.readers {
            max = max.max(reader.max_field_length(field)?);
        }
        Ok(max)
    }

    fn contains_term(&self, field: &str, term: &[u8]) -> Result<bool> {
        self.check_open()?;
        for reader in &self.readers {
            if reader.contains_term(field, term)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn term_info(&self, field: &str, term: &[u8]) -> Result<TermInfo> {
        self.check_open()?;
        let mut infos = Vec::new();
        for (reader, &offset) in self.readers.iter().zip(&self.offsets) {
            match reader.term_info(field, term) {
                Ok(info) => infos.push((info, offset)),
                Err(WhorlError::TermNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if infos.is_empty() {
            return Err(WhorlError::term_not_found(field, term));
        }
        Ok(TermInfo::combine(infos.iter().map(|(info, offset)| (info, *offset))))
    }

    fn terms(&self) -> Result<TermIterator<'_>> {
        self.check_open()?;
        let mut sources = Vec::with_capacity(self.readers.len());
        for reader in &self.readers {
            sources.push(reader.terms()?);
        }
        Ok(Box::new(MergeIter::new(sources)))
    }

    fn terms_from(&self, field: &str, start: &[u8]) -> Result<FieldTermIterator<'_>> {
        self.check_open()?;
        let mut sources = Vec::with_capacity(self.readers.len());
        for reader in &self.readers {
            sources.push(reader.terms_from(field, start)?);
        }
        Ok(Box::new(MergeIter::new(sources)))
    }

    fn postings(&self, field: &str, term: &[u8], weight: Option<&TermWeight>) -> Result<Matcher> {
        self.check_open()?;
        let mut matchers = Vec::new();
        for (reader, &offset) in self.readers.iter().zip(&self.offsets) {
            match reader.postings(field, term, weight) {
                Ok(matcher) => matchers.push((matcher, offset)),
                Err(WhorlError::TermNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if matchers.is_empty() {
            return Err(WhorlError::term_not_found(field, term));
        }
        Ok(MultiMatcher::new(matchers))
    }

    fn column_value(&self, docnum: u64, field: &str) -> Result<Option<ColumnValue>> {
        let (reader, local) = self.leaf(docnum)?;
        reader.column_value(local, field)
    }

    fn has_column(&self, field: &str) -> Result<bool> {
        self.check_open()?;
        for reader in &self.readers {
            if reader.has_column(field)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn leaf_readers(&self) -> Result<Vec<(SegmentReader, u64)>> {
        self.check_open()?;
        Ok(self
            .readers
            .iter()
            .cloned()
            .zip(self.offsets.iter().copied())
            .collect())
    }
}

/// Merges ascending streams into one ascending stream, yielding each
/// distinct item once.
pub struct MergeIter<'a, T> {
    sources: Vec<Box<dyn Iterator<Item = Result<T>> + Send + 'a>>,
    heap: BinaryHeap<Reverse<(T, usize)>>,
    started: bool,
}

impl<'a, T: Ord> MergeIter<'a, T> {
    pub fn new(sources: Vec<Box<dyn Iterator<Item = Result<T>> + Send + 'a>>) -> Self {
        MergeIter {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            started: false,
        }
    }

    fn pull(&mut self, source: usize) -> Result<()> {
        match self.sources[source].next() {
            Some(Ok(item)) => self.heap.push(Reverse((item, source))),
            Some(Err(e)) => return Err(e),
            None => {}
        }
        Ok(())
    }
}

impl<T: Ord> Iterator for MergeIter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            for source in 0..self.sources.len() {
                if let Err(e) = self.pull(source) {
                    return Some(Err(e));
                }
            }
        }

        let Reverse((item, source)) = self.heap.pop()?;
        if let Err(e) = self.pull(source) {
            return Some(Err(e));
        }
        while let Some(Reverse((top, _))) = self.heap.peek() {
            if *top != item {
                break;
            }
            let Some(Reverse((_, other))) = self.heap.pop() else {
                break;
            };
            if let Err(e) = self.pull(other) {
                return Some(Err(e));
            }
        }
        Some(Ok(item))
    }
}
