//! The index writer and merge policies.
//!
//! A writer holds the index's `WRITELOCK` from [`IndexWriter::open`] until
//! it commits, cancels or is dropped. New documents are buffered in a
//! [`SegmentBuilder`]; on commit the merge policy picks existing segments
//! whose live documents are copied into the same pool, the pool is written as
//! one new segment, and a new TOC generation lists the result.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::codec::postings::RawPosting;
use crate::codec::{RawDocument, SEGMENT_EXTS, SegmentBuilder, segment_file};
use crate::error::{Result, WhorlError};
use crate::index::compound::{COMPOUND_EXT, CompoundWriter};
use crate::index::segment::Segment;
use crate::index::toc::Toc;
use crate::index::{IndexConfig, WRITE_LOCK};
use crate::query::Query;
use crate::reader::{IndexReader, SegmentReader, open_reader};
use crate::schema::{Document, Schema};
use crate::search::Searcher;
use crate::storage::{Storage, StorageLock};

/// Which existing segments a commit merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Only add the new segment.
    NoMerge,
    /// Merge the smallest segments while their running document total stays
    /// below a Fibonacci bound of their count.
    #[default]
    MergeSmall,
    /// Merge everything into one segment.
    Optimize,
}

fn fib(n: usize) -> u64 {
    let (mut a, mut b) = (1u64, 2u64);
    match n {
        0..=2 => n as u64,
        _ => {
            for _ in 3..=n {
                (a, b) = (b, a.saturating_add(b));
            }
            b
        }
    }
}

impl MergePolicy {
    /// Split `segments` into `(merge, keep)`. Segments without live
    /// documents are dropped from both.
    pub fn select(self, segments: Vec<Segment>) -> (Vec<Segment>, Vec<Segment>) {
        let segments: Vec<Segment> = segments.into_iter().filter(|s| s.doc_count() > 0).collect();
        match self {
            MergePolicy::NoMerge => (Vec::new(), segments),
            MergePolicy::Optimize => (segments, Vec::new()),
            MergePolicy::MergeSmall => {
                let mut by_size: Vec<usize> = (0..segments.len()).collect();
                by_size.sort_by_key(|&i| segments[i].doc_count_all());
                let mut total = 0;
                let mut merged = BTreeSet::new();
                for (rank, &i) in by_size.iter().enumerate() {
                    total += segments[i].doc_count_all();
                    if total < fib(rank + 5) {
                        merged.insert(i);
                    }
                }
                let (merge, keep): (Vec<_>, Vec<_>) = segments
                    .into_iter()
                    .enumerate()
                    .partition(|(i, _)| merged.contains(i));
                (
                    merge.into_iter().map(|(_, s)| s).collect(),
                    keep.into_iter().map(|(_, s)| s).collect(),
                )
            }
        }
    }
}

/// Adds and deletes documents and publishes new generations.
#[derive(Debug)]
pub struct IndexWriter {
    storage: Arc<dyn Storage>,
    config: IndexConfig,
    schema: Arc<Schema>,
    generation: u64,
    segments: Vec<Segment>,
    pool: SegmentBuilder,
    // Pool documents deleted before the commit.
    pool_deleted: BTreeSet<u64>,
    lock: Option<Box<dyn StorageLock>>,
}

impl IndexWriter {
    /// Take the write lock and read the latest generation.
    pub fn open(storage: Arc<dyn Storage>, config: IndexConfig) -> Result<IndexWriter> {
        let Some(lock) = storage.try_lock(WRITE_LOCK)? else {
            return Err(WhorlError::lock(format!(
                "index {} is locked by another writer",
                config.index_name
            )));
        };
        let toc = Toc::read(
            storage.as_ref(),
            &config.index_name,
            None,
            config.toc_read_retries,
            config.retry_delay(),
        )?;
        debug!(
            "writer opened {} at generation {}",
            config.index_name, toc.generation
        );
        Ok(IndexWriter {
            pool: SegmentBuilder::new(toc.schema.clone()),
            schema: Arc::new(toc.schema),
            generation: toc.generation,
            segments: toc.segments,
            storage,
            config,
            pool_deleted: BTreeSet::new(),
            lock: Some(lock),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The generation this writer started from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn committed_count(&self) -> u64 {
        self.segments.iter().map(Segment::doc_count_all).sum()
    }

    /// Documents added since the writer opened.
    pub fn pending_docs(&self) -> u64 {
        self.pool.doc_count()
    }

    /// Live documents, committed and pending.
    pub fn doc_count(&self) -> u64 {
        let committed: u64 = self.segments.iter().map(Segment::doc_count).sum();
        committed + self.pool.doc_count() - self.pool_deleted.len() as u64
    }

    /// Buffer a document. Returns its number in the writer's view: committed
    /// documents first, then pending ones.
    pub fn add_document(&mut self, document: &Document) -> Result<u64> {
        let docnum = self.pool.add_document(document)?;
        Ok(self.committed_count() + docnum)
    }

    /// Delete the documents whose `field` holds `text`, then add `document`.
    pub fn update_document(&mut self, field: &str, text: &str, document: &Document) -> Result<u64> {
        self.delete_by_term(field, text)?;
        self.add_document(document)
    }

    /// Delete a document by its number in the writer's view.
    pub fn delete_document(&mut self, docnum: u64) -> Result<()> {
        let mut offset = 0;
        for segment in &mut self.segments {
            if docnum < offset + segment.doc_count_all() {
                return segment.delete_document(docnum - offset);
            }
            offset += segment.doc_count_all();
        }
        let pooled = docnum - offset;
        if pooled >= self.pool.doc_count() {
            return Err(WhorlError::invalid_argument(format!(
                "document {docnum} out of range"
            )));
        }
        self.pool_deleted.insert(pooled);
        Ok(())
    }

    /// Delete committed documents containing a term. Returns how many were
    /// deleted.
    pub fn delete_by_term(&mut self, field: &str, text: &str) -> Result<u64> {
        self.delete_by_query(&Query::term(field, text))
    }

    /// Delete committed documents matching `query`. Pending documents are not
    /// searched. Returns how many were deleted.
    pub fn delete_by_query(&mut self, query: &Query) -> Result<u64> {
        let searcher = self.committed_searcher()?;
        let docs = searcher.docs_for_query(query)?;
        for &docnum in &docs {
            self.delete_document(docnum)?;
        }
        debug!("{query} deleted {} documents", docs.len());
        Ok(docs.len() as u64)
    }

    /// A searcher over the committed segments with this writer's deletions.
    fn committed_searcher(&self) -> Result<Searcher> {
        let toc = Toc::new((*self.schema).clone(), self.segments.clone(), self.generation);
        Searcher::new(open_reader(&self.storage, &toc)?)
    }

    /// Copy the live documents of every segment of `reader` into the pool.
    /// Returns the number of documents copied.
    pub fn add_reader(&mut self, reader: &dyn IndexReader) -> Result<u64> {
        let mut copied = 0;
        for (leaf, _) in reader.leaf_readers()? {
            copied += self.add_segment(&leaf)?;
        }
        Ok(copied)
    }

    fn add_segment(&mut self, leaf: &SegmentReader) -> Result<u64> {
        let doc_count = leaf.doc_count_all()?;
        let scorable: Vec<String> = self.schema.scorable_fields().map(str::to_string).collect();
        let columns: Vec<String> = self
            .schema
            .fields()
            .filter(|(_, field)| field.column)
            .map(|(name, _)| name.to_string())
            .collect();

        let mut docmap: Vec<Option<u64>> = vec![None; doc_count as usize];
        for docnum in 0..doc_count {
            if leaf.is_deleted(docnum)? {
                continue;
            }
            let mut raw = RawDocument {
                stored: leaf.stored_fields(docnum)?,
                ..RawDocument::default()
            };
            for field in &scorable {
                let length = leaf.doc_field_length(docnum, field)?;
                if length > 0 {
                    raw.lengths.insert(field.clone(), length);
                }
            }
            for field in &columns {
                if let Some(value) = leaf.column_value(docnum, field)? {
                    raw.columns.insert(field.clone(), value);
                }
            }
            docmap[docnum as usize] = Some(self.pool.add_raw_document(raw));
        }

        for entry in leaf.terms()? {
            let (field, term) = entry?;
            let mut postings = leaf.postings(&field, &term, None)?;
            while postings.is_active() {
                let id = postings.id();
                if let Some(Some(new_id)) = docmap.get(id as usize) {
                    self.pool.add_posting(
                        &field,
                        &term,
                        RawPosting {
                            id: *new_id,
                            weight: postings.weight(),
                            value: postings.value()?.to_vec(),
                            length: leaf.doc_field_length(id, &field)?,
                        },
                    );
                }
                postings.next()?;
            }
        }

        let copied = docmap.iter().flatten().count() as u64;
        debug!(
            "copied {copied} of {doc_count} documents from segment {}",
            leaf.segment().segment_id()
        );
        Ok(copied)
    }

    /// Commit with the configured merge policy.
    pub fn commit_default(self) -> Result<Toc> {
        let policy = self.config.merge_policy;
        self.commit(policy)
    }

    /// Merge, write the pool as a new segment and publish the next
    /// generation. Releases the lock.
    pub fn commit(mut self, policy: MergePolicy) -> Result<Toc> {
        let index_name = self.config.index_name.clone();
        let (merge, mut segments) = policy.select(std::mem::take(&mut self.segments));
        for segment in &merge {
            let reader = SegmentReader::open(
                &self.storage,
                Arc::clone(&self.schema),
                segment.clone(),
                self.generation,
            )?;
            self.add_segment(&reader)?;
        }
        if !merge.is_empty() {
            info!("merged {} segments of {index_name}", merge.len());
        }

        if !self.pool.is_empty() {
            let pool = std::mem::replace(&mut self.pool, SegmentBuilder::new((*self.schema).clone()));
            segments.push(self.write_segment(pool)?);
        }

        let toc = Toc::new((*self.schema).clone(), segments, self.generation + 1);
        toc.write(self.storage.as_ref(), &index_name)?;
        info!(
            "committed generation {} of {index_name}: {} segments, {} documents",
            toc.generation,
            toc.segments.len(),
            toc.segments.iter().map(Segment::doc_count).sum::<u64>()
        );
        Toc::clean_files(
            self.storage.as_ref(),
            &index_name,
            toc.generation,
            &toc.segments,
        )?;
        self.release_lock();
        Ok(toc)
    }

    fn write_segment(&mut self, pool: SegmentBuilder) -> Result<Segment> {
        let mut segment = Segment::new(&self.config.index_name, pool.doc_count(), self.config.compound);
        let base = segment.base_name();
        pool.write(self.storage.as_ref(), &base, &self.config.codec())?;
        if self.config.compound {
            let mut writer = CompoundWriter::new(self.storage.as_ref());
            for ext in SEGMENT_EXTS {
                writer.add_file(segment_file(&base, ext));
            }
            writer.write(&segment.file_name(COMPOUND_EXT))?;
        }
        for &docnum in &self.pool_deleted {
            segment.delete_document(docnum)?;
        }
        self.pool_deleted.clear();
        Ok(segment)
    }

    /// Drop pending changes and release the lock.
    pub fn cancel(mut self) {
        debug!("writer for {} cancelled", self.config.index_name);
        self.release_lock();
    }

    fn release_lock(&mut self) {
        if let Some(mut lock) = self.lock.take()
            && let Err(e) = lock.release()
        {
            warn!("could not release {WRITE_LOCK}: {e}");
        }
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        self.release_lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;
    use crate::schema::{FieldType, FieldValue};
    use crate::storage::memory::MemoryStorage;

    fn index(compound: bool) -> Index {
        let schema = Schema::builder()
            .add_field("id", FieldType::id().with_stored(true))
            .add_field("body", FieldType::text())
            .add_field("num", FieldType::numeric())
            .build()
            .unwrap();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let config = IndexConfig {
            compound,
            ..IndexConfig::default()
        };
        Index::create(storage, schema, config).unwrap()
    }

    fn doc(id: &str, body: &str, num: i64) -> Document {
        Document::builder()
            .add_text("id", id)
            .add_text("body", body)
            .add_integer("num", num)
            .build()
    }

    fn ids(index: &Index, query: &Query) -> Vec<String> {
        let searcher = index.searcher().unwrap();
        let mut ids: Vec<String> = searcher
            .docs_for_query(query)
            .unwrap()
            .into_iter()
            .map(|d| match searcher.stored_fields(d).unwrap().get_field("id") {
                Some(FieldValue::Text(id)) => id.clone(),
                other => panic!("unexpected id {other:?}"),
            })
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_fib() {
        assert_eq!((0..8).map(fib).collect::<Vec<_>>(), vec![0, 1, 2, 3, 5, 8, 13, 21]);
    }

    #[test]
    fn test_merge_small_selection() {
        let segments = vec![
            Segment::new("t", 1000, false),
            Segment::new("t", 2, false),
            Segment::new("t", 3, false),
        ];
        let (merge, keep) = MergePolicy::MergeSmall.select(segments.clone());
        assert_eq!(merge.len(), 2);
        assert_eq!(keep, vec![segments[0].clone()]);

        let (merge, keep) = MergePolicy::NoMerge.select(segments.clone());
        assert!(merge.is_empty());
        assert_eq!(keep.len(), 3);
        let (merge, keep) = MergePolicy::Optimize.select(segments);
        assert_eq!(merge.len(), 3);
        assert!(keep.is_empty());
    }

    #[test]
    fn test_lock_contention() {
        let index = index(false);
        let writer = index.writer().unwrap();
        assert!(matches!(index.writer(), Err(WhorlError::Lock(_))));
        writer.cancel();
        let writer = index.writer().unwrap();
        drop(writer);
        assert!(index.writer().is_ok());
    }

    #[test]
    fn test_commit_generations() {
        for compound in [false, true] {
            let index = index(compound);
            let mut writer = index.writer().unwrap();
            writer.add_document(&doc("a", "alpha", 1)).unwrap();
            writer.add_document(&doc("b", "beta", 2)).unwrap();
            let toc = writer.commit(MergePolicy::NoMerge).unwrap();
            assert_eq!(toc.generation, 1);
            assert_eq!(toc.segments[0].is_compound(), compound);

            let mut writer = index.writer().unwrap();
            writer.add_document(&doc("c", "alpha gamma", 3)).unwrap();
            let toc = writer.commit(MergePolicy::NoMerge).unwrap();
            assert_eq!(toc.generation, 2);
            assert_eq!(toc.segments.len(), 2);
            assert_eq!(index.latest_generation().unwrap(), Some(2));
            assert_eq!(ids(&index, &Query::term("body", "alpha")), vec!["a", "c"]);
        }
    }

    #[test]
    fn test_deletions() {
        let index = index(false);
        let mut writer = index.writer().unwrap();
        for (id, body) in [("a", "alpha"), ("b", "alpha beta"), ("c", "gamma")] {
            writer.add_document(&doc(id, body, 0)).unwrap();
        }
        writer.commit(MergePolicy::NoMerge).unwrap();

        let mut writer = index.writer().unwrap();
        assert_eq!(writer.delete_by_term("body", "beta").unwrap(), 1);
        let pending = writer.add_document(&doc("d", "alpha", 0)).unwrap();
        assert_eq!(pending, 3);
        writer.delete_document(pending).unwrap();
        assert_eq!(writer.doc_count(), 2);
        writer.commit(MergePolicy::NoMerge).unwrap();

        assert_eq!(ids(&index, &Query::term("body", "alpha")), vec!["a"]);
        assert_eq!(index.doc_count().unwrap(), 2);
        assert_eq!(index.doc_count_all().unwrap(), 4);
    }

    #[test]
    fn test_optimize_keeps_live_documents() {
        let index = index(true);
        for batch in [["a", "b"], ["c", "d"], ["e", "f"]] {
            let mut writer = index.writer().unwrap();
            for (i, id) in batch.iter().enumerate() {
                writer
                    .add_document(&doc(id, &format!("alpha w{i}"), i as i64))
                    .unwrap();
            }
            writer.commit(MergePolicy::NoMerge).unwrap();
        }
        let mut writer = index.writer().unwrap();
        writer.delete_by_term("id", "c").unwrap();
        writer.commit(MergePolicy::NoMerge).unwrap();

        let before = ids(&index, &Query::term("body", "w1"));
        let toc = index.optimize().unwrap();
        assert_eq!(toc.segments.len(), 1);
        assert!(!toc.segments[0].has_deletions());
        assert_eq!(ids(&index, &Query::term("body", "w1")), before);
        assert_eq!(ids(&index, &Query::term("body", "alpha")), vec!["a", "b", "d", "e", "f"]);
        assert_eq!(
            ids(&index, &Query::numeric_range("num", Some(1), Some(1))),
            vec!["b", "d", "f"]
        );

        let live = index.storage().list_files().unwrap();
        assert!(live.iter().filter(|f| f.ends_with(".toc")).count() == 1);
        assert!(live.iter().filter(|f| f.ends_with(".seg")).count() == 1);
    }
}
