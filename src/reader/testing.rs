//! Small in-memory indexes for unit tests.

use std::sync::Arc;

use crate::codec::{Codec, SegmentBuilder};
use crate::index::segment::Segment;
use crate::reader::{IndexReader, MultiReader, SegmentReader};
use crate::schema::{Document, FieldType, Schema};
use crate::search::Searcher;
use crate::storage::Storage;
use crate::storage::memory::MemoryStorage;

pub(crate) fn schema() -> Schema {
    Schema::builder()
        .add_field("body", FieldType::text().with_stored(true))
        .add_field("tag", FieldType::keyword().with_stored(true))
        .add_field("num", FieldType::numeric().with_stored(true))
        .build()
        .unwrap()
}

pub(crate) fn documents(texts: &[&str]) -> Vec<Document> {
    texts
        .iter()
        .map(|text| Document::builder().add_text("body", *text).build())
        .collect()
}

pub(crate) fn segment_from(storage: &Arc<dyn Storage>, docs: &[Document]) -> SegmentReader {
    let schema = schema();
    let mut builder = SegmentBuilder::new(schema.clone());
    for doc in docs {
        builder.add_document(doc).unwrap();
    }
    let segment = Segment::new("test", docs.len() as u64, false);
    builder
        .write(storage.as_ref(), &segment.base_name(), &Codec::default())
        .unwrap();
    SegmentReader::open(storage, Arc::new(schema), segment, 1).unwrap()
}

pub(crate) fn segment(texts: &[&str]) -> SegmentReader {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    segment_from(&storage, &documents(texts))
}

/// A searcher over one segment per slice of documents.
pub(crate) fn searcher_over(segments: &[Vec<Document>]) -> Searcher {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let mut readers: Vec<SegmentReader> = segments
        .iter()
        .map(|docs| segment_from(&storage, docs))
        .collect();
    let reader: Arc<dyn IndexReader> = if readers.len() == 1 {
        Arc::new(readers.remove(0))
    } else {
        Arc::new(MultiReader::new(readers, Arc::new(schema()), 1))
    };
    Searcher::new(reader).unwrap()
}

pub(crate) fn searcher(segments: &[&[&str]]) -> Searcher {
    let docs: Vec<Vec<Document>> = segments.iter().map(|texts| documents(texts)).collect();
    searcher_over(&docs)
}
