//! Segment metadata.

use std::sync::Arc;

use bit_vec::BitVec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{SEGMENT_EXTS, segment_file};
use crate::error::{Result, WhorlError};
use crate::index::compound::{COMPOUND_EXT, CompoundStorage};
use crate::storage::Storage;

/// An immutable unit of indexed documents.
///
/// Only the deletion bitmap changes after a segment is committed; a new TOC
/// generation carries the updated copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    index_name: String,
    segment_id: String,
    doc_count: u64,
    deleted: Option<BitVec>,
    compound: bool,
}

impl Segment {
    /// A new segment with a random id.
    pub fn new(index_name: &str, doc_count: u64, compound: bool) -> Self {
        Segment {
            index_name: index_name.to_string(),
            segment_id: Uuid::new_v4().simple().to_string(),
            doc_count,
            deleted: None,
            compound,
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn segment_id(&self) -> &str {
        &self.segment_id
    }

    /// `_{index}_{segid}`: the prefix of every file of this segment.
    pub fn base_name(&self) -> String {
        format!("_{}_{}", self.index_name, self.segment_id)
    }

    pub fn file_name(&self, ext: &str) -> String {
        segment_file(&self.base_name(), ext)
    }

    /// Names of the files this segment occupies in the index storage.
    pub fn file_names(&self) -> Vec<String> {
        if self.compound {
            vec![self.file_name(COMPOUND_EXT)]
        } else {
            SEGMENT_EXTS.iter().map(|ext| self.file_name(ext)).collect()
        }
    }

    pub fn is_compound(&self) -> bool {
        self.compound
    }

    /// Number of documents written, deleted or not.
    pub fn doc_count_all(&self) -> u64 {
        self.doc_count
    }

    /// Number of live documents.
    pub fn doc_count(&self) -> u64 {
        self.doc_count - self.deleted_count()
    }

    pub fn has_deletions(&self) -> bool {
        self.deleted_count() > 0
    }

    pub fn deleted_count(&self) -> u64 {
        self.deleted
            .as_ref()
            .map_or(0, |bits| bits.iter().filter(|&b| b).count() as u64)
    }

    pub fn deleted(&self) -> Option<&BitVec> {
        self.deleted.as_ref()
    }

    pub fn is_deleted(&self, docnum: u64) -> bool {
        self.deleted
            .as_ref()
            .and_then(|bits| bits.get(docnum as usize))
            .unwrap_or(false)
    }

    /// Mark a segment-local document as deleted.
    pub fn delete_document(&mut self, docnum: u64) -> Result<()> {
        if docnum >= self.doc_count {
            return Err(WhorlError::invalid_argument(format!(
                "document {docnum} out of range for segment {} with {} documents",
                self.segment_id, self.doc_count
            )));
        }
        let bits = self
            .deleted
            .get_or_insert_with(|| BitVec::from_elem(self.doc_count as usize, false));
        bits.set(docnum as usize, true);
        Ok(())
    }

    /// The storage the segment's files are read from: the index storage
    /// itself, or a view into the compound file.
    pub fn storage_for(&self, storage: &Arc<dyn Storage>) -> Result<Arc<dyn Storage>> {
        if self.compound {
            Ok(Arc::new(CompoundStorage::open(
                storage.as_ref(),
                &self.file_name(COMPOUND_EXT),
            )?))
        } else {
            Ok(Arc::clone(storage))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        let segment = Segment::new("main", 3, false);
        assert_eq!(segment.segment_id().len(), 32);
        assert!(segment.base_name().starts_with("_main_"));
        assert_eq!(segment.file_names().len(), SEGMENT_EXTS.len());

        let compound = Segment::new("main", 3, true);
        assert_eq!(compound.file_names(), vec![compound.file_name("seg")]);
    }

    #[test]
    fn test_deletions() {
        let mut segment = Segment::new("main", 4, false);
        assert!(!segment.has_deletions());
        assert!(!segment.is_deleted(1));

        segment.delete_document(1).unwrap();
        segment.delete_document(1).unwrap();
        assert!(segment.is_deleted(1));
        assert_eq!(segment.doc_count(), 3);
        assert_eq!(segment.doc_count_all(), 4);
        assert!(segment.delete_document(4).is_err());

        let bytes = bincode::serialize(&segment).unwrap();
        let decoded: Segment = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, segment);
    }
}
