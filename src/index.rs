//! Index management: segments, generations and writers.
//!
//! An index is a set of immutable segments listed by a versioned table of
//! contents ([`toc::Toc`]). Readers open one generation and never lock;
//! a single [`IndexWriter`] at a time, guarded by the `WRITELOCK` advisory
//! lock, publishes the next generation.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use whorl::index::{Index, IndexConfig, MergePolicy};
//! use whorl::query::Query;
//! use whorl::schema::{Document, FieldType, Schema};
//! use whorl::storage::Storage;
//! use whorl::storage::memory::MemoryStorage;
//!
//! let schema = Schema::builder()
//!     .add_field("body", FieldType::text().with_stored(true))
//!     .build()
//!     .unwrap();
//! let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
//! let index = Index::create(storage, schema, IndexConfig::default()).unwrap();
//!
//! let mut writer = index.writer().unwrap();
//! writer
//!     .add_document(&Document::builder().add_text("body", "hello world").build())
//!     .unwrap();
//! writer.commit(MergePolicy::MergeSmall).unwrap();
//!
//! let results = index.searcher().unwrap().search(&Query::term("body", "hello"), 10).unwrap();
//! assert_eq!(results.len(), 1);
//! ```

pub mod compound;
pub mod segment;
pub mod toc;
pub mod writer;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::{Result, WhorlError};
use crate::reader::{IndexReader, open_reader};
use crate::schema::Schema;
use crate::search::Searcher;
use crate::storage::Storage;

pub use self::toc::Toc;
pub use self::writer::{IndexWriter, MergePolicy};

/// Name of the advisory lock held by the index writer.
pub const WRITE_LOCK: &str = "WRITELOCK";

/// Index configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Prefix of every file of the index; several indexes can share a storage.
    pub index_name: String,
    /// Pack each new segment into one compound file.
    pub compound: bool,
    /// Postings per block.
    pub block_limit: usize,
    /// Retries of a TOC read that fails with an I/O error.
    pub toc_read_retries: usize,
    pub toc_retry_delay_ms: u64,
    /// Policy of [`IndexWriter::commit_default`].
    pub merge_policy: MergePolicy,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            index_name: "MAIN".to_string(),
            compound: true,
            block_limit: Codec::default().block_limit,
            toc_read_retries: 3,
            toc_retry_delay_ms: 50,
            merge_policy: MergePolicy::default(),
        }
    }
}

impl IndexConfig {
    pub fn codec(&self) -> Codec {
        Codec {
            block_limit: self.block_limit,
            ..Codec::default()
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.toc_retry_delay_ms)
    }
}

/// A handle on an index in a storage.
#[derive(Debug, Clone)]
pub struct Index {
    storage: Arc<dyn Storage>,
    config: IndexConfig,
}

impl Index {
    /// Create an empty index, removing any previous files of the same name.
    pub fn create(storage: Arc<dyn Storage>, schema: Schema, config: IndexConfig) -> Result<Index> {
        Toc::create(storage.as_ref(), schema, &config.index_name)?;
        Ok(Index { storage, config })
    }

    /// Open an existing index.
    pub fn open(storage: Arc<dyn Storage>, config: IndexConfig) -> Result<Index> {
        if !Index::exists(storage.as_ref(), &config.index_name)? {
            return Err(WhorlError::empty_index(format!(
                "no index named {} in this storage",
                config.index_name
            )));
        }
        Ok(Index { storage, config })
    }

    pub fn exists(storage: &dyn Storage, index_name: &str) -> Result<bool> {
        Ok(Toc::latest_generation(storage, index_name)?.is_some())
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn latest_generation(&self) -> Result<Option<u64>> {
        Toc::latest_generation(self.storage.as_ref(), &self.config.index_name)
    }

    /// The latest table of contents.
    pub fn toc(&self) -> Result<Toc> {
        Toc::read(
            self.storage.as_ref(),
            &self.config.index_name,
            None,
            self.config.toc_read_retries,
            self.config.retry_delay(),
        )
    }

    pub fn schema(&self) -> Result<Schema> {
        Ok(self.toc()?.schema)
    }

    /// Whether `reader` sees the latest generation.
    pub fn is_up_to_date(&self, reader: &dyn IndexReader) -> Result<bool> {
        Ok(self.latest_generation()? == Some(reader.generation()))
    }

    /// A reader over the latest generation.
    pub fn reader(&self) -> Result<Arc<dyn IndexReader>> {
        open_reader(&self.storage, &self.toc()?)
    }

    pub fn searcher(&self) -> Result<Searcher> {
        Searcher::new(self.reader()?)
    }

    /// Take the write lock and start a writer on the latest generation.
    pub fn writer(&self) -> Result<IndexWriter> {
        IndexWriter::open(Arc::clone(&self.storage), self.config.clone())
    }

    /// Live documents in the latest generation.
    pub fn doc_count(&self) -> Result<u64> {
        Ok(self.toc()?.segments.iter().map(|s| s.doc_count()).sum())
    }

    pub fn doc_count_all(&self) -> Result<u64> {
        Ok(self.toc()?.segments.iter().map(|s| s.doc_count_all()).sum())
    }

    /// Merge every segment into one.
    pub fn optimize(&self) -> Result<Toc> {
        self.writer()?.commit(MergePolicy::Optimize)
    }
}
