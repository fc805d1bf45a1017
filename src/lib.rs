//! # Whorl
//!
//! A segmented, file-based full-text search engine.
//!
//! ## Features
//!
//! - Immutable segments published by versioned tables of contents
//! - On-disk hash tables, plain and ordered, for term dictionaries
//! - Block-encoded postings with quality bounds for top-K pruning
//! - A matcher tree with unions, intersections, negation and spans
//! - A normalizing query algebra compiled per segment
//! - Collectors for ranking, sorting, grouping, collapsing and time limits
//! - Pluggable storage backends and BM25F scoring

pub mod codec;
pub mod collector;
pub mod error;
pub mod hashtable;
pub mod index;
pub mod matching;
pub mod query;
pub mod reader;
pub mod schema;
pub mod scoring;
pub mod search;
pub mod sorting;
pub mod storage;
pub mod util;

pub mod prelude {
    pub use crate::collector::Collector;
    pub use crate::error::{Result, WhorlError};
    pub use crate::index::{Index, IndexConfig, IndexWriter, MergePolicy};
    pub use crate::query::{Query, SpanQuery};
    pub use crate::reader::IndexReader;
    pub use crate::schema::{Document, FieldType, Schema};
    pub use crate::search::{SearchOptions, Searcher};
    pub use crate::sorting::Facet;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
