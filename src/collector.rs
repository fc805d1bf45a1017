//! Collectors gather matches into [`Results`].
//!
//! The searcher hands each collector one segment matcher at a time. Base
//! collectors decide which documents are kept and in what order:
//!
//! - [`TopCollector`]: the best `limit` documents by score, with block-quality
//!   pruning.
//! - [`UnlimitedCollector`]: every match, by score.
//! - [`UnsortedCollector`]: every match, in document order, unscored.
//! - [`SortingCollector`]: matches ordered by a [`Facet`](crate::sorting::Facet).
//!
//! Wrappers in [`wrappers`] add grouping, filtering, collapsing, matched
//! terms and time limits on top of any base collector.

use std::fmt::Debug;
use std::time::Duration;

use crate::error::Result;
use crate::matching::Matcher;
use crate::query::Query;
use crate::reader::SegmentReader;
use crate::search::{Results, SearchContext, Searcher};
use crate::sorting::SortKey;

pub mod top;
pub mod wrappers;

pub use self::top::{SortingCollector, TopCollector, UnlimitedCollector, UnsortedCollector};
pub use self::wrappers::{
    CollapseCollector, FacetCollector, FacetMapType, FilterCollector, Groups, IdFilter,
    TermsCollector, TimeLimitCollector,
};

/// Receives matches from a search.
///
/// Document numbers passed to [`Collector::collect`] and
/// [`Collector::sort_key`] are local to the segment set by the last
/// [`Collector::set_subsearcher`]; [`Collector::remove`] takes global numbers.
pub trait Collector: Send + Debug {
    /// Reset for a new search.
    fn prepare(&mut self, searcher: &Searcher, query: &Query, context: &SearchContext) -> Result<()>;

    /// Move to the segment whose documents start at global number `offset`.
    fn set_subsearcher(&mut self, leaf: &SegmentReader, offset: u64) -> Result<()>;

    /// Whether [`Collector::collect`] reads the matcher's current state
    /// beyond its score.
    fn needs_current(&self) -> bool {
        false
    }

    /// Collect every remaining match of a segment matcher.
    fn collect_matches(&mut self, matcher: &mut Matcher) -> Result<()> {
        while matcher.is_active() {
            let docnum = matcher.id();
            self.collect(docnum, matcher)?;
            matcher.next()?;
        }
        Ok(())
    }

    fn collect(&mut self, docnum: u64, matcher: &Matcher) -> Result<()>;

    /// Forget a previously collected document.
    fn remove(&mut self, global_docnum: u64) -> Result<()>;

    /// The key this collector orders by; smaller sorts first.
    fn sort_key(&self, docnum: u64, matcher: &Matcher) -> Result<SortKey>;

    /// Number of documents collected so far.
    fn count(&self) -> u64;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    /// Record how long the search ran, from `prepare` to `finish` or to the
    /// error that stopped it.
    fn set_runtime(&mut self, runtime: Duration);

    fn results(&self) -> Results;
}
