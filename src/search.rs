//! Running queries against a reader.
//!
//! A [`Searcher`] wraps a reader (usually a multi-segment one) and holds the
//! scoring model, the matching policy and a cache of index-wide term
//! statistics. Searching compiles the query once per segment and feeds each
//! segment's matcher to a [`Collector`], offsetting segment-local document
//! numbers into the global space.
//!
//! # Examples
//!
//! ```no_run
//! use whorl::index::Index;
//! use whorl::query::Query;
//! use whorl::search::SearchOptions;
//!
//! # fn run(index: &Index) -> whorl::error::Result<()> {
//! let searcher = index.searcher()?;
//! let results = searcher.search_with(
//!     &Query::term("body", "render"),
//!     SearchOptions::new(20).with_terms(),
//! )?;
//! for hit in results.hits() {
//!     println!("{} {:?}", hit.docnum, hit.score);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use log::debug;
use parking_lot::Mutex;

use crate::collector::{
    CollapseCollector, Collector, FacetCollector, FacetMapType, FilterCollector, Groups,
    IdFilter, SortingCollector, TermsCollector, TimeLimitCollector, TopCollector,
    UnlimitedCollector,
};
use crate::error::Result;
use crate::query::{MatchingPolicy, Query};
use crate::reader::{IndexReader, SegmentReader};
use crate::schema::{Document, Schema};
use crate::scoring::{Bm25F, TermStats, TermWeight, Weighting};
use crate::sorting::Facet;

/// What query compilation needs to know about the running search.
#[derive(Debug, Clone)]
pub struct SearchContext {
    pub weighting: Arc<dyn Weighting>,
    /// The collector reads the matcher's current sub-matchers (for scores of
    /// every clause or matched terms), so unions must stay trees.
    pub needs_current: bool,
    pub policy: MatchingPolicy,
}

/// Searches one reader.
#[derive(Debug, Clone)]
pub struct Searcher {
    reader: Arc<dyn IndexReader>,
    leaves: Vec<(SegmentReader, u64)>,
    weighting: Arc<dyn Weighting>,
    policy: MatchingPolicy,
    stats: Arc<Mutex<AHashMap<(String, Vec<u8>), TermStats>>>,
}

impl Searcher {
    pub fn new(reader: Arc<dyn IndexReader>) -> Result<Self> {
        let leaves = reader.leaf_readers()?;
        Ok(Searcher {
            reader,
            leaves,
            weighting: Arc::new(Bm25F::default()),
            policy: MatchingPolicy::default(),
            stats: Arc::new(Mutex::new(AHashMap::new())),
        })
    }

    pub fn with_weighting(mut self, weighting: impl Weighting + 'static) -> Self {
        self.weighting = Arc::new(weighting);
        self
    }

    pub fn with_policy(mut self, policy: MatchingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn reader(&self) -> &Arc<dyn IndexReader> {
        &self.reader
    }

    /// The segments of the reader with the global number of their first
    /// document.
    pub fn leaf_readers(&self) -> &[(SegmentReader, u64)] {
        &self.leaves
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.reader.schema()
    }

    pub fn weighting(&self) -> &Arc<dyn Weighting> {
        &self.weighting
    }

    pub fn policy(&self) -> &MatchingPolicy {
        &self.policy
    }

    pub fn doc_count(&self) -> Result<u64> {
        self.reader.doc_count()
    }

    pub fn doc_count_all(&self) -> Result<u64> {
        self.reader.doc_count_all()
    }

    pub fn stored_fields(&self, docnum: u64) -> Result<Document> {
        self.reader.stored_fields(docnum)
    }

    /// Inverse document frequency of a term given as text.
    pub fn idf(&self, field: &str, text: &str) -> Result<f32> {
        let term = self.schema().term_bytes(field, text)?;
        Ok(self.term_stats(field, &term)?.idf())
    }

    /// Statistics of an encoded term over the whole reader. Cached for the
    /// life of the searcher.
    pub fn term_stats(&self, field: &str, term: &[u8]) -> Result<TermStats> {
        let key = (field.to_string(), term.to_vec());
        if let Some(stats) = self.stats.lock().get(&key) {
            return Ok(*stats);
        }
        let field_boost = self
            .reader
            .schema()
            .get_field(field)
            .map_or(1.0, |f| f.field_boost);
        let stats = TermStats {
            doc_count: self.reader.doc_count_all()?,
            doc_frequency: self.reader.doc_frequency(field, term)?,
            collection_frequency: self.reader.frequency(field, term)?,
            avg_field_length: self.reader.avg_field_length(field)?,
            field_boost,
        };
        self.stats.lock().insert(key, stats);
        Ok(stats)
    }

    pub fn term_weight(
        &self,
        field: &str,
        term: &[u8],
        boost: f32,
        context: &SearchContext,
    ) -> Result<TermWeight> {
        let stats = self.term_stats(field, term)?;
        Ok(TermWeight::new(
            field,
            Arc::clone(&context.weighting),
            stats,
            boost,
        ))
    }

    /// A context for compiling queries outside of a search.
    pub fn context(&self) -> SearchContext {
        SearchContext {
            weighting: Arc::clone(&self.weighting),
            needs_current: false,
            policy: self.policy.clone(),
        }
    }

    /// Whether `query` matches any document of any segment.
    pub fn has_matches(&self, query: &Query, context: &SearchContext) -> Result<bool> {
        for (leaf, _) in &self.leaves {
            if query.matcher(self, leaf, context)?.is_active() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Global numbers of every document matching `query`, in order, without
    /// scoring.
    pub fn docs_for_query(&self, query: &Query) -> Result<Vec<u64>> {
        let context = self.context();
        let mut docs = Vec::new();
        for (leaf, offset) in &self.leaves {
            let mut matcher = query.matcher(self, leaf, &context)?;
            docs.extend(matcher.all_ids()?.into_iter().map(|id| id + offset));
        }
        Ok(docs)
    }

    /// The top `limit` documents by score.
    pub fn search(&self, query: &Query, limit: usize) -> Result<Results> {
        self.search_with(query, SearchOptions::new(limit))
    }

    pub fn search_with(&self, query: &Query, options: SearchOptions) -> Result<Results> {
        let mut collector = options.collector();
        self.search_with_collector(query, collector.as_mut())?;
        Ok(collector.results())
    }

    /// Feed every segment's matches for `query` to `collector`.
    ///
    /// The elapsed time is handed to the collector even when collection
    /// fails, so partial results after a time limit carry it too.
    pub fn search_with_collector(&self, query: &Query, collector: &mut dyn Collector) -> Result<()> {
        let started = Instant::now();
        let outcome = self.collect_segments(query, collector);
        let runtime = started.elapsed();
        collector.set_runtime(runtime);
        debug!("searched {} segments for {query} in {runtime:?}", self.leaves.len());
        outcome
    }

    fn collect_segments(&self, query: &Query, collector: &mut dyn Collector) -> Result<()> {
        let context = SearchContext {
            needs_current: collector.needs_current(),
            ..self.context()
        };
        collector.prepare(self, query, &context)?;
        for (leaf, offset) in &self.leaves {
            collector.set_subsearcher(leaf, *offset)?;
            let mut matcher = query.matcher(self, leaf, &context)?;
            collector.collect_matches(&mut matcher)?;
        }
        collector.finish()
    }

    pub fn close(&self) {
        self.reader.close();
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_closed()
    }
}

/// Options of [`Searcher::search_with`], assembled into a chain of collectors.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// `None` collects every match.
    pub limit: Option<usize>,
    /// Order by a facet instead of by score.
    pub sort_by: Option<Facet>,
    pub reverse: bool,
    /// Named facets to group matches by.
    pub group_by: Vec<(String, Facet)>,
    pub group_map: FacetMapType,
    /// Only documents matching this are collected.
    pub filter: Option<IdFilter>,
    /// Documents matching this are not collected.
    pub mask: Option<IdFilter>,
    /// Keep at most `collapse_limit` documents per key of this facet.
    pub collapse: Option<Facet>,
    pub collapse_limit: usize,
    /// Which documents of a key survive; the hit order when `None`.
    pub collapse_order: Option<Facet>,
    /// Record the terms that matched in each document.
    pub terms: bool,
    pub time_limit: Option<Duration>,
    /// On expiry, finish the current document before stopping.
    pub greedy: bool,
    /// Skip blocks that cannot reach the top `limit` scores.
    pub use_quality: bool,
    /// Matches between rebuilds of the matcher tree while pruning.
    pub replace_interval: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            limit: Some(10),
            sort_by: None,
            reverse: false,
            group_by: Vec::new(),
            group_map: FacetMapType::default(),
            filter: None,
            mask: None,
            collapse: None,
            collapse_limit: 1,
            collapse_order: None,
            terms: false,
            time_limit: None,
            greedy: false,
            use_quality: true,
            replace_interval: 10,
        }
    }
}

impl SearchOptions {
    pub fn new(limit: usize) -> Self {
        SearchOptions {
            limit: Some(limit),
            ..SearchOptions::default()
        }
    }

    pub fn unlimited() -> Self {
        SearchOptions {
            limit: None,
            ..SearchOptions::default()
        }
    }

    pub fn with_sort(mut self, facet: Facet) -> Self {
        self.sort_by = Some(facet);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn group_by(mut self, name: impl Into<String>, facet: Facet) -> Self {
        self.group_by.push((name.into(), facet));
        self
    }

    pub fn with_group_map(mut self, map: FacetMapType) -> Self {
        self.group_map = map;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<IdFilter>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_mask(mut self, mask: impl Into<IdFilter>) -> Self {
        self.mask = Some(mask.into());
        self
    }

    pub fn collapse(mut self, facet: Facet, limit: usize) -> Self {
        self.collapse = Some(facet);
        self.collapse_limit = limit;
        self
    }

    pub fn with_collapse_order(mut self, facet: Facet) -> Self {
        self.collapse_order = Some(facet);
        self
    }

    pub fn with_terms(mut self) -> Self {
        self.terms = true;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration, greedy: bool) -> Self {
        self.time_limit = Some(limit);
        self.greedy = greedy;
        self
    }

    pub fn without_quality(mut self) -> Self {
        self.use_quality = false;
        self
    }

    /// Collected documents between attempts to replace the matcher tree.
    pub fn with_replace_interval(mut self, interval: usize) -> Self {
        self.replace_interval = interval.max(1);
        self
    }

    /// Build the collector chain: the base collector, then facets, terms,
    /// collapsing, filtering and the time limit, each wrapping the last.
    pub fn collector(&self) -> Box<dyn Collector> {
        let mut collector: Box<dyn Collector> = match (&self.sort_by, self.limit) {
            (Some(facet), limit) => Box::new(SortingCollector::new(facet.clone(), limit, self.reverse)),
            (None, None) => Box::new(UnlimitedCollector::new(self.reverse)),
            (None, Some(limit)) => Box::new(
                TopCollector::new(limit)
                    .with_quality(self.use_quality)
                    .with_replace_interval(self.replace_interval),
            ),
        };
        if !self.group_by.is_empty() {
            collector = Box::new(FacetCollector::new(
                collector,
                self.group_by.clone(),
                self.group_map,
            ));
        }
        if self.terms {
            collector = Box::new(TermsCollector::new(collector));
        }
        if let Some(facet) = &self.collapse {
            collector = Box::new(CollapseCollector::new(
                collector,
                facet.clone(),
                self.collapse_limit,
                self.collapse_order.clone(),
            ));
        }
        if self.filter.is_some() || self.mask.is_some() {
            collector = Box::new(FilterCollector::new(
                collector,
                self.filter.clone(),
                self.mask.clone(),
            ));
        }
        if let Some(limit) = self.time_limit {
            collector = Box::new(TimeLimitCollector::new(collector, limit, self.greedy));
        }
        collector
    }
}

/// One ranked document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub docnum: u64,
    /// `None` when the search did not score.
    pub score: Option<f32>,
    pub rank: usize,
}

/// The outcome of a search.
#[derive(Debug, Clone, Default)]
pub struct Results {
    hits: Vec<Hit>,
    count: u64,
    exact: bool,
    runtime: Duration,
    groups: BTreeMap<String, Groups>,
    matched_terms: Option<BTreeMap<u64, Vec<(String, Vec<u8>)>>>,
    collapsed_counts: BTreeMap<String, u64>,
    filtered_count: u64,
}

impl Results {
    pub(crate) fn new(hits: Vec<(u64, Option<f32>)>, count: u64, exact: bool) -> Self {
        Results {
            hits: hits
                .into_iter()
                .enumerate()
                .map(|(rank, (docnum, score))| Hit {
                    docnum,
                    score,
                    rank,
                })
                .collect(),
            count,
            exact,
            ..Results::default()
        }
    }

    pub(crate) fn with_runtime(mut self, runtime: Duration) -> Self {
        self.runtime = runtime;
        self
    }

    pub(crate) fn set_exact(&mut self, exact: bool) {
        self.exact = exact;
    }

    pub(crate) fn set_groups(&mut self, groups: BTreeMap<String, Groups>) {
        self.groups = groups;
    }

    pub(crate) fn set_matched_terms(&mut self, terms: BTreeMap<u64, Vec<(String, Vec<u8>)>>) {
        self.matched_terms = Some(terms);
    }

    pub(crate) fn set_collapsed_counts(&mut self, counts: BTreeMap<String, u64>) {
        self.collapsed_counts = counts;
    }

    pub(crate) fn set_filtered_count(&mut self, count: u64) {
        self.filtered_count = count;
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn hits(&self) -> &[Hit] {
        &self.hits
    }

    /// Number of matching documents. A lower bound unless
    /// [`Results::is_exact`].
    pub fn count(&self) -> u64 {
        self.count
    }

    /// False when a time limit stopped collection early.
    pub fn is_exact(&self) -> bool {
        self.exact
    }

    /// Time spent collecting, from `prepare` to `finish`.
    pub fn runtime(&self) -> Duration {
        self.runtime
    }

    pub fn docnum(&self, n: usize) -> Option<u64> {
        self.hits.get(n).map(|hit| hit.docnum)
    }

    pub fn score(&self, n: usize) -> Option<f32> {
        self.hits.get(n).and_then(|hit| hit.score)
    }

    pub fn docs(&self) -> Vec<u64> {
        self.hits.iter().map(|hit| hit.docnum).collect()
    }

    pub fn groups(&self, name: &str) -> Option<&Groups> {
        self.groups.get(name)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn has_matched_terms(&self) -> bool {
        self.matched_terms.is_some()
    }

    /// The `(field, term)` pairs that matched in a document, when terms were
    /// recorded.
    pub fn matched_terms(&self, docnum: u64) -> Option<&[(String, Vec<u8>)]> {
        self.matched_terms
            .as_ref()
            .and_then(|terms| terms.get(&docnum))
            .map(Vec::as_slice)
    }

    /// Documents in which a term matched.
    pub fn docs_for_term(&self, field: &str, term: &[u8]) -> Vec<u64> {
        let Some(terms) = &self.matched_terms else {
            return Vec::new();
        };
        terms
            .iter()
            .filter(|(_, matched)| matched.iter().any(|(f, t)| f == field && t == term))
            .map(|(docnum, _)| *docnum)
            .collect()
    }

    pub fn collapsed_counts(&self) -> &BTreeMap<String, u64> {
        &self.collapsed_counts
    }

    pub fn filtered_count(&self) -> u64 {
        self.filtered_count
    }

    /// Stored fields of the `n`th hit.
    pub fn stored_fields(&self, searcher: &Searcher, n: usize) -> Result<Option<Document>> {
        self.docnum(n)
            .map(|docnum| searcher.stored_fields(docnum))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WhorlError;
    use crate::matching::Matcher;
    use crate::reader::testing;
    use crate::schema::FieldValue;
    use crate::scoring::Frequency;
    use crate::sorting::SortKey;

    #[test]
    fn test_search_ranks_by_score() {
        let searcher = testing::searcher(&[&["alpha beta", "alpha alpha alpha", "beta"]]);
        let results = searcher.search(&Query::term("body", "alpha"), 10).unwrap();
        assert_eq!(results.docs(), vec![1, 0]);
        assert_eq!(results.count(), 2);
        assert!(results.is_exact());
        assert!(results.score(0).unwrap() > results.score(1).unwrap());
        assert_eq!(results.hits()[1].rank, 1);

        let doc = results.stored_fields(&searcher, 0).unwrap().unwrap();
        assert_eq!(
            doc.get_field("body"),
            Some(&FieldValue::Text("alpha alpha alpha".to_string()))
        );
    }

    #[test]
    fn test_pruned_count_is_exact() {
        let bodies: Vec<&str> = (0..200).map(|d| if d == 0 { "ant ant ant ant ant" } else { "ant" }).collect();
        let searcher = testing::searcher(&[bodies.as_slice()]).with_weighting(Frequency);
        let results = searcher.search(&Query::term("body", "ant"), 1).unwrap();
        assert_eq!(results.docs(), vec![0]);
        assert_eq!(results.count(), 200);
        assert!(results.is_exact());
    }

    /// Sleeps and then fails on the first document.
    #[derive(Debug)]
    struct Stalling(TopCollector);

    impl Collector for Stalling {
        fn prepare(&mut self, searcher: &Searcher, query: &Query, context: &SearchContext) -> Result<()> {
            self.0.prepare(searcher, query, context)
        }

        fn set_subsearcher(&mut self, leaf: &SegmentReader, offset: u64) -> Result<()> {
            self.0.set_subsearcher(leaf, offset)
        }

        fn collect(&mut self, _docnum: u64, _matcher: &Matcher) -> Result<()> {
            std::thread::sleep(Duration::from_millis(5));
            Err(WhorlError::TimeLimit)
        }

        fn remove(&mut self, global_docnum: u64) -> Result<()> {
            self.0.remove(global_docnum)
        }

        fn sort_key(&self, docnum: u64, matcher: &Matcher) -> Result<SortKey> {
            self.0.sort_key(docnum, matcher)
        }

        fn count(&self) -> u64 {
            self.0.count()
        }

        fn set_runtime(&mut self, runtime: Duration) {
            self.0.set_runtime(runtime);
        }

        fn results(&self) -> Results {
            self.0.results()
        }
    }

    #[test]
    fn test_runtime_recorded() {
        let searcher = testing::searcher(&[&["alpha", "beta"], &["alpha"]]);
        let query = Query::term("body", "alpha");
        let results = searcher.search(&query, 10).unwrap();
        assert!(results.runtime() > Duration::ZERO);

        let mut stalling = Stalling(TopCollector::new(10));
        let err = searcher.search_with_collector(&query, &mut stalling).unwrap_err();
        assert!(matches!(err, WhorlError::TimeLimit));
        assert!(stalling.results().runtime() >= Duration::from_millis(5));
    }

    #[test]
    fn test_term_stats_span_segments() {
        let searcher = testing::searcher(&[&["alpha", "beta"], &["alpha gamma"]]);
        let term = searcher.schema().term_bytes("body", "alpha").unwrap();
        let stats = searcher.term_stats("body", &term).unwrap();
        assert_eq!(stats.doc_count, 3);
        assert_eq!(stats.doc_frequency, 2);
        assert!(searcher.idf("body", "gamma").unwrap() > searcher.idf("body", "alpha").unwrap());
    }

    #[test]
    fn test_global_docnums() {
        let searcher = testing::searcher(&[&["alpha", "beta"], &["beta", "alpha"]]);
        assert_eq!(searcher.docs_for_query(&Query::term("body", "alpha")).unwrap(), vec![0, 3]);
        let results = searcher.search_with(&Query::term("body", "beta"), SearchOptions::unlimited()).unwrap();
        let mut docs = results.docs();
        docs.sort();
        assert_eq!(docs, vec![1, 2]);
    }

    #[test]
    fn test_closed_searcher() {
        let searcher = testing::searcher(&[&["alpha"]]);
        searcher.close();
        assert!(searcher.is_closed());
        let err = searcher.search(&Query::term("body", "alpha"), 10).unwrap_err();
        assert!(matches!(err, WhorlError::ReaderClosed));
    }
}
