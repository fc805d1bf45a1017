//! Collectors that wrap another collector.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use crossbeam_channel::{RecvTimeoutError, Sender};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::collector::Collector;
use crate::error::{Result, WhorlError};
use crate::matching::Matcher;
use crate::query::Query;
use crate::reader::SegmentReader;
use crate::search::{Results, SearchContext, Searcher};
use crate::sorting::{Categorizer, Facet, SortKey};

/// A set of documents for filtering, given as a query or as global document
/// numbers.
#[derive(Debug, Clone)]
pub enum IdFilter {
    Query(Query),
    Docs(Vec<u64>),
}

impl From<Query> for IdFilter {
    fn from(query: Query) -> Self {
        IdFilter::Query(query)
    }
}

impl From<Vec<u64>> for IdFilter {
    fn from(docs: Vec<u64>) -> Self {
        IdFilter::Docs(docs)
    }
}

impl IdFilter {
    fn resolve(&self, searcher: &Searcher) -> Result<AHashSet<u64>> {
        Ok(match self {
            IdFilter::Query(query) => searcher.docs_for_query(query)?.into_iter().collect(),
            IdFilter::Docs(docs) => docs.iter().copied().collect(),
        })
    }
}

/// Passes on only allowed documents and counts the others.
#[derive(Debug)]
pub struct FilterCollector {
    child: Box<dyn Collector>,
    allow: Option<IdFilter>,
    restrict: Option<IdFilter>,
    allowed: Option<AHashSet<u64>>,
    restricted: Option<AHashSet<u64>>,
    offset: u64,
    filtered_count: u64,
}

impl FilterCollector {
    /// Documents must be in `allow` (when given) and not in `restrict`.
    pub fn new(child: Box<dyn Collector>, allow: Option<IdFilter>, restrict: Option<IdFilter>) -> Self {
        FilterCollector {
            child,
            allow,
            restrict,
            allowed: None,
            restricted: None,
            offset: 0,
            filtered_count: 0,
        }
    }

    fn passes(&self, global: u64) -> bool {
        self.allowed.as_ref().is_none_or(|ids| ids.contains(&global))
            && !self.restricted.as_ref().is_some_and(|ids| ids.contains(&global))
    }
}

impl Collector for FilterCollector {
    fn prepare(&mut self, searcher: &Searcher, query: &Query, context: &SearchContext) -> Result<()> {
        self.allowed = self.allow.as_ref().map(|f| f.resolve(searcher)).transpose()?;
        self.restricted = self.restrict.as_ref().map(|f| f.resolve(searcher)).transpose()?;
        self.filtered_count = 0;
        self.child.prepare(searcher, query, context)
    }

    fn set_subsearcher(&mut self, leaf: &SegmentReader, offset: u64) -> Result<()> {
        self.offset = offset;
        self.child.set_subsearcher(leaf, offset)
    }

    fn needs_current(&self) -> bool {
        self.child.needs_current()
    }

    fn collect(&mut self, docnum: u64, matcher: &Matcher) -> Result<()> {
        if self.passes(self.offset + docnum) {
            self.child.collect(docnum, matcher)
        } else {
            self.filtered_count += 1;
            Ok(())
        }
    }

    fn remove(&mut self, global_docnum: u64) -> Result<()> {
        self.child.remove(global_docnum)
    }

    fn sort_key(&self, docnum: u64, matcher: &Matcher) -> Result<SortKey> {
        self.child.sort_key(docnum, matcher)
    }

    fn count(&self) -> u64 {
        self.child.count()
    }

    fn finish(&mut self) -> Result<()> {
        self.child.finish()
    }

    fn set_runtime(&mut self, runtime: Duration) {
        self.child.set_runtime(runtime);
    }

    fn results(&self) -> Results {
        let mut results = self.child.results();
        results.set_filtered_count(self.filtered_count);
        results
    }
}

/// What each group of a facet records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FacetMapType {
    /// Documents in hit order.
    #[default]
    OrderedList,
    /// Documents in collection order.
    UnorderedList,
    /// The number of documents.
    Count,
    /// The best document.
    Best,
}

/// Groups of one facet, keyed by group name.
#[derive(Debug, Clone, PartialEq)]
pub enum Groups {
    Lists(BTreeMap<String, Vec<u64>>),
    Counts(BTreeMap<String, u64>),
    Best(BTreeMap<String, u64>),
}

impl Groups {
    pub fn names(&self) -> Vec<&str> {
        match self {
            Groups::Lists(map) => map.keys().map(String::as_str).collect(),
            Groups::Counts(map) | Groups::Best(map) => map.keys().map(String::as_str).collect(),
        }
    }

    /// Documents of a group, for list maps.
    pub fn docs(&self, name: &str) -> Option<&[u64]> {
        match self {
            Groups::Lists(map) => map.get(name).map(Vec::as_slice),
            _ => None,
        }
    }

    pub fn count(&self, name: &str) -> u64 {
        match self {
            Groups::Lists(map) => map.get(name).map_or(0, |docs| docs.len() as u64),
            Groups::Counts(map) => map.get(name).copied().unwrap_or(0),
            Groups::Best(map) => u64::from(map.contains_key(name)),
        }
    }

    pub fn best(&self, name: &str) -> Option<u64> {
        match self {
            Groups::Best(map) => map.get(name).copied(),
            Groups::Lists(map) => map.get(name).and_then(|docs| docs.first().copied()),
            Groups::Counts(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct FacetMap {
    // (sort key, global docnum) in collection order.
    entries: BTreeMap<String, Vec<(SortKey, u64)>>,
}

impl FacetMap {
    fn add(&mut self, name: String, key: SortKey, docnum: u64) {
        self.entries.entry(name).or_default().push((key, docnum));
    }

    fn remove(&mut self, docnum: u64) {
        for docs in self.entries.values_mut() {
            docs.retain(|(_, d)| *d != docnum);
        }
        self.entries.retain(|_, docs| !docs.is_empty());
    }

    fn groups(&self, map_type: FacetMapType) -> Groups {
        let sorted = |docs: &[(SortKey, u64)]| {
            let mut docs = docs.to_vec();
            docs.sort();
            docs
        };
        match map_type {
            FacetMapType::OrderedList => Groups::Lists(
                self.entries
                    .iter()
                    .map(|(name, docs)| (name.clone(), sorted(docs).into_iter().map(|(_, d)| d).collect()))
                    .collect(),
            ),
            FacetMapType::UnorderedList => Groups::Lists(
                self.entries
                    .iter()
                    .map(|(name, docs)| (name.clone(), docs.iter().map(|(_, d)| *d).collect()))
                    .collect(),
            ),
            FacetMapType::Count => Groups::Counts(
                self.entries
                    .iter()
                    .map(|(name, docs)| (name.clone(), docs.len() as u64))
                    .collect(),
            ),
            FacetMapType::Best => Groups::Best(
                self.entries
                    .iter()
                    .filter_map(|(name, docs)| docs.iter().min().map(|(_, d)| (name.clone(), *d)))
                    .collect(),
            ),
        }
    }
}

/// Groups collected documents by one or more facets.
#[derive(Debug)]
pub struct FacetCollector {
    child: Box<dyn Collector>,
    facets: Vec<(String, Facet)>,
    map_type: FacetMapType,
    categorizers: Vec<(String, Box<dyn Categorizer>)>,
    maps: BTreeMap<String, FacetMap>,
    offset: u64,
}

impl FacetCollector {
    pub fn new(child: Box<dyn Collector>, facets: Vec<(String, Facet)>, map_type: FacetMapType) -> Self {
        FacetCollector {
            child,
            facets,
            map_type,
            categorizers: Vec::new(),
            maps: BTreeMap::new(),
            offset: 0,
        }
    }
}

impl Collector for FacetCollector {
    fn prepare(&mut self, searcher: &Searcher, query: &Query, context: &SearchContext) -> Result<()> {
        self.categorizers = self
            .facets
            .iter()
            .map(|(name, facet)| Ok((name.clone(), facet.categorizer(searcher)?)))
            .collect::<Result<_>>()?;
        self.maps = self
            .facets
            .iter()
            .map(|(name, _)| (name.clone(), FacetMap::default()))
            .collect();
        self.child.prepare(searcher, query, context)
    }

    fn set_subsearcher(&mut self, leaf: &SegmentReader, offset: u64) -> Result<()> {
        self.offset = offset;
        for (_, categorizer) in &mut self.categorizers {
            categorizer.set_searcher(leaf, offset)?;
        }
        self.child.set_subsearcher(leaf, offset)
    }

    fn needs_current(&self) -> bool {
        self.child.needs_current() || self.facets.iter().any(|(_, facet)| facet.needs_current())
    }

    fn collect(&mut self, docnum: u64, matcher: &Matcher) -> Result<()> {
        self.child.collect(docnum, matcher)?;
        let global = self.offset + docnum;
        let order = self.child.sort_key(docnum, matcher)?;
        for (name, categorizer) in &self.categorizers {
            let keys = if categorizer.allow_overlap() {
                categorizer.keys_for(docnum, matcher)?
            } else {
                vec![categorizer.key_for(docnum, matcher)?]
            };
            let Some(map) = self.maps.get_mut(name) else {
                continue;
            };
            for key in keys {
                map.add(categorizer.key_to_name(&key), order.clone(), global);
            }
        }
        Ok(())
    }

    fn remove(&mut self, global_docnum: u64) -> Result<()> {
        for map in self.maps.values_mut() {
            map.remove(global_docnum);
        }
        self.child.remove(global_docnum)
    }

    fn sort_key(&self, docnum: u64, matcher: &Matcher) -> Result<SortKey> {
        self.child.sort_key(docnum, matcher)
    }

    fn count(&self) -> u64 {
        self.child.count()
    }

    fn finish(&mut self) -> Result<()> {
        self.child.finish()
    }

    fn set_runtime(&mut self, runtime: Duration) {
        self.child.set_runtime(runtime);
    }

    fn results(&self) -> Results {
        let mut results = self.child.results();
        results.set_groups(
            self.maps
                .iter()
                .map(|(name, map)| (name.clone(), map.groups(self.map_type)))
                .collect(),
        );
        results
    }
}

/// Keeps at most `limit` documents per key of a facet. When a key is full, a
/// better document evicts the worst kept one from the wrapped collector.
#[derive(Debug)]
pub struct CollapseCollector {
    child: Box<dyn Collector>,
    facet: Facet,
    limit: usize,
    order: Option<Facet>,
    key_categorizer: Option<Box<dyn Categorizer>>,
    order_categorizer: Option<Box<dyn Categorizer>>,
    kept: AHashMap<String, Vec<(SortKey, u64)>>,
    collapsed: BTreeMap<String, u64>,
    offset: u64,
}

impl CollapseCollector {
    pub fn new(child: Box<dyn Collector>, facet: Facet, limit: usize, order: Option<Facet>) -> Self {
        CollapseCollector {
            child,
            facet,
            limit,
            order,
            key_categorizer: None,
            order_categorizer: None,
            kept: AHashMap::new(),
            collapsed: BTreeMap::new(),
            offset: 0,
        }
    }

    fn order_key(&self, docnum: u64, matcher: &Matcher) -> Result<SortKey> {
        match &self.order_categorizer {
            Some(categorizer) => categorizer.key_for(docnum, matcher),
            None => self.child.sort_key(docnum, matcher),
        }
    }
}

impl Collector for CollapseCollector {
    fn prepare(&mut self, searcher: &Searcher, query: &Query, context: &SearchContext) -> Result<()> {
        self.key_categorizer = Some(self.facet.categorizer(searcher)?);
        self.order_categorizer = self
            .order
            .as_ref()
            .map(|facet| facet.categorizer(searcher))
            .transpose()?;
        self.kept.clear();
        self.collapsed.clear();
        self.child.prepare(searcher, query, context)
    }

    fn set_subsearcher(&mut self, leaf: &SegmentReader, offset: u64) -> Result<()> {
        self.offset = offset;
        if let Some(categorizer) = &mut self.key_categorizer {
            categorizer.set_searcher(leaf, offset)?;
        }
        if let Some(categorizer) = &mut self.order_categorizer {
            categorizer.set_searcher(leaf, offset)?;
        }
        self.child.set_subsearcher(leaf, offset)
    }

    fn needs_current(&self) -> bool {
        self.child.needs_current()
            || self.facet.needs_current()
            || self.order.as_ref().is_some_and(Facet::needs_current)
    }

    fn collect(&mut self, docnum: u64, matcher: &Matcher) -> Result<()> {
        let Some(categorizer) = &self.key_categorizer else {
            return Err(WhorlError::query("collapse collector used before prepare"));
        };
        let key = categorizer.key_for(docnum, matcher)?;
        if key == SortKey::Missing {
            return self.child.collect(docnum, matcher);
        }
        let name = categorizer.key_to_name(&key);
        let entry = (self.order_key(docnum, matcher)?, self.offset + docnum);

        let kept = self.kept.entry(name.clone()).or_default();
        if kept.len() < self.limit {
            kept.push(entry);
            return self.child.collect(docnum, matcher);
        }

        let worst = kept
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.cmp(b.1))
            .map(|(i, _)| i);
        *self.collapsed.entry(name).or_default() += 1;
        if let Some(i) = worst
            && entry < kept[i]
        {
            let evicted = std::mem::replace(&mut kept[i], entry).1;
            self.child.remove(evicted)?;
            self.child.collect(docnum, matcher)?;
        }
        Ok(())
    }

    fn remove(&mut self, global_docnum: u64) -> Result<()> {
        for kept in self.kept.values_mut() {
            kept.retain(|(_, d)| *d != global_docnum);
        }
        self.child.remove(global_docnum)
    }

    fn sort_key(&self, docnum: u64, matcher: &Matcher) -> Result<SortKey> {
        self.child.sort_key(docnum, matcher)
    }

    fn count(&self) -> u64 {
        self.child.count()
    }

    fn finish(&mut self) -> Result<()> {
        self.child.finish()
    }

    fn set_runtime(&mut self, runtime: Duration) {
        self.child.set_runtime(runtime);
    }

    fn results(&self) -> Results {
        let mut results = self.child.results();
        results.set_collapsed_counts(self.collapsed.clone());
        results
    }
}

/// Stops collection once a time limit passes.
///
/// A timer thread raises a flag when the limit expires. A strict collector
/// fails before collecting the next document; a greedy one collects it and
/// then fails. Either way the wrapped collector keeps what it gathered, so
/// the partial results remain available through [`Collector::results`].
#[derive(Debug)]
pub struct TimeLimitCollector {
    child: Box<dyn Collector>,
    limit: Duration,
    greedy: bool,
    expired: Arc<AtomicBool>,
    timer: Option<(Sender<()>, JoinHandle<()>)>,
}

impl TimeLimitCollector {
    pub fn new(child: Box<dyn Collector>, limit: Duration, greedy: bool) -> Self {
        TimeLimitCollector {
            child,
            limit,
            greedy,
            expired: Arc::new(AtomicBool::new(false)),
            timer: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    fn start_timer(&mut self) {
        self.stop_timer();
        self.expired.store(false, Ordering::Release);
        let (cancel, cancelled) = crossbeam_channel::bounded::<()>(1);
        let expired = Arc::clone(&self.expired);
        let limit = self.limit;
        let handle = thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(limit) {
                expired.store(true, Ordering::Release);
                warn!("search exceeded its time limit of {limit:?}");
            }
        });
        self.timer = Some((cancel, handle));
    }

    fn stop_timer(&mut self) {
        if let Some((cancel, handle)) = self.timer.take() {
            drop(cancel);
            if handle.join().is_err() {
                debug!("time limit thread panicked");
            }
        }
    }

    fn expire(&mut self) -> Result<()> {
        self.stop_timer();
        Err(WhorlError::TimeLimit)
    }
}

impl Collector for TimeLimitCollector {
    fn prepare(&mut self, searcher: &Searcher, query: &Query, context: &SearchContext) -> Result<()> {
        self.child.prepare(searcher, query, context)?;
        self.start_timer();
        Ok(())
    }

    fn set_subsearcher(&mut self, leaf: &SegmentReader, offset: u64) -> Result<()> {
        self.child.set_subsearcher(leaf, offset)
    }

    fn needs_current(&self) -> bool {
        self.child.needs_current()
    }

    fn collect(&mut self, docnum: u64, matcher: &Matcher) -> Result<()> {
        if !self.greedy && self.is_expired() {
            return self.expire();
        }
        self.child.collect(docnum, matcher)?;
        if self.greedy && self.is_expired() {
            return self.expire();
        }
        Ok(())
    }

    fn remove(&mut self, global_docnum: u64) -> Result<()> {
        self.child.remove(global_docnum)
    }

    fn sort_key(&self, docnum: u64, matcher: &Matcher) -> Result<SortKey> {
        self.child.sort_key(docnum, matcher)
    }

    fn count(&self) -> u64 {
        self.child.count()
    }

    fn finish(&mut self) -> Result<()> {
        self.stop_timer();
        self.child.finish()
    }

    fn set_runtime(&mut self, runtime: Duration) {
        self.child.set_runtime(runtime);
    }

    fn results(&self) -> Results {
        let mut results = self.child.results();
        if self.is_expired() {
            results.set_exact(false);
        }
        results
    }
}

impl Drop for TimeLimitCollector {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

/// Records which terms matched in each collected document.
#[derive(Debug)]
pub struct TermsCollector {
    child: Box<dyn Collector>,
    docterms: BTreeMap<u64, Vec<(String, Vec<u8>)>>,
    offset: u64,
}

impl TermsCollector {
    pub fn new(child: Box<dyn Collector>) -> Self {
        TermsCollector {
            child,
            docterms: BTreeMap::new(),
            offset: 0,
        }
    }
}

impl Collector for TermsCollector {
    fn prepare(&mut self, searcher: &Searcher, query: &Query, context: &SearchContext) -> Result<()> {
        self.docterms.clear();
        self.child.prepare(searcher, query, context)
    }

    fn set_subsearcher(&mut self, leaf: &SegmentReader, offset: u64) -> Result<()> {
        self.offset = offset;
        self.child.set_subsearcher(leaf, offset)
    }

    fn needs_current(&self) -> bool {
        true
    }

    fn collect(&mut self, docnum: u64, matcher: &Matcher) -> Result<()> {
        self.child.collect(docnum, matcher)?;
        let mut terms = Vec::new();
        matcher.matching_terms(&mut terms);
        terms.sort();
        terms.dedup();
        self.docterms.insert(self.offset + docnum, terms);
        Ok(())
    }

    fn remove(&mut self, global_docnum: u64) -> Result<()> {
        self.docterms.remove(&global_docnum);
        self.child.remove(global_docnum)
    }

    fn sort_key(&self, docnum: u64, matcher: &Matcher) -> Result<SortKey> {
        self.child.sort_key(docnum, matcher)
    }

    fn count(&self) -> u64 {
        self.child.count()
    }

    fn finish(&mut self) -> Result<()> {
        self.child.finish()
    }

    fn set_runtime(&mut self, runtime: Duration) {
        self.child.set_runtime(runtime);
    }

    fn results(&self) -> Results {
        let mut results = self.child.results();
        results.set_matched_terms(self.docterms.clone());
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::testing;
    use crate::schema::Document;
    use crate::scoring::Frequency;
    use crate::search::SearchOptions;

    fn tagged(items: &[(&str, &str)]) -> Vec<Document> {
        items
            .iter()
            .map(|(body, tag)| Document::builder().add_text("body", *body).add_text("tag", *tag).build())
            .collect()
    }

    #[test]
    fn test_filter_and_mask() {
        let searcher = testing::searcher(&[&["alpha", "alpha beta"], &["alpha", "alpha gamma"]]);
        let query = Query::term("body", "alpha");

        let results = searcher
            .search_with(&query, SearchOptions::unlimited().with_filter(vec![1, 2, 9]))
            .unwrap();
        let mut docs = results.docs();
        docs.sort();
        assert_eq!(docs, vec![1, 2]);
        assert_eq!(results.filtered_count(), 2);

        let results = searcher
            .search_with(
                &query,
                SearchOptions::unlimited().with_mask(Query::term("body", "gamma")),
            )
            .unwrap();
        let mut docs = results.docs();
        docs.sort();
        assert_eq!(docs, vec![0, 1, 2]);
        assert_eq!(results.filtered_count(), 1);
    }

    #[test]
    fn test_grouping() {
        let docs = tagged(&[("alpha", "red"), ("alpha alpha", "blue"), ("alpha", "red"), ("beta", "red")]);
        let searcher = testing::searcher_over(&[docs]).with_weighting(Frequency);
        let query = Query::term("body", "alpha");

        let results = searcher
            .search_with(&query, SearchOptions::new(10).group_by("tag", Facet::field("tag")))
            .unwrap();
        let groups = results.groups("tag").unwrap();
        assert_eq!(groups.names(), vec!["blue", "red"]);
        assert_eq!(groups.docs("red"), Some(&[0, 2][..]));
        assert_eq!(groups.count("blue"), 1);

        let results = searcher
            .search_with(
                &query,
                SearchOptions::new(10)
                    .group_by("tag", Facet::field("tag"))
                    .with_group_map(FacetMapType::Count),
            )
            .unwrap();
        assert_eq!(results.groups("tag").unwrap().count("red"), 2);
    }

    #[test]
    fn test_collapse() {
        let docs = tagged(&[
            ("alpha", "red"),
            ("alpha alpha alpha", "red"),
            ("alpha alpha", "blue"),
            ("alpha alpha", "red"),
        ]);
        let searcher = testing::searcher_over(&[docs]).with_weighting(Frequency);
        let results = searcher
            .search_with(
                &Query::term("body", "alpha"),
                SearchOptions::new(10).collapse(Facet::field("tag"), 1),
            )
            .unwrap();
        assert_eq!(results.docs(), vec![1, 2]);
        assert_eq!(results.collapsed_counts().get("red"), Some(&2));
    }

    #[test]
    fn test_matched_terms() {
        let searcher = testing::searcher(&[&["alpha beta", "alpha", "beta"]]);
        let query = Query::or(vec![Query::term("body", "alpha"), Query::term("body", "beta")]);
        let results = searcher
            .search_with(&query, SearchOptions::new(10).with_terms())
            .unwrap();
        assert!(results.has_matched_terms());
        assert_eq!(
            results.matched_terms(0).unwrap(),
            &[
                ("body".to_string(), b"alpha".to_vec()),
                ("body".to_string(), b"beta".to_vec()),
            ][..]
        );
        assert_eq!(results.docs_for_term("body", b"beta"), vec![0, 2]);
    }

    #[test]
    fn test_time_limit() {
        let searcher = testing::searcher(&[&["alpha", "alpha"]]);
        let query = Query::term("body", "alpha");

        let results = searcher
            .search_with(
                &query,
                SearchOptions::new(10).with_time_limit(Duration::from_secs(60), false),
            )
            .unwrap();
        assert_eq!(results.len(), 2);

        let mut collector = TimeLimitCollector::new(
            Box::new(crate::collector::TopCollector::new(10)),
            Duration::ZERO,
            false,
        );
        collector.prepare(&searcher, &query, &searcher.context()).unwrap();
        while !collector.is_expired() {
            thread::sleep(Duration::from_millis(1));
        }
        let (leaf, offset) = searcher.leaf_readers()[0].clone();
        collector.set_subsearcher(&leaf, offset).unwrap();
        let err = collector.collect(0, &Matcher::Null).unwrap_err();
        assert!(matches!(err, WhorlError::TimeLimit));
        collector.set_runtime(Duration::from_millis(3));
        let partial = collector.results();
        assert!(partial.is_empty());
        assert!(!partial.is_exact());
        assert_eq!(partial.runtime(), Duration::from_millis(3));
    }
}
