//! Base collectors.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use log::debug;

use crate::collector::Collector;
use crate::error::{Result, WhorlError};
use crate::matching::Matcher;
use crate::query::Query;
use crate::reader::SegmentReader;
use crate::search::{Results, SearchContext, Searcher};
use crate::sorting::{Categorizer, Facet, SortKey};

/// A collected document. Orders from worst to best: lower score first, and
/// among equal scores the higher document number first.
#[derive(Debug, Clone, Copy)]
struct ScoredDoc {
    score: f32,
    docnum: u64,
}

impl PartialEq for ScoredDoc {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredDoc {}

impl PartialOrd for ScoredDoc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredDoc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.docnum.cmp(&self.docnum))
    }
}

fn score_key(score: f32) -> SortKey {
    SortKey::Reversed(Box::new(SortKey::Float(score as f64)))
}

/// Keeps the best `limit` documents by score.
///
/// Once the heap is full its lowest score is a threshold: blocks of the
/// matcher that cannot beat it are skipped, and every `replace_interval`
/// matches the matcher is rebuilt without sub-matchers that can no longer
/// contribute. A segment where either happened is counted again by an
/// unscored pass, so the count stays exact.
#[derive(Debug)]
pub struct TopCollector {
    limit: usize,
    use_quality: bool,
    replace_interval: usize,
    heap: BinaryHeap<Reverse<ScoredDoc>>,
    offset: u64,
    count: u64,
    recount: Option<(Searcher, Query, SearchContext)>,
    leaf: Option<SegmentReader>,
    runtime: Duration,
}

impl TopCollector {
    pub fn new(limit: usize) -> Self {
        TopCollector {
            limit,
            use_quality: true,
            replace_interval: 10,
            heap: BinaryHeap::with_capacity(limit.min(1024)),
            offset: 0,
            count: 0,
            recount: None,
            leaf: None,
            runtime: Duration::ZERO,
        }
    }

    pub fn with_quality(mut self, use_quality: bool) -> Self {
        self.use_quality = use_quality;
        self
    }

    pub fn with_replace_interval(mut self, interval: usize) -> Self {
        self.replace_interval = interval.max(1);
        self
    }

    fn is_full(&self) -> bool {
        self.limit > 0 && self.heap.len() >= self.limit
    }

    fn threshold(&self) -> f32 {
        self.heap.peek().map_or(0.0, |Reverse(worst)| worst.score)
    }

    /// Matches of the current segment, counted without scoring.
    fn count_segment(&self) -> Result<u64> {
        let (Some((searcher, query, context)), Some(leaf)) = (&self.recount, &self.leaf) else {
            return Err(WhorlError::query("top collector used before prepare"));
        };
        let mut matcher = query.matcher(searcher, leaf, context)?;
        Ok(matcher.all_ids()?.len() as u64)
    }
}

impl Collector for TopCollector {
    fn prepare(&mut self, searcher: &Searcher, query: &Query, context: &SearchContext) -> Result<()> {
        self.heap.clear();
        self.count = 0;
        self.recount = Some((searcher.clone(), query.clone(), context.clone()));
        Ok(())
    }

    fn set_subsearcher(&mut self, leaf: &SegmentReader, offset: u64) -> Result<()> {
        self.offset = offset;
        self.leaf = Some(leaf.clone());
        Ok(())
    }

    fn collect_matches(&mut self, matcher: &mut Matcher) -> Result<()> {
        let start_count = self.count;
        let mut pruned = false;
        let mut since_replace = 0;
        while matcher.is_active() {
            let docnum = matcher.id();
            self.collect(docnum, matcher)?;
            matcher.next()?;

            if !self.use_quality || !self.is_full() || !matcher.is_active() {
                continue;
            }
            // Only documents scoring above the worst kept one can enter.
            let threshold = self.threshold();
            since_replace += 1;
            if since_replace >= self.replace_interval {
                since_replace = 0;
                *matcher = std::mem::take(matcher).replace(threshold)?;
                pruned = true;
            }
            if matcher.is_active()
                && matcher.supports_block_quality()
                && matcher.skip_to_quality(threshold)? > 0
            {
                pruned = true;
            }
        }
        if pruned {
            let collected = self.count - start_count;
            self.count = start_count + self.count_segment()?;
            debug!(
                "pruning skipped {} of {} matches in segment at {}",
                (self.count - start_count).saturating_sub(collected),
                self.count - start_count,
                self.offset
            );
        }
        Ok(())
    }

    fn collect(&mut self, docnum: u64, matcher: &Matcher) -> Result<()> {
        self.count += 1;
        if self.limit == 0 {
            return Ok(());
        }
        let doc = ScoredDoc {
            score: matcher.score()?,
            docnum: self.offset + docnum,
        };
        if self.heap.len() < self.limit {
            self.heap.push(Reverse(doc));
        } else if self.heap.peek().is_some_and(|Reverse(worst)| doc > *worst) {
            self.heap.pop();
            self.heap.push(Reverse(doc));
        }
        Ok(())
    }

    fn remove(&mut self, global_docnum: u64) -> Result<()> {
        self.heap.retain(|Reverse(doc)| doc.docnum != global_docnum);
        self.count = self.count.saturating_sub(1);
        Ok(())
    }

    fn sort_key(&self, _docnum: u64, matcher: &Matcher) -> Result<SortKey> {
        Ok(score_key(matcher.score()?))
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn set_runtime(&mut self, runtime: Duration) {
        self.runtime = runtime;
    }

    fn results(&self) -> Results {
        let hits = self
            .heap
            .clone()
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(doc)| (doc.docnum, Some(doc.score)))
            .collect();
        Results::new(hits, self.count, true).with_runtime(self.runtime)
    }
}

/// Keeps every match, ordered by score.
#[derive(Debug, Default)]
pub struct UnlimitedCollector {
    reverse: bool,
    docs: Vec<ScoredDoc>,
    offset: u64,
    runtime: Duration,
}

impl UnlimitedCollector {
    /// With `reverse`, lowest scores first.
    pub fn new(reverse: bool) -> Self {
        UnlimitedCollector {
            reverse,
            ..UnlimitedCollector::default()
        }
    }
}

impl Collector for UnlimitedCollector {
    fn prepare(&mut self, _searcher: &Searcher, _query: &Query, _context: &SearchContext) -> Result<()> {
        self.docs.clear();
        Ok(())
    }

    fn set_subsearcher(&mut self, _leaf: &SegmentReader, offset: u64) -> Result<()> {
        self.offset = offset;
        Ok(())
    }

    fn collect(&mut self, docnum: u64, matcher: &Matcher) -> Result<()> {
        self.docs.push(ScoredDoc {
            score: matcher.score()?,
            docnum: self.offset + docnum,
        });
        Ok(())
    }

    fn remove(&mut self, global_docnum: u64) -> Result<()> {
        self.docs.retain(|doc| doc.docnum != global_docnum);
        Ok(())
    }

    fn sort_key(&self, _docnum: u64, matcher: &Matcher) -> Result<SortKey> {
        Ok(score_key(matcher.score()?).reversed_if(self.reverse))
    }

    fn count(&self) -> u64 {
        self.docs.len() as u64
    }

    fn set_runtime(&mut self, runtime: Duration) {
        self.runtime = runtime;
    }

    fn results(&self) -> Results {
        let mut docs = self.docs.clone();
        if self.reverse {
            docs.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.docnum.cmp(&b.docnum)));
        } else {
            docs.sort_by(|a, b| b.cmp(a));
        }
        let hits = docs.into_iter().map(|doc| (doc.docnum, Some(doc.score))).collect();
        Results::new(hits, self.docs.len() as u64, true).with_runtime(self.runtime)
    }
}

/// Keeps every match in document order without scoring.
#[derive(Debug, Default)]
pub struct UnsortedCollector {
    docs: Vec<u64>,
    offset: u64,
    runtime: Duration,
}

impl UnsortedCollector {
    pub fn new() -> Self {
        UnsortedCollector::default()
    }
}

impl Collector for UnsortedCollector {
    fn prepare(&mut self, _searcher: &Searcher, _query: &Query, _context: &SearchContext) -> Result<()> {
        self.docs.clear();
        Ok(())
    }

    fn set_subsearcher(&mut self, _leaf: &SegmentReader, offset: u64) -> Result<()> {
        self.offset = offset;
        Ok(())
    }

    fn collect_matches(&mut self, matcher: &mut Matcher) -> Result<()> {
        let offset = self.offset;
        self.docs
            .extend(matcher.all_ids()?.into_iter().map(|id| id + offset));
        Ok(())
    }

    fn collect(&mut self, docnum: u64, _matcher: &Matcher) -> Result<()> {
        self.docs.push(self.offset + docnum);
        Ok(())
    }

    fn remove(&mut self, global_docnum: u64) -> Result<()> {
        self.docs.retain(|&docnum| docnum != global_docnum);
        Ok(())
    }

    fn sort_key(&self, docnum: u64, _matcher: &Matcher) -> Result<SortKey> {
        Ok(SortKey::Int((self.offset + docnum) as i64))
    }

    fn count(&self) -> u64 {
        self.docs.len() as u64
    }

    fn set_runtime(&mut self, runtime: Duration) {
        self.runtime = runtime;
    }

    fn results(&self) -> Results {
        let hits = self.docs.iter().map(|&docnum| (docnum, None)).collect();
        Results::new(hits, self.docs.len() as u64, true).with_runtime(self.runtime)
    }
}

/// Orders matches by the keys of a facet, ties by document number.
#[derive(Debug)]
pub struct SortingCollector {
    facet: Facet,
    limit: Option<usize>,
    reverse: bool,
    categorizer: Option<Box<dyn Categorizer>>,
    items: Vec<(SortKey, u64, Option<f32>)>,
    offset: u64,
    runtime: Duration,
}

impl SortingCollector {
    pub fn new(facet: Facet, limit: Option<usize>, reverse: bool) -> Self {
        SortingCollector {
            facet,
            limit,
            reverse,
            categorizer: None,
            items: Vec::new(),
            offset: 0,
            runtime: Duration::ZERO,
        }
    }

    fn categorizer(&self) -> Result<&dyn Categorizer> {
        self.categorizer
            .as_deref()
            .ok_or_else(|| WhorlError::query("sorting collector used before prepare"))
    }
}

impl Collector for SortingCollector {
    fn prepare(&mut self, searcher: &Searcher, _query: &Query, _context: &SearchContext) -> Result<()> {
        self.categorizer = Some(self.facet.categorizer(searcher)?);
        self.items.clear();
        Ok(())
    }

    fn set_subsearcher(&mut self, leaf: &SegmentReader, offset: u64) -> Result<()> {
        self.offset = offset;
        match &mut self.categorizer {
            Some(categorizer) => categorizer.set_searcher(leaf, offset),
            None => Err(WhorlError::query("sorting collector used before prepare")),
        }
    }

    fn needs_current(&self) -> bool {
        self.facet.needs_current()
    }

    fn collect(&mut self, docnum: u64, matcher: &Matcher) -> Result<()> {
        let key = self.categorizer()?.key_for(docnum, matcher)?;
        let score = matcher.score()?;
        self.items.push((key, self.offset + docnum, Some(score)));
        Ok(())
    }

    fn remove(&mut self, global_docnum: u64) -> Result<()> {
        self.items.retain(|(_, docnum, _)| *docnum != global_docnum);
        Ok(())
    }

    fn sort_key(&self, docnum: u64, matcher: &Matcher) -> Result<SortKey> {
        Ok(self
            .categorizer()?
            .key_for(docnum, matcher)?
            .reversed_if(self.reverse))
    }

    fn count(&self) -> u64 {
        self.items.len() as u64
    }

    fn set_runtime(&mut self, runtime: Duration) {
        self.runtime = runtime;
    }

    fn results(&self) -> Results {
        let mut items = self.items.clone();
        if self.reverse {
            items.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        } else {
            items.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        }
        if let Some(limit) = self.limit {
            items.truncate(limit);
        }
        let hits = items.into_iter().map(|(_, docnum, score)| (docnum, score)).collect();
        Results::new(hits, self.items.len() as u64, true).with_runtime(self.runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::testing;
    use crate::schema::Document;
    use crate::scoring::Frequency;
    use crate::search::SearchOptions;

    #[test]
    fn test_top_keeps_best() {
        let searcher = testing::searcher(&[
            &["alpha", "alpha alpha alpha", "beta"],
            &["alpha alpha", "alpha alpha alpha alpha"],
        ])
        .with_weighting(Frequency);
        let results = searcher.search(&Query::term("body", "alpha"), 2).unwrap();
        assert_eq!(results.docs(), vec![4, 1]);
        assert_eq!(results.score(0), Some(4.0));
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_ties_prefer_lower_docnum() {
        let searcher = testing::searcher(&[&["alpha", "alpha", "alpha"]]).with_weighting(Frequency);
        let results = searcher.search(&Query::term("body", "alpha"), 2).unwrap();
        assert_eq!(results.docs(), vec![0, 1]);
    }

    #[test]
    fn test_pruned_matches_unpruned() {
        let texts: Vec<String> = (0..400)
            .map(|i| {
                let reps = if i % 97 == 0 { 9 } else { 1 + i % 3 };
                let mut text = vec!["alpha"; reps].join(" ");
                if i % 5 == 0 {
                    text.push_str(" beta");
                }
                text
            })
            .collect();
        let texts: Vec<&str> = texts.iter().map(String::as_str).collect();
        let searcher = testing::searcher(&[&texts[..250], &texts[250..]]).with_weighting(Frequency);
        let query = Query::or(vec![Query::term("body", "alpha"), Query::term("body", "beta")]);

        let pruned = searcher.search_with(&query, SearchOptions::new(5)).unwrap();
        let exact = searcher
            .search_with(&query, SearchOptions::new(5).without_quality())
            .unwrap();
        assert_eq!(pruned.docs(), exact.docs());
        assert!(exact.is_exact());
        assert_eq!(exact.count(), 400);
        assert_eq!(pruned.count(), 400);
        assert!(pruned.is_exact());
    }

    #[test]
    fn test_unsorted_and_unlimited() {
        let searcher = testing::searcher(&[&["alpha", "beta"], &["alpha alpha"]]).with_weighting(Frequency);
        let query = Query::term("body", "alpha");

        let mut unsorted = UnsortedCollector::new();
        searcher.search_with_collector(&query, &mut unsorted).unwrap();
        let results = unsorted.results();
        assert_eq!(results.docs(), vec![0, 2]);
        assert_eq!(results.score(0), None);

        let results = searcher.search_with(&query, SearchOptions::unlimited()).unwrap();
        assert_eq!(results.docs(), vec![2, 0]);
        let results = searcher
            .search_with(&query, SearchOptions::unlimited().reversed())
            .unwrap();
        assert_eq!(results.docs(), vec![0, 2]);
    }

    #[test]
    fn test_sorting_by_field() {
        let docs: Vec<Document> = [5, 1, 3]
            .into_iter()
            .map(|n| Document::builder().add_text("body", "alpha").add_integer("num", n).build())
            .collect();
        let searcher = testing::searcher_over(&[docs]);
        let query = Query::term("body", "alpha");

        let results = searcher
            .search_with(&query, SearchOptions::new(10).with_sort(Facet::field("num")))
            .unwrap();
        assert_eq!(results.docs(), vec![1, 2, 0]);

        let results = searcher
            .search_with(
                &query,
                SearchOptions::new(2).with_sort(Facet::field("num")).reversed(),
            )
            .unwrap();
        assert_eq!(results.docs(), vec![0, 2]);
        assert_eq!(results.count(), 3);
    }
}
