//! `And`, `Or` and `DisjunctionMax` compilation.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::matching::{ArrayUnionMatcher, InverseMatcher, Matcher, make_chain, make_weighted_tree};
use crate::query::{Query, boosted};
use crate::reader::{IndexReader, SegmentReader};
use crate::search::{SearchContext, Searcher};

/// How an `Or` query builds its union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrStrategy {
    /// Decide from [`MatchingPolicy`].
    #[default]
    Auto,
    /// A balanced tree of binary unions.
    Tree,
    /// Window-at-a-time score arrays.
    Array,
    /// Arrays for the small clauses, a tree for the large ones.
    Split,
}

/// Cutoffs used when compiling queries. They tune speed only; every setting
/// matches the same documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingPolicy {
    /// Below this many clauses an automatic `Or` always uses a tree.
    pub too_many_clauses: usize,
    /// Segments with at most this many documents use plain arrays.
    pub array_doc_limit: u64,
    /// A clause matching less than this share of a segment counts as small
    /// for the split strategy.
    pub split_fraction: f64,
    /// Window size of array unions.
    pub array_part_size: usize,
    /// Multi-term queries expanding to more terms than this are matched
    /// without per-term scores.
    pub max_expansions: usize,
}

impl Default for MatchingPolicy {
    fn default() -> Self {
        MatchingPolicy {
            too_many_clauses: 64,
            array_doc_limit: 5000,
            split_fraction: 0.1,
            array_part_size: 2048,
            max_expansions: 1024,
        }
    }
}

impl MatchingPolicy {
    fn resolve(&self, strategy: OrStrategy, clauses: usize, doc_count: u64, needs_current: bool) -> OrStrategy {
        // Array unions cannot report the current sub-matchers.
        if needs_current {
            return OrStrategy::Tree;
        }
        match strategy {
            OrStrategy::Auto if clauses < self.too_many_clauses => OrStrategy::Tree,
            OrStrategy::Auto if doc_count <= self.array_doc_limit => OrStrategy::Array,
            OrStrategy::Auto => OrStrategy::Split,
            other => other,
        }
    }
}

fn is_not(query: &Query) -> bool {
    matches!(query, Query::Not { .. })
}

/// Compile the positive clauses, with their estimated sizes. `None` when a
/// clause of an intersection matches nothing here.
fn compile_all<'q>(
    queries: impl Iterator<Item = &'q Query>,
    all_required: bool,
    searcher: &Searcher,
    leaf: &SegmentReader,
    context: &SearchContext,
) -> Result<Option<Vec<(u64, Matcher)>>> {
    let mut items = Vec::new();
    for query in queries {
        let matcher = query.matcher(searcher, leaf, context)?;
        if !matcher.is_active() {
            if all_required {
                return Ok(None);
            }
            continue;
        }
        items.push((query.estimate_size(leaf)?, matcher));
    }
    Ok(Some(items))
}

/// Remove the documents of the `Not` clauses from `positive`. Without
/// positive clauses the result is the inverse of the negated union.
fn subtract(
    positive: Option<Matcher>,
    nots: &[&Query],
    searcher: &Searcher,
    leaf: &SegmentReader,
    context: &SearchContext,
) -> Result<Matcher> {
    let mut negated = Vec::new();
    for query in nots {
        if let Query::Not { query, .. } = query {
            let matcher = query.matcher(searcher, leaf, context)?;
            if matcher.is_active() {
                negated.push((query.estimate_size(leaf)?, matcher));
            }
        }
    }
    let negated = make_weighted_tree(negated, Matcher::union)?;

    match positive {
        Some(positive) if !negated.is_active() => Ok(positive),
        Some(positive) => Matcher::and_not(positive, negated),
        None if nots.is_empty() => Ok(Matcher::Null),
        None => InverseMatcher::new(negated, leaf.doc_count_all()?, leaf.deleted()),
    }
}

pub(crate) fn and_matcher(
    subqueries: &[Query],
    boost: f32,
    searcher: &Searcher,
    leaf: &SegmentReader,
    context: &SearchContext,
) -> Result<Matcher> {
    let nots: Vec<&Query> = subqueries.iter().filter(|q| is_not(q)).collect();
    let positives = subqueries.iter().filter(|q| !is_not(q));
    let Some(items) = compile_all(positives, true, searcher, leaf, context)? else {
        return Ok(Matcher::Null);
    };

    // Smallest clause first so the intersection skips as far as possible.
    let positive = if items.is_empty() {
        None
    } else {
        Some(make_chain(items, Matcher::intersection)?)
    };
    Ok(boosted(subtract(positive, &nots, searcher, leaf, context)?, boost))
}

pub(crate) fn or_matcher(
    subqueries: &[Query],
    boost: f32,
    strategy: OrStrategy,
    searcher: &Searcher,
    leaf: &SegmentReader,
    context: &SearchContext,
) -> Result<Matcher> {
    // A `Not` clause compiles to an inverse leaf and joins the union.
    let items = compile_all(subqueries.iter(), false, searcher, leaf, context)?.unwrap_or_default();
    if items.is_empty() {
        return Ok(Matcher::Null);
    }

    let doc_count = leaf.doc_count_all()?;
    let policy = &context.policy;
    let strategy = policy.resolve(strategy, items.len(), doc_count, context.needs_current);
    debug!("or of {} clauses over {doc_count} documents: {strategy:?}", items.len());

    let union = match strategy {
        OrStrategy::Array => {
            let matchers = items.into_iter().map(|(_, m)| m).collect();
            ArrayUnionMatcher::new(matchers, policy.array_part_size)?
        }
        OrStrategy::Split => {
            let cutoff = (doc_count as f64 * policy.split_fraction) as u64;
            let (small, large): (Vec<_>, Vec<_>) =
                items.into_iter().partition(|(size, _)| *size < cutoff);
            let small_size: u64 = small.iter().map(|(size, _)| size).sum();
            let small = if small.len() > 1 {
                let matchers = small.into_iter().map(|(_, m)| m).collect();
                ArrayUnionMatcher::new(matchers, policy.array_part_size)?
            } else {
                make_weighted_tree(small, Matcher::union)?
            };
            let large = make_weighted_tree(large, Matcher::union)?;
            match (small.is_active(), large.is_active()) {
                (true, true) => make_weighted_tree(
                    vec![(small_size, small), (cutoff, large)],
                    Matcher::union,
                )?,
                (true, false) => small,
                _ => large,
            }
        }
        _ => make_weighted_tree(items, Matcher::union)?,
    };
    Ok(boosted(union, boost))
}

pub(crate) fn dismax_matcher(
    subqueries: &[Query],
    boost: f32,
    tiebreak: f32,
    searcher: &Searcher,
    leaf: &SegmentReader,
    context: &SearchContext,
) -> Result<Matcher> {
    let items = compile_all(subqueries.iter(), false, searcher, leaf, context)?.unwrap_or_default();
    let matcher = make_weighted_tree(items, |a, b| Matcher::disjunction_max(a, b, tiebreak))?;
    Ok(boosted(matcher, boost))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::testing;

    fn ids(query: &Query, segments: &[&[&str]]) -> Vec<u64> {
        let searcher = testing::searcher(segments);
        searcher.docs_for_query(query).unwrap()
    }

    #[test]
    fn test_resolve() {
        let policy = MatchingPolicy {
            too_many_clauses: 3,
            array_doc_limit: 100,
            ..MatchingPolicy::default()
        };
        assert_eq!(policy.resolve(OrStrategy::Auto, 2, 1000, false), OrStrategy::Tree);
        assert_eq!(policy.resolve(OrStrategy::Auto, 5, 50, false), OrStrategy::Array);
        assert_eq!(policy.resolve(OrStrategy::Auto, 5, 1000, false), OrStrategy::Split);
        assert_eq!(policy.resolve(OrStrategy::Array, 5, 50, true), OrStrategy::Tree);
    }

    #[test]
    fn test_and_or_not() {
        let docs: &[&str] = &["alpha gamma", "beta gamma", "gamma", "alpha beta"];
        let gamma = || Query::term("body", "gamma");
        assert_eq!(
            ids(&Query::and(vec![Query::term("body", "beta"), gamma()]), &[docs]),
            vec![1]
        );
        assert_eq!(
            ids(
                &Query::or(vec![Query::term("body", "alpha"), Query::term("body", "beta")]),
                &[docs]
            ),
            vec![0, 1, 3]
        );
        assert_eq!(
            ids(
                &Query::and(vec![gamma(), Query::not(Query::term("body", "alpha"))]),
                &[docs]
            ),
            vec![1, 2]
        );
        assert_eq!(
            ids(&Query::and(vec![Query::not(gamma())]), &[docs]),
            vec![3]
        );
        assert!(ids(
            &Query::and(vec![gamma(), Query::term("body", "missing")]),
            &[docs]
        )
        .is_empty());
    }

    #[test]
    fn test_or_with_negated_clauses() {
        let docs: &[&str] = &["alpha", "beta", "gamma", "alpha beta"];
        let not = |t: &str| Query::not(Query::term("body", t));
        assert_eq!(
            ids(&Query::or(vec![Query::term("body", "alpha"), not("beta")]), &[docs]),
            vec![0, 2, 3]
        );
        assert_eq!(ids(&Query::or(vec![not("alpha"), not("beta")]), &[docs]), vec![0, 1, 2]);
        for strategy in [OrStrategy::Tree, OrStrategy::Array, OrStrategy::Split] {
            let q = Query::or_with(vec![Query::term("body", "gamma"), not("alpha")], strategy);
            assert_eq!(ids(&q, &[&docs[..2], &docs[2..]]), vec![1, 2], "{strategy:?}");
        }
    }

    #[test]
    fn test_strategies_agree() {
        let docs: Vec<String> = (0..60)
            .map(|i| format!("w{} w{} w{}", i % 7, i % 11, i % 13))
            .collect();
        let docs: Vec<&str> = docs.iter().map(String::as_str).collect();
        let clauses: Vec<Query> = (0..13).map(|i| Query::term("body", format!("w{i}"))).collect();
        let expected = ids(&Query::or_with(clauses.clone(), OrStrategy::Tree), &[&docs[..30], &docs[30..]]);
        for strategy in [OrStrategy::Array, OrStrategy::Split, OrStrategy::Auto] {
            assert_eq!(
                ids(&Query::or_with(clauses.clone(), strategy), &[&docs[..30], &docs[30..]]),
                expected,
                "{strategy:?}"
            );
        }
    }

    #[test]
    fn test_dismax() {
        let docs: &[&str] = &["alpha", "beta", "alpha beta"];
        let q = Query::disjunction_max(
            vec![Query::term("body", "alpha"), Query::term("body", "beta")],
            0.0,
        );
        assert_eq!(ids(&q, &[docs]), vec![0, 1, 2]);
    }
}
