//! `Not`, the two-operand queries and `ConstantScore`.

use crate::error::Result;
use crate::matching::{ConstantMatcher, InverseMatcher, Matcher};
use crate::query::{Query, boosted};
use crate::reader::{IndexReader, SegmentReader};
use crate::search::{SearchContext, Searcher};

pub(crate) fn not_matcher(
    query: &Query,
    boost: f32,
    searcher: &Searcher,
    leaf: &SegmentReader,
    context: &SearchContext,
) -> Result<Matcher> {
    let child = query.matcher(searcher, leaf, context)?;
    let inverse = InverseMatcher::new(child, leaf.doc_count_all()?, leaf.deleted())?;
    Ok(boosted(inverse, boost))
}

pub(crate) fn and_not_matcher(
    a: &Query,
    b: &Query,
    boost: f32,
    searcher: &Searcher,
    leaf: &SegmentReader,
    context: &SearchContext,
) -> Result<Matcher> {
    let a = a.matcher(searcher, leaf, context)?;
    if !a.is_active() {
        return Ok(Matcher::Null);
    }
    let b = b.matcher(searcher, leaf, context)?;
    let matcher = if b.is_active() {
        Matcher::and_not(a, b)?
    } else {
        a
    };
    Ok(boosted(matcher, boost))
}

pub(crate) fn require_matcher(
    a: &Query,
    b: &Query,
    boost: f32,
    searcher: &Searcher,
    leaf: &SegmentReader,
    context: &SearchContext,
) -> Result<Matcher> {
    let a = a.matcher(searcher, leaf, context)?;
    if !a.is_active() {
        return Ok(Matcher::Null);
    }
    let b = b.matcher(searcher, leaf, context)?;
    if !b.is_active() {
        return Ok(Matcher::Null);
    }
    Ok(boosted(Matcher::require(a, b)?, boost))
}

pub(crate) fn and_maybe_matcher(
    a: &Query,
    b: &Query,
    boost: f32,
    searcher: &Searcher,
    leaf: &SegmentReader,
    context: &SearchContext,
) -> Result<Matcher> {
    let a = a.matcher(searcher, leaf, context)?;
    if !a.is_active() {
        return Ok(Matcher::Null);
    }
    let b = b.matcher(searcher, leaf, context)?;
    let matcher = if b.is_active() {
        Matcher::and_maybe(a, b)?
    } else {
        a
    };
    Ok(boosted(matcher, boost))
}

/// `a` when it matches anywhere in the searched index, else `b`. The choice is
/// made over the whole index so every segment compiles the same side.
pub(crate) fn otherwise_matcher(
    a: &Query,
    b: &Query,
    boost: f32,
    searcher: &Searcher,
    leaf: &SegmentReader,
    context: &SearchContext,
) -> Result<Matcher> {
    let chosen = if searcher.has_matches(a, context)? { a } else { b };
    Ok(boosted(chosen.matcher(searcher, leaf, context)?, boost))
}

pub(crate) fn constant_matcher(
    query: &Query,
    score: f32,
    searcher: &Searcher,
    leaf: &SegmentReader,
    context: &SearchContext,
) -> Result<Matcher> {
    let child = query.matcher(searcher, leaf, context)?;
    if !child.is_active() {
        return Ok(Matcher::Null);
    }
    Ok(ConstantMatcher::new(child, score))
}

#[cfg(test)]
mod tests {
    use crate::query::Query;
    use crate::reader::testing;

    #[test]
    fn test_binary_queries() {
        let docs: &[&str] = &["alpha gamma", "beta gamma", "gamma", "alpha"];
        let searcher = testing::searcher(&[&docs[..2], &docs[2..]]);
        let term = |t: &str| Query::term("body", t);
        let ids = |q: &Query| searcher.docs_for_query(q).unwrap();

        assert_eq!(ids(&Query::and_not(term("gamma"), term("alpha"))), vec![1, 2]);
        assert_eq!(ids(&Query::require(term("gamma"), term("alpha"))), vec![0]);
        assert_eq!(ids(&Query::and_maybe(term("gamma"), term("alpha"))), vec![0, 1, 2]);
        assert_eq!(ids(&Query::not(term("gamma"))), vec![3]);
        assert_eq!(ids(&Query::otherwise(term("delta"), term("beta"))), vec![1]);
        assert_eq!(ids(&Query::otherwise(term("beta"), term("gamma"))), vec![1]);
        assert_eq!(ids(&Query::constant_score(term("alpha"), 2.0)), vec![0, 3]);
    }

    #[test]
    fn test_constant_score() {
        let searcher = testing::searcher(&[&["alpha alpha", "alpha beta gamma"]]);
        let results = searcher
            .search(&Query::constant_score(Query::term("body", "alpha"), 2.5), 10)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.hits().iter().all(|hit| hit.score == Some(2.5)));
    }

    #[test]
    fn test_and_maybe_scores() {
        let searcher = testing::searcher(&[&["alpha", "alpha beta"]]);
        let results = searcher
            .search(
                &Query::and_maybe(Query::term("body", "alpha"), Query::term("body", "beta")),
                10,
            )
            .unwrap();
        assert_eq!(results.docnum(0), Some(1));
    }
}
