//! Matchers: forward-only cursors over matching document ids.
//!
//! A query compiles to a tree of [`Matcher`]s for one segment. Every matcher
//! follows the same contract:
//!
//! - ids are strictly increasing while [`Matcher::is_active`];
//! - [`Matcher::id`] of an inactive matcher is `u64::MAX`;
//! - moving or reading an inactive matcher fails with
//!   [`WhorlError::ReadTooFar`].
//!
//! # Block quality
//!
//! Matchers whose scores can be bounded support block-quality pruning:
//! [`Matcher::max_quality`] bounds every remaining score,
//! [`Matcher::block_quality`] bounds the scores of the current block, and
//! [`Matcher::skip_to_quality`] skips blocks that cannot reach a minimum.
//! [`Matcher::replace`] rebuilds a tree into a cheaper equivalent once a
//! collector knows the minimum score worth finding.

use crate::error::{Result, WhorlError};

pub mod array;
pub mod binary;
pub mod leaf;
pub mod span;
pub mod wrappers;

pub use array::ArrayUnionMatcher;
pub use binary::{BinaryMatcher, BinaryOp, make_chain, make_weighted_tree};
pub use leaf::{ListMatcher, PostingsMatcher};
pub use span::{Span, SpanKind, SpanMatcher};
pub use wrappers::{BoostMatcher, ConstantMatcher, FilterMatcher, InverseMatcher, MultiMatcher};

#[derive(Debug, Clone, Default)]
pub enum Matcher {
    /// Matches nothing.
    #[default]
    Null,
    List(ListMatcher),
    Postings(PostingsMatcher),
    Binary(Box<BinaryMatcher>),
    ArrayUnion(ArrayUnionMatcher),
    Inverse(Box<InverseMatcher>),
    Filter(Box<FilterMatcher>),
    Constant(Box<ConstantMatcher>),
    Boost(Box<BoostMatcher>),
    Multi(MultiMatcher),
    Span(Box<SpanMatcher>),
}

fn no_values(kind: &str) -> WhorlError {
    WhorlError::query(format!("{kind} matchers carry no per-document values"))
}

impl Matcher {
    pub fn union(a: Matcher, b: Matcher) -> Result<Matcher> {
        Ok(BinaryMatcher::new(BinaryOp::Union, a, b)?.into_matcher())
    }

    pub fn intersection(a: Matcher, b: Matcher) -> Result<Matcher> {
        Ok(BinaryMatcher::new(BinaryOp::Intersection, a, b)?.into_matcher())
    }

    pub fn and_not(a: Matcher, b: Matcher) -> Result<Matcher> {
        Ok(BinaryMatcher::new(BinaryOp::AndNot, a, b)?.into_matcher())
    }

    pub fn require(a: Matcher, b: Matcher) -> Result<Matcher> {
        Ok(BinaryMatcher::new(BinaryOp::Require, a, b)?.into_matcher())
    }

    pub fn and_maybe(a: Matcher, b: Matcher) -> Result<Matcher> {
        Ok(BinaryMatcher::new(BinaryOp::AndMaybe, a, b)?.into_matcher())
    }

    pub fn disjunction_max(a: Matcher, b: Matcher, tiebreak: f32) -> Result<Matcher> {
        Ok(BinaryMatcher::new(BinaryOp::DisjunctionMax { tiebreak }, a, b)?.into_matcher())
    }

    pub fn is_active(&self) -> bool {
        match self {
            Matcher::Null => false,
            Matcher::List(m) => m.is_active(),
            Matcher::Postings(m) => m.is_active(),
            Matcher::Binary(m) => m.is_active(),
            Matcher::ArrayUnion(m) => m.is_active(),
            Matcher::Inverse(m) => m.is_active(),
            Matcher::Filter(m) => m.child().is_active(),
            Matcher::Constant(m) => m.child().is_active(),
            Matcher::Boost(m) => m.child().is_active(),
            Matcher::Multi(m) => m.is_active(),
            Matcher::Span(m) => m.is_active(),
        }
    }

    /// The current document, or `u64::MAX` when inactive.
    pub fn id(&self) -> u64 {
        match self {
            Matcher::Null => u64::MAX,
            Matcher::List(m) => m.id(),
            Matcher::Postings(m) => m.id(),
            Matcher::Binary(m) => m.id(),
            Matcher::ArrayUnion(m) => m.id(),
            Matcher::Inverse(m) => m.id(),
            Matcher::Filter(m) => m.child().id(),
            Matcher::Constant(m) => m.child().id(),
            Matcher::Boost(m) => m.child().id(),
            Matcher::Multi(m) => m.id(),
            Matcher::Span(m) => m.id(),
        }
    }

    pub fn next(&mut self) -> Result<()> {
        if !self.is_active() {
            return Err(WhorlError::ReadTooFar);
        }
        match self {
            Matcher::Null => Err(WhorlError::ReadTooFar),
            Matcher::List(m) => m.next(),
            Matcher::Postings(m) => m.next(),
            Matcher::Binary(m) => m.next(),
            Matcher::ArrayUnion(m) => m.next(),
            Matcher::Inverse(m) => m.next(),
            Matcher::Filter(m) => m.next(),
            Matcher::Constant(m) => m.child_mut().next(),
            Matcher::Boost(m) => m.child_mut().next(),
            Matcher::Multi(m) => m.next(),
            Matcher::Span(m) => m.next(),
        }
    }

    /// Move to the first document `>= target`. Never moves backwards.
    pub fn skip_to(&mut self, target: u64) -> Result<()> {
        if !self.is_active() {
            return Err(WhorlError::ReadTooFar);
        }
        if target <= self.id() {
            return Ok(());
        }
        match self {
            Matcher::Null => Err(WhorlError::ReadTooFar),
            Matcher::List(m) => m.skip_to(target),
            Matcher::Postings(m) => m.skip_to(target),
            Matcher::Binary(m) => m.skip_to(target),
            Matcher::ArrayUnion(m) => m.skip_to(target),
            Matcher::Inverse(m) => m.skip_to(target),
            Matcher::Filter(m) => m.skip_to(target),
            Matcher::Constant(m) => m.child_mut().skip_to(target),
            Matcher::Boost(m) => m.child_mut().skip_to(target),
            Matcher::Multi(m) => m.skip_to(target),
            Matcher::Span(m) => m.skip_to(target),
        }
    }

    /// The weight of the current posting; 0 when inactive.
    pub fn weight(&self) -> f32 {
        if !self.is_active() {
            return 0.0;
        }
        match self {
            Matcher::Null => 0.0,
            Matcher::List(m) => m.weight(),
            Matcher::Postings(m) => m.weight(),
            Matcher::Binary(m) => m.weight(),
            Matcher::ArrayUnion(m) => m.weight(),
            Matcher::Inverse(m) => m.weight(),
            Matcher::Filter(m) => m.child().weight(),
            Matcher::Constant(m) => m.child().weight(),
            Matcher::Boost(m) => m.child().weight(),
            Matcher::Multi(m) => m.current_matcher().map_or(0.0, Matcher::weight),
            Matcher::Span(m) => m.child().weight(),
        }
    }

    /// The encoded value of the current posting.
    pub fn value(&self) -> Result<&[u8]> {
        if !self.is_active() {
            return Err(WhorlError::ReadTooFar);
        }
        match self {
            Matcher::Null => Err(WhorlError::ReadTooFar),
            Matcher::List(m) => m.value(),
            Matcher::Postings(m) => m.value(),
            Matcher::Binary(m) => m.value(),
            Matcher::ArrayUnion(_) => Err(no_values("array union")),
            Matcher::Inverse(_) => Err(no_values("inverse")),
            Matcher::Filter(m) => m.child().value(),
            Matcher::Constant(m) => m.child().value(),
            Matcher::Boost(m) => m.child().value(),
            Matcher::Multi(m) => m.current_matcher().ok_or(WhorlError::ReadTooFar)?.value(),
            Matcher::Span(m) => m.child().value(),
        }
    }

    /// Occurrences of the matched term(s) in the current document.
    pub fn frequency(&self) -> Result<u32> {
        if !self.is_active() {
            return Err(WhorlError::ReadTooFar);
        }
        match self {
            Matcher::Null => Err(WhorlError::ReadTooFar),
            Matcher::List(m) => m.frequency(),
            Matcher::Postings(m) => m.frequency(),
            Matcher::Binary(m) => m.frequency(),
            Matcher::ArrayUnion(_) => Err(no_values("array union")),
            Matcher::Inverse(_) => Err(no_values("inverse")),
            Matcher::Filter(m) => m.child().frequency(),
            Matcher::Constant(m) => m.child().frequency(),
            Matcher::Boost(m) => m.child().frequency(),
            Matcher::Multi(m) => m
                .current_matcher()
                .ok_or(WhorlError::ReadTooFar)?
                .frequency(),
            Matcher::Span(m) => Ok(m.spans().len() as u32),
        }
    }

    /// Token positions of the current posting.
    pub fn positions(&self) -> Result<Vec<u32>> {
        if !self.is_active() {
            return Err(WhorlError::ReadTooFar);
        }
        match self {
            Matcher::Null => Err(WhorlError::ReadTooFar),
            Matcher::List(m) => m.positions(),
            Matcher::Postings(m) => m.positions(),
            Matcher::Binary(m) => m.positions(),
            Matcher::ArrayUnion(_) => Err(no_values("array union")),
            Matcher::Inverse(_) => Err(no_values("inverse")),
            Matcher::Filter(m) => m.child().positions(),
            Matcher::Constant(m) => m.child().positions(),
            Matcher::Boost(m) => m.child().positions(),
            Matcher::Multi(m) => m
                .current_matcher()
                .ok_or(WhorlError::ReadTooFar)?
                .positions(),
            Matcher::Span(m) => Ok(m.spans().iter().flat_map(|s| s.start..=s.end).collect()),
        }
    }

    /// Spans of the current document, sorted by start.
    pub fn spans(&self) -> Result<Vec<Span>> {
        if !self.is_active() {
            return Err(WhorlError::ReadTooFar);
        }
        match self {
            Matcher::Null => Err(WhorlError::ReadTooFar),
            Matcher::List(m) => m.spans(),
            Matcher::Postings(m) => m.spans(),
            Matcher::Binary(m) => m.spans(),
            Matcher::ArrayUnion(_) => Err(no_values("array union")),
            Matcher::Inverse(_) => Err(no_values("inverse")),
            Matcher::Filter(m) => m.child().spans(),
            Matcher::Constant(m) => m.child().spans(),
            Matcher::Boost(m) => m.child().spans(),
            Matcher::Multi(m) => m.spans(),
            Matcher::Span(m) => Ok(m.spans()),
        }
    }

    pub fn score(&self) -> Result<f32> {
        if !self.is_active() {
            return Err(WhorlError::ReadTooFar);
        }
        match self {
            Matcher::Null => Err(WhorlError::ReadTooFar),
            Matcher::List(m) => Ok(m.weight()),
            Matcher::Postings(m) => Ok(m.score()),
            Matcher::Binary(m) => m.score(),
            Matcher::ArrayUnion(m) => Ok(m.score()),
            Matcher::Inverse(m) => Ok(m.weight()),
            Matcher::Filter(m) => m.child().score(),
            Matcher::Constant(m) => Ok(m.score()),
            Matcher::Boost(m) => Ok(m.child().score()? * m.factor()),
            Matcher::Multi(m) => m.current_matcher().ok_or(WhorlError::ReadTooFar)?.score(),
            Matcher::Span(m) => m.child().score(),
        }
    }

    /// Go back to the first document.
    pub fn reset(&mut self) -> Result<()> {
        match self {
            Matcher::Null => Ok(()),
            Matcher::List(m) => {
                m.reset();
                Ok(())
            }
            Matcher::Postings(m) => m.reset(),
            Matcher::Binary(m) => m.reset(),
            Matcher::ArrayUnion(m) => m.reset(),
            Matcher::Inverse(m) => m.reset(),
            Matcher::Filter(m) => m.reset(),
            Matcher::Constant(m) => m.child_mut().reset(),
            Matcher::Boost(m) => m.child_mut().reset(),
            Matcher::Multi(m) => m.reset(),
            Matcher::Span(m) => m.reset(),
        }
    }

    pub fn supports_block_quality(&self) -> bool {
        match self {
            Matcher::Null | Matcher::List(_) | Matcher::Constant(_) => true,
            Matcher::Postings(m) => m.supports_block_quality(),
            Matcher::Binary(m) => m.supports_block_quality(),
            Matcher::ArrayUnion(_) | Matcher::Inverse(_) => false,
            Matcher::Filter(m) => m.child().supports_block_quality(),
            Matcher::Boost(m) => m.supports_block_quality(),
            Matcher::Multi(m) => m.supports_block_quality(),
            Matcher::Span(m) => m.child().supports_block_quality(),
        }
    }

    /// An upper bound of every score this matcher will still produce.
    pub fn max_quality(&self) -> Result<f32> {
        if !self.supports_block_quality() {
            return Err(WhorlError::NoQualityAvailable);
        }
        if !self.is_active() {
            return Ok(0.0);
        }
        match self {
            Matcher::Null => Ok(0.0),
            Matcher::List(m) => Ok(m.max_quality()),
            Matcher::Postings(m) => m.max_quality(),
            Matcher::Binary(m) => m.max_quality(),
            Matcher::ArrayUnion(_) | Matcher::Inverse(_) => Err(WhorlError::NoQualityAvailable),
            Matcher::Filter(m) => m.child().max_quality(),
            Matcher::Constant(m) => Ok(m.score()),
            Matcher::Boost(m) => Ok(m.child().max_quality()? * m.factor()),
            Matcher::Multi(m) => m.max_quality(),
            Matcher::Span(m) => m.child().max_quality(),
        }
    }

    /// An upper bound of the scores in the current block.
    pub fn block_quality(&self) -> Result<f32> {
        if !self.supports_block_quality() {
            return Err(WhorlError::NoQualityAvailable);
        }
        if !self.is_active() {
            return Ok(0.0);
        }
        match self {
            Matcher::Null => Ok(0.0),
            Matcher::List(m) => Ok(m.max_quality()),
            Matcher::Postings(m) => m.block_quality(),
            Matcher::Binary(m) => m.block_quality(),
            Matcher::ArrayUnion(_) | Matcher::Inverse(_) => Err(WhorlError::NoQualityAvailable),
            Matcher::Filter(m) => m.child().block_quality(),
            Matcher::Constant(m) => Ok(m.score()),
            Matcher::Boost(m) => Ok(m.child().block_quality()? * m.factor()),
            Matcher::Multi(m) => m
                .current_matcher()
                .ok_or(WhorlError::ReadTooFar)?
                .block_quality(),
            Matcher::Span(m) => m.child().block_quality(),
        }
    }

    /// Skip blocks whose quality is below `min_quality`. Returns the number
    /// of blocks skipped.
    pub fn skip_to_quality(&mut self, min_quality: f32) -> Result<usize> {
        if !self.supports_block_quality() {
            return Err(WhorlError::NoQualityAvailable);
        }
        if !self.is_active() {
            return Ok(0);
        }
        match self {
            Matcher::Null => Ok(0),
            Matcher::List(m) => Ok(m.skip_to_quality(min_quality)),
            Matcher::Postings(m) => m.skip_to_quality(min_quality),
            Matcher::Binary(m) => m.skip_to_quality(min_quality),
            Matcher::ArrayUnion(_) | Matcher::Inverse(_) => Err(WhorlError::NoQualityAvailable),
            Matcher::Filter(m) => m.skip_to_quality(min_quality),
            Matcher::Constant(m) => Ok(m.skip_to_quality(min_quality)),
            Matcher::Boost(m) => m.skip_to_quality(min_quality),
            Matcher::Multi(m) => m.skip_to_quality(min_quality),
            Matcher::Span(m) => m.skip_to_quality(min_quality),
        }
    }

    /// Rebuild into a simpler matcher that still finds every remaining
    /// document scoring at least `min_quality`. The position is kept or
    /// moves forward past documents that could not qualify.
    pub fn replace(self, min_quality: f32) -> Result<Matcher> {
        let min_quality = if self.supports_block_quality() {
            min_quality
        } else {
            0.0
        };
        match self {
            Matcher::Null => Ok(Matcher::Null),
            Matcher::List(m) => Ok(m.replace(min_quality)),
            Matcher::Postings(m) => m.replace(min_quality),
            Matcher::Binary(m) => m.replace(min_quality),
            Matcher::ArrayUnion(m) => Ok(if m.is_active() {
                Matcher::ArrayUnion(m)
            } else {
                Matcher::Null
            }),
            Matcher::Inverse(m) => Ok(if m.is_active() {
                Matcher::Inverse(m)
            } else {
                Matcher::Null
            }),
            Matcher::Filter(m) => m.replace(min_quality),
            Matcher::Constant(m) => m.replace(min_quality),
            Matcher::Boost(m) => m.replace(min_quality),
            Matcher::Multi(m) => m.replace(min_quality),
            Matcher::Span(m) => Ok(m.replace()),
        }
    }

    /// Append the `(field, term)` leaves matching the current document.
    pub fn matching_terms(&self, out: &mut Vec<(String, Vec<u8>)>) {
        if !self.is_active() {
            return;
        }
        match self {
            Matcher::Null | Matcher::ArrayUnion(_) | Matcher::Inverse(_) => {}
            Matcher::List(m) => {
                if let Some((field, term)) = m.term() {
                    out.push((field.to_string(), term.to_vec()));
                }
            }
            Matcher::Postings(m) => out.push((m.field().to_string(), m.term().to_vec())),
            Matcher::Binary(m) => m.matching_terms(out),
            Matcher::Filter(m) => m.child().matching_terms(out),
            Matcher::Constant(m) => m.child().matching_terms(out),
            Matcher::Boost(m) => m.child().matching_terms(out),
            Matcher::Multi(m) => {
                if let Some(current) = m.current_matcher() {
                    current.matching_terms(out);
                }
            }
            Matcher::Span(m) => m.child().matching_terms(out),
        }
    }

    /// Every remaining id, leaving the matcher exhausted.
    pub fn all_ids(&mut self) -> Result<Vec<u64>> {
        if let Matcher::List(list) = self {
            return Ok(list.drain_ids());
        }
        let mut ids = Vec::new();
        while self.is_active() {
            ids.push(self.id());
            self.next()?;
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn list(ids: &BTreeSet<u64>) -> Matcher {
        ListMatcher::new(ids.iter().copied().collect()).into_matcher()
    }

    #[test]
    fn test_null() {
        let mut null = Matcher::Null;
        assert!(!null.is_active());
        assert_eq!(null.id(), u64::MAX);
        assert!(matches!(null.next(), Err(WhorlError::ReadTooFar)));
        assert!(matches!(null.score(), Err(WhorlError::ReadTooFar)));
        assert_eq!(null.max_quality().unwrap(), 0.0);
        assert!(null.all_ids().unwrap().is_empty());
    }

    #[test]
    fn test_inactive_errors() {
        let mut m = ListMatcher::new(vec![1]).into_matcher();
        m.next().unwrap();
        assert!(matches!(m.next(), Err(WhorlError::ReadTooFar)));
        assert!(matches!(m.skip_to(5), Err(WhorlError::ReadTooFar)));
        assert!(matches!(m.value(), Err(WhorlError::ReadTooFar)));
        assert!(matches!(m.spans(), Err(WhorlError::ReadTooFar)));
    }

    #[test]
    fn test_unsupported_quality() {
        let m = InverseMatcher::new(Matcher::Null, 2, None).unwrap();
        assert!(matches!(m.max_quality(), Err(WhorlError::NoQualityAvailable)));
        assert!(matches!(m.block_quality(), Err(WhorlError::NoQualityAvailable)));
    }

    #[test]
    fn test_matching_terms() {
        let a = ListMatcher::new(vec![1, 2]).with_term("body", b"a".to_vec()).into_matcher();
        let b = ListMatcher::new(vec![2]).with_term("body", b"b".to_vec()).into_matcher();
        let mut m = Matcher::union(a, b).unwrap();
        let mut terms = Vec::new();
        m.matching_terms(&mut terms);
        assert_eq!(terms, vec![("body".to_string(), b"a".to_vec())]);
        m.next().unwrap();
        terms.clear();
        m.matching_terms(&mut terms);
        assert_eq!(terms.len(), 2);
    }

    proptest! {
        #[test]
        fn prop_set_algebra(
            a in prop::collection::btree_set(0u64..200, 0..40),
            b in prop::collection::btree_set(0u64..200, 0..40),
        ) {
            let union: Vec<u64> = a.union(&b).copied().collect();
            let inter: Vec<u64> = a.intersection(&b).copied().collect();
            let diff: Vec<u64> = a.difference(&b).copied().collect();

            prop_assert_eq!(Matcher::union(list(&a), list(&b)).unwrap().all_ids().unwrap(), union);
            prop_assert_eq!(Matcher::intersection(list(&a), list(&b)).unwrap().all_ids().unwrap(), inter.clone());
            prop_assert_eq!(Matcher::require(list(&a), list(&b)).unwrap().all_ids().unwrap(), inter);
            prop_assert_eq!(Matcher::and_not(list(&a), list(&b)).unwrap().all_ids().unwrap(), diff);
            prop_assert_eq!(
                Matcher::and_maybe(list(&a), list(&b)).unwrap().all_ids().unwrap(),
                a.iter().copied().collect::<Vec<_>>()
            );
        }

        #[test]
        fn prop_skip_to_monotonic(
            a in prop::collection::btree_set(0u64..500, 1..60),
            b in prop::collection::btree_set(0u64..500, 1..60),
            targets in prop::collection::vec(0u64..600, 1..20),
        ) {
            let mut m = Matcher::union(list(&a), list(&b)).unwrap();
            let all: BTreeSet<u64> = a.union(&b).copied().collect();
            let mut last = m.id();
            for target in targets {
                if !m.is_active() {
                    break;
                }
                m.skip_to(target).unwrap();
                let id = m.id();
                prop_assert!(id >= last);
                if m.is_active() {
                    prop_assert!(all.contains(&id));
                    let expected = all.range(target.max(last)..).next().copied();
                    prop_assert_eq!(Some(id), expected);
                }
                last = id;
            }
        }
    }
}
