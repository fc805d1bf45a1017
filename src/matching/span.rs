//! Positional spans and the span matcher.
//!
//! A [`SpanMatcher`] wraps an ordinary matcher tree (an intersection for
//! `Near`, a union for `Or`, ...) and filters its documents down to those
//! where the span condition holds, auto-advancing past documents whose span
//! list comes out empty.

use crate::error::{Result, WhorlError};
use crate::matching::binary::{BinaryMatcher, BinaryOp};
use crate::matching::Matcher;

/// A range of token positions, optionally with character offsets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Span {
    pub start: u32,
    pub end: u32,
    pub startchar: Option<u32>,
    pub endchar: Option<u32>,
    pub boost: f32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Span {
            start: start.min(end),
            end: start.max(end),
            startchar: None,
            endchar: None,
            boost: 1.0,
        }
    }

    pub fn with_chars(start: u32, end: u32, startchar: u32, endchar: u32) -> Self {
        Span {
            startchar: Some(startchar),
            endchar: Some(endchar),
            ..Span::new(start, end)
        }
    }

    fn key(&self) -> (u32, u32, Option<u32>, Option<u32>) {
        (self.start, self.end, self.startchar, self.endchar)
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        (self.start >= other.start && self.start <= other.end)
            || (self.end >= other.start && self.end <= other.end)
            || (other.start >= self.start && other.start <= self.end)
            || (other.end >= self.start && other.end <= self.end)
    }

    /// Gap between two spans in positions; 0 when they overlap.
    pub fn distance_to(&self, other: &Span) -> u32 {
        if self.overlaps(other) {
            0
        } else if self.end < other.start {
            other.start - self.end
        } else {
            self.start - other.end
        }
    }

    /// The smallest span covering both.
    pub fn to(&self, other: &Span) -> Span {
        let chars = |a: Option<u32>, b: Option<u32>, pick: fn(u32, u32) -> u32| match (a, b) {
            (Some(a), Some(b)) => Some(pick(a, b)),
            (a, b) => a.or(b),
        };
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            startchar: chars(self.startchar, other.startchar, u32::min),
            endchar: chars(self.endchar, other.endchar, u32::max),
            boost: self.boost.max(other.boost),
        }
    }

    /// Merge overlapping or touching spans.
    pub fn merge(spans: &[Span]) -> Vec<Span> {
        let mut sorted = spans.to_vec();
        sort_spans(&mut sorted);
        let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
        for span in sorted {
            match merged.last_mut() {
                Some(last) if span.start <= last.end.saturating_add(1) => *last = last.to(&span),
                _ => merged.push(span),
            }
        }
        merged
    }
}

/// Sort by position and drop duplicates.
pub fn sort_spans(spans: &mut Vec<Span>) {
    spans.sort_by_key(Span::key);
    spans.dedup_by_key(|s| s.key());
}

/// The condition a [`SpanMatcher`] applies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpanKind {
    /// Spans ending at or before `limit`.
    First { limit: u32 },
    /// Covering spans of an `a` span and a `b` span at most `slop` apart.
    Near { slop: u32, ordered: bool, mindist: u32 },
    /// Spans of either side.
    Or,
    /// Spans of `a` that overlap no span of `b`.
    Not,
    /// Spans of `a` that contain a span of `b`.
    Contains,
    /// Spans of `a` ending before the first span of `b`.
    Before,
    /// Spans of `a` in documents that also match `b`.
    Condition,
}

#[derive(Debug, Clone)]
pub struct SpanMatcher {
    kind: SpanKind,
    child: Matcher,
    spans: Vec<Span>,
}

impl SpanMatcher {
    fn build(kind: SpanKind, child: Matcher) -> Result<Matcher> {
        let mut matcher = SpanMatcher {
            kind,
            child,
            spans: Vec::new(),
        };
        matcher.find_spans()?;
        Ok(Matcher::Span(Box::new(matcher)))
    }

    fn binary(kind: SpanKind, op: BinaryOp, a: Matcher, b: Matcher) -> Result<Matcher> {
        let child = Matcher::Binary(Box::new(BinaryMatcher::new(op, a, b)?));
        Self::build(kind, child)
    }

    pub fn first(child: Matcher, limit: u32) -> Result<Matcher> {
        Self::build(SpanKind::First { limit }, child)
    }

    pub fn near(a: Matcher, b: Matcher, slop: u32, ordered: bool, mindist: u32) -> Result<Matcher> {
        let kind = SpanKind::Near {
            slop,
            ordered,
            mindist,
        };
        Self::binary(kind, BinaryOp::Intersection, a, b)
    }

    pub fn or(a: Matcher, b: Matcher) -> Result<Matcher> {
        Self::binary(SpanKind::Or, BinaryOp::Union, a, b)
    }

    pub fn not(a: Matcher, b: Matcher) -> Result<Matcher> {
        Self::binary(SpanKind::Not, BinaryOp::AndMaybe, a, b)
    }

    pub fn contains(a: Matcher, b: Matcher) -> Result<Matcher> {
        Self::binary(SpanKind::Contains, BinaryOp::Intersection, a, b)
    }

    pub fn before(a: Matcher, b: Matcher) -> Result<Matcher> {
        Self::binary(SpanKind::Before, BinaryOp::Intersection, a, b)
    }

    pub fn condition(a: Matcher, b: Matcher) -> Result<Matcher> {
        Self::binary(SpanKind::Condition, BinaryOp::Intersection, a, b)
    }

    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    pub(crate) fn child(&self) -> &Matcher {
        &self.child
    }

    fn pair(&self) -> Result<(&Matcher, &Matcher)> {
        match &self.child {
            Matcher::Binary(pair) => Ok((&pair.a, &pair.b)),
            _ => Err(WhorlError::query(format!(
                "{:?} span needs two sub-matchers",
                self.kind
            ))),
        }
    }

    fn compute_spans(&self) -> Result<Vec<Span>> {
        let mut spans = match self.kind {
            SpanKind::First { limit } => {
                let mut spans = self.child.spans()?;
                spans.retain(|s| s.end <= limit);
                spans
            }
            SpanKind::Near {
                slop,
                ordered,
                mindist,
            } => {
                let (a, b) = self.pair()?;
                near_spans(&a.spans()?, &b.spans()?, slop, ordered, mindist)
            }
            SpanKind::Or => {
                let (a, b) = self.pair()?;
                let id = self.child.id();
                let mut spans = Vec::new();
                for side in [a, b] {
                    if side.is_active() && side.id() == id {
                        spans.extend(side.spans()?);
                    }
                }
                Span::merge(&spans)
            }
            SpanKind::Not => {
                let (a, b) = self.pair()?;
                let mut spans = a.spans()?;
                if b.is_active() && b.id() == a.id() {
                    let excluded = b.spans()?;
                    spans.retain(|s| !excluded.iter().any(|x| s.overlaps(x)));
                }
                spans
            }
            SpanKind::Contains => {
                let (a, b) = self.pair()?;
                let inner = b.spans()?;
                let mut spans = a.spans()?;
                spans.retain(|s| inner.iter().any(|x| s.start <= x.start && x.end <= s.end));
                spans
            }
            SpanKind::Before => {
                let (a, b) = self.pair()?;
                let first_b = b.spans()?.iter().map(|s| s.start).min();
                let mut spans = a.spans()?;
                spans.retain(|s| first_b.is_some_and(|start| s.end < start));
                spans
            }
            SpanKind::Condition => self.pair()?.0.spans()?,
        };
        sort_spans(&mut spans);
        Ok(spans)
    }

    /// Advance the child until a document with at least one span.
    fn find_spans(&mut self) -> Result<()> {
        self.spans.clear();
        while self.child.is_active() {
            self.spans = self.compute_spans()?;
            if !self.spans.is_empty() {
                break;
            }
            self.child.next()?;
        }
        Ok(())
    }

    pub(crate) fn is_active(&self) -> bool {
        self.child.is_active()
    }

    pub(crate) fn id(&self) -> u64 {
        self.child.id()
    }

    pub(crate) fn next(&mut self) -> Result<()> {
        self.child.next()?;
        self.find_spans()
    }

    pub(crate) fn skip_to(&mut self, target: u64) -> Result<()> {
        if target <= self.id() {
            return Ok(());
        }
        self.child.skip_to(target)?;
        self.find_spans()
    }

    pub(crate) fn spans(&self) -> Vec<Span> {
        self.spans.clone()
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        self.child.reset()?;
        self.find_spans()
    }

    pub(crate) fn skip_to_quality(&mut self, min_quality: f32) -> Result<usize> {
        let skipped = self.child.skip_to_quality(min_quality)?;
        if skipped > 0 {
            self.find_spans()?;
        }
        Ok(skipped)
    }

    pub(crate) fn replace(self) -> Matcher {
        if self.is_active() {
            Matcher::Span(Box::new(self))
        } else {
            Matcher::Null
        }
    }
}

/// Spans joining an `a` span to a `b` span no further than `slop` and no
/// closer than `mindist` apart. `b` spans are sorted by start.
pub fn near_spans(a: &[Span], b: &[Span], slop: u32, ordered: bool, mindist: u32) -> Vec<Span> {
    let mut spans = Vec::new();
    for aspan in a {
        for bspan in b {
            if u64::from(bspan.end) + u64::from(slop) < u64::from(aspan.start)
                || (ordered && aspan.start > bspan.start)
            {
                continue;
            }
            if u64::from(bspan.start) > u64::from(aspan.end) + u64::from(slop) {
                break;
            }
            let dist = aspan.distance_to(bspan);
            if mindist <= dist && dist <= slop {
                spans.push(aspan.to(bspan));
            }
        }
    }
    sort_spans(&mut spans);
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::postings::encode_positions;
    use crate::matching::leaf::ListMatcher;
    use crate::schema::PostingFormat;

    fn positions(docs: &[(u64, &[u32])]) -> Matcher {
        let ids = docs.iter().map(|(id, _)| *id).collect();
        let values = docs.iter().map(|(_, p)| encode_positions(p)).collect();
        ListMatcher::new(ids)
            .with_values(PostingFormat::Positions, values)
            .into_matcher()
    }

    #[test]
    fn test_span_geometry() {
        let a = Span::new(2, 4);
        assert!(a.overlaps(&Span::new(4, 6)));
        assert!(!a.overlaps(&Span::new(5, 6)));
        assert_eq!(a.distance_to(&Span::new(6, 6)), 2);
        assert_eq!(Span::new(8, 9).distance_to(&a), 4);
        let joined = a.to(&Span::new(7, 7));
        assert_eq!((joined.start, joined.end), (2, 7));

        let merged = Span::merge(&[Span::new(5, 6), Span::new(1, 2), Span::new(3, 3)]);
        assert_eq!(merged.len(), 1);
        assert_eq!((merged[0].start, merged[0].end), (1, 6));
    }

    #[test]
    fn test_near_adjacent() {
        let a = positions(&[(1, &[0])]);
        let b = positions(&[(1, &[1])]);
        let mut near = SpanMatcher::near(a, b, 1, true, 1).unwrap();
        assert_eq!(near.id(), 1);
        let spans = near.spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].start, spans[0].end), (0, 1));
        near.next().unwrap();
        assert!(!near.is_active());
    }

    #[test]
    fn test_near_skips_distant_documents() {
        let a = positions(&[(1, &[0]), (2, &[0]), (3, &[5])]);
        let b = positions(&[(1, &[6]), (2, &[2]), (3, &[4])]);
        let near = SpanMatcher::near(a.clone(), b.clone(), 2, false, 1).unwrap();
        let ids = near.clone().all_ids().unwrap();
        assert_eq!(ids, vec![2, 3]);

        let ordered = SpanMatcher::near(a, b, 2, true, 1).unwrap();
        assert_eq!(ordered.clone().all_ids().unwrap(), vec![2]);
    }

    #[test]
    fn test_first_and_not() {
        let a = positions(&[(0, &[0, 9]), (1, &[7])]);
        let first = SpanMatcher::first(a.clone(), 3).unwrap();
        assert_eq!(first.clone().all_ids().unwrap(), vec![0]);

        let b = positions(&[(0, &[0]), (1, &[7])]);
        let not = SpanMatcher::not(a, b).unwrap();
        assert_eq!(not.id(), 0);
        let spans = not.spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 9);
        assert_eq!(not.clone().all_ids().unwrap(), vec![0]);
    }

    #[test]
    fn test_or_contains_before() {
        let a = positions(&[(0, &[1]), (2, &[3])]);
        let b = positions(&[(1, &[0]), (2, &[5])]);
        let or = SpanMatcher::or(a.clone(), b.clone()).unwrap();
        assert_eq!(or.clone().all_ids().unwrap(), vec![0, 1, 2]);

        let before = SpanMatcher::before(a.clone(), b.clone()).unwrap();
        assert_eq!(before.clone().all_ids().unwrap(), vec![2]);

        let wide = SpanMatcher::near(a, b.clone(), 3, true, 1).unwrap();
        let mut contains = SpanMatcher::contains(wide, b).unwrap();
        assert_eq!(contains.all_ids().unwrap(), vec![2]);
    }

    #[test]
    fn test_or_merges_overlapping_spans() {
        let left = SpanMatcher::near(positions(&[(4, &[1])]), positions(&[(4, &[2])]), 1, true, 1).unwrap();
        let right = SpanMatcher::near(positions(&[(4, &[2])]), positions(&[(4, &[3])]), 1, true, 1).unwrap();
        let or = SpanMatcher::or(left, right).unwrap();
        assert_eq!(or.id(), 4);
        let spans = or.spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].start, spans[0].end), (1, 3));

        let apart = SpanMatcher::or(positions(&[(0, &[1])]), positions(&[(0, &[6])])).unwrap();
        let spans = apart.spans().unwrap();
        assert_eq!(spans.iter().map(|s| (s.start, s.end)).collect::<Vec<_>>(), vec![(1, 1), (6, 6)]);
    }
}
