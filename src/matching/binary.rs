//! Binary combinators and tree builders.
//!
//! Quality bounds of a combinator are sound upper bounds of its score, so a
//! child may skip blocks using `min_quality - other.max_quality()` as its own
//! threshold: any document in a skipped block scores below `min_quality`
//! whatever the other side contributes.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::debug;

use crate::error::Result;
use crate::matching::Matcher;
use crate::matching::span::{Span, sort_spans};

/// How a [`BinaryMatcher`] combines its sides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    /// Documents in either side; scores add.
    Union,
    /// Documents in both sides; scores add.
    Intersection,
    /// Documents in `a` but not `b`; scored by `a`.
    AndNot,
    /// Documents in both sides; scored by `a`.
    Require,
    /// Documents in `a`; `b` adds its score where it also matches.
    AndMaybe,
    /// Documents in either side; the best score plus `tiebreak` times the other.
    DisjunctionMax { tiebreak: f32 },
}

fn dismax(x: f32, y: f32, tiebreak: f32) -> f32 {
    x.max(y) + tiebreak * x.min(y)
}

#[derive(Debug, Clone)]
pub struct BinaryMatcher {
    op: BinaryOp,
    pub(crate) a: Matcher,
    pub(crate) b: Matcher,
}

impl BinaryMatcher {
    /// Combine two matchers, moving them to the first document the
    /// combination matches.
    pub fn new(op: BinaryOp, a: Matcher, b: Matcher) -> Result<Self> {
        let op = match op {
            BinaryOp::DisjunctionMax { tiebreak } => BinaryOp::DisjunctionMax {
                tiebreak: tiebreak.clamp(0.0, 1.0),
            },
            op => op,
        };
        let mut matcher = BinaryMatcher { op, a, b };
        matcher.sync()?;
        Ok(matcher)
    }

    pub fn op(&self) -> BinaryOp {
        self.op
    }

    pub fn into_matcher(self) -> Matcher {
        Matcher::Binary(Box::new(self))
    }

    fn sync(&mut self) -> Result<()> {
        match self.op {
            BinaryOp::Union | BinaryOp::DisjunctionMax { .. } => Ok(()),
            BinaryOp::Intersection | BinaryOp::Require => self.find_common(),
            BinaryOp::AndNot => self.exclude(),
            BinaryOp::AndMaybe => self.catch_up(),
        }
    }

    fn find_common(&mut self) -> Result<()> {
        while self.a.is_active() && self.b.is_active() {
            let (a_id, b_id) = (self.a.id(), self.b.id());
            if a_id == b_id {
                break;
            }
            if a_id < b_id {
                self.a.skip_to(b_id)?;
            } else {
                self.b.skip_to(a_id)?;
            }
        }
        Ok(())
    }

    fn exclude(&mut self) -> Result<()> {
        while self.a.is_active() && self.b.is_active() {
            let id = self.a.id();
            self.b.skip_to(id)?;
            if self.b.is_active() && self.b.id() == id {
                self.a.next()?;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn catch_up(&mut self) -> Result<()> {
        if self.a.is_active() && self.b.is_active() {
            self.b.skip_to(self.a.id())?;
        }
        Ok(())
    }

    fn is_either(&self) -> bool {
        matches!(self.op, BinaryOp::Union | BinaryOp::DisjunctionMax { .. })
    }

    /// Whether `side` is positioned on the current document.
    fn on(&self, side: &Matcher) -> bool {
        side.is_active() && side.id() == self.id()
    }

    /// The sides positioned on the current document.
    fn current(&self) -> impl Iterator<Item = &Matcher> {
        [&self.a, &self.b].into_iter().filter(|side| self.on(side))
    }

    pub(crate) fn is_active(&self) -> bool {
        match self.op {
            BinaryOp::Union | BinaryOp::DisjunctionMax { .. } => {
                self.a.is_active() || self.b.is_active()
            }
            BinaryOp::Intersection | BinaryOp::Require => {
                self.a.is_active() && self.b.is_active()
            }
            BinaryOp::AndNot | BinaryOp::AndMaybe => self.a.is_active(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        if !self.is_active() {
            u64::MAX
        } else if self.is_either() {
            self.a.id().min(self.b.id())
        } else {
            self.a.id()
        }
    }

    pub(crate) fn next(&mut self) -> Result<()> {
        if self.is_either() {
            let id = self.id();
            if self.a.is_active() && self.a.id() == id {
                self.a.next()?;
            }
            if self.b.is_active() && self.b.id() == id {
                self.b.next()?;
            }
            return Ok(());
        }
        self.a.next()?;
        self.sync()
    }

    pub(crate) fn skip_to(&mut self, target: u64) -> Result<()> {
        if self.a.is_active() {
            self.a.skip_to(target)?;
        }
        if self.is_either() || matches!(self.op, BinaryOp::Intersection | BinaryOp::Require) {
            if self.b.is_active() {
                self.b.skip_to(target)?;
            }
        }
        self.sync()
    }

    pub(crate) fn weight(&self) -> f32 {
        match self.op {
            BinaryOp::DisjunctionMax { .. } => {
                self.current().map(Matcher::weight).fold(0.0, f32::max)
            }
            BinaryOp::Union | BinaryOp::Intersection | BinaryOp::AndMaybe => {
                self.current().map(Matcher::weight).sum()
            }
            BinaryOp::AndNot | BinaryOp::Require => self.a.weight(),
        }
    }

    pub(crate) fn score(&self) -> Result<f32> {
        match self.op {
            BinaryOp::DisjunctionMax { tiebreak } => {
                let scores = self
                    .current()
                    .map(Matcher::score)
                    .collect::<Result<Vec<_>>>()?;
                Ok(match scores[..] {
                    [x, y] => dismax(x, y, tiebreak),
                    [x] => x,
                    _ => 0.0,
                })
            }
            BinaryOp::Union | BinaryOp::Intersection | BinaryOp::AndMaybe => {
                let mut total = 0.0;
                for side in self.current() {
                    total += side.score()?;
                }
                Ok(total)
            }
            BinaryOp::AndNot | BinaryOp::Require => self.a.score(),
        }
    }

    pub(crate) fn value(&self) -> Result<&[u8]> {
        if self.is_either() && !self.on(&self.a) {
            return self.b.value();
        }
        self.a.value()
    }

    pub(crate) fn frequency(&self) -> Result<u32> {
        match self.op {
            BinaryOp::Union | BinaryOp::Intersection | BinaryOp::DisjunctionMax { .. } => {
                let mut total = 0;
                for side in self.current() {
                    total += side.frequency()?;
                }
                Ok(total)
            }
            _ => self.a.frequency(),
        }
    }

    pub(crate) fn positions(&self) -> Result<Vec<u32>> {
        match self.op {
            BinaryOp::Union | BinaryOp::Intersection | BinaryOp::DisjunctionMax { .. } => {
                let mut positions = Vec::new();
                for side in self.current() {
                    positions.extend(side.positions()?);
                }
                positions.sort_unstable();
                positions.dedup();
                Ok(positions)
            }
            _ => self.a.positions(),
        }
    }

    pub(crate) fn spans(&self) -> Result<Vec<Span>> {
        match self.op {
            BinaryOp::Union | BinaryOp::Intersection | BinaryOp::DisjunctionMax { .. } => {
                let mut spans = Vec::new();
                for side in self.current() {
                    spans.extend(side.spans()?);
                }
                sort_spans(&mut spans);
                Ok(spans)
            }
            _ => self.a.spans(),
        }
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        self.a.reset()?;
        self.b.reset()?;
        self.sync()
    }

    pub(crate) fn supports_block_quality(&self) -> bool {
        match self.op {
            BinaryOp::AndNot | BinaryOp::Require => self.a.supports_block_quality(),
            _ => self.a.supports_block_quality() && self.b.supports_block_quality(),
        }
    }

    fn combine(&self, a: f32, b: impl FnOnce() -> Result<f32>) -> Result<f32> {
        Ok(match self.op {
            BinaryOp::AndNot | BinaryOp::Require => a,
            BinaryOp::DisjunctionMax { tiebreak } => dismax(a, b()?, tiebreak),
            _ => a + b()?,
        })
    }

    pub(crate) fn max_quality(&self) -> Result<f32> {
        self.combine(self.a.max_quality()?, || self.b.max_quality())
    }

    pub(crate) fn block_quality(&self) -> Result<f32> {
        self.combine(self.a.block_quality()?, || self.b.block_quality())
    }

    pub(crate) fn skip_to_quality(&mut self, min_quality: f32) -> Result<usize> {
        let skipped = match self.op {
            BinaryOp::AndNot | BinaryOp::Require => self.a.skip_to_quality(min_quality)?,
            _ => {
                let b_max = self.b.max_quality()?;
                let mut skipped = self.a.skip_to_quality(min_quality - b_max)?;
                let a_max = self.a.max_quality()?;
                skipped += self.b.skip_to_quality(min_quality - a_max)?;
                skipped
            }
        };
        if skipped > 0 {
            self.sync()?;
        }
        Ok(skipped)
    }

    pub(crate) fn replace(self, min_quality: f32) -> Result<Matcher> {
        let minq = if min_quality > 0.0 && self.supports_block_quality() {
            min_quality
        } else {
            0.0
        };
        let BinaryMatcher { op, a, b } = self;
        let (a_active, b_active) = (a.is_active(), b.is_active());

        match op {
            BinaryOp::Union | BinaryOp::DisjunctionMax { .. } => {
                match (a_active, b_active) {
                    (false, false) => return Ok(Matcher::Null),
                    (false, true) => return b.replace(minq),
                    (true, false) => return a.replace(minq),
                    (true, true) => {}
                }
                let (a_max, b_max) = qualities(&a, &b, minq)?;
                if minq > 0.0 {
                    if let BinaryOp::DisjunctionMax { tiebreak } = op {
                        if dismax(a_max, b_max, tiebreak) < minq {
                            return Ok(Matcher::Null);
                        }
                    } else if a_max < minq && b_max < minq {
                        debug!("replacing union with intersection at {minq}");
                        return Self::new(BinaryOp::Intersection, a, b)?.replace(minq);
                    } else if a_max < minq {
                        return Self::new(BinaryOp::AndMaybe, b, a)?.replace(minq);
                    } else if b_max < minq {
                        return Self::new(BinaryOp::AndMaybe, a, b)?.replace(minq);
                    }
                }
                let a = a.replace(minq - b_max)?;
                let b = b.replace(minq - a_max)?;
                Ok(Self::new(op, a, b)?.into_matcher())
            }
            BinaryOp::Intersection => {
                if !a_active || !b_active {
                    return Ok(Matcher::Null);
                }
                let (a_max, b_max) = qualities(&a, &b, minq)?;
                if minq > 0.0 && a_max + b_max < minq {
                    return Ok(Matcher::Null);
                }
                let a = a.replace(minq - b_max)?;
                let b = b.replace(minq - a_max)?;
                if !a.is_active() || !b.is_active() {
                    return Ok(Matcher::Null);
                }
                Ok(Self::new(op, a, b)?.into_matcher())
            }
            BinaryOp::AndNot => {
                if !a_active {
                    return Ok(Matcher::Null);
                }
                if !b_active {
                    return a.replace(minq);
                }
                Ok(Self::new(op, a.replace(minq)?, b.replace(0.0)?)?.into_matcher())
            }
            BinaryOp::Require => {
                if !a_active || !b_active {
                    return Ok(Matcher::Null);
                }
                let (a, b) = (a.replace(minq)?, b.replace(0.0)?);
                if !a.is_active() || !b.is_active() {
                    return Ok(Matcher::Null);
                }
                Ok(Self::new(op, a, b)?.into_matcher())
            }
            BinaryOp::AndMaybe => {
                if !a_active {
                    return Ok(Matcher::Null);
                }
                if !b_active {
                    return a.replace(minq);
                }
                let (a_max, b_max) = qualities(&a, &b, minq)?;
                if minq > 0.0 && a_max < minq {
                    debug!("replacing and-maybe with intersection at {minq}");
                    return Self::new(BinaryOp::Intersection, a, b)?.replace(minq);
                }
                let a = a.replace(minq - b_max)?;
                let b = b.replace(minq - a_max)?;
                Ok(Self::new(op, a, b)?.into_matcher())
            }
        }
    }

    pub(crate) fn matching_terms(&self, out: &mut Vec<(String, Vec<u8>)>) {
        match self.op {
            BinaryOp::AndNot => self.a.matching_terms(out),
            _ => {
                for side in self.current() {
                    side.matching_terms(out);
                }
            }
        }
    }
}

/// Maximum qualities of both sides, or zeros when not pruning.
fn qualities(a: &Matcher, b: &Matcher, min_quality: f32) -> Result<(f32, f32)> {
    if min_quality > 0.0 {
        Ok((a.max_quality()?, b.max_quality()?))
    } else {
        Ok((0.0, 0.0))
    }
}

/// Join weighted matchers into a binary tree, always combining the two
/// lightest first so heavy subtrees end up near the root.
pub fn make_weighted_tree<F>(items: Vec<(u64, Matcher)>, mut join: F) -> Result<Matcher>
where
    F: FnMut(Matcher, Matcher) -> Result<Matcher>,
{
    let mut slots: Vec<Matcher> = Vec::with_capacity(items.len() * 2);
    let mut heap = BinaryHeap::with_capacity(items.len());
    for (weight, matcher) in items {
        heap.push(Reverse((weight, slots.len())));
        slots.push(matcher);
    }

    while heap.len() > 1 {
        let (Some(Reverse((wa, ia))), Some(Reverse((wb, ib)))) = (heap.pop(), heap.pop()) else {
            break;
        };
        let a = std::mem::take(&mut slots[ia]);
        let b = std::mem::take(&mut slots[ib]);
        heap.push(Reverse((wa.saturating_add(wb), slots.len())));
        slots.push(join(a, b)?);
    }

    Ok(heap
        .pop()
        .map(|Reverse((_, index))| std::mem::take(&mut slots[index]))
        .unwrap_or_default())
}

/// Join matchers into a left-nested chain, smallest weight first.
pub fn make_chain<F>(mut items: Vec<(u64, Matcher)>, mut join: F) -> Result<Matcher>
where
    F: FnMut(Matcher, Matcher) -> Result<Matcher>,
{
    items.sort_by_key(|(weight, _)| *weight);
    let mut iter = items.into_iter();
    let Some((_, mut acc)) = iter.next() else {
        return Ok(Matcher::Null);
    };
    for (_, matcher) in iter {
        acc = join(acc, matcher)?;
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::leaf::ListMatcher;

    fn list(ids: &[u64]) -> Matcher {
        ListMatcher::new(ids.to_vec()).into_matcher()
    }

    fn weighted(ids: &[u64], weight: f32) -> Matcher {
        ListMatcher::new(ids.to_vec())
            .with_all_weight(weight)
            .into_matcher()
    }

    fn ids(op: BinaryOp, a: &[u64], b: &[u64]) -> Vec<u64> {
        BinaryMatcher::new(op, list(a), list(b))
            .unwrap()
            .into_matcher()
            .all_ids()
            .unwrap()
    }

    #[test]
    fn test_set_operations() {
        let (a, b) = (&[1, 3, 5, 7][..], &[3, 4, 7, 9][..]);
        assert_eq!(ids(BinaryOp::Union, a, b), vec![1, 3, 4, 5, 7, 9]);
        assert_eq!(ids(BinaryOp::Intersection, a, b), vec![3, 7]);
        assert_eq!(ids(BinaryOp::Require, a, b), vec![3, 7]);
        assert_eq!(ids(BinaryOp::AndNot, a, b), vec![1, 5]);
        assert_eq!(ids(BinaryOp::AndMaybe, a, b), vec![1, 3, 5, 7]);
        let dismax = BinaryOp::DisjunctionMax { tiebreak: 0.5 };
        assert_eq!(ids(dismax, a, b), vec![1, 3, 4, 5, 7, 9]);
    }

    #[test]
    fn test_scores() {
        let score_at = |op, id| {
            let mut m = BinaryMatcher::new(op, weighted(&[1, 2], 2.0), weighted(&[2, 3], 3.0))
                .unwrap()
                .into_matcher();
            m.skip_to(id).unwrap();
            m.score().unwrap()
        };
        assert_eq!(score_at(BinaryOp::Union, 2), 5.0);
        assert_eq!(score_at(BinaryOp::Union, 3), 3.0);
        assert_eq!(score_at(BinaryOp::AndMaybe, 1), 2.0);
        assert_eq!(score_at(BinaryOp::AndMaybe, 2), 5.0);
        assert_eq!(score_at(BinaryOp::Require, 2), 2.0);
        assert_eq!(
            score_at(BinaryOp::DisjunctionMax { tiebreak: 0.5 }, 2),
            4.0
        );
    }

    #[test]
    fn test_quality_bounds() {
        let m = BinaryMatcher::new(BinaryOp::Union, weighted(&[1], 2.0), weighted(&[2], 3.0))
            .unwrap()
            .into_matcher();
        assert!(m.supports_block_quality());
        assert_eq!(m.max_quality().unwrap(), 5.0);

        let dismax = BinaryMatcher::new(
            BinaryOp::DisjunctionMax { tiebreak: 0.1 },
            weighted(&[1], 2.0),
            weighted(&[2], 3.0),
        )
        .unwrap()
        .into_matcher();
        assert!((dismax.max_quality().unwrap() - 3.2).abs() < 1e-6);
    }

    #[test]
    fn test_replace_union_with_weak_side() {
        let m = BinaryMatcher::new(
            BinaryOp::Union,
            weighted(&[1, 4, 6], 5.0),
            weighted(&[2, 4, 8], 1.0),
        )
        .unwrap()
        .into_matcher();

        let mut replaced = m.replace(3.0).unwrap();
        assert!(matches!(
            &replaced,
            Matcher::Binary(b) if b.op() == BinaryOp::AndMaybe
        ));
        assert_eq!(replaced.clone().all_ids().unwrap(), vec![1, 4, 6]);
        replaced.skip_to(4).unwrap();
        assert_eq!(replaced.score().unwrap(), 6.0);

        let gone = BinaryMatcher::new(BinaryOp::Intersection, weighted(&[1], 1.0), weighted(&[1], 1.0))
            .unwrap()
            .into_matcher()
            .replace(3.0)
            .unwrap();
        assert!(!gone.is_active());
    }

    #[test]
    fn test_replace_drops_exhausted_side() {
        let m = BinaryMatcher::new(BinaryOp::Union, list(&[1, 2]), Matcher::Null)
            .unwrap()
            .into_matcher()
            .replace(0.0)
            .unwrap();
        assert!(matches!(m, Matcher::List(_)));

        let m = BinaryMatcher::new(BinaryOp::AndNot, list(&[1, 2]), Matcher::Null)
            .unwrap()
            .into_matcher()
            .replace(0.0)
            .unwrap();
        assert!(matches!(m, Matcher::List(_)));
    }

    #[test]
    fn test_weighted_tree() {
        let items = vec![
            (3, list(&[1, 2, 3])),
            (1, list(&[9])),
            (2, list(&[4, 5])),
        ];
        let mut tree = make_weighted_tree(items, |a, b| {
            Ok(BinaryMatcher::new(BinaryOp::Union, a, b)?.into_matcher())
        })
        .unwrap();
        assert_eq!(tree.all_ids().unwrap(), vec![1, 2, 3, 4, 5, 9]);

        let mut chain = make_chain(vec![(2, list(&[1, 2, 3])), (1, list(&[2, 3]))], |a, b| {
            Ok(BinaryMatcher::new(BinaryOp::Intersection, a, b)?.into_matcher())
        })
        .unwrap();
        assert_eq!(chain.all_ids().unwrap(), vec![2, 3]);

        assert!(!make_chain(Vec::new(), |a, _| Ok(a)).unwrap().is_active());
    }
}
