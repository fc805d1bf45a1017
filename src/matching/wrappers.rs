//! Matchers that wrap other matchers.

use std::sync::Arc;

use bit_vec::BitVec;

use crate::error::{Result, WhorlError};
use crate::matching::Matcher;
use crate::matching::span::Span;

/// Every document below `limit` that the child does not match, skipping
/// deleted documents. Each match has the same score.
#[derive(Debug, Clone)]
pub struct InverseMatcher {
    child: Matcher,
    limit: u64,
    deleted: Option<Arc<BitVec>>,
    weight: f32,
    id: u64,
}

impl InverseMatcher {
    pub fn new(child: Matcher, limit: u64, deleted: Option<Arc<BitVec>>) -> Result<Matcher> {
        let mut matcher = InverseMatcher {
            child,
            limit,
            deleted,
            weight: 1.0,
            id: 0,
        };
        matcher.find_next()?;
        Ok(Matcher::Inverse(Box::new(matcher)))
    }

    fn is_deleted(&self, id: u64) -> bool {
        self.deleted
            .as_ref()
            .and_then(|bits| bits.get(id as usize))
            .unwrap_or(false)
    }

    fn find_next(&mut self) -> Result<()> {
        while self.id < self.limit {
            if self.child.is_active() && self.child.id() < self.id {
                self.child.skip_to(self.id)?;
            }
            let excluded = self.child.is_active() && self.child.id() == self.id;
            if !excluded && !self.is_deleted(self.id) {
                break;
            }
            self.id += 1;
        }
        Ok(())
    }

    pub(crate) fn is_active(&self) -> bool {
        self.id < self.limit
    }

    pub(crate) fn id(&self) -> u64 {
        if self.is_active() { self.id } else { u64::MAX }
    }

    pub(crate) fn next(&mut self) -> Result<()> {
        self.id += 1;
        self.find_next()
    }

    pub(crate) fn skip_to(&mut self, target: u64) -> Result<()> {
        self.id = target;
        self.find_next()
    }

    pub(crate) fn weight(&self) -> f32 {
        self.weight
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        self.child.reset()?;
        self.id = 0;
        self.find_next()
    }
}

/// The child's documents whose bit in `ids` equals `include`.
///
/// Segment readers wrap postings in an excluding filter over their deletion
/// bitmap.
#[derive(Debug, Clone)]
pub struct FilterMatcher {
    child: Matcher,
    ids: Arc<BitVec>,
    include: bool,
}

impl FilterMatcher {
    pub fn new(child: Matcher, ids: Arc<BitVec>, include: bool) -> Result<Matcher> {
        let mut matcher = FilterMatcher {
            child,
            ids,
            include,
        };
        matcher.find_next()?;
        Ok(Matcher::Filter(Box::new(matcher)))
    }

    fn accepts(&self, id: u64) -> bool {
        self.ids.get(id as usize).unwrap_or(false) == self.include
    }

    fn find_next(&mut self) -> Result<()> {
        while self.child.is_active() && !self.accepts(self.child.id()) {
            self.child.next()?;
        }
        Ok(())
    }

    pub(crate) fn child(&self) -> &Matcher {
        &self.child
    }

    pub(crate) fn next(&mut self) -> Result<()> {
        self.child.next()?;
        self.find_next()
    }

    pub(crate) fn skip_to(&mut self, target: u64) -> Result<()> {
        self.child.skip_to(target)?;
        self.find_next()
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        self.child.reset()?;
        self.find_next()
    }

    pub(crate) fn skip_to_quality(&mut self, min_quality: f32) -> Result<usize> {
        let skipped = self.child.skip_to_quality(min_quality)?;
        self.find_next()?;
        Ok(skipped)
    }

    pub(crate) fn replace(self, min_quality: f32) -> Result<Matcher> {
        let child = self.child.replace(min_quality)?;
        if !child.is_active() {
            return Ok(Matcher::Null);
        }
        FilterMatcher::new(child, self.ids, self.include)
    }
}

/// Gives every document of the child a fixed score.
#[derive(Debug, Clone)]
pub struct ConstantMatcher {
    child: Matcher,
    score: f32,
}

impl ConstantMatcher {
    pub fn new(child: Matcher, score: f32) -> Matcher {
        Matcher::Constant(Box::new(ConstantMatcher { child, score }))
    }

    pub(crate) fn child(&self) -> &Matcher {
        &self.child
    }

    pub(crate) fn child_mut(&mut self) -> &mut Matcher {
        &mut self.child
    }

    pub(crate) fn score(&self) -> f32 {
        self.score
    }

    pub(crate) fn skip_to_quality(&mut self, min_quality: f32) -> usize {
        if self.score < min_quality {
            self.child = Matcher::Null;
            1
        } else {
            0
        }
    }

    pub(crate) fn replace(self, min_quality: f32) -> Result<Matcher> {
        if !self.child.is_active() || (min_quality > 0.0 && self.score < min_quality) {
            return Ok(Matcher::Null);
        }
        Ok(ConstantMatcher::new(self.child.replace(0.0)?, self.score))
    }
}

/// Multiplies the child's score by a factor.
#[derive(Debug, Clone)]
pub struct BoostMatcher {
    child: Matcher,
    factor: f32,
}

impl BoostMatcher {
    pub fn new(child: Matcher, factor: f32) -> Matcher {
        Matcher::Boost(Box::new(BoostMatcher { child, factor }))
    }

    pub(crate) fn child(&self) -> &Matcher {
        &self.child
    }

    pub(crate) fn child_mut(&mut self) -> &mut Matcher {
        &mut self.child
    }

    pub(crate) fn factor(&self) -> f32 {
        self.factor
    }

    pub(crate) fn supports_block_quality(&self) -> bool {
        self.factor > 0.0 && self.child.supports_block_quality()
    }

    pub(crate) fn skip_to_quality(&mut self, min_quality: f32) -> Result<usize> {
        self.child.skip_to_quality(min_quality / self.factor)
    }

    pub(crate) fn replace(self, min_quality: f32) -> Result<Matcher> {
        let threshold = if self.supports_block_quality() {
            min_quality / self.factor
        } else {
            0.0
        };
        let child = self.child.replace(threshold)?;
        if !child.is_active() {
            return Ok(Matcher::Null);
        }
        Ok(BoostMatcher::new(child, self.factor))
    }
}

/// Concatenates matchers over consecutive id ranges, adding each one's
/// offset to its ids.
#[derive(Debug, Clone)]
pub struct MultiMatcher {
    matchers: Vec<(Matcher, u64)>,
    current: usize,
}

impl MultiMatcher {
    /// `matchers` must be ordered by offset, with non-overlapping ranges.
    pub fn new(matchers: Vec<(Matcher, u64)>) -> Matcher {
        let mut matcher = MultiMatcher {
            matchers,
            current: 0,
        };
        matcher.settle();
        Matcher::Multi(matcher)
    }

    fn settle(&mut self) {
        while self
            .matchers
            .get(self.current)
            .is_some_and(|(m, _)| !m.is_active())
        {
            self.current += 1;
        }
    }

    fn current(&self) -> Option<&(Matcher, u64)> {
        self.matchers.get(self.current)
    }

    pub(crate) fn current_matcher(&self) -> Option<&Matcher> {
        self.current().map(|(m, _)| m)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.current < self.matchers.len()
    }

    pub(crate) fn id(&self) -> u64 {
        self.current()
            .map_or(u64::MAX, |(m, offset)| m.id().saturating_add(*offset))
    }

    pub(crate) fn next(&mut self) -> Result<()> {
        let (matcher, _) = &mut self.matchers[self.current];
        matcher.next()?;
        self.settle();
        Ok(())
    }

    pub(crate) fn skip_to(&mut self, target: u64) -> Result<()> {
        while let Some((matcher, offset)) = self.matchers.get_mut(self.current) {
            if matcher.is_active() && target > *offset {
                matcher.skip_to(target - *offset)?;
            }
            if matcher.is_active() {
                break;
            }
            self.current += 1;
        }
        Ok(())
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        for (matcher, _) in &mut self.matchers {
            matcher.reset()?;
        }
        self.current = 0;
        self.settle();
        Ok(())
    }

    pub(crate) fn supports_block_quality(&self) -> bool {
        self.matchers[self.current.min(self.matchers.len())..]
            .iter()
            .all(|(m, _)| m.supports_block_quality())
    }

    pub(crate) fn max_quality(&self) -> Result<f32> {
        let mut max = 0.0f32;
        for (matcher, _) in &self.matchers[self.current..] {
            max = max.max(matcher.max_quality()?);
        }
        Ok(max)
    }

    pub(crate) fn skip_to_quality(&mut self, min_quality: f32) -> Result<usize> {
        let mut skipped = 0;
        while let Some((matcher, _)) = self.matchers.get_mut(self.current) {
            skipped += matcher.skip_to_quality(min_quality)?;
            if matcher.is_active() {
                break;
            }
            self.current += 1;
        }
        Ok(skipped)
    }

    pub(crate) fn replace(self, min_quality: f32) -> Result<Matcher> {
        let mut matchers = Vec::with_capacity(self.matchers.len());
        for (matcher, offset) in self.matchers.into_iter().skip(self.current) {
            let matcher = matcher.replace(min_quality)?;
            if matcher.is_active() {
                matchers.push((matcher, offset));
            }
        }
        Ok(match matchers.len() {
            0 => Matcher::Null,
            _ => MultiMatcher::new(matchers),
        })
    }

    pub(crate) fn spans(&self) -> Result<Vec<Span>> {
        self.current_matcher()
            .ok_or(WhorlError::ReadTooFar)?
            .spans()
    }
}
