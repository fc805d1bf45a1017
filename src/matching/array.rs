//! A union that reads its children a window at a time into score arrays.
//!
//! Faster than a deep union tree for many small clauses, but it cannot
//! report per-document values, spans or matching terms, and it has no
//! quality bounds.

use crate::error::Result;
use crate::matching::Matcher;

#[derive(Debug, Clone)]
pub struct ArrayUnionMatcher {
    children: Vec<Matcher>,
    part_size: usize,
    offset: u64,
    scores: Vec<f32>,
    weights: Vec<f32>,
    matched: Vec<bool>,
    pos: usize,
}

impl ArrayUnionMatcher {
    pub fn new(children: Vec<Matcher>, part_size: usize) -> Result<Matcher> {
        let part_size = part_size.max(1);
        let mut matcher = ArrayUnionMatcher {
            children,
            part_size,
            offset: 0,
            scores: vec![0.0; part_size],
            weights: vec![0.0; part_size],
            matched: vec![false; part_size],
            pos: part_size,
        };
        matcher.load(0)?;
        Ok(Matcher::ArrayUnion(matcher))
    }

    /// Fill the window starting at the first child document `>= start`.
    fn load(&mut self, start: u64) -> Result<()> {
        loop {
            let Some(first) = self
                .children
                .iter()
                .filter(|c| c.is_active())
                .map(Matcher::id)
                .min()
            else {
                self.pos = self.part_size;
                return Ok(());
            };
            self.offset = first.max(start);
            let end = self.offset.saturating_add(self.part_size as u64);

            self.scores.fill(0.0);
            self.weights.fill(0.0);
            self.matched.fill(false);
            for child in &mut self.children {
                if !child.is_active() {
                    continue;
                }
                child.skip_to(self.offset)?;
                while child.is_active() && child.id() < end {
                    let i = (child.id() - self.offset) as usize;
                    self.scores[i] += child.score()?;
                    self.weights[i] += child.weight();
                    self.matched[i] = true;
                    child.next()?;
                }
            }

            if let Some(pos) = self.matched.iter().position(|&m| m) {
                self.pos = pos;
                return Ok(());
            }
        }
    }

    fn advance_from(&mut self, pos: usize) -> Result<()> {
        match self.matched[pos.min(self.part_size)..]
            .iter()
            .position(|&m| m)
        {
            Some(found) => {
                self.pos = pos + found;
                Ok(())
            }
            None => self.load(self.offset + self.part_size as u64),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.pos < self.part_size
    }

    pub(crate) fn id(&self) -> u64 {
        if self.is_active() {
            self.offset + self.pos as u64
        } else {
            u64::MAX
        }
    }

    pub(crate) fn next(&mut self) -> Result<()> {
        self.advance_from(self.pos + 1)
    }

    pub(crate) fn skip_to(&mut self, target: u64) -> Result<()> {
        let end = self.offset + self.part_size as u64;
        if target < end {
            self.advance_from((target - self.offset) as usize)
        } else {
            self.load(target)
        }
    }

    pub(crate) fn weight(&self) -> f32 {
        self.weights.get(self.pos).copied().unwrap_or(0.0)
    }

    pub(crate) fn score(&self) -> f32 {
        self.scores.get(self.pos).copied().unwrap_or(0.0)
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.reset()?;
        }
        self.load(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::leaf::ListMatcher;

    fn weighted(ids: &[u64], weight: f32) -> Matcher {
        ListMatcher::new(ids.to_vec())
            .with_all_weight(weight)
            .into_matcher()
    }

    #[test]
    fn test_windows() {
        let children = vec![
            weighted(&[0, 5, 40], 1.0),
            weighted(&[5, 6, 100], 2.0),
            weighted(&[3, 100], 0.5),
        ];
        let mut m = ArrayUnionMatcher::new(children, 4).unwrap();
        assert_eq!(m.id(), 0);
        m.next().unwrap();
        assert_eq!(m.id(), 3);
        m.next().unwrap();
        assert_eq!(m.id(), 5);
        assert_eq!(m.score().unwrap(), 3.0);
        m.skip_to(41).unwrap();
        assert_eq!(m.id(), 100);
        assert_eq!(m.score().unwrap(), 2.5);
        m.next().unwrap();
        assert!(!m.is_active());

        m.reset().unwrap();
        assert_eq!(m.all_ids().unwrap(), vec![0, 3, 5, 6, 40, 100]);
        assert!(!m.supports_block_quality());
    }
}
