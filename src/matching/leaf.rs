//! Leaf matchers: a term's postings, or a synthetic list of ids.

use crate::codec::postings::{PostingsCursor, decode_characters, decode_positions};
use crate::codec::terminfo::TermInfo;
use crate::error::{Result, WhorlError};
use crate::matching::Matcher;
use crate::matching::span::Span;
use crate::schema::PostingFormat;
use crate::scoring::WeightScorer;

/// Positions stored in a posting value of the given format.
fn value_positions(format: PostingFormat, value: &[u8]) -> Result<Vec<u32>> {
    match format {
        PostingFormat::Positions => decode_positions(value),
        PostingFormat::Characters => Ok(decode_characters(value)?
            .into_iter()
            .map(|(pos, _, _)| pos)
            .collect()),
        other => Err(WhorlError::query(format!(
            "{other:?} postings carry no positions"
        ))),
    }
}

fn value_spans(format: PostingFormat, value: &[u8]) -> Result<Vec<Span>> {
    match format {
        PostingFormat::Characters => Ok(decode_characters(value)?
            .into_iter()
            .map(|(pos, start, end)| Span::with_chars(pos, pos, start, end))
            .collect()),
        _ => Ok(value_positions(format, value)?
            .into_iter()
            .map(|pos| Span::new(pos, pos))
            .collect()),
    }
}

/// Postings of one term in one segment.
#[derive(Debug, Clone)]
pub struct PostingsMatcher {
    field: String,
    term: Vec<u8>,
    info: TermInfo,
    cursor: PostingsCursor,
    scorer: Option<WeightScorer>,
}

impl PostingsMatcher {
    pub fn new(
        field: impl Into<String>,
        term: impl Into<Vec<u8>>,
        info: TermInfo,
        cursor: PostingsCursor,
        scorer: Option<WeightScorer>,
    ) -> Self {
        PostingsMatcher {
            field: field.into(),
            term: term.into(),
            info,
            cursor,
            scorer,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn term(&self) -> &[u8] {
        &self.term
    }

    pub fn info(&self) -> &TermInfo {
        &self.info
    }

    pub(crate) fn is_active(&self) -> bool {
        self.cursor.is_active()
    }

    pub(crate) fn id(&self) -> u64 {
        self.cursor.id()
    }

    pub(crate) fn next(&mut self) -> Result<()> {
        self.cursor.next()
    }

    pub(crate) fn skip_to(&mut self, target: u64) -> Result<()> {
        self.cursor.skip_to(target)
    }

    pub(crate) fn weight(&self) -> f32 {
        self.cursor.weight()
    }

    pub(crate) fn value(&self) -> Result<&[u8]> {
        self.cursor.value()
    }

    pub(crate) fn frequency(&self) -> Result<u32> {
        self.cursor.frequency()
    }

    pub(crate) fn positions(&self) -> Result<Vec<u32>> {
        value_positions(self.cursor.format(), self.cursor.value()?)
    }

    pub(crate) fn spans(&self) -> Result<Vec<Span>> {
        value_spans(self.cursor.format(), self.cursor.value()?)
    }

    pub(crate) fn score(&self) -> f32 {
        let weight = self.cursor.weight();
        match &self.scorer {
            Some(scorer) => scorer.score(self.cursor.id(), weight),
            None => weight,
        }
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        self.cursor.reset()
    }

    pub(crate) fn supports_block_quality(&self) -> bool {
        self.scorer.as_ref().is_some_and(|s| s.supports_quality())
    }

    pub(crate) fn max_quality(&self) -> Result<f32> {
        self.scorer
            .as_ref()
            .and_then(|s| s.quality(self.info.max_weight(), self.info.min_length()))
            .ok_or(WhorlError::NoQualityAvailable)
    }

    pub(crate) fn block_quality(&self) -> Result<f32> {
        self.scorer
            .as_ref()
            .and_then(|s| s.quality(self.cursor.block_max_weight(), self.cursor.block_min_length()))
            .ok_or(WhorlError::NoQualityAvailable)
    }

    pub(crate) fn skip_to_quality(&mut self, min_quality: f32) -> Result<usize> {
        let Some(scorer) = &self.scorer else {
            return Err(WhorlError::NoQualityAvailable);
        };
        self.cursor.skip_blocks_while(|c| {
            scorer
                .quality(c.block_max_weight(), c.block_min_length())
                .is_some_and(|q| q < min_quality)
        })
    }

    pub(crate) fn replace(self, min_quality: f32) -> Result<Matcher> {
        if !self.is_active() {
            return Ok(Matcher::Null);
        }
        if min_quality > 0.0 && self.max_quality()? < min_quality {
            return Ok(Matcher::Null);
        }
        Ok(Matcher::Postings(self))
    }
}

/// A synthetic posting list held in memory.
///
/// Used for "match everything", for multi-term expansions that are too large
/// to combine as a tree, and in tests. The score of a posting is its weight.
#[derive(Debug, Clone)]
pub struct ListMatcher {
    ids: Vec<u64>,
    weights: Option<Vec<f32>>,
    /// `remaining_max[i]` is the largest weight at or after `i`.
    remaining_max: Vec<f32>,
    all_weight: f32,
    values: Option<Vec<Vec<u8>>>,
    format: PostingFormat,
    term: Option<(String, Vec<u8>)>,
    index: usize,
}

impl ListMatcher {
    /// A list over ascending `ids`, each with weight 1.
    pub fn new(ids: Vec<u64>) -> Self {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        ListMatcher {
            ids,
            weights: None,
            remaining_max: Vec::new(),
            all_weight: 1.0,
            values: None,
            format: PostingFormat::Existence,
            term: None,
            index: 0,
        }
    }

    pub fn with_weights(mut self, weights: Vec<f32>) -> Self {
        debug_assert_eq!(weights.len(), self.ids.len());
        let mut remaining_max = vec![0.0f32; weights.len() + 1];
        for (i, &weight) in weights.iter().enumerate().rev() {
            remaining_max[i] = remaining_max[i + 1].max(weight);
        }
        self.remaining_max = remaining_max;
        self.weights = Some(weights);
        self
    }

    /// Give every posting the same weight.
    pub fn with_all_weight(mut self, weight: f32) -> Self {
        self.weights = None;
        self.remaining_max.clear();
        self.all_weight = weight;
        self
    }

    pub fn with_values(mut self, format: PostingFormat, values: Vec<Vec<u8>>) -> Self {
        debug_assert_eq!(values.len(), self.ids.len());
        self.format = format;
        self.values = Some(values);
        self
    }

    /// Report `(field, term)` as the term this list stands for.
    pub fn with_term(mut self, field: impl Into<String>, term: impl Into<Vec<u8>>) -> Self {
        self.term = Some((field.into(), term.into()));
        self
    }

    pub fn into_matcher(self) -> Matcher {
        Matcher::List(self)
    }

    pub fn term(&self) -> Option<(&str, &[u8])> {
        self.term.as_ref().map(|(f, t)| (f.as_str(), t.as_slice()))
    }

    pub(crate) fn is_active(&self) -> bool {
        self.index < self.ids.len()
    }

    pub(crate) fn id(&self) -> u64 {
        self.ids.get(self.index).copied().unwrap_or(u64::MAX)
    }

    pub(crate) fn next(&mut self) -> Result<()> {
        self.index += 1;
        Ok(())
    }

    pub(crate) fn skip_to(&mut self, target: u64) -> Result<()> {
        self.index += self.ids[self.index..].partition_point(|&id| id < target);
        Ok(())
    }

    pub(crate) fn weight(&self) -> f32 {
        match &self.weights {
            Some(weights) => weights.get(self.index).copied().unwrap_or(0.0),
            None => self.all_weight,
        }
    }

    pub(crate) fn value(&self) -> Result<&[u8]> {
        match &self.values {
            Some(values) => values
                .get(self.index)
                .map(Vec::as_slice)
                .ok_or(WhorlError::ReadTooFar),
            None => Ok(&[]),
        }
    }

    pub(crate) fn frequency(&self) -> Result<u32> {
        match self.format {
            PostingFormat::Positions | PostingFormat::Characters => {
                Ok(self.positions()?.len() as u32)
            }
            _ => Ok(self.weight() as u32),
        }
    }

    pub(crate) fn positions(&self) -> Result<Vec<u32>> {
        value_positions(self.format, self.value()?)
    }

    pub(crate) fn spans(&self) -> Result<Vec<Span>> {
        value_spans(self.format, self.value()?)
    }

    pub(crate) fn reset(&mut self) {
        self.index = 0;
    }

    pub(crate) fn max_quality(&self) -> f32 {
        match self.weights {
            Some(_) => self.remaining_max.get(self.index).copied().unwrap_or(0.0),
            None => self.all_weight,
        }
    }

    pub(crate) fn skip_to_quality(&mut self, min_quality: f32) -> usize {
        if self.max_quality() < min_quality {
            self.index = self.ids.len();
            1
        } else {
            0
        }
    }

    pub(crate) fn replace(self, min_quality: f32) -> Matcher {
        if !self.is_active() || (min_quality > 0.0 && self.max_quality() < min_quality) {
            Matcher::Null
        } else {
            Matcher::List(self)
        }
    }

    /// Take every remaining id at once.
    pub(crate) fn drain_ids(&mut self) -> Vec<u64> {
        let ids = self.ids[self.index..].to_vec();
        self.index = self.ids.len();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::postings::encode_positions;

    #[test]
    fn test_list_skip_and_quality() {
        let mut list = ListMatcher::new(vec![2, 5, 9, 14]).with_weights(vec![1.0, 4.0, 2.0, 1.0]);
        assert_eq!(list.id(), 2);
        list.skip_to(6).unwrap();
        assert_eq!(list.id(), 9);
        assert_eq!(list.weight(), 2.0);
        assert_eq!(list.max_quality(), 2.0);

        assert_eq!(list.skip_to_quality(1.5), 0);
        assert_eq!(list.skip_to_quality(3.0), 1);
        assert!(!list.is_active());
        assert_eq!(list.id(), u64::MAX);
    }

    #[test]
    fn test_list_max_quality_tracks_position() {
        let mut list = ListMatcher::new(vec![1, 2, 3, 4, 5]).with_weights(vec![3.0, 7.0, 1.0, 5.0, 2.0]);
        let mut seen = Vec::new();
        while list.is_active() {
            seen.push(list.max_quality());
            list.next().unwrap();
        }
        assert_eq!(seen, vec![7.0, 7.0, 5.0, 5.0, 2.0]);
        assert_eq!(list.max_quality(), 0.0);

        let flat = ListMatcher::new(vec![1, 2])
            .with_weights(vec![9.0, 9.0])
            .with_all_weight(0.5);
        assert_eq!(flat.max_quality(), 0.5);
    }

    #[test]
    fn test_list_positions() {
        let list = ListMatcher::new(vec![0, 3]).with_values(
            PostingFormat::Positions,
            vec![encode_positions(&[1, 4]), encode_positions(&[0])],
        );
        assert_eq!(list.positions().unwrap(), vec![1, 4]);
        assert_eq!(list.frequency().unwrap(), 2);
        let spans = list.spans().unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[1].start, spans[1].end), (4, 4));
    }

    #[test]
    fn test_list_without_positions() {
        let list = ListMatcher::new(vec![1]);
        assert!(list.positions().is_err());
        assert!(list.value().unwrap().is_empty());
    }
}
