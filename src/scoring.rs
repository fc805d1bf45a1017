//! Scoring models.
//!
//! A [`Weighting`] turns a posting's weight (usually the term frequency) and
//! the document's field length into a score, given collection statistics for
//! the term. Queries build one [`TermWeight`] per term from the statistics of
//! the whole index, then bind it to each segment's field lengths as a
//! [`WeightScorer`].
//!
//! Weightings that can bound their score from a block's maximum weight and
//! minimum length enable block-quality pruning. Every built-in model is
//! non-decreasing in weight and non-increasing in length, so evaluating the
//! score at `(max_weight, min_length)` is such a bound.

use std::fmt;
use std::sync::Arc;

use crate::codec::perdoc::LengthsReader;

/// Statistics of one term across the searched index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TermStats {
    pub doc_count: u64,
    pub doc_frequency: u64,
    pub collection_frequency: f32,
    pub avg_field_length: f32,
    pub field_boost: f32,
}

impl TermStats {
    pub fn idf(&self) -> f32 {
        idf(self.doc_count, self.doc_frequency)
    }
}

/// Inverse document frequency: `ln(N / (df + 1)) + 1`.
pub fn idf(doc_count: u64, doc_frequency: u64) -> f32 {
    ((doc_count as f32) / (doc_frequency as f32 + 1.0)).ln() + 1.0
}

/// A pluggable scoring model.
pub trait Weighting: Send + Sync + fmt::Debug {
    fn score(&self, stats: &TermStats, weight: f32, length: u32) -> f32;

    /// An upper bound of [`Weighting::score`] over postings whose weight is at
    /// most `max_weight` and whose length is at least `min_length`.
    fn quality(&self, _stats: &TermStats, _max_weight: f32, _min_length: u32) -> Option<f32> {
        None
    }
}

/// Okapi BM25 with per-field boosts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25F {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25F {
    fn default() -> Self {
        Bm25F { k1: 1.2, b: 0.75 }
    }
}

impl Bm25F {
    pub fn new(k1: f32, b: f32) -> Self {
        Bm25F { k1, b }
    }
}

pub fn bm25(idf: f32, tf: f32, length: f32, avg_length: f32, b: f32, k1: f32) -> f32 {
    let avg_length = if avg_length > 0.0 { avg_length } else { 1.0 };
    idf * (tf * (k1 + 1.0)) / (tf + k1 * ((1.0 - b) + b * length / avg_length))
}

impl Weighting for Bm25F {
    fn score(&self, stats: &TermStats, weight: f32, length: u32) -> f32 {
        let score = bm25(
            stats.idf(),
            weight,
            length as f32,
            stats.avg_field_length,
            self.b,
            self.k1,
        );
        score * stats.field_boost
    }

    fn quality(&self, stats: &TermStats, max_weight: f32, min_length: u32) -> Option<f32> {
        if self.b < 0.0 || self.k1 < 0.0 {
            return None;
        }
        Some(self.score(stats, max_weight, min_length))
    }
}

/// Term frequency times inverse document frequency.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TfIdf;

impl Weighting for TfIdf {
    fn score(&self, stats: &TermStats, weight: f32, _length: u32) -> f32 {
        weight * stats.idf() * stats.field_boost
    }

    fn quality(&self, stats: &TermStats, max_weight: f32, min_length: u32) -> Option<f32> {
        Some(self.score(stats, max_weight, min_length))
    }
}

/// The raw posting weight.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Frequency;

impl Weighting for Frequency {
    fn score(&self, stats: &TermStats, weight: f32, _length: u32) -> f32 {
        weight * stats.field_boost
    }

    fn quality(&self, stats: &TermStats, max_weight: f32, _min_length: u32) -> Option<f32> {
        Some(max_weight * stats.field_boost)
    }
}

type ScoreFn = dyn Fn(&TermStats, f32, u32) -> f32 + Send + Sync;

/// A weighting backed by a closure. It has no quality bound, so searches
/// using it never prune.
#[derive(Clone)]
pub struct FunctionWeighting {
    function: Arc<ScoreFn>,
}

impl FunctionWeighting {
    pub fn new<F>(function: F) -> Self
    where
        F: Fn(&TermStats, f32, u32) -> f32 + Send + Sync + 'static,
    {
        FunctionWeighting {
            function: Arc::new(function),
        }
    }
}

impl fmt::Debug for FunctionWeighting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FunctionWeighting")
    }
}

impl Weighting for FunctionWeighting {
    fn score(&self, stats: &TermStats, weight: f32, length: u32) -> f32 {
        (self.function)(stats, weight, length)
    }
}

/// The scoring parameters of one query term, independent of any segment.
#[derive(Debug, Clone)]
pub struct TermWeight {
    pub field: String,
    pub weighting: Arc<dyn Weighting>,
    pub stats: TermStats,
    pub boost: f32,
}

impl TermWeight {
    pub fn new(
        field: impl Into<String>,
        weighting: Arc<dyn Weighting>,
        stats: TermStats,
        boost: f32,
    ) -> Self {
        TermWeight {
            field: field.into(),
            weighting,
            stats,
            boost,
        }
    }

    /// Bind to one segment's field lengths.
    pub fn bind(&self, lengths: Arc<LengthsReader>) -> WeightScorer {
        WeightScorer {
            weight: self.clone(),
            lengths,
        }
    }
}

/// A [`TermWeight`] bound to a segment.
#[derive(Debug, Clone)]
pub struct WeightScorer {
    weight: TermWeight,
    lengths: Arc<LengthsReader>,
}

impl WeightScorer {
    pub fn score(&self, docnum: u64, weight: f32) -> f32 {
        let length = self.lengths.doc_field_length(docnum, &self.weight.field);
        self.weight
            .weighting
            .score(&self.weight.stats, weight, length)
            * self.weight.boost
    }

    pub fn supports_quality(&self) -> bool {
        self.weight.boost >= 0.0 && self.quality(1.0, 1).is_some()
    }

    pub fn quality(&self, max_weight: f32, min_length: u32) -> Option<f32> {
        self.weight
            .weighting
            .quality(&self.weight.stats, max_weight, min_length)
            .map(|q| q * self.weight.boost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> TermStats {
        TermStats {
            doc_count: 100,
            doc_frequency: 9,
            collection_frequency: 20.0,
            avg_field_length: 10.0,
            field_boost: 1.0,
        }
    }

    #[test]
    fn test_idf() {
        assert!((idf(100, 9) - (10.0f32.ln() + 1.0)).abs() < 1e-6);
        assert!(idf(1, 1) > 0.0);
    }

    #[test]
    fn test_bm25_monotonic() {
        let model = Bm25F::default();
        let s = stats();
        assert!(model.score(&s, 3.0, 10) > model.score(&s, 2.0, 10));
        assert!(model.score(&s, 2.0, 5) > model.score(&s, 2.0, 20));

        let bound = model.quality(&s, 3.0, 5).unwrap();
        for weight in [1.0, 2.0, 3.0] {
            for length in [5, 8, 40] {
                assert!(model.score(&s, weight, length) <= bound);
            }
        }
    }

    #[test]
    fn test_function_weighting_has_no_quality() {
        let model = FunctionWeighting::new(|_, weight, _| weight * 2.0);
        assert_eq!(model.score(&stats(), 1.5, 3), 3.0);
        assert!(model.quality(&stats(), 1.5, 3).is_none());
    }

    #[test]
    fn test_scorer_applies_boost() {
        let lengths = Arc::new(LengthsReader::default());
        let weight = TermWeight::new("body", Arc::new(Frequency), stats(), 2.5);
        let scorer = weight.bind(lengths);
        assert_eq!(scorer.score(0, 2.0), 5.0);
        assert_eq!(scorer.quality(4.0, 1), Some(10.0));
        assert!(scorer.supports_quality());

        let negative = TermWeight::new("body", Arc::new(Frequency), stats(), -1.0);
        assert!(!negative.bind(Arc::new(LengthsReader::default())).supports_quality());
    }
}
