//! Per-term statistics.

use serde::{Deserialize, Serialize};

/// Aggregate statistics of one term in one field.
///
/// `min_length`/`max_length` are the shortest and longest field lengths among
/// documents containing the term; `max_weight` is the largest per-document
/// weight. Together they bound the score any posting of the term can reach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermInfo {
    weight: f32,
    doc_frequency: u64,
    min_length: u32,
    max_length: u32,
    max_weight: f32,
    min_id: Option<u64>,
    max_id: Option<u64>,
}

impl Default for TermInfo {
    fn default() -> Self {
        TermInfo {
            weight: 0.0,
            doc_frequency: 0,
            min_length: u32::MAX,
            max_length: 0,
            max_weight: 0.0,
            min_id: None,
            max_id: None,
        }
    }
}

impl TermInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one more posting. Ids must arrive in increasing order.
    pub fn add_posting(&mut self, id: u64, weight: f32, length: u32) {
        if self.min_id.is_none() {
            self.min_id = Some(id);
        }
        self.max_id = Some(id);
        self.weight += weight;
        self.doc_frequency += 1;
        self.min_length = self.min_length.min(length);
        self.max_length = self.max_length.max(length);
        self.max_weight = self.max_weight.max(weight);
    }

    /// Combine per-segment infos. Each entry carries the doc offset of its
    /// segment, which is added to the segment-local min/max ids.
    pub fn combine<'a, I>(infos: I) -> TermInfo
    where
        I: IntoIterator<Item = (&'a TermInfo, u64)>,
    {
        let mut combined = TermInfo::new();
        for (info, offset) in infos {
            if info.doc_frequency == 0 {
                continue;
            }
            combined.weight += info.weight;
            combined.doc_frequency += info.doc_frequency;
            combined.min_length = combined.min_length.min(info.min_length);
            combined.max_length = combined.max_length.max(info.max_length);
            combined.max_weight = combined.max_weight.max(info.max_weight);
            if let Some(min_id) = info.min_id {
                let global = min_id + offset;
                combined.min_id = Some(combined.min_id.map_or(global, |m| m.min(global)));
            }
            if let Some(max_id) = info.max_id {
                let global = max_id + offset;
                combined.max_id = Some(combined.max_id.map_or(global, |m| m.max(global)));
            }
        }
        combined
    }

    /// Total weight (usually the collection frequency).
    pub fn weight(&self) -> f32 {
        self.weight
    }

    pub fn doc_frequency(&self) -> u64 {
        self.doc_frequency
    }

    pub fn min_length(&self) -> u32 {
        if self.doc_frequency == 0 {
            0
        } else {
            self.min_length
        }
    }

    pub fn max_length(&self) -> u32 {
        self.max_length
    }

    pub fn max_weight(&self) -> f32 {
        self.max_weight
    }

    pub fn min_id(&self) -> Option<u64> {
        self.min_id
    }

    pub fn max_id(&self) -> Option<u64> {
        self.max_id
    }
}

/// A [`TermInfo`] plus the location of the term's postings in the `.pst` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTermInfo {
    pub info: TermInfo,
    pub offset: u64,
    pub length: u64,
    pub block_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_posting() {
        let mut info = TermInfo::new();
        assert_eq!(info.min_length(), 0);

        info.add_posting(3, 2.0, 10);
        info.add_posting(7, 5.0, 4);
        info.add_posting(9, 1.0, 12);

        assert_eq!(info.weight(), 8.0);
        assert_eq!(info.doc_frequency(), 3);
        assert_eq!(info.min_length(), 4);
        assert_eq!(info.max_length(), 12);
        assert_eq!(info.max_weight(), 5.0);
        assert_eq!(info.min_id(), Some(3));
        assert_eq!(info.max_id(), Some(9));
    }

    #[test]
    fn test_combine_applies_offsets() {
        let mut a = TermInfo::new();
        a.add_posting(1, 1.0, 5);
        a.add_posting(4, 3.0, 8);

        let mut b = TermInfo::new();
        b.add_posting(0, 2.0, 2);

        let empty = TermInfo::new();
        let combined = TermInfo::combine([(&a, 0), (&empty, 5), (&b, 10)]);

        assert_eq!(combined.doc_frequency(), 3);
        assert_eq!(combined.weight(), 6.0);
        assert_eq!(combined.min_length(), 2);
        assert_eq!(combined.max_length(), 8);
        assert_eq!(combined.max_weight(), 3.0);
        assert_eq!(combined.min_id(), Some(1));
        assert_eq!(combined.max_id(), Some(10));
    }
}
