//! A compact integer array that widens its element type on demand.
//!
//! Positions of ordered hash-table keys are stored this way: a small table
//! whose records all sit below 64 KiB costs two bytes per key instead of eight.

use serde::{Deserialize, Serialize};

/// An array of unsigned integers stored in the narrowest type that fits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrowableArray {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
}

impl Default for GrowableArray {
    fn default() -> Self {
        GrowableArray::U8(Vec::new())
    }
}

impl GrowableArray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an array from values, picking the element type once.
    pub fn from_values(values: &[u64]) -> Self {
        let max = values.iter().copied().max().unwrap_or(0);
        let mut array = GrowableArray::with_width_for(max, values.len());
        for &value in values {
            array.push(value);
        }
        array
    }

    fn with_width_for(max: u64, capacity: usize) -> Self {
        if max <= u8::MAX as u64 {
            GrowableArray::U8(Vec::with_capacity(capacity))
        } else if max <= u16::MAX as u64 {
            GrowableArray::U16(Vec::with_capacity(capacity))
        } else if max <= u32::MAX as u64 {
            GrowableArray::U32(Vec::with_capacity(capacity))
        } else {
            GrowableArray::U64(Vec::with_capacity(capacity))
        }
    }

    /// Width of one element in bytes.
    pub fn item_size(&self) -> usize {
        match self {
            GrowableArray::U8(_) => 1,
            GrowableArray::U16(_) => 2,
            GrowableArray::U32(_) => 4,
            GrowableArray::U64(_) => 8,
        }
    }

    fn fits(&self, value: u64) -> bool {
        match self {
            GrowableArray::U8(_) => value <= u8::MAX as u64,
            GrowableArray::U16(_) => value <= u16::MAX as u64,
            GrowableArray::U32(_) => value <= u32::MAX as u64,
            GrowableArray::U64(_) => true,
        }
    }

    fn widen_for(&mut self, value: u64) {
        let values: Vec<u64> = self.iter().collect();
        let mut wider = GrowableArray::with_width_for(value, values.len() + 1);
        for v in values {
            wider.push_unchecked(v);
        }
        *self = wider;
    }

    fn push_unchecked(&mut self, value: u64) {
        match self {
            GrowableArray::U8(v) => v.push(value as u8),
            GrowableArray::U16(v) => v.push(value as u16),
            GrowableArray::U32(v) => v.push(value as u32),
            GrowableArray::U64(v) => v.push(value),
        }
    }

    /// Append a value, widening the element type first if needed.
    pub fn push(&mut self, value: u64) {
        if !self.fits(value) {
            self.widen_for(value);
        }
        self.push_unchecked(value);
    }

    pub fn get(&self, index: usize) -> Option<u64> {
        match self {
            GrowableArray::U8(v) => v.get(index).map(|&x| x as u64),
            GrowableArray::U16(v) => v.get(index).map(|&x| x as u64),
            GrowableArray::U32(v) => v.get(index).map(|&x| x as u64),
            GrowableArray::U64(v) => v.get(index).copied(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            GrowableArray::U8(v) => v.len(),
            GrowableArray::U16(v) => v.len(),
            GrowableArray::U32(v) => v.len(),
            GrowableArray::U64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }
}
