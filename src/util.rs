//! Shared utility modules used across whorl components.

pub mod array;
pub mod varint;
