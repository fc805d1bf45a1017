//! Block-encoded posting lists.
//!
//! A term's postings are written as a run of blocks of at most `block_limit`
//! postings each. Every block starts with a small header:
//!
//! ```text
//! count: varint, last_id: varint, max_weight: f32, min_length: varint, body_len: varint
//! ```
//!
//! followed by the body:
//!
//! ```text
//! id deltas: varint * count        (relative to the previous block's last id)
//! weights:   flag u8, then f32 * count when the flag is 1
//! values:    (len varint, bytes) * count, only for formats that carry values
//! ```
//!
//! The header alone is enough to decide whether a block can be skipped, so
//! [`PostingsCursor`] only decodes bodies of the blocks it lands on.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::terminfo::{FileTermInfo, TermInfo};
use crate::error::{Result, WhorlError};
use crate::schema::{PostingFormat, Token};
use crate::storage::{FileBytes, StorageOutput};
use crate::util::varint;

const WEIGHTS_ALL_ONE: u8 = 0;
const WEIGHTS_LISTED: u8 = 1;

/// One pending posting.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPosting {
    pub id: u64,
    pub weight: f32,
    pub value: Vec<u8>,
    pub length: u32,
}

/// Writes the postings of consecutive terms into one `.pst` output.
#[derive(Debug)]
pub struct PostingsWriter {
    output: Box<dyn StorageOutput>,
    position: u64,
    format: PostingFormat,
    block_limit: usize,
    block: Vec<RawPosting>,
    term: Option<TermState>,
}

#[derive(Debug)]
struct TermState {
    info: TermInfo,
    offset: u64,
    block_count: u32,
    last_block_id: u64,
    last_id: Option<u64>,
}

impl PostingsWriter {
    pub fn new(output: Box<dyn StorageOutput>, format: PostingFormat, block_limit: usize) -> Self {
        PostingsWriter {
            output,
            position: 0,
            format,
            block_limit: block_limit.max(1),
            block: Vec::new(),
            term: None,
        }
    }

    /// Posting format used for the following terms.
    pub fn set_format(&mut self, format: PostingFormat) {
        self.format = format;
    }

    pub fn start_term(&mut self) -> Result<()> {
        if self.term.is_some() {
            return Err(WhorlError::index("start_term called inside a term"));
        }
        self.term = Some(TermState {
            info: TermInfo::new(),
            offset: self.position,
            block_count: 0,
            last_block_id: 0,
            last_id: None,
        });
        Ok(())
    }

    /// Add a posting to the current term. Ids must be strictly increasing.
    pub fn add(&mut self, id: u64, weight: f32, value: &[u8], length: u32) -> Result<()> {
        let term = self
            .term
            .as_mut()
            .ok_or_else(|| WhorlError::index("posting added outside a term"))?;
        if let Some(last) = term.last_id
            && id <= last
        {
            return Err(WhorlError::index(format!(
                "posting ids out of order: {id} after {last}"
            )));
        }
        term.last_id = Some(id);
        term.info.add_posting(id, weight, length);

        self.block.push(RawPosting {
            id,
            weight,
            value: value.to_vec(),
            length,
        });
        if self.block.len() >= self.block_limit {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let Some(term) = self.term.as_mut() else {
            return Err(WhorlError::index("block flushed outside a term"));
        };

        let mut body = Vec::new();
        let mut prev = term.last_block_id;
        for posting in &self.block {
            varint::encode_into(&mut body, posting.id - prev);
            prev = posting.id;
        }

        if self.block.iter().all(|p| p.weight == 1.0) {
            body.push(WEIGHTS_ALL_ONE);
        } else {
            body.push(WEIGHTS_LISTED);
            for posting in &self.block {
                let mut buf = [0u8; 4];
                LittleEndian::write_f32(&mut buf, posting.weight);
                body.extend_from_slice(&buf);
            }
        }

        if self.format.has_values() {
            for posting in &self.block {
                varint::encode_into(&mut body, posting.value.len() as u64);
                body.extend_from_slice(&posting.value);
            }
        }

        let max_weight = self.block.iter().map(|p| p.weight).fold(0.0f32, f32::max);
        let min_length = self.block.iter().map(|p| p.length).min().unwrap_or(0);

        let mut header = Vec::with_capacity(24);
        varint::encode_into(&mut header, self.block.len() as u64);
        varint::encode_into(&mut header, prev);
        let mut buf = [0u8; 4];
        LittleEndian::write_f32(&mut buf, max_weight);
        header.extend_from_slice(&buf);
        varint::encode_into(&mut header, min_length as u64);
        varint::encode_into(&mut header, body.len() as u64);

        self.output.write_all(&header)?;
        self.output.write_all(&body)?;
        self.position += (header.len() + body.len()) as u64;

        term.last_block_id = prev;
        term.block_count += 1;
        self.block.clear();
        Ok(())
    }

    /// Finish the current term and return where its postings live.
    pub fn finish_term(&mut self) -> Result<FileTermInfo> {
        self.flush_block()?;
        let term = self
            .term
            .take()
            .ok_or_else(|| WhorlError::index("finish_term called outside a term"))?;
        Ok(FileTermInfo {
            info: term.info,
            offset: term.offset,
            length: self.position - term.offset,
            block_count: term.block_count,
        })
    }

    pub fn close(mut self) -> Result<()> {
        if self.term.is_some() {
            return Err(WhorlError::index("postings writer closed inside a term"));
        }
        self.output.flush_and_sync()?;
        self.output.close()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockHeader {
    count: usize,
    last_id: u64,
    max_weight: f32,
    min_length: u32,
    body_start: usize,
    body_end: usize,
}

/// A forward cursor over one term's blocks.
#[derive(Debug, Clone)]
pub struct PostingsCursor {
    bytes: FileBytes,
    format: PostingFormat,
    block_count: u32,
    block_index: u32,
    header: BlockHeader,
    base_id: u64,
    ids: Vec<u64>,
    weights: Option<Vec<f32>>,
    values: Vec<(usize, usize)>,
    decoded: bool,
    index: usize,
    active: bool,
}

impl PostingsCursor {
    /// Open a cursor over a term's postings region.
    pub fn new(bytes: FileBytes, format: PostingFormat, block_count: u32) -> Result<Self> {
        let mut cursor = PostingsCursor {
            bytes,
            format,
            block_count,
            block_index: 0,
            header: BlockHeader::default(),
            base_id: 0,
            ids: Vec::new(),
            weights: None,
            values: Vec::new(),
            decoded: false,
            index: 0,
            active: false,
        };
        cursor.reset()?;
        Ok(cursor)
    }

    /// Go back to the first posting.
    pub fn reset(&mut self) -> Result<()> {
        self.block_index = 0;
        self.base_id = 0;
        if self.block_count == 0 {
            self.active = false;
            return Ok(());
        }
        self.active = true;
        self.header = self.read_header(0)?;
        self.decode_body()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn format(&self) -> PostingFormat {
        self.format
    }

    /// Current id, or `u64::MAX` when exhausted.
    pub fn id(&self) -> u64 {
        if self.active {
            self.ids[self.index]
        } else {
            u64::MAX
        }
    }

    pub fn weight(&self) -> f32 {
        if !self.active {
            return 0.0;
        }
        match &self.weights {
            Some(weights) => weights[self.index],
            None => 1.0,
        }
    }

    /// Raw value bytes of the current posting; empty for value-less formats.
    pub fn value(&self) -> Result<&[u8]> {
        if !self.active {
            return Err(WhorlError::ReadTooFar);
        }
        if !self.format.has_values() {
            return Ok(&[]);
        }
        let (start, end) = self.values[self.index];
        self.bytes.get(start..end)
    }

    /// Term frequency in the current document.
    pub fn frequency(&self) -> Result<u32> {
        match self.format {
            PostingFormat::Existence => Ok(1),
            PostingFormat::Frequency => Ok(self.weight() as u32),
            PostingFormat::Positions => Ok(decode_positions(self.value()?)?.len() as u32),
            PostingFormat::Characters => Ok(decode_characters(self.value()?)?.len() as u32),
        }
    }

    pub fn block_max_weight(&self) -> f32 {
        self.header.max_weight
    }

    pub fn block_min_length(&self) -> u32 {
        self.header.min_length
    }

    pub fn block_last_id(&self) -> u64 {
        self.header.last_id
    }

    pub fn next(&mut self) -> Result<()> {
        if !self.active {
            return Err(WhorlError::ReadTooFar);
        }
        self.settle()?;
        self.index += 1;
        if self.index >= self.header.count {
            self.next_block()?;
        }
        Ok(())
    }

    /// Advance to the first posting with id `>= target`.
    pub fn skip_to(&mut self, target: u64) -> Result<()> {
        if !self.active {
            return Err(WhorlError::ReadTooFar);
        }
        if self.decoded && target <= self.id() {
            return Ok(());
        }
        while self.active && self.header.last_id < target {
            self.skip_block_header()?;
        }
        if !self.active {
            return Ok(());
        }
        if !self.decoded {
            self.decode_body()?;
        }
        while self.ids[self.index] < target {
            self.index += 1;
        }
        Ok(())
    }

    /// Move to the next block, decoding its body.
    pub fn next_block(&mut self) -> Result<()> {
        self.skip_block_header()?;
        if self.active {
            self.decode_body()?;
        }
        Ok(())
    }

    /// Skip whole blocks while `skip` says the current block is useless,
    /// reading only their headers. Returns the number of blocks skipped.
    pub fn skip_blocks_while<F>(&mut self, mut skip: F) -> Result<usize>
    where
        F: FnMut(&PostingsCursor) -> bool,
    {
        let mut skipped = 0;
        while self.active && skip(self) {
            self.skip_block_header()?;
            skipped += 1;
        }
        self.settle()?;
        Ok(skipped)
    }

    fn skip_block_header(&mut self) -> Result<()> {
        self.block_index += 1;
        self.base_id = self.header.last_id;
        if self.block_index >= self.block_count {
            self.active = false;
            self.decoded = false;
            return Ok(());
        }
        self.header = self.read_header(self.header.body_end)?;
        self.decoded = false;
        Ok(())
    }

    fn settle(&mut self) -> Result<()> {
        if self.active && !self.decoded {
            self.decode_body()?;
        }
        Ok(())
    }

    fn read_header(&self, pos: usize) -> Result<BlockHeader> {
        let data = self.bytes.as_slice();
        let mut cursor = pos;
        let count = varint::decode_at(data, &mut cursor)? as usize;
        let last_id = varint::decode_at(data, &mut cursor)?;
        let max_weight = self.bytes.read_f32(cursor)?;
        cursor += 4;
        let min_length = varint::decode_at(data, &mut cursor)? as u32;
        let body_len = varint::decode_at(data, &mut cursor)? as usize;
        if count == 0 || cursor + body_len > data.len() {
            return Err(WhorlError::format(format!(
                "corrupt posting block header at {pos}"
            )));
        }
        Ok(BlockHeader {
            count,
            last_id,
            max_weight,
            min_length,
            body_start: cursor,
            body_end: cursor + body_len,
        })
    }

    fn decode_body(&mut self) -> Result<()> {
        let body = self.bytes.get(self.header.body_start..self.header.body_end)?;
        let count = self.header.count;
        let mut pos = 0;

        self.ids.clear();
        let mut id = self.base_id;
        for _ in 0..count {
            id += varint::decode_at(body, &mut pos)?;
            self.ids.push(id);
        }

        let flag = *body
            .get(pos)
            .ok_or_else(|| WhorlError::format("posting block has no weight flag"))?;
        pos += 1;
        self.weights = match flag {
            WEIGHTS_ALL_ONE => None,
            WEIGHTS_LISTED => {
                let raw = body
                    .get(pos..pos + 4 * count)
                    .ok_or_else(|| WhorlError::format("posting block weights truncated"))?;
                pos += 4 * count;
                Some(raw.chunks_exact(4).map(LittleEndian::read_f32).collect())
            }
            other => {
                return Err(WhorlError::format(format!("bad weight flag {other}")));
            }
        };

        self.values.clear();
        if self.format.has_values() {
            for _ in 0..count {
                let len = varint::decode_at(body, &mut pos)? as usize;
                let start = self.header.body_start + pos;
                pos += len;
                if pos > body.len() {
                    return Err(WhorlError::format("posting value runs past its block"));
                }
                self.values.push((start, start + len));
            }
        }

        self.index = 0;
        self.decoded = true;
        Ok(())
    }

    /// Read every remaining posting, leaving the cursor exhausted.
    pub fn drain(&mut self) -> Result<Vec<RawPosting>> {
        let mut postings = Vec::new();
        self.settle()?;
        while self.active {
            postings.push(RawPosting {
                id: self.id(),
                weight: self.weight(),
                value: self.value()?.to_vec(),
                length: 0,
            });
            self.next()?;
        }
        Ok(postings)
    }
}

/// Encode a position list as delta varints.
pub fn encode_positions(positions: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(positions.len() + 1);
    varint::encode_into(&mut buf, positions.len() as u64);
    let mut prev = 0u32;
    for &pos in positions {
        varint::encode_into(&mut buf, (pos - prev) as u64);
        prev = pos;
    }
    buf
}

pub fn decode_positions(bytes: &[u8]) -> Result<Vec<u32>> {
    let mut pos = 0;
    let count = varint::decode_at(bytes, &mut pos)? as usize;
    let mut positions = Vec::with_capacity(count);
    let mut prev = 0u32;
    for _ in 0..count {
        prev += varint::decode_at(bytes, &mut pos)? as u32;
        positions.push(prev);
    }
    Ok(positions)
}

/// Encode `(position, start_char, end_char)` triples. Positions and start
/// offsets are deltas from the previous entry's position and end offset.
pub fn encode_characters(tokens: &[&Token]) -> Vec<u8> {
    let mut buf = Vec::new();
    varint::encode_into(&mut buf, tokens.len() as u64);
    let mut prev_pos = 0u32;
    let mut prev_end = 0u32;
    for token in tokens {
        varint::encode_into(&mut buf, (token.position - prev_pos) as u64);
        varint::encode_into(&mut buf, token.start_char.saturating_sub(prev_end) as u64);
        varint::encode_into(&mut buf, (token.end_char - token.start_char) as u64);
        prev_pos = token.position;
        prev_end = token.end_char;
    }
    buf
}

pub fn decode_characters(bytes: &[u8]) -> Result<Vec<(u32, u32, u32)>> {
    let mut pos = 0;
    let count = varint::decode_at(bytes, &mut pos)? as usize;
    let mut entries = Vec::with_capacity(count);
    let mut prev_pos = 0u32;
    let mut prev_end = 0u32;
    for _ in 0..count {
        let position = prev_pos + varint::decode_at(bytes, &mut pos)? as u32;
        let start = prev_end + varint::decode_at(bytes, &mut pos)? as u32;
        let end = start + varint::decode_at(bytes, &mut pos)? as u32;
        entries.push((position, start, end));
        prev_pos = position;
        prev_end = end;
    }
    Ok(entries)
}

/// Build the posting value and weight for one document's tokens of a term.
pub fn encode_value(format: PostingFormat, tokens: &[&Token]) -> (f32, Vec<u8>) {
    match format {
        PostingFormat::Existence => (1.0, Vec::new()),
        PostingFormat::Frequency => (tokens.len() as f32, Vec::new()),
        PostingFormat::Positions => {
            let positions: Vec<u32> = tokens.iter().map(|t| t.position).collect();
            (tokens.len() as f32, encode_positions(&positions))
        }
        PostingFormat::Characters => (tokens.len() as f32, encode_characters(tokens)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::storage::memory::MemoryStorage;

    fn write_term(
        storage: &MemoryStorage,
        format: PostingFormat,
        block_limit: usize,
        postings: &[(u64, f32, Vec<u8>)],
    ) -> (FileTermInfo, PostingsCursor) {
        let output = storage.create_output("t.pst").unwrap();
        let mut writer = PostingsWriter::new(output, format, block_limit);
        writer.start_term().unwrap();
        for (id, weight, value) in postings {
            writer.add(*id, *weight, value, (*id % 7) as u32 + 1).unwrap();
        }
        let info = writer.finish_term().unwrap();
        writer.close().unwrap();

        let bytes = storage.open_bytes("t.pst").unwrap();
        let region = bytes
            .slice(info.offset as usize..(info.offset + info.length) as usize)
            .unwrap();
        let cursor = PostingsCursor::new(region, format, info.block_count).unwrap();
        (info, cursor)
    }

    #[test]
    fn test_blocks_and_next() {
        let storage = MemoryStorage::new_default();
        let postings: Vec<(u64, f32, Vec<u8>)> =
            (0..10).map(|i| (i * 3, (i % 4) as f32 + 1.0, Vec::new())).collect();
        let (info, mut cursor) = write_term(&storage, PostingFormat::Frequency, 4, &postings);

        assert_eq!(info.block_count, 3);
        assert_eq!(info.info.doc_frequency(), 10);
        assert_eq!(info.info.max_weight(), 4.0);

        let mut seen = Vec::new();
        while cursor.is_active() {
            seen.push((cursor.id(), cursor.weight()));
            cursor.next().unwrap();
        }
        let expected: Vec<(u64, f32)> = postings.iter().map(|(id, w, _)| (*id, *w)).collect();
        assert_eq!(seen, expected);
        assert_eq!(cursor.id(), u64::MAX);
        assert!(matches!(cursor.next(), Err(WhorlError::ReadTooFar)));
    }

    #[test]
    fn test_skip_to_crosses_blocks() {
        let storage = MemoryStorage::new_default();
        let postings: Vec<(u64, f32, Vec<u8>)> =
            (0..50).map(|i| (i * 2, 1.0, Vec::new())).collect();
        let (_, mut cursor) = write_term(&storage, PostingFormat::Existence, 8, &postings);

        cursor.skip_to(33).unwrap();
        assert_eq!(cursor.id(), 34);
        cursor.skip_to(10).unwrap();
        assert_eq!(cursor.id(), 34);
        cursor.skip_to(98).unwrap();
        assert_eq!(cursor.id(), 98);
        cursor.skip_to(99).unwrap();
        assert!(!cursor.is_active());

        cursor.reset().unwrap();
        assert_eq!(cursor.id(), 0);
    }

    #[test]
    fn test_position_values() {
        let storage = MemoryStorage::new_default();
        let postings = vec![
            (1, 2.0, encode_positions(&[0, 5])),
            (4, 1.0, encode_positions(&[3])),
        ];
        let (_, mut cursor) = write_term(&storage, PostingFormat::Positions, 128, &postings);

        assert_eq!(decode_positions(cursor.value().unwrap()).unwrap(), vec![0, 5]);
        assert_eq!(cursor.frequency().unwrap(), 2);
        cursor.next().unwrap();
        assert_eq!(decode_positions(cursor.value().unwrap()).unwrap(), vec![3]);
    }

    #[test]
    fn test_character_values() {
        let tokens = [
            Token {
                term: b"a".to_vec(),
                position: 2,
                start_char: 10,
                end_char: 15,
            },
            Token {
                term: b"a".to_vec(),
                position: 7,
                start_char: 30,
                end_char: 31,
            },
        ];
        let refs: Vec<&Token> = tokens.iter().collect();
        let (weight, value) = encode_value(PostingFormat::Characters, &refs);
        assert_eq!(weight, 2.0);
        assert_eq!(
            decode_characters(&value).unwrap(),
            vec![(2, 10, 15), (7, 30, 31)]
        );
    }

    #[test]
    fn test_out_of_order_posting_rejected() {
        let storage = MemoryStorage::new_default();
        let output = storage.create_output("x.pst").unwrap();
        let mut writer = PostingsWriter::new(output, PostingFormat::Existence, 4);
        writer.start_term().unwrap();
        writer.add(5, 1.0, &[], 1).unwrap();
        assert!(writer.add(5, 1.0, &[], 1).is_err());
        assert!(writer.add(2, 1.0, &[], 1).is_err());
    }
}
