//! Schema, field types and documents.
//!
//! A [`Schema`] maps field names to [`FieldType`]s. The field type decides how
//! a [`FieldValue`] becomes index terms, which posting format those terms use,
//! and whether the value is also stored, kept in a per-document column, or
//! counted into field lengths for scoring.
//!
//! Term bytes are what the index compares: text terms are lowercased UTF-8,
//! numbers use a sortable big-endian encoding so that byte order equals
//! numeric order and range queries work on the term dictionary directly.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{Result, WhorlError};

/// What a field holds and how it is turned into terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// Tokenized on word boundaries and lowercased.
    Text,
    /// Split on whitespace; tokens are kept verbatim.
    Keyword,
    /// The whole value is one term.
    Id,
    /// A signed integer, indexed as one sortable term.
    Integer,
    /// A float, indexed as one sortable term.
    Float,
    /// Stored only, never indexed.
    Stored,
}

/// What each posting records besides the document number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostingFormat {
    /// Presence only; every weight is 1.
    Existence,
    /// Weight is the term frequency.
    Frequency,
    /// Frequency plus the token positions.
    Positions,
    /// Positions plus start and end character offsets.
    Characters,
}

impl PostingFormat {
    pub fn has_values(self) -> bool {
        matches!(self, PostingFormat::Positions | PostingFormat::Characters)
    }

    pub fn has_positions(self) -> bool {
        self.has_values()
    }
}

/// One token produced from a field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub term: Vec<u8>,
    pub position: u32,
    pub start_char: u32,
    pub end_char: u32,
}

/// The type of a schema field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldType {
    pub kind: FieldKind,
    pub format: PostingFormat,
    pub stored: bool,
    pub column: bool,
    pub scorable: bool,
    pub field_boost: f32,
}

impl FieldType {
    /// Full-text field: positions recorded, lengths kept for scoring.
    pub fn text() -> Self {
        FieldType {
            kind: FieldKind::Text,
            format: PostingFormat::Positions,
            stored: false,
            column: false,
            scorable: true,
            field_boost: 1.0,
        }
    }

    /// Whitespace-separated keywords with frequencies.
    pub fn keyword() -> Self {
        FieldType {
            kind: FieldKind::Keyword,
            format: PostingFormat::Frequency,
            stored: false,
            column: false,
            scorable: true,
            field_boost: 1.0,
        }
    }

    /// A single untokenized term, such as a path or a key.
    pub fn id() -> Self {
        FieldType {
            kind: FieldKind::Id,
            format: PostingFormat::Existence,
            stored: false,
            column: false,
            scorable: false,
            field_boost: 1.0,
        }
    }

    /// A signed integer, sortable as a column.
    pub fn numeric() -> Self {
        FieldType {
            kind: FieldKind::Integer,
            format: PostingFormat::Existence,
            stored: false,
            column: true,
            scorable: false,
            field_boost: 1.0,
        }
    }

    /// A float, sortable as a column.
    pub fn float() -> Self {
        FieldType {
            kind: FieldKind::Float,
            ..FieldType::numeric()
        }
    }

    /// A stored-only field.
    pub fn stored() -> Self {
        FieldType {
            kind: FieldKind::Stored,
            format: PostingFormat::Existence,
            stored: true,
            column: false,
            scorable: false,
            field_boost: 1.0,
        }
    }

    pub fn with_stored(mut self, stored: bool) -> Self {
        self.stored = stored;
        self
    }

    pub fn with_column(mut self, column: bool) -> Self {
        self.column = column;
        self
    }

    pub fn with_format(mut self, format: PostingFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_field_boost(mut self, boost: f32) -> Self {
        self.field_boost = boost;
        self
    }

    pub fn is_indexed(&self) -> bool {
        self.kind != FieldKind::Stored
    }

    /// Turn a value into the tokens indexed for it.
    pub fn tokens(&self, value: &FieldValue) -> Result<Vec<Token>> {
        match (self.kind, value) {
            (FieldKind::Stored, _) => Ok(Vec::new()),
            (FieldKind::Text, FieldValue::Text(text)) => Ok(tokenize_words(text)),
            (FieldKind::Keyword, FieldValue::Text(text)) => Ok(tokenize_whitespace(text)),
            (FieldKind::Id, FieldValue::Text(text)) => Ok(vec![Token {
                term: text.as_bytes().to_vec(),
                position: 0,
                start_char: 0,
                end_char: text.chars().count() as u32,
            }]),
            (FieldKind::Integer | FieldKind::Float, _) => Ok(vec![Token {
                term: self.value_term(value)?,
                position: 0,
                start_char: 0,
                end_char: 0,
            }]),
            (_, FieldValue::Integer(i)) => self.tokens(&FieldValue::Text(i.to_string())),
            (_, FieldValue::Float(f)) => self.tokens(&FieldValue::Text(f.to_string())),
        }
    }

    /// The single term a query text maps to in this field.
    pub fn value_term(&self, value: &FieldValue) -> Result<Vec<u8>> {
        match (self.kind, value) {
            (FieldKind::Integer, FieldValue::Integer(i)) => Ok(encode_i64(*i).to_vec()),
            (FieldKind::Integer, FieldValue::Text(text)) => {
                let i: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| WhorlError::schema(format!("not an integer: {text:?}")))?;
                Ok(encode_i64(i).to_vec())
            }
            (FieldKind::Integer, FieldValue::Float(f)) => Ok(encode_i64(*f as i64).to_vec()),
            (FieldKind::Float, FieldValue::Float(f)) => Ok(encode_f64(*f).to_vec()),
            (FieldKind::Float, FieldValue::Integer(i)) => Ok(encode_f64(*i as f64).to_vec()),
            (FieldKind::Float, FieldValue::Text(text)) => {
                let f: f64 = text
                    .trim()
                    .parse()
                    .map_err(|_| WhorlError::schema(format!("not a number: {text:?}")))?;
                Ok(encode_f64(f).to_vec())
            }
            (FieldKind::Text, FieldValue::Text(text)) => Ok(text.to_lowercase().into_bytes()),
            (_, FieldValue::Text(text)) => Ok(text.as_bytes().to_vec()),
            (_, other) => Ok(other.to_string().into_bytes()),
        }
    }

    /// The column entry for a value, if this field keeps a column.
    pub fn column_value(&self, value: &FieldValue) -> Option<ColumnValue> {
        if !self.column {
            return None;
        }
        Some(match (self.kind, value) {
            (FieldKind::Integer, FieldValue::Integer(i)) => ColumnValue::Integer(*i),
            (FieldKind::Integer, FieldValue::Float(f)) => ColumnValue::Integer(*f as i64),
            (FieldKind::Float, FieldValue::Float(f)) => ColumnValue::Float(*f),
            (FieldKind::Float, FieldValue::Integer(i)) => ColumnValue::Float(*i as f64),
            (_, FieldValue::Text(text)) => ColumnValue::Text(text.clone()),
            (_, other) => ColumnValue::Text(other.to_string()),
        })
    }
}

fn tokenize_words(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut char_pos = 0u32;
    let mut byte_pos = 0usize;

    for (position, (start, word)) in text.unicode_word_indices().enumerate() {
        char_pos += text[byte_pos..start].chars().count() as u32;
        let len = word.chars().count() as u32;
        tokens.push(Token {
            term: word.to_lowercase().into_bytes(),
            position: position as u32,
            start_char: char_pos,
            end_char: char_pos + len,
        });
        char_pos += len;
        byte_pos = start + word.len();
    }
    tokens
}

fn tokenize_whitespace(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut position = 0u32;
    let mut char_pos = 0u32;
    let mut start: Option<(u32, usize)> = None;

    for (byte, c) in text.char_indices().chain(std::iter::once((text.len(), ' '))) {
        if c.is_whitespace() {
            if let Some((start_char, start_byte)) = start.take() {
                tokens.push(Token {
                    term: text[start_byte..byte].as_bytes().to_vec(),
                    position,
                    start_char,
                    end_char: char_pos,
                });
                position += 1;
            }
        } else if start.is_none() {
            start = Some((char_pos, byte));
        }
        char_pos += 1;
    }
    tokens
}

/// Sortable encoding of an `i64`: big-endian with the sign bit flipped.
pub fn encode_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

pub fn decode_i64(bytes: &[u8]) -> Result<i64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| WhorlError::format("sortable integer must be 8 bytes"))?;
    Ok((u64::from_be_bytes(array) ^ (1 << 63)) as i64)
}

/// Sortable encoding of an `f64`: negative values have every bit flipped,
/// positive values only the sign bit.
pub fn encode_f64(value: f64) -> [u8; 8] {
    let bits = value.to_bits();
    let sortable = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
    sortable.to_be_bytes()
}

pub fn decode_f64(bytes: &[u8]) -> Result<f64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| WhorlError::format("sortable float must be 8 bytes"))?;
    let sortable = u64::from_be_bytes(array);
    let bits = if sortable >> 63 == 1 {
        sortable & !(1 << 63)
    } else {
        !sortable
    };
    Ok(f64::from_bits(bits))
}

/// A value in a per-document column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// A field value in a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(text) => write!(f, "{text}"),
            FieldValue::Integer(i) => write!(f, "{i}"),
            FieldValue::Float(x) => write!(f, "{x}"),
        }
    }
}

/// A document to index, or the stored fields read back from one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    fields: BTreeMap<String, FieldValue>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::new()
    }

    pub fn add_field<S: Into<String>>(&mut self, name: S, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A builder for constructing documents in a fluent manner.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_text<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document.add_field(name, FieldValue::Text(value.into()));
        self
    }

    pub fn add_integer<S: Into<String>>(mut self, name: S, value: i64) -> Self {
        self.document.add_field(name, FieldValue::Integer(value));
        self
    }

    pub fn add_float<S: Into<String>>(mut self, name: S, value: f64) -> Self {
        self.document.add_field(name, FieldValue::Float(value));
        self
    }

    pub fn build(self) -> Document {
        self.document
    }
}

/// The set of fields an index knows about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    fields: BTreeMap<String, FieldType>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Add a field to the schema.
    pub fn add_field<S: Into<String>>(&mut self, name: S, field_type: FieldType) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(WhorlError::schema("Field name cannot be empty"));
        }
        if name.starts_with('_') {
            return Err(WhorlError::schema(format!(
                "Field name '{name}' is reserved"
            )));
        }
        if self.fields.contains_key(&name) {
            return Err(WhorlError::schema(format!("Field '{name}' already exists")));
        }
        self.fields.insert(name, field_type);
        Ok(())
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldType> {
        self.fields.get(name)
    }

    /// Like [`Schema::get_field`], but a missing field is an error.
    pub fn field(&self, name: &str) -> Result<&FieldType> {
        self.fields
            .get(name)
            .ok_or_else(|| WhorlError::schema(format!("No field named '{name}'")))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Field names in sorted order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldType)> {
        self.fields.iter().map(|(name, ft)| (name.as_str(), ft))
    }

    pub fn scorable_fields(&self) -> impl Iterator<Item = &str> {
        self.fields()
            .filter(|(_, ft)| ft.scorable && ft.is_indexed())
            .map(|(name, _)| name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Encode query text as a term of `field`.
    pub fn term_bytes(&self, field: &str, text: &str) -> Result<Vec<u8>> {
        self.field(field)?
            .value_term(&FieldValue::Text(text.to_string()))
    }

    /// Check that a document only uses known fields.
    pub fn validate(&self, document: &Document) -> Result<()> {
        for name in document.fields().keys() {
            if !self.has_field(name) {
                return Err(WhorlError::schema(format!(
                    "Document has unknown field '{name}'"
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    schema: Schema,
    error: Option<WhorlError>,
}

impl SchemaBuilder {
    pub fn add_field<S: Into<String>>(mut self, name: S, field_type: FieldType) -> Self {
        if self.error.is_none()
            && let Err(e) = self.schema.add_field(name, field_type)
        {
            self.error = Some(e);
        }
        self
    }

    pub fn build(self) -> Result<Schema> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.schema),
        }
    }
}
