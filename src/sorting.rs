//! Sort keys and facets.
//!
//! A [`Facet`] describes how to derive a key from a matched document: a field
//! value, the score, membership in named queries, a user function, or a tuple
//! of those. [`Facet::categorizer`] turns it into a [`Categorizer`] that is
//! rebound to each segment as the search moves through the index. Collectors
//! use categorizers both to order hits and to group them.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use bit_vec::BitVec;

use crate::error::Result;
use crate::matching::Matcher;
use crate::query::Query;
use crate::reader::{IndexReader, SegmentReader};
use crate::schema::{ColumnValue, FieldKind, decode_f64, decode_i64};
use crate::search::{SearchContext, Searcher};

/// A key derived from one document. Keys of different shapes order by
/// shape; `Missing` sorts after everything, even when reversed.
#[derive(Debug, Clone)]
pub enum SortKey {
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
    Tuple(Vec<SortKey>),
    Reversed(Box<SortKey>),
    Missing,
}

impl SortKey {
    fn rank(&self) -> u8 {
        match self {
            SortKey::Int(_) | SortKey::Float(_) => 0,
            SortKey::Bytes(_) => 1,
            SortKey::Text(_) => 2,
            SortKey::Tuple(_) => 3,
            SortKey::Reversed(_) => 4,
            SortKey::Missing => 5,
        }
    }

    /// Wrap in [`SortKey::Reversed`] when `reverse` is set.
    pub fn reversed_if(self, reverse: bool) -> SortKey {
        if reverse && self != SortKey::Missing {
            SortKey::Reversed(Box::new(self))
        } else {
            self
        }
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use SortKey::*;
        match (self, other) {
            (Missing, Missing) => Ordering::Equal,
            (Missing, _) => Ordering::Greater,
            (_, Missing) => Ordering::Less,
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Int(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Tuple(a), Tuple(b)) => a.cmp(b),
            (Reversed(a), Reversed(b)) => match (a.as_ref(), b.as_ref()) {
                (Missing, Missing) => Ordering::Equal,
                (Missing, _) => Ordering::Greater,
                (_, Missing) => Ordering::Less,
                (a, b) => b.cmp(a),
            },
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortKey::Int(i) => write!(f, "{i}"),
            SortKey::Float(x) => write!(f, "{x}"),
            SortKey::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            SortKey::Text(s) => f.write_str(s),
            SortKey::Tuple(keys) => {
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        f.write_str("/")?;
                    }
                    write!(f, "{key}")?;
                }
                Ok(())
            }
            SortKey::Reversed(key) => write!(f, "{key}"),
            SortKey::Missing => Ok(()),
        }
    }
}

/// A key function over `(segment, segment-local docnum, matcher)`.
pub type FacetFn = Arc<dyn Fn(&SegmentReader, u64, &Matcher) -> Result<SortKey> + Send + Sync>;

/// How to derive a sort or grouping key from a document.
#[derive(Clone)]
pub enum Facet {
    /// The value of a field: its column when it has one, else its terms.
    /// With `allow_overlap` a document falls into one group per term.
    Field {
        name: String,
        reverse: bool,
        allow_overlap: bool,
    },
    /// The document's score, best first unless `reverse`.
    Score { reverse: bool },
    /// The name of the first query matching the document, or `other`.
    Query {
        queries: Vec<(String, Query)>,
        other: Option<String>,
        allow_overlap: bool,
    },
    Function(FacetFn),
    /// A tuple of keys.
    Multi(Vec<Facet>),
}

impl fmt::Debug for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facet::Field {
                name,
                reverse,
                allow_overlap,
            } => f
                .debug_struct("Field")
                .field("name", name)
                .field("reverse", reverse)
                .field("allow_overlap", allow_overlap)
                .finish(),
            Facet::Score { reverse } => f.debug_struct("Score").field("reverse", reverse).finish(),
            Facet::Query {
                queries,
                other,
                allow_overlap,
            } => f
                .debug_struct("Query")
                .field("queries", queries)
                .field("other", other)
                .field("allow_overlap", allow_overlap)
                .finish(),
            Facet::Function(_) => f.write_str("Function(..)"),
            Facet::Multi(facets) => f.debug_tuple("Multi").field(facets).finish(),
        }
    }
}

impl Facet {
    pub fn field(name: impl Into<String>) -> Facet {
        Facet::Field {
            name: name.into(),
            reverse: false,
            allow_overlap: false,
        }
    }

    pub fn field_reversed(name: impl Into<String>) -> Facet {
        Facet::Field {
            name: name.into(),
            reverse: true,
            allow_overlap: false,
        }
    }

    /// Group by every term of a multi-valued field.
    pub fn overlapping(name: impl Into<String>) -> Facet {
        Facet::Field {
            name: name.into(),
            reverse: false,
            allow_overlap: true,
        }
    }

    pub fn score() -> Facet {
        Facet::Score { reverse: false }
    }

    pub fn queries(queries: Vec<(String, Query)>, other: Option<String>) -> Facet {
        Facet::Query {
            queries,
            other,
            allow_overlap: false,
        }
    }

    pub fn function<F>(function: F) -> Facet
    where
        F: Fn(&SegmentReader, u64, &Matcher) -> Result<SortKey> + Send + Sync + 'static,
    {
        Facet::Function(Arc::new(function))
    }

    pub fn multi(facets: Vec<Facet>) -> Facet {
        Facet::Multi(facets)
    }

    /// Whether keys depend on the matcher's current state.
    pub fn needs_current(&self) -> bool {
        match self {
            Facet::Score { .. } | Facet::Function(_) => true,
            Facet::Multi(facets) => facets.iter().any(Facet::needs_current),
            _ => false,
        }
    }

    pub fn categorizer(&self, searcher: &Searcher) -> Result<Box<dyn Categorizer>> {
        Ok(match self {
            Facet::Field {
                name,
                reverse,
                allow_overlap,
            } => Box::new(FieldCategorizer {
                field: name.clone(),
                kind: searcher
                    .schema()
                    .get_field(name)
                    .map_or(FieldKind::Text, |f| f.kind),
                reverse: *reverse,
                allow_overlap: *allow_overlap,
                leaf: None,
                column: false,
                terms: Vec::new(),
            }),
            Facet::Score { reverse } => Box::new(ScoreCategorizer { reverse: *reverse }),
            Facet::Query {
                queries,
                other,
                allow_overlap,
            } => Box::new(QueryCategorizer {
                searcher: searcher.clone(),
                context: searcher.context(),
                queries: queries.clone(),
                other: other.clone(),
                allow_overlap: *allow_overlap,
                matched: Vec::new(),
            }),
            Facet::Function(function) => Box::new(FunctionCategorizer {
                function: Arc::clone(function),
                leaf: None,
            }),
            Facet::Multi(facets) => Box::new(MultiCategorizer {
                parts: facets
                    .iter()
                    .map(|facet| facet.categorizer(searcher))
                    .collect::<Result<_>>()?,
            }),
        })
    }
}

/// Computes keys for the documents of one segment at a time.
pub trait Categorizer: Send + fmt::Debug {
    /// Rebind to a segment whose documents start at `offset`.
    fn set_searcher(&mut self, leaf: &SegmentReader, offset: u64) -> Result<()>;

    /// The key of a segment-local document the matcher is on.
    fn key_for(&self, docnum: u64, matcher: &Matcher) -> Result<SortKey>;

    /// All keys of a document, for facets that allow overlap.
    fn keys_for(&self, docnum: u64, matcher: &Matcher) -> Result<Vec<SortKey>> {
        Ok(vec![self.key_for(docnum, matcher)?])
    }

    /// A display name for a key, used as the group name.
    fn key_to_name(&self, key: &SortKey) -> String {
        key.to_string()
    }

    fn needs_current(&self) -> bool {
        false
    }

    fn allow_overlap(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct FieldCategorizer {
    field: String,
    kind: FieldKind,
    reverse: bool,
    allow_overlap: bool,
    leaf: Option<SegmentReader>,
    column: bool,
    // Sorted terms per document, when the field has no column.
    terms: Vec<Vec<Vec<u8>>>,
}

impl FieldCategorizer {
    fn column_key(&self, docnum: u64) -> Result<SortKey> {
        let Some(leaf) = &self.leaf else {
            return Ok(SortKey::Missing);
        };
        Ok(match leaf.column_value(docnum, &self.field)? {
            Some(ColumnValue::Integer(i)) => SortKey::Int(i),
            Some(ColumnValue::Float(x)) => SortKey::Float(x),
            Some(ColumnValue::Text(s)) => SortKey::Text(s),
            None => SortKey::Missing,
        })
    }

    fn doc_terms(&self, docnum: u64) -> &[Vec<u8>] {
        self.terms.get(docnum as usize).map_or(&[], Vec::as_slice)
    }
}

impl Categorizer for FieldCategorizer {
    fn set_searcher(&mut self, leaf: &SegmentReader, _offset: u64) -> Result<()> {
        self.column = !self.allow_overlap && leaf.has_column(&self.field)?;
        self.terms.clear();
        if !self.column {
            self.terms = vec![Vec::new(); leaf.doc_count_all()? as usize];
            for term in leaf.field_terms(&self.field)? {
                let term = term?;
                let mut postings = leaf.postings(&self.field, &term, None)?;
                for id in postings.all_ids()? {
                    if let Some(doc) = self.terms.get_mut(id as usize) {
                        doc.push(term.clone());
                    }
                }
            }
        }
        self.leaf = Some(leaf.clone());
        Ok(())
    }

    fn key_for(&self, docnum: u64, _matcher: &Matcher) -> Result<SortKey> {
        let key = if self.column {
            self.column_key(docnum)?
        } else {
            self.doc_terms(docnum)
                .first()
                .map_or(SortKey::Missing, |term| SortKey::Bytes(term.clone()))
        };
        Ok(key.reversed_if(self.reverse))
    }

    fn keys_for(&self, docnum: u64, matcher: &Matcher) -> Result<Vec<SortKey>> {
        if !self.allow_overlap || self.column {
            return Ok(vec![self.key_for(docnum, matcher)?]);
        }
        let terms = self.doc_terms(docnum);
        if terms.is_empty() {
            return Ok(vec![SortKey::Missing]);
        }
        Ok(terms
            .iter()
            .map(|term| SortKey::Bytes(term.clone()).reversed_if(self.reverse))
            .collect())
    }

    fn key_to_name(&self, key: &SortKey) -> String {
        let key = match key {
            SortKey::Reversed(inner) => inner.as_ref(),
            other => other,
        };
        match (key, self.kind) {
            (SortKey::Bytes(bytes), FieldKind::Integer) => decode_i64(bytes)
                .map(|i| i.to_string())
                .unwrap_or_else(|_| key.to_string()),
            (SortKey::Bytes(bytes), FieldKind::Float) => decode_f64(bytes)
                .map(|x| x.to_string())
                .unwrap_or_else(|_| key.to_string()),
            _ => key.to_string(),
        }
    }

    fn allow_overlap(&self) -> bool {
        self.allow_overlap
    }
}

#[derive(Debug)]
struct ScoreCategorizer {
    reverse: bool,
}

impl Categorizer for ScoreCategorizer {
    fn set_searcher(&mut self, _leaf: &SegmentReader, _offset: u64) -> Result<()> {
        Ok(())
    }

    fn key_for(&self, _docnum: u64, matcher: &Matcher) -> Result<SortKey> {
        let score = SortKey::Float(matcher.score()? as f64);
        // Higher scores sort first by default.
        Ok(score.reversed_if(!self.reverse))
    }

    fn needs_current(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct QueryCategorizer {
    searcher: Searcher,
    context: SearchContext,
    queries: Vec<(String, Query)>,
    other: Option<String>,
    allow_overlap: bool,
    // One bit set per query over the current segment.
    matched: Vec<BitVec>,
}

impl QueryCategorizer {
    fn names(&self, docnum: u64) -> impl Iterator<Item = &str> {
        self.queries
            .iter()
            .zip(&self.matched)
            .filter(move |(_, bits)| bits.get(docnum as usize).unwrap_or(false))
            .map(|((name, _), _)| name.as_str())
    }

    fn fallback(&self) -> SortKey {
        self.other.clone().map_or(SortKey::Missing, SortKey::Text)
    }
}

impl Categorizer for QueryCategorizer {
    fn set_searcher(&mut self, leaf: &SegmentReader, _offset: u64) -> Result<()> {
        let size = leaf.doc_count_all()? as usize;
        self.matched.clear();
        for (_, query) in &self.queries {
            let mut bits = BitVec::from_elem(size, false);
            let mut matcher = query.matcher(&self.searcher, leaf, &self.context)?;
            for id in matcher.all_ids()? {
                if (id as usize) < size {
                    bits.set(id as usize, true);
                }
            }
            self.matched.push(bits);
        }
        Ok(())
    }

    fn key_for(&self, docnum: u64, _matcher: &Matcher) -> Result<SortKey> {
        Ok(self
            .names(docnum)
            .next()
            .map_or_else(|| self.fallback(), |name| SortKey::Text(name.to_string())))
    }

    fn keys_for(&self, docnum: u64, matcher: &Matcher) -> Result<Vec<SortKey>> {
        if !self.allow_overlap {
            return Ok(vec![self.key_for(docnum, matcher)?]);
        }
        let keys: Vec<SortKey> = self
            .names(docnum)
            .map(|name| SortKey::Text(name.to_string()))
            .collect();
        if keys.is_empty() {
            return Ok(vec![self.fallback()]);
        }
        Ok(keys)
    }

    fn allow_overlap(&self) -> bool {
        self.allow_overlap
    }
}

struct FunctionCategorizer {
    function: FacetFn,
    leaf: Option<SegmentReader>,
}

impl fmt::Debug for FunctionCategorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionCategorizer").finish_non_exhaustive()
    }
}

impl Categorizer for FunctionCategorizer {
    fn set_searcher(&mut self, leaf: &SegmentReader, _offset: u64) -> Result<()> {
        self.leaf = Some(leaf.clone());
        Ok(())
    }

    fn key_for(&self, docnum: u64, matcher: &Matcher) -> Result<SortKey> {
        match &self.leaf {
            Some(leaf) => (self.function)(leaf, docnum, matcher),
            None => Ok(SortKey::Missing),
        }
    }

    fn needs_current(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct MultiCategorizer {
    parts: Vec<Box<dyn Categorizer>>,
}

impl Categorizer for MultiCategorizer {
    fn set_searcher(&mut self, leaf: &SegmentReader, offset: u64) -> Result<()> {
        for part in &mut self.parts {
            part.set_searcher(leaf, offset)?;
        }
        Ok(())
    }

    fn key_for(&self, docnum: u64, matcher: &Matcher) -> Result<SortKey> {
        let keys = self
            .parts
            .iter()
            .map(|part| part.key_for(docnum, matcher))
            .collect::<Result<_>>()?;
        Ok(SortKey::Tuple(keys))
    }

    fn key_to_name(&self, key: &SortKey) -> String {
        match key {
            SortKey::Tuple(keys) => self
                .parts
                .iter()
                .zip(keys)
                .map(|(part, key)| part.key_to_name(key))
                .collect::<Vec<_>>()
                .join("/"),
            other => other.to_string(),
        }
    }

    fn needs_current(&self) -> bool {
        self.parts.iter().any(|part| part.needs_current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::testing;
    use crate::schema::Document;

    #[test]
    fn test_sort_key_order() {
        let mut keys = vec![
            SortKey::Missing,
            SortKey::Text("b".into()),
            SortKey::Int(3),
            SortKey::Float(1.5),
            SortKey::Text("a".into()),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                SortKey::Float(1.5),
                SortKey::Int(3),
                SortKey::Text("a".into()),
                SortKey::Text("b".into()),
                SortKey::Missing,
            ]
        );

        let mut reversed: Vec<SortKey> = [Some(1), None, Some(5)]
            .into_iter()
            .map(|v| v.map_or(SortKey::Missing, SortKey::Int).reversed_if(true))
            .collect();
        reversed.sort();
        assert_eq!(
            reversed,
            vec![
                SortKey::Int(5).reversed_if(true),
                SortKey::Int(1).reversed_if(true),
                SortKey::Missing,
            ]
        );
    }

    #[test]
    fn test_field_keys() {
        let docs = vec![
            Document::builder().add_text("body", "a").add_text("tag", "red").add_integer("num", 7).build(),
            Document::builder().add_text("body", "a").add_text("tag", "blue green").build(),
        ];
        let searcher = testing::searcher_over(&[docs]);
        let (leaf, offset) = searcher.leaf_readers()[0].clone();

        let mut tags = Facet::overlapping("tag").categorizer(&searcher).unwrap();
        tags.set_searcher(&leaf, offset).unwrap();
        let keys = tags.keys_for(1, &Matcher::Null).unwrap();
        let names: Vec<String> = keys.iter().map(|k| tags.key_to_name(k)).collect();
        assert_eq!(names, vec!["blue", "green"]);

        let mut nums = Facet::field("num").categorizer(&searcher).unwrap();
        nums.set_searcher(&leaf, offset).unwrap();
        assert_eq!(nums.key_for(0, &Matcher::Null).unwrap(), SortKey::Int(7));
        assert_eq!(nums.key_for(1, &Matcher::Null).unwrap(), SortKey::Missing);
    }

    #[test]
    fn test_query_keys() {
        let searcher = testing::searcher(&[&["alpha", "beta", "gamma"]]);
        let (leaf, offset) = searcher.leaf_readers()[0].clone();
        let facet = Facet::queries(
            vec![
                ("a".to_string(), Query::term("body", "alpha")),
                ("b".to_string(), Query::term("body", "beta")),
            ],
            Some("rest".to_string()),
        );
        let mut cat = facet.categorizer(&searcher).unwrap();
        cat.set_searcher(&leaf, offset).unwrap();
        let names: Vec<String> = (0..3)
            .map(|d| cat.key_to_name(&cat.key_for(d, &Matcher::Null).unwrap()))
            .collect();
        assert_eq!(names, vec!["a", "b", "rest"]);
    }
}
