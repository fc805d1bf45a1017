//! Term, multi-term and every queries.

use std::cmp::Ordering;
use std::fmt;

use log::debug;
use regex::Regex;

use crate::error::{Result, WhorlError};
use crate::matching::{ListMatcher, Matcher, make_weighted_tree};
use crate::query::{Query, TermValue};
use crate::reader::{IndexReader, SegmentReader};
use crate::schema::FieldKind;
use crate::search::{SearchContext, Searcher};

/// A range of terms in one field, compared as raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TermRange {
    pub field: String,
    pub start: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
    pub start_excl: bool,
    pub end_excl: bool,
    pub boost: f32,
    pub constant_score: bool,
}

type Bound = (Option<Vec<u8>>, bool);

impl TermRange {
    pub fn new(field: impl Into<String>, start: Option<Vec<u8>>, end: Option<Vec<u8>>) -> Self {
        TermRange {
            field: field.into(),
            start,
            end,
            start_excl: false,
            end_excl: false,
            boost: 1.0,
            constant_score: true,
        }
    }

    pub fn exclusive(mut self, start_excl: bool, end_excl: bool) -> Self {
        self.start_excl = start_excl;
        self.end_excl = end_excl;
        self
    }

    pub fn contains(&self, term: &[u8]) -> bool {
        if let Some(start) = &self.start {
            match term.cmp(start) {
                Ordering::Less => return false,
                Ordering::Equal if self.start_excl => return false,
                _ => {}
            }
        }
        if let Some(end) = &self.end {
            match term.cmp(end) {
                Ordering::Greater => return false,
                Ordering::Equal if self.end_excl => return false,
                _ => {}
            }
        }
        true
    }

    /// True when no term can fall in the range.
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Some(start), Some(end)) => {
                start > end || (start == end && (self.start_excl || self.end_excl))
            }
            _ => false,
        }
    }

    /// The only term in the range, when both ends are the same inclusive term.
    pub fn single_term(&self) -> Option<&[u8]> {
        match (&self.start, &self.end) {
            (Some(start), Some(end)) if start == end && !self.start_excl && !self.end_excl => {
                Some(start)
            }
            _ => None,
        }
    }

    /// True when the union of the two ranges is itself a range.
    pub fn touches(&self, other: &TermRange) -> bool {
        self.field == other.field && !ends_before(self, other) && !ends_before(other, self)
    }

    pub fn intersect(&self, other: &TermRange) -> TermRange {
        let (start, start_excl) = tighter_start(self.start_bound(), other.start_bound());
        let (end, end_excl) = tighter_end(self.end_bound(), other.end_bound());
        TermRange {
            field: self.field.clone(),
            start,
            end,
            start_excl,
            end_excl,
            boost: self.boost,
            constant_score: self.constant_score && other.constant_score,
        }
    }

    /// The covering range of two touching ranges.
    pub fn union(&self, other: &TermRange) -> TermRange {
        let (start, start_excl) = looser_start(self.start_bound(), other.start_bound());
        let (end, end_excl) = looser_end(self.end_bound(), other.end_bound());
        TermRange {
            field: self.field.clone(),
            start,
            end,
            start_excl,
            end_excl,
            boost: self.boost,
            constant_score: self.constant_score && other.constant_score,
        }
    }

    fn start_bound(&self) -> Bound {
        (self.start.clone(), self.start_excl)
    }

    fn end_bound(&self) -> Bound {
        (self.end.clone(), self.end_excl)
    }
}

/// `a` ends strictly before `b` starts, leaving a gap.
fn ends_before(a: &TermRange, b: &TermRange) -> bool {
    match (&a.end, &b.start) {
        (Some(end), Some(start)) => end < start || (end == start && a.end_excl && b.start_excl),
        _ => false,
    }
}

fn tighter_start(a: Bound, b: Bound) -> Bound {
    match (&a.0, &b.0) {
        (None, _) => b,
        (_, None) => a,
        (Some(x), Some(y)) => match x.cmp(y) {
            Ordering::Greater => a,
            Ordering::Less => b,
            Ordering::Equal => (a.0, a.1 || b.1),
        },
    }
}

fn tighter_end(a: Bound, b: Bound) -> Bound {
    match (&a.0, &b.0) {
        (None, _) => b,
        (_, None) => a,
        (Some(x), Some(y)) => match x.cmp(y) {
            Ordering::Less => a,
            Ordering::Greater => b,
            Ordering::Equal => (a.0, a.1 || b.1),
        },
    }
}

fn looser_start(a: Bound, b: Bound) -> Bound {
    match (&a.0, &b.0) {
        (None, _) | (_, None) => (None, false),
        (Some(x), Some(y)) => match x.cmp(y) {
            Ordering::Less => a,
            Ordering::Greater => b,
            Ordering::Equal => (a.0, a.1 && b.1),
        },
    }
}

fn looser_end(a: Bound, b: Bound) -> Bound {
    match (&a.0, &b.0) {
        (None, _) | (_, None) => (None, false),
        (Some(x), Some(y)) => match x.cmp(y) {
            Ordering::Greater => a,
            Ordering::Less => b,
            Ordering::Equal => (a.0, a.1 && b.1),
        },
    }
}

impl fmt::Display for TermRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |bytes: &Option<Vec<u8>>| {
            bytes
                .as_ref()
                .map(|b| TermValue::Encoded(b.clone()).to_string())
                .unwrap_or_default()
        };
        write!(
            f,
            "{}:{}{} TO {}{}",
            self.field,
            if self.start_excl { '{' } else { '[' },
            side(&self.start),
            side(&self.end),
            if self.end_excl { '}' } else { ']' },
        )
    }
}

/// Encode a term value for `field`, or `None` when the schema lacks it.
pub(crate) fn encode_term(
    reader: &dyn IndexReader,
    field: &str,
    value: &TermValue,
) -> Result<Option<Vec<u8>>> {
    let schema = reader.schema();
    let Some(field_type) = schema.get_field(field) else {
        return Ok(None);
    };
    match value {
        TermValue::Value(value) => field_type.value_term(value).map(Some),
        TermValue::Encoded(bytes) => Ok(Some(bytes.clone())),
    }
}

/// Prefix and wildcard text as the field would index it.
fn pattern_text(reader: &dyn IndexReader, field: &str, text: &str) -> Result<Option<String>> {
    let schema = reader.schema();
    let Some(field_type) = schema.get_field(field) else {
        return Ok(None);
    };
    match field_type.kind {
        FieldKind::Integer | FieldKind::Float => Err(WhorlError::query(format!(
            "field {field} is numeric and only supports term and range queries"
        ))),
        FieldKind::Text => Ok(Some(text.to_lowercase())),
        _ => Ok(Some(text.to_string())),
    }
}

pub(crate) fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::from("(?s)^");
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| WhorlError::query(format!("bad wildcard {pattern:?}: {e}")))
}

/// The terms of `reader` matched by a prefix, wildcard or range query, in
/// order. Other queries expand to nothing.
pub(crate) fn expand(query: &Query, reader: &dyn IndexReader) -> Result<Vec<Vec<u8>>> {
    match query {
        Query::Prefix { field, prefix, .. } => match pattern_text(reader, field, prefix)? {
            Some(prefix) => reader.expand_prefix(field, prefix.as_bytes()),
            None => Ok(Vec::new()),
        },
        Query::Wildcard { field, pattern, .. } => {
            let Some(pattern) = pattern_text(reader, field, pattern)? else {
                return Ok(Vec::new());
            };
            let literal: String = pattern
                .chars()
                .take_while(|&c| c != '*' && c != '?')
                .collect();
            if literal.len() == pattern.len() {
                return Ok(if reader.contains_term(field, literal.as_bytes())? {
                    vec![literal.into_bytes()]
                } else {
                    Vec::new()
                });
            }

            let regex = wildcard_regex(&pattern)?;
            let mut terms = Vec::new();
            for term in reader.terms_from(field, literal.as_bytes())? {
                let term = term?;
                if !term.starts_with(literal.as_bytes()) {
                    break;
                }
                if let Ok(text) = std::str::from_utf8(&term)
                    && regex.is_match(text)
                {
                    terms.push(term);
                }
            }
            Ok(terms)
        }
        Query::TermRange(range) => {
            if range.is_empty() || !reader.schema().has_field(&range.field) {
                return Ok(Vec::new());
            }
            let start = range.start.as_deref().unwrap_or_default();
            let mut terms = Vec::new();
            for term in reader.terms_from(&range.field, start)? {
                let term = term?;
                if let Some(end) = &range.end
                    && (term > *end || (range.end_excl && term == *end))
                {
                    break;
                }
                if range.contains(&term) {
                    terms.push(term);
                }
            }
            Ok(terms)
        }
        _ => Ok(Vec::new()),
    }
}

/// Postings of one term scored with index-wide statistics; `Null` when the
/// segment lacks the term.
pub(crate) fn scored_postings(
    searcher: &Searcher,
    leaf: &SegmentReader,
    context: &SearchContext,
    field: &str,
    term: &[u8],
    boost: f32,
) -> Result<Matcher> {
    if !leaf.contains_term(field, term)? {
        return Ok(Matcher::Null);
    }
    let weight = searcher.term_weight(field, term, boost, context)?;
    leaf.postings(field, term, Some(&weight))
}

pub(crate) fn term_matcher(
    searcher: &Searcher,
    leaf: &SegmentReader,
    context: &SearchContext,
    field: &str,
    value: &TermValue,
    boost: f32,
) -> Result<Matcher> {
    match encode_term(leaf, field, value)? {
        Some(term) => scored_postings(searcher, leaf, context, field, &term, boost),
        None => Ok(Matcher::Null),
    }
}

/// Union of the documents of several terms, unscored.
fn term_union_ids(leaf: &SegmentReader, field: &str, terms: &[Vec<u8>]) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for term in terms {
        ids.extend(leaf.postings(field, term, None)?.all_ids()?);
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

pub(crate) fn multi_term_matcher(
    query: &Query,
    searcher: &Searcher,
    leaf: &SegmentReader,
    context: &SearchContext,
) -> Result<Matcher> {
    let (field, boost, constant_score) = match query {
        Query::Prefix {
            field,
            boost,
            constant_score,
            ..
        }
        | Query::Wildcard {
            field,
            boost,
            constant_score,
            ..
        } => (field.as_str(), *boost, *constant_score),
        Query::TermRange(range) => (range.field.as_str(), range.boost, range.constant_score),
        _ => return query.matcher(searcher, leaf, context),
    };

    let terms = expand(query, leaf)?;
    if terms.is_empty() {
        return Ok(Matcher::Null);
    }
    if constant_score || terms.len() > context.policy.max_expansions {
        if !constant_score {
            debug!(
                "{query} expanded to {} terms; matching without term scores",
                terms.len()
            );
        }
        let ids = term_union_ids(leaf, field, &terms)?;
        return Ok(ListMatcher::new(ids).with_all_weight(boost).into_matcher());
    }

    let mut items = Vec::with_capacity(terms.len());
    for term in &terms {
        let matcher = scored_postings(searcher, leaf, context, field, term, boost)?;
        items.push((leaf.doc_frequency(field, term)?, matcher));
    }
    make_weighted_tree(items, Matcher::union)
}

pub(crate) fn every_matcher(leaf: &SegmentReader, field: Option<&str>, boost: f32) -> Result<Matcher> {
    let ids = match field {
        None => leaf.all_doc_ids()?,
        Some(field) => {
            if !leaf.schema().has_field(field) {
                return Ok(Matcher::Null);
            }
            let terms = leaf.field_terms(field)?.collect::<Result<Vec<_>>>()?;
            term_union_ids(leaf, field, &terms)?
        }
    };
    if ids.is_empty() {
        return Ok(Matcher::Null);
    }
    Ok(ListMatcher::new(ids).with_all_weight(boost).into_matcher())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::testing;

    fn range(start: &str, end: &str) -> TermRange {
        TermRange::new(
            "f",
            Some(start.as_bytes().to_vec()),
            Some(end.as_bytes().to_vec()),
        )
    }

    #[test]
    fn test_range_bounds() {
        let r = range("b", "d").exclusive(false, true);
        assert!(r.contains(b"b"));
        assert!(r.contains(b"cz"));
        assert!(!r.contains(b"d"));
        assert!(!r.contains(b"a"));
        assert!(range("c", "b").is_empty());
        assert!(range("c", "c").exclusive(true, false).is_empty());
        assert_eq!(range("c", "c").single_term(), Some(&b"c"[..]));
    }

    #[test]
    fn test_range_merging() {
        let a = range("a", "m");
        let b = range("k", "z");
        assert!(a.touches(&b));
        assert_eq!(a.intersect(&b), range("k", "m"));
        assert_eq!(a.union(&b), range("a", "z"));

        let left = range("a", "c").exclusive(false, true);
        let right = range("c", "e").exclusive(true, false);
        assert!(!left.touches(&right));
        assert!(left.touches(&range("c", "e")));
        assert!(left.intersect(&right).is_empty());
    }

    #[test]
    fn test_wildcard_regex() {
        let regex = wildcard_regex("ga?m*").unwrap();
        assert!(regex.is_match("gamma"));
        assert!(regex.is_match("gaxm"));
        assert!(!regex.is_match("gam"));
        assert!(wildcard_regex("a.b").unwrap().is_match("a.b"));
        assert!(!wildcard_regex("a.b").unwrap().is_match("axb"));
    }

    #[test]
    fn test_expand() {
        let reader = testing::segment(&["alpha beta", "gamma gaffe", "delta"]);
        let prefix = Query::prefix("body", "GA");
        assert_eq!(
            expand(&prefix, &reader).unwrap(),
            vec![b"gaffe".to_vec(), b"gamma".to_vec()]
        );
        let wildcard = Query::wildcard("body", "*ta");
        assert_eq!(
            expand(&wildcard, &reader).unwrap(),
            vec![b"beta".to_vec(), b"delta".to_vec()]
        );
        let range = Query::range("body", Some("b"), Some("delta"));
        assert_eq!(
            expand(&range, &reader).unwrap(),
            vec![b"beta".to_vec(), b"delta".to_vec()]
        );
        assert!(expand(&Query::prefix("missing", "a"), &reader).unwrap().is_empty());
        assert!(matches!(
            expand(&Query::prefix("num", "1"), &reader),
            Err(WhorlError::Query(_))
        ));
    }
}
