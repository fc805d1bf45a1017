//! The query algebra.
//!
//! A [`Query`] is an immutable tree. [`Query::normalize`] simplifies it, and
//! [`Query::matcher`] compiles it against one segment into a
//! [`Matcher`](crate::matching::Matcher) tree. Term statistics for scoring
//! always come from the whole searched index, so a document scores the same
//! whichever segment it lives in.

use std::fmt;

use crate::error::Result;
use crate::matching::{BoostMatcher, Matcher};
use crate::reader::{IndexReader, SegmentReader};
use crate::schema::{FieldValue, encode_f64, encode_i64};
use crate::search::{SearchContext, Searcher};

pub mod binary;
pub mod compound;
pub mod normalize;
pub mod spans;
pub mod terms;

pub use compound::{MatchingPolicy, OrStrategy};
pub use spans::SpanQuery;
pub use terms::TermRange;

/// The value a term query looks for.
#[derive(Debug, Clone, PartialEq)]
pub enum TermValue {
    /// A value encoded by the field's type at search time.
    Value(FieldValue),
    /// Already encoded term bytes.
    Encoded(Vec<u8>),
}

impl From<&str> for TermValue {
    fn from(text: &str) -> Self {
        TermValue::Value(FieldValue::Text(text.to_string()))
    }
}

impl From<String> for TermValue {
    fn from(text: String) -> Self {
        TermValue::Value(FieldValue::Text(text))
    }
}

impl From<i64> for TermValue {
    fn from(value: i64) -> Self {
        TermValue::Value(FieldValue::Integer(value))
    }
}

impl From<f64> for TermValue {
    fn from(value: f64) -> Self {
        TermValue::Value(FieldValue::Float(value))
    }
}

impl fmt::Display for TermValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermValue::Value(value) => write!(f, "{value}"),
            TermValue::Encoded(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => f.write_str(text),
                Err(_) => {
                    f.write_str("0x")?;
                    bytes.iter().try_for_each(|b| write!(f, "{b:02x}"))
                }
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Term {
        field: String,
        value: TermValue,
        boost: f32,
    },
    Prefix {
        field: String,
        prefix: String,
        boost: f32,
        constant_score: bool,
    },
    /// `*` matches any run of characters, `?` any single one.
    Wildcard {
        field: String,
        pattern: String,
        boost: f32,
        constant_score: bool,
    },
    TermRange(TermRange),
    /// Every live document, or every document with a term in `field`.
    Every {
        field: Option<String>,
        boost: f32,
    },
    Null,
    And {
        subqueries: Vec<Query>,
        boost: f32,
    },
    Or {
        subqueries: Vec<Query>,
        boost: f32,
        strategy: OrStrategy,
    },
    /// Scores each document by its best subquery plus `tiebreak` times the rest.
    DisjunctionMax {
        subqueries: Vec<Query>,
        boost: f32,
        tiebreak: f32,
    },
    Not {
        query: Box<Query>,
        boost: f32,
    },
    AndNot {
        a: Box<Query>,
        b: Box<Query>,
        boost: f32,
    },
    Require {
        a: Box<Query>,
        b: Box<Query>,
        boost: f32,
    },
    AndMaybe {
        a: Box<Query>,
        b: Box<Query>,
        boost: f32,
    },
    /// `a` if it matches anything in the index, `b` otherwise.
    Otherwise {
        a: Box<Query>,
        b: Box<Query>,
        boost: f32,
    },
    ConstantScore {
        query: Box<Query>,
        score: f32,
    },
    Span {
        query: SpanQuery,
        boost: f32,
    },
}

impl Query {
    pub fn term(field: impl Into<String>, value: impl Into<TermValue>) -> Query {
        Query::Term {
            field: field.into(),
            value: value.into(),
            boost: 1.0,
        }
    }

    pub fn prefix(field: impl Into<String>, prefix: impl Into<String>) -> Query {
        Query::Prefix {
            field: field.into(),
            prefix: prefix.into(),
            boost: 1.0,
            constant_score: true,
        }
    }

    pub fn wildcard(field: impl Into<String>, pattern: impl Into<String>) -> Query {
        Query::Wildcard {
            field: field.into(),
            pattern: pattern.into(),
            boost: 1.0,
            constant_score: true,
        }
    }

    /// An inclusive range over raw term bytes; `None` leaves a side open.
    pub fn range(field: impl Into<String>, start: Option<&str>, end: Option<&str>) -> Query {
        Query::TermRange(TermRange::new(
            field,
            start.map(|s| s.as_bytes().to_vec()),
            end.map(|s| s.as_bytes().to_vec()),
        ))
    }

    /// An inclusive range over an integer field.
    pub fn numeric_range(field: impl Into<String>, start: Option<i64>, end: Option<i64>) -> Query {
        Query::TermRange(TermRange::new(
            field,
            start.map(|v| encode_i64(v).to_vec()),
            end.map(|v| encode_i64(v).to_vec()),
        ))
    }

    /// An inclusive range over a float field.
    pub fn float_range(field: impl Into<String>, start: Option<f64>, end: Option<f64>) -> Query {
        Query::TermRange(TermRange::new(
            field,
            start.map(|v| encode_f64(v).to_vec()),
            end.map(|v| encode_f64(v).to_vec()),
        ))
    }

    pub fn every() -> Query {
        Query::Every {
            field: None,
            boost: 1.0,
        }
    }

    pub fn every_in(field: impl Into<String>) -> Query {
        Query::Every {
            field: Some(field.into()),
            boost: 1.0,
        }
    }

    pub fn and(subqueries: Vec<Query>) -> Query {
        Query::And {
            subqueries,
            boost: 1.0,
        }
    }

    pub fn or(subqueries: Vec<Query>) -> Query {
        Query::Or {
            subqueries,
            boost: 1.0,
            strategy: OrStrategy::Auto,
        }
    }

    pub fn or_with(subqueries: Vec<Query>, strategy: OrStrategy) -> Query {
        Query::Or {
            subqueries,
            boost: 1.0,
            strategy,
        }
    }

    pub fn disjunction_max(subqueries: Vec<Query>, tiebreak: f32) -> Query {
        Query::DisjunctionMax {
            subqueries,
            boost: 1.0,
            tiebreak,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(query: Query) -> Query {
        Query::Not {
            query: Box::new(query),
            boost: 1.0,
        }
    }

    pub fn and_not(a: Query, b: Query) -> Query {
        Query::AndNot {
            a: Box::new(a),
            b: Box::new(b),
            boost: 1.0,
        }
    }

    pub fn require(a: Query, b: Query) -> Query {
        Query::Require {
            a: Box::new(a),
            b: Box::new(b),
            boost: 1.0,
        }
    }

    pub fn and_maybe(a: Query, b: Query) -> Query {
        Query::AndMaybe {
            a: Box::new(a),
            b: Box::new(b),
            boost: 1.0,
        }
    }

    pub fn otherwise(a: Query, b: Query) -> Query {
        Query::Otherwise {
            a: Box::new(a),
            b: Box::new(b),
            boost: 1.0,
        }
    }

    pub fn constant_score(query: Query, score: f32) -> Query {
        Query::ConstantScore {
            query: Box::new(query),
            score,
        }
    }

    pub fn span(query: SpanQuery) -> Query {
        Query::Span { query, boost: 1.0 }
    }

    /// The boost of this node. For `ConstantScore` it is the score.
    pub fn boost(&self) -> f32 {
        match self {
            Query::Null => 1.0,
            Query::TermRange(range) => range.boost,
            Query::ConstantScore { score, .. } => *score,
            Query::Term { boost, .. }
            | Query::Prefix { boost, .. }
            | Query::Wildcard { boost, .. }
            | Query::Every { boost, .. }
            | Query::And { boost, .. }
            | Query::Or { boost, .. }
            | Query::DisjunctionMax { boost, .. }
            | Query::Not { boost, .. }
            | Query::AndNot { boost, .. }
            | Query::Require { boost, .. }
            | Query::AndMaybe { boost, .. }
            | Query::Otherwise { boost, .. }
            | Query::Span { boost, .. } => *boost,
        }
    }

    /// A copy with its boost replaced. `Null` has no boost.
    pub fn with_boost(mut self, new_boost: f32) -> Query {
        match &mut self {
            Query::Null => {}
            Query::TermRange(range) => range.boost = new_boost,
            Query::ConstantScore { score, .. } => *score = new_boost,
            Query::Term { boost, .. }
            | Query::Prefix { boost, .. }
            | Query::Wildcard { boost, .. }
            | Query::Every { boost, .. }
            | Query::And { boost, .. }
            | Query::Or { boost, .. }
            | Query::DisjunctionMax { boost, .. }
            | Query::Not { boost, .. }
            | Query::AndNot { boost, .. }
            | Query::Require { boost, .. }
            | Query::AndMaybe { boost, .. }
            | Query::Otherwise { boost, .. }
            | Query::Span { boost, .. } => *boost = new_boost,
        }
        self
    }

    /// The field this query searches, if it searches exactly one.
    pub fn field(&self) -> Option<&str> {
        match self {
            Query::Term { field, .. }
            | Query::Prefix { field, .. }
            | Query::Wildcard { field, .. } => Some(field),
            Query::TermRange(range) => Some(&range.field),
            Query::Every { field, .. } => field.as_deref(),
            Query::Span { query, .. } => query.field(),
            _ => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            Query::Term { .. }
                | Query::Prefix { .. }
                | Query::Wildcard { .. }
                | Query::TermRange(_)
                | Query::Every { .. }
                | Query::Null
        )
    }

    /// Direct subqueries, in order.
    pub fn children(&self) -> Vec<&Query> {
        match self {
            Query::And { subqueries, .. }
            | Query::Or { subqueries, .. }
            | Query::DisjunctionMax { subqueries, .. } => subqueries.iter().collect(),
            Query::Not { query, .. } | Query::ConstantScore { query, .. } => vec![query.as_ref()],
            Query::AndNot { a, b, .. }
            | Query::Require { a, b, .. }
            | Query::AndMaybe { a, b, .. }
            | Query::Otherwise { a, b, .. } => vec![a.as_ref(), b.as_ref()],
            Query::Span { query, .. } => query.subqueries(),
            _ => Vec::new(),
        }
    }

    /// `(field, value)` of every `Term` leaf under this query, excluding
    /// terms that only appear inside a `Not`.
    pub fn terms(&self) -> Vec<(String, TermValue)> {
        let mut out = Vec::new();
        self.collect_terms(&mut out);
        out
    }

    fn collect_terms(&self, out: &mut Vec<(String, TermValue)>) {
        match self {
            Query::Term { field, value, .. } => out.push((field.clone(), value.clone())),
            Query::Not { .. } => {}
            Query::AndNot { a, .. } => a.collect_terms(out),
            Query::Span { query, .. } => query.collect_terms(out),
            _ => {
                for child in self.children() {
                    child.collect_terms(out);
                }
            }
        }
    }

    /// An estimate of the number of documents this query matches.
    pub fn estimate_size(&self, reader: &dyn IndexReader) -> Result<u64> {
        let doc_count = reader.doc_count()?;
        let size = match self {
            Query::Term { field, value, .. } => match terms::encode_term(reader, field, value)? {
                Some(term) => reader.doc_frequency(field, &term)?,
                None => 0,
            },
            Query::Prefix { field, .. }
            | Query::Wildcard { field, .. }
            | Query::TermRange(TermRange { field, .. }) => {
                let mut total = 0u64;
                for term in terms::expand(self, reader)? {
                    total += reader.doc_frequency(field, &term)?;
                }
                total
            }
            Query::Every { .. } => doc_count,
            Query::Null => 0,
            Query::And { subqueries, .. } => {
                let mut smallest = doc_count;
                for q in subqueries.iter().filter(|q| !matches!(q, Query::Not { .. })) {
                    smallest = smallest.min(q.estimate_size(reader)?);
                }
                smallest
            }
            Query::Or { subqueries, .. } | Query::DisjunctionMax { subqueries, .. } => {
                let mut total = 0u64;
                for q in subqueries {
                    total += q.estimate_size(reader)?;
                }
                total
            }
            Query::Not { query, .. } => doc_count.saturating_sub(query.estimate_size(reader)?),
            Query::AndNot { a, .. } | Query::AndMaybe { a, .. } => a.estimate_size(reader)?,
            Query::Require { a, b, .. } => a.estimate_size(reader)?.min(b.estimate_size(reader)?),
            Query::Otherwise { a, b, .. } => match a.estimate_size(reader)? {
                0 => b.estimate_size(reader)?,
                size => size,
            },
            Query::ConstantScore { query, .. } => query.estimate_size(reader)?,
            Query::Span { query, .. } => query.estimate_size(reader)?,
        };
        Ok(size.min(doc_count))
    }

    /// A lower bound of the number of documents this query matches.
    pub fn estimate_min_size(&self, reader: &dyn IndexReader) -> Result<u64> {
        let deleted = reader
            .doc_count_all()?
            .saturating_sub(reader.doc_count()?);
        Ok(match self {
            Query::Term { .. } => self.estimate_size(reader)?.saturating_sub(deleted),
            Query::Prefix { field, .. }
            | Query::Wildcard { field, .. }
            | Query::TermRange(TermRange { field, .. }) => {
                let mut largest = 0u64;
                for term in terms::expand(self, reader)? {
                    largest = largest.max(reader.doc_frequency(field, &term)?);
                }
                largest.saturating_sub(deleted)
            }
            Query::Every { field: None, .. } => reader.doc_count()?,
            Query::Or { subqueries, .. } | Query::DisjunctionMax { subqueries, .. } => {
                let mut largest = 0u64;
                for q in subqueries {
                    largest = largest.max(q.estimate_min_size(reader)?);
                }
                largest
            }
            Query::AndMaybe { a, .. } => a.estimate_min_size(reader)?,
            Query::Otherwise { a, b, .. } => match a.estimate_size(reader)? {
                0 => b.estimate_min_size(reader)?,
                _ => a.estimate_min_size(reader)?,
            },
            Query::ConstantScore { query, .. } => query.estimate_min_size(reader)?,
            // Intersections and exclusions may be empty.
            _ => 0,
        })
    }

    /// Compile this query against one segment of `searcher`.
    pub fn matcher(
        &self,
        searcher: &Searcher,
        leaf: &SegmentReader,
        context: &SearchContext,
    ) -> Result<Matcher> {
        match self {
            Query::Term { field, value, boost } => {
                terms::term_matcher(searcher, leaf, context, field, value, *boost)
            }
            Query::Prefix { .. } | Query::Wildcard { .. } | Query::TermRange(_) => {
                terms::multi_term_matcher(self, searcher, leaf, context)
            }
            Query::Every { field, boost } => terms::every_matcher(leaf, field.as_deref(), *boost),
            Query::Null => Ok(Matcher::Null),
            Query::And { subqueries, boost } => {
                compound::and_matcher(subqueries, *boost, searcher, leaf, context)
            }
            Query::Or {
                subqueries,
                boost,
                strategy,
            } => compound::or_matcher(subqueries, *boost, *strategy, searcher, leaf, context),
            Query::DisjunctionMax {
                subqueries,
                boost,
                tiebreak,
            } => compound::dismax_matcher(subqueries, *boost, *tiebreak, searcher, leaf, context),
            Query::Not { query, boost } => binary::not_matcher(query, *boost, searcher, leaf, context),
            Query::AndNot { a, b, boost } => {
                binary::and_not_matcher(a, b, *boost, searcher, leaf, context)
            }
            Query::Require { a, b, boost } => {
                binary::require_matcher(a, b, *boost, searcher, leaf, context)
            }
            Query::AndMaybe { a, b, boost } => {
                binary::and_maybe_matcher(a, b, *boost, searcher, leaf, context)
            }
            Query::Otherwise { a, b, boost } => {
                binary::otherwise_matcher(a, b, *boost, searcher, leaf, context)
            }
            Query::ConstantScore { query, score } => {
                binary::constant_matcher(query, *score, searcher, leaf, context)
            }
            Query::Span { query, boost } => Ok(boosted(
                query.matcher(searcher, leaf, context)?,
                *boost,
            )),
        }
    }
}

/// Wrap `matcher` to scale its scores, unless the boost is neutral.
pub(crate) fn boosted(matcher: Matcher, boost: f32) -> Matcher {
    if boost == 1.0 || !matcher.is_active() {
        matcher
    } else {
        BoostMatcher::new(matcher, boost)
    }
}

fn write_boost(f: &mut fmt::Formatter<'_>, boost: f32) -> fmt::Result {
    if boost != 1.0 {
        write!(f, "^{boost}")?;
    }
    Ok(())
}

fn write_joined(f: &mut fmt::Formatter<'_>, subqueries: &[Query], sep: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, q) in subqueries.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{q}")?;
    }
    f.write_str(")")
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Term { field, value, .. } => write!(f, "{field}:{value}")?,
            Query::Prefix { field, prefix, .. } => write!(f, "{field}:{prefix}*")?,
            Query::Wildcard { field, pattern, .. } => write!(f, "{field}:{pattern}")?,
            Query::TermRange(range) => write!(f, "{range}")?,
            Query::Every { field: Some(field), .. } => write!(f, "{field}:*")?,
            Query::Every { field: None, .. } => f.write_str("*")?,
            Query::Null => return f.write_str("<null>"),
            Query::And { subqueries, .. } => write_joined(f, subqueries, " AND ")?,
            Query::Or { subqueries, .. } => write_joined(f, subqueries, " OR ")?,
            Query::DisjunctionMax { subqueries, .. } => {
                f.write_str("DisMax")?;
                write_joined(f, subqueries, " ")?;
            }
            Query::Not { query, .. } => write!(f, "NOT {query}")?,
            Query::AndNot { a, b, .. } => write!(f, "({a} ANDNOT {b})")?,
            Query::Require { a, b, .. } => write!(f, "({a} REQUIRE {b})")?,
            Query::AndMaybe { a, b, .. } => write!(f, "({a} ANDMAYBE {b})")?,
            Query::Otherwise { a, b, .. } => write!(f, "({a} OTHERWISE {b})")?,
            Query::ConstantScore { query, score } => {
                return write!(f, "ConstantScore({query}, {score})");
            }
            Query::Span { query, .. } => write!(f, "{query}")?,
        }
        write_boost(f, self.boost())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let q = Query::and(vec![
            Query::term("body", "alpha"),
            Query::or(vec![Query::term("body", "beta"), Query::prefix("title", "ga")]),
            Query::not(Query::term("body", "delta")).with_boost(2.0),
        ]);
        assert_eq!(
            q.to_string(),
            "(body:alpha AND (body:beta OR title:ga*) AND NOT body:delta^2)"
        );
        assert_eq!(Query::numeric_range("n", Some(1), None).field(), Some("n"));
        assert_eq!(Query::every().to_string(), "*");
    }

    #[test]
    fn test_boost_and_children() {
        let q = Query::and_not(Query::term("a", "x"), Query::term("a", "y")).with_boost(3.0);
        assert_eq!(q.boost(), 3.0);
        assert_eq!(q.children().len(), 2);
        assert!(!q.is_leaf());
        assert!(Query::Null.with_boost(5.0) == Query::Null);
        assert_eq!(Query::constant_score(Query::every(), 4.0).boost(), 4.0);
    }

    #[test]
    fn test_terms_skip_negations() {
        let q = Query::and(vec![
            Query::term("body", "alpha"),
            Query::not(Query::term("body", "beta")),
            Query::and_not(Query::term("body", "gamma"), Query::term("body", "delta")),
        ]);
        let terms: Vec<String> = q.terms().into_iter().map(|(_, v)| v.to_string()).collect();
        assert_eq!(terms, vec!["alpha", "gamma"]);
    }
}
