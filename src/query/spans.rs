//! Positional queries.

use std::fmt;

use crate::error::{Result, WhorlError};
use crate::matching::{Matcher, SpanMatcher};
use crate::query::terms::{encode_term, term_matcher};
use crate::query::{Query, TermValue};
use crate::reader::{IndexReader, SegmentReader};
use crate::search::{SearchContext, Searcher};

/// A query over term positions. Every leaf field must record positions.
#[derive(Debug, Clone, PartialEq)]
pub enum SpanQuery {
    Term {
        field: String,
        value: TermValue,
    },
    /// Spans of `query` ending at or before position `limit`.
    First {
        query: Box<SpanQuery>,
        limit: u32,
    },
    /// An `a` span and a `b` span at most `slop` positions apart.
    Near {
        a: Box<SpanQuery>,
        b: Box<SpanQuery>,
        slop: u32,
        ordered: bool,
        mindist: u32,
    },
    Or(Vec<SpanQuery>),
    /// Spans of `a` that overlap no span of `b`.
    Not {
        a: Box<SpanQuery>,
        b: Box<SpanQuery>,
    },
    /// Spans of `a` that contain a span of `b`.
    Contains {
        a: Box<SpanQuery>,
        b: Box<SpanQuery>,
    },
    /// Spans of `a` ending before the first span of `b`.
    Before {
        a: Box<SpanQuery>,
        b: Box<SpanQuery>,
    },
    /// Spans of `a` in documents that also match `b`.
    Condition {
        a: Box<SpanQuery>,
        b: Box<Query>,
    },
}

impl SpanQuery {
    pub fn term(field: impl Into<String>, value: impl Into<TermValue>) -> SpanQuery {
        SpanQuery::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn first(query: SpanQuery, limit: u32) -> SpanQuery {
        SpanQuery::First {
            query: Box::new(query),
            limit,
        }
    }

    pub fn near(a: SpanQuery, b: SpanQuery, slop: u32, ordered: bool) -> SpanQuery {
        SpanQuery::Near {
            a: Box::new(a),
            b: Box::new(b),
            slop,
            ordered,
            mindist: 1,
        }
    }

    /// Nest `queries` into `Near` nodes, each one near the span built so far.
    pub fn chain(queries: Vec<SpanQuery>, slop: u32, ordered: bool) -> SpanQuery {
        let mut iter = queries.into_iter();
        let Some(first) = iter.next() else {
            return SpanQuery::Or(Vec::new());
        };
        iter.fold(first, |acc, q| SpanQuery::near(acc, q, slop, ordered))
    }

    /// A phrase: the words in order, `slop` apart at most.
    pub fn phrase(field: &str, words: &[&str], slop: u32) -> SpanQuery {
        let terms = words.iter().map(|w| SpanQuery::term(field, *w)).collect();
        SpanQuery::chain(terms, slop, true)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(a: SpanQuery, b: SpanQuery) -> SpanQuery {
        SpanQuery::Not {
            a: Box::new(a),
            b: Box::new(b),
        }
    }

    pub fn contains(a: SpanQuery, b: SpanQuery) -> SpanQuery {
        SpanQuery::Contains {
            a: Box::new(a),
            b: Box::new(b),
        }
    }

    pub fn before(a: SpanQuery, b: SpanQuery) -> SpanQuery {
        SpanQuery::Before {
            a: Box::new(a),
            b: Box::new(b),
        }
    }

    pub fn condition(a: SpanQuery, b: Query) -> SpanQuery {
        SpanQuery::Condition {
            a: Box::new(a),
            b: Box::new(b),
        }
    }

    /// The field of the first term leaf.
    pub fn field(&self) -> Option<&str> {
        match self {
            SpanQuery::Term { field, .. } => Some(field),
            SpanQuery::First { query, .. } => query.field(),
            SpanQuery::Or(queries) => queries.first().and_then(SpanQuery::field),
            SpanQuery::Near { a, .. }
            | SpanQuery::Not { a, .. }
            | SpanQuery::Contains { a, .. }
            | SpanQuery::Before { a, .. }
            | SpanQuery::Condition { a, .. } => a.field(),
        }
    }

    /// Plain queries nested under this one.
    pub fn subqueries(&self) -> Vec<&Query> {
        match self {
            SpanQuery::Term { .. } => Vec::new(),
            SpanQuery::First { query, .. } => query.subqueries(),
            SpanQuery::Or(queries) => queries.iter().flat_map(SpanQuery::subqueries).collect(),
            SpanQuery::Near { a, b, .. }
            | SpanQuery::Contains { a, b }
            | SpanQuery::Before { a, b } => {
                let mut out = a.subqueries();
                out.extend(b.subqueries());
                out
            }
            SpanQuery::Not { a, .. } => a.subqueries(),
            SpanQuery::Condition { a, b } => {
                let mut out = a.subqueries();
                out.push(b);
                out
            }
        }
    }

    pub(crate) fn collect_terms(&self, out: &mut Vec<(String, TermValue)>) {
        match self {
            SpanQuery::Term { field, value } => out.push((field.clone(), value.clone())),
            SpanQuery::First { query, .. } => query.collect_terms(out),
            SpanQuery::Or(queries) => queries.iter().for_each(|q| q.collect_terms(out)),
            SpanQuery::Near { a, b, .. }
            | SpanQuery::Contains { a, b }
            | SpanQuery::Before { a, b } => {
                a.collect_terms(out);
                b.collect_terms(out);
            }
            SpanQuery::Not { a, .. } => a.collect_terms(out),
            SpanQuery::Condition { a, b } => {
                a.collect_terms(out);
                out.extend(b.terms());
            }
        }
    }

    pub fn estimate_size(&self, reader: &dyn IndexReader) -> Result<u64> {
        Ok(match self {
            SpanQuery::Term { field, value } => match encode_term(reader, field, value)? {
                Some(term) => reader.doc_frequency(field, &term)?,
                None => 0,
            },
            SpanQuery::First { query, .. } => query.estimate_size(reader)?,
            SpanQuery::Or(queries) => {
                let mut total = 0;
                for q in queries {
                    total += q.estimate_size(reader)?;
                }
                total
            }
            SpanQuery::Near { a, b, .. }
            | SpanQuery::Contains { a, b }
            | SpanQuery::Before { a, b } => a.estimate_size(reader)?.min(b.estimate_size(reader)?),
            SpanQuery::Not { a, .. } => a.estimate_size(reader)?,
            SpanQuery::Condition { a, b } => a.estimate_size(reader)?.min(b.estimate_size(reader)?),
        })
    }

    pub fn matcher(
        &self,
        searcher: &Searcher,
        leaf: &SegmentReader,
        context: &SearchContext,
    ) -> Result<Matcher> {
        let both = |a: &SpanQuery, b: &SpanQuery| -> Result<Option<(Matcher, Matcher)>> {
            let a = a.matcher(searcher, leaf, context)?;
            if !a.is_active() {
                return Ok(None);
            }
            let b = b.matcher(searcher, leaf, context)?;
            Ok(b.is_active().then_some((a, b)))
        };

        match self {
            SpanQuery::Term { field, value } => {
                if let Some(field_type) = leaf.schema().get_field(field)
                    && !field_type.format.has_positions()
                {
                    return Err(WhorlError::query(format!(
                        "span query on {field}, which does not record positions"
                    )));
                }
                term_matcher(searcher, leaf, context, field, value, 1.0)
            }
            SpanQuery::First { query, limit } => {
                let child = query.matcher(searcher, leaf, context)?;
                if !child.is_active() {
                    return Ok(Matcher::Null);
                }
                SpanMatcher::first(child, *limit)
            }
            SpanQuery::Near {
                a,
                b,
                slop,
                ordered,
                mindist,
            } => match both(a, b)? {
                Some((a, b)) => SpanMatcher::near(a, b, *slop, *ordered, *mindist),
                None => Ok(Matcher::Null),
            },
            SpanQuery::Or(queries) => {
                let mut acc: Option<Matcher> = None;
                for q in queries {
                    let m = q.matcher(searcher, leaf, context)?;
                    if !m.is_active() {
                        continue;
                    }
                    acc = Some(match acc {
                        Some(prev) => SpanMatcher::or(prev, m)?,
                        None => m,
                    });
                }
                Ok(acc.unwrap_or_default())
            }
            SpanQuery::Not { a, b } => {
                let a = a.matcher(searcher, leaf, context)?;
                if !a.is_active() {
                    return Ok(Matcher::Null);
                }
                let b = b.matcher(searcher, leaf, context)?;
                if b.is_active() {
                    SpanMatcher::not(a, b)
                } else {
                    Ok(a)
                }
            }
            SpanQuery::Contains { a, b } => match both(a, b)? {
                Some((a, b)) => SpanMatcher::contains(a, b),
                None => Ok(Matcher::Null),
            },
            SpanQuery::Before { a, b } => match both(a, b)? {
                Some((a, b)) => SpanMatcher::before(a, b),
                None => Ok(Matcher::Null),
            },
            SpanQuery::Condition { a, b } => {
                let a = a.matcher(searcher, leaf, context)?;
                if !a.is_active() {
                    return Ok(Matcher::Null);
                }
                let b = b.matcher(searcher, leaf, context)?;
                if !b.is_active() {
                    return Ok(Matcher::Null);
                }
                SpanMatcher::condition(a, b)
            }
        }
    }
}

impl fmt::Display for SpanQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpanQuery::Term { field, value } => write!(f, "{field}:{value}"),
            SpanQuery::First { query, limit } => write!(f, "SpanFirst({query}, {limit})"),
            SpanQuery::Near { a, b, slop, .. } => write!(f, "SpanNear({a}, {b}, slop={slop})"),
            SpanQuery::Or(queries) => {
                f.write_str("SpanOr(")?;
                for (i, q) in queries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{q}")?;
                }
                f.write_str(")")
            }
            SpanQuery::Not { a, b } => write!(f, "SpanNot({a}, {b})"),
            SpanQuery::Contains { a, b } => write!(f, "SpanContains({a}, {b})"),
            SpanQuery::Before { a, b } => write!(f, "SpanBefore({a}, {b})"),
            SpanQuery::Condition { a, b } => write!(f, "SpanCondition({a}, {b})"),
        }
    }
}
