//! Query simplification.

use crate::query::{OrStrategy, Query, TermRange, TermValue};

/// The three n-ary query kinds. Two nodes flatten into each other only when
/// their kinds are equal.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    And,
    Or(OrStrategy),
    DisMax(f32),
}

impl Kind {
    fn of(query: &Query) -> Option<Kind> {
        match query {
            Query::And { .. } => Some(Kind::And),
            Query::Or { strategy, .. } => Some(Kind::Or(*strategy)),
            Query::DisjunctionMax { tiebreak, .. } => Some(Kind::DisMax(*tiebreak)),
            _ => None,
        }
    }

    fn build(self, subqueries: Vec<Query>, boost: f32) -> Query {
        match self {
            Kind::And => Query::And { subqueries, boost },
            Kind::Or(strategy) => Query::Or {
                subqueries,
                boost,
                strategy,
            },
            Kind::DisMax(tiebreak) => Query::DisjunctionMax {
                subqueries,
                boost,
                tiebreak,
            },
        }
    }
}

fn into_parts(query: Query) -> (Vec<Query>, f32) {
    match query {
        Query::And { subqueries, boost }
        | Query::Or {
            subqueries, boost, ..
        }
        | Query::DisjunctionMax {
            subqueries, boost, ..
        } => (subqueries, boost),
        other => (vec![other], 1.0),
    }
}

/// Multiply `boost` into `query`.
fn carry(query: Query, boost: f32) -> Query {
    if boost == 1.0 {
        return query;
    }
    let own = query.boost();
    query.with_boost(own * boost)
}

fn normalize_range(range: &TermRange) -> Query {
    if range.is_empty() {
        return Query::Null;
    }
    if let Some(term) = range.single_term() {
        return Query::Term {
            field: range.field.clone(),
            value: TermValue::Encoded(term.to_vec()),
            boost: range.boost,
        };
    }
    if range.start.is_none() && range.end.is_none() {
        return Query::Every {
            field: Some(range.field.clone()),
            boost: range.boost,
        };
    }
    Query::TermRange(range.clone())
}

fn is_every(query: &Query, field: Option<&str>) -> bool {
    matches!(query, Query::Every { field: f, .. } if f.as_deref() == field)
}

/// Merge ranges on the same field: intersections under `And`, unions of
/// touching ranges under `Or`. The first pass merges into the slot of the
/// earliest range and empties the others; the second compacts the arena.
fn merge_ranges(subqueries: Vec<Query>, intersect: bool) -> Vec<Query> {
    let mut arena: Vec<Option<Query>> = subqueries.into_iter().map(Some).collect();

    for i in 0..arena.len() {
        let Some(Query::TermRange(mut merged)) = arena[i].clone() else {
            continue;
        };
        let mut changed = true;
        while changed {
            changed = false;
            for slot in arena.iter_mut().skip(i + 1) {
                let Some(Query::TermRange(other)) = slot else {
                    continue;
                };
                if other.field != merged.field {
                    continue;
                }
                if intersect {
                    merged = merged.intersect(other);
                } else if merged.touches(other) {
                    merged = merged.union(other);
                } else {
                    continue;
                }
                *slot = None;
                changed = true;
            }
        }
        arena[i] = Some(Query::TermRange(merged));
    }

    arena
        .into_iter()
        .flatten()
        .map(|q| match q {
            Query::TermRange(range) => normalize_range(&range),
            other => other,
        })
        .collect()
}

fn normalize_compound(kind: Kind, subqueries: &[Query], boost: f32) -> Query {
    let mut flat = Vec::with_capacity(subqueries.len());
    for query in subqueries {
        let query = query.normalize();
        if Kind::of(&query) == Some(kind) {
            let (children, child_boost) = into_parts(query);
            flat.extend(children.into_iter().map(|c| carry(c, child_boost)));
        } else {
            flat.push(query);
        }
    }

    if kind == Kind::And && flat.iter().any(|q| *q == Query::Null) {
        return Query::Null;
    }
    flat.retain(|q| *q != Query::Null);

    let positive = |q: &Query| !matches!(q, Query::Not { .. } | Query::Every { .. });
    if kind == Kind::And {
        // Every is implied by any other positive clause.
        if flat.iter().any(positive) {
            let fields: Vec<String> = flat
                .iter()
                .filter(|q| positive(*q))
                .filter_map(|q| q.field().map(str::to_string))
                .collect();
            flat.retain(|q| match q {
                Query::Every { field: None, .. } => false,
                Query::Every { field: Some(f), .. } => !fields.contains(f),
                _ => true,
            });
        }
    } else {
        if let Some(every) = flat.iter().find(|q| is_every(q, None)) {
            return carry(every.clone(), boost);
        }
        // Every document with a term in a field covers any query on it.
        let fields: Vec<String> = flat
            .iter()
            .filter_map(|q| match q {
                Query::Every { field: Some(f), .. } => Some(f.clone()),
                _ => None,
            })
            .collect();
        flat.retain(|q| {
            matches!(q, Query::Every { .. })
                || !q.field().is_some_and(|f| fields.iter().any(|e| e == f))
        });
    }

    let mut flat = match kind {
        Kind::And => merge_ranges(flat, true),
        Kind::Or(_) => merge_ranges(flat, false),
        Kind::DisMax(_) => flat,
    };
    if kind == Kind::And && flat.iter().any(|q| *q == Query::Null) {
        return Query::Null;
    }
    flat.retain(|q| *q != Query::Null);

    let mut unique: Vec<Query> = Vec::with_capacity(flat.len());
    for query in flat {
        if !unique.contains(&query) {
            unique.push(query);
        }
    }

    match unique.len() {
        0 => Query::Null,
        1 => carry(unique.remove(0), boost),
        _ => kind.build(unique, boost),
    }
}

impl Query {
    /// An equivalent query with redundant structure removed: nested
    /// compounds of the same kind are flattened, `Null` clauses are dropped
    /// or propagated, overlapping ranges are merged, duplicates are removed
    /// and single-clause compounds collapse into their clause.
    pub fn normalize(&self) -> Query {
        match self {
            Query::TermRange(range) => normalize_range(range),
            Query::And { subqueries, boost } => normalize_compound(Kind::And, subqueries, *boost),
            Query::Or {
                subqueries,
                boost,
                strategy,
            } => normalize_compound(Kind::Or(*strategy), subqueries, *boost),
            Query::DisjunctionMax {
                subqueries,
                boost,
                tiebreak,
            } => normalize_compound(Kind::DisMax(*tiebreak), subqueries, *boost),
            Query::Not { query, boost } => match query.normalize() {
                Query::Null => Query::Every {
                    field: None,
                    boost: *boost,
                },
                query => Query::Not {
                    query: Box::new(query),
                    boost: *boost,
                },
            },
            Query::AndNot { a, b, boost } => match (a.normalize(), b.normalize()) {
                (Query::Null, _) => Query::Null,
                (a, Query::Null) => carry(a, *boost),
                (a, b) if a == b => Query::Null,
                (a, b) => Query::AndNot {
                    a: Box::new(a),
                    b: Box::new(b),
                    boost: *boost,
                },
            },
            Query::Require { a, b, boost } => match (a.normalize(), b.normalize()) {
                (Query::Null, _) | (_, Query::Null) => Query::Null,
                (a, b) => Query::Require {
                    a: Box::new(a),
                    b: Box::new(b),
                    boost: *boost,
                },
            },
            Query::AndMaybe { a, b, boost } => match (a.normalize(), b.normalize()) {
                (Query::Null, _) => Query::Null,
                (a, Query::Null) => carry(a, *boost),
                (a, b) => Query::AndMaybe {
                    a: Box::new(a),
                    b: Box::new(b),
                    boost: *boost,
                },
            },
            Query::Otherwise { a, b, boost } => match (a.normalize(), b.normalize()) {
                (Query::Null, b) => carry(b, *boost),
                (a, Query::Null) => carry(a, *boost),
                (a, b) => Query::Otherwise {
                    a: Box::new(a),
                    b: Box::new(b),
                    boost: *boost,
                },
            },
            Query::ConstantScore { query, score } => match query.normalize() {
                Query::Null => Query::Null,
                query => Query::ConstantScore {
                    query: Box::new(query),
                    score: *score,
                },
            },
            _ => self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(text: &str) -> Query {
        Query::term("body", text)
    }

    #[test]
    fn test_flatten_and_collapse() {
        let q = Query::and(vec![
            t("a"),
            Query::and(vec![t("b"), t("c")]).with_boost(2.0),
            Query::Null,
        ]);
        assert_eq!(q.normalize(), Query::Null);

        let q = Query::or(vec![
            t("a"),
            Query::or(vec![t("b"), Query::Null]).with_boost(2.0),
        ]);
        assert_eq!(
            q.normalize(),
            Query::or(vec![t("a"), t("b").with_boost(2.0)])
        );

        let q = Query::and(vec![Query::or(vec![t("a"), Query::Null]).with_boost(3.0)]).with_boost(2.0);
        assert_eq!(q.normalize(), t("a").with_boost(6.0));
        assert_eq!(Query::or(vec![]).normalize(), Query::Null);
    }

    #[test]
    fn test_dedup() {
        let q = Query::or(vec![t("a"), t("b"), t("a")]);
        assert_eq!(q.normalize(), Query::or(vec![t("a"), t("b")]));
    }

    #[test]
    fn test_every_rules() {
        let q = Query::or(vec![t("a"), Query::every()]);
        assert_eq!(q.normalize(), Query::every());

        let q = Query::and(vec![t("a"), Query::every()]);
        assert_eq!(q.normalize(), t("a"));

        let q = Query::or(vec![t("a"), Query::every_in("body"), Query::term("tag", "x")]);
        assert_eq!(
            q.normalize(),
            Query::or(vec![Query::every_in("body"), Query::term("tag", "x")])
        );

        assert_eq!(Query::not(Query::Null).normalize(), Query::every());
    }

    #[test]
    fn test_range_merging() {
        let q = Query::and(vec![
            Query::range("f", Some("a"), Some("m")),
            t("x"),
            Query::range("f", Some("k"), Some("z")),
        ]);
        assert_eq!(
            q.normalize(),
            Query::and(vec![Query::range("f", Some("k"), Some("m")), t("x")])
        );

        let q = Query::or(vec![
            Query::range("f", Some("a"), Some("c")),
            Query::range("f", Some("x"), Some("z")),
            Query::range("f", Some("b"), Some("y")),
        ]);
        assert_eq!(q.normalize(), Query::range("f", Some("a"), Some("z")));

        let q = Query::and(vec![
            Query::range("f", Some("a"), Some("c")),
            Query::range("f", Some("x"), Some("z")),
        ]);
        assert_eq!(q.normalize(), Query::Null);

        assert_eq!(
            Query::range("f", Some("q"), Some("q")).normalize(),
            Query::Term {
                field: "f".to_string(),
                value: TermValue::Encoded(b"q".to_vec()),
                boost: 1.0,
            }
        );
        assert_eq!(Query::range("f", None, None).normalize(), Query::every_in("f"));
    }

    #[test]
    fn test_binary_rules() {
        assert_eq!(Query::and_not(t("a"), Query::Null).normalize(), t("a"));
        assert_eq!(Query::and_not(t("a"), t("a")).normalize(), Query::Null);
        assert_eq!(Query::otherwise(Query::Null, t("b")).normalize(), t("b"));
        assert_eq!(Query::require(t("a"), Query::Null).normalize(), Query::Null);
        assert_eq!(
            Query::and_maybe(t("a"), Query::or(vec![])).with_boost(2.0).normalize(),
            t("a").with_boost(2.0)
        );
        assert_eq!(
            Query::constant_score(Query::and(vec![Query::Null]), 1.0).normalize(),
            Query::Null
        );
    }
}
