//! Query and aggregation expression building.
//!
//! Stateless constructors producing BSON filter and aggregation fragments.
//! Every function takes a field name (or sub-expressions) plus typed values
//! and returns an immutable document node; expressions compose by nesting and
//! multi-condition calls preserve argument order.
//!
//! Two semantics here are deliberate and non-obvious:
//!
//! - [`eq`] on a text value matches case-insensitively via an anchored regex,
//!   not by literal equality. `eq("name", "Foo")` matches `"foo"` and `"FOO"`
//!   but not `"Foobar"`.
//! - [`contains`] is case- and diacritic-insensitive by default, while
//!   [`not_contains`] is case- and diacritic-sensitive by default. The
//!   asymmetry is intentional and must not be unified.
//!
//! # Example
//!
//! ```rust,ignore
//! use corral::expr;
//!
//! let filter = expr::and(vec![
//!     expr::eq("status", "active"),
//!     expr::contains("name", "jose"),
//!     expr::gte("age", 18),
//! ]);
//! ```

use bson::{Bson, Document, doc};

/// Single-field node; field names are caller data, so they cannot go through
/// the `doc!` macro's literal keys.
fn node(field: &str, value: impl Into<Bson>) -> Document {
    let mut doc = Document::new();
    doc.insert(field, value);
    doc
}

fn field_ref(field: &str) -> String {
    format!("${}", field)
}

/// Escape regex metacharacters in a literal search term.
fn escape(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(
            c,
            '.' | '^' | '$' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\'
                | '/'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Character class covering the accented variants of a base letter, or `None`
/// for characters without variants.
fn accent_class(c: char) -> Option<&'static str> {
    Some(match c {
        'a' => "[aàáâãäåāăą]",
        'c' => "[cçćĉċč]",
        'd' => "[dďđ]",
        'e' => "[eèéêëēĕėęě]",
        'g' => "[gĝğġģ]",
        'i' => "[iìíîïĩīĭįı]",
        'l' => "[lĺļľłŀ]",
        'n' => "[nñńņň]",
        'o' => "[oòóôõöøōŏő]",
        'r' => "[rŕŗř]",
        's' => "[sśŝşš]",
        't' => "[tţťŧ]",
        'u' => "[uùúûüũūŭůűų]",
        'y' => "[yýÿŷ]",
        'z' => "[zźżž]",
        'A' => "[AÀÁÂÃÄÅĀĂĄ]",
        'C' => "[CÇĆĈĊČ]",
        'D' => "[DĎĐ]",
        'E' => "[EÈÉÊËĒĔĖĘĚ]",
        'G' => "[GĜĞĠĢ]",
        'I' => "[IÌÍÎÏĨĪĬĮİ]",
        'L' => "[LĹĻĽŁĿ]",
        'N' => "[NÑŃŅŇ]",
        'O' => "[OÒÓÔÕÖØŌŎŐ]",
        'R' => "[RŔŖŘ]",
        'S' => "[SŚŜŞŠ]",
        'T' => "[TŢŤŦ]",
        'U' => "[UÙÚÛÜŨŪŬŮŰŲ]",
        'Y' => "[YÝŸŶ]",
        'Z' => "[ZŹŻŽ]",
        _ => return None,
    })
}

/// Expand a literal search term so each base letter matches its accented
/// variants; characters without variants are escaped literally.
fn accent_insensitive(term: &str) -> String {
    let mut out = String::with_capacity(term.len() * 4);
    for c in term.chars() {
        match accent_class(c) {
            Some(class) => out.push_str(class),
            None => out.push_str(&escape(&c.to_string())),
        }
    }
    out
}

/// Equality condition.
///
/// Text values match case-insensitively through an anchored regex; all other
/// values use literal equality.
pub fn eq(field: &str, value: impl Into<Bson>) -> Document {
    match value.into() {
        Bson::String(s) => node(
            field,
            doc! { "$regex": format!("^{}$", escape(&s)), "$options": "i" },
        ),
        other => node(field, other),
    }
}

/// Not-equal condition.
pub fn ne(field: &str, value: impl Into<Bson>) -> Document {
    node(field, doc! { "$ne": value.into() })
}

/// Greater-than condition.
pub fn gt(field: &str, value: impl Into<Bson>) -> Document {
    node(field, doc! { "$gt": value.into() })
}

/// Greater-than-or-equal condition.
pub fn gte(field: &str, value: impl Into<Bson>) -> Document {
    node(field, doc! { "$gte": value.into() })
}

/// Less-than condition.
pub fn lt(field: &str, value: impl Into<Bson>) -> Document {
    node(field, doc! { "$lt": value.into() })
}

/// Less-than-or-equal condition.
pub fn lte(field: &str, value: impl Into<Bson>) -> Document {
    node(field, doc! { "$lte": value.into() })
}

/// Substring match, case- and diacritic-insensitive.
pub fn contains(field: &str, term: &str) -> Document {
    contains_with(field, term, false, false)
}

/// Substring match with explicit case and diacritic sensitivity.
pub fn contains_with(
    field: &str,
    term: &str,
    case_sensitive: bool,
    diacritic_sensitive: bool,
) -> Document {
    let body = if diacritic_sensitive {
        escape(term)
    } else {
        accent_insensitive(term)
    };
    let mut regex = doc! { "$regex": format!(".*{}.*", body) };
    if !case_sensitive {
        regex.insert("$options", "i");
    }
    node(field, regex)
}

/// Negated substring match, case- and diacritic-SENSITIVE.
///
/// Deliberately asymmetric with [`contains`]: the negated form wraps a plain
/// `.*term.*` regex in `$not` with no accent expansion.
pub fn not_contains(field: &str, term: &str) -> Document {
    not_contains_with(field, term, true)
}

/// Negated substring match with explicit case sensitivity.
pub fn not_contains_with(field: &str, term: &str, case_sensitive: bool) -> Document {
    let mut regex = doc! { "$regex": format!(".*{}.*", escape(term)) };
    if !case_sensitive {
        regex.insert("$options", "i");
    }
    node(field, doc! { "$not": regex })
}

/// Array condition: the stored array contains every provided value,
/// order-independent, extra elements permitted.
pub fn all(field: &str, values: Vec<impl Into<Bson>>) -> Document {
    let values: Vec<Bson> = values.into_iter().map(Into::into).collect();
    node(field, doc! { "$all": values })
}

/// Membership condition: the stored scalar is one of the provided values.
pub fn in_array(field: &str, values: Vec<impl Into<Bson>>) -> Document {
    let values: Vec<Bson> = values.into_iter().map(Into::into).collect();
    node(field, doc! { "$in": values })
}

/// Non-membership condition: the stored scalar is none of the provided values.
pub fn not_in(field: &str, values: Vec<impl Into<Bson>>) -> Document {
    let values: Vec<Bson> = values.into_iter().map(Into::into).collect();
    node(field, doc! { "$nin": values })
}

/// Array element condition: at least one element satisfies the full
/// conjunction of the sub-expressions simultaneously.
pub fn elem_match(field: &str, conditions: Vec<Document>) -> Document {
    node(field, doc! { "$elemMatch": { "$and": conditions } })
}

/// Logical AND over zero or more expressions.
///
/// Callers are responsible for non-empty input; an empty vector builds a
/// syntactically valid node whose evaluation is store-defined.
pub fn and(conditions: Vec<Document>) -> Document {
    doc! { "$and": conditions }
}

/// Logical OR over zero or more expressions.
///
/// Same empty-input caveat as [`and`].
pub fn or(conditions: Vec<Document>) -> Document {
    doc! { "$or": conditions }
}

/// Conditional aggregation expression.
pub fn cond(
    if_expr: impl Into<Bson>,
    then_expr: impl Into<Bson>,
    else_expr: impl Into<Bson>,
) -> Document {
    doc! {
        "$cond": {
            "if": if_expr.into(),
            "then": then_expr.into(),
            "else": else_expr.into(),
        }
    }
}

/// Null-coalescing aggregation expression.
pub fn if_null(expression: impl Into<Bson>, fallback: impl Into<Bson>) -> Document {
    doc! { "$ifNull": [expression.into(), fallback.into()] }
}

/// Array length of a field, as an aggregation expression.
pub fn size(field: &str) -> Document {
    doc! { "$size": field_ref(field) }
}

/// Indexed access into an array field, as an aggregation expression.
pub fn array_elem_at(field: &str, index: i32) -> Document {
    doc! { "$arrayElemAt": [field_ref(field), index] }
}

/// Aggregation equality between two expressions (literal, no regex).
pub fn eq_aggregation(left: impl Into<Bson>, right: impl Into<Bson>) -> Document {
    doc! { "$eq": [left.into(), right.into()] }
}

/// Raw aggregation-expression escape hatch.
pub fn expr(expression: Document) -> Document {
    doc! { "$expr": expression }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_eq_string_is_anchored_case_insensitive_regex() {
        let filter = eq("name", "Foo");
        assert_eq!(
            filter,
            doc! { "name": { "$regex": "^Foo$", "$options": "i" } }
        );
    }

    #[test]
    fn test_eq_string_escapes_metacharacters() {
        let filter = eq("path", "a.b/c$");
        assert_eq!(
            filter,
            doc! { "path": { "$regex": "^a\\.b\\/c\\$$", "$options": "i" } }
        );
    }

    #[test]
    fn test_eq_non_string_is_literal() {
        assert_eq!(eq("age", 30), doc! { "age": 30 });
        assert_eq!(eq("active", true), doc! { "active": true });
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(ne("a", 1), doc! { "a": { "$ne": 1 } });
        assert_eq!(gt("a", 1), doc! { "a": { "$gt": 1 } });
        assert_eq!(gte("a", 1), doc! { "a": { "$gte": 1 } });
        assert_eq!(lt("a", 1), doc! { "a": { "$lt": 1 } });
        assert_eq!(lte("a", 1), doc! { "a": { "$lte": 1 } });
    }

    #[test]
    fn test_contains_default_expands_accents_and_ignores_case() {
        let filter = contains("name", "jose");
        let regex = filter.get_document("name").unwrap();
        let pattern = regex.get_str("$regex").unwrap();

        assert!(pattern.contains("[eèéêëēĕėęě]"));
        assert!(pattern.contains("[oòóôõöøōŏő]"));
        assert!(pattern.starts_with(".*"));
        assert!(pattern.ends_with(".*"));
        assert_eq!(regex.get_str("$options").unwrap(), "i");
    }

    #[test]
    fn test_contains_fully_sensitive_is_plain_escaped_regex() {
        let filter = contains_with("name", "josé", true, true);
        assert_eq!(filter, doc! { "name": { "$regex": ".*josé.*" } });
    }

    #[test]
    fn test_contains_case_sensitive_diacritic_insensitive() {
        let filter = contains_with("name", "Jose", true, false);
        let regex = filter.get_document("name").unwrap();
        let pattern = regex.get_str("$regex").unwrap();

        // Lowercase letters expand within their own case only.
        assert!(pattern.contains('J'));
        assert!(pattern.contains("[eèéêëēĕėęě]"));
        assert!(!regex.contains_key("$options"));
    }

    #[test]
    fn test_not_contains_is_sensitive_by_default() {
        let filter = not_contains("name", "jose");
        assert_eq!(
            filter,
            doc! { "name": { "$not": { "$regex": ".*jose.*" } } }
        );
    }

    #[test]
    fn test_not_contains_with_case_insensitive() {
        let filter = not_contains_with("name", "jose", false);
        assert_eq!(
            filter,
            doc! { "name": { "$not": { "$regex": ".*jose.*", "$options": "i" } } }
        );
    }

    #[test]
    fn test_set_conditions() {
        assert_eq!(
            all("tags", vec!["a", "b"]),
            doc! { "tags": { "$all": ["a", "b"] } }
        );
        assert_eq!(
            in_array("status", vec!["active", "pending"]),
            doc! { "status": { "$in": ["active", "pending"] } }
        );
        assert_eq!(
            not_in("status", vec!["deleted"]),
            doc! { "status": { "$nin": ["deleted"] } }
        );
    }

    #[test]
    fn test_elem_match_is_a_conjunction() {
        let filter = elem_match(
            "items",
            vec![doc! { "sku": "x" }, doc! { "qty": { "$gt": 2 } }],
        );
        assert_eq!(
            filter,
            doc! {
                "items": {
                    "$elemMatch": {
                        "$and": [ { "sku": "x" }, { "qty": { "$gt": 2 } } ]
                    }
                }
            }
        );
    }

    #[test]
    fn test_and_or_preserve_order() {
        let filter = and(vec![doc! { "a": 1 }, doc! { "b": 2 }]);
        assert_eq!(filter, doc! { "$and": [ { "a": 1 }, { "b": 2 } ] });

        let filter = or(vec![doc! { "a": 1 }, doc! { "b": 2 }]);
        assert_eq!(filter, doc! { "$or": [ { "a": 1 }, { "b": 2 } ] });
    }

    #[test]
    fn test_and_empty_is_vacuous_but_valid() {
        let filter = and(Vec::new());
        assert_eq!(filter, doc! { "$and": [] });
    }

    #[test]
    fn test_aggregation_wrappers() {
        assert_eq!(
            cond(doc! { "$gte": ["$age", 18] }, "adult", "minor"),
            doc! {
                "$cond": {
                    "if": { "$gte": ["$age", 18] },
                    "then": "adult",
                    "else": "minor",
                }
            }
        );
        assert_eq!(
            if_null("$nickname", "$name"),
            doc! { "$ifNull": ["$nickname", "$name"] }
        );
        assert_eq!(size("tags"), doc! { "$size": "$tags" });
        assert_eq!(
            array_elem_at("tags", 0),
            doc! { "$arrayElemAt": ["$tags", 0] }
        );
        assert_eq!(
            eq_aggregation("$a", "$b"),
            doc! { "$eq": ["$a", "$b"] }
        );
        assert_eq!(
            expr(doc! { "$eq": ["$a", "$b"] }),
            doc! { "$expr": { "$eq": ["$a", "$b"] } }
        );
    }
}
