//! Query construction and the filter-literal extractor.
//!
//! Filter lookups use the compact expression syntax the API expects in its
//! `q` parameter: `(filters:!((col:<col>,opr:eq,value:<literal>)))`, where
//! the literal is bare when it looks like an identifier and single-quoted
//! otherwise.  Listing calls use plain JSON in `q` instead.
//!
//! The extractor is the inverse of the encoder for the supported literal
//! grammar: one or more of alphanumerics, whitespace, colon, underscore,
//! hyphen and dot, with optional surrounding single quotes.  Anything
//! outside that grammar is not extractable and callers must treat it as a
//! recoverable error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use crate::EntityKind;

/// One lookup request destined for the API: a listing URL plus an encoded
/// equality filter on the kind's identity column.
#[derive(Debug, Clone)]
pub struct Query {
    pub url: String,
    pub q: String,
    pub kind: EntityKind,
}

impl Query {
    /// Build the amplified lookup query for one entity.  Every duplicate in
    /// a batch is constructed through here so request and expectation always
    /// agree.
    pub fn for_entity(base_url: &str, kind: EntityKind, name: &str) -> Self {
        Query {
            url: format!("{}{}", base_url, kind.list_path()),
            q: encode_eq_filter(kind.filter_column(), name),
            kind,
        }
    }
}

/// Encode a single `col eq value` filter in the API's expression syntax.
pub fn encode_eq_filter(col: &str, value: &str) -> String {
    format!(
        "(filters:!((col:{},opr:eq,value:{})))",
        col,
        encode_literal(value)
    )
}

/// JSON `q` expression for a listing call: identity column plus id, first
/// page, fixed page size of 1000.
pub fn listing_expr(kind: EntityKind) -> String {
    json!({
        "columns": [kind.identity_field(), "id"],
        "page": 0,
        "page_size": 1000,
    })
    .to_string()
}

/// Literals that read as identifiers go bare; everything else is wrapped in
/// single quotes with `!` and `'` escaped the way the expression syntax
/// requires.
fn encode_literal(value: &str) -> String {
    let bare = !value.is_empty()
        && value
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if bare {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '!' => out.push_str("!!"),
            '\'' => out.push_str("!'"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

static FILTER_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"value:'?([0-9A-Za-z:_\-\. ]+)'?").expect("static regex"));

/// Recover the filter literal from an encoded expression.  Tolerates both
/// quoted and unquoted literals.  Returns `None` when no literal within the
/// supported grammar is present.
pub fn extract_filter_value(q: &str) -> Option<String> {
    FILTER_VALUE
        .captures(q)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
