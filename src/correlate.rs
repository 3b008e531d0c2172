//! Request/response correlation for one amplified lookup.
//!
//! Each concurrent task funnels through [`verify_query`]: recover the
//! expected identity value from the query's own filter expression, issue
//! the request, then check that the response echoes the same value back.
//! A non-success HTTP status is fatal and aborts the whole run; every
//! other problem (transport error, malformed body, anomalous result
//! count, identity mismatch) is recorded into the shared round statistics
//! and never propagates, so sibling requests keep running.

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::query::{extract_filter_value, Query};
use crate::runner::RoundStats;
use crate::{EntityKind, SessionClient};

/// Run one lookup and record its outcome.  The total-request counter is
/// bumped exactly once per call on every non-fatal path; a request counts
/// as at most one error no matter how many anomalies it exhibits.
pub async fn verify_query(
    client: &SessionClient,
    query: &Query,
    ignore: &HashSet<String>,
    stats: &Mutex<RoundStats>,
) -> Result<()> {
    let expected = match extract_filter_value(&query.q) {
        Some(value) => value,
        None => {
            tracing::warn!(q = %query.q, "filter expression has no extractable value");
            record_failed(
                stats,
                vec![format!("no extractable filter value in '{}'", query.q)],
            );
            return Ok(());
        }
    };

    let resp = match client.lookup(query).await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(entity = %expected, error = %err, "lookup request failed");
            record_failed(
                stats,
                vec![format!("request for '{}' failed: {}", expected, err)],
            );
            return Ok(());
        }
    };

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow!(
            "lookup for '{}' returned {}: {}",
            expected,
            status,
            body
        ));
    }

    let body: Value = match resp.json().await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(entity = %expected, error = %err, "lookup body unreadable");
            record_failed(
                stats,
                vec![format!("body for '{}' unreadable: {}", expected, err)],
            );
            return Ok(());
        }
    };

    let descriptions = check_response(query.kind, &expected, &body, ignore);
    if descriptions.is_empty() {
        tracing::debug!(entity = %expected, "response consistent");
        stats
            .lock()
            .expect("round statistics lock poisoned")
            .record_clean();
    } else {
        for desc in &descriptions {
            tracing::warn!(entity = %expected, "{}", desc);
        }
        record_failed(stats, descriptions);
    }
    Ok(())
}

/// Compare a decoded lookup body against the expected identity value.
/// Returns the anomaly descriptions, empty when the response is consistent.
/// Pure so the correlation rules are testable without HTTP.
pub fn check_response(
    kind: EntityKind,
    expected: &str,
    body: &Value,
    ignore: &HashSet<String>,
) -> Vec<String> {
    let mut descriptions = Vec::new();

    let result = match body.get("result").and_then(Value::as_array) {
        Some(result) => result,
        None => {
            descriptions.push(format!(
                "response for '{}' has no result list: {}",
                expected, body
            ));
            return descriptions;
        }
    };

    if result.len() != 1 {
        descriptions.push(format!(
            "response for '{}' has {} results, expected 1",
            expected,
            result.len()
        ));
    }

    if let Some(first) = result.first() {
        match first.get(kind.identity_field()).and_then(Value::as_str) {
            Some(actual) => {
                if actual != expected && !ignore.contains(expected) {
                    descriptions.push(format!(
                        "identity mismatch: requested '{}', got '{}'",
                        expected, actual
                    ));
                }
            }
            None => {
                descriptions.push(format!(
                    "result for '{}' missing field '{}'",
                    expected,
                    kind.identity_field()
                ));
            }
        }
    }

    descriptions
}

fn record_failed(stats: &Mutex<RoundStats>, descriptions: Vec<String>) {
    stats
        .lock()
        .expect("round statistics lock poisoned")
        .record_failed(descriptions);
}
