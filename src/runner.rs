//! Concurrent batch dispatch and multi-round aggregation.
//!
//! One round lists the live entities, amplifies each into duplicated
//! lookup queries, fans them all out as tokio tasks and waits for every
//! task to finish before touching the round's numbers.  Round statistics
//! are the only state the in-flight tasks share, always behind one mutex,
//! so the counters are exact regardless of completion interleaving.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::correlate::verify_query;
use crate::query::Query;
use crate::{AppConfig, Entity, EntityKind, SessionClient};

/// Counters for one round, mutated concurrently by in-flight lookups.
/// `error_requests <= total_requests` holds at all times: each lookup bumps
/// the total exactly once and counts as at most one error.
#[derive(Debug, Default)]
pub struct RoundStats {
    pub total_requests: u64,
    pub error_requests: u64,
    pub mismatches: Vec<String>,
}

impl RoundStats {
    pub(crate) fn record_clean(&mut self) {
        self.total_requests += 1;
    }

    pub(crate) fn record_failed(&mut self, descriptions: Vec<String>) {
        self.total_requests += 1;
        self.error_requests += 1;
        self.mismatches.extend(descriptions);
    }

    /// Error rate for the round, or `None` when nothing was dispatched.
    pub fn error_rate(&self) -> Option<f64> {
        if self.total_requests == 0 {
            None
        } else {
            Some(self.error_requests as f64 / self.total_requests as f64)
        }
    }
}

/// Results accumulated across all rounds.  Written only by the sequential
/// round loop after each batch barrier.
#[derive(Debug, Default)]
pub struct AggregateStats {
    pub round_rates: Vec<f64>,
    pub total_requests: u64,
    pub error_requests: u64,
    pub mismatches: Vec<String>,
    pub elapsed: Duration,
}

impl AggregateStats {
    pub fn aggregate_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.error_requests as f64 / self.total_requests as f64
        }
    }

    pub fn mean_round_rate(&self) -> f64 {
        if self.round_rates.is_empty() {
            0.0
        } else {
            self.round_rates.iter().sum::<f64>() / self.round_rates.len() as f64
        }
    }

    pub fn print_summary(&self) {
        println!("\n=== Consistency Summary ===");
        println!("Total time: {:?}", self.elapsed);
        if self.total_requests == 0 {
            println!("No requests made.");
        } else {
            println!(
                "Requests: {} (errors {})",
                self.total_requests, self.error_requests
            );
            println!(
                "Aggregate error rate: {}/{} = {:.2}%",
                self.error_requests,
                self.total_requests,
                self.aggregate_rate() * 100.0
            );
        }
        for (i, rate) in self.round_rates.iter().enumerate() {
            println!("  round {}: {:.2}%", i + 1, rate * 100.0);
        }
        println!("Mean round rate: {:.2}%", self.mean_round_rate() * 100.0);
        if !self.mismatches.is_empty() {
            println!("Mismatches:");
            for desc in &self.mismatches {
                println!("  {}", desc);
            }
        }
        println!("===========================\n");
    }
}

/// Effective number of duplicated queries per entity for a nominal batch
/// size.  Dashboard batches count from 0 and dispatch `batch_size` queries;
/// dataset batches count from 1 and dispatch `batch_size - 1`.  The
/// asymmetry is inherited behavior, kept per-kind on purpose; a dataset
/// batch size of 1 dispatches nothing.
pub fn queries_per_entity(kind: EntityKind, batch_size: u64) -> u64 {
    match kind {
        EntityKind::Dashboard => batch_size,
        EntityKind::Dataset => batch_size.saturating_sub(1),
    }
}

/// Dispatch one round's worth of amplified queries and wait for all of
/// them.  Individual query outcomes are independent: a recorded error in
/// one task never cancels its siblings.  A fatal error (non-success lookup
/// status) is surfaced only after every task has resolved, so the counters
/// still account for the full batch.
pub async fn run_batch(
    client: Arc<SessionClient>,
    entities: &[Entity],
    kind: EntityKind,
    batch_size: u64,
    ignore: Arc<HashSet<String>>,
    stats: Arc<Mutex<RoundStats>>,
) -> Result<()> {
    let per_entity = queries_per_entity(kind, batch_size);
    let mut queries = Vec::with_capacity(entities.len() * per_entity as usize);
    for entity in entities {
        for _ in 0..per_entity {
            queries.push(Query::for_entity(client.base_url(), kind, &entity.name));
        }
    }
    tracing::debug!(
        queries = queries.len(),
        entities = entities.len(),
        per_entity,
        "dispatching batch"
    );

    let mut handles = Vec::with_capacity(queries.len());
    for query in queries {
        let client = client.clone();
        let ignore = ignore.clone();
        let stats = stats.clone();
        handles.push(tokio::spawn(async move {
            verify_query(&client, &query, &ignore, &stats).await
        }));
    }

    // Await everything before reporting: the batch is the barrier.
    let mut first_fatal: Option<anyhow::Error> = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_fatal.is_none() {
                    first_fatal = Some(err);
                }
            }
            Err(join_err) => {
                if first_fatal.is_none() {
                    first_fatal = Some(anyhow!("lookup task panicked: {}", join_err));
                }
            }
        }
    }
    match first_fatal {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Drive the configured number of sequential rounds and accumulate the
/// aggregate statistics.  Entities are re-listed fresh each round so the
/// test follows the live state of the server.
pub async fn run_rounds(client: Arc<SessionClient>, cfg: &AppConfig) -> Result<AggregateStats> {
    let start = Instant::now();
    let ignore = Arc::new(cfg.ignore.clone());
    let mut agg = AggregateStats::default();

    for round in 1..=cfg.rounds {
        let entities = client.list_entities(cfg.kind).await?;
        tracing::info!(
            round,
            rounds = cfg.rounds,
            entities = entities.len(),
            kind = %cfg.kind,
            "starting round"
        );

        let stats = Arc::new(Mutex::new(RoundStats::default()));
        run_batch(
            client.clone(),
            &entities,
            cfg.kind,
            cfg.batch_size,
            ignore.clone(),
            stats.clone(),
        )
        .await?;

        // All tasks have resolved, so this is the sole remaining handle.
        let round_stats = Arc::try_unwrap(stats)
            .map_err(|_| anyhow!("round statistics still shared after batch completion"))?
            .into_inner()
            .map_err(|_| anyhow!("round statistics lock poisoned"))?;

        debug_assert!(round_stats.error_requests <= round_stats.total_requests);
        match round_stats.error_rate() {
            Some(rate) => {
                tracing::info!(
                    round,
                    total = round_stats.total_requests,
                    errors = round_stats.error_requests,
                    rate = %format_args!("{:.2}%", rate * 100.0),
                    "round complete"
                );
                agg.round_rates.push(rate);
            }
            None => {
                tracing::warn!(round, "no requests were dispatched this round");
                agg.round_rates.push(0.0);
            }
        }
        agg.total_requests += round_stats.total_requests;
        agg.error_requests += round_stats.error_requests;
        agg.mismatches.extend(round_stats.mismatches);
    }

    agg.elapsed = start.elapsed();
    Ok(agg)
}
