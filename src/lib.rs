//! Core library for Superstress.  This module wires together the session
//! client, the query codec, the per-request correlator and the round
//! runner.  It deliberately avoids any dependencies beyond those required
//! by the application to remain lightweight and easy to embed.

mod config;
pub mod client;
pub mod correlate;
pub mod query;
pub mod runner;

pub use config::AppConfig;

pub use crate::client::{ClientError, SessionClient};
pub use crate::query::{extract_filter_value, Query};
pub use crate::runner::{run_batch, run_rounds, AggregateStats, RoundStats};

use std::fmt;
use std::str::FromStr;

/// The two entity families the target API exposes.  The kind selects the
/// listing endpoint, the filter column and the identity field expected to
/// echo back in every lookup response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Dashboard,
    Dataset,
}

impl EntityKind {
    /// Listing endpoint path.  The dashboard route carries a trailing slash
    /// and the dataset route does not; the server treats them as distinct.
    pub fn list_path(&self) -> &'static str {
        match self {
            EntityKind::Dashboard => "/api/v1/dashboard/",
            EntityKind::Dataset => "/api/v1/dataset",
        }
    }

    /// Response field expected to echo the filter value.
    pub fn identity_field(&self) -> &'static str {
        match self {
            EntityKind::Dashboard => "dashboard_title",
            EntityKind::Dataset => "table_name",
        }
    }

    /// Column name used in the `eq` filter expression.  Identical to the
    /// identity field for both kinds, kept separate because the API treats
    /// them as different namespaces.
    pub fn filter_column(&self) -> &'static str {
        self.identity_field()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Dashboard => f.write_str("dashboard"),
            EntityKind::Dataset => f.write_str("dataset"),
        }
    }
}

/// Error returned when an entity kind string is not recognised.
#[derive(Debug, thiserror::Error)]
#[error("unknown entity kind '{0}', expected 'dashboard' or 'dataset'")]
pub struct UnknownEntityKind(pub String);

impl FromStr for EntityKind {
    type Err = UnknownEntityKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dashboard" => Ok(EntityKind::Dashboard),
            "dataset" => Ok(EntityKind::Dataset),
            other => Err(UnknownEntityKind(other.to_string())),
        }
    }
}

/// One record from an entity listing.  Only the identity value and the
/// numeric id are captured; everything else in the listing row is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub name: String,
    pub id: u64,
}
