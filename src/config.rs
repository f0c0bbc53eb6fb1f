//! Configuration for the garbage collector.
//!
//! Loaded from `metacat.toml` and `METACAT__`-prefixed environment
//! variables on top of the built-in defaults.

use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Which backend implementation to instantiate for a configured DSN.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// Plain relational PostgreSQL.
    Postgres,
    /// CockroachDB; speaks the Postgres wire protocol and supports
    /// bounded-staleness reads.
    Cockroach,
}

/// One backend the garbage collector sweeps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub kind: AdapterKind,
    pub dsn: String,
}

/// Sweep defaults applied by the periodic trigger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Candidates processed per page.
    pub batch_size: usize,
    /// Allowed staleness of candidate selection, on backends that support
    /// bounded-staleness reads.
    #[serde(with = "humantime_serde")]
    pub staleness_bound: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            staleness_bound: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configuration {
    /// Backends to sweep, in order. Sweeps are isolated per backend.
    pub adapters: Vec<AdapterConfig>,
    pub gc: GcConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            adapters: vec![AdapterConfig {
                kind: AdapterKind::Postgres,
                dsn: String::from("postgres://localhost/metacat"),
            }],
            gc: GcConfig::default(),
        }
    }
}

impl Configuration {
    pub fn load() -> Result<Self, Error> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file("metacat.toml"))
            .merge(Env::prefixed("METACAT__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }
}
