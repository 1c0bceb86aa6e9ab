use std::env;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;

/// Queue depth above which a warning is logged once per crossing.
pub const DEFAULT_QUEUE_WARN_DEPTH: usize = 1_000;

/// What the store does when a slice reducer panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefectPolicy {
    /// Log the defect and abort the process.
    #[default]
    Abort,
    /// Log the defect, keep the last good state and tear the store down.
    Halt,
}

impl FromStr for DefectPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(DefectPolicy::Abort),
            "halt" => Ok(DefectPolicy::Halt),
            other => Err(anyhow!("unknown defect policy '{}'", other)),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub defect_policy: DefectPolicy,
    pub queue_warn_depth: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            defect_policy: DefectPolicy::default(),
            queue_warn_depth: DEFAULT_QUEUE_WARN_DEPTH,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defect_policy = match env::var("STATECRAFT_DEFECT_POLICY") {
            Ok(value) => value
                .parse()
                .context("STATECRAFT_DEFECT_POLICY must be 'abort' or 'halt'")?,
            Err(_) => DefectPolicy::default(),
        };

        Ok(Self {
            defect_policy,
            queue_warn_depth: env::var("STATECRAFT_QUEUE_WARN_DEPTH")
                .unwrap_or_else(|_| DEFAULT_QUEUE_WARN_DEPTH.to_string())
                .parse()
                .context("STATECRAFT_QUEUE_WARN_DEPTH must be a valid number")?,
        })
    }

    pub fn with_defect_policy(mut self, policy: DefectPolicy) -> Self {
        self.defect_policy = policy;
        self
    }

    pub fn with_queue_warn_depth(mut self, depth: usize) -> Self {
        self.queue_warn_depth = depth;
        self
    }
}
