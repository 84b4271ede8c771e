use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::core::{Account, Space};
use crate::id::Ref;

/// Engine configuration, loaded from environment variables or defaulted.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Author recorded on every transaction the engine builds.
    pub account: Ref<Account>,
    /// Space new ToDos are created in.
    pub todo_space: Ref<Space>,
    /// Space new sub-process executions are created in.
    pub execution_space: Ref<Space>,
    /// Seed for the `Random` transform; unseeded when `None`.
    pub random_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            account: Ref::from_static("core:account:System"),
            todo_space: Ref::from_static("time:space:ToDos"),
            execution_space: Ref::from_static("core:space:Workspace"),
            random_seed: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        Ok(Self {
            account: env::var("PROCESS_ACCOUNT")
                .map(Ref::new)
                .unwrap_or(defaults.account),
            todo_space: env::var("PROCESS_TODO_SPACE")
                .map(Ref::new)
                .unwrap_or(defaults.todo_space),
            execution_space: env::var("PROCESS_EXECUTION_SPACE")
                .map(Ref::new)
                .unwrap_or(defaults.execution_space),
            random_seed: env::var("PROCESS_RANDOM_SEED")
                .ok()
                .map(|seed| seed.parse::<u64>())
                .transpose()
                .context("PROCESS_RANDOM_SEED must be an unsigned integer")?,
        })
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }
}
