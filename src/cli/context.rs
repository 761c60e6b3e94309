use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::OutpostConfig;
use crate::core::inbox::InboxManager;
use crate::core::outbox::OutboxManager;
use crate::core::policy::{
    CoordinatorConfig, PolicyCoordinator, PolicyResultStore, ShellStepExecutor,
};
use crate::core::store::{HealthConfig, RecordStore, StoreOptions};
use crate::core::sweeper::MaintenanceSweeper;
use crate::core::vault::{CredentialVault, VaultCodec};

pub const DB_FILE: &str = "outpost.db";
pub const LOG_FILE: &str = "outpost.log";

/// Everything a command needs, opened against the local data directory.
pub(crate) struct Services {
    pub config: OutpostConfig,
    pub data_dir: PathBuf,
    pub store: RecordStore,
    pub clock: Arc<dyn Clock>,
    pub outbox: OutboxManager,
    pub inbox: InboxManager,
    pub results: PolicyResultStore,
}

impl Services {
    pub fn open(data_dir: PathBuf, config: OutpostConfig) -> Result<Self> {
        let store = RecordStore::open(
            &data_dir.join(DB_FILE),
            StoreOptions {
                busy_timeout: config.busy_timeout(),
                health: HealthConfig::default(),
            },
        )
        .with_context(|| format!("failed to open record store in {}", data_dir.display()))?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let outbox = OutboxManager::new(store.clone(), clock.clone());
        let inbox = InboxManager::new(store.clone(), clock.clone(), config.default_ttl());
        let results = PolicyResultStore::new(store.clone());

        Ok(Self {
            config,
            data_dir,
            store,
            clock,
            outbox,
            inbox,
            results,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent.agent_id
    }

    pub fn sweeper(&self) -> MaintenanceSweeper {
        MaintenanceSweeper::new(
            self.store.clone(),
            self.inbox.clone(),
            self.outbox.clone(),
            self.results.clone(),
            self.clock.clone(),
            self.config.retention(),
        )
    }

    pub fn coordinator(&self) -> PolicyCoordinator {
        PolicyCoordinator::new(
            self.inbox.clone(),
            self.outbox.clone(),
            self.results.clone(),
            Arc::new(ShellStepExecutor),
            self.clock.clone(),
            CoordinatorConfig {
                batch_size: self.config.limits.inbox_batch_size,
                step_timeout: self.config.step_timeout(),
            },
        )
    }

    /// Derives the vault key from the environment secret.
    pub fn vault(&self) -> Result<CredentialVault> {
        let codec = VaultCodec::from_env()?;
        Ok(CredentialVault::new(
            self.store.clone(),
            Arc::new(codec),
            self.clock.clone(),
        ))
    }
}
