//! Ensemble fixtures for integration tests.
//!
//! Every fixture opens its store under a fresh root prefix, so tests never
//! see each other's znodes even when they share a live ensemble.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use zkstore_core::{MemoryEnsemble, ReconnectConfig, StoreConfig, StoreError, ZkStore};

/// Enables the live tests when set to `on`, `true` or `1`.
pub const ENV_TEST_FLAG: &str = "ZKSTORE_ZOOKEEPER_TEST";
/// Connect string of the live ensemble.
pub const ENV_ENDPOINT: &str = "ZKSTORE_ZOOKEEPER_ENDPOINT";
/// Base znode under which live test roots are created.
pub const ENV_ROOT: &str = "ZKSTORE_ZOOKEEPER_ROOT";

const DEFAULT_LIVE_ENDPOINT: &str = "127.0.0.1:2181";
const DEFAULT_BASE_ROOT: &str = "/zkstore-test";

/// Installs a test-friendly subscriber honouring `RUST_LOG`. Safe to call
/// from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Whether the live-ensemble tests should run.
pub fn live_enabled() -> bool {
    std::env::var(ENV_TEST_FLAG)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "on" | "true" | "1"))
        .unwrap_or(false)
}

/// A root below `base` that no other test uses.
pub fn unique_root(base: &str, test_name: &str) -> String {
    let name: String = test_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}/{}-{}", base.trim_end_matches('/'), name, &id[..12])
}

/// Reconnect settings that keep failover tests fast.
pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay_ms: 5,
        max_delay_ms: 50,
        max_attempts: None,
        backoff_multiplier: 2.0,
        jitter_fraction: 0.1,
    }
}

/// Retries `op` while it fails with a retryable error.
pub async fn with_retries<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < attempts => {
                debug!(attempt, error = %e, "retrying");
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(10 * attempt as u64)).await;
            }
            other => return other,
        }
    }
}

/// Where a fixture's store is connected.
#[derive(Debug, Clone)]
pub enum Backend {
    /// In-process ensemble with fault injection.
    Simulated(MemoryEnsemble),
    /// A real ensemble.
    Live {
        /// Connect string.
        endpoint: String,
    },
}

/// A store opened against an ensemble under a unique root.
#[derive(Debug)]
pub struct EnsembleFixture {
    backend: Backend,
    config: StoreConfig,
    store: ZkStore,
}

impl EnsembleFixture {
    /// One simulated member.
    pub fn single_node(test_name: &str) -> Result<Self> {
        Self::simulated(MemoryEnsemble::single_node(), test_name)
    }

    /// Three simulated members.
    pub fn three_node(test_name: &str) -> Result<Self> {
        Self::simulated(MemoryEnsemble::three_node(), test_name)
    }

    fn simulated(ensemble: MemoryEnsemble, test_name: &str) -> Result<Self> {
        init_tracing();
        let config = StoreConfig {
            endpoints: ensemble.members(),
            root: unique_root(DEFAULT_BASE_ROOT, test_name),
            connection_timeout_ms: 1_000,
            operation_timeout_ms: 1_000,
            reconnect: fast_reconnect(),
            ..StoreConfig::default()
        };
        let store = ZkStore::with_connector(config.clone(), Arc::new(ensemble.clone()))?;
        Ok(Self {
            backend: Backend::Simulated(ensemble),
            config,
            store,
        })
    }

    /// A live fixture when the environment enables it, `None` otherwise.
    pub fn live_from_env(test_name: &str) -> Result<Option<Self>> {
        init_tracing();
        if !live_enabled() {
            info!("{} not set, skipping live test {}", ENV_TEST_FLAG, test_name);
            return Ok(None);
        }
        let endpoint =
            std::env::var(ENV_ENDPOINT).unwrap_or_else(|_| DEFAULT_LIVE_ENDPOINT.to_string());
        let base = std::env::var(ENV_ROOT).unwrap_or_else(|_| DEFAULT_BASE_ROOT.to_string());
        let config = StoreConfig {
            root: unique_root(&base, test_name),
            reconnect: fast_reconnect(),
            ..StoreConfig::with_endpoints(&endpoint)
        };
        let store = ZkStore::new(config.clone())?;
        info!(endpoint = %endpoint, root = %config.root, "live fixture ready");
        Ok(Some(Self {
            backend: Backend::Live { endpoint },
            config,
            store,
        }))
    }

    /// The fixture's store.
    pub fn store(&self) -> &ZkStore {
        &self.store
    }

    /// Configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Backend description.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// The simulated ensemble, if any.
    pub fn ensemble(&self) -> Option<&MemoryEnsemble> {
        match &self.backend {
            Backend::Simulated(ensemble) => Some(ensemble),
            Backend::Live { .. } => None,
        }
    }

    /// A second, independent client on the same root.
    pub fn open_client(&self) -> Result<ZkStore> {
        let store = match &self.backend {
            Backend::Simulated(ensemble) => {
                ZkStore::with_connector(self.config.clone(), Arc::new(ensemble.clone()))?
            }
            Backend::Live { .. } => ZkStore::new(self.config.clone())?,
        };
        Ok(store)
    }

    /// Removes everything below the root and closes the session.
    pub async fn teardown(self) -> Result<()> {
        with_retries(5, || self.store.delete_all("/")).await?;
        self.store.shutdown().await;
        Ok(())
    }
}
