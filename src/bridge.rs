use crate::cache::{CachedReading, ReadingCache};
use crate::catalog::DeviceCatalog;
use crate::client::CloudClient;
use crate::config::BridgeConfig;
use crate::coordinator::{AccountCoordinator, AccountStatus, CycleOutcome, RefreshRequest};
use crate::error::{CloudError, CloudResult};
use crate::model::{Device, Reading};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;

/// Per-device and per-account updates pushed to the host platform.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    DeviceDiscovered {
        account_id: String,
        device: Device,
    },
    DeviceRemoved {
        account_id: String,
        serial: String,
    },
    /// Current reading for a meter. `stale` means the value predates the
    /// last attempted fetch; `available` goes false after a sustained
    /// outage. Suppressed metrics are already blanked.
    ReadingUpdated {
        account_id: String,
        serial: String,
        reading: Reading,
        stale: bool,
        available: bool,
    },
    AccountStatusChanged {
        account_id: String,
        status: AccountStatus,
    },
}

struct AccountHandle {
    username: String,
    refresh_tx: mpsc::Sender<RefreshRequest>,
    status_rx: watch::Receiver<AccountStatus>,
    catalog: Arc<DeviceCatalog>,
    cache: Arc<ReadingCache>,
}

/// Supervisor for the polling engine: one coordinator task per account,
/// all fanning their events into a single channel for the host.
pub struct MeterBridge;

impl MeterBridge {
    /// Spawns one coordinator per configured account and returns the
    /// control handle plus the event stream. Each coordinator performs a
    /// first discovery-and-fetch cycle immediately.
    pub fn start(config: BridgeConfig) -> CloudResult<(BridgeHandle, mpsc::Receiver<BridgeEvent>)> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::channel(256);
        let mut accounts = HashMap::new();

        for account in &config.accounts {
            let client = CloudClient::new(&config.base_url, account, config.api_timeout())?;
            let catalog = Arc::new(DeviceCatalog::new());
            let cache = Arc::new(ReadingCache::new());
            let (status_tx, status_rx) = watch::channel(AccountStatus::Ok);
            let (refresh_tx, refresh_rx) = mpsc::channel(16);

            let coordinator = AccountCoordinator::new(
                account.clone(),
                &config,
                client,
                catalog.clone(),
                cache.clone(),
                events_tx.clone(),
                status_tx,
            );
            tokio::spawn(coordinator.run(refresh_rx));

            accounts.insert(
                account.id.clone(),
                AccountHandle {
                    username: account.username.clone(),
                    refresh_tx,
                    status_rx,
                    catalog,
                    cache,
                },
            );
        }

        info!(accounts = accounts.len(), "Meter bridge started");
        Ok((
            BridgeHandle {
                accounts,
                unavailable_after: config.unavailable_after,
            },
            events_rx,
        ))
    }
}

/// Host-facing control surface for a running bridge.
pub struct BridgeHandle {
    accounts: HashMap<String, AccountHandle>,
    unavailable_after: u32,
}

impl BridgeHandle {
    fn account(&self, account_id: &str) -> CloudResult<&AccountHandle> {
        self.accounts
            .get(account_id)
            .ok_or_else(|| CloudError::Config(format!("unknown account `{account_id}`")))
    }

    /// Triggers a manual refresh and waits for the serving cycle's
    /// outcome. Callers arriving while a cycle is already in flight join
    /// it and observe the same outcome.
    pub async fn refresh(&self, account_id: &str) -> CloudResult<CycleOutcome> {
        let handle = self.account(account_id)?;
        let (reply, outcome_rx) = oneshot::channel();
        handle
            .refresh_tx
            .send(RefreshRequest { reply })
            .await
            .map_err(|_| CloudError::Api(format!("coordinator for `{account_id}` stopped")))?;
        outcome_rx
            .await
            .map_err(|_| CloudError::Api(format!("coordinator for `{account_id}` stopped")))
    }

    /// Refreshes every account and collects the outcomes.
    pub async fn refresh_all(&self) -> CloudResult<Vec<CycleOutcome>> {
        let mut outcomes = Vec::with_capacity(self.accounts.len());
        for account_id in self.accounts.keys() {
            outcomes.push(self.refresh(account_id).await?);
        }
        Ok(outcomes)
    }

    pub fn status(&self, account_id: &str) -> Option<AccountStatus> {
        self.accounts.get(account_id).map(|h| *h.status_rx.borrow())
    }

    pub async fn reading(&self, account_id: &str, serial: &str) -> Option<CachedReading> {
        self.accounts.get(account_id)?.cache.get(serial).await
    }

    pub async fn devices(&self, account_id: &str) -> Vec<Device> {
        match self.accounts.get(account_id) {
            Some(handle) => handle.catalog.devices().await,
            None => Vec::new(),
        }
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.accounts.keys().cloned().collect()
    }

    /// Redacted snapshot of per-account state for support bundles.
    /// Credentials and tokens are never included.
    pub async fn diagnostics(&self) -> serde_json::Value {
        let mut accounts = serde_json::Map::new();
        for (account_id, handle) in &self.accounts {
            let mut cache_entries = serde_json::Map::new();
            for serial in handle.cache.serials().await {
                if let Some(cached) = handle.cache.get(&serial).await {
                    cache_entries.insert(
                        serial,
                        json!({
                            "age_secs": cached.updated_at.elapsed().as_secs(),
                            "stale": cached.stale,
                            "failures_since_update": cached.failures_since_update,
                            "available": cached.is_available(self.unavailable_after),
                        }),
                    );
                }
            }
            accounts.insert(
                account_id.clone(),
                json!({
                    "username": mask_credential(&handle.username),
                    "status": *handle.status_rx.borrow(),
                    "devices": handle.catalog.serials().await,
                    "cache": cache_entries,
                }),
            );
        }
        json!({ "accounts": accounts })
    }
}

/// Keeps just enough of a credential to recognize it in a support bundle.
/// Counted in characters, not bytes: usernames may start with multi-byte
/// letters.
fn mask_credential(value: &str) -> String {
    let mut chars = value.chars();
    let prefix: String = chars.by_ref().take(2).collect();
    if chars.next().is_none() {
        "***".to_string()
    } else {
        format!("{prefix}***")
    }
}
