use crate::bridge::BridgeEvent;
use crate::cache::ReadingCache;
use crate::catalog::DeviceCatalog;
use crate::client::CloudClient;
use crate::config::{AccountConfig, BridgeConfig, Metric};
use crate::error::CloudError;
use crate::model::Reading;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Account health as surfaced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde_derive::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Last cycle succeeded.
    Ok,
    /// Transient account-level failure; clears on the next successful cycle.
    Unavailable,
    /// Several consecutive account-level failures.
    Degraded,
    /// Credentials rejected; persists until a cycle succeeds again.
    NeedsReauth,
}

/// Summary of one fetch cycle, handed to every manual-refresh caller that
/// joined it and used for status transitions.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub account_id: String,
    /// Serials updated with a fresh reading this cycle.
    pub updated: Vec<String>,
    /// Serials whose fetch failed this cycle.
    pub failed: Vec<String>,
    /// Account-level failure that aborted the cycle, if any.
    pub error: Option<String>,
}

impl CycleOutcome {
    fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            updated: Vec::new(),
            failed: Vec::new(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A manual-refresh request; the reply carries the outcome of whichever
/// cycle served it.
pub struct RefreshRequest {
    pub reply: oneshot::Sender<CycleOutcome>,
}

/// Timer-driven polling worker for one account.
///
/// Runs the `IDLE -> DISCOVERING -> FETCHING -> IDLE` loop: discovery on
/// every Nth scheduled tick, a concurrent per-device fetch fan-out sharing
/// one session, and backoff applied to the next tick after an
/// account-level failure. One coordinator task owns each account, so at
/// most one fetch cycle per account is ever in flight.
pub struct AccountCoordinator {
    account: AccountConfig,
    client: CloudClient,
    catalog: Arc<DeviceCatalog>,
    cache: Arc<ReadingCache>,
    events: mpsc::Sender<BridgeEvent>,
    status_tx: watch::Sender<AccountStatus>,
    poll_interval: Duration,
    discovery_every: u32,
    degraded_after: u32,
    unavailable_after: u32,
    consecutive_failures: u32,
    backoff: Option<Duration>,
}

impl AccountCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account: AccountConfig,
        config: &BridgeConfig,
        client: CloudClient,
        catalog: Arc<DeviceCatalog>,
        cache: Arc<ReadingCache>,
        events: mpsc::Sender<BridgeEvent>,
        status_tx: watch::Sender<AccountStatus>,
    ) -> Self {
        Self {
            account,
            client,
            catalog,
            cache,
            events,
            status_tx,
            poll_interval: config.poll_interval(),
            discovery_every: config.discovery_every,
            degraded_after: config.degraded_after,
            unavailable_after: config.unavailable_after,
            consecutive_failures: 0,
            backoff: None,
        }
    }

    /// Main coordinator loop. The first tick fires immediately, so the
    /// account is discovered and fetched as soon as the bridge starts.
    pub async fn run(mut self, mut refresh_rx: mpsc::Receiver<RefreshRequest>) {
        info!(account = %self.account.id, "Starting account coordinator");

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick_count: u64 = 0;

        loop {
            let mut waiters: Vec<oneshot::Sender<CycleOutcome>> = Vec::new();
            let manual;
            tokio::select! {
                _ = ticker.tick() => {
                    manual = false;
                }
                request = refresh_rx.recv() => match request {
                    Some(request) => {
                        waiters.push(request.reply);
                        manual = true;
                    }
                    // Handle dropped: shut the coordinator down.
                    None => break,
                },
            }

            let discovery_age = self.poll_interval * self.discovery_every;
            let discover = if manual {
                // Manual refresh skips discovery unless the catalog is
                // empty or the last pass is older than the discovery
                // interval.
                self.catalog.needs_discovery(discovery_age).await
            } else {
                let due = tick_count % u64::from(self.discovery_every) == 0;
                tick_count += 1;
                due || self.catalog.is_empty().await
            };

            let outcome = {
                let cycle = self.run_cycle(discover);
                tokio::pin!(cycle);
                // Refresh requests arriving mid-cycle join the in-flight
                // cycle and receive its outcome; no duplicate cycle starts.
                loop {
                    tokio::select! {
                        outcome = &mut cycle => break outcome,
                        Some(request) = refresh_rx.recv() => waiters.push(request.reply),
                    }
                }
            };

            for reply in waiters {
                let _ = reply.send(outcome.clone());
            }

            if let Some(delay) = self.backoff {
                // Retry sooner than the full interval after a transient
                // account-level failure.
                ticker.reset_after(delay);
            } else if manual {
                // A manual cycle counts as the tick: reschedule a full
                // interval out.
                ticker.reset();
            }
        }

        info!(account = %self.account.id, "Account coordinator stopped");
    }

    /// One fetch cycle: optional discovery, then a concurrent per-device
    /// fan-out against a single shared session.
    async fn run_cycle(&mut self, discover: bool) -> CycleOutcome {
        let mut outcome = CycleOutcome::new(&self.account.id);
        debug!(account = %self.account.id, discover, "Starting fetch cycle");

        if discover {
            match self.client.list_devices().await {
                Ok(devices) => {
                    let delta = self.catalog.apply_discovery(devices).await;
                    for device in delta.added {
                        let _ = self
                            .events
                            .send(BridgeEvent::DeviceDiscovered {
                                account_id: self.account.id.clone(),
                                device,
                            })
                            .await;
                    }
                    for serial in delta.evicted {
                        self.cache.evict(&serial).await;
                        let _ = self
                            .events
                            .send(BridgeEvent::DeviceRemoved {
                                account_id: self.account.id.clone(),
                                serial,
                            })
                            .await;
                    }
                }
                Err(err) => return self.account_failure(outcome, err).await,
            }
        }

        // All device fetches in this cycle share one session.
        if let Err(err) = self.client.ensure_session().await {
            return self.account_failure(outcome, err).await;
        }

        let devices = self.catalog.devices().await;
        let mut fetches = JoinSet::new();
        for device in &devices {
            let client = self.client.clone();
            let serial = device.serial_number.clone();
            fetches.spawn(async move {
                let result = client.get_readings(&serial).await;
                (serial, result)
            });
        }

        while let Some(joined) = fetches.join_next().await {
            let Ok((serial, result)) = joined else {
                continue;
            };
            match result {
                Ok(reading) => {
                    self.cache.put(&serial, reading).await;
                    outcome.updated.push(serial.clone());
                    self.emit_reading(&serial).await;
                }
                Err(CloudError::NotFound(_)) => {
                    // The remote positively reported the meter gone.
                    warn!(account = %self.account.id, serial, "Meter vanished from cloud service");
                    self.catalog.remove(&serial).await;
                    self.cache.evict(&serial).await;
                    outcome.failed.push(serial.clone());
                    let _ = self
                        .events
                        .send(BridgeEvent::DeviceRemoved {
                            account_id: self.account.id.clone(),
                            serial,
                        })
                        .await;
                }
                Err(err) if err.is_auth() => {
                    // Token rejected even after one refresh: account-level.
                    fetches.abort_all();
                    return self.account_failure(outcome, err).await;
                }
                Err(err) => {
                    // One meter's failure never aborts its siblings.
                    warn!(account = %self.account.id, serial, %err, "Meter fetch failed");
                    self.cache.mark_stale(&serial).await;
                    outcome.failed.push(serial.clone());
                    self.emit_reading(&serial).await;
                }
            }
        }

        self.consecutive_failures = 0;
        self.backoff = None;
        self.set_status(AccountStatus::Ok).await;
        debug!(
            account = %self.account.id,
            updated = outcome.updated.len(),
            failed = outcome.failed.len(),
            "Fetch cycle finished"
        );
        outcome
    }

    /// Account-level failure: the cycle aborts, every cataloged meter is
    /// marked stale, and the next tick is backed off.
    async fn account_failure(&mut self, mut outcome: CycleOutcome, err: CloudError) -> CycleOutcome {
        warn!(account = %self.account.id, %err, "Fetch cycle failed for the whole account");

        for serial in self.catalog.serials().await {
            self.cache.mark_stale(&serial).await;
            outcome.failed.push(serial.clone());
            self.emit_reading(&serial).await;
        }

        self.consecutive_failures += 1;
        let start = (self.poll_interval / 10).max(Duration::from_secs(1));
        self.backoff = Some(match self.backoff {
            Some(prev) => (prev * 2).min(self.poll_interval),
            None => start,
        });

        let status = if err.is_auth() {
            AccountStatus::NeedsReauth
        } else if self.consecutive_failures >= self.degraded_after {
            AccountStatus::Degraded
        } else {
            AccountStatus::Unavailable
        };
        self.set_status(status).await;

        outcome.error = Some(err.to_string());
        outcome
    }

    /// Publishes a status transition, once per change.
    async fn set_status(&self, status: AccountStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!(account = %self.account.id, ?status, "Account status changed");
            let _ = self
                .events
                .send(BridgeEvent::AccountStatusChanged {
                    account_id: self.account.id.clone(),
                    status,
                })
                .await;
        }
    }

    /// Emits the current cached reading for a meter, presentation-filtered
    /// through the account's metric toggles.
    async fn emit_reading(&self, serial: &str) {
        let Some(cached) = self.cache.get(serial).await else {
            return;
        };
        let reading = apply_toggles(
            (*cached.reading).clone(),
            &self.account.disabled_metrics(serial),
        );
        let _ = self
            .events
            .send(BridgeEvent::ReadingUpdated {
                account_id: self.account.id.clone(),
                serial: serial.to_string(),
                reading,
                stale: cached.stale,
                available: cached.is_available(self.unavailable_after),
            })
            .await;
    }
}

/// Blanks suppressed optional metrics from a reading before presentation.
/// Fetch behavior is never affected by toggles.
fn apply_toggles(mut reading: Reading, disabled: &[Metric]) -> Reading {
    for metric in disabled {
        match metric {
            Metric::EnergyT1 => reading.active_energy_t1 = None,
            Metric::EnergyT2 => reading.active_energy_t2 = None,
            Metric::EnergyT3 => reading.active_energy_t3 = None,
            Metric::PowerFactor => reading.power_factor = None,
            Metric::WifiSignal => reading.wifi_signal_strength = None,
        }
    }
    reading
}
