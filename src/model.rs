use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Renew the session this long before the server-side expiry.
const SESSION_MARGIN: Duration = Duration::from_secs(60);

/// Time-of-use tariff shape reported by the meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TariffPlan {
    SingleRate,
    DualRate,
    TripleRate,
}

impl TariffPlan {
    /// Maps the rate count from the wire (anything unknown is single-rate).
    pub fn from_rates(rates: u8) -> Self {
        match rates {
            2 => TariffPlan::DualRate,
            3 => TariffPlan::TripleRate,
            _ => TariffPlan::SingleRate,
        }
    }

    pub fn rates(&self) -> u8 {
        match self {
            TariffPlan::SingleRate => 1,
            TariffPlan::DualRate => 2,
            TariffPlan::TripleRate => 3,
        }
    }

    /// Whether the plan carries the given tariff channel (1-based).
    pub fn has_channel(&self, channel: u8) -> bool {
        channel >= 1 && channel <= self.rates()
    }
}

/// A physical meter registered under an account, keyed by serial number.
///
/// Static attributes are re-validated on every discovery pass but never
/// patched field-by-field; a changed meter replaces the stored entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub serial_number: String,
    pub account_id: String,
    /// Display name from the cloud, used by the host's device registry.
    pub name: Option<String>,
    pub model: Option<String>,
    pub phase_count: u8,
    pub tariff_plan: TariffPlan,
    pub has_power_factor: bool,
}

/// One full instantaneous snapshot for a meter.
///
/// A Reading always replaces the previous one wholesale so consumers never
/// see values assembled from two different fetch cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_serial: String,
    pub timestamp: DateTime<Utc>,
    pub active_energy_total: f64,
    pub active_energy_t1: Option<f64>,
    pub active_energy_t2: Option<f64>,
    pub active_energy_t3: Option<f64>,
    pub voltage: f64,
    pub current: f64,
    pub power_factor: Option<f64>,
    pub wifi_mac: String,
    pub wifi_signal_strength: Option<i32>,
}

/// An authenticated session against the cloud service.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub expires_at: Instant,
}

impl Session {
    pub fn new(token: String, expires_in: Duration) -> Self {
        Self {
            token,
            expires_at: Instant::now() + expires_in,
        }
    }

    /// Valid means not within the renewal margin of expiry.
    pub fn is_valid(&self) -> bool {
        Instant::now() + SESSION_MARGIN < self.expires_at
    }
}
