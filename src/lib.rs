//! Cloud Meter Bridge Library
//!
//! This library provides the polling and session-coordination engine for
//! exposing cloud electricity-meter telemetry to a home-automation host:
//! per-account authenticated clients, device discovery, scheduled fetch
//! cycles, and a last-known-good reading cache.

pub mod bridge;
pub mod cache;
pub mod catalog;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod helpers;
pub mod model;

// Re-export commonly used types for easier access
pub use bridge::{BridgeEvent, BridgeHandle, MeterBridge};
pub use cache::{CachedReading, ReadingCache};
pub use catalog::DeviceCatalog;
pub use client::CloudClient;
pub use config::{AccountConfig, BridgeConfig, Metric};
pub use coordinator::{AccountCoordinator, AccountStatus, CycleOutcome};
pub use error::{CloudError, CloudResult};
pub use model::{Device, Reading, TariffPlan};
