use crate::config::AccountConfig;
use crate::error::{CloudError, CloudResult};
use crate::helpers::format_mac;
use crate::model::{Device, Reading, Session, TariffPlan};
use chrono::DateTime;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Authenticated client for the cloud metering service.
///
/// One client per account. The session token lives behind a shared
/// `RwLock` so concurrent device fetches reuse one session: the first
/// caller needing a refresh performs the login under the write guard and
/// everyone else waits on that result.
#[derive(Clone, Debug)]
pub struct CloudClient {
    base_url: String,
    account_id: String,
    username: String,
    password: String,
    http: reqwest::Client,
    session: Arc<RwLock<Option<Session>>>,
}

impl CloudClient {
    pub fn new(base_url: &str, account: &AccountConfig, timeout: Duration) -> CloudResult<Self> {
        if account.username.is_empty() || account.password.is_empty() {
            return Err(CloudError::Config(format!(
                "account `{}` has empty credentials",
                account.id
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CloudError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id: account.id.clone(),
            username: account.username.clone(),
            password: account.password.clone(),
            http,
            session: Arc::new(RwLock::new(None)),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Setup-time check: logs in and lists the account's meters, so the
    /// host's configuration surface can report bad credentials before a
    /// coordinator is ever started.
    pub async fn validate(&self) -> CloudResult<Vec<Device>> {
        self.ensure_token().await?;
        self.list_devices().await
    }

    /// Lists the meters registered under this account.
    pub async fn list_devices(&self) -> CloudResult<Vec<Device>> {
        let meters: Vec<MeterInfo> = self.get_json("/meters", None).await?;
        debug!(
            account = %self.account_id,
            count = meters.len(),
            "Retrieved meter list"
        );
        Ok(meters
            .into_iter()
            .map(|m| Device {
                serial_number: m.serial_number,
                account_id: self.account_id.clone(),
                name: m.name,
                model: m.model,
                phase_count: m.phase_count,
                tariff_plan: TariffPlan::from_rates(m.tariff_plan),
                has_power_factor: m.has_power_factor,
            })
            .collect())
    }

    /// Fetches the current instantaneous reading for one meter.
    pub async fn get_readings(&self, serial: &str) -> CloudResult<Reading> {
        let path = format!("/meters/{serial}/readings");
        let response: ReadingResponse = self.get_json(&path, Some(serial)).await?;
        response.into_reading()
    }

    /// Makes sure a valid session exists, logging in if needed. Called once
    /// at the start of a fetch cycle so the whole fan-out shares one session.
    pub async fn ensure_session(&self) -> CloudResult<()> {
        self.ensure_token().await.map(|_| ())
    }

    /// Returns a valid token, logging in if the cached session is missing
    /// or inside its renewal margin. Exactly one login results when many
    /// fetches race here: the write guard serializes them and the
    /// double-check lets the late arrivals reuse the fresh session.
    async fn ensure_token(&self) -> CloudResult<String> {
        {
            let guard = self.session.read().await;
            if let Some(session) = guard.as_ref() {
                if session.is_valid() {
                    return Ok(session.token.clone());
                }
            }
        }

        let mut guard = self.session.write().await;
        if let Some(session) = guard.as_ref() {
            if session.is_valid() {
                return Ok(session.token.clone());
            }
        }

        let session = self.login().await?;
        let token = session.token.clone();
        *guard = Some(session);
        Ok(token)
    }

    /// Drops the cached session, but only if it still holds the token the
    /// caller used. A sibling fetch that already refreshed is left alone.
    async fn invalidate(&self, used_token: &str) {
        let mut guard = self.session.write().await;
        if guard.as_ref().map(|s| s.token == used_token).unwrap_or(false) {
            *guard = None;
        }
    }

    async fn login(&self) -> CloudResult<Session> {
        let url = format!("{}/auth/token", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&TokenRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            warn!(account = %self.account_id, "Login rejected by cloud service");
            return Err(CloudError::Auth("incorrect login or password".to_string()));
        }
        if !status.is_success() {
            return Err(CloudError::Api(format!("login failed with status {status}")));
        }

        let token: TokenResponse = response.json().await?;
        info!(
            account = %self.account_id,
            expires_in_secs = token.expires_in,
            "Authenticated with cloud service"
        );
        Ok(Session::new(
            token.access_token,
            Duration::from_secs(token.expires_in),
        ))
    }

    /// Issues one authenticated GET. On an auth-rejected response the
    /// cached session is invalidated and the call retried exactly once
    /// with a fresh token; a second rejection surfaces as `AuthError`.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        serial: Option<&str>,
    ) -> CloudResult<T> {
        let token = self.ensure_token().await?;
        match self.try_get(path, &token, serial).await {
            Err(CloudError::Auth(_)) => {
                debug!(
                    account = %self.account_id,
                    path,
                    "Token rejected mid-call, re-authenticating once"
                );
                self.invalidate(&token).await;
                let fresh = self.ensure_token().await?;
                self.try_get(path, &fresh, serial).await
            }
            other => other,
        }
    }

    async fn try_get<T: DeserializeOwned>(
        &self,
        path: &str,
        token: &str,
        serial: Option<&str>,
    ) -> CloudResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).bearer_auth(token).send().await?;

        let status = response.status();
        match status {
            reqwest::StatusCode::OK => Ok(response.json().await?),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(CloudError::Auth("token rejected by cloud service".to_string()))
            }
            reqwest::StatusCode::NOT_FOUND => match serial {
                Some(serial) => Err(CloudError::NotFound(serial.to_string())),
                None => Err(CloudError::Api(format!("unexpected 404 for {path}"))),
            },
            _ => Err(CloudError::Api(format!("{path} failed with status {status}"))),
        }
    }

    #[cfg(test)]
    async fn seed_session(&self, token: &str, expires_in: Duration) {
        *self.session.write().await = Some(Session::new(token.to_string(), expires_in));
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeterInfo {
    serial_number: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    model: Option<String>,
    phase_count: u8,
    tariff_plan: u8,
    #[serde(default)]
    has_power_factor: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadingResponse {
    serial_number: String,
    /// Unix seconds, UTC.
    timestamp: i64,
    energy: EnergyCounters,
    /// Per-phase arrays: one element for single-phase meters, three for
    /// three-phase. The domain reading carries the first phase.
    voltage: Vec<f64>,
    current: Vec<f64>,
    #[serde(default)]
    power_factor: Option<Vec<f64>>,
    wifi: WifiInfo,
}

#[derive(Debug, Deserialize)]
struct EnergyCounters {
    total: f64,
    #[serde(default)]
    t1: Option<f64>,
    #[serde(default)]
    t2: Option<f64>,
    #[serde(default)]
    t3: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WifiInfo {
    mac: String,
    #[serde(default)]
    signal: Option<i32>,
}

impl ReadingResponse {
    fn into_reading(self) -> CloudResult<Reading> {
        let timestamp = DateTime::from_timestamp(self.timestamp, 0)
            .ok_or_else(|| CloudError::Api(format!("invalid timestamp {}", self.timestamp)))?;
        let voltage = self
            .voltage
            .first()
            .copied()
            .ok_or_else(|| CloudError::Api("reading has no voltage values".to_string()))?;
        let current = self
            .current
            .first()
            .copied()
            .ok_or_else(|| CloudError::Api("reading has no current values".to_string()))?;
        let power_factor = self.power_factor.and_then(|pf| pf.first().copied());

        Ok(Reading {
            device_serial: self.serial_number,
            timestamp,
            active_energy_total: self.energy.total,
            active_energy_t1: self.energy.t1,
            active_energy_t2: self.energy.t2,
            active_energy_t3: self.energy.t3,
            voltage,
            current,
            power_factor,
            wifi_mac: format_mac(&self.wifi.mac),
            wifi_signal_strength: self.wifi.signal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_account() -> AccountConfig {
        AccountConfig {
            id: "acct-1".to_string(),
            username: "alice@example.com".to_string(),
            password: "hunter2".to_string(),
            metric_toggles: Vec::new(),
        }
    }

    fn client_for(server: &mockito::Server) -> CloudClient {
        CloudClient::new(&server.url(), &test_account(), Duration::from_secs(5)).unwrap()
    }

    const READING_BODY: &str = r#"
        {
            "serialNumber": "M1",
            "timestamp": 1700000000,
            "energy": {"total": 1234.5, "t1": 800.0, "t2": 434.5},
            "voltage": [230.1],
            "current": [5.2],
            "powerFactor": [0.98],
            "wifi": {"mac": "aabbccddee", "signal": 15}
        }
    "#;

    #[tokio::test]
    async fn test_login_and_list_devices() {
        let mut server = mockito::Server::new_async().await;

        let auth = server
            .mock("POST", "/auth/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"accessToken": "tok-1", "expiresIn": 3600}"#)
            .create();
        let meters = server
            .mock("GET", "/meters")
            .match_header("Authorization", "Bearer tok-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[
                    {"serialNumber": "M1", "name": "House", "model": "NP73E",
                     "phaseCount": 1, "tariffPlan": 2, "hasPowerFactor": true},
                    {"serialNumber": "M2", "phaseCount": 3, "tariffPlan": 1}
                ]"#,
            )
            .create();

        let client = client_for(&server);
        let devices = client.list_devices().await.unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].serial_number, "M1");
        assert_eq!(devices[0].account_id, "acct-1");
        assert_eq!(devices[0].tariff_plan, TariffPlan::DualRate);
        assert!(devices[0].has_power_factor);
        assert_eq!(devices[1].name, None);
        assert_eq!(devices[1].phase_count, 3);
        assert!(!devices[1].has_power_factor);

        auth.assert();
        meters.assert();
    }

    #[tokio::test]
    async fn test_validate_logs_in_and_lists_meters() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/token")
            .with_status(200)
            .with_body(r#"{"accessToken": "tok-1", "expiresIn": 3600}"#)
            .expect(1)
            .create();
        server
            .mock("GET", "/meters")
            .match_header("Authorization", "Bearer tok-1")
            .with_status(200)
            .with_body(r#"[{"serialNumber": "M1", "phaseCount": 1, "tariffPlan": 1}]"#)
            .create();

        let client = client_for(&server);
        let devices = client.validate().await.unwrap();
        assert_eq!(devices.len(), 1);
    }

    #[test]
    fn test_empty_credentials_rejected_before_any_network_call() {
        let mut account = test_account();
        account.password.clear();
        let err = CloudClient::new("https://cloud.example.com", &account, Duration::from_secs(5))
            .unwrap_err();
        assert!(err.is_config(), "expected ConfigError, got {err:?}");
    }

    #[tokio::test]
    async fn test_bad_credentials_surface_as_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/token")
            .with_status(401)
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create();

        let client = client_for(&server);
        let err = client.list_devices().await.unwrap_err();
        assert!(err.is_auth(), "expected AuthError, got {err:?}");
    }

    #[tokio::test]
    async fn test_reading_maps_wire_fields() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/meters/M1/readings")
            .match_header("Authorization", "Bearer tok-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(READING_BODY)
            .create();

        let client = client_for(&server);
        client.seed_session("tok-1", Duration::from_secs(3600)).await;

        let reading = client.get_readings("M1").await.unwrap();
        assert_eq!(reading.device_serial, "M1");
        assert_eq!(reading.active_energy_total, 1234.5);
        assert_eq!(reading.active_energy_t1, Some(800.0));
        assert_eq!(reading.active_energy_t3, None);
        assert_eq!(reading.voltage, 230.1);
        assert_eq!(reading.current, 5.2);
        assert_eq!(reading.power_factor, Some(0.98));
        assert_eq!(reading.wifi_mac, "00:aa:bb:cc:dd:ee");
        assert_eq!(reading.wifi_signal_strength, Some(15));
        assert_eq!(reading.timestamp.timestamp(), 1700000000);
    }

    #[tokio::test]
    async fn test_vanished_meter_surfaces_as_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/meters/M9/readings")
            .with_status(404)
            .create();

        let client = client_for(&server);
        client.seed_session("tok-1", Duration::from_secs(3600)).await;

        match client.get_readings("M9").await {
            Err(CloudError::NotFound(serial)) => assert_eq!(serial, "M9"),
            other => panic!("expected NotFoundError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_token_retried_once_with_fresh_login() {
        let mut server = mockito::Server::new_async().await;

        // The stale token is rejected once, then the fresh one succeeds.
        let rejected = server
            .mock("GET", "/meters/M1/readings")
            .match_header("Authorization", "Bearer stale")
            .with_status(401)
            .expect(1)
            .create();
        let auth = server
            .mock("POST", "/auth/token")
            .with_status(200)
            .with_body(r#"{"accessToken": "fresh", "expiresIn": 3600}"#)
            .expect(1)
            .create();
        let accepted = server
            .mock("GET", "/meters/M1/readings")
            .match_header("Authorization", "Bearer fresh")
            .with_status(200)
            .with_body(READING_BODY)
            .expect(1)
            .create();

        let client = client_for(&server);
        client.seed_session("stale", Duration::from_secs(3600)).await;

        let reading = client.get_readings("M1").await.unwrap();
        assert_eq!(reading.active_energy_total, 1234.5);

        rejected.assert();
        auth.assert();
        accepted.assert();
    }

    #[tokio::test]
    async fn test_second_rejection_surfaces_as_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/meters/M1/readings")
            .with_status(401)
            .expect(2)
            .create();
        server
            .mock("POST", "/auth/token")
            .with_status(200)
            .with_body(r#"{"accessToken": "fresh", "expiresIn": 3600}"#)
            .create();

        let client = client_for(&server);
        client.seed_session("stale", Duration::from_secs(3600)).await;

        let err = client.get_readings("M1").await.unwrap_err();
        assert!(err.is_auth(), "expected AuthError, got {err:?}");
    }

    #[tokio::test]
    async fn test_concurrent_fetches_trigger_exactly_one_login() {
        let mut server = mockito::Server::new_async().await;

        let auth = server
            .mock("POST", "/auth/token")
            .with_status(200)
            .with_body(r#"{"accessToken": "tok-1", "expiresIn": 3600}"#)
            .expect(1)
            .create();
        let readings = server
            .mock("GET", mockito::Matcher::Regex(r"^/meters/M\d/readings$".to_string()))
            .match_header("Authorization", "Bearer tok-1")
            .with_status(200)
            .with_body(READING_BODY)
            .expect(2)
            .create();

        // No session yet: both fetches need a token at the same instant.
        let client = client_for(&server);
        let (a, b) = tokio::join!(client.get_readings("M1"), client.get_readings("M2"));
        a.unwrap();
        b.unwrap();

        auth.assert();
        readings.assert();
    }

    #[tokio::test]
    async fn test_server_error_surfaces_as_api_error() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/meters").with_status(503).create();

        let client = client_for(&server);
        client.seed_session("tok-1", Duration::from_secs(3600)).await;

        let err = client.list_devices().await.unwrap_err();
        assert!(err.is_transient(), "expected ApiError, got {err:?}");
    }
}
