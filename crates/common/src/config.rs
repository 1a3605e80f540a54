use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, TradingMode};

/// Default failover hosts for the USDⓈ-M futures market stream.
const DEFAULT_WS_FALLBACKS: &str = "wss://fstream.binance.com,wss://fstream-auth.binance.com";

/// Process configuration loaded from environment variables at startup.
/// Invalid values are reported as `Error::Config`; the binary treats them as fatal.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,

    // Instrument
    pub symbol: String,
    pub interval: String,

    // Trading
    pub trading_mode: TradingMode,
    pub simulate_balance: f64,
    pub position_sync: PositionSync,

    // Database
    pub database_url: String,

    pub stream: StreamSettings,
    pub rest: RestSettings,

    // Dashboard (disabled when no token is configured)
    pub dashboard_token: Option<String>,
    pub dashboard_port: u16,

    // Strategy config file path
    pub strategy_config_path: String,
}

/// Market stream connection settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Primary host, e.g. `wss://fstream.binance.com`.
    pub ws_base: String,
    /// Hosts tried after the primary, in order.
    pub fallback_hosts: Vec<String>,
    pub symbol: String,
    pub interval: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub open_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

/// Signed REST settings for the live futures client.
#[derive(Debug, Clone)]
pub struct RestSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// recvWindow in milliseconds.
    pub recv_window: u64,
    pub http_timeout: Duration,
    pub qty_precision: u32,
    pub price_round: u32,
    /// MARK_PRICE or CONTRACT_PRICE.
    pub stop_loss_working_type: String,
}

/// What to do with the exchange-reported position before each decision
/// (live mode only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSync {
    /// Trust local state, never query.
    Off,
    /// Adopt the exchange position; on query failure keep local state.
    Lenient,
    /// Adopt the exchange position; on query failure skip the decision.
    Strict,
}

impl FromStr for PositionSync {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "off" => Ok(PositionSync::Off),
            "lenient" => Ok(PositionSync::Lenient),
            "strict" => Ok(PositionSync::Strict),
            other => Err(Error::Config(format!(
                "POSITION_SYNC must be 'off', 'lenient' or 'strict', got: '{other}'"
            ))),
        }
    }
}

/// Sizing and protective-order parameters handed to execution collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionParams {
    /// Arm a reduce-only stop order after every entry.
    pub stop_loss_enabled: bool,
    /// Distance of the protective stop from entry (0.02 = 2%).
    pub stop_loss_pct: f64,
    /// Share of available balance allocated per entry (0.1 = 10%).
    pub max_position_pct: f64,
    pub leverage: u32,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            stop_loss_enabled: true,
            stop_loss_pct: 0.02,
            max_position_pct: 0.1,
            leverage: 10,
        }
    }
}

impl ExecutionParams {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.stop_loss_pct) {
            return Err(Error::Config(format!(
                "stop_loss_pct must be within [0, 1], got {}",
                self.stop_loss_pct
            )));
        }
        if !(0.0..=1.0).contains(&self.max_position_pct) {
            return Err(Error::Config(format!(
                "max_position_pct must be within [0, 1], got {}",
                self.max_position_pct
            )));
        }
        if self.leverage == 0 {
            return Err(Error::Config("leverage must be >= 1".into()));
        }
        Ok(())
    }
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Empty values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let symbol = get("SYMBOL")
            .unwrap_or_else(|| "BTCUSDT".to_string())
            .trim()
            .to_uppercase();
        let interval = get("INTERVAL").unwrap_or_else(|| "15m".to_string());

        let trading_mode = if parse_bool(get("SIMULATE_TRADING"), true) {
            TradingMode::Paper
        } else {
            TradingMode::Live
        };

        let api_key = get("BINANCE_API_KEY");
        let api_secret = get("BINANCE_API_SECRET");
        if trading_mode == TradingMode::Live && (api_key.is_none() || api_secret.is_none()) {
            return Err(Error::Config(
                "BINANCE_API_KEY and BINANCE_API_SECRET are required when SIMULATE_TRADING=false"
                    .into(),
            ));
        }

        let database_url = match get("DATABASE_URL") {
            Some(url) => url,
            None => format!(
                "sqlite://{}",
                get("DB_PATH").unwrap_or_else(|| "trader.db".to_string())
            ),
        };

        let ws_base = trim_base(get("WS_BASE").unwrap_or_else(|| "wss://fstream.binance.com".into()));
        let fallback_hosts = get("WS_FALLBACK_HOSTS")
            .unwrap_or_else(|| DEFAULT_WS_FALLBACKS.to_string())
            .split(',')
            .map(|h| trim_base(h.trim().to_string()))
            .filter(|h| !h.is_empty())
            .collect();

        let backoff_initial = secs(&get, "WS_BACKOFF_INITIAL", 1)?;
        let backoff_max = secs(&get, "WS_BACKOFF_MAX", 60)?;
        if backoff_initial.is_zero() || backoff_max < backoff_initial {
            return Err(Error::Config(format!(
                "WS backoff must satisfy 0 < initial <= max, got {backoff_initial:?} / {backoff_max:?}"
            )));
        }

        let stream = StreamSettings {
            ws_base,
            fallback_hosts,
            symbol: symbol.clone(),
            interval: interval.clone(),
            ping_interval: secs(&get, "WS_PING_INTERVAL", 20)?,
            ping_timeout: secs(&get, "WS_PING_TIMEOUT", 60)?,
            open_timeout: secs(&get, "WS_OPEN_TIMEOUT", 20)?,
            backoff_initial,
            backoff_max,
        };
        if stream.ping_interval.is_zero() || stream.ping_timeout.is_zero() {
            return Err(Error::Config("WS_PING_INTERVAL and WS_PING_TIMEOUT must be > 0".into()));
        }

        let rest = RestSettings {
            base_url: trim_base(get("REST_BASE").unwrap_or_else(|| "https://fapi.binance.com".into())),
            api_key,
            api_secret,
            recv_window: parse_or(&get, "RECV_WINDOW", 5000)?,
            http_timeout: secs(&get, "HTTP_TIMEOUT", 30)?,
            qty_precision: parse_or(&get, "QTY_PRECISION", 3)?,
            price_round: parse_or(&get, "PRICE_ROUND", 2)?,
            stop_loss_working_type: get("STOP_LOSS_WORKING_TYPE")
                .unwrap_or_else(|| "CONTRACT_PRICE".to_string()),
        };

        let position_sync = match get("POSITION_SYNC") {
            Some(v) => v.parse()?,
            None => PositionSync::Lenient,
        };

        Ok(Config {
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".into()).to_lowercase(),
            symbol,
            interval,
            trading_mode,
            simulate_balance: parse_or(&get, "SIMULATE_BALANCE", 10_000.0)?,
            position_sync,
            database_url,
            stream,
            rest,
            dashboard_token: get("DASHBOARD_TOKEN"),
            dashboard_port: parse_or(&get, "DASHBOARD_PORT", 5000)?,
            strategy_config_path: get("STRATEGY_CONFIG_PATH")
                .unwrap_or_else(|| "config/strategy.toml".to_string()),
        })
    }
}

fn trim_base(s: String) -> String {
    s.trim_end_matches('/').to_string()
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value {
        Some(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "t" | "yes" | "y"),
        None => default,
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{key}: cannot parse '{raw}': {e}"))),
        None => Ok(default),
    }
}

fn secs<G>(get: &G, key: &str, default: u64) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults_match_paper_trading_setup() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.interval, "15m");
        assert_eq!(cfg.trading_mode, TradingMode::Paper);
        assert_eq!(cfg.database_url, "sqlite://trader.db");
        assert_eq!(cfg.stream.backoff_initial, Duration::from_secs(1));
        assert_eq!(cfg.stream.backoff_max, Duration::from_secs(60));
        assert_eq!(cfg.stream.fallback_hosts.len(), 2);
        assert_eq!(cfg.position_sync, PositionSync::Lenient);
        assert!(cfg.dashboard_token.is_none());
    }

    #[test]
    fn live_mode_requires_credentials() {
        let err = load(&[("SIMULATE_TRADING", "false")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let cfg = load(&[
            ("SIMULATE_TRADING", "no"),
            ("BINANCE_API_KEY", "k"),
            ("BINANCE_API_SECRET", "s"),
        ])
        .unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
    }

    #[test]
    fn symbol_is_uppercased_and_bases_trimmed() {
        let cfg = load(&[("SYMBOL", "ethusdt"), ("WS_BASE", "wss://example.com/")]).unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.stream.symbol, "ETHUSDT");
        assert_eq!(cfg.stream.ws_base, "wss://example.com");
    }

    #[test]
    fn invalid_numbers_are_config_errors() {
        assert!(matches!(
            load(&[("WS_PING_INTERVAL", "soon")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            load(&[("WS_BACKOFF_INITIAL", "10"), ("WS_BACKOFF_MAX", "5")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            load(&[("POSITION_SYNC", "sometimes")]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn execution_params_validation() {
        assert!(ExecutionParams::default().validate().is_ok());
        let bad = ExecutionParams {
            max_position_pct: 1.5,
            ..ExecutionParams::default()
        };
        assert!(bad.validate().is_err());
    }
}
