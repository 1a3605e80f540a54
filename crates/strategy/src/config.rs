use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use common::{Error, ExecutionParams, Result};

use crate::breakout::StrategyParams;
use crate::indicators::BollingerBands;

/// Strategy config file (TOML). Every key is optional.
///
/// Example `config/strategy.toml`:
/// ```toml
/// [bands]
/// window = 20
/// multiplier = 2.0
/// ddof = 0
/// max_rows = 200
/// source = "closed"
///
/// [strategy]
/// only_on_close = false
///
/// [execution]
/// stop_loss_enabled = true
/// stop_loss_pct = 0.02
/// max_position_pct = 0.1
/// leverage = 10
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StrategyFileConfig {
    pub bands: BandConfig,
    pub strategy: StrategyParams,
    pub execution: ExecutionParams,
}

/// Which band snapshot drives the decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BandSource {
    /// Band from closed bars only (what the exchange chart shows).
    #[default]
    Closed,
    /// Band including the forming bar's current price.
    Realtime,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BandConfig {
    pub window: usize,
    pub multiplier: f64,
    /// 0 = population, 1 = sample standard deviation.
    pub ddof: usize,
    /// Rows retained in memory, closed and forming.
    pub max_rows: usize,
    pub source: BandSource,
}

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            window: 20,
            multiplier: 2.0,
            ddof: 0,
            max_rows: 200,
            source: BandSource::Closed,
        }
    }
}

impl BandConfig {
    pub fn build(&self) -> BollingerBands {
        BollingerBands::new(self.window, self.multiplier, self.ddof, self.max_rows)
    }
}

impl StrategyFileConfig {
    /// Load and validate a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read strategy config at '{path}': {e}"))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("Strategy config at '{path}': {e}")))
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            info!(path, "No strategy config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let b = &self.bands;
        if b.window < 2 {
            return Err(Error::Config(format!("bands.window must be >= 2, got {}", b.window)));
        }
        if b.ddof > 1 {
            return Err(Error::Config(format!("bands.ddof must be 0 or 1, got {}", b.ddof)));
        }
        if b.max_rows < b.window {
            return Err(Error::Config(format!(
                "bands.max_rows ({}) must be >= bands.window ({})",
                b.max_rows, b.window
            )));
        }
        if !(b.multiplier.is_finite() && b.multiplier > 0.0) {
            return Err(Error::Config(format!(
                "bands.multiplier must be positive and finite, got {}",
                b.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.strategy.reentry_buffer_pct) {
            return Err(Error::Config(format!(
                "strategy.reentry_buffer_pct must be within [0, 1], got {}",
                self.strategy.reentry_buffer_pct
            )));
        }
        self.execution.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = StrategyFileConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, StrategyFileConfig::default());
        assert_eq!(cfg.bands.window, 20);
        assert_eq!(cfg.bands.source, BandSource::Closed);
        assert!(!cfg.strategy.only_on_close);
        assert!(cfg.execution.stop_loss_enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = StrategyFileConfig::from_toml_str(
            r#"
            [bands]
            ddof = 1
            source = "realtime"

            [strategy]
            only_on_close = true

            [execution]
            leverage = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.bands.ddof, 1);
        assert_eq!(cfg.bands.window, 20);
        assert_eq!(cfg.bands.source, BandSource::Realtime);
        assert!(cfg.strategy.only_on_close);
        assert_eq!(cfg.execution.leverage, 3);
        assert_eq!(cfg.execution.stop_loss_pct, 0.02);
    }

    #[test]
    fn invalid_values_are_rejected() {
        for toml in [
            "[bands]\nwindow = 1",
            "[bands]\nddof = 2",
            "[bands]\nwindow = 50\nmax_rows = 10",
            "[bands]\nmultiplier = -1.0",
            "[execution]\nleverage = 0",
            "[strategy]\nreentry_buffer_pct = 2.0",
        ] {
            assert!(
                matches!(StrategyFileConfig::from_toml_str(toml), Err(Error::Config(_))),
                "expected rejection for {toml:?}"
            );
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = StrategyFileConfig::load_or_default("/nonexistent/strategy.toml").unwrap();
        assert_eq!(cfg, StrategyFileConfig::default());
    }
}
