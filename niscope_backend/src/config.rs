//! TOML configuration of the scope.
//!
//! Every field has a default, so an empty file describes the stock two-channel scope: `Dev1/ai0`
//! and `Dev1/ai1` named `I` and `Q` on a 0 to 0.5 V range, sampled at 1024 S/s and delivered in
//! blocks of 256 samples per channel.
//!
//! ```toml
//! session = "scope"
//! rate = 2048.0
//! threshold = 512
//!
//! [[channels]]
//! physical = "Dev1/ai0"
//! name = "I"
//! min = -1.0
//! max = 1.0
//! terminal = "differential"
//!
//! [delivery]
//! mode = "poll"
//! poll_period_ms = 20
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use nisession_backend::{
    AiVoltageChannel, DeliveryConfig, FillMode, SampleMode, TerminalConfig, Timeout, Timing,
};

use crate::error::{ScopeError, ScopeResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub physical: String,
    #[serde(default)]
    pub name: String,
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub terminal: TerminalConfig,
}

impl ChannelConfig {
    pub fn to_channel(&self) -> AiVoltageChannel {
        AiVoltageChannel::new(&self.physical, self.min, self.max)
            .named(&self.name)
            .with_terminal_config(self.terminal)
    }
}

/// How blocks reach the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The driver's every-N-samples callback reads each block.
    Callback,
    /// A worker thread checks the available sample count every `poll_period_ms`.
    Poll { poll_period_ms: u64 },
}

impl Default for DeliveryMode {
    fn default() -> Self {
        DeliveryMode::Callback
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScopeConfig {
    pub session: String,
    pub channels: Vec<ChannelConfig>,
    /// Sample clock rate, S/s.
    pub rate: f64,
    pub samples_per_channel: u64,
    pub sample_mode: SampleMode,
    /// Input buffer size in samples per channel; `None` keeps the driver's choice.
    pub input_buffer: Option<u32>,
    /// Samples per channel per block.
    pub threshold: u32,
    pub fill_mode: FillMode,
    pub queue_capacity: usize,
    pub read_timeout_s: f64,
    /// Period of the display loop of the demo binary.
    pub display_period_ms: u64,
    pub delivery: DeliveryMode,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            session: "scope".to_string(),
            channels: vec![
                ChannelConfig {
                    physical: "Dev1/ai0".to_string(),
                    name: "I".to_string(),
                    min: 0.0,
                    max: 0.5,
                    terminal: TerminalConfig::Default,
                },
                ChannelConfig {
                    physical: "Dev1/ai1".to_string(),
                    name: "Q".to_string(),
                    min: 0.0,
                    max: 0.5,
                    terminal: TerminalConfig::Default,
                },
            ],
            rate: 1024.0,
            samples_per_channel: 128,
            sample_mode: SampleMode::Continuous,
            input_buffer: Some(256),
            threshold: 256,
            fill_mode: FillMode::GroupByChannel,
            queue_capacity: DeliveryConfig::DEFAULT_CAPACITY,
            read_timeout_s: 1.0,
            display_period_ms: 25,
            delivery: DeliveryMode::Callback,
        }
    }
}

impl ScopeConfig {
    /// Reads and validates a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> ScopeResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        log::debug!("loaded configuration from {}", path.as_ref().display());
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> ScopeResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ScopeResult<()> {
        let invalid = |msg: String| Err(ScopeError::Config(msg));
        if self.session.trim().is_empty() {
            return invalid("session name must not be empty".to_string());
        }
        if self.channels.is_empty() {
            return invalid("at least one channel is required".to_string());
        }
        if let Some(channel) = self.channels.iter().find(|c| !(c.min < c.max)) {
            return invalid(format!(
                "channel `{}`: min {} must be below max {}",
                channel.physical, channel.min, channel.max
            ));
        }
        if !(self.rate.is_finite() && self.rate > 0.0) {
            return invalid(format!("rate must be positive, got {}", self.rate));
        }
        if self.threshold == 0 {
            return invalid("threshold must be at least one sample".to_string());
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1".to_string());
        }
        if !(self.read_timeout_s.is_finite() && self.read_timeout_s >= 0.0) {
            return invalid(format!(
                "read_timeout_s must be non-negative, got {}",
                self.read_timeout_s
            ));
        }
        if let DeliveryMode::Poll { poll_period_ms: 0 } = self.delivery {
            return invalid("poll_period_ms must be positive".to_string());
        }
        Ok(())
    }

    pub fn ai_channels(&self) -> Vec<AiVoltageChannel> {
        self.channels.iter().map(ChannelConfig::to_channel).collect()
    }

    pub fn timing(&self) -> Timing {
        Timing::sample_clock(self.rate, self.sample_mode, self.samples_per_channel)
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig::new(self.threshold)
            .with_fill_mode(self.fill_mode)
            .with_capacity(self.queue_capacity)
            .with_read_timeout(Timeout::Seconds(self.read_timeout_s))
    }

    pub fn display_period(&self) -> Duration {
        Duration::from_millis(self.display_period_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_file_is_the_stock_scope() {
        let config = ScopeConfig::from_toml_str("").unwrap();
        assert_eq!(config, ScopeConfig::default());
        assert_eq!(config.session, "scope");
        assert_eq!(config.threshold, 256);
        assert_eq!(config.input_buffer, Some(256));
        assert_eq!(config.timing().rate(), Some(1024.0));
        let names: Vec<_> = config.channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["I", "Q"]);
    }

    #[test]
    fn parses_channels_and_poll_delivery() {
        let config = ScopeConfig::from_toml_str(
            r#"
            threshold = 64
            fill_mode = "group_by_scan_number"

            [[channels]]
            physical = "Dev2/ai0:3"
            min = -10.0
            max = 10.0
            terminal = "differential"

            [delivery]
            mode = "poll"
            poll_period_ms = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.channels.len(), 1);
        assert_eq!(config.channels[0].terminal, TerminalConfig::Differential);
        assert_eq!(config.delivery, DeliveryMode::Poll { poll_period_ms: 5 });

        let delivery = config.delivery_config();
        assert_eq!(delivery.threshold, 64);
        assert_eq!(delivery.fill_mode, FillMode::GroupByScanNumber);
        assert_eq!(delivery.capacity, DeliveryConfig::DEFAULT_CAPACITY);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            ScopeConfig::from_toml_str("channels = []"),
            Err(ScopeError::Config(_))
        ));
        assert!(matches!(
            ScopeConfig::from_toml_str("rate = 0.0"),
            Err(ScopeError::Config(_))
        ));
        assert!(matches!(
            ScopeConfig::from_toml_str("rate = \"fast\""),
            Err(ScopeError::Toml(_))
        ));
        assert!(matches!(
            ScopeConfig::from_toml_str("unknown = 1"),
            Err(ScopeError::Toml(_))
        ));
    }
}
