use regex::Regex;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::driver::{TerminalConfig, VoltageUnits};
use crate::error::{DaqError, DaqResult};

/// Analog input voltage channel configuration.
///
/// `physical` accepts what the driver accepts: a single terminal (`Dev1/ai0`), a range
/// (`Dev1/ai0:3`) or a comma separated list of either. One virtual channel is created per
/// physical terminal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AiVoltageChannel {
    pub physical: String,
    #[serde(default)]
    pub name: String,
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub units: VoltageUnits,
    #[serde(default)]
    pub terminal_config: TerminalConfig,
}

impl AiVoltageChannel {
    pub fn new(physical: &str, min: f64, max: f64) -> Self {
        Self {
            physical: physical.to_string(),
            name: String::new(),
            min,
            max,
            units: VoltageUnits::Volts,
            terminal_config: TerminalConfig::Default,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_units(mut self, units: VoltageUnits) -> Self {
        self.units = units;
        self
    }

    pub fn with_terminal_config(mut self, terminal_config: TerminalConfig) -> Self {
        self.terminal_config = terminal_config;
        self
    }

    /// Names of the virtual channels this configuration creates, in acquisition order.
    ///
    /// Without an assigned name the physical names are used. A single assigned name for
    /// several terminals is suffixed with the terminal index (`I0`, `I1`, ...); otherwise the
    /// assigned name must be a comma list with one entry per terminal.
    pub fn virtual_names(&self) -> DaqResult<Vec<String>> {
        let physical = expand_physical_channels(&self.physical)?;
        if self.name.trim().is_empty() {
            return Ok(physical);
        }
        let names: Vec<String> = self
            .name
            .split(',')
            .map(|n| n.trim().to_string())
            .collect();
        match (names.len(), physical.len()) {
            (n, p) if n == p => Ok(names),
            (1, p) => Ok((0..p).map(|i| format!("{}{}", names[0], i)).collect()),
            (n, p) => Err(DaqError::InvalidArgument(format!(
                "{} channel names given for {} physical channels `{}`",
                n, p, self.physical
            ))),
        }
    }

    pub(crate) fn validate(&self) -> DaqResult<Vec<String>> {
        if !(self.min.is_finite() && self.max.is_finite() && self.min < self.max) {
            return Err(DaqError::InvalidArgument(format!(
                "channel `{}` range ({}, {}) must satisfy min < max",
                self.physical, self.min, self.max
            )));
        }
        if let VoltageUnits::FromCustomScale(scale) = &self.units {
            if scale.trim().is_empty() {
                return Err(DaqError::InvalidArgument(
                    "custom scale units need a scale name".to_string(),
                ));
            }
        }
        self.virtual_names()
    }
}

/// Most terminals a single `first:last` range may name.
pub const MAX_RANGE_CHANNELS: usize = 1024;

fn range_regex() -> &'static Regex {
    static RANGE: OnceLock<Regex> = OnceLock::new();
    RANGE.get_or_init(|| {
        // The base never contains the range colon and never ends in a digit
        Regex::new(r"^(?P<base>[^:]*[^:\d])(?P<first>\d+)(?::(?P<last>\d+))?$")
            .unwrap_or_else(|err| unreachable!("static channel pattern is valid: {err}"))
    })
}

/// Expands a physical channel specification into individual terminal names.
///
/// ```
/// # use nisession_backend::expand_physical_channels;
/// let chans = expand_physical_channels("Dev1/ai0:2, Dev1/ai5").unwrap();
/// assert_eq!(chans, ["Dev1/ai0", "Dev1/ai1", "Dev1/ai2", "Dev1/ai5"]);
/// ```
pub fn expand_physical_channels(spec: &str) -> DaqResult<Vec<String>> {
    let mut expanded = Vec::new();
    for item in spec.split(',').map(str::trim) {
        if item.is_empty() {
            return Err(DaqError::InvalidArgument(format!(
                "empty entry in physical channel list `{spec}`"
            )));
        }
        let Some(caps) = range_regex().captures(item) else {
            // Named terminals without an index (e.g. global channels) stand for one channel
            if item.contains(':') {
                return Err(DaqError::InvalidArgument(format!(
                    "malformed physical channel range `{item}`"
                )));
            }
            expanded.push(item.to_string());
            continue;
        };
        let base = &caps["base"];
        let parse = |digits: &str| {
            digits.parse::<usize>().map_err(|_| {
                DaqError::InvalidArgument(format!("channel index out of range in `{item}`"))
            })
        };
        let first = parse(&caps["first"])?;
        match caps.name("last") {
            None => expanded.push(item.to_string()),
            Some(last) => {
                let last = parse(last.as_str())?;
                if first.abs_diff(last) >= MAX_RANGE_CHANNELS {
                    return Err(DaqError::InvalidArgument(format!(
                        "range `{item}` names more than {MAX_RANGE_CHANNELS} channels"
                    )));
                }
                if first <= last {
                    expanded.extend((first..=last).map(|i| format!("{base}{i}")));
                } else {
                    expanded.extend((last..=first).rev().map(|i| format!("{base}{i}")));
                }
            }
        }
    }
    Ok(expanded)
}

/// Device part of a physical channel name (`/Dev1/ai0` -> `Dev1`).
pub fn device_of(physical: &str) -> &str {
    physical
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expand_single_and_ranges() {
        assert_eq!(expand_physical_channels("Dev1/ai0").unwrap(), ["Dev1/ai0"]);
        assert_eq!(
            expand_physical_channels("PXI1Slot3/ai10:12").unwrap(),
            ["PXI1Slot3/ai10", "PXI1Slot3/ai11", "PXI1Slot3/ai12"]
        );
        assert_eq!(
            expand_physical_channels("Dev1/ai3:1").unwrap(),
            ["Dev1/ai3", "Dev1/ai2", "Dev1/ai1"]
        );
        assert_eq!(
            expand_physical_channels("Dev1/ai0, Dev1/ai4:5").unwrap(),
            ["Dev1/ai0", "Dev1/ai4", "Dev1/ai5"]
        );
        assert_eq!(
            expand_physical_channels("Dev1/_ai_vref").unwrap(),
            ["Dev1/_ai_vref"]
        );
    }

    #[test]
    fn expand_rejects_malformed() {
        assert!(expand_physical_channels("").is_err());
        assert!(expand_physical_channels("Dev1/ai0,,Dev1/ai1").is_err());
        assert!(expand_physical_channels("Dev1/ai:3").is_err());
        assert!(expand_physical_channels("Dev1/ai0:1:2").is_err());
        assert!(expand_physical_channels("Dev1/ai0:1000000000").is_err());
    }

    #[test]
    fn range_expands_to_every_terminal() {
        let chans = expand_physical_channels("Dev1/ai0:3").unwrap();
        assert_eq!(chans, ["Dev1/ai0", "Dev1/ai1", "Dev1/ai2", "Dev1/ai3"]);
        assert_eq!(expand_physical_channels("Dev1/ai0:1").unwrap().len(), 2);
        assert_eq!(expand_physical_channels("Dev1/ai1:0").unwrap(), ["Dev1/ai1", "Dev1/ai0"]);
        assert_eq!(expand_physical_channels("Dev1/ai5:5").unwrap(), ["Dev1/ai5"]);

        let widest = format!("Dev1/ai0:{}", MAX_RANGE_CHANNELS - 1);
        assert_eq!(expand_physical_channels(&widest).unwrap().len(), MAX_RANGE_CHANNELS);
    }

    #[test]
    fn virtual_names() {
        let chan = AiVoltageChannel::new("Dev1/ai0", 0.0, 0.5).named("I");
        assert_eq!(chan.virtual_names().unwrap(), ["I"]);

        let chan = AiVoltageChannel::new("Dev1/ai0:1", 0.0, 0.5).named("I, Q");
        assert_eq!(chan.virtual_names().unwrap(), ["I", "Q"]);

        let chan = AiVoltageChannel::new("Dev1/ai0:2", 0.0, 0.5).named("V");
        assert_eq!(chan.virtual_names().unwrap(), ["V0", "V1", "V2"]);

        let chan = AiVoltageChannel::new("Dev1/ai0:2", 0.0, 0.5);
        assert_eq!(
            chan.virtual_names().unwrap(),
            ["Dev1/ai0", "Dev1/ai1", "Dev1/ai2"]
        );

        let chan = AiVoltageChannel::new("Dev1/ai0:2", 0.0, 0.5).named("A, B");
        assert!(chan.virtual_names().is_err());
    }

    #[test]
    fn range_validation() {
        assert!(AiVoltageChannel::new("Dev1/ai0", 0.5, 0.0).validate().is_err());
        assert!(AiVoltageChannel::new("Dev1/ai0", 0.0, f64::INFINITY).validate().is_err());
        assert!(AiVoltageChannel::new("Dev1/ai0", -10.0, 10.0)
            .with_units(VoltageUnits::FromCustomScale(String::new()))
            .validate()
            .is_err());
        assert!(AiVoltageChannel::new("Dev1/ai0", -10.0, 10.0).validate().is_ok());
    }

    #[test]
    fn device_names() {
        assert_eq!(device_of("/Dev1/ai0"), "Dev1");
        assert_eq!(device_of("PXI1Slot3/ai0:3"), "PXI1Slot3");
    }
}
