//! # Engine Configuration
//!
//! The engine has three knobs: which device to open, how long to wait on the
//! device before giving up, and the work-group size used for launches. The
//! only environment input is `CROPSIM_DEVICE`, a device-selection preference.
//!
//! ## Device selection
//!
//! Selection is deterministic and follows discovery order:
//!
//! | `CROPSIM_DEVICE`   | Policy                                                    |
//! |--------------------|-----------------------------------------------------------|
//! | unset / `first`    | first platform that has a device, its first device        |
//! | `P:D`              | device `D` of platform `P`                                |
//! | `D`                | device `D` of platform `0`                                |
//! | `gpu` / `cpu` / `accelerator` | first device of that kind, platforms in order  |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::backend::{DeviceKind, MAX_WORK_GROUP};

/// Environment variable holding the device-selection preference.
pub const DEVICE_ENV: &str = "CROPSIM_DEVICE";

/// Default bound on any single wait for the device.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default lanes per work group.
pub const DEFAULT_WORK_GROUP: u32 = 256;

/// Which device a session opens.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    #[default]
    First,
    Index { platform: usize, device: usize },
    Kind(DeviceKind),
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "" | "first" | "default" => return Ok(Self::First),
            "gpu" => return Ok(Self::Kind(DeviceKind::Gpu)),
            "cpu" => return Ok(Self::Kind(DeviceKind::Cpu)),
            "accelerator" => return Ok(Self::Kind(DeviceKind::Accelerator)),
            _ => {}
        }

        let parse = |v: &str| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid device preference '{}'", s))
        };
        match s.split_once(':') {
            Some((p, d)) => Ok(Self::Index {
                platform: parse(p)?,
                device: parse(d)?,
            }),
            None => Ok(Self::Index {
                platform: 0,
                device: parse(s)?,
            }),
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => write!(f, "first"),
            Self::Index { platform, device } => write!(f, "{}:{}", platform, device),
            Self::Kind(kind) => write!(f, "{}", kind.to_string().to_ascii_lowercase()),
        }
    }
}

/// Process-wide engine settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub device: DevicePreference,
    /// Bound on queue acquisition and on waiting for launched work
    pub timeout: Duration,
    /// Lanes per work group
    pub work_group: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DevicePreference::First,
            timeout: DEFAULT_TIMEOUT,
            work_group: DEFAULT_WORK_GROUP,
        }
    }
}

impl EngineConfig {
    /// Defaults, with the device preference taken from `CROPSIM_DEVICE` when
    /// set. An unparsable value is logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(DEVICE_ENV) {
            match value.parse() {
                Ok(pref) => config.device = pref,
                Err(e) => tracing::warn!("Ignoring {}: {}", DEVICE_ENV, e),
            }
        }
        config
    }

    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Lanes per work group, clamped to `1..=MAX_WORK_GROUP`.
    pub fn with_work_group(mut self, work_group: u32) -> Self {
        self.work_group = work_group.clamp(1, MAX_WORK_GROUP);
        self
    }
}
