//! Runtime node configuration.
//!
//! Persisting this struct is the configuration manager's job; this crate only
//! defines its shape, its defaults and which values are acceptable. The
//! firmware shares it between tasks as a `critical_section::Mutex<Cell<_>>`.

use core::cell::Cell;

use critical_section::Mutex;
use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::ConfigError;

/// How the send cycle treats the counting cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterMode {
    /// Reset counters and rotate the salt after every count report.
    Cyclic,
    /// Never reset from the send cycle; counts accumulate until an explicit reset.
    Cumulative,
    /// Like `Cyclic`, but count reports go out at high priority.
    CyclicConfirmed,
}

impl CounterMode {
    /// Whether the send cycle starts a fresh counting cycle.
    pub fn resets_after_send(self) -> bool {
        !matches!(self, CounterMode::Cumulative)
    }
}

/// Admission filters of the presence counting engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountFilter {
    /// Wi-Fi observations weaker than this (dBm) are ignored. BLE is exempt.
    pub rssi_limit: Option<i8>,
    /// Restrict Wi-Fi addresses to the vendor OUI allow-list.
    pub vendor_filter: bool,
    /// Count BLE advertisers at all.
    pub ble_enabled: bool,
    /// Count Wi-Fi senders at all.
    pub wifi_enabled: bool,
}

impl CountFilter {
    pub const fn new() -> Self {
        Self {
            rssi_limit: defaults::RSSI_LIMIT,
            vendor_filter: false,
            ble_enabled: true,
            wifi_enabled: true,
        }
    }
}

impl Default for CountFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Time synchronisation tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Resync period after success (minutes). 0 disables periodic sync.
    pub interval_min: u32,
    /// Resync period after failure (minutes).
    pub retry_min: u32,
    /// Confidence decays one step after this long without a resync (minutes).
    pub decay_min: u32,
    /// Use the network time handshake as a source.
    pub network: bool,
    /// Number of network request/answer samples.
    pub samples: u8,
    /// Spacing between network requests (seconds).
    pub cycle_secs: u32,
    /// Extra wait for late answers (seconds).
    pub timeout_secs: u32,
    /// Samples earlier than this Unix time are implausible.
    pub epoch_floor: u64,
    /// Emit a wall-clock telegram once per pulse.
    pub telegram: bool,
}

impl SyncConfig {
    pub const fn new() -> Self {
        Self {
            interval_min: defaults::SYNC_INTERVAL_MIN,
            retry_min: defaults::SYNC_RETRY_MIN,
            decay_min: defaults::SYNC_DECAY_MIN,
            network: defaults::SYNC_SAMPLES > 0,
            samples: defaults::SYNC_SAMPLES,
            cycle_secs: defaults::SYNC_CYCLE_SECS,
            timeout_secs: defaults::SYNC_TIMEOUT_SECS,
            epoch_floor: defaults::BUILD_EPOCH,
            telegram: false,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_min as u64 * 60_000
    }

    pub fn retry_ms(&self) -> u64 {
        self.retry_min as u64 * 60_000
    }

    pub fn decay_ms(&self) -> u64 {
        self.decay_min as u64 * 60_000
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Complete runtime configuration of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub filter: CountFilter,
    pub counter_mode: CounterMode,
    /// Payload send cycle (seconds).
    pub send_cycle_secs: u32,
    /// Housekeeping cycle (seconds).
    pub housekeeping_secs: u32,
    /// Sensor read cycle (seconds). 0 disables sensor reports.
    pub sensor_cycle_secs: u32,
    /// Display refresh period (milliseconds). 0 disables refresh.
    pub display_refresh_ms: u32,
    /// Deep sleep after a send cycle (seconds). 0 disables sleep.
    pub sleep_cycle_secs: u32,
    /// Free memory low-water mark (bytes).
    pub memory_low_water: u32,
    /// Raise beacon alarms for watched addresses.
    pub monitor_mode: bool,
    pub sync: SyncConfig,
}

impl NodeConfig {
    pub const fn new() -> Self {
        Self {
            filter: CountFilter::new(),
            counter_mode: CounterMode::Cyclic,
            send_cycle_secs: defaults::SEND_CYCLE_SECS,
            housekeeping_secs: defaults::HOUSEKEEPING_SECS,
            sensor_cycle_secs: defaults::SENSOR_CYCLE_SECS,
            display_refresh_ms: defaults::DISPLAY_REFRESH_MS,
            sleep_cycle_secs: defaults::SLEEP_CYCLE_SECS,
            memory_low_water: defaults::MEMORY_LOW_WATER,
            monitor_mode: false,
            sync: SyncConfig::new(),
        }
    }

    /// Check that the values are usable together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_cycle_secs < defaults::MIN_SEND_CYCLE_SECS {
            return Err(ConfigError::SendCycleTooShort {
                min: defaults::MIN_SEND_CYCLE_SECS,
            });
        }
        if self.housekeeping_secs == 0 {
            return Err(ConfigError::ZeroPeriod("housekeeping"));
        }
        if self.sync.network {
            if self.sync.samples == 0 {
                return Err(ConfigError::NoSyncSamples);
            }
            if self.sync.samples as usize > defaults::MAX_SYNC_SAMPLES {
                return Err(ConfigError::TooManySyncSamples {
                    samples: self.sync.samples,
                    max: defaults::MAX_SYNC_SAMPLES as u8,
                });
            }
            if self.sync.cycle_secs == 0 {
                return Err(ConfigError::ZeroPeriod("sync cycle"));
            }
        }
        if self.sync.interval_min > 0 && self.sync.retry_min >= self.sync.interval_min {
            return Err(ConfigError::RetryNotShorter);
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime config shared between the dispatcher, command handler and timers.
pub type SharedConfig = Mutex<Cell<NodeConfig>>;

/// Snapshot of the shared config.
pub fn load(shared: &SharedConfig) -> NodeConfig {
    critical_section::with(|cs| shared.borrow(cs).get())
}

/// Change the shared config, keeping the old one if the result is invalid.
pub fn update(
    shared: &SharedConfig,
    f: impl FnOnce(&mut NodeConfig),
) -> Result<NodeConfig, ConfigError> {
    critical_section::with(|cs| {
        let cell = shared.borrow(cs);
        let mut cfg = cell.get();
        f(&mut cfg);
        cfg.validate()?;
        cell.set(cfg);
        Ok(cfg)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(NodeConfig::new().validate(), Ok(()));
    }

    #[test]
    fn short_send_cycle_rejected() {
        let mut cfg = NodeConfig::new();
        cfg.send_cycle_secs = 2;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::SendCycleTooShort { .. })
        ));
    }

    #[test]
    fn retry_must_be_shorter_than_interval() {
        let mut cfg = NodeConfig::new();
        cfg.sync.retry_min = cfg.sync.interval_min;
        assert_eq!(cfg.validate(), Err(ConfigError::RetryNotShorter));
    }

    #[test]
    fn network_sync_needs_samples() {
        let mut cfg = NodeConfig::new();
        cfg.sync.samples = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::NoSyncSamples));

        cfg.sync.network = false;
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn too_many_samples_rejected() {
        let mut cfg = NodeConfig::new();
        cfg.sync.samples = 200;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TooManySyncSamples { samples: 200, .. })
        ));
    }

    #[test]
    fn only_cumulative_mode_keeps_counts() {
        assert!(CounterMode::Cyclic.resets_after_send());
        assert!(CounterMode::CyclicConfirmed.resets_after_send());
        assert!(!CounterMode::Cumulative.resets_after_send());
    }

    #[test]
    fn invalid_update_keeps_old_config() {
        let shared = SharedConfig::new(Cell::new(NodeConfig::new()));
        let r = update(&shared, |c| c.send_cycle_secs = 1);
        assert!(matches!(r, Err(ConfigError::SendCycleTooShort { .. })));
        assert_eq!(load(&shared).send_cycle_secs, defaults::SEND_CYCLE_SECS);

        let cfg = update(&shared, |c| c.send_cycle_secs = 300).unwrap();
        assert_eq!(cfg.send_cycle_secs, 300);
        assert_eq!(load(&shared).send_cycle_secs, 300);
    }

    #[test]
    fn config_json_round_trip() {
        let mut cfg = NodeConfig::new();
        cfg.filter.rssi_limit = Some(-70);
        cfg.counter_mode = CounterMode::Cumulative;
        cfg.sync.epoch_floor = 1_700_000_000;

        let mut buf = [0u8; 768];
        let len = serde_json_core::to_slice(&cfg, &mut buf).unwrap();
        let json = core::str::from_utf8(&buf[..len]).unwrap();
        assert!(json.contains(r#""counter_mode":"cumulative""#));
        assert!(json.contains(r#""rssi_limit":-70"#));

        let (back, _) = serde_json_core::from_slice::<NodeConfig>(&buf[..len]).unwrap();
        assert_eq!(back, cfg);
    }
}
