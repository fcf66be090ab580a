/// JSON report and command protocol of the serial/bus fallback transport.
///
/// All messages are newline-delimited JSON (NDJSON), small enough for one
/// outbound queue slot. Uses `heapless` types for no_std/no-alloc operation.
/// The radio uplink carries the same reports in its own byte encoding, which
/// is not defined here.
use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::config::CounterMode;
use crate::defaults::PAYLOAD_MAX;

/// Maximum length for MAC address strings ("AA:BB:CC:DD:EE:FF")
pub type MacString = String<18>;

/// Messages sent from the node
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum DeviceMessage<'a> {
    /// Presence counts of the cycle
    #[serde(rename = "count")]
    Count {
        wifi: u16,
        ble: u16,
        total: u16,
        /// Clock status symbol
        clock: char,
    },
    /// Device status report
    #[serde(rename = "status")]
    Status {
        /// Uptime in seconds
        uptime: u32,
        /// Free heap in bytes
        heap_free: u32,
        clock: char,
        /// Messages waiting across all send queues
        queue: u16,
        /// Board identifier
        board: &'static str,
        /// Firmware version
        version: &'static str,
    },
    /// Environmental readings, as provided by the sensor collaborator
    #[serde(rename = "sensor")]
    Sensor { values: &'a [i32] },
    /// A watched beacon was seen
    #[serde(rename = "beacon")]
    Beacon { idx: u8, rssi: i8 },
    /// Network time request
    #[serde(rename = "time_req")]
    TimeRequest { seq: u8 },
    /// Command rejected
    #[serde(rename = "error")]
    Error { msg: &'static str },
}

/// Commands sent to the node.
///
/// Deserialized manually via [`RawCommand`] in `comm::parse_command()` because
/// `serde_json_core` does not support internally tagged enums (`deserialize_any`).
#[derive(Debug, PartialEq)]
pub enum RemoteCommand {
    /// Wi-Fi RSSI floor in dBm; `None` disables the filter
    SetRssi { limit: Option<i8> },
    SetMode { mode: CounterMode },
    /// Payload send cycle in seconds
    SetSendCycle { secs: u32 },
    /// Raise beacon alarms for watched addresses
    SetMonitor { enabled: bool },
    /// Add an address to the beacon watch list
    AddBeacon { mac: [u8; 6] },
    ResetCounters,
    /// Drop everything waiting in the send queues
    FlushQueues,
    /// Start a time sync now
    TimeSync,
    /// Time server's answer to a `time_req`
    TimeAnswer { seq: u8, epoch: u64, ms: u16 },
    GetStatus,
    Restart,
}

/// Wire format for commands: flat struct that `serde_json_core` can
/// deserialize without `deserialize_any`. Converted to [`RemoteCommand`] in
/// `comm::parse_command()`.
#[derive(Deserialize)]
pub(crate) struct RawCommand {
    pub cmd: heapless::String<16>,
    #[serde(default)]
    pub rssi: Option<i8>,
    #[serde(default)]
    pub mode: Option<CounterMode>,
    #[serde(default)]
    pub secs: Option<u32>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub mac: Option<MacString>,
    #[serde(default)]
    pub seq: Option<u8>,
    #[serde(default)]
    pub epoch: Option<u64>,
    #[serde(default)]
    pub ms: Option<u16>,
}

/// Firmware version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a serialized JSON message
pub const MAX_MSG_LEN: usize = PAYLOAD_MAX;

/// Buffer type for serialized JSON messages
pub type MsgBuffer = Vec<u8, MAX_MSG_LEN>;

#[cfg(test)]
mod tests {
    use super::*;

    fn to_json<'b>(msg: &DeviceMessage, buf: &'b mut [u8]) -> &'b str {
        let len = serde_json_core::to_slice(msg, buf).unwrap();
        core::str::from_utf8(&buf[..len]).unwrap()
    }

    #[test]
    fn remote_command_equality() {
        assert_eq!(RemoteCommand::Restart, RemoteCommand::Restart);
        assert_eq!(
            RemoteCommand::SetRssi { limit: Some(-75) },
            RemoteCommand::SetRssi { limit: Some(-75) }
        );
        assert_ne!(RemoteCommand::ResetCounters, RemoteCommand::FlushQueues);
    }

    #[test]
    fn serialize_count_message() {
        let msg = DeviceMessage::Count {
            wifi: 12,
            ble: 30,
            total: 42,
            clock: 'G',
        };
        let mut buf = [0u8; MAX_MSG_LEN];
        let json = to_json(&msg, &mut buf);
        assert!(json.contains(r#""type":"count""#));
        assert!(json.contains(r#""wifi":12"#));
        assert!(json.contains(r#""total":42"#));
        assert!(json.contains(r#""clock":"G""#));
    }

    #[test]
    fn largest_count_fits_one_slot() {
        let msg = DeviceMessage::Count {
            wifi: u16::MAX,
            ble: u16::MAX,
            total: u16::MAX,
            clock: '?',
        };
        let mut buf = [0u8; MAX_MSG_LEN];
        assert!(serde_json_core::to_slice(&msg, &mut buf).is_ok());
    }

    #[test]
    fn serialize_status_message() {
        let msg = DeviceMessage::Status {
            uptime: 120,
            heap_free: 48000,
            clock: '~',
            queue: 3,
            board: "m5stickc_plus2",
            version: "0.1.0",
        };
        let mut buf = [0u8; MAX_MSG_LEN];
        let json = to_json(&msg, &mut buf);
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""uptime":120"#));
        assert!(json.contains(r#""queue":3"#));
        assert!(json.contains(r#""board":"m5stickc_plus2""#));
    }

    #[test]
    fn serialize_sensor_message() {
        let values = [215, -3, 1013];
        let msg = DeviceMessage::Sensor { values: &values };
        let mut buf = [0u8; MAX_MSG_LEN];
        assert_eq!(
            to_json(&msg, &mut buf),
            r#"{"type":"sensor","values":[215,-3,1013]}"#
        );
    }

    #[test]
    fn serialize_beacon_and_time_request() {
        let mut buf = [0u8; MAX_MSG_LEN];
        assert_eq!(
            to_json(&DeviceMessage::Beacon { idx: 2, rssi: -67 }, &mut buf),
            r#"{"type":"beacon","idx":2,"rssi":-67}"#
        );
        assert_eq!(
            to_json(&DeviceMessage::TimeRequest { seq: 7 }, &mut buf),
            r#"{"type":"time_req","seq":7}"#
        );
    }

    // ── Version constant ────────────────────────────────────────────

    #[test]
    fn version_is_semver() {
        let parts: heapless::Vec<&str, 4> = VERSION.split('.').collect();
        assert_eq!(
            parts.len(),
            3,
            "VERSION should be semver (major.minor.patch)"
        );
        for part in &parts {
            assert!(
                part.parse::<u32>().is_ok(),
                "VERSION component '{}' is not a number",
                part
            );
        }
    }
}
