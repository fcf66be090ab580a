/// Compiled-in defaults: vendor allow-list, cycle periods, sync tuning and
/// LoRaWAN port assignments.
///
/// Runtime overrides live in [`crate::config::NodeConfig`]; everything here is
/// the value a freshly flashed node starts with.

/// Handset vendor OUI prefixes (3-byte prefix, vendor name).
///
/// Used only when the vendor filter is enabled, and only on the Wi-Fi path:
/// BLE advertisers mostly use random addresses with no meaningful OUI.
pub static VENDOR_OUIS: &[([u8; 3], &str)] = &[
    // === Apple ===
    ([0x00, 0x03, 0x93], "Apple"),
    ([0x00, 0x1C, 0xB3], "Apple"),
    ([0x28, 0xCF, 0xE9], "Apple"),
    ([0x3C, 0x07, 0x54], "Apple"),
    ([0xAC, 0xBC, 0x32], "Apple"),
    ([0xF0, 0xDB, 0xF8], "Apple"),
    // === Samsung ===
    ([0x00, 0x12, 0xFB], "Samsung"),
    ([0x00, 0x16, 0x32], "Samsung"),
    ([0x5C, 0x0A, 0x5B], "Samsung"),
    ([0x8C, 0x77, 0x12], "Samsung"),
    ([0xF0, 0x25, 0xB7], "Samsung"),
    // === Google ===
    ([0x3C, 0x5A, 0xB4], "Google"),
    ([0x54, 0x60, 0x09], "Google"),
    ([0xF4, 0xF5, 0xD8], "Google"),
    // === Huawei ===
    ([0x00, 0xE0, 0xFC], "Huawei"),
    ([0x28, 0x6E, 0xD4], "Huawei"),
    ([0x48, 0x46, 0xFB], "Huawei"),
    // === Xiaomi ===
    ([0x28, 0x6C, 0x07], "Xiaomi"),
    ([0x34, 0x80, 0xB3], "Xiaomi"),
    ([0x64, 0x09, 0x80], "Xiaomi"),
    // === OnePlus ===
    ([0x94, 0x65, 0x2D], "OnePlus"),
    ([0xC0, 0xEE, 0xFB], "OnePlus"),
];

// ── Counting ─────────────────────────────────────────────────────────

/// Capacity of each per-link-type dedup set. Must be a power of two.
pub const DEDUP_CAPACITY: usize = 1024;

/// Default Wi-Fi RSSI floor (dBm). `None` disables the filter.
pub const RSSI_LIMIT: Option<i8> = None;

/// Maximum number of watched beacon addresses in monitor mode.
pub const MAX_BEACONS: usize = 8;

// ── Cycle periods ────────────────────────────────────────────────────

/// Payload send cycle (seconds).
pub const SEND_CYCLE_SECS: u32 = 120;

/// Shortest send cycle a remote command may set (seconds).
pub const MIN_SEND_CYCLE_SECS: u32 = 10;

/// Housekeeping cycle (seconds).
pub const HOUSEKEEPING_SECS: u32 = 60;

/// Environmental sensor read cycle (seconds).
pub const SENSOR_CYCLE_SECS: u32 = 60;

/// Display refresh period (milliseconds).
pub const DISPLAY_REFRESH_MS: u32 = 40;

/// Deep sleep duration after a send cycle (seconds). 0 = never sleep.
pub const SLEEP_CYCLE_SECS: u32 = 0;

/// Most readings one sensor report carries.
pub const MAX_SENSOR_VALUES: usize = 8;

/// Free heap low-water mark that triggers the exhaustion ladder (bytes).
pub const MEMORY_LOW_WATER: u32 = 4 * 1024;

// ── Scheduler ────────────────────────────────────────────────────────

/// A radio job due within this horizon keeps the masking gate shut.
pub const RADIO_GUARD_MS: u32 = 100;

/// Acquisition timeout for the shared I2C bus.
pub const BUS_TIMEOUT_MS: u32 = 50;

// ── Time sync ────────────────────────────────────────────────────────

/// Periodic resync after a successful sync (minutes).
pub const SYNC_INTERVAL_MIN: u32 = 60;

/// Retry after a failed or implausible sync (minutes).
pub const SYNC_RETRY_MIN: u32 = 5;

/// Confidence decays one step after this long without a resync (minutes).
pub const SYNC_DECAY_MIN: u32 = 24 * 60;

/// Network time handshake: number of request/answer samples.
pub const SYNC_SAMPLES: u8 = 3;

/// Upper bound for [`SYNC_SAMPLES`]; sizes the sample buffer.
pub const MAX_SYNC_SAMPLES: usize = 8;

/// Spacing between network time requests (seconds).
pub const SYNC_CYCLE_SECS: u32 = 2;

/// Extra wait for late answers after the last request (seconds).
pub const SYNC_TIMEOUT_SECS: u32 = 30;

/// Compensation for answer processing latency (milliseconds).
pub const SYNC_FIXUP_MS: i64 = 16;

/// Highest sequence number before wrap-around; 0xFF marks handshake end.
pub const SYNC_MAX_SEQ: u8 = 0xFE;

/// Serial rate of the satellite receiver.
pub const GPS_BAUD: u32 = 9600;

/// Receiver latency between the fix and the end of its sentence (milliseconds).
pub const NMEA_COMPENSATION_MS: u64 = 20;

/// A satellite fix older than this is not used for time (milliseconds).
pub const MAX_FIX_AGE_MS: u64 = 2_000;

/// Unix seconds at build time; anything earlier is an implausible clock.
pub const BUILD_EPOCH: u64 = parse_epoch(env!("PAXNODE_BUILD_EPOCH"));

const fn parse_epoch(s: &str) -> u64 {
    let bytes = s.as_bytes();
    let mut value = 0u64;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_digit() {
            value = value * 10 + (b - b'0') as u64;
        }
        i += 1;
    }
    value
}

// ── Ports ────────────────────────────────────────────────────────────

/// Presence counts
pub const COUNTER_PORT: u8 = 1;
/// Device status / remote command replies
pub const STATUS_PORT: u8 = 2;
/// Beacon monitor alarms
pub const BEACON_PORT: u8 = 6;
/// Environmental sensor readings
pub const SENSOR_PORT: u8 = 7;
/// Network time requests
pub const TIME_PORT: u8 = 9;

// ── Outbound queues ──────────────────────────────────────────────────

/// Depth of each per-transport send queue.
pub const SEND_QUEUE_SIZE: usize = 8;

/// Fixed payload buffer size of one outbound message.
pub const PAYLOAD_MAX: usize = 128;
