/// Capture adapters for Wi-Fi and BLE traffic.
///
/// WiFi: promiscuous-mode frames are reduced to their transmitter address with
/// the ieee80211 crate, falling back to the raw header for anything it does
/// not model. BLE: advertisement reports are reduced to the advertiser
/// address. Both produce a [`RawObservation`] that the firmware hands straight
/// to the presence counter from callback context.
use ieee80211::match_frames;
use ieee80211::mgmt_frame::{BeaconFrame, ProbeRequestFrame, ProbeResponseFrame};

use crate::error::CountError;

/// WiFi channels to scan (2.4 GHz only: ESP32/ESP32-S3 promiscuous mode is 2.4 GHz)
pub const WIFI_CHANNELS: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13];

/// Default dwell time per channel in milliseconds.
/// Handsets probe in bursts a few hundred ms apart, so a short dwell with
/// frequent revisits catches more of them than a long one.
/// Full cycle: 13 channels × 50ms = 0.65s.
pub const DEFAULT_DWELL_MS: u64 = 50;

/// Link type an observation was captured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Wifi,
    Ble,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Wifi => "wifi",
            LinkType::Ble => "ble",
        }
    }
}

/// One captured frame or advertisement, consumed immediately by the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawObservation {
    pub address: [u8; 6],
    pub rssi: i8,
    pub link: LinkType,
}

impl RawObservation {
    pub const fn new(address: [u8; 6], rssi: i8, link: LinkType) -> Self {
        Self {
            address,
            rssi,
            link,
        }
    }

    /// Build an observation from an address of unchecked length.
    pub fn from_slice(address: &[u8], rssi: i8, link: LinkType) -> Result<Self, CountError> {
        let address: [u8; 6] = address
            .try_into()
            .map_err(|_| CountError::AddressLength { len: address.len() })?;
        Ok(Self::new(address, rssi, link))
    }
}

/// Extract the sender of a raw 802.11 frame.
///
/// Beacons and probes are parsed by the ieee80211 crate. Data and other frame
/// types fall through to a raw header parse of the transmitter address
/// (Address 2, offset 10).
///
/// Safe to call from ISR context (no allocation, no blocking).
pub fn parse_wifi_frame(frame: &[u8], rssi: i8, channel: u8) -> Option<RawObservation> {
    let result = match_frames! {
        frame,
        beacon = BeaconFrame<'_> => {
            beacon.header.transmitter_address.0
        }
        probe_req = ProbeRequestFrame<'_> => {
            probe_req.header.transmitter_address.0
        }
        probe_resp = ProbeResponseFrame<'_> => {
            probe_resp.header.transmitter_address.0
        }
    };

    let address = match result {
        Ok(mac) => mac,
        Err(_) => {
            // Minimum 16 bytes: 2 (frame ctrl) + 2 (duration) + 6 (addr1) + 6 (addr2)
            if frame.len() < 16 {
                return None;
            }
            frame[10..16].try_into().ok()?
        }
    };

    log::trace!("wifi frame ch{} rssi {}", channel, rssi);
    Some(RawObservation::new(address, rssi, LinkType::Wifi))
}
