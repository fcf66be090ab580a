/// Admission filters for captured observations.
///
/// Decides whether a raw observation takes part in counting at all, before it
/// is hashed. RSSI and vendor filtering apply to Wi-Fi only; BLE advertisers
/// are exempt because they rotate random addresses and advertise at lower
/// power.
use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Vec;

use crate::config::CountFilter;
use crate::defaults::{MAX_BEACONS, VENDOR_OUIS};
use crate::scanner::{LinkType, RawObservation};

/// Why an observation was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Link type switched off in the config.
    Disabled,
    /// Wi-Fi signal below the RSSI limit.
    TooWeak,
    /// Wi-Fi OUI not on the vendor allow-list.
    Vendor,
}

/// Check an observation against the admission filters.
pub fn admit(obs: &RawObservation, filter: &CountFilter) -> Result<(), Rejection> {
    match obs.link {
        LinkType::Wifi => {
            if !filter.wifi_enabled {
                return Err(Rejection::Disabled);
            }
            if let Some(limit) = filter.rssi_limit {
                if obs.rssi < limit {
                    return Err(Rejection::TooWeak);
                }
            }
            if filter.vendor_filter && vendor_of(&obs.address).is_none() {
                return Err(Rejection::Vendor);
            }
            Ok(())
        }
        LinkType::Ble => {
            if filter.ble_enabled {
                Ok(())
            } else {
                Err(Rejection::Disabled)
            }
        }
    }
}

/// Look up the vendor allow-list entry for an address, if any.
pub fn vendor_of(mac: &[u8; 6]) -> Option<&'static str> {
    let oui = [mac[0], mac[1], mac[2]];
    VENDOR_OUIS
        .iter()
        .find(|(prefix, _)| *prefix == oui)
        .map(|&(_, vendor)| vendor)
}

/// Known beacon addresses watched in monitor mode.
#[derive(Debug, Clone, Default)]
pub struct BeaconWatchlist {
    beacons: Vec<[u8; 6], MAX_BEACONS>,
}

impl BeaconWatchlist {
    pub const fn new() -> Self {
        Self { beacons: Vec::new() }
    }

    /// Add a beacon. Returns its index, or `None` when the list is full.
    pub fn add(&mut self, mac: [u8; 6]) -> Option<u8> {
        if let Some(idx) = self.index_of(&mac) {
            return Some(idx);
        }
        self.beacons.push(mac).ok()?;
        Some((self.beacons.len() - 1) as u8)
    }

    pub fn clear(&mut self) {
        self.beacons.clear();
    }

    /// Index of a watched beacon.
    pub fn index_of(&self, mac: &[u8; 6]) -> Option<u8> {
        self.beacons
            .iter()
            .position(|b| b == mac)
            .map(|i| i as u8)
    }

    pub fn len(&self) -> usize {
        self.beacons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beacons.is_empty()
    }
}

/// Watch list shared between the command handler and capture callbacks.
pub type SharedWatchlist = Mutex<RefCell<BeaconWatchlist>>;

/// Format a 6-byte MAC address into "AA:BB:CC:DD:EE:FF" string
pub fn format_mac(mac: &[u8; 6], buf: &mut heapless::String<18>) {
    use core::fmt::Write;
    let _ = write!(
        buf,
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    );
}

/// Parse "AA:BB:CC:DD:EE:FF" (or with `-` separators).
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(|c: char| c == ':' || c == '-');
    for byte in mac.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}
