//! NMEA time decoding for serial satellite receivers.
//!
//! Only `RMC` sentences are used. They carry the UTC time of the fix, the
//! date and a validity flag, which is everything time sync needs.

use core::cell::Cell;

use critical_section::Mutex;

use crate::clock::DateTime;
use crate::defaults::{MAX_FIX_AGE_MS, NMEA_COMPENSATION_MS};

/// Longest sentence the standard allows, `$` through checksum.
pub const NMEA_MAX_LEN: usize = 82;

/// Reassembles sentences from the serial byte stream.
pub struct NmeaDecoder {
    line: heapless::Vec<u8, NMEA_MAX_LEN>,
    overflow: bool,
}

impl NmeaDecoder {
    pub const fn new() -> Self {
        Self {
            line: heapless::Vec::new(),
            overflow: false,
        }
    }

    /// Feed one byte. Returns the fix time in epoch milliseconds when it
    /// completes a valid `RMC` sentence.
    pub fn feed(&mut self, byte: u8) -> Option<u64> {
        match byte {
            b'$' => {
                self.line.clear();
                self.overflow = false;
                None
            }
            b'\r' => None,
            b'\n' => {
                let fix = if self.overflow {
                    None
                } else {
                    parse_rmc(&self.line)
                };
                self.line.clear();
                self.overflow = false;
                fix
            }
            _ => {
                if self.line.push(byte).is_err() {
                    self.overflow = true;
                }
                None
            }
        }
    }
}

impl Default for NmeaDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a sentence body (after `$`, with checksum) into epoch milliseconds.
///
/// `None` for other sentence types, a bad checksum, a receiver without a fix
/// or malformed fields.
pub fn parse_rmc(sentence: &[u8]) -> Option<u64> {
    let star = sentence.iter().rposition(|&b| b == b'*')?;
    let (body, sum) = (&sentence[..star], &sentence[star + 1..]);
    let expected = u8::from_str_radix(core::str::from_utf8(sum).ok()?, 16).ok()?;
    if body.iter().fold(0u8, |acc, &b| acc ^ b) != expected {
        log::debug!("NMEA checksum mismatch");
        return None;
    }

    let mut fields = body.split(|&b| b == b',');
    let id = fields.next()?;
    if id.len() != 5 || !id.ends_with(b"RMC") {
        return None;
    }
    let time = fields.next()?;
    if fields.next()? != b"A" {
        return None;
    }
    let date = fields.nth(6)?;
    if time.len() < 6 || date.len() != 6 {
        return None;
    }

    let t = DateTime {
        year: 2000 + two_digits(&date[4..6])? as u16,
        month: two_digits(&date[2..4])?,
        day: two_digits(&date[0..2])?,
        hour: two_digits(&time[0..2])?,
        minute: two_digits(&time[2..4])?,
        second: two_digits(&time[4..6])?,
    };
    let millis = match time.get(6..) {
        Some([b'.', frac @ ..]) => fraction_ms(frac)?,
        Some([]) => 0,
        _ => return None,
    };
    Some(t.to_epoch()? * 1000 + millis)
}

fn two_digits(b: &[u8]) -> Option<u8> {
    match b {
        [h, l] if h.is_ascii_digit() && l.is_ascii_digit() => Some((h - b'0') * 10 + (l - b'0')),
        _ => None,
    }
}

fn fraction_ms(frac: &[u8]) -> Option<u64> {
    let mut ms = 0u64;
    for i in 0..3 {
        let d = match frac.get(i) {
            Some(b) if b.is_ascii_digit() => (b - b'0') as u64,
            Some(_) => return None,
            None => 0,
        };
        ms = ms * 10 + d;
    }
    Some(ms)
}

/// The last decoded fix and the uptime it arrived at.
///
/// Written by the serial reader, read by time sync.
pub struct SatelliteFix {
    last: Mutex<Cell<Option<(u64, u64)>>>,
}

impl SatelliteFix {
    pub const fn new() -> Self {
        Self {
            last: Mutex::new(Cell::new(None)),
        }
    }

    pub fn store(&self, fix_ms: u64, received_at: u64) {
        critical_section::with(|cs| self.last.borrow(cs).set(Some((fix_ms, received_at))));
    }

    /// Wall time at `now_ms` as (epoch seconds, milliseconds), carried
    /// forward from the last fix. `None` when that fix is stale.
    pub fn time_at(&self, now_ms: u64) -> Option<(u64, u16)> {
        let (fix_ms, received_at) = critical_section::with(|cs| self.last.borrow(cs).get())?;
        let age = now_ms.checked_sub(received_at)?;
        if age > MAX_FIX_AGE_MS {
            return None;
        }
        let wall = fix_ms + age + NMEA_COMPENSATION_MS;
        Some((wall / 1000, (wall % 1000) as u16))
    }
}

impl Default for SatelliteFix {
    fn default() -> Self {
        Self::new()
    }
}
