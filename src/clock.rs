/// Clock confidence state machine, time samples and calendar conversion.
///
/// [`ClockState`] is ordered by confidence. A time committed from a source
/// sets the state to that source's rank, up or down. The free-running clock
/// commits nothing, so it only lifts an unsynced clock to dirty.
/// [`ClockEvent::Stale`] moves the state down one step per missed resync
/// period.
use serde::Serialize;

use crate::error::SyncError;

/// How much the local wall clock is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ClockState {
    /// Never set since boot.
    Unsynced = 0,
    /// Free-running, or decayed from a better state.
    Dirty = 1,
    /// Set from the battery-backed RTC.
    Reserve = 2,
    /// Set from a network time handshake.
    SyncedNetwork = 3,
    /// Set from a satellite receiver.
    SyncedSatellite = 4,
}

/// Input to the clock state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    /// A plausible sample from this source was committed.
    Synced(TimeSource),
    /// An attempt failed or produced an implausible sample.
    SyncFailed,
    /// The decay period passed without a resync.
    Stale,
}

impl ClockState {
    /// Transition table.
    pub fn apply(self, event: ClockEvent) -> ClockState {
        use ClockState::*;
        match event {
            ClockEvent::Synced(TimeSource::FreeRunning) => self.max(Dirty),
            ClockEvent::Synced(source) => source.confidence(),
            ClockEvent::SyncFailed => self,
            ClockEvent::Stale => match self {
                SyncedSatellite => SyncedNetwork,
                SyncedNetwork => Reserve,
                Reserve => Dirty,
                Dirty => Dirty,
                Unsynced => Unsynced,
            },
        }
    }

    /// One-character status indicator.
    pub fn symbol(self) -> char {
        match self {
            ClockState::SyncedSatellite => 'G',
            ClockState::SyncedNetwork => 'L',
            ClockState::Reserve => 'R',
            ClockState::Dirty => '~',
            ClockState::Unsynced => '?',
        }
    }

    pub fn is_synced(self) -> bool {
        self >= ClockState::Reserve
    }
}

/// Where a time sample came from, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    Satellite,
    Network,
    Rtc,
    FreeRunning,
}

impl TimeSource {
    /// Sources in the order `calibrate` tries them.
    pub const RANKED: [TimeSource; 4] = [
        TimeSource::Satellite,
        TimeSource::Network,
        TimeSource::Rtc,
        TimeSource::FreeRunning,
    ];

    /// Clock state reached by a successful sync from this source.
    pub fn confidence(self) -> ClockState {
        match self {
            TimeSource::Satellite => ClockState::SyncedSatellite,
            TimeSource::Network => ClockState::SyncedNetwork,
            TimeSource::Rtc => ClockState::Reserve,
            TimeSource::FreeRunning => ClockState::Dirty,
        }
    }

    /// Sources whose time is worth writing back to the RTC.
    pub fn updates_rtc(self) -> bool {
        matches!(self, TimeSource::Satellite | TimeSource::Network)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeSource::Satellite => "gps",
            TimeSource::Network => "network",
            TimeSource::Rtc => "rtc",
            TimeSource::FreeRunning => "free",
        }
    }
}

/// One candidate wall-clock reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSample {
    pub epoch: u64,
    /// Milliseconds past `epoch`, 0..1000.
    pub frac_ms: u16,
    pub source: TimeSource,
}

impl TimeSample {
    pub fn new(epoch: u64, frac_ms: u16, source: TimeSource) -> Self {
        Self {
            epoch,
            frac_ms,
            source,
        }
    }

    pub fn confidence(&self) -> ClockState {
        self.source.confidence()
    }

    /// Reject samples from before the plausibility floor.
    pub fn check(&self, floor: u64) -> Result<(), SyncError> {
        if is_plausible(self.epoch, floor) {
            Ok(())
        } else {
            Err(SyncError::Implausible {
                epoch: self.epoch,
                floor,
            })
        }
    }
}

/// A wall-clock time is plausible when it is not earlier than `floor`.
pub fn is_plausible(epoch: u64, floor: u64) -> bool {
    epoch >= floor
}

/// A UTC calendar time as RTC chips and satellite receivers report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTime {
    /// Epoch seconds, or `None` for an impossible date or one before 1970.
    pub fn to_epoch(&self) -> Option<u64> {
        let valid = (1..=12).contains(&self.month)
            && self.day >= 1
            && self.day <= days_in_month(self.year, self.month)
            && self.hour < 24
            && self.minute < 60
            && self.second < 60;
        if !valid {
            return None;
        }
        let days = days_from_civil(self.year as i64, self.month as i64, self.day as i64);
        if days < 0 {
            return None;
        }
        Some(
            days as u64 * 86_400
                + self.hour as u64 * 3_600
                + self.minute as u64 * 60
                + self.second as u64,
        )
    }

    pub fn from_epoch(epoch: u64) -> Self {
        let (year, month, day) = civil_from_days((epoch / 86_400) as i64);
        let secs = epoch % 86_400;
        Self {
            year: year as u16,
            month,
            day,
            hour: (secs / 3_600) as u8,
            minute: (secs / 60 % 60) as u8,
            second: (secs % 60) as u8,
        }
    }
}

/// Day of the week for an epoch second, 0 being Sunday.
pub fn weekday(epoch: u64) -> u8 {
    // 1970-01-01 was a Thursday
    ((epoch / 86_400 + 4) % 7) as u8
}

fn is_leap(year: u16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        2 if is_leap(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

// Proleptic Gregorian day count relative to 1970-01-01, in 400-year eras.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(z: i64) -> (i64, u8, u8) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
    let y = yoe + era * 400 + if m <= 2 { 1 } else { 0 };
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered_by_confidence() {
        assert!(ClockState::Unsynced < ClockState::Dirty);
        assert!(ClockState::Dirty < ClockState::Reserve);
        assert!(ClockState::Reserve < ClockState::SyncedNetwork);
        assert!(ClockState::SyncedNetwork < ClockState::SyncedSatellite);
    }

    #[test]
    fn sync_raises_to_source_rank() {
        let s = ClockState::Unsynced.apply(ClockEvent::Synced(TimeSource::Rtc));
        assert_eq!(s, ClockState::Reserve);
        let s = s.apply(ClockEvent::Synced(TimeSource::Satellite));
        assert_eq!(s, ClockState::SyncedSatellite);
    }

    #[test]
    fn committed_source_sets_its_rank() {
        let s = ClockState::SyncedSatellite.apply(ClockEvent::Synced(TimeSource::Rtc));
        assert_eq!(s, ClockState::Reserve);
        let s = ClockState::SyncedSatellite.apply(ClockEvent::Synced(TimeSource::Network));
        assert_eq!(s, ClockState::SyncedNetwork);
    }

    #[test]
    fn free_running_never_downgrades() {
        let s = ClockState::SyncedNetwork.apply(ClockEvent::Synced(TimeSource::FreeRunning));
        assert_eq!(s, ClockState::SyncedNetwork);
        let s = ClockState::Unsynced.apply(ClockEvent::Synced(TimeSource::FreeRunning));
        assert_eq!(s, ClockState::Dirty);
    }

    #[test]
    fn failure_keeps_state() {
        for s in [
            ClockState::Unsynced,
            ClockState::Dirty,
            ClockState::Reserve,
            ClockState::SyncedNetwork,
            ClockState::SyncedSatellite,
        ] {
            assert_eq!(s.apply(ClockEvent::SyncFailed), s);
        }
    }

    #[test]
    fn decay_walks_down_to_dirty() {
        let mut s = ClockState::SyncedSatellite;
        let mut seen = heapless::Vec::<ClockState, 8>::new();
        for _ in 0..6 {
            s = s.apply(ClockEvent::Stale);
            let _ = seen.push(s);
        }
        assert_eq!(
            seen.as_slice(),
            &[
                ClockState::SyncedNetwork,
                ClockState::Reserve,
                ClockState::Dirty,
                ClockState::Dirty,
                ClockState::Dirty,
                ClockState::Dirty,
            ]
        );
        assert_eq!(
            ClockState::Unsynced.apply(ClockEvent::Stale),
            ClockState::Unsynced
        );
    }

    #[test]
    fn symbols() {
        assert_eq!(ClockState::SyncedSatellite.symbol(), 'G');
        assert_eq!(ClockState::SyncedNetwork.symbol(), 'L');
        assert_eq!(ClockState::Reserve.symbol(), 'R');
        assert_eq!(ClockState::Dirty.symbol(), '~');
        assert_eq!(ClockState::Unsynced.symbol(), '?');
    }

    #[test]
    fn ranked_sources_have_descending_confidence() {
        for pair in TimeSource::RANKED.windows(2) {
            assert!(pair[0].confidence() > pair[1].confidence());
        }
    }

    #[test]
    fn plausibility_floor() {
        let floor = 1_600_000_000;
        assert!(is_plausible(floor, floor));
        assert!(!is_plausible(floor - 1, floor));
        let s = TimeSample::new(0, 0, TimeSource::Rtc);
        assert_eq!(
            s.check(floor),
            Err(SyncError::Implausible { epoch: 0, floor })
        );
    }

    #[test]
    fn calendar_time_converts_both_ways() {
        let t = DateTime {
            year: 2023,
            month: 11,
            day: 14,
            hour: 22,
            minute: 13,
            second: 20,
        };
        assert_eq!(t.to_epoch(), Some(1_700_000_000));
        assert_eq!(DateTime::from_epoch(1_700_000_000), t);
        assert_eq!(weekday(1_700_000_000), 2);
        assert_eq!(DateTime::from_epoch(0).year, 1970);
    }

    #[test]
    fn leap_day_only_in_leap_years() {
        let leap = DateTime {
            year: 2024,
            month: 2,
            day: 29,
            hour: 0,
            minute: 0,
            second: 0,
        };
        assert_eq!(leap.to_epoch(), Some(1_709_164_800));
        assert_eq!(DateTime::from_epoch(1_709_164_800), leap);
        assert_eq!(DateTime { year: 2023, ..leap }.to_epoch(), None);
        assert_eq!(DateTime { year: 1969, month: 12, day: 31, ..leap }.to_epoch(), None);
        assert_eq!(DateTime { hour: 24, ..leap }.to_epoch(), None);
    }
}
