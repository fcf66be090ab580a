/// Multi-source time synchronisation.
///
/// [`TimeKeeper`] owns the clock confidence state, the pulse discipline and
/// the resync schedule. `calibrate` tries the sources best first and commits
/// the first plausible sample through `set_time`, which lands the correction
/// on a whole second with the scheduler masked.
use embedded_hal::delay::DelayNs;

use crate::clock::{ClockEvent, ClockState, TimeSample, TimeSource};
use crate::config::SyncConfig;
use crate::error::{BusError, SyncError};
use crate::netsync::NetworkSync;
use crate::pulse::{PulseDiscipline, PulseSource, PulseTick};
use crate::scheduler::Notifier;

/// Monotonic milliseconds since boot plus a blocking delay.
pub trait TimeBase: DelayNs {
    fn uptime_ms(&self) -> u64;
}

/// Satellite receiver with a decoded time fix.
pub trait SatelliteReceiver {
    /// Current time as (epoch seconds, milliseconds), or `None` without a fix.
    fn read_time(&mut self) -> Option<(u64, u16)>;
}

/// Battery-backed real-time clock.
pub trait RealTimeClock {
    fn is_present(&self) -> bool;
    fn read(&mut self) -> Result<u64, BusError>;
    fn write(&mut self, epoch: u64) -> Result<(), BusError>;
}

/// The platform's wall clock, updated whenever a time is committed.
pub trait SystemClock {
    fn set_epoch(&mut self, epoch: u64);
}

/// The collaborators `calibrate` may consult. Missing ones are skipped.
pub struct TimeSources<'a> {
    pub satellite: Option<&'a mut dyn SatelliteReceiver>,
    pub network: Option<&'a NetworkSync>,
    pub rtc: Option<&'a mut dyn RealTimeClock>,
}

impl<'a> TimeSources<'a> {
    pub fn none() -> Self {
        Self {
            satellite: None,
            network: None,
            rtc: None,
        }
    }
}

/// Result of a calibration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Calibration {
    /// Time committed from this source.
    Synced(TimeSource),
    /// No source had a sample yet; a network handshake was started and will
    /// post a new time sync when it finishes.
    Pending,
}

/// Clock confidence, pulse discipline and resync schedule.
pub struct TimeKeeper {
    cfg: SyncConfig,
    state: ClockState,
    pulse: PulseDiscipline,
    next_sync_at: u64,
    /// Last successful sync or decay step.
    fresh_since: Option<u64>,
}

impl TimeKeeper {
    pub const fn new(cfg: SyncConfig, pulse: PulseSource) -> Self {
        Self {
            cfg,
            state: ClockState::Unsynced,
            pulse: PulseDiscipline::new(pulse),
            next_sync_at: 0,
            fresh_since: None,
        }
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn config(&self) -> &SyncConfig {
        &self.cfg
    }

    pub fn set_config(&mut self, cfg: SyncConfig) {
        self.cfg = cfg;
    }

    pub fn pulse(&self) -> &PulseDiscipline {
        &self.pulse
    }

    /// Uptime of the next scheduled resync.
    pub fn next_sync_at(&self) -> u64 {
        self.next_sync_at
    }

    /// Whether a periodic resync is due. A zero interval disables it.
    pub fn sync_due(&self, now_ms: u64) -> bool {
        self.cfg.interval_min > 0 && now_ms >= self.next_sync_at
    }

    /// Wall-clock time now, once the clock has been set.
    pub fn wall_time(&self, now_ms: u64) -> Option<(u64, u16)> {
        self.pulse.wall_time(now_ms)
    }

    /// Try the sources best first and commit the first plausible sample.
    ///
    /// A satellite fix wins, then a finished network handshake, which is
    /// always fused once its answers are in. With network sync enabled a new
    /// handshake is started and [`Calibration::Pending`] returned; the RTC is
    /// then consulted only while the clock has never been properly set.
    /// Without a network answer coming, the RTC is the fallback, and a clock
    /// that is already running keeps free-running.
    pub fn calibrate(
        &mut self,
        sources: TimeSources<'_>,
        gate: &Notifier,
        system: &mut impl SystemClock,
        tb: &mut impl TimeBase,
    ) -> Result<Calibration, SyncError> {
        let TimeSources {
            satellite,
            network,
            mut rtc,
        } = sources;
        let mut last_err = SyncError::NoAnswers;

        if let Some((epoch, frac)) = satellite.and_then(|s| s.read_time()) {
            let sample = TimeSample::new(epoch, frac, TimeSource::Satellite);
            match self.set_time(sample, rtc.as_deref_mut(), gate, system, tb) {
                Ok(()) => return Ok(Calibration::Synced(TimeSource::Satellite)),
                Err(e) => last_err = e,
            }
        }

        let mut handshake_failed = false;
        if let Some(ns) = network {
            if ns.is_finished(tb.uptime_ms()) {
                // Masked from fusing until the commit lands on the second
                let closed = gate.mask();
                let result = ns
                    .fuse(tb.uptime_ms())
                    .and_then(|s| self.commit(s, rtc.as_deref_mut(), system, tb));
                if closed {
                    gate.unmask();
                }
                match result {
                    Ok(()) => return Ok(Calibration::Synced(TimeSource::Network)),
                    Err(e) => {
                        last_err = e;
                        handshake_failed = true;
                    }
                }
            }
        }

        let mut waiting = false;
        if let Some(ns) = network {
            if self.cfg.network && !handshake_failed {
                match ns.begin(tb.uptime_ms(), &self.cfg) {
                    Ok(()) | Err(SyncError::Busy) => waiting = true,
                    Err(e) => last_err = e,
                }
            }
        }

        if !waiting || self.state <= ClockState::Dirty {
            if let Some(clock) = rtc.as_deref_mut().filter(|c| c.is_present()) {
                match clock.read() {
                    Ok(epoch) => {
                        let sample = TimeSample::new(epoch, 0, TimeSource::Rtc);
                        match self.set_time(sample, None, gate, system, tb) {
                            Ok(()) => return Ok(Calibration::Synced(TimeSource::Rtc)),
                            Err(e) => last_err = e,
                        }
                    }
                    Err(e) => {
                        log::warn!("RTC read failed: {}", e);
                        last_err = SyncError::Rtc(e);
                    }
                }
            }
        }

        let now = tb.uptime_ms();
        if waiting {
            self.reschedule(now, false);
            return Ok(Calibration::Pending);
        }

        match self.pulse.wall_time(now) {
            Some((epoch, _)) if crate::clock::is_plausible(epoch, self.cfg.epoch_floor) => {
                self.state = self.state.apply(ClockEvent::Synced(TimeSource::FreeRunning));
                self.reschedule(now, false);
                Ok(Calibration::Synced(TimeSource::FreeRunning))
            }
            _ => {
                self.fail(now);
                Err(last_err)
            }
        }
    }

    /// Commit a sample with the scheduler masked.
    pub fn set_time(
        &mut self,
        sample: TimeSample,
        rtc: Option<&mut (dyn RealTimeClock + '_)>,
        gate: &Notifier,
        system: &mut impl SystemClock,
        tb: &mut impl TimeBase,
    ) -> Result<(), SyncError> {
        let closed = gate.mask();
        let result = self.commit(sample, rtc, system, tb);
        if closed {
            gate.unmask();
        }
        result
    }

    /// Wait for the next whole second if needed, then commit and rephase.
    fn commit(
        &mut self,
        sample: TimeSample,
        rtc: Option<&mut (dyn RealTimeClock + '_)>,
        system: &mut impl SystemClock,
        tb: &mut impl TimeBase,
    ) -> Result<(), SyncError> {
        if sample.source == TimeSource::FreeRunning {
            return Err(SyncError::NotAReference);
        }
        if let Err(e) = sample.check(self.cfg.epoch_floor) {
            log::warn!("Rejected {} time: {}", sample.source.as_str(), e);
            self.fail(tb.uptime_ms());
            return Err(e);
        }

        let frac = sample.frac_ms % 1000;
        let epoch = if frac == 0 {
            sample.epoch
        } else {
            tb.delay_ms(1000 - frac as u32);
            sample.epoch + 1
        };
        let now = tb.uptime_ms();

        system.set_epoch(epoch);
        self.pulse.rephase(now, epoch);
        self.state = self.state.apply(ClockEvent::Synced(sample.source));
        self.fresh_since = Some(now);
        self.reschedule(now, true);

        if sample.source.updates_rtc() {
            if let Some(clock) = rtc.filter(|c| c.is_present()) {
                if let Err(e) = clock.write(epoch) {
                    log::warn!("RTC write failed: {}", e);
                }
            }
        }

        log::info!(
            "Time set to {} from {}, clock {}",
            epoch,
            sample.source.as_str(),
            self.state.symbol()
        );
        Ok(())
    }

    fn fail(&mut self, now_ms: u64) {
        self.state = self.state.apply(ClockEvent::SyncFailed);
        self.reschedule(now_ms, false);
    }

    fn reschedule(&mut self, now_ms: u64, success: bool) {
        let wait = if success {
            self.cfg.interval_ms()
        } else {
            self.cfg.retry_ms()
        };
        self.next_sync_at = now_ms + wait;
    }

    /// Lower confidence one step if no resync happened for the decay period.
    pub fn decay(&mut self, now_ms: u64) -> Option<ClockState> {
        let since = self.fresh_since?;
        let period = self.cfg.decay_ms();
        if period == 0 || now_ms < since + period {
            return None;
        }
        let next = self.state.apply(ClockEvent::Stale);
        self.fresh_since = Some(now_ms);
        if next == self.state {
            return None;
        }
        log::warn!(
            "No time sync for {} min, clock {} -> {}",
            self.cfg.decay_min,
            self.state.symbol(),
            next.symbol()
        );
        self.state = next;
        Some(next)
    }

    /// Timer-driven pulse.
    pub fn poll_pulse(&mut self, now_ms: u64) -> Option<PulseTick> {
        self.pulse.poll(now_ms)
    }

    /// Edge on an external pulse line.
    pub fn pulse_edge(&mut self, now_ms: u64) -> Option<PulseTick> {
        self.pulse.edge(now_ms)
    }
}

/// Builds and sends a wall-clock telegram describing one epoch second.
///
/// The frame layout belongs to the output protocol; the engine only says
/// which second to describe.
pub trait TelegramProducer {
    fn send_frame(&mut self, epoch: u64);
}

/// Decides, once per pulse, whether a telegram goes out.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockOutput {
    last_epoch: Option<u64>,
}

impl ClockOutput {
    pub const fn new() -> Self {
        Self { last_epoch: None }
    }

    /// On a tick, produce the frame for the second after it.
    ///
    /// Nothing is sent while the clock is unsynced, for an implausible time,
    /// or for a second already described. Returns the epoch sent.
    pub fn on_tick(
        &mut self,
        tick: PulseTick,
        state: ClockState,
        floor: u64,
        producer: &mut impl TelegramProducer,
    ) -> Option<u64> {
        if state == ClockState::Unsynced {
            return None;
        }
        let next = tick.epoch + 1;
        if !crate::clock::is_plausible(next, floor) || self.last_epoch == Some(next) {
            return None;
        }
        producer.send_frame(next);
        self.last_epoch = Some(next);
        Some(next)
    }
}
