/// One pulse per second, phase-locked to the corrected wall clock.
///
/// Each accepted time sample re-phases the discipline so the next tick lands
/// on the corrected second boundary. After that ticks follow every 1000 ms,
/// each carrying the epoch second that begins at that instant.

/// Hardware line that drives the 1 Hz tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseSource {
    /// PPS output of the satellite receiver.
    SatellitePps,
    /// 1 Hz square wave of the external RTC.
    RtcSquareWave,
    /// Internal hardware timer.
    HardwareTimer,
}

impl PulseSource {
    /// Best source the board offers.
    pub const fn select(has_satellite_pps: bool, has_rtc_sqw: bool) -> Self {
        if has_satellite_pps {
            PulseSource::SatellitePps
        } else if has_rtc_sqw {
            PulseSource::RtcSquareWave
        } else {
            PulseSource::HardwareTimer
        }
    }

    /// External lines deliver edges; the timer is polled.
    pub const fn is_external(self) -> bool {
        !matches!(self, PulseSource::HardwareTimer)
    }
}

/// A second boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseTick {
    /// Epoch second beginning at this tick.
    pub epoch: u64,
    /// Monotonic uptime of the tick.
    pub at_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct Phase {
    next_at: u64,
    next_epoch: u64,
}

/// Software side of the pulse: tracks which second the next tick starts.
#[derive(Debug, Clone, Copy)]
pub struct PulseDiscipline {
    source: PulseSource,
    phase: Option<Phase>,
}

impl PulseDiscipline {
    pub const fn new(source: PulseSource) -> Self {
        Self {
            source,
            phase: None,
        }
    }

    pub fn source(&self) -> PulseSource {
        self.source
    }

    /// The tick at `boundary_ms` starts second `epoch`.
    pub fn rephase(&mut self, boundary_ms: u64, epoch: u64) {
        self.phase = Some(Phase {
            next_at: boundary_ms,
            next_epoch: epoch,
        });
        log::debug!("Pulse rephased: epoch {} at {} ms", epoch, boundary_ms);
    }

    /// Rephase from a reading of `epoch` + `frac_ms` taken at `now_ms`.
    ///
    /// A whole-second reading ticks right away; otherwise the next tick is
    /// `1000 - frac_ms` away and starts `epoch + 1`.
    pub fn correct(&mut self, now_ms: u64, epoch: u64, frac_ms: u16) {
        let frac = (frac_ms % 1000) as u64;
        if frac == 0 {
            self.rephase(now_ms, epoch);
        } else {
            self.rephase(now_ms + 1000 - frac, epoch + 1);
        }
    }

    /// Uptime of the next tick, if phased.
    pub fn next_tick_at(&self) -> Option<u64> {
        self.phase.map(|p| p.next_at)
    }

    /// Timer-driven tick: returns at most one due tick per call.
    pub fn poll(&mut self, now_ms: u64) -> Option<PulseTick> {
        let phase = self.phase.as_mut()?;
        if now_ms < phase.next_at {
            return None;
        }
        let tick = PulseTick {
            epoch: phase.next_epoch,
            at_ms: phase.next_at,
        };
        phase.next_at += 1000;
        phase.next_epoch += 1;
        Some(tick)
    }

    /// Edge on an external pulse line at `now_ms`.
    ///
    /// The edge itself is the boundary, so any drift of the local timer is
    /// absorbed here. Edges arriving well before the expected boundary are
    /// ignored as glitches.
    pub fn edge(&mut self, now_ms: u64) -> Option<PulseTick> {
        let phase = self.phase.as_mut()?;
        if now_ms + 500 < phase.next_at {
            return None;
        }
        let tick = PulseTick {
            epoch: phase.next_epoch,
            at_ms: now_ms,
        };
        phase.next_at = now_ms + 1000;
        phase.next_epoch += 1;
        Some(tick)
    }

    /// Wall-clock time at `now_ms` as (epoch seconds, milliseconds).
    pub fn wall_time(&self, now_ms: u64) -> Option<(u64, u16)> {
        let phase = self.phase?;
        if now_ms >= phase.next_at {
            let elapsed = now_ms - phase.next_at;
            Some((phase.next_epoch + elapsed / 1000, (elapsed % 1000) as u16))
        } else {
            let until = phase.next_at - now_ms;
            // Reading falls inside the second before the next tick
            let secs_back = until.div_ceil(1000);
            let epoch = phase.next_epoch.checked_sub(secs_back)?;
            let frac = (secs_back * 1000 - until) as u16;
            Some((epoch, frac))
        }
    }
}
