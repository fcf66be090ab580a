/// Network time handshake and offset fusion.
///
/// A handshake sends a few sequence-numbered time requests spaced by the sync
/// cycle. The transport reports the local uptime at which each request left
/// the radio ([`NetworkSync::mark_sent`]); the time server's answer carries
/// its wall clock for that request ([`NetworkSync::on_answer`]). Once every
/// answer is in, or the deadline passes, [`NetworkSync::fuse`] turns the pairs
/// into one [`TimeSample`].
///
/// The session sits behind a critical section: answers arrive from the
/// downlink callback while the firmware's sync task polls it.
use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Vec;

use crate::clock::{TimeSample, TimeSource};
use crate::config::SyncConfig;
use crate::defaults::{MAX_SYNC_SAMPLES, SYNC_FIXUP_MS, SYNC_MAX_SEQ};
use crate::error::SyncError;

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    /// No handshake running.
    Idle,
    /// Queue a time request with this sequence number.
    SendRequest(u8),
    /// Nothing to do before this uptime.
    Wait { until_ms: u64 },
    /// Every answer is in; fuse now.
    Ready,
    /// Deadline passed; fuse what arrived.
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
struct Exchange {
    seq: u8,
    sent_at: Option<u64>,
    answer: Option<(u64, u16)>,
}

#[derive(Debug)]
struct Session {
    active: bool,
    wanted: u8,
    cycle_ms: u64,
    next_request_at: u64,
    deadline: u64,
    next_seq: u8,
    exchanges: Vec<Exchange, MAX_SYNC_SAMPLES>,
}

impl Session {
    fn answered(&self) -> usize {
        self.exchanges
            .iter()
            .filter(|x| x.sent_at.is_some() && x.answer.is_some())
            .count()
    }

    fn alloc_seq(&mut self) -> u8 {
        let seq = self.next_seq;
        self.next_seq = if seq >= SYNC_MAX_SEQ { 0 } else { seq + 1 };
        seq
    }
}

/// Shared state of the network time handshake.
pub struct NetworkSync {
    session: Mutex<RefCell<Session>>,
}

impl NetworkSync {
    pub const fn new() -> Self {
        Self {
            session: Mutex::new(RefCell::new(Session {
                active: false,
                wanted: 0,
                cycle_ms: 0,
                next_request_at: 0,
                deadline: 0,
                next_seq: 0,
                exchanges: Vec::new(),
            })),
        }
    }

    /// Start a handshake. Fails with [`SyncError::Busy`] if one is running.
    pub fn begin(&self, now_ms: u64, cfg: &SyncConfig) -> Result<(), SyncError> {
        let wanted = (cfg.samples as usize).clamp(1, MAX_SYNC_SAMPLES) as u8;
        critical_section::with(|cs| {
            let mut s = self.session.borrow_ref_mut(cs);
            if s.active {
                return Err(SyncError::Busy);
            }
            let cycle_ms = cfg.cycle_secs as u64 * 1000;
            s.active = true;
            s.wanted = wanted;
            s.cycle_ms = cycle_ms;
            s.next_request_at = now_ms;
            s.deadline = now_ms + wanted as u64 * cycle_ms + cfg.timeout_secs as u64 * 1000;
            s.exchanges.clear();
            Ok(())
        })?;
        log::info!("Network time handshake started, {} samples", wanted);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        critical_section::with(|cs| self.session.borrow_ref(cs).active)
    }

    /// Advance the handshake.
    pub fn poll(&self, now_ms: u64) -> SyncStep {
        critical_section::with(|cs| {
            let mut s = self.session.borrow_ref_mut(cs);
            if !s.active {
                return SyncStep::Idle;
            }
            if s.answered() == s.wanted as usize {
                return SyncStep::Ready;
            }
            if now_ms >= s.deadline {
                return SyncStep::TimedOut;
            }
            let all_requested = s.exchanges.len() == s.wanted as usize;
            if !all_requested && now_ms >= s.next_request_at {
                let seq = s.alloc_seq();
                // Capacity is MAX_SYNC_SAMPLES and wanted never exceeds it
                let _ = s.exchanges.push(Exchange {
                    seq,
                    sent_at: None,
                    answer: None,
                });
                s.next_request_at = now_ms + s.cycle_ms;
                return SyncStep::SendRequest(seq);
            }
            let until_ms = if all_requested {
                s.deadline
            } else {
                s.next_request_at.min(s.deadline)
            };
            SyncStep::Wait { until_ms }
        })
    }

    /// Record the uptime at which request `seq` was transmitted.
    pub fn mark_sent(&self, seq: u8, at_ms: u64) {
        critical_section::with(|cs| {
            let mut s = self.session.borrow_ref_mut(cs);
            if let Some(x) = s.exchanges.iter_mut().find(|x| x.seq == seq) {
                x.sent_at.get_or_insert(at_ms);
            }
        });
    }

    /// Record the server's answer to request `seq`.
    ///
    /// Returns `false` for answers that match no outstanding request.
    pub fn on_answer(&self, seq: u8, epoch: u64, frac_ms: u16) -> bool {
        let matched = critical_section::with(|cs| {
            let mut s = self.session.borrow_ref_mut(cs);
            if !s.active {
                return false;
            }
            match s.exchanges.iter_mut().find(|x| x.seq == seq) {
                Some(x) if x.answer.is_none() => {
                    x.answer = Some((epoch, frac_ms % 1000));
                    true
                }
                _ => false,
            }
        });
        if matched {
            log::debug!("Time answer #{}: {}.{:03}", seq, epoch, frac_ms);
        } else {
            log::debug!("Unmatched time answer #{}", seq);
        }
        matched
    }

    /// Whether every requested answer has arrived.
    pub fn is_complete(&self) -> bool {
        critical_section::with(|cs| {
            let s = self.session.borrow_ref(cs);
            s.active && s.answered() == s.wanted as usize
        })
    }

    /// Whether the handshake is waiting to be fused.
    pub fn is_finished(&self, now_ms: u64) -> bool {
        matches!(self.poll_peek(now_ms), SyncStep::Ready | SyncStep::TimedOut)
    }

    fn poll_peek(&self, now_ms: u64) -> SyncStep {
        critical_section::with(|cs| {
            let s = self.session.borrow_ref(cs);
            if !s.active {
                SyncStep::Idle
            } else if s.answered() == s.wanted as usize {
                SyncStep::Ready
            } else if now_ms >= s.deadline {
                SyncStep::TimedOut
            } else {
                SyncStep::Wait { until_ms: s.deadline }
            }
        })
    }

    /// End the handshake and derive the network time at `now_ms`.
    ///
    /// Each answered request gives an offset `remote_second * 1000 - sent_at`.
    /// The mean offset plus the last answer's milliseconds and the processing
    /// compensation, added to `now_ms`, is the wall clock now. Callers keep
    /// the scheduler masked from here until the time is committed.
    pub fn fuse(&self, now_ms: u64) -> Result<TimeSample, SyncError> {
        let (sum, count, last_frac) = critical_section::with(|cs| {
            let mut s = self.session.borrow_ref_mut(cs);
            if !s.active {
                return Err(SyncError::Idle);
            }
            s.active = false;

            let mut sum: i64 = 0;
            let mut count: i64 = 0;
            let mut last_frac = 0u16;
            for x in s.exchanges.iter() {
                if let (Some(sent_at), Some((epoch, frac))) = (x.sent_at, x.answer) {
                    sum += epoch as i64 * 1000 - sent_at as i64;
                    count += 1;
                    last_frac = frac;
                }
            }
            Ok((sum, count, last_frac))
        })?;

        if count == 0 {
            log::warn!("Network time handshake timed out without answers");
            return Err(SyncError::NoAnswers);
        }

        let offset_ms = sum.div_euclid(count);
        let wall_ms = now_ms as i64 + offset_ms + last_frac as i64 + SYNC_FIXUP_MS;
        if wall_ms < 0 {
            return Err(SyncError::Implausible { epoch: 0, floor: 0 });
        }
        let epoch = wall_ms.div_euclid(1000) as u64;
        let frac_ms = wall_ms.rem_euclid(1000) as u16;
        log::info!(
            "Network time fused from {} answers: offset {} ms",
            count,
            offset_ms + last_frac as i64
        );
        Ok(TimeSample::new(epoch, frac_ms, TimeSource::Network))
    }

    /// Drop a running handshake.
    pub fn abort(&self) {
        critical_section::with(|cs| {
            let mut s = self.session.borrow_ref_mut(cs);
            s.active = false;
            s.exchanges.clear();
        });
    }
}

impl Default for NetworkSync {
    fn default() -> Self {
        Self::new()
    }
}
