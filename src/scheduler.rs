/// Interrupt-driven cyclic scheduler.
///
/// Producers (timer callbacks, GPIO edges, radio callbacks, the sync engine)
/// OR an [`Event`] bit into the shared [`Notifier`] and wake the dispatcher.
/// The dispatcher takes the whole pending set at once and runs every handler
/// in [`Event::ORDER`]. While the masking gate is closed, bits are carried in
/// a deferred set and run once it reopens.
use core::cell::Cell;

use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

use crate::error::HandlerError;

/// A kind of pending work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Event {
    Display = 0x001,
    Button = 0x002,
    SendCycle = 0x004,
    Housekeeping = 0x008,
    TimeSync = 0x010,
    Mask = 0x020,
    Unmask = 0x040,
    SensorRead = 0x080,
    Power = 0x200,
}

impl Event {
    /// Dispatch order within one drain. Send cycle is last because it may
    /// put the device to sleep.
    pub const ORDER: [Event; 9] = [
        Event::Mask,
        Event::Unmask,
        Event::Button,
        Event::Display,
        Event::TimeSync,
        Event::SensorRead,
        Event::Housekeeping,
        Event::Power,
        Event::SendCycle,
    ];

    pub const fn bit(self) -> u16 {
        self as u16
    }

    /// Gate control events act even while the gate is closed.
    pub const fn is_control(self) -> bool {
        matches!(self, Event::Mask | Event::Unmask)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Event::Display => "display",
            Event::Button => "button",
            Event::SendCycle => "send_cycle",
            Event::Housekeeping => "housekeeping",
            Event::TimeSync => "time_sync",
            Event::Mask => "mask",
            Event::Unmask => "unmask",
            Event::SensorRead => "sensor_read",
            Event::Power => "power",
        }
    }
}

/// Set of pending events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(pub u16);

impl EventSet {
    pub const EMPTY: EventSet = EventSet(0);

    pub const fn with(self, event: Event) -> Self {
        EventSet(self.0 | event.bit())
    }

    pub const fn without(self, event: Event) -> Self {
        EventSet(self.0 & !event.bit())
    }

    pub const fn union(self, other: EventSet) -> Self {
        EventSet(self.0 | other.0)
    }

    pub const fn contains(self, event: Event) -> bool {
        self.0 & event.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Events in dispatch order.
    pub fn iter(self) -> impl Iterator<Item = Event> {
        Event::ORDER.into_iter().filter(move |e| self.contains(*e))
    }
}

impl FromIterator<Event> for EventSet {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        iter.into_iter().fold(EventSet::EMPTY, EventSet::with)
    }
}

/// Masking gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Open,
    Closed,
}

/// Shared notification word plus the dispatcher's wake signal.
///
/// Safe to use from interrupt context: every method only takes a short
/// critical section.
pub struct Notifier {
    pending: Mutex<Cell<EventSet>>,
    gate: Mutex<Cell<Gate>>,
    wake: Signal<CriticalSectionRawMutex, ()>,
}

impl Notifier {
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(Cell::new(EventSet::EMPTY)),
            gate: Mutex::new(Cell::new(Gate::Open)),
            wake: Signal::new(),
        }
    }

    /// Post an event and wake the dispatcher.
    ///
    /// `Mask` and `Unmask` switch the gate right away, so a producer that
    /// masks is protected from the next handler on, not the next drain.
    pub fn notify(&self, event: Event) {
        critical_section::with(|cs| {
            match event {
                Event::Mask => self.gate.borrow(cs).set(Gate::Closed),
                Event::Unmask => self.gate.borrow(cs).set(Gate::Open),
                _ => {}
            }
            let pending = self.pending.borrow(cs);
            pending.set(pending.get().with(event));
        });
        self.wake.signal(());
    }

    /// Close the masking gate.
    ///
    /// Returns whether this call closed it. A caller that finds the gate
    /// already closed leaves reopening it to whoever closed it.
    pub fn mask(&self) -> bool {
        let was_open =
            critical_section::with(|cs| self.gate.borrow(cs).replace(Gate::Closed) == Gate::Open);
        self.notify(Event::Mask);
        was_open
    }

    /// Reopen the masking gate.
    pub fn unmask(&self) {
        self.notify(Event::Unmask);
    }

    pub fn gate(&self) -> Gate {
        critical_section::with(|cs| self.gate.borrow(cs).get())
    }

    /// Read and clear the pending set.
    pub fn take(&self) -> EventSet {
        critical_section::with(|cs| self.pending.borrow(cs).replace(EventSet::EMPTY))
    }

    pub fn peek(&self) -> EventSet {
        critical_section::with(|cs| self.pending.borrow(cs).get())
    }

    /// Sleep until something is pending.
    pub async fn wait(&self) {
        while self.peek().is_empty() {
            self.wake.wait().await;
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Work run by the dispatcher.
pub trait EventHandler {
    /// Handle one event. Errors are logged by the dispatcher; only
    /// [`HandlerError::ResourceExhausted`] has further consequences.
    fn handle(&mut self, event: Event) -> Result<(), HandlerError>;

    /// A latency-critical radio job is about to start; keep the gate shut.
    fn radio_window_imminent(&self) -> bool {
        false
    }
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainOutcome {
    /// Events whose handler ran, whether it succeeded or not.
    pub handled: EventSet,
    /// Events held back by a closed gate.
    pub deferred: EventSet,
    /// Free memory stayed below the low-water mark after a counters reset.
    pub restart: bool,
}

/// The single consumer of the notification word.
#[derive(Debug, Default)]
pub struct Dispatcher {
    deferred: EventSet,
}

impl Dispatcher {
    pub const fn new() -> Self {
        Self {
            deferred: EventSet::EMPTY,
        }
    }

    /// Events held back from an earlier pass.
    pub fn deferred(&self) -> EventSet {
        self.deferred
    }

    /// Take everything pending and run it in fixed order.
    ///
    /// The gate is checked before each handler, so a handler that masks
    /// defers the rest of the pass.
    pub fn drain<H: EventHandler>(&mut self, notifier: &Notifier, handler: &mut H) -> DrainOutcome {
        let work = self.deferred.union(notifier.take());
        self.deferred = EventSet::EMPTY;
        let mut outcome = DrainOutcome::default();

        for event in work.iter() {
            if event.is_control() {
                log::debug!("Gate {}", event.as_str());
                outcome.handled = outcome.handled.with(event);
                continue;
            }

            if notifier.gate() == Gate::Closed || handler.radio_window_imminent() {
                self.deferred = self.deferred.with(event);
                continue;
            }

            outcome.handled = outcome.handled.with(event);
            match handler.handle(event) {
                Ok(()) => {}
                Err(HandlerError::ResourceExhausted) => {
                    log::error!("Memory exhausted in {} handler, restart required", event.as_str());
                    outcome.restart = true;
                }
                Err(e) => log::warn!("{} handler failed: {}", event.as_str(), e),
            }
        }

        outcome.deferred = self.deferred;
        outcome
    }
}

/// Software ticker for cycles driven from a single timer.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicTimer {
    period_ms: u64,
    next_at: u64,
}

impl PeriodicTimer {
    /// First fire one period after `now_ms`. A zero period never fires.
    pub const fn new(period_ms: u64, now_ms: u64) -> Self {
        Self {
            period_ms,
            next_at: now_ms + period_ms,
        }
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    pub fn set_period(&mut self, period_ms: u64, now_ms: u64) {
        *self = Self::new(period_ms, now_ms);
    }

    /// Whether the timer fired since the last poll. Missed periods collapse
    /// into one fire.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        if self.period_ms == 0 || now_ms < self.next_at {
            return false;
        }
        self.next_at += self.period_ms;
        if self.next_at <= now_ms {
            self.next_at = now_ms + self.period_ms;
        }
        true
    }
}

/// Escalation step for low free memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryVerdict {
    Ok,
    /// First breach: reset the counters to free their memory.
    ResetCounters,
    /// Still low after a reset.
    Restart,
}

/// Free-memory watchdog run from housekeeping.
#[derive(Debug, Clone, Copy)]
pub struct MemoryGuard {
    low_water: u32,
    breached: bool,
}

impl MemoryGuard {
    pub const fn new(low_water: u32) -> Self {
        Self {
            low_water,
            breached: false,
        }
    }

    pub fn check(&mut self, free: u32) -> MemoryVerdict {
        if free >= self.low_water {
            self.breached = false;
            return MemoryVerdict::Ok;
        }
        if self.breached {
            MemoryVerdict::Restart
        } else {
            self.breached = true;
            MemoryVerdict::ResetCounters
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: heapless::Vec<Event, 32>,
        fail: Option<Event>,
        exhaust: Option<Event>,
        mask_during: Option<(Event, &'static Notifier)>,
        radio_busy: bool,
    }

    impl EventHandler for Recorder {
        fn handle(&mut self, event: Event) -> Result<(), HandlerError> {
            let _ = self.calls.push(event);
            if let Some((e, n)) = self.mask_during {
                if e == event {
                    n.mask();
                }
            }
            if self.exhaust == Some(event) {
                return Err(HandlerError::ResourceExhausted);
            }
            if self.fail == Some(event) {
                return Err(HandlerError::Peripheral("test"));
            }
            Ok(())
        }

        fn radio_window_imminent(&self) -> bool {
            self.radio_busy
        }
    }

    const WORK: [Event; 7] = [
        Event::SendCycle,
        Event::Power,
        Event::Housekeeping,
        Event::SensorRead,
        Event::TimeSync,
        Event::Display,
        Event::Button,
    ];

    #[test]
    fn bit_values() {
        assert_eq!(Event::Display.bit(), 0x001);
        assert_eq!(Event::Button.bit(), 0x002);
        assert_eq!(Event::SendCycle.bit(), 0x004);
        assert_eq!(Event::Housekeeping.bit(), 0x008);
        assert_eq!(Event::TimeSync.bit(), 0x010);
        assert_eq!(Event::Mask.bit(), 0x020);
        assert_eq!(Event::Unmask.bit(), 0x040);
        assert_eq!(Event::SensorRead.bit(), 0x080);
        assert_eq!(Event::Power.bit(), 0x200);
    }

    #[test]
    fn one_wake_visits_all_in_order() {
        let n = Notifier::new();
        for e in WORK {
            n.notify(e);
        }
        let mut d = Dispatcher::new();
        let mut h = Recorder::default();
        let out = d.drain(&n, &mut h);

        assert_eq!(
            h.calls.as_slice(),
            &[
                Event::Button,
                Event::Display,
                Event::TimeSync,
                Event::SensorRead,
                Event::Housekeeping,
                Event::Power,
                Event::SendCycle,
            ]
        );
        assert_eq!(out.handled, WORK.into_iter().collect());
        assert!(out.deferred.is_empty());
        assert!(n.peek().is_empty());

        // Nothing left for a second pass
        let out = d.drain(&n, &mut h);
        assert!(out.handled.is_empty());
        assert_eq!(h.calls.len(), 7);
    }

    #[test]
    fn repeated_notify_coalesces() {
        let n = Notifier::new();
        n.notify(Event::Display);
        n.notify(Event::Display);
        let mut h = Recorder::default();
        Dispatcher::new().drain(&n, &mut h);
        assert_eq!(h.calls.as_slice(), &[Event::Display]);
    }

    #[test]
    fn masked_events_are_kept_until_unmask() {
        let n = Notifier::new();
        let mut d = Dispatcher::new();
        let mut h = Recorder::default();

        n.mask();
        n.notify(Event::SendCycle);
        n.notify(Event::Display);
        let out = d.drain(&n, &mut h);
        assert!(h.calls.is_empty());
        assert!(out.handled.contains(Event::Mask));
        assert_eq!(out.deferred, EventSet::EMPTY.with(Event::SendCycle).with(Event::Display));

        // More events while still masked pile up
        n.notify(Event::Housekeeping);
        let out = d.drain(&n, &mut h);
        assert!(h.calls.is_empty());
        assert!(out.deferred.contains(Event::Housekeeping));

        n.unmask();
        let out = d.drain(&n, &mut h);
        assert_eq!(
            h.calls.as_slice(),
            &[Event::Display, Event::Housekeeping, Event::SendCycle]
        );
        assert!(out.deferred.is_empty());
        assert_eq!(n.gate(), Gate::Open);
    }

    #[test]
    fn mask_reports_who_closed_the_gate() {
        let n = Notifier::new();
        assert!(n.mask());
        assert!(!n.mask());
        assert_eq!(n.gate(), Gate::Closed);
        n.unmask();
        assert!(n.mask());
    }

    #[test]
    fn mask_and_unmask_in_one_pass_leaves_gate_open() {
        let n = Notifier::new();
        n.mask();
        n.notify(Event::TimeSync);
        n.unmask();
        let mut h = Recorder::default();
        let out = Dispatcher::new().drain(&n, &mut h);
        assert_eq!(h.calls.as_slice(), &[Event::TimeSync]);
        assert!(out.handled.contains(Event::Unmask));
    }

    #[test]
    fn handler_that_masks_defers_the_rest() {
        static N: Notifier = Notifier::new();
        N.notify(Event::TimeSync);
        N.notify(Event::SendCycle);
        let mut d = Dispatcher::new();
        let mut h = Recorder {
            mask_during: Some((Event::TimeSync, &N)),
            ..Default::default()
        };
        let out = d.drain(&N, &mut h);
        assert_eq!(h.calls.as_slice(), &[Event::TimeSync]);
        assert!(out.deferred.contains(Event::SendCycle));

        h.mask_during = None;
        N.unmask();
        d.drain(&N, &mut h);
        assert_eq!(h.calls.as_slice(), &[Event::TimeSync, Event::SendCycle]);
    }

    #[test]
    fn radio_window_holds_events() {
        let n = Notifier::new();
        n.notify(Event::Display);
        let mut d = Dispatcher::new();
        let mut h = Recorder {
            radio_busy: true,
            ..Default::default()
        };
        let out = d.drain(&n, &mut h);
        assert!(h.calls.is_empty());
        assert!(out.deferred.contains(Event::Display));

        h.radio_busy = false;
        d.drain(&n, &mut h);
        assert_eq!(h.calls.as_slice(), &[Event::Display]);
    }

    #[test]
    fn failing_handler_does_not_stop_the_pass() {
        let n = Notifier::new();
        n.notify(Event::SensorRead);
        n.notify(Event::SendCycle);
        let mut h = Recorder {
            fail: Some(Event::SensorRead),
            ..Default::default()
        };
        let out = Dispatcher::new().drain(&n, &mut h);
        assert_eq!(h.calls.as_slice(), &[Event::SensorRead, Event::SendCycle]);
        assert!(!out.restart);
    }

    #[test]
    fn exhaustion_requests_restart() {
        let n = Notifier::new();
        n.notify(Event::Housekeeping);
        n.notify(Event::SendCycle);
        let mut h = Recorder {
            exhaust: Some(Event::Housekeeping),
            ..Default::default()
        };
        let out = Dispatcher::new().drain(&n, &mut h);
        assert!(out.restart);
        assert_eq!(h.calls.len(), 2);
    }

    #[test]
    fn periodic_timer_fires_each_period() {
        let mut t = PeriodicTimer::new(1_000, 0);
        assert!(!t.poll(999));
        assert!(t.poll(1_000));
        assert!(!t.poll(1_500));
        assert!(t.poll(2_000));
        // Long stall collapses into a single fire
        assert!(t.poll(10_500));
        assert!(!t.poll(10_600));
        assert!(t.poll(11_500));
    }

    #[test]
    fn zero_period_never_fires() {
        let mut t = PeriodicTimer::new(0, 0);
        assert!(!t.poll(0));
        assert!(!t.poll(1_000_000));
    }

    #[test]
    fn memory_guard_escalates() {
        let mut g = MemoryGuard::new(4096);
        assert_eq!(g.check(10_000), MemoryVerdict::Ok);
        assert_eq!(g.check(1_000), MemoryVerdict::ResetCounters);
        assert_eq!(g.check(1_000), MemoryVerdict::Restart);
    }

    #[test]
    fn memory_guard_recovers() {
        let mut g = MemoryGuard::new(4096);
        assert_eq!(g.check(1_000), MemoryVerdict::ResetCounters);
        assert_eq!(g.check(8_000), MemoryVerdict::Ok);
        assert_eq!(g.check(1_000), MemoryVerdict::ResetCounters);
    }
}
