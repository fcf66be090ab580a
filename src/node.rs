/// Node wiring: the dispatcher's event handler and the capture path.
///
/// [`Node`] owns what only the dispatcher touches (time keeper, memory guard,
/// pending sleep) and borrows the state it shares with capture callbacks,
/// timer producers, the command handler and the transport senders.
/// [`Capture`] is what the radio callbacks call.
use core::cell::Cell;

use critical_section::Mutex;

use crate::board;
use crate::clock::ClockState;
use crate::comm;
use crate::config::{self, CounterMode, NodeConfig, SharedConfig};
use crate::counter::{Counters, PresenceCounter};
use crate::defaults::{BEACON_PORT, COUNTER_PORT, MAX_SENSOR_VALUES, SENSOR_PORT};
use crate::error::{CountError, HandlerError};
use crate::filter::SharedWatchlist;
use crate::netsync::NetworkSync;
use crate::protocol::{DeviceMessage, VERSION};
use crate::pulse::PulseSource;
use crate::queue::{Priority, Transports};
use crate::salt::SaltSource;
use crate::scanner::RawObservation;
use crate::scheduler::{Event, EventHandler, MemoryGuard, MemoryVerdict, Notifier};
use crate::timesync::{
    Calibration, ClockOutput, RealTimeClock, SatelliteReceiver, SystemClock, TelegramProducer,
    TimeBase, TimeKeeper, TimeSources,
};

/// Last published clock state, readable outside the dispatcher.
pub type SharedClockState = Mutex<Cell<ClockState>>;

pub fn clock_state(shared: &SharedClockState) -> ClockState {
    critical_section::with(|cs| shared.borrow(cs).get())
}

/// Board services the handlers call into.
///
/// Everything except memory and sleep has a no-op default, so a board only
/// implements what it has.
pub trait Platform: TimeBase + SaltSource {
    /// Free heap in bytes.
    fn free_memory(&self) -> u32;

    /// Power down for `secs` seconds. Does not return on real hardware.
    fn enter_sleep(&mut self, secs: u32);

    fn on_button(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }

    fn refresh_display(&mut self, _status: &NodeStatus) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Fill `out` with readings, returning how many were written.
    fn read_sensors(&mut self, _out: &mut [i32]) -> Result<usize, HandlerError> {
        Ok(0)
    }

    /// The power management chip raised its interrupt line.
    fn power_event(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// A latency-critical radio job is due within [`crate::defaults::RADIO_GUARD_MS`].
    fn radio_window_imminent(&self) -> bool {
        false
    }
}

/// Snapshot for status reports and the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub counts: Counters,
    pub clock: ClockState,
    pub queue_depth: u16,
    pub uptime_s: u32,
    pub heap_free: u32,
}

impl NodeStatus {
    pub fn collect(
        counter: &PresenceCounter,
        transports: &Transports,
        clock: ClockState,
        uptime_ms: u64,
        heap_free: u32,
    ) -> Self {
        Self {
            counts: counter.counts(),
            clock,
            queue_depth: transports.depth().min(u16::MAX as usize) as u16,
            uptime_s: (uptime_ms / 1000).min(u32::MAX as u64) as u32,
            heap_free,
        }
    }

    pub fn message(&self) -> DeviceMessage<'static> {
        DeviceMessage::Status {
            uptime: self.uptime_s,
            heap_free: self.heap_free,
            clock: self.clock.symbol(),
            queue: self.queue_depth,
            board: board::BOARD_NAME,
            version: VERSION,
        }
    }
}

/// State shared between the dispatcher and the other tasks.
#[derive(Clone, Copy)]
pub struct NodeShared<'a> {
    pub counter: &'a PresenceCounter,
    pub transports: &'a Transports,
    pub notifier: &'a Notifier,
    pub netsync: &'a NetworkSync,
    pub config: &'a SharedConfig,
    pub clock_state: &'a SharedClockState,
}

/// The dispatcher's handler.
pub struct Node<'a, P, C> {
    shared: NodeShared<'a>,
    satellite: Option<&'a mut dyn SatelliteReceiver>,
    rtc: Option<&'a mut dyn RealTimeClock>,
    clock: TimeKeeper,
    output: ClockOutput,
    memory: MemoryGuard,
    platform: P,
    system: C,
    sleep_pending: bool,
}

impl<'a, P: Platform, C: SystemClock> Node<'a, P, C> {
    pub fn new(shared: NodeShared<'a>, pulse: PulseSource, platform: P, system: C) -> Self {
        let cfg = config::load(shared.config);
        Self {
            shared,
            satellite: None,
            rtc: None,
            clock: TimeKeeper::new(cfg.sync, pulse),
            output: ClockOutput::new(),
            memory: MemoryGuard::new(cfg.memory_low_water),
            platform,
            system,
            sleep_pending: false,
        }
    }

    pub fn with_satellite(mut self, receiver: &'a mut dyn SatelliteReceiver) -> Self {
        self.satellite = Some(receiver);
        self
    }

    pub fn with_rtc(mut self, rtc: &'a mut dyn RealTimeClock) -> Self {
        self.rtc = Some(rtc);
        self
    }

    pub fn clock(&self) -> &TimeKeeper {
        &self.clock
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn system(&self) -> &C {
        &self.system
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::collect(
            self.shared.counter,
            self.shared.transports,
            self.clock.state(),
            self.platform.uptime_ms(),
            self.platform.free_memory(),
        )
    }

    /// Uptime of the next timer-driven pulse, once the clock has been set.
    pub fn next_pulse_at(&self) -> Option<u64> {
        self.clock.pulse().next_tick_at()
    }

    /// Advance the pulse and emit the telegram for the following second.
    ///
    /// `edge` is true when called from an external pulse line, false when
    /// the hardware timer expired. Returns the epoch the telegram describes.
    pub fn on_pulse(&mut self, edge: bool, producer: &mut impl TelegramProducer) -> Option<u64> {
        let now = self.platform.uptime_ms();
        let tick = if edge {
            self.clock.pulse_edge(now)
        } else {
            self.clock.poll_pulse(now)
        }?;
        let cfg = *self.clock.config();
        if !cfg.telegram {
            return None;
        }
        self.output.on_tick(tick, self.clock.state(), cfg.epoch_floor, producer)
    }

    fn publish_clock(&self) {
        let state = self.clock.state();
        critical_section::with(|cs| self.shared.clock_state.borrow(cs).set(state));
    }

    fn enqueue(&self, msg: &DeviceMessage, port: u8, priority: Priority) -> Result<(), HandlerError> {
        let out = comm::encode_report(msg, port, priority)?;
        self.shared.transports.enqueue_all(&out)?;
        Ok(())
    }

    fn send_cycle(&mut self) -> Result<(), HandlerError> {
        let cfg = config::load(self.shared.config);
        let counts = self.shared.counter.counts();
        let priority = match cfg.counter_mode {
            CounterMode::CyclicConfirmed => Priority::High,
            _ => Priority::Normal,
        };
        let report = DeviceMessage::Count {
            wifi: counts.wifi,
            ble: counts.ble,
            total: counts.total,
            clock: self.clock.state().symbol(),
        };
        let result = self.enqueue(&report, COUNTER_PORT, priority);
        log::info!(
            "Send cycle: wifi {} ble {} total {}",
            counts.wifi,
            counts.ble,
            counts.total
        );

        if cfg.counter_mode.resets_after_send() {
            self.shared.counter.reset_cycle(&mut self.platform);
        }
        if cfg.sleep_cycle_secs > 0 {
            self.sleep_pending = true;
        }
        self.try_sleep(&cfg);
        result
    }

    /// Sleep once nothing is waiting to be sent.
    fn try_sleep(&mut self, cfg: &NodeConfig) {
        if !self.sleep_pending {
            return;
        }
        if cfg.sleep_cycle_secs == 0 {
            self.sleep_pending = false;
            return;
        }
        if !self.shared.transports.all_empty() {
            log::debug!(
                "Sleep postponed, {} messages queued",
                self.shared.transports.depth()
            );
            return;
        }
        self.sleep_pending = false;
        log::info!("Entering sleep for {} s", cfg.sleep_cycle_secs);
        self.platform.enter_sleep(cfg.sleep_cycle_secs);
    }

    fn housekeeping(&mut self) -> Result<(), HandlerError> {
        let cfg = config::load(self.shared.config);
        let free = self.platform.free_memory();
        match self.memory.check(free) {
            MemoryVerdict::Ok => {}
            MemoryVerdict::ResetCounters => {
                log::warn!("Free memory {} bytes below low-water mark, resetting counters", free);
                self.shared.counter.reset_cycle(&mut self.platform);
            }
            MemoryVerdict::Restart => return Err(HandlerError::ResourceExhausted),
        }
        if self.shared.counter.is_saturated() {
            log::warn!("Dedup set full, starting a new counting cycle");
            self.shared.counter.reset_cycle(&mut self.platform);
        }

        let now = self.platform.uptime_ms();
        if self.clock.decay(now).is_some() {
            self.publish_clock();
        }
        if self.clock.sync_due(now) && !self.shared.netsync.is_active() {
            self.shared.notifier.notify(Event::TimeSync);
        }
        log::debug!(
            "Housekeeping: heap {} bytes, queue {}, clock {}",
            free,
            self.shared.transports.depth(),
            self.clock.state().symbol()
        );

        self.try_sleep(&cfg);
        Ok(())
    }

    fn time_sync(&mut self) -> Result<(), HandlerError> {
        let cfg = config::load(self.shared.config);
        self.clock.set_config(cfg.sync);
        let sources = TimeSources {
            satellite: self
                .satellite
                .as_deref_mut()
                .map(|s| s as &mut dyn SatelliteReceiver),
            network: cfg.sync.network.then_some(self.shared.netsync),
            rtc: self.rtc.as_deref_mut().map(|r| r as &mut dyn RealTimeClock),
        };
        let result = self.clock.calibrate(
            sources,
            self.shared.notifier,
            &mut self.system,
            &mut self.platform,
        );
        self.publish_clock();

        match result? {
            Calibration::Synced(source) => {
                log::debug!("Calibrated from {}", source.as_str())
            }
            Calibration::Pending => log::info!("Network time handshake started"),
        }
        Ok(())
    }

    fn sensor_read(&mut self) -> Result<(), HandlerError> {
        let mut values = [0i32; MAX_SENSOR_VALUES];
        let n = self.platform.read_sensors(&mut values)?.min(values.len());
        if n == 0 {
            return Ok(());
        }
        self.enqueue(
            &DeviceMessage::Sensor {
                values: &values[..n],
            },
            SENSOR_PORT,
            Priority::Low,
        )
    }
}

impl<P: Platform, C: SystemClock> EventHandler for Node<'_, P, C> {
    fn handle(&mut self, event: Event) -> Result<(), HandlerError> {
        match event {
            Event::Button => self.platform.on_button(),
            Event::Display => {
                let status = self.status();
                self.platform.refresh_display(&status)
            }
            Event::TimeSync => self.time_sync(),
            Event::SensorRead => self.sensor_read(),
            Event::Housekeeping => self.housekeeping(),
            Event::Power => self.platform.power_event(),
            Event::SendCycle => self.send_cycle(),
            // Gate bits are consumed by the dispatcher
            Event::Mask | Event::Unmask => Ok(()),
        }
    }

    fn radio_window_imminent(&self) -> bool {
        self.platform.radio_window_imminent()
    }
}

/// Entry point of the Wi-Fi and BLE capture callbacks.
///
/// Never blocks: counting takes one short critical section, and a beacon
/// alarm is pushed at high priority, which cannot fail for lack of space.
#[derive(Clone, Copy)]
pub struct Capture<'a> {
    pub counter: &'a PresenceCounter,
    pub transports: &'a Transports,
    pub config: &'a SharedConfig,
    pub beacons: &'a SharedWatchlist,
}

impl Capture<'_> {
    /// Count an observation, raising a beacon alarm for watched addresses.
    pub fn observe(&self, obs: &RawObservation) -> Result<bool, CountError> {
        let is_new = self.counter.add_observation(obs)?;
        if is_new && config::load(self.config).monitor_mode {
            let idx =
                critical_section::with(|cs| self.beacons.borrow_ref(cs).index_of(&obs.address));
            if let Some(idx) = idx {
                log::info!("Beacon #{} seen at {} dBm", idx, obs.rssi);
                let alarm = DeviceMessage::Beacon { idx, rssi: obs.rssi };
                if let Ok(msg) = comm::encode_report(&alarm, BEACON_PORT, Priority::High) {
                    let _ = self.transports.enqueue_all(&msg);
                }
            }
        }
        Ok(is_new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use embedded_hal::delay::DelayNs;

    use crate::config::CountFilter;
    use crate::defaults::{SEND_QUEUE_SIZE, STATUS_PORT};
    use crate::error::BusError;
    use crate::filter::BeaconWatchlist;
    use crate::queue::{OutboundMessage, OutboundQueue, Transport};
    use crate::salt::{Salt, XorShiftSalt};
    use crate::scanner::LinkType;
    use crate::scheduler::Dispatcher;

    const FLOOR: u64 = 1_600_000_000;
    const T: u64 = 1_700_000_000;

    struct Board {
        now: u64,
        free: u32,
        rng: XorShiftSalt,
        slept: Option<u32>,
        sensors: &'static [i32],
        displayed: u32,
    }

    impl Board {
        fn new() -> Self {
            Self {
                now: 0,
                free: 100_000,
                rng: XorShiftSalt::new(7),
                slept: None,
                sensors: &[],
                displayed: 0,
            }
        }
    }

    impl DelayNs for Board {
        fn delay_ns(&mut self, ns: u32) {
            self.now += (ns / 1_000_000) as u64;
        }

        fn delay_ms(&mut self, ms: u32) {
            self.now += ms as u64;
        }
    }

    impl TimeBase for Board {
        fn uptime_ms(&self) -> u64 {
            self.now
        }
    }

    impl SaltSource for Board {
        fn next_salt(&mut self) -> Salt {
            self.rng.next_salt()
        }
    }

    impl Platform for Board {
        fn free_memory(&self) -> u32 {
            self.free
        }

        fn enter_sleep(&mut self, secs: u32) {
            self.slept = Some(secs);
        }

        fn refresh_display(&mut self, _status: &NodeStatus) -> Result<(), HandlerError> {
            self.displayed += 1;
            Ok(())
        }

        fn read_sensors(&mut self, out: &mut [i32]) -> Result<usize, HandlerError> {
            let n = self.sensors.len().min(out.len());
            out[..n].copy_from_slice(&self.sensors[..n]);
            Ok(n)
        }
    }

    #[derive(Default)]
    struct Sys(Option<u64>);

    impl SystemClock for Sys {
        fn set_epoch(&mut self, epoch: u64) {
            self.0 = Some(epoch);
        }
    }

    struct Gps(Option<(u64, u16)>);

    impl SatelliteReceiver for Gps {
        fn read_time(&mut self) -> Option<(u64, u16)> {
            self.0
        }
    }

    #[derive(Default)]
    struct Rtc {
        time: u64,
        written: Option<u64>,
    }

    impl RealTimeClock for Rtc {
        fn is_present(&self) -> bool {
            true
        }

        fn read(&mut self) -> Result<u64, BusError> {
            Ok(self.time)
        }

        fn write(&mut self, epoch: u64) -> Result<(), BusError> {
            self.written = Some(epoch);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Telegrams(heapless::Vec<u64, 8>);

    impl TelegramProducer for Telegrams {
        fn send_frame(&mut self, epoch: u64) {
            let _ = self.0.push(epoch);
        }
    }

    struct Fixture {
        counter: PresenceCounter,
        transports: Transports,
        notifier: Notifier,
        netsync: NetworkSync,
        config: SharedConfig,
        clock_state: SharedClockState,
        beacons: SharedWatchlist,
    }

    impl Fixture {
        fn new() -> Self {
            let mut cfg = NodeConfig::new();
            cfg.sync.epoch_floor = FLOOR;
            Self {
                counter: PresenceCounter::new(Salt(1), CountFilter::new()),
                transports: Transports::new(true, false, false),
                notifier: Notifier::new(),
                netsync: NetworkSync::new(),
                config: SharedConfig::new(Cell::new(cfg)),
                clock_state: SharedClockState::new(Cell::new(ClockState::Unsynced)),
                beacons: SharedWatchlist::new(RefCell::new(BeaconWatchlist::new())),
            }
        }

        fn shared(&self) -> NodeShared<'_> {
            NodeShared {
                counter: &self.counter,
                transports: &self.transports,
                notifier: &self.notifier,
                netsync: &self.netsync,
                config: &self.config,
                clock_state: &self.clock_state,
            }
        }

        fn node(&self) -> Node<'_, Board, Sys> {
            Node::new(self.shared(), PulseSource::HardwareTimer, Board::new(), Sys::default())
        }

        fn capture(&self) -> Capture<'_> {
            Capture {
                counter: &self.counter,
                transports: &self.transports,
                config: &self.config,
                beacons: &self.beacons,
            }
        }

        fn run(&self, node: &mut Node<'_, Board, Sys>, events: &[Event]) -> bool {
            for &e in events {
                self.notifier.notify(e);
            }
            Dispatcher::new().drain(&self.notifier, node).restart
        }

        fn lora(&self) -> &OutboundQueue<SEND_QUEUE_SIZE> {
            self.transports.queue(Transport::Lora)
        }

        fn set(&self, f: impl FnOnce(&mut NodeConfig)) {
            config::update(&self.config, f).unwrap();
        }
    }

    fn wifi(last: u8, rssi: i8) -> RawObservation {
        RawObservation::new([0x02, 0, 0, 0, 0, last], rssi, LinkType::Wifi)
    }

    #[test]
    fn send_cycle_reports_and_resets() {
        let f = Fixture::new();
        let mut node = f.node();
        f.capture().observe(&wifi(1, -40)).unwrap();
        f.capture()
            .observe(&RawObservation::new([0x04, 0, 0, 0, 0, 2], -70, LinkType::Ble))
            .unwrap();

        assert!(!f.run(&mut node, &[Event::SendCycle]));
        let msg = f.lora().dequeue().unwrap();
        assert_eq!(msg.port, COUNTER_PORT);
        assert_eq!(msg.priority, Priority::Normal);
        assert_eq!(
            msg.payload.as_slice(),
            b"{\"type\":\"count\",\"wifi\":1,\"ble\":1,\"total\":2,\"clock\":\"?\"}\n"
        );
        assert_eq!(f.counter.counts(), Counters::default());
    }

    #[test]
    fn cumulative_mode_keeps_counts() {
        let f = Fixture::new();
        f.set(|c| c.counter_mode = CounterMode::Cumulative);
        let mut node = f.node();
        f.capture().observe(&wifi(1, -40)).unwrap();

        f.run(&mut node, &[Event::SendCycle]);
        f.run(&mut node, &[Event::SendCycle]);
        assert_eq!(f.counter.counts().total, 1);
        assert_eq!(f.lora().len(), 2);
    }

    #[test]
    fn confirmed_mode_report_survives_full_queue() {
        let f = Fixture::new();
        f.set(|c| c.counter_mode = CounterMode::CyclicConfirmed);
        let mut node = f.node();
        let filler = OutboundMessage::new(3, Priority::Normal, b"x").unwrap();
        while !f.lora().is_full() {
            f.lora().enqueue(filler.clone()).unwrap();
        }

        f.run(&mut node, &[Event::SendCycle]);
        let front = f.lora().dequeue().unwrap();
        assert_eq!(front.port, COUNTER_PORT);
        assert_eq!(front.priority, Priority::High);
    }

    #[test]
    fn satellite_sample_wins_over_rtc() {
        let f = Fixture::new();
        let mut gps = Gps(Some((T, 0)));
        let mut rtc = Rtc {
            time: T - 100,
            written: None,
        };
        let mut node = f.node().with_satellite(&mut gps).with_rtc(&mut rtc);

        f.run(&mut node, &[Event::TimeSync]);
        assert_eq!(node.system().0, Some(T));
        assert_eq!(node.clock().state(), ClockState::SyncedSatellite);
        assert_eq!(clock_state(&f.clock_state), ClockState::SyncedSatellite);
        drop(node);
        assert_eq!(rtc.written, Some(T));
    }

    #[test]
    fn rtc_used_without_satellite_fix() {
        let f = Fixture::new();
        f.set(|c| c.sync.network = false);
        let mut gps = Gps(None);
        let mut rtc = Rtc {
            time: T - 100,
            written: None,
        };
        let mut node = f.node().with_satellite(&mut gps).with_rtc(&mut rtc);

        f.run(&mut node, &[Event::TimeSync]);
        assert_eq!(node.system().0, Some(T - 100));
        assert_eq!(node.clock().state(), ClockState::Reserve);
        drop(node);
        // The RTC is not written back from its own reading
        assert_eq!(rtc.written, None);
    }

    #[test]
    fn time_sync_without_sources_starts_handshake() {
        let f = Fixture::new();
        let mut node = f.node();
        f.run(&mut node, &[Event::TimeSync]);
        assert!(f.netsync.is_active());
        assert_eq!(node.clock().state(), ClockState::Unsynced);
    }

    #[test]
    fn events_posted_while_masked_run_after_unmask() {
        let f = Fixture::new();
        let mut node = f.node();
        let mut dispatcher = Dispatcher::new();
        f.notifier.mask();
        f.notifier.notify(Event::Display);
        f.notifier.notify(Event::SendCycle);

        let outcome = dispatcher.drain(&f.notifier, &mut node);
        assert!(outcome.deferred.contains(Event::SendCycle));
        assert_eq!(node.platform().displayed, 0);
        assert!(f.lora().is_empty());

        f.notifier.unmask();
        dispatcher.drain(&f.notifier, &mut node);
        assert_eq!(node.platform().displayed, 1);
        assert_eq!(f.lora().len(), 1);
    }

    #[test]
    fn due_resync_is_posted_from_housekeeping() {
        let f = Fixture::new();
        let mut node = f.node();
        f.run(&mut node, &[Event::Housekeeping]);
        assert!(f.notifier.peek().contains(Event::TimeSync));
    }

    #[test]
    fn memory_exhaustion_resets_then_restarts() {
        let f = Fixture::new();
        let mut node = f.node();
        node.platform_mut().free = 100;
        f.capture().observe(&wifi(1, -40)).unwrap();

        assert!(!f.run(&mut node, &[Event::Housekeeping]));
        assert_eq!(f.counter.counts().total, 0);
        assert!(f.run(&mut node, &[Event::Housekeeping]));
    }

    #[test]
    fn sleep_waits_for_empty_queues() {
        let f = Fixture::new();
        f.set(|c| c.sleep_cycle_secs = 300);
        let mut node = f.node();

        f.run(&mut node, &[Event::SendCycle]);
        assert_eq!(node.platform().slept, None);

        // Transport sender drains the report
        f.lora().dequeue().unwrap();
        f.run(&mut node, &[Event::Housekeeping]);
        assert_eq!(node.platform().slept, Some(300));
    }

    #[test]
    fn no_sleep_when_disabled() {
        let f = Fixture::new();
        let mut node = f.node();
        f.run(&mut node, &[Event::SendCycle]);
        f.lora().reset();
        f.run(&mut node, &[Event::Housekeeping, Event::SendCycle]);
        assert_eq!(node.platform().slept, None);
    }

    #[test]
    fn sensor_readings_go_out_at_low_priority() {
        let f = Fixture::new();
        let mut node = f.node();
        node.platform_mut().sensors = &[215, 1013];
        f.run(&mut node, &[Event::SensorRead]);
        let msg = f.lora().dequeue().unwrap();
        assert_eq!(msg.port, SENSOR_PORT);
        assert_eq!(msg.priority, Priority::Low);
        assert_eq!(
            msg.payload.as_slice(),
            b"{\"type\":\"sensor\",\"values\":[215,1013]}\n"
        );
    }

    #[test]
    fn no_readings_no_report() {
        let f = Fixture::new();
        let mut node = f.node();
        f.run(&mut node, &[Event::SensorRead]);
        assert!(f.lora().is_empty());
    }

    #[test]
    fn telegram_follows_pulse_after_sync() {
        let f = Fixture::new();
        f.set(|c| c.sync.telegram = true);
        let mut gps = Gps(Some((T, 0)));
        let mut node = f.node().with_satellite(&mut gps);
        let mut out = Telegrams::default();

        // Unsynced: no phase yet
        assert_eq!(node.on_pulse(false, &mut out), None);

        f.run(&mut node, &[Event::TimeSync]);
        assert_eq!(node.next_pulse_at(), Some(0));
        assert_eq!(node.on_pulse(false, &mut out), Some(T + 1));
        node.platform_mut().now = 1000;
        assert_eq!(node.on_pulse(false, &mut out), Some(T + 2));
        assert_eq!(out.0.as_slice(), &[T + 1, T + 2]);
    }

    #[test]
    fn telegram_off_by_default() {
        let f = Fixture::new();
        let mut gps = Gps(Some((T, 0)));
        let mut node = f.node().with_satellite(&mut gps);
        let mut out = Telegrams::default();
        f.run(&mut node, &[Event::TimeSync]);
        assert_eq!(node.on_pulse(false, &mut out), None);
        assert!(out.0.is_empty());
    }

    #[test]
    fn beacon_alarm_only_in_monitor_mode() {
        let f = Fixture::new();
        let beacon = [0x04, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE];
        critical_section::with(|cs| f.beacons.borrow_ref_mut(cs).add(beacon));
        let obs = RawObservation::new(beacon, -67, LinkType::Ble);

        assert_eq!(f.capture().observe(&obs), Ok(true));
        assert!(f.lora().is_empty());

        f.set(|c| c.monitor_mode = true);
        f.counter.reset_cycle(&mut XorShiftSalt::new(9));
        assert_eq!(f.capture().observe(&obs), Ok(true));
        let alarm = f.lora().dequeue().unwrap();
        assert_eq!(alarm.port, BEACON_PORT);
        assert_eq!(alarm.priority, Priority::High);
        assert_eq!(
            alarm.payload.as_slice(),
            b"{\"type\":\"beacon\",\"idx\":0,\"rssi\":-67}\n"
        );

        // Seen again in the same cycle: not new, no second alarm
        assert_eq!(f.capture().observe(&obs), Ok(false));
        assert!(f.lora().is_empty());
    }

    #[test]
    fn status_reports_clock_symbol_and_depth() {
        let f = Fixture::new();
        let mut gps = Gps(Some((T, 0)));
        let mut node = f.node().with_satellite(&mut gps);
        f.run(&mut node, &[Event::TimeSync, Event::SendCycle]);
        node.platform_mut().now = 90_000;

        let status = node.status();
        assert_eq!(status.clock, ClockState::SyncedSatellite);
        assert_eq!(status.queue_depth, 1);
        assert_eq!(status.uptime_s, 90);

        let msg = comm::encode_report(&status.message(), STATUS_PORT, Priority::Normal).unwrap();
        let json = core::str::from_utf8(&msg.payload).unwrap();
        assert!(json.contains(r#""clock":"G""#));
        assert!(json.contains(r#""queue":1"#));
    }

    #[test]
    fn sync_failure_is_reported_not_fatal() {
        let f = Fixture::new();
        f.set(|c| c.sync.network = false);
        let mut gps = Gps(Some((1_000, 0)));
        let mut node = f.node().with_satellite(&mut gps);
        assert!(!f.run(&mut node, &[Event::TimeSync]));
        assert_eq!(node.clock().state(), ClockState::Unsynced);
        assert_eq!(node.system().0, None);
        assert!(node.clock().next_sync_at() > 0);
    }
}
