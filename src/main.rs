//! paxnode: anonymous people counter
//!
//! Sniffs Wi-Fi and BLE, counts distinct devices per cycle without storing
//! any address, and reports the counts as NDJSON over serial and BLE GATT
//! notifications. Keeps its clock in step from the best time source the
//! board offers.
//!
//! All counting, scheduling and time logic lives in the library; this binary
//! wires radios, timers and pins to it.

#![no_std]
#![no_main]

use esp_backtrace as _;

esp_bootloader_esp_idf::esp_app_desc!();

use core::cell::{Cell, RefCell};

use critical_section::Mutex;
use embassy_futures::select::{select, select3, Either, Either3};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Ticker, Timer};
use embedded_hal::delay::DelayNs;
use esp_hal::gpio::{Input, InputConfig, Pull};
#[cfg(feature = "m5stickc")]
use esp_hal::gpio::{Level, Output, OutputConfig};
#[cfg(feature = "m5stickc")]
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::rng::Rng;
use esp_hal::rtc_cntl::sleep::TimerWakeupSource;
use esp_hal::rtc_cntl::Rtc;
use esp_hal::timer::timg::TimerGroup;
#[cfg(feature = "m5stickc")]
use esp_hal::{delay::Delay, time::Rate, Blocking};
#[cfg(feature = "xiao")]
use esp_hal::{
    uart::{Config as UartConfig, Uart},
    Async,
};
use static_cell::StaticCell;

use trouble_host::prelude::*;

use paxnode::board;
#[cfg(feature = "m5stickc")]
use paxnode::bus::SharedBus;
use paxnode::clock::ClockState;
use paxnode::comm::{self, CommandContext, CommandEffect, LineReader};
use paxnode::config::{self, CountFilter, NodeConfig, SharedConfig};
use paxnode::counter::PresenceCounter;
use paxnode::defaults;
use paxnode::error::CommandError;
use paxnode::filter::{BeaconWatchlist, SharedWatchlist};
use paxnode::netsync::{NetworkSync, SyncStep};
#[cfg(feature = "xiao")]
use paxnode::nmea::{NmeaDecoder, SatelliteFix};
use paxnode::node::{self, Capture, Node, NodeShared, NodeStatus, Platform, SharedClockState};
use paxnode::protocol::{DeviceMessage, MsgBuffer, RemoteCommand, VERSION};
use paxnode::queue::{Priority, Transport, Transports};
#[cfg(feature = "m5stickc")]
use paxnode::rtc::Bm8563;
use paxnode::salt::{Salt, SaltSource};
use paxnode::scanner::{self, LinkType, RawObservation};
use paxnode::scheduler::{Dispatcher, Event, Gate, Notifier, PeriodicTimer};
#[cfg(feature = "xiao")]
use paxnode::timesync::SatelliteReceiver;
use paxnode::timesync::{SystemClock, TelegramProducer, TimeBase};

// ── BLE GATT server definition ──────────────────────────────────────

#[gatt_service(uuid = "7a3e0001-5b2c-4d8e-9f41-c06d2e8b1a57")]
struct PaxGattService {
    /// TX: outbound reports, notify-only.
    /// Messages are chunked into BLE_MAX_NOTIFY-sized pieces; the host
    /// accumulates until it sees '\n' (NDJSON delimiter).
    #[characteristic(uuid = "7a3e0002-5b2c-4d8e-9f41-c06d2e8b1a57", notify)]
    tx: [u8; 20],

    /// RX: remote commands, write-only, accumulated via LineReader.
    #[characteristic(uuid = "7a3e0003-5b2c-4d8e-9f41-c06d2e8b1a57", write)]
    rx: [u8; 20],
}

#[gatt_server]
struct PaxServer {
    pax_service: PaxGattService,
}

// ── Channel type aliases ──────────────────────────────────────────────

type CommandChannel = Channel<CriticalSectionRawMutex, Result<RemoteCommand, CommandError>, 4>;
type BleOutputChannel = Channel<CriticalSectionRawMutex, MsgBuffer, 4>;

// ── Static shared state ──────────────────────────────────────────────

static COUNTER: PresenceCounter = PresenceCounter::new(Salt(0), CountFilter::new());

/// LoRaWAN is not driven by this firmware; reports go out over serial/BLE
/// through the local queue.
static TRANSPORTS: Transports = Transports::new(false, true, false);

static NOTIFIER: Notifier = Notifier::new();

static NETSYNC: NetworkSync = NetworkSync::new();

static CONFIG: SharedConfig = Mutex::new(Cell::new(NodeConfig::new()));

static CLOCK_STATE: SharedClockState = Mutex::new(Cell::new(ClockState::Unsynced));

static BEACONS: SharedWatchlist = Mutex::new(RefCell::new(BeaconWatchlist::new()));

/// Latest fix from the receiver on the GPS UART
#[cfg(feature = "xiao")]
static GPS_FIX: SatelliteFix = SatelliteFix::new();

/// Rising edge on the external pulse line
static PULSE_EDGE: Signal<CriticalSectionRawMutex, ()> = Signal::new();

static CMD_CHANNEL: CommandChannel = Channel::new();

/// Serial task clones every report here for the GATT server.
static BLE_OUTPUT_CHANNEL: BleOutputChannel = Channel::new();

/// Software timer resolution for the cycle producers
const TIMER_TICK_MS: u64 = 20;

/// How long the serial task sleeps when the local queue is empty
const OUTPUT_POLL_MS: u64 = 50;

/// A missing external edge is replaced by the timer after this much slack
const PULSE_EDGE_GRACE_MS: u64 = 200;

#[cfg(feature = "m5stickc")]
const BUTTON_DEBOUNCE_MS: u64 = 250;

/// Holding the button this long powers the node off
#[cfg(feature = "m5stickc")]
const POWER_OFF_HOLD_MS: u64 = 2_000;

fn capture() -> Capture<'static> {
    Capture {
        counter: &COUNTER,
        transports: &TRANSPORTS,
        config: &CONFIG,
        beacons: &BEACONS,
    }
}

fn enqueue_report(msg: &DeviceMessage, port: u8, priority: Priority) {
    match comm::encode_report(msg, port, priority) {
        Ok(out) => {
            if let Err(e) = TRANSPORTS.enqueue_all(&out) {
                log::warn!("Report on port {} dropped: {}", port, e);
            }
        }
        Err(e) => log::warn!("Report on port {} not encoded: {}", port, e),
    }
}

// ── Platform services ────────────────────────────────────────────────

/// Hardware RNG as salt source.
struct HwSalt(Rng);

impl SaltSource for HwSalt {
    fn next_salt(&mut self) -> Salt {
        Salt(self.0.random() as u16)
    }
}

struct EspBoard {
    rtc: Rtc<'static>,
    salt: HwSalt,
    /// Keeps the M5StickC Plus2 powered while high
    #[cfg(feature = "m5stickc")]
    power_hold: Output<'static>,
}

impl DelayNs for EspBoard {
    fn delay_ns(&mut self, ns: u32) {
        embassy_time::block_for(Duration::from_nanos(ns as u64));
    }
}

impl TimeBase for EspBoard {
    fn uptime_ms(&self) -> u64 {
        Instant::now().as_millis()
    }
}

impl SaltSource for EspBoard {
    fn next_salt(&mut self) -> Salt {
        self.salt.next_salt()
    }
}

impl Platform for EspBoard {
    fn free_memory(&self) -> u32 {
        esp_alloc::HEAP.free() as u32
    }

    fn enter_sleep(&mut self, secs: u32) {
        let timer = TimerWakeupSource::new(core::time::Duration::from_secs(secs as u64));
        log::info!("Going to sleep for {} s", secs);
        self.rtc.sleep_deep(&[&timer]);
    }

    fn on_button(&mut self) -> Result<(), paxnode::error::HandlerError> {
        log::info!("Button pressed, sending counts now");
        NOTIFIER.notify(Event::SendCycle);
        Ok(())
    }

    /// No panel driver yet: the status line goes to the log instead.
    fn refresh_display(&mut self, status: &NodeStatus) -> Result<(), paxnode::error::HandlerError> {
        log::trace!(
            "wifi {} ble {} clock {} queue {}",
            status.counts.wifi,
            status.counts.ble,
            status.clock.symbol(),
            status.queue_depth
        );
        Ok(())
    }

    fn power_event(&mut self) -> Result<(), paxnode::error::HandlerError> {
        #[cfg(feature = "m5stickc")]
        {
            log::info!("Power button held, switching off");
            self.power_hold.set_low();
        }
        Ok(())
    }
}

/// Satellite time from the fixes the GPS task decodes.
#[cfg(feature = "xiao")]
struct GpsReceiver;

#[cfg(feature = "xiao")]
impl SatelliteReceiver for GpsReceiver {
    fn read_time(&mut self) -> Option<(u64, u16)> {
        GPS_FIX.time_at(Instant::now().as_millis())
    }
}

#[cfg(feature = "m5stickc")]
type BoardRtc = Bm8563<'static, I2c<'static, Blocking>, Delay>;

/// Wall clock of the node. Nothing on board consumes it beyond the log yet.
struct WallClock;

impl SystemClock for WallClock {
    fn set_epoch(&mut self, epoch: u64) {
        log::debug!("System clock set to {}", epoch);
    }
}

/// Telegram output over the log; the frame encoders live with the
/// clock controller hardware.
struct LogTelegram;

impl TelegramProducer for LogTelegram {
    fn send_frame(&mut self, epoch: u64) {
        log::debug!("Clock telegram for {}", epoch);
    }
}

// ── WiFi sniffer ─────────────────────────────────────────────────────

/// WiFi sniffer callback: called from ISR context by the esp-radio sniffer.
///
/// Reduces each frame to its transmitter address and counts it directly;
/// the counter only takes a short critical section.
fn wifi_sniffer_callback(pkt: esp_radio::wifi::sniffer::PromiscuousPkt<'_>) {
    let rssi = pkt.rx_cntl.rssi as i8;
    let channel = pkt.rx_cntl.channel as u8;
    if let Some(obs) = scanner::parse_wifi_frame(pkt.data, rssi, channel) {
        if let Err(e) = capture().observe(&obs) {
            log::trace!("Wi-Fi observation dropped: {}", e);
        }
    }
}

// FFI binding for WiFi channel control.
// The symbol is linked via esp-radio's WiFi driver.
unsafe extern "C" {
    fn esp_wifi_set_channel(primary: u8, second: u32) -> i32;
}

/// WiFi channel hop task: cycles through 2.4 GHz channels to capture
/// traffic across all channels.
#[embassy_executor::task]
async fn wifi_channel_hop_task() {
    loop {
        for &ch in scanner::WIFI_CHANNELS {
            unsafe {
                esp_wifi_set_channel(ch, 0);
            }
            Timer::after(Duration::from_millis(scanner::DEFAULT_DWELL_MS)).await;
        }
    }
}

// ── BLE scan event handler ───────────────────────────────────────────

/// EventHandler for BLE advertisement reports from trouble-host.
///
/// Called synchronously from the runner: must not block.
struct ScanEventHandler;

impl EventHandler for ScanEventHandler {
    fn on_adv_reports(&self, mut it: LeAdvReportsIter<'_>) {
        while let Some(Ok(report)) = it.next() {
            let result = RawObservation::from_slice(report.addr.raw(), report.rssi, LinkType::Ble)
                .and_then(|obs| capture().observe(&obs));
            if let Err(e) = result {
                log::trace!("BLE observation dropped: {}", e);
            }
        }
    }
}

// ── Entry point ──────────────────────────────────────────────────────

#[esp_rtos::main]
async fn main(spawner: embassy_executor::Spawner) {
    esp_println::logger::init_logger_from_env();

    let peripherals = esp_hal::init(esp_hal::Config::default());

    // Heap for the BLE + WiFi coex stacks.
    // ESP32-S3 needs more heap for coex; ESP32 is tighter on DRAM.
    #[cfg(feature = "esp32")]
    {
        esp_alloc::heap_allocator!(size: 64 * 1024);
    }
    #[cfg(not(feature = "esp32"))]
    {
        esp_alloc::heap_allocator!(size: 128 * 1024);
    }

    // Start the RTOS: requires timer + software interrupt
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    log::info!("paxnode v{} starting on {}", VERSION, board::BOARD_NAME);

    if let Err(e) = config::load(&CONFIG).validate() {
        log::warn!("Default config rejected: {}", e);
    }

    // Fresh salt for the first counting cycle
    COUNTER.reset_cycle(&mut HwSalt(Rng::new()));

    let shared = NodeShared {
        counter: &COUNTER,
        transports: &TRANSPORTS,
        notifier: &NOTIFIER,
        netsync: &NETSYNC,
        config: &CONFIG,
        clock_state: &CLOCK_STATE,
    };
    let platform = EspBoard {
        rtc: Rtc::new(peripherals.LPWR),
        salt: HwSalt(Rng::new()),
        // Hold power on (M5StickC Plus2 needs GPIO4 HIGH to stay powered)
        #[cfg(feature = "m5stickc")]
        power_hold: Output::new(peripherals.GPIO4, Level::High, OutputConfig::default()),
    };
    let node = Node::new(shared, board::pulse_source(), platform, WallClock);

    // BM8563 on the internal I2C bus: time reserve and 1 Hz pulse
    #[cfg(feature = "m5stickc")]
    let node = {
        static I2C_BUS: StaticCell<SharedBus<I2c<'static, Blocking>>> = StaticCell::new();
        static RTC_CHIP: StaticCell<BoardRtc> = StaticCell::new();

        let i2c = I2c::new(
            peripherals.I2C0,
            I2cConfig::default().with_frequency(Rate::from_khz(400)),
        )
        .expect("I2C init failed")
        .with_sda(peripherals.GPIO21)
        .with_scl(peripherals.GPIO22);
        let bus = I2C_BUS.init(SharedBus::new(i2c));
        let rtc = RTC_CHIP.init(Bm8563::new(bus, Delay::new()));
        if let Err(e) = rtc.enable_pulse() {
            log::warn!("RTC pulse output not enabled: {}", e);
        }
        node.with_rtc(rtc)
    };

    // Serial GPS on D4/D5 of the expansion header
    #[cfg(feature = "xiao")]
    let node = {
        static GPS: StaticCell<GpsReceiver> = StaticCell::new();

        let uart = Uart::new(
            peripherals.UART1,
            UartConfig::default().with_baudrate(defaults::GPS_BAUD),
        )
        .expect("GPS UART init failed")
        .with_rx(peripherals.GPIO6)
        .with_tx(peripherals.GPIO5)
        .into_async();
        spawner.spawn(gps_task(uart)).unwrap();
        node.with_satellite(GPS.init(GpsReceiver))
    };

    spawner.spawn(dispatcher_task(node)).unwrap();
    spawner.spawn(cycle_timer_task()).unwrap();
    spawner.spawn(netsync_task()).unwrap();
    spawner.spawn(output_serial_task()).unwrap();
    spawner.spawn(command_task(HwSalt(Rng::new()))).unwrap();

    #[cfg(feature = "m5stickc")]
    {
        let button = Input::new(peripherals.GPIO37, InputConfig::default());
        spawner.spawn(button_task(button)).unwrap();
        let sqw = Input::new(peripherals.GPIO35, InputConfig::default());
        spawner.spawn(pulse_edge_task(sqw)).unwrap();
    }

    #[cfg(feature = "xiao")]
    {
        let pps = Input::new(
            peripherals.GPIO4,
            InputConfig::default().with_pull(Pull::Down),
        );
        spawner.spawn(pulse_edge_task(pps)).unwrap();
    }

    log::info!("Pulse source: {:?}", board::pulse_source());

    // First sync right away, then on the resync schedule
    NOTIFIER.notify(Event::TimeSync);

    // ── BLE radio initialization ───────────────────────────────────────
    // BLE must be initialized BEFORE WiFi for coexistence to work
    // (especially on ESP32-S3).

    let connector =
        esp_radio::ble::controller::BleConnector::new(peripherals.BT, Default::default())
            .expect("BLE connector init failed");

    // ── WiFi sniffer initialization ─────────────────────────────────────

    let (_wifi_controller, wifi_interfaces) =
        esp_radio::wifi::new(peripherals.WIFI, Default::default()).expect("WiFi init failed");

    let mut sniffer = wifi_interfaces.sniffer;
    sniffer.set_receive_cb(wifi_sniffer_callback);
    sniffer
        .set_promiscuous_mode(true)
        .expect("Promiscuous mode failed");

    spawner.spawn(wifi_channel_hop_task()).unwrap();

    log::info!("WiFi sniffer initialized in promiscuous mode");

    let controller: ExternalController<_, 20> = ExternalController::new(connector);

    static HOST_RESOURCES: StaticCell<HostResources<DefaultPacketPool, 1, 2>> = StaticCell::new();
    let resources = HOST_RESOURCES.init(HostResources::new());

    let address = Address::random([0xff, 0x3e, 0x7a, 0x51, 0xc0, 0x6d]);

    let stack = trouble_host::new(controller, resources).set_random_address(address);
    let Host {
        mut peripheral,
        central,
        mut runner,
        ..
    } = stack.build();

    let server = PaxServer::new_with_config(GapConfig::Peripheral(PeripheralConfig {
        name: comm::BLE_ADV_NAME,
        appearance: &appearance::UNKNOWN,
    }))
    .expect("GATT server init failed");

    let scan_handler = ScanEventHandler;

    log::info!("BLE radio initialized");

    // Three concurrent futures: stack runner, BLE scanner, GATT server
    let _ = embassy_futures::join::join3(
        async {
            loop {
                if let Err(e) = runner.run_with_handler(&scan_handler).await {
                    log::error!("BLE runner error: {:?}", e);
                    Timer::after(Duration::from_secs(1)).await;
                }
            }
        },
        async {
            let mut scanner = trouble_host::scan::Scanner::new(central);
            let config = ScanConfig::default();

            let _session = match scanner.scan(&config).await {
                Ok(session) => session,
                Err(e) => {
                    log::error!("BLE scan failed to start: {:?}", e);
                    return;
                }
            };

            log::info!("BLE scan started (continuous)");
            // Reports flow through ScanEventHandler while the session lives
            loop {
                Timer::after(Duration::from_secs(60)).await;
            }
        },
        async {
            loop {
                let mut adv_data = [0u8; 31];
                let adv_len = match AdStructure::encode_slice(
                    &[
                        AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
                        AdStructure::CompleteLocalName(comm::BLE_ADV_NAME.as_bytes()),
                    ],
                    &mut adv_data[..],
                ) {
                    Ok(len) => len,
                    Err(e) => {
                        log::error!("Ad encode error: {:?}", e);
                        Timer::after(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let advertiser = match peripheral
                    .advertise(
                        &Default::default(),
                        Advertisement::ConnectableScannableUndirected {
                            adv_data: &adv_data[..adv_len],
                            scan_data: &[],
                        },
                    )
                    .await
                {
                    Ok(adv) => adv,
                    Err(e) => {
                        log::error!("BLE advertise error: {:?}", e);
                        Timer::after(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let conn = match advertiser.accept().await {
                    Ok(c) => c,
                    Err(e) => {
                        log::error!("BLE accept error: {:?}", e);
                        continue;
                    }
                };

                let gatt_conn = match conn.with_attribute_server(&server) {
                    Ok(gc) => gc,
                    Err(e) => {
                        log::error!("GATT setup error: {:?}", e);
                        continue;
                    }
                };

                log::info!("BLE client connected");
                handle_gatt_connection(&gatt_conn, &server).await;
                log::info!("BLE client disconnected, re-advertising");
            }
        },
    )
    .await;
}

/// Forward reports as notifications and feed writes to the command parser.
async fn handle_gatt_connection<'s, P: PacketPool>(
    conn: &GattConnection<'_, 's, P>,
    server: &'s PaxServer<'_>,
) {
    let ble_rx = BLE_OUTPUT_CHANNEL.receiver();
    let mut line_reader = LineReader::new();

    loop {
        match select(ble_rx.receive(), conn.next()).await {
            Either::First(msg) => {
                // Pad with newlines so the host's NDJSON parser sees
                // empty lines instead of null bytes.
                for chunk in msg.chunks(comm::BLE_MAX_NOTIFY) {
                    let mut padded = [b'\n'; 20];
                    padded[..chunk.len()].copy_from_slice(chunk);
                    if server.pax_service.tx.notify(conn, &padded).await.is_err() {
                        return;
                    }
                }
            }
            Either::Second(event) => match event {
                GattConnectionEvent::Disconnected { .. } => return,
                GattConnectionEvent::Gatt { event } => {
                    if let GattEvent::Write(ref write_event) = event {
                        if write_event.handle() == server.pax_service.rx.handle {
                            for &byte in write_event.data() {
                                if let Some(line) = line_reader.feed(byte) {
                                    let _ = CMD_CHANNEL.try_send(comm::parse_command(line));
                                }
                            }
                        }
                    }
                    // Must accept/reply to all GATT events
                    if let Ok(reply) = event.accept() {
                        reply.send().await;
                    }
                }
                _ => {}
            },
        }
    }
}

// ── Tasks ────────────────────────────────────────────────────────────

/// Runs every handler the producers post, plus the 1 Hz pulse.
#[embassy_executor::task]
async fn dispatcher_task(mut node: Node<'static, EspBoard, WallClock>) {
    let mut dispatcher = Dispatcher::new();
    let mut telegram = LogTelegram;
    let external = board::pulse_source().is_external();

    loop {
        let now = Instant::now().as_millis();
        let mut wake_at = node.next_pulse_at().map(|t| {
            if external {
                t + PULSE_EDGE_GRACE_MS
            } else {
                t
            }
        });
        if !dispatcher.deferred().is_empty() && NOTIFIER.gate() == Gate::Open {
            // Deferred for an imminent radio job; look again once it is over
            let retry = now + defaults::RADIO_GUARD_MS as u64;
            wake_at = Some(wake_at.map_or(retry, |t| t.min(retry)));
        }
        let timer = Timer::at(wake_at.map_or(Instant::MAX, Instant::from_millis));

        match select3(NOTIFIER.wait(), timer, PULSE_EDGE.wait()).await {
            Either3::First(()) => {}
            Either3::Second(()) => {
                node.on_pulse(false, &mut telegram);
            }
            Either3::Third(()) => {
                node.on_pulse(true, &mut telegram);
            }
        }

        if NOTIFIER.peek().is_empty() && dispatcher.deferred().is_empty() {
            continue;
        }
        if dispatcher.drain(&NOTIFIER, &mut node).restart {
            log::error!("Free memory exhausted, restarting");
            esp_hal::system::software_reset();
        }
    }
}

/// Posts the periodic cycle events.
#[embassy_executor::task]
async fn cycle_timer_task() {
    let start = Instant::now().as_millis();
    let cfg = config::load(&CONFIG);
    let mut send = PeriodicTimer::new(secs_to_ms(cfg.send_cycle_secs), start);
    let mut housekeeping = PeriodicTimer::new(secs_to_ms(cfg.housekeeping_secs), start);
    let mut sensors = PeriodicTimer::new(secs_to_ms(cfg.sensor_cycle_secs), start);
    let mut display = PeriodicTimer::new(display_period(&cfg), start);
    let mut ticker = Ticker::every(Duration::from_millis(TIMER_TICK_MS));

    loop {
        ticker.next().await;
        let now = Instant::now().as_millis();
        let cfg = config::load(&CONFIG);
        retune(&mut send, secs_to_ms(cfg.send_cycle_secs), now);
        retune(&mut housekeeping, secs_to_ms(cfg.housekeeping_secs), now);
        retune(&mut sensors, secs_to_ms(cfg.sensor_cycle_secs), now);
        retune(&mut display, display_period(&cfg), now);

        if send.poll(now) {
            NOTIFIER.notify(Event::SendCycle);
        }
        if housekeeping.poll(now) {
            NOTIFIER.notify(Event::Housekeeping);
        }
        if sensors.poll(now) {
            NOTIFIER.notify(Event::SensorRead);
        }
        if display.poll(now) {
            NOTIFIER.notify(Event::Display);
        }
    }
}

/// Zero, which never fires, on boards without a display.
fn display_period(cfg: &NodeConfig) -> u64 {
    if board::HAS_DISPLAY {
        cfg.display_refresh_ms as u64
    } else {
        0
    }
}

fn secs_to_ms(secs: u32) -> u64 {
    secs as u64 * 1000
}

/// Restart a timer when its configured period changed.
fn retune(timer: &mut PeriodicTimer, period_ms: u64, now_ms: u64) {
    if timer.period_ms() != period_ms {
        timer.set_period(period_ms, now_ms);
    }
}

/// Drives the network time handshake: sends requests, and hands over to
/// the dispatcher once it is ready to fuse.
#[embassy_executor::task]
async fn netsync_task() {
    loop {
        let now = Instant::now().as_millis();
        match NETSYNC.poll(now) {
            SyncStep::Idle => Timer::after(Duration::from_secs(1)).await,
            SyncStep::SendRequest(seq) => {
                enqueue_report(
                    &DeviceMessage::TimeRequest { seq },
                    defaults::TIME_PORT,
                    Priority::High,
                );
                NETSYNC.mark_sent(seq, now);
            }
            SyncStep::Wait { until_ms } => {
                Timer::at(Instant::from_millis(until_ms.min(now + 1000))).await
            }
            SyncStep::Ready | SyncStep::TimedOut => {
                NOTIFIER.notify(Event::TimeSync);
                Timer::after(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Drains the local queue to serial and forwards a copy to BLE.
#[embassy_executor::task]
async fn output_serial_task() {
    log::info!("Serial output task started");

    let queue = TRANSPORTS.queue(Transport::Spi);

    loop {
        let Some(msg) = queue.dequeue() else {
            Timer::after(Duration::from_millis(OUTPUT_POLL_MS)).await;
            continue;
        };

        // Non-blocking; drops if no client is draining it
        let _ = BLE_OUTPUT_CHANNEL.try_send(msg.payload.clone());

        if let Ok(s) = core::str::from_utf8(&msg.payload) {
            log::info!("{}", s.trim_end());
        }
    }
}

/// Applies remote commands and sends replies.
#[embassy_executor::task]
async fn command_task(mut salt: HwSalt) {
    let ctx = CommandContext {
        config: &CONFIG,
        counter: &COUNTER,
        transports: &TRANSPORTS,
        notifier: &NOTIFIER,
        netsync: &NETSYNC,
        beacons: &BEACONS,
    };

    loop {
        let result = CMD_CHANNEL
            .receive()
            .await
            .and_then(|cmd| comm::handle_command(cmd, &ctx, &mut salt));

        match result {
            Ok(CommandEffect::None) => {}
            Ok(CommandEffect::ReportStatus) => {
                let status = NodeStatus::collect(
                    &COUNTER,
                    &TRANSPORTS,
                    node::clock_state(&CLOCK_STATE),
                    Instant::now().as_millis(),
                    esp_alloc::HEAP.free() as u32,
                );
                enqueue_report(&status.message(), defaults::STATUS_PORT, Priority::Normal);
            }
            Ok(CommandEffect::Restart) => {
                Timer::after(Duration::from_millis(100)).await;
                esp_hal::system::software_reset();
            }
            Err(e) => {
                log::warn!("Command rejected: {}", e);
                enqueue_report(
                    &DeviceMessage::Error { msg: e.code() },
                    defaults::STATUS_PORT,
                    Priority::Low,
                );
            }
        }
    }
}

/// A short press is a button event, a long hold a power event.
#[cfg(feature = "m5stickc")]
#[embassy_executor::task]
async fn button_task(mut button: Input<'static>) {
    loop {
        button.wait_for_falling_edge().await;
        let held = Timer::after(Duration::from_millis(POWER_OFF_HOLD_MS));
        match select(button.wait_for_rising_edge(), held).await {
            Either::First(()) => NOTIFIER.notify(Event::Button),
            Either::Second(()) => NOTIFIER.notify(Event::Power),
        }
        Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;
    }
}

/// Feeds the NMEA stream to the decoder and publishes each fix.
#[cfg(feature = "xiao")]
#[embassy_executor::task]
async fn gps_task(mut uart: Uart<'static, Async>) {
    let mut decoder = NmeaDecoder::new();
    let mut buf = [0u8; 64];
    loop {
        let n = match uart.read_async(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                log::warn!("GPS UART error: {:?}", e);
                continue;
            }
        };
        for &b in &buf[..n] {
            if let Some(fix_ms) = decoder.feed(b) {
                GPS_FIX.store(fix_ms, Instant::now().as_millis());
            }
        }
    }
}

/// Forwards edges of the external 1 Hz line to the dispatcher.
#[embassy_executor::task]
async fn pulse_edge_task(mut line: Input<'static>) {
    loop {
        line.wait_for_rising_edge().await;
        PULSE_EDGE.signal(());
    }
}
