/// Communication layer: serial NDJSON reports and remote commands.
///
/// Reports are encoded into outbound queue payloads; commands arrive as
/// newline-delimited JSON over serial or as downlink payloads and are applied
/// to the shared node state.
use crate::config::{self, SharedConfig};
use crate::counter::PresenceCounter;
use crate::error::{CommandError, QueueError};
use crate::filter::{self, SharedWatchlist};
use crate::netsync::NetworkSync;
use crate::protocol::{DeviceMessage, RawCommand, RemoteCommand, MAX_MSG_LEN};
use crate::queue::{OutboundMessage, Priority, Transports};
use crate::salt::SaltSource;
use crate::scheduler::{Event, Notifier};

/// BLE advertised device name
pub const BLE_ADV_NAME: &str = "paxnode";

/// Max bytes per BLE notification (default ATT MTU 23 minus 3 bytes overhead)
pub const BLE_MAX_NOTIFY: usize = 20;

// ── Serialization helpers ──────────────────────────────────────────────

/// Serialize a DeviceMessage to one NDJSON line in the output buffer.
/// Returns the number of bytes written, or None if the line does not fit.
pub fn serialize_message(msg: &DeviceMessage, buf: &mut [u8]) -> Option<usize> {
    let len = serde_json_core::to_slice(msg, buf).ok()?;
    // No room for the newline means no line at all
    *buf.get_mut(len)? = b'\n';
    Some(len + 1)
}

/// Encode a report into a queue message.
pub fn encode_report(
    msg: &DeviceMessage,
    port: u8,
    priority: Priority,
) -> Result<OutboundMessage, QueueError> {
    let mut buf = [0u8; MAX_MSG_LEN];
    let len = serialize_message(msg, &mut buf).ok_or(QueueError::Encode)?;
    OutboundMessage::new(port, priority, &buf[..len])
}

/// Deserialize a RemoteCommand from a JSON byte slice.
pub fn parse_command(data: &[u8]) -> Result<RemoteCommand, CommandError> {
    // Strip trailing newline/whitespace
    let trimmed = trim_trailing_whitespace(data);
    if trimmed.is_empty() {
        return Err(CommandError::Malformed);
    }
    let (raw, _) = serde_json_core::from_slice::<RawCommand>(trimmed)
        .map_err(|_| CommandError::Malformed)?;

    let cmd = match raw.cmd.as_str() {
        "set_rssi" => {
            let rssi = raw.rssi.ok_or(CommandError::MissingArgument)?;
            RemoteCommand::SetRssi {
                limit: if rssi == 0 { None } else { Some(rssi) },
            }
        }
        "set_mode" => RemoteCommand::SetMode {
            mode: raw.mode.ok_or(CommandError::MissingArgument)?,
        },
        "set_send_cycle" => RemoteCommand::SetSendCycle {
            secs: raw.secs.ok_or(CommandError::MissingArgument)?,
        },
        "set_monitor" => RemoteCommand::SetMonitor {
            enabled: raw.enabled.ok_or(CommandError::MissingArgument)?,
        },
        "add_beacon" => {
            let mac = raw.mac.ok_or(CommandError::MissingArgument)?;
            RemoteCommand::AddBeacon {
                mac: filter::parse_mac(&mac).ok_or(CommandError::Malformed)?,
            }
        }
        "reset_counters" => RemoteCommand::ResetCounters,
        "flush_queues" => RemoteCommand::FlushQueues,
        "time_sync" => RemoteCommand::TimeSync,
        "time_ans" => RemoteCommand::TimeAnswer {
            seq: raw.seq.ok_or(CommandError::MissingArgument)?,
            epoch: raw.epoch.ok_or(CommandError::MissingArgument)?,
            ms: raw.ms.unwrap_or(0),
        },
        "get_status" => RemoteCommand::GetStatus,
        "restart" => RemoteCommand::Restart,
        _ => return Err(CommandError::Unknown),
    };
    Ok(cmd)
}

/// Shared state a command may touch.
pub struct CommandContext<'a> {
    pub config: &'a SharedConfig,
    pub counter: &'a PresenceCounter,
    pub transports: &'a Transports,
    pub notifier: &'a Notifier,
    pub netsync: &'a NetworkSync,
    pub beacons: &'a SharedWatchlist,
}

/// What the caller has to do after a command was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEffect {
    None,
    /// Send a status report; the caller has the uptime and heap figures.
    ReportStatus,
    /// Restart the device.
    Restart,
}

/// Apply a command to the shared node state.
pub fn handle_command(
    cmd: RemoteCommand,
    ctx: &CommandContext<'_>,
    rng: &mut impl SaltSource,
) -> Result<CommandEffect, CommandError> {
    match cmd {
        RemoteCommand::SetRssi { limit } => {
            let cfg = config::update(ctx.config, |c| c.filter.rssi_limit = limit)?;
            ctx.counter.set_filter(cfg.filter);
            log::info!("RSSI limit set to {:?}", limit);
        }
        RemoteCommand::SetMode { mode } => {
            config::update(ctx.config, |c| c.counter_mode = mode)?;
            log::info!("Counter mode set to {:?}", mode);
        }
        RemoteCommand::SetSendCycle { secs } => {
            config::update(ctx.config, |c| c.send_cycle_secs = secs)?;
            log::info!("Send cycle set to {} s", secs);
        }
        RemoteCommand::SetMonitor { enabled } => {
            config::update(ctx.config, |c| c.monitor_mode = enabled)?;
            log::info!("Beacon monitor {}", if enabled { "on" } else { "off" });
        }
        RemoteCommand::AddBeacon { mac } => {
            let idx = critical_section::with(|cs| ctx.beacons.borrow_ref_mut(cs).add(mac));
            match idx {
                Some(i) => {
                    let mut text = heapless::String::<18>::new();
                    filter::format_mac(&mac, &mut text);
                    log::info!("Beacon #{} added: {}", i, text);
                }
                None => {
                    log::warn!("Beacon list full");
                    return Err(CommandError::WatchlistFull);
                }
            }
        }
        RemoteCommand::ResetCounters => {
            ctx.counter.reset_cycle(rng);
        }
        RemoteCommand::FlushQueues => {
            ctx.transports.reset_all();
            // Queued time requests are gone, so their handshake cannot finish
            ctx.netsync.abort();
        }
        RemoteCommand::TimeSync => {
            log::info!("Time sync requested by remote command");
            ctx.notifier.notify(Event::TimeSync);
        }
        RemoteCommand::TimeAnswer { seq, epoch, ms } => {
            if ctx.netsync.on_answer(seq, epoch, ms) && ctx.netsync.is_complete() {
                // Every answer is in; no need to wait for the deadline
                ctx.notifier.notify(Event::TimeSync);
            }
        }
        RemoteCommand::GetStatus => return Ok(CommandEffect::ReportStatus),
        RemoteCommand::Restart => {
            log::warn!("Restart requested by remote command");
            return Ok(CommandEffect::Restart);
        }
    }
    Ok(CommandEffect::None)
}

// ── Serial NDJSON reader ───────────────────────────────────────────────

/// Serial NDJSON reader state machine.
/// Accumulates bytes until a newline is found, then yields the line.
pub struct LineReader {
    buf: [u8; MAX_MSG_LEN],
    pos: usize,
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_MSG_LEN],
            pos: 0,
        }
    }

    /// Feed a byte into the reader. Returns a complete line (without newline)
    /// when one is detected.
    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\n' || byte == b'\r' {
            if self.pos > 0 {
                let line = &self.buf[..self.pos];
                self.pos = 0;
                Some(line)
            } else {
                None
            }
        } else if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            // Overflow: discard and reset
            self.pos = 0;
            None
        }
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_trailing_whitespace(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &data[..end]
}
