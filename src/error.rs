//! Error types shared across the counting, scheduling and time-sync layers.
//!
//! Everything here is recoverable at the detection site except
//! [`HandlerError::ResourceExhausted`], which the dispatcher escalates.

use thiserror_no_std::Error;

/// Failures of the presence counting engine.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountError {
    /// A capture callback handed over an address that is not 6 bytes long.
    #[error("link-layer address must be 6 bytes, got {len}")]
    AddressLength { len: usize },
    /// The dedup set for this link type has no free slot left.
    #[error("dedup set full ({capacity} ids)")]
    CapacityExhausted { capacity: usize },
}

/// Failures of the outbound dispatch queues.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was full and the message's priority does not evict.
    #[error("send queue full, message dropped")]
    Full,
    /// Payload is larger than the fixed message buffer.
    #[error("payload of {len} bytes exceeds the {max} byte buffer")]
    PayloadTooLarge { len: usize, max: usize },
    /// The report did not serialize into the payload buffer.
    #[error("report does not fit the payload buffer")]
    Encode,
}

/// Failures acquiring or talking over the shared peripheral bus.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// Another peripheral held the bus for longer than the acquisition timeout.
    #[error("bus busy, gave up after {waited_ms} ms")]
    Timeout { waited_ms: u32 },
    /// The device on the bus did not answer or answered garbage.
    #[error("bus transfer failed")]
    Transfer,
}

/// Failures of a time synchronisation attempt.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// Epoch seconds below the plausibility floor.
    #[error("implausible time {epoch} (floor {floor})")]
    Implausible { epoch: u64, floor: u64 },
    /// `set_time` called with the free-running source, which is not a time reference.
    #[error("free-running clock cannot set time")]
    NotAReference,
    /// A network handshake is already running.
    #[error("network time handshake already running")]
    Busy,
    /// No network handshake is running.
    #[error("no network time handshake running")]
    Idle,
    /// The handshake ended without a single answer.
    #[error("network time handshake timed out without answers")]
    NoAnswers,
    /// RTC could not be read or written.
    #[error("rtc access failed: {0}")]
    Rtc(BusError),
}

impl From<BusError> for SyncError {
    fn from(err: BusError) -> Self {
        SyncError::Rtc(err)
    }
}

/// Failures returned by an event handler to the dispatcher.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerError {
    #[error("bus error: {0}")]
    Bus(BusError),
    #[error("queue error: {0}")]
    Queue(QueueError),
    #[error("time sync error: {0}")]
    Sync(SyncError),
    #[error("count error: {0}")]
    Count(CountError),
    /// A collaborator (sensor, display, power chip) reported a failure.
    #[error("peripheral failure: {0}")]
    Peripheral(&'static str),
    /// Free memory stayed below the low-water mark after the counters were reset.
    #[error("resource exhaustion persists after counter reset")]
    ResourceExhausted,
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        HandlerError::Bus(err)
    }
}

impl From<QueueError> for HandlerError {
    fn from(err: QueueError) -> Self {
        HandlerError::Queue(err)
    }
}

impl From<SyncError> for HandlerError {
    fn from(err: SyncError) -> Self {
        HandlerError::Sync(err)
    }
}

impl From<CountError> for HandlerError {
    fn from(err: CountError) -> Self {
        HandlerError::Count(err)
    }
}

/// Invalid runtime configuration values.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("send cycle must be at least {min} s")]
    SendCycleTooShort { min: u32 },
    #[error("time sync needs at least one network sample")]
    NoSyncSamples,
    #[error("network sync samples {samples} exceed the limit of {max}")]
    TooManySyncSamples { samples: u8, max: u8 },
    #[error("retry interval must be shorter than the sync interval")]
    RetryNotShorter,
    #[error("period for {0} must be non-zero")]
    ZeroPeriod(&'static str),
}

/// Failures parsing or applying a remote command.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    #[error("malformed command")]
    Malformed,
    #[error("unknown command")]
    Unknown,
    #[error("command is missing its argument")]
    MissingArgument,
    #[error("beacon watch list is full")]
    WatchlistFull,
    #[error("rejected by config: {0}")]
    Config(ConfigError),
}

impl CommandError {
    /// Short code for error replies.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Malformed => "malformed",
            CommandError::Unknown => "unknown_command",
            CommandError::MissingArgument => "missing_argument",
            CommandError::WatchlistFull => "watchlist_full",
            CommandError::Config(_) => "invalid_config",
        }
    }
}

impl From<ConfigError> for CommandError {
    fn from(err: ConfigError) -> Self {
        CommandError::Config(err)
    }
}
