/// Bounded, priority-aware outbound queues, one per transport.
///
/// Report producers push from the dispatcher; transport sender tasks pop
/// independently. Nothing here ever blocks: a full queue either evicts (high
/// priority) or refuses the message.
use core::cell::RefCell;

use critical_section::Mutex;
use heapless::{Deque, Vec};

use crate::defaults::{PAYLOAD_MAX, SEND_QUEUE_SIZE};
use crate::error::QueueError;

/// Send priority of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Never dropped for lack of space; evicts the oldest entry if needed.
    High,
    /// Sent before queued low-priority traffic; fails when the queue is full.
    Normal,
    /// Appended behind everything else; dropped silently when full.
    Low,
}

/// One payload waiting for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8, PAYLOAD_MAX>,
    pub port: u8,
    pub priority: Priority,
}

impl OutboundMessage {
    pub fn new(port: u8, priority: Priority, payload: &[u8]) -> Result<Self, QueueError> {
        let payload = Vec::from_slice(payload).map_err(|_| QueueError::PayloadTooLarge {
            len: payload.len(),
            max: PAYLOAD_MAX,
        })?;
        Ok(Self {
            payload,
            port,
            priority,
        })
    }
}

/// What an accepted enqueue did to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Stored,
    /// The queue was full and its oldest entry was discarded.
    EvictedOldest,
}

/// A bounded send queue. The front is the next message to send.
pub struct OutboundQueue<const N: usize> {
    inner: Mutex<RefCell<Deque<OutboundMessage, N>>>,
}

impl<const N: usize> OutboundQueue<N> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Deque::new())),
        }
    }

    /// Queue a message according to its priority.
    ///
    /// High and normal go to the front, low to the back. On a full queue a
    /// high-priority message first takes the oldest entry off the front (the
    /// one the sender would pop next); normal and low fail with
    /// [`QueueError::Full`] and leave the queue untouched.
    pub fn enqueue(&self, msg: OutboundMessage) -> Result<Enqueued, QueueError> {
        let priority = msg.priority;
        let port = msg.port;
        let result = critical_section::with(|cs| {
            let mut q = self.inner.borrow_ref_mut(cs);
            match priority {
                Priority::High => {
                    let evicted = if q.is_full() {
                        q.pop_front();
                        Enqueued::EvictedOldest
                    } else {
                        Enqueued::Stored
                    };
                    q.push_front(msg).map_err(|_| QueueError::Full)?;
                    Ok(evicted)
                }
                Priority::Normal => q
                    .push_front(msg)
                    .map(|_| Enqueued::Stored)
                    .map_err(|_| QueueError::Full),
                Priority::Low => q
                    .push_back(msg)
                    .map(|_| Enqueued::Stored)
                    .map_err(|_| QueueError::Full),
            }
        });

        match (&result, priority) {
            (Ok(Enqueued::EvictedOldest), _) => {
                log::warn!("Send queue full, evicted oldest for port {}", port)
            }
            (Err(_), Priority::Normal) => {
                log::warn!("Send queue full, dropped message for port {}", port)
            }
            _ => {}
        }
        result
    }

    /// Take the next message to send.
    pub fn dequeue(&self) -> Option<OutboundMessage> {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).pop_front())
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).is_full())
    }

    /// Discard everything pending without sending it. Returns how many were dropped.
    pub fn reset(&self) -> usize {
        critical_section::with(|cs| {
            let mut q = self.inner.borrow_ref_mut(cs);
            let dropped = q.len();
            q.clear();
            dropped
        })
    }
}

impl<const N: usize> Default for OutboundQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Uplink a queue feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Low-power wide-area radio uplink
    Lora,
    /// Local serial/SPI bus
    Spi,
    /// Network publish
    Mqtt,
}

impl Transport {
    pub const ALL: [Transport; 3] = [Transport::Lora, Transport::Spi, Transport::Mqtt];
}

/// One send queue per transport, with a flag for whether it is wired up.
pub struct Transports {
    lora: OutboundQueue<SEND_QUEUE_SIZE>,
    spi: OutboundQueue<SEND_QUEUE_SIZE>,
    mqtt: OutboundQueue<SEND_QUEUE_SIZE>,
    enabled: [bool; 3],
}

impl Transports {
    pub const fn new(lora: bool, spi: bool, mqtt: bool) -> Self {
        Self {
            lora: OutboundQueue::new(),
            spi: OutboundQueue::new(),
            mqtt: OutboundQueue::new(),
            enabled: [lora, spi, mqtt],
        }
    }

    pub fn queue(&self, transport: Transport) -> &OutboundQueue<SEND_QUEUE_SIZE> {
        match transport {
            Transport::Lora => &self.lora,
            Transport::Spi => &self.spi,
            Transport::Mqtt => &self.mqtt,
        }
    }

    pub fn is_enabled(&self, transport: Transport) -> bool {
        self.enabled[transport as usize]
    }

    /// Offer a message to every enabled transport.
    ///
    /// Returns the first failure, after every transport has been tried.
    pub fn enqueue_all(&self, msg: &OutboundMessage) -> Result<(), QueueError> {
        let mut first_err = None;
        for t in Transport::ALL {
            if !self.is_enabled(t) {
                continue;
            }
            if let Err(e) = self.queue(t).enqueue(msg.clone()) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether nothing is waiting on any transport.
    pub fn all_empty(&self) -> bool {
        Transport::ALL.iter().all(|&t| self.queue(t).is_empty())
    }

    pub fn reset_all(&self) {
        let dropped: usize = Transport::ALL.iter().map(|&t| self.queue(t).reset()).sum();
        log::info!("Send queues flushed, {} messages dropped", dropped);
    }

    /// Total pending messages across transports.
    pub fn depth(&self) -> usize {
        Transport::ALL.iter().map(|&t| self.queue(t).len()).sum()
    }
}
