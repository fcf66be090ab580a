//! paxnode library: anonymous people counting for ESP32 sensor nodes.
//!
//! Everything that does not touch a radio or a pin lives here, testable on
//! any host with `cargo test`: the presence counting engine, the
//! interrupt-driven cyclic scheduler with its outbound queues, and the
//! multi-source time sync engine. The firmware binary (`src/main.rs`) is a
//! thin consumer that feeds captured frames in and drains the queues out.
//!
//! - **Counting**: `scanner`, `filter`, `salt`, `hash`, `counter`
//! - **Scheduling**: `scheduler`, `queue`, `bus`, `node`
//! - **Time**: `clock`, `pulse`, `netsync`, `timesync`, `nmea`, `rtc`
//! - **Shared**: `config`, `defaults`, `board`, `error`, `protocol`, `comm`
//!
//! `no_std`, no allocator. Shared state sits behind `critical_section`
//! mutexes so capture callbacks may call in from interrupt context.

#![cfg_attr(not(test), no_std)]

pub mod board;
pub mod bus;
pub mod clock;
pub mod comm;
pub mod config;
pub mod counter;
pub mod defaults;
pub mod error;
pub mod filter;
pub mod hash;
pub mod netsync;
pub mod node;
pub mod nmea;
pub mod protocol;
pub mod pulse;
pub mod queue;
pub mod rtc;
pub mod salt;
pub mod scanner;
pub mod scheduler;
pub mod timesync;
