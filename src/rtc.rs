//! BM8563 battery-backed RTC on the shared I2C bus.
//!
//! Seven BCD registers from 0x02 hold seconds through years. Bit 7 of the
//! seconds register is set when the oscillator stopped, and such a time is
//! not trusted.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

use crate::bus::SharedBus;
use crate::clock::{self, DateTime};
use crate::defaults::BUS_TIMEOUT_MS;
use crate::error::BusError;
use crate::timesync::RealTimeClock;

pub const BM8563_ADDR: u8 = 0x51;

const REG_SECONDS: u8 = 0x02;
const REG_CLKOUT: u8 = 0x0d;
/// CLKOUT enabled at 1 Hz.
const CLKOUT_1HZ: u8 = 0x83;
const VOLTAGE_LOW: u8 = 0x80;
const CENTURY: u8 = 0x80;

pub struct Bm8563<'a, I, D> {
    bus: &'a SharedBus<I>,
    delay: D,
}

impl<'a, I: I2c, D: DelayNs> Bm8563<'a, I, D> {
    pub const fn new(bus: &'a SharedBus<I>, delay: D) -> Self {
        Self { bus, delay }
    }

    /// Drive the clock-out pin at 1 Hz, for use as the pulse line.
    pub fn enable_pulse(&mut self) -> Result<(), BusError> {
        self.bus.transfer(BUS_TIMEOUT_MS, &mut self.delay, |i2c| {
            i2c.write(BM8563_ADDR, &[REG_CLKOUT, CLKOUT_1HZ])
        })
    }
}

impl<I: I2c, D: DelayNs> RealTimeClock for Bm8563<'_, I, D> {
    fn is_present(&self) -> bool {
        true
    }

    fn read(&mut self) -> Result<u64, BusError> {
        let mut regs = [0u8; 7];
        self.bus.transfer(BUS_TIMEOUT_MS, &mut self.delay, |i2c| {
            i2c.write_read(BM8563_ADDR, &[REG_SECONDS], &mut regs)
        })?;
        decode(&regs)
    }

    fn write(&mut self, epoch: u64) -> Result<(), BusError> {
        let mut frame = [0u8; 8];
        frame[0] = REG_SECONDS;
        frame[1..].copy_from_slice(&encode(epoch));
        self.bus.transfer(BUS_TIMEOUT_MS, &mut self.delay, |i2c| {
            i2c.write(BM8563_ADDR, &frame)
        })
    }
}

fn bcd(v: u8) -> u8 {
    (v >> 4) * 10 + (v & 0x0f)
}

fn to_bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

fn decode(regs: &[u8; 7]) -> Result<u64, BusError> {
    if regs[0] & VOLTAGE_LOW != 0 {
        log::warn!("RTC oscillator stopped, time lost");
        return Err(BusError::Transfer);
    }
    // Years are taken as 20xx whatever the century bit says
    let t = DateTime {
        year: 2000 + bcd(regs[6]) as u16,
        month: bcd(regs[5] & 0x1f),
        day: bcd(regs[3] & 0x3f),
        hour: bcd(regs[2] & 0x3f),
        minute: bcd(regs[1] & 0x7f),
        second: bcd(regs[0] & 0x7f),
    };
    t.to_epoch().ok_or(BusError::Transfer)
}

fn encode(epoch: u64) -> [u8; 7] {
    let t = DateTime::from_epoch(epoch);
    [
        to_bcd(t.second),
        to_bcd(t.minute),
        to_bcd(t.hour),
        to_bcd(t.day),
        clock::weekday(epoch),
        to_bcd(t.month) | CENTURY,
        to_bcd((t.year % 100) as u8),
    ]
}
