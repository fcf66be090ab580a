/// Hardware abstraction for supported boards.
///
/// Each board module names the external pulse lines and the optional
/// peripherals selected at compile time via feature flags. The firmware
/// claims the pins themselves as typed peripherals.
use crate::pulse::PulseSource;

#[cfg(feature = "board-xiao")]
mod hw {
    /// GPS module PPS line on the expansion header
    pub const GPS_PPS_PIN: Option<u8> = Some(4);
    /// No RTC fitted on the bare board
    pub const RTC_SQW_PIN: Option<u8> = None;
    pub const HAS_DISPLAY: bool = false;
    pub const BOARD_NAME: &str = "xiao_esp32s3";
}

#[cfg(feature = "board-m5stickc")]
mod hw {
    pub const GPS_PPS_PIN: Option<u8> = None;
    /// BM8563 clock output, configured to 1 Hz at boot
    pub const RTC_SQW_PIN: Option<u8> = Some(35);
    pub const HAS_DISPLAY: bool = true;
    pub const BOARD_NAME: &str = "m5stickc_plus2";
}

#[cfg(not(any(feature = "board-xiao", feature = "board-m5stickc")))]
mod hw {
    pub const GPS_PPS_PIN: Option<u8> = None;
    pub const RTC_SQW_PIN: Option<u8> = None;
    pub const HAS_DISPLAY: bool = false;
    pub const BOARD_NAME: &str = "unknown";
}

pub use hw::*;

/// The 1 Hz pulse source this board wires up.
pub const fn pulse_source() -> PulseSource {
    PulseSource::select(GPS_PPS_PIN.is_some(), RTC_SQW_PIN.is_some())
}
