//! Degradation policy for persistent transfer errors.
//!
//! When retries at the current parameters are exhausted, the controller
//! lowers the packet size first, then tightens the receipt interval, and as
//! a last resort enables flow control where it was off.

/// Floor for the degraded packet size; every GATT stack accepts 20-byte
/// writes.
pub const MIN_PACKET_SIZE: usize = 20;
/// Receipt interval enabled when degrading a transfer that ran without
/// flow control.
pub const FALLBACK_PRN: u16 = 12;

/// User-supplied replacement for [`degrade`]: receives the error message and
/// the current `(prn_interval, packet_size)`, returns the next pair or
/// `None` to stop retrying.
pub type SpeedPolicy = Box<dyn Fn(&str, u16, usize) -> Option<(u16, usize)> + Send>;

/// Default degradation ladder. Returns the first change it can make, or
/// `None` when both parameters are already at their floor.
pub fn degrade(prn_interval: u16, packet_size: usize) -> Option<(u16, usize)> {
    if packet_size > MIN_PACKET_SIZE {
        Some((prn_interval, packet_size.div_ceil(2).max(MIN_PACKET_SIZE)))
    } else if prn_interval > 1 {
        Some((prn_interval.div_ceil(2), packet_size))
    } else if prn_interval == 0 {
        Some((FALLBACK_PRN, packet_size))
    } else {
        None
    }
}
