//! Host audio device seam.
//!
//! The mixer never owns real hardware; it is handed a device that can open
//! a stream at a requested format, report what was actually negotiated, and
//! invoke a registered callback at roughly `buffer_ms` intervals. No
//! concrete platform backend ships with this crate: `NullDevice` in
//! `src/bin/demo.rs` is the only implementation, driving the callback
//! synchronously in a loop the way a test harness (never a real sound card)
//! would.

use crate::error::Result;
use crate::format::AudioFormat;

/// The callback the mixer installs: `(accumulator, frames)`. The device is
/// responsible for converting the 32-bit accumulator to its native format
/// on the way out; clipping happens exactly once, there.
pub type DeviceCallback = Box<dyn FnMut(&mut [i32], usize) + Send>;

/// Host audio device, consumed but never implemented by this crate.
pub trait AudioDevice: Send {
    /// Open a stream at the requested format/channels/buffer size, returning
    /// the format actually granted (which may differ from what was asked).
    fn open(&mut self, requested: AudioFormat, buffer_ms: u32) -> Result<AudioFormat>;

    /// Install the callback invoked at roughly `buffer_ms` intervals.
    fn set_callback(&mut self, callback: DeviceCallback);

    fn pause(&mut self) -> Result<()>;
    fn unpause(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}
