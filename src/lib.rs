//! `audiomix` (an interactive real-time audio mixing engine).
//!
//! Driven by a fixed-rate pull callback from a host audio device, it plays
//! an arbitrary number of concurrent sources. Each is resampled and
//! reformatted to a common mixer format on the fly, with per-source volume,
//! fades, looping and timeouts applied, and optional filters run, before the
//! summed result is written into the device's buffer. It also implements
//! channel admission policy: when more sources are requested than channels
//! are available, one of several eviction strategies chooses the victim.
//!
//! Module map:
//! - [`format`]: PCM format description and the mix/convert primitives.
//! - [`source`]: the `AudioSource` abstraction, covering raw sources, the
//!   in-memory `SampleSource`, and decoder-backed streams.
//! - [`channel`]: a single playback slot (fades, loops, timeouts, the
//!   per-callback mix pass).
//! - [`mixer`]: the process-wide `Engine` (channel array, groups, admission
//!   policy, the device callback).
//! - [`device`]: the host audio device seam this crate consumes but does
//!   not implement.
//! - [`filter`]: the pre/post mix filter fan-out.
//! - [`clock`]: the millisecond clock seam used for fades, timeouts and age.
//! - [`error`]: `MixerError` and the crate's `Result` alias.

pub mod channel;
pub mod clock;
pub mod device;
pub mod error;
pub mod filter;
pub mod format;
pub mod mixer;
pub mod source;

pub use channel::{Channel, ChannelState, FadeKind};
pub use clock::{Clock, SystemClock, TestClock};
pub use device::{AudioDevice, DeviceCallback};
pub use error::{MixerError, Result};
pub use filter::Filter;
pub use format::{AudioFormat, Endian, SampleEncoding, SampleFormat, Signedness, FREE_CHANNEL, INFINITE, MAX_VOLUME};
pub use mixer::{Engine, MixPolicy, MixerConfig, PlayPolicy, ALL_CHANNELS};
pub use source::{AudioSource, Decoder, DecodedSource, RawSource, SampleSource, SharedSource};
