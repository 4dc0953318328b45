//! Audio source abstraction: a uniform interface over raw-PCM streams,
//! decoded streams, and in-memory samples. Sources are frame producers,
//! independent of any particular channel binding; prefer multiple source
//! instances backed by shared content over sharing one source across
//! channels.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{MixerError, Result};
use crate::format::{self, AudioFormat, MAX_VOLUME, setup_cvt};

/// A source shared between whoever constructed it and the channel playing
/// it; internal state is guarded by its own lock.
pub type SharedSource = Arc<Mutex<dyn AudioSource>>;

pub fn shared<S: AudioSource + 'static>(source: S) -> SharedSource {
    Arc::new(Mutex::new(source))
}

/// Uniform frame-producer interface. Implementations: [`RawSource`],
/// [`SampleSource`], [`DecodedSource`].
pub trait AudioSource: Send {
    /// Format of the frames this source produces. Constant over the
    /// source's lifetime.
    fn format(&self) -> AudioFormat;

    /// Total length in frames, or `None` if unknown (e.g. a live stream).
    fn length_frames(&self) -> Option<u64>;

    fn priority(&self) -> i32;
    fn set_priority(&mut self, priority: i32);

    /// Per-source volume, `0..=256`.
    fn volume(&self) -> i32;
    fn set_volume(&mut self, volume: i32) -> Result<()>;

    /// Playback rate multiplier, `>= 0`.
    fn rate(&self) -> f64;
    fn set_rate(&mut self, rate: f64) -> Result<()>;

    fn can_rewind(&self) -> bool;
    fn can_seek(&self) -> bool;

    fn position(&self) -> u64;
    fn set_position(&mut self, frames: u64) -> Result<()>;

    fn rewind(&mut self) -> Result<()>;

    /// Raw bytes in source format; advances `position` by the number of
    /// frames actually produced. Returns 0 at end of stream.
    fn read_bytes(&mut self, buf: &mut Vec<u8>, frames: usize) -> Result<usize>;

    /// Produce up to `frames` frames into `out` (`out.len()` must be
    /// `frames * channels`). When `volume < 0`, writes plain widened
    /// 32-bit samples (for later filter processing); when `volume >= 0`,
    /// performs the mixer-format conversion directly into `out`,
    /// saturating-adding rather than overwriting.
    fn read_frames(&mut self, out: &mut [i32], frames: usize, volume: i32) -> Result<usize>;

    /// Only defined when `length_frames()` is known.
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let total = self
            .length_frames()
            .ok_or(MixerError::UnsupportedOperation(
                "read_all requires a source of known length",
            ))?;
        self.rewind()?;
        let mut buf = Vec::new();
        self.read_bytes(&mut buf, total as usize)?;
        Ok(buf)
    }
}

fn validate_volume(v: i32) -> Result<()> {
    if !(0..=MAX_VOLUME).contains(&v) {
        return Err(MixerError::OutOfRange("source volume must be in 0..=256"));
    }
    Ok(())
}

fn validate_rate(r: f64) -> Result<()> {
    if r < 0.0 || !r.is_finite() {
        return Err(MixerError::OutOfRange("source rate must be >= 0"));
    }
    Ok(())
}

/// Trait alias for the byte stream backing a [`RawSource`].
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// A fixed-format byte stream, optionally windowed to `[start, start+len)`
/// frames of the underlying stream.
pub struct RawSource {
    format: AudioFormat,
    stream: Box<dyn ReadSeek>,
    start_frame: u64,
    window_frames: Option<u64>,
    position: u64,
    priority: i32,
    volume: i32,
    rate: f64,
}

impl RawSource {
    pub fn new(format: AudioFormat, stream: Box<dyn ReadSeek>) -> Self {
        RawSource {
            format,
            stream,
            start_frame: 0,
            window_frames: None,
            position: 0,
            priority: 0,
            volume: MAX_VOLUME,
            rate: 1.0,
        }
    }

    pub fn windowed(
        format: AudioFormat,
        stream: Box<dyn ReadSeek>,
        start_frame: u64,
        length_frames: u64,
    ) -> Self {
        RawSource {
            format,
            stream,
            start_frame,
            window_frames: Some(length_frames),
            position: 0,
            priority: 0,
            volume: MAX_VOLUME,
            rate: 1.0,
        }
    }

    fn remaining_frames(&self) -> Option<u64> {
        self.window_frames.map(|w| w.saturating_sub(self.position))
    }
}

impl AudioSource for RawSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn length_frames(&self) -> Option<u64> {
        self.window_frames
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    fn volume(&self) -> i32 {
        self.volume
    }

    fn set_volume(&mut self, volume: i32) -> Result<()> {
        validate_volume(volume)?;
        self.volume = volume;
        Ok(())
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn set_rate(&mut self, rate: f64) -> Result<()> {
        validate_rate(rate)?;
        self.rate = rate;
        Ok(())
    }

    fn can_rewind(&self) -> bool {
        true
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, frames: u64) -> Result<()> {
        if let Some(len) = self.window_frames {
            if frames > len {
                return Err(MixerError::OutOfRange("position beyond source length"));
            }
        }
        self.position = frames;
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut Vec<u8>, frames: usize) -> Result<usize> {
        let frame_size = self.format.frame_size();
        let requested = match self.remaining_frames() {
            Some(remaining) => frames.min(remaining as usize),
            None => frames,
        };
        let byte_len = requested * frame_size;
        buf.clear();
        buf.resize(byte_len, 0);

        let abs_frame = self.start_frame + self.position;
        self.stream
            .seek(SeekFrom::Start(abs_frame * frame_size as u64))
            .map_err(|e| MixerError::DeviceError(format!("seek failed: {e}")))?;

        let mut read_total = 0usize;
        while read_total < byte_len {
            let n = self
                .stream
                .read(&mut buf[read_total..])
                .map_err(|e| MixerError::DeviceError(format!("read failed: {e}")))?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        let frames_read = read_total / frame_size;
        buf.truncate(frames_read * frame_size);
        self.position += frames_read as u64;
        Ok(frames_read)
    }

    fn read_frames(&mut self, out: &mut [i32], frames: usize, volume: i32) -> Result<usize> {
        let channels = self.format.channels as usize;
        let mut scratch = Vec::new();
        let frames_read = self.read_bytes(&mut scratch, frames)?;
        let n_samples = frames_read * channels;
        if volume < 0 {
            format::read_as_samples(&mut out[..n_samples], &scratch, self.format);
        } else {
            format::mix_as_samples(&mut out[..n_samples], &scratch, self.format, volume);
        }
        Ok(frames_read)
    }
}

/// In-memory PCM. Always rewindable and seekable; may be pre-converted to
/// the mixer format at construction to skip per-callback conversion.
pub struct SampleSource {
    format: AudioFormat,
    data: Arc<Vec<u8>>,
    position: u64,
    priority: i32,
    volume: i32,
    rate: f64,
}

impl SampleSource {
    pub fn new(format: AudioFormat, data: Vec<u8>) -> Self {
        SampleSource {
            format,
            data: Arc::new(data),
            position: 0,
            priority: 0,
            volume: MAX_VOLUME,
            rate: 1.0,
        }
    }

    /// Share the same backing bytes with a new, independent playback
    /// position (the preferred way to play "the same file" on more than
    /// one channel, instead of sharing one `AudioSource`).
    pub fn clone_instance(&self) -> Self {
        SampleSource {
            format: self.format,
            data: Arc::clone(&self.data),
            position: 0,
            priority: self.priority,
            volume: self.volume,
            rate: self.rate,
        }
    }

    /// Pre-convert to `mixer_format` at construction, so channels binding
    /// this source skip the conversion step entirely.
    pub fn new_preconverted(
        source_format: AudioFormat,
        data: Vec<u8>,
        mixer_format: AudioFormat,
    ) -> Result<Self> {
        let cvt = setup_cvt(source_format, mixer_format)?;
        let mut buf = data;
        let len = buf.len();
        let new_len = format::convert(&cvt, &mut buf, len)?;
        buf.truncate(new_len);
        Ok(SampleSource::new(mixer_format, buf))
    }

    fn frame_size(&self) -> usize {
        self.format.frame_size()
    }

    fn total_frames(&self) -> u64 {
        (self.data.len() / self.frame_size().max(1)) as u64
    }
}

impl AudioSource for SampleSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn length_frames(&self) -> Option<u64> {
        Some(self.total_frames())
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    fn volume(&self) -> i32 {
        self.volume
    }

    fn set_volume(&mut self, volume: i32) -> Result<()> {
        validate_volume(volume)?;
        self.volume = volume;
        Ok(())
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn set_rate(&mut self, rate: f64) -> Result<()> {
        validate_rate(rate)?;
        self.rate = rate;
        Ok(())
    }

    fn can_rewind(&self) -> bool {
        true
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, frames: u64) -> Result<()> {
        if frames > self.total_frames() {
            return Err(MixerError::OutOfRange("position beyond source length"));
        }
        self.position = frames;
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut Vec<u8>, frames: usize) -> Result<usize> {
        let frame_size = self.frame_size();
        let remaining = self.total_frames().saturating_sub(self.position) as usize;
        let to_read = frames.min(remaining);
        let start = (self.position as usize) * frame_size;
        let end = start + to_read * frame_size;
        buf.clear();
        buf.extend_from_slice(&self.data[start..end]);
        self.position += to_read as u64;
        Ok(to_read)
    }

    fn read_frames(&mut self, out: &mut [i32], frames: usize, volume: i32) -> Result<usize> {
        let channels = self.format.channels as usize;
        let mut scratch = Vec::new();
        let frames_read = self.read_bytes(&mut scratch, frames)?;
        let n_samples = frames_read * channels;
        if volume < 0 {
            format::read_as_samples(&mut out[..n_samples], &scratch, self.format);
        } else {
            format::mix_as_samples(&mut out[..n_samples], &scratch, self.format, volume);
        }
        Ok(frames_read)
    }
}

/// An opaque decoder: the engine never parses file headers itself, decoders
/// report their format post-open. No concrete implementation
/// (Ogg/Vorbis/WAV/...) ships with this crate.
pub trait Decoder: Send {
    fn format(&self) -> AudioFormat;
    fn length_frames(&self) -> Option<u64>;
    fn can_seek(&self) -> bool;
    fn seek(&mut self, frame: u64) -> Result<()>;
    /// Decode up to `frames` frames of PCM into `buf` (resized as needed).
    /// Returns frames actually produced; 0 at end of stream.
    fn read(&mut self, buf: &mut Vec<u8>, frames: usize) -> Result<usize>;
}

/// Wraps an opaque [`Decoder`] (Ogg/Vorbis, WAV, tracker formats, ...) as
/// an `AudioSource`.
pub struct DecodedSource<D: Decoder> {
    decoder: D,
    position: u64,
    priority: i32,
    volume: i32,
    rate: f64,
}

impl<D: Decoder> DecodedSource<D> {
    pub fn new(decoder: D) -> Self {
        DecodedSource {
            decoder,
            position: 0,
            priority: 0,
            volume: MAX_VOLUME,
            rate: 1.0,
        }
    }
}

impl<D: Decoder + Send> AudioSource for DecodedSource<D> {
    fn format(&self) -> AudioFormat {
        self.decoder.format()
    }

    fn length_frames(&self) -> Option<u64> {
        self.decoder.length_frames()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    fn volume(&self) -> i32 {
        self.volume
    }

    fn set_volume(&mut self, volume: i32) -> Result<()> {
        validate_volume(volume)?;
        self.volume = volume;
        Ok(())
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn set_rate(&mut self, rate: f64) -> Result<()> {
        validate_rate(rate)?;
        self.rate = rate;
        Ok(())
    }

    fn can_rewind(&self) -> bool {
        self.decoder.can_seek()
    }

    fn can_seek(&self) -> bool {
        self.decoder.can_seek()
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, frames: u64) -> Result<()> {
        if !self.decoder.can_seek() {
            return Err(MixerError::UnsupportedOperation(
                "decoder does not support seeking",
            ));
        }
        self.decoder.seek(frames)?;
        self.position = frames;
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.set_position(0)
    }

    fn read_bytes(&mut self, buf: &mut Vec<u8>, frames: usize) -> Result<usize> {
        let n = self.decoder.read(buf, frames)?;
        self.position += n as u64;
        Ok(n)
    }

    fn read_frames(&mut self, out: &mut [i32], frames: usize, volume: i32) -> Result<usize> {
        let fmt = self.decoder.format();
        let channels = fmt.channels as usize;
        let mut scratch = Vec::new();
        let frames_read = self.read_bytes(&mut scratch, frames)?;
        let n_samples = frames_read * channels;
        if volume < 0 {
            format::read_as_samples(&mut out[..n_samples], &scratch, fmt);
        } else {
            format::mix_as_samples(&mut out[..n_samples], &scratch, fmt, volume);
        }
        Ok(frames_read)
    }
}

/// True iff playing `source` with `loops` repeats is legal: a source that
/// cannot be rewound may only be played with `loops == 0`.
pub fn validate_loop_request(
    source: &dyn AudioSource,
    loops: i32,
) -> std::result::Result<(), MixerError> {
    if loops != 0 && !source.can_rewind() {
        return Err(MixerError::InvalidArgument(
            "cannot loop a source that does not support rewinding",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleEncoding;
    use std::io::Cursor;

    fn fmt() -> AudioFormat {
        AudioFormat::pcm(44100, SampleEncoding::S16_LE, 1)
    }

    #[test]
    fn raw_source_reads_and_advances_position() {
        let mut bytes = Vec::new();
        for x in 0i16..10 {
            bytes.extend_from_slice(&x.to_le_bytes());
        }
        let stream = Box::new(Cursor::new(bytes));
        let mut src = RawSource::new(fmt(), stream);
        let mut buf = Vec::new();
        let n = src.read_bytes(&mut buf, 4).unwrap();
        assert_eq!(n, 4);
        assert_eq!(src.position(), 4);
    }

    #[test]
    fn sample_source_clamps_out_of_range_position() {
        let data = vec![0u8; 20];
        let mut src = SampleSource::new(fmt(), data);
        assert!(src.set_position(100).is_err());
        assert!(src.set_position(5).is_ok());
    }

    #[test]
    fn validate_loop_request_rejects_non_rewindable() {
        struct NoRewind;
        impl AudioSource for NoRewind {
            fn format(&self) -> AudioFormat {
                AudioFormat::pcm(44100, SampleEncoding::S16_LE, 1)
            }
            fn length_frames(&self) -> Option<u64> {
                None
            }
            fn priority(&self) -> i32 {
                0
            }
            fn set_priority(&mut self, _: i32) {}
            fn volume(&self) -> i32 {
                MAX_VOLUME
            }
            fn set_volume(&mut self, _: i32) -> Result<()> {
                Ok(())
            }
            fn rate(&self) -> f64 {
                1.0
            }
            fn set_rate(&mut self, _: f64) -> Result<()> {
                Ok(())
            }
            fn can_rewind(&self) -> bool {
                false
            }
            fn can_seek(&self) -> bool {
                false
            }
            fn position(&self) -> u64 {
                0
            }
            fn set_position(&mut self, _: u64) -> Result<()> {
                Err(MixerError::UnsupportedOperation("no seek"))
            }
            fn rewind(&mut self) -> Result<()> {
                Err(MixerError::UnsupportedOperation("no rewind"))
            }
            fn read_bytes(&mut self, _: &mut Vec<u8>, _: usize) -> Result<usize> {
                Ok(0)
            }
            fn read_frames(&mut self, _: &mut [i32], _: usize, _: i32) -> Result<usize> {
                Ok(0)
            }
        }

        let src = NoRewind;
        assert!(validate_loop_request(&src, 2).is_err());
        assert!(validate_loop_request(&src, 0).is_ok());
    }
}
