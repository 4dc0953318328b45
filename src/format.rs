//! PCM format description and the conversion/mixing primitives.
//!
//! Mixing always happens in a 32-bit signed accumulator. Narrow PCM formats
//! (8/16-bit) are widened to that space for summing and narrowed back with
//! saturation when handed to a device or compared in tests.

use crate::error::{MixerError, Result};

/// Unity volume.
pub const MAX_VOLUME: i32 = 256;

/// `Channel`/`Mixer` sentinel meaning "infinite" (no timeout, no loop limit).
pub const INFINITE: i32 = -1;

/// `target` sentinel for `play`/`fade_in` meaning "any free channel".
pub const FREE_CHANNEL: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub const fn host() -> Self {
        #[cfg(target_endian = "little")]
        {
            Endian::Little
        }
        #[cfg(target_endian = "big")]
        {
            Endian::Big
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signedness {
    Signed,
    Unsigned,
}

/// Bit depth + signedness + byte order of one PCM sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleEncoding {
    pub bits: u8,
    pub signedness: Signedness,
    pub endian: Endian,
}

impl SampleEncoding {
    pub const fn new(bits: u8, signedness: Signedness, endian: Endian) -> Self {
        SampleEncoding {
            bits,
            signedness,
            endian,
        }
    }

    pub const S8: SampleEncoding = SampleEncoding::new(8, Signedness::Signed, Endian::Little);
    pub const U8: SampleEncoding = SampleEncoding::new(8, Signedness::Unsigned, Endian::Little);
    pub const S16_LE: SampleEncoding = SampleEncoding::new(16, Signedness::Signed, Endian::Little);
    pub const S16_BE: SampleEncoding = SampleEncoding::new(16, Signedness::Signed, Endian::Big);
    pub const U16_LE: SampleEncoding =
        SampleEncoding::new(16, Signedness::Unsigned, Endian::Little);
    pub const U16_BE: SampleEncoding = SampleEncoding::new(16, Signedness::Unsigned, Endian::Big);

    pub const fn sample_size(&self) -> usize {
        (self.bits / 8) as usize
    }
}

/// The format a stream is carried in: either real PCM, or the engine's
/// 32-bit signed summing representation ("mixer format").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    Pcm(SampleEncoding),
    Mixer,
}

/// `(frequency, sample encoding, channel count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub frequency: u32,
    pub format: SampleFormat,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn pcm(frequency: u32, encoding: SampleEncoding, channels: u16) -> Self {
        AudioFormat {
            frequency,
            format: SampleFormat::Pcm(encoding),
            channels,
        }
    }

    pub const fn mixer(frequency: u32, channels: u16) -> Self {
        AudioFormat {
            frequency,
            format: SampleFormat::Mixer,
            channels,
        }
    }

    pub fn is_mixer_format(&self) -> bool {
        matches!(self.format, SampleFormat::Mixer)
    }

    /// Size in bytes of one sample (one channel, one frame).
    pub fn sample_size(&self) -> usize {
        match self.format {
            SampleFormat::Mixer => 4,
            SampleFormat::Pcm(enc) => enc.sample_size(),
        }
    }

    /// Size in bytes of one frame (all channels).
    pub fn frame_size(&self) -> usize {
        self.sample_size() * self.channels as usize
    }

    pub fn byte_rate(&self) -> u64 {
        self.frame_size() as u64 * self.frequency as u64
    }
}

/// `dest[i] := saturating_add(dest[i], (src[i] * volume) >> 8)`.
///
/// `volume` is `[0, 256]`; `256` is unity. `dest` and `src` must be the same
/// length (one entry per sample, already interleaved across channels).
pub fn mix(dest: &mut [i32], src: &[i32], volume: i32) {
    debug_assert_eq!(dest.len(), src.len());
    for (d, &s) in dest.iter_mut().zip(src) {
        let scaled = (s as i64 * volume as i64) >> 8;
        *d = (*d as i64 + scaled).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    }
}

/// Overwrite (not accumulate).
pub fn copy(dest: &mut [i32], src: &[i32]) {
    dest.copy_from_slice(src);
}

/// Widen a raw, zero-centered sample at its native bit depth into the
/// 32-bit accumulator's scale (nominally 16-bit-equivalent headroom).
fn widen(raw: i32, enc: SampleEncoding) -> i32 {
    raw << (16 - enc.bits as i32)
}

/// Inverse of [`widen`], clamping to the representable 16-bit-equivalent
/// range before narrowing to `enc`'s bit depth.
fn narrow_saturating(v: i32, enc: SampleEncoding) -> i32 {
    let clamped = v.clamp(i16::MIN as i32, i16::MAX as i32);
    clamped >> (16 - enc.bits as i32)
}

fn extract_raw(bytes: &[u8], enc: SampleEncoding) -> i32 {
    match enc.bits {
        8 => {
            let b = bytes[0];
            match enc.signedness {
                Signedness::Signed => b as i8 as i32,
                Signedness::Unsigned => b as i32 - 128,
            }
        }
        16 => {
            let u = match enc.endian {
                Endian::Little => u16::from_le_bytes([bytes[0], bytes[1]]),
                Endian::Big => u16::from_be_bytes([bytes[0], bytes[1]]),
            };
            match enc.signedness {
                Signedness::Signed => u as i16 as i32,
                Signedness::Unsigned => u as i32 - 32768,
            }
        }
        other => unreachable!("unsupported bit depth {other}"),
    }
}

fn pack_raw(v: i32, enc: SampleEncoding, out: &mut [u8]) {
    match enc.bits {
        8 => {
            let b: u8 = match enc.signedness {
                Signedness::Signed => v.clamp(-128, 127) as i8 as u8,
                Signedness::Unsigned => (v.clamp(-128, 127) + 128) as u8,
            };
            out[0] = b;
        }
        16 => {
            let clamped = v.clamp(-32768, 32767);
            let u: u16 = match enc.signedness {
                Signedness::Signed => clamped as i16 as u16,
                Signedness::Unsigned => (clamped + 32768) as u16,
            };
            let bytes = match enc.endian {
                Endian::Little => u.to_le_bytes(),
                Endian::Big => u.to_be_bytes(),
            };
            out[..2].copy_from_slice(&bytes);
        }
        other => unreachable!("unsupported bit depth {other}"),
    }
}

/// Write raw samples of `enc`, widened but not scaled, overwriting `dest`
/// (the `volume < 0` path of `AudioSource::read_frames`).
pub(crate) fn widen_samples(dest: &mut [i32], src: &[u8], enc: SampleEncoding) {
    let sample_size = enc.sample_size();
    for (i, d) in dest.iter_mut().enumerate() {
        let off = i * sample_size;
        *d = widen(extract_raw(&src[off..off + sample_size], enc), enc);
    }
}

/// Overwrite `dest` with samples from `src` in `fmt`, dispatching on
/// whether `fmt` is real PCM or the engine's own mixer representation
/// (the latter applies when a source was pre-converted at construction).
pub(crate) fn read_as_samples(dest: &mut [i32], src: &[u8], fmt: AudioFormat) {
    match fmt.format {
        SampleFormat::Mixer => {
            for (i, d) in dest.iter_mut().enumerate() {
                let off = i * 4;
                *d = i32::from_ne_bytes([src[off], src[off + 1], src[off + 2], src[off + 3]]);
            }
        }
        SampleFormat::Pcm(enc) => widen_samples(dest, src, enc),
    }
}

/// Saturating-mix samples from `src` in `fmt`, scaled by `volume`, into
/// `dest` (the `volume >= 0` fast path of `AudioSource::read_frames`).
pub(crate) fn mix_as_samples(dest: &mut [i32], src: &[u8], fmt: AudioFormat, volume: i32) {
    match fmt.format {
        SampleFormat::Mixer => {
            for (i, d) in dest.iter_mut().enumerate() {
                let off = i * 4;
                let raw =
                    i32::from_ne_bytes([src[off], src[off + 1], src[off + 2], src[off + 3]]);
                let scaled = (raw as i64 * volume as i64) >> 8;
                *d = (*d as i64 + scaled).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
            }
        }
        SampleFormat::Pcm(enc) => convert_mix(dest, src, enc, volume),
    }
}

/// Read `dest.len()` raw samples of `src_format` out of `src`, widen and
/// scale by `volume`, and saturating-add into `dest`.
pub fn convert_mix(dest: &mut [i32], src: &[u8], src_format: SampleEncoding, volume: i32) {
    let sample_size = src_format.sample_size();
    debug_assert!(src.len() >= dest.len() * sample_size);
    for (i, d) in dest.iter_mut().enumerate() {
        let off = i * sample_size;
        let raw = extract_raw(&src[off..off + sample_size], src_format);
        let widened = widen(raw, src_format);
        let scaled = (widened as i64 * volume as i64) >> 8;
        *d = (*d as i64 + scaled).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    }
}

/// Inverse of [`convert_mix`]: read 32-bit accumulator samples and write
/// them as `dest_format` samples, with saturation and the signed/unsigned
/// zero-point offset applied.
pub fn convert_acc(dest: &mut [u8], src: &[i32], dest_format: SampleEncoding) {
    let sample_size = dest_format.sample_size();
    debug_assert!(dest.len() >= src.len() * sample_size);
    for (i, &s) in src.iter().enumerate() {
        let narrowed = narrow_saturating(s, dest_format);
        let off = i * sample_size;
        pack_raw(narrowed, dest_format, &mut dest[off..off + sample_size]);
    }
}

/// Decode a byte buffer already in mixer format (native-endian i32 per
/// sample) into an owned sample vector.
pub(crate) fn decode_mixer_samples(bytes: &[u8], out: &mut Vec<i32>) {
    out.clear();
    out.extend(
        bytes
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
    );
}

/// Length-multiplier/divisor descriptor for reformatting/resampling a
/// stream from `src` to `dst`: `output_bytes = input_bytes * mul / div`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cvt {
    pub src: AudioFormat,
    pub dst: AudioFormat,
    pub mul: u64,
    pub div: u64,
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a.max(1)
    } else {
        gcd(b, a % b)
    }
}

/// Build a resampling/reformatting descriptor. Converting between two
/// distinct `MixerFormat` values is not supported (fails fast).
pub fn setup_cvt(src: AudioFormat, dst: AudioFormat) -> Result<Cvt> {
    if src == dst {
        return Ok(Cvt {
            src,
            dst,
            mul: 1,
            div: 1,
        });
    }
    if src.is_mixer_format() && dst.is_mixer_format() {
        return Err(MixerError::UnsupportedOperation(
            "cannot convert between two distinct mixer-format representations",
        ));
    }
    let mul = dst.frame_size() as u64 * dst.frequency as u64;
    let div = src.frame_size() as u64 * src.frequency as u64;
    let g = gcd(mul, div);
    Ok(Cvt {
        src,
        dst,
        mul: mul / g,
        div: div / g,
    })
}

fn channels_of(fmt: AudioFormat) -> usize {
    fmt.channels as usize
}

/// Adjust an interleaved-by-channel frame from `src_channels` to
/// `dst_channels`: duplicate for upmix, average for downmix. Mirrors the
/// downmix logic of a single-source-channel capture loop, generalized to
/// arbitrary channel counts in both directions.
fn adjust_channels(frame: &[i32], src_channels: usize, dst_channels: usize) -> Vec<i32> {
    if src_channels == dst_channels {
        return frame.to_vec();
    }
    if dst_channels == 1 {
        let sum: i64 = frame.iter().map(|&s| s as i64).sum();
        let avg = (sum / src_channels.max(1) as i64) as i32;
        return vec![avg];
    }
    if src_channels == 1 {
        return vec![frame[0]; dst_channels];
    }
    if dst_channels < src_channels {
        // Downmix: split source channels roughly in half, averaging each
        // half into one destination channel, and so on.
        let mut out = vec![0i64; dst_channels];
        let mut counts = vec![0i64; dst_channels];
        for (ch, &s) in frame.iter().enumerate() {
            let bucket = ch * dst_channels / src_channels;
            out[bucket] += s as i64;
            counts[bucket] += 1;
        }
        out.iter()
            .zip(counts.iter())
            .map(|(&acc, &n)| (acc / n.max(1)) as i32)
            .collect()
    } else {
        // Upmix: duplicate source channels round-robin across extra slots.
        (0..dst_channels)
            .map(|ch| frame[ch % src_channels])
            .collect()
    }
}

/// Decode `buf[..len]` as a flat, channel-interleaved sequence of
/// canonical widened-i32 samples in `fmt`.
fn decode_frames(buf: &[u8], len: usize, fmt: AudioFormat) -> Vec<i32> {
    match fmt.format {
        SampleFormat::Mixer => buf[..len]
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        SampleFormat::Pcm(enc) => {
            let sample_size = enc.sample_size();
            buf[..len]
                .chunks_exact(sample_size)
                .map(|c| widen(extract_raw(c, enc), enc))
                .collect()
        }
    }
}

/// Encode canonical widened-i32 frames into `fmt`, appending to `out`.
fn encode_frames(samples: &[i32], fmt: AudioFormat, out: &mut Vec<u8>) {
    match fmt.format {
        SampleFormat::Mixer => {
            for &s in samples {
                out.extend_from_slice(&s.to_ne_bytes());
            }
        }
        SampleFormat::Pcm(enc) => {
            let sample_size = enc.sample_size();
            let mut tmp = [0u8; 2];
            for &s in samples {
                pack_raw(narrow_saturating(s, enc), enc, &mut tmp[..sample_size]);
                out.extend_from_slice(&tmp[..sample_size]);
            }
        }
    }
}

/// Rewrite `buf[0..len)` in place (growing the buffer if required) from
/// `cvt.src` into `cvt.dst`: channel-count adjustment, then rate
/// conversion (linear interpolation), then sample-format conversion.
/// Returns the new length in bytes.
pub fn convert(cvt: &Cvt, buf: &mut Vec<u8>, len: usize) -> Result<usize> {
    if cvt.src == cvt.dst {
        buf.truncate(len);
        return Ok(len);
    }

    let src_channels = channels_of(cvt.src).max(1);
    let dst_channels = channels_of(cvt.dst).max(1);
    let src_frame_bytes = cvt.src.frame_size();
    if src_frame_bytes == 0 || len % src_frame_bytes != 0 {
        return Err(MixerError::InvalidArgument(
            "buffer length is not a whole number of source frames",
        ));
    }
    let n_src_frames = len / src_frame_bytes;

    let flat = decode_frames(buf, len, cvt.src);
    let src_frames: Vec<&[i32]> = flat.chunks(src_channels).take(n_src_frames).collect();

    let channel_adjusted: Vec<Vec<i32>> = src_frames
        .iter()
        .map(|f| adjust_channels(f, src_channels, dst_channels))
        .collect();

    let resampled = if cvt.src.frequency == cvt.dst.frequency || channel_adjusted.is_empty() {
        channel_adjusted
    } else if cvt.dst.frequency == 0 {
        Vec::new()
    } else {
        let ratio = cvt.src.frequency as f64 / cvt.dst.frequency as f64;
        let n_out = ((channel_adjusted.len() as f64) / ratio).floor() as usize;
        let mut out = Vec::with_capacity(n_out);
        for i in 0..n_out {
            let src_pos = i as f64 * ratio;
            let idx = src_pos.floor() as usize;
            let frac = src_pos - idx as f64;
            let a = &channel_adjusted[idx.min(channel_adjusted.len() - 1)];
            let b = &channel_adjusted[(idx + 1).min(channel_adjusted.len() - 1)];
            let frame: Vec<i32> = a
                .iter()
                .zip(b.iter())
                .map(|(&x, &y)| (x as f64 + (y as f64 - x as f64) * frac).round() as i32)
                .collect();
            out.push(frame);
        }
        out
    };

    let mut flat_out = Vec::with_capacity(resampled.len() * dst_channels);
    for frame in &resampled {
        flat_out.extend_from_slice(frame);
    }

    buf.clear();
    encode_frames(&flat_out, cvt.dst, buf);
    Ok(buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_saturates_and_scales() {
        let mut dest = [0i32; 3];
        let src = [i32::MAX, -1000, 500];
        mix(&mut dest, &src, MAX_VOLUME);
        assert_eq!(dest, [i32::MAX, -1000, 500]);

        let mut dest2 = [100i32];
        mix(&mut dest2, &[256], 128);
        assert_eq!(dest2[0], 228); // 100 + (256*128>>8) = 100 + 128
    }

    #[test]
    fn mix_saturates_at_bounds() {
        let mut dest = [i32::MAX - 10];
        mix(&mut dest, &[1000], MAX_VOLUME);
        assert_eq!(dest[0], i32::MAX);
        let mut dest = [i32::MIN + 10];
        mix(&mut dest, &[-1000], MAX_VOLUME);
        assert_eq!(dest[0], i32::MIN);
    }

    #[test]
    fn convert_mix_then_acc_round_trips_s16() {
        for x in [-32768i16, -1, 0, 1, 12345, 32767] {
            let bytes = x.to_le_bytes();
            let mut acc = [0i32; 1];
            convert_mix(&mut acc, &bytes, SampleEncoding::S16_LE, MAX_VOLUME);
            let mut out = [0u8; 2];
            convert_acc(&mut out, &acc, SampleEncoding::S16_LE);
            assert_eq!(i16::from_le_bytes(out), x);
        }
    }

    #[test]
    fn convert_mix_then_acc_round_trips_u8() {
        for x in [0u8, 1, 127, 128, 255] {
            let mut acc = [0i32; 1];
            convert_mix(&mut acc, &[x], SampleEncoding::U8, MAX_VOLUME);
            let mut out = [0u8; 1];
            convert_acc(&mut out, &acc, SampleEncoding::U8);
            assert_eq!(out[0], x);
        }
    }

    #[test]
    fn setup_cvt_identity_is_one_to_one() {
        let fmt = AudioFormat::pcm(44100, SampleEncoding::S16_LE, 2);
        let cvt = setup_cvt(fmt, fmt).unwrap();
        assert_eq!((cvt.mul, cvt.div), (1, 1));
    }

    #[test]
    fn setup_cvt_rejects_mixer_to_mixer() {
        let a = AudioFormat::mixer(44100, 2);
        let b = AudioFormat::mixer(48000, 2);
        assert!(matches!(
            setup_cvt(a, b),
            Err(MixerError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn convert_same_rate_reformat_preserves_frame_count() {
        let src_fmt = AudioFormat::pcm(44100, SampleEncoding::S16_LE, 1);
        let dst_fmt = AudioFormat::mixer(44100, 1);
        let cvt = setup_cvt(src_fmt, dst_fmt).unwrap();
        let mut buf = Vec::new();
        for x in [100i16, -100, 200, -200] {
            buf.extend_from_slice(&x.to_le_bytes());
        }
        let len = buf.len();
        let new_len = convert(&cvt, &mut buf, len).unwrap();
        assert_eq!(new_len, 4 * 4);
    }
}
