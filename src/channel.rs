//! Channel: a playing instance bound to one source. Owns the loop
//! counter, timeout, fade state, per-channel volume, playback rate, and
//! per-channel filter chain, and implements the per-callback "produce my
//! contribution" operation.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{MixerError, Result};
use crate::filter::{Filter, FilterChain, run_filters};
use crate::format::{self, AudioFormat, Cvt, MAX_VOLUME, setup_cvt};
use crate::source::{SharedSource, validate_loop_request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeKind {
    None,
    In,
    Out,
}

#[derive(Debug, Clone, Copy)]
struct FadeState {
    kind: FadeKind,
    start_ms: u64,
    duration_ms: u64,
    start_volume: i32,
}

impl Default for FadeState {
    fn default() -> Self {
        FadeState {
            kind: FadeKind::None,
            start_ms: 0,
            duration_ms: 1,
            start_volume: 0,
        }
    }
}

pub type FinishedHandler = Arc<dyn Fn(usize) + Send + Sync>;

/// A playback slot, identified by a stable non-negative index.
pub struct Channel {
    index: usize,
    state: ChannelState,
    source: Option<SharedSource>,
    volume: i32,
    rate: f64,
    loops: i32,
    timeout_ms: i64,
    fade: FadeState,
    position: u64,
    start_time_ms: u64,
    cvt: Option<Cvt>,
    filters: FilterChain,
    on_finished: Vec<FinishedHandler>,

    // Real-time scratch: grown on demand, never shrunk while playing.
    scratch_bytes: Vec<u8>,
    scratch_samples: Vec<i32>,
    filter_scratch: Vec<i32>,
    read_scratch: Vec<u8>,
}

impl Channel {
    pub fn new(index: usize) -> Self {
        Channel {
            index,
            state: ChannelState::Idle,
            source: None,
            volume: MAX_VOLUME,
            rate: 1.0,
            loops: 0,
            timeout_ms: -1,
            fade: FadeState::default(),
            position: 0,
            start_time_ms: 0,
            cvt: None,
            filters: FilterChain::new(),
            on_finished: Vec::new(),
            scratch_bytes: Vec::new(),
            scratch_samples: Vec::new(),
            filter_scratch: Vec::new(),
            read_scratch: Vec::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == ChannelState::Idle
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.start_time_ms)
    }

    pub fn priority(&self) -> i32 {
        self.source
            .as_ref()
            .map(|s| s.lock().priority())
            .unwrap_or(i32::MIN)
    }

    pub fn add_finished_handler(&mut self, handler: FinishedHandler) {
        self.on_finished.push(handler);
    }

    pub fn filters_mut(&mut self) -> &mut FilterChain {
        &mut self.filters
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Advisory: the next mix pass seeks the source here if seekable.
    pub fn set_position(&mut self, frames: u64) {
        self.position = frames;
    }

    pub fn volume(&self) -> i32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: i32) -> Result<()> {
        if !(0..=MAX_VOLUME).contains(&volume) {
            return Err(MixerError::OutOfRange("channel volume must be in 0..=256"));
        }
        self.volume = volume;
        Ok(())
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn set_rate(&mut self, rate: f64) -> Result<()> {
        if rate < 0.0 || !rate.is_finite() {
            return Err(MixerError::OutOfRange("channel rate must be >= 0"));
        }
        self.rate = rate;
        Ok(())
    }

    fn effective_volume(&self) -> i32 {
        match &self.source {
            None => self.volume,
            Some(src) => {
                let sv = src.lock().volume();
                if sv != MAX_VOLUME {
                    (self.volume * sv) >> 8
                } else {
                    self.volume
                }
            }
        }
    }

    fn effective_rate(&self) -> f64 {
        match &self.source {
            None => self.rate,
            Some(src) => src.lock().rate() * self.rate,
        }
    }

    /// Bind `source` to this channel, replacing any prior binding. Returns
    /// `true` if a prior binding was stopped (and so its finished handlers
    /// already fired) as part of this call.
    pub fn bind(
        &mut self,
        source: SharedSource,
        loops: i32,
        fade_in_ms: Option<u64>,
        timeout_ms: i64,
        now_ms: u64,
    ) -> Result<bool> {
        {
            let src = source.lock();
            validate_loop_request(&*src, loops)?;
        }
        let replaced_prior = self.stop();

        self.source = Some(source);
        self.loops = loops;
        self.timeout_ms = timeout_ms;
        self.position = 0;
        self.start_time_ms = now_ms;
        self.state = ChannelState::Playing;
        self.cvt = None;

        self.fade = match fade_in_ms {
            Some(ms) => FadeState {
                kind: FadeKind::In,
                start_ms: now_ms,
                duration_ms: ms.max(1),
                start_volume: 0,
            },
            None => FadeState::default(),
        };

        debug!(channel = self.index, loops, timeout_ms, "channel bound");
        Ok(replaced_prior)
    }

    pub fn pause(&mut self) {
        if self.state == ChannelState::Playing {
            self.state = ChannelState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == ChannelState::Paused {
            self.state = ChannelState::Playing;
        }
    }

    /// Final for the current binding. Fires finished handlers exactly once
    /// per transition into `Idle`. Returns whether a transition happened.
    pub fn stop(&mut self) -> bool {
        if self.state == ChannelState::Idle {
            return false;
        }
        self.finish();
        true
    }

    /// Begin a linear fade from the current effective volume to 0 over
    /// `ms`; the channel stops when the fade completes.
    pub fn fade_out(&mut self, ms: u64, now_ms: u64) {
        if self.state == ChannelState::Idle {
            return;
        }
        let start_volume = self.effective_volume();
        self.fade = FadeState {
            kind: FadeKind::Out,
            start_ms: now_ms,
            duration_ms: ms.max(1),
            start_volume,
        };
    }

    fn finish(&mut self) {
        self.state = ChannelState::Idle;
        self.source = None;
        self.fade = FadeState::default();
        self.cvt = None;
        let idx = self.index;
        for handler in &self.on_finished {
            handler(idx);
        }
    }

    fn snap_rate_format(source_format: AudioFormat, effective_rate: f64) -> AudioFormat {
        if effective_rate == 1.0 {
            return source_format;
        }
        let snapped = ((source_format.frequency as f64 * effective_rate) / 50.0).floor() * 50.0;
        let snapped = snapped.max(0.0) as u32;
        AudioFormat {
            frequency: snapped,
            ..source_format
        }
    }

    fn ensure_cvt(&mut self, snapped_src_format: AudioFormat, mixer_format: AudioFormat) -> Result<Cvt> {
        if let Some(c) = self.cvt {
            if c.src == snapped_src_format && c.dst == mixer_format {
                return Ok(c);
            }
        }
        let c = setup_cvt(snapped_src_format, mixer_format)?;
        self.cvt = Some(c);
        Ok(c)
    }

    /// Produce this channel's contribution into `accumulator` for `frames`
    /// mixer frames. Returns `true` if the channel transitioned to `Idle`
    /// during this call (its finished handlers have already fired).
    pub fn mix(
        &mut self,
        accumulator: &mut [i32],
        frames: usize,
        mixer_format: AudioFormat,
        global_pre_filters: &[Filter],
        now_ms: u64,
    ) -> bool {
        if self.state != ChannelState::Playing {
            return false;
        }
        let Some(source_arc) = self.source.clone() else {
            return false;
        };

        // Timeout check comes before the fade update: an expired channel
        // stops outright rather than fading out.
        if self.timeout_ms >= 0 {
            let age = self.age_ms(now_ms);
            if age as i64 > self.timeout_ms {
                debug!(channel = self.index, age, "channel timed out");
                return self.stop();
            }
        }

        // Snapshot volume, then let an in-progress fade override it.
        let mut effective_volume = self.effective_volume();
        match self.fade.kind {
            FadeKind::None => {}
            FadeKind::In | FadeKind::Out => {
                let elapsed = now_ms.saturating_sub(self.fade.start_ms);
                if elapsed >= self.fade.duration_ms {
                    if self.fade.kind == FadeKind::Out {
                        return self.stop();
                    }
                    self.fade.kind = FadeKind::None;
                } else {
                    let target = match self.fade.kind {
                        FadeKind::In => effective_volume,
                        _ => 0,
                    };
                    let t = elapsed as f64 / self.fade.duration_ms as f64;
                    let interpolated = self.fade.start_volume as f64
                        + (target as f64 - self.fade.start_volume as f64) * t;
                    effective_volume = interpolated.round() as i32;
                }
            }
        }

        // Seek if seekable, guarding against sibling channels sharing the
        // same source and clobbering its position.
        {
            let mut src = source_arc.lock();
            if src.can_seek() {
                let _ = src.set_position(self.position);
            }
        }

        let effective_rate = self.effective_rate();
        let source_format = source_arc.lock().format();
        let snapped_format = Self::snap_rate_format(source_format, effective_rate);
        if snapped_format.frequency == 0 {
            warn!(channel = self.index, "rate snap produced 0 Hz; silent this callback");
            return false;
        }

        let cvt = match self.ensure_cvt(snapped_format, mixer_format) {
            Ok(c) => c,
            Err(e) => {
                warn!(channel = self.index, error = %e, "conversion setup failed, stopping channel");
                return self.stop();
            }
        };

        let channel_filters = self.filters.snapshot();
        let has_filters = !channel_filters.is_empty() || !global_pre_filters.is_empty();

        let end_without_loop = if cvt.src == cvt.dst {
            // Not converting and rate == 1: read straight from the source
            // into the accumulator, via `read_frames`, rather than round
            // tripping through the byte-buffer conversion pipeline.
            let channels = mixer_format.channels.max(1) as usize;
            let wanted_frames = frames.min(accumulator.len() / channels);
            if has_filters {
                let n_samples = wanted_frames * channels;
                self.filter_scratch.clear();
                self.filter_scratch.resize(n_samples, 0);
                let (filled, ended) =
                    Self::read_looping(&source_arc, &mut self.filter_scratch, wanted_frames, channels, -1, &mut self.loops);
                let n = filled * channels;
                run_filters(&channel_filters, &mut self.filter_scratch[..n], frames, mixer_format);
                run_filters(global_pre_filters, &mut self.filter_scratch[..n], frames, mixer_format);
                format::mix(&mut accumulator[..n], &self.filter_scratch[..n], effective_volume);
                ended
            } else {
                let (_, ended) = Self::read_looping(
                    &source_arc,
                    accumulator,
                    wanted_frames,
                    channels,
                    effective_volume,
                    &mut self.loops,
                );
                ended
            }
        } else {
            // How much source data to ask for, in source frames, to fill
            // `frames` mixer frames after conversion.
            let needed_dst_bytes = (frames * mixer_format.frame_size()) as u64;
            let needed_src_bytes = needed_dst_bytes * cvt.div;
            let needed_src_bytes = needed_src_bytes.div_ceil(cvt.mul);
            let src_frame_size = cvt.src.frame_size().max(1) as u64;
            let to_read_frames = needed_src_bytes.div_ceil(src_frame_size) as usize;

            // Read, looping across end-of-stream as needed.
            self.scratch_bytes.clear();
            let mut still_needed = to_read_frames;
            let mut end_without_loop = false;
            let mut just_rewound = false;
            while still_needed > 0 {
                let requested_this_round = still_needed;
                let n = {
                    let mut src = source_arc.lock();
                    src.read_bytes(&mut self.read_scratch, requested_this_round)
                        .unwrap_or(0)
                };
                self.scratch_bytes.extend_from_slice(&self.read_scratch);
                still_needed -= n;

                if n == 0 && just_rewound {
                    // A source that still produces nothing right after a
                    // rewind would otherwise spin this loop forever.
                    end_without_loop = true;
                    break;
                }
                just_rewound = false;

                if n < requested_this_round {
                    if self.loops == 0 {
                        end_without_loop = true;
                        break;
                    }
                    let rewound = {
                        let mut src = source_arc.lock();
                        src.rewind().is_ok()
                    };
                    if !rewound {
                        end_without_loop = true;
                        break;
                    }
                    self.position = 0;
                    if self.loops > 0 {
                        self.loops -= 1;
                    }
                    just_rewound = true;
                }
            }

            // Convert to mixer format.
            let produced_len = self.scratch_bytes.len();
            let converted_len = match format::convert(&cvt, &mut self.scratch_bytes, produced_len) {
                Ok(l) => l,
                Err(e) => {
                    warn!(channel = self.index, error = %e, "format conversion failed, stopping channel");
                    return self.stop();
                }
            };
            format::decode_mixer_samples(&self.scratch_bytes[..converted_len], &mut self.scratch_samples);

            let n_to_mix = self.scratch_samples.len().min(accumulator.len());

            // Per-channel filters, then the caller's global pre-mix filters,
            // both on the post-conversion, pre-volume view.
            if has_filters {
                self.filter_scratch.clear();
                self.filter_scratch.extend_from_slice(&self.scratch_samples[..n_to_mix]);
                run_filters(&channel_filters, &mut self.filter_scratch, frames, mixer_format);
                run_filters(global_pre_filters, &mut self.filter_scratch, frames, mixer_format);
                format::mix(&mut accumulator[..n_to_mix], &self.filter_scratch, effective_volume);
            } else {
                format::mix(&mut accumulator[..n_to_mix], &self.scratch_samples[..n_to_mix], effective_volume);
            }

            end_without_loop
        };

        // Write the advanced position back for the next callback's seek.
        self.position = source_arc.lock().position();

        if end_without_loop {
            debug!(channel = self.index, "end of stream, loops exhausted");
            return self.stop();
        }
        false
    }

    /// Read up to `frames` frames into `out` (channel-interleaved, sized
    /// `frames * channels`) via `AudioSource::read_frames`, rewinding and
    /// re-reading across end-of-stream the same way the byte-buffer path
    /// does. Returns the frame count actually filled and whether the
    /// source ran out without a loop left to consume.
    fn read_looping(
        source: &SharedSource,
        out: &mut [i32],
        frames: usize,
        channels: usize,
        volume: i32,
        loops: &mut i32,
    ) -> (usize, bool) {
        let mut filled = 0usize;
        let mut just_rewound = false;
        while filled < frames {
            let remaining = frames - filled;
            let out_slice = &mut out[filled * channels..(filled + remaining) * channels];
            let n = {
                let mut src = source.lock();
                src.read_frames(out_slice, remaining, volume).unwrap_or(0)
            };
            filled += n;

            if n == 0 && just_rewound {
                return (filled, true);
            }
            just_rewound = false;

            if n < remaining {
                if *loops == 0 {
                    return (filled, true);
                }
                let rewound = {
                    let mut src = source.lock();
                    src.rewind().is_ok()
                };
                if !rewound {
                    return (filled, true);
                }
                if *loops > 0 {
                    *loops -= 1;
                }
                just_rewound = true;
            }
        }
        (filled, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleEncoding;
    use crate::source::{SampleSource, shared};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mixer_fmt() -> AudioFormat {
        AudioFormat::mixer(44100, 1)
    }

    fn tone_source(frames: usize) -> SharedSource {
        let mut data = Vec::new();
        for i in 0..frames {
            let v = if i % 2 == 0 { 10000i16 } else { -10000 };
            data.extend_from_slice(&v.to_le_bytes());
        }
        shared(SampleSource::new(
            AudioFormat::pcm(44100, SampleEncoding::S16_LE, 1),
            data,
        ))
    }

    #[test]
    fn idle_channel_contributes_nothing() {
        let mut ch = Channel::new(0);
        let mut acc = [0i32; 8];
        let finished = ch.mix(&mut acc, 8, mixer_fmt(), &[], 0);
        assert!(!finished);
        assert_eq!(acc, [0i32; 8]);
    }

    #[test]
    fn bind_and_mix_produces_samples() {
        let mut ch = Channel::new(0);
        let src = tone_source(100);
        ch.bind(src, 0, None, -1, 0).unwrap();
        let mut acc = [0i32; 8];
        let finished = ch.mix(&mut acc, 8, mixer_fmt(), &[], 10);
        assert!(!finished);
        assert_ne!(acc, [0i32; 8]);
    }

    #[test]
    fn fade_in_scales_volume_up_over_time() {
        let mut ch = Channel::new(0);
        let src = tone_source(10_000);
        ch.bind(src, -1, Some(500), -1, 0).unwrap();
        let mut acc0 = [0i32; 2];
        ch.mix(&mut acc0, 2, mixer_fmt(), &[], 0);
        assert_eq!(acc0, [0i32; 2], "fade-in starts silent");

        let mut acc_mid = [0i32; 2];
        ch.set_position(0);
        ch.mix(&mut acc_mid, 2, mixer_fmt(), &[], 250);
        assert!(acc_mid[0].abs() > 0);
    }

    #[test]
    fn timeout_stops_channel() {
        let finished_count = Arc::new(AtomicUsize::new(0));
        let fc = Arc::clone(&finished_count);
        let mut ch = Channel::new(0);
        ch.add_finished_handler(Arc::new(move |_| {
            fc.fetch_add(1, Ordering::SeqCst);
        }));
        let src = tone_source(100_000);
        ch.bind(src, -1, None, 100, 0).unwrap();
        let mut acc = [0i32; 4];
        let finished = ch.mix(&mut acc, 4, mixer_fmt(), &[], 200);
        assert!(finished);
        assert_eq!(finished_count.load(Ordering::SeqCst), 1);
        assert_eq!(ch.state(), ChannelState::Idle);
    }

    #[test]
    fn non_rewindable_loop_request_is_rejected() {
        use crate::source::AudioSource;
        struct Once(AudioFormat);
        impl AudioSource for Once {
            fn format(&self) -> AudioFormat {
                self.0
            }
            fn length_frames(&self) -> Option<u64> {
                Some(10)
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

        let mut ch = Channel::new(0);
        let src = crate::source::shared(Once(AudioFormat::pcm(
            44100,
            SampleEncoding::S16_LE,
            1,
        )));
        let err = ch.bind(src, 2, None, -1, 0).unwrap_err();
        assert!(matches!(err, MixerError::InvalidArgument(_)));
    }
}
