//! Whole-engine scenarios covering fade arithmetic, eviction policy, loop
//! rejection, and reserved-channel admission, driven by a `TestClock` so
//! fade/timeout/rate-snap arithmetic is deterministic instead of depending
//! on wall-clock sleeps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use audiomix::device::{AudioDevice, DeviceCallback};
use audiomix::{
    AudioFormat, Engine, MixerError, PlayPolicy, SampleEncoding, SampleSource, TestClock,
    FREE_CHANNEL,
};

/// Synchronous stand-in for a real device: `open` just records the
/// requested format, `pump` is called directly by the test instead of by
/// a hardware thread.
struct StubDevice {
    negotiated: AudioFormat,
    callback: Arc<Mutex<Option<DeviceCallback>>>,
}

impl StubDevice {
    fn new(negotiated: AudioFormat) -> (Self, Arc<Mutex<Option<DeviceCallback>>>) {
        let callback = Arc::new(Mutex::new(None));
        (
            StubDevice {
                negotiated,
                callback: Arc::clone(&callback),
            },
            callback,
        )
    }
}

impl AudioDevice for StubDevice {
    fn open(&mut self, _requested: AudioFormat, _buffer_ms: u32) -> audiomix::Result<AudioFormat> {
        Ok(self.negotiated)
    }
    fn set_callback(&mut self, callback: DeviceCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }
    fn pause(&mut self) -> audiomix::Result<()> {
        Ok(())
    }
    fn unpause(&mut self) -> audiomix::Result<()> {
        Ok(())
    }
    fn close(&mut self) -> audiomix::Result<()> {
        *self.callback.lock().unwrap() = None;
        Ok(())
    }
}

fn pump(callback_slot: &Arc<Mutex<Option<DeviceCallback>>>, acc: &mut [i32], frames: usize) {
    let mut slot = callback_slot.lock().unwrap();
    if let Some(cb) = slot.as_mut() {
        cb(acc, frames);
    }
}

fn square_wave(frames: usize, freq: u32, amplitude: i16) -> SampleSource {
    let half_period = (freq / 440).max(1) as usize;
    let mut data = Vec::with_capacity(frames * 2);
    for i in 0..frames {
        let v = if (i / half_period) % 2 == 0 { amplitude } else { -amplitude };
        data.extend_from_slice(&v.to_le_bytes());
    }
    SampleSource::new(AudioFormat::pcm(freq, SampleEncoding::S16_LE, 1), data)
}

fn setup(mixer_freq: u32, channels: u16, n_channels: usize) -> (Engine, Arc<TestClock>, Arc<Mutex<Option<DeviceCallback>>>) {
    let clock = Arc::new(TestClock::new());
    let engine = Engine::new(clock.clone());
    let (device, callback_slot) = StubDevice::new(AudioFormat::mixer(mixer_freq, channels));
    engine
        .initialize(Box::new(device), AudioFormat::mixer(mixer_freq, channels), 20)
        .unwrap();
    engine.allocate_channels(n_channels).unwrap();
    (engine, clock, callback_slot)
}

/// Fade-in then fade-out: silent at t=0, rising toward the fade midpoint,
/// full peak once the fade completes; fade_out later drives the channel to
/// Idle and fires the finished callback exactly once.
#[test]
fn fade_in_then_fade_out() {
    let (engine, clock, cb) = setup(22050, 2, 2);
    let tone = square_wave(22050, 440, i16::MAX);
    let source = audiomix::source::shared(tone);

    let finished_count = Arc::new(AtomicUsize::new(0));
    let fc = Arc::clone(&finished_count);
    engine.on_channel_finished(Arc::new(move |_| {
        fc.fetch_add(1, Ordering::SeqCst);
    }));

    let idx = engine.fade_in(source, 500, 0, -1, FREE_CHANNEL).unwrap();

    let frames_per_block = 220; // 10ms blocks
    let mut acc = vec![0i32; frames_per_block * 2];

    // t=0: silent.
    pump(&cb, &mut acc, frames_per_block);
    assert!(acc.iter().all(|&s| s == 0), "should be silent at t=0");

    // Advance to t=250ms (fade midpoint).
    clock.advance(250);
    acc.fill(0);
    pump(&cb, &mut acc, frames_per_block);
    let peak_mid = acc.iter().map(|&s| s.unsigned_abs()).max().unwrap();
    assert!(peak_mid > 0, "should have nonzero output at fade midpoint");

    // Advance to t=500ms+ (fade-in complete): peak should be larger than
    // at the midpoint.
    clock.advance(300);
    acc.fill(0);
    pump(&cb, &mut acc, frames_per_block);
    let peak_full = acc.iter().map(|&s| s.unsigned_abs()).max().unwrap();
    assert!(peak_full >= peak_mid);

    // Jump to t=1000ms and begin fade_out over 500ms.
    clock.advance(450);
    engine.fade_out_channel(idx, 500).unwrap();

    // t=1500ms: fade-out has completed, channel should be Idle and the
    // finished callback should have fired exactly once.
    clock.advance(500);
    acc.fill(0);
    pump(&cb, &mut acc, frames_per_block);
    assert_eq!(
        engine.channel_state(idx).unwrap(),
        audiomix::ChannelState::Idle
    );
    assert_eq!(finished_count.load(Ordering::SeqCst), 1);
}

/// Oldest eviction: A played first lands on ch0, B on ch1; with both
/// busy, C evicts the older of the two (A), landing on ch0, and A's
/// finished handler fires before C is admitted.
#[test]
fn oldest_eviction_picks_the_older_channel() {
    let (engine, clock, _cb) = setup(22050, 1, 2);
    engine.set_play_policy(PlayPolicy::Oldest);

    let a = engine
        .play(audiomix::source::shared(square_wave(100_000, 440, 1000)), -1, -1, FREE_CHANNEL)
        .unwrap();
    clock.advance(100);
    let b = engine
        .play(audiomix::source::shared(square_wave(100_000, 440, 1000)), -1, -1, FREE_CHANNEL)
        .unwrap();
    assert_eq!((a, b), (0, 1));

    let evicted = Arc::new(AtomicUsize::new(usize::MAX));
    let ev = Arc::clone(&evicted);
    engine.on_channel_finished(Arc::new(move |idx| {
        ev.store(idx, Ordering::SeqCst);
    }));

    clock.advance(100);
    let c = engine
        .play(audiomix::source::shared(square_wave(100_000, 440, 1000)), -1, -1, FREE_CHANNEL)
        .unwrap();
    assert_eq!(c, 0, "C should evict the older channel A (ch0)");
    assert_eq!(evicted.load(Ordering::SeqCst), 0);
}

/// `OldestPriority`: among the busy channels, the minimum-priority group is
/// {ch1, ch2} (priority 3); within that, ch2 is older, so it is the one
/// evicted.
#[test]
fn oldest_priority_breaks_ties_by_age() {
    use audiomix::AudioSource;

    let (engine, clock, _cb) = setup(22050, 1, 3);
    engine.set_play_policy(PlayPolicy::OldestPriority);

    let mk = |priority: i32| {
        let mut src = square_wave(100_000, 440, 1000);
        src.set_priority(priority);
        audiomix::source::shared(src)
    };

    // ch0 bound at t=1000 (age 1000 by the time we compare at t=2000)
    // ch1 bound at t=1500 (age 500)
    // ch2 bound at t=0    (age 2000)
    engine.play(mk(3), -1, -1, 2).unwrap(); // ch2 at t=0
    clock.advance(1000);
    engine.play(mk(5), -1, -1, 0).unwrap(); // ch0 at t=1000
    clock.advance(500);
    engine.play(mk(3), -1, -1, 1).unwrap(); // ch1 at t=1500
    clock.advance(500); // now t=2000: ages are ch0=1000, ch1=500, ch2=2000

    let d = engine.play(mk(9), -1, -1, FREE_CHANNEL).unwrap();
    assert_eq!(d, 2, "min priority is 3 (ch1,ch2); oldest of those is ch2");
}

/// A non-rewindable source requested to loop fails with `InvalidArgument`.
#[test]
fn loop_on_non_rewindable_source_rejected() {
    use audiomix::AudioSource;

    struct OneShot(AudioFormat);
    impl AudioSource for OneShot {
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
            256
        }
        fn set_volume(&mut self, _: i32) -> audiomix::Result<()> {
            Ok(())
        }
        fn rate(&self) -> f64 {
            1.0
        }
        fn set_rate(&mut self, _: f64) -> audiomix::Result<()> {
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
        fn set_position(&mut self, _: u64) -> audiomix::Result<()> {
            Err(MixerError::UnsupportedOperation("no seek"))
        }
        fn rewind(&mut self) -> audiomix::Result<()> {
            Err(MixerError::UnsupportedOperation("no rewind"))
        }
        fn read_bytes(&mut self, _: &mut Vec<u8>, _: usize) -> audiomix::Result<usize> {
            Ok(0)
        }
        fn read_frames(&mut self, _: &mut [i32], _: usize, _: i32) -> audiomix::Result<usize> {
            Ok(0)
        }
    }

    let (engine, _clock, _cb) = setup(22050, 1, 1);
    let source = audiomix::source::shared(OneShot(AudioFormat::pcm(
        22050,
        SampleEncoding::S16_LE,
        1,
    )));
    let err = engine.play(source, 2, -1, FREE_CHANNEL).unwrap_err();
    assert!(matches!(err, MixerError::InvalidArgument(_)));
}

/// Reserved channels are skipped by `FreeChannel` admission but an
/// explicit channel target still succeeds on a reserved slot.
#[test]
fn reserved_channels_skipped_by_free_channel() {
    let (engine, _clock, _cb) = setup(44100, 1, 4);
    engine.set_reserved_channels(2).unwrap();

    for _ in 0..4 {
        let idx = engine
            .play(audiomix::source::shared(square_wave(1000, 440, 1000)), 0, -1, FREE_CHANNEL)
            .unwrap();
        assert!(idx == 2 || idx == 3, "got {idx}, reserved channels must be skipped");
        engine.stop_channel(idx).unwrap();
    }

    let explicit = engine
        .play(audiomix::source::shared(square_wave(1000, 440, 1000)), 0, -1, 0)
        .unwrap();
    assert_eq!(explicit, 0, "explicit targeting ignores reservation");
}

/// Rate snap: a channel playing a 44100 Hz mono source at `rate = 1.001`
/// against a 44100 Hz mixer snaps its effective source frequency to
/// `floor(44100 * 1.001 / 50) * 50 = 44150`. Mixing 4410 mixer frames must
/// consume `round(4410 * 44150 / 44100) = 4415` source frames.
#[test]
fn rate_snap_consumes_the_snapped_frame_count() {
    let (engine, _clock, cb) = setup(44100, 1, 1);
    let source = audiomix::source::shared(square_wave(100_000, 440, 1000));
    let idx = engine.play(source, -1, -1, FREE_CHANNEL).unwrap();
    engine.set_channel_rate(idx, 1.001).unwrap();

    let mut acc = vec![0i32; 4410];
    pump(&cb, &mut acc, 4410);

    assert_eq!(engine.channel_position(idx).unwrap(), 4415);
}

/// After `stop` returns, subsequent callbacks contribute no samples from
/// that channel until a new `start_playing`.
#[test]
fn stop_is_final_for_subsequent_callbacks() {
    let (engine, _clock, cb) = setup(22050, 1, 1);
    let idx = engine
        .play(audiomix::source::shared(square_wave(100_000, 440, i16::MAX)), -1, -1, FREE_CHANNEL)
        .unwrap();

    let mut acc = vec![0i32; 220];
    pump(&cb, &mut acc, 220);
    assert!(acc.iter().any(|&s| s != 0));

    engine.stop_channel(idx).unwrap();
    acc.fill(0);
    pump(&cb, &mut acc, 220);
    assert!(acc.iter().all(|&s| s == 0), "stopped channel must stay silent");
}
