//! A harness a developer reaches for to sanity-check the mixer without a
//! real sound card. A `NullDevice` drives the callback synchronously in a
//! loop over synthetic tone sources, printing a level meter per block. Not
//! a production CLI (no real file decoders, no real platform backend).

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;

use audiomix::device::{AudioDevice, DeviceCallback};
use audiomix::{AudioFormat, Engine, SampleEncoding, SampleSource, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "audiomix-demo")]
#[command(about = "Play synthetic tones through the audiomix engine and print a level meter.")]
struct Cli {
    /// Mixer frequency in Hz.
    #[arg(long, default_value_t = 44100)]
    freq: u32,

    /// Mixer channel count (1 = mono, 2 = stereo).
    #[arg(long, default_value_t = 2)]
    mixer_channels: u16,

    /// Number of playback channels to allocate.
    #[arg(short, long, default_value_t = 4)]
    channels: usize,

    /// How many 20ms blocks to pump through the callback.
    #[arg(short, long, default_value_t = 100)]
    blocks: u32,

    /// Fade the demo tone in over this many milliseconds.
    #[arg(long, default_value_t = 500)]
    fade_in_ms: u64,
}

/// Calls the installed callback synchronously, as if a device delivered a
/// block every `buffer_ms` milliseconds. No real hardware involved. The
/// `Arc<Mutex<_>>` lets the demo keep a handle to pump blocks after
/// ownership of the `Box<dyn AudioDevice>` moves into the engine.
#[derive(Clone)]
struct NullDevice(Arc<Mutex<NullDeviceInner>>);

struct NullDeviceInner {
    negotiated: AudioFormat,
    callback: Option<DeviceCallback>,
}

impl NullDevice {
    fn new(negotiated: AudioFormat) -> Self {
        NullDevice(Arc::new(Mutex::new(NullDeviceInner {
            negotiated,
            callback: None,
        })))
    }

    fn pump(&self, accumulator: &mut [i32], frames: usize) {
        let mut inner = self.0.lock().unwrap();
        if let Some(cb) = inner.callback.as_mut() {
            cb(accumulator, frames);
        }
    }
}

impl AudioDevice for NullDevice {
    fn open(&mut self, _requested: AudioFormat, _buffer_ms: u32) -> audiomix::Result<AudioFormat> {
        Ok(self.0.lock().unwrap().negotiated)
    }

    fn set_callback(&mut self, callback: DeviceCallback) {
        self.0.lock().unwrap().callback = Some(callback);
    }

    fn pause(&mut self) -> audiomix::Result<()> {
        Ok(())
    }

    fn unpause(&mut self) -> audiomix::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> audiomix::Result<()> {
        self.0.lock().unwrap().callback = None;
        Ok(())
    }
}

/// A square wave at `tone_hz`, encoded at `sample_rate`, long enough to
/// outlast the demo.
fn square_wave_tone(sample_rate: u32, tone_hz: u32, seconds: u32) -> SampleSource {
    let total_frames = (sample_rate as u64 * seconds as u64) as usize;
    let half_period = (sample_rate / tone_hz.max(1)).max(1) as usize;
    let mut data = Vec::with_capacity(total_frames * 2);
    for i in 0..total_frames {
        let v: i16 = if (i / half_period) % 2 == 0 { 12000 } else { -12000 };
        data.extend_from_slice(&v.to_le_bytes());
    }
    SampleSource::new(AudioFormat::pcm(sample_rate, SampleEncoding::S16_LE, 1), data)
}

fn level_meter(block: &[i32]) -> String {
    let peak = block.iter().map(|&s| s.unsigned_abs()).max().unwrap_or(0);
    let bars = (peak as f64 / i32::MAX as f64 * 40.0).round() as usize;
    format!("[{:<40}]", "#".repeat(bars.min(40)))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let clock = Arc::new(SystemClock::new());
    let engine = Engine::new(clock);

    let mixer_format = AudioFormat::mixer(cli.freq, cli.mixer_channels);
    let device = NullDevice::new(mixer_format);
    let device_handle = device.clone();
    let exact = engine
        .initialize(Box::new(device), mixer_format, 20)
        .context("engine.initialize failed")?;
    println!("negotiated exactly as requested: {exact}");

    engine
        .allocate_channels(cli.channels)
        .context("allocate_channels failed")?;

    let tone = square_wave_tone(cli.freq, 440, 5);
    let source = audiomix::source::shared(tone);

    let idx = if cli.fade_in_ms > 0 {
        engine
            .fade_in(source, cli.fade_in_ms, -1, -1, audiomix::FREE_CHANNEL)
            .context("fade_in failed")?
    } else {
        engine
            .play(source, -1, -1, audiomix::FREE_CHANNEL)
            .context("play failed")?
    };
    println!("playing on channel {idx}");

    let frames_per_block = (cli.freq as u64 * 20 / 1000).max(1) as usize;
    let mut accumulator = vec![0i32; frames_per_block * cli.mixer_channels as usize];

    for block in 0..cli.blocks {
        device_handle.pump(&mut accumulator, frames_per_block);
        if block % 5 == 0 {
            println!("t={:>5}ms {}", block * 20, level_meter(&accumulator));
        }
        if engine.channel_state(idx)? == audiomix::ChannelState::Idle {
            println!("channel {idx} finished at block {block}");
            break;
        }
    }

    engine.deinitialize().context("deinitialize failed")?;
    Ok(())
}
