//! Mixer: process-wide coordinator. Owns the channel array, reservations,
//! groups, admission policy, global filter chains, and the device callback
//! entry point.
//!
//! One `parking_lot::Mutex` serializes the channel array, groups, and
//! policy settings. Per-channel state is reached through that same lock
//! since `Channel` is owned inline rather than shared across threads; only
//! the source itself (`SharedSource`) has its own independent lock, because
//! it may be held by application code concurrently with the channel that
//! plays it.

use std::collections::BTreeSet;
use std::panic;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::channel::{Channel, ChannelState, FinishedHandler};
use crate::clock::Clock;
use crate::device::{AudioDevice, DeviceCallback};
use crate::error::{MixerError, Result};
use crate::filter::{Filter, FilterChain};
use crate::format::{self, AudioFormat, MAX_VOLUME};
use crate::source::SharedSource;

/// Sentinel meaning "any free channel", re-exported here under the name
/// call sites in this module use most.
pub use format::FREE_CHANNEL;
/// Sentinel meaning "every channel" as a bulk-operation scope. Same value
/// as `FREE_CHANNEL` but a distinct name since the two sentinels are read
/// in unrelated contexts (admission target vs. bulk-operation scope).
pub const ALL_CHANNELS: i32 = -1;

/// Victim-selection strategy when `play`/`fade_in` find no `Idle` channel
/// in the candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayPolicy {
    Fail,
    Oldest,
    Priority,
    OldestPriority,
}

impl Default for PlayPolicy {
    fn default() -> Self {
        PlayPolicy::Fail
    }
}

/// Whether the device callback divides the accumulator by channel count
/// after mixing, to trade headroom for loudness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixPolicy {
    DontDivide,
    Divide,
}

impl Default for MixPolicy {
    fn default() -> Self {
        MixPolicy::DontDivide
    }
}

/// Builder-style bundle of the `initialize`/`allocate_channels`/policy knobs,
/// so a fully configured mixer can be set up in one call. Additive sugar:
/// [`Engine::initialize_with_config`] delegates entirely to the primitive,
/// individually-callable setters it bundles.
#[derive(Debug, Clone, Copy)]
pub struct MixerConfig {
    pub format: AudioFormat,
    pub buffer_ms: u32,
    pub channels: usize,
    pub reserved_channels: usize,
    pub play_policy: PlayPolicy,
    pub mix_policy: MixPolicy,
    pub master_volume: i32,
}

impl MixerConfig {
    pub fn new(format: AudioFormat, buffer_ms: u32, channels: usize) -> Self {
        MixerConfig {
            format,
            buffer_ms,
            channels,
            reserved_channels: 0,
            play_policy: PlayPolicy::Fail,
            mix_policy: MixPolicy::DontDivide,
            master_volume: MAX_VOLUME,
        }
    }

    pub fn reserved_channels(mut self, n: usize) -> Self {
        self.reserved_channels = n;
        self
    }

    pub fn play_policy(mut self, policy: PlayPolicy) -> Self {
        self.play_policy = policy;
        self
    }

    pub fn mix_policy(mut self, policy: MixPolicy) -> Self {
        self.mix_policy = policy;
        self
    }

    pub fn master_volume(mut self, volume: i32) -> Self {
        self.master_volume = volume;
        self
    }
}

fn group_id_of_slot(slot: usize) -> i32 {
    -(slot as i32) - 2
}

fn slot_of_group_id(id: i32) -> Option<usize> {
    if id <= -2 {
        Some((-(id + 2)) as usize)
    } else {
        None
    }
}

/// Shared state behind the single mixer-global lock.
struct MixerState {
    initialized: bool,
    mixer_format: AudioFormat,
    channels: Vec<Channel>,
    reserved: usize,
    groups: Vec<Option<BTreeSet<usize>>>,
    global_pre: FilterChain,
    global_post: FilterChain,
    play_policy: PlayPolicy,
    mix_policy: MixPolicy,
    master_volume: i32,
    on_channel_finished: Vec<FinishedHandler>,
}

impl MixerState {
    fn new() -> Self {
        MixerState {
            initialized: false,
            mixer_format: AudioFormat::mixer(44100, 2),
            channels: Vec::new(),
            reserved: 0,
            groups: Vec::new(),
            global_pre: FilterChain::new(),
            global_post: FilterChain::new(),
            play_policy: PlayPolicy::default(),
            mix_policy: MixPolicy::default(),
            master_volume: MAX_VOLUME,
            on_channel_finished: Vec::new(),
        }
    }

    fn require_initialized(&self) -> Result<()> {
        if !self.initialized {
            return Err(MixerError::NotInitialized);
        }
        Ok(())
    }

    fn require_channel(&self, idx: i32) -> Result<usize> {
        if idx < 0 || idx as usize >= self.channels.len() {
            return Err(MixerError::OutOfRange("channel index out of range"));
        }
        Ok(idx as usize)
    }

    /// Channel indices named by `scope`: `-1` means every channel, a
    /// negative group id means that group's members. Does not filter by
    /// reservation; callers that need that apply it themselves.
    fn scope_indices(&self, scope: i32) -> Result<Vec<usize>> {
        if scope == ALL_CHANNELS {
            return Ok((0..self.channels.len()).collect());
        }
        let slot = slot_of_group_id(scope)
            .ok_or(MixerError::OutOfRange("scope must be -1 or a group id"))?;
        match self.groups.get(slot).and_then(|g| g.as_ref()) {
            Some(set) => Ok(set.iter().copied().collect()),
            None => Err(MixerError::InvalidArgument("group does not exist")),
        }
    }

    fn candidate_indices(&self, target: i32) -> Result<Vec<usize>> {
        if target == FREE_CHANNEL {
            Ok((self.reserved..self.channels.len()).collect())
        } else {
            let slot = slot_of_group_id(target)
                .ok_or(MixerError::OutOfRange("invalid target"))?;
            match self.groups.get(slot).and_then(|g| g.as_ref()) {
                Some(set) => Ok(set
                    .iter()
                    .copied()
                    .filter(|&i| i >= self.reserved)
                    .collect()),
                None => Err(MixerError::InvalidArgument("group does not exist")),
            }
        }
    }

    fn pick_victim(&self, candidates: &[usize], now_ms: u64) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match self.play_policy {
            PlayPolicy::Fail => None,
            PlayPolicy::Oldest => candidates
                .iter()
                .copied()
                .max_by_key(|&i| self.channels[i].age_ms(now_ms)),
            PlayPolicy::Priority => candidates
                .iter()
                .copied()
                .min_by_key(|&i| self.channels[i].priority()),
            PlayPolicy::OldestPriority => {
                let min_prio = candidates
                    .iter()
                    .map(|&i| self.channels[i].priority())
                    .min()?;
                candidates
                    .iter()
                    .copied()
                    .filter(|&i| self.channels[i].priority() == min_prio)
                    .max_by_key(|&i| self.channels[i].age_ms(now_ms))
            }
        }
    }

    fn allocate_channels(&mut self, n: usize) {
        if n < self.channels.len() {
            for ch in &mut self.channels[n..] {
                if ch.stop() {
                    let idx = ch.index();
                    for hook in &self.on_channel_finished {
                        hook(idx);
                    }
                }
            }
            self.channels.truncate(n);
        } else {
            while self.channels.len() < n {
                let idx = self.channels.len();
                self.channels.push(Channel::new(idx));
            }
        }
        self.reserved = self.reserved.min(self.channels.len());
    }

    fn admit(
        &mut self,
        source: SharedSource,
        loops: i32,
        fade_in_ms: Option<u64>,
        timeout_ms: i64,
        target: i32,
        now_ms: u64,
    ) -> Result<i32> {
        self.require_initialized()?;

        if target >= 0 {
            let idx = self.require_channel(target)?;
            self.bind_at(idx, source, loops, fade_in_ms, timeout_ms, now_ms)?;
            return Ok(idx as i32);
        }

        let candidates = self.candidate_indices(target)?;
        if let Some(idx) = candidates.iter().copied().find(|&i| self.channels[i].is_idle()) {
            self.bind_at(idx, source, loops, fade_in_ms, timeout_ms, now_ms)?;
            return Ok(idx as i32);
        }

        match self.pick_victim(&candidates, now_ms) {
            Some(idx) => {
                debug!(channel = idx, policy = ?self.play_policy, "evicting channel for admission");
                self.bind_at(idx, source, loops, fade_in_ms, timeout_ms, now_ms)?;
                Ok(idx as i32)
            }
            None => {
                warn!(policy = ?self.play_policy, "no channel available, play() returning -1");
                Ok(-1)
            }
        }
    }

    fn bind_at(
        &mut self,
        idx: usize,
        source: SharedSource,
        loops: i32,
        fade_in_ms: Option<u64>,
        timeout_ms: i64,
        now_ms: u64,
    ) -> Result<()> {
        let replaced = self.channels[idx].bind(source, loops, fade_in_ms, timeout_ms, now_ms)?;
        if replaced {
            for hook in &self.on_channel_finished {
                hook(idx);
            }
        }
        Ok(())
    }
}

/// Process-wide mixer coordinator. Its constructor does not open a device;
/// call [`Engine::initialize`] to do that, separating construction from
/// device negotiation so tests can construct an `Engine` without a device
/// at all.
pub struct Engine {
    state: Arc<Mutex<MixerState>>,
    device: Mutex<Option<Box<dyn AudioDevice>>>,
    clock: Arc<dyn Clock>,
    finished_rx: Receiver<usize>,
}

impl Engine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = unbounded();
        let state = Arc::new(Mutex::new(MixerState::new()));
        // A finished-event queue, dispatched independently of whatever
        // synchronous `on_channel_finished` closures a caller registers,
        // for a consumer thread that would rather poll a channel than own
        // a callback.
        state.lock().on_channel_finished.push(Arc::new(move |idx| {
            let _ = tx.send(idx);
        }));
        Engine {
            state,
            device: Mutex::new(None),
            clock,
            finished_rx: rx,
        }
    }

    /// A receiver of channel indices as they finish, independent of any
    /// `on_channel_finished` closures registered directly. Multiple clones
    /// of this receiver may be held by different consumer threads; each
    /// event is delivered to exactly one of them.
    pub fn finished_events(&self) -> Receiver<usize> {
        self.finished_rx.clone()
    }

    /// Opens `device` at the requested format, records the actually
    /// negotiated format as the mixer format, allocates zero channels, and
    /// installs the callback. Returns whether the negotiated format exactly
    /// matched what was requested.
    pub fn initialize(
        &self,
        mut device: Box<dyn AudioDevice>,
        requested: AudioFormat,
        buffer_ms: u32,
    ) -> Result<bool> {
        {
            let state = self.state.lock();
            if state.initialized {
                return Err(MixerError::InvalidState("mixer already initialized"));
            }
        }

        let negotiated = device.open(requested, buffer_ms)?;
        let exact_match = negotiated == requested;

        {
            let mut state = self.state.lock();
            state.mixer_format = negotiated;
            state.channels.clear();
            state.reserved = 0;
            state.groups.clear();
            state.initialized = true;
        }

        let state_for_callback = Arc::clone(&self.state);
        let clock_for_callback = Arc::clone(&self.clock);
        let callback: DeviceCallback = Box::new(move |accumulator, frames| {
            run_callback(&state_for_callback, clock_for_callback.as_ref(), accumulator, frames);
        });
        device.set_callback(callback);

        *self.device.lock() = Some(device);
        debug!(?negotiated, exact_match, "mixer initialized");
        Ok(exact_match)
    }

    /// One-call setup: `initialize` against `device`, then
    /// `allocate_channels`, `reserved_channels`, `play_policy`, `mix_policy`,
    /// and `master_volume` from `config`. Equivalent to, and implemented
    /// entirely in terms of, calling each primitive setter individually.
    pub fn initialize_with_config(
        &self,
        device: Box<dyn AudioDevice>,
        config: MixerConfig,
    ) -> Result<bool> {
        let exact_match = self.initialize(device, config.format, config.buffer_ms)?;
        self.allocate_channels(config.channels)?;
        self.set_reserved_channels(config.reserved_channels)?;
        self.set_play_policy(config.play_policy);
        self.set_mix_policy(config.mix_policy);
        self.set_master_volume(config.master_volume)?;
        Ok(exact_match)
    }

    pub fn deinitialize(&self) -> Result<()> {
        let mut guard = self.device.lock();
        let Some(mut device) = guard.take() else {
            return Err(MixerError::NotInitialized);
        };

        {
            let mut state = self.state.lock();
            state.allocate_channels(0);
            state.initialized = false;
        }
        device.close()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn mixer_format(&self) -> Result<AudioFormat> {
        let state = self.state.lock();
        state.require_initialized()?;
        Ok(state.mixer_format)
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // ---- Channel array -------------------------------------------------

    pub fn allocate_channels(&self, n: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.require_initialized()?;
        state.allocate_channels(n);
        Ok(())
    }

    pub fn num_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn reserved_channels(&self) -> usize {
        self.state.lock().reserved
    }

    pub fn set_reserved_channels(&self, n: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.require_initialized()?;
        if n > state.channels.len() {
            return Err(MixerError::OutOfRange(
                "reserved channel count exceeds channel count",
            ));
        }
        state.reserved = n;
        Ok(())
    }

    // ---- Global settings -------------------------------------------------

    pub fn master_volume(&self) -> i32 {
        self.state.lock().master_volume
    }

    pub fn set_master_volume(&self, volume: i32) -> Result<()> {
        if !(0..=MAX_VOLUME).contains(&volume) {
            return Err(MixerError::OutOfRange("master volume must be in 0..=256"));
        }
        self.state.lock().master_volume = volume;
        Ok(())
    }

    pub fn play_policy(&self) -> PlayPolicy {
        self.state.lock().play_policy
    }

    pub fn set_play_policy(&self, policy: PlayPolicy) {
        self.state.lock().play_policy = policy;
    }

    pub fn mix_policy(&self) -> MixPolicy {
        self.state.lock().mix_policy
    }

    pub fn set_mix_policy(&self, policy: MixPolicy) {
        self.state.lock().mix_policy = policy;
    }

    pub fn add_global_pre_filter(&self, filter: Filter) {
        self.state.lock().global_pre.push(filter);
    }

    pub fn add_global_post_filter(&self, filter: Filter) {
        self.state.lock().global_post.push(filter);
    }

    pub fn clear_global_filters(&self) {
        let mut state = self.state.lock();
        state.global_pre.clear();
        state.global_post.clear();
    }

    pub fn on_channel_finished(&self, handler: FinishedHandler) {
        self.state.lock().on_channel_finished.push(handler);
    }

    // ---- Groups ----------------------------------------------------------

    /// Returns the lowest free group id (`-slot - 2`).
    pub fn add_group(&self) -> i32 {
        let mut state = self.state.lock();
        if let Some(slot) = state.groups.iter().position(|g| g.is_none()) {
            state.groups[slot] = Some(BTreeSet::new());
            return group_id_of_slot(slot);
        }
        state.groups.push(Some(BTreeSet::new()));
        group_id_of_slot(state.groups.len() - 1)
    }

    /// Clears the group's slot. The id is not reassigned to a different
    /// group by this call, though a later `add_group` may reuse the slot.
    pub fn remove_group(&self, group: i32) -> Result<()> {
        let mut state = self.state.lock();
        let slot = slot_of_group_id(group)
            .ok_or(MixerError::OutOfRange("not a group id"))?;
        match state.groups.get_mut(slot) {
            Some(g @ Some(_)) => {
                *g = None;
                Ok(())
            }
            _ => Err(MixerError::InvalidArgument("group does not exist")),
        }
    }

    pub fn group_channel(&self, group: i32, channel: i32) -> Result<()> {
        let mut state = self.state.lock();
        let idx = state.require_channel(channel)?;
        let slot = slot_of_group_id(group)
            .ok_or(MixerError::OutOfRange("not a group id"))?;
        match state.groups.get_mut(slot) {
            Some(Some(set)) => {
                set.insert(idx);
                Ok(())
            }
            _ => Err(MixerError::InvalidArgument("group does not exist")),
        }
    }

    pub fn ungroup_channel(&self, group: i32, channel: i32) -> Result<()> {
        let mut state = self.state.lock();
        let idx = state.require_channel(channel)?;
        let slot = slot_of_group_id(group)
            .ok_or(MixerError::OutOfRange("not a group id"))?;
        match state.groups.get_mut(slot) {
            Some(Some(set)) => {
                set.remove(&idx);
                Ok(())
            }
            _ => Err(MixerError::InvalidArgument("group does not exist")),
        }
    }

    pub fn group_range(&self, group: i32, lo: usize, hi: usize) -> Result<()> {
        let mut state = self.state.lock();
        if hi > state.channels.len() || lo > hi {
            return Err(MixerError::OutOfRange("channel range out of bounds"));
        }
        let slot = slot_of_group_id(group)
            .ok_or(MixerError::OutOfRange("not a group id"))?;
        match state.groups.get_mut(slot) {
            Some(Some(set)) => {
                set.extend(lo..hi);
                Ok(())
            }
            _ => Err(MixerError::InvalidArgument("group does not exist")),
        }
    }

    pub fn group_size(&self, group: i32) -> Result<usize> {
        let state = self.state.lock();
        let slot = slot_of_group_id(group)
            .ok_or(MixerError::OutOfRange("not a group id"))?;
        match state.groups.get(slot).and_then(|g| g.as_ref()) {
            Some(set) => Ok(set.len()),
            None => Err(MixerError::InvalidArgument("group does not exist")),
        }
    }

    pub fn get_group_channels(&self, group: i32) -> Result<Vec<usize>> {
        let state = self.state.lock();
        let slot = slot_of_group_id(group)
            .ok_or(MixerError::OutOfRange("not a group id"))?;
        match state.groups.get(slot).and_then(|g| g.as_ref()) {
            Some(set) => Ok(set.iter().copied().collect()),
            None => Err(MixerError::InvalidArgument("group does not exist")),
        }
    }

    // ---- Admission ---------------------------------------------------

    /// `target` is a specific channel index `>= 0`, [`FREE_CHANNEL`], or a
    /// negative group id. Returns the bound channel index, or `-1` (not an
    /// error) if the `Fail` policy exhausted the candidate set.
    pub fn play(
        &self,
        source: SharedSource,
        loops: i32,
        timeout_ms: i64,
        target: i32,
    ) -> Result<i32> {
        let now = self.now_ms();
        self.state.lock().admit(source, loops, None, timeout_ms, target, now)
    }

    pub fn fade_in(
        &self,
        source: SharedSource,
        fade_ms: u64,
        loops: i32,
        timeout_ms: i64,
        target: i32,
    ) -> Result<i32> {
        let now = self.now_ms();
        self.state
            .lock()
            .admit(source, loops, Some(fade_ms), timeout_ms, target, now)
    }

    // ---- Per-channel ops -----------------------------------------------

    pub fn pause_channel(&self, idx: i32) -> Result<()> {
        let mut state = self.state.lock();
        let i = state.require_channel(idx)?;
        state.channels[i].pause();
        Ok(())
    }

    pub fn resume_channel(&self, idx: i32) -> Result<()> {
        let mut state = self.state.lock();
        let i = state.require_channel(idx)?;
        state.channels[i].resume();
        Ok(())
    }

    pub fn stop_channel(&self, idx: i32) -> Result<()> {
        let mut state = self.state.lock();
        let i = state.require_channel(idx)?;
        if state.channels[i].stop() {
            for hook in &state.on_channel_finished {
                hook(i);
            }
        }
        Ok(())
    }

    pub fn fade_out_channel(&self, idx: i32, ms: u64) -> Result<()> {
        let now = self.now_ms();
        let mut state = self.state.lock();
        let i = state.require_channel(idx)?;
        state.channels[i].fade_out(ms, now);
        Ok(())
    }

    pub fn channel_state(&self, idx: i32) -> Result<ChannelState> {
        let state = self.state.lock();
        let i = state.require_channel(idx)?;
        Ok(state.channels[i].state())
    }

    pub fn set_channel_volume(&self, idx: i32, volume: i32) -> Result<()> {
        let mut state = self.state.lock();
        let i = state.require_channel(idx)?;
        state.channels[i].set_volume(volume)
    }

    pub fn set_channel_rate(&self, idx: i32, rate: f64) -> Result<()> {
        let mut state = self.state.lock();
        let i = state.require_channel(idx)?;
        state.channels[i].set_rate(rate)
    }

    pub fn channel_position(&self, idx: i32) -> Result<u64> {
        let state = self.state.lock();
        let i = state.require_channel(idx)?;
        Ok(state.channels[i].position())
    }

    pub fn set_channel_position(&self, idx: i32, frames: u64) -> Result<()> {
        let mut state = self.state.lock();
        let i = state.require_channel(idx)?;
        state.channels[i].set_position(frames);
        Ok(())
    }

    pub fn add_channel_filter(&self, idx: i32, filter: Filter) -> Result<()> {
        let mut state = self.state.lock();
        let i = state.require_channel(idx)?;
        state.channels[i].filters_mut().push(filter);
        Ok(())
    }

    pub fn add_channel_finished_handler(&self, idx: i32, handler: FinishedHandler) -> Result<()> {
        let mut state = self.state.lock();
        let i = state.require_channel(idx)?;
        state.channels[i].add_finished_handler(handler);
        Ok(())
    }

    // ---- Bulk operations (scope: -1 = all, or a group id) --------------

    pub fn pause(&self, scope: i32) -> Result<()> {
        let mut state = self.state.lock();
        let indices = state.scope_indices(scope)?;
        for i in indices {
            state.channels[i].pause();
        }
        Ok(())
    }

    pub fn resume(&self, scope: i32) -> Result<()> {
        let mut state = self.state.lock();
        let indices = state.scope_indices(scope)?;
        for i in indices {
            state.channels[i].resume();
        }
        Ok(())
    }

    pub fn stop(&self, scope: i32) -> Result<()> {
        let mut state = self.state.lock();
        let indices = state.scope_indices(scope)?;
        let mut finished = Vec::new();
        for i in indices {
            if state.channels[i].stop() {
                finished.push(i);
            }
        }
        for i in finished {
            for hook in &state.on_channel_finished {
                hook(i);
            }
        }
        Ok(())
    }

    pub fn fade_out(&self, scope: i32, ms: u64) -> Result<()> {
        let now = self.now_ms();
        let mut state = self.state.lock();
        let indices = state.scope_indices(scope)?;
        for i in indices {
            state.channels[i].fade_out(ms, now);
        }
        Ok(())
    }

    /// Index of the channel with the greatest age within `scope`. Skips
    /// channels `< reserved` when `include_reserved` is false.
    pub fn oldest_channel(&self, scope: i32, include_reserved: bool) -> Result<Option<usize>> {
        let now = self.now_ms();
        let state = self.state.lock();
        let reserved = state.reserved;
        let indices = state.scope_indices(scope)?;
        Ok(indices
            .into_iter()
            .filter(|&i| include_reserved || i >= reserved)
            .filter(|&i| !state.channels[i].is_idle())
            .max_by_key(|&i| state.channels[i].age_ms(now)))
    }
}

/// The device callback entry point. Never allowed to panic out to the
/// host: a mixer-global failure is logged and the block is left silent
/// rather than propagated.
fn run_callback(state: &Mutex<MixerState>, clock: &dyn Clock, accumulator: &mut [i32], frames: usize) {
    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let now = clock.now_ms();
        let mut state = state.lock();
        if !state.initialized {
            accumulator.fill(0);
            return;
        }
        accumulator.fill(0);

        let mixer_format = state.mixer_format;
        let master_volume = state.master_volume;
        let pre_filters = state.global_pre.snapshot();
        let post_filters = state.global_post.snapshot();
        let mix_policy = state.mix_policy;
        let n_channels = state.channels.len();

        let mut finished = Vec::new();
        for ch in state.channels.iter_mut() {
            if ch.mix(accumulator, frames, mixer_format, &pre_filters, now) {
                finished.push(ch.index());
            }
        }

        for filter in &post_filters {
            filter(accumulator, frames, mixer_format);
        }

        if mix_policy == MixPolicy::Divide && n_channels > 0 {
            for s in accumulator.iter_mut() {
                *s /= n_channels as i32;
            }
        }

        if master_volume != MAX_VOLUME {
            for s in accumulator.iter_mut() {
                *s = ((*s as i64 * master_volume as i64) >> 8) as i32;
            }
        }

        for hook in &state.on_channel_finished {
            for &idx in &finished {
                hook(idx);
            }
        }
    }));

    if result.is_err() {
        error!("mixer callback panicked, returning silence for this block");
        accumulator.fill(0);
    }
}
