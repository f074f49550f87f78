//! Audio source outputs and the source registry.
//!
//! The audio engine itself is external. This module defines the narrow
//! [`SourceOutput`] interface the core drives, a [`SimulatedOutput`] that
//! keeps state in memory (for tests and offline simulation), and the
//! [`SourceRegistry`] mapping [`SourceId`]s to outputs.

use crate::clip::ClipHandle;
use crate::command::SourceId;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Audio engine interface for a single audio source.
///
/// Setters apply immediately to the engine; the core only calls them while
/// applying a received command.
pub trait SourceOutput: Send {
    /// Start playback of the current clip after `delay_ticks` output ticks.
    fn play(&mut self, delay_ticks: u64);

    /// Play a clip once without changing the current clip.
    fn play_one_shot(&mut self, clip: ClipHandle, volume_scale: f32);

    /// Start playback after a delay in seconds.
    fn play_delayed(&mut self, delay_seconds: f32);

    /// Start playback at an absolute engine time.
    fn play_scheduled(&mut self, absolute_time: f64);

    /// Pause playback.
    fn pause(&mut self);

    /// Stop playback.
    fn stop(&mut self);

    /// Resume paused playback.
    fn unpause(&mut self);

    fn is_playing(&self) -> bool;

    fn volume(&self) -> f32;
    fn set_volume(&mut self, volume: f32);

    fn clip(&self) -> Option<ClipHandle>;
    fn set_clip(&mut self, clip: Option<ClipHandle>);

    fn doppler_level(&self) -> f32;
    fn set_doppler_level(&mut self, level: f32);

    fn ignore_listener_pause(&self) -> bool;
    fn set_ignore_listener_pause(&mut self, flag: bool);

    fn ignore_listener_volume(&self) -> bool;
    fn set_ignore_listener_volume(&mut self, flag: bool);

    fn looping(&self) -> bool;
    fn set_looping(&mut self, flag: bool);

    fn pitch(&self) -> f32;
    fn set_pitch(&mut self, pitch: f32);

    fn time(&self) -> f32;
    fn set_time(&mut self, seconds: f32);

    fn time_samples(&self) -> i32;
    fn set_time_samples(&mut self, samples: i32);
}

/// Playback transport state of a simulated source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PlayState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Engine call recorded by [`SimulatedOutput`].
#[derive(Clone, Debug, PartialEq)]
pub enum OutputEvent {
    Play { delay_ticks: u64, volume: f32 },
    PlayOneShot { clip: ClipHandle, volume_scale: f32 },
    PlayDelayed { delay_seconds: f32, volume: f32 },
    PlayScheduled { absolute_time: f64, volume: f32 },
    Pause,
    Stop,
    UnPause,
}

/// Full property state of a simulated source.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulatedState {
    pub play_state: PlayState,
    pub volume: f32,
    pub clip: Option<ClipHandle>,
    pub doppler_level: f32,
    pub ignore_listener_pause: bool,
    pub ignore_listener_volume: bool,
    pub looping: bool,
    pub pitch: f32,
    pub time: f32,
    pub time_samples: i32,
    /// Action calls in the order they were made.
    pub journal: Vec<OutputEvent>,
    /// Every volume value written, in order.
    pub volume_history: Vec<f32>,
}

impl Default for SimulatedState {
    fn default() -> Self {
        Self {
            play_state: PlayState::Stopped,
            volume: 1.0,
            clip: None,
            doppler_level: 1.0,
            ignore_listener_pause: false,
            ignore_listener_volume: false,
            looping: false,
            pitch: 1.0,
            time: 0.0,
            time_samples: 0,
            journal: Vec::new(),
            volume_history: Vec::new(),
        }
    }
}

/// In-memory [`SourceOutput`] with shared, inspectable state.
///
/// Cloning yields another handle to the same state, so a caller can keep a
/// handle while the registry owns the boxed output.
#[derive(Clone, Default)]
pub struct SimulatedOutput {
    state: Arc<RwLock<SimulatedState>>,
}

impl SimulatedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an output starting from the given state.
    pub fn with_state(state: SimulatedState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Read the state with a closure.
    pub fn with_state_read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&SimulatedState) -> R,
    {
        let state = self.state.read().expect("Output state lock poisoned");
        f(&state)
    }

    fn with_state_write<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut SimulatedState) -> R,
    {
        let mut state = self.state.write().expect("Output state lock poisoned");
        f(&mut state)
    }

    /// Get a clone of the current state.
    pub fn snapshot(&self) -> SimulatedState {
        self.with_state_read(|s| s.clone())
    }

    /// Get the recorded action calls.
    pub fn journal(&self) -> Vec<OutputEvent> {
        self.with_state_read(|s| s.journal.clone())
    }

    pub fn play_state(&self) -> PlayState {
        self.with_state_read(|s| s.play_state)
    }
}

impl std::fmt::Debug for SimulatedOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.with_state_read(|s| {
            f.debug_struct("SimulatedOutput")
                .field("play_state", &s.play_state)
                .field("volume", &s.volume)
                .finish_non_exhaustive()
        })
    }
}

impl SourceOutput for SimulatedOutput {
    fn play(&mut self, delay_ticks: u64) {
        self.with_state_write(|s| {
            s.play_state = PlayState::Playing;
            let volume = s.volume;
            s.journal.push(OutputEvent::Play {
                delay_ticks,
                volume,
            });
        });
    }

    fn play_one_shot(&mut self, clip: ClipHandle, volume_scale: f32) {
        self.with_state_write(|s| {
            s.journal.push(OutputEvent::PlayOneShot { clip, volume_scale });
        });
    }

    fn play_delayed(&mut self, delay_seconds: f32) {
        self.with_state_write(|s| {
            s.play_state = PlayState::Playing;
            let volume = s.volume;
            s.journal.push(OutputEvent::PlayDelayed {
                delay_seconds,
                volume,
            });
        });
    }

    fn play_scheduled(&mut self, absolute_time: f64) {
        self.with_state_write(|s| {
            s.play_state = PlayState::Playing;
            let volume = s.volume;
            s.journal.push(OutputEvent::PlayScheduled {
                absolute_time,
                volume,
            });
        });
    }

    fn pause(&mut self) {
        self.with_state_write(|s| {
            if s.play_state == PlayState::Playing {
                s.play_state = PlayState::Paused;
            }
            s.journal.push(OutputEvent::Pause);
        });
    }

    fn stop(&mut self) {
        self.with_state_write(|s| {
            s.play_state = PlayState::Stopped;
            s.time = 0.0;
            s.time_samples = 0;
            s.journal.push(OutputEvent::Stop);
        });
    }

    fn unpause(&mut self) {
        self.with_state_write(|s| {
            if s.play_state == PlayState::Paused {
                s.play_state = PlayState::Playing;
            }
            s.journal.push(OutputEvent::UnPause);
        });
    }

    fn is_playing(&self) -> bool {
        self.with_state_read(|s| s.play_state == PlayState::Playing)
    }

    fn volume(&self) -> f32 {
        self.with_state_read(|s| s.volume)
    }

    fn set_volume(&mut self, volume: f32) {
        self.with_state_write(|s| {
            s.volume = volume;
            s.volume_history.push(volume);
        });
    }

    fn clip(&self) -> Option<ClipHandle> {
        self.with_state_read(|s| s.clip)
    }

    fn set_clip(&mut self, clip: Option<ClipHandle>) {
        self.with_state_write(|s| s.clip = clip);
    }

    fn doppler_level(&self) -> f32 {
        self.with_state_read(|s| s.doppler_level)
    }

    fn set_doppler_level(&mut self, level: f32) {
        self.with_state_write(|s| s.doppler_level = level);
    }

    fn ignore_listener_pause(&self) -> bool {
        self.with_state_read(|s| s.ignore_listener_pause)
    }

    fn set_ignore_listener_pause(&mut self, flag: bool) {
        self.with_state_write(|s| s.ignore_listener_pause = flag);
    }

    fn ignore_listener_volume(&self) -> bool {
        self.with_state_read(|s| s.ignore_listener_volume)
    }

    fn set_ignore_listener_volume(&mut self, flag: bool) {
        self.with_state_write(|s| s.ignore_listener_volume = flag);
    }

    fn looping(&self) -> bool {
        self.with_state_read(|s| s.looping)
    }

    fn set_looping(&mut self, flag: bool) {
        self.with_state_write(|s| s.looping = flag);
    }

    fn pitch(&self) -> f32 {
        self.with_state_read(|s| s.pitch)
    }

    fn set_pitch(&mut self, pitch: f32) {
        self.with_state_write(|s| s.pitch = pitch);
    }

    fn time(&self) -> f32 {
        self.with_state_read(|s| s.time)
    }

    fn set_time(&mut self, seconds: f32) {
        self.with_state_write(|s| s.time = seconds);
    }

    fn time_samples(&self) -> i32 {
        self.with_state_read(|s| s.time_samples)
    }

    fn set_time_samples(&mut self, samples: i32) {
        self.with_state_write(|s| s.time_samples = samples);
    }
}

/// A registered source: its engine output plus replication bookkeeping.
pub struct SourceEntry {
    /// Engine output for this source.
    pub output: Box<dyn SourceOutput>,
    /// Last explicitly set volume; the baseline for damping and fades.
    pub nominal_volume: f32,
}

impl std::fmt::Debug for SourceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceEntry")
            .field("nominal_volume", &self.nominal_volume)
            .field("live_volume", &self.output.volume())
            .field("playing", &self.output.is_playing())
            .finish()
    }
}

/// Table of live audio sources on this peer.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: HashMap<SourceId, SourceEntry>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source as it comes online.
    ///
    /// The nominal volume starts at the output's current volume.
    pub fn insert(&mut self, id: SourceId, output: Box<dyn SourceOutput>) -> Result<()> {
        if self.sources.contains_key(&id) {
            return Err(Error::DuplicateSource(id));
        }
        let nominal_volume = output.volume();
        self.sources.insert(
            id,
            SourceEntry {
                output,
                nominal_volume,
            },
        );
        log::debug!("[SOURCES] Registered source {} (nominal volume {:.3})", id, nominal_volume);
        Ok(())
    }

    /// Remove a source, returning its output.
    pub fn remove(&mut self, id: SourceId) -> Result<Box<dyn SourceOutput>> {
        let entry = self.sources.remove(&id).ok_or(Error::UnknownSource(id))?;
        log::debug!("[SOURCES] Removed source {}", id);
        Ok(entry.output)
    }

    pub fn get(&self, id: SourceId) -> Result<&SourceEntry> {
        self.sources.get(&id).ok_or(Error::UnknownSource(id))
    }

    pub fn get_mut(&mut self, id: SourceId) -> Result<&mut SourceEntry> {
        self.sources.get_mut(&id).ok_or(Error::UnknownSource(id))
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.sources.contains_key(&id)
    }

    /// Nominal volume of a source.
    pub fn nominal_volume(&self, id: SourceId) -> Result<f32> {
        self.get(id).map(|entry| entry.nominal_volume)
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self.sources.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
