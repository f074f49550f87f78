//! Cooperative timed tasks: volume fades and randomized clip loops.
//!
//! Tasks are plain state objects keyed by [`SourceId`] and advanced by
//! [`FadeScheduler::tick`] once per time step. Progress is driven by elapsed
//! time, not tick count, so results do not depend on the tick rate.
//!
//! - [`FadeTask`] - One linear volume ramp (at most one per source)
//! - [`RandomLoop`] - Repeated one-shots of randomly chosen clips
//!
//! Cancellation only sets a flag; the task is dropped at the next tick
//! boundary and the live volume stays where it was.

use crate::clip::ClipId;
use crate::command::{Action, Command, SourceId};
use crate::error::{Error, Result};
use crate::source::{SourceOutput, SourceRegistry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};

/// Direction of a fade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FadeKind {
    FadingOut,
    FadingIn,
}

/// Runtime state of a volume fade on one source.
#[derive(Clone, Debug)]
pub struct FadeTask {
    pub kind: FadeKind,
    /// Volume at elapsed = 0.
    pub start_volume: f32,
    /// Volume at elapsed = duration.
    pub target_volume: f32,
    /// Seconds elapsed so far.
    pub elapsed: f64,
    /// Total fade length in seconds.
    pub duration: f64,
    cancelled: bool,
}

impl FadeTask {
    fn new(kind: FadeKind, start_volume: f32, target_volume: f32, duration: f32) -> Self {
        Self {
            kind,
            start_volume,
            target_volume,
            elapsed: 0.0,
            duration: f64::from(duration.max(0.0)),
            cancelled: false,
        }
    }

    /// Fraction of the fade completed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.duration <= f64::EPSILON {
            return 1.0;
        }
        (self.elapsed / self.duration).clamp(0.0, 1.0)
    }

    /// Interpolated volume at the current elapsed time.
    pub fn current_volume(&self) -> f32 {
        let t = self.progress();
        if t >= 1.0 {
            return self.target_volume;
        }
        self.start_volume + (self.target_volume - self.start_volume) * t as f32
    }

    /// Check if the fade has run its full duration.
    pub fn is_complete(&self) -> bool {
        self.progress() >= 1.0
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Runtime state of a randomized clip loop on one source.
#[derive(Clone, Debug)]
pub struct RandomLoop {
    pub min_interval: f32,
    pub max_interval: f32,
    pub clips: Vec<ClipId>,
    /// Seconds until the next one-shot fires.
    pub remaining: f64,
    cancelled: bool,
}

impl RandomLoop {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Owner of all fade and random-loop tasks on this peer.
pub struct FadeScheduler {
    fades: HashMap<SourceId, FadeTask>,
    // Ordered so seeded runs draw in the same source order
    loops: BTreeMap<SourceId, RandomLoop>,
    rng: StdRng,
}

impl Default for FadeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FadeScheduler {
    /// Create a scheduler with an OS-seeded random generator.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Create a scheduler with a fixed seed (reproducible loops).
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            fades: HashMap::new(),
            loops: BTreeMap::new(),
            rng,
        }
    }

    /// Start a linear fade from `start_volume` down to zero.
    ///
    /// When it completes, playback stops and the live volume is reset to
    /// `start_volume`. Replaces any fade already running on the source.
    pub fn fade_out(
        &mut self,
        id: SourceId,
        output: &mut dyn SourceOutput,
        duration: f32,
        start_volume: f32,
    ) {
        output.set_volume(start_volume);
        self.start_fade(id, FadeTask::new(FadeKind::FadingOut, start_volume, 0.0, duration));
    }

    /// Start a linear fade from `start_volume` up to `target_volume`.
    ///
    /// Replaces any fade already running on the source.
    pub fn fade_in(
        &mut self,
        id: SourceId,
        output: &mut dyn SourceOutput,
        target_volume: f32,
        duration: f32,
        start_volume: f32,
    ) {
        output.set_volume(start_volume);
        self.start_fade(
            id,
            FadeTask::new(FadeKind::FadingIn, start_volume, target_volume, duration),
        );
    }

    fn start_fade(&mut self, id: SourceId, task: FadeTask) {
        log::debug!(
            "[FADE] Source {}: {:?} {:.3} -> {:.3} over {:.3}s",
            id,
            task.kind,
            task.start_volume,
            task.target_volume,
            task.duration
        );
        if let Some(previous) = self.fades.insert(id, task) {
            if !previous.cancelled {
                log::debug!("[FADE] Source {}: replaced running {:?}", id, previous.kind);
            }
        }
    }

    /// Request cancellation of the fade on a source.
    ///
    /// Returns false if no fade was running.
    pub fn cancel_fade(&mut self, id: SourceId) -> bool {
        match self.fades.get_mut(&id) {
            Some(task) if !task.cancelled => {
                task.cancelled = true;
                log::debug!("[FADE] Source {}: cancelled {:?}", id, task.kind);
                true
            }
            _ => false,
        }
    }

    /// The live (non-cancelled) fade on a source.
    pub fn fade(&self, id: SourceId) -> Option<&FadeTask> {
        self.fades.get(&id).filter(|task| !task.cancelled)
    }

    pub fn is_fading(&self, id: SourceId) -> bool {
        self.fade(id).is_some()
    }

    /// Start firing one-shots of random clips from `clips` on a source.
    ///
    /// The first one-shot fires on the next tick; after each, the loop waits
    /// a uniformly sampled interval in `[min_interval, max_interval]`.
    pub fn start_random_loop(
        &mut self,
        id: SourceId,
        min_interval: f32,
        max_interval: f32,
        clips: Vec<ClipId>,
    ) -> Result<()> {
        if clips.is_empty() {
            return Err(Error::EmptyClipSet);
        }
        let finite = min_interval.is_finite() && max_interval.is_finite();
        if !(finite && min_interval >= 0.0 && max_interval >= min_interval) {
            return Err(Error::InvalidInterval {
                min: min_interval,
                max: max_interval,
            });
        }
        if self.is_looping(id) {
            return Err(Error::RandomLoopActive(id));
        }

        log::info!(
            "[LOOP] Source {}: random loop over {} clips every {:.2}-{:.2}s",
            id,
            clips.len(),
            min_interval,
            max_interval
        );
        self.loops.insert(
            id,
            RandomLoop {
                min_interval,
                max_interval,
                clips,
                remaining: 0.0,
                cancelled: false,
            },
        );
        Ok(())
    }

    /// Request cancellation of the random loop on a source.
    ///
    /// Returns false if no loop was running.
    pub fn stop_random_loop(&mut self, id: SourceId) -> bool {
        match self.loops.get_mut(&id) {
            Some(task) if !task.cancelled => {
                task.cancelled = true;
                log::info!("[LOOP] Source {}: random loop cancelled", id);
                true
            }
            _ => false,
        }
    }

    pub fn is_looping(&self, id: SourceId) -> bool {
        self.loops.get(&id).is_some_and(|task| !task.cancelled)
    }

    /// Drop every task for a source immediately (source teardown).
    pub fn remove_source(&mut self, id: SourceId) {
        self.fades.remove(&id);
        self.loops.remove(&id);
    }

    /// Advance all tasks by `dt` seconds.
    ///
    /// Fades are applied directly to the registered outputs. Random loops do
    /// not touch outputs; the commands they fire are returned for the caller
    /// to issue through the dispatcher.
    pub fn tick(&mut self, dt: f64, sources: &mut SourceRegistry) -> Vec<Command> {
        self.update_fades(dt, sources);
        self.update_loops(dt)
    }

    fn update_fades(&mut self, dt: f64, sources: &mut SourceRegistry) {
        let mut finished = Vec::new();

        for (&id, task) in self.fades.iter_mut() {
            if task.cancelled {
                finished.push(id);
                continue;
            }
            let entry = match sources.get_mut(id) {
                Ok(entry) => entry,
                Err(_) => {
                    log::warn!("[FADE] Source {} disappeared mid-fade, dropping fade", id);
                    finished.push(id);
                    continue;
                }
            };

            task.elapsed += dt.max(0.0);
            let volume = task.current_volume();
            entry.output.set_volume(volume);
            log::trace!("[FADE] Source {}: volume {:.4} ({:.0}%)", id, volume, task.progress() * 100.0);

            if task.is_complete() {
                if task.kind == FadeKind::FadingOut {
                    entry.output.stop();
                    entry.output.set_volume(task.start_volume);
                }
                log::debug!("[FADE] Source {}: {:?} complete", id, task.kind);
                finished.push(id);
            }
        }

        for id in finished {
            self.fades.remove(&id);
        }
    }

    fn update_loops(&mut self, dt: f64) -> Vec<Command> {
        self.loops.retain(|_, task| !task.cancelled);

        let mut fired = Vec::new();
        for (&id, task) in self.loops.iter_mut() {
            task.remaining -= dt.max(0.0);
            if task.remaining > 0.0 {
                continue;
            }

            let clip = task.clips[self.rng.random_range(0..task.clips.len())];
            let interval = self.rng.random_range(task.min_interval..=task.max_interval);
            task.remaining = f64::from(interval);
            log::debug!(
                "[LOOP] Source {}: firing clip {}, next in {:.3}s",
                id,
                clip,
                interval
            );
            fired.push(Command::new(
                id,
                Action::PlayOneShot {
                    clip,
                    volume_scale: 1.0,
                },
            ));
        }

        fired
    }
}

impl std::fmt::Debug for FadeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FadeScheduler")
            .field("fades", &self.fades.len())
            .field("loops", &self.loops.len())
            .finish_non_exhaustive()
    }
}
