//! Loopback simulation of a multi-peer session.
//!
//! Every peer gets its own [`Session`] over a shared [`LoopbackHub`], the
//! same clip catalog (with peer-specific local handles) and the same sources.
//! The timeline is replayed in simulated time and all peers are ticked in
//! lockstep, so the final source states can be compared across peers.

use crate::config::{ActionEntry, ActionOp, Scenario};
use crate::error::{Error, Result};
use sonolink_core::{
    ClipHandle, ClipRegistry, LoopbackEndpoint, LoopbackHub, OutputEvent, Session,
    SessionOptions, SimulatedOutput, SimulatedState, SourceId, SourceOutput, Transport,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// Slack for comparing simulated time against action timestamps.
const TIME_EPSILON: f64 = 1e-9;

/// One simulated peer.
pub struct SimPeer {
    pub index: usize,
    pub session: Session<LoopbackEndpoint>,
    /// Probes into the outputs owned by the session.
    pub outputs: BTreeMap<SourceId, SimulatedOutput>,
    handles: HashMap<String, ClipHandle>,
}

impl SimPeer {
    /// Name of the clip behind a local handle.
    pub fn clip_name(&self, handle: ClipHandle) -> Option<&str> {
        self.session
            .clips()
            .iter()
            .find(|entry| entry.handle == handle)
            .map(|entry| entry.name.as_str())
    }

    /// Number of one-shots a source has played.
    pub fn one_shots(&self, id: SourceId) -> usize {
        self.outputs.get(&id).map_or(0, |output| {
            output
                .journal()
                .iter()
                .filter(|e| matches!(e, OutputEvent::PlayOneShot { .. }))
                .count()
        })
    }
}

/// Summary of a finished run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub ticks: u64,
    pub elapsed: f64,
    pub actions: usize,
    pub failed_actions: usize,
}

pub struct Simulation {
    // Kept alive so endpoints stay connected for the whole run
    _hub: LoopbackHub,
    peers: Vec<SimPeer>,
    timeline: VecDeque<ActionEntry>,
    dt: f64,
    duration: f64,
    summary: RunSummary,
}

impl Simulation {
    /// Build all peers from a scenario.
    pub fn new(scenario: &Scenario) -> Result<Self> {
        scenario.validate()?;
        let settings = &scenario.session;

        let hub = LoopbackHub::new();
        let endpoints: Vec<LoopbackEndpoint> = (0..settings.peers).map(|_| hub.join()).collect();
        hub.set_authority(endpoints[settings.authority].local_peer());

        let mut peers = Vec::with_capacity(endpoints.len());
        for (index, endpoint) in endpoints.into_iter().enumerate() {
            peers.push(Self::build_peer(scenario, index, endpoint)?);
        }

        Ok(Self {
            _hub: hub,
            peers,
            timeline: scenario.timeline().into(),
            dt: settings.tick_ms as f64 / 1000.0,
            duration: settings.duration_secs,
            summary: RunSummary::default(),
        })
    }

    fn build_peer(scenario: &Scenario, index: usize, endpoint: LoopbackEndpoint) -> Result<SimPeer> {
        // Local handles differ per peer; only the derived clip ids are shared
        let handles: HashMap<String, ClipHandle> = scenario
            .clips
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), ClipHandle(((index as u64) << 32) | i as u64)))
            .collect();
        let catalog = scenario
            .clips
            .iter()
            .map(|name| (name.as_str(), handles[name.as_str()]));
        let clips = ClipRegistry::build(catalog)?;

        let options = SessionOptions {
            seed: scenario.session.seed,
        };
        let mut session = Session::new(Arc::new(clips), endpoint, options);

        let mut outputs = BTreeMap::new();
        for source in &scenario.sources {
            let output = SimulatedOutput::with_state(SimulatedState {
                volume: source.volume,
                pitch: source.pitch,
                looping: source.looping,
                clip: source.clip.as_ref().and_then(|name| handles.get(name).copied()),
                ..SimulatedState::default()
            });
            let id = SourceId(source.id);
            session.spawn_source(id, Box::new(output.clone()))?;
            outputs.insert(id, output);
        }
        for link in &scenario.links {
            session.add_link(SourceId(link.from), SourceId(link.to), link.damping, link.bidirectional);
        }

        log::debug!(
            "Peer {} ready: {} clips, {} sources, authoritative: {}",
            index,
            session.clips().len(),
            outputs.len(),
            session.is_authoritative()
        );
        Ok(SimPeer {
            index,
            session,
            outputs,
            handles,
        })
    }

    pub fn peers(&self) -> &[SimPeer] {
        &self.peers
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Run the whole timeline, then let in-flight messages land.
    pub fn run(&mut self) -> &RunSummary {
        while self.summary.elapsed + TIME_EPSILON < self.duration {
            self.step();
        }
        let handled = self.settle();
        log::debug!("Settled {} trailing messages", handled);
        &self.summary
    }

    /// Perform due actions, then tick every peer once.
    pub fn step(&mut self) {
        let now = self.summary.elapsed;
        while self
            .timeline
            .front()
            .is_some_and(|action| action.at <= now + TIME_EPSILON)
        {
            let Some(action) = self.timeline.pop_front() else {
                break;
            };
            self.summary.actions += 1;
            if let Err(e) = self.perform(&action) {
                log::warn!(
                    "Action {:?} on source {} by peer {} at {:.3}s failed: {}",
                    action.op,
                    action.source,
                    action.peer,
                    action.at,
                    e
                );
                self.summary.failed_actions += 1;
            }
        }

        for peer in &mut self.peers {
            peer.session.tick(self.dt);
        }
        self.summary.ticks += 1;
        self.summary.elapsed += self.dt;
    }

    /// Pump all peers until no messages remain; returns how many were handled.
    pub fn settle(&mut self) -> usize {
        let mut total = 0;
        loop {
            let handled: usize = self.peers.iter_mut().map(|p| p.session.pump().total()).sum();
            if handled == 0 {
                return total;
            }
            total += handled;
        }
    }

    fn perform(&mut self, action: &ActionEntry) -> Result<()> {
        let source = SourceId(action.source);
        if action.op.is_topology() {
            for peer in &mut self.peers {
                Self::change_topology(peer, source, &action.op)?;
            }
            return Ok(());
        }

        let peer = self
            .peers
            .get_mut(action.peer)
            .ok_or_else(|| Error::Config(format!("no peer {}", action.peer)))?;
        let handles = &peer.handles;
        let handle = |name: &str| {
            handles
                .get(name)
                .copied()
                .ok_or_else(|| Error::Config(format!("unknown clip '{}'", name)))
        };
        let mut proxy = peer.session.source(source)?;

        match &action.op {
            ActionOp::Pause => proxy.pause()?,
            ActionOp::Stop => proxy.stop()?,
            ActionOp::UnPause => proxy.unpause()?,
            ActionOp::Play { delay_ticks } => proxy.play(*delay_ticks)?,
            ActionOp::PlayDelayed { delay_seconds } => proxy.play_delayed(*delay_seconds)?,
            ActionOp::PlayScheduled { absolute_time } => proxy.play_scheduled(*absolute_time)?,
            ActionOp::PlayOneShot { clip, volume_scale } => {
                proxy.play_one_shot(handle(clip.as_str())?, *volume_scale)?
            }
            ActionOp::SetVolume { volume } => proxy.set_volume(*volume)?,
            ActionOp::FadeOut { duration } => proxy.fade_out(*duration)?,
            ActionOp::FadeIn {
                target_volume,
                duration,
            } => proxy.fade_in(*target_volume, *duration)?,
            ActionOp::SetClip { clip } => proxy.set_clip(handle(clip.as_str())?)?,
            ActionOp::SetDopplerLevel { level } => proxy.set_doppler_level(*level)?,
            ActionOp::SetIgnoreListenerPause { flag } => proxy.set_ignore_listener_pause(*flag)?,
            ActionOp::SetIgnoreListenerVolume { flag } => proxy.set_ignore_listener_volume(*flag)?,
            ActionOp::SetLoop { flag } => proxy.set_looping(*flag)?,
            ActionOp::SetPitch { pitch } => proxy.set_pitch(*pitch)?,
            ActionOp::SetTime { seconds } => proxy.set_time(*seconds)?,
            ActionOp::SetTimeSamples { samples } => proxy.set_time_samples(*samples)?,
            ActionOp::LoopRandomClips {
                min_interval,
                max_interval,
                clips,
            } => {
                let clips = clips
                    .iter()
                    .map(|name| handle(name.as_str()))
                    .collect::<Result<Vec<_>>>()?;
                proxy.loop_random_clips(*min_interval, *max_interval, &clips)?
            }
            ActionOp::StopRandomLoop => {
                if !proxy.stop_random_loop() {
                    log::warn!("Source {} had no random loop to stop", source);
                }
            }
            ActionOp::Link { .. } | ActionOp::Unlink { .. } | ActionOp::Despawn => {
                return Err(Error::Config(format!("{:?} must apply to every peer", action.op)));
            }
        }
        Ok(())
    }

    fn change_topology(peer: &mut SimPeer, source: SourceId, op: &ActionOp) -> Result<()> {
        match *op {
            ActionOp::Link {
                to,
                damping,
                bidirectional,
            } => peer.session.add_link(source, SourceId(to), damping, bidirectional),
            ActionOp::Unlink { to, bidirectional } => {
                let removed = peer.session.remove_link(source, SourceId(to), bidirectional);
                if removed == 0 {
                    log::warn!("Peer {}: no link {} -> {} to remove", peer.index, source, to);
                }
            }
            ActionOp::Despawn => {
                peer.session.despawn_source(source)?;
                peer.outputs.remove(&source);
            }
            _ => {}
        }
        Ok(())
    }

    /// Sources whose state differs from the authoritative peer's copy.
    pub fn divergent_sources(&self) -> Vec<(usize, SourceId)> {
        let Some(reference) = self.peers.iter().find(|p| p.session.is_authoritative()) else {
            return Vec::new();
        };

        let mut divergent = Vec::new();
        for peer in self.peers.iter().filter(|p| p.index != reference.index) {
            for (&id, output) in &peer.outputs {
                let same = reference
                    .outputs
                    .get(&id)
                    .is_some_and(|expected| same_state(reference, expected, peer, output));
                if !same || reference.one_shots(id) != peer.one_shots(id) {
                    divergent.push((peer.index, id));
                }
            }
        }
        divergent
    }
}

fn same_state(a_peer: &SimPeer, a: &SimulatedOutput, b_peer: &SimPeer, b: &SimulatedOutput) -> bool {
    let close = |x: f32, y: f32| (x - y).abs() < 1e-5;
    let clip_name = |peer: &SimPeer, output: &SimulatedOutput| output.clip().and_then(|h| peer.clip_name(h).map(str::to_owned));

    a.play_state() == b.play_state()
        && close(a.volume(), b.volume())
        && close(a.pitch(), b.pitch())
        && close(a.doppler_level(), b.doppler_level())
        && close(a.time(), b.time())
        && a.time_samples() == b.time_samples()
        && a.looping() == b.looping()
        && a.ignore_listener_pause() == b.ignore_listener_pause()
        && a.ignore_listener_volume() == b.ignore_listener_volume()
        && clip_name(a_peer, a) == clip_name(b_peer, b)
}
