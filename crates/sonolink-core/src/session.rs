//! Per-peer replication session and the audio source façade.
//!
//! A [`Session`] is the explicit context object for one peer. It owns the
//! registries ([`Context`]), the [`CommandDispatcher`] and the
//! [`FadeScheduler`], and is driven by calling [`Session::tick`] once per time
//! step on a single thread. Network receive, fades and random loops all
//! advance inside that call, so no two mutations ever race.
//!
//! Sources are controlled through [`SourceProxy`]: setters and actions only
//! issue commands, and the visible state changes once the command comes back
//! through the dispatcher. Getters read the last applied local state.

use crate::clip::{ClipHandle, ClipId, ClipRegistry};
use crate::command::{Action, Command, SourceId};
use crate::dispatcher::{CommandDispatcher, Disposition};
use crate::error::Result;
use crate::fade::FadeScheduler;
use crate::links::LinkGraph;
use crate::source::{SourceEntry, SourceOutput, SourceRegistry};
use crate::transport::{PeerId, Transport};
use std::sync::Arc;

/// Registries shared by the dispatcher and the proxies.
#[derive(Debug)]
pub struct Context {
    /// Frozen clip catalog.
    pub clips: Arc<ClipRegistry>,
    /// Live sources on this peer.
    pub sources: SourceRegistry,
    /// Declared links between sources.
    pub links: LinkGraph,
}

impl Context {
    pub fn new(clips: Arc<ClipRegistry>) -> Self {
        Self {
            clips,
            sources: SourceRegistry::new(),
            links: LinkGraph::new(),
        }
    }
}

/// Tunables supplied by the embedder.
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    /// Seed for random clip loops. `None` seeds from the OS.
    pub seed: Option<u64>,
}

/// Outcome of draining the transport once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub applied: usize,
    pub relayed: usize,
    pub dropped: usize,
}

impl PumpReport {
    pub fn total(&self) -> usize {
        self.applied + self.relayed + self.dropped
    }

    fn merge(&mut self, other: PumpReport) {
        self.applied += other.applied;
        self.relayed += other.relayed;
        self.dropped += other.dropped;
    }
}

/// Replication state of one peer.
pub struct Session<T: Transport> {
    ctx: Context,
    dispatcher: CommandDispatcher<T>,
    fades: FadeScheduler,
}

impl<T: Transport> Session<T> {
    /// Create a session over a transport with a pre-built clip registry.
    pub fn new(clips: Arc<ClipRegistry>, transport: T, options: SessionOptions) -> Self {
        let fades = match options.seed {
            Some(seed) => FadeScheduler::with_seed(seed),
            None => FadeScheduler::new(),
        };
        Self {
            ctx: Context::new(clips),
            dispatcher: CommandDispatcher::new(transport),
            fades,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.dispatcher.transport().local_peer()
    }

    pub fn is_authoritative(&self) -> bool {
        self.dispatcher.transport().is_authoritative()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn clips(&self) -> &ClipRegistry {
        &self.ctx.clips
    }

    pub fn fades(&self) -> &FadeScheduler {
        &self.fades
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<T> {
        &self.dispatcher
    }

    /// Register a source as its entity comes online.
    pub fn spawn_source(&mut self, id: SourceId, output: Box<dyn SourceOutput>) -> Result<()> {
        self.ctx.sources.insert(id, output)?;
        log::info!("[SOURCES] {}: source {} online", self.local_peer(), id);
        Ok(())
    }

    /// Tear down a source: its registry entry, every link touching it, and
    /// its fade and random-loop tasks.
    pub fn despawn_source(&mut self, id: SourceId) -> Result<Box<dyn SourceOutput>> {
        let output = self.ctx.sources.remove(id)?;
        self.ctx.links.remove_source(id);
        self.fades.remove_source(id);
        log::info!("[SOURCES] {}: source {} offline", self.local_peer(), id);
        Ok(output)
    }

    /// Link `from` to `to` with the given damping.
    pub fn add_link(&mut self, from: SourceId, to: SourceId, damping: f32, bidirectional: bool) {
        self.ctx.links.add_link(from, to, damping, bidirectional);
    }

    /// Remove a link; returns the number of directed edges removed.
    pub fn remove_link(&mut self, from: SourceId, to: SourceId, bidirectional: bool) -> usize {
        self.ctx.links.remove_link(from, to, bidirectional)
    }

    /// Get the façade for a registered source.
    pub fn source(&mut self, id: SourceId) -> Result<SourceProxy<'_, T>> {
        self.ctx.sources.get(id)?;
        Ok(SourceProxy { id, session: self })
    }

    /// Send a command through the dispatcher.
    pub fn issue(&mut self, cmd: Command) -> Result<()> {
        self.dispatcher.issue(&cmd)
    }

    /// Drain and handle every message currently waiting on the transport.
    ///
    /// Per-message failures are logged and counted; they never stop the loop.
    pub fn pump(&mut self) -> PumpReport {
        let mut report = PumpReport::default();
        while let Some(envelope) = self.dispatcher.next_envelope() {
            match self.dispatcher.receive(&envelope, &mut self.ctx, &mut self.fades) {
                Ok(Disposition::Relayed) => report.relayed += 1,
                Ok(Disposition::Applied { .. }) => report.applied += 1,
                Err(e) => {
                    log::warn!(
                        "[DISPATCH] {}: dropping message from {}: {}",
                        self.local_peer(),
                        envelope.from,
                        e
                    );
                    report.dropped += 1;
                }
            }
        }
        report
    }

    /// Advance the session by one time step of `dt` seconds.
    ///
    /// Handles pending messages, then advances fades and random loops, and
    /// issues any one-shots the loops fired.
    pub fn tick(&mut self, dt: f64) -> PumpReport {
        let mut report = self.pump();

        let fired = self.fades.tick(dt, &mut self.ctx.sources);
        for cmd in fired {
            if let Err(e) = self.dispatcher.issue(&cmd) {
                log::warn!("[LOOP] {}: failed to issue one-shot for source {}: {}", self.local_peer(), cmd.source, e);
            }
        }

        report.merge(self.pump());
        report
    }
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.local_peer())
            .field("sources", &self.ctx.sources.len())
            .field("links", &self.ctx.links.edge_count())
            .field("stats", &self.dispatcher.stats())
            .finish_non_exhaustive()
    }
}

/// Façade for one audio source.
///
/// Every setter and action sends a [`Command`]; nothing changes locally until
/// that command is received back. A getter called right after a setter may
/// therefore still see the old value.
pub struct SourceProxy<'a, T: Transport> {
    id: SourceId,
    session: &'a mut Session<T>,
}

impl<T: Transport> SourceProxy<'_, T> {
    pub fn id(&self) -> SourceId {
        self.id
    }

    fn entry(&self) -> &SourceEntry {
        self.session
            .ctx
            .sources
            .get(self.id)
            .expect("source stays registered while its proxy is borrowed")
    }

    fn output(&self) -> &dyn SourceOutput {
        self.entry().output.as_ref()
    }

    fn send(&mut self, action: Action) -> Result<()> {
        self.session.issue(Command::new(self.id, action))
    }

    fn clip_id(&self, handle: ClipHandle) -> Result<ClipId> {
        self.session.ctx.clips.resolve_handle(handle)
    }

    // === Actions ===

    pub fn play(&mut self, delay_ticks: u64) -> Result<()> {
        self.send(Action::Play { delay_ticks })
    }

    pub fn play_delayed(&mut self, delay_seconds: f32) -> Result<()> {
        self.send(Action::PlayDelayed { delay_seconds })
    }

    pub fn play_scheduled(&mut self, absolute_time: f64) -> Result<()> {
        self.send(Action::PlayScheduled { absolute_time })
    }

    /// Play a clip once. Fails with `ClipNotRegistered` for unknown handles.
    pub fn play_one_shot(&mut self, clip: ClipHandle, volume_scale: f32) -> Result<()> {
        let clip = self.clip_id(clip)?;
        self.send(Action::PlayOneShot { clip, volume_scale })
    }

    pub fn pause(&mut self) -> Result<()> {
        self.send(Action::Pause)
    }

    pub fn stop(&mut self) -> Result<()> {
        self.send(Action::Stop)
    }

    pub fn unpause(&mut self) -> Result<()> {
        self.send(Action::UnPause)
    }

    /// Fade from the nominal volume to silence, then stop.
    pub fn fade_out(&mut self, duration: f32) -> Result<()> {
        self.send(Action::FadeOut { duration })
    }

    /// Fade from silence to `target_volume`, starting playback if idle.
    pub fn fade_in(&mut self, target_volume: f32, duration: f32) -> Result<()> {
        self.send(Action::FadeIn {
            target_volume,
            duration,
        })
    }

    /// Keep firing one-shots of random clips until stopped.
    ///
    /// The loop runs on this peer only; each one-shot is replicated as a
    /// normal command. Starting a second loop on the same source is an error.
    pub fn loop_random_clips(
        &mut self,
        min_interval: f32,
        max_interval: f32,
        clips: &[ClipHandle],
    ) -> Result<()> {
        let ids = clips
            .iter()
            .map(|&handle| self.clip_id(handle))
            .collect::<Result<Vec<_>>>()?;
        self.session
            .fades
            .start_random_loop(self.id, min_interval, max_interval, ids)
    }

    /// Stop the random clip loop; returns false if none was running.
    pub fn stop_random_loop(&mut self) -> bool {
        self.session.fades.stop_random_loop(self.id)
    }

    pub fn is_looping_random_clips(&self) -> bool {
        self.session.fades.is_looping(self.id)
    }

    // === Properties ===

    pub fn is_playing(&self) -> bool {
        self.output().is_playing()
    }

    pub fn is_fading(&self) -> bool {
        self.session.fades.is_fading(self.id)
    }

    /// Last explicitly set volume (not the fade-animated live value).
    pub fn nominal_volume(&self) -> f32 {
        self.entry().nominal_volume
    }

    pub fn volume(&self) -> f32 {
        self.output().volume()
    }

    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.send(Action::SetVolume { volume })
    }

    pub fn clip(&self) -> Option<ClipHandle> {
        self.output().clip()
    }

    pub fn set_clip(&mut self, clip: ClipHandle) -> Result<()> {
        let clip = self.clip_id(clip)?;
        self.send(Action::SetClip { clip })
    }

    pub fn doppler_level(&self) -> f32 {
        self.output().doppler_level()
    }

    pub fn set_doppler_level(&mut self, level: f32) -> Result<()> {
        self.send(Action::SetDopplerLevel { level })
    }

    pub fn ignore_listener_pause(&self) -> bool {
        self.output().ignore_listener_pause()
    }

    pub fn set_ignore_listener_pause(&mut self, flag: bool) -> Result<()> {
        self.send(Action::SetIgnoreListenerPause { flag })
    }

    pub fn ignore_listener_volume(&self) -> bool {
        self.output().ignore_listener_volume()
    }

    pub fn set_ignore_listener_volume(&mut self, flag: bool) -> Result<()> {
        self.send(Action::SetIgnoreListenerVolume { flag })
    }

    pub fn looping(&self) -> bool {
        self.output().looping()
    }

    pub fn set_looping(&mut self, flag: bool) -> Result<()> {
        self.send(Action::SetLoop { flag })
    }

    pub fn pitch(&self) -> f32 {
        self.output().pitch()
    }

    pub fn set_pitch(&mut self, pitch: f32) -> Result<()> {
        self.send(Action::SetPitch { pitch })
    }

    pub fn time(&self) -> f32 {
        self.output().time()
    }

    pub fn set_time(&mut self, seconds: f32) -> Result<()> {
        self.send(Action::SetTime { seconds })
    }

    pub fn time_samples(&self) -> i32 {
        self.output().time_samples()
    }

    pub fn set_time_samples(&mut self, samples: i32) -> Result<()> {
        self.send(Action::SetTimeSamples { samples })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::source::{OutputEvent, PlayState, SimulatedOutput};
    use crate::transport::{LoopbackEndpoint, LoopbackHub};
    use crate::wire;

    const A: SourceId = SourceId(1);
    const B: SourceId = SourceId(2);
    const DOOR: SourceId = SourceId(7);

    struct Peer {
        session: Session<LoopbackEndpoint>,
        outputs: Vec<(SourceId, SimulatedOutput)>,
    }

    impl Peer {
        fn output(&self, id: SourceId) -> &SimulatedOutput {
            &self.outputs.iter().find(|(i, _)| *i == id).unwrap().1
        }
    }

    /// Peers with identical catalogs and sources; peer 0 is authoritative.
    fn network(peers: usize, sources: &[SourceId]) -> (LoopbackHub, Vec<Peer>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let hub = LoopbackHub::new();
        let peers = (0..peers)
            .map(|i| {
                // Handles differ per peer; ids must still agree
                let base = 100 * i as u64;
                let clips = ClipRegistry::build(vec![
                    ("slam", ClipHandle(base + 1)),
                    ("creak", ClipHandle(base + 2)),
                ])
                .unwrap();
                let mut session = Session::new(
                    Arc::new(clips),
                    hub.join(),
                    SessionOptions { seed: Some(9) },
                );
                let mut outputs = Vec::new();
                for &id in sources {
                    let output = SimulatedOutput::new();
                    session.spawn_source(id, Box::new(output.clone())).unwrap();
                    outputs.push((id, output));
                }
                Peer { session, outputs }
            })
            .collect();
        (hub, peers)
    }

    /// Pump every peer until the network is quiet.
    fn settle(peers: &mut [Peer]) {
        for _ in 0..8 {
            let mut handled = 0;
            for peer in peers.iter_mut() {
                handled += peer.session.pump().total();
            }
            if handled == 0 {
                return;
            }
        }
        panic!("network did not settle");
    }

    fn one_shots(output: &SimulatedOutput) -> Vec<OutputEvent> {
        output
            .journal()
            .into_iter()
            .filter(|e| matches!(e, OutputEvent::PlayOneShot { .. }))
            .collect()
    }

    #[test]
    fn test_client_one_shot_applies_once_everywhere() {
        let (_hub, mut peers) = network(2, &[DOOR]);
        assert!(peers[0].session.is_authoritative());

        let slam = peers[1].session.clips().by_name("slam").unwrap().handle;
        peers[1]
            .session
            .source(DOOR)
            .unwrap()
            .play_one_shot(slam, 0.5)
            .unwrap();

        // Nothing applied before the round trip
        assert!(peers[1].output(DOOR).journal().is_empty());
        settle(&mut peers);

        for (i, peer) in peers.iter().enumerate() {
            let expected_handle = ClipHandle(100 * i as u64 + 1);
            assert_eq!(
                one_shots(peer.output(DOOR)),
                vec![OutputEvent::PlayOneShot {
                    clip: expected_handle,
                    volume_scale: 0.5 * 1.0
                }]
            );
        }
        let stats = peers[0].session.dispatcher().stats();
        assert_eq!(stats.relayed, 1);
    }

    #[test]
    fn test_authority_command_applies_once_without_loop() {
        let (_hub, mut peers) = network(3, &[A]);
        peers[0].session.source(A).unwrap().set_pitch(2.0).unwrap();
        settle(&mut peers);

        for peer in &peers {
            assert_eq!(peer.output(A).pitch(), 2.0);
            assert_eq!(peer.session.dispatcher().stats().applied, 1);
        }
        assert_eq!(peers[0].session.dispatcher().stats().relayed, 0);
    }

    #[test]
    fn test_getter_sees_old_value_until_round_trip() {
        let (_hub, mut peers) = network(2, &[A]);
        {
            let mut source = peers[1].session.source(A).unwrap();
            source.set_volume(0.4).unwrap();
            assert_eq!(source.volume(), 1.0);
        }
        settle(&mut peers);
        let source = peers[1].session.source(A).unwrap();
        assert!((source.volume() - 0.4).abs() < 1e-6);
        assert!((source.nominal_volume() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_linked_play_starts_at_damped_volume() {
        let (_hub, mut peers) = network(2, &[A, B]);
        for peer in peers.iter_mut() {
            peer.session.add_link(A, B, 0.3, true);
        }

        {
            let mut source = peers[1].session.source(A).unwrap();
            source.set_volume(0.9).unwrap();
            source.play(0).unwrap();
        }
        settle(&mut peers);

        for peer in &peers {
            let b_state = peer.output(B).snapshot();
            assert_eq!(b_state.play_state, PlayState::Playing);
            assert!((b_state.volume - 0.27).abs() < 1e-6);
            assert!((peer.session.context().sources.nominal_volume(A).unwrap() - 0.9).abs() < 1e-6);
            assert!((peer.session.context().sources.nominal_volume(B).unwrap() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_fade_out_over_ticks() {
        let (_hub, mut peers) = network(2, &[A]);
        {
            let mut source = peers[0].session.source(A).unwrap();
            source.set_volume(0.8).unwrap();
            source.play(0).unwrap();
            source.fade_out(2.0).unwrap();
        }
        settle(&mut peers);
        assert!(peers.iter().all(|p| p.session.fades().is_fading(A)));

        let dt = 0.05;
        for _ in 0..45 {
            for peer in peers.iter_mut() {
                peer.session.tick(dt);
            }
        }

        for peer in &peers {
            let state = peer.output(A).snapshot();
            assert_eq!(state.play_state, PlayState::Stopped);
            assert!((state.volume - 0.8).abs() < 1e-6);
            assert!(state.volume_history.iter().all(|v| *v >= 0.0));
            assert!((peer.session.context().sources.nominal_volume(A).unwrap() - 0.8).abs() < 1e-6);
        }
    }

    #[test]
    fn test_malformed_message_does_not_block_later_ones() {
        let (_hub, mut peers) = network(2, &[A]);
        let garbage = vec![1, 0, 0, 0, 15, 0, 0];
        peers[1]
            .session
            .dispatcher
            .transport_mut()
            .send_to_authority(&garbage)
            .unwrap();
        peers[1].session.source(A).unwrap().set_looping(true).unwrap();

        let report = peers[0].session.pump();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.relayed, 1);
        settle(&mut peers);
        assert!(peers.iter().all(|p| p.output(A).looping()));
    }

    #[test]
    fn test_unknown_source_is_dropped_with_others_unaffected() {
        let (_hub, mut peers) = network(2, &[A]);
        let stray = wire::encode(&Command::new(SourceId(99), Action::Stop)).unwrap();
        peers[0]
            .session
            .dispatcher
            .transport_mut()
            .send_to_all(&stray)
            .unwrap();
        peers[0].session.source(A).unwrap().set_pitch(0.5).unwrap();

        let report = peers[1].session.pump();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(peers[1].output(A).pitch(), 0.5);
    }

    #[test]
    fn test_random_loop_replicates_one_shots() {
        let (_hub, mut peers) = network(2, &[A]);
        let clips: Vec<ClipHandle> = peers[1].session.clips().iter().map(|e| e.handle).collect();
        peers[1]
            .session
            .source(A)
            .unwrap()
            .loop_random_clips(0.5, 0.5, &clips)
            .unwrap();
        assert!(matches!(
            peers[1].session.source(A).unwrap().loop_random_clips(0.5, 0.5, &clips),
            Err(Error::RandomLoopActive(A))
        ));

        for _ in 0..10 {
            for peer in peers.iter_mut() {
                peer.session.tick(0.1);
            }
        }
        settle(&mut peers);

        let fired = one_shots(peers[1].output(A)).len();
        assert!(fired >= 2);
        assert_eq!(one_shots(peers[0].output(A)).len(), fired);
        // The loop only runs on the peer that started it
        assert!(!peers[0].session.fades().is_looping(A));

        assert!(peers[1].session.source(A).unwrap().stop_random_loop());
        for peer in peers.iter_mut() {
            peer.session.tick(1.0);
        }
        settle(&mut peers);
        assert_eq!(one_shots(peers[0].output(A)).len(), fired);
    }

    #[test]
    fn test_unregistered_clip_handle_is_rejected_locally() {
        let (_hub, mut peers) = network(2, &[A]);
        assert!(matches!(
            peers[1].session.source(A).unwrap().play_one_shot(ClipHandle(5000), 1.0),
            Err(Error::ClipNotRegistered(ClipHandle(5000)))
        ));
        assert!(matches!(
            peers[1].session.source(SourceId(42)),
            Err(Error::UnknownSource(SourceId(42)))
        ));
    }

    #[test]
    fn test_despawn_clears_links_and_tasks() {
        let (_hub, mut peers) = network(1, &[A, B]);
        let session = &mut peers[0].session;
        session.add_link(A, B, 0.5, true);
        let clips: Vec<ClipHandle> = session.clips().iter().map(|e| e.handle).collect();
        session.source(B).unwrap().loop_random_clips(1.0, 2.0, &clips).unwrap();

        session.despawn_source(B).unwrap();
        assert_eq!(session.context().links.edge_count(), 0);
        assert!(!session.fades().is_looping(B));
        assert!(session.despawn_source(B).is_err());

        session.source(A).unwrap().stop().unwrap();
        let report = session.pump();
        assert_eq!(report.applied, 1);
    }
}
