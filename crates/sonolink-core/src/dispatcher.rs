//! Command relay and application.
//!
//! The dispatcher implements the replication rules:
//!
//! - A locally issued command is never applied directly. It is sent to every
//!   peer (including this one) when this peer is authoritative, otherwise to
//!   the authoritative peer only.
//! - The authoritative peer relays, verbatim, every message that did not come
//!   from itself, and does not apply it on that receive. The relayed copy
//!   comes back to it like to everyone else and is applied then.
//! - Every other received message is applied: once to the source and once to
//!   each source it links to, with volume-bearing effects damped per edge.
//!
//! Together this gives exactly one application per peer per issued command,
//! with no message relayed more than once.

use crate::clip::ClipHandle;
use crate::command::{Action, Command, SourceId};
use crate::error::Result;
use crate::fade::FadeScheduler;
use crate::session::Context;
use crate::source::SourceOutput;
use crate::transport::{Envelope, Transport};
use crate::wire;

/// What happened to a received message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Rebroadcast to all peers without applying.
    Relayed,
    /// Applied locally to this many sources.
    Applied { targets: usize },
}

/// Counters kept by the dispatcher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub issued: u64,
    pub relayed: u64,
    pub applied: u64,
    pub dropped: u64,
}

/// Relay/apply core sitting on top of a [`Transport`].
pub struct CommandDispatcher<T: Transport> {
    transport: T,
    stats: DispatchStats,
}

impl<T: Transport> CommandDispatcher<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            stats: DispatchStats::default(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Send a locally issued command.
    pub fn issue(&mut self, cmd: &Command) -> Result<()> {
        let bytes = wire::encode(cmd)?;
        if self.transport.is_authoritative() {
            log::debug!("[DISPATCH] Issuing {:?} for source {} to all peers", cmd.kind(), cmd.source);
            self.transport.send_to_all(&bytes)?;
        } else {
            log::debug!("[DISPATCH] Issuing {:?} for source {} to authority", cmd.kind(), cmd.source);
            self.transport.send_to_authority(&bytes)?;
        }
        self.stats.issued += 1;
        Ok(())
    }

    /// Take the next message from the transport.
    pub fn next_envelope(&mut self) -> Option<Envelope> {
        self.transport.try_recv()
    }

    /// Handle one received message: relay it or apply it.
    ///
    /// Any error leaves local state untouched for this message and is counted
    /// as a drop; the caller is expected to log it and carry on.
    pub fn receive(
        &mut self,
        envelope: &Envelope,
        ctx: &mut Context,
        fades: &mut FadeScheduler,
    ) -> Result<Disposition> {
        let result = self.route(envelope, ctx, fades);
        match result {
            Ok(Disposition::Relayed) => self.stats.relayed += 1,
            Ok(Disposition::Applied { .. }) => self.stats.applied += 1,
            Err(_) => self.stats.dropped += 1,
        }
        result
    }

    fn route(
        &mut self,
        envelope: &Envelope,
        ctx: &mut Context,
        fades: &mut FadeScheduler,
    ) -> Result<Disposition> {
        let cmd = wire::decode(&envelope.payload)?;

        if self.transport.is_authoritative() && envelope.from != self.transport.local_peer() {
            log::debug!(
                "[RELAY] {:?} for source {} from {}, rebroadcasting",
                cmd.kind(),
                cmd.source,
                envelope.from
            );
            self.transport.send_to_all(&envelope.payload)?;
            return Ok(Disposition::Relayed);
        }

        let targets = apply(ctx, fades, &cmd)?;
        Ok(Disposition::Applied { targets })
    }
}

/// Apply a command to its source and every linked source.
///
/// Fails without side effects if the source is not registered or a clip id
/// is unknown. Linked targets missing from the registry are skipped.
/// Returns the number of sources the command was applied to.
pub fn apply(ctx: &mut Context, fades: &mut FadeScheduler, cmd: &Command) -> Result<usize> {
    let root = cmd.source;
    let mut nominal = ctx.sources.nominal_volume(root)?;

    let clip = match cmd.action {
        Action::PlayOneShot { clip, .. } | Action::SetClip { clip } => {
            Some(ctx.clips.resolve_id(clip)?)
        }
        _ => None,
    };

    if let Action::SetVolume { volume } = cmd.action {
        ctx.sources.get_mut(root)?.nominal_volume = volume;
        nominal = volume;
    }

    let mut applied = 0;
    for link in ctx.links.fan_out(root) {
        let entry = match ctx.sources.get_mut(link.to) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("[DISPATCH] Skipping linked target of source {}: {}", root, e);
                continue;
            }
        };
        let view = DampedView {
            damping: link.damping,
            nominal,
            clip,
        };
        apply_view(entry.output.as_mut(), fades, link.to, &cmd.action, view);
        applied += 1;
    }

    log::debug!(
        "[DISPATCH] Applied {:?} from source {} to {} source(s)",
        cmd.kind(),
        root,
        applied
    );
    Ok(applied)
}

/// Per-edge parameters for applying an action to one target.
#[derive(Clone, Copy, Debug)]
struct DampedView {
    damping: f32,
    /// Nominal volume of the originating source.
    nominal: f32,
    /// Resolved clip for clip-bearing actions.
    clip: Option<ClipHandle>,
}

impl DampedView {
    fn baseline(&self) -> f32 {
        self.damping * self.nominal
    }
}

fn apply_view(
    output: &mut dyn SourceOutput,
    fades: &mut FadeScheduler,
    target: SourceId,
    action: &Action,
    view: DampedView,
) {
    match *action {
        Action::Pause => output.pause(),
        Action::Stop => {
            fades.cancel_fade(target);
            output.stop();
        }
        // Resumes from the paused position; never restarts or stops.
        Action::UnPause => output.unpause(),
        Action::Play { delay_ticks } => {
            fades.cancel_fade(target);
            output.set_volume(view.baseline());
            output.play(delay_ticks);
        }
        Action::PlayDelayed { delay_seconds } => {
            fades.cancel_fade(target);
            output.set_volume(view.baseline());
            output.play_delayed(delay_seconds);
        }
        Action::PlayScheduled { absolute_time } => {
            fades.cancel_fade(target);
            output.set_volume(view.baseline());
            output.play_scheduled(absolute_time);
        }
        Action::PlayOneShot { volume_scale, .. } => {
            if let Some(clip) = view.clip {
                output.play_one_shot(clip, volume_scale * view.baseline());
            }
        }
        Action::SetVolume { volume } => {
            fades.cancel_fade(target);
            output.set_volume(view.damping * volume);
        }
        Action::FadeOut { duration } => {
            fades.fade_out(target, output, duration, view.baseline());
        }
        Action::FadeIn {
            target_volume,
            duration,
        } => {
            if !output.is_playing() {
                output.set_volume(0.0);
                output.play(0);
            }
            fades.fade_in(target, output, view.damping * target_volume, duration, 0.0);
        }
        Action::SetClip { .. } => output.set_clip(view.clip),
        Action::SetDopplerLevel { level } => output.set_doppler_level(level),
        Action::SetIgnoreListenerPause { flag } => output.set_ignore_listener_pause(flag),
        Action::SetIgnoreListenerVolume { flag } => output.set_ignore_listener_volume(flag),
        Action::SetLoop { flag } => output.set_looping(flag),
        Action::SetPitch { pitch } => output.set_pitch(pitch),
        Action::SetTime { seconds } => output.set_time(seconds),
        Action::SetTimeSamples { samples } => output.set_time_samples(samples),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{ClipId, ClipRegistry};
    use crate::error::Error;
    use crate::source::{OutputEvent, PlayState, SimulatedOutput};
    use crate::transport::LoopbackHub;
    use std::sync::Arc;

    const A: SourceId = SourceId(1);
    const B: SourceId = SourceId(2);
    const C: SourceId = SourceId(3);

    struct Fixture {
        ctx: Context,
        fades: FadeScheduler,
        outputs: Vec<(SourceId, SimulatedOutput)>,
    }

    impl Fixture {
        fn new(ids: &[SourceId]) -> Self {
            let clips = ClipRegistry::build(vec![
                ("slam", ClipHandle(1)),
                ("creak", ClipHandle(2)),
            ])
            .unwrap();
            let mut ctx = Context::new(Arc::new(clips));
            let mut outputs = Vec::new();
            for &id in ids {
                let output = SimulatedOutput::new();
                ctx.sources.insert(id, Box::new(output.clone())).unwrap();
                outputs.push((id, output));
            }
            Self {
                ctx,
                fades: FadeScheduler::with_seed(3),
                outputs,
            }
        }

        fn output(&self, id: SourceId) -> &SimulatedOutput {
            &self.outputs.iter().find(|(i, _)| *i == id).unwrap().1
        }

        fn apply(&mut self, source: SourceId, action: Action) -> Result<usize> {
            apply(&mut self.ctx, &mut self.fades, &Command::new(source, action))
        }
    }

    #[test]
    fn test_set_volume_damps_linked_targets() {
        let mut fx = Fixture::new(&[A, B, C]);
        fx.ctx.links.add_link(A, B, 0.3, true);

        assert_eq!(fx.apply(A, Action::SetVolume { volume: 0.9 }).unwrap(), 2);
        assert!((fx.output(A).volume() - 0.9).abs() < 1e-6);
        assert!((fx.output(B).volume() - 0.27).abs() < 1e-6);
        // Unlinked source untouched
        assert!((fx.output(C).volume() - 1.0).abs() < 1e-6);

        // Only the originating source's nominal volume changes
        assert!((fx.ctx.sources.nominal_volume(A).unwrap() - 0.9).abs() < 1e-6);
        assert!((fx.ctx.sources.nominal_volume(B).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_play_starts_linked_target_at_damped_nominal() {
        let mut fx = Fixture::new(&[A, B]);
        fx.ctx.links.add_link(A, B, 0.3, true);
        fx.apply(A, Action::SetVolume { volume: 0.9 }).unwrap();
        fx.apply(A, Action::Play { delay_ticks: 0 }).unwrap();

        assert_eq!(
            fx.output(B).journal(),
            vec![OutputEvent::Play {
                delay_ticks: 0,
                volume: 0.3 * 0.9
            }]
        );
        assert_eq!(
            fx.output(A).journal(),
            vec![OutputEvent::Play {
                delay_ticks: 0,
                volume: 0.9
            }]
        );
    }

    #[test]
    fn test_non_volume_actions_are_undamped() {
        let mut fx = Fixture::new(&[A, B]);
        fx.ctx.links.add_link(A, B, 0.1, false);
        fx.apply(A, Action::SetPitch { pitch: 1.5 }).unwrap();
        fx.apply(A, Action::SetLoop { flag: true }).unwrap();
        fx.apply(A, Action::SetClip { clip: ClipId::from_name("creak") }).unwrap();

        for id in [A, B] {
            let state = fx.output(id).snapshot();
            assert_eq!(state.pitch, 1.5);
            assert!(state.looping);
            assert_eq!(state.clip, Some(ClipHandle(2)));
        }
    }

    #[test]
    fn test_play_one_shot_scales_by_damped_nominal() {
        let mut fx = Fixture::new(&[A, B]);
        fx.ctx.links.add_link(A, B, 0.5, false);
        fx.apply(A, Action::SetVolume { volume: 0.8 }).unwrap();
        fx.apply(
            A,
            Action::PlayOneShot {
                clip: ClipId::from_name("slam"),
                volume_scale: 0.5,
            },
        )
        .unwrap();

        let last = |id| fx.output(id).journal().last().cloned().unwrap();
        assert_eq!(
            last(A),
            OutputEvent::PlayOneShot {
                clip: ClipHandle(1),
                volume_scale: 0.5 * 0.8
            }
        );
        assert_eq!(
            last(B),
            OutputEvent::PlayOneShot {
                clip: ClipHandle(1),
                volume_scale: 0.5 * 0.5 * 0.8
            }
        );
    }

    #[test]
    fn test_unknown_clip_drops_whole_command() {
        let mut fx = Fixture::new(&[A, B]);
        fx.ctx.links.add_link(A, B, 0.5, false);
        let result = fx.apply(
            A,
            Action::PlayOneShot {
                clip: ClipId::from_name("missing"),
                volume_scale: 1.0,
            },
        );
        assert!(matches!(result, Err(Error::UnknownClip(_))));
        assert!(fx.output(A).journal().is_empty());
        assert!(fx.output(B).journal().is_empty());
    }

    #[test]
    fn test_unknown_source_is_dropped() {
        let mut fx = Fixture::new(&[A]);
        assert!(matches!(
            fx.apply(C, Action::Stop),
            Err(Error::UnknownSource(C))
        ));
    }

    #[test]
    fn test_missing_linked_target_is_skipped() {
        let mut fx = Fixture::new(&[A, B]);
        fx.ctx.links.add_link(A, C, 0.5, false);
        fx.ctx.links.add_link(A, B, 0.5, false);
        assert_eq!(fx.apply(A, Action::Pause).unwrap(), 2);
    }

    #[test]
    fn test_fade_out_uses_damped_baseline() {
        let mut fx = Fixture::new(&[A, B]);
        fx.ctx.links.add_link(A, B, 0.5, false);
        fx.apply(A, Action::SetVolume { volume: 0.8 }).unwrap();
        fx.apply(A, Action::Play { delay_ticks: 0 }).unwrap();
        fx.apply(A, Action::FadeOut { duration: 1.0 }).unwrap();

        assert!((fx.fades.fade(A).unwrap().start_volume - 0.8).abs() < 1e-6);
        assert!((fx.fades.fade(B).unwrap().start_volume - 0.4).abs() < 1e-6);

        for _ in 0..20 {
            fx.fades.tick(0.1, &mut fx.ctx.sources);
        }
        assert_eq!(fx.output(A).play_state(), PlayState::Stopped);
        assert_eq!(fx.output(B).play_state(), PlayState::Stopped);
        assert!((fx.output(A).volume() - 0.8).abs() < 1e-6);
        assert!((fx.output(B).volume() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_fade_in_starts_playback_from_silence() {
        let mut fx = Fixture::new(&[A]);
        fx.apply(
            A,
            Action::FadeIn {
                target_volume: 0.6,
                duration: 1.0,
            },
        )
        .unwrap();
        assert_eq!(fx.output(A).play_state(), PlayState::Playing);
        assert_eq!(fx.output(A).volume(), 0.0);
        fx.fades.tick(0.5, &mut fx.ctx.sources);
        assert!((fx.output(A).volume() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_fade_in_on_linked_target_ends_at_damped_target() {
        let mut fx = Fixture::new(&[A, B]);
        fx.ctx.links.add_link(A, B, 0.5, false);
        fx.apply(
            A,
            Action::FadeIn {
                target_volume: 0.6,
                duration: 1.0,
            },
        )
        .unwrap();
        assert_eq!(fx.output(B).play_state(), PlayState::Playing);
        assert_eq!(fx.output(B).volume(), 0.0);
        assert!((fx.fades.fade(B).unwrap().target_volume - 0.3).abs() < 1e-6);

        fx.fades.tick(0.5, &mut fx.ctx.sources);
        assert!((fx.output(B).volume() - 0.15).abs() < 1e-6);
        for _ in 0..3 {
            fx.fades.tick(0.5, &mut fx.ctx.sources);
        }
        assert!(!fx.fades.is_fading(B));
        assert!((fx.output(A).volume() - 0.6).abs() < 1e-6);
        assert!((fx.output(B).volume() - 0.3).abs() < 1e-6);
        assert_eq!(fx.output(B).play_state(), PlayState::Playing);
    }

    #[test]
    fn test_delayed_and_scheduled_play_start_at_damped_nominal() {
        let mut fx = Fixture::new(&[A, B]);
        fx.ctx.links.add_link(A, B, 0.5, false);
        fx.apply(A, Action::SetVolume { volume: 0.8 }).unwrap();
        fx.apply(A, Action::PlayDelayed { delay_seconds: 0.25 }).unwrap();
        fx.apply(A, Action::PlayScheduled { absolute_time: 12.5 }).unwrap();

        let journal = fx.output(B).journal();
        assert_eq!(journal.len(), 2);
        match journal[0] {
            OutputEvent::PlayDelayed {
                delay_seconds,
                volume,
            } => {
                assert_eq!(delay_seconds, 0.25);
                assert!((volume - 0.4).abs() < 1e-6);
            }
            ref other => panic!("unexpected event {:?}", other),
        }
        match journal[1] {
            OutputEvent::PlayScheduled {
                absolute_time,
                volume,
            } => {
                assert_eq!(absolute_time, 12.5);
                assert!((volume - 0.4).abs() < 1e-6);
            }
            ref other => panic!("unexpected event {:?}", other),
        }

        // The commanded source itself plays at its own nominal volume
        match fx.output(A).journal()[0] {
            OutputEvent::PlayDelayed { volume, .. } => assert!((volume - 0.8).abs() < 1e-6),
            ref other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_set_volume_and_play_cancel_linked_fades() {
        let mut fx = Fixture::new(&[A, B]);
        fx.ctx.links.add_link(A, B, 0.5, false);
        fx.apply(A, Action::Play { delay_ticks: 0 }).unwrap();

        fx.apply(A, Action::FadeOut { duration: 1.0 }).unwrap();
        assert!(fx.fades.is_fading(B));
        fx.apply(A, Action::SetVolume { volume: 0.4 }).unwrap();
        assert!(!fx.fades.is_fading(A));
        assert!(!fx.fades.is_fading(B));
        for _ in 0..15 {
            fx.fades.tick(0.1, &mut fx.ctx.sources);
        }
        // The cancelled fade-out neither stops playback nor moves the volume
        assert_eq!(fx.output(B).play_state(), PlayState::Playing);
        assert!((fx.output(B).volume() - 0.2).abs() < 1e-6);

        for play in [
            Action::Play { delay_ticks: 2 },
            Action::PlayDelayed { delay_seconds: 0.5 },
            Action::PlayScheduled { absolute_time: 3.0 },
        ] {
            fx.apply(A, Action::FadeOut { duration: 1.0 }).unwrap();
            assert!(fx.fades.is_fading(B));
            fx.apply(A, play).unwrap();
            assert!(!fx.fades.is_fading(B), "{:?} left the fade running", play);
            assert!((fx.output(B).volume() - 0.2).abs() < 1e-6);
        }
    }

    #[test]
    fn test_stop_cancels_fade() {
        let mut fx = Fixture::new(&[A]);
        fx.apply(A, Action::Play { delay_ticks: 0 }).unwrap();
        fx.apply(
            A,
            Action::FadeIn {
                target_volume: 1.0,
                duration: 2.0,
            },
        )
        .unwrap();
        fx.apply(A, Action::Stop).unwrap();
        assert!(!fx.fades.is_fading(A));
    }

    #[test]
    fn test_unpause_resumes() {
        let mut fx = Fixture::new(&[A]);
        fx.apply(A, Action::Play { delay_ticks: 0 }).unwrap();
        fx.apply(A, Action::Pause).unwrap();
        fx.apply(A, Action::UnPause).unwrap();
        assert_eq!(fx.output(A).play_state(), PlayState::Playing);
        assert!(!fx.output(A).journal().contains(&OutputEvent::Stop));
    }

    #[test]
    fn test_authority_relays_foreign_messages() {
        let hub = LoopbackHub::new();
        let authority = hub.join();
        let mut client = hub.join();
        let mut fx = Fixture::new(&[A]);
        let mut dispatcher = CommandDispatcher::new(authority);

        let bytes = wire::encode(&Command::new(A, Action::Stop)).unwrap();
        let foreign = Envelope {
            from: client.local_peer(),
            payload: bytes.clone(),
        };
        let disposition = dispatcher.receive(&foreign, &mut fx.ctx, &mut fx.fades).unwrap();
        assert_eq!(disposition, Disposition::Relayed);
        assert!(fx.output(A).journal().is_empty());

        // The relayed copy reaches everyone, the authority included
        assert_eq!(client.try_recv().unwrap().payload, bytes);
        let own = dispatcher.next_envelope().unwrap();
        assert_eq!(own.from, dispatcher.transport().local_peer());
        let disposition = dispatcher.receive(&own, &mut fx.ctx, &mut fx.fades).unwrap();
        assert_eq!(disposition, Disposition::Applied { targets: 1 });
        assert_eq!(fx.output(A).journal(), vec![OutputEvent::Stop]);

        let stats = dispatcher.stats();
        assert_eq!((stats.relayed, stats.applied, stats.dropped), (1, 1, 0));
    }

    #[test]
    fn test_malformed_message_counts_as_drop() {
        let hub = LoopbackHub::new();
        let mut fx = Fixture::new(&[A]);
        let mut dispatcher = CommandDispatcher::new(hub.join());
        let envelope = Envelope {
            from: dispatcher.transport().local_peer(),
            payload: vec![1, 0, 0, 0, 7, 0],
        };
        assert!(matches!(
            dispatcher.receive(&envelope, &mut fx.ctx, &mut fx.fades),
            Err(Error::MalformedCommand(_))
        ));
        assert_eq!(dispatcher.stats().dropped, 1);
    }
}
