//! Replicated playback commands.
//!
//! Every mutation of an audio source is expressed as a [`Command`]: the
//! originating [`SourceId`] plus one [`Action`] variant. Commands are plain
//! values and carry no session or network state.

use crate::clip::ClipId;
use std::fmt;

/// Identifier of a networked audio source, assigned by the embedding entity system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub u32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Playback operations that can be replicated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Action {
    /// Pause playback.
    Pause,
    /// Stop playback.
    Stop,
    /// Resume paused playback.
    UnPause,
    /// Play the current clip after a delay in output ticks.
    Play { delay_ticks: u64 },
    /// Play the current clip after a delay in seconds.
    PlayDelayed { delay_seconds: f32 },
    /// Play the current clip at an absolute engine time.
    PlayScheduled { absolute_time: f64 },
    /// Fire-and-forget playback of a clip.
    PlayOneShot { clip: ClipId, volume_scale: f32 },
    /// Set the volume (also the source's nominal volume).
    SetVolume { volume: f32 },
    /// Fade out from the nominal volume and stop.
    FadeOut { duration: f32 },
    /// Fade in from silence to a target volume.
    FadeIn { target_volume: f32, duration: f32 },
    /// Change the current clip.
    SetClip { clip: ClipId },
    /// Set the doppler level.
    SetDopplerLevel { level: f32 },
    /// Set whether the source ignores listener pause.
    SetIgnoreListenerPause { flag: bool },
    /// Set whether the source ignores listener volume.
    SetIgnoreListenerVolume { flag: bool },
    /// Set whether the current clip loops.
    SetLoop { flag: bool },
    /// Set the pitch.
    SetPitch { pitch: f32 },
    /// Seek to a playback position in seconds.
    SetTime { seconds: f32 },
    /// Seek to a playback position in samples.
    SetTimeSamples { samples: i32 },
}

/// Discriminant of an [`Action`], as written to the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ActionKind {
    Pause = 0,
    Stop = 1,
    UnPause = 2,
    Play = 3,
    PlayDelayed = 4,
    PlayScheduled = 5,
    PlayOneShot = 6,
    SetVolume = 7,
    FadeOut = 8,
    FadeIn = 9,
    SetClip = 10,
    SetDopplerLevel = 11,
    SetIgnoreListenerPause = 12,
    SetIgnoreListenerVolume = 13,
    SetLoop = 14,
    SetPitch = 15,
    SetTime = 16,
    SetTimeSamples = 17,
}

impl ActionKind {
    /// All kinds in wire order.
    pub const ALL: [ActionKind; 18] = [
        ActionKind::Pause,
        ActionKind::Stop,
        ActionKind::UnPause,
        ActionKind::Play,
        ActionKind::PlayDelayed,
        ActionKind::PlayScheduled,
        ActionKind::PlayOneShot,
        ActionKind::SetVolume,
        ActionKind::FadeOut,
        ActionKind::FadeIn,
        ActionKind::SetClip,
        ActionKind::SetDopplerLevel,
        ActionKind::SetIgnoreListenerPause,
        ActionKind::SetIgnoreListenerVolume,
        ActionKind::SetLoop,
        ActionKind::SetPitch,
        ActionKind::SetTime,
        ActionKind::SetTimeSamples,
    ];

    /// Parse a wire tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Self::ALL.get(usize::from(tag)).copied()
    }

    /// Wire tag for this kind.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Exact payload length in bytes.
    pub fn payload_len(self) -> usize {
        match self {
            ActionKind::Pause | ActionKind::Stop | ActionKind::UnPause => 0,
            ActionKind::Play | ActionKind::PlayScheduled => 8,
            ActionKind::PlayOneShot | ActionKind::FadeIn => 8,
            ActionKind::PlayDelayed
            | ActionKind::SetVolume
            | ActionKind::FadeOut
            | ActionKind::SetClip
            | ActionKind::SetDopplerLevel
            | ActionKind::SetPitch
            | ActionKind::SetTime
            | ActionKind::SetTimeSamples => 4,
            ActionKind::SetIgnoreListenerPause
            | ActionKind::SetIgnoreListenerVolume
            | ActionKind::SetLoop => 1,
        }
    }

    /// Whether the action carries or implies a volume that is damped along links.
    pub fn is_volume_bearing(self) -> bool {
        matches!(
            self,
            ActionKind::Play
                | ActionKind::PlayDelayed
                | ActionKind::PlayScheduled
                | ActionKind::PlayOneShot
                | ActionKind::SetVolume
                | ActionKind::FadeOut
                | ActionKind::FadeIn
        )
    }
}

impl Action {
    /// The wire discriminant of this action.
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Pause => ActionKind::Pause,
            Action::Stop => ActionKind::Stop,
            Action::UnPause => ActionKind::UnPause,
            Action::Play { .. } => ActionKind::Play,
            Action::PlayDelayed { .. } => ActionKind::PlayDelayed,
            Action::PlayScheduled { .. } => ActionKind::PlayScheduled,
            Action::PlayOneShot { .. } => ActionKind::PlayOneShot,
            Action::SetVolume { .. } => ActionKind::SetVolume,
            Action::FadeOut { .. } => ActionKind::FadeOut,
            Action::FadeIn { .. } => ActionKind::FadeIn,
            Action::SetClip { .. } => ActionKind::SetClip,
            Action::SetDopplerLevel { .. } => ActionKind::SetDopplerLevel,
            Action::SetIgnoreListenerPause { .. } => ActionKind::SetIgnoreListenerPause,
            Action::SetIgnoreListenerVolume { .. } => ActionKind::SetIgnoreListenerVolume,
            Action::SetLoop { .. } => ActionKind::SetLoop,
            Action::SetPitch { .. } => ActionKind::SetPitch,
            Action::SetTime { .. } => ActionKind::SetTime,
            Action::SetTimeSamples { .. } => ActionKind::SetTimeSamples,
        }
    }
}

/// A playback action issued for one source.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Command {
    /// Source the command originates from (root of the link fan-out).
    pub source: SourceId,
    /// The operation.
    pub action: Action,
}

impl Command {
    /// Create a command for a source.
    pub fn new(source: SourceId, action: Action) -> Self {
        Self { source, action }
    }

    /// Shorthand for the action's kind.
    pub fn kind(&self) -> ActionKind {
        self.action.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_dense() {
        for (idx, kind) in ActionKind::ALL.iter().enumerate() {
            assert_eq!(kind.as_u8() as usize, idx);
            assert_eq!(ActionKind::from_u8(idx as u8), Some(*kind));
        }
        assert_eq!(ActionKind::from_u8(18), None);
        assert_eq!(ActionKind::from_u8(0xff), None);
    }

    #[test]
    fn test_volume_bearing_kinds() {
        assert!(ActionKind::SetVolume.is_volume_bearing());
        assert!(ActionKind::FadeOut.is_volume_bearing());
        assert!(!ActionKind::SetPitch.is_volume_bearing());
        assert!(!ActionKind::Stop.is_volume_bearing());
    }

    #[test]
    fn test_command_kind() {
        let cmd = Command::new(SourceId(7), Action::SetLoop { flag: true });
        assert_eq!(cmd.kind(), ActionKind::SetLoop);
        assert_eq!(cmd.source, SourceId(7));
    }
}
