//! Binary wire format for [`Command`]s.
//!
//! Layout (all multi-byte values little-endian):
//!
//! ```text
//! source id (u32) | kind (u8) | payload (fixed length per kind)
//! ```
//!
//! | kind                    | payload                          |
//! |-------------------------|----------------------------------|
//! | Pause, Stop, UnPause    | empty                            |
//! | Play                    | u64 delay ticks                  |
//! | PlayDelayed             | f32 delay seconds                |
//! | PlayScheduled           | f64 absolute time                |
//! | PlayOneShot             | u32 clip id, f32 volume scale    |
//! | SetVolume               | f32 volume                       |
//! | FadeOut                 | f32 duration                     |
//! | FadeIn                  | f32 target volume, f32 duration  |
//! | SetClip                 | u32 clip id                      |
//! | SetDopplerLevel         | f32 level                        |
//! | SetIgnoreListener*      | u8 flag (0 or 1)                 |
//! | SetLoop                 | u8 flag (0 or 1)                 |
//! | SetPitch                | f32 pitch                        |
//! | SetTime                 | f32 seconds                      |
//! | SetTimeSamples          | i32 samples                      |

use crate::clip::ClipId;
use crate::command::{Action, ActionKind, Command, SourceId};
use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

/// Size of the fixed header (source id + kind).
pub const HEADER_LEN: usize = 5;

/// Encode a command into a new buffer.
pub fn encode(cmd: &Command) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(HEADER_LEN + cmd.kind().payload_len());
    encode_into(&mut buf, cmd)?;
    Ok(buf)
}

/// Encode a command into any writer.
pub fn encode_into<W: Write>(w: &mut W, cmd: &Command) -> Result<()> {
    w.write_u32::<LittleEndian>(cmd.source.0)?;
    w.write_u8(cmd.kind().as_u8())?;

    match cmd.action {
        Action::Pause | Action::Stop | Action::UnPause => {}
        Action::Play { delay_ticks } => w.write_u64::<LittleEndian>(delay_ticks)?,
        Action::PlayDelayed { delay_seconds } => w.write_f32::<LittleEndian>(delay_seconds)?,
        Action::PlayScheduled { absolute_time } => w.write_f64::<LittleEndian>(absolute_time)?,
        Action::PlayOneShot { clip, volume_scale } => {
            w.write_u32::<LittleEndian>(clip.as_u32())?;
            w.write_f32::<LittleEndian>(volume_scale)?;
        }
        Action::SetVolume { volume } => w.write_f32::<LittleEndian>(volume)?,
        Action::FadeOut { duration } => w.write_f32::<LittleEndian>(duration)?,
        Action::FadeIn {
            target_volume,
            duration,
        } => {
            w.write_f32::<LittleEndian>(target_volume)?;
            w.write_f32::<LittleEndian>(duration)?;
        }
        Action::SetClip { clip } => w.write_u32::<LittleEndian>(clip.as_u32())?,
        Action::SetDopplerLevel { level } => w.write_f32::<LittleEndian>(level)?,
        Action::SetIgnoreListenerPause { flag }
        | Action::SetIgnoreListenerVolume { flag }
        | Action::SetLoop { flag } => w.write_u8(u8::from(flag))?,
        Action::SetPitch { pitch } => w.write_f32::<LittleEndian>(pitch)?,
        Action::SetTime { seconds } => w.write_f32::<LittleEndian>(seconds)?,
        Action::SetTimeSamples { samples } => w.write_i32::<LittleEndian>(samples)?,
    }

    Ok(())
}

/// Decode a command, validating the payload length for its kind exactly.
pub fn decode(bytes: &[u8]) -> Result<Command> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::MalformedCommand(format!(
            "message is {} bytes, header needs {}",
            bytes.len(),
            HEADER_LEN
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let source = SourceId(cursor.read_u32::<LittleEndian>()?);
    let tag = cursor.read_u8()?;
    let kind = ActionKind::from_u8(tag)
        .ok_or_else(|| Error::MalformedCommand(format!("unknown kind tag {}", tag)))?;

    let payload_len = bytes.len() - HEADER_LEN;
    if payload_len != kind.payload_len() {
        return Err(Error::MalformedCommand(format!(
            "{:?} payload is {} bytes, expected {}",
            kind,
            payload_len,
            kind.payload_len()
        )));
    }

    let action = match kind {
        ActionKind::Pause => Action::Pause,
        ActionKind::Stop => Action::Stop,
        ActionKind::UnPause => Action::UnPause,
        ActionKind::Play => Action::Play {
            delay_ticks: cursor.read_u64::<LittleEndian>()?,
        },
        ActionKind::PlayDelayed => Action::PlayDelayed {
            delay_seconds: cursor.read_f32::<LittleEndian>()?,
        },
        ActionKind::PlayScheduled => Action::PlayScheduled {
            absolute_time: cursor.read_f64::<LittleEndian>()?,
        },
        ActionKind::PlayOneShot => Action::PlayOneShot {
            clip: ClipId::from_raw(cursor.read_u32::<LittleEndian>()?),
            volume_scale: cursor.read_f32::<LittleEndian>()?,
        },
        ActionKind::SetVolume => Action::SetVolume {
            volume: cursor.read_f32::<LittleEndian>()?,
        },
        ActionKind::FadeOut => Action::FadeOut {
            duration: cursor.read_f32::<LittleEndian>()?,
        },
        ActionKind::FadeIn => Action::FadeIn {
            target_volume: cursor.read_f32::<LittleEndian>()?,
            duration: cursor.read_f32::<LittleEndian>()?,
        },
        ActionKind::SetClip => Action::SetClip {
            clip: ClipId::from_raw(cursor.read_u32::<LittleEndian>()?),
        },
        ActionKind::SetDopplerLevel => Action::SetDopplerLevel {
            level: cursor.read_f32::<LittleEndian>()?,
        },
        ActionKind::SetIgnoreListenerPause => Action::SetIgnoreListenerPause {
            flag: read_flag(&mut cursor, kind)?,
        },
        ActionKind::SetIgnoreListenerVolume => Action::SetIgnoreListenerVolume {
            flag: read_flag(&mut cursor, kind)?,
        },
        ActionKind::SetLoop => Action::SetLoop {
            flag: read_flag(&mut cursor, kind)?,
        },
        ActionKind::SetPitch => Action::SetPitch {
            pitch: cursor.read_f32::<LittleEndian>()?,
        },
        ActionKind::SetTime => Action::SetTime {
            seconds: cursor.read_f32::<LittleEndian>()?,
        },
        ActionKind::SetTimeSamples => Action::SetTimeSamples {
            samples: cursor.read_i32::<LittleEndian>()?,
        },
    };

    Ok(Command { source, action })
}

fn read_flag(cursor: &mut Cursor<&[u8]>, kind: ActionKind) -> Result<bool> {
    match cursor.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Error::MalformedCommand(format!(
            "{:?} flag byte must be 0 or 1, got {}",
            kind, other
        ))),
    }
}
