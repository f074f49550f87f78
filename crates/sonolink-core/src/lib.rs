//! Sonolink Core - Replicated audio source playback for networked peers.
//!
//! This crate keeps the audio sources of every peer in a session in step:
//!
//! - **Clips** - Stable 32-bit clip ids derived from clip names
//! - **Commands** - The 18 playback and property commands and their wire codec
//! - **Sources** - Local audio outputs behind the [`SourceOutput`] trait
//! - **Links** - Damped fan-out from a source to the sources it drives
//! - **Dispatcher** - Authority relay and exactly-once local application
//! - **Fades** - Tick-driven fades and random clip loops
//! - **Session** - Per-peer context object and the [`SourceProxy`] façade
//!
//! # Architecture
//!
//! Every mutation of a source is a [`Command`]. Non-authoritative peers send
//! commands to the authority, which relays each one verbatim to all peers
//! including itself. A peer only changes a source when a command arrives, so
//! every peer applies every command exactly once and in the authority's order.
//! The embedder drives each [`Session`] by calling [`Session::tick`] once per
//! time step.

pub mod clip;
pub mod command;
pub mod dispatcher;
pub mod error;
pub mod fade;
pub mod links;
pub mod session;
pub mod source;
pub mod transport;
pub mod wire;

pub use clip::{ClipEntry, ClipHandle, ClipId, ClipRegistry};
pub use command::{Action, ActionKind, Command, SourceId};
pub use dispatcher::{CommandDispatcher, DispatchStats, Disposition};
pub use error::{Error, Result};
pub use fade::{FadeKind, FadeScheduler, FadeTask};
pub use links::{Link, LinkGraph, SELF_DAMPING};
pub use session::{Context, PumpReport, Session, SessionOptions, SourceProxy};
pub use source::{
    OutputEvent, PlayState, SimulatedOutput, SimulatedState, SourceEntry, SourceOutput,
    SourceRegistry,
};
pub use transport::{Envelope, LoopbackEndpoint, LoopbackHub, PeerId, Transport};
