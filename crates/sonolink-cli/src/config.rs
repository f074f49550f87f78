//! Scenario file support for the sonolink simulator
//!
//! A scenario describes the peers, the shared clip catalog, the sources every
//! peer spawns, their links, and a timeline of actions. It is stored in TOML
//! format, by default at:
//! - Linux: `~/.config/sonolink/scenario.toml`
//! - macOS: `~/Library/Application Support/sonolink/scenario.toml`
//! - Windows: `%APPDATA%\sonolink\scenario.toml`

use crate::error::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Scenario written by `sonolink init` and used when no file exists.
pub const DEFAULT_SCENARIO: &str = r#"# sonolink scenario file
#
# Every peer registers the same clips and spawns the same sources.
# Actions are issued by one peer at a point in simulated time.

clips = ["door_slam", "door_creak", "wind_gust", "footstep"]

[session]
# Number of simulated peers
peers = 3
# Index of the authoritative peer
authority = 0
# Simulation step in milliseconds
tick_ms = 20
# Total simulated time in seconds
duration_secs = 4.0
# Seed for random clip loops (omit for a random seed)
seed = 7

[[sources]]
id = 1
volume = 0.9

[[sources]]
id = 2
volume = 0.6
clip = "wind_gust"
loop = true

[[sources]]
id = 3

# Source 1 drives source 2 at 30% volume, and the other way round
[[links]]
from = 1
to = 2
damping = 0.3
bidirectional = true

[[actions]]
at = 0.0
peer = 1
source = 1
op = "play_one_shot"
clip = "door_slam"
volume_scale = 0.5

[[actions]]
at = 0.5
peer = 2
source = 2
op = "play"

[[actions]]
at = 1.0
peer = 0
source = 3
op = "loop_random_clips"
min_interval = 0.4
max_interval = 0.8
clips = ["footstep", "door_creak"]

[[actions]]
at = 2.0
peer = 1
source = 2
op = "fade_out"
duration = 1.5

[[actions]]
at = 3.5
peer = 0
source = 3
op = "stop_random_loop"
"#;

/// Complete simulator scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// Clip catalog; local handles are assigned in catalog order
    pub clips: Vec<String>,
    /// Peer and timing settings
    pub session: SessionSettings,
    /// Sources spawned on every peer
    pub sources: Vec<SourceSettings>,
    /// Links declared on every peer
    pub links: Vec<LinkSettings>,
    /// Timeline of actions
    pub actions: Vec<ActionEntry>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            clips: Vec::new(),
            session: SessionSettings::default(),
            sources: Vec::new(),
            links: Vec::new(),
            actions: Vec::new(),
        }
    }
}

impl Scenario {
    /// Load the scenario from the default file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Err(Error::Config(format!("Scenario file not found at {:?}", path)))
        }
    }

    /// Load a scenario from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let scenario: Scenario = toml::from_str(&content)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Load the default scenario file, or the built-in demo if there is none
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            log::debug!("Using built-in scenario: {}", e);
            Self::demo()
        })
    }

    /// The built-in demo scenario
    pub fn demo() -> Self {
        toml::from_str(DEFAULT_SCENARIO).expect("built-in scenario is valid TOML")
    }

    /// Render the scenario as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get the default scenario file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "sonolink") {
            Ok(proj_dirs.config_dir().join("scenario.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }

    /// Create the default scenario file with comments
    pub fn create_default_config_file() -> Result<PathBuf> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, DEFAULT_SCENARIO)?;
        Ok(path)
    }

    /// Check references between sections.
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        if session.peers == 0 {
            return Err(Error::Config("at least one peer is required".to_string()));
        }
        if session.authority >= session.peers {
            return Err(Error::Config(format!(
                "authority index {} out of range for {} peers",
                session.authority, session.peers
            )));
        }
        if session.tick_ms == 0 {
            return Err(Error::Config("tick_ms must be positive".to_string()));
        }
        if !(session.duration_secs.is_finite() && session.duration_secs > 0.0) {
            return Err(Error::Config(format!(
                "duration_secs must be a positive number of seconds, got {}",
                session.duration_secs
            )));
        }

        let known_clip = |name: &str| self.clips.iter().any(|c| c == name);
        for source in &self.sources {
            if let Some(clip) = &source.clip {
                if !known_clip(clip.as_str()) {
                    return Err(Error::Config(format!(
                        "source {} uses unknown clip '{}'",
                        source.id, clip
                    )));
                }
            }
        }
        for (index, action) in self.actions.iter().enumerate() {
            if action.peer >= session.peers {
                return Err(Error::Config(format!(
                    "action #{} issued by peer {} but only {} peers exist",
                    index, action.peer, session.peers
                )));
            }
            if let Some(clip) = action.op.clip_names().find(|name| !known_clip(*name)) {
                return Err(Error::Config(format!(
                    "action #{} references unknown clip '{}'",
                    index, clip
                )));
            }
        }
        Ok(())
    }

    /// Actions ordered by time; equal times keep file order.
    pub fn timeline(&self) -> Vec<ActionEntry> {
        let mut actions = self.actions.clone();
        actions.sort_by(|a, b| a.at.total_cmp(&b.at));
        actions
    }
}

/// Peer and timing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Number of simulated peers
    pub peers: usize,
    /// Index of the authoritative peer
    pub authority: usize,
    /// Simulation step in milliseconds
    pub tick_ms: u64,
    /// Total simulated time in seconds
    pub duration_secs: f64,
    /// Seed for random clip loops
    pub seed: Option<u64>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            peers: 2,
            authority: 0,
            tick_ms: 20,
            duration_secs: 3.0,
            seed: None,
        }
    }
}

/// Initial state of a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub id: u32,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default = "default_pitch")]
    pub pitch: f32,
    #[serde(default, rename = "loop")]
    pub looping: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip: Option<String>,
}

fn default_volume() -> f32 {
    1.0
}

fn default_pitch() -> f32 {
    1.0
}

/// A link declared at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSettings {
    pub from: u32,
    pub to: u32,
    pub damping: f32,
    #[serde(default)]
    pub bidirectional: bool,
}

/// One timeline entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    /// Simulated time in seconds
    pub at: f64,
    /// Index of the issuing peer
    #[serde(default)]
    pub peer: usize,
    /// Target source
    pub source: u32,
    #[serde(flatten)]
    pub op: ActionOp,
}

/// Operation performed by a timeline entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ActionOp {
    Pause,
    Stop,
    #[serde(rename = "unpause")]
    UnPause,
    Play {
        #[serde(default)]
        delay_ticks: u64,
    },
    PlayDelayed {
        delay_seconds: f32,
    },
    PlayScheduled {
        absolute_time: f64,
    },
    PlayOneShot {
        clip: String,
        #[serde(default = "default_volume")]
        volume_scale: f32,
    },
    SetVolume {
        volume: f32,
    },
    FadeOut {
        duration: f32,
    },
    FadeIn {
        target_volume: f32,
        duration: f32,
    },
    SetClip {
        clip: String,
    },
    SetDopplerLevel {
        level: f32,
    },
    SetIgnoreListenerPause {
        flag: bool,
    },
    SetIgnoreListenerVolume {
        flag: bool,
    },
    SetLoop {
        flag: bool,
    },
    SetPitch {
        pitch: f32,
    },
    SetTime {
        seconds: f32,
    },
    SetTimeSamples {
        samples: i32,
    },
    LoopRandomClips {
        min_interval: f32,
        max_interval: f32,
        clips: Vec<String>,
    },
    StopRandomLoop,
    /// Declare a link from `source` on every peer
    Link {
        to: u32,
        damping: f32,
        #[serde(default)]
        bidirectional: bool,
    },
    /// Remove a link from `source` on every peer
    Unlink {
        to: u32,
        #[serde(default)]
        bidirectional: bool,
    },
    /// Take `source` offline on every peer
    Despawn,
}

impl ActionOp {
    /// Clip names referenced by the operation
    pub fn clip_names(&self) -> impl Iterator<Item = &str> {
        let names: &[String] = match self {
            ActionOp::PlayOneShot { clip, .. } | ActionOp::SetClip { clip } => std::slice::from_ref(clip),
            ActionOp::LoopRandomClips { clips, .. } => clips,
            _ => &[],
        };
        names.iter().map(String::as_str)
    }

    /// Whether the operation changes link topology on every peer
    /// rather than issuing a command from one peer.
    pub fn is_topology(&self) -> bool {
        matches!(self, ActionOp::Link { .. } | ActionOp::Unlink { .. } | ActionOp::Despawn)
    }
}
