use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Display clients check this on connect.
pub const PROTOCOL_VERSION: u32 = 1;

/// One playable file inside a break slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    /// File name as listed by the server; also the ordering key.
    pub name: String,
    /// Absolute address the media backend loads from.
    pub url: String,
}

/// Messages sent from a display client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Press the start control: play the break from its first track.
    Start,
    /// Drop the current break and load the slot closest to now.
    Reload,
    GetState,
}

/// Messages sent from the daemon to display clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: DisplayState,
    },
    State {
        data: DisplayState,
    },
    /// A slot closer to now than the loaded one exists.  The daemon does not
    /// reload on its own; clients should prompt the operator.
    Stale {
        loaded: String,
        closest: String,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Per-track lifecycle as observed from the media backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TrackState {
    #[default]
    Idle,
    Loading,
    /// Buffered enough to play through without stalling.
    Ready,
    Playing,
    Ended,
    /// Failed to load or missed the load deadline.
    Unavailable,
}

/// Chain-level state of the loaded break.
///
/// Transitions:
///   AwaitingAllLoaded -> Armed -> Playing -> Finished
///   (no tracks)       -> Empty
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ChainStatus {
    #[default]
    AwaitingAllLoaded,
    /// Everything buffered; the start control is enabled.
    Armed,
    Playing,
    Finished,
    /// The slot has no tracks at all.
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TrackView {
    pub name: String,
    pub state: TrackState,
    pub position_secs: f64,
    pub duration_secs: Option<f64>,
}

/// Everything a display surface needs.  `rev` is incremented on every change
/// so clients can detect missed updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayState {
    #[serde(default)]
    pub rev: u64,
    /// Label of the loaded slot, shown as soon as it is selected.
    pub slot: Option<String>,
    pub chain: ChainStatus,
    /// Index of the track the chain is currently playing.
    pub current_track: Option<usize>,
    pub tracks: Vec<TrackView>,
    /// Summed progress, `MM:SS`.
    pub elapsed: String,
    pub remaining: String,
    pub total: String,
    /// Whether the start control is visible.
    pub start_enabled: bool,
    /// Newer slot detected by the staleness watcher; drives the banner.
    #[serde(default)]
    pub stale: Option<String>,
    /// Fatal load error ("cannot load schedule"), if any.
    #[serde(default)]
    pub error: Option<String>,
}

impl Default for DisplayState {
    fn default() -> Self {
        Self {
            rev: 0,
            slot: None,
            chain: ChainStatus::default(),
            current_track: None,
            tracks: Vec::new(),
            elapsed: "00:00".to_string(),
            remaining: "00:00".to_string(),
            total: "00:00".to_string(),
            start_enabled: false,
            stale: None,
            error: None,
        }
    }
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    /// Frame as a 4-byte big-endian length followed by JSON.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
