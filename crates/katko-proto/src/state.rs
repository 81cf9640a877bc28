use crate::protocol::{ChainStatus, DisplayState, TrackView};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Aggregate progress already rendered as `MM:SS` strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressText {
    pub elapsed: String,
    pub remaining: String,
    pub total: String,
}

impl Default for ProgressText {
    fn default() -> Self {
        Self {
            elapsed: "00:00".to_string(),
            remaining: "00:00".to_string(),
            total: "00:00".to_string(),
        }
    }
}

/// Chain-owned slice of the display state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlaybackView {
    pub chain: ChainStatus,
    pub tracks: Vec<TrackView>,
    pub current_track: Option<usize>,
    pub progress: ProgressText,
}

/// Shared snapshot of what the display surfaces show.  The break core is the
/// only writer; the socket and HTTP servers read.
pub struct StateManager {
    state: Arc<RwLock<DisplayState>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(DisplayState {
                rev: 1,
                ..DisplayState::default()
            })),
        }
    }

    pub async fn get_state(&self) -> DisplayState {
        self.state.read().await.clone()
    }

    /// Forget the previous break entirely (new session or reload).
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        let rev = state.rev + 1;
        *state = DisplayState {
            rev,
            ..DisplayState::default()
        };
    }

    pub async fn set_slot(&self, slot: Option<String>) {
        let mut state = self.state.write().await;
        state.slot = slot;
        state.rev += 1;
    }

    /// Replace everything the playback chain drives in one revision.
    pub async fn set_playback(&self, view: PlaybackView) {
        let mut state = self.state.write().await;
        state.start_enabled = view.chain == ChainStatus::Armed;
        state.chain = view.chain;
        state.tracks = view.tracks;
        state.current_track = view.current_track;
        state.elapsed = view.progress.elapsed;
        state.remaining = view.progress.remaining;
        state.total = view.progress.total;
        state.rev += 1;
    }

    pub async fn set_stale(&self, closest: Option<String>) {
        let mut state = self.state.write().await;
        state.stale = closest;
        state.rev += 1;
    }

    pub async fn set_error(&self, error: Option<String>) {
        let mut state = self.state.write().await;
        state.error = error;
        state.rev += 1;
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
