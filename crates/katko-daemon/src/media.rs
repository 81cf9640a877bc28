//! The seam between the break core and whatever actually plays audio.
//!
//! A backend opens one track per descriptor and starts loading it right
//! away.  From then on the track reports what happens to it through a
//! `TrackSink`; the core talks back only through `TrackControl::play`.

use katko_proto::protocol::TrackDescriptor;
use tokio::sync::mpsc;

/// Something a track's media reported.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackEvent {
    /// Buffered far enough to play to the end without stalling.
    CanPlayThrough,
    DurationKnown(f64),
    /// Playback position, in seconds.
    TimeAdvanced(f64),
    /// Natural end of playback.
    Ended,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackSignal {
    pub index: usize,
    pub event: TrackEvent,
}

/// Per-track event queue into the core, tagged with the track's list index.
#[derive(Debug, Clone)]
pub struct TrackSink {
    index: usize,
    tx: mpsc::UnboundedSender<TrackSignal>,
}

impl TrackSink {
    pub fn new(index: usize, tx: mpsc::UnboundedSender<TrackSignal>) -> Self {
        Self { index, tx }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns `false` once the session that owned the track is gone.
    pub fn emit(&self, event: TrackEvent) -> bool {
        self.tx
            .send(TrackSignal {
                index: self.index,
                event,
            })
            .is_ok()
    }
}

pub trait TrackControl: Send + Sync {
    fn play(&mut self) -> anyhow::Result<()>;
    /// Stop and release the media.  Must be safe to call more than once.
    fn close(&mut self);
}

pub trait MediaBackend: Send + Sync {
    fn open(
        &self,
        track: &TrackDescriptor,
        sink: TrackSink,
    ) -> anyhow::Result<Box<dyn TrackControl>>;
}

/// Stand-in control for a track whose media could not be opened.
pub struct Detached;

impl TrackControl for Detached {
    fn play(&mut self) -> anyhow::Result<()> {
        anyhow::bail!("track has no media attached")
    }

    fn close(&mut self) {}
}
