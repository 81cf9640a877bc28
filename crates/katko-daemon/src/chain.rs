use crate::media::{TrackControl, TrackEvent};
use katko_proto::protocol::{ChainStatus, TrackDescriptor, TrackState, TrackView};
use thiserror::Error;
use tracing::warn;

// ── TrackHandle ───────────────────────────────────────────────────────────────

/// Runtime side of one track: what the media last reported plus the control
/// used to start it.  Dropping the handle closes the media.
pub struct TrackHandle {
    descriptor: TrackDescriptor,
    state: TrackState,
    position: f64,
    duration: Option<f64>,
    control: Box<dyn TrackControl>,
}

impl TrackHandle {
    /// A freshly opened track is already loading.
    pub fn new(descriptor: TrackDescriptor, control: Box<dyn TrackControl>) -> Self {
        Self {
            descriptor,
            state: TrackState::Loading,
            position: 0.0,
            duration: None,
            control,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, TrackState::Idle | TrackState::Loading)
    }

    /// Fold a media event into the observed state.
    pub fn apply(&mut self, event: &TrackEvent) {
        match event {
            TrackEvent::CanPlayThrough => {
                // a track given up on at the load deadline may still arrive
                if self.is_pending() || self.state == TrackState::Unavailable {
                    self.state = TrackState::Ready;
                }
            }
            TrackEvent::DurationKnown(secs) => {
                if secs.is_finite() && *secs >= 0.0 {
                    self.duration = Some(*secs);
                }
            }
            TrackEvent::TimeAdvanced(secs) => {
                if secs.is_finite() && *secs >= 0.0 {
                    self.position = *secs;
                }
            }
            TrackEvent::Ended => {
                self.state = TrackState::Ended;
                // a finished element keeps reporting its full length
                if let Some(duration) = self.duration {
                    self.position = duration;
                }
            }
            TrackEvent::Failed(_) => {
                self.state = TrackState::Unavailable;
            }
        }
    }

    pub fn mark_unavailable(&mut self) {
        self.state = TrackState::Unavailable;
    }

    fn play(&mut self) -> anyhow::Result<()> {
        self.control.play()?;
        self.state = TrackState::Playing;
        Ok(())
    }

    pub fn view(&self) -> TrackView {
        TrackView {
            name: self.descriptor.name.clone(),
            state: self.state,
            position_secs: self.position,
            duration_secs: self.duration,
        }
    }
}

impl Drop for TrackHandle {
    fn drop(&mut self) {
        self.control.close();
    }
}

// ── PlaybackChain ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("break is not ready to start (state {0:?})")]
    NotArmed(ChainStatus),
}

/// Outcome of moving the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Track at this index was told to play.
    Next(usize),
    /// Nothing left to play.
    Finished,
    /// The event did not concern the current track.
    Ignored,
}

/// Plays a break strictly in list order.
///
/// The track list is fixed at construction; "next" is always the following
/// index, so duplicate file names are harmless.  Unavailable tracks are
/// stepped over.
pub struct PlaybackChain {
    tracks: Vec<TrackHandle>,
    cursor: Option<usize>,
    status: ChainStatus,
}

impl PlaybackChain {
    pub fn new(tracks: Vec<TrackHandle>) -> Self {
        let status = if tracks.is_empty() {
            ChainStatus::Empty
        } else {
            ChainStatus::AwaitingAllLoaded
        };
        Self {
            tracks,
            cursor: None,
            status,
        }
    }

    pub fn status(&self) -> ChainStatus {
        self.status
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn tracks(&self) -> &[TrackHandle] {
        &self.tracks
    }

    pub fn track_mut(&mut self, index: usize) -> Option<&mut TrackHandle> {
        self.tracks.get_mut(index)
    }

    /// All tracks settled: enable the start control.  Only valid once.
    pub fn arm(&mut self) -> bool {
        if self.status == ChainStatus::AwaitingAllLoaded {
            self.status = ChainStatus::Armed;
            true
        } else {
            false
        }
    }

    /// The operator pressed start: play from the first track.
    pub fn start(&mut self) -> Result<Advance, ChainError> {
        if self.status != ChainStatus::Armed {
            return Err(ChainError::NotArmed(self.status));
        }
        self.status = ChainStatus::Playing;
        Ok(self.play_from(0))
    }

    /// Track `index` reached its natural end.
    pub fn on_ended(&mut self, index: usize) -> Advance {
        if self.status != ChainStatus::Playing || self.cursor != Some(index) {
            return Advance::Ignored;
        }
        self.play_from(index + 1)
    }

    /// Track `index` failed.  If it was the one playing, move on as if it ended.
    pub fn on_failed(&mut self, index: usize) -> Advance {
        if let Some(track) = self.tracks.get_mut(index) {
            track.mark_unavailable();
        }
        self.on_ended(index)
    }

    fn play_from(&mut self, from: usize) -> Advance {
        for index in from..self.tracks.len() {
            let track = &mut self.tracks[index];
            if track.state() == TrackState::Unavailable {
                continue;
            }
            match track.play() {
                Ok(()) => {
                    self.cursor = Some(index);
                    return Advance::Next(index);
                }
                Err(e) => {
                    warn!("chain: could not play {:?}: {:#}", track.name(), e);
                    track.mark_unavailable();
                }
            }
        }
        self.cursor = None;
        self.status = ChainStatus::Finished;
        Advance::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<String>>>);

    impl Log {
        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Recorder {
        name: String,
        log: Log,
        fail: bool,
    }

    impl TrackControl for Recorder {
        fn play(&mut self) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("no output");
            }
            self.log.0.lock().unwrap().push(format!("play {}", self.name));
            Ok(())
        }

        fn close(&mut self) {
            self.log.0.lock().unwrap().push(format!("close {}", self.name));
        }
    }

    fn handle(name: &str, log: &Log, fail: bool) -> TrackHandle {
        TrackHandle::new(
            TrackDescriptor {
                name: name.to_string(),
                url: format!("http://localhost/{name}"),
            },
            Box::new(Recorder {
                name: name.to_string(),
                log: log.clone(),
                fail,
            }),
        )
    }

    fn chain(names: &[&str], log: &Log) -> PlaybackChain {
        PlaybackChain::new(names.iter().map(|n| handle(n, log, false)).collect())
    }

    fn plays(log: &Log) -> Vec<String> {
        log.entries()
            .into_iter()
            .filter(|e| e.starts_with("play"))
            .collect()
    }

    #[test]
    fn plays_in_order_and_finishes() {
        let log = Log::default();
        let mut chain = chain(&["A", "B", "C"], &log);
        assert_eq!(chain.status(), ChainStatus::AwaitingAllLoaded);
        assert!(chain.arm());

        assert_eq!(chain.start(), Ok(Advance::Next(0)));
        assert_eq!(plays(&log), ["play A"]);

        assert_eq!(chain.on_ended(0), Advance::Next(1));
        assert_eq!(plays(&log), ["play A", "play B"]);

        assert_eq!(chain.on_ended(1), Advance::Next(2));
        assert_eq!(chain.on_ended(2), Advance::Finished);
        assert_eq!(chain.status(), ChainStatus::Finished);
        assert_eq!(chain.cursor(), None);
        assert_eq!(plays(&log), ["play A", "play B", "play C"]);
    }

    #[test]
    fn cannot_start_before_armed() {
        let log = Log::default();
        let mut chain = chain(&["A"], &log);
        assert_eq!(
            chain.start(),
            Err(ChainError::NotArmed(ChainStatus::AwaitingAllLoaded))
        );
        assert!(plays(&log).is_empty());
    }

    #[test]
    fn second_start_is_rejected() {
        let log = Log::default();
        let mut chain = chain(&["A", "B"], &log);
        chain.arm();
        chain.start().unwrap();
        assert_eq!(chain.start(), Err(ChainError::NotArmed(ChainStatus::Playing)));
        assert!(!chain.arm());
        assert_eq!(plays(&log), ["play A"]);
    }

    #[test]
    fn stray_end_events_are_ignored() {
        let log = Log::default();
        let mut chain = chain(&["A", "B", "C"], &log);
        chain.arm();
        chain.start().unwrap();
        // C never started; its end must not skip B
        assert_eq!(chain.on_ended(2), Advance::Ignored);
        assert_eq!(chain.on_ended(0), Advance::Next(1));
        // A again: no longer current
        assert_eq!(chain.on_ended(0), Advance::Ignored);
        assert_eq!(plays(&log), ["play A", "play B"]);
    }

    #[test]
    fn duplicate_names_follow_position() {
        let log = Log::default();
        let mut chain = chain(&["jingle", "ad", "jingle"], &log);
        chain.arm();
        chain.start().unwrap();
        assert_eq!(chain.on_ended(0), Advance::Next(1));
        assert_eq!(chain.on_ended(1), Advance::Next(2));
        assert_eq!(chain.on_ended(2), Advance::Finished);
    }

    #[test]
    fn unavailable_tracks_are_skipped() {
        let log = Log::default();
        let mut chain = chain(&["A", "B", "C"], &log);
        chain.track_mut(1).unwrap().mark_unavailable();
        chain.arm();
        chain.start().unwrap();
        assert_eq!(chain.on_ended(0), Advance::Next(2));
        assert_eq!(plays(&log), ["play A", "play C"]);
    }

    #[test]
    fn failing_play_moves_on() {
        let log = Log::default();
        let mut chain = PlaybackChain::new(vec![
            handle("A", &log, true),
            handle("B", &log, false),
        ]);
        chain.arm();
        assert_eq!(chain.start(), Ok(Advance::Next(1)));
        assert_eq!(chain.tracks()[0].state(), TrackState::Unavailable);
    }

    #[test]
    fn failure_of_current_track_advances() {
        let log = Log::default();
        let mut chain = chain(&["A", "B"], &log);
        chain.arm();
        chain.start().unwrap();
        assert_eq!(chain.on_failed(0), Advance::Next(1));
        assert_eq!(chain.on_failed(1), Advance::Finished);
    }

    #[test]
    fn empty_chain_is_distinct() {
        let log = Log::default();
        let mut chain = chain(&[], &log);
        assert_eq!(chain.status(), ChainStatus::Empty);
        assert!(!chain.arm());
        assert_eq!(chain.start(), Err(ChainError::NotArmed(ChainStatus::Empty)));
    }

    #[test]
    fn handle_tracks_media_events() {
        let log = Log::default();
        let mut track = handle("A", &log, false);
        assert_eq!(track.state(), TrackState::Loading);
        track.apply(&TrackEvent::DurationKnown(30.0));
        track.apply(&TrackEvent::CanPlayThrough);
        assert_eq!(track.state(), TrackState::Ready);
        track.apply(&TrackEvent::TimeAdvanced(12.5));
        assert_eq!(track.position(), 12.5);
        track.apply(&TrackEvent::TimeAdvanced(f64::NAN));
        assert_eq!(track.position(), 12.5);
        track.apply(&TrackEvent::Ended);
        assert_eq!(track.state(), TrackState::Ended);
        assert_eq!(track.position(), 30.0);
        // a late can-play-through must not resurrect the track
        track.apply(&TrackEvent::CanPlayThrough);
        assert_eq!(track.state(), TrackState::Ended);
    }

    #[test]
    fn late_track_recovers_after_being_given_up_on() {
        let log = Log::default();
        let mut track = handle("A", &log, false);
        track.mark_unavailable();
        track.apply(&TrackEvent::CanPlayThrough);
        assert_eq!(track.state(), TrackState::Ready);
    }

    #[test]
    fn dropping_the_chain_closes_every_track() {
        let log = Log::default();
        drop(chain(&["A", "B"], &log));
        let closes: Vec<String> = log
            .entries()
            .into_iter()
            .filter(|e| e.starts_with("close"))
            .collect();
        assert_eq!(closes, ["close A", "close B"]);
    }
}
