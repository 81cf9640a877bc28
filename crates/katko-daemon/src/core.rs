/// BreakCore: single-owner event loop for the loaded break.
///
/// All mutable scheduling state (the session's LoadGate, PlaybackChain and
/// track handles) lives here and nowhere else.  Three kinds of input reach
/// the loop:
///
/// - `BreakEvent`s from the socket, HTTP API and timers on the shared
///   channel;
/// - `TrackSignal`s from the media backend on the session's own channel;
/// - `StaleNotice`s from the session's staleness watcher.
///
/// The two session channels die with the session, so nothing a previous
/// break's media says after a reload can touch the new one.
///
/// After each change BreakCore writes the display snapshot through
/// `StateManager` and broadcasts `BroadcastMessage::StateUpdated`.
use std::sync::Arc;

use katko_proto::config::{Config, TrackFailurePolicy};
use katko_proto::listing::ListingClient;
use katko_proto::protocol::{ChainStatus, Command, TrackDescriptor};
use katko_proto::slot::{select_closest, SlotLabel};
use katko_proto::state::{PlaybackView, ProgressText, StateManager};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain::{Advance, PlaybackChain, TrackHandle};
use crate::gate::LoadGate;
use crate::media::{Detached, MediaBackend, TrackEvent, TrackSignal, TrackSink};
use crate::progress::AggregateProgress;
use crate::staleness::{Clock, StaleNotice, StalenessWatcher, WatcherTask};
use crate::BroadcastMessage;

// ── BreakEvent ────────────────────────────────────────────────────────────────

/// Inputs into the BreakCore loop that outlive a single session.
#[derive(Debug)]
pub enum BreakEvent {
    /// A command from a display client or the HTTP API.
    ClientCommand(Command),
    /// The load deadline of session `session` passed.
    LoadDeadline { session: u64 },
    Shutdown,
}

// ── Session ───────────────────────────────────────────────────────────────────

/// One loaded break.  Dropping it closes every track, cancels the staleness
/// watcher and the load deadline.
struct Session {
    id: u64,
    slot: SlotLabel,
    gate: LoadGate,
    chain: PlaybackChain,
    track_rx: mpsc::UnboundedReceiver<TrackSignal>,
    stale_rx: mpsc::Receiver<StaleNotice>,
    watcher: Option<WatcherTask>,
    deadline: Option<JoinHandle<()>>,
    /// Progress strings of the last publish.
    shown: ProgressText,
}

impl Session {
    /// Settle track `index` in the gate; arms the chain when it was the last.
    fn settle(&mut self, index: usize) {
        if !self.gate.notify_one_loaded(index) {
            return;
        }
        if self.chain.arm() {
            info!(
                "BreakCore: all {} tracks of {} settled, start enabled",
                self.chain.tracks().len(),
                self.slot
            );
        }
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }
}

enum SessionInput {
    Track(TrackSignal),
    Stale(StaleNotice),
}

enum Step {
    Event(Option<BreakEvent>),
    Session(SessionInput),
}

/// Next input from the current session.  Pending forever when there is no
/// session or its channels have all closed.
async fn next_session_input(session: &mut Option<Session>) -> SessionInput {
    let Some(session) = session.as_mut() else {
        return std::future::pending().await;
    };
    tokio::select! {
        Some(signal) = session.track_rx.recv() => SessionInput::Track(signal),
        Some(notice) = session.stale_rx.recv() => SessionInput::Stale(notice),
        else => std::future::pending().await,
    }
}

// ── BreakCore ─────────────────────────────────────────────────────────────────

pub struct BreakCore {
    config: Config,
    state_manager: Arc<StateManager>,
    listing: ListingClient,
    backend: Arc<dyn MediaBackend>,
    clock: Clock,
    /// Used by per-session timers to call back into the loop.
    event_tx: mpsc::Sender<BreakEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    session: Option<Session>,
    next_session_id: u64,
}

impl BreakCore {
    pub fn new(
        config: Config,
        listing: ListingClient,
        backend: Arc<dyn MediaBackend>,
        clock: Clock,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<BreakEvent>,
    ) -> Self {
        Self {
            config,
            state_manager: Arc::new(StateManager::new()),
            listing,
            backend,
            clock,
            event_tx,
            broadcast_tx,
            session: None,
            next_session_id: 1,
        }
    }

    /// Borrow the state manager (for the socket and HTTP servers).
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// Load the closest break, then run until `Shutdown` or until every
    /// event sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<BreakEvent>) -> anyhow::Result<()> {
        info!("BreakCore: starting event loop");
        self.load_session().await;

        loop {
            let step = tokio::select! {
                evt = event_rx.recv() => Step::Event(evt),
                input = next_session_input(&mut self.session) => Step::Session(input),
            };

            match step {
                Step::Event(None) => {
                    info!("BreakCore: event channel closed, shutting down");
                    break;
                }
                Step::Event(Some(BreakEvent::Shutdown)) => {
                    info!("BreakCore: shutdown requested");
                    break;
                }
                Step::Event(Some(BreakEvent::ClientCommand(cmd))) => {
                    info!("BreakCore: command {:?}", cmd);
                    self.handle_command(cmd).await;
                }
                Step::Event(Some(BreakEvent::LoadDeadline { session })) => {
                    self.on_load_deadline(session).await;
                }
                Step::Session(SessionInput::Track(signal)) => {
                    self.on_track_signal(signal).await;
                }
                Step::Session(SessionInput::Stale(notice)) => {
                    self.on_stale(notice).await;
                }
            }
        }

        self.teardown().await;
        Ok(())
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => {
                let Some(session) = self.session.as_mut() else {
                    warn!("BreakCore: start pressed with no break loaded");
                    return;
                };
                match session.chain.start() {
                    Ok(advance) => log_advance(&session.chain, advance),
                    Err(e) => {
                        warn!("BreakCore: start ignored: {}", e);
                        return;
                    }
                }
                self.publish().await;
            }
            Command::Reload => {
                info!("BreakCore: reload requested");
                self.load_session().await;
            }
            Command::GetState => {
                // the socket answers every command with a fresh snapshot
                debug!("BreakCore: state requested");
            }
        }
    }

    // ── session lifecycle ─────────────────────────────────────────────────────

    async fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            info!("BreakCore: closing session {} ({})", session.id, session.slot);
            if let Some(watcher) = session.watcher.take() {
                watcher.shutdown().await;
            }
        }
        self.state_manager.reset().await;
        self.notify_state();
    }

    async fn load_session(&mut self) {
        self.teardown().await;
        match self.open_session().await {
            Ok(session) => {
                self.session = Some(session);
                self.publish().await;
            }
            Err(e) => {
                let message = format!("cannot load schedule: {:#}", e);
                error!("BreakCore: {}", message);
                self.state_manager.set_error(Some(message.clone())).await;
                let _ = self.broadcast_tx.send(BroadcastMessage::Error(message));
                self.notify_state();
            }
        }
    }

    async fn open_session(&mut self) -> anyhow::Result<Session> {
        let id = self.next_session_id;
        self.next_session_id += 1;

        let candidates = self.listing.fetch_slots().await?;
        let slot = select_closest(&candidates, (self.clock)())?.clone();
        info!(
            "BreakCore: session {} loads slot {} ({} candidates)",
            id,
            slot,
            candidates.len()
        );
        self.state_manager.set_slot(Some(slot.to_string())).await;
        self.notify_state();

        let descriptors = self.listing.fetch_tracks(&slot).await?;
        let (track_tx, track_rx) = mpsc::unbounded_channel();
        let tracks: Vec<TrackHandle> = descriptors
            .into_iter()
            .enumerate()
            .map(|(index, descriptor)| self.open_track(descriptor, TrackSink::new(index, track_tx.clone())))
            .collect();
        drop(track_tx);

        let gate = LoadGate::new(tracks.len());
        let chain = PlaybackChain::new(tracks);
        if chain.status() == ChainStatus::Empty {
            warn!("BreakCore: slot {} has no tracks", slot);
        }

        let (stale_tx, stale_rx) = mpsc::channel(4);
        let watcher = StalenessWatcher::new(candidates, slot.clone()).spawn(
            self.config.schedule.stale_check_interval(),
            self.clock.clone(),
            stale_tx,
        );

        let deadline = match self.config.schedule.load_timeout() {
            Some(timeout) if !gate.is_empty() => {
                let tx = self.event_tx.clone();
                Some(tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = tx.send(BreakEvent::LoadDeadline { session: id }).await;
                }))
            }
            _ => None,
        };

        Ok(Session {
            id,
            slot,
            gate,
            chain,
            track_rx,
            stale_rx,
            watcher: Some(watcher),
            deadline,
            shown: ProgressText::default(),
        })
    }

    /// Open one track.  A backend refusal still yields a handle so list
    /// positions stay stable; it reports failure through its own sink.
    fn open_track(&self, descriptor: TrackDescriptor, sink: TrackSink) -> TrackHandle {
        match self.backend.open(&descriptor, sink.clone()) {
            Ok(control) => {
                debug!("BreakCore: loading track {} {:?}", sink.index(), descriptor.name);
                TrackHandle::new(descriptor, control)
            }
            Err(e) => {
                warn!("BreakCore: cannot open {:?}: {:#}", descriptor.name, e);
                sink.emit(TrackEvent::Failed(format!("{:#}", e)));
                TrackHandle::new(descriptor, Box::new(Detached))
            }
        }
    }

    // ── session inputs ────────────────────────────────────────────────────────

    async fn on_track_signal(&mut self, signal: TrackSignal) {
        let policy = self.config.schedule.on_track_failure;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let index = signal.index;
        let Some(track) = session.chain.track_mut(index) else {
            debug!("BreakCore: signal for unknown track {}", index);
            return;
        };

        let shown_second = track.position().round();
        track.apply(&signal.event);

        match signal.event {
            TrackEvent::CanPlayThrough => session.settle(index),
            TrackEvent::Failed(reason) => {
                warn!(
                    "BreakCore: track {} {:?} unavailable: {}",
                    index,
                    session.chain.tracks()[index].name(),
                    reason
                );
                if policy == TrackFailurePolicy::Skip {
                    session.settle(index);
                }
                let advance = session.chain.on_failed(index);
                log_advance(&session.chain, advance);
            }
            TrackEvent::Ended => {
                let advance = session.chain.on_ended(index);
                log_advance(&session.chain, advance);
            }
            TrackEvent::TimeAdvanced(_) => {
                // positions arrive many times a second; the display shows seconds
                let unchanged = session.chain.tracks()[index].position().round() == shown_second
                    && progress_text(&session.chain) == session.shown;
                if unchanged {
                    return;
                }
            }
            TrackEvent::DurationKnown(_) => {}
        }

        self.publish().await;
    }

    async fn on_load_deadline(&mut self, id: u64) {
        let policy = self.config.schedule.on_track_failure;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.id != id || session.gate.has_fired() {
            return;
        }
        session.deadline = None;
        warn!(
            "BreakCore: load deadline passed with {} of {} tracks unsettled",
            session.gate.remaining(),
            session.chain.tracks().len()
        );

        let late: Vec<usize> = session
            .chain
            .tracks()
            .iter()
            .enumerate()
            .filter(|(_, track)| track.is_pending())
            .map(|(index, _)| index)
            .collect();
        for index in late {
            if let Some(track) = session.chain.track_mut(index) {
                warn!(
                    "BreakCore: track {} {:?} not buffered before the load deadline",
                    index,
                    track.name()
                );
                track.mark_unavailable();
            }
            if policy == TrackFailurePolicy::Skip {
                session.settle(index);
            }
        }

        self.publish().await;
    }

    async fn on_stale(&mut self, notice: StaleNotice) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if notice.loaded != session.slot {
            return;
        }
        match notice.closest {
            Some(closest) => {
                info!(
                    "BreakCore: loaded slot {} is stale, {} is closer",
                    notice.loaded, closest
                );
                self.state_manager.set_stale(Some(closest.to_string())).await;
                let _ = self.broadcast_tx.send(BroadcastMessage::Stale {
                    loaded: notice.loaded.to_string(),
                    closest: closest.to_string(),
                });
            }
            None => {
                info!("BreakCore: loaded slot {} is current again", notice.loaded);
                self.state_manager.set_stale(None).await;
            }
        }
        self.notify_state();
    }

    // ── publishing ────────────────────────────────────────────────────────────

    async fn publish(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let chain = &session.chain;
        let progress = progress_text(chain);
        session.shown = progress.clone();
        self.state_manager
            .set_playback(PlaybackView {
                chain: chain.status(),
                tracks: chain.tracks().iter().map(TrackHandle::view).collect(),
                current_track: chain.cursor(),
                progress,
            })
            .await;
        self.notify_state();
    }

    fn notify_state(&self) {
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }
}

fn progress_text(chain: &PlaybackChain) -> ProgressText {
    // durations are only final once everything has loaded
    match chain.status() {
        ChainStatus::AwaitingAllLoaded | ChainStatus::Empty => ProgressText::default(),
        ChainStatus::Armed | ChainStatus::Playing | ChainStatus::Finished => {
            AggregateProgress::sum(chain.tracks().iter().map(|t| (t.position(), t.duration())))
                .text()
        }
    }
}

fn log_advance(chain: &PlaybackChain, advance: Advance) {
    match advance {
        Advance::Next(index) => info!(
            "BreakCore: playing track {} {:?}",
            index,
            chain.tracks()[index].name()
        ),
        Advance::Finished => info!("BreakCore: break finished"),
        Advance::Ignored => {}
    }
}
