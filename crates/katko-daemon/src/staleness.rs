//! Periodic re-check of the slot choice for the lifetime of one session.
//!
//! The watcher never reloads by itself.  It only reports that a different
//! slot is now closest, once per distinct newer slot.  If the clock swings
//! back to the loaded slot it says so once and re-arms.

use chrono::NaiveDateTime;
use katko_proto::slot::{select_closest, SlotLabel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Wall-clock source.  Injected so timer tests can move time by hand.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub fn local_clock() -> Clock {
    Arc::new(|| chrono::Local::now().naive_local())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleNotice {
    pub loaded: SlotLabel,
    /// `None` once the loaded slot is the closest again.
    pub closest: Option<SlotLabel>,
}

pub struct StalenessWatcher {
    candidates: Vec<SlotLabel>,
    loaded: SlotLabel,
    signaled: Option<SlotLabel>,
}

impl StalenessWatcher {
    /// `candidates` is the set the loaded slot was chosen from; it is not
    /// re-fetched.
    pub fn new(candidates: Vec<SlotLabel>, loaded: SlotLabel) -> Self {
        Self {
            candidates,
            loaded,
            signaled: None,
        }
    }

    /// Returns a notice the first time a different slot is closest, and
    /// again when the loaded slot takes over after that.
    pub fn check(&mut self, now: NaiveDateTime) -> Option<StaleNotice> {
        let closest = select_closest(&self.candidates, now).ok()?;
        if *closest == self.loaded {
            self.signaled.take()?;
            return Some(self.notice(None));
        }
        if self.signaled.as_ref() == Some(closest) {
            return None;
        }
        self.signaled = Some(closest.clone());
        Some(self.notice(Some(closest.clone())))
    }

    fn notice(&self, closest: Option<SlotLabel>) -> StaleNotice {
        StaleNotice {
            loaded: self.loaded.clone(),
            closest,
        }
    }

    /// Run the check every `period` until the returned task is dropped or
    /// the receiver goes away.  The first check happens one period in.
    pub fn spawn(
        mut self,
        period: Duration,
        clock: Clock,
        tx: mpsc::Sender<StaleNotice>,
    ) -> WatcherTask {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let now = clock();
                let Some(notice) = self.check(now) else {
                    continue;
                };
                match &notice.closest {
                    Some(closest) => info!(
                        "staleness: slot {} is now closer than loaded {}",
                        closest, self.loaded
                    ),
                    None => info!("staleness: loaded slot {} is closest again", self.loaded),
                }
                if tx.send(notice).await.is_err() {
                    break;
                }
            }
            debug!("staleness: watcher for {} stopped", self.loaded);
        });
        WatcherTask {
            cancel,
            handle: Some(handle),
        }
    }
}

/// Owner of a running watcher.  Dropping it cancels the timer.
pub struct WatcherTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl WatcherTask {
    /// Cancel and wait for the task to wind down.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for WatcherTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    const PERIOD: Duration = Duration::from_secs(120);

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 17)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn slot(label: &str) -> SlotLabel {
        SlotLabel::parse(label).unwrap()
    }

    fn watcher() -> StalenessWatcher {
        StalenessWatcher::new(vec![slot("1400"), slot("1500")], slot("1400"))
    }

    fn manual_clock(start: NaiveDateTime) -> (Clock, Arc<Mutex<NaiveDateTime>>) {
        let now = Arc::new(Mutex::new(start));
        let reader = now.clone();
        (Arc::new(move || *reader.lock().unwrap()), now)
    }

    fn closest(w: &mut StalenessWatcher, now: NaiveDateTime) -> Option<Option<SlotLabel>> {
        w.check(now).map(|notice| notice.closest)
    }

    #[test]
    fn check_is_edge_triggered() {
        let mut w = watcher();
        assert_eq!(closest(&mut w, at(14, 10)), None);
        assert_eq!(closest(&mut w, at(14, 40)), Some(Some(slot("1500"))));
        assert_eq!(closest(&mut w, at(14, 45)), None);
        assert_eq!(closest(&mut w, at(15, 30)), None);
    }

    #[test]
    fn check_clears_once_and_rearms_when_loaded_slot_is_closest_again() {
        let mut w = watcher();
        assert_eq!(closest(&mut w, at(14, 40)), Some(Some(slot("1500"))));
        assert_eq!(closest(&mut w, at(14, 20)), Some(None));
        assert_eq!(closest(&mut w, at(14, 10)), None);
        assert_eq!(closest(&mut w, at(14, 50)), Some(Some(slot("1500"))));
    }

    #[test]
    fn each_distinct_newer_slot_is_reported() {
        let mut w = StalenessWatcher::new(
            vec![slot("1400"), slot("1500"), slot("1600")],
            slot("1400"),
        );
        let notice = w.check(at(14, 50)).unwrap();
        assert_eq!(notice.loaded, slot("1400"));
        assert_eq!(notice.closest, Some(slot("1500")));
        assert_eq!(closest(&mut w, at(15, 50)), Some(Some(slot("1600"))));
    }

    #[tokio::test(start_paused = true)]
    async fn signals_once_per_change() {
        let (clock, _now) = manual_clock(at(14, 40));
        let (tx, mut rx) = mpsc::channel(4);
        let _task = watcher().spawn(PERIOD, clock, tx);

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.loaded, slot("1400"));
        assert_eq!(notice.closest, Some(slot("1500")));

        // several more ticks, same answer, nothing new
        let quiet = tokio::time::timeout(PERIOD * 5, rx.recv()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn first_check_waits_one_period() {
        let (clock, _now) = manual_clock(at(14, 40));
        let (tx, mut rx) = mpsc::channel(4);
        let _task = watcher().spawn(PERIOD, clock, tx);

        let early = tokio::time::timeout(PERIOD / 2, rx.recv()).await;
        assert!(early.is_err());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn rearms_after_clock_returns() {
        let (clock, now) = manual_clock(at(14, 40));
        let (tx, mut rx) = mpsc::channel(4);
        let _task = watcher().spawn(PERIOD, clock, tx);

        assert!(rx.recv().await.is_some());
        *now.lock().unwrap() = at(14, 20);
        let cleared = rx.recv().await.unwrap();
        assert_eq!(cleared.closest, None);
        assert!(tokio::time::timeout(PERIOD * 2, rx.recv()).await.is_err());
        *now.lock().unwrap() = at(14, 50);
        let again = rx.recv().await.unwrap();
        assert_eq!(again.closest, Some(slot("1500")));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_task_cancels_the_timer() {
        let (clock, _now) = manual_clock(at(14, 40));
        let (tx, mut rx) = mpsc::channel(4);
        let task = watcher().spawn(PERIOD, clock, tx);
        task.shutdown().await;
        // sender went away with the task; no notice was ever produced
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_stops_when_receiver_is_gone() {
        let (clock, _now) = manual_clock(at(14, 40));
        let (tx, rx) = mpsc::channel(4);
        let mut task = watcher().spawn(PERIOD, clock, tx);
        drop(rx);
        let handle = task.handle.take().unwrap();
        assert!(tokio::time::timeout(PERIOD * 2, handle).await.is_ok());
    }
}
