//! Due-measurement alerts: a looping chime plus a pulsing card, per exam.

#[cfg(feature = "audio")]
pub mod chime;
pub mod engine;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use log::{debug, warn};
use tokio::task::JoinHandle;

pub use engine::{alert_sound, AlertSound, SilentAlertSound};

use crate::events::{AlertStopReason, EventBus, StationEvent};

struct ActiveAlert {
    slot_index: usize,
    generation: u64,
    auto_stop: JoinHandle<()>,
}

struct AlertInner {
    sound: Arc<dyn AlertSound>,
    events: EventBus,
    active: Mutex<HashMap<String, ActiveAlert>>,
    generation: AtomicU64,
}

/// Tracks which exams are alerting and owns their auto-stop timers.
///
/// Each exam has at most one alert and one auto-stop timer; the sound keeps
/// playing while any exam on the station is alerting.
#[derive(Clone)]
pub struct AlertController {
    inner: Arc<AlertInner>,
}

impl AlertController {
    pub fn new(sound: Arc<dyn AlertSound>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(AlertInner {
                sound,
                events,
                active: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start alerting for `exam_id`, silencing itself after `auto_stop_after`.
    /// A previous alert on the same exam is replaced and its timer cancelled.
    pub fn start(&self, exam_id: &str, slot_index: usize, auto_stop_after: Duration) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let (replaced, was_silent) = {
            // Held across the spawn so the timer cannot expire an entry that
            // has not been inserted yet.
            let mut active = self.inner.lock_active();
            let inner = self.inner.clone();
            let timer_exam_id = exam_id.to_string();
            let auto_stop = tokio::spawn(async move {
                tokio::time::sleep(auto_stop_after).await;
                inner.expire(&timer_exam_id, generation);
            });

            let was_silent = active.is_empty();
            let replaced = active.insert(
                exam_id.to_string(),
                ActiveAlert {
                    slot_index,
                    generation,
                    auto_stop,
                },
            );
            (replaced, was_silent)
        };

        if let Some(previous) = replaced {
            debug!(
                "alert for exam {exam_id} slot {} replaced by slot {slot_index}",
                previous.slot_index
            );
            previous.auto_stop.abort();
        }

        if was_silent {
            if let Err(err) = self.inner.sound.start() {
                warn!("alert sound failed to start for exam {exam_id}: {err:#}");
            }
        }

        self.inner.events.emit(StationEvent::AlertStarted {
            exam_id: exam_id.to_string(),
            slot_index,
        });
    }

    /// Stop the alert for `exam_id` if one is active. Returns whether it was.
    pub fn stop(&self, exam_id: &str, reason: AlertStopReason) -> bool {
        let removed = self.inner.lock_active().remove(exam_id);
        match removed {
            Some(alert) => {
                alert.auto_stop.abort();
                self.inner.finish(exam_id, reason);
                true
            }
            None => false,
        }
    }

    pub fn is_alerting(&self, exam_id: &str) -> bool {
        self.inner.lock_active().contains_key(exam_id)
    }

    pub fn alerting_count(&self) -> usize {
        self.inner.lock_active().len()
    }
}

impl AlertInner {
    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, ActiveAlert>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Auto-stop path. Ignored if the alert was replaced since the timer began.
    fn expire(&self, exam_id: &str, generation: u64) {
        let expired = {
            let mut active = self.lock_active();
            match active.get(exam_id) {
                Some(alert) if alert.generation == generation => active.remove(exam_id).is_some(),
                _ => false,
            }
        };
        if expired {
            self.finish(exam_id, AlertStopReason::TimedOut);
        }
    }

    fn finish(&self, exam_id: &str, reason: AlertStopReason) {
        if self.lock_active().is_empty() {
            self.sound.stop();
        }
        self.events.emit(StationEvent::AlertStopped {
            exam_id: exam_id.to_string(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use anyhow::anyhow;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time;

    use super::*;

    #[derive(Default)]
    struct CountingSound {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl AlertSound for CountingSound {
        fn start(&self) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct BlockedSound;

    impl AlertSound for BlockedSound {
        fn start(&self) -> anyhow::Result<()> {
            Err(anyhow!("autoplay blocked"))
        }

        fn stop(&self) {}
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(rx: &mut UnboundedReceiver<StationEvent>) -> Vec<StationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn stopped(exam_id: &str, reason: AlertStopReason) -> StationEvent {
        StationEvent::AlertStopped {
            exam_id: exam_id.into(),
            reason,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auto_stops_after_window() {
        let (events, mut rx) = EventBus::channel();
        let alerts = AlertController::new(Arc::new(SilentAlertSound), events);

        alerts.start("a", 1, Duration::from_secs(30));
        time::advance(Duration::from_secs(29)).await;
        settle().await;
        assert!(alerts.is_alerting("a"));

        time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(!alerts.is_alerting("a"));
        assert_eq!(
            drain(&mut rx),
            vec![
                StationEvent::AlertStarted { exam_id: "a".into(), slot_index: 1 },
                stopped("a", AlertStopReason::TimedOut),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn manual_stop_preempts_auto_stop() {
        let (events, mut rx) = EventBus::channel();
        let alerts = AlertController::new(Arc::new(SilentAlertSound), events);

        alerts.start("a", 1, Duration::from_secs(30));
        time::advance(Duration::from_secs(10)).await;
        assert!(alerts.stop("a", AlertStopReason::Dismissed));
        assert!(!alerts.stop("a", AlertStopReason::Dismissed));

        time::advance(Duration::from_secs(60)).await;
        settle().await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], stopped("a", AlertStopReason::Dismissed));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_cancels_previous_timer() {
        let (events, _rx) = EventBus::channel();
        let alerts = AlertController::new(Arc::new(SilentAlertSound), events);

        alerts.start("a", 1, Duration::from_secs(30));
        time::advance(Duration::from_secs(20)).await;
        alerts.start("a", 2, Duration::from_secs(30));

        time::advance(Duration::from_secs(15)).await;
        settle().await;
        assert!(alerts.is_alerting("a"), "first timer must not stop the second alert");

        time::advance(Duration::from_secs(15)).await;
        settle().await;
        assert!(!alerts.is_alerting("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn sound_runs_while_any_exam_alerts() {
        let sound = Arc::new(CountingSound::default());
        let (events, _rx) = EventBus::channel();
        let alerts = AlertController::new(sound.clone(), events);

        alerts.start("a", 1, Duration::from_secs(30));
        alerts.start("b", 2, Duration::from_secs(30));
        assert_eq!(sound.starts.load(Ordering::SeqCst), 1);

        alerts.stop("a", AlertStopReason::Confirmed);
        assert_eq!(sound.stops.load(Ordering::SeqCst), 0);
        alerts.stop("b", AlertStopReason::Dismissed);
        assert_eq!(sound.stops.load(Ordering::SeqCst), 1);
        assert_eq!(alerts.alerting_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_audio_still_alerts_visually() {
        let (events, mut rx) = EventBus::channel();
        let alerts = AlertController::new(Arc::new(BlockedSound), events);

        alerts.start("a", 3, Duration::from_secs(30));
        assert!(alerts.is_alerting("a"));
        assert_eq!(
            drain(&mut rx),
            vec![StationEvent::AlertStarted { exam_id: "a".into(), slot_index: 3 }]
        );
    }
}
