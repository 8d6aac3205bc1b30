use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::{sync::Mutex, task::JoinHandle};
use uuid::Uuid;

use crate::{
    alert::AlertController,
    clock::{self, SharedClock},
    errors::{ExamError, ExamResult},
    events::{AlertStopReason, EventBus, StationEvent},
    repository::{ExamRepository, History, HistoryScope},
    scheduler::{Slot, SlotTransition, IMMINENT_THRESHOLD_MS},
};

use super::{Exam, ExamLifecycle, Eye, Measurement, NewExam, Phase};

/// One exam card as the station shows it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExamCard {
    pub exam: Exam,
    pub phase: Phase,
    pub alerting: bool,
    /// Milliseconds to the pending slot, negative once it is due.
    pub remaining_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StationSnapshot {
    /// Exams driven from this station, oldest first.
    pub local: Vec<ExamCard>,
    /// Ongoing exams of other stations.
    pub remote: Vec<Exam>,
    pub history: History,
}

type Sessions = HashMap<String, ExamLifecycle>;

struct ControllerInner {
    sessions: Mutex<Sessions>,
    tickers: StdMutex<HashMap<String, JoinHandle<()>>>,
    repository: ExamRepository,
    alerts: AlertController,
    events: EventBus,
    clock: SharedClock,
    tick_interval: Duration,
}

/// Runs every exam owned by this station: phase changes, countdown tickers,
/// alerts, and the saves each change requests.
///
/// Exams owned by other stations are never mutated here; operations on them
/// fail with [`ExamError::ReadOnly`].
#[derive(Clone)]
pub struct ExamController {
    inner: Arc<ControllerInner>,
}

impl ExamController {
    pub fn new(
        repository: ExamRepository,
        alerts: AlertController,
        events: EventBus,
        clock: SharedClock,
        tick_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                sessions: Mutex::new(HashMap::new()),
                tickers: StdMutex::new(HashMap::new()),
                repository,
                alerts,
                events,
                clock,
                tick_interval,
            }),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn repository(&self) -> &ExamRepository {
        &self.inner.repository
    }

    /// Pick up the ongoing exams this station owned before a restart.
    /// Those interrupted mid-interval wait for [`ExamController::resume`].
    pub async fn restore_local(&self) -> usize {
        let exams = self.inner.repository.local_ongoing();
        let mut sessions = self.inner.sessions.lock().await;
        let mut restored = 0;
        for exam in exams {
            let lifecycle = ExamLifecycle::restore(exam);
            if lifecycle.phase() == &Phase::AwaitingResume {
                self.inner.events.notice(format!(
                    "{} was interrupted; resume it to restart the interval",
                    lifecycle.exam().name
                ));
            }
            sessions.insert(lifecycle.exam().id.clone(), lifecycle);
            restored += 1;
        }
        info!("Restored {restored} ongoing exams");
        restored
    }

    pub async fn create(&self, intake: NewExam) -> ExamResult<Exam> {
        intake.validate()?;
        let intake = NewExam {
            name: intake.name.trim().to_string(),
            operator: intake.operator.trim().to_string(),
            dob: intake.dob.trim().to_string(),
            observation: intake.observation.trim().to_string(),
            ..intake
        };

        let exam = Exam::from_intake(Uuid::new_v4().to_string(), intake, self.now());
        let lifecycle = ExamLifecycle::new(exam.clone());

        self.inner
            .sessions
            .lock()
            .await
            .insert(exam.id.clone(), lifecycle);
        self.inner.repository.register_local(exam.clone());

        info!("Created {} exam {} for {}", exam.exam_type, exam.id, exam.name);
        self.inner.events.emit(StationEvent::ExamCreated {
            exam_id: exam.id.clone(),
            name: exam.name.clone(),
        });
        Ok(exam)
    }

    /// Record the immediate first measurement. Curva starts counting right
    /// away; TSH waits for the water.
    pub async fn start_first(&self, exam_id: &str) -> ExamResult<Measurement> {
        let now = self.now();
        let mut sessions = self.inner.sessions.lock().await;
        let lifecycle = self.local_mut(&mut sessions, exam_id)?;

        let measurement = lifecycle.start_first(now)?;
        let counting = lifecycle.slot().is_some();
        let exam = lifecycle.exam().clone();

        self.persist(exam.clone());
        self.inner.events.emit(StationEvent::MeasurementConfirmed {
            exam_id: exam_id.to_string(),
            measurement: measurement.clone(),
        });
        if counting {
            self.spawn_ticker(exam_id);
        } else {
            self.inner.events.notice(format!(
                "{}: give the patient the water, then mark it done",
                exam.name
            ));
        }
        Ok(measurement)
    }

    pub async fn water_done(&self, exam_id: &str) -> ExamResult<Slot> {
        let now = self.now();
        let mut sessions = self.inner.sessions.lock().await;
        let lifecycle = self.local_mut(&mut sessions, exam_id)?;
        let slot = lifecycle.water_done(now)?.clone();
        self.spawn_ticker(exam_id);
        Ok(slot)
    }

    /// Restart the interval of an exam restored without its pending slot.
    pub async fn resume(&self, exam_id: &str) -> ExamResult<Slot> {
        let now = self.now();
        let mut sessions = self.inner.sessions.lock().await;
        let lifecycle = self.local_mut(&mut sessions, exam_id)?;
        let slot = lifecycle.resume(now)?.clone();
        self.spawn_ticker(exam_id);
        Ok(slot)
    }

    /// One countdown step. Returns whether the exam still needs ticking.
    pub async fn tick(&self, exam_id: &str) -> bool {
        let now = self.now();
        let mut sessions = self.inner.sessions.lock().await;
        match sessions.get_mut(exam_id) {
            Some(lifecycle) => self.advance(lifecycle, now),
            None => false,
        }
    }

    /// Confirm the pending measurement. Refused with
    /// [`ExamError::NotReady`] before the slot is due.
    pub async fn confirm(&self, exam_id: &str) -> ExamResult<Measurement> {
        let now = self.now();
        let mut sessions = self.inner.sessions.lock().await;
        let lifecycle = self.local_mut(&mut sessions, exam_id)?;

        // The ticker may not have seen the due edge yet.
        self.advance(lifecycle, now);

        let measurement = match lifecycle.confirm(now) {
            Ok(measurement) => measurement,
            Err(err @ ExamError::NotReady { .. }) => {
                self.inner
                    .events
                    .notice(format!("{}: {err}", lifecycle.exam().name));
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let exam = lifecycle.exam().clone();
        let next_slot = lifecycle.slot().is_some();

        self.inner.alerts.stop(exam_id, AlertStopReason::Confirmed);
        self.cancel_ticker(exam_id);
        self.persist(exam.clone());
        self.inner.events.emit(StationEvent::MeasurementConfirmed {
            exam_id: exam_id.to_string(),
            measurement: measurement.clone(),
        });

        if next_slot {
            self.spawn_ticker(exam_id);
        } else {
            self.inner.events.notice(format!(
                "{}: all measurements taken, ready to finalize",
                exam.name
            ));
        }
        Ok(measurement)
    }

    pub async fn finalize(&self, exam_id: &str) -> ExamResult<Exam> {
        let now = self.now();
        let mut sessions = self.inner.sessions.lock().await;
        let lifecycle = self.local_mut(&mut sessions, exam_id)?;
        lifecycle.finalize(now)?;
        let exam = lifecycle.exam().clone();
        sessions.remove(exam_id);

        self.inner.alerts.stop(exam_id, AlertStopReason::Closed);
        self.cancel_ticker(exam_id);
        self.persist(exam.clone());

        info!("Finalized exam {exam_id} with {} measurements", exam.measures.len());
        self.inner.events.emit(StationEvent::ExamFinalized {
            exam_id: exam_id.to_string(),
        });
        Ok(exam)
    }

    /// Card click: silence the alert without confirming. Works on any card.
    pub fn dismiss_alert(&self, exam_id: &str) -> bool {
        self.inner.alerts.stop(exam_id, AlertStopReason::Dismissed)
    }

    pub fn is_alerting(&self, exam_id: &str) -> bool {
        self.inner.alerts.is_alerting(exam_id)
    }

    /// PIO readings are editable only while the exam is ongoing.
    pub async fn set_pio(&self, exam_id: &str, index: usize, eye: Eye, value: &str) -> ExamResult<()> {
        let mut sessions = self.inner.sessions.lock().await;
        let lifecycle = self.local_mut(&mut sessions, exam_id)?;
        lifecycle.set_pio(index, eye, value)?;
        self.persist(lifecycle.exam().clone());
        Ok(())
    }

    /// Paquimetria stays editable after completion, also on exams finished
    /// by other stations.
    pub async fn set_paquimetria(&self, exam_id: &str, od: &str, oe: &str) -> ExamResult<()> {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(lifecycle) = sessions.get_mut(exam_id) {
            lifecycle.set_paquimetria(od, oe)?;
            self.persist(lifecycle.exam().clone());
            return Ok(());
        }
        drop(sessions);
        self.edit_completed(exam_id, |exam| exam.set_paquimetria(od, oe))
    }

    pub async fn set_observation(&self, exam_id: &str, observation: &str) -> ExamResult<()> {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(lifecycle) = sessions.get_mut(exam_id) {
            lifecycle.set_observation(observation);
            self.persist(lifecycle.exam().clone());
            return Ok(());
        }
        drop(sessions);
        self.edit_completed(exam_id, |exam| {
            exam.observation = observation.trim().to_string();
            Ok(())
        })
    }

    pub async fn delete(&self, exam_id: &str) -> anyhow::Result<()> {
        self.inner.repository.delete(exam_id).await?;

        self.inner.sessions.lock().await.remove(exam_id);
        self.cancel_ticker(exam_id);
        self.inner.alerts.stop(exam_id, AlertStopReason::Closed);
        info!("Deleted exam {exam_id}");
        Ok(())
    }

    pub async fn clear_history(&self, scope: HistoryScope) -> anyhow::Result<usize> {
        self.inner.repository.clear_history(scope, self.now()).await
    }

    pub async fn snapshot(&self) -> StationSnapshot {
        let now = self.now();
        let sessions = self.inner.sessions.lock().await;
        let mut local: Vec<ExamCard> = sessions
            .values()
            .map(|lifecycle| ExamCard {
                exam: lifecycle.exam().clone(),
                phase: lifecycle.phase().clone(),
                alerting: self.inner.alerts.is_alerting(&lifecycle.exam().id),
                remaining_ms: lifecycle.slot().map(|slot| slot.remaining_ms(now)),
            })
            .collect();
        drop(sessions);
        local.sort_by_key(|card| card.exam.start);

        StationSnapshot {
            local,
            remote: self.inner.repository.remote_ongoing(),
            history: self.inner.repository.history(now),
        }
    }

    /// Stop every ticker. Pending saves still drain through the repository.
    pub fn shutdown(&self) {
        let mut tickers = self.lock_tickers();
        for (_, handle) in tickers.drain() {
            handle.abort();
        }
    }

    /// Apply due/expiry edges and emit the countdown. Returns whether the
    /// slot still needs ticking.
    fn advance(&self, lifecycle: &mut ExamLifecycle, now: DateTime<Utc>) -> bool {
        let expires_at = lifecycle.slot().map(Slot::expires_at);
        let Some(outcome) = lifecycle.tick(now) else {
            return false;
        };
        let exam_id = lifecycle.exam().id.as_str();
        let expired = outcome.transitions.contains(&SlotTransition::Expired);

        for transition in &outcome.transitions {
            match transition {
                SlotTransition::BecameDue => {
                    info!("Exam {exam_id} measurement #{} is due", outcome.slot_index + 1);
                    self.inner.events.emit(StationEvent::SlotBecameDue {
                        exam_id: exam_id.to_string(),
                        slot_index: outcome.slot_index,
                    });
                    if !expired {
                        let window = expires_at
                            .and_then(|at| (at - now).to_std().ok())
                            .unwrap_or(Duration::ZERO);
                        self.inner.alerts.start(exam_id, outcome.slot_index, window);
                    }
                }
                SlotTransition::Expired => {
                    debug!("Exam {exam_id} slot {} expired unconfirmed", outcome.slot_index);
                    self.inner.alerts.stop(exam_id, AlertStopReason::TimedOut);
                    self.inner.events.emit(StationEvent::SlotExpiredVisually {
                        exam_id: exam_id.to_string(),
                        slot_index: outcome.slot_index,
                    });
                }
            }
        }

        if outcome.remaining_ms > 0 {
            self.inner.events.emit(StationEvent::Countdown {
                exam_id: exam_id.to_string(),
                slot_index: outcome.slot_index,
                remaining_ms: outcome.remaining_ms,
                imminent: outcome.remaining_ms <= IMMINENT_THRESHOLD_MS,
            });
        }

        outcome.keep_ticking
    }

    fn local_mut<'a>(&self, sessions: &'a mut Sessions, exam_id: &str) -> ExamResult<&'a mut ExamLifecycle> {
        match sessions.get_mut(exam_id) {
            Some(lifecycle) => Ok(lifecycle),
            None => Err(self.not_local(exam_id)),
        }
    }

    fn not_local(&self, exam_id: &str) -> ExamError {
        let repository = &self.inner.repository;
        if repository.is_remote_ongoing(exam_id) {
            ExamError::ReadOnly(exam_id.to_string())
        } else if repository
            .get(exam_id)
            .is_some_and(|cached| cached.exam.is_completed())
        {
            ExamError::AlreadyCompleted(exam_id.to_string())
        } else {
            ExamError::NotFound(exam_id.to_string())
        }
    }

    fn edit_completed(
        &self,
        exam_id: &str,
        edit: impl FnOnce(&mut Exam) -> ExamResult<()>,
    ) -> ExamResult<()> {
        let repository = &self.inner.repository;
        if repository.is_remote_ongoing(exam_id) {
            return Err(ExamError::ReadOnly(exam_id.to_string()));
        }
        let mut cached = repository
            .get(exam_id)
            .filter(|cached| cached.exam.is_completed())
            .ok_or_else(|| ExamError::NotFound(exam_id.to_string()))?;
        edit(&mut cached.exam)?;
        repository.save(cached.exam)
    }

    fn persist(&self, exam: Exam) {
        let exam_id = exam.id.clone();
        if let Err(err) = self.inner.repository.save(exam) {
            warn!("Not saving exam {exam_id}: {err}");
        }
    }

    fn lock_tickers(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        match self.inner.tickers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spawn_ticker(&self, exam_id: &str) {
        let controller = self.clone();
        let ticker_exam_id = exam_id.to_string();
        let period = self.inner.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = clock::ticker(period);
            loop {
                interval.tick().await;
                if !controller.tick(&ticker_exam_id).await {
                    break;
                }
            }
            debug!("Countdown for exam {ticker_exam_id} stopped");
        });

        if let Some(previous) = self.lock_tickers().insert(exam_id.to_string(), handle) {
            previous.abort();
        }
    }

    fn cancel_ticker(&self, exam_id: &str) {
        if let Some(handle) = self.lock_tickers().remove(exam_id) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tokio::{sync::mpsc::UnboundedReceiver, time};

    use super::*;
    use crate::{
        alert::SilentAlertSound,
        clock::MonotonicClock,
        exam::{ExamStatus, ExamType},
        repository::OwnershipLedger,
        store::{ExamStore, MemoryExamStore},
    };

    struct Station {
        controller: ExamController,
        repository: ExamRepository,
        events: UnboundedReceiver<StationEvent>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn minutes(n: u64) -> Duration {
        Duration::from_secs(n * 60)
    }

    fn station(store: Arc<MemoryExamStore>) -> Station {
        let (events, rx) = EventBus::channel();
        let repository = ExamRepository::new(store, OwnershipLedger::in_memory(), events.clone());
        let alerts = AlertController::new(Arc::new(SilentAlertSound), events.clone());
        let controller = ExamController::new(
            repository.clone(),
            alerts,
            events,
            MonotonicClock::anchored_at(t0()).shared(),
            Duration::from_secs(1),
        );
        Station {
            controller,
            repository,
            events: rx,
        }
    }

    fn intake(exam_type: ExamType) -> NewExam {
        NewExam {
            name: " Maria das Dores ".into(),
            dob: "1955-04-20".into(),
            operator: "Dr. Lima".into(),
            exam_type,
            observation: String::new(),
        }
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

    #[tokio::test(start_paused = true)]
    async fn tsh_exam_from_intake_to_completion() {
        let store = Arc::new(MemoryExamStore::new());
        let mut station = station(store.clone());
        let controller = station.controller.clone();

        let exam = controller.create(intake(ExamType::Tsh)).await.unwrap();
        let id = exam.id.clone();
        assert_eq!(exam.name, "Maria das Dores");

        let first = controller.start_first(&id).await.unwrap();
        assert_eq!(first.measure, "1ª Medida (Sem Água)");

        time::advance(minutes(5)).await;
        let slot = controller.water_done(&id).await.unwrap();
        assert_eq!(slot.due, t0() + chrono::Duration::minutes(20));

        time::advance(minutes(14)).await;
        settle().await;
        let err = controller.confirm(&id).await.unwrap_err();
        assert_eq!(err, ExamError::NotReady { remaining: minutes(1) });
        assert_eq!(station.repository.get(&id).unwrap().exam.measures.len(), 1);

        time::advance(minutes(1)).await;
        settle().await;
        assert!(controller.is_alerting(&id));

        let second = controller.confirm(&id).await.unwrap();
        assert_eq!(second.measure, "Medida 2");
        assert!(!controller.is_alerting(&id));

        for _ in 0..2 {
            time::advance(minutes(15)).await;
            settle().await;
            controller.confirm(&id).await.unwrap();
        }

        let done = controller.finalize(&id).await.unwrap();
        assert_eq!(done.status, ExamStatus::Completed);
        assert_eq!(done.measures.len(), 4);
        assert_eq!(done.end, Some(t0() + chrono::Duration::minutes(50)));

        station.repository.flush().await;
        let stored = store.fetch_all().await.unwrap();
        assert_eq!(stored[0]["status"], "completed");
        assert_eq!(stored[0]["measures"].as_array().map(Vec::len), Some(4));

        let events = drain(&mut station.events);
        let confirmed = events
            .iter()
            .filter(|event| matches!(event, StationEvent::MeasurementConfirmed { .. }))
            .count();
        assert_eq!(confirmed, 4);
        assert!(events
            .iter()
            .any(|event| matches!(event, StationEvent::Notice { message } if message.contains("not ready"))));
        assert!(events
            .iter()
            .any(|event| matches!(event, StationEvent::ExamFinalized { .. })));
        assert!(!events
            .iter()
            .any(|event| matches!(event, StationEvent::ExamSaveFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn alert_stops_itself_after_window() {
        let mut station = station(Arc::new(MemoryExamStore::new()));
        let controller = station.controller.clone();
        let id = controller.create(intake(ExamType::Curva)).await.unwrap().id;
        controller.start_first(&id).await.unwrap();

        time::advance(minutes(180)).await;
        settle().await;
        assert!(controller.is_alerting(&id));

        time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert!(!controller.is_alerting(&id));

        let events = drain(&mut station.events);
        assert!(events.iter().any(|event| matches!(
            event,
            StationEvent::AlertStopped { reason: AlertStopReason::TimedOut, .. }
        )));
        assert!(events
            .iter()
            .any(|event| matches!(event, StationEvent::SlotExpiredVisually { .. })));

        // Expired slots stay confirmable.
        time::advance(minutes(5)).await;
        controller.confirm(&id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_marks_last_seconds_imminent() {
        let mut station = station(Arc::new(MemoryExamStore::new()));
        let controller = station.controller.clone();
        let id = controller.create(intake(ExamType::Tsh)).await.unwrap().id;
        controller.start_first(&id).await.unwrap();
        controller.water_done(&id).await.unwrap();
        settle().await;
        drain(&mut station.events);

        time::advance(minutes(15) - Duration::from_secs(5)).await;
        assert!(controller.tick(&id).await);
        let imminent = drain(&mut station.events).into_iter().any(|event| {
            matches!(event, StationEvent::Countdown { imminent: true, remaining_ms, .. } if remaining_ms <= 5_000)
        });
        assert!(imminent);
    }

    #[tokio::test(start_paused = true)]
    async fn card_click_silences_without_confirming() {
        let station = station(Arc::new(MemoryExamStore::new()));
        let controller = station.controller.clone();
        let id = controller.create(intake(ExamType::Curva)).await.unwrap().id;
        controller.start_first(&id).await.unwrap();

        time::advance(minutes(180)).await;
        settle().await;
        assert!(controller.dismiss_alert(&id));
        assert!(!controller.is_alerting(&id));

        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.local[0].exam.measures.len(), 1);
        controller.confirm(&id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn other_station_sees_read_only_mirror() {
        let store = Arc::new(MemoryExamStore::new());
        let station_a = station(store.clone());
        let station_b = station(store.clone());
        station_a.repository.subscribe_ongoing().await.unwrap();
        station_b.repository.subscribe_ongoing().await.unwrap();

        let id = station_a
            .controller
            .create(intake(ExamType::Curva))
            .await
            .unwrap()
            .id;
        station_a.repository.flush().await;
        settle().await;

        let b_view = station_b.controller.snapshot().await;
        assert!(b_view.local.is_empty());
        assert_eq!(b_view.remote.len(), 1);
        assert!(station_a.controller.snapshot().await.remote.is_empty());

        assert_eq!(
            station_b.controller.start_first(&id).await,
            Err(ExamError::ReadOnly(id.clone()))
        );
        assert_eq!(
            station_b.controller.set_paquimetria(&id, "540", "541").await,
            Err(ExamError::ReadOnly(id.clone()))
        );
        assert!(station_b.controller.delete(&id).await.is_err());

        // Progress made on A reaches the mirror on B.
        station_a.controller.start_first(&id).await.unwrap();
        station_a.repository.flush().await;
        settle().await;
        assert_eq!(station_b.repository.remote_ongoing()[0].measures.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn paquimetria_editable_after_completion_pio_is_not() {
        let station = station(Arc::new(MemoryExamStore::new()));
        let controller = station.controller.clone();
        let id = controller.create(intake(ExamType::Curva)).await.unwrap().id;
        controller.start_first(&id).await.unwrap();
        for _ in 0..2 {
            time::advance(minutes(180)).await;
            controller.confirm(&id).await.unwrap();
        }
        controller.finalize(&id).await.unwrap();

        controller.set_paquimetria(&id, "545", "550").await.unwrap();
        controller.set_observation(&id, "revisado").await.unwrap();
        assert_eq!(
            controller.set_pio(&id, 0, Eye::Od, "15").await,
            Err(ExamError::AlreadyCompleted(id.clone()))
        );

        let cached = station.repository.get(&id).unwrap().exam;
        assert_eq!(cached.paquimetria.od, "545");
        assert_eq!(cached.observation, "revisado");
    }

    #[tokio::test(start_paused = true)]
    async fn restored_exam_waits_for_resume() {
        let store = Arc::new(MemoryExamStore::new());
        let ledger = OwnershipLedger::in_memory();

        let mut exam = Exam::from_intake("restored".into(), intake(ExamType::Tsh), t0());
        exam.measures
            .push(Measurement::confirmed_at("1ª Medida (Sem Água)", t0()));
        store.upsert(&exam).await.unwrap();
        ledger.claim("restored").unwrap();

        let (events, _rx) = EventBus::channel();
        let repository = ExamRepository::new(store, ledger, events.clone());
        repository.load_all(t0()).await.unwrap();
        let controller = ExamController::new(
            repository,
            AlertController::new(Arc::new(SilentAlertSound), events.clone()),
            events,
            MonotonicClock::anchored_at(t0()).shared(),
            Duration::from_secs(1),
        );

        assert_eq!(controller.restore_local().await, 1);
        assert!(matches!(
            controller.confirm("restored").await,
            Err(ExamError::NoPendingSlot(_))
        ));
        let slot = controller.resume("restored").await.unwrap();
        assert_eq!(slot.index, 1);
        assert_eq!(slot.due, t0() + chrono::Duration::minutes(15));
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_requires_every_measurement() {
        let station = station(Arc::new(MemoryExamStore::new()));
        let controller = station.controller.clone();
        let id = controller.create(intake(ExamType::Curva)).await.unwrap().id;
        controller.start_first(&id).await.unwrap();

        assert!(matches!(
            controller.finalize(&id).await,
            Err(ExamError::IncompleteMeasurements { have: 1, required: 3, .. })
        ));
        assert_eq!(
            controller.confirm("unknown").await,
            Err(ExamError::NotFound("unknown".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delete_stops_everything() {
        let store = Arc::new(MemoryExamStore::new());
        let station = station(store.clone());
        let controller = station.controller.clone();
        let id = controller.create(intake(ExamType::Curva)).await.unwrap().id;
        controller.start_first(&id).await.unwrap();
        time::advance(minutes(180)).await;
        settle().await;
        assert!(controller.is_alerting(&id));

        controller.delete(&id).await.unwrap();
        assert!(!controller.is_alerting(&id));
        assert!(controller.snapshot().await.local.is_empty());
        assert!(store.fetch_all().await.unwrap().is_empty());
        assert!(!controller.tick(&id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn intake_is_validated() {
        let station = station(Arc::new(MemoryExamStore::new()));
        let mut bad = intake(ExamType::Tsh);
        bad.dob = "20/04/1955".into();
        assert!(matches!(
            station.controller.create(bad).await,
            Err(ExamError::InvalidIntake(_))
        ));
    }
}
