//! Events the station core emits for whatever renders exam cards.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::exam::{Exam, Measurement};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AlertStopReason {
    /// Alert window elapsed.
    TimedOut,
    /// Operator clicked the exam card.
    Dismissed,
    Confirmed,
    /// Exam finalized or deleted.
    Closed,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum StationEvent {
    #[serde(rename_all = "camelCase")]
    ExamCreated { exam_id: String, name: String },
    #[serde(rename_all = "camelCase")]
    Countdown {
        exam_id: String,
        slot_index: usize,
        remaining_ms: i64,
        imminent: bool,
    },
    #[serde(rename_all = "camelCase")]
    SlotBecameDue { exam_id: String, slot_index: usize },
    #[serde(rename_all = "camelCase")]
    SlotExpiredVisually { exam_id: String, slot_index: usize },
    #[serde(rename_all = "camelCase")]
    AlertStarted { exam_id: String, slot_index: usize },
    #[serde(rename_all = "camelCase")]
    AlertStopped {
        exam_id: String,
        reason: AlertStopReason,
    },
    #[serde(rename_all = "camelCase")]
    MeasurementConfirmed {
        exam_id: String,
        measurement: Measurement,
    },
    #[serde(rename_all = "camelCase")]
    ExamFinalized { exam_id: String },
    #[serde(rename_all = "camelCase")]
    ExamSaved { exam_id: String },
    #[serde(rename_all = "camelCase")]
    ExamSaveFailed { exam_id: String, reason: String },
    #[serde(rename_all = "camelCase")]
    ExamDeleted { exam_id: String },
    /// Ongoing exams run by other stations, read-only here.
    RemoteOngoingChanged { exams: Vec<Exam> },
    /// Transient operator message.
    Notice { message: String },
}

/// Fan-out point for [`StationEvent`]s.
///
/// Emission never fails: a presentation layer that has gone away must not
/// stall the measurement workflow.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<StationEvent>,
}

impl EventBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: StationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn notice(&self, message: impl Into<String>) {
        self.emit(StationEvent::Notice {
            message: message.into(),
        });
    }
}
