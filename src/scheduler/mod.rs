//! Measurement scheduling for one exam: the immediate first reading, the
//! timed slots after it, and the confirmation gate on each slot.

pub mod protocol;
pub mod slot;

use std::time::Duration;

use chrono::{DateTime, Utc};

pub use protocol::{Protocol, ALERT_WINDOW, IMMINENT_THRESHOLD_MS};
pub use slot::{Slot, SlotState, SlotTransition};

use crate::{
    errors::{ExamError, ExamResult},
    exam::{Exam, Measurement},
};

/// Record the immediate first measurement with empty PIO.
pub fn start_first(exam: &mut Exam, now: DateTime<Utc>) -> ExamResult<Measurement> {
    if !exam.measures.is_empty() {
        return Err(ExamError::InvalidPhase {
            exam_id: exam.id.clone(),
            action: "start the first measurement",
            phase: "measurements already exist",
        });
    }
    let protocol = Protocol::for_type(exam.exam_type);
    let measurement = Measurement::confirmed_at(protocol.label_for(0), now);
    exam.measures.push(measurement.clone());
    Ok(measurement)
}

/// Pending slot for the next unrecorded measurement, due `wait` from `now`.
pub fn schedule_next(exam: &Exam, wait: Duration, now: DateTime<Utc>) -> ExamResult<Slot> {
    let protocol = Protocol::for_type(exam.exam_type);
    let index = exam.measures.len();
    if index >= protocol.required_measures {
        return Err(ExamError::InvalidPhase {
            exam_id: exam.id.clone(),
            action: "schedule another measurement",
            phase: "all measurements are recorded",
        });
    }
    let wait = chrono::Duration::from_std(wait).map_err(|err| ExamError::InvalidReading {
        field: "interval",
        reason: err.to_string(),
    })?;
    Ok(Slot::new(index, protocol.label_for(index), now + wait))
}

/// Confirm the slot if it is due (or expired), appending its measurement.
///
/// The slot is consumed on success, so a second confirmation reports
/// [`ExamError::NoPendingSlot`] instead of appending twice.
pub fn confirm(
    slot: &mut Option<Slot>,
    exam: &mut Exam,
    now: DateTime<Utc>,
) -> ExamResult<Measurement> {
    let pending = slot
        .as_ref()
        .ok_or_else(|| ExamError::NoPendingSlot(exam.id.clone()))?;

    if !pending.is_ready() {
        return Err(ExamError::NotReady {
            remaining: pending.remaining(now),
        });
    }

    let protocol = Protocol::for_type(exam.exam_type);
    if exam.measures.len() >= protocol.required_measures {
        return Err(ExamError::InvalidPhase {
            exam_id: exam.id.clone(),
            action: "record another measurement",
            phase: "all measurements are recorded",
        });
    }

    let measurement = Measurement::confirmed_at(protocol.label_for(exam.measures.len()), now);
    exam.measures.push(measurement.clone());
    *slot = None;
    Ok(measurement)
}
