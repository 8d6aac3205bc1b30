use std::time::Duration;

use thiserror::Error;

use crate::exam::ExamType;

/// Rejections produced by the measurement workflow.
///
/// None of these are fatal: the controller reports them to the operator and
/// leaves the exam exactly as it was.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExamError {
    #[error("measurement not ready yet, {} remaining", crate::clock::format_remaining(.remaining))]
    NotReady { remaining: Duration },

    #[error("no measurement is waiting for confirmation on exam {0}")]
    NoPendingSlot(String),

    #[error("exam {0} not found")]
    NotFound(String),

    #[error("exam {0} belongs to another station and is read-only here")]
    ReadOnly(String),

    #[error("exam {exam_id} cannot {action} while {phase}")]
    InvalidPhase {
        exam_id: String,
        action: &'static str,
        phase: &'static str,
    },

    #[error("{exam_type} exam has {have} of {required} measurements")]
    IncompleteMeasurements {
        exam_type: ExamType,
        have: usize,
        required: usize,
    },

    #[error("exam {0} is already completed")]
    AlreadyCompleted(String),

    #[error("invalid {field}: {reason}")]
    InvalidReading { field: &'static str, reason: String },

    #[error("invalid intake: {0}")]
    InvalidIntake(String),
}

pub type ExamResult<T> = Result<T, ExamError>;
