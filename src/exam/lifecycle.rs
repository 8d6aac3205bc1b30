use chrono::{DateTime, Utc};

use crate::{
    errors::{ExamError, ExamResult},
    scheduler::{self, Protocol, Slot, SlotTransition},
};

use super::{Eye, Exam, ExamStatus, Measurement};

/// Where an exam stands in its measurement sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// Registered, first measurement not taken.
    Intake,
    /// TSH only: first reading done, patient still drinking.
    AwaitingWater,
    /// Counting down to the next measurement.
    Counting(Slot),
    /// Restored after a reload with measurements missing; the operator
    /// restarts the interval explicitly.
    AwaitingResume,
    ReadyToFinalize,
    Completed,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Intake => "waiting for the first measurement",
            Phase::AwaitingWater => "waiting for the patient to finish drinking",
            Phase::Counting(_) => "counting down",
            Phase::AwaitingResume => "waiting to resume",
            Phase::ReadyToFinalize => "ready to finalize",
            Phase::Completed => "completed",
        }
    }
}

/// Result of one countdown tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub slot_index: usize,
    pub transitions: Vec<SlotTransition>,
    pub remaining_ms: i64,
    /// False once the slot has expired; the countdown has nothing left to show.
    pub keep_ticking: bool,
}

/// State machine for one exam owned by this station.
#[derive(Debug, Clone)]
pub struct ExamLifecycle {
    exam: Exam,
    phase: Phase,
}

impl ExamLifecycle {
    pub fn new(exam: Exam) -> Self {
        Self::restore(exam)
    }

    /// Rebuild the phase of a persisted exam. Slots are never persisted, so an
    /// exam interrupted mid-interval waits for an explicit resume.
    pub fn restore(exam: Exam) -> Self {
        let required = Protocol::for_type(exam.exam_type).required_measures;
        let phase = if exam.status == ExamStatus::Completed {
            Phase::Completed
        } else if exam.measures.is_empty() {
            Phase::Intake
        } else if exam.measures.len() >= required {
            Phase::ReadyToFinalize
        } else {
            Phase::AwaitingResume
        };
        Self { exam, phase }
    }

    pub fn exam(&self) -> &Exam {
        &self.exam
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::for_type(self.exam.exam_type)
    }

    pub fn slot(&self) -> Option<&Slot> {
        match &self.phase {
            Phase::Counting(slot) => Some(slot),
            _ => None,
        }
    }

    pub fn start_first(&mut self, now: DateTime<Utc>) -> ExamResult<Measurement> {
        self.expect_phase("start the first measurement", |phase| {
            matches!(phase, Phase::Intake)
        })?;

        let measurement = scheduler::start_first(&mut self.exam, now)?;
        let protocol = self.protocol();
        self.phase = if protocol.water_trigger {
            Phase::AwaitingWater
        } else {
            Phase::Counting(scheduler::schedule_next(&self.exam, protocol.interval, now)?)
        };
        Ok(measurement)
    }

    /// TSH: the patient finished the water, start the first timed interval.
    pub fn water_done(&mut self, now: DateTime<Utc>) -> ExamResult<&Slot> {
        self.expect_phase("record the water intake", |phase| {
            matches!(phase, Phase::AwaitingWater)
        })?;
        self.schedule(now)
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> ExamResult<&Slot> {
        self.expect_phase("resume", |phase| matches!(phase, Phase::AwaitingResume))?;
        self.schedule(now)
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<TickOutcome> {
        let Phase::Counting(slot) = &mut self.phase else {
            return None;
        };
        let transitions = slot.catch_up(now);
        Some(TickOutcome {
            slot_index: slot.index,
            remaining_ms: slot.remaining_ms(now),
            keep_ticking: slot.state() != scheduler::SlotState::Expired,
            transitions,
        })
    }

    pub fn confirm(&mut self, now: DateTime<Utc>) -> ExamResult<Measurement> {
        let mut pending = match &self.phase {
            Phase::Counting(slot) => Some(slot.clone()),
            Phase::Completed => return Err(ExamError::AlreadyCompleted(self.exam.id.clone())),
            _ => return Err(ExamError::NoPendingSlot(self.exam.id.clone())),
        };

        let measurement = scheduler::confirm(&mut pending, &mut self.exam, now)?;

        let protocol = self.protocol();
        self.phase = if self.exam.measures.len() < protocol.required_measures {
            Phase::Counting(scheduler::schedule_next(&self.exam, protocol.interval, now)?)
        } else {
            Phase::ReadyToFinalize
        };
        Ok(measurement)
    }

    pub fn finalize(&mut self, now: DateTime<Utc>) -> ExamResult<()> {
        if self.phase == Phase::Completed {
            return Err(ExamError::AlreadyCompleted(self.exam.id.clone()));
        }
        let required = self.protocol().required_measures;
        if self.exam.measures.len() != required {
            return Err(ExamError::IncompleteMeasurements {
                exam_type: self.exam.exam_type,
                have: self.exam.measures.len(),
                required,
            });
        }
        self.exam.complete(now);
        self.phase = Phase::Completed;
        Ok(())
    }

    /// PIO readings belong to the measurement flow, so they lock on completion.
    pub fn set_pio(&mut self, index: usize, eye: Eye, value: &str) -> ExamResult<()> {
        if self.phase == Phase::Completed {
            return Err(ExamError::AlreadyCompleted(self.exam.id.clone()));
        }
        self.exam.set_pio(index, eye, value)
    }

    pub fn set_paquimetria(&mut self, od: &str, oe: &str) -> ExamResult<()> {
        self.exam.set_paquimetria(od, oe)
    }

    pub fn set_observation(&mut self, observation: &str) {
        self.exam.observation = observation.trim().to_string();
    }

    fn schedule(&mut self, now: DateTime<Utc>) -> ExamResult<&Slot> {
        let slot = scheduler::schedule_next(&self.exam, self.protocol().interval, now)?;
        self.phase = Phase::Counting(slot);
        self.slot()
            .ok_or_else(|| ExamError::NoPendingSlot(self.exam.id.clone()))
    }

    fn expect_phase(&self, action: &'static str, allowed: impl Fn(&Phase) -> bool) -> ExamResult<()> {
        if allowed(&self.phase) {
            return Ok(());
        }
        if self.phase == Phase::Completed {
            return Err(ExamError::AlreadyCompleted(self.exam.id.clone()));
        }
        Err(ExamError::InvalidPhase {
            exam_id: self.exam.id.clone(),
            action,
            phase: self.phase.name(),
        })
    }
}
