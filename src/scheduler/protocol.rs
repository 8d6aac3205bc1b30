use std::time::Duration;

use crate::exam::ExamType;

/// How long a due measurement keeps alerting before it goes quiet.
pub const ALERT_WINDOW: Duration = Duration::from_secs(30);

/// Remaining time under which the card starts pulsing ahead of the alert.
pub const IMMINENT_THRESHOLD_MS: i64 = 10_000;

const TSH_INTERVAL: Duration = Duration::from_secs(15 * 60);
const CURVA_INTERVAL: Duration = Duration::from_secs(180 * 60);

/// Timing rules for one exam type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol {
    pub exam_type: ExamType,
    /// Total measurements, the immediate first one included.
    pub required_measures: usize,
    /// Wait between a confirmation (or the water trigger) and the next slot.
    pub interval: Duration,
    /// TSH waits for the patient to finish drinking before the first timed slot.
    pub water_trigger: bool,
}

impl Protocol {
    pub const fn for_type(exam_type: ExamType) -> Self {
        match exam_type {
            ExamType::Tsh => Self {
                exam_type,
                required_measures: 4,
                interval: TSH_INTERVAL,
                water_trigger: true,
            },
            ExamType::Curva => Self {
                exam_type,
                required_measures: 3,
                interval: CURVA_INTERVAL,
                water_trigger: false,
            },
        }
    }

    /// Label for the measurement at zero-based `index`.
    pub fn label_for(&self, index: usize) -> String {
        match (index, self.exam_type) {
            (0, ExamType::Tsh) => "1ª Medida (Sem Água)".to_string(),
            (0, ExamType::Curva) => "1ª Medida".to_string(),
            (n, _) => format!("Medida {}", n + 1),
        }
    }
}
