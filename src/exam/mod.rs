pub mod commands;
pub mod controller;
pub mod lifecycle;
pub mod model;

pub use controller::{ExamCard, ExamController, StationSnapshot};
pub use lifecycle::{ExamLifecycle, Phase, TickOutcome};
pub use model::{Exam, ExamStatus, ExamType, Eye, Measurement, NewExam, Paquimetria};
