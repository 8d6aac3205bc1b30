//! Exam records as they are persisted and exchanged between stations.
//!
//! Field names follow the shared store schema (camelCase, `type`, `pioOD`,
//! `dateISO`), so the same struct is both the domain model and the wire form.

use std::fmt;

use chrono::{DateTime, Datelike, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ExamError, ExamResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExamType {
    /// Water-drinking provocative test.
    Tsh,
    /// Tensional curve.
    Curva,
}

impl ExamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamType::Tsh => "tsh",
            ExamType::Curva => "curva",
        }
    }
}

impl fmt::Display for ExamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExamType {
    type Err = ExamError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tsh" => Ok(ExamType::Tsh),
            "curva" => Ok(ExamType::Curva),
            other => Err(ExamError::InvalidIntake(format!(
                "unknown exam type '{other}' (expected tsh or curva)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExamStatus {
    #[default]
    Ongoing,
    Completed,
}

impl ExamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamStatus::Ongoing => "ongoing",
            ExamStatus::Completed => "completed",
        }
    }
}

/// One PIO reading point. PIO values stay empty until the operator types
/// them in after confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Measurement {
    pub measure: String,
    pub time: String,
    pub date: String,
    #[serde(rename = "pioOD", default)]
    pub pio_od: String,
    #[serde(rename = "pioOE", default)]
    pub pio_oe: String,
}

impl Measurement {
    pub fn confirmed_at(label: impl Into<String>, at: DateTime<Utc>) -> Self {
        let local = at.with_timezone(&Local);
        Self {
            measure: label.into(),
            time: local.format("%H:%M").to_string(),
            date: local.format("%Y-%m-%d").to_string(),
            pio_od: String::new(),
            pio_oe: String::new(),
        }
    }
}

/// Corneal thickness in µm, one value per eye.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Paquimetria {
    #[serde(default)]
    pub od: String,
    #[serde(default)]
    pub oe: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eye {
    /// Right eye.
    Od,
    /// Left eye.
    Oe,
}

impl std::str::FromStr for Eye {
    type Err = ExamError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "od" => Ok(Eye::Od),
            "oe" => Ok(Eye::Oe),
            other => Err(ExamError::InvalidReading {
                field: "eye",
                reason: format!("'{other}' is neither od nor oe"),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Exam {
    pub id: String,
    pub name: String,
    pub dob: String,
    pub operator: String,
    #[serde(rename = "type")]
    pub exam_type: ExamType,
    #[serde(default)]
    pub observation: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub measures: Vec<Measurement>,
    #[serde(rename = "dateISO")]
    pub date_iso: String,
    pub date_display: String,
    #[serde(default)]
    pub paquimetria: Paquimetria,
    pub status: ExamStatus,
}

impl Exam {
    pub fn from_intake(id: String, intake: NewExam, start: DateTime<Utc>) -> Self {
        Self {
            id,
            name: intake.name,
            dob: intake.dob,
            operator: intake.operator,
            exam_type: intake.exam_type,
            observation: intake.observation,
            start,
            end: None,
            measures: Vec::new(),
            date_iso: date_iso(start),
            date_display: date_display(start),
            paquimetria: Paquimetria::default(),
            status: ExamStatus::Ongoing,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExamStatus::Completed
    }

    /// Sets `end` and `status` together; they never move independently.
    pub fn complete(&mut self, at: DateTime<Utc>) {
        self.end = Some(at);
        self.status = ExamStatus::Completed;
    }

    pub fn birth_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.dob.trim(), "%Y-%m-%d").ok()
    }

    /// Age in whole years on `on`, if the date of birth parses.
    pub fn age_on(&self, on: NaiveDate) -> Option<u32> {
        let birth = self.birth_date()?;
        let mut age = on.year() - birth.year();
        if (on.month(), on.day()) < (birth.month(), birth.day()) {
            age -= 1;
        }
        u32::try_from(age).ok()
    }

    pub fn set_pio(&mut self, index: usize, eye: Eye, value: &str) -> ExamResult<()> {
        let value = validate_pio(value)?;
        let exam_id = self.id.clone();
        let measurement = self
            .measures
            .get_mut(index)
            .ok_or_else(|| ExamError::InvalidReading {
                field: "measurement",
                reason: format!("exam {exam_id} has no measurement #{}", index + 1),
            })?;
        match eye {
            Eye::Od => measurement.pio_od = value,
            Eye::Oe => measurement.pio_oe = value,
        }
        Ok(())
    }

    pub fn set_paquimetria(&mut self, od: &str, oe: &str) -> ExamResult<()> {
        let od = validate_paquimetria("paquimetria OD", od)?;
        let oe = validate_paquimetria("paquimetria OE", oe)?;
        self.paquimetria = Paquimetria { od, oe };
        Ok(())
    }
}

/// Patient identity collected by the intake form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewExam {
    pub name: String,
    pub dob: String,
    pub operator: String,
    pub exam_type: ExamType,
    pub observation: String,
}

impl NewExam {
    pub fn validate(&self) -> ExamResult<()> {
        if self.name.trim().is_empty() {
            return Err(ExamError::InvalidIntake("patient name is required".into()));
        }
        if self.operator.trim().is_empty() {
            return Err(ExamError::InvalidIntake("an operator must be selected".into()));
        }
        if NaiveDate::parse_from_str(self.dob.trim(), "%Y-%m-%d").is_err() {
            return Err(ExamError::InvalidIntake(format!(
                "date of birth '{}' is not YYYY-MM-DD",
                self.dob
            )));
        }
        Ok(())
    }
}

pub fn date_iso(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d").to_string()
}

pub fn date_display(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%d/%m/%Y").to_string()
}

/// PIO in mmHg: empty clears the reading, otherwise a whole number 0..=99.
fn validate_pio(value: &str) -> ExamResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    match trimmed.parse::<u8>() {
        Ok(mmhg) if mmhg <= 99 => Ok(mmhg.to_string()),
        _ => Err(ExamError::InvalidReading {
            field: "PIO",
            reason: format!("'{trimmed}' is not a pressure between 0 and 99 mmHg"),
        }),
    }
}

fn validate_paquimetria(field: &'static str, value: &str) -> ExamResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || (trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_digit())) {
        Ok(trimmed.to_string())
    } else {
        Err(ExamError::InvalidReading {
            field,
            reason: format!("'{trimmed}' must be three digits (µm)"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn intake() -> NewExam {
        NewExam {
            name: "Maria Aparecida".into(),
            dob: "1958-07-14".into(),
            operator: "Dr. Lima".into(),
            exam_type: ExamType::Tsh,
            observation: String::new(),
        }
    }

    #[test]
    fn serializes_with_store_field_names() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let mut exam = Exam::from_intake("e1".into(), intake(), start);
        exam.measures.push(Measurement::confirmed_at("1ª Medida (Sem Água)", start));

        let json = serde_json::to_value(&exam).unwrap();
        assert_eq!(json["type"], "tsh");
        assert_eq!(json["status"], "ongoing");
        assert!(json["end"].is_null());
        assert!(json.get("dateISO").is_some());
        assert!(json.get("dateDisplay").is_some());
        assert_eq!(json["measures"][0]["pioOD"], "");
        assert_eq!(json["paquimetria"]["od"], "");
    }

    #[test]
    fn complete_sets_end_and_status_together() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let mut exam = Exam::from_intake("e1".into(), intake(), start);
        exam.complete(start + chrono::Duration::hours(1));
        assert!(exam.is_completed());
        assert_eq!(exam.end, Some(start + chrono::Duration::hours(1)));
    }

    #[test]
    fn age_counts_birthdays() {
        let exam = Exam::from_intake("e1".into(), intake(), Utc::now());
        let before = NaiveDate::from_ymd_opt(2026, 7, 13).unwrap();
        let on = NaiveDate::from_ymd_opt(2026, 7, 14).unwrap();
        assert_eq!(exam.age_on(before), Some(67));
        assert_eq!(exam.age_on(on), Some(68));
    }

    #[test]
    fn pio_validation() {
        let mut exam = Exam::from_intake("e1".into(), intake(), Utc::now());
        exam.measures.push(Measurement::confirmed_at("1ª Medida", Utc::now()));

        exam.set_pio(0, Eye::Od, " 18 ").unwrap();
        assert_eq!(exam.measures[0].pio_od, "18");
        assert!(exam.set_pio(0, Eye::Oe, "abc").is_err());
        assert!(exam.set_pio(0, Eye::Oe, "120").is_err());
        assert!(exam.set_pio(3, Eye::Oe, "12").is_err());
        exam.set_pio(0, Eye::Od, "").unwrap();
        assert_eq!(exam.measures[0].pio_od, "");
    }

    #[test]
    fn paquimetria_requires_three_digits() {
        let mut exam = Exam::from_intake("e1".into(), intake(), Utc::now());
        exam.set_paquimetria("545", "552").unwrap();
        assert_eq!(exam.paquimetria.od, "545");
        assert!(exam.set_paquimetria("54", "552").is_err());
        assert_eq!(exam.paquimetria.oe, "552");
    }

    #[test]
    fn intake_requires_operator() {
        let mut new_exam = intake();
        new_exam.operator = "  ".into();
        assert!(matches!(new_exam.validate(), Err(ExamError::InvalidIntake(_))));
    }
}
