//! Operator commands, one line each, parsed with clap and run against the
//! station's [`ExamController`].

use std::fmt::Write as _;

use anyhow::{bail, Result};
use chrono::Local;
use clap::{CommandFactory, Parser, Subcommand};

use crate::{clock, repository::HistoryScope, scheduler::Protocol};

use super::{Exam, ExamCard, ExamController, ExamType, Eye, NewExam, Phase};

/// Short ids shown in listings; any unique prefix is accepted.
const SHORT_ID_LEN: usize = 8;

#[derive(Debug, Parser)]
#[command(
    name = "piotrack",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true,
    disable_help_subcommand = true
)]
pub struct CommandLine {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Command {
    /// Register a patient: new <tsh|curva> <dob YYYY-MM-DD> <operator> <name...>
    New {
        exam_type: ExamType,
        dob: String,
        operator: String,
        #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
        name: Vec<String>,
    },
    /// Take the first measurement right away
    Start { exam: String },
    /// TSH: the patient finished the water
    Water { exam: String },
    /// Restart the interval of an exam interrupted by a restart
    Resume { exam: String },
    /// Confirm the due measurement
    Confirm { exam: String },
    /// Close an exam once every measurement is taken
    Finalize { exam: String },
    /// Click the exam card: silence its alert
    Click { exam: String },
    /// Record a PIO reading: pio <exam> <measurement #> <od|oe> [mmHg]
    Pio {
        exam: String,
        measurement: usize,
        eye: Eye,
        value: Option<String>,
    },
    /// Record corneal thickness: paq <exam> <od> <oe> (use - for blank)
    Paq { exam: String, od: String, oe: String },
    /// Replace the observation text
    Obs {
        exam: String,
        #[arg(num_args = 0.., trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Show ongoing exams and history
    List,
    /// Delete an exam
    Delete { exam: String },
    /// Delete completed exams: clear <day|old|all>
    Clear { scope: HistoryScope },
    /// Show this help
    Help,
    /// Leave the station
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Message(String),
    Quit,
}

/// Split a console line into words, keeping "double quoted" runs together.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;

    for ch in line.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    words.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        words.push(current);
    }
    words
}

/// `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let words = tokenize(line);
    if words.is_empty() {
        return Ok(None);
    }
    let parsed = CommandLine::try_parse_from(words)?;
    Ok(Some(parsed.command))
}

pub fn help() -> String {
    CommandLine::command().render_help().to_string()
}

/// Find the exam an operator means by `reference`: an exact id or a unique
/// id prefix.
pub fn resolve(controller: &ExamController, reference: &str) -> Result<String> {
    let ids = controller.repository().known_ids();
    if ids.iter().any(|id| id == reference) {
        return Ok(reference.to_string());
    }
    let matches: Vec<&String> = ids.iter().filter(|id| id.starts_with(reference)).collect();
    match matches.as_slice() {
        [only] => Ok((*only).clone()),
        [] => bail!("no exam matches '{reference}'"),
        _ => bail!("'{reference}' matches {} exams, type more of the id", matches.len()),
    }
}

fn blank_dash(value: &str) -> &str {
    if value == "-" {
        ""
    } else {
        value
    }
}

pub async fn execute(controller: &ExamController, command: Command) -> Result<Reply> {
    let reply = match command {
        Command::New {
            exam_type,
            dob,
            operator,
            name,
        } => {
            let exam = controller
                .create(NewExam {
                    name: name.join(" "),
                    dob,
                    operator,
                    exam_type,
                    observation: String::new(),
                })
                .await?;
            format!("created {} exam {} for {}", exam.exam_type, short_id(&exam.id), exam.name)
        }
        Command::Start { exam } => {
            let id = resolve(controller, &exam)?;
            let measurement = controller.start_first(&id).await?;
            format!("{} recorded at {}", measurement.measure, measurement.time)
        }
        Command::Water { exam } => {
            let id = resolve(controller, &exam)?;
            let slot = controller.water_done(&id).await?;
            format!(
                "{} due at {}",
                slot.label,
                slot.due.with_timezone(&Local).format("%H:%M:%S")
            )
        }
        Command::Resume { exam } => {
            let id = resolve(controller, &exam)?;
            let slot = controller.resume(&id).await?;
            format!(
                "{} due at {}",
                slot.label,
                slot.due.with_timezone(&Local).format("%H:%M:%S")
            )
        }
        Command::Confirm { exam } => {
            let id = resolve(controller, &exam)?;
            let measurement = controller.confirm(&id).await?;
            format!("{} confirmed at {}", measurement.measure, measurement.time)
        }
        Command::Finalize { exam } => {
            let id = resolve(controller, &exam)?;
            let exam = controller.finalize(&id).await?;
            format!("{} finalized", exam.name)
        }
        Command::Click { exam } => {
            let id = resolve(controller, &exam)?;
            if controller.dismiss_alert(&id) {
                "alert silenced".to_string()
            } else {
                "no alert on that exam".to_string()
            }
        }
        Command::Pio {
            exam,
            measurement,
            eye,
            value,
        } => {
            let id = resolve(controller, &exam)?;
            if measurement == 0 {
                bail!("measurements are numbered from 1");
            }
            let value = value.unwrap_or_default();
            controller
                .set_pio(&id, measurement - 1, eye, blank_dash(&value))
                .await?;
            "PIO saved".to_string()
        }
        Command::Paq { exam, od, oe } => {
            let id = resolve(controller, &exam)?;
            controller
                .set_paquimetria(&id, blank_dash(&od), blank_dash(&oe))
                .await?;
            "paquimetria saved".to_string()
        }
        Command::Obs { exam, text } => {
            let id = resolve(controller, &exam)?;
            controller.set_observation(&id, &text.join(" ")).await?;
            "observation saved".to_string()
        }
        Command::List => render_station(controller).await,
        Command::Delete { exam } => {
            let id = resolve(controller, &exam)?;
            controller.delete(&id).await?;
            format!("deleted {}", short_id(&id))
        }
        Command::Clear { scope } => {
            let cleared = controller.clear_history(scope).await?;
            format!("{cleared} exams removed from history")
        }
        Command::Help => help(),
        Command::Quit => return Ok(Reply::Quit),
    };
    Ok(Reply::Message(reply))
}

pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

fn describe_exam(exam: &Exam) -> String {
    let today = Local::now().date_naive();
    let age = exam
        .age_on(today)
        .map(|age| format!(", {age} years"))
        .unwrap_or_default();
    format!(
        "{}  {:<5} {}{} ({})",
        short_id(&exam.id),
        exam.exam_type,
        exam.name,
        age,
        exam.operator
    )
}

fn describe_card(card: &ExamCard) -> String {
    let required = Protocol::for_type(card.exam.exam_type).required_measures;
    let mut line = format!(
        "{}  {}/{}  {}",
        describe_exam(&card.exam),
        card.exam.measures.len(),
        required,
        card.phase.name()
    );
    match (&card.phase, card.remaining_ms) {
        (Phase::Counting(_), Some(remaining)) if remaining > 0 => {
            let _ = write!(line, " {}", clock::format_countdown(remaining));
        }
        (Phase::Counting(_), Some(_)) => line.push_str(" (due)"),
        _ => {}
    }
    if card.alerting {
        line.push_str("  [ALERT]");
    }
    line
}

pub async fn render_station(controller: &ExamController) -> String {
    let snapshot = controller.snapshot().await;
    let mut out = String::new();

    let _ = writeln!(out, "This station ({}):", snapshot.local.len());
    for card in &snapshot.local {
        let _ = writeln!(out, "  {}", describe_card(card));
    }

    if !snapshot.remote.is_empty() {
        let _ = writeln!(out, "Other stations ({}, read-only):", snapshot.remote.len());
        for exam in &snapshot.remote {
            let _ = writeln!(out, "  {}  {} measurements", describe_exam(exam), exam.measures.len());
        }
    }

    let _ = writeln!(out, "Completed today ({}):", snapshot.history.today.len());
    for exam in &snapshot.history.today {
        let _ = writeln!(out, "  {}", describe_exam(exam));
    }
    let _ = write!(
        out,
        "Older history: {} exams (as of {})",
        snapshot.history.older.len(),
        Local::now().format("%d/%m/%Y")
    );
    out
}
