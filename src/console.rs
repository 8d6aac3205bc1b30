//! Line-oriented operator console: commands on stdin, events on stdout.

use anyhow::Result;
use log::{info, warn};
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    sync::mpsc,
};

use crate::{
    events::{AlertStopReason, StationEvent},
    exam::commands::{self, Reply},
    station::Station,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleOptions {
    /// Print every event as one JSON object per line.
    pub json_events: bool,
}

/// Run until `quit`, end of input or Ctrl-C, then close the station.
pub async fn run(
    station: &Station,
    mut events: mpsc::UnboundedReceiver<StationEvent>,
    options: ConsoleOptions,
) -> Result<()> {
    let mut lines = BufReader::new(io::stdin()).lines();
    println!("{}", commands::render_station(&station.controller).await);
    println!("Type 'help' for commands.");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed");
                    break;
                };
                if handle_line(station, &line).await {
                    break;
                }
            }
            Some(event) = events.recv() => print_event(&event, options),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    station.close().await;
    while let Ok(event) = events.try_recv() {
        print_event(&event, options);
    }
    Ok(())
}

/// Returns true when the operator asked to quit.
async fn handle_line(station: &Station, line: &str) -> bool {
    let command = match commands::parse(line) {
        Ok(Some(command)) => command,
        Ok(None) => return false,
        Err(err) => {
            println!("{err}");
            return false;
        }
    };

    match commands::execute(&station.controller, command).await {
        Ok(Reply::Message(text)) => {
            println!("{text}");
            false
        }
        Ok(Reply::Quit) => true,
        Err(err) => {
            warn!("Command '{}' failed: {err:#}", line.trim());
            println!("error: {err:#}");
            false
        }
    }
}

fn print_event(event: &StationEvent, options: ConsoleOptions) {
    if options.json_events {
        match serde_json::to_string(event) {
            Ok(json) => println!("{json}"),
            Err(err) => warn!("Could not serialize event: {err}"),
        }
        return;
    }
    if let Some(text) = describe(event) {
        println!("{text}");
    }
}

/// Human text for an event, or `None` for the ones too chatty for a terminal.
fn describe(event: &StationEvent) -> Option<String> {
    let short = |id: &str| commands::short_id(id).to_string();
    let text = match event {
        StationEvent::Countdown { .. } | StationEvent::ExamSaved { .. } => return None,
        StationEvent::ExamCreated { exam_id, name } => {
            format!("+ {name} registered as {}", short(exam_id))
        }
        StationEvent::SlotBecameDue {
            exam_id,
            slot_index,
        } => format!(
            "! {}: measurement {} is due",
            short(exam_id),
            slot_index + 1
        ),
        StationEvent::SlotExpiredVisually {
            exam_id,
            slot_index,
        } => format!(
            "! {}: measurement {} is overdue",
            short(exam_id),
            slot_index + 1
        ),
        StationEvent::AlertStarted { exam_id, .. } => {
            format!("\u{7}ALERT {}: measure now (click to silence)", short(exam_id))
        }
        StationEvent::AlertStopped { exam_id, reason } => {
            let why = match reason {
                AlertStopReason::TimedOut => "timed out",
                AlertStopReason::Dismissed => "dismissed",
                AlertStopReason::Confirmed => "measurement confirmed",
                AlertStopReason::Closed => "exam closed",
            };
            format!("  {}: alert stopped ({why})", short(exam_id))
        }
        StationEvent::MeasurementConfirmed {
            exam_id,
            measurement,
        } => {
            format!(
                "* {}: {} confirmed at {}",
                short(exam_id),
                measurement.measure,
                measurement.time
            )
        }
        StationEvent::ExamFinalized { exam_id } => format!("= {} finalized", short(exam_id)),
        StationEvent::ExamSaveFailed { exam_id, reason } => {
            format!("x {}: not saved ({reason})", short(exam_id))
        }
        StationEvent::ExamDeleted { exam_id } => format!("- {} deleted", short(exam_id)),
        StationEvent::RemoteOngoingChanged { exams } => {
            format!("~ {} exam(s) running at other stations", exams.len())
        }
        StationEvent::Notice { message } => format!("i {message}"),
    };
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chatty_events_are_not_printed() {
        let countdown = StationEvent::Countdown {
            exam_id: "abc".into(),
            slot_index: 1,
            remaining_ms: 5_000,
            imminent: true,
        };
        assert_eq!(describe(&countdown), None);
        assert_eq!(
            describe(&StationEvent::ExamSaved {
                exam_id: "abc".into()
            }),
            None
        );
    }

    #[test]
    fn events_use_short_ids_and_one_based_slots() {
        let due = StationEvent::SlotBecameDue {
            exam_id: "0123456789abcdef".into(),
            slot_index: 2,
        };
        assert_eq!(
            describe(&due).unwrap(),
            "! 01234567: measurement 3 is due"
        );

        let stopped = StationEvent::AlertStopped {
            exam_id: "0123456789abcdef".into(),
            reason: AlertStopReason::TimedOut,
        };
        assert!(describe(&stopped).unwrap().ends_with("(timed out)"));
    }

    #[test]
    fn json_shape_is_tagged() {
        let event = StationEvent::ExamDeleted {
            exam_id: "abc".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "examDeleted");
        assert_eq!(json["examId"], "abc");
    }
}
