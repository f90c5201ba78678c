//! Rollcall operator CLI.
//!
//! Runs against the file-backed deployment configured by `ROLLCALL_*`
//! environment variables (see `rollcall::config`).
//!
//! ```bash
//! rollcall check D100
//! rollcall confirm D100 OC7
//! rollcall scan OC7          # read IDs from stdin, one per line
//! rollcall flush
//! rollcall rehydrate
//! rollcall stats
//! rollcall summary
//! ```
//!
//! `confirm` only queues the check-in; it reaches the ledger on the next
//! `flush` (or, in `scan` mode, on the threshold or periodic flush).

use std::io::BufRead;
use std::process::ExitCode;

use rollcall::{Admission, Attendance, AttendanceEvent, Config, Error};
use tracing_subscriber::EnvFilter;

const USAGE: &str = r#"Rollcall

Usage: rollcall <COMMAND>

Commands:
  check <ID>               Show whether a participant is checked in
  confirm <ID> <OPERATOR>  Check a participant in
  scan <OPERATOR>          Check in IDs read from stdin, one per line
  flush                    Write queued check-ins to the ledger
  rehydrate                Rebuild the cache from the ledger
  stats                    Show cache and queue sizes
  summary                  Show attendance rate and totals per operator
"#;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", describe(&e));
            if e.is_retryable() {
                ExitCode::from(75)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(args: &[&str]) -> rollcall::Result<()> {
    let config = Config::from_env()?;

    match args {
        ["check", id] => {
            let attendance = Attendance::open(&config).await?;
            let id = id.trim();
            let profile = attendance.profile(&id.into())?;
            let outcome = attendance.check(id).await?;

            println!("{id}: {} ({})", profile.display_name, profile.group);
            match outcome.event {
                Some(event) => println!("already checked in: {}", recorded(&event)),
                None => println!("not checked in"),
            }
        }
        ["confirm", id, operator] => {
            let attendance = Attendance::open(&config).await?;
            print_admission(&attendance.confirm(id.trim(), operator.trim()).await?);
        }
        ["scan", operator] => {
            let attendance = Attendance::open(&config).await?;
            scan(&attendance, operator.trim()).await?;
            let flushed = attendance.shutdown().await?;
            println!("flushed {flushed} check-ins on exit");
        }
        ["flush"] => {
            let attendance = Attendance::open(&config).await?;
            let flushed = attendance.flush_now().await?;
            attendance.shutdown().await?;
            println!("flushed {flushed} check-ins");
        }
        ["rehydrate"] => {
            let attendance = Attendance::open(&config).await?;
            let report = attendance.rehydrate_now().await?;
            println!(
                "rehydrated {} participants from {} ledger rows ({} duplicates, {} malformed, {} still queued)",
                report.cached(),
                report.rows_read,
                report.duplicates_skipped,
                report.malformed_skipped,
                report.pending_overlaid
            );
        }
        ["stats"] => {
            let attendance = Attendance::open(&config).await?;
            let stats = attendance.stats().await?;
            println!("cached:  {}", stats.cached_count);
            println!("pending: {}", stats.pending_count);
        }
        ["summary"] => {
            let attendance = Attendance::open(&config).await?;
            let summary = attendance.summary().await?;
            println!("registered: {}", summary.registered);
            println!("present:    {}", summary.total_present);
            println!("rate:       {:.1}%", summary.attendance_rate * 100.0);
            for (operator, count) in &summary.by_operator {
                println!("  {operator}: {count}");
            }
        }
        _ => {
            eprint!("{USAGE}");
            return Err(Error::Config("unrecognized command".to_string()));
        }
    }

    Ok(())
}

/// Reads participant IDs from stdin until EOF. Bad IDs are reported and
/// skipped; store failures end the session.
async fn scan(attendance: &Attendance, operator: &str) -> rollcall::Result<()> {
    let stdin = std::io::stdin();

    for line in stdin.lock().lines() {
        let line = line?;
        let id = line.trim();
        if id.is_empty() {
            continue;
        }

        match attendance.confirm(id, operator).await {
            Ok(admission) => print_admission(&admission),
            Err(e @ (Error::UnknownParticipant { .. } | Error::PreconditionViolated(_))) => {
                eprintln!("{}", describe(&e))
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

fn print_admission(admission: &Admission) {
    let event = admission.event();
    match admission {
        Admission::Admitted(_) => println!(
            "{}: {} checked in ({})",
            event.participant_id,
            event.display_name,
            recorded(event)
        ),
        Admission::AlreadyPresent(_) => println!(
            "{}: {} was already checked in ({})",
            event.participant_id,
            event.display_name,
            recorded(event)
        ),
    }
}

fn recorded(event: &AttendanceEvent) -> String {
    format!("by {} at {}", event.recorded_by, event.recorded_at)
}

fn describe(e: &Error) -> String {
    match e {
        Error::UnknownParticipant { participant_id } => {
            format!("no participant with id '{participant_id}' is registered")
        }
        Error::StoreUnavailable(_) => format!("{e}; please scan again, a repeat scan is safe"),
        other => other.to_string(),
    }
}
