use crate::{
    process_control::{ProcessHandle, Role, Termination},
    timeline::Cancelled,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use term_table::{row::Row, table_cell::TableCell, Table, TableStyle};

#[derive(Debug, Clone, Serialize)]
pub struct LaunchRecord {
    pub role: Role,
    pub name: String,
    pub host: String,
    pub pid: u32,
    pub command: String,
    /// Seconds since the run started.
    pub offset_secs: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminationRecord {
    pub role: Role,
    pub name: String,
    pub pid: u32,
    pub outcome: String,
    pub offset_secs: f64,
    pub at: DateTime<Utc>,
}

/// Everything that happened to the processes of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
    pub launches: Vec<LaunchRecord>,
    pub terminations: Vec<TerminationRecord>,
}

impl RunReport {
    pub fn new(run_id: &str) -> Self {
        RunReport {
            run_id: run_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            launches: vec![],
            terminations: vec![],
        }
    }

    pub fn record_launch(&mut self, handle: &ProcessHandle, offset: Duration) {
        self.launches.push(LaunchRecord {
            role: handle.role,
            name: handle.name.clone(),
            host: handle.location().to_string(),
            pid: handle.pid,
            command: handle.command.clone(),
            offset_secs: offset.as_secs_f64(),
            at: Utc::now(),
        });
    }

    pub fn record_termination(
        &mut self,
        handle: &ProcessHandle,
        result: &anyhow::Result<Termination>,
        offset: Duration,
    ) {
        let outcome = match result {
            Ok(termination) => termination.to_string(),
            Err(err) => format!("failed: {:#}", err),
        };
        self.terminations.push(TerminationRecord {
            role: handle.role,
            name: handle.name.clone(),
            pid: handle.pid,
            outcome,
            offset_secs: offset.as_secs_f64(),
            at: Utc::now(),
        });
    }

    pub fn finish(&mut self, result: &anyhow::Result<()>) {
        let outcome = match result {
            Ok(()) => "completed".to_string(),
            Err(err) if err.downcast_ref::<Cancelled>().is_some() => "cancelled".to_string(),
            Err(err) => format!("failed: {:#}", err),
        };
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
    }

    pub fn launches_of(&self, role: Role) -> impl Iterator<Item = &LaunchRecord> {
        self.launches.iter().filter(move |rec| rec.role == role)
    }

    /// Writes the report as `labrun-<run id>.json` into the given directory.
    pub fn write_to_dir(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        let path = dir.join(format!("labrun-{}.json", self.run_id));
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).context(format!("Unable to write {}", path.to_string_lossy()))?;
        Ok(path)
    }

    pub fn print_summary(&self) {
        println!("\n{}", " Summary ".reversed().green());
        println!(
            "run {} - {}",
            self.run_id.green(),
            self.outcome.as_deref().unwrap_or("unfinished")
        );

        let mut rows = vec![Row::new(vec![
            TableCell::new("Role".bold()),
            TableCell::new("Name".bold()),
            TableCell::new("Host".bold()),
            TableCell::new("PID".bold()),
            TableCell::new("Started (s)".bold()),
            TableCell::new("Stopped".bold()),
        ])];

        for launch in self.launches.iter() {
            let stopped = self
                .terminations
                .iter()
                .find(|t| t.pid == launch.pid && t.name == launch.name)
                .map(|t| format!("{} @ {:.0}s", t.outcome, t.offset_secs))
                .unwrap_or_else(|| "--".to_string());

            rows.push(Row::new(vec![
                TableCell::new(launch.role),
                TableCell::new(&launch.name),
                TableCell::new(&launch.host),
                TableCell::new(launch.pid),
                TableCell::new(format!("{:.0}", launch.offset_secs)),
                TableCell::new(stopped),
            ]));
        }

        let table = Table::builder()
            .rows(rows)
            .style(TableStyle::rounded())
            .build();

        println!("{}", table.render());
    }
}
