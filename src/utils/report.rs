use std::path::Path;

use anyhow::Context;
use csv::WriterBuilder;
use serde::Serialize;

use crate::orchestrator::{RunReport, StepKind};

#[derive(Debug, Serialize)]
struct Row<'a> {
    env_name: &'a str,
    started: String,
    step: StepKind,
    status: String,
    exit_code: i32,
    duration_ms: u64,
}

/// Dumps one CSV row per executed step.
pub fn write_csv(report: &RunReport, path: &Path) -> anyhow::Result<()> {
    let mut output = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("failed to create report file '{}'", path.display()))?;

    let started = report.started.to_rfc3339();
    for rec in &report.steps {
        output.serialize(Row {
            env_name: report.env_name.as_str(),
            started: started.clone(),
            step: rec.step,
            status: rec.status.to_string(),
            exit_code: rec.status.exit_code(),
            duration_ms: rec.duration.as_millis() as u64,
        })?;
    }

    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::orchestrator::{StepRecord, StepStatus};

    #[test]
    fn writes_header_and_one_row_per_step() {
        let report = RunReport {
            env_name: "abc123".parse().unwrap(),
            started: chrono::Local::now(),
            steps: vec![
                StepRecord {
                    step: StepKind::InstallEnv,
                    status: StepStatus::Succeeded,
                    duration: Duration::from_millis(1500),
                },
                StepRecord {
                    step: StepKind::Search,
                    status: StepStatus::Exited(1),
                    duration: Duration::from_millis(20),
                },
            ],
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steps.csv");
        write_csv(&report, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "env_name,started,step,status,exit_code,duration_ms"
        );
        assert!(lines[1].starts_with("abc123,"));
        assert!(lines[1].ends_with(",install-env,succeeded,0,1500"));
        assert!(lines[2].ends_with(",search,exited with code 1,1,20"));
    }
}
