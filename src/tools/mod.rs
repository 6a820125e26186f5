//! External commands the bridge shells out to. All of them block, so callers
//! go through [`run_blocking`].

use std::{
    io::Write,
    path::PathBuf,
    process::{Command, Output, Stdio},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const MEAL_REPORT: &str = "monitor/meal.json";
pub const PROFILE_REPORT: &str = "settings/profile.json";

const PUMP_HISTORY: &str = "monitor/pumphistory-zoned.json";
const PUMP_MODEL: &str = "settings/model.json";
const STATUS_INPUTS: [&str; 7] = [
    "monitor/clock-zoned.json",
    "monitor/iob.json",
    "enact/suggested.json",
    "enact/enacted.json",
    "monitor/battery.json",
    "monitor/reservoir.json",
    "monitor/status.json",
];
const UPLOADER_BATTERY: &str = "monitor/edison-battery.json";

/// Program names, overridable from the settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCommands {
    pub openaps: String,
    pub format_treatments: String,
    pub ns_status: String,
}

impl Default for ToolCommands {
    fn default() -> Self {
        Self {
            openaps: "openaps".into(),
            format_treatments: "mm-format-ns-treatments".into(),
            ns_status: "/usr/local/bin/ns-status".into(),
        }
    }
}

/// The rig-side collaborators. Implementations block.
pub trait DeviceTools: Send + Sync {
    /// Formats pump history as Nightscout treatments; returns raw stdout.
    fn format_treatments(&self) -> Result<Vec<u8>>;
    fn invoke_report(&self, report: &str) -> Result<()>;
    fn battery_status(&self) -> Result<()>;
    /// Builds the uploader devicestatus record; returns raw stdout.
    fn status_snapshot(&self) -> Result<Vec<u8>>;
    /// Delivers a bolus; returns the tool's combined output.
    fn bolus(&self, units: f64) -> Result<String>;
}

pub struct OpenApsTools {
    workdir: PathBuf,
    commands: ToolCommands,
}

impl OpenApsTools {
    pub fn new(workdir: impl Into<PathBuf>, commands: ToolCommands) -> Self {
        Self {
            workdir: workdir.into(),
            commands,
        }
    }

    fn command(&self, program: &str) -> Command {
        let mut command = Command::new(program);
        command.current_dir(&self.workdir);
        command
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>> {
        let output = self
            .command(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to spawn {program}"))?;
        check(program, &output)?;
        Ok(output.stdout)
    }
}

fn check(program: &str, output: &Output) -> Result<()> {
    if !output.status.success() {
        bail!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

pub fn bolus_payload(units: f64) -> String {
    format!("{{\"units\": {:.2}}}", units)
}

impl DeviceTools for OpenApsTools {
    fn format_treatments(&self) -> Result<Vec<u8>> {
        self.run(&self.commands.format_treatments, &[PUMP_HISTORY, PUMP_MODEL])
    }

    fn invoke_report(&self, report: &str) -> Result<()> {
        self.run(&self.commands.openaps, &["report", "invoke", report])
            .map(|_| ())
    }

    fn battery_status(&self) -> Result<()> {
        self.run(&self.commands.openaps, &["battery-status"]).map(|_| ())
    }

    fn status_snapshot(&self) -> Result<Vec<u8>> {
        let mut args: Vec<&str> = STATUS_INPUTS.to_vec();
        args.extend(["--uploader", UPLOADER_BATTERY]);
        self.run(&self.commands.ns_status, &args)
    }

    fn bolus(&self, units: f64) -> Result<String> {
        let program = &self.commands.openaps;
        let mut child = self
            .command(program)
            .args(["use", "pump", "bolus", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {program}"))?;

        let payload = bolus_payload(units);
        log::info!("Bolusing: {}", payload);
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .context("Failed to hand bolus payload to pump tool")?;
        }

        let output = child
            .wait_with_output()
            .context("pump tool did not finish")?;
        check(program, &output)?;
        Ok(format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ))
    }
}

/// Runs a blocking tool call off the async workers.
pub async fn run_blocking<T, F>(job: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .context("tool worker join failed")?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools_with(commands: ToolCommands) -> OpenApsTools {
        OpenApsTools::new(std::env::temp_dir(), commands)
    }

    #[test]
    fn bolus_payload_has_two_decimals() {
        assert_eq!(bolus_payload(1.5), r#"{"units": 1.50}"#);
        assert_eq!(bolus_payload(2.0), r#"{"units": 2.00}"#);
    }

    #[test]
    fn formatter_receives_history_and_model_paths() {
        let tools = tools_with(ToolCommands {
            format_treatments: "echo".into(),
            ..ToolCommands::default()
        });

        let stdout = tools.format_treatments().unwrap();

        assert_eq!(
            String::from_utf8(stdout).unwrap().trim(),
            "monitor/pumphistory-zoned.json settings/model.json"
        );
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let tools = tools_with(ToolCommands {
            openaps: "false".into(),
            ..ToolCommands::default()
        });

        assert!(tools.invoke_report(MEAL_REPORT).is_err());
        assert!(tools.battery_status().is_err());
    }

    #[test]
    fn missing_program_is_an_error() {
        let tools = tools_with(ToolCommands {
            ns_status: "/nonexistent/ns-status".into(),
            ..ToolCommands::default()
        });

        assert!(tools.status_snapshot().is_err());
    }

    #[tokio::test]
    async fn blocking_jobs_return_their_result() {
        let value = run_blocking(|| Ok(41 + 1)).await.unwrap();
        assert_eq!(value, 42);
    }
}
