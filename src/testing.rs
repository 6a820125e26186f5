//! Fakes shared by the unit tests of several modules.

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use crate::{
    store::{Artifact, ArtifactSink},
    tools::DeviceTools,
};

/// Canned tool outputs. Every invocation is reported on `calls`.
pub struct ScriptedTools {
    pub treatments: Mutex<Vec<u8>>,
    pub status: Vec<u8>,
    pub battery_fails: bool,
    calls: mpsc::UnboundedSender<String>,
}

impl ScriptedTools {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (
            Self {
                treatments: Mutex::new(b"[]".to_vec()),
                status: Vec::new(),
                battery_fails: false,
                calls,
            },
            rx,
        )
    }

    fn record(&self, call: impl Into<String>) {
        let _ = self.calls.send(call.into());
    }
}

impl DeviceTools for ScriptedTools {
    fn format_treatments(&self) -> Result<Vec<u8>> {
        self.record("format_treatments");
        Ok(self.treatments.lock().unwrap().clone())
    }

    fn invoke_report(&self, report: &str) -> Result<()> {
        self.record(format!("report {report}"));
        Ok(())
    }

    fn battery_status(&self) -> Result<()> {
        self.record("battery_status");
        if self.battery_fails {
            return Err(anyhow!("no battery reading"));
        }
        Ok(())
    }

    fn status_snapshot(&self) -> Result<Vec<u8>> {
        self.record("status_snapshot");
        Ok(self.status.clone())
    }

    fn bolus(&self, units: f64) -> Result<String> {
        self.record(format!("bolus {units}"));
        Ok(String::new())
    }
}

/// Keeps every artifact write in memory.
#[derive(Default)]
pub struct MemorySink {
    pub writes: Mutex<Vec<(Artifact, Vec<u8>, i64)>>,
}

impl MemorySink {
    pub fn count(&self, artifact: Artifact) -> usize {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(written, _, _)| *written == artifact)
            .count()
    }
}

impl ArtifactSink for MemorySink {
    fn write(&self, artifact: Artifact, body: &[u8], newest_ms: i64) -> Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push((artifact, body.to_vec(), newest_ms));
        Ok(())
    }
}
