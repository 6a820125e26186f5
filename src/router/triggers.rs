use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    scheduler::{action, Action, Debounce, Throttle},
    store::{with_store, SharedStore, Treatment},
    tools::{run_blocking, DeviceTools, MEAL_REPORT, PROFILE_REPORT},
    transport::{Collection, Outbound},
};

use super::{Trigger, TriggerSink};

// Set to true to log each trigger run
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Gate timings, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerTimings {
    pub meal_throttle_secs: u64,
    pub profile_debounce_secs: u64,
    pub status_debounce_secs: u64,
    pub reconcile_debounce_secs: u64,
    pub bolus_ack_debounce_secs: u64,
}

impl Default for TriggerTimings {
    fn default() -> Self {
        Self {
            meal_throttle_secs: 15,
            profile_debounce_secs: 15,
            status_debounce_secs: 10,
            reconcile_debounce_secs: 10,
            bolus_ack_debounce_secs: 1,
        }
    }
}

/// One gated wrapper per trigger.
#[derive(Clone)]
pub struct Triggers {
    meal: Throttle<()>,
    profile: Debounce<()>,
    status: Debounce<()>,
    reconcile: Debounce<()>,
}

impl Triggers {
    pub fn new(
        timings: &TriggerTimings,
        tools: Arc<dyn DeviceTools>,
        store: SharedStore,
        outbound: Outbound,
    ) -> Self {
        Self {
            meal: Throttle::new(
                "meal_report",
                Duration::from_secs(timings.meal_throttle_secs),
                report_action(Arc::clone(&tools), MEAL_REPORT),
            ),
            profile: Debounce::new(
                "profile_report",
                Duration::from_secs(timings.profile_debounce_secs),
                report_action(Arc::clone(&tools), PROFILE_REPORT),
            ),
            status: Debounce::new(
                "status_snapshot",
                Duration::from_secs(timings.status_debounce_secs),
                status_action(Arc::clone(&tools), outbound.clone()),
            ),
            reconcile: Debounce::new(
                "reconcile_treatments",
                Duration::from_secs(timings.reconcile_debounce_secs),
                reconcile_action(tools, store, outbound),
            ),
        }
    }
}

impl TriggerSink for Triggers {
    fn fire(&self, trigger: Trigger) {
        match trigger {
            Trigger::MealReport => self.meal.call(()),
            Trigger::ProfileReport => self.profile.call(()),
            Trigger::StatusSnapshot => self.status.call(()),
            Trigger::ReconcileTreatments => self.reconcile.call(()),
        }
    }
}

fn report_action(tools: Arc<dyn DeviceTools>, report: &'static str) -> Action<()> {
    action(move |()| {
        let tools = Arc::clone(&tools);
        async move {
            log_info!("Invoking report {}", report);
            if let Err(err) = run_blocking(move || tools.invoke_report(report)).await {
                log_error!("report {} failed: {err:#}", report);
            }
        }
    })
}

fn status_action(tools: Arc<dyn DeviceTools>, outbound: Outbound) -> Action<()> {
    action(move |()| {
        let tools = Arc::clone(&tools);
        let outbound = outbound.clone();
        async move {
            let snapshot = run_blocking(move || {
                if let Err(err) = tools.battery_status() {
                    log::warn!("battery status failed, building snapshot anyway: {err:#}");
                }
                tools.status_snapshot()
            })
            .await;

            let stdout = match snapshot {
                Ok(stdout) => stdout,
                Err(err) => {
                    log_error!("status snapshot failed: {err:#}");
                    return;
                }
            };
            if !String::from_utf8_lossy(&stdout).contains("iob") {
                log_warn!("status snapshot has no iob, not uploading");
                return;
            }
            match serde_json::from_slice::<Value>(&stdout) {
                Ok(status) => {
                    log_info!("Uploading devicestatus");
                    outbound.db_add(Collection::Devicestatus, status);
                }
                Err(err) => log_error!("status snapshot is not JSON: {err}"),
            }
        }
    })
}

fn reconcile_action(
    tools: Arc<dyn DeviceTools>,
    store: SharedStore,
    outbound: Outbound,
) -> Action<()> {
    action(move |()| {
        let tools = Arc::clone(&tools);
        let store = Arc::clone(&store);
        let outbound = outbound.clone();
        async move {
            let records = match run_blocking(move || {
                let stdout = tools.format_treatments()?;
                Treatment::from_tool_output(&stdout)
            })
            .await
            {
                Ok(records) => records,
                Err(err) => {
                    log_error!("treatment formatting failed: {err:#}");
                    return;
                }
            };

            let now_ms = Utc::now().timestamp_millis();
            let added = match with_store(&store, move |store| {
                store.ingest_local_treatments(records, now_ms)
            })
            .await
            {
                Ok(added) => added,
                Err(err) => {
                    log_error!("local treatments not merged: {err:#}");
                    return;
                }
            };
            log_info!("{} new local treatments", added.len());
            for treatment in added {
                outbound.db_add(Collection::Treatments, treatment.into_value());
            }
        }
    })
}
