use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    bolus::{BolusHandshake, HandshakeOutcome},
    error::SessionExit,
    liveness::{LivenessCounter, TripReason},
    router::{route_changes, watcher, FileChangeRouter, RouteTable, Triggers},
    store::{with_store, SharedStore},
    transport::{AuthorizeRequest, DataUpdate, InboundEvent, Outbound, OutboundMessage},
};

// Set to true to log every inbound batch
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Reacts to one transport event at a time on behalf of the wait loop.
pub(crate) struct EventHandler {
    pub(crate) secret: String,
    pub(crate) history_hours: u32,
    pub(crate) workdir: PathBuf,
    pub(crate) store: SharedStore,
    pub(crate) handshake: BolusHandshake,
    pub(crate) outbound: Outbound,
    pub(crate) triggers: Triggers,
    pub(crate) counter: Arc<LivenessCounter>,
    pub(crate) trip_step: u32,
    pub(crate) cancel: CancellationToken,
    pub(crate) watching: AtomicBool,
}

impl EventHandler {
    pub(crate) async fn handle(&self, event: InboundEvent) -> Result<(), SessionExit> {
        match event {
            InboundEvent::Connected => {
                self.on_connected();
                Ok(())
            }
            InboundEvent::Data(update) => self.on_data(update).await,
            InboundEvent::Disconnected => {
                log_warn!("Disconnected");
                self.counter.trip(TripReason::Disconnected, self.trip_step);
                Ok(())
            }
            InboundEvent::Error(message) => {
                log_error!("transport error: {}", message);
                self.counter
                    .trip(TripReason::TransportError(message), self.trip_step);
                Ok(())
            }
        }
    }

    fn on_connected(&self) {
        log_info!("Connected, authorizing as {}", self.handshake.device_id());
        let request = AuthorizeRequest::new(
            self.secret.clone(),
            self.history_hours,
            Utc::now().timestamp_millis(),
        );
        self.outbound.send(OutboundMessage::Authorize(request));

        if !self.watching.swap(true, Ordering::SeqCst) {
            self.start_watching();
        }
    }

    /// Starts the inotify thread and the router task. Without them the
    /// session still mirrors the cloud; reports just never fire.
    fn start_watching(&self) {
        let table = RouteTable::default_table();
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        if let Err(err) = watcher::spawn_watch_thread(&self.workdir, table.watched_dirs(), changes_tx) {
            log::error!("file watching disabled: {err:#}");
            return;
        }

        let router = FileChangeRouter::new(
            self.workdir.clone(),
            table,
            Arc::new(self.triggers.clone()),
        );
        tokio::spawn(route_changes(router, changes_rx, self.cancel.child_token()));
        log_info!("watching {} for report inputs", self.workdir.display());
    }

    async fn on_data(&self, update: DataUpdate) -> Result<(), SessionExit> {
        self.counter.reset();
        log_info!("Data, keys: {:?}", update.keys);

        let now = Utc::now();
        if let Some(statuses) = &update.devicestatus {
            self.on_device_status(statuses, now.timestamp());
        }

        let now_ms = now.timestamp_millis();
        if let Some(sgvs) = update.sgvs {
            let received = sgvs.len();
            let window =
                with_store(&self.store, move |store| store.ingest_glucose(&sgvs, now_ms)).await?;
            log_info!("{} sgvs received, {} in window", received, window);
        }
        if let Some(treatments) = update.treatments {
            log_info!("{} treatments received", treatments.len());
            with_store(&self.store, move |store| {
                store.ingest_cloud_treatments(&treatments, now_ms)
            })
            .await?;
        }
        Ok(())
    }

    fn on_device_status(&self, statuses: &[Value], now_secs: i64) {
        for status in statuses {
            match self.handshake.handle_status(status, now_secs) {
                HandshakeOutcome::Ignored => {}
                outcome => log::debug!("bolus handshake: {:?}", outcome),
            }
        }
    }
}
