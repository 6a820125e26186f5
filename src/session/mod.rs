//! One connection's worth of work: consume transport events inside the
//! liveness loop until something ends the session.

mod handler;

use std::{
    sync::{atomic::AtomicBool, Arc, Mutex},
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    bolus::BolusHandshake,
    error::SessionExit,
    liveness::LivenessSupervisor,
    router::Triggers,
    settings::Settings,
    store::{ArtifactSink, ReconciliationStore, SharedStore},
    tools::DeviceTools,
    transport::{InboundEvent, Outbound},
};

use handler::EventHandler;

pub struct Session {
    supervisor: LivenessSupervisor,
    handler: Arc<EventHandler>,
    cancel: CancellationToken,
}

impl Session {
    /// `settings` must carry a secret; callers check with
    /// [`Settings::connection`] first.
    pub fn new(
        settings: &Settings,
        tools: Arc<dyn DeviceTools>,
        artifacts: Arc<dyn ArtifactSink>,
        outbound: Outbound,
        cancel: CancellationToken,
    ) -> Self {
        let supervisor = LivenessSupervisor::new(settings.liveness.clone());
        let store: SharedStore = Arc::new(Mutex::new(ReconciliationStore::new(artifacts)));
        let handshake = BolusHandshake::new(
            settings.device_id.clone(),
            Arc::clone(&tools),
            outbound.clone(),
            Duration::from_secs(settings.triggers.bolus_ack_debounce_secs),
        );
        let triggers = Triggers::new(
            &settings.triggers,
            tools,
            Arc::clone(&store),
            outbound.clone(),
        );

        let handler = EventHandler {
            secret: settings.api_secret.clone().unwrap_or_default(),
            history_hours: settings.history_hours,
            workdir: settings.workdir.clone(),
            store,
            handshake,
            outbound,
            triggers,
            counter: supervisor.counter(),
            trip_step: settings.liveness.trip_step,
            cancel: cancel.clone(),
            watching: AtomicBool::new(false),
        };

        Self {
            supervisor,
            handler: Arc::new(handler),
            cancel,
        }
    }

    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.handler.store)
    }

    /// Runs until the session ends, then stops the router and transport.
    pub async fn run(self, events: &mut mpsc::Receiver<InboundEvent>) -> SessionExit {
        let handler = Arc::clone(&self.handler);
        let exit = self
            .supervisor
            .run(events, move |event| {
                let handler = Arc::clone(&handler);
                async move { handler.handle(event).await }
            })
            .await;

        log::error!("session ended: {}", exit);
        self.cancel.cancel();
        exit
    }
}
