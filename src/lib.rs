pub mod bolus;
pub mod error;
pub mod liveness;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod store;
pub mod tools;
pub mod transport;
mod utils;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use error::SessionExit;
use session::Session;
use settings::Settings;
use store::FsArtifacts;
use tools::OpenApsTools;
use transport::{socketio, Outbound};

/// Inbound events buffered between the socket task and the wait loop.
const INBOUND_CAPACITY: usize = 64;

/// Connects to Nightscout and runs one session to its end. `Err` means the
/// session could not start at all.
pub async fn run(settings: Settings) -> Result<SessionExit> {
    let (host, _) = settings.connection()?;
    let url = socketio::websocket_url(host)?;

    log::info!(
        "nsbridge starting for {} in {}",
        settings.device_id,
        settings.workdir.display()
    );

    let cancel = CancellationToken::new();
    let (outbound, outbound_rx) = Outbound::channel();
    let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

    let tools = Arc::new(OpenApsTools::new(
        settings.workdir.clone(),
        settings.tools.clone(),
    ));
    let artifacts = Arc::new(FsArtifacts::new(settings.workdir.clone()));
    let session = Session::new(&settings, tools, artifacts, outbound, cancel.clone());

    let transport = tokio::spawn(socketio::run(
        url,
        inbound_tx,
        outbound_rx,
        cancel.child_token(),
    ));

    let exit = session.run(&mut inbound_rx).await;
    // Connecting is not cancellable; don't wait on it.
    transport.abort();
    Ok(exit)
}
