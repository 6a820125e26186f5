pub mod handshake;
pub mod state;

pub use handshake::{BolusHandshake, BolusRequest, HandshakeOutcome};
pub use state::{PendingConfirmation, RequestKey};
