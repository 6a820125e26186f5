use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde_json::{json, Value};

use crate::{
    scheduler::{action, Debounce},
    tools::{run_blocking, DeviceTools},
    transport::{Collection, Outbound},
};

use super::state::{PendingConfirmation, RequestKey};

// Set to true to log every handshake transition
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// A `bolus` request read off a devicestatus record.
#[derive(Debug, Clone, PartialEq)]
pub struct BolusRequest {
    pub requester: String,
    pub target: String,
    pub units: f64,
    /// Zero when the requester has not been acknowledged yet.
    pub confirmation: i64,
}

impl BolusRequest {
    /// `None` when the record carries no `bolus` object. A malformed one is
    /// logged and also yields `None`.
    pub fn from_status(status: &Value) -> Option<Self> {
        let bolus = status.get("bolus")?;
        log_info!("Incoming bolus devicestatus: {}", status);

        let units = bolus.get("units").and_then(as_f64);
        let target = bolus.get("target").and_then(Value::as_str);
        let requester = status.get("device").and_then(Value::as_str);
        let (Some(units), Some(target), Some(requester)) = (units, target, requester) else {
            log_warn!("malformed bolus request ignored: {}", status);
            return None;
        };

        let confirmation = match bolus.get("confirmation") {
            None | Some(Value::Null) => 0,
            Some(raw) => match as_f64(raw) {
                Some(nonce) => nonce as i64,
                None => {
                    log_warn!("unreadable confirmation {} in bolus request", raw);
                    return None;
                }
            },
        };

        Some(Self {
            requester: requester.to_string(),
            target: target.to_string(),
            units,
            confirmation,
        })
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeOutcome {
    /// Not a bolus request, or not addressed to this rig.
    Ignored,
    /// New request cycle; an acknowledgment carrying this key's nonce is on
    /// its way.
    Acknowledging(RequestKey),
    /// The pending key matched but the amount did not.
    Rejected(RequestKey),
    /// Confirmation matched; the bolus was handed to the pump tool.
    Executed(RequestKey),
}

#[derive(Debug, Clone, PartialEq)]
struct BolusAck {
    key: RequestKey,
    units: f64,
}

enum Decision {
    Execute(RequestKey, f64),
    Reject(RequestKey),
    Acknowledge(RequestKey, f64),
}

/// Request, acknowledge, confirm. The pump is only driven once a requester
/// echoes back the nonce this rig handed out, with the same amount.
pub struct BolusHandshake {
    device_id: String,
    pending: Mutex<PendingConfirmation>,
    ack: Debounce<BolusAck>,
    tools: Arc<dyn DeviceTools>,
}

impl BolusHandshake {
    pub fn new(
        device_id: impl Into<String>,
        tools: Arc<dyn DeviceTools>,
        outbound: Outbound,
        ack_delay: Duration,
    ) -> Self {
        let device_id = device_id.into();
        let ack_device = device_id.clone();
        let ack = Debounce::new(
            "ack_bolus_request",
            ack_delay,
            action(move |ack: BolusAck| {
                let outbound = outbound.clone();
                let record = ack_record(&ack_device, &ack);
                async move {
                    log_info!("Emitting: {}", record);
                    outbound.db_add(Collection::Devicestatus, record);
                }
            }),
        );

        Self {
            device_id,
            pending: Mutex::new(PendingConfirmation::new()),
            ack,
            tools,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn pending_entry(&self) -> Option<(RequestKey, f64)> {
        self.pending()
            .entry()
            .map(|(key, units)| (key.clone(), units))
    }

    /// Advances the handshake for one devicestatus record. `now_secs` becomes
    /// the nonce of a fresh request.
    pub fn handle_status(&self, status: &Value, now_secs: i64) -> HandshakeOutcome {
        let Some(request) = BolusRequest::from_status(status) else {
            return HandshakeOutcome::Ignored;
        };
        if request.target != self.device_id {
            return HandshakeOutcome::Ignored;
        }

        let key = RequestKey::new(request.requester.clone(), request.confirmation);
        let decision = {
            let mut pending = self.pending();
            match pending.amount_for(&key) {
                Some(units) if units == request.units => {
                    pending.take(&key);
                    Decision::Execute(key, units)
                }
                Some(_) => Decision::Reject(key),
                None => {
                    let fresh = RequestKey::new(request.requester, now_secs);
                    pending.replace(fresh.clone(), request.units);
                    Decision::Acknowledge(fresh, request.units)
                }
            }
        };

        match decision {
            Decision::Execute(key, units) => {
                log_info!("bolusing {} units because of {}", units, status);
                self.execute(units);
                HandshakeOutcome::Executed(key)
            }
            Decision::Reject(key) => {
                log_warn!(
                    "bolus confirmation {} asked for {} units, not the acknowledged amount",
                    key,
                    request.units
                );
                HandshakeOutcome::Rejected(key)
            }
            Decision::Acknowledge(key, units) => {
                self.ack.call(BolusAck {
                    key: key.clone(),
                    units,
                });
                HandshakeOutcome::Acknowledging(key)
            }
        }
    }

    /// Fire and forget: the pump tool is never retried and its failure does
    /// not touch the handshake state.
    fn execute(&self, units: f64) {
        let tools = Arc::clone(&self.tools);
        tokio::spawn(async move {
            match run_blocking(move || tools.bolus(units)).await {
                Ok(output) => log_info!("Bolused: {}", output.trim()),
                Err(err) => log_error!("bolus of {} units failed: {err:#}", units),
            }
        });
    }

    fn pending(&self) -> MutexGuard<'_, PendingConfirmation> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn ack_record(device_id: &str, ack: &BolusAck) -> Value {
    json!({
        "device": device_id,
        "bolusack": {
            "units": ack.units,
            "target": device_id,
            "initiator": ack.key.requester,
            "confirmation": ack.key.nonce,
        }
    })
}
