//! ---
//! eb_section: "04-daemon"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Sample request/response handlers served by the daemon."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use edgebus_msg::{
    Dispatcher, Envelope, GroupRegistrar, HandlerGroup, HandlerResult, InboundMessage,
    MessageHandler, STATUS_NOT_FOUND,
};
use rand::Rng;
use serde_json::json;
use tracing::{info, warn};

async fn respond(dispatcher: &Dispatcher, message: &InboundMessage, response: Envelope) -> HandlerResult {
    dispatcher
        .publish(message.protocol.into(), &response, None)
        .await
        .into_result()?;
    Ok(())
}

/// Health and identity queries.
pub struct SystemHandlers {
    dispatcher: Dispatcher,
    device_id: String,
    started: Instant,
}

impl SystemHandlers {
    pub fn new(dispatcher: Dispatcher, device_id: impl Into<String>) -> Self {
        Self {
            dispatcher,
            device_id: device_id.into(),
            started: Instant::now(),
        }
    }

    async fn get_health_check_request(self: Arc<Self>, message: InboundMessage) -> HandlerResult {
        info!(correlation_id = %message.correlation_id, "health check requested");
        let response = Envelope::build(message.reply(json!({
            "device_id": self.device_id,
            "status": "healthy",
            "uptime_s": self.started.elapsed().as_secs(),
        })));
        respond(&self.dispatcher, &message, response).await
    }
}

impl HandlerGroup for SystemHandlers {
    fn routes(registrar: &mut GroupRegistrar<Self>) {
        registrar.method("get_health_check_request", SystemHandlers::get_health_check_request);
    }
}

/// Simulated sensor reads.
pub struct SensorHandlers {
    dispatcher: Dispatcher,
}

impl SensorHandlers {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    async fn get_temp(self: Arc<Self>, message: InboundMessage) -> HandlerResult {
        let Some(sensor_id) = message.payload.get("sensor_id").and_then(|id| id.as_str()) else {
            anyhow::bail!("request payload is missing a string sensor_id");
        };
        let temp: f64 = rand::thread_rng().gen_range(18.0..32.0);
        let response = Envelope::build(message.reply(json!({
            "sensor_id": sensor_id,
            "temp": (temp * 10.0).round() / 10.0,
        })));
        respond(&self.dispatcher, &message, response).await
    }
}

impl HandlerGroup for SensorHandlers {
    fn routes(registrar: &mut GroupRegistrar<Self>) {
        registrar.method("get_temp", SensorHandlers::get_temp);
    }
}

/// Answers unrecognised routes with a 404 envelope.
pub struct UnknownRouteHandler {
    dispatcher: Dispatcher,
}

impl UnknownRouteHandler {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl MessageHandler for UnknownRouteHandler {
    async fn handle(&self, message: InboundMessage) -> HandlerResult {
        warn!(route = %message.route, topic = %message.topic, "no handler registered for route");
        let response = Envelope::build(
            message
                .reply(json!({
                    "error": "route not recognised",
                    "route": message.route,
                }))
                .with_status(STATUS_NOT_FOUND),
        );
        respond(&self.dispatcher, &message, response).await
    }
}
