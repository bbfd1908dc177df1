//! ---
//! eb_section: "02-messaging-envelope-routing"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Envelope protocol, handler registry and dual-transport router."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use edgebus_msg::{
    handler_fn, ClientOptions, Envelope, EnvelopeOptions, HandlerResult, InMemoryTransport,
    Protocol, PubSubClient, TopicSchema,
};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Node answers Echo.say requests arriving on its local-bus ingress topic.
    let client = PubSubClient::new(
        TopicSchema::new("demo", "node-a"),
        handler_fn(|message| async move {
            println!("unrouted message for {}", message.route);
            HandlerResult::Ok(())
        }),
        ClientOptions::default(),
    );
    let dispatcher = client.dispatcher().clone();
    client.register_route(
        "Echo.say",
        handler_fn(move |message| {
            let dispatcher = dispatcher.clone();
            async move {
                let reply = Envelope::build(message.reply(message.payload.clone()));
                dispatcher
                    .publish(message.protocol.into(), &reply, None)
                    .await
                    .into_result()?;
                HandlerResult::Ok(())
            }
        }),
    )?;

    let bus = InMemoryTransport::new();
    client.activate(Protocol::Local, Arc::new(bus.clone())).await?;

    // Another component on the same bus sends a request.
    let request = Envelope::build(
        EnvelopeOptions::new()
            .with_route("Echo.say")
            .with_payload(json!({"text": "hello"})),
    );
    bus.inject(&client.topics().ingress(), request.to_bytes()?);
    tokio::time::sleep(Duration::from_millis(50)).await;

    for frame in bus.published_on(&client.topics().egress()) {
        let envelope = frame.envelope()?;
        println!(
            "egress route={} status={} message={}",
            envelope.route, envelope.status, envelope.payload
        );
    }
    client.shutdown();
    Ok(())
}
