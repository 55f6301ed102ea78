use anyhow::Result;
use serde_json::json;
use socket_queue::{
    ChannelSession, Message, MemoryBroker, Responder, SessionConfig, session::config::DEFAULT_EXCHANGE,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const BACKEND_QUEUE: &str = "echo-backend";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let channel = std::env::var("CHANNEL_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
    let exchange = std::env::var("EXCHANGE").unwrap_or_else(|_| DEFAULT_EXCHANGE.to_string());
    let message_count: u64 = std::env::var("MESSAGE_COUNT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    let broker = MemoryBroker::new().with_exchange(exchange.clone());
    let config = SessionConfig::builder().exchange(exchange).build();

    // Backend: answer every request with `{command}-ack` on the requesting channel
    let responder = Responder::new(Arc::new(broker.connect()), config.clone());
    let replies = responder.clone();
    let listener = responder
        .listen(BACKEND_QUEUE, move |message: Message| {
            let replies = replies.clone();
            async move {
                let Some(channel) = message.channel() else {
                    anyhow::bail!("request without channel");
                };
                let command = message.command().unwrap_or_default();
                let payload = message.payload.as_json().cloned().unwrap_or_default();

                replies.reply(channel, &format!("{command}-ack"), &payload)?;
                anyhow::Ok(())
            }
        })
        .await?;

    info!(channel = %channel, "Opening channel session");

    let session = ChannelSession::open(
        Arc::new(broker.connect()),
        config,
        channel.as_str(),
        |message: Message| async move {
            info!(
                command = message.command().unwrap_or("?"),
                payload = ?message.payload,
                "Response received"
            );
            anyhow::Ok(())
        },
    )
    .await?;

    let mut interval = tokio::time::interval(Duration::from_millis(500));
    for seq in 0..message_count {
        interval.tick().await;

        if let Err(e) = session.send("move", &json!({ "seq": seq, "x": seq * 10 })) {
            warn!(seq, error = %e, "Failed to send request");
        }
    }

    // Let the last replies drain before tearing down
    tokio::time::sleep(Duration::from_millis(200)).await;

    session.destroy()?.wait().await?;
    listener.close().await?;

    info!(channel = %channel, "Done");
    Ok(())
}
