use chrono::DateTime;
use iridium_nsq::{
    Client, ClientConfig, ConnectionState, HandlerError, Message, NsqError, parse_endpoints,
};
use std::time::Duration;

use super::args::{Action, Cli};
use super::exit_codes;

fn classify(e: NsqError) -> (String, u8) {
    let code = match e {
        NsqError::Configuration(_) | NsqError::Encode(_) => exit_codes::USAGE_ERROR,
        _ => exit_codes::NETWORK_ERROR,
    };
    (format!("Error: {}", e), code)
}

fn format_message(m: &Message) -> String {
    let ts = DateTime::from_timestamp_nanos(m.timestamp).format("%Y-%m-%dT%H:%M:%S%.3fZ");
    format!(
        "[{}] {} (attempt {}): {}",
        ts,
        m.id,
        m.attempts,
        String::from_utf8_lossy(&m.body)
    )
}

/// Run the selected action against the configured nsqd daemons
pub async fn run(cli: &Cli) -> Result<(), (String, u8)> {
    let endpoints = parse_endpoints(&cli.nsqd).map_err(classify)?;
    let config =
        ClientConfig::default().requeue_delay(Duration::from_millis(cli.requeue_delay_ms));
    let client = Client::connect(endpoints, config).await.map_err(classify)?;

    let result = match &cli.action {
        Action::Pub { topic, body } => client
            .try_publish(topic, body.clone().into_bytes())
            .await
            .map_err(classify),
        Action::Mpub { topic, bodies } => client
            .try_publish_multi(topic, bodies.iter().map(|b| b.clone().into_bytes()))
            .await
            .map_err(classify),
        Action::Dpub {
            topic,
            body,
            delay_ms,
        } => client
            .try_publish_defer(
                topic,
                body.clone().into_bytes(),
                Duration::from_millis(*delay_ms),
            )
            .await
            .map_err(classify),
        Action::Sub {
            topic,
            channel,
            reject,
        } => subscribe(&client, topic, channel, reject.clone()).await,
    };

    shutdown(&client).await;
    result
}

/// Close the pool and give each connection a moment to flush what is queued.
async fn shutdown(client: &Client) {
    client.close();
    let pool = client.pool();
    for endpoint in pool.endpoints() {
        if let Some(conn) = pool.get(&endpoint.key()) {
            let closed = conn.wait_for_state(ConnectionState::Closed);
            let _ = tokio::time::timeout(Duration::from_secs(2), closed).await;
        }
    }
}

async fn subscribe(
    client: &Client,
    topic: &str,
    channel: &str,
    reject: Option<String>,
) -> Result<(), (String, u8)> {
    let handler = move |m: &Message| -> Result<(), HandlerError> {
        println!("{}", format_message(m));
        match &reject {
            Some(needle) if String::from_utf8_lossy(&m.body).contains(needle.as_str()) => {
                Err(format!("body contains {:?}", needle).into())
            }
            _ => Ok(()),
        }
    };

    let sub = client
        .try_subscribe(topic, channel, handler)
        .await
        .map_err(classify)?;
    eprintln!("Subscribed to {}/{} on {}", topic, channel, sub.endpoint());

    let cancel = sub.cancel_handle();
    let stopped = sub.stopped();
    tokio::pin!(stopped);

    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = &mut stopped => false,
    };

    if interrupted {
        cancel.cancel();
        stopped.await;
        Ok(())
    } else {
        Err((
            "Connection to nsqd closed".to_string(),
            exit_codes::NETWORK_ERROR,
        ))
    }
}
