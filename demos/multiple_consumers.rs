use carrot_lifeline::connection::{ConnectionEvent, ReconnectPolicy};
use carrot_lifeline::consumers::{ClosureHandler, ConsumerOptions, Message};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Give up after ten failed attempts in a row, waiting at most five seconds between them.
    let reconnect_policy = ReconnectPolicy::default()
        .with_max_retries(10)
        .with_delays(Duration::from_millis(500), Duration::from_secs(5));
    let manager =
        carrot_lifeline::connect("amqp://localhost?heartbeat=60", reconnect_policy).await?;

    // All consumers share the connection, and the manager's prefetch count.
    manager.connection_manager().on_event(|event| match event {
        ConnectionEvent::Retry { attempt, delay } => {
            println!("Reconnection attempt {attempt} in {delay:?}")
        }
        ConnectionEvent::Error(e) => println!("Giving up: {e}"),
        _ => {}
    });

    manager
        .consume(
            ClosureHandler(|message: Message| async move {
                println!("[example-queue] {}", message.content_str());
                Ok::<(), anyhow::Error>(())
            }),
            ConsumerOptions::for_queue("example-queue"),
        )
        .await?;
    manager
        .consume(
            ClosureHandler(|message: Message| async move {
                if message.content().is_empty() {
                    anyhow::bail!("Empty payload");
                }
                Ok(())
            }),
            ConsumerOptions::for_queue("example-queue-2"),
        )
        .await?;

    manager
        .run_until_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
