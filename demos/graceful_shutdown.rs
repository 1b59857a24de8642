use carrot_lifeline::connection::ReconnectPolicy;
use carrot_lifeline::consumers::{ClosureHandler, ConsumerEvent, ConsumerOptions, Message};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let manager = carrot_lifeline::connect(
        "amqp://localhost?heartbeat=60",
        ReconnectPolicy::default(),
    )
    .await?;

    for queue in ["example-queue", "example-queue-2"] {
        let consumer = manager
            .consume(
                ClosureHandler(|message: Message| async move {
                    // Pretend processing takes a while.
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    println!("Processed: {}", message.content_str());
                    Ok::<(), anyhow::Error>(())
                }),
                ConsumerOptions::for_queue(queue),
            )
            .await?;
        consumer.on_event(move |event| {
            if let ConsumerEvent::AllConsumed = event {
                println!("{queue}: no message left in flight");
            }
        });
    }

    // On Ctrl+C, `run_until_shutdown`:
    // - cancels every subscription, so no new message is delivered;
    // - waits for the messages being processed to be acked or rejected;
    // - closes the connection.
    manager
        .run_until_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("Shutting down, waiting for in-flight messages");
        })
        .await
}
