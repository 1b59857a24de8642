use carrot_lifeline::connection::ReconnectPolicy;
use carrot_lifeline::consumers::{ClosureHandler, ConsumerOptions, Message};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // The heartbeat lets both ends notice a dead connection: without it a broken link can go
    // unnoticed, and the consumer would never be re-attached.
    let manager = carrot_lifeline::connect(
        "amqp://localhost?heartbeat=60",
        ReconnectPolicy::default(),
    )
    .await?;

    // `example-queue` is asserted (created if missing) and consumed from.
    // Returning `Ok` acks the message, returning an error rejects it with requeue.
    manager
        .consume(
            ClosureHandler(|message: Message| async move {
                println!("Received: {}", message.content_str());
                Ok::<(), anyhow::Error>(())
            }),
            ConsumerOptions::for_queue("example-queue"),
        )
        .await?;

    manager
        .run_until_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
