use carrot_lifeline::connection::ReconnectPolicy;
use carrot_lifeline::consumers::{ClosureHandler, ConsumerOptions, Message};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let manager = carrot_lifeline::connect(
        "amqp://localhost?heartbeat=60",
        ReconnectPolicy::default(),
    )
    .await?;

    // No queue name: the broker generates one, and it is bound to `amq.topic` with the given
    // pattern. A new anonymous queue is asserted and bound after every reconnection.
    manager
        .consume(
            ClosureHandler(|message: Message| async move {
                println!("{}: {}", message.routing_key(), message.content_str());
                Ok::<(), anyhow::Error>(())
            }),
            ConsumerOptions::for_exchange("amq.topic", "some-subject"),
        )
        .await?;

    manager
        .run_until_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
