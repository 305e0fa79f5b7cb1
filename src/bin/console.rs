//! Interactive producer: every line read from stdin becomes a `create_user`
//! message. Type `quit` to exit.

use std::{io::Write, sync::Arc};

use courier::{
    broker::{amqp::AmqpBroker, Broker},
    config::Config,
    producer::{Producer, Submission},
    store::Store,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    courier::init_tracing()?;

    let config = Config::load()?;
    let store = Store::connect_with(&config).await?;
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(config.amqp_uri()));

    let producer = Producer::new(store, broker.clone(), "console");
    producer.ensure_queue(config.queue()).await?;

    tracing::info!(queue = config.queue(), "Console producer started");

    println!("courier console producer");
    println!("Type 'quit' to exit\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sent = 0u64;

    loop {
        print!("Name to add: ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        let input = line.trim();

        if input == "quit" {
            break;
        }
        if input.is_empty() {
            continue;
        }

        match producer
            .submit(Submission::create_user(config.queue(), input))
            .await
        {
            Ok(receipt) => {
                sent += 1;
                tracing::info!(message_id = receipt.id, message_count = sent, "Message sent to queue");
                println!("Sent to queue (ID: {}): {input}", receipt.id);
            }
            Err(e) => {
                tracing::error!("Failed to submit message: {e}");
                eprintln!("Error: {e}");
            }
        }
    }

    broker.close().await?;

    tracing::info!(total_messages_sent = sent, "Console producer stopped");
    println!("Done. Messages sent: {sent}");

    Ok(())
}
