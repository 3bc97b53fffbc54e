use std::env;
use std::time::Duration;

use message_queue::{Context, Queue, QueueConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage (configured through MQ_* environment variables):");
        eprintln!("  queue-cli produce <topic> <payload>");
        eprintln!("  queue-cli tail <topic> [seconds]");
        std::process::exit(1);
    }

    let cmd = args[1].as_str();
    let topic = args[2].as_str();

    match cmd {
        "produce" if args.len() == 4 => {
            let queue = Queue::connect(QueueConfig::from_env()?).await?;
            let ctx = Context::background().with_timeout(queue.config().request_timeout());
            let result = queue.produce(&ctx, topic, args[3].as_bytes().to_vec()).await;
            queue.close().await?;
            result?;
            println!("Published {} bytes to {}", args[3].len(), topic);
        }
        "tail" if args.len() <= 4 => {
            let seconds: u64 = match args.get(3) {
                Some(s) => s.parse()?,
                None => 30,
            };
            let queue = Queue::connect(QueueConfig::from_env()?).await?;
            queue.subscribe(topic, |_ctx, message| async move {
                println!(
                    "{}[{}]@{}: {}",
                    message.topic,
                    message.partition,
                    message.offset,
                    String::from_utf8_lossy(message.payload())
                );
                Ok(())
            })?;

            info!(topic = %topic, seconds, "Tailing topic");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            queue.close().await?;
        }
        _ => {
            eprintln!("Invalid arguments");
            std::process::exit(1);
        }
    }

    Ok(())
}
