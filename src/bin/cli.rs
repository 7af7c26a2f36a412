use clap::Parser;
use tracing::debug;

use tokredis::{Client, ClientConfig, Command};

/// One-shot command runner, e.g. `tokredis-cli SET greeting hello` or
/// `tokredis-cli SUBSCRIBE news` to stream events until interrupted.
#[derive(Parser, Debug)]
struct Args {
    /// The server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// The server port
    #[arg(short, long, default_value_t = 6379)]
    port: u16,
    /// Database index to select
    #[arg(long, default_value_t = 0)]
    db: u32,
    /// AUTH password
    #[arg(long, env = "TOKREDIS_AUTH")]
    auth: Option<String>,
    /// Command name and arguments
    #[arg(required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> tokredis::Result<()> {
    let _ = tracing_subscriber::fmt()
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let args = Args::parse();
    let mut config = ClientConfig::tcp(&args.host, args.port);
    config.db = args.db;
    config.auth = args.auth.clone();

    let client = Client::connect(config).await?;

    let name = args.command[0].to_uppercase();
    let rest: Vec<&str> = args.command[1..].iter().map(String::as_str).collect();

    match name.as_str() {
        "SUBSCRIBE" | "PSUBSCRIBE" => {
            let mut subscriber = if name == "SUBSCRIBE" {
                client.subscribe(&rest).await?
            } else {
                client.psubscribe(&rest).await?
            };
            while let Some(event) = subscriber.next_event().await {
                println!("{:?}", event);
            }
        }
        _ => {
            let cmd = Command::new(&args.command[0]).args(rest);
            let reply = client.send(&cmd).await?;
            println!("{}", reply);
            client.close().await?;
        }
    }

    Ok(())
}
