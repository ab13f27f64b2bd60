//! chat-client - ask the chat-relay gateway a question and print the answer as it streams.

use std::env;
use std::io::{BufRead, Write};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chat_client::{ChatClient, Config, Outcome};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V
    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("chat-client {}", VERSION);
        return Ok(());
    }

    // Logs go to stderr so they never interleave with the answer.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Set CHAT__GATEWAY__TOKEN or provide chat.toml.",
            e
        )
    })?;
    let client = ChatClient::new(config.gateway.clone());

    // One query from the command line, or one per stdin line.
    if !args.is_empty() {
        ask(&client, &args.join(" "), config.chat_id.as_deref()).await?;
        return Ok(());
    }

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        ask(&client, &line, config.chat_id.as_deref()).await?;
    }

    Ok(())
}

async fn ask(client: &ChatClient, query: &str, chat_id: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    let reply = client
        .ask(query, chat_id, |token| {
            let _ = write!(stdout, "{}", token);
            let _ = stdout.flush();
        })
        .await?;
    println!();

    match reply.outcome {
        Outcome::Completed => {}
        Outcome::TimedOut => eprintln!("(no response from the model in time)"),
        Outcome::Failed(message) => eprintln!("(error: {})", message),
        Outcome::Disconnected => eprintln!("(connection closed before the answer finished)"),
    }
    Ok(())
}
