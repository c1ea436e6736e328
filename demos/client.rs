//! Interactive WebSocket client.
//!
//! Run: cargo run --example client -- ws://127.0.0.1:9001/
//!
//! Each line typed on stdin is sent as a text message once connected. The
//! client reconnects by itself if the server goes away. Set `RUST_LOG=debug`
//! to watch the state machine.

use std::error::Error;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use wstether::{Config, Event, WebSocket};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:9001/".to_string());
    println!("Connecting to {url}");

    let config = Config::default()
        .with_ping_interval(Duration::from_secs(15))
        .with_connect_timeout(Duration::from_secs(10));
    let ws = WebSocket::builder(url).with_config(config).build()?;
    let mut events = ws.subscribe();
    ws.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Event::StateChanged(state)) => println!("[{state}]"),
                Some(Event::Text(text)) => println!("< {text}"),
                Some(Event::Binary(data)) => println!("< {} bytes", data.len()),
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => match ws.send_text(line) {
                    Ok(completion) => completion.await?,
                    Err(e) => println!("not sent: {e}"),
                },
                None => break,
            },
        }
    }

    println!("Closing connection...");
    ws.shutdown().await;
    Ok(())
}
