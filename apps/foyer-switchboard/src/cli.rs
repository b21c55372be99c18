use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use foyer_proto::{ClientMessage, ServerMessage};

#[derive(Parser)]
#[command(name = "foyer-switchboard", about = "Signaling switchboard for foyer rooms")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Join a room on a running switchboard and print the traffic it relays
    Probe {
        /// Websocket endpoint of the switchboard
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,
        /// Room to join
        #[arg(long)]
        room: String,
        /// User id to present
        #[arg(long, default_value = "probe")]
        user: String,
        /// Chat line to send after joining
        #[arg(long)]
        say: Option<String>,
        /// Seconds to keep printing traffic before exiting
        #[arg(long, default_value_t = 5)]
        linger: u64,
    },
}

pub async fn run_probe(
    url: String,
    room: String,
    user: String,
    say: Option<String>,
    linger: u64,
) -> Result<()> {
    println!("Connecting to {url}...");
    let (socket, _) = timeout(Duration::from_secs(5), connect_async(&url))
        .await
        .map_err(|_| anyhow!("connection to {url} timed out"))??;
    let (mut write, mut read) = socket.split();

    let join = ClientMessage::JoinRoom {
        room_id: room.clone(),
        user_id: user.clone(),
        display_name: user.clone(),
    };
    write
        .send(Message::Text(serde_json::to_string(&join)?.into()))
        .await?;
    println!("Sent join for room {room} as {user}");

    if let Some(text) = say {
        write
            .send(Message::Text(
                serde_json::to_string(&ClientMessage::Chat { text })?.into(),
            ))
            .await?;
    }

    let deadline = Instant::now() + Duration::from_secs(linger);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(message) => println!("<- {message:?}"),
                    Err(_) => println!("<- {text}"),
                }
            }
            Ok(Some(Ok(Message::Close(_)))) => {
                println!("Connection closed by switchboard");
                break;
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(err))) => return Err(anyhow!("websocket error: {err}")),
            Ok(None) => {
                println!("Connection ended");
                break;
            }
            Err(_) => break,
        }
    }
    Ok(())
}
