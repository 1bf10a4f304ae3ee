use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::protocol::OutboundEvent;

#[derive(Parser, Debug)]
#[command(
    name = "switchboard",
    author,
    version,
    about = "Controller/agent WebSocket relay and probe client"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind the relay listener to.
    #[arg(long, env = "SWITCHBOARD_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// Seconds between server-initiated WebSocket pings.
    #[arg(long, env = "SWITCHBOARD_PING_INTERVAL", default_value_t = 25)]
    pub ping_interval_secs: u64,

    /// Seconds of silence after which a connection is dropped.
    #[arg(long, env = "SWITCHBOARD_IDLE_TIMEOUT", default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Tracing filter directive.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a running relay and print every event it sends
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Relay URL (e.g., ws://localhost:3000)
    #[arg(short, long, default_value = "ws://localhost:3000")]
    pub url: String,

    /// Session ID to join
    #[arg(short, long)]
    pub session: String,

    /// Exit after this many seconds instead of running until the relay closes
    #[arg(long)]
    pub duration_secs: Option<u64>,

    #[command(subcommand)]
    pub role: ProbeRole,
}

#[derive(Subcommand, Debug)]
pub enum ProbeRole {
    /// Join as the session controller
    Controller,
    /// Join as an agent
    Agent {
        /// Agent ID within the session
        #[arg(long)]
        agent_id: String,

        /// Answer every command with a response echoing its payload
        #[arg(long)]
        echo: bool,
    },
}

impl ProbeRole {
    fn join_frame(&self, session: &str) -> Value {
        match self {
            ProbeRole::Controller => json!({
                "event": "controller-join",
                "data": { "sessionId": session },
            }),
            ProbeRole::Agent { agent_id, .. } => json!({
                "event": "agent-join",
                "data": { "sessionId": session, "agentId": agent_id },
            }),
        }
    }
}

pub async fn run_probe(args: ProbeArgs) -> Result<()> {
    let ws_url = format!("{}/ws", args.url.trim_end_matches('/'));
    debug!("Connecting to {} for session {}", ws_url, args.session);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "Connection timeout - is the relay running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let join = args.role.join_frame(&args.session).to_string();
    write
        .send(Message::Text(join.into()))
        .await
        .context("failed to send join")?;

    let echo = matches!(args.role, ProbeRole::Agent { echo: true, .. });
    let session = args.session.clone();
    let listen = async {
        while let Some(msg) = read.next().await {
            let text = match msg.context("relay connection failed")? {
                Message::Text(text) => text.as_str().to_owned(),
                Message::Close(_) => break,
                _ => continue,
            };
            println!("{}", text);

            if !echo {
                continue;
            }
            if let Ok(OutboundEvent::Command(payload)) = serde_json::from_str(&text) {
                let reply = echo_response(&session, payload);
                write
                    .send(Message::Text(reply.to_string().into()))
                    .await
                    .context("failed to send echo response")?;
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    match args.duration_secs {
        Some(secs) => match timeout(Duration::from_secs(secs), listen).await {
            Ok(result) => result,
            Err(_) => Ok(()),
        },
        None => listen.await,
    }
}

fn echo_response(session: &str, mut payload: Value) -> Value {
    if let Some(fields) = payload.as_object_mut() {
        fields.insert("sessionId".into(), Value::String(session.to_string()));
        fields.insert("role".into(), Value::String("agent".into()));
    }
    json!({ "event": "agent-to-controller", "data": payload })
}
