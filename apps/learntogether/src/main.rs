mod cli;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use cli::{Cli, Command, ConversationCommand, MessagesCommand};
use conversation_id::{canonicalize, resolve_recipient};
use learntogether_core::call::media::SyntheticMedia;
use learntogether_core::call::phase::{CallCommand, SessionEvent};
use learntogether_core::call::relay::{WebSocketRelayConnector, connect_with_retry};
use learntogether_core::call::rtc::RtcPeerLinkFactory;
use learntogether_core::chat::{ConversationRoom, MessageApi};
use learntogether_core::telemetry::{self, LogConfig};
use learntogether_core::{AppContext, CallConfig, CallSession};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialise logging")?;

    let context_path = match cli.context {
        Some(path) => path,
        None => AppContext::default_path()?,
    };
    let ctx = AppContext::hydrate(&context_path)
        .with_context(|| format!("failed to read {}", context_path.display()))?;

    match cli.command {
        Command::Call { name, relay } => run_call(&ctx, name, relay).await,
        Command::Conversation { command } => run_conversation(&ctx, command),
        Command::Login {
            user_id,
            token,
            name,
        } => {
            ctx.sign_in(&user_id, &token, name.as_deref())
                .context("failed to store credentials")?;
            println!("signed in as {user_id}");
            Ok(())
        }
        Command::Logout => {
            ctx.logout().context("failed to clear context")?;
            println!("signed out");
            Ok(())
        }
        Command::Messages { api, command } => run_messages(&ctx, api, command).await,
    }
}

fn load_config(ctx: &AppContext) -> Result<CallConfig> {
    let config = CallConfig::load(&ctx.settings());
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run_call(ctx: &AppContext, name: Option<String>, relay: Option<String>) -> Result<()> {
    let mut config = load_config(ctx)?;
    if let Some(relay) = relay {
        config.relay_url = relay;
        config.validate().context("invalid relay url")?;
    }
    let name = name
        .or_else(|| ctx.display_name())
        .ok_or_else(|| anyhow!("a display name is required (--name)"))?;

    let (session, mut events) = CallSession::new(
        config,
        Arc::new(SyntheticMedia::default()),
        Arc::new(RtcPeerLinkFactory),
        Arc::new(WebSocketRelayConnector),
    );
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let session_task = tokio::spawn(session.run(commands_rx));

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::PhaseChanged(phase) => println!("* {}", phase.status_text()),
                SessionEvent::Error(message) => eprintln!("! {message}"),
                SessionEvent::Chat(entry) if !entry.local => {
                    println!("{}: {}", entry.sender, entry.text)
                }
                SessionEvent::Chat(_) => {}
                SessionEvent::RemoteStream(Some(stream)) => {
                    println!("* receiving {} remote track(s)", stream.tracks.len())
                }
                SessionEvent::RemoteStream(None) => {}
            }
        }
    });

    commands
        .send(CallCommand::Join { name })
        .map_err(|_| anyhow!("call session stopped"))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line == "/leave" {
            break;
        }
        if line.is_empty() {
            continue;
        }
        if commands
            .send(CallCommand::SendChat {
                text: line.to_string(),
            })
            .is_err()
        {
            break;
        }
    }

    let _ = commands.send(CallCommand::Shutdown);
    session_task.await.context("call session panicked")?;
    printer.abort();
    Ok(())
}

fn run_conversation(ctx: &AppContext, command: ConversationCommand) -> Result<()> {
    match command {
        ConversationCommand::Canonicalize { id } => {
            println!("{}", canonicalize(&id));
        }
        ConversationCommand::Recipient { id, me } => {
            let me = me
                .or_else(|| ctx.user_id())
                .ok_or_else(|| anyhow!("pass --me or sign in first"))?;
            match resolve_recipient(&id, &me) {
                Some(recipient) => println!("{recipient}"),
                None => bail!("{me} is not a participant of {}", canonicalize(&id)),
            }
        }
    }
    Ok(())
}

async fn run_messages(ctx: &AppContext, api: Option<String>, command: MessagesCommand) -> Result<()> {
    let mut config = load_config(ctx)?;
    if let Some(api) = api {
        config.message_api_url = api;
    }
    let api = MessageApi::new(&config.message_api_url, ctx.token())?;

    match command {
        MessagesCommand::History { id } => {
            let id = canonicalize(&id);
            let messages = api
                .history(&id)
                .await
                .with_context(|| format!("failed to load messages for {id}"))?;
            for message in messages {
                println!(
                    "[{}] {}: {}",
                    message.timestamp.format("%Y-%m-%d %H:%M"),
                    message.sender_name,
                    message.text
                );
            }
        }
        MessagesCommand::Send { id, text, relay } => {
            let user_id = ctx
                .user_id()
                .ok_or_else(|| anyhow!("sign in before sending messages"))?;
            let user_name = ctx.display_name().unwrap_or_else(|| user_id.clone());
            if let Some(relay) = relay {
                config.relay_url = relay;
            }

            let (link, _events) = connect_with_retry(
                &WebSocketRelayConnector,
                &config.relay_url,
                &config.relay_retry,
            )
            .await
            .context("failed to reach relay")?;

            let room = ctx
                .update_counterparts(|book, me| {
                    ConversationRoom::open(&id, me, &user_name, link.clone(), api, book)
                })
                .context("failed to update context")?;
            room.join()?;
            let stored = room.send(&text).await;
            link.close().await;
            let stored = stored.with_context(|| format!("failed to send to {}", room.id()))?;
            println!("sent to {} at {}", room.id(), stored.timestamp.to_rfc3339());
        }
    }
    Ok(())
}
