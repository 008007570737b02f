use clap::{Parser, Subcommand};
use learntogether_core::telemetry::LogLevel;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "learntogether")]
#[command(about = "Peer video calls and conversation tools for learntogether")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    /// Context file (defaults to ~/.learntogether/context.toml)
    #[arg(long, global = true, env = "LEARNTOGETHER_CONTEXT")]
    pub context: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join the video pairing queue. Lines typed on stdin are sent as chat;
    /// `/leave` hangs up.
    Call {
        /// Display name announced to the other participant
        #[arg(short, long)]
        name: Option<String>,

        /// Relay websocket URL
        #[arg(long, env = "LEARNTOGETHER_RELAY_URL")]
        relay: Option<String>,
    },

    /// Conversation id helpers
    Conversation {
        #[command(subcommand)]
        command: ConversationCommand,
    },

    /// Store credentials for the message API
    Login {
        #[arg(long)]
        user_id: String,

        #[arg(long)]
        token: String,

        /// Display name used for messages and calls
        #[arg(long)]
        name: Option<String>,
    },

    /// Forget stored credentials and conversation history
    Logout,

    /// Read or write conversation messages
    Messages {
        /// Message API base URL
        #[arg(long, env = "LEARNTOGETHER_MESSAGE_API_URL")]
        api: Option<String>,

        #[command(subcommand)]
        command: MessagesCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConversationCommand {
    /// Print the canonical form of a conversation id
    Canonicalize { id: String },

    /// Print the participant that messages from `--me` go to
    Recipient {
        id: String,

        /// Defaults to the signed-in user
        #[arg(long)]
        me: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum MessagesCommand {
    History { id: String },

    Send {
        id: String,
        text: String,

        /// Relay websocket URL used to broadcast the message
        #[arg(long, env = "LEARNTOGETHER_RELAY_URL")]
        relay: Option<String>,
    },
}
