use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod output;

use commands::Client;
use output::Output;

#[derive(Parser)]
#[command(name = "sdm")]
#[command(version)]
#[command(about = "CLI for end-to-end encrypted direct messages")]
#[command(long_about = "A command-line client for sealed direct messages.\n\nThe relay only ever stores ciphertext; keys stay in the local data directory.")]
struct Cli {
    /// Output in JSON format (for agents/scripts)
    #[arg(short, long, global = true)]
    json: bool,

    /// Data directory (default: platform data dir/sdm)
    #[arg(long, global = true, env = "SDM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Relay REST base URL, overriding the stored one
    #[arg(long, global = true, env = "SDM_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a relay token
    Login {
        /// Bearer token issued by the relay
        token: String,
        /// User id the token belongs to
        #[arg(long)]
        user_id: String,
    },

    /// Clear credentials and the local identity key
    Logout,

    /// Show current login and identity key
    Whoami,

    /// Identity key management
    #[command(subcommand)]
    Keys(KeysCommands),

    /// Conversation management
    #[command(subcommand)]
    Chat(ChatCommands),

    /// Total unread messages across conversations
    Unread,

    /// Send a message
    Send {
        /// Conversation ID
        conversation: String,
        /// Peer user ID
        peer: String,
        /// Message text
        text: String,
    },

    /// Print decrypted messages and mark the peer's as read
    Read {
        /// Conversation ID
        conversation: String,
        /// Peer user ID
        peer: String,
        /// Number of newest messages to fetch
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Stream session state and new messages until Ctrl-C
    Listen {
        /// Conversation ID
        conversation: String,
        /// Peer user ID
        peer: String,
    },
}

#[derive(Subcommand)]
enum KeysCommands {
    /// Create the local identity key if missing
    Init,
    /// Publish the identity key to the relay
    Publish,
    /// Show a published key (own by default)
    Show {
        /// Peer user ID
        peer: Option<String>,
    },
}

#[derive(Subcommand)]
enum ChatCommands {
    /// Get or create the conversation with a peer
    Start {
        /// Peer user ID
        peer: String,
    },
    /// List conversations
    List,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output = Output::new(cli.json);

    let result = run(cli, &output).await;

    if let Err(e) = result {
        output.error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli, output: &Output) -> anyhow::Result<()> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("Could not find data directory; pass --data-dir")?
            .join("sdm"),
    };

    std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

    let mut config = config::Config::load(&data_dir)?;
    let api_override = cli.api_url.as_deref();

    match cli.command {
        Commands::Login { token, user_id } => {
            if let Some(url) = api_override {
                config.api_url = url.to_string();
            }
            commands::identity::login(&token, &user_id, &config, output).await
        }
        Commands::Logout => commands::identity::logout(&data_dir, output).await,
        Commands::Whoami => commands::identity::whoami(&config, &data_dir, output).await,
        Commands::Keys(KeysCommands::Init) => {
            commands::keys::init(&config, &data_dir, output).await
        }
        Commands::Keys(KeysCommands::Publish) => {
            let client = Client::connect(&config, &data_dir, api_override)?;
            commands::keys::publish(&client, output).await
        }
        Commands::Keys(KeysCommands::Show { peer }) => {
            let client = Client::connect(&config, &data_dir, api_override)?;
            commands::keys::show(&client, peer.as_deref(), output).await
        }
        Commands::Chat(cmd) => {
            let client = Client::connect(&config, &data_dir, api_override)?;
            match cmd {
                ChatCommands::Start { peer } => commands::chat::start(&client, &peer, output).await,
                ChatCommands::List => commands::chat::list(&client, output).await,
            }
        }
        Commands::Unread => {
            let client = Client::connect(&config, &data_dir, api_override)?;
            commands::chat::unread(&client, output).await
        }
        Commands::Send {
            conversation,
            peer,
            text,
        } => {
            let client = Client::connect(&config, &data_dir, api_override)?;
            commands::message::send(&client, &conversation, &peer, &text, output).await
        }
        Commands::Read {
            conversation,
            peer,
            limit,
        } => {
            let client = Client::connect(&config, &data_dir, api_override)?;
            commands::message::read(&client, &conversation, &peer, limit, output).await
        }
        Commands::Listen { conversation, peer } => {
            let client = Client::connect(&config, &data_dir, api_override)?;
            commands::message::listen(&client, &conversation, &peer, output).await
        }
    }
}
