//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

use std::error::Error;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::debug;

use crate::api::ChatMessage;
use crate::core::chat_stream::{ChatClient, StreamMessage};
use crate::core::config::{Config, Settings};
use crate::core::request::{Attachment, ChatRequest};
use crate::server::{self, AppState};
use crate::utils::logging::init_tracing;

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(version)]
#[command(about = "A streaming chat relay for OpenAI-compatible providers")]
#[command(
    long_about = "chatrelay accepts chat requests as multipart forms, enforces a server-side \
system prompt, and streams the upstream provider's completion back unchanged. The same binary \
also acts as a client of a running relay.\n\n\
Environment Variables (override the config file):\n\
  OPENAI_API_URL           Provider base URL; requests go to <url>/v1/chat/completions\n\
  CF_GATEWAY               AI gateway URL, used when OPENAI_API_URL is unset\n\
  OPENAI_API_KEY           Default provider key\n\
  CHATRELAY_SYSTEM_PROMPT  System prompt enforced on every request\n\
  RUST_LOG                 Log filter (default: chatrelay=info)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Log at debug level
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay server
    Serve {
        /// Address to listen on (overrides listen-addr)
        #[arg(short = 'l', long, value_name = "ADDR")]
        listen: Option<std::net::SocketAddr>,
    },
    /// Send a message through a running relay and print the answer
    Chat {
        /// Model to request
        #[arg(short = 'm', long)]
        model: Option<String>,
        /// Logical endpoint, used for gateway routing
        #[arg(short = 'e', long)]
        endpoint: Option<String>,
        /// Provider key to send instead of the relay's default
        #[arg(short = 'k', long)]
        key: Option<String>,
        /// Relay URL (overrides server-url)
        #[arg(short = 's', long, value_name = "URL")]
        server: Option<String>,
        /// Image to attach (repeatable)
        #[arg(short = 'f', long = "file", value_name = "PATH")]
        files: Vec<PathBuf>,
        /// Wait for the whole answer instead of streaming it
        #[arg(long)]
        no_stream: bool,
        /// Message text
        #[arg(required = true, trailing_var_arg = true)]
        message: Vec<String>,
    },
    /// Print the current configuration
    Config,
    /// Set a configuration value
    Set {
        /// Configuration key to set
        key: String,
        /// Value to set (multiple words are joined with spaces)
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        value: Vec<String>,
    },
    /// Unset a configuration value
    Unset {
        /// Configuration key to unset
        key: String,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);
    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    match args.command {
        Commands::Serve { listen } => {
            let settings = Config::load()?.settings();
            let state = AppState::from_settings(&settings, reqwest::Client::new())?;
            server::serve(listen.unwrap_or(settings.listen_addr), state).await?;
            Ok(())
        }
        Commands::Chat {
            model,
            endpoint,
            key,
            server,
            files,
            no_stream,
            message,
        } => {
            let mut settings = Config::load()?.settings();
            if let Some(server) = server {
                settings.server_url = server;
            }
            let request = build_request(&settings, model, endpoint, key, &files, message.join(" "))?;
            let client = ChatClient::from_settings(&settings, reqwest::Client::new());
            if no_stream {
                println!("{}", client.complete(request).await?);
                Ok(())
            } else {
                stream_to_stdout(&client, request).await
            }
        }
        Commands::Config => {
            Config::load()?.print_all();
            Ok(())
        }
        Commands::Set { key, value } => {
            let mut config = Config::load()?;
            let value = value.join(" ");
            let key = config.set_value(&key, &value)?;
            config.save()?;
            println!("✅ Set {key}");
            Ok(())
        }
        Commands::Unset { key } => {
            let mut config = Config::load()?;
            let key = config.unset_value(&key)?;
            config.save()?;
            println!("✅ Unset {key}");
            Ok(())
        }
    }
}

fn build_request(
    settings: &Settings,
    model: Option<String>,
    endpoint: Option<String>,
    key: Option<String>,
    files: &[PathBuf],
    message: String,
) -> Result<ChatRequest, Box<dyn Error>> {
    let mut request = ChatRequest::new(
        model.unwrap_or_else(|| settings.default_model.clone()),
        endpoint.unwrap_or_else(|| settings.default_endpoint.clone()),
        vec![ChatMessage::user(message)],
    );
    if let Some(key) = key {
        request = request.with_key(key);
    }
    for path in files {
        request = request.with_attachment(read_attachment(path)?);
    }
    Ok(request)
}

fn read_attachment(path: &Path) -> Result<Attachment, Box<dyn Error>> {
    let bytes = std::fs::read(path)
        .map_err(|err| format!("Failed to read {}: {err}", path.display()))?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    Ok(Attachment::new(Attachment::mime_for_extension(extension), bytes))
}

/// Prints deltas as they arrive; Ctrl-C stops the stream quietly.
async fn stream_to_stdout(client: &ChatClient, request: ChatRequest) -> Result<(), Box<dyn Error>> {
    let mut stream = client.stream_chat(request);
    let mut stdout = std::io::stdout();

    loop {
        let next = tokio::select! {
            message = stream.recv() => Some(message),
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(message) = next else {
            debug!("interrupted, cancelling stream");
            stream.cancel();
            writeln!(stdout)?;
            return Ok(());
        };

        match message {
            Some(StreamMessage::Delta(event)) if event.index == 0 => {
                write!(stdout, "{}", event.content)?;
                stdout.flush()?;
            }
            Some(StreamMessage::Delta(_)) => {}
            Some(StreamMessage::End) | None => {
                writeln!(stdout)?;
                return Ok(());
            }
            Some(StreamMessage::Error(err)) => {
                writeln!(stdout)?;
                return Err(Box::new(err));
            }
        }
    }
}
