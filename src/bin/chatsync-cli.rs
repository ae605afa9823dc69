//! Chatsync CLI - follow and replay conversation streams
//!
//! `watch` subscribes to a live server and prints the transcript whenever it
//! changes. `replay` feeds a recorded server frame log through the transport
//! adapter and reducer without a network.

use anyhow::{Context, Result, bail};
use chatsync::engine::{
    ClientConfig, ControllerStatus, ConversationId, ConversationState, Outcome, StreamController,
    TcpSource, project, reduce, stream_conversation,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser)]
#[command(name = "chatsync")]
#[command(about = "Follow AI assistant conversations as they stream", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a live conversation and print its transcript
    Watch {
        /// Conversation to follow
        #[arg(long)]
        conversation: String,

        /// User to subscribe as (overrides the config)
        #[arg(long)]
        user: Option<String>,

        /// Client config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Replay a recorded NDJSON frame log
    Replay {
        /// File with one server frame per line
        #[arg(long)]
        file: PathBuf,

        /// Conversation the log belongs to
        #[arg(long)]
        conversation: String,
    },

    /// Write a default client config
    InitConfig {
        /// Destination path
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Watch {
            config: Some(path), ..
        } => ClientConfig::load(path)?,
        _ => ClientConfig::default(),
    }
    .with_env_overrides();

    let level = if cli.verbose || config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    match cli.command {
        Commands::Watch {
            conversation, user, ..
        } => {
            let user = user.or(config.user_id.clone()).context(
                "no user id: pass --user, set CHATSYNC_USER_ID, or add userId to the config",
            )?;
            watch(&config, ConversationId::new(conversation), user).await?;
        }

        Commands::Replay { file, conversation } => {
            replay(&file, ConversationId::new(conversation)).await?;
        }

        Commands::InitConfig { path } => {
            ClientConfig::default().save(&path)?;
            println!("Wrote default config to {:?}", path);
        }
    }

    Ok(())
}

async fn watch(config: &ClientConfig, conversation: ConversationId, user: String) -> Result<()> {
    let controller = StreamController::new(Arc::new(TcpSource::new(config.endpoint.clone())));
    let mut updates = controller.subscribe();
    controller.set_target(Some(conversation), Some(user));

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                match snapshot.status {
                    ControllerStatus::Error(message) => bail!("stream failed: {message}"),
                    ControllerStatus::Ready => {
                        if let Some(view) = snapshot.view {
                            print!("\x1b[2J\x1b[H{}", view.render_plain());
                            if snapshot.is_streaming {
                                println!("\n...");
                            }
                        }
                    }
                    ControllerStatus::Idle | ControllerStatus::Loading => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                controller.teardown();
                break;
            }
        }
    }

    Ok(())
}

async fn replay(file: &Path, conversation: ConversationId) -> Result<()> {
    let frames = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read frame log: {:?}", file))?;

    let (client, server) = tokio::io::duplex(64 * 1024);
    let feeder = tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(server);
        let mut lines = BufReader::new(reader).lines();
        // The adapter writes its subscribe frame first.
        lines.next_line().await?;
        for line in frames.lines().filter(|line| !line.trim().is_empty()) {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.shutdown().await?;
        Ok::<_, std::io::Error>(())
    });

    let Some(stream) =
        stream_conversation(client, Some(&conversation), Some("replay")).await?
    else {
        bail!("conversation id is blank");
    };

    let mut state = ConversationState::from_snapshot(&stream.snapshot);
    let mut events = stream.events;
    let (mut applied, mut skipped) = (0usize, 0usize);
    while let Some(event) = events.next().await {
        match reduce(&mut state, &event?) {
            Outcome::Applied => applied += 1,
            Outcome::Skipped(_) => skipped += 1,
        }
    }
    feeder.await??;

    print!("{}", project(&state).render_plain());
    println!("\n{applied} events applied, {skipped} skipped");
    Ok(())
}
