//! Folio - command-line access to the document persistence core
//!
//! Opens folders, edits and watches documents, and records versions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use folio::core::document::{Resolution, SessionEvent};
use folio::Workspace;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "folio", version, about = "Local document persistence and versioning")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Grant access to a folder
    Open { folder: PathBuf },
    /// Revoke access to a folder
    Close { folder: PathBuf },
    /// List folders with active access
    Folders,
    /// Replace a document's content and save it
    Write { file: PathBuf, content: String },
    /// Print a document's content
    Cat { file: PathBuf },
    /// Watch a document for external changes until interrupted
    Watch {
        file: PathBuf,
        /// What to do when the file changes on disk
        #[arg(long, value_enum, default_value_t = OnConflict::Reload)]
        on_conflict: OnConflict,
    },
    /// Initialize version control in a folder
    Init { folder: PathBuf },
    /// Record a version of everything in a folder
    Commit {
        folder: PathBuf,
        #[arg(short, long)]
        message: String,
    },
    /// Show the version history of a file
    Log {
        file: PathBuf,
        /// Repository folder (defaults to the file's folder)
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// Show uncommitted changes in a folder
    Status { folder: PathBuf },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OnConflict {
    Reload,
    KeepLocal,
}

impl From<OnConflict> for Resolution {
    fn from(value: OnConflict) -> Self {
        match value {
            OnConflict::Reload => Resolution::Reload,
            OnConflict::KeepLocal => Resolution::KeepLocal,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut workspace = Workspace::load_default()
        .await
        .context("Failed to load workspace")?;

    match cli.command {
        Command::Open { folder } => {
            let folder = absolute(&folder)?;
            if workspace.open_folder(&folder).await {
                println!("Opened {}", folder.display());
            } else {
                anyhow::bail!("Access to {} was not granted", folder.display());
            }
        }
        Command::Close { folder } => {
            let folder = absolute(&folder)?;
            if !workspace.close_folder(&folder).await? {
                println!("{} was not open", folder.display());
            }
        }
        Command::Folders => {
            for folder in workspace.open_folders().await {
                println!("{}", folder.display());
            }
        }
        Command::Write { file, content } => {
            let session = workspace.open_document(&absolute(&file)?).await?;
            session.edit(content)?;
            session.save().await?;
            session.close().await?;
        }
        Command::Cat { file } => {
            let session = workspace.open_document(&absolute(&file)?).await?;
            print!("{}", session.content());
            session.close().await?;
        }
        Command::Watch { file, on_conflict } => {
            let mut session = workspace.open_document(&absolute(&file)?).await?;
            tracing::info!("Watching {} (Ctrl-C to stop)", session.path().display());
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = session.next_event() => match event {
                        Some(SessionEvent::ExternalChangeDetected { .. }) => {
                            println!("{} changed on disk", session.path().display());
                            session.resolve(on_conflict.into()).await?;
                        }
                        Some(SessionEvent::Reloaded) => print!("{}", session.content()),
                        Some(SessionEvent::WriteFailed { message }) => eprintln!("{message}"),
                        Some(SessionEvent::Saved { .. }) => {}
                        None => break,
                    },
                }
            }
            session.close().await?;
        }
        Command::Init { folder } => {
            println!("{}", workspace.init_versioning(&absolute(&folder)?).await?);
        }
        Command::Commit { folder, message } => {
            println!(
                "{}",
                workspace.record_version(&message, &absolute(&folder)?).await?
            );
        }
        Command::Log { file, folder } => {
            let file = absolute(&file)?;
            let folder = match folder {
                Some(folder) => absolute(&folder)?,
                None => file
                    .parent()
                    .map(Path::to_path_buf)
                    .context("File has no parent folder")?,
            };
            for record in workspace.history(&file, &folder).await? {
                println!(
                    "{}  {}  {}",
                    record.id,
                    record.timestamp.format("%Y-%m-%d %H:%M"),
                    record.message
                );
            }
        }
        Command::Status { folder } => {
            println!("{}", workspace.status(&absolute(&folder)?).await?);
        }
    }

    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Invalid path: {}", path.display()))
}
