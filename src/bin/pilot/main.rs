mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use gram_pilot::config::{ENV_CATALOG, ENV_JOURNAL, ENV_SERIAL};

#[derive(Parser)]
#[command(name = "gram-pilot", version, about = "Drive the Instagram app on an Android device over adb")]
struct Cli {
    /// JSON session config; defaults apply to anything it leaves out.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// adb serial of the device to drive.
    #[arg(long, global = true, env = ENV_SERIAL)]
    serial: Option<String>,

    /// JSON Lines journal file.
    #[arg(long, global = true, env = ENV_JOURNAL)]
    journal: Option<PathBuf>,

    /// Locator catalog file.
    #[arg(long, global = true, env = ENV_CATALOG)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a profile and follow it unless already connected.
    Follow { username: String },

    /// Report the relationship with the profile currently on screen.
    Status {
        /// Read a screenshot when the hierarchy is inconclusive.
        #[arg(long)]
        vision: bool,
    },

    /// Send an AI-written direct message.
    Dm {
        username: String,
        /// What the message should be about.
        #[arg(long)]
        campaign: String,
        /// Skip reading the profile before writing.
        #[arg(long)]
        no_profile: bool,
    },

    /// Repost a user's stories that pass moderation.
    Restory {
        username: String,
        #[arg(long, default_value_t = 5)]
        max_stories: u32,
    },

    /// Extract a profile's header through OCR.
    Scrape { username: String },

    /// Print the built-in locator catalog as JSON.
    Catalog,

    /// Summarize the attempts recorded in the journal.
    Journal,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let result = run(Cli::parse()).await;
    if let Err(err) = &result {
        if let Some(report) = commands::error_report(err) {
            commands::print_json(&report)?;
        }
    }
    result
}

async fn run(cli: Cli) -> Result<()> {
    let config = commands::load_config(&cli)?;

    match cli.command {
        Command::Catalog => commands::print_catalog(),
        Command::Journal => commands::summarize_journal(&config).await,
        Command::Follow { username } => {
            let session = commands::Session::start(config).await?;
            let report = gram_pilot::workflow::follow_user(&session.engine, &username).await?;
            commands::print_json(&report)
        }
        Command::Status { vision } => {
            let session = commands::Session::start(config).await?;
            if vision {
                let analyzer = session.analyzer()?;
                let report =
                    gram_pilot::workflow::follow_status_from_image(&session.engine, analyzer.as_ref()).await?;
                commands::print_json(&report)
            } else {
                let state = session.engine.check_follow_status().await?;
                commands::print_json(&serde_json::json!({ "state": state }))
            }
        }
        Command::Dm {
            username,
            campaign,
            no_profile,
        } => {
            let session = commands::Session::start(config).await?;
            let analyzer = session.analyzer()?;
            let report = gram_pilot::workflow::send_personalized_dm(
                &session.engine,
                analyzer.as_ref(),
                &username,
                &campaign,
                !no_profile,
            )
            .await?;
            commands::print_json(&report)
        }
        Command::Restory { username, max_stories } => {
            let session = commands::Session::start(config).await?;
            let analyzer = session.analyzer()?;
            let report =
                gram_pilot::workflow::restory_from_user(&session.engine, analyzer.as_ref(), &username, max_stories)
                    .await?;
            commands::print_json(&report)
        }
        Command::Scrape { username } => {
            let session = commands::Session::start(config).await?;
            let analyzer = session.analyzer()?;
            let report = gram_pilot::workflow::scrape_profile(&session.engine, analyzer.as_ref(), &username).await?;
            commands::print_json(&report)
        }
    }
}
