// Copyright 2026 Optout Contributors
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code, unused_imports)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use optout::browser::chromium::ChromiumBrowser;
use optout::browser::{Browser, NoopBrowser};
use optout::captcha::{AntiCaptcha, CaptchaSolver};
use optout::config::store::FsConfigStore;
use optout::config::load_dir;
use optout::fallback::{CliReviewGate, PreApprovedGate, ReviewGate};
use optout::llm::{LlmClient, OpenAiClient};
use optout::mailbox::{require_gmail_address, GmailWatcher, MailboxWatcher};
use optout::mapper::MapperPolicy;
use optout::orchestrator::Orchestrator;
use optout::userdata::UserData;

#[derive(Parser)]
#[command(
    name = "optout",
    about = "Optout — automated deletion requests to data brokers",
    version,
    after_help = "Exit code is non-zero when at least one broker ends failed.\nSkipped brokers alone do not affect the exit code."
)]
struct Cli {
    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit deletion requests to every configured broker
    Run {
        /// Legal first name
        #[arg(long)]
        first_name: String,
        /// Legal last name
        #[arg(long)]
        last_name: String,
        /// Contact email address (also watched for confirmations)
        #[arg(long)]
        email: String,
        /// Date of birth (MM/DD/YYYY)
        #[arg(long)]
        date_of_birth: Option<String>,
        /// Street address
        #[arg(long)]
        address: Option<String>,
        /// City
        #[arg(long)]
        city: Option<String>,
        /// US state (full name or two-letter code)
        #[arg(long)]
        state: Option<String>,
        /// ZIP code
        #[arg(long)]
        zip: Option<String>,
        /// Process only this broker (case-insensitive name match)
        #[arg(long)]
        broker: Option<String>,
        /// Broker configuration directory (default ~/.optout/broker_configs)
        #[arg(long)]
        config_dir: Option<PathBuf>,
        /// Skip the interactive review prompt before AI-assisted submissions
        #[arg(long)]
        approve: bool,
        /// Do not wait for confirmation emails after submitting
        #[arg(long)]
        skip_confirmation_check: bool,
        /// Per-collaborator timeout in milliseconds
        #[arg(long, default_value = "30000")]
        timeout: u64,
        /// Maximum brokers processed concurrently
        #[arg(long, default_value = "3")]
        concurrency: usize,
        /// Confirmation-mail wait window in seconds
        #[arg(long, default_value = "120")]
        confirmation_window: u64,
    },
    /// List known broker configurations
    Brokers {
        /// Broker configuration directory (default ~/.optout/broker_configs)
        #[arg(long)]
        config_dir: Option<PathBuf>,
    },
}

fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".optout")
        .join("broker_configs")
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "optout=debug" } else { "optout=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Brokers { config_dir } => {
            let dir = config_dir.unwrap_or_else(default_config_dir);
            let configs = load_dir(&dir)
                .with_context(|| format!("cannot load broker configs from {}", dir.display()))?;
            if configs.is_empty() {
                println!("no broker configurations in {}", dir.display());
                return Ok(());
            }
            for config in &configs {
                let kind = if config.is_full() { "full" } else { "minimal" };
                println!("{:<24} {:<8} {}", config.name, kind, config.url);
            }
            Ok(())
        }
        Commands::Run {
            first_name,
            last_name,
            email,
            date_of_birth,
            address,
            city,
            state,
            zip,
            broker,
            config_dir,
            approve,
            skip_confirmation_check,
            timeout,
            concurrency,
            confirmation_window,
        } => {
            let user = UserData {
                first_name,
                last_name,
                email,
                date_of_birth,
                address,
                city,
                state,
                zip,
            };

            let dir = config_dir.unwrap_or_else(default_config_dir);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("cannot create config dir {}", dir.display()))?;
            let configs = load_dir(&dir)
                .with_context(|| format!("cannot load broker configs from {}", dir.display()))?;

            let browser: Box<dyn Browser> = match ChromiumBrowser::new().await {
                Ok(b) => Box::new(b),
                Err(e) => {
                    warn!("no usable Chromium, browser steps degraded: {e:#}");
                    Box::new(NoopBrowser)
                }
            };

            let llm = match OpenAiClient::from_env(timeout) {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!("AI fallback disabled: {e:#}");
                    None
                }
            };

            let captcha = match AntiCaptcha::from_env(timeout) {
                Ok(solver) => Some(solver),
                Err(e) => {
                    info!("captcha solving disabled: {e:#}");
                    None
                }
            };

            let review: Box<dyn ReviewGate> = if approve {
                Box::new(PreApprovedGate)
            } else {
                Box::new(CliReviewGate)
            };

            let mailbox = if skip_confirmation_check {
                None
            } else if let Err(e) = require_gmail_address(&user.email) {
                warn!("confirmation monitoring disabled: {e:#}");
                None
            } else {
                match GmailWatcher::from_env() {
                    Ok(watcher) => Some(watcher),
                    Err(e) => {
                        warn!("confirmation monitoring disabled: {e:#}");
                        None
                    }
                }
            };
            let window = mailbox
                .as_ref()
                .map(|_| Duration::from_secs(confirmation_window));

            let store = FsConfigStore::new(dir.clone());
            let orchestrator = Orchestrator {
                browser: browser.as_ref(),
                llm: llm.as_ref().map(|c| c as &dyn LlmClient),
                captcha: captcha.as_ref().map(|c| c as &dyn CaptchaSolver),
                review: review.as_ref(),
                store: &store,
                mailbox: mailbox.as_ref().map(|m| m as &dyn MailboxWatcher),
                http: reqwest::Client::new(),
                mapper_policy: MapperPolicy::default(),
                timeout_ms: timeout,
                concurrency,
                confirmation_window: window,
            };

            let report = orchestrator.run(&configs, &user, broker.as_deref()).await;
            browser.shutdown().await.ok();

            let report = report?;
            println!("{}", report.render());
            std::process::exit(report.exit_code());
        }
    }
}
