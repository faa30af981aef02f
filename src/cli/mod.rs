pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Debug-level logging for this crate
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C
    Run {
        /// Configuration profile to use instead of the default
        #[arg(short, long)]
        profile: Option<String>,

        /// YAML list of job submissions to load before starting
        #[arg(short, long)]
        jobs: Option<PathBuf>,
    },

    /// Fetch one URL and print the execution result
    Fetch {
        /// Target URL
        #[arg(required = true)]
        url: String,

        /// Named CSS selector, as name=selector
        #[arg(short, long = "selector", value_parser = parse_pair)]
        selectors: Vec<(String, String)>,

        /// Extra request header, as name=value
        #[arg(short = 'H', long = "header", value_parser = parse_pair)]
        headers: Vec<(String, String)>,

        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Health-check the configured proxies and show pool stats
    Proxies {
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Inspect and manage cached session cookies
    Cookies {
        #[command(subcommand)]
        action: CookieAction,

        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

#[derive(Subcommand)]
enum CookieAction {
    /// Domains with cached cookies
    List,
    /// Drop a domain's cookies
    Delete { domain: String },
    /// Log in again with the domain's configured strategy
    Refresh { domain: String },
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected name=value, got '{}'", raw)),
    }
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run { profile, jobs } => {
            info!("Starting dispatcher");
            commands::run(profile, jobs).await
        }
        Commands::Fetch { url, selectors, headers, profile } => {
            info!("Fetching {}", url);
            commands::fetch(url, selectors, headers, profile).await
        }
        Commands::Proxies { profile } => commands::proxies(profile).await,
        Commands::Cookies { action, profile } => match action {
            CookieAction::List => commands::list_cookies(profile).await,
            CookieAction::Delete { domain } => commands::delete_cookies(domain, profile).await,
            CookieAction::Refresh { domain } => commands::refresh_cookies(domain, profile).await,
        },
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles()
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name)
            } else {
                info!("Showing current configuration");
                commands::show_config()
            }
        }
    }
}
