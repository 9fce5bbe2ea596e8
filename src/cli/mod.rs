pub mod commands;

use clap::{Parser, Subcommand};
use crate::config::Config;
use crate::error::Result;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tethys-sync")]
#[command(about = "Keep a local feed store in sync with a feed reader service")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default configuration file
    Init {
        /// Sync server base URL
        #[arg(long, env = "TETHYS_SYNC_BASE_URL")]
        base_url: Option<String>,
    },

    /// Refresh and list subscribed feeds
    Feeds,

    /// Refresh and list a feed's articles
    Articles {
        /// Feed identifier
        feed_id: String,

        /// Only show unread articles
        #[arg(long)]
        unread: bool,
    },

    /// Subscribe to a feed URL
    Subscribe {
        /// Feed URL
        url: String,
    },

    /// Unsubscribe from a feed
    Unsubscribe {
        /// Feed identifier
        feed_id: String,
    },

    /// Mark every article of a feed as read
    ReadAll {
        /// Feed identifier
        feed_id: String,
    },

    /// Mark an article read or unread
    Mark {
        /// Article identifier
        article_id: String,

        /// Mark as unread instead
        #[arg(long)]
        unread: bool,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config_file = commands::config_file(self.config)?;
        let config = Config::load_with_env(&config_file)?;
        let _guard = commands::init_logging(&config.logging, self.verbose, self.debug)?;

        match self.command {
            Commands::Init { base_url } => {
                commands::init(&config_file, base_url).await
            }
            Commands::Feeds => {
                commands::feeds(config).await
            }
            Commands::Articles { feed_id, unread } => {
                commands::articles(config, feed_id, unread).await
            }
            Commands::Subscribe { url } => {
                commands::subscribe(config, url).await
            }
            Commands::Unsubscribe { feed_id } => {
                commands::unsubscribe(config, feed_id).await
            }
            Commands::ReadAll { feed_id } => {
                commands::read_all(config, feed_id).await
            }
            Commands::Mark { article_id, unread } => {
                commands::mark(config, article_id, !unread).await
            }
        }
    }
}
