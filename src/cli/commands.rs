use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use url::Url;

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use crate::feed::{Article, Feed};
use crate::service::local::ARTICLE_KIND;
use crate::service::{ArticleCoordinator, FeedCoordinator, FeedService, StoreService, SyncService};
use crate::storage::{ArticleRepository, FeedRepository, MemoryRecordStore, RecordStore};

/// Everything a command needs: the local store, both services and where to
/// persist the store afterwards.
struct Session {
    store: Arc<MemoryRecordStore>,
    local: Arc<StoreService>,
    network: Arc<SyncService>,
    snapshot: PathBuf,
}

impl Session {
    fn open(config: &Config) -> Result<Self> {
        let snapshot = config.snapshot_path()?;
        let store = if snapshot.exists() {
            MemoryRecordStore::load_snapshot(&snapshot)?
        } else {
            debug!("No snapshot at {}, starting empty", snapshot.display());
            MemoryRecordStore::new()
        };
        let store = Arc::new(store);
        let records: Arc<dyn RecordStore> = store.clone();
        let local = StoreService::new(records).with_batch_size(config.storage.batch_size);

        Ok(Self {
            store,
            local: Arc::new(local),
            network: Arc::new(SyncService::from_config(&config.service)?),
            snapshot,
        })
    }

    fn feed_coordinator(&self) -> FeedCoordinator<StoreService> {
        let network = Arc::new(FeedRepository::from_arc(Arc::clone(&self.network)));
        FeedCoordinator::with_network(Arc::clone(&self.local), network)
    }

    fn article_coordinator(&self) -> ArticleCoordinator<StoreService> {
        let network = Arc::new(ArticleRepository::from_arc(Arc::clone(&self.network)));
        ArticleCoordinator::with_network(Arc::clone(&self.local), network)
    }

    async fn find_feed(&self, feed_id: &str) -> Result<Feed> {
        self.local
            .feeds()
            .await?
            .into_iter()
            .find(|feed| feed.id == feed_id)
            .ok_or_else(|| Error::NotFound(format!("feed {}", feed_id)))
    }

    fn find_article(&self, article_id: &str) -> Result<Article> {
        self.store
            .get(ARTICLE_KIND, article_id)?
            .ok_or_else(|| Error::NotFound(format!("article {}", article_id)))?
            .decode()
    }

    fn save(&self) -> Result<()> {
        self.store.save_snapshot(&self.snapshot)
    }
}

/// Write a default configuration file unless one exists.
pub async fn init(config_file: &Path, base_url: Option<String>) -> Result<()> {
    info!("Initializing tethys-sync configuration");

    if config_file.exists() {
        warn!("Configuration file already exists: {}", config_file.display());
        println!("Configuration already exists at {}", config_file.display());
        return Ok(());
    }

    let mut config = Config::default();
    config.service.base_url = base_url;
    config.validate()?;
    config.save(config_file)?;
    info!("Created default configuration: {}", config_file.display());

    println!("✅ tethys-sync initialized");
    println!("   Config file: {}", config_file.display());
    if config.service.base_url.is_none() {
        println!();
        println!("Set service.base_url (or TETHYS_SYNC_BASE_URL) before syncing.");
    }
    Ok(())
}

pub async fn feeds(config: Config) -> Result<()> {
    let session = Session::open(&config)?;
    let coordinator = session.feed_coordinator();

    let mut updates = coordinator.feeds().updates();
    let mut latest = None;
    while let Some(result) = updates.next().await {
        match &result {
            Ok(feeds) => debug!("Received {} feeds", feeds.len()),
            Err(e) => warn!("Feed refresh step failed: {}", e),
        }
        latest = Some(result);
    }
    session.save()?;

    let feeds = latest.unwrap_or_else(|| Ok(Vec::new()))?;
    if feeds.is_empty() {
        println!("No feeds. Subscribe with: tethys-sync subscribe <url>");
    }
    for feed in &feeds {
        println!("{}", format_feed(feed));
    }
    Ok(())
}

pub async fn articles(config: Config, feed_id: String, unread_only: bool) -> Result<()> {
    let session = Session::open(&config)?;
    let feed = session.find_feed(&feed_id).await?;
    let coordinator = session.feed_coordinator();

    let result = coordinator
        .articles(&feed)
        .last()
        .await
        .unwrap_or_else(|| Ok(Vec::new()));
    session.save()?;

    for article in result?.iter().filter(|a| !unread_only || !a.read) {
        println!("{}", format_article(article));
    }
    Ok(())
}

pub async fn subscribe(config: Config, url: String) -> Result<()> {
    let url = Url::parse(&url)?;
    let session = Session::open(&config)?;

    let feed = session.feed_coordinator().subscribe(&url).await?;
    session.save()?;

    println!("✅ Subscribed: {}", format_feed(&feed));
    Ok(())
}

pub async fn unsubscribe(config: Config, feed_id: String) -> Result<()> {
    let session = Session::open(&config)?;
    let feed = session.find_feed(&feed_id).await?;

    let result = session.feed_coordinator().unsubscribe(&feed).await;
    session.save()?;
    result?;

    println!("✅ Unsubscribed from {}", feed.display_title());
    Ok(())
}

pub async fn read_all(config: Config, feed_id: String) -> Result<()> {
    let session = Session::open(&config)?;
    let feed = session.find_feed(&feed_id).await?;

    session.feed_coordinator().read_all(&feed).await?;
    session.save()?;

    println!("✅ Marked all articles of {} as read", feed.display_title());
    Ok(())
}

pub async fn mark(config: Config, article_id: String, read: bool) -> Result<()> {
    let session = Session::open(&config)?;
    let article = session.find_article(&article_id)?;

    let mut updates = session.article_coordinator().mark(&article, read).updates();
    let mut outcome = Ok(article.clone());
    while let Some(result) = updates.next().await {
        if let Err(e) = &result {
            warn!("Marking {} failed: {}", article_id, e);
        }
        outcome = result;
    }
    session.save()?;

    let article = outcome?;
    println!("{}", format_article(&article));
    Ok(())
}

fn format_feed(feed: &Feed) -> String {
    format!("{:>5}  {}  [{}]", feed.unread_count, feed.display_title(), feed.id)
}

fn format_article(article: &Article) -> String {
    let marker = if article.read { " " } else { "*" };
    format!(
        "{} {}  {}  ({} min)  [{}]",
        marker,
        article.date().format("%Y-%m-%d"),
        article.title,
        article.estimated_reading_time().as_secs().div_ceil(60),
        article.id
    )
}

/// Initialize logging from the configuration and verbosity flags.
///
/// The returned guard must be kept alive while logging to a file.
pub fn init_logging(config: &LoggingConfig, verbose: bool, debug: bool) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        config.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, guard) = if config.log_to_file {
        let dir = Config::data_dir()?.join("logs");
        let appender = tracing_appender::rolling::never(dir, &config.log_file);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        (BoxMakeWriter::new(non_blocking), Some(guard))
    } else {
        (BoxMakeWriter::new(std::io::stderr), None)
    };

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(debug)
        .with_line_number(debug)
        .with_writer(writer);
    let initialized = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    initialized.map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))?;

    debug!("Logging initialized");
    Ok(guard)
}

/// The configuration file to use.
pub fn config_file(config_path: Option<PathBuf>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(path),
        None => Ok(Config::config_dir()?.join("config.toml")),
    }
}
