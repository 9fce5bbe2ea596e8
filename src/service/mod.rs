//! Capability traits for feed and article data sources, and their
//! implementations: a local one over a [`RecordStore`](crate::storage::RecordStore),
//! a network one over an [`HttpClient`](crate::http::HttpClient), and the
//! coordinators that reconcile the two.

pub mod coordinator;
pub mod local;
pub mod sync;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use crate::error::{Error, Result};
use crate::feed::{Article, Feed};

pub use coordinator::{ArticleCoordinator, FeedCoordinator};
pub use local::StoreService;
pub use sync::SyncService;

/// Operations every feed source supports.
#[async_trait]
pub trait FeedService: Send + Sync {
    async fn feeds(&self) -> Result<Vec<Feed>>;

    async fn articles(&self, feed: &Feed) -> Result<Vec<Article>>;

    async fn subscribe(&self, url: &Url) -> Result<Feed>;

    async fn tags(&self) -> Result<Vec<String>> {
        Err(Error::NotSupported)
    }

    async fn set_tags(&self, _tags: &[String], _feed: &Feed) -> Result<Feed> {
        Err(Error::NotSupported)
    }

    async fn set_url(&self, _url: &Url, _feed: &Feed) -> Result<Feed> {
        Err(Error::NotSupported)
    }

    async fn read_all(&self, feed: &Feed) -> Result<()>;

    async fn remove(&self, feed: &Feed) -> Result<()>;
}

/// Store-specific operations used to persist what a network source returned.
///
/// Separate from [`FeedService`]; a local source implements both.
#[async_trait]
pub trait LocalFeedService: Send + Sync {
    /// Merge `feeds` into local storage and return every stored feed.
    async fn update_feeds(&self, feeds: Vec<Feed>) -> Result<Vec<Feed>>;

    /// Store `feed`, taking over the identity of any local feed with the same URL.
    async fn update_feed(&self, feed: Feed) -> Result<Feed>;

    /// Store `articles` for `feed` and return the feed's stored articles.
    async fn update_articles(&self, feed: &Feed, articles: Vec<Article>) -> Result<Vec<Article>>;
}

#[async_trait]
pub trait ArticleService: Send + Sync {
    async fn mark(&self, article: &Article, read: bool) -> Result<Article>;

    async fn remove(&self, article: &Article) -> Result<()>;

    fn authors(&self, article: &Article) -> String {
        article.authors_line()
    }

    fn date(&self, article: &Article) -> DateTime<Utc> {
        article.date()
    }

    fn estimated_reading_time(&self, article: &Article) -> Duration {
        article.estimated_reading_time()
    }
}
