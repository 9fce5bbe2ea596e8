//! Reconciles a local and a network source behind one [`Subscription`].
//!
//! A read publishes the local result first. The network result follows only if
//! it succeeded or nothing successful has been published yet, so a stale local
//! success is never replaced by a network failure. A successful network
//! result is then written to the local store, and what the store returns is
//! the last value before the subscription finishes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::feed::{Article, Feed};
use crate::service::{ArticleService, FeedService, LocalFeedService};
use crate::subscription::{Publisher, Subscription};

/// Yields the network service to use for the next operation.
pub type NetworkProvider = Arc<dyn Fn() -> Arc<dyn FeedService> + Send + Sync>;
pub type ArticleNetworkProvider = Arc<dyn Fn() -> Arc<dyn ArticleService> + Send + Sync>;

type FeedsSubscription = Subscription<Result<Vec<Feed>>>;
type ArticlesSubscription = Subscription<Result<Vec<Article>>>;

/// Whether `new` may replace what was already published.
fn should_publish<T>(new: &Result<T>, existing: Option<&Result<T>>) -> bool {
    match existing {
        None => true,
        Some(existing) => new.is_ok() || existing.is_err(),
    }
}

fn publish_if_better<T: Clone + Send + 'static>(publisher: &Publisher<Result<T>>, result: Result<T>) {
    let existing = publisher.subscription().value();
    if should_publish(&result, existing.as_ref()) {
        publisher.update(result);
    } else {
        debug!("Keeping earlier result instead of a failure");
    }
}

/// Local read, then network read, then persistence of the network result.
/// Does not finish the publisher.
async fn reconcile<T, L, N, P, F>(publisher: &Publisher<Result<T>>, local_read: L, network_read: N, persist: P)
where
    T: Clone + Send + 'static,
    L: Future<Output = Result<T>>,
    N: Future<Output = Result<T>>,
    P: FnOnce(T) -> F,
    F: Future<Output = Result<T>>,
{
    publisher.update(local_read.await);

    let network_result = network_read.await;
    if let Err(e) = &network_result {
        warn!("Network read failed: {}", e);
    }
    publish_if_better(publisher, network_result.clone());

    if let Ok(fresh) = network_result {
        publish_if_better(publisher, persist(fresh).await);
    }
}

pub struct FeedCoordinator<L> {
    local: Arc<L>,
    network: NetworkProvider,
    feeds: Mutex<Option<FeedsSubscription>>,
    articles: Arc<Mutex<HashMap<String, ArticlesSubscription>>>,
}

impl<L> FeedCoordinator<L>
where
    L: FeedService + LocalFeedService + 'static,
{
    pub fn new(local: Arc<L>, network: NetworkProvider) -> Self {
        Self {
            local,
            network,
            feeds: Mutex::new(None),
            articles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Always hand out the same network service.
    pub fn with_network(local: Arc<L>, network: Arc<dyn FeedService>) -> Self {
        Self::new(local, Arc::new(move || Arc::clone(&network)))
    }

    pub fn local(&self) -> &Arc<L> {
        &self.local
    }

    /// All feeds. Callers arriving while a refresh is running share its
    /// subscription. Must be called from within a tokio runtime.
    pub fn feeds(&self) -> FeedsSubscription {
        let mut current = self.feeds.lock();
        if let Some(subscription) = current.as_ref() {
            if !subscription.is_finished() {
                return subscription.clone();
            }
        }

        let publisher = Publisher::new();
        let subscription = publisher.subscription();
        *current = Some(subscription.clone());
        drop(current);

        let local = Arc::clone(&self.local);
        let network = (self.network)();
        tokio::spawn(async move {
            reconcile(&publisher, local.feeds(), network.feeds(), |feeds| {
                local.update_feeds(feeds)
            })
            .await;
            publisher.finish();
        });

        subscription
    }

    /// A feed's articles, with one shared subscription per feed while running.
    pub fn articles(&self, feed: &Feed) -> ArticlesSubscription {
        let mut running = self.articles.lock();
        if let Some(subscription) = running.get(&feed.id) {
            if !subscription.is_finished() {
                return subscription.clone();
            }
        }

        let publisher = Publisher::new();
        let subscription = publisher.subscription();
        running.insert(feed.id.clone(), subscription.clone());
        drop(running);

        let local = Arc::clone(&self.local);
        let network = (self.network)();
        let running = Arc::clone(&self.articles);
        let feed = feed.clone();
        tokio::spawn(async move {
            reconcile(&publisher, local.articles(&feed), network.articles(&feed), |articles| {
                local.update_articles(&feed, articles)
            })
            .await;
            publisher.finish();

            let mut running = running.lock();
            if running
                .get(&feed.id)
                .map_or(false, |s| s.ptr_eq(&publisher.subscription()))
            {
                running.remove(&feed.id);
            }
        });

        subscription
    }

    /// Subscribe on both sides at once. The network's view of the feed wins
    /// and is written back locally.
    pub async fn subscribe(&self, url: &Url) -> Result<Feed> {
        let network = (self.network)();
        let (local_result, network_result) = futures::join!(self.local.subscribe(url), network.subscribe(url));

        match (local_result, network_result) {
            (Ok(local), Ok(remote)) if local == remote => Ok(remote),
            (_, Ok(remote)) => match self.local.update_feed(remote.clone()).await {
                Ok(stored) => Ok(stored),
                Err(e) => {
                    warn!("Could not store subscription to {}: {}", url, e);
                    Ok(remote)
                }
            },
            (Ok(local), Err(e)) => {
                warn!("Network subscribe to {} failed: {}", url, e);
                Ok(local)
            }
            (Err(local), Err(network)) => Err(Error::multiple(local, network)),
        }
    }

    /// Remove the feed on both sides; fails if either side fails.
    pub async fn unsubscribe(&self, feed: &Feed) -> Result<()> {
        let network = (self.network)();
        let (local_result, network_result) = futures::join!(self.local.remove(feed), network.remove(feed));

        match (local_result, network_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(local), Err(network)) => Err(Error::multiple(local, network)),
        }
    }

    /// Mark every article of the feed read; succeeds if either side does.
    pub async fn read_all(&self, feed: &Feed) -> Result<()> {
        let network = (self.network)();
        let (local_result, network_result) = futures::join!(self.local.read_all(feed), network.read_all(feed));

        match (local_result, network_result) {
            (Err(local), Err(network)) => Err(Error::multiple(local, network)),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => {
                debug!("Mark all read partially failed: {}", e);
                Ok(())
            }
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}

pub struct ArticleCoordinator<L> {
    local: Arc<L>,
    network: ArticleNetworkProvider,
    marks: Arc<Mutex<HashMap<(String, bool), Subscription<Result<Article>>>>>,
}

impl<L> ArticleCoordinator<L>
where
    L: ArticleService + 'static,
{
    pub fn new(local: Arc<L>, network: ArticleNetworkProvider) -> Self {
        Self {
            local,
            network,
            marks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_network(local: Arc<L>, network: Arc<dyn ArticleService>) -> Self {
        Self::new(local, Arc::new(move || Arc::clone(&network)))
    }

    /// Mark an article read or unread on both sides.
    ///
    /// Publishes the local result, then the network result if either side
    /// failed, then finishes.
    pub fn mark(&self, article: &Article, read: bool) -> Subscription<Result<Article>> {
        let key = (article.id.clone(), read);
        let mut running = self.marks.lock();
        if let Some(subscription) = running.get(&key) {
            if !subscription.is_finished() {
                return subscription.clone();
            }
        }

        let publisher = Publisher::new();
        let subscription = publisher.subscription();
        running.insert(key.clone(), subscription.clone());
        drop(running);

        let local = Arc::clone(&self.local);
        let network = (self.network)();
        let running = Arc::clone(&self.marks);
        let article = article.clone();
        tokio::spawn(async move {
            let remote_article = article.clone();
            let remote = tokio::spawn(async move { network.mark(&remote_article, read).await });

            let local_result = local.mark(&article, read).await;
            let local_failed = local_result.is_err();
            publisher.update(local_result);

            let network_result = remote
                .await
                .unwrap_or_else(|e| Err(Error::Unknown(format!("network task failed: {}", e))));
            if local_failed || network_result.is_err() {
                publisher.update(network_result);
            }
            publisher.finish();

            let mut running = running.lock();
            if running
                .get(&key)
                .map_or(false, |s| s.ptr_eq(&publisher.subscription()))
            {
                running.remove(&key);
            }
        });

        subscription
    }

    pub async fn remove(&self, article: &Article) -> Result<()> {
        self.local.remove(article).await
    }

    pub fn authors(&self, article: &Article) -> String {
        self.local.authors(article)
    }

    pub fn date(&self, article: &Article) -> DateTime<Utc> {
        self.local.date(article)
    }

    pub fn estimated_reading_time(&self, article: &Article) -> Duration {
        self.local.estimated_reading_time(article)
    }
}
