use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Semaphore;
use url::Url;

use tethys_sync::error::{DatabaseError, Error, Result};
use tethys_sync::feed::{Article, Feed};
use tethys_sync::service::{
    ArticleCoordinator, ArticleService, FeedCoordinator, FeedService, LocalFeedService, StoreService,
};
use tethys_sync::storage::MemoryRecordStore;

use test_data::*;

/// Network double with canned results. Calls wait for a permit when gated.
struct FakeNetwork {
    feeds: Result<Vec<Feed>>,
    articles: Result<Vec<Article>>,
    subscribe: Result<Feed>,
    remove: Result<()>,
    read_all: Result<()>,
    mark: Result<()>,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
}

impl FakeNetwork {
    fn ok() -> Self {
        Self {
            feeds: Ok(Vec::new()),
            articles: Ok(Vec::new()),
            subscribe: Err(Error::NotSupported),
            remove: Ok(()),
            read_all: Ok(()),
            mark: Ok(()),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    async fn wait(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
    }
}

#[async_trait]
impl FeedService for FakeNetwork {
    async fn feeds(&self) -> Result<Vec<Feed>> {
        self.wait().await;
        self.feeds.clone()
    }

    async fn articles(&self, feed: &Feed) -> Result<Vec<Article>> {
        self.wait().await;
        let articles = self.articles.clone()?;
        Ok(articles.into_iter().filter(|a| a.feed_id == feed.id).collect())
    }

    async fn subscribe(&self, _url: &Url) -> Result<Feed> {
        self.wait().await;
        self.subscribe.clone()
    }

    async fn read_all(&self, _feed: &Feed) -> Result<()> {
        self.wait().await;
        self.read_all.clone()
    }

    async fn remove(&self, _feed: &Feed) -> Result<()> {
        self.wait().await;
        self.remove.clone()
    }
}

#[async_trait]
impl ArticleService for FakeNetwork {
    async fn mark(&self, article: &Article, read: bool) -> Result<Article> {
        self.wait().await;
        self.mark.clone()?;
        let mut marked = article.clone();
        marked.read = read;
        Ok(marked)
    }

    async fn remove(&self, _article: &Article) -> Result<()> {
        Err(Error::NotSupported)
    }
}

/// Local double whose reads fail and whose writes tag what they persist.
struct BrokenLocal;

fn disk_error() -> Error {
    Error::Unknown("disk unavailable".to_string())
}

#[async_trait]
impl FeedService for BrokenLocal {
    async fn feeds(&self) -> Result<Vec<Feed>> {
        Err(disk_error())
    }

    async fn articles(&self, _feed: &Feed) -> Result<Vec<Article>> {
        Err(disk_error())
    }

    async fn subscribe(&self, _url: &Url) -> Result<Feed> {
        Err(disk_error())
    }

    async fn read_all(&self, _feed: &Feed) -> Result<()> {
        Err(disk_error())
    }

    async fn remove(&self, _feed: &Feed) -> Result<()> {
        Err(disk_error())
    }
}

#[async_trait]
impl LocalFeedService for BrokenLocal {
    async fn update_feeds(&self, feeds: Vec<Feed>) -> Result<Vec<Feed>> {
        Ok(feeds
            .into_iter()
            .map(|mut feed| {
                feed.unread_count = 7;
                feed
            })
            .collect())
    }

    async fn update_feed(&self, feed: Feed) -> Result<Feed> {
        Ok(feed)
    }

    async fn update_articles(&self, _feed: &Feed, articles: Vec<Article>) -> Result<Vec<Article>> {
        Ok(articles)
    }
}

fn store_service() -> Arc<StoreService> {
    Arc::new(StoreService::new(Arc::new(MemoryRecordStore::new())))
}

#[tokio::test]
async fn test_local_feeds_survive_network_failure() {
    let local = store_service();
    local.update_feed(feed("f1")).await.unwrap();

    let network = FakeNetwork {
        feeds: Err(Error::Http(503)),
        ..FakeNetwork::ok()
    };
    let coordinator = FeedCoordinator::with_network(local, Arc::new(network));

    let subscription = coordinator.feeds();
    let values: Vec<_> = subscription.updates().collect().await;

    assert_eq!(values.len(), 1);
    assert_eq!(values[0].as_ref().unwrap()[0].id, "f1");
    assert!(subscription.is_finished());
    assert!(subscription.value().unwrap().is_ok());
}

#[tokio::test]
async fn test_network_feeds_replace_local_failure_and_are_persisted() {
    let (network, gate) = FakeNetwork {
        feeds: Ok(vec![feed("n1")]),
        ..FakeNetwork::ok()
    }
    .gated();
    let coordinator = FeedCoordinator::with_network(Arc::new(BrokenLocal), Arc::new(network));

    let subscription = coordinator.feeds();
    let updates = subscription.updates();
    gate.add_permits(1);
    let values: Vec<_> = updates.collect().await;

    let mut persisted = feed("n1");
    persisted.unread_count = 7;
    assert_eq!(
        values,
        vec![Err(disk_error()), Ok(vec![feed("n1")]), Ok(vec![persisted])]
    );
    assert!(subscription.is_finished());
}

#[tokio::test]
async fn test_network_feeds_are_written_to_the_store() {
    let local = store_service();
    let network = FakeNetwork {
        feeds: Ok(vec![feed("n1"), feed("n2")]),
        ..FakeNetwork::ok()
    };
    let coordinator = FeedCoordinator::with_network(Arc::clone(&local), Arc::new(network));

    let last = coordinator.feeds().last().await.unwrap().unwrap();
    assert_eq!(last.len(), 2);

    let stored = local.feeds().await.unwrap();
    let ids: Vec<_> = stored.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, vec!["n1", "n2"]);
}

#[tokio::test]
async fn test_feeds_subscription_is_shared_while_running() {
    let (network, gate) = FakeNetwork::ok().gated();
    let network = Arc::new(network);
    let coordinator = FeedCoordinator::with_network(store_service(), network.clone());

    let first = coordinator.feeds();
    let second = coordinator.feeds();
    assert!(first.ptr_eq(&second));

    gate.add_permits(1);
    first.last().await;
    assert!(second.is_finished());

    let third = coordinator.feeds();
    assert!(!third.ptr_eq(&first));
}

#[tokio::test]
async fn test_articles_subscription_is_shared_per_feed() {
    let local = store_service();
    let (network, gate) = FakeNetwork {
        articles: Ok(vec![
            article("a1", "f1", 0),
            article("a2", "f1", 5),
            article("b1", "f2", 3),
        ]),
        ..FakeNetwork::ok()
    }
    .gated();
    let coordinator = FeedCoordinator::with_network(Arc::clone(&local), Arc::new(network));

    let f1 = feed("f1");
    let f2 = feed("f2");
    let first = coordinator.articles(&f1);
    let again = coordinator.articles(&f1);
    let other = coordinator.articles(&f2);
    assert!(first.ptr_eq(&again));
    assert!(!first.ptr_eq(&other));

    gate.add_permits(1);
    let articles = first.last().await.unwrap().unwrap();
    let ids: Vec<_> = articles.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["a2", "a1"]);

    let other_articles = other.last().await.unwrap().unwrap();
    let ids: Vec<_> = other_articles.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["b1"]);

    // neither feed was stored locally, so their articles only came from the network
    local.update_feed(f1.clone()).await.unwrap();
    local.update_feed(f2.clone()).await.unwrap();
    assert_eq!(local.articles(&f1).await.unwrap().len(), 2);
    assert_eq!(local.articles(&f2).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_articles_are_requested_again_after_finishing() {
    let (network, gate) = FakeNetwork::ok().gated();
    let network = Arc::new(network);
    let coordinator = FeedCoordinator::with_network(store_service(), network.clone());
    gate.add_permits(1);

    let f1 = feed("f1");
    let first = coordinator.articles(&f1);
    first.last().await;
    assert!(first.is_finished());

    let second = coordinator.articles(&f1);
    assert!(!second.ptr_eq(&first));
    second.last().await;
    assert_eq!(network.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_subscribe_takes_network_identity() {
    let local = store_service();
    let url = Url::parse("https://rust.example.com/feed.xml").unwrap();
    let mut remote = Feed::new(url.clone());
    remote.id = "feed/https://rust.example.com/feed.xml".to_string();
    remote.title = "Rust Weekly".to_string();

    let network = FakeNetwork {
        subscribe: Ok(remote.clone()),
        ..FakeNetwork::ok()
    };
    let coordinator = FeedCoordinator::with_network(Arc::clone(&local), Arc::new(network));

    let subscribed = coordinator.subscribe(&url).await.unwrap();
    assert_eq!(subscribed.id, remote.id);

    let stored = local.feeds().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].title, "Rust Weekly");
}

#[tokio::test]
async fn test_subscribe_falls_back_to_local_feed() {
    let local = store_service();
    let url = Url::parse("https://rust.example.com/feed.xml").unwrap();
    let network = FakeNetwork {
        subscribe: Err(Error::Http(502)),
        ..FakeNetwork::ok()
    };
    let coordinator = FeedCoordinator::with_network(local, Arc::new(network));

    let subscribed = coordinator.subscribe(&url).await.unwrap();
    assert_eq!(subscribed.id, url.to_string());
}

#[tokio::test]
async fn test_subscribe_reports_both_failures() {
    let network = FakeNetwork {
        subscribe: Err(Error::Http(502)),
        ..FakeNetwork::ok()
    };
    let coordinator = FeedCoordinator::with_network(Arc::new(BrokenLocal), Arc::new(network));

    let url = Url::parse("https://rust.example.com/feed.xml").unwrap();
    let result = coordinator.subscribe(&url).await;
    assert_eq!(result, Err(Error::Multiple(vec![disk_error(), Error::Http(502)])));
}

#[tokio::test]
async fn test_unsubscribe_requires_both_sides() {
    let local = store_service();
    local.update_feed(feed("f1")).await.unwrap();

    let failing = FakeNetwork {
        remove: Err(Error::Http(500)),
        ..FakeNetwork::ok()
    };
    let coordinator = FeedCoordinator::with_network(Arc::clone(&local), Arc::new(failing));
    assert_eq!(coordinator.unsubscribe(&feed("f1")).await, Err(Error::Http(500)));

    local.update_feed(feed("f2")).await.unwrap();
    let coordinator = FeedCoordinator::with_network(Arc::clone(&local), Arc::new(FakeNetwork::ok()));
    coordinator.unsubscribe(&feed("f2")).await.unwrap();
    assert!(local.feeds().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_read_all_needs_one_side() {
    let local = store_service();
    local.update_feed(feed("f1")).await.unwrap();
    local
        .update_articles(&feed("f1"), vec![article("a1", "f1", 0), article("a2", "f1", 1)])
        .await
        .unwrap();

    let failing = FakeNetwork {
        read_all: Err(Error::Http(500)),
        ..FakeNetwork::ok()
    };
    let coordinator = FeedCoordinator::with_network(Arc::clone(&local), Arc::new(failing));
    coordinator.read_all(&feed("f1")).await.unwrap();
    assert_eq!(local.feeds().await.unwrap()[0].unread_count, 0);

    // unknown locally and rejected remotely
    let result = coordinator.read_all(&feed("missing")).await;
    assert_eq!(
        result,
        Err(Error::Multiple(vec![
            Error::Database(DatabaseError::EntryNotFound),
            Error::Http(500)
        ]))
    );
}

#[tokio::test]
async fn test_mark_publishes_local_result_only_on_success() {
    let local = store_service();
    local
        .update_articles(&feed("f1"), vec![article("a1", "f1", 0)])
        .await
        .unwrap();
    let network = Arc::new(FakeNetwork::ok());
    let coordinator = ArticleCoordinator::with_network(local, network.clone());

    let subscription = coordinator.mark(&article("a1", "f1", 0), true);
    let values: Vec<_> = subscription.updates().collect().await;

    assert_eq!(values.len(), 1);
    assert!(values[0].as_ref().unwrap().read);
    assert_eq!(network.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mark_publishes_network_failure() {
    let local = store_service();
    local
        .update_articles(&feed("f1"), vec![article("a1", "f1", 0)])
        .await
        .unwrap();
    let (network, gate) = FakeNetwork {
        mark: Err(Error::Http(401)),
        ..FakeNetwork::ok()
    }
    .gated();
    let coordinator = ArticleCoordinator::with_network(local, Arc::new(network));

    let subscription = coordinator.mark(&article("a1", "f1", 0), true);
    let updates = subscription.updates();
    gate.add_permits(1);
    let values: Vec<_> = updates.collect().await;

    assert_eq!(values.len(), 2);
    assert!(values[0].as_ref().unwrap().read);
    assert_eq!(values[1], Err(Error::Http(401)));
}

#[tokio::test]
async fn test_mark_falls_back_to_network_when_local_fails() {
    let (network, gate) = FakeNetwork::ok().gated();
    let coordinator = ArticleCoordinator::with_network(store_service(), Arc::new(network));

    let unknown = article("a9", "f1", 0);
    let subscription = coordinator.mark(&unknown, true);
    let same = coordinator.mark(&unknown, true);
    let opposite = coordinator.mark(&unknown, false);
    assert!(subscription.ptr_eq(&same));
    assert!(!subscription.ptr_eq(&opposite));

    let updates = subscription.updates();
    gate.add_permits(2);
    let values: Vec<_> = updates.collect().await;

    assert_eq!(values[0], Err(Error::Database(DatabaseError::EntryNotFound)));
    assert!(values[1].as_ref().unwrap().read);
    assert_eq!(values.len(), 2);
}

#[tokio::test]
async fn test_mark_is_sent_again_after_finishing() {
    let local = store_service();
    local
        .update_articles(&feed("f1"), vec![article("a1", "f1", 0)])
        .await
        .unwrap();
    let (network, gate) = FakeNetwork::ok().gated();
    let network = Arc::new(network);
    let coordinator = ArticleCoordinator::with_network(local, network.clone());
    gate.add_permits(1);

    let item = article("a1", "f1", 0);
    let first = coordinator.mark(&item, true);
    first.last().await;
    assert!(first.is_finished());

    let second = coordinator.mark(&item, true);
    assert!(!second.ptr_eq(&first));
    let marked = second.last().await.unwrap().unwrap();
    assert!(marked.read);
    assert_eq!(network.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_article_helpers_use_local_service() {
    let coordinator = ArticleCoordinator::with_network(store_service(), Arc::new(FakeNetwork::ok()));
    let mut item = article("a1", "f1", 0);
    item.content = "word ".repeat(400);

    assert_eq!(coordinator.authors(&item), "Jane Doe");
    assert_eq!(coordinator.date(&item), item.published);
    assert_eq!(coordinator.estimated_reading_time(&item).as_secs(), 120);
    assert_eq!(
        coordinator.remove(&item).await,
        Err(Error::Database(DatabaseError::EntryNotFound))
    );
}
