use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use crate::collections::DataStoreBackedArray;
use crate::error::{DatabaseError, Error, Result};
use crate::feed::{Article, Feed};
use crate::service::{ArticleService, FeedService, LocalFeedService};
use crate::storage::{Predicate, Record, RecordStore, SortKey};

pub const FEED_KIND: &str = "feed";
pub const ARTICLE_KIND: &str = "article";

/// Local feed and article source over a [`RecordStore`].
///
/// Store calls are synchronous, so every operation runs on tokio's blocking
/// pool.
#[derive(Clone)]
pub struct StoreService {
    store: Arc<dyn RecordStore>,
    batch_size: usize,
}

impl StoreService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            batch_size: crate::collections::DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// A feed's articles, newest first, loaded lazily from the store.
    pub fn article_list(&self, feed: &Feed) -> DataStoreBackedArray<Article> {
        article_list(&self.store, &feed.id).with_batch_size(self.batch_size)
    }

    pub fn unread_article_list(&self, feed: &Feed) -> Result<DataStoreBackedArray<Article>> {
        self.article_list(feed)
            .filter_with_predicate(Predicate::eq("read", false))
    }

    async fn run<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn RecordStore>) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || work(store))
            .await
            .map_err(|e| Error::Unknown(format!("store task failed: {}", e)))?
    }
}

fn article_list(store: &Arc<dyn RecordStore>, feed_id: &str) -> DataStoreBackedArray<Article> {
    DataStoreBackedArray::from_store(
        Arc::clone(store),
        ARTICLE_KIND,
        Predicate::eq("feed_id", feed_id),
        vec![SortKey::descending("published")],
        |record: &Record| record.decode(),
    )
}

fn feed_record(feed: &Feed) -> Result<Record> {
    Record::from_entity(FEED_KIND, feed.id.as_str(), feed)
}

fn article_record(article: &Article) -> Result<Record> {
    Record::from_entity(ARTICLE_KIND, article.id.as_str(), article)
}

/// Decode a stored feed, filling in its unread count.
fn load_feed(store: &dyn RecordStore, record: &Record) -> Result<Feed> {
    let mut feed: Feed = record.decode()?;
    let unread = Predicate::eq("feed_id", feed.id.as_str()).and(Predicate::eq("read", false));
    feed.unread_count = unread_count(store.count(ARTICLE_KIND, &unread)?);
    Ok(feed)
}

/// Counts past `u32::MAX` saturate.
fn unread_count(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

fn all_feeds(store: &dyn RecordStore) -> Result<Vec<Feed>> {
    store
        .query(FEED_KIND, &Predicate::True, &[SortKey::ascending("title")])?
        .iter()
        .map(|record| load_feed(store, record))
        .collect()
}

fn find_feed(store: &dyn RecordStore, feed_id: &str) -> Result<Record> {
    store
        .get(FEED_KIND, feed_id)?
        .ok_or(Error::Database(DatabaseError::EntryNotFound))
}

fn feed_by_url(store: &dyn RecordStore, url: &Url) -> Result<Option<Record>> {
    Ok(store
        .query(FEED_KIND, &Predicate::eq("url", url.as_str()), &[])?
        .into_iter()
        .next())
}

/// Store `feed`. A stored feed with the same URL but another id is replaced
/// and its articles move to the new id.
fn upsert_feed(store: &dyn RecordStore, feed: Feed) -> Result<Feed> {
    if let Some(existing) = feed_by_url(store, &feed.url)? {
        if existing.id != feed.id {
            debug!("Re-keying feed {} as {}", existing.id, feed.id);
            let moved = store
                .query(ARTICLE_KIND, &Predicate::eq("feed_id", existing.id.as_str()), &[])?
                .into_iter()
                .map(|record| {
                    let mut article: Article = record.decode()?;
                    article.feed_id = feed.id.clone();
                    article_record(&article)
                })
                .collect::<Result<Vec<_>>>()?;
            store.write(moved)?;
            store.delete(&existing)?;
        }
    }

    let record = feed_record(&feed)?;
    store.write(vec![record.clone()])?;
    load_feed(store, &record)
}

#[async_trait]
impl FeedService for StoreService {
    async fn feeds(&self) -> Result<Vec<Feed>> {
        self.run(|store| all_feeds(store.as_ref())).await
    }

    async fn articles(&self, feed: &Feed) -> Result<Vec<Article>> {
        let feed_id = feed.id.clone();
        let batch_size = self.batch_size;
        self.run(move |store| {
            find_feed(store.as_ref(), &feed_id)?;
            article_list(&store, &feed_id)
                .with_batch_size(batch_size)
                .to_vec()
        })
        .await
    }

    async fn subscribe(&self, url: &Url) -> Result<Feed> {
        let url = url.clone();
        self.run(move |store| {
            if let Some(existing) = feed_by_url(store.as_ref(), &url)? {
                return load_feed(store.as_ref(), &existing);
            }
            info!("Subscribing locally to {}", url);
            let feed = Feed::new(url);
            store.write(vec![feed_record(&feed)?])?;
            Ok(feed)
        })
        .await
    }

    async fn tags(&self) -> Result<Vec<String>> {
        self.run(|store| {
            let tags: BTreeSet<String> = all_feeds(store.as_ref())?
                .into_iter()
                .flat_map(|feed| feed.tags)
                .collect();
            Ok(tags.into_iter().collect())
        })
        .await
    }

    async fn set_tags(&self, tags: &[String], feed: &Feed) -> Result<Feed> {
        let tags = tags.to_vec();
        let feed_id = feed.id.clone();
        self.run(move |store| {
            let mut feed: Feed = find_feed(store.as_ref(), &feed_id)?.decode()?;
            feed.tags = tags;
            let record = feed_record(&feed)?;
            store.write(vec![record.clone()])?;
            load_feed(store.as_ref(), &record)
        })
        .await
    }

    async fn read_all(&self, feed: &Feed) -> Result<()> {
        let feed_id = feed.id.clone();
        self.run(move |store| {
            find_feed(store.as_ref(), &feed_id)?;
            let unread = Predicate::eq("feed_id", feed_id.as_str()).and(Predicate::eq("read", false));
            let updated = store
                .query(ARTICLE_KIND, &unread, &[])?
                .into_iter()
                .map(|record| {
                    let mut article: Article = record.decode()?;
                    article.read = true;
                    article_record(&article)
                })
                .collect::<Result<Vec<_>>>()?;
            debug!("Marking {} articles of {} as read", updated.len(), feed_id);
            store.write(updated)
        })
        .await
    }

    async fn remove(&self, feed: &Feed) -> Result<()> {
        let feed_id = feed.id.clone();
        self.run(move |store| {
            let articles = store.query(ARTICLE_KIND, &Predicate::eq("feed_id", feed_id.as_str()), &[])?;
            for article in &articles {
                store.delete(article)?;
            }
            match store.delete(&Record::new(FEED_KIND, feed_id.as_str(), Default::default())) {
                Ok(()) | Err(Error::Database(DatabaseError::EntryNotFound)) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }
}

#[async_trait]
impl LocalFeedService for StoreService {
    async fn update_feeds(&self, feeds: Vec<Feed>) -> Result<Vec<Feed>> {
        self.run(move |store| {
            for feed in feeds {
                upsert_feed(store.as_ref(), feed)?;
            }
            all_feeds(store.as_ref())
        })
        .await
    }

    async fn update_feed(&self, feed: Feed) -> Result<Feed> {
        self.run(move |store| upsert_feed(store.as_ref(), feed)).await
    }

    async fn update_articles(&self, feed: &Feed, articles: Vec<Article>) -> Result<Vec<Article>> {
        let feed_id = feed.id.clone();
        let batch_size = self.batch_size;
        self.run(move |store| {
            let records = articles
                .into_iter()
                .map(|mut article| {
                    article.feed_id = feed_id.clone();
                    article_record(&article)
                })
                .collect::<Result<Vec<_>>>()?;
            store.write(records)?;
            article_list(&store, &feed_id)
                .with_batch_size(batch_size)
                .to_vec()
        })
        .await
    }
}

#[async_trait]
impl ArticleService for StoreService {
    async fn mark(&self, article: &Article, read: bool) -> Result<Article> {
        let article_id = article.id.clone();
        self.run(move |store| {
            let record = store
                .get(ARTICLE_KIND, &article_id)?
                .ok_or(Error::Database(DatabaseError::EntryNotFound))?;
            let mut article: Article = record.decode()?;
            article.read = read;
            store.write(vec![article_record(&article)?])?;
            Ok(article)
        })
        .await
    }

    async fn remove(&self, article: &Article) -> Result<()> {
        let record = article_record(article)?;
        self.run(move |store| store.delete(&record)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::fixtures;
    use crate::storage::MemoryRecordStore;

    fn service_with(feeds: &[Feed], articles: &[Article]) -> (StoreService, Arc<MemoryRecordStore>) {
        let mut records: Vec<Record> = feeds.iter().map(|f| feed_record(f).unwrap()).collect();
        records.extend(articles.iter().map(|a| article_record(a).unwrap()));
        let store = Arc::new(MemoryRecordStore::with_records(records));
        (StoreService::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_feeds_include_unread_counts() {
        let mut read = fixtures::article("a2", "f1", 1);
        read.read = true;
        let (service, _) = service_with(
            &[fixtures::feed("f2"), fixtures::feed("f1")],
            &[fixtures::article("a1", "f1", 0), read],
        );

        let feeds = service.feeds().await.unwrap();
        let ids: Vec<_> = feeds.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["f1", "f2"]);
        assert_eq!(feeds[0].unread_count, 1);
        assert_eq!(feeds[1].unread_count, 0);
    }

    #[test]
    fn test_unread_count_saturates() {
        assert_eq!(unread_count(0), 0);
        assert_eq!(unread_count(42), 42);
        assert_eq!(unread_count(usize::MAX), u32::MAX);
    }

    #[tokio::test]
    async fn test_articles_newest_first() {
        let feed = fixtures::feed("f1");
        let (service, _) = service_with(
            &[feed.clone()],
            &[
                fixtures::article("old", "f1", 0),
                fixtures::article("new", "f1", 10),
                fixtures::article("other", "f2", 5),
            ],
        );

        let articles = service.articles(&feed).await.unwrap();
        let ids: Vec<_> = articles.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);

        assert_eq!(
            service.articles(&fixtures::feed("missing")).await,
            Err(Error::Database(DatabaseError::EntryNotFound))
        );
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let (service, store) = service_with(&[], &[]);
        let url = Url::parse("https://example.com/new.xml").unwrap();

        let first = service.subscribe(&url).await.unwrap();
        let second = service.subscribe(&url).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.records_count(), 1);
    }

    #[tokio::test]
    async fn test_update_feed_takes_network_identity() {
        let url = Url::parse("https://example.com/new.xml").unwrap();
        let local = Feed::new(url.clone());
        let mut article = fixtures::article("a1", &local.id, 0);
        article.feed_id = local.id.clone();
        let (service, _) = service_with(&[local.clone()], &[article]);

        let mut remote = Feed::new(url);
        remote.id = "feed/1".to_string();
        remote.title = "Remote".to_string();

        let stored = service.update_feed(remote.clone()).await.unwrap();
        assert_eq!(stored.id, "feed/1");
        assert_eq!(stored.unread_count, 1);

        let feeds = service.feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].title, "Remote");
        assert_eq!(service.articles(&remote).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_all_and_remove() {
        let feed = fixtures::feed("f1");
        let (service, store) = service_with(
            &[feed.clone()],
            &[fixtures::article("a1", "f1", 0), fixtures::article("a2", "f1", 1)],
        );

        service.read_all(&feed).await.unwrap();
        assert_eq!(service.feeds().await.unwrap()[0].unread_count, 0);
        assert_eq!(service.unread_article_list(&feed).unwrap().count().unwrap(), 0);

        FeedService::remove(&service, &feed).await.unwrap();
        assert_eq!(store.records_count(), 0);
        FeedService::remove(&service, &feed).await.unwrap();
    }

    #[tokio::test]
    async fn test_tags() {
        let mut tagged = fixtures::feed("f1");
        tagged.tags = vec!["tech".to_string(), "rust".to_string()];
        let (service, _) = service_with(&[tagged.clone(), fixtures::feed("f2")], &[]);

        assert_eq!(service.tags().await.unwrap(), vec!["rust", "tech"]);

        let updated = service
            .set_tags(&["news".to_string()], &tagged)
            .await
            .unwrap();
        assert_eq!(updated.tags, vec!["news"]);
        assert_eq!(service.set_url(&tagged.url, &tagged).await, Err(Error::NotSupported));
    }

    #[tokio::test]
    async fn test_update_articles_and_mark() {
        let feed = fixtures::feed("f1");
        let (service, _) = service_with(&[feed.clone()], &[fixtures::article("a1", "f1", 0)]);

        let mut incoming = fixtures::article("a2", "elsewhere", 5);
        incoming.title = "Fresh".to_string();
        let articles = service.update_articles(&feed, vec![incoming]).await.unwrap();
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].title, "Fresh");
        assert_eq!(articles[0].feed_id, "f1");

        let marked = ArticleService::mark(&service, &articles[1], true).await.unwrap();
        assert!(marked.read);

        let missing = fixtures::article("nope", "f1", 0);
        assert!(ArticleService::mark(&service, &missing, true).await.is_err());
        assert!(ArticleService::remove(&service, &marked).await.is_ok());
        assert_eq!(service.article_list(&feed).count().unwrap(), 1);
    }
}
