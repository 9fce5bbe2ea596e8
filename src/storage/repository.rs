use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::feed::{Article, Feed};
use crate::service::{ArticleService, FeedService};

/// A reference-counted handle to one in-flight or completed request.
pub type SharedResult<T, E = Error> = Shared<BoxFuture<'static, std::result::Result<T, E>>>;

/// What happens to an entry once its request succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Keep returning the completed future forever.
    KeepSuccesses,
    /// Only de-duplicate while the request is outstanding.
    InFlightOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub hits: u64,
    pub misses: u64,
    /// Failed requests that were discarded so the next call starts over.
    pub retries: u64,
}

/// Memoizes keyed asynchronous requests.
///
/// While a request for a key is outstanding, or after it succeeded (under
/// [`CachePolicy::KeepSuccesses`]), every caller gets the very same shared
/// future. Settled entries the policy does not keep are evicted as the request
/// completes, so a failed request is discarded and the next call starts a new
/// one.
pub struct RequestCache<K, T, E = Error> {
    policy: CachePolicy,
    entries: Arc<Mutex<HashMap<K, Entry<T, E>>>>,
    next_id: AtomicU64,
    stats: Arc<RwLock<RepositoryStats>>,
}

struct Entry<T, E> {
    id: u64,
    future: SharedResult<T, E>,
}

impl<K, T, E> Default for RequestCache<K, T, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T, E> RequestCache<K, T, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_policy(CachePolicy::KeepSuccesses)
    }

    pub fn in_flight_only() -> Self {
        Self::with_policy(CachePolicy::InFlightOnly)
    }

    pub fn with_policy(policy: CachePolicy) -> Self {
        Self {
            policy,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            stats: Arc::new(RwLock::new(RepositoryStats::default())),
        }
    }

    /// Return the shared future for `key`, calling `make` only when no
    /// reusable one exists.
    pub fn request<F, Fut>(&self, key: K, make: F) -> SharedResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get(&key) {
            match existing.future.peek() {
                None => {
                    self.stats.write().hits += 1;
                    return existing.future.clone();
                }
                Some(Ok(_)) if self.policy == CachePolicy::KeepSuccesses => {
                    self.stats.write().hits += 1;
                    return existing.future.clone();
                }
                // evicted on completion; only a superseded entry lands here
                Some(_) => {}
            }
        }

        self.stats.write().misses += 1;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let future = self.evicting(key.clone(), id, make()).boxed().shared();
        entries.insert(
            key,
            Entry {
                id,
                future: future.clone(),
            },
        );
        future
    }

    /// Wrap `request` so that its entry is dropped on completion unless the
    /// policy keeps the result.
    fn evicting<Fut>(
        &self,
        key: K,
        id: u64,
        request: Fut,
    ) -> impl Future<Output = std::result::Result<T, E>> + Send + 'static
    where
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        let entries = Arc::downgrade(&self.entries);
        let stats = Arc::clone(&self.stats);
        let policy = self.policy;

        async move {
            let result = request.await;
            let keep = result.is_ok() && policy == CachePolicy::KeepSuccesses;
            if !keep {
                if let Some(entries) = entries.upgrade() {
                    let mut entries = entries.lock();
                    if entries.get(&key).is_some_and(|entry| entry.id == id) {
                        entries.remove(&key);
                    }
                }
                if result.is_err() {
                    debug!("Discarding failed request, the next call issues a new one");
                    stats.write().retries += 1;
                }
            }
            result
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> RepositoryStats {
        self.stats.read().clone()
    }
}

/// Applies [`RequestCache`] to every operation of a [`FeedService`].
///
/// Reads (`feeds`, `articles`, `tags`) keep their successes; writes only
/// collapse concurrent duplicates.
pub struct FeedRepository<S> {
    service: Arc<S>,
    feeds: RequestCache<(), Vec<Feed>>,
    articles: RequestCache<String, Vec<Article>>,
    tags: RequestCache<(), Vec<String>>,
    subscriptions: RequestCache<Url, Feed>,
    tag_updates: RequestCache<(String, Vec<String>), Feed>,
    url_updates: RequestCache<(String, Url), Feed>,
    mark_read: RequestCache<String, ()>,
    removals: RequestCache<String, ()>,
}

impl<S: FeedService + 'static> FeedRepository<S> {
    pub fn new(service: S) -> Self {
        Self::from_arc(Arc::new(service))
    }

    pub fn from_arc(service: Arc<S>) -> Self {
        Self {
            service,
            feeds: RequestCache::new(),
            articles: RequestCache::new(),
            tags: RequestCache::new(),
            subscriptions: RequestCache::in_flight_only(),
            tag_updates: RequestCache::in_flight_only(),
            url_updates: RequestCache::in_flight_only(),
            mark_read: RequestCache::in_flight_only(),
            removals: RequestCache::in_flight_only(),
        }
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    pub fn request_feeds(&self) -> SharedResult<Vec<Feed>> {
        let service = Arc::clone(&self.service);
        self.feeds.request((), move || async move { service.feeds().await })
    }

    pub fn request_articles(&self, feed: &Feed) -> SharedResult<Vec<Article>> {
        let service = Arc::clone(&self.service);
        let feed = feed.clone();
        self.articles.request(feed.id.clone(), move || async move {
            service.articles(&feed).await
        })
    }

    pub fn request_tags(&self) -> SharedResult<Vec<String>> {
        let service = Arc::clone(&self.service);
        self.tags.request((), move || async move { service.tags().await })
    }

    pub fn request_subscribe(&self, url: &Url) -> SharedResult<Feed> {
        let service = Arc::clone(&self.service);
        let url = url.clone();
        self.subscriptions.request(url.clone(), move || async move {
            service.subscribe(&url).await
        })
    }

    pub fn request_set_tags(&self, tags: &[String], feed: &Feed) -> SharedResult<Feed> {
        let service = Arc::clone(&self.service);
        let tags = tags.to_vec();
        let feed = feed.clone();
        self.tag_updates
            .request((feed.id.clone(), tags.clone()), move || async move {
                service.set_tags(&tags, &feed).await
            })
    }

    pub fn request_set_url(&self, url: &Url, feed: &Feed) -> SharedResult<Feed> {
        let service = Arc::clone(&self.service);
        let url = url.clone();
        let feed = feed.clone();
        self.url_updates
            .request((feed.id.clone(), url.clone()), move || async move {
                service.set_url(&url, &feed).await
            })
    }

    pub fn request_read_all(&self, feed: &Feed) -> SharedResult<()> {
        let service = Arc::clone(&self.service);
        let feed = feed.clone();
        self.mark_read.request(feed.id.clone(), move || async move {
            service.read_all(&feed).await
        })
    }

    pub fn request_remove(&self, feed: &Feed) -> SharedResult<()> {
        let service = Arc::clone(&self.service);
        let feed = feed.clone();
        self.removals.request(feed.id.clone(), move || async move {
            service.remove(&feed).await
        })
    }

    /// Combined statistics of the read caches.
    pub fn stats(&self) -> RepositoryStats {
        [self.feeds.stats(), self.articles.stats(), self.tags.stats()]
            .into_iter()
            .fold(RepositoryStats::default(), |total, s| RepositoryStats {
                hits: total.hits + s.hits,
                misses: total.misses + s.misses,
                retries: total.retries + s.retries,
            })
    }
}

#[async_trait]
impl<S: FeedService + 'static> FeedService for FeedRepository<S> {
    async fn feeds(&self) -> Result<Vec<Feed>> {
        self.request_feeds().await
    }

    async fn articles(&self, feed: &Feed) -> Result<Vec<Article>> {
        self.request_articles(feed).await
    }

    async fn subscribe(&self, url: &Url) -> Result<Feed> {
        self.request_subscribe(url).await
    }

    async fn tags(&self) -> Result<Vec<String>> {
        self.request_tags().await
    }

    async fn set_tags(&self, tags: &[String], feed: &Feed) -> Result<Feed> {
        self.request_set_tags(tags, feed).await
    }

    async fn set_url(&self, url: &Url, feed: &Feed) -> Result<Feed> {
        self.request_set_url(url, feed).await
    }

    async fn read_all(&self, feed: &Feed) -> Result<()> {
        self.request_read_all(feed).await
    }

    async fn remove(&self, feed: &Feed) -> Result<()> {
        self.request_remove(feed).await
    }
}

/// Applies [`RequestCache`] to an [`ArticleService`] and memoizes its
/// derived values per article.
pub struct ArticleRepository<S> {
    service: Arc<S>,
    marks: RequestCache<(String, bool), Article>,
    removals: RequestCache<String, ()>,
    authors: Mutex<HashMap<String, String>>,
    dates: Mutex<HashMap<String, DateTime<Utc>>>,
    reading_times: Mutex<HashMap<String, Duration>>,
}

impl<S: ArticleService + 'static> ArticleRepository<S> {
    pub fn new(service: S) -> Self {
        Self::from_arc(Arc::new(service))
    }

    pub fn from_arc(service: Arc<S>) -> Self {
        Self {
            service,
            marks: RequestCache::in_flight_only(),
            removals: RequestCache::in_flight_only(),
            authors: Mutex::new(HashMap::new()),
            dates: Mutex::new(HashMap::new()),
            reading_times: Mutex::new(HashMap::new()),
        }
    }

    pub fn request_mark(&self, article: &Article, read: bool) -> SharedResult<Article> {
        let service = Arc::clone(&self.service);
        let article = article.clone();
        self.marks
            .request((article.id.clone(), read), move || async move {
                service.mark(&article, read).await
            })
    }

    pub fn request_remove(&self, article: &Article) -> SharedResult<()> {
        let service = Arc::clone(&self.service);
        let article = article.clone();
        self.removals.request(article.id.clone(), move || async move {
            service.remove(&article).await
        })
    }
}

fn memoized<V: Clone>(cache: &Mutex<HashMap<String, V>>, key: &str, compute: impl FnOnce() -> V) -> V {
    if let Some(value) = cache.lock().get(key) {
        return value.clone();
    }
    let value = compute();
    cache.lock().insert(key.to_string(), value.clone());
    value
}

#[async_trait]
impl<S: ArticleService + 'static> ArticleService for ArticleRepository<S> {
    async fn mark(&self, article: &Article, read: bool) -> Result<Article> {
        self.request_mark(article, read).await
    }

    async fn remove(&self, article: &Article) -> Result<()> {
        self.request_remove(article).await
    }

    fn authors(&self, article: &Article) -> String {
        memoized(&self.authors, &article.id, || self.service.authors(article))
    }

    fn date(&self, article: &Article) -> DateTime<Utc> {
        memoized(&self.dates, &article.id, || self.service.date(article))
    }

    fn estimated_reading_time(&self, article: &Article) -> Duration {
        memoized(&self.reading_times, &article.id, || {
            self.service.estimated_reading_time(article)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::fixtures;
    use futures::future;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFeedService {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingFeedService {
        fn outcome<T>(&self, value: T) -> Result<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::Http(500))
            } else {
                Ok(value)
            }
        }
    }

    #[async_trait]
    impl FeedService for CountingFeedService {
        async fn feeds(&self) -> Result<Vec<Feed>> {
            self.outcome(vec![fixtures::feed("f1")])
        }

        async fn articles(&self, feed: &Feed) -> Result<Vec<Article>> {
            self.outcome(vec![fixtures::article("a1", &feed.id, 0)])
        }

        async fn subscribe(&self, url: &Url) -> Result<Feed> {
            self.outcome(Feed::new(url.clone()))
        }

        async fn read_all(&self, _feed: &Feed) -> Result<()> {
            self.outcome(())
        }

        async fn remove(&self, _feed: &Feed) -> Result<()> {
            self.outcome(())
        }
    }

    #[tokio::test]
    async fn test_pending_requests_share_one_future() {
        let cache: RequestCache<&str, i32> = RequestCache::new();
        let calls = AtomicUsize::new(0);
        let make = || {
            calls.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(1))
        };

        let first = cache.request("key", make);
        let second = cache.request("key", || future::ready(Ok(2)));

        assert!(first.ptr_eq(&second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.await, Ok(1));
    }

    #[tokio::test]
    async fn test_success_is_kept_without_new_calls() {
        let cache: RequestCache<&str, i32> = RequestCache::new();
        let first = cache.request("key", || future::ready(Ok(1)));
        assert_eq!(first.clone().await, Ok(1));

        let again = cache.request("key", || -> future::Ready<Result<i32>> {
            panic!("must not be called")
        });
        assert!(again.ptr_eq(&first));
        assert_eq!(again.peek(), Some(&Ok(1)));
        assert_eq!(cache.stats(), RepositoryStats { hits: 1, misses: 1, retries: 0 });
    }

    #[tokio::test]
    async fn test_failure_is_retried_once() {
        let cache: RequestCache<&str, i32> = RequestCache::new();
        let failed = cache.request("key", || future::ready(Err(Error::Http(503))));
        assert_eq!(failed.clone().await, Err(Error::Http(503)));

        let calls = AtomicUsize::new(0);
        let retry = cache.request("key", || {
            calls.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(7))
        });
        assert!(!retry.ptr_eq(&failed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retry.await, Ok(7));
        assert_eq!(cache.stats().retries, 1);
    }

    #[tokio::test]
    async fn test_in_flight_only_policy_reissues_after_success() {
        let cache: RequestCache<&str, i32> = RequestCache::in_flight_only();
        let first = cache.request("key", || future::ready(Ok(1)));
        let pending = cache.request("key", || future::ready(Ok(2)));
        assert!(first.ptr_eq(&pending));
        assert_eq!(first.await, Ok(1));

        let next = cache.request("key", || future::ready(Ok(2)));
        assert_eq!(next.await, Ok(2));
    }

    #[tokio::test]
    async fn test_settled_writes_leave_no_entries() {
        let cache: RequestCache<String, usize> = RequestCache::in_flight_only();
        for i in 0..1000 {
            let value = cache
                .request(format!("key-{}", i), move || future::ready(Ok(i)))
                .await;
            assert_eq!(value, Ok(i));
        }
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().misses, 1000);
    }

    #[tokio::test]
    async fn test_failures_are_evicted_and_successes_kept() {
        let cache: RequestCache<String, usize> = RequestCache::new();
        for i in 0..100 {
            let failed = cache
                .request(format!("key-{}", i), || future::ready(Err(Error::Http(500))))
                .await;
            assert_eq!(failed, Err(Error::Http(500)));
        }
        assert!(cache.is_empty());
        assert_eq!(cache.stats().retries, 100);

        assert_eq!(cache.request("kept".to_string(), || future::ready(Ok(1))).await, Ok(1));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_entry_stays_until_completion() {
        let cache: RequestCache<&str, i32> = RequestCache::in_flight_only();
        let (tx, rx) = futures::channel::oneshot::channel::<i32>();
        let pending = cache.request("key", move || async move {
            rx.await.map_err(|_| Error::Http(500))
        });
        assert_eq!(cache.len(), 1);

        tx.send(3).unwrap();
        assert_eq!(pending.await, Ok(3));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let cache: RequestCache<String, i32> = RequestCache::new();
        let a = cache.request("a".to_string(), || future::ready(Ok(1)));
        let b = cache.request("b".to_string(), || future::ready(Ok(2)));

        assert!(!a.ptr_eq(&b));
        assert_eq!(cache.len(), 2);
        assert_eq!(future::join(a, b).await, (Ok(1), Ok(2)));
    }

    #[tokio::test]
    async fn test_feed_repository_memoizes_reads() {
        let service = Arc::new(CountingFeedService::default());
        let repository = FeedRepository::from_arc(Arc::clone(&service));

        assert!(repository.request_feeds().ptr_eq(&repository.request_feeds()));
        let feeds = repository.feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        repository.feeds().await.unwrap();
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);

        let feed = fixtures::feed("f1");
        repository.articles(&feed).await.unwrap();
        repository.articles(&feed).await.unwrap();
        repository.articles(&fixtures::feed("f2")).await.unwrap();
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_feed_repository_retries_failed_reads() {
        let service = Arc::new(CountingFeedService::default());
        service.fail.store(true, Ordering::SeqCst);
        let repository = FeedRepository::from_arc(Arc::clone(&service));

        assert_eq!(repository.feeds().await, Err(Error::Http(500)));

        service.fail.store(false, Ordering::SeqCst);
        assert!(repository.feeds().await.is_ok());
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        assert_eq!(repository.stats().retries, 1);
    }

    #[tokio::test]
    async fn test_feed_repository_writes_are_not_kept() {
        let service = Arc::new(CountingFeedService::default());
        let repository = FeedRepository::from_arc(Arc::clone(&service));
        let feed = fixtures::feed("f1");

        repository.read_all(&feed).await.unwrap();
        repository.read_all(&feed).await.unwrap();
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsupported_operations_pass_through() {
        let repository = FeedRepository::new(CountingFeedService::default());
        assert_eq!(repository.tags().await, Err(Error::NotSupported));
    }

    struct PlainArticleService {
        derivations: AtomicUsize,
    }

    #[async_trait]
    impl ArticleService for PlainArticleService {
        async fn mark(&self, article: &Article, read: bool) -> Result<Article> {
            let mut article = article.clone();
            article.read = read;
            Ok(article)
        }

        async fn remove(&self, _article: &Article) -> Result<()> {
            Ok(())
        }

        fn authors(&self, article: &Article) -> String {
            self.derivations.fetch_add(1, Ordering::SeqCst);
            article.authors_line()
        }
    }

    #[tokio::test]
    async fn test_article_repository() {
        let repository = ArticleRepository::new(PlainArticleService {
            derivations: AtomicUsize::new(0),
        });
        let article = fixtures::article("a1", "f1", 0);

        let first = repository.request_mark(&article, true);
        assert!(first.ptr_eq(&repository.request_mark(&article, true)));
        assert!(!first.ptr_eq(&repository.request_mark(&article, false)));
        assert!(first.await.unwrap().read);

        assert_eq!(repository.authors(&article), "Jane Doe");
        assert_eq!(repository.authors(&article), "Jane Doe");
        assert_eq!(repository.service.derivations.load(Ordering::SeqCst), 1);
    }
}
