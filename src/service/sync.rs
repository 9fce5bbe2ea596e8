//! A [`FeedService`] speaking the Google-Reader style JSON API used by
//! Inoreader and compatible sync servers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::collections::NetworkPagedCollection;
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::feed::{Article, Author, Feed};
use crate::http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient};
use crate::service::{ArticleService, FeedService};

const API_PREFIX: &str = "reader/api/0/";
const READ_STATE: &str = "user/-/state/com.google/read";
const LABEL_MARKER: &str = "/label/";

#[derive(Debug, Deserialize)]
struct SubscriptionList {
    #[serde(default)]
    subscriptions: Vec<RemoteFeed>,
}

#[derive(Debug, Deserialize)]
struct RemoteFeed {
    id: String,
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    categories: Vec<Category>,
}

#[derive(Debug, Deserialize)]
struct Category {
    id: String,
    #[serde(default)]
    label: String,
}

impl RemoteFeed {
    fn into_feed(self) -> Result<Feed> {
        let tags = self
            .categories
            .into_iter()
            .map(|c| if c.label.is_empty() { label_of(&c.id) } else { c.label })
            .collect();
        Ok(Feed {
            id: self.id,
            title: self.title,
            url: Url::parse(&self.url)?,
            summary: String::new(),
            tags,
            unread_count: 0,
        })
    }
}

#[derive(Debug, Deserialize)]
struct StreamContents {
    #[serde(default)]
    items: Vec<RemoteArticle>,
    #[serde(default)]
    continuation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteArticle {
    id: String,
    #[serde(default)]
    title: String,
    published: i64,
    #[serde(default)]
    updated: Option<i64>,
    #[serde(default)]
    canonical: Vec<Link>,
    #[serde(default)]
    alternate: Vec<Link>,
    #[serde(default)]
    summary: Option<Content>,
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
}

#[derive(Debug, Deserialize)]
struct Content {
    content: String,
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| Error::FeedParse(format!("invalid timestamp {}", seconds)))
}

impl RemoteArticle {
    fn into_article(self, feed_id: &str) -> Result<Article> {
        let href = self
            .canonical
            .first()
            .or_else(|| self.alternate.first())
            .map(|l| l.href.as_str())
            .ok_or_else(|| Error::FeedParse(format!("article {} has no link", self.id)))?;

        Ok(Article {
            link: Url::parse(href)?,
            feed_id: feed_id.to_string(),
            title: self.title,
            summary: self.summary.map(|c| c.content).unwrap_or_default(),
            content: self.content.map(|c| c.content).unwrap_or_default(),
            authors: self
                .author
                .filter(|a| !a.is_empty())
                .map(|a| vec![Author::new(a)])
                .unwrap_or_default(),
            published: timestamp(self.published)?,
            updated: self.updated.map(timestamp).transpose()?,
            read: self.categories.iter().any(|c| c == READ_STATE),
            id: self.id,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuickAdd {
    #[serde(default)]
    num_results: u32,
    #[serde(default)]
    stream_id: String,
    #[serde(default)]
    stream_name: String,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    id: String,
}

fn label_of(id: &str) -> String {
    id.rsplit_once(LABEL_MARKER)
        .map(|(_, label)| label.to_string())
        .unwrap_or_else(|| id.to_string())
}

/// Parse one page of a stream into articles and the continuation token.
pub fn parse_stream_page(body: &[u8], feed_id: &str) -> Result<(Vec<Article>, Option<String>)> {
    let page: StreamContents = serde_json::from_slice(body)?;
    let articles = page
        .items
        .into_iter()
        .map(|item| item.into_article(feed_id))
        .collect::<Result<Vec<_>>>()?;
    Ok((articles, page.continuation.filter(|c| !c.is_empty())))
}

/// Network feed source.
#[derive(Clone)]
pub struct SyncService {
    client: Arc<dyn HttpClient>,
    base_url: Url,
    page_size: usize,
}

impl SyncService {
    pub fn new(client: Arc<dyn HttpClient>, mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            client,
            base_url,
            page_size: 50,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| Error::Config("service.base_url is not set".to_string()))?;
        let client = ReqwestClient::from_config(config)?;
        Ok(Self::new(Arc::new(client), Url::parse(base_url)?).with_page_size(config.page_size))
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(API_PREFIX)?.join(path)?)
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self.client.request(request).await?;
        if !response.is_success() {
            return Err(Error::Http(response.status));
        }
        Ok(response)
    }

    /// A feed's articles as a lazily paged collection.
    pub fn article_pages(&self, feed: &Feed) -> Result<NetworkPagedCollection<Article>> {
        let mut url = self.endpoint("stream/contents/")?;
        url.path_segments_mut()
            .map_err(|_| Error::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push(&feed.id);

        let page_size = self.page_size.to_string();
        let feed_id = feed.id.clone();
        Ok(NetworkPagedCollection::new(
            Arc::clone(&self.client),
            move |token: Option<&str>| {
                let request = HttpRequest::get(url.clone()).with_query("n", &page_size);
                match token {
                    Some(token) => request.with_query("c", token),
                    None => request,
                }
            },
            move |body: &[u8]| parse_stream_page(body, &feed_id),
        ))
    }

    async fn edit_subscription(&self, feed: &Feed, action: &str, extra: &[(&str, String)]) -> Result<()> {
        let mut request = HttpRequest::post(self.endpoint("subscription/edit")?)
            .with_query("ac", action)
            .with_query("s", &feed.id);
        for (key, value) in extra {
            request = request.with_query(key, value);
        }
        self.send(request).await?;
        Ok(())
    }
}

#[async_trait]
impl FeedService for SyncService {
    async fn feeds(&self) -> Result<Vec<Feed>> {
        let request = HttpRequest::get(self.endpoint("subscription/list")?).with_query("output", "json");
        let list: SubscriptionList = self.send(request).await?.json()?;
        debug!("Sync server lists {} subscriptions", list.subscriptions.len());
        list.subscriptions.into_iter().map(RemoteFeed::into_feed).collect()
    }

    async fn articles(&self, feed: &Feed) -> Result<Vec<Article>> {
        self.article_pages(feed)?.collect_all().await
    }

    async fn subscribe(&self, url: &Url) -> Result<Feed> {
        let request = HttpRequest::post(self.endpoint("subscription/quickadd")?).with_query("quickadd", url.as_str());
        let added: QuickAdd = self.send(request).await?.json()?;
        if added.num_results == 0 || added.stream_id.is_empty() {
            return Err(Error::NotFound(url.to_string()));
        }
        info!("Subscribed to {} as {}", url, added.stream_id);

        let mut feed = Feed::new(url.clone());
        feed.id = added.stream_id;
        feed.title = added.stream_name;
        Ok(feed)
    }

    async fn tags(&self) -> Result<Vec<String>> {
        let request = HttpRequest::get(self.endpoint("tag/list")?).with_query("output", "json");
        let list: TagList = self.send(request).await?.json()?;
        Ok(list
            .tags
            .into_iter()
            .filter(|t| t.id.contains(LABEL_MARKER))
            .map(|t| label_of(&t.id))
            .collect())
    }

    async fn set_tags(&self, tags: &[String], feed: &Feed) -> Result<Feed> {
        let mut extra: Vec<(&str, String)> = feed
            .tags
            .iter()
            .filter(|t| !tags.contains(t))
            .map(|t| ("r", format!("user/-/label/{}", t)))
            .collect();
        extra.extend(tags.iter().map(|t| ("a", format!("user/-/label/{}", t))));
        self.edit_subscription(feed, "edit", &extra).await?;

        let mut updated = feed.clone();
        updated.tags = tags.to_vec();
        Ok(updated)
    }

    async fn read_all(&self, feed: &Feed) -> Result<()> {
        let request = HttpRequest::post(self.endpoint("mark-all-as-read")?).with_query("s", &feed.id);
        self.send(request).await?;
        Ok(())
    }

    async fn remove(&self, feed: &Feed) -> Result<()> {
        self.edit_subscription(feed, "unsubscribe", &[]).await
    }
}

#[async_trait]
impl ArticleService for SyncService {
    async fn mark(&self, article: &Article, read: bool) -> Result<Article> {
        let action = if read { "a" } else { "r" };
        let request = HttpRequest::post(self.endpoint("edit-tag")?)
            .with_query("i", &article.id)
            .with_query(action, READ_STATE);
        self.send(request).await?;

        let mut updated = article.clone();
        updated.read = read;
        Ok(updated)
    }

    /// The sync API has no way to delete a single article.
    async fn remove(&self, _article: &Article) -> Result<()> {
        Err(Error::NotSupported)
    }
}
