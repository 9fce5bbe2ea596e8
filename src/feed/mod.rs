use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Words per minute used for reading time estimates.
const READING_SPEED_WPM: f64 = 200.0;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Feed {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub url: Url,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Feed {
    /// A feed known only by its URL, as created by a fresh local subscription.
    pub fn new(url: Url) -> Self {
        Self {
            id: url.to_string(),
            title: String::new(),
            url,
            summary: String::new(),
            tags: Vec::new(),
            unread_count: 0,
        }
    }

    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            self.url.as_str()
        } else {
            &self.title
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_title(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl Author {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: None,
        }
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.email {
            Some(email) => write!(f, "{} <{}>", self.name, email),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub feed_id: String,
    pub title: String,
    pub link: Url,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub authors: Vec<Author>,
    pub published: DateTime<Utc>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read: bool,
}

impl Article {
    /// When the article last changed: its update time, else its publish time.
    pub fn date(&self) -> DateTime<Utc> {
        self.updated.unwrap_or(self.published)
    }

    pub fn authors_line(&self) -> String {
        self.authors
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn estimated_reading_time(&self) -> Duration {
        let text = if self.content.is_empty() {
            &self.summary
        } else {
            &self.content
        };
        let words = strip_markup(text).split_whitespace().count() as f64;
        Duration::from_secs_f64(words / READING_SPEED_WPM * 60.0)
    }
}

/// Drop anything between `<` and `>`; good enough for word counting.
fn strip_markup(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                text.push(' ');
            }
            '>' => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }
    text
}
