use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::http::{HttpClient, HttpRequest};

/// Builds the request for a page, given the continuation token (`None` for
/// the first page).
pub type RequestFactory = Arc<dyn Fn(Option<&str>) -> HttpRequest + Send + Sync>;

/// Parses a response body into the page's items and the next token.
pub type PageParser<T> = Arc<dyn Fn(&[u8]) -> Result<(Vec<T>, Option<String>)> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    First,
    Next(String),
    Last,
}

/// End position of a paged collection. While more pages may exist the end is
/// indefinite and `index` only counts what has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagedIndex {
    pub index: usize,
    pub is_indefinite_end: bool,
}

type PendingPage = Shared<BoxFuture<'static, ()>>;

struct PageState<T> {
    items: Vec<T>,
    cursor: PageCursor,
    in_progress: Vec<(HttpRequest, PendingPage)>,
    last_batch: Range<usize>,
    failure: Option<Error>,
    requests_issued: usize,
}

struct Pager<T> {
    client: Arc<dyn HttpClient>,
    request_factory: RequestFactory,
    parser: PageParser<T>,
    state: Mutex<PageState<T>>,
}

impl<T: Clone + Send + Sync + 'static> Pager<T> {
    fn request_items(self: &Arc<Self>, up_to: Option<usize>) {
        let mut state = self.state.lock();
        let token = match &state.cursor {
            PageCursor::Last => return,
            PageCursor::First => None,
            PageCursor::Next(token) => Some(token.clone()),
        };

        let request = (self.request_factory)(token.as_deref());
        if state.in_progress.iter().any(|(pending, _)| *pending == request) {
            return;
        }

        debug!("Requesting page {}", request.url);
        let pager = Arc::clone(self);
        let page = pager.receive(request.clone(), up_to).boxed().shared();
        state.in_progress.push((request, page.clone()));
        state.requests_issued += 1;
        drop(state);

        tokio::spawn(page);
    }

    async fn receive(self: Arc<Self>, request: HttpRequest, up_to: Option<usize>) {
        let parsed = match self.client.request(request.clone()).await {
            Ok(response) if response.is_success() => (self.parser)(&response.body),
            Ok(response) => Err(Error::Http(response.status)),
            Err(e) => Err(e),
        };

        let wants_more = {
            let mut state = self.state.lock();
            state.in_progress.retain(|(pending, _)| *pending != request);
            match parsed {
                Ok((items, next)) => {
                    let start = state.items.len();
                    state.items.extend(items);
                    state.last_batch = start..state.items.len();
                    state.cursor = next.map_or(PageCursor::Last, PageCursor::Next);
                    debug!(
                        "Received {} items, {} total",
                        state.last_batch.len(),
                        state.items.len()
                    );
                }
                Err(e) => {
                    warn!("Page request to {} failed: {}", request.url, e);
                    state.failure = Some(e);
                    state.cursor = PageCursor::Last;
                }
            }
            matches!(up_to, Some(target) if target >= state.items.len())
                && state.cursor != PageCursor::Last
        };

        if wants_more {
            self.request_items(up_to);
        }
    }

    fn try_get(self: &Arc<Self>, index: usize) -> Option<Result<T>> {
        let state = self.state.lock();
        if let Some(item) = state.items.get(index) {
            let item = item.clone();
            let read_ahead = should_read_ahead(&state.last_batch, index);
            drop(state);
            if read_ahead {
                self.request_items(None);
            }
            return Some(Ok(item));
        }

        if state.cursor == PageCursor::Last && state.in_progress.is_empty() {
            return Some(Err(state.failure.clone().unwrap_or(Error::IndexOutOfRange {
                index,
                count: state.items.len(),
            })));
        }
        None
    }
}

/// Whether `index` sits in the final quarter of the latest page.
fn should_read_ahead(batch: &Range<usize>, index: usize) -> bool {
    !batch.is_empty() && batch.contains(&index) && 4 * (index + 1 - batch.start) >= 3 * batch.len()
}

/// A collection over a cursor-paginated HTTP resource.
///
/// The first page is requested on construction. Reading near the end of the
/// newest page requests the next one in the background; reading past the
/// loaded items waits for the pages in between.
pub struct NetworkPagedCollection<T> {
    pager: Arc<Pager<T>>,
}

impl<T> Clone for NetworkPagedCollection<T> {
    fn clone(&self) -> Self {
        Self {
            pager: Arc::clone(&self.pager),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> NetworkPagedCollection<T> {
    /// Must be called from within a tokio runtime.
    pub fn new<R, P>(client: Arc<dyn HttpClient>, request_factory: R, parser: P) -> Self
    where
        R: Fn(Option<&str>) -> HttpRequest + Send + Sync + 'static,
        P: Fn(&[u8]) -> Result<(Vec<T>, Option<String>)> + Send + Sync + 'static,
    {
        let pager = Arc::new(Pager {
            client,
            request_factory: Arc::new(request_factory),
            parser: Arc::new(parser),
            state: Mutex::new(PageState {
                items: Vec::new(),
                cursor: PageCursor::First,
                in_progress: Vec::new(),
                last_batch: 0..0,
                failure: None,
                requests_issued: 0,
            }),
        });
        pager.request_items(None);
        Self { pager }
    }

    pub fn start_index(&self) -> usize {
        0
    }

    pub fn end_index(&self) -> PagedIndex {
        let state = self.pager.state.lock();
        PagedIndex {
            index: state.items.len(),
            is_indefinite_end: state.cursor != PageCursor::Last || !state.in_progress.is_empty(),
        }
    }

    /// Items received so far.
    pub fn underestimated_count(&self) -> usize {
        self.pager.state.lock().items.len()
    }

    pub fn cursor(&self) -> PageCursor {
        self.pager.state.lock().cursor.clone()
    }

    pub fn requests_issued(&self) -> usize {
        self.pager.state.lock().requests_issued
    }

    pub fn pending_requests(&self) -> usize {
        self.pager.state.lock().in_progress.len()
    }

    /// The error that ended pagination early, if any.
    pub fn failure(&self) -> Option<Error> {
        self.pager.state.lock().failure.clone()
    }

    pub fn loaded_items(&self) -> Vec<T> {
        self.pager.state.lock().items.clone()
    }

    /// The item at `index`, waiting for pages as needed.
    ///
    /// Fails with [`Error::IndexOutOfRange`] once every page has arrived and
    /// `index` is still past the end, or with the page error if pagination
    /// stopped on a failed request.
    pub async fn get(&self, index: usize) -> Result<T> {
        loop {
            if let Some(outcome) = self.pager.try_get(index) {
                return outcome;
            }

            self.pager.request_items(Some(index));
            let earliest = self
                .pager
                .state
                .lock()
                .in_progress
                .first()
                .map(|(_, page)| page.clone());
            if let Some(page) = earliest {
                page.await;
            }
        }
    }

    /// Wait for every page and return all items.
    pub async fn collect_all(&self) -> Result<Vec<T>> {
        loop {
            let next = self.underestimated_count();
            match self.get(next).await {
                Ok(_) => continue,
                Err(Error::IndexOutOfRange { .. }) => return Ok(self.loaded_items()),
                Err(e) => return Err(e),
            }
        }
    }
}

impl<T> fmt::Debug for NetworkPagedCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.pager.state.lock();
        f.debug_struct("NetworkPagedCollection")
            .field("items", &state.items.len())
            .field("cursor", &state.cursor)
            .field("in_progress", &state.in_progress.len())
            .finish()
    }
}
