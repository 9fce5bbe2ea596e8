use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::{Predicate, Record, RecordStore, SortKey};

pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Turns a stored record into a collection element.
pub type Conversion<T> = Arc<dyn Fn(&Record) -> Result<T> + Send + Sync>;

struct StoreQuery<T> {
    store: Arc<dyn RecordStore>,
    kind: String,
    predicate: Predicate,
    sort: Vec<SortKey>,
    convert: Conversion<T>,
}

impl<T> Clone for StoreQuery<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            kind: self.kind.clone(),
            predicate: self.predicate.clone(),
            sort: self.sort.clone(),
            convert: Arc::clone(&self.convert),
        }
    }
}

impl<T> StoreQuery<T> {
    fn same_source(&self, other: &StoreQuery<T>) -> bool {
        Arc::ptr_eq(&self.store, &other.store) && self.kind == other.kind && self.sort == other.sort
    }

    fn records(&self) -> Result<Vec<Record>> {
        self.store.query(&self.kind, &self.predicate, &self.sort)
    }
}

#[derive(Clone)]
enum Backing<T> {
    Array,
    Store(StoreQuery<T>),
}

#[derive(Clone)]
struct Materialized<T> {
    /// Array-backed: every element. Store-backed: the loaded prefix.
    objects: Vec<T>,
    /// Store-backed only: elements appended after construction.
    appended: Vec<T>,
    /// Store-backed only: cached row count of the query.
    total: Option<usize>,
}

/// An ordered collection over either an in-memory vector or a store query.
///
/// Store-backed instances load their elements lazily, one batch at a time,
/// and remember how many rows the query matches. Interior mutability keeps
/// reads on `&self`, so the type is `Send` but not `Sync`.
pub struct DataStoreBackedArray<T> {
    backing: Backing<T>,
    batch_size: usize,
    state: RefCell<Materialized<T>>,
}

impl<T: Clone> DataStoreBackedArray<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            backing: Backing::Array,
            batch_size: DEFAULT_BATCH_SIZE,
            state: RefCell::new(Materialized {
                objects: items,
                appended: Vec::new(),
                total: None,
            }),
        }
    }

    pub fn from_store<F>(
        store: Arc<dyn RecordStore>,
        kind: impl Into<String>,
        predicate: Predicate,
        sort: Vec<SortKey>,
        convert: F,
    ) -> Self
    where
        F: Fn(&Record) -> Result<T> + Send + Sync + 'static,
    {
        Self::with_query(StoreQuery {
            store,
            kind: kind.into(),
            predicate,
            sort,
            convert: Arc::new(convert),
        })
    }

    fn with_query(query: StoreQuery<T>) -> Self {
        Self {
            backing: Backing::Store(query),
            batch_size: DEFAULT_BATCH_SIZE,
            state: RefCell::new(Materialized {
                objects: Vec::new(),
                appended: Vec::new(),
                total: None,
            }),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_store_backed(&self) -> bool {
        matches!(self.backing, Backing::Store(_))
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        match &self.backing {
            Backing::Store(query) => Some(&query.predicate),
            Backing::Array => None,
        }
    }

    pub fn sort_keys(&self) -> &[SortKey] {
        match &self.backing {
            Backing::Store(query) => &query.sort,
            Backing::Array => &[],
        }
    }

    /// Number of elements excluding the appended buffer.
    fn internal_count(&self) -> Result<usize> {
        match &self.backing {
            Backing::Array => Ok(self.state.borrow().objects.len()),
            Backing::Store(query) => {
                if let Some(total) = self.state.borrow().total {
                    return Ok(total);
                }
                let total = query.store.count(&query.kind, &query.predicate)?;
                self.state.borrow_mut().total = Some(total);
                Ok(total)
            }
        }
    }

    pub fn count(&self) -> Result<usize> {
        let internal = self.internal_count()?;
        Ok(internal + self.state.borrow().appended.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    /// Elements currently held in memory.
    pub fn loaded_count(&self) -> usize {
        let state = self.state.borrow();
        state.objects.len() + state.appended.len()
    }

    pub fn get(&self, index: usize) -> Result<Option<T>> {
        if let Some(item) = self.state.borrow().objects.get(index) {
            return Ok(Some(item.clone()));
        }

        let internal = self.internal_count()?;
        if index < internal {
            self.fetch_up_to(index)?;
            if let Some(item) = self.state.borrow().objects.get(index) {
                return Ok(Some(item.clone()));
            }
        }

        let internal = self.internal_count()?;
        Ok(index
            .checked_sub(internal)
            .and_then(|offset| self.state.borrow().appended.get(offset).cloned()))
    }

    pub fn first(&self) -> Result<Option<T>> {
        self.get(0)
    }

    pub fn last(&self) -> Result<Option<T>> {
        match self.count()? {
            0 => Ok(None),
            count => self.get(count - 1),
        }
    }

    /// Load whole batches from the store until `position` is materialized.
    fn fetch_up_to(&self, position: usize) -> Result<()> {
        let Backing::Store(query) = &self.backing else {
            return Ok(());
        };

        let records = query.records()?;
        let start = self.state.borrow().objects.len();
        let end = if position < start {
            start
        } else {
            let batches = (position - start) / self.batch_size + 1;
            records.len().min(start + batches * self.batch_size)
        };

        let batch = records
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|record| (query.convert)(record))
            .collect::<Result<Vec<T>>>()?;

        debug!(
            "Loaded {} {} records ({}..{} of {})",
            batch.len(),
            query.kind,
            start,
            end,
            records.len()
        );

        let mut state = self.state.borrow_mut();
        state.objects.extend(batch);
        state.total = Some(records.len());
        Ok(())
    }

    fn materialize(&self) -> Result<()> {
        let internal = self.internal_count()?;
        if internal > self.state.borrow().objects.len() {
            self.fetch_up_to(internal - 1)?;
        }
        Ok(())
    }

    /// Every element, loading whatever is not in memory yet.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.materialize()?;
        let state = self.state.borrow();
        Ok(state.objects.iter().chain(state.appended.iter()).cloned().collect())
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter { array: self, index: 0 }
    }

    /// Add an element. Store-backed arrays keep it in memory only.
    pub fn append(&mut self, item: T) {
        let state = self.state.get_mut();
        match self.backing {
            Backing::Array => state.objects.push(item),
            Backing::Store(_) => state.appended.push(item),
        }
    }

    /// Concatenation. Store-backed arrays over the same store, kind and sort
    /// order merge into one query instead.
    pub fn combine(&self, other: &DataStoreBackedArray<T>) -> Result<Self> {
        if let (Backing::Store(mine), Backing::Store(theirs)) = (&self.backing, &other.backing) {
            if mine.same_source(theirs) {
                let mut query = mine.clone();
                query.predicate = mine.predicate.clone().or(theirs.predicate.clone());
                return Ok(Self::with_query(query).with_batch_size(self.batch_size));
            }
        }

        let mut items = self.to_vec()?;
        items.extend(other.to_vec()?);
        Ok(Self::new(items).with_batch_size(self.batch_size))
    }
}

impl<T: Clone + Serialize> DataStoreBackedArray<T> {
    /// Narrow the collection. Store-backed arrays stay lazy; array-backed
    /// ones are filtered right away.
    pub fn filter_with_predicate(&self, predicate: Predicate) -> Result<Self> {
        match &self.backing {
            Backing::Store(query) => {
                let mut query = query.clone();
                query.predicate = query.predicate.and(predicate);
                Ok(Self::with_query(query).with_batch_size(self.batch_size))
            }
            Backing::Array => {
                let items = self
                    .to_vec()?
                    .into_iter()
                    .filter(|item| predicate.matches(item))
                    .collect();
                Ok(Self::new(items).with_batch_size(self.batch_size))
            }
        }
    }
}

impl<T: Clone + PartialEq> DataStoreBackedArray<T> {
    /// Remove the first element equal to `item`, deleting the underlying
    /// record for store-backed arrays. Returns whether anything was removed.
    pub fn remove(&mut self, item: &T) -> Result<bool> {
        {
            let state = self.state.get_mut();
            if let Some(position) = state.appended.iter().position(|x| x == item) {
                state.appended.remove(position);
                return Ok(true);
            }
        }

        self.materialize()?;
        let Some(position) = self.state.get_mut().objects.iter().position(|x| x == item) else {
            return Ok(false);
        };

        if let Backing::Store(query) = &self.backing {
            let records = query.records()?;
            match records.get(position) {
                Some(record) => query.store.delete(record)?,
                None => warn!("No {} record at position {} to delete", query.kind, position),
            }
        }

        let state = self.state.get_mut();
        state.objects.remove(position);
        if let Some(total) = state.total.as_mut() {
            *total = total.saturating_sub(1);
        }
        Ok(true)
    }
}

impl<T: Clone> Default for DataStoreBackedArray<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<T: Clone> From<Vec<T>> for DataStoreBackedArray<T> {
    fn from(items: Vec<T>) -> Self {
        Self::new(items)
    }
}

impl<T: Clone> Clone for DataStoreBackedArray<T> {
    fn clone(&self) -> Self {
        Self {
            backing: self.backing.clone(),
            batch_size: self.batch_size,
            state: RefCell::new(self.state.borrow().clone()),
        }
    }
}

impl<T: Clone + PartialEq> PartialEq for DataStoreBackedArray<T> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.backing, &other.backing) {
            (Backing::Store(mine), Backing::Store(theirs)) => {
                mine.same_source(theirs)
                    && mine.predicate == theirs.predicate
                    && matches!((self.count(), other.count()), (Ok(a), Ok(b)) if a == b)
            }
            _ => matches!((self.to_vec(), other.to_vec()), (Ok(a), Ok(b)) if a == b),
        }
    }
}

impl<T> fmt::Debug for DataStoreBackedArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        let mut debug = f.debug_struct("DataStoreBackedArray");
        match &self.backing {
            Backing::Array => debug.field("backing", &"array"),
            Backing::Store(query) => debug
                .field("kind", &query.kind)
                .field("predicate", &query.predicate)
                .field("sort", &query.sort),
        };
        debug
            .field("loaded", &state.objects.len())
            .field("appended", &state.appended.len())
            .field("total", &state.total)
            .finish()
    }
}

/// Iterates by index; a store failure ends the iteration early.
pub struct Iter<'a, T> {
    array: &'a DataStoreBackedArray<T>,
    index: usize,
}

impl<'a, T: Clone> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        match self.array.get(self.index) {
            Ok(Some(item)) => {
                self.index += 1;
                Some(item)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Stopping iteration at {}: {}", self.index, e);
                None
            }
        }
    }
}

impl<'a, T: Clone> IntoIterator for &'a DataStoreBackedArray<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
