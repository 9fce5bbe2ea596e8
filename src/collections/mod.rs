//! Lazily materialized collections.

pub mod data_store_array;
pub mod paged;

pub use data_store_array::{Conversion, DataStoreBackedArray, Iter, DEFAULT_BATCH_SIZE};
pub use paged::{NetworkPagedCollection, PageCursor, PageParser, PagedIndex, RequestFactory};
