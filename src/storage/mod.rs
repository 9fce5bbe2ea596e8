pub mod predicate;
pub mod repository;
pub mod traits;

pub use predicate::{Predicate, SortKey};
pub use repository::{
    ArticleRepository, CachePolicy, FeedRepository, RepositoryStats, RequestCache, SharedResult,
};
pub use traits::{MemoryRecordStore, Record, RecordStore};
