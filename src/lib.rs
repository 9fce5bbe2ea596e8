pub mod cli;
pub mod collections;
pub mod config;
pub mod error;
pub mod feed;
pub mod http;
pub mod service;
pub mod storage;
pub mod subscription;

pub use config::Config;
pub use error::{Error, Result};
pub use subscription::{Publisher, Subscription};
