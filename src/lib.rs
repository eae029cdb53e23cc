pub mod batch;
pub mod cache;
pub mod checkpoint;
pub mod chemistry;
pub mod circuit;
pub mod client;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod merge;
pub mod model;
pub mod output;
pub mod providers;
pub mod rate_limit;
pub mod retry;
pub mod source;
pub mod stats;
pub mod store;
pub mod validate;
