//! Self-hosted feed reader backend: subscription management, concurrent
//! feed refresh, and entry storage on SQLite.

pub mod config;
pub mod feed;
pub mod storage;
