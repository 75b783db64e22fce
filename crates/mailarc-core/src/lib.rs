//! mailarc Core Library
//!
//! Mirrors IMAP accounts into a content-addressed file store and keeps a
//! full-text index of the archived messages for search.

pub mod config;
pub mod error;
pub mod index;
pub mod models;
pub mod search;
pub mod store;
pub mod sync;

pub use config::Config;
pub use error::{Error, Result};
pub use models::*;

/// Application name for config paths
pub const APP_NAME: &str = "mailarc";
