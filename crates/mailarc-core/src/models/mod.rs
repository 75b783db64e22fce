//! Data models for mailarc
//!
//! Core data structures for mailboxes, archived messages and index documents.

mod document;
mod mailbox;
mod message;

pub use document::*;
pub use mailbox::*;
pub use message::*;
