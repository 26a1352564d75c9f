// tests/common/mod.rs
//! Common test utilities for outbox and streaming integration tests.

#![allow(dead_code)]

pub mod mock_directory;
pub mod mock_inbox;

pub use mock_directory::MockDirectory;
pub use mock_inbox::MockInbox;
