//! Cross-module scenarios driven through [`crate::Hub`].

use std::sync::Arc;

use crate::clock::ManualClock;
use crate::config::HubConfig;
use crate::db::Database;
use crate::testing::{FakeDirectory, FakeInbox};
use crate::Hub;


pub struct TestHub {
    pub hub: Hub,
    pub directory: Arc<FakeDirectory>,
    pub inbox: Arc<FakeInbox>,
    pub clock: ManualClock,
}

/// A hub over in-memory storage with a manual clock.
pub fn test_hub() -> TestHub {
    let clock = ManualClock::starting_now();
    let directory = Arc::new(FakeDirectory::default());
    let inbox = Arc::new(FakeInbox::default());
    let hub = Hub::with_memory_store(
        HubConfig::default(),
        Arc::new(Database::open_in_memory().expect("in-memory DB")),
        directory.clone(),
        inbox.clone(),
        Arc::new(clock.clone()),
    );
    TestHub {
        hub,
        directory,
        inbox,
        clock,
    }
}
