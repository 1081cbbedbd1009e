// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! Application event bus of the culling backend.
//!
//! Session snapshots and file-system changes each travel on their own
//! [`cull_pubsub::InMemoryTopic`]. Producers (the session service, the file
//! watcher) publish; the push-subscription layer consumes through
//! [`EventBus::session_updates`].

pub mod bus;
pub mod config;
pub mod events;

pub use bus::EventBus;
pub use config::EventBusConfig;
pub use cull_pubsub::Error;
pub use events::{FileChangeKind, FileChangedEvent, SessionSnapshot};
