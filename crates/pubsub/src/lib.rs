// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! Self-scaling, shard-dispatched in-memory topics.
//!
//! A topic fans events out from many concurrent publishers to many long-lived
//! subscribers with latest-only semantics: every subscriber sees the events
//! published after it subscribed, in order, unless it falls more than the
//! ring capacity behind, in which case it is told how many it missed.
//!
//! ```no_run
//! use cull_pubsub::{InMemoryTopic, TopicOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), cull_pubsub::Error> {
//! let (topic, disposer) = InMemoryTopic::<u64>::new(TopicOptions::default());
//! let ctx = CancellationToken::new();
//! let mut events = topic.subscribe(ctx.clone());
//! topic.publish(&ctx, 42).await?;
//! while let Some(item) = events.recv().await {
//!     let delivery = item?;
//!     if let Some(dropped) = delivery.undelivered() {
//!         eprintln!("missed {dropped} events");
//!     }
//!     println!("{}", delivery.value());
//! }
//! disposer.dispose();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod options;
mod topic;

pub use config::TopicConfig;
pub use error::Error;
pub use options::TopicOptions;
pub use topic::{
    Delivery, EventStream, InMemoryTopic, MAX_INLINE_PAYLOAD, PublishFuture, Subscription, Topic,
    TopicDisposer, TopicStats,
};
