// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! The application event bus.

use crate::config::EventBusConfig;
use crate::events::{FileChangedEvent, SessionSnapshot};
use cull_pubsub::{Error, InMemoryTopic, Subscription, TopicDisposer, TopicOptions};
use futures::Stream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Session and file-change topics behind one handle.
///
/// Cloning shares both topics. Each topic has its own ring and shards, so a
/// burst of file changes never pushes session updates out of a slow
/// subscriber's window.
pub struct EventBus<S, F = FileChangedEvent> {
    sessions: InMemoryTopic<S>,
    file_changes: InMemoryTopic<F>,
    disposers: Arc<[TopicDisposer; 2]>,
}

impl<S, F> Clone for EventBus<S, F> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            file_changes: self.file_changes.clone(),
            disposers: Arc::clone(&self.disposers),
        }
    }
}

impl<S, F> EventBus<S, F>
where
    S: SessionSnapshot + Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
{
    /// Starts both topics.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(config: &EventBusConfig) -> Result<Self, Error> {
        let errors = config.validation_errors("event_bus");
        if !errors.is_empty() {
            return Err(Error::InvalidOptions {
                reason: errors.join("; "),
            });
        }
        let (sessions, session_disposer) =
            InMemoryTopic::try_new(TopicOptions::try_from(config.session.clone())?)?;
        let (file_changes, file_disposer) =
            InMemoryTopic::try_new(TopicOptions::try_from(config.file_changed.clone())?)?;
        debug!(
            session_capacity = config.session.capacity,
            file_changed_capacity = config.file_changed.capacity,
            "event bus started"
        );
        Ok(Self {
            sessions,
            file_changes,
            disposers: Arc::new([session_disposer, file_disposer]),
        })
    }

    /// Publishes a session snapshot.
    pub async fn publish_session(&self, ctx: &CancellationToken, snapshot: S) -> Result<(), Error> {
        self.sessions.publish(ctx, snapshot).await
    }

    /// Subscribes to every session snapshot published from now on.
    #[must_use]
    pub fn subscribe_session(&self, ctx: CancellationToken) -> Subscription<S> {
        self.sessions.subscribe(ctx)
    }

    /// Publishes a file change.
    pub async fn publish_file_changed(&self, ctx: &CancellationToken, event: F) -> Result<(), Error> {
        self.file_changes.publish(ctx, event).await
    }

    /// Subscribes to every file change published from now on.
    #[must_use]
    pub fn subscribe_file_changed(&self, ctx: CancellationToken) -> Subscription<F> {
        self.file_changes.subscribe(ctx)
    }

    /// Snapshots of one session, for push subscriptions.
    ///
    /// Gaps are skipped: a consumer only needs the latest snapshot. The
    /// stream ends silently when `ctx` is cancelled, and yields any other
    /// terminal error once before ending.
    pub fn session_updates(
        &self,
        ctx: CancellationToken,
        session_id: &str,
    ) -> impl Stream<Item = Result<S, Error>> + Send + use<S, F> {
        let session_id: Arc<str> = Arc::from(session_id);
        let subscription = self.sessions.subscribe(ctx);
        futures::stream::unfold(Some(subscription), move |state| {
            let session_id = Arc::clone(&session_id);
            async move {
                let mut subscription = state?;
                loop {
                    match subscription.recv().await? {
                        Ok(delivery) => {
                            if let Some(dropped) = delivery.undelivered() {
                                debug!(%session_id, dropped, "session updates skipped");
                            }
                            let snapshot = delivery.into_value();
                            if snapshot.session_id() == &*session_id {
                                return Some((Ok(snapshot), Some(subscription)));
                            }
                        }
                        Err(Error::Cancelled) => return None,
                        Err(err) => return Some((Err(err), None)),
                    }
                }
            }
        })
    }

    /// Disposes both topics. Idempotent.
    pub fn dispose(&self) {
        if !self.is_disposed() {
            debug!("event bus disposed");
        }
        for disposer in self.disposers.iter() {
            disposer.dispose();
        }
    }

    /// Returns `true` once both topics are disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposers.iter().all(TopicDisposer::is_disposed)
    }
}

impl<S, F> std::fmt::Debug for EventBus<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sessions", &self.sessions)
            .field("file_changes", &self.file_changes)
            .finish()
    }
}
