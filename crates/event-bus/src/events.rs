// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! Payloads carried by the bus.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A session state snapshot published on every session change.
///
/// Snapshots travel by value through a topic, so implementors are usually an
/// `Arc` around the session state.
pub trait SessionSnapshot {
    /// Identifier of the session this snapshot belongs to.
    fn session_id(&self) -> &str;
}

impl<S: SessionSnapshot + ?Sized> SessionSnapshot for Arc<S> {
    fn session_id(&self) -> &str {
        (**self).session_id()
    }
}

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    /// The file appeared.
    Created,
    /// The file content changed.
    Modified,
    /// The file was deleted.
    Removed,
    /// The file was renamed away; a `Created` follows for the new name when
    /// it stays inside the watched tree.
    Renamed,
}

/// A file-system change observed under the library root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangedEvent {
    path: PathBuf,
    kind: FileChangeKind,
}

impl FileChangedEvent {
    /// Creates an event for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, kind: FileChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Path of the changed file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Kind of change.
    #[must_use]
    pub fn kind(&self) -> FileChangeKind {
        self.kind
    }
}
