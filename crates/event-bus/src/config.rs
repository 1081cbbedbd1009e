// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! Bus configuration: one topic section per event family.

use cull_pubsub::TopicConfig;
use serde::{Deserialize, Serialize};

/// Topic settings for every bus topic.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EventBusConfig {
    /// Session snapshot topic.
    #[serde(default)]
    pub session: TopicConfig,
    /// File-change topic.
    #[serde(default)]
    pub file_changed: TopicConfig,
}

impl EventBusConfig {
    /// Returns validation errors of both topics, prefixed with their section.
    #[must_use]
    pub fn validation_errors(&self, path_prefix: &str) -> Vec<String> {
        let mut errors = self
            .session
            .validation_errors(&format!("{path_prefix}.session"));
        errors.extend(
            self.file_changed
                .validation_errors(&format!("{path_prefix}.file_changed")),
        );
        errors
    }
}
