// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! Benchmarks for the in-memory topic live under `benches/`.
