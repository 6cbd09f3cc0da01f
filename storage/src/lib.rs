// Copyright 2024 The Coder Aggregator Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The storage adapters serving Coder workspaces and templates as
//! namespaced cluster resources.
//!
//! The backend is the only source of truth: every operation converts fresh
//! backend responses, and mutations are fanned out to watchers through a
//! per-store [`watch::Broadcaster`].

pub mod context;
pub mod convert;
pub mod error;
pub mod naming;
pub mod options;
pub mod provider;
pub mod rest;
pub mod source;
pub mod template;
pub mod watch;
pub mod workspace;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use context::RequestContext;
pub use error::{Error, Result};
pub use options::ListOptions;
pub use rest::{DeleteOutcome, ObjectList, Storage, UpdateFn};
pub use template::TemplateStore;
pub use watch::{WatchEvent, Watcher};
pub use workspace::WorkspaceStore;
