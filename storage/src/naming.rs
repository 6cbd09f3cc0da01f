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

//! Composite resource names.
//!
//! Templates are named `<organization>.<template>` and workspaces
//! `<organization>.<user>.<workspace>`. Backend names never contain a dot,
//! which makes the encoding unambiguous.

use std::fmt::Display;

use thiserror::Error;

use crate::error::Error;

pub const SEPARATOR: char = '.';

pub const TEMPLATE_SEGMENTS: usize = 2;
pub const WORKSPACE_SEGMENTS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NameError {
    #[error("invalid name {name:?}: expected {expected} non-empty segments separated by '.'")]
    WrongArity { name: String, expected: usize },

    #[error("invalid name {name:?}: segments must not be empty")]
    EmptySegment { name: String },
}

impl From<NameError> for Error {
    fn from(err: NameError) -> Self {
        Error::BadRequest(err.to_string())
    }
}

/// Splits `name` into exactly `expected` non-empty segments.
pub fn parse(name: &str, expected: usize) -> Result<Vec<&str>, NameError> {
    // Counting separators first tells a wrong arity apart from an empty segment.
    if expected == 0 || name.matches(SEPARATOR).count() != expected - 1 {
        return Err(NameError::WrongArity { name: name.to_string(), expected });
    }

    let segments: Vec<&str> = name.split(SEPARATOR).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(NameError::EmptySegment { name: name.to_string() });
    }

    Ok(segments)
}

/// Joins segments into a composite name.
///
/// # Panics
///
/// Panics when a segment is empty or contains the separator, which is a
/// programming error on the caller's side.
pub fn build(segments: &[&str]) -> String {
    for segment in segments {
        assert!(is_valid_segment(segment), "invalid name segment {:?} in {:?}", segment, segments);
    }
    segments.join(".")
}

pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains(SEPARATOR)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateName {
    pub organization: String,
    pub template: String,
}

impl TemplateName {
    pub fn parse(name: &str) -> Result<Self, NameError> {
        let segments = parse(name, TEMPLATE_SEGMENTS)?;
        Ok(TemplateName { organization: segments[0].to_string(), template: segments[1].to_string() })
    }

    /// Builds the name from backend values, `None` if they cannot form one.
    pub fn from_parts(organization: &str, template: &str) -> Option<Self> {
        (is_valid_segment(organization) && is_valid_segment(template))
            .then(|| TemplateName { organization: organization.to_string(), template: template.to_string() })
    }
}

impl Display for TemplateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&build(&[&self.organization, &self.template]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceName {
    pub organization: String,
    pub owner: String,
    pub workspace: String,
}

impl WorkspaceName {
    pub fn parse(name: &str) -> Result<Self, NameError> {
        let segments = parse(name, WORKSPACE_SEGMENTS)?;
        Ok(WorkspaceName {
            organization: segments[0].to_string(),
            owner: segments[1].to_string(),
            workspace: segments[2].to_string(),
        })
    }

    pub fn from_parts(organization: &str, owner: &str, workspace: &str) -> Option<Self> {
        (is_valid_segment(organization) && is_valid_segment(owner) && is_valid_segment(workspace)).then(|| {
            WorkspaceName {
                organization: organization.to_string(),
                owner: owner.to_string(),
                workspace: workspace.to_string(),
            }
        })
    }
}

impl Display for WorkspaceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&build(&[&self.organization, &self.owner, &self.workspace]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for name in ["acme.docker", "default.kubernetes-dev"] {
            assert_eq!(TemplateName::parse(name).unwrap().to_string(), name);
        }
        for name in ["acme.alice.dev", "default.bob.my-workspace"] {
            assert_eq!(WorkspaceName::parse(name).unwrap().to_string(), name);
        }
    }

    #[test]
    fn test_wrong_arity() {
        for name in ["acme", "acme.alice.dev", ""] {
            assert!(matches!(TemplateName::parse(name), Err(NameError::WrongArity { .. })), "{}", name);
        }
        for name in ["acme.alice", "acme.alice.dev.x"] {
            assert!(matches!(WorkspaceName::parse(name), Err(NameError::WrongArity { .. })), "{}", name);
        }
    }

    #[test]
    fn test_empty_segment() {
        for name in [".docker", "acme.", "."] {
            assert!(matches!(TemplateName::parse(name), Err(NameError::EmptySegment { .. })), "{}", name);
        }
        assert!(matches!(WorkspaceName::parse("acme..dev"), Err(NameError::EmptySegment { .. })));
    }

    #[test]
    fn test_parse_errors_are_bad_requests() {
        let err: Error = TemplateName::parse("nodots").unwrap_err().into();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_from_parts_rejects_invalid_segments() {
        assert!(TemplateName::from_parts("", "docker").is_none());
        assert!(WorkspaceName::from_parts("acme", "al.ice", "dev").is_none());
        assert_eq!(WorkspaceName::from_parts("acme", "alice", "dev").unwrap().to_string(), "acme.alice.dev");
    }

    #[test]
    #[should_panic(expected = "invalid name segment")]
    fn test_build_panics_on_dotted_segment() {
        build(&["acme", "a.b"]);
    }
}
