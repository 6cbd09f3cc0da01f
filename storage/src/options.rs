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

//! List and watch options, label and field selectors.

use std::collections::BTreeSet;
use std::time::Duration;

use kube::Resource;
use serde::Deserialize;

use crate::error::{Error, Result};

pub const FIELD_NAME: &str = "metadata.name";
pub const FIELD_NAMESPACE: &str = "metadata.namespace";

const RESOURCE_VERSION_MATCH_NOT_OLDER_THAN: &str = "NotOlderThan";

/// Query parameters accepted by list and watch requests.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub resource_version: Option<String>,
    pub resource_version_match: Option<String>,
    pub watch: Option<bool>,
    pub timeout_seconds: Option<u64>,
    pub send_initial_events: Option<bool>,
    pub allow_watch_bookmarks: Option<bool>,
}

impl ListOptions {
    pub fn is_watch(&self) -> bool {
        self.watch.unwrap_or(false)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.filter(|seconds| *seconds > 0).map(Duration::from_secs)
    }

    /// Rejects watch options the adapter cannot honour. Initial events and
    /// resource version matching need a history the backend does not keep.
    pub fn validate_watch(&self) -> Result<()> {
        if self.send_initial_events == Some(true) {
            return Err(Error::bad_request("sendInitialEvents=true is not supported"));
        }

        match self.resource_version_match.as_deref() {
            None | Some("") => Ok(()),
            Some(RESOURCE_VERSION_MATCH_NOT_OLDER_THAN)
                if self.send_initial_events == Some(false)
                    && matches!(self.resource_version.as_deref(), None | Some("") | Some("0")) =>
            {
                // Older clients send this combination as their default.
                Ok(())
            }
            Some(other) => Err(Error::bad_request(format!("resourceVersionMatch {:?} is not supported for watch", other))),
        }
    }
}

/// The filter derived from label and field selectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    labels: LabelSelector,
    fields: FieldSelector,
}

impl Predicate {
    pub fn from_options(options: &ListOptions) -> Result<Predicate> {
        Ok(Predicate {
            labels: LabelSelector::parse(options.label_selector.as_deref().unwrap_or_default())?,
            fields: FieldSelector::parse(options.field_selector.as_deref().unwrap_or_default())?,
        })
    }

    pub fn matches<K: Resource>(&self, object: &K) -> bool {
        let meta = object.meta();
        let labels = meta.labels.as_ref();
        self.labels.matches(|key| labels.and_then(|labels| labels.get(key)).map(String::as_str))
            && self.fields.matches(meta.name.as_deref().unwrap_or_default(), meta.namespace.as_deref().unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    NotExists(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn parse(selector: &str) -> Result<LabelSelector> {
        let mut requirements = vec![];
        for term in split_terms(selector) {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            requirements.push(parse_requirement(term)?);
        }
        Ok(LabelSelector { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches<'a>(&self, label: impl Fn(&str) -> Option<&'a str>) -> bool {
        self.requirements.iter().all(|requirement| match requirement {
            Requirement::Equals(key, value) => label(key) == Some(value.as_str()),
            Requirement::NotEquals(key, value) => label(key) != Some(value.as_str()),
            Requirement::In(key, values) => label(key).map(|v| values.contains(v)).unwrap_or(false),
            Requirement::NotIn(key, values) => label(key).map(|v| !values.contains(v)).unwrap_or(true),
            Requirement::Exists(key) => label(key).is_some(),
            Requirement::NotExists(key) => label(key).is_none(),
        })
    }
}

/// Splits on commas that are not inside a parenthesised value set.
fn split_terms(selector: &str) -> Vec<&str> {
    let mut terms = vec![];
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&selector[start..]);
    terms
}

fn parse_requirement(term: &str) -> Result<Requirement> {
    let invalid = || Error::bad_request(format!("unable to parse requirement {:?} of label selector", term));

    if let Some(key) = term.strip_prefix('!') {
        return Ok(Requirement::NotExists(label_key(key.trim()).ok_or_else(invalid)?));
    }
    if let Some((key, values)) = term.split_once(" notin ") {
        return Ok(Requirement::NotIn(label_key(key.trim()).ok_or_else(invalid)?, value_set(values).ok_or_else(invalid)?));
    }
    if let Some((key, values)) = term.split_once(" in ") {
        return Ok(Requirement::In(label_key(key.trim()).ok_or_else(invalid)?, value_set(values).ok_or_else(invalid)?));
    }
    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals(label_key(key.trim()).ok_or_else(invalid)?, value.trim().to_string()));
    }
    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        return Ok(Requirement::Equals(label_key(key.trim()).ok_or_else(invalid)?, value.trim().to_string()));
    }

    Ok(Requirement::Exists(label_key(term).ok_or_else(invalid)?))
}

fn label_key(key: &str) -> Option<String> {
    let valid = !key.is_empty()
        && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    valid.then(|| key.to_string())
}

fn value_set(values: &str) -> Option<BTreeSet<String>> {
    let values = values.trim().strip_prefix('(')?.strip_suffix(')')?;
    Some(values.split(',').map(|value| value.trim().to_string()).filter(|value| !value.is_empty()).collect())
}

#[derive(Debug, Clone, PartialEq)]
struct FieldRequirement {
    field: String,
    value: String,
    negated: bool,
}

/// Field selector restricted to `metadata.name` and `metadata.namespace`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSelector {
    requirements: Vec<FieldRequirement>,
}

impl FieldSelector {
    pub fn parse(selector: &str) -> Result<FieldSelector> {
        let mut requirements = vec![];
        for term in selector.split(',').map(str::trim).filter(|term| !term.is_empty()) {
            let (field, value, negated) = if let Some((field, value)) = term.split_once("!=") {
                (field, value, true)
            } else if let Some((field, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
                (field, value, false)
            } else {
                return Err(Error::bad_request(format!("invalid field selector {:?}", term)));
            };

            let field = field.trim();
            if field != FIELD_NAME && field != FIELD_NAMESPACE {
                return Err(Error::bad_request(format!(
                    "field selector {:?} is not supported: supported fields are {}, {}",
                    field, FIELD_NAME, FIELD_NAMESPACE
                )));
            }
            requirements.push(FieldRequirement { field: field.to_string(), value: value.trim().to_string(), negated });
        }
        Ok(FieldSelector { requirements })
    }

    pub fn matches(&self, name: &str, namespace: &str) -> bool {
        self.requirements.iter().all(|requirement| {
            let actual = if requirement.field == FIELD_NAME { name } else { namespace };
            (actual == requirement.value) != requirement.negated
        })
    }
}
