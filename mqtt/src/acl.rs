//! Topic permission rules.
//!
//! A [`PermissionRegistry`] is an ordered list of [`TopicRule`]s built once
//! from configuration. A topic is allowed for a permission when **any** rule
//! whose pattern matches it grants that permission: permissions are the union
//! across matching rules. There is no most-specific-wins ordering and no
//! deny rule; a deployment that needs deny-overrides cannot express it here.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::topic::{self, MULTI_LEVEL, SINGLE_LEVEL};

/// Operation class a rule can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Subscribe, read, and receive query responses.
    Read,
    /// Publish, including query requests.
    Write,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Read => write!(f, "read"),
            Permission::Write => write!(f, "write"),
        }
    }
}

/// A topic pattern and the permissions it grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRule {
    /// MQTT topic pattern (supports `+` and `#` wildcards).
    pub pattern: String,
    /// Allowed permissions.
    pub permissions: BTreeSet<Permission>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TopicRule {
    /// Create a new rule.
    pub fn new(pattern: impl Into<String>, permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            pattern: pattern.into(),
            permissions: permissions.into_iter().collect(),
            description: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether this rule grants `permission`.
    pub fn grants(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        topic::validate_filter(&self.pattern)?;
        if self.permissions.is_empty() {
            return Err(format!("'{}': at least one permission must be specified", self.pattern));
        }
        Ok(())
    }
}

/// Read-only view of a rule for discovery.
#[derive(Debug, Clone, Serialize)]
pub struct RuleInfo {
    pub pattern: String,
    pub permissions: Vec<Permission>,
    pub description: String,
}

/// Example topics for one rule.
#[derive(Debug, Clone, Serialize)]
pub struct RuleExamples {
    pub pattern: String,
    pub permissions: Vec<Permission>,
    pub description: String,
    pub examples: Vec<TopicExample>,
}

/// A concrete topic accepted by a rule.
#[derive(Debug, Clone, Serialize)]
pub struct TopicExample {
    pub topic: String,
    pub usage: String,
}

/// Legend for the two wildcards.
pub const WILDCARD_LEGEND: [(&str, &str); 2] = [
    (SINGLE_LEVEL, "Single-level wildcard (matches one topic level)"),
    (MULTI_LEVEL, "Multi-level wildcard (matches multiple topic levels, must be last)"),
];

const NO_DESCRIPTION: &str = "No description provided";

/// Ordered, immutable set of topic rules.
#[derive(Debug, Clone)]
pub struct PermissionRegistry {
    rules: Vec<TopicRule>,
}

impl PermissionRegistry {
    /// Build a registry, rejecting it if any rule is invalid.
    ///
    /// The returned [`Error::Configuration`] lists every invalid rule, not
    /// just the first.
    pub fn new(rules: Vec<TopicRule>) -> Result<Self> {
        let problems: Vec<String> = rules
            .iter()
            .enumerate()
            .filter_map(|(i, rule)| rule.validate().err().map(|e| format!("topics[{i}]: {e}")))
            .collect();

        if !problems.is_empty() {
            return Err(Error::Configuration(problems));
        }

        Ok(Self { rules })
    }

    /// Whether `topic` (a topic name or a filter) is allowed for `permission`.
    pub fn is_allowed(&self, topic: &str, permission: Permission) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.grants(permission) && topic::matches(&rule.pattern, topic))
    }

    /// Like [`is_allowed`](Self::is_allowed) but returns `PermissionDenied`.
    pub fn check(&self, topic: &str, permission: Permission) -> Result<()> {
        if self.is_allowed(topic, permission) {
            return Ok(());
        }
        debug!(topic, %permission, "permission denied");
        Err(Error::PermissionDenied {
            topic: topic.to_string(),
            permission,
        })
    }

    /// Rules whose pattern matches `topic`, in configuration order.
    pub fn matching_rules<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a TopicRule> + 'a {
        self.rules
            .iter()
            .filter(move |rule| topic::matches(&rule.pattern, topic))
    }

    /// All rules in configuration order.
    pub fn rules(&self) -> &[TopicRule] {
        &self.rules
    }

    /// Discovery view of the configured rules.
    pub fn describe(&self) -> Vec<RuleInfo> {
        self.rules
            .iter()
            .map(|rule| RuleInfo {
                pattern: rule.pattern.clone(),
                permissions: rule.permissions.iter().copied().collect(),
                description: description_of(rule),
            })
            .collect()
    }

    /// One illustrative concrete topic per rule.
    pub fn examples(&self) -> Vec<RuleExamples> {
        self.rules
            .iter()
            .map(|rule| RuleExamples {
                pattern: rule.pattern.clone(),
                permissions: rule.permissions.iter().copied().collect(),
                description: description_of(rule),
                examples: vec![example_for(&rule.pattern)],
            })
            .collect()
    }
}

fn description_of(rule: &TopicRule) -> String {
    rule.description
        .clone()
        .unwrap_or_else(|| NO_DESCRIPTION.to_string())
}

fn example_for(pattern: &str) -> TopicExample {
    let topic = pattern
        .split('/')
        .map(|level| match level {
            SINGLE_LEVEL => "example",
            MULTI_LEVEL => "subtopic/data",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("/");

    let usage = match (pattern.contains(SINGLE_LEVEL), pattern.contains(MULTI_LEVEL)) {
        (true, true) => format!(
            "This matches the pattern '{pattern}' where + is replaced with 'example' and # matches multiple levels"
        ),
        (true, false) => {
            format!("This matches the pattern '{pattern}' where + is replaced with 'example'")
        }
        (false, true) => {
            format!("This matches the pattern '{pattern}' where # matches multiple levels")
        }
        (false, false) => format!("Exact topic match for '{pattern}'"),
    };

    TopicExample { topic, usage }
}
