// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Invalidation rules and their evaluation order

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{CacheError, CacheResult};
use crate::store::CacheKey;

/// How a rule pattern is matched against the event key.
///
/// Declaration order is precedence order: `Exact` beats `Prefix` beats `Regex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchType {
    Exact,
    Prefix,
    Regex,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationMode {
    #[default]
    Immediate,
    /// Coalesced per event key over the debounce window
    Debounced,
}

/// Maps matching events to the keys they invalidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationRule {
    pub pattern: String,
    pub match_type: MatchType,
    /// Only events in this namespace match; `None` matches every namespace
    pub namespace: Option<String>,
    /// Keys invalidated on a match; empty means the event key itself
    pub target_keys: Vec<CacheKey>,
    pub mode: InvalidationMode,
    /// Higher wins among rules of the same match type
    pub priority: i32,
}

impl InvalidationRule {
    pub fn new(pattern: impl Into<String>, match_type: MatchType) -> Self {
        Self {
            pattern: pattern.into(),
            match_type,
            namespace: None,
            target_keys: Vec::new(),
            mode: InvalidationMode::Immediate,
            priority: 0,
        }
    }

    pub fn exact(pattern: impl Into<String>) -> Self {
        Self::new(pattern, MatchType::Exact)
    }

    pub fn prefix(pattern: impl Into<String>) -> Self {
        Self::new(pattern, MatchType::Prefix)
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::new(pattern, MatchType::Regex)
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn target(mut self, key: CacheKey) -> Self {
        self.target_keys.push(key);
        self
    }

    pub fn targets(mut self, keys: impl IntoIterator<Item = CacheKey>) -> Self {
        self.target_keys.extend(keys);
        self
    }

    pub fn debounced(mut self) -> Self {
        self.mode = InvalidationMode::Debounced;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub u64);

/// A key produced by rule evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTarget {
    pub key: CacheKey,
    pub mode: InvalidationMode,
    pub rule: RuleId,
}

#[derive(Debug)]
enum Matcher {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

impl Matcher {
    fn matches(&self, key: &str) -> bool {
        match self {
            Matcher::Exact(pattern) => key == pattern,
            Matcher::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Matcher::Regex(regex) => regex.is_match(key),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    id: RuleId,
    rule: InvalidationRule,
    matcher: Matcher,
}

/// Registered rules, kept sorted by precedence
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    next_id: u64,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: InvalidationRule) -> CacheResult<RuleId> {
        if rule.pattern.is_empty() && rule.match_type != MatchType::Prefix {
            return Err(CacheError::InvalidPattern(
                "pattern must not be empty".to_string(),
            ));
        }
        let matcher = match rule.match_type {
            MatchType::Exact => Matcher::Exact(rule.pattern.clone()),
            MatchType::Prefix => Matcher::Prefix(rule.pattern.clone()),
            MatchType::Regex => Matcher::Regex(Regex::new(&rule.pattern)?),
        };

        self.next_id += 1;
        let id = RuleId(self.next_id);
        self.rules.push(CompiledRule { id, rule, matcher });
        // Stable sort keeps registration order among equals
        self.rules
            .sort_by(|a, b| {
                a.rule
                    .match_type
                    .cmp(&b.rule.match_type)
                    .then_with(|| b.rule.priority.cmp(&a.rule.priority))
            });
        Ok(id)
    }

    pub fn remove(&mut self, id: RuleId) -> Option<InvalidationRule> {
        let index = self.rules.iter().position(|compiled| compiled.id == id)?;
        Some(self.rules.remove(index).rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> Vec<(RuleId, InvalidationRule)> {
        self.rules
            .iter()
            .map(|compiled| (compiled.id, compiled.rule.clone()))
            .collect()
    }

    /// Targets for an event, in rule precedence order. A key produced by
    /// several rules appears once, with the mode of the first rule.
    pub fn evaluate(&self, event_key: &CacheKey) -> Vec<RuleTarget> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        for compiled in &self.rules {
            if let Some(namespace) = &compiled.rule.namespace {
                if namespace != &event_key.namespace {
                    continue;
                }
            }
            if !compiled.matcher.matches(&event_key.key) {
                continue;
            }

            let keys: Vec<&CacheKey> = if compiled.rule.target_keys.is_empty() {
                vec![event_key]
            } else {
                compiled.rule.target_keys.iter().collect()
            };
            for key in keys {
                if seen.insert(key.clone()) {
                    targets.push(RuleTarget {
                        key: key.clone(),
                        mode: compiled.rule.mode,
                        rule: compiled.id,
                    });
                }
            }
        }

        targets
    }
}
