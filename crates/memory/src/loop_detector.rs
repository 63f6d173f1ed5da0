//! Detection of repetitive tool use.
//!
//! Every tool call is reduced to a fingerprint (tool name plus canonical
//! arguments) and pushed into a bounded window. A warning is raised once
//! when a fingerprint reaches the repeat threshold, or when the tail of the
//! window is a short cycle repeated that many times.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::warn;

const MAX_CYCLE_LENGTH: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub enabled: bool,
    /// Window capacity; oldest fingerprints are evicted first.
    pub window: usize,
    /// Repeats that count as a loop.
    pub threshold: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 20,
            threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Repeat,
    Cycle { length: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopWarning {
    pub tool_name: String,
    pub fingerprint: String,
    pub repeats: usize,
    pub kind: LoopKind,
}

impl LoopWarning {
    pub fn message(&self) -> String {
        match self.kind {
            LoopKind::Repeat => format!(
                "Tool '{}' was called {} times with identical arguments",
                self.tool_name, self.repeats
            ),
            LoopKind::Cycle { length } => format!(
                "The last {} tool calls repeat a cycle of length {}",
                length * self.repeats,
                length
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopDetector {
    config: LoopConfig,
    window: VecDeque<String>,
    warned: HashSet<String>,
    warned_cycles: HashSet<String>,
}

impl LoopDetector {
    pub fn new(config: LoopConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window),
            config,
            warned: HashSet::new(),
            warned_cycles: HashSet::new(),
        }
    }

    pub fn fingerprint(tool_name: &str, arguments: &serde_json::Value) -> String {
        format!("tool_call|{}|{}", tool_name, canonical_json(arguments))
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.warned.clear();
        self.warned_cycles.clear();
    }

    /// Record one call. Returns a warning the first time a loop is seen.
    pub fn record(&mut self, tool_name: &str, arguments: &serde_json::Value) -> Option<LoopWarning> {
        if !self.config.enabled || self.config.window == 0 {
            return None;
        }

        let fingerprint = Self::fingerprint(tool_name, arguments);
        if self.window.len() == self.config.window {
            if let Some(evicted) = self.window.pop_front() {
                if !self.window.contains(&evicted) {
                    self.warned.remove(&evicted);
                }
            }
        }
        self.window.push_back(fingerprint.clone());

        let repeats = self.window.iter().filter(|f| **f == fingerprint).count();
        if repeats >= self.config.threshold && self.warned.insert(fingerprint.clone()) {
            let warning = LoopWarning {
                tool_name: tool_name.to_string(),
                fingerprint,
                repeats,
                kind: LoopKind::Repeat,
            };
            warn!("Loop detected: {}", warning.message());
            return Some(warning);
        }

        self.check_cycle(tool_name)
    }

    fn check_cycle(&mut self, tool_name: &str) -> Option<LoopWarning> {
        let threshold = self.config.threshold.max(2);
        let tail: Vec<&String> = self.window.iter().collect();

        let detected = (2..=MAX_CYCLE_LENGTH).find_map(|length| {
            let span = length * threshold;
            if tail.len() < span {
                return None;
            }
            let recent = &tail[tail.len() - span..];
            let pattern = &recent[..length];
            let repeats = recent.chunks(length).all(|chunk| chunk == pattern);
            let distinct = pattern.iter().any(|f| *f != pattern[0]);
            (repeats && distinct).then(|| (length, cycle_key(pattern)))
        });

        let Some((length, key)) = detected else {
            self.warned_cycles.clear();
            return None;
        };
        if !self.warned_cycles.insert(key.clone()) {
            return None;
        }

        let warning = LoopWarning {
            tool_name: tool_name.to_string(),
            fingerprint: key,
            repeats: threshold,
            kind: LoopKind::Cycle { length },
        };
        warn!("Loop detected: {}", warning.message());
        Some(warning)
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(LoopConfig::default())
    }
}

/// Rotation-independent key so that A,B and B,A name the same cycle.
fn cycle_key(pattern: &[&String]) -> String {
    (0..pattern.len())
        .map(|shift| {
            let rotated: Vec<&str> = pattern
                .iter()
                .cycle()
                .skip(shift)
                .take(pattern.len())
                .map(|s| s.as_str())
                .collect();
            rotated.join(" -> ")
        })
        .min()
        .unwrap_or_default()
}

/// JSON with object keys sorted at every level.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}
