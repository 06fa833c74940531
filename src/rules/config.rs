use std::hash::Hasher;
use std::path::Path;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::rules::error::{RulesError, RulesResult};
use crate::rules::rule::RuleType;

fn label_map_is_empty(m: &AHashMap<String, String>) -> bool {
    m.is_empty()
}

/// Parses a Prometheus-style duration string, e.g. `30s`, `5m`, `1h30m`.
/// Recognised units: ms, s, m, h, d, w, y.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    let bytes = s.as_bytes();
    let mut total_ms: u64 = 0;
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == start {
            return Err(format!("invalid duration {:?}", s));
        }
        let num: u64 = s[start..i]
            .parse()
            .map_err(|_| format!("invalid duration {:?}", s))?;
        let unit_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_digit() {
            i += 1;
        }
        let factor: u64 = match &s[unit_start..i] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 7 * 86_400_000,
            "y" => 365 * 86_400_000,
            unit => return Err(format!("unknown unit {:?} in duration {:?}", unit, s)),
        };
        total_ms = num
            .checked_mul(factor)
            .and_then(|v| total_ms.checked_add(v))
            .ok_or_else(|| format!("duration {:?} overflows", s))?;
    }
    Ok(Duration::from_millis(total_ms))
}

/// Formats a duration the way [`parse_duration`] reads it.
pub fn format_duration(d: &Duration) -> String {
    let mut ms = d.as_millis() as u64;
    if ms == 0 {
        return "0s".to_string();
    }
    let units: [(&str, u64); 7] = [
        ("y", 365 * 86_400_000),
        ("w", 7 * 86_400_000),
        ("d", 86_400_000),
        ("h", 3_600_000),
        ("m", 60_000),
        ("s", 1_000),
        ("ms", 1),
    ];
    let mut out = String::new();
    for (unit, factor) in units {
        if ms >= factor {
            out.push_str(&format!("{}{}", ms / factor, unit));
            ms %= factor;
        }
    }
    out
}

pub(crate) mod prom_duration {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod opt_prom_duration {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => serializer.serialize_some(&format_duration(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// RuleConfig describes an entity that represents either a recording rule or
/// an alerting rule, exactly one of `record`/`alert` set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub record: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alert: String,
    pub expr: String,
    #[serde(
        rename = "for",
        default,
        with = "prom_duration",
        skip_serializing_if = "Duration::is_zero"
    )]
    pub r#for: Duration,
    /// the alert will continue firing for this long even when the expression
    /// no longer has results
    #[serde(
        default,
        with = "prom_duration",
        skip_serializing_if = "Duration::is_zero"
    )]
    pub keep_firing_for: Duration,
    #[serde(default, skip_serializing_if = "label_map_is_empty")]
    pub labels: AHashMap<String, String>,
    #[serde(default, skip_serializing_if = "label_map_is_empty")]
    pub annotations: AHashMap<String, String>,
}

impl RuleConfig {
    /// Returns the rule name according to its type.
    pub fn name(&self) -> &str {
        if !self.record.is_empty() {
            &self.record
        } else {
            &self.alert
        }
    }

    pub fn rule_type(&self) -> RuleType {
        if !self.record.is_empty() {
            RuleType::Recording
        } else {
            RuleType::Alerting
        }
    }

    /// Hashes the significant fields into a value that defines rule
    /// uniqueness within a group.
    pub fn hash(&self) -> u64 {
        let mut h = Xxh3::with_seed(0);
        h.write(self.expr.as_bytes());
        h.write(self.rule_type().name().as_bytes());
        h.write(self.name().as_bytes());
        let mut keys: Vec<&String> = self.labels.keys().collect();
        keys.sort();
        for key in keys {
            h.write(key.as_bytes());
            if let Some(value) = self.labels.get(key) {
                h.write(value.as_bytes());
            }
            h.write(b"\xff");
        }
        h.digest()
    }

    pub fn validate(&self) -> RulesResult<()> {
        let err = |msg: String| Err(RulesError::InvalidRule(msg));

        if self.record.is_empty() && self.alert.is_empty() {
            return err("rule must have either record or alert field set".to_string());
        }
        if !self.record.is_empty() && !self.alert.is_empty() {
            return err(format!(
                "rule {:?} should have either record or alert field set, not both",
                self.name()
            ));
        }
        if self.expr.is_empty() {
            return err(format!("rule {:?} must have expression set", self.name()));
        }
        if !self.record.is_empty() {
            if !is_valid_metric_name(&self.record) {
                return err(format!("invalid recording rule name {:?}", self.record));
            }
            if !self.r#for.is_zero() || !self.keep_firing_for.is_zero() {
                return err(format!(
                    "recording rule {:?} cannot set for or keep_firing_for",
                    self.record
                ));
            }
            if !self.annotations.is_empty() {
                return err(format!(
                    "recording rule {:?} cannot set annotations",
                    self.record
                ));
            }
        }
        Ok(())
    }
}

/// GroupConfig contains a list of rules grouped into an entity with one name
/// and evaluation interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(
        default,
        with = "opt_prom_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub interval: Option<Duration>,
    #[serde(
        default,
        with = "opt_prom_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub query_offset: Option<Duration>,
    /// maximum number of series a rule may produce per iteration, 0 means
    /// unlimited
    #[serde(default)]
    pub limit: usize,
    /// label value pairs added to every rule of the group; rule labels have
    /// priority over them
    #[serde(default, skip_serializing_if = "label_map_is_empty")]
    pub labels: AHashMap<String, String>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl GroupConfig {
    pub fn validate(&self) -> RulesResult<()> {
        if self.name.is_empty() {
            return Err(RulesError::InvalidConfiguration(
                "group name must be set".to_string(),
            ));
        }
        if let (Some(offset), Some(interval)) = (&self.query_offset, &self.interval) {
            if offset > interval {
                return Err(RulesError::InvalidConfiguration(format!(
                    "group {:?}: query_offset {} should be smaller than interval {}",
                    self.name,
                    format_duration(offset),
                    format_duration(interval)
                )));
            }
        }
        let mut unique_rules = AHashSet::with_capacity(self.rules.len());
        for rule in &self.rules {
            rule.validate()?;
            if !unique_rules.insert(rule.hash()) {
                return Err(RulesError::InvalidConfiguration(format!(
                    "group {:?}: rule {:?} is a duplicate within the group",
                    self.name,
                    rule.name()
                )));
            }
        }
        Ok(())
    }
}

/// Top-level shape of a rule file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleGroupsConfig {
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

impl RuleGroupsConfig {
    pub fn from_yaml(yaml: &str) -> RulesResult<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|err| RulesError::InvalidConfiguration(format!("invalid yaml: {}", err)))
    }

    pub fn validate(&self) -> RulesResult<()> {
        let mut names = AHashSet::with_capacity(self.groups.len());
        for group in &self.groups {
            group.validate()?;
            if !names.insert(group.name.as_str()) {
                return Err(RulesError::InvalidConfiguration(format!(
                    "group name {:?} repeated in the same file",
                    group.name
                )));
            }
        }
        Ok(())
    }
}

/// GroupLoader knows how to parse a rule file into its group configs.
pub trait GroupLoader: Send + Sync {
    fn load(&self, path: &Path) -> RulesResult<RuleGroupsConfig>;
}

/// The default loader: reads the file from disk and parses it as YAML.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileLoader;

impl GroupLoader for FileLoader {
    fn load(&self, path: &Path) -> RulesResult<RuleGroupsConfig> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            RulesError::InvalidConfiguration(format!("cannot read {}: {}", path.display(), err))
        })?;
        let config = RuleGroupsConfig::from_yaml(&content)
            .map_err(|err| RulesError::InvalidConfiguration(format!("{}: {}", path.display(), err)))?;
        config.validate()?;
        Ok(config)
    }
}
