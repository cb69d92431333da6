use crate::types::{Severity, SourceDescriptor, SourceKind};
use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub notification: NotificationConfig,
    pub monitors: Vec<MonitorConfig>,
    #[serde(default)]
    pub process: Option<ProcessConfig>,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    /// Extra severity patterns checked by the classifier before the advisor.
    #[serde(default)]
    pub patterns: Vec<PatternConfig>,
    /// Disables the profiler and anomaly detection; patterns, keyword
    /// filters, and progress tracking stay active.
    #[serde(default)]
    pub turbo: bool,
    /// Overrides the duration-history file location (mainly for tests).
    #[serde(default)]
    pub history_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_advisor_calls_per_hour")]
    pub calls_per_hour: usize,
}

#[derive(Debug, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_rate_limit_per_hour")]
    pub rate_limit_per_hour: usize,
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,
    #[serde(default = "default_severity_levels")]
    pub severity_levels: Vec<Severity>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_hour: default_rate_limit_per_hour(),
            debounce_seconds: default_debounce_seconds(),
            severity_levels: default_severity_levels(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    #[serde(default)]
    pub name: Option<String>,
    pub path: Option<String>,
    pub pid: Option<u32>,
    pub unit: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// File sources only: emit pre-existing content instead of seeking to end.
    #[serde(default)]
    pub replay_existing: bool,
    /// PID sources only: seconds between process-table polls.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// PID sources only: alert when resident memory crosses 80% of this cap.
    #[serde(default)]
    pub rss_cap_mb: Option<u64>,
}

impl MonitorConfig {
    pub fn descriptor(&self, index: usize) -> SourceDescriptor {
        let location = match self.kind {
            SourceKind::File => self.path.clone().unwrap_or_default(),
            SourceKind::Pid => self.pid.map(|p| p.to_string()).unwrap_or_default(),
            SourceKind::Journal => self.unit.clone().unwrap_or_default(),
        };
        let display_name = self
            .name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.kind, location));
        SourceDescriptor {
            id: format!("src-{index}"),
            kind: self.kind,
            location,
            keywords: self.keywords.clone(),
            display_name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    #[serde(default = "default_process_name")]
    pub name: String,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub expected_duration_minutes: Option<u64>,
    /// Regexes that extract an explicit fraction from a line, e.g.
    /// `(\d+)/(\d+)` or `(\d+(?:\.\d+)?)%`.
    #[serde(default)]
    pub progress_patterns: Vec<String>,
    /// Regexes marking the end of the run.
    #[serde(default)]
    pub completion_patterns: Vec<String>,
    /// Report progress when the fraction crosses a multiple of this.
    #[serde(default = "default_milestone_percent")]
    pub milestone_percent: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default = "default_stage_weight")]
    pub weight: u32,
    pub start_pattern: String,
}

#[derive(Debug, Deserialize)]
pub struct AnomalyConfig {
    #[serde(default = "default_spike_threshold")]
    pub spike_threshold: f64,
    #[serde(default = "default_stall_seconds")]
    pub stall_seconds: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            spike_threshold: default_spike_threshold(),
            stall_seconds: default_stall_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternConfig {
    pub pattern: String,
    pub severity: Severity,
    pub summary: String,
}

fn default_rate_limit_per_hour() -> usize {
    10
}

fn default_debounce_seconds() -> u64 {
    300
}

fn default_severity_levels() -> Vec<Severity> {
    vec![Severity::Critical, Severity::Warning, Severity::Info]
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_stage_weight() -> u32 {
    1
}

fn default_spike_threshold() -> f64 {
    3.0
}

fn default_stall_seconds() -> u64 {
    300
}

fn default_advisor_calls_per_hour() -> usize {
    60
}

fn default_milestone_percent() -> u32 {
    10
}

fn default_process_name() -> String {
    "process".to_string()
}

static ENV_VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Replace `${VAR}` references in string values with environment variables.
/// An unset variable is a configuration error.
fn substitute_env(value: serde_yaml::Value) -> Result<serde_yaml::Value> {
    use serde_yaml::Value;
    Ok(match value {
        Value::String(s) => {
            let mut out = String::with_capacity(s.len());
            let mut last = 0;
            for caps in ENV_VAR_RE.captures_iter(&s) {
                let m = caps.get(0).unwrap();
                let name = &caps[1];
                let val = std::env::var(name)
                    .with_context(|| format!("environment variable not set: {name}"))?;
                out.push_str(&s[last..m.start()]);
                out.push_str(&val);
                last = m.end();
            }
            out.push_str(&s[last..]);
            Value::String(out)
        }
        Value::Sequence(seq) => Value::Sequence(
            seq.into_iter().map(substitute_env).collect::<Result<_>>()?,
        ),
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, v) in map {
                out.insert(k, substitute_env(v)?);
            }
            Value::Mapping(out)
        }
        other => other,
    })
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let raw: serde_yaml::Value =
            serde_yaml::from_str(content).context("invalid YAML in config file")?;
        let substituted = substitute_env(raw)?;
        let config: Config =
            serde_yaml::from_value(substituted).context("invalid config structure")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            bail!("telegram.bot_token must not be empty");
        }
        if self.telegram.chat_id.trim().is_empty() {
            bail!("telegram.chat_id must not be empty");
        }
        if self.monitors.is_empty() {
            bail!("at least one monitor must be configured");
        }
        for (i, mon) in self.monitors.iter().enumerate() {
            match mon.kind {
                SourceKind::File if mon.path.is_none() => {
                    bail!("monitor {i}: file monitors require 'path'")
                }
                SourceKind::Pid if mon.pid.is_none() => {
                    bail!("monitor {i}: pid monitors require 'pid'")
                }
                SourceKind::Journal if mon.unit.is_none() => {
                    bail!("monitor {i}: journal monitors require 'unit'")
                }
                _ => {}
            }
        }
        if let Some(process) = &self.process {
            for stage in &process.stages {
                if stage.weight == 0 {
                    bail!("stage '{}' must have a positive weight", stage.name);
                }
                Regex::new(&stage.start_pattern).with_context(|| {
                    format!("stage '{}' has an invalid start_pattern", stage.name)
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
telegram:
  bot_token: "123:abc"
  chat_id: "42"
monitors:
  - type: file
    path: /var/log/app.log
    keywords: [ERROR, FATAL]
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(cfg.notification.rate_limit_per_hour, 10);
        assert_eq!(cfg.notification.debounce_seconds, 300);
        assert_eq!(cfg.notification.severity_levels.len(), 3);
        assert_eq!(cfg.anomaly.spike_threshold, 3.0);
        assert_eq!(cfg.anomaly.stall_seconds, 300);
        assert!(!cfg.turbo);
        assert!(cfg.llm.is_none());
    }

    #[test]
    fn monitor_without_location_is_rejected() {
        let yaml = r#"
telegram:
  bot_token: "t"
  chat_id: "c"
monitors:
  - type: journal
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn empty_monitors_are_rejected() {
        let yaml = r#"
telegram:
  bot_token: "t"
  chat_id: "c"
monitors: []
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn env_vars_are_substituted() {
        std::env::set_var("TW_TEST_TOKEN", "secret-token");
        let yaml = r#"
telegram:
  bot_token: "${TW_TEST_TOKEN}"
  chat_id: "42"
monitors:
  - type: pid
    pid: 1
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.telegram.bot_token, "secret-token");
    }

    #[test]
    fn unset_env_var_is_a_config_error() {
        let yaml = r#"
telegram:
  bot_token: "${TW_DEFINITELY_UNSET_VAR}"
  chat_id: "42"
monitors:
  - type: pid
    pid: 1
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn zero_weight_stage_is_rejected() {
        let yaml = r#"
telegram:
  bot_token: "t"
  chat_id: "c"
monitors:
  - type: pid
    pid: 1
process:
  name: train
  stages:
    - name: load
      weight: 0
      start_pattern: "loading"
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn descriptor_uses_explicit_name() {
        let cfg = Config::from_yaml(MINIMAL).unwrap();
        let desc = cfg.monitors[0].descriptor(0);
        assert_eq!(desc.id, "src-0");
        assert_eq!(desc.display_name, "file:/var/log/app.log");
        assert_eq!(desc.keywords, vec!["ERROR", "FATAL"]);
    }
}
