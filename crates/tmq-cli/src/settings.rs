//! Consumer settings resolution for the CLI
//!
//! Precedence, lowest first: library defaults, the YAML config file, repeated
//! `--set key=value` overrides, then the dedicated flags.

use anyhow::{anyhow, bail, Context, Result};
use serde_yaml::Value as Yaml;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tmq_client::ConsumerConfig;

/// Read a flat `key: value` YAML map of consumer settings
pub fn load_file(path: &Path) -> Result<Vec<(String, String)>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_yaml(&content).with_context(|| format!("Invalid config file {}", path.display()))
}

pub fn parse_yaml(content: &str) -> Result<Vec<(String, String)>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let map: BTreeMap<String, Yaml> =
        serde_yaml::from_str(content).context("Expected a flat map of settings")?;
    map.into_iter()
        .map(|(key, value)| {
            let value = scalar(&key, value)?;
            Ok((key, value))
        })
        .collect()
}

fn scalar(key: &str, value: Yaml) -> Result<String> {
    match value {
        Yaml::String(s) => Ok(s),
        Yaml::Bool(b) => Ok(b.to_string()),
        Yaml::Number(n) => Ok(n.to_string()),
        Yaml::Null => bail!("{} has no value", key),
        _ => bail!("{} must be a scalar", key),
    }
}

/// Split a `key=value` override
pub fn parse_override(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("empty key in '{}'", raw);
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Flags that map onto a single configuration key
#[derive(Debug, Default, Clone)]
pub struct Flags {
    pub url: Option<String>,
    pub group: Option<String>,
    pub client_id: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Flags {
    fn pairs(&self) -> Vec<(&'static str, String)> {
        [
            ("ws.url", &self.url),
            ("group.id", &self.group),
            ("client.id", &self.client_id),
            ("td.connect.user", &self.user),
            ("td.connect.pass", &self.password),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.clone().map(|v| (key, v)))
        .collect()
    }
}

/// Build a validated consumer configuration
pub fn resolve(
    file: Option<&Path>,
    overrides: &[String],
    flags: &Flags,
) -> Result<ConsumerConfig> {
    let mut config = ConsumerConfig::default();

    if let Some(path) = file {
        for (key, value) in load_file(path)? {
            config
                .set(&key, &value)
                .with_context(|| format!("In config file {}", path.display()))?;
        }
    }
    for raw in overrides {
        let (key, value) = parse_override(raw)?;
        config.set(&key, &value)?;
    }
    for (key, value) in flags.pairs() {
        config.set(key, &value)?;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_yaml_scalars() {
        let pairs = parse_yaml(
            "group.id: g1\nenable.auto.commit: false\nauto.commit.interval.ms: 1000\nws.message.timeout: 5s\n",
        )
        .unwrap();
        assert_eq!(
            pairs,
            vec![
                ("auto.commit.interval.ms".to_string(), "1000".to_string()),
                ("enable.auto.commit".to_string(), "false".to_string()),
                ("group.id".to_string(), "g1".to_string()),
                ("ws.message.timeout".to_string(), "5s".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_yaml_rejects_nesting() {
        assert!(parse_yaml("ws:\n  url: ws://x\n").is_err());
        assert!(parse_yaml("- a\n- b\n").is_err());
        assert!(parse_yaml("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("ws.url = ws://db:6041").unwrap(),
            ("ws.url".to_string(), "ws://db:6041".to_string())
        );
        assert!(parse_override("novalue").is_err());
        assert!(parse_override("=x").is_err());
    }

    #[test]
    fn test_resolve_precedence() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "group.id: from_file").unwrap();
        writeln!(file, "client.id: file_client").unwrap();
        writeln!(file, "ws.url: ws://file:6041").unwrap();
        writeln!(file, "ws.message.timeout: 3s").unwrap();

        let flags = Flags {
            group: Some("from_flag".to_string()),
            ..Flags::default()
        };
        let config = resolve(
            Some(file.path()),
            &["client.id=override_client".to_string()],
            &flags,
        )
        .unwrap();

        assert_eq!(config.group_id, "from_flag");
        assert_eq!(config.client_id, "override_client");
        assert_eq!(config.transport.url, "ws://file:6041");
        assert_eq!(config.transport.message_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_resolve_reports_unknown_keys() {
        let err = resolve(None, &["no.such.key=1".to_string()], &Flags::default()).unwrap_err();
        assert!(err.to_string().contains("unknown configuration key"));
    }
}
