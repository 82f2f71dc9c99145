//! Effective configuration resolution
//!
//! Layers, lowest precedence first: definition defaults, config file,
//! inline overrides.

use crate::catalog::WorkloadDefinition;
use crate::error::ValidationError;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use std::collections::BTreeMap;
use std::path::Path;

pub type EffectiveConfig = BTreeMap<String, String>;

const SECRET_BYTES: usize = 16;

/// Merge the config layers and check required keys
///
/// Pure: no I/O, no provider access.
pub fn resolve(
    definition: &WorkloadDefinition,
    file: Option<&BTreeMap<String, String>>,
    inline: Option<&BTreeMap<String, String>>,
) -> Result<EffectiveConfig, ValidationError> {
    let mut effective = definition.defaults.clone();
    for layer in [file, inline].into_iter().flatten() {
        effective.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    if let Some(missing) = definition
        .required_config()
        .iter()
        .find(|key| effective.get(*key).is_none_or(|v| v.is_empty()))
    {
        return Err(ValidationError::MissingRequiredConfig {
            key: missing.clone(),
            workload: definition.name.clone(),
        });
    }

    Ok(effective)
}

/// Fill the definition's password keys with random secrets
///
/// A key given inline keeps its value; file and default values are replaced.
pub fn fill_secrets(
    definition: &WorkloadDefinition,
    config: &mut EffectiveConfig,
    inline: Option<&BTreeMap<String, String>>,
) {
    for key in &definition.password_keys {
        if inline.is_some_and(|overrides| overrides.contains_key(key)) {
            continue;
        }
        config.insert(key.clone(), generate_secret());
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Parse `KEY=VALUE` lines
///
/// Blank lines and `#` comments are skipped, keys and values are trimmed,
/// and a value wrapped in double quotes is unquoted.
pub fn parse_config(content: &str, path: &Path) -> Result<BTreeMap<String, String>, ValidationError> {
    let mut config = BTreeMap::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ValidationError::InvalidConfigLine {
                path: path.to_path_buf(),
                line: index + 1,
                content: line.to_string(),
            });
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(ValidationError::InvalidConfigLine {
                path: path.to_path_buf(),
                line: index + 1,
                content: line.to_string(),
            });
        }
        config.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    Ok(config)
}

pub fn load_config_file(path: &Path) -> Result<BTreeMap<String, String>, ValidationError> {
    let content = std::fs::read_to_string(path).map_err(|source| ValidationError::ConfigFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content, path)
}

/// Parse one inline `KEY=VALUE` override
pub fn parse_override(pair: &str) -> Result<(String, String), ValidationError> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(ValidationError::InvalidOverride(pair.to_string())),
    }
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Runtime;
    use gsm_cloud::{PortRule, Protocol};

    fn definition(defaults: &[(&str, &str)], required: &[&str]) -> WorkloadDefinition {
        WorkloadDefinition {
            name: "test".to_string(),
            display_name: String::new(),
            ports: vec![PortRule::new(7777, Protocol::Udp)],
            defaults: map(defaults),
            default_instance_type: "t3.small".to_string(),
            min_ram_gb: 1,
            disk_size_gb: 10,
            required_config: required.iter().map(|s| s.to_string()).collect(),
            password_keys: vec![],
            runtime: Runtime::Docker {
                image: "test/image".to_string(),
                volumes: vec![],
                extra_args: vec![],
            },
        }
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_layer_precedence() {
        let def = definition(&[("A", "1")], &[]);
        let file = map(&[("A", "2"), ("B", "3")]);
        let inline = map(&[("B", "4")]);

        let effective = resolve(&def, Some(&file), Some(&inline)).unwrap();
        assert_eq!(effective, map(&[("A", "2"), ("B", "4")]));
    }

    #[test]
    fn test_inline_beats_file_and_defaults() {
        let def = definition(&[("K", "default")], &[]);
        let file = map(&[("K", "file")]);
        let inline = map(&[("K", "inline")]);

        let effective = resolve(&def, Some(&file), Some(&inline)).unwrap();
        assert_eq!(effective["K"], "inline");
    }

    #[test]
    fn test_absent_layers_are_noops() {
        let def = definition(&[("A", "1")], &[]);
        assert_eq!(resolve(&def, None, None).unwrap(), map(&[("A", "1")]));
    }

    #[test]
    fn test_missing_required_key() {
        let def = definition(&[], &["TOKEN"]);
        let err = resolve(&def, None, None).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::MissingRequiredConfig { ref key, .. } if key == "TOKEN"
        ));

        // empty counts as missing
        let inline = map(&[("TOKEN", "")]);
        assert!(resolve(&def, None, Some(&inline)).is_err());

        let inline = map(&[("TOKEN", "abc")]);
        assert!(resolve(&def, None, Some(&inline)).is_ok());
    }

    #[test]
    fn test_parse_config() {
        let content = "# comment\n\nSAVE_NAME = \"My World\"\nEMPTY=\nURL=http://x?a=b\n";
        let config = parse_config(content, Path::new("game.cfg")).unwrap();

        assert_eq!(config["SAVE_NAME"], "My World");
        assert_eq!(config["EMPTY"], "");
        assert_eq!(config["URL"], "http://x?a=b");
    }

    #[test]
    fn test_parse_config_rejects_line_without_equals() {
        let err = parse_config("A=1\nnot a pair\n", Path::new("game.cfg")).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidConfigLine { line: 2, .. }));
        assert!(err.to_string().starts_with("game.cfg:2:"));
    }

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_override("novalue").is_err());
        assert!(parse_override("=x").is_err());
    }

    #[test]
    fn test_fill_secrets() {
        let mut def = definition(&[("RCON_PASSWORD", "changeme")], &[]);
        def.password_keys = vec!["RCON_PASSWORD".to_string(), "ADMIN_TOKEN".to_string()];

        let inline = map(&[("ADMIN_TOKEN", "mine")]);
        let mut config = resolve(&def, None, Some(&inline)).unwrap();
        fill_secrets(&def, &mut config, Some(&inline));

        assert_ne!(config["RCON_PASSWORD"], "changeme");
        assert_eq!(config["RCON_PASSWORD"].len(), 22);
        assert_eq!(config["ADMIN_TOKEN"], "mine");
    }
}
