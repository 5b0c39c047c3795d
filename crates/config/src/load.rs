use std::path::{Path, PathBuf};

use secrecy::Secret;

use crate::{Error, GatelinkConfig, Result};

/// File stem searched for in the working directory and the user config dir.
pub const CONFIG_FILE_STEM: &str = "gatelink";

const EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "json"];

pub const ENV_URL: &str = "GATELINK_URL";
pub const ENV_TOKEN: &str = "GATELINK_TOKEN";
pub const ENV_PASSWORD: &str = "GATELINK_PASSWORD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "toml" => Ok(Self::Toml),
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Parse configuration text in the given format.
pub fn parse_str(contents: &str, format: ConfigFormat) -> Result<GatelinkConfig> {
    let config = match format {
        ConfigFormat::Toml => toml::from_str(contents)?,
        ConfigFormat::Yaml => serde_yaml::from_str(contents)?,
        ConfigFormat::Json => serde_json::from_str(contents)?,
    };
    Ok(config)
}

/// Load and validate a config file; the format follows the extension.
pub fn load_from_path(path: &Path) -> Result<GatelinkConfig> {
    let format = ConfigFormat::from_path(path)?;
    let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_str(&contents, format)?;
    config.validate()?;
    Ok(config)
}

/// Platform config directory (e.g. `~/.config/gatelink`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", CONFIG_FILE_STEM).map(|d| d.config_dir().to_path_buf())
}

/// First `gatelink.{toml,yaml,yml,json}` found in `dirs`, in order.
pub fn find_config_file_in(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter().find_map(|dir| {
        EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{CONFIG_FILE_STEM}.{ext}")))
            .find(|candidate| candidate.is_file())
    })
}

/// Search the working directory, then the platform config directory.
pub fn find_config_file() -> Option<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd);
    }
    if let Some(dir) = config_dir() {
        dirs.push(dir);
    }
    find_config_file_in(&dirs)
}

/// Apply `GATELINK_*` overrides using `lookup` as the environment.
pub fn apply_env_overrides(
    config: &mut GatelinkConfig,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    if let Some(url) = non_empty(ENV_URL) {
        config.gateway.url = url;
    }
    if let Some(token) = non_empty(ENV_TOKEN) {
        config.auth.token = Some(Secret::new(token));
    }
    if let Some(password) = non_empty(ENV_PASSWORD) {
        config.auth.password = Some(Secret::new(password));
    }
}

/// Load the discovered config file (or defaults) and apply env overrides.
///
/// Never fails: a broken config file is logged and replaced by defaults so a
/// client can still come up against a local gateway.
pub fn discover_and_load() -> GatelinkConfig {
    let mut config = match find_config_file() {
        Some(path) => match load_from_path(&path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config");
                config
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                GatelinkConfig::default()
            },
        },
        None => {
            tracing::debug!("no config file found, using defaults");
            GatelinkConfig::default()
        },
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, rstest::rstest, secrecy::ExposeSecret, std::collections::HashMap};

    #[rstest]
    #[case("gatelink.toml", ConfigFormat::Toml)]
    #[case("gatelink.YAML", ConfigFormat::Yaml)]
    #[case("gatelink.yml", ConfigFormat::Yaml)]
    #[case("gatelink.json", ConfigFormat::Json)]
    fn format_from_extension(#[case] name: &str, #[case] expected: ConfigFormat) {
        assert_eq!(ConfigFormat::from_path(Path::new(name)).unwrap(), expected);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = ConfigFormat::from_path(Path::new("gatelink.ini")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(ext) if ext == "ini"));
    }

    #[test]
    fn toml_partial_config_keeps_defaults() {
        let config = parse_str(
            r#"
            [gateway]
            url = "wss://gateway.example:443/ws"

            [reconnect]
            cap_ms = 10000

            [orchestrator]
            budget_usd = 25.0
            "#,
            ConfigFormat::Toml,
        )
        .unwrap();
        assert_eq!(config.gateway.url, "wss://gateway.example:443/ws");
        assert_eq!(config.reconnect.cap_ms, 10_000);
        assert_eq!(config.reconnect.base_ms, 250);
        assert_eq!(config.orchestrator.budget_usd, Some(25.0));
        assert_eq!(config.orchestrator.cost_window, 5);
    }

    #[test]
    fn yaml_and_json_parse_the_same_shape() {
        let yaml = parse_str(
            "auth:\n  token: abc\nprotocol:\n  min: 4\n  max: 4\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        let json = parse_str(
            r#"{"auth":{"token":"abc"},"protocol":{"min":4,"max":4}}"#,
            ConfigFormat::Json,
        )
        .unwrap();
        assert_eq!(yaml.protocol.min, json.protocol.min);
        assert_eq!(
            yaml.auth.token.unwrap().expose_secret(),
            json.auth.token.unwrap().expose_secret()
        );
    }

    #[test]
    fn load_from_path_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatelink.toml");
        std::fs::write(&path, "[protocol]\nmin = 9\nmax = 4\n").unwrap();
        assert!(matches!(load_from_path(&path), Err(Error::Invalid(_))));
    }

    #[test]
    fn load_from_missing_path_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_from_path(&dir.path().join("gatelink.json")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn find_config_file_respects_directory_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join("gatelink.yaml"), "{}").unwrap();
        let found = find_config_file_in(&[first.path().into(), second.path().into()]).unwrap();
        assert_eq!(found, second.path().join("gatelink.yaml"));

        std::fs::write(first.path().join("gatelink.json"), "{}").unwrap();
        let found = find_config_file_in(&[first.path().into(), second.path().into()]).unwrap();
        assert_eq!(found, first.path().join("gatelink.json"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_URL, "ws://10.0.0.2:18789"),
            (ENV_TOKEN, "env-token"),
            (ENV_PASSWORD, "   "),
        ]);
        let mut config = GatelinkConfig::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.gateway.url, "ws://10.0.0.2:18789");
        assert_eq!(config.auth.token.unwrap().expose_secret(), "env-token");
        assert!(config.auth.password.is_none());
    }
}
