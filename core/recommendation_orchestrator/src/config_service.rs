//! Configuration loading: a base TOML file with `{{VAR}}`/`${VAR}`
//! environment interpolation, plus an environment-specific overlay merged
//! on top (`config.<env>.toml` over `config.toml`). The overlay is merged
//! at the document level, so only keys the overlay actually sets replace
//! base values.

use platform::{PlatformError, PlatformResult};
use regex::Regex;
use shared_types::AppConfig;
use std::env;
use std::fs;
use std::path::Path;

/// Read and interpolate one TOML file into a raw document. `{{VAR}}` and
/// `${VAR}` references are replaced from the process environment; unset
/// variables are left in place so a missing secret fails loudly at parse or
/// use time.
fn load_raw(path: &str) -> PlatformResult<toml::Value> {
    let content = fs::read_to_string(path)
        .map_err(|e| PlatformError::Config(format!("failed to read config file {path}: {e}")))?;

    let re = Regex::new(r"(\{\{|\$\{)([a-zA-Z0-9_]+)(\}\}|\})")
        .map_err(|e| PlatformError::Config(format!("failed to create regex: {e}")))?;

    let processed = re.replace_all(&content, |caps: &regex::Captures| {
        let var_name = &caps[2];
        env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    });

    processed
        .parse::<toml::Value>()
        .map_err(|e| PlatformError::Config(format!("failed to parse config file {path}: {e}")))
}

/// Load a single TOML config file.
pub fn load_single_config(path: &str) -> PlatformResult<AppConfig> {
    load_raw(path)?
        .try_into()
        .map_err(|e| PlatformError::Config(format!("invalid config file {path}: {e}")))
}

/// Deep-merge two TOML documents: overlay tables merge recursively, overlay
/// scalars and arrays replace base values.
fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_value) => merge_toml(base_value, overlay_value),
                    None => overlay_value,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load configuration with an environment profile, overlaying
/// `config.<env>.toml` (in the same directory as the base file) when it
/// exists. A missing overlay is not an error.
pub fn load_app_config_with_env(base_path: &str, env_name: &str) -> PlatformResult<AppConfig> {
    let base = load_raw(base_path)?;

    let env = env_name.to_lowercase();
    let overlay_path = Path::new(base_path).with_file_name(format!("config.{env}.toml"));

    let merged = if overlay_path.exists() {
        let overlay_str = overlay_path.to_str().ok_or_else(|| {
            PlatformError::Config("overlay path is not valid unicode".to_string())
        })?;
        merge_toml(base, load_raw(overlay_str)?)
    } else {
        base
    };

    merged
        .try_into()
        .map_err(|e| PlatformError::Config(format!("invalid merged config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn load_single_config_substitutes_env_vars_both_syntaxes() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "{}",
            r#"[storage]
db_path = "{{RECS_DB_PATH}}"

[alerts]
webhook_url = "${ROLLBACK_WEBHOOK_URL}"
"#
        )
        .expect("write config");

        env::set_var("RECS_DB_PATH", "/var/lib/recs/recommendations.db");
        env::set_var("ROLLBACK_WEBHOOK_URL", "https://hooks.example.com/rollback");

        let path = file.path().to_str().unwrap().to_string();
        let cfg = load_single_config(&path).expect("config should load");

        assert_eq!(cfg.storage.db_path, "/var/lib/recs/recommendations.db");
        assert_eq!(cfg.alerts.webhook_url, "https://hooks.example.com/rollback");
        // Untouched sections keep their defaults.
        assert_eq!(cfg.engine.monitoring_window_secs, 3_600);
    }

    #[test]
    fn overlay_replaces_only_the_keys_it_sets() {
        let dir = TempDir::new().expect("temp dir");
        let base_path = dir.path().join("config.toml");
        fs::write(
            &base_path,
            "[engine]\noom_kill_threshold = 2\nthrottle_warn_percent = 15.0\n\n\
             [storage]\ndb_path = \"base.db\"\n",
        )
        .expect("write base");
        fs::write(
            dir.path().join("config.prod.toml"),
            "[engine]\noom_kill_threshold = 3\n",
        )
        .expect("write overlay");

        let cfg = load_app_config_with_env(base_path.to_str().unwrap(), "prod").expect("load");
        // Overlay key wins.
        assert_eq!(cfg.engine.oom_kill_threshold, 3);
        // Base keys the overlay never mentions survive.
        assert!((cfg.engine.throttle_warn_percent - 15.0).abs() < 1e-9);
        assert_eq!(cfg.storage.db_path, "base.db");
        // Everything else falls back to defaults.
        assert!(cfg.engine.auto_rollback_enabled);
    }

    #[test]
    fn missing_overlay_returns_base() {
        let dir = TempDir::new().expect("temp dir");
        let base_path = dir.path().join("config.toml");
        fs::write(&base_path, "[engine]\noom_kill_threshold = 4\n").expect("write base");

        let cfg = load_app_config_with_env(base_path.to_str().unwrap(), "staging").expect("load");
        assert_eq!(cfg.engine.oom_kill_threshold, 4);
    }
}
