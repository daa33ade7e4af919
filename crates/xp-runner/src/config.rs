use crate::errors::{LaunchError, Result};
use crate::util::atomic_write_bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_CONFIG_FILE_NAME: &str = "config.yaml";
const APP_DIR_NAME: &str = "xp";
const REQUIRED_CONTEXT_KEYS: &[&str] = &["backend_type", "storage_dir"];
// Bookkeeping keys that never flow into an experiment record.
const CONTEXT_ONLY_KEYS: &[&str] = &["context_name", "tracking"];

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_default()
        .join(APP_DIR_NAME)
        .join(DEFAULT_CONFIG_FILE_NAME)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    pub name: String,
    pub backend_type: String,
    pub storage_dir: String,
    pub tracking: bool,
    pub defaults: Map<String, Value>,
}

impl Context {
    pub fn new(name: &str, backend_type: &str, storage_dir: &str) -> Self {
        Self {
            name: name.to_string(),
            backend_type: backend_type.to_string(),
            storage_dir: storage_dir.to_string(),
            tracking: false,
            defaults: Map::new(),
        }
    }

    pub fn from_value(name: &str, value: &Value) -> Result<Self> {
        let map = value.as_object().ok_or_else(|| {
            LaunchError::configuration(format!("context \"{}\" is not a mapping", name))
        })?;
        for key in REQUIRED_CONTEXT_KEYS {
            match map.get(*key) {
                Some(Value::String(s)) if !s.is_empty() => {}
                _ => {
                    return Err(LaunchError::configuration(format!(
                        "missing required \"{}\" key in context \"{}\"",
                        key, name
                    )))
                }
            }
        }
        let tracking = match map.get("tracking") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(LaunchError::configuration(format!(
                    "context \"{}\": \"tracking\" must be a boolean, got {}",
                    name, other
                )))
            }
        };
        let mut defaults = map.clone();
        let backend_type = take_string(&mut defaults, "backend_type");
        let storage_dir = take_string(&mut defaults, "storage_dir");
        for key in CONTEXT_ONLY_KEYS {
            defaults.remove(*key);
        }
        Ok(Self {
            name: name.to_string(),
            backend_type,
            storage_dir,
            tracking,
            defaults,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.defaults.clone();
        map.insert("context_name".to_string(), Value::String(self.name.clone()));
        map.insert(
            "backend_type".to_string(),
            Value::String(self.backend_type.clone()),
        );
        map.insert(
            "storage_dir".to_string(),
            Value::String(self.storage_dir.clone()),
        );
        if self.tracking {
            map.insert("tracking".to_string(), Value::Bool(true));
        }
        Value::Object(map)
    }

    pub fn defaults_layer(&self) -> Map<String, Value> {
        let mut layer = self.defaults.clone();
        layer.insert(
            "backend_type".to_string(),
            Value::String(self.backend_type.clone()),
        );
        layer.insert(
            "storage_dir".to_string(),
            Value::String(self.storage_dir.clone()),
        );
        layer
    }

    pub fn tags(&self) -> Vec<String> {
        self.defaults
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> String {
    map.remove(key)
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,
    #[serde(default)]
    pub contexts: BTreeMap<String, Value>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, starting empty");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: ConfigFile = serde_yaml::from_str(&raw).map_err(|e| {
            LaunchError::configuration(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_yaml::to_string(self)?;
        atomic_write_bytes(path, raw.as_bytes())
    }

    pub fn context(&self, name: &str) -> Result<Context> {
        let value = self.contexts.get(name).ok_or_else(|| {
            LaunchError::configuration(format!(
                "could not find predefined context: \"{}\" (use `xp context add`)",
                name
            ))
        })?;
        Context::from_value(name, value)
    }

    pub fn active_context(&self, requested: Option<&str>) -> Result<Context> {
        let name = requested
            .or(self.current_context.as_deref())
            .ok_or_else(|| {
                LaunchError::configuration(
                    "provide context name (use the --context option or `xp context set-active`)",
                )
            })?;
        self.context(name)
    }

    pub fn add_context(&mut self, context: &Context, force: bool) -> Result<()> {
        if !force && self.contexts.contains_key(&context.name) {
            return Err(LaunchError::configuration(format!(
                "context \"{}\" already exists (use --force to replace it)",
                context.name
            )));
        }
        self.contexts
            .insert(context.name.clone(), context.to_value());
        Ok(())
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        self.context(name)?;
        self.current_context = Some(name.to_string());
        Ok(())
    }

    pub fn remove_context(&mut self, name: &str) -> Result<()> {
        if self.contexts.remove(name).is_none() {
            return Err(LaunchError::configuration(format!(
                "unknown context \"{}\"",
                name
            )));
        }
        if self.current_context.as_deref() == Some(name) {
            self.current_context = None;
        }
        Ok(())
    }

    pub fn copy_context(&mut self, src: &str, dst: &str) -> Result<()> {
        if self.contexts.contains_key(dst) {
            return Err(LaunchError::configuration(format!(
                "context \"{}\" already exists",
                dst
            )));
        }
        let mut context = self.context(src)?;
        context.name = dst.to_string();
        self.contexts.insert(dst.to_string(), context.to_value());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_config() -> ConfigFile {
        let raw = r#"
current_context: cluster
contexts:
  cluster:
    context_name: cluster
    backend_type: slurm
    storage_dir: /net/storage/exp
    slurm_url: user@login.cluster
    partition: plgrid
    tracking: true
    tags: [baseline]
  laptop:
    backend_type: local
    storage_dir: /tmp/s
"#;
        serde_yaml::from_str(raw).expect("parse config")
    }

    #[test]
    fn active_context_prefers_cli_name() {
        let config = sample_config();
        let ctx = config.active_context(Some("laptop")).expect("laptop");
        assert_eq!(ctx.backend_type, "local");
        let ctx = config.active_context(None).expect("current");
        assert_eq!(ctx.name, "cluster");
        assert!(ctx.tracking);
        assert_eq!(ctx.tags(), vec!["baseline".to_string()]);
    }

    #[test]
    fn missing_or_unknown_context_is_configuration_error() {
        let mut config = sample_config();
        let err = config.active_context(Some("nope")).expect_err("unknown");
        assert!(matches!(err, LaunchError::Configuration(_)));
        config.current_context = None;
        let err = config.active_context(None).expect_err("none selected");
        assert!(err.to_string().contains("--context"));
    }

    #[test]
    fn context_requires_backend_and_storage() {
        let err = Context::from_value("x", &json!({"backend_type": "local"})).expect_err("missing");
        assert!(err.to_string().contains("storage_dir"), "{}", err);
    }

    #[test]
    fn defaults_layer_drops_bookkeeping_keys() {
        let ctx = sample_config().context("cluster").expect("ctx");
        let layer = ctx.defaults_layer();
        assert_eq!(layer.get("backend_type"), Some(&json!("slurm")));
        assert_eq!(layer.get("partition"), Some(&json!("plgrid")));
        assert!(!layer.contains_key("context_name"));
        assert!(!layer.contains_key("tracking"));
    }

    #[test]
    fn default_config_lives_in_app_dir() {
        let path = default_config_path();
        assert!(path.ends_with("xp/config.yaml"), "{}", path.display());
        if let Some(base) = dirs::config_dir() {
            assert!(path.starts_with(base));
        }
    }

    #[test]
    fn context_edits_persist_through_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("xp").join("config.yaml");
        let mut config = ConfigFile::load(&path).expect("empty");
        assert!(config.contexts.is_empty());

        let mut ctx = Context::new("laptop", "local", "/tmp/s");
        ctx.defaults.insert("env".to_string(), json!({"A": "1"}));
        config.add_context(&ctx, false).expect("add");
        assert!(config.add_context(&ctx, false).is_err());
        config.set_active("laptop").expect("activate");
        config.copy_context("laptop", "laptop2").expect("copy");
        config.save(&path).expect("save");

        let mut reloaded = ConfigFile::load(&path).expect("reload");
        assert_eq!(reloaded.current_context.as_deref(), Some("laptop"));
        assert_eq!(reloaded.context("laptop2").expect("copy").defaults, ctx.defaults);
        reloaded.remove_context("laptop").expect("remove");
        assert!(reloaded.current_context.is_none());
        assert!(reloaded.remove_context("laptop").is_err());
    }
}
