use crate::command::{ExperimentCommand, RenderCommand};
use crate::errors::{LaunchError, Result};
use crate::util::value_to_plain_string;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSpec {
    pub name: String,
    pub project: Option<String>,
    pub script: String,
    pub tags: Vec<String>,
    pub parameters: Map<String, Value>,
    pub paths_to_copy: Vec<String>,
    pub exclude: Vec<String>,
    pub settings: Map<String, Value>,
}

impl ExperimentSpec {
    pub fn record_layer(&self) -> Map<String, Value> {
        let mut layer = self.settings.clone();
        layer.insert("name".to_string(), json!(self.name));
        if let Some(project) = &self.project {
            layer.insert("project".to_string(), json!(project));
        }
        layer.insert("parameters".to_string(), Value::Object(self.parameters.clone()));
        layer.insert("paths_to_copy".to_string(), json!(self.paths_to_copy));
        layer.insert("exclude".to_string(), json!(self.exclude));
        layer
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedExperiment {
    pub index: usize,
    pub name: String,
    pub backend_type: String,
    pub storage_dir: String,
    pub cmd: ExperimentCommand,
    pub env: BTreeMap<String, String>,
    pub resources: Map<String, Value>,
    pub tracking_config_path: Option<PathBuf>,
    pub record: Map<String, Value>,
}

impl ResolvedExperiment {
    pub fn new(
        index: usize,
        record: Map<String, Value>,
        cmd: ExperimentCommand,
        tracking_config_path: Option<PathBuf>,
    ) -> Result<Self> {
        let backend_type = match record.get("backend_type") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => {
                return Err(LaunchError::validation(format!(
                    "experiment {} has no \"backend_type\"",
                    index
                )))
            }
        };
        validate_required_keys(index, &backend_type, &record)?;

        let storage_dir = record
            .get("storage_dir")
            .map(value_to_plain_string)
            .unwrap_or_default();
        let env = match record.get("env") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), value_to_plain_string(v)))
                .collect(),
            Some(other) => {
                return Err(LaunchError::configuration(format!(
                    "experiment {}: \"env\" must be a mapping, got {}",
                    index, other
                )))
            }
        };
        let resources = match record.get("resources") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(LaunchError::configuration(format!(
                    "experiment {}: \"resources\" must be a mapping, got {}",
                    index, other
                )))
            }
        };
        let name = record
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("experiment_{}", index));

        Ok(Self {
            index,
            name,
            backend_type,
            storage_dir,
            cmd,
            env,
            resources,
            tracking_config_path,
            record,
        })
    }

    pub fn settings<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.record.clone())).map_err(|e| {
            LaunchError::configuration(format!(
                "experiment {} ({}): invalid {} settings: {}",
                self.index, self.name, self.backend_type, e
            ))
        })
    }

    pub fn describe(&self) -> Value {
        json!({
            "index": self.index,
            "name": self.name,
            "backend_type": self.backend_type,
            "storage_dir": self.storage_dir,
            "command": self.cmd.command(),
            "env": self.env,
            "resources": self.resources,
            "tracking_config_path": self.tracking_config_path.as_ref().map(|p| p.display().to_string()),
        })
    }
}

fn validate_required_keys(index: usize, backend_type: &str, record: &Map<String, Value>) -> Result<()> {
    let mut required = vec!["storage_dir"];
    if backend_type == "slurm" || backend_type == "kubernetes" {
        required.push("resources");
    }
    let missing: Vec<&str> = required
        .into_iter()
        .filter(|key| match record.get(*key) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            _ => false,
        })
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(LaunchError::configuration(format!(
            "experiment {} missing required keys:\n{}",
            index,
            missing
                .iter()
                .map(|k| format!("  - {}", k))
                .collect::<Vec<_>>()
                .join("\n")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SimpleCommand;

    fn record(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    fn echo() -> ExperimentCommand {
        ExperimentCommand::Simple(SimpleCommand::new("echo hi"))
    }

    #[test]
    fn env_values_are_stringified() {
        let exp = ResolvedExperiment::new(
            0,
            record(json!({"backend_type": "local", "storage_dir": "/tmp/s", "env": {"SEED": 7, "FLAG": true, "S": "x"}})),
            echo(),
            None,
        )
        .expect("resolve");
        assert_eq!(exp.env.get("SEED").map(String::as_str), Some("7"));
        assert_eq!(exp.env.get("FLAG").map(String::as_str), Some("true"));
        assert_eq!(exp.env.get("S").map(String::as_str), Some("x"));
        assert_eq!(exp.name, "experiment_0");
    }

    #[test]
    fn slurm_requires_resources() {
        let err = ResolvedExperiment::new(
            2,
            record(json!({"backend_type": "slurm", "storage_dir": "/s"})),
            echo(),
            None,
        )
        .expect_err("missing resources");
        let msg = err.to_string();
        assert!(msg.contains("experiment 2") && msg.contains("resources"), "{}", msg);
    }

    #[test]
    fn missing_storage_dir_is_reported() {
        let err = ResolvedExperiment::new(0, record(json!({"backend_type": "local"})), echo(), None)
            .expect_err("missing storage");
        assert!(matches!(err, LaunchError::Configuration(_)));
    }

    #[test]
    fn spec_layer_carries_deployment_lists() {
        let spec = ExperimentSpec {
            name: "mnist".to_string(),
            project: Some("vision".to_string()),
            script: "python train.py".to_string(),
            tags: vec![],
            parameters: record(json!({"lr": 0.1})),
            paths_to_copy: vec!["../lib".to_string()],
            exclude: vec!["data".to_string()],
            settings: record(json!({"partition": "gpu"})),
        };
        let layer = spec.record_layer();
        assert_eq!(layer["name"], json!("mnist"));
        assert_eq!(layer["paths_to_copy"], json!(["../lib"]));
        assert_eq!(layer["partition"], json!("gpu"));
        assert_eq!(layer["parameters"], json!({"lr": 0.1}));
    }
}
