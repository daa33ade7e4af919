use super::{ExecutionBackend, RunOutcome};
use crate::command::RenderCommand;
use crate::errors::{LaunchError, Result};
use crate::experiment::ResolvedExperiment;
use crate::util::{shell_join, shell_quote, value_to_plain_string};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::process::{Command, Stdio};
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KubernetesSettings {
    #[serde(default)]
    pub base_image: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

pub fn pod_name(experiment: &ResolvedExperiment) -> String {
    let mut name: String = experiment
        .name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    name = name.trim_matches('-').to_string();
    if name.is_empty() {
        name = "experiment".to_string();
    }
    let suffix = format!("-{}", experiment.index);
    name.truncate(63 - suffix.len());
    format!("{}{}", name.trim_end_matches('-'), suffix)
}

fn resource_limits(resources: &Map<String, Value>) -> Result<Value> {
    let mut limits = Map::new();
    for (key, value) in resources {
        let name = match key.as_str() {
            "cpu" => "cpu",
            "mem" => "memory",
            "gpu" => "nvidia.com/gpu",
            other => {
                return Err(LaunchError::UnsupportedResource {
                    key: other.to_string(),
                    value: value_to_plain_string(value),
                })
            }
        };
        limits.insert(name.to_string(), json!(value_to_plain_string(value)));
    }
    Ok(Value::Object(limits))
}

pub fn build_kubectl_args(
    experiment: &ResolvedExperiment,
    settings: &KubernetesSettings,
) -> Result<Vec<String>> {
    let image = settings
        .base_image
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            LaunchError::configuration(format!(
                "experiment {}: kubernetes requires \"base_image\"",
                experiment.index
            ))
        })?;
    if settings.requirements.is_empty() {
        return Err(LaunchError::configuration(format!(
            "experiment {}: kubernetes requires a non-empty requirements list",
            experiment.index
        )));
    }
    let name = pod_name(experiment);

    let mut args = vec!["run".to_string(), name.clone()];
    if let Some(ns) = settings.namespace.as_deref().filter(|s| !s.is_empty()) {
        args.push("--namespace".to_string());
        args.push(ns.to_string());
    }
    args.push(format!("--image={}", image));
    args.push("--restart=Never".to_string());

    let mut env = experiment.cmd.env();
    env.extend(experiment.env.clone());
    env.insert(
        super::local::STORAGE_DIR_ENV.to_string(),
        experiment.storage_dir.clone(),
    );
    if let Some(path) = &experiment.tracking_config_path {
        env.insert(
            super::local::TRACKING_CONFIG_ENV.to_string(),
            path.to_string_lossy().to_string(),
        );
    }
    for (key, value) in env {
        args.push(format!("--env={}={}", key, value));
    }

    let overrides = json!({
        "apiVersion": "v1",
        "spec": {
            "containers": [{
                "name": name,
                "image": image,
                "resources": {"limits": resource_limits(&experiment.resources)?},
            }]
        }
    });
    args.push(format!("--overrides={}", overrides));

    let install = format!("pip install {}", shell_join(&settings.requirements));
    args.push("--command".to_string());
    args.push("--".to_string());
    args.push("sh".to_string());
    args.push("-c".to_string());
    args.push(format!("{} && {}", install, experiment.cmd.command()));
    Ok(args)
}

#[derive(Debug, Clone, Default)]
pub struct KubernetesBackend;

impl ExecutionBackend for KubernetesBackend {
    fn run(&self, experiment: &ResolvedExperiment, dry_run: bool) -> Result<RunOutcome> {
        let settings: KubernetesSettings = experiment.settings()?;
        let args = build_kubectl_args(experiment, &settings)?;
        let rendered = format!("kubectl {}", args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" "));
        if dry_run {
            info!(index = experiment.index, command = %rendered, "dry run, not submitting");
            return Ok(RunOutcome::DryRun {
                plan: json!({"command": rendered}),
            });
        }

        info!(index = experiment.index, pod = %args[1], "submitting pod");
        let output = Command::new("kubectl")
            .args(&args)
            .stdin(Stdio::null())
            .output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            return Err(LaunchError::RemoteExecution {
                host: "kubectl".to_string(),
                command: rendered,
                status: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                output: format!("{}{}", stdout, String::from_utf8_lossy(&output.stderr))
                    .trim()
                    .to_string(),
            });
        }
        Ok(RunOutcome::Submitted { output: stdout })
    }
}
