pub mod backend;
pub mod command;
pub mod config;
pub mod errors;
pub mod experiment;
pub mod generator;
pub mod merge;
pub mod tracking;
pub mod util;

use backend::{check_preconditions, dispatch_all, BackendKind, DispatchReport, DEFAULT_WORKERS};
use command::{compose_script_command, ExperimentCommand, SimpleCommand, TrackingWrapperCommand};
use config::Context;
use errors::{LaunchError, Result};
use experiment::{ExperimentSpec, ResolvedExperiment};
use generator::{has_spec, tracking_output_dir, ExperimentGenerator, TrackingOutputDir, DEFAULT_SPEC_NAME};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub script: PathBuf,
    pub tracking_config: Option<PathBuf>,
    pub spec_name: String,
    pub tags: Vec<String>,
    pub requirements_file: Option<PathBuf>,
    pub base_image: Option<String>,
    pub offline: bool,
    pub dry_run: bool,
    pub limit: Option<usize>,
    pub shuffle: bool,
    pub params: Vec<String>,
    pub rest_args: Vec<String>,
    pub set_overrides: Map<String, Value>,
    pub workers: usize,
}

impl RunRequest {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            tracking_config: None,
            spec_name: DEFAULT_SPEC_NAME.to_string(),
            tags: Vec::new(),
            requirements_file: None,
            base_image: None,
            offline: false,
            dry_run: false,
            limit: None,
            shuffle: false,
            params: Vec::new(),
            rest_args: Vec::new(),
            set_overrides: Map::new(),
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn validate(&self, context: &Context) -> Result<()> {
        if BackendKind::parse(&context.backend_type)? == BackendKind::Kubernetes {
            if self.base_image.as_deref().map_or(true, str::is_empty) {
                return Err(LaunchError::configuration(
                    "kubernetes contexts require --base_image",
                ));
            }
            if self.requirements_file.is_none() {
                return Err(LaunchError::configuration(
                    "kubernetes contexts require --requirements_file",
                ));
            }
        }
        let declared = has_spec(&self.script, &self.spec_name)?;
        if self.tracking_config.is_some() && declared {
            return Err(LaunchError::configuration(format!(
                "provide only one of: --neptune config or the \"{}\" entry in {}",
                self.spec_name,
                generator::descriptor_path(&self.script).display()
            )));
        }
        if self.tracking_config.is_none() && !declared {
            return Err(LaunchError::configuration(format!(
                "{} declares no \"{}\" experiments; pass --neptune with a tracking config \
                 or add it to {}",
                self.script.display(),
                self.spec_name,
                generator::descriptor_path(&self.script).display()
            )));
        }
        if self.workers == 0 {
            return Err(LaunchError::configuration("--workers must be at least 1"));
        }
        Ok(())
    }

    fn cli_overrides(&self) -> Result<Map<String, Value>> {
        let mut layer = self.set_overrides.clone();
        if let Some(image) = &self.base_image {
            layer.insert("base_image".to_string(), json!(image));
        }
        if let Some(path) = &self.requirements_file {
            layer.insert("requirements".to_string(), json!(read_requirements(path)?));
            layer.insert(
                "requirements_file".to_string(),
                json!(path.to_string_lossy()),
            );
        }
        Ok(layer)
    }
}

pub fn read_requirements(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path).map_err(|e| {
        LaunchError::configuration(format!(
            "cannot read requirements file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

pub struct RunSummary {
    pub experiments: Vec<ResolvedExperiment>,
    pub reports: Vec<DispatchReport>,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        let mut failed = false;
        for report in &self.reports {
            match &report.result {
                Ok(outcome) if outcome.exit_code() != 0 => return outcome.exit_code(),
                Ok(_) => {}
                Err(_) => failed = true,
            }
        }
        i32::from(failed)
    }

    pub fn to_json(&self) -> Value {
        let experiments: Vec<Value> = self
            .experiments
            .iter()
            .zip(&self.reports)
            .map(|(exp, report)| {
                let mut entry = exp.describe();
                let outcome = match &report.result {
                    Ok(outcome) => outcome.to_json(),
                    Err(e) => json!({"status": "failed", "code": e.code(), "message": e.to_string()}),
                };
                if let Some(obj) = entry.as_object_mut() {
                    obj.insert("outcome".to_string(), outcome);
                }
                entry
            })
            .collect();
        json!({
            "ok": self.exit_code() == 0,
            "exit_code": self.exit_code(),
            "count": self.experiments.len(),
            "experiments": experiments,
        })
    }
}

/// Resolves every selected experiment, then dispatches the batch.
///
/// Configuration and generation failures abort before any dispatch. Failures
/// inside a backend are recorded per experiment in the summary. The artefact
/// directory is removed before this returns, whatever the outcome.
pub fn run_experiments(request: &RunRequest, context: &Context) -> Result<RunSummary> {
    request.validate(context)?;
    let output_guard = match request.tracking_config {
        Some(_) => None,
        None => Some(TrackingOutputDir::create(tracking_output_dir(&request.script))?),
    };
    let output_dir = output_guard
        .as_ref()
        .map(|g| g.path().to_path_buf())
        .unwrap_or_else(|| tracking_output_dir(&request.script));

    let generator = ExperimentGenerator::new(
        &request.script,
        request.tracking_config.as_deref(),
        context,
        &request.spec_name,
        &output_dir,
    )?;
    let selected = generator.select(request.limit, request.shuffle)?;
    info!(
        selected = selected.len(),
        declared = generator.len(),
        context = %context.name,
        "experiments selected"
    );

    let cli_layer = request.cli_overrides()?;
    let context_layer = context.defaults_layer();
    let mut experiments = Vec::with_capacity(selected.len());
    for (index, spec) in selected {
        let artifact = relative_to_cwd(generator.materialize(index, &spec)?);
        let record = merge::merge(&cli_layer, &spec.record_layer(), &context_layer, None)?;
        let cmd = build_command(request, context, &spec, &record, &artifact)?;
        let experiment = ResolvedExperiment::new(index, record, cmd, Some(artifact))?;
        debug!(index, experiment = %experiment.describe(), "resolved experiment");
        experiments.push(experiment);
    }

    let kinds: BTreeSet<&str> = experiments.iter().map(|e| e.backend_type.as_str()).collect();
    for kind in kinds {
        check_preconditions(BackendKind::parse(kind)?, request.dry_run)?;
    }

    let reports = dispatch_all(&experiments, request.dry_run, request.workers)?;
    drop(output_guard);
    Ok(RunSummary {
        experiments,
        reports,
    })
}

// A cwd-relative path resolves both locally and inside the unpacked remote copy.
fn relative_to_cwd(path: PathBuf) -> PathBuf {
    if let Ok(cwd) = std::env::current_dir() {
        if let Ok(rel) = path.strip_prefix(&cwd) {
            return rel.to_path_buf();
        }
    }
    path
}

fn build_command(
    request: &RunRequest,
    context: &Context,
    spec: &ExperimentSpec,
    record: &Map<String, Value>,
    artifact: &Path,
) -> Result<ExperimentCommand> {
    let cmd = compose_script_command(&spec.script, &request.params, &request.rest_args);
    if !(context.tracking || request.tracking_config.is_some()) {
        return Ok(ExperimentCommand::Simple(SimpleCommand::new(cmd)));
    }

    let storage_dir = record
        .get("storage_dir")
        .map(util::value_to_plain_string)
        .unwrap_or_default();
    let mut wrapped = TrackingWrapperCommand::new(cmd, artifact.to_path_buf(), storage_dir);
    let mut tags = context.tags();
    for tag in spec.tags.iter().chain(&request.tags) {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    wrapped.tags = tags;
    wrapped.offline = request.offline;

    // Remote runs authenticate with the credential uploaded under this profile.
    if record.get("backend_type").and_then(Value::as_str) == Some(BackendKind::Slurm.as_str()) {
        if let Some(user_id) = record.get("user_id").and_then(Value::as_str) {
            if tracking::find_local_token()?.is_some() {
                wrapped.profile = Some(tracking::remote_profile_name(user_id));
            }
        }
    }
    Ok(ExperimentCommand::Tracking(wrapped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RunOutcome;

    fn ok(code: i32) -> DispatchReport {
        DispatchReport {
            index: 0,
            name: "e".to_string(),
            result: Ok(RunOutcome::Exited { code: Some(code) }),
        }
    }

    #[test]
    fn exit_code_prefers_first_process_failure() {
        let failed = DispatchReport {
            index: 1,
            name: "e".to_string(),
            result: Err(LaunchError::validation("x")),
        };
        let summary = RunSummary {
            experiments: Vec::new(),
            reports: vec![ok(0), failed, ok(3), ok(5)],
        };
        assert_eq!(summary.exit_code(), 3);
        let summary = RunSummary {
            experiments: Vec::new(),
            reports: vec![ok(0), ok(0)],
        };
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn backend_failure_alone_maps_to_one() {
        let summary = RunSummary {
            experiments: Vec::new(),
            reports: vec![
                ok(0),
                DispatchReport {
                    index: 1,
                    name: "e".to_string(),
                    result: Err(LaunchError::Precondition("x".to_string())),
                },
            ],
        };
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn requirements_skip_blank_and_comment_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("requirements.txt");
        fs::write(&path, "numpy==1.26\n\n# pinned\n torch \n").expect("write");
        assert_eq!(read_requirements(&path).expect("read"), vec!["numpy==1.26", "torch"]);
    }

    #[test]
    fn kubernetes_context_demands_image_and_requirements() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("train.py");
        fs::write(&script, "").expect("script");
        let context = Context::new("k8s", "kubernetes", "/data");
        let mut request = RunRequest::new(&script);
        let err = request.validate(&context).expect_err("no image");
        assert!(err.to_string().contains("--base_image"));
        request.base_image = Some("python:3.11".to_string());
        let err = request.validate(&context).expect_err("no requirements");
        assert!(err.to_string().contains("--requirements_file"));
    }

    #[test]
    fn tracking_config_and_descriptor_spec_are_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("train.py");
        fs::write(&script, "").expect("script");
        fs::write(dir.path().join("train.experiments.yaml"), "spec:\n  name: a\n").expect("descriptor");
        let config = dir.path().join("run.yaml");
        fs::write(&config, "name: b\n").expect("config");
        let context = Context::new("local", "local", "/tmp/s");
        let mut request = RunRequest::new(&script);
        assert!(request.validate(&context).is_ok());
        request.tracking_config = Some(config);
        let err = request.validate(&context).expect_err("both");
        assert!(matches!(err, LaunchError::Configuration(_)));
        assert!(err.to_string().contains("only one of"));
    }

    #[test]
    fn artifact_under_cwd_becomes_relative() {
        let cwd = std::env::current_dir().expect("cwd");
        let inside = cwd.join("xp_train").join("0000_a.yaml");
        assert_eq!(relative_to_cwd(inside), PathBuf::from("xp_train/0000_a.yaml"));
        let outside = PathBuf::from("/elsewhere/xp_train/0000_a.yaml");
        assert_eq!(relative_to_cwd(outside.clone()), outside);
    }

    #[test]
    fn missing_descriptor_without_tracking_config_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("train.py");
        fs::write(&script, "").expect("script");
        let context = Context::new("local", "local", "/tmp/s");
        let err = RunRequest::new(&script).validate(&context).expect_err("no spec");
        assert!(matches!(err, LaunchError::Configuration(_)));
        assert!(err.to_string().contains("--neptune"));
    }
}
