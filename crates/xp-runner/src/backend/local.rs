use super::{ExecutionBackend, RunOutcome};
use crate::command::RenderCommand;
use crate::errors::Result;
use crate::experiment::ResolvedExperiment;
use crate::util::random_id;
use chrono::Local;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info};

pub const TRACKING_CONFIG_ENV: &str = "XP_TRACKING_CONFIG_PATH";
pub const EXP_DIR_ENV: &str = "XP_EXP_DIR_PATH";
pub const STORAGE_DIR_ENV: &str = "XP_STORAGE_DIR";
const EXP_DIR_RANDOM_SUFFIX_SIZE: usize = 6;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnvOverlay {
    vars: BTreeMap<String, String>,
}

impl EnvOverlay {
    pub fn for_experiment(experiment: &ResolvedExperiment) -> Self {
        let mut vars = experiment.cmd.env();
        vars.extend(experiment.env.clone());
        vars.insert(STORAGE_DIR_ENV.to_string(), experiment.storage_dir.clone());
        vars.insert(
            EXP_DIR_ENV.to_string(),
            generate_exp_dir_path(&experiment.storage_dir),
        );
        if let Some(path) = &experiment.tracking_config_path {
            vars.insert(
                TRACKING_CONFIG_ENV.to_string(),
                path.to_string_lossy().to_string(),
            );
        }
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

fn generate_exp_dir_path(storage_dir: &str) -> String {
    let stamp = format!(
        "{}_{}",
        Local::now().format("%Y_%m_%d_%H_%M"),
        random_id(EXP_DIR_RANDOM_SUFFIX_SIZE)
    );
    Path::new(storage_dir).join(stamp).to_string_lossy().to_string()
}

#[derive(Debug, Clone, Default)]
pub struct LocalBackend;

impl ExecutionBackend for LocalBackend {
    fn run(&self, experiment: &ResolvedExperiment, dry_run: bool) -> Result<RunOutcome> {
        let command = experiment.cmd.command();
        let overlay = EnvOverlay::for_experiment(experiment);
        if dry_run {
            info!(index = experiment.index, command = %command, "dry run, not executing");
            return Ok(RunOutcome::DryRun {
                plan: json!({
                    "command": command,
                    "env": overlay.vars(),
                }),
            });
        }

        debug!(index = experiment.index, env = ?overlay.vars(), "local environment overlay");
        info!(index = experiment.index, command = %command, "executing");
        let status = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .envs(overlay.vars())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()?;
        Ok(RunOutcome::Exited {
            code: status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ExperimentCommand, SimpleCommand, TrackingWrapperCommand};
    use serde_json::{json, Map, Value};
    use std::path::PathBuf;

    fn resolved(env: Value, cmd: ExperimentCommand, tracking: Option<PathBuf>) -> ResolvedExperiment {
        let mut record = Map::new();
        record.insert("backend_type".to_string(), json!("local"));
        record.insert("storage_dir".to_string(), json!("/tmp/s"));
        record.insert("env".to_string(), env);
        ResolvedExperiment::new(0, record, cmd, tracking).expect("resolve")
    }

    #[test]
    fn overlay_layers_reserved_variables_last() {
        let mut cmd = TrackingWrapperCommand::new("python t.py", PathBuf::from("a.yaml"), "/tmp/s");
        cmd.profile = Some("p".to_string());
        let exp = resolved(
            json!({"NEPTUNE_PROFILE": "from-env", "XP_TRACKING_CONFIG_PATH": "spoofed", "A": "1"}),
            ExperimentCommand::Tracking(cmd),
            Some(PathBuf::from("xp_t/0000_t.yaml")),
        );
        let overlay = EnvOverlay::for_experiment(&exp);
        assert_eq!(overlay.get("NEPTUNE_PROFILE"), Some("from-env"));
        assert_eq!(overlay.get(TRACKING_CONFIG_ENV), Some("xp_t/0000_t.yaml"));
        assert_eq!(overlay.get("A"), Some("1"));
        assert_eq!(overlay.get(STORAGE_DIR_ENV), Some("/tmp/s"));
        assert!(overlay.get(EXP_DIR_ENV).expect("exp dir").starts_with("/tmp/s/"));
    }

    #[test]
    fn dry_run_does_not_spawn() {
        let exp = resolved(json!({}), ExperimentCommand::Simple(SimpleCommand::new("exit 9")), None);
        let outcome = LocalBackend.run(&exp, true).expect("dry run");
        assert!(matches!(outcome, RunOutcome::DryRun { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn exit_code_is_surfaced_unchanged() {
        let exp = resolved(
            json!({"MARKER": "42"}),
            ExperimentCommand::Simple(SimpleCommand::new("test \"$MARKER\" = 42 && exit 7")),
            None,
        );
        let outcome = LocalBackend.run(&exp, false).expect("run");
        assert_eq!(outcome, RunOutcome::Exited { code: Some(7) });
    }

    #[cfg(unix)]
    #[test]
    fn ambient_environment_is_not_mutated() {
        let exp = resolved(
            json!({"XP_LOCAL_BACKEND_TEST_ONLY": "1"}),
            ExperimentCommand::Simple(SimpleCommand::new("true")),
            None,
        );
        LocalBackend.run(&exp, false).expect("run");
        assert!(std::env::var_os("XP_LOCAL_BACKEND_TEST_ONLY").is_none());
    }
}
