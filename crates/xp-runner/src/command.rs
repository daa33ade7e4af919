use crate::util::{shell_join, shell_quote};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const TRACKING_PROFILE_ENV: &str = "NEPTUNE_PROFILE";
pub const WRAPPED_COMMAND_ENV: &str = "XP_WRAPPED_COMMAND";
pub const DEFAULT_TRACKING_BIN: &str = "neptune";

pub trait RenderCommand {
    fn command(&self) -> String;
    fn env(&self) -> BTreeMap<String, String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleCommand {
    pub cmd: String,
    pub env: BTreeMap<String, String>,
}

impl SimpleCommand {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            env: BTreeMap::new(),
        }
    }
}

impl RenderCommand for SimpleCommand {
    fn command(&self) -> String {
        self.cmd.clone()
    }

    fn env(&self) -> BTreeMap<String, String> {
        self.env.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackingWrapperCommand {
    pub cmd: String,
    pub config_path: PathBuf,
    pub storage_dir: String,
    pub tags: Vec<String>,
    pub offline: bool,
    pub profile: Option<String>,
    pub tracking_bin: String,
}

impl TrackingWrapperCommand {
    pub fn new(cmd: impl Into<String>, config_path: PathBuf, storage_dir: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            config_path,
            storage_dir: storage_dir.into(),
            tags: Vec::new(),
            offline: false,
            profile: None,
            tracking_bin: DEFAULT_TRACKING_BIN.to_string(),
        }
    }
}

impl RenderCommand for TrackingWrapperCommand {
    fn command(&self) -> String {
        let mut parts = vec![
            self.tracking_bin.clone(),
            "run".to_string(),
            "--config".to_string(),
            self.config_path.to_string_lossy().to_string(),
            "--storage".to_string(),
            self.storage_dir.clone(),
        ];
        if let Some(profile) = &self.profile {
            parts.push("--profile".to_string());
            parts.push(profile.clone());
        }
        if !self.tags.is_empty() {
            parts.push("--tags".to_string());
            parts.extend(self.tags.iter().cloned());
        }
        if self.offline {
            parts.push("--offline".to_string());
        }
        parts.push("--".to_string());
        // The wrapped command is already a shell string; it must not be re-quoted.
        format!("{} {}", shell_join(&parts), self.cmd)
    }

    fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(WRAPPED_COMMAND_ENV.to_string(), self.cmd.clone());
        if let Some(profile) = &self.profile {
            env.insert(TRACKING_PROFILE_ENV.to_string(), profile.clone());
        }
        env
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExperimentCommand {
    Simple(SimpleCommand),
    Tracking(TrackingWrapperCommand),
}

impl RenderCommand for ExperimentCommand {
    fn command(&self) -> String {
        match self {
            ExperimentCommand::Simple(c) => c.command(),
            ExperimentCommand::Tracking(c) => c.command(),
        }
    }

    fn env(&self) -> BTreeMap<String, String> {
        match self {
            ExperimentCommand::Simple(c) => c.env(),
            ExperimentCommand::Tracking(c) => c.env(),
        }
    }
}

pub fn compose_script_command(script: &str, params: &[String], rest_args: &[String]) -> String {
    let mut cmd = script.to_string();
    for part in params.iter().chain(rest_args.iter()) {
        cmd.push(' ');
        cmd.push_str(&shell_quote(part));
    }
    cmd
}
