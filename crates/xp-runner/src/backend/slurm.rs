//! Slurm over SSH: provision scratch space, ship code, submit.
//!
//! A deployment walks `Configured -> DirectoriesEnsured -> CodeDeployed ->
//! TokenDeployed -> Submitted`, or jumps straight to `DryRunReported`. Any
//! failing remote command stops the walk where it is; nothing already created
//! on the cluster is rolled back.

use super::{ExecutionBackend, RunOutcome};
use crate::command::RenderCommand;
use crate::errors::{LaunchError, Result};
use crate::experiment::ResolvedExperiment;
use crate::tracking::{find_local_token, remote_profile_name, remote_token_path};
use crate::util::{random_id, sanitize_file_name, shell_join, shell_quote, value_to_plain_string};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

pub const DEFAULT_SCRATCH_SUBDIR: &str = "xp_scratch";
pub const SCRATCH_DIR_RANDOM_SUFFIX_SIZE: usize = 6;
const ARCHIVE_NAME: &str = "xp_code.zip";
const DEFAULT_EXCLUDES: &[&str] = &[".git", "target", "__pycache__"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionType {
    #[default]
    Srun,
    Sbatch,
}

impl SubmissionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionType::Srun => "srun",
            SubmissionType::Sbatch => "sbatch",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlurmSettings {
    #[serde(default)]
    pub slurm_url: Option<String>,
    #[serde(default)]
    pub slurm_scratch_dir: Option<String>,
    #[serde(default)]
    pub scratch_subdir: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub venv: Option<String>,
    #[serde(default)]
    pub partition: Option<Value>,
    #[serde(default)]
    pub account: Option<Value>,
    #[serde(default)]
    pub log_output_path: Option<Value>,
    #[serde(default)]
    pub time: Option<Value>,
    #[serde(default)]
    pub ntasks: Option<Value>,
    #[serde(default)]
    pub num_nodes: Option<Value>,
    #[serde(default)]
    pub modules_to_load: Vec<String>,
    #[serde(default)]
    pub after_module_load_cmd: Option<String>,
    #[serde(default)]
    pub cmd_type: SubmissionType,
    #[serde(default)]
    pub requirements_file: Option<String>,
    #[serde(default)]
    pub paths_to_copy: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl SlurmSettings {
    fn user_id(&self) -> Result<&str> {
        self.user_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LaunchError::configuration("slurm experiments require \"user_id\""))
    }

    fn project(&self) -> &str {
        self.project.as_deref().filter(|s| !s.is_empty()).unwrap_or("default")
    }
}

fn flag_value(value: &Option<Value>) -> Option<String> {
    value
        .as_ref()
        .map(value_to_plain_string)
        .filter(|s| !s.is_empty())
}

fn remote_join(base: &str, child: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), child)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchPaths {
    pub project_scratch_dir: String,
    pub experiment_scratch_dir: String,
}

impl ScratchPaths {
    pub fn generate(
        scratch_root: &str,
        scratch_subdir: &str,
        user_id: &str,
        project: &str,
        experiment_name: &str,
    ) -> Self {
        let project_scratch_dir = remote_join(
            &remote_join(scratch_root, scratch_subdir),
            &format!("{}_{}", user_id, project),
        );
        let experiment_scratch_dir = remote_join(
            &project_scratch_dir,
            &format!(
                "{}_{}",
                sanitize_file_name(experiment_name),
                random_id(SCRATCH_DIR_RANDOM_SUFFIX_SIZE)
            ),
        );
        Self {
            project_scratch_dir,
            experiment_scratch_dir,
        }
    }

    pub fn script_path(&self) -> String {
        let relative = self
            .experiment_scratch_dir
            .strip_prefix(&self.project_scratch_dir)
            .unwrap_or(&self.experiment_scratch_dir)
            .trim_start_matches('/');
        remote_join(&self.project_scratch_dir, &format!("{}.sh", relative))
    }
}

pub fn translate_resources(
    resources: &Map<String, Value>,
    ntasks: Option<String>,
    num_nodes: Option<String>,
) -> Result<Vec<String>> {
    let mut items = Vec::new();
    for (resource_type, qty) in resources {
        let qty = value_to_plain_string(qty);
        match resource_type.as_str() {
            "cpu" => {
                items.push("-c".to_string());
                items.push(qty);
                if let Some(nodes) = &num_nodes {
                    items.push("-N".to_string());
                    items.push(nodes.clone());
                    debug!(num_nodes = %nodes, "running on nodes");
                }
                let tasks = ntasks.clone().unwrap_or_else(|| "1".to_string());
                debug!(ntasks = %tasks, "running tasks");
                items.push("-n".to_string());
                items.push(tasks);
            }
            "gpu" => {
                items.push("--gres".to_string());
                items.push(format!("gpu:{}", qty));
            }
            "mem" => {
                items.push("--mem".to_string());
                items.push(qty);
            }
            other => {
                return Err(LaunchError::UnsupportedResource {
                    key: other.to_string(),
                    value: qty,
                })
            }
        }
    }
    Ok(items)
}

pub fn build_submission_command(
    settings: &SlurmSettings,
    paths: &ScratchPaths,
    resources: &Map<String, Value>,
    script_path: &str,
) -> Result<String> {
    let mut items = vec![settings.cmd_type.as_str().to_string()];
    let mut push_flag = |flag: &str, value: Option<String>| {
        if let Some(value) = value {
            items.push(flag.to_string());
            items.push(value);
        }
    };
    let default_log = match settings.cmd_type {
        SubmissionType::Sbatch => Some(remote_join(&paths.experiment_scratch_dir, "slurm.log")),
        SubmissionType::Srun => None,
    };
    push_flag("-A", flag_value(&settings.account));
    push_flag("-o", flag_value(&settings.log_output_path).or(default_log));
    push_flag("-p", flag_value(&settings.partition));
    push_flag("-t", flag_value(&settings.time));

    items.extend(translate_resources(
        resources,
        flag_value(&settings.ntasks),
        flag_value(&settings.num_nodes),
    )?);
    items.push(script_path.to_string());
    Ok(shell_join(&items))
}

fn script_env(experiment: &ResolvedExperiment) -> BTreeMap<String, String> {
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
    env
}

pub fn render_script(
    settings: &SlurmSettings,
    paths: &ScratchPaths,
    experiment: &ResolvedExperiment,
) -> String {
    let mut lines = vec![
        "#!/usr/bin/env bash".to_string(),
        "set -e".to_string(),
        format!("cd {}", shell_quote(&paths.experiment_scratch_dir)),
    ];
    for module in &settings.modules_to_load {
        lines.push(format!("module load {}", module));
    }
    if let Some(after) = settings.after_module_load_cmd.as_deref().filter(|s| !s.is_empty()) {
        lines.push(after.to_string());
    }
    if let Some(venv) = settings.venv.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("source {}/bin/activate", venv));
    }
    if let Some(req) = settings.requirements_file.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("pip install -q -r {}", shell_quote(req)));
    }
    for (key, value) in script_env(experiment) {
        lines.push(format!("export {}={}", key, shell_quote(&value)));
    }
    lines.push(experiment.cmd.command());
    let mut script = lines.join("\n");
    script.push('\n');
    script
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployPath {
    pub local_path: PathBuf,
    pub rel_remote_path: String,
}

fn build_exclude_set(exclude: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in exclude.iter().map(String::as_str).chain(DEFAULT_EXCLUDES.iter().copied()) {
        let glob = Glob::new(pattern.trim_end_matches('/')).map_err(|e| {
            LaunchError::configuration(format!("invalid exclude pattern '{}': {}", pattern, e))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| LaunchError::configuration(format!("invalid exclude patterns: {}", e)))
}

fn is_excluded(set: &GlobSet, exclude: &[String], rel: &Path) -> bool {
    if set.is_match(rel) {
        return true;
    }
    if let Some(name) = rel.file_name() {
        if set.is_match(Path::new(name)) {
            return true;
        }
    }
    exclude.iter().any(|ex| rel.starts_with(ex.trim_end_matches('/')))
}

fn walk_files(
    root: &Path,
    prefix: &Path,
    set: &GlobSet,
    exclude: &[String],
    out: &mut Vec<DeployPath>,
) -> Result<()> {
    let walker = walkdir::WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| {
            let rel = e.path().strip_prefix(root).unwrap_or(e.path());
            rel.as_os_str().is_empty() || !is_excluded(set, exclude, rel)
        });
    for entry in walker {
        let entry = entry.map_err(|e| LaunchError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let remote = prefix.join(rel);
        out.push(DeployPath {
            local_path: entry.path().to_path_buf(),
            rel_remote_path: remote.to_string_lossy().replace('\\', "/"),
        });
    }
    Ok(())
}

pub fn collect_deploy_paths(
    cwd: &Path,
    paths_to_copy: &[String],
    exclude: &[String],
) -> Result<Vec<DeployPath>> {
    let set = build_exclude_set(exclude)?;
    let mut out = Vec::new();
    walk_files(cwd, Path::new(""), &set, exclude, &mut out)?;
    for extra in paths_to_copy {
        let local = cwd.join(extra);
        let name = local
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(PathBuf::from))
            .ok_or_else(|| {
                LaunchError::configuration(format!("path to copy not found: {}", local.display()))
            })?;
        if local.is_dir() {
            walk_files(&local, &name, &set, exclude, &mut out)?;
        } else {
            out.push(DeployPath {
                local_path: local,
                rel_remote_path: name.to_string_lossy().to_string(),
            });
        }
    }
    out.sort_by(|a, b| a.rel_remote_path.cmp(&b.rel_remote_path));
    out.dedup_by(|a, b| a.rel_remote_path == b.rel_remote_path);
    Ok(out)
}

pub fn write_archive(paths: &[DeployPath], dest: &Path) -> Result<()> {
    let file = fs::File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);
    for p in paths {
        debug!(path = %p.rel_remote_path, "adding to deployment archive");
        let mut options =
            zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&p.local_path)?.permissions().mode();
            options = options.unix_permissions(mode);
        }
        zip.start_file(p.rel_remote_path.clone(), options)
            .map_err(zip_error)?;
        let bytes = fs::read(&p.local_path)?;
        zip.write_all(&bytes)?;
    }
    zip.finish().map_err(zip_error)?;
    Ok(())
}

fn zip_error(e: zip::result::ZipError) -> LaunchError {
    LaunchError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

pub trait RemoteHost {
    fn host(&self) -> &str;
    fn run(&self, command: &str) -> Result<String>;
    fn put(&self, local: &Path, remote: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SshHost {
    url: String,
}

impl SshHost {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn check(&self, command: String, output: std::process::Output) -> Result<String> {
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(LaunchError::RemoteExecution {
            host: self.url.clone(),
            command,
            status: output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            output: format!("{}{}", stdout, stderr).trim().to_string(),
        })
    }
}

impl RemoteHost for SshHost {
    fn host(&self) -> &str {
        &self.url
    }

    fn run(&self, command: &str) -> Result<String> {
        debug!(host = %self.url, command, "remote run");
        let output = Command::new("ssh")
            .args(["-q", "-o", "BatchMode=yes", &self.url, command])
            .stdin(Stdio::null())
            .output()?;
        self.check(command.to_string(), output)
    }

    fn put(&self, local: &Path, remote: &str) -> Result<()> {
        let target = format!("{}:{}", self.url, remote);
        debug!(local = %local.display(), target = %target, "remote put");
        let output = Command::new("rsync")
            .args(["-q", "-e", "ssh -q -o BatchMode=yes"])
            .arg(local)
            .arg(&target)
            .stdin(Stdio::null())
            .output()?;
        self.check(format!("rsync {} {}", local.display(), target), output)
            .map(|_| ())
    }
}

pub fn ensure_ssh_agent() -> Result<()> {
    let status = Command::new("ssh-add")
        .arg("-l")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(s) if s.success() => Ok(()),
        _ => Err(LaunchError::Precondition(
            "no keys in ssh agent; add your private key using 'ssh-add'".to_string(),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlurmStage {
    Configured,
    DirectoriesEnsured,
    CodeDeployed,
    TokenDeployed,
    Submitted,
    DryRunReported,
}

pub struct SlurmDeployment<'a, R: RemoteHost> {
    remote: &'a R,
    experiment: &'a ResolvedExperiment,
    settings: SlurmSettings,
    paths: ScratchPaths,
    cwd: PathBuf,
    local_token: Option<PathBuf>,
    script_path: Option<String>,
    stage: SlurmStage,
}

impl<'a, R: RemoteHost> SlurmDeployment<'a, R> {
    pub fn new(
        remote: &'a R,
        experiment: &'a ResolvedExperiment,
        settings: SlurmSettings,
        paths: ScratchPaths,
        cwd: PathBuf,
        local_token: Option<PathBuf>,
    ) -> Self {
        Self {
            remote,
            experiment,
            settings,
            paths,
            cwd,
            local_token,
            script_path: None,
            stage: SlurmStage::Configured,
        }
    }

    pub fn stage(&self) -> SlurmStage {
        self.stage
    }

    fn require_stage(&self, expected: SlurmStage, next: SlurmStage) -> Result<()> {
        if self.stage == expected {
            return Ok(());
        }
        Err(LaunchError::validation(format!(
            "slurm deployment of experiment {} cannot move from {:?} to {:?}",
            self.experiment.index, self.stage, next
        )))
    }

    fn advance(&mut self, to: SlurmStage) {
        self.stage = to;
        info!(index = self.experiment.index, host = self.remote.host(), stage = ?to, "slurm stage");
    }

    fn ensure_remote_dir(&self, dir: &str) -> Result<()> {
        self.remote.run(&format!("mkdir -p {}", shell_quote(dir)))?;
        Ok(())
    }

    pub fn ensure_directories(&mut self) -> Result<()> {
        self.require_stage(SlurmStage::Configured, SlurmStage::DirectoriesEnsured)?;
        self.ensure_remote_dir(&self.paths.experiment_scratch_dir)?;
        self.ensure_remote_dir(&self.experiment.storage_dir)?;
        self.advance(SlurmStage::DirectoriesEnsured);
        Ok(())
    }

    pub fn deploy_code(&mut self) -> Result<String> {
        self.require_stage(SlurmStage::DirectoriesEnsured, SlurmStage::CodeDeployed)?;
        let files = collect_deploy_paths(&self.cwd, &self.settings.paths_to_copy, &self.settings.exclude)?;
        let staging = tempfile::tempdir()?;

        let archive = staging.path().join(ARCHIVE_NAME);
        write_archive(&files, &archive)?;
        let remote_archive = remote_join(&self.paths.experiment_scratch_dir, ARCHIVE_NAME);
        self.remote.put(&archive, &remote_archive)?;
        self.remote.run(&format!(
            "cd {} && unzip -q -o {} && rm {}",
            shell_quote(&self.paths.experiment_scratch_dir),
            ARCHIVE_NAME,
            ARCHIVE_NAME
        ))?;

        let script = render_script(&self.settings, &self.paths, self.experiment);
        let local_script = staging.path().join("experiment.sh");
        fs::write(&local_script, script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&local_script, fs::Permissions::from_mode(0o755))?;
        }
        let remote_script = self.paths.script_path();
        self.remote.put(&local_script, &remote_script)?;

        info!(index = self.experiment.index, files = files.len(), script = %remote_script, "code deployed");
        self.script_path = Some(remote_script.clone());
        self.advance(SlurmStage::CodeDeployed);
        Ok(remote_script)
    }

    pub fn deploy_token(&mut self) -> Result<bool> {
        self.require_stage(SlurmStage::CodeDeployed, SlurmStage::TokenDeployed)?;
        let uploaded = match &self.local_token {
            Some(local) => {
                let profile = remote_profile_name(self.settings.user_id()?);
                let remote_path = remote_token_path(&profile);
                if let Some((dir, _)) = remote_path.rsplit_once('/') {
                    self.ensure_remote_dir(dir)?;
                }
                self.remote.put(local, &remote_path)?;
                true
            }
            None => {
                debug!(index = self.experiment.index, "no local tracking token, skipping");
                false
            }
        };
        self.advance(SlurmStage::TokenDeployed);
        Ok(uploaded)
    }

    pub fn submit(&mut self) -> Result<String> {
        self.require_stage(SlurmStage::TokenDeployed, SlurmStage::Submitted)?;
        let script_path = self.script_path.clone().ok_or_else(|| {
            LaunchError::validation(format!(
                "experiment {} has no deployed submission script",
                self.experiment.index
            ))
        })?;
        let command = build_submission_command(
            &self.settings,
            &self.paths,
            &self.experiment.resources,
            &script_path,
        )?;
        info!(index = self.experiment.index, command = %command, "submitting");
        let output = self.remote.run(&command)?;
        self.advance(SlurmStage::Submitted);
        Ok(output)
    }

    pub fn report_dry_run(&mut self) -> Result<Value> {
        self.require_stage(SlurmStage::Configured, SlurmStage::DryRunReported)?;
        let script_path = self.paths.script_path();
        let command = build_submission_command(
            &self.settings,
            &self.paths,
            &self.experiment.resources,
            &script_path,
        )?;
        info!(index = self.experiment.index, command = %command, "dry run, not submitting");
        let plan = json!({
            "slurm_url": self.settings.slurm_url,
            "experiment_scratch_dir": self.paths.experiment_scratch_dir,
            "script_path": script_path,
            "submission": command,
            "script": render_script(&self.settings, &self.paths, self.experiment),
        });
        self.advance(SlurmStage::DryRunReported);
        Ok(plan)
    }

    pub fn run_all(mut self) -> Result<RunOutcome> {
        self.ensure_directories()?;
        self.deploy_code()?;
        self.deploy_token()?;
        let output = self.submit()?;
        Ok(RunOutcome::Submitted { output })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SlurmBackend;

impl ExecutionBackend for SlurmBackend {
    fn run(&self, experiment: &ResolvedExperiment, dry_run: bool) -> Result<RunOutcome> {
        let settings: SlurmSettings = experiment.settings()?;
        let user_id = settings.user_id()?.to_string();
        let subdir = settings
            .scratch_subdir
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SCRATCH_SUBDIR.to_string());

        // Reject bad resource requests before touching the cluster.
        translate_resources(
            &experiment.resources,
            flag_value(&settings.ntasks),
            flag_value(&settings.num_nodes),
        )?;

        if dry_run {
            let root = settings
                .slurm_scratch_dir
                .clone()
                .unwrap_or_else(|| "$SCRATCH".to_string());
            let paths = ScratchPaths::generate(&root, &subdir, &user_id, settings.project(), &experiment.name);
            let remote = SshHost::new(settings.slurm_url.clone().unwrap_or_default());
            let mut deployment =
                SlurmDeployment::new(&remote, experiment, settings, paths, PathBuf::new(), None);
            let plan = deployment.report_dry_run()?;
            return Ok(RunOutcome::DryRun { plan });
        }

        let url = settings
            .slurm_url
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LaunchError::configuration("slurm experiments require \"slurm_url\""))?;
        let remote = SshHost::new(url);
        let root = match settings.slurm_scratch_dir.clone().filter(|s| !s.is_empty()) {
            Some(root) => root,
            None => {
                let echoed = remote.run("echo $SCRATCH")?.trim().to_string();
                if echoed.is_empty() {
                    return Err(LaunchError::configuration(format!(
                        "$SCRATCH is empty on {}; set \"slurm_scratch_dir\"",
                        remote.host()
                    )));
                }
                echoed
            }
        };
        let paths = ScratchPaths::generate(&root, &subdir, &user_id, settings.project(), &experiment.name);
        let cwd = std::env::current_dir()?;
        let token = find_local_token()?;
        SlurmDeployment::new(&remote, experiment, settings, paths, cwd, token).run_all()
    }
}
