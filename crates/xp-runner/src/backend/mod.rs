pub mod kubernetes;
pub mod local;
pub mod slurm;

use crate::errors::{LaunchError, Result};
use crate::experiment::ResolvedExperiment;
use serde_json::{json, Value};
use tracing::{info, warn};

pub use kubernetes::KubernetesBackend;
pub use local::LocalBackend;
pub use slurm::SlurmBackend;

pub const DEFAULT_WORKERS: usize = 6;

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Exited { code: Option<i32> },
    Submitted { output: String },
    DryRun { plan: Value },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Exited { code: Some(code) } => *code,
            RunOutcome::Exited { code: None } => 1,
            RunOutcome::Submitted { .. } | RunOutcome::DryRun { .. } => 0,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            RunOutcome::Exited { code } => json!({"status": "exited", "exit_code": code}),
            RunOutcome::Submitted { output } => json!({"status": "submitted", "output": output}),
            RunOutcome::DryRun { plan } => json!({"status": "dry_run", "plan": plan}),
        }
    }
}

pub trait ExecutionBackend {
    fn run(&self, experiment: &ResolvedExperiment, dry_run: bool) -> Result<RunOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Slurm,
    Kubernetes,
}

impl BackendKind {
    pub fn parse(backend_type: &str) -> Result<Self> {
        match backend_type {
            "local" => Ok(BackendKind::Local),
            "slurm" => Ok(BackendKind::Slurm),
            "kubernetes" => Ok(BackendKind::Kubernetes),
            other => Err(LaunchError::configuration(format!(
                "unknown backend type \"{}\" (expected local, slurm or kubernetes)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Slurm => "slurm",
            BackendKind::Kubernetes => "kubernetes",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Backend {
    Local(LocalBackend),
    Slurm(SlurmBackend),
    Kubernetes(KubernetesBackend),
}

impl Backend {
    pub fn for_kind(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Local => Backend::Local(LocalBackend::default()),
            BackendKind::Slurm => Backend::Slurm(SlurmBackend::default()),
            BackendKind::Kubernetes => Backend::Kubernetes(KubernetesBackend::default()),
        }
    }
}

impl ExecutionBackend for Backend {
    fn run(&self, experiment: &ResolvedExperiment, dry_run: bool) -> Result<RunOutcome> {
        match self {
            Backend::Local(b) => b.run(experiment, dry_run),
            Backend::Slurm(b) => b.run(experiment, dry_run),
            Backend::Kubernetes(b) => b.run(experiment, dry_run),
        }
    }
}

pub fn check_preconditions(kind: BackendKind, dry_run: bool) -> Result<()> {
    match kind {
        BackendKind::Slurm if !dry_run => slurm::ensure_ssh_agent(),
        _ => Ok(()),
    }
}

pub fn dispatch(experiment: &ResolvedExperiment, dry_run: bool) -> Result<RunOutcome> {
    let kind = BackendKind::parse(&experiment.backend_type)?;
    info!(
        index = experiment.index,
        name = %experiment.name,
        backend = kind.as_str(),
        dry_run,
        "dispatching experiment"
    );
    Backend::for_kind(kind).run(experiment, dry_run)
}

#[derive(Debug)]
pub struct DispatchReport {
    pub index: usize,
    pub name: String,
    pub result: Result<RunOutcome>,
}

/// Dispatches every experiment. One experiment runs inline; more are spread
/// over a pool of `workers` threads. Every experiment is attempted: a failure
/// is recorded in its report and never stops its siblings.
pub fn dispatch_all(
    experiments: &[ResolvedExperiment],
    dry_run: bool,
    workers: usize,
) -> Result<Vec<DispatchReport>> {
    let run_one = |experiment: &ResolvedExperiment| {
        let result = dispatch(experiment, dry_run);
        if let Err(e) = &result {
            warn!(index = experiment.index, name = %experiment.name, error = %e, "experiment failed");
        }
        DispatchReport {
            index: experiment.index,
            name: experiment.name.clone(),
            result,
        }
    };

    if experiments.len() <= 1 || workers <= 1 {
        return Ok(experiments.iter().map(run_one).collect());
    }

    use rayon::prelude::*;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| LaunchError::Precondition(format!("cannot start worker pool: {}", e)))?;
    Ok(pool.install(|| experiments.par_iter().map(run_one).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ExperimentCommand, SimpleCommand};
    use serde_json::Map;

    fn experiment(index: usize, backend_type: &str, cmd: &str) -> ResolvedExperiment {
        let mut record = Map::new();
        record.insert("backend_type".to_string(), json!(backend_type));
        record.insert("storage_dir".to_string(), json!("/tmp/s"));
        record.insert("name".to_string(), json!(format!("exp{}", index)));
        ResolvedExperiment::new(
            index,
            record,
            ExperimentCommand::Simple(SimpleCommand::new(cmd)),
            None,
        )
        .expect("resolve")
    }

    #[test]
    fn unknown_backend_type_is_configuration_error() {
        let exp = experiment(0, "mesos", "true");
        let err = dispatch(&exp, true).expect_err("unknown backend");
        assert!(matches!(err, LaunchError::Configuration(_)));
        assert!(err.to_string().contains("mesos"));
    }

    #[test]
    fn backend_kind_round_trips_names() {
        for name in ["local", "slurm", "kubernetes"] {
            assert_eq!(BackendKind::parse(name).expect("known").as_str(), name);
        }
    }

    #[test]
    fn exit_codes_follow_outcome() {
        assert_eq!(RunOutcome::Exited { code: Some(3) }.exit_code(), 3);
        assert_eq!(RunOutcome::Exited { code: None }.exit_code(), 1);
        assert_eq!(RunOutcome::DryRun { plan: json!({}) }.exit_code(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn fan_out_runs_all_and_keeps_failures_isolated() {
        let experiments = vec![
            experiment(0, "local", "exit 0"),
            experiment(1, "bogus", "exit 0"),
            experiment(2, "local", "exit 4"),
            experiment(3, "local", "true"),
        ];
        let reports = dispatch_all(&experiments, false, 3).expect("pool");
        assert_eq!(reports.len(), 4);
        let indices: Vec<_> = reports.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(reports[0].result.as_ref().expect("ok").exit_code(), 0);
        assert!(reports[1].result.is_err());
        assert_eq!(reports[2].result.as_ref().expect("ok").exit_code(), 4);
        assert_eq!(reports[3].result.as_ref().expect("ok").exit_code(), 0);
    }
}
