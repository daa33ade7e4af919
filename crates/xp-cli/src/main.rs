use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use xp_runner::backend::{BackendKind, RunOutcome, DEFAULT_WORKERS};
use xp_runner::config::{default_config_path, ConfigFile, Context};
use xp_runner::errors::LaunchError;
use xp_runner::generator::DEFAULT_SPEC_NAME;
use xp_runner::util::{bindings_to_object, parse_set_bindings};
use xp_runner::{run_experiments, RunRequest, RunSummary};

#[derive(Parser)]
#[command(name = "xp", version = "0.3.0", about = "Launch experiments on local, Slurm or Kubernetes backends")]
struct Cli {
    /// Log at DEBUG level (RUST_LOG still wins when set).
    #[arg(long, global = true)]
    debug: bool,
    /// Config file (default: xp/config.yaml under the user config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Context to use instead of the active one.
    #[arg(long, global = true)]
    context: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run SCRIPT once per experiment its descriptor declares.
    Run {
        /// Tracking config to use as-is; skips the descriptor.
        #[arg(long)]
        neptune: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_SPEC_NAME)]
        spec: String,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long = "requirements_file")]
        requirements_file: Option<PathBuf>,
        #[arg(long = "base_image")]
        base_image: Option<String>,
        #[arg(long)]
        offline: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        shuffle: bool,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long, default_value_t = DEFAULT_WORKERS)]
        workers: usize,
        #[arg(long)]
        json: bool,
        script: PathBuf,
        params: Vec<String>,
        #[arg(last = true)]
        rest_args: Vec<String>,
    },
    /// Manage named contexts.
    #[command(subcommand)]
    Context(ContextCommands),
}

#[derive(Subcommand)]
enum ContextCommands {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        backend_type: String,
        #[arg(long)]
        storage_dir: String,
        #[arg(long)]
        tracking: bool,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        force: bool,
    },
    SetActive {
        name: String,
    },
    List {
        #[arg(long)]
        json: bool,
    },
    Show {
        name: String,
        #[arg(long)]
        json: bool,
    },
    Delete {
        name: String,
    },
    Copy {
        src: String,
        dst: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let json_mode = command_json_mode(&cli.command);
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    debug!(config = %config_path.display(), "using config file");
    let result = run_command(cli.command, &config_path, cli.context.as_deref());
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(command: Commands, config_path: &Path, context: Option<&str>) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            neptune,
            spec,
            tags,
            requirements_file,
            base_image,
            offline,
            dry_run,
            limit,
            shuffle,
            set_values,
            workers,
            json,
            script,
            params,
            rest_args,
        } => {
            let config = ConfigFile::load(config_path)?;
            let context = config.active_context(context)?;
            let set_overrides = match bindings_to_object(&parse_set_bindings(&set_values)?)? {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            let request = RunRequest {
                tracking_config: neptune,
                spec_name: spec,
                tags,
                requirements_file,
                base_image,
                offline,
                dry_run,
                limit,
                shuffle,
                params,
                rest_args,
                set_overrides,
                workers,
                ..RunRequest::new(script)
            };
            let summary = run_experiments(&request, &context)?;
            let exit_code = summary.exit_code();
            if json {
                let mut payload = summary.to_json();
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert("command".to_string(), json!("run"));
                    obj.insert("context".to_string(), json!(context.name));
                    obj.insert("dry_run".to_string(), json!(dry_run));
                }
                emit_json(&payload);
            } else {
                print_run_summary(&context, &summary);
            }
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(None)
        }
        Commands::Context(sub) => run_context_command(sub, config_path),
    }
}

fn run_context_command(command: ContextCommands, config_path: &Path) -> Result<Option<Value>> {
    let mut config = ConfigFile::load(config_path)?;
    match command {
        ContextCommands::Add {
            name,
            backend_type,
            storage_dir,
            tracking,
            set_values,
            force,
        } => {
            BackendKind::parse(&backend_type)?;
            let mut context = Context::new(&name, &backend_type, &storage_dir);
            context.tracking = tracking;
            if let Value::Object(defaults) = bindings_to_object(&parse_set_bindings(&set_values)?)? {
                context.defaults = defaults;
            }
            config.add_context(&context, force)?;
            config.save(config_path)?;
            println!("added context: {}", name);
        }
        ContextCommands::SetActive { name } => {
            config.set_active(&name)?;
            config.save(config_path)?;
            println!("active context: {}", name);
        }
        ContextCommands::List { json } => {
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "context list",
                    "current_context": config.current_context,
                    "contexts": config.contexts.keys().collect::<Vec<_>>(),
                })));
            }
            for name in config.contexts.keys() {
                let marker = if config.current_context.as_deref() == Some(name.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{} {}", marker, name);
            }
        }
        ContextCommands::Show { name, json } => {
            let context = config.context(&name)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "context show",
                    "context": context.to_value(),
                })));
            }
            println!("name: {}", context.name);
            println!("backend_type: {}", context.backend_type);
            println!("storage_dir: {}", context.storage_dir);
            println!("tracking: {}", context.tracking);
            for (key, value) in &context.defaults {
                println!("{}: {}", key, value);
            }
        }
        ContextCommands::Delete { name } => {
            config.remove_context(&name)?;
            config.save(config_path)?;
            println!("deleted context: {}", name);
        }
        ContextCommands::Copy { src, dst } => {
            config.copy_context(&src, &dst)?;
            config.save(config_path)?;
            println!("copied context: {} -> {}", src, dst);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn error_code(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<LaunchError>()
        .map(LaunchError::code)
        .unwrap_or("command_failed")
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Context(ContextCommands::List { json })
        | Commands::Context(ContextCommands::Show { json, .. }) => *json,
        _ => false,
    }
}

fn print_run_summary(context: &Context, summary: &RunSummary) {
    println!("context: {} ({})", context.name, context.backend_type);
    println!("experiments: {}", summary.experiments.len());
    for (experiment, report) in summary.experiments.iter().zip(&summary.reports) {
        let status = match &report.result {
            Ok(RunOutcome::Exited { code }) => match code {
                Some(code) => format!("exited {}", code),
                None => "killed by signal".to_string(),
            },
            Ok(RunOutcome::Submitted { output }) => format!("submitted {}", output.trim()),
            Ok(RunOutcome::DryRun { plan }) => format!("dry run {}", plan),
            Err(e) => format!("failed: {}", e),
        };
        println!("[{}] {}: {}", experiment.index, experiment.name, status);
    }
}
