use crate::errors::{LaunchError, Result};
use crate::util::atomic_write_bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

// Relative to the home directory.
pub const LOCAL_TOKEN_CANDIDATES: &[&str] = &[".neptune_tokens/token", ".neptune/tokens/token"];
const REMOTE_TOKEN_ROOT: &str = ".neptune/tokens";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingArtifact {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl TrackingArtifact {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            LaunchError::configuration(format!(
                "cannot read tracking config {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_yaml::from_str(&raw).map_err(|e| {
            LaunchError::configuration(format!(
                "invalid tracking config {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let raw = serde_yaml::to_string(self)?;
        atomic_write_bytes(path, raw.as_bytes())
    }
}

pub fn find_local_token() -> Result<Option<PathBuf>> {
    let Some(home) = dirs::home_dir() else {
        return Ok(None);
    };
    select_token(&token_candidates(&home))
}

fn token_candidates(home: &Path) -> Vec<PathBuf> {
    LOCAL_TOKEN_CANDIDATES.iter().map(|p| home.join(p)).collect()
}

fn select_token(candidates: &[PathBuf]) -> Result<Option<PathBuf>> {
    let present: Vec<&PathBuf> = candidates.iter().filter(|p| p.is_file()).collect();
    match present.as_slice() {
        [] => Ok(None),
        [one] => Ok(Some((*one).clone())),
        many => Err(LaunchError::configuration(format!(
            "you have multiple tracking tokens ({}); remove obsolete",
            many.iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

pub fn remote_profile_name(user_id: &str) -> String {
    format!("{}-{}", user_id, local_hostname())
}

pub fn remote_token_path(profile: &str) -> String {
    format!("{}/{}/token", REMOTE_TOKEN_ROOT, profile)
}

pub fn local_hostname() -> String {
    system_hostname()
        .or_else(|| non_empty(fs::read_to_string("/etc/hostname").ok()))
        .or_else(|| non_empty(std::env::var("HOSTNAME").ok()))
        .unwrap_or_else(|| "localhost".to_string())
}

fn system_hostname() -> Option<String> {
    let output = Command::new("hostname")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    non_empty(Some(String::from_utf8_lossy(&output.stdout).to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
