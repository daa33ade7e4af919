use crate::config::Context;
use crate::errors::{LaunchError, Result};
use crate::experiment::ExperimentSpec;
use crate::merge::deep_merge_maps;
use crate::tracking::TrackingArtifact;
use crate::util::{ensure_dir, sanitize_file_name, shell_quote, yaml_to_json};
use rand::seq::SliceRandom;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_SPEC_NAME: &str = "spec";
pub const DESCRIPTOR_SUFFIX: &str = "experiments.yaml";
const OUTPUT_DIR_PREFIX: &str = "xp_";

pub fn descriptor_path(script: &Path) -> PathBuf {
    script.with_file_name(format!("{}.{}", script_stem(script), DESCRIPTOR_SUFFIX))
}

pub fn tracking_output_dir(script: &Path) -> PathBuf {
    script.with_file_name(format!("{}{}", OUTPUT_DIR_PREFIX, script_stem(script)))
}

fn script_stem(script: &Path) -> String {
    script
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("script")
        .to_string()
}

fn ensure_script_exists(script: &Path) -> Result<()> {
    if script.is_file() {
        Ok(())
    } else {
        Err(LaunchError::configuration(format!(
            "script not found: {}",
            script.display()
        )))
    }
}

pub fn has_spec(script: &Path, spec_name: &str) -> Result<bool> {
    ensure_script_exists(script)?;
    let path = descriptor_path(script);
    if !path.is_file() {
        return Ok(false);
    }
    let descriptor = yaml_to_json(&fs::read_to_string(&path)?)?;
    Ok(descriptor.get(spec_name).is_some())
}

pub fn default_script_command(script: &Path) -> String {
    let quoted = shell_quote(&script.to_string_lossy());
    match script.extension().and_then(|e| e.to_str()) {
        Some("py") => format!("python {}", quoted),
        Some("sh") => format!("bash {}", quoted),
        _ => quoted,
    }
}

#[derive(Debug)]
pub struct TrackingOutputDir {
    path: PathBuf,
}

impl TrackingOutputDir {
    pub fn create(path: PathBuf) -> Result<Self> {
        ensure_dir(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TrackingOutputDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove tracking output dir");
            }
        }
    }
}

#[derive(Debug, Clone)]
struct GridSpace {
    keys: Vec<String>,
    values: Vec<Vec<Value>>,
}

impl GridSpace {
    fn parse(grid: &Map<String, Value>) -> Result<Self> {
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for (key, value) in grid {
            let list = value.as_array().ok_or_else(|| {
                LaunchError::generation(0, format!("grid value for '{}' is not a list", key))
            })?;
            keys.push(key.clone());
            values.push(list.clone());
        }
        Ok(Self { keys, values })
    }

    fn len(&self) -> usize {
        if self.keys.is_empty() {
            return 1;
        }
        self.values.iter().map(|v| v.len()).product()
    }

    // Mixed-radix decode of `index`; keys iterate in sorted order and the last
    // one varies fastest.
    fn point(&self, mut index: usize) -> Map<String, Value> {
        let mut point = Map::new();
        for (key, values) in self.keys.iter().zip(&self.values).rev() {
            let radix = values.len();
            point.insert(key.clone(), values[index % radix].clone());
            index /= radix;
        }
        point
    }
}

#[derive(Debug, Clone)]
enum SpecSource {
    Explicit(Box<ExperimentSpec>),
    Grid { base: Map<String, Value>, space: GridSpace },
    List { base: Map<String, Value>, entries: Vec<Value> },
}

impl SpecSource {
    fn len(&self) -> usize {
        match self {
            SpecSource::Explicit(_) => 1,
            SpecSource::Grid { space, .. } => space.len(),
            SpecSource::List { entries, .. } => entries.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentGenerator {
    source: SpecSource,
    output_dir: PathBuf,
    explicit_artifact: Option<PathBuf>,
    default_name: String,
    default_script: String,
    context_tags: Vec<String>,
    context_project: Option<String>,
}

impl ExperimentGenerator {
    pub fn new(
        script: &Path,
        tracking_config: Option<&Path>,
        context: &Context,
        spec_name: &str,
        output_dir: &Path,
    ) -> Result<Self> {
        ensure_script_exists(script)?;
        let default_name = script_stem(script);
        let default_script = default_script_command(script);
        let context_project = context
            .defaults
            .get("project")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let mut generator = Self {
            source: SpecSource::List {
                base: Map::new(),
                entries: Vec::new(),
            },
            output_dir: output_dir.to_path_buf(),
            explicit_artifact: None,
            default_name,
            default_script,
            context_tags: context.tags(),
            context_project,
        };

        if let Some(config_path) = tracking_config {
            let artifact = TrackingArtifact::load(config_path)?;
            let spec = ExperimentSpec {
                name: if artifact.name.is_empty() {
                    generator.default_name.clone()
                } else {
                    artifact.name
                },
                project: artifact.project.or_else(|| generator.context_project.clone()),
                script: generator.default_script.clone(),
                tags: artifact.tags,
                parameters: artifact.parameters,
                paths_to_copy: Vec::new(),
                exclude: Vec::new(),
                settings: Map::new(),
            };
            generator.source = SpecSource::Explicit(Box::new(spec));
            generator.explicit_artifact = Some(config_path.to_path_buf());
            return Ok(generator);
        }

        let path = descriptor_path(script);
        if !path.is_file() {
            return Err(LaunchError::configuration(format!(
                "no experiment descriptor found at {}",
                path.display()
            )));
        }
        let descriptor = yaml_to_json(&fs::read_to_string(&path)?)?;
        let spec_value = descriptor.get(spec_name).ok_or_else(|| {
            LaunchError::configuration(format!(
                "descriptor {} does not declare \"{}\"",
                path.display(),
                spec_name
            ))
        })?;
        generator.source = parse_source(spec_value)?;
        debug!(
            descriptor = %path.display(),
            spec = spec_name,
            experiments = generator.source.len(),
            "loaded experiment descriptor"
        );
        Ok(generator)
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spec_at(&self, index: usize) -> Result<ExperimentSpec> {
        if index >= self.len() {
            return Err(LaunchError::generation(
                index,
                format!("out of range (descriptor yields {} experiments)", self.len()),
            ));
        }
        match &self.source {
            SpecSource::Explicit(spec) => Ok((**spec).clone()),
            SpecSource::Grid { base, space } => {
                let mut map = base.clone();
                let params = match map.remove("parameters") {
                    Some(Value::Object(p)) => p,
                    _ => Map::new(),
                };
                let merged = deep_merge_maps(&params, &space.point(index));
                map.insert("parameters".to_string(), Value::Object(merged));
                let mut spec = self.spec_from_map(index, map)?;
                if space.len() > 1 {
                    spec.name = format!("{}_{}", spec.name, index);
                }
                Ok(spec)
            }
            SpecSource::List { base, entries } => {
                let entry = entries[index].as_object().ok_or_else(|| {
                    LaunchError::generation(index, "experiment entry is not a mapping")
                })?;
                self.spec_from_map(index, deep_merge_maps(base, entry))
            }
        }
    }

    pub fn specs(&self) -> impl Iterator<Item = Result<(usize, ExperimentSpec)>> + '_ {
        (0..self.len()).map(move |i| self.spec_at(i).map(|spec| (i, spec)))
    }

    pub fn select(&self, limit: Option<usize>, shuffle: bool) -> Result<Vec<(usize, ExperimentSpec)>> {
        let limit = limit.unwrap_or(usize::MAX);
        if shuffle {
            let mut all = self.specs().collect::<Result<Vec<_>>>()?;
            all.shuffle(&mut rand::thread_rng());
            all.truncate(limit);
            Ok(all)
        } else {
            self.specs().take(limit).collect()
        }
    }

    pub fn materialize(&self, index: usize, spec: &ExperimentSpec) -> Result<PathBuf> {
        if let Some(path) = &self.explicit_artifact {
            return Ok(path.clone());
        }
        let mut tags = spec.tags.clone();
        for tag in &self.context_tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        let artifact = TrackingArtifact {
            name: spec.name.clone(),
            project: spec.project.clone(),
            tags,
            parameters: spec.parameters.clone(),
        };
        let path = self
            .output_dir
            .join(format!("{:04}_{}.yaml", index, sanitize_file_name(&spec.name)));
        artifact.write(&path)?;
        Ok(path)
    }

    pub fn generate(&self) -> impl Iterator<Item = Result<(PathBuf, ExperimentSpec)>> + '_ {
        self.specs().map(move |item| {
            let (index, spec) = item?;
            let path = self.materialize(index, &spec)?;
            Ok((path, spec))
        })
    }

    fn spec_from_map(&self, index: usize, mut map: Map<String, Value>) -> Result<ExperimentSpec> {
        let name = take_string(index, &mut map, "name")?.unwrap_or_else(|| self.default_name.clone());
        let project = take_string(index, &mut map, "project")?.or_else(|| self.context_project.clone());
        let script = take_string(index, &mut map, "script")?.unwrap_or_else(|| self.default_script.clone());
        let tags = take_string_list(index, &mut map, "tags")?;
        let paths_to_copy = take_string_list(index, &mut map, "paths_to_copy")?;
        let exclude = take_string_list(index, &mut map, "exclude")?;
        let parameters = match map.remove("parameters") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(p)) => p,
            Some(_) => return Err(LaunchError::generation(index, "\"parameters\" must be a mapping")),
        };
        Ok(ExperimentSpec {
            name,
            project,
            script,
            tags,
            parameters,
            paths_to_copy,
            exclude,
            settings: map,
        })
    }
}

fn parse_source(spec_value: &Value) -> Result<SpecSource> {
    let mut base = spec_value
        .as_object()
        .cloned()
        .ok_or_else(|| LaunchError::generation(0, "experiment spec is not a mapping"))?;
    let grid = base.remove("grid");
    let experiments = base.remove("experiments");
    match (grid, experiments) {
        (Some(_), Some(_)) => Err(LaunchError::generation(
            0,
            "declare either \"grid\" or \"experiments\", not both",
        )),
        (Some(grid), None) => {
            let grid = grid
                .as_object()
                .ok_or_else(|| LaunchError::generation(0, "\"grid\" must be a mapping"))?;
            Ok(SpecSource::Grid {
                base,
                space: GridSpace::parse(grid)?,
            })
        }
        (None, Some(Value::Array(entries))) => Ok(SpecSource::List { base, entries }),
        (None, Some(_)) => Err(LaunchError::generation(0, "\"experiments\" must be a list")),
        (None, None) => Ok(SpecSource::Grid {
            base,
            space: GridSpace {
                keys: Vec::new(),
                values: Vec::new(),
            },
        }),
    }
}

fn take_string(index: usize, map: &mut Map<String, Value>, key: &str) -> Result<Option<String>> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(LaunchError::generation(
            index,
            format!("\"{}\" must be a string, got {}", key, other),
        )),
    }
}

fn take_string_list(index: usize, map: &mut Map<String, Value>, key: &str) -> Result<Vec<String>> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(LaunchError::generation(
                    index,
                    format!("\"{}\" entries must be strings, got {}", key, other),
                )),
            })
            .collect(),
        Some(other) => Err(LaunchError::generation(
            index,
            format!("\"{}\" must be a list, got {}", key, other),
        )),
    }
}
