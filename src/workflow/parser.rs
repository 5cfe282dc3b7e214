//! Workflow Parser
//!
//! Loads workflow definitions and input documents from JSON or YAML files.
//! The format is picked from the file extension; anything other than
//! `.json` is read as YAML.

use std::error::Error;
use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::model::WorkflowDefinition;
use super::validator::validate_workflow;

/// Serialization format of a definition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    /// Picks a format from a path's extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

fn parse<T: DeserializeOwned>(content: &str, format: Format) -> Result<T, Box<dyn Error>> {
    let value = match format {
        Format::Json => serde_json::from_str(content)?,
        Format::Yaml => serde_yaml::from_str(content)?,
    };
    Ok(value)
}

/// Parses and validates a workflow definition from a string.
pub fn parse_workflow(content: &str, format: Format) -> Result<WorkflowDefinition, Box<dyn Error>> {
    let workflow: WorkflowDefinition = parse(content, format).map_err(|e| {
        format!("Failed to parse workflow definition: {}. Check the file format.", e)
    })?;

    info!(
        "Parsed workflow '{}': {} nodes, {} connections",
        workflow.id,
        workflow.nodes.len(),
        workflow.connections.len()
    );

    validate_workflow(&workflow)?;
    Ok(workflow)
}

/// Loads a workflow from a JSON or YAML file.
///
/// This function:
/// 1. Reads and parses the file
/// 2. Validates the workflow structure
///
/// # Example
///
/// ```rust,no_run
/// use flowpilot::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("onboarding.yaml")?;
///     println!("Loaded {} nodes", workflow.nodes.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition, Box<dyn Error>> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        )
    })?;

    debug!("Definition loaded ({} bytes)", content.len());
    parse_workflow(&content, Format::from_path(path))
}

/// Loads every `.json`, `.yaml` and `.yml` workflow in a directory.
pub fn load_workflow_dir(dir: impl AsRef<Path>) -> Result<Vec<WorkflowDefinition>, Box<dyn Error>> {
    let dir = dir.as_ref();
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("json") | Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    paths.iter().map(load_workflow).collect()
}

/// Loads an input document; the top level must be an object.
pub fn load_input(path: impl AsRef<Path>) -> Result<Map<String, Value>, Box<dyn Error>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read input file '{}': {}", path.display(), e))?;

    match parse::<Value>(&content, Format::from_path(path))? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(format!(
            "Input file '{}' must contain an object, found {}",
            path.display(),
            other
        )
        .into()),
    }
}
