//! Parse and load layer specifications

use super::schema::LayerQuantSpec;
use super::validate::validate_spec;
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Parse and validate a YAML layer specification
pub fn parse_spec(yaml: &str) -> Result<LayerQuantSpec> {
    let spec: LayerQuantSpec = serde_yaml::from_str(yaml)
        .map_err(|e| Error::Serialization(format!("Failed to parse YAML spec: {e}")))?;

    validate_spec(&spec).map_err(|e| Error::Configuration(format!("Invalid spec: {e}")))?;

    Ok(spec)
}

/// Load a layer specification from a YAML file
pub fn load_spec<P: AsRef<Path>>(path: P) -> Result<LayerQuantSpec> {
    let yaml = fs::read_to_string(path.as_ref()).map_err(|e| {
        Error::Configuration(format!(
            "Failed to read spec file {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;
    parse_spec(&yaml)
}
