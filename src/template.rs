use std::fs;
use std::path::Path;

use serde_json::{Map, Value};
use thiserror::Error;

/// An ARM template is an opaque JSON object tree. It is passed through to the
/// Resource Manager API unmodified and never validated structurally here.
pub type Template = Map<String, Value>;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("unable to read `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Reads and parses one JSON document from disk. The top level must be an
/// object.
pub fn read_json(path: &Path) -> Result<Template, TemplateError> {
    let data = fs::read_to_string(path).map_err(|source| TemplateError::Io {
        path: path.display().to_string(),
        source,
    })?;

    serde_json::from_str(&data).map_err(|source| TemplateError::Parse {
        path: path.display().to_string(),
        source,
    })
}
