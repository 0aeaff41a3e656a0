use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("unable to decode outputs: `{0}`")]
    Decode(String),
}

/// A single template output. The value is carried as its textual
/// representation, since the callers only propagate strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

#[derive(Deserialize)]
struct RawOutput {
    #[serde(rename = "type")]
    type_: String,
    value: Value,
}

/// Decodes the loosely-typed outputs map of a completed deployment into a
/// typed table. Absent or null outputs yield an empty table.
pub fn flatten(raw: Option<&Value>) -> Result<BTreeMap<String, Output>, OutputError> {
    let Some(raw) = raw else {
        return Ok(BTreeMap::new());
    };
    if raw.is_null() {
        return Ok(BTreeMap::new());
    }

    let entries: BTreeMap<String, RawOutput> =
        serde_json::from_value(raw.clone()).map_err(|e| OutputError::Decode(e.to_string()))?;

    Ok(entries
        .into_iter()
        .map(|(name, entry)| {
            (
                name,
                Output {
                    type_: entry.type_,
                    value: render(entry.value),
                },
            )
        })
        .collect())
}

fn render(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
