use std::path::Path;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::template::{self, TemplateError};

/// Mapping from parameter name to its `{"value": ...}` wrapper object.
pub type ParameterSet = Map<String, Value>;

#[derive(Error, Debug)]
pub enum ParameterError {
    #[error(transparent)]
    Document(#[from] TemplateError),
    #[error("found invalid pair, expected KEY=VALUE got `{0}`")]
    InvalidPair(String),
    #[error("the top-level `parameters` key must hold an object")]
    WrappedNotObject,
}

/// Loads a parameter set from either a `.json` file or an inline `KEY=VALUE`
/// string.
pub fn load(location_or_inline: &str) -> Result<ParameterSet, ParameterError> {
    if location_or_inline.ends_with(".json") {
        return from_json_file(Path::new(location_or_inline));
    }

    from_inline(location_or_inline)
}

/// Reads a parameter file. Parameter files exported by the portal wrap the
/// actual map in a top-level `parameters` key; that wrapper is unwrapped when
/// present, otherwise the document is used as-is.
pub fn from_json_file(path: &Path) -> Result<ParameterSet, ParameterError> {
    let mut document = template::read_json(path)?;

    match document.remove("parameters") {
        Some(Value::Object(inner)) => Ok(inner),
        Some(_) => Err(ParameterError::WrappedNotObject),
        None => Ok(document),
    }
}

/// Parses inline `KEY=VALUE` pairs separated by whitespace. A value may be
/// wrapped in matching quote characters to protect embedded whitespace; quote
/// characters are stripped from the final value. Every parsed value becomes a
/// string-valued `{"value": ...}` wrapper.
pub fn from_inline(input: &str) -> Result<ParameterSet, ParameterError> {
    let mut parameters = ParameterSet::new();

    for pair in split_pairs(input) {
        let (key, raw_value) = pair
            .split_once('=')
            .ok_or_else(|| ParameterError::InvalidPair(pair.clone()))?;

        let value: String = raw_value.chars().filter(|c| !is_quote(*c)).collect();

        let mut wrapper = Map::new();
        wrapper.insert(
            "value".to_string(),
            Value::String(value.trim().to_string()),
        );
        parameters.insert(key.to_string(), Value::Object(wrapper));
    }

    Ok(parameters)
}

/// Overlays `overrides` onto `base`. A key present in the overrides replaces
/// the base entry wholesale; nested structure is never merged.
pub fn merge(mut base: ParameterSet, overrides: ParameterSet) -> ParameterSet {
    for (key, value) in overrides {
        base.insert(key, value);
    }

    base
}

fn is_quote(c: char) -> bool {
    matches!(c, '"' | '\'')
}

/// Splits on whitespace, except inside a quoted section. State machine with
/// two states: normal, and inside-quote remembering the opening character.
/// The closing quote must be the same character that opened the section.
fn split_pairs(input: &str) -> Vec<String> {
    let mut pairs = Vec::new();
    let mut current = String::new();
    let mut open_quote: Option<char> = None;

    for c in input.chars() {
        match open_quote {
            Some(quote) if c == quote => {
                open_quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if is_quote(c) => {
                open_quote = Some(c);
                current.push(c);
            }
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    pairs.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }

    if !current.is_empty() {
        pairs.push(current);
    }

    pairs
}
