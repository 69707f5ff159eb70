//! YAML reading on top of yaml-rust2
//!
//! Documents are converted to `serde_json::Value` so that the rest of the
//! code base manipulates a single tree type. Writing YAML goes through
//! [`crate::render`].

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::{Error, Result};

/// Parse the first document of `input`; empty input yields `Value::Null`
pub fn parse_yaml(input: &str) -> Result<Value> {
    let mut docs = load(input)?;
    if docs.is_empty() {
        return Ok(Value::Null);
    }
    to_json(docs.swap_remove(0))
}

/// Parse every `---` separated document of `input`
pub fn parse_yaml_multi(input: &str) -> Result<Vec<Value>> {
    load(input)?.into_iter().map(to_json).collect()
}

/// Parse a YAML sequence of strings, as stored in excluded-fields ConfigMaps
///
/// An empty document is an empty list; anything that is not a list of
/// scalars is a [`Error::WrongYamlFormat`].
pub fn parse_string_list(input: &str) -> Result<Vec<String>> {
    match parse_yaml(input)? {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                Value::Number(n) => Ok(n.to_string()),
                Value::Bool(b) => Ok(b.to_string()),
                other => Err(Error::wrong_yaml(format!(
                    "expected a list of field paths, found the item {}",
                    other
                ))),
            })
            .collect(),
        other => Err(Error::wrong_yaml(format!(
            "expected a list of field paths, found {}",
            kind_of(&other)
        ))),
    }
}

fn load(input: &str) -> Result<Vec<Yaml>> {
    YamlLoader::load_from_str(input).map_err(|e| Error::wrong_yaml(e.to_string()))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

fn scalar_key(key: Yaml) -> Result<String> {
    Ok(match key {
        Yaml::String(s) | Yaml::Real(s) => s,
        Yaml::Integer(i) => i.to_string(),
        Yaml::Boolean(b) => b.to_string(),
        Yaml::Null => "null".to_string(),
        other => {
            return Err(Error::wrong_yaml(format!(
                "mapping keys must be scalars, found {:?}",
                other
            )))
        }
    })
}

fn to_json(node: Yaml) -> Result<Value> {
    let value = match node {
        Yaml::Null => Value::Null,
        Yaml::Boolean(b) => Value::Bool(b),
        Yaml::Integer(i) => Value::Number(i.into()),
        Yaml::Real(raw) => {
            let f: f64 = raw
                .parse()
                .map_err(|_| Error::wrong_yaml(format!("invalid float {}", raw)))?;
            Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        Yaml::String(s) => Value::String(s),
        Yaml::Array(items) => Value::Array(
            items
                .into_iter()
                .map(to_json)
                .collect::<Result<Vec<_>>>()?,
        ),
        Yaml::Hash(hash) => {
            let mut map = Map::with_capacity(hash.len());
            for (k, v) in hash {
                map.insert(scalar_key(k)?, to_json(v)?);
            }
            Value::Object(map)
        }
        Yaml::Alias(_) => return Err(Error::wrong_yaml("YAML aliases are not supported")),
        Yaml::BadValue => return Err(Error::wrong_yaml("bad YAML value")),
    };
    Ok(value)
}
