// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command-line argument shapes accepted for supervised programs.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Arguments for a supervised program.
///
/// Manifests may give a list, a map of flag to value, a single string, or
/// nothing. Maps flatten to `flag value flag value ...`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProcessArgs {
    #[default]
    None,
    Single(String),
    List(Vec<String>),
    Pairs(Vec<(String, String)>),
}

impl ProcessArgs {
    /// Flatten to the argv passed to the program (without argv[0]).
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            ProcessArgs::None => Vec::new(),
            ProcessArgs::Single(arg) => vec![arg.clone()],
            ProcessArgs::List(args) => args.clone(),
            ProcessArgs::Pairs(pairs) => pairs
                .iter()
                .flat_map(|(k, v)| [k.clone(), v.clone()])
                .collect(),
        }
    }
}

impl From<Vec<String>> for ProcessArgs {
    fn from(args: Vec<String>) -> Self {
        ProcessArgs::List(args)
    }
}

impl From<&[&str]> for ProcessArgs {
    fn from(args: &[&str]) -> Self {
        ProcessArgs::List(args.iter().map(|a| a.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for ProcessArgs {
    fn from(args: [&str; N]) -> Self {
        ProcessArgs::List(args.iter().map(|a| a.to_string()).collect())
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl<'de> Deserialize<'de> for ProcessArgs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(ProcessArgs::None),
            Value::Array(items) => Ok(ProcessArgs::List(items.iter().map(scalar).collect())),
            Value::Object(map) => Ok(ProcessArgs::Pairs(
                map.iter().map(|(k, v)| (k.clone(), scalar(v))).collect(),
            )),
            Value::Bool(_) => Err(de::Error::custom("process args cannot be a boolean")),
            other => Ok(ProcessArgs::Single(scalar(&other))),
        }
    }
}

impl Serialize for ProcessArgs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ProcessArgs::None => serializer.serialize_none(),
            ProcessArgs::Single(arg) => serializer.serialize_str(arg),
            ProcessArgs::List(args) => args.serialize(serializer),
            ProcessArgs::Pairs(pairs) => {
                let map: serde_json::Map<String, Value> = pairs
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                map.serialize(serializer)
            }
        }
    }
}
