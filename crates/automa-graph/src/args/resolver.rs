use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use automa_core::error::{AutomaError, Result};
use automa_core::types::Arguments;

use super::signature::{Inject, Signature, SystemRef};
use crate::graph::{ArgsBinding, DependencyGraph, WorkerNode};

/// Why a worker was placed in a dynamic step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KickoffSource {
    /// Start worker seeded with the run inputs.
    Seed,
    /// Redirection issued by another worker.
    Ferry {
        from: String,
        #[serde(default)]
        args: Arguments,
    },
    /// All static dependencies completed.
    Dependencies,
}

/// Computes the concrete call arguments of a worker about to run.
pub struct ArgumentResolver<'a> {
    graph: &'a DependencyGraph,
    results: &'a HashMap<String, Value>,
    inputs: &'a Arguments,
    automa_name: &'a str,
}

impl<'a> ArgumentResolver<'a> {
    pub fn new(
        graph: &'a DependencyGraph,
        results: &'a HashMap<String, Value>,
        inputs: &'a Arguments,
        automa_name: &'a str,
    ) -> Self {
        Self {
            graph,
            results,
            inputs,
            automa_name,
        }
    }

    pub fn resolve(&self, key: &str, source: &KickoffSource) -> Result<Arguments> {
        let node = self
            .graph
            .node(key)
            .ok_or_else(|| AutomaError::UnknownKey(key.to_string()))?;
        let signature = node.worker.signature();

        let (args, kwargs) = match source {
            KickoffSource::Seed => (self.inputs.args.clone(), Map::new()),
            KickoffSource::Ferry { args, .. } => (args.args.clone(), args.kwargs.clone()),
            KickoffSource::Dependencies => self.upstream(node)?,
        };

        self.bind(key, &signature, args, kwargs)
    }

    /// Base values from the node's dependencies, per its binding rule.
    fn upstream(&self, node: &WorkerNode) -> Result<(Vec<Value>, Map<String, Value>)> {
        let values: Vec<Value> = node
            .dependencies
            .iter()
            .map(|dep| self.results.get(dep).cloned().unwrap_or(Value::Null))
            .collect();

        match node.binding {
            ArgsBinding::AsIs => Ok((values, Map::new())),
            ArgsBinding::Merge => Ok((vec![Value::Array(values)], Map::new())),
            ArgsBinding::Suppressed => Ok((Vec::new(), Map::new())),
            ArgsBinding::Unpack => {
                let mut values = values;
                if values.len() != 1 {
                    return Err(AutomaError::args_mapping(
                        &node.key,
                        format!(
                            "unpack binding needs exactly one dependency, found {}",
                            values.len()
                        ),
                    ));
                }
                match values.remove(0) {
                    Value::Array(items) => Ok((items, Map::new())),
                    Value::Object(map) => Ok((Vec::new(), map)),
                    other => Err(AutomaError::args_mapping(
                        &node.key,
                        format!("cannot unpack a {} result", type_name(&other)),
                    )),
                }
            }
        }
    }

    fn bind(
        &self,
        key: &str,
        signature: &Signature,
        mut args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Arguments> {
        let positional: Vec<&str> = signature.positional().map(|p| p.name.as_str()).collect();
        let mut bound = Map::new();
        let mut extra = Vec::new();

        // A lone null (e.g. a suppressed upstream) feeding a parameterless worker is dropped.
        if positional.is_empty() && !signature.var_args && args.len() == 1 && args[0].is_null() {
            args.clear();
        }

        let given = args.len();
        for (index, value) in args.into_iter().enumerate() {
            match positional.get(index) {
                Some(name) => {
                    bound.insert(name.to_string(), value);
                }
                None if signature.var_args => extra.push(value),
                None => {
                    return Err(AutomaError::args_mapping(
                        key,
                        format!(
                            "takes {} positional argument(s) but {} were given",
                            positional.len(),
                            given
                        ),
                    ))
                }
            }
        }

        for (name, value) in kwargs {
            if bound.contains_key(&name) {
                return Err(AutomaError::args_mapping(
                    key,
                    format!("got multiple values for argument `{}`", name),
                ));
            }
            if signature.var_kwargs || signature.find(&name).is_some() {
                bound.insert(name, value);
            }
        }

        // Run-level keyword inputs fill whatever is still unbound.
        for (name, value) in &self.inputs.kwargs {
            if bound.contains_key(name) {
                continue;
            }
            let accepts = match signature.find(name) {
                Some(param) => !param.is_injected(),
                None => signature.var_kwargs,
            };
            if accepts {
                bound.insert(name.clone(), value.clone());
            }
        }

        for param in &signature.params {
            match &param.inject {
                Some(Inject::From { key: source, default }) => {
                    let value = match (self.results.get(source), default) {
                        (Some(value), _) => value.clone(),
                        (None, Some(default)) => default.clone(),
                        (None, None) => {
                            return Err(AutomaError::args_mapping(
                                key,
                                format!(
                                    "parameter `{}` references worker `{}`, which has no result",
                                    param.name, source
                                ),
                            ))
                        }
                    };
                    bound.insert(param.name.clone(), value);
                }
                Some(Inject::System { target }) => match target {
                    SystemRef::WorkerKey => {
                        bound.insert(param.name.clone(), Value::String(key.to_string()));
                    }
                    SystemRef::AutomaName => {
                        bound.insert(
                            param.name.clone(),
                            Value::String(self.automa_name.to_string()),
                        );
                    }
                    // Reached through the worker context.
                    SystemRef::Automa => {
                        bound.remove(&param.name);
                    }
                },
                None => {
                    if bound.contains_key(&param.name) {
                        continue;
                    }
                    match &param.default {
                        Some(default) => {
                            bound.insert(param.name.clone(), default.clone());
                        }
                        None => {
                            return Err(AutomaError::args_mapping(
                                key,
                                format!("missing required parameter `{}`", param.name),
                            ))
                        }
                    }
                }
            }
        }

        Ok(Arguments {
            args: extra,
            kwargs: bound,
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
