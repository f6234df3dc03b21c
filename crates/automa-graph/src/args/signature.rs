use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which piece of the running system a parameter asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemRef {
    /// The owning automa. Reached through the `WorkerContext`; no value is bound.
    Automa,
    /// The key of the worker being invoked.
    WorkerKey,
    /// The name of the owning automa.
    AutomaName,
}

/// Where an injected parameter takes its value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inject {
    /// Result of another, already completed worker.
    From {
        key: String,
        #[serde(default)]
        default: Option<Value>,
    },
    System { target: SystemRef },
}

/// A declared worker parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub inject: Option<Inject>,
}

impl Param {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            inject: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Bind to the result of worker `key`.
    pub fn from_worker(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            inject: Some(Inject::From {
                key: key.into(),
                default: None,
            }),
        }
    }

    /// Bind to the result of worker `key`, falling back to `default`.
    pub fn from_worker_or(
        name: impl Into<String>,
        key: impl Into<String>,
        default: impl Into<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            default: None,
            inject: Some(Inject::From {
                key: key.into(),
                default: Some(default.into()),
            }),
        }
    }

    pub fn system(name: impl Into<String>, target: SystemRef) -> Self {
        Self {
            name: name.into(),
            default: None,
            inject: Some(Inject::System { target }),
        }
    }

    pub fn is_injected(&self) -> bool {
        self.inject.is_some()
    }
}

/// Declared call signature of a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<Param>,
    /// Accepts positional values beyond the declared params.
    #[serde(default)]
    pub var_args: bool,
    /// Accepts named values that match no declared param.
    #[serde(default)]
    pub var_kwargs: bool,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signature that passes every argument through untouched.
    pub fn open() -> Self {
        Self {
            params: Vec::new(),
            var_args: true,
            var_kwargs: true,
        }
    }

    /// Signature made of plain required params.
    pub fn of(names: &[&str]) -> Self {
        Self {
            params: names.iter().map(|n| Param::new(*n)).collect(),
            ..Self::default()
        }
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_var_args(mut self) -> Self {
        self.var_args = true;
        self
    }

    pub fn with_var_kwargs(mut self) -> Self {
        self.var_kwargs = true;
        self
    }

    pub fn find(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Params that positional values bind to, in order.
    pub fn positional(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|p| !p.is_injected())
    }

    pub fn is_open(&self) -> bool {
        self.params.is_empty() && self.var_args && self.var_kwargs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of_builds_required_params() {
        let sig = Signature::of(&["a", "b"]);
        assert_eq!(sig.params.len(), 2);
        assert!(sig.find("a").unwrap().default.is_none());
        assert!(!sig.var_args);
        assert!(!sig.is_open());
    }

    #[test]
    fn test_positional_skips_injected() {
        let sig = Signature::of(&["x"])
            .param(Param::from_worker("prior", "step1"))
            .param(Param::system("me", SystemRef::WorkerKey))
            .param(Param::new("y").with_default(2));
        let names: Vec<_> = sig.positional().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
    }

    #[test]
    fn test_inject_serde_shape() {
        let param = Param::from_worker_or("p", "k", 5);
        let json = serde_json::to_value(&param).unwrap();
        assert_eq!(json["inject"]["type"], "from");
        assert_eq!(json["inject"]["key"], "k");
        let back: Param = serde_json::from_value(json).unwrap();
        assert_eq!(back, param);
    }
}
