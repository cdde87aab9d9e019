//! Named parameter slots shared by providers, actions and the resolver.
//!
//! Values are opaque to the engine and travel as `serde_json::Value`; the
//! typed view is recovered at the edges with [`KnownValues::get`],
//! [`KnownValues::require`] or [`KnownValues::extract`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub use sim_macros::Parameters;

/// Well-known parameter names.
pub mod names {
    pub const INTENT: &str = "intent";
    pub const ACTOR_CHARACTER_ID: &str = "actor_character_id";
    pub const LOCATION_ID: &str = "location_id";
    pub const TARGET_OBJECT_ID: &str = "target_object_id";
    pub const TARGET_CHARACTER_ID: &str = "target_character_id";
    pub const SPEECH: &str = "speech";
}

/// Errors from reading parameter values.
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("parameter '{0}' is not known")]
    Missing(String),

    #[error("parameter '{name}' has an unexpected value: {source}")]
    Invalid {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("known values do not fit {target}: {source}")]
    Shape {
        target: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A named value slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl Parameter {
    pub fn new(name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required,
        }
    }

    /// A parameter that must be present before an action runs.
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, description, true)
    }

    /// A parameter that is dropped from the call when it cannot be resolved.
    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, description, false)
    }

    /// Attach a value to this parameter.
    pub fn fill(&self, value: impl Serialize) -> Result<FilledParameter, ValueError> {
        let value = serde_json::to_value(value).map_err(|source| ValueError::Invalid {
            name: self.name.clone(),
            source,
        })?;
        Ok(self.with_value(value))
    }

    pub fn with_value(&self, value: Value) -> FilledParameter {
        FilledParameter {
            parameter: self.clone(),
            value,
        }
    }
}

/// Declared parameters keyed by name.
pub type ParameterMap = BTreeMap<String, Parameter>;

/// Build a [`ParameterMap`] from a list of parameters.
pub fn parameter_map(parameters: impl IntoIterator<Item = Parameter>) -> ParameterMap {
    parameters
        .into_iter()
        .map(|parameter| (parameter.name.clone(), parameter))
        .collect()
}

/// A parameter together with its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilledParameter {
    #[serde(flatten)]
    pub parameter: Parameter,
    pub value: Value,
}

impl FilledParameter {
    /// Create a required parameter with a value in one step.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        value: impl Serialize,
    ) -> Result<Self, ValueError> {
        Parameter::required(name, description).fill(value)
    }

    pub fn name(&self) -> &str {
        &self.parameter.name
    }
}

/// Types that declare a fixed parameter set, usually via `#[derive(Parameters)]`.
pub trait ParameterSet {
    /// Human readable description taken from the type's doc comment.
    fn description() -> &'static str;

    /// Every declared parameter keyed by name.
    fn parameters() -> ParameterMap;
}

/// Plain name to value view handed to providers and actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnownValues(BTreeMap<String, Value>);

impl KnownValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Read a value as `T`, `Ok(None)` when the name is absent.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ValueError> {
        self.0
            .get(name)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|source| ValueError::Invalid {
                    name: name.to_string(),
                    source,
                })
            })
            .transpose()
    }

    /// Read a value as `T`, failing when the name is absent.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T, ValueError> {
        self.get(name)?
            .ok_or_else(|| ValueError::Missing(name.to_string()))
    }

    /// Deserialize every known value into a typed argument struct.
    pub fn extract<T: DeserializeOwned>(&self) -> Result<T, ValueError> {
        let object: Map<String, Value> = self
            .0
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        serde_json::from_value(Value::Object(object)).map_err(|source| ValueError::Shape {
            target: std::any::type_name::<T>(),
            source,
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for KnownValues {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a FilledParameter> for KnownValues {
    fn from_iter<I: IntoIterator<Item = &'a FilledParameter>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|filled| (filled.name().to_string(), filled.value.clone()))
                .collect(),
        )
    }
}
