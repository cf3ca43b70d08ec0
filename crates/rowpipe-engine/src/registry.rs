//! Static name → factory table standing in for plugin discovery.

use std::collections::BTreeMap;

use rowpipe_types::error::TransformError;
use serde::de::DeserializeOwned;

use crate::transform::{Source, Step, StepRole, Transform};

type StepFactory = Box<dyn Fn(&serde_json::Value) -> Result<Step, TransformError> + Send + Sync>;

struct Entry {
    role: StepRole,
    description: String,
    factory: StepFactory,
}

/// Summary of one registered transform, for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformInfo {
    pub name: String,
    pub role: StepRole,
    pub description: String,
}

/// Registered transform implementations, keyed by the `use` name.
#[derive(Default)]
pub struct TransformRegistry {
    entries: BTreeMap<String, Entry>,
}

impl TransformRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source<S, F>(&mut self, name: &str, description: &str, factory: F)
    where
        S: Source + 'static,
        F: Fn(&serde_json::Value) -> Result<S, TransformError> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_string(),
            Entry {
                role: StepRole::Source,
                description: description.to_string(),
                factory: Box::new(move |config| {
                    Ok(Step::Source(Box::new(factory(config)?)))
                }),
            },
        );
    }

    pub fn register_transform<T, F>(&mut self, name: &str, description: &str, factory: F)
    where
        T: Transform + 'static,
        F: Fn(&serde_json::Value) -> Result<T, TransformError> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_string(),
            Entry {
                role: StepRole::Transform,
                description: description.to_string(),
                factory: Box::new(move |config| {
                    Ok(Step::Transform(Box::new(factory(config)?)))
                }),
            },
        );
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    #[must_use]
    pub fn role(&self, name: &str) -> Option<StepRole> {
        self.entries.get(name).map(|e| e.role)
    }

    /// Construct a fresh step from its configuration.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_TRANSFORM` for an unregistered name, or the factory's
    /// configuration error.
    pub fn build(&self, name: &str, config: &serde_json::Value) -> Result<Step, TransformError> {
        let entry = self.entries.get(name).ok_or_else(|| {
            TransformError::config("UNKNOWN_TRANSFORM", format!("no transform named '{name}'"))
        })?;
        (entry.factory)(config)
    }

    #[must_use]
    pub fn entries(&self) -> Vec<TransformInfo> {
        self.entries
            .iter()
            .map(|(name, e)| TransformInfo {
                name: name.clone(),
                role: e.role,
                description: e.description.clone(),
            })
            .collect()
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

/// Deserialize a step's `config` value; a missing value reads as `{}`.
///
/// # Errors
///
/// `INVALID_CONFIG` configuration error naming the serde failure.
pub fn parse_config<T: DeserializeOwned>(config: &serde_json::Value) -> Result<T, TransformError> {
    let value = if config.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        config.clone()
    };
    serde_json::from_value(value)
        .map_err(|e| TransformError::config("INVALID_CONFIG", format!("invalid step config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{RowOutcome, StepContext};
    use rowpipe_types::schema::RowSchema;
    use rowpipe_types::value::Row;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct PassConfig {
        #[serde(default)]
        label: String,
    }

    struct Pass {
        _label: String,
    }

    impl Transform for Pass {
        fn derive_output_schema(
            &self,
            input: &RowSchema,
            _ctx: &StepContext,
        ) -> Result<RowSchema, TransformError> {
            Ok(input.clone())
        }

        fn process_row(&mut self, row: Row, _ctx: &StepContext) -> RowOutcome {
            RowOutcome::one(row)
        }
    }

    fn registry() -> TransformRegistry {
        let mut registry = TransformRegistry::new();
        registry.register_transform("pass", "Pass rows through", |config| {
            let config: PassConfig = parse_config(config)?;
            Ok(Pass {
                _label: config.label,
            })
        });
        registry
    }

    #[test]
    fn build_known_transform() {
        let registry = registry();
        let step = registry
            .build("pass", &serde_json::json!({"label": "x"}))
            .unwrap();
        assert_eq!(step.role(), StepRole::Transform);
        assert_eq!(registry.role("pass"), Some(StepRole::Transform));
        assert!(registry.contains("pass"));
    }

    #[test]
    fn null_config_reads_as_empty_object() {
        assert!(registry().build("pass", &serde_json::Value::Null).is_ok());
    }

    #[test]
    fn unknown_transform_is_config_error() {
        let err = registry()
            .build("nope", &serde_json::Value::Null)
            .unwrap_err();
        assert_eq!(err.code, "UNKNOWN_TRANSFORM");
    }

    #[test]
    fn bad_config_is_config_error() {
        let err = registry()
            .build("pass", &serde_json::json!({"label": 5}))
            .unwrap_err();
        assert_eq!(err.code, "INVALID_CONFIG");
        assert!(err.message.contains("invalid type"));
    }

    #[test]
    fn entries_are_sorted() {
        let mut registry = registry();
        registry.register_transform("abc", "First", |_| {
            Ok(Pass {
                _label: String::new(),
            })
        });
        let names: Vec<String> = registry.entries().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["abc", "pass"]);
    }
}
