use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use crate::catalog;
use crate::error::RuleError;
use crate::rule::Rule;

/// Builds one rule instance from its YAML config.
pub type RuleConstructor = fn(&serde_yaml::Value) -> Result<Box<dyn Rule>, RuleError>;

/// Deserialize a rule config, reporting failures against the rule class.
pub fn parse_config<T: DeserializeOwned>(class: &str, value: &serde_yaml::Value) -> Result<T, RuleError> {
    serde_yaml::from_value(value.clone()).map_err(|e| RuleError::invalid(class, e.to_string()))
}

/// Rule classes by name.
pub struct RuleRegistry {
    constructors: BTreeMap<String, RuleConstructor>,
}

impl RuleRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry holding every rule class in the catalog.
    pub fn with_catalog() -> Self {
        let mut registry = Self::empty();
        catalog::register_all(&mut registry);
        registry
    }

    /// Add or replace a rule class.
    pub fn register(&mut self, classname: impl Into<String>, constructor: RuleConstructor) {
        self.constructors.insert(classname.into(), constructor);
    }

    pub fn classnames(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn build(&self, classname: &str, config: &serde_yaml::Value) -> Result<Box<dyn Rule>, RuleError> {
        let constructor = self
            .constructors
            .get(classname)
            .ok_or_else(|| RuleError::UnknownClass(classname.to_string()))?;
        constructor(config)
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_catalog()
    }
}
