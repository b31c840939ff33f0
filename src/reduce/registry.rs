//! Name-keyed reducer registry.
//!
//! The reducer to run is picked by a configured name looked up in an
//! explicit map populated at startup — no directory scanning or
//! plugin-style reflection.

use std::collections::HashMap;
use std::sync::Arc;

use toml::Value;

use super::builtin::{
    MeanPoolConfig, MeanPoolReducer, RadialProfileConfig, RadialProfileReducer,
};
use super::FrameReducer;

type ReducerFactory =
    Box<dyn Fn(&Value) -> Result<Arc<dyn FrameReducer>, anyhow::Error> + Send + Sync>;

/// Maps configured reducer names to constructor functions.
pub struct ReducerRegistry {
    factories: HashMap<String, ReducerFactory>,
}

impl Default for ReducerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReducerRegistry {
    /// A registry with the built-in reducers registered.
    pub fn new() -> Self {
        let mut factories: HashMap<String, ReducerFactory> = HashMap::new();

        factories.insert(
            "mean_pool".to_string(),
            Box::new(|config| {
                let config: MeanPoolConfig = config.clone().try_into()?;
                Ok(Arc::new(MeanPoolReducer::new(config)?) as Arc<dyn FrameReducer>)
            }),
        );

        factories.insert(
            "radial_profile".to_string(),
            Box::new(|config| {
                let config: RadialProfileConfig = config.clone().try_into()?;
                Ok(Arc::new(RadialProfileReducer::new(config)?) as Arc<dyn FrameReducer>)
            }),
        );

        Self { factories }
    }

    /// Register another reducer under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn FrameReducer>, anyhow::Error> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Construct the reducer registered under `name`.
    pub fn create(&self, name: &str, config: &Value) -> Result<Arc<dyn FrameReducer>, anyhow::Error> {
        self.factories
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("reducer '{}' not found", name))
            .and_then(|factory| factory(config))
    }

    /// Registered reducer names, for error messages.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_table() -> Value {
        Value::Table(toml::map::Map::new())
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = ReducerRegistry::new();
        assert!(registry.create("mean_pool", &empty_table()).is_ok());
        assert!(registry.create("radial_profile", &empty_table()).is_ok());
        assert_eq!(registry.names(), vec!["mean_pool", "radial_profile"]);
    }

    #[test]
    fn test_unknown_name_is_an_error() {
        let registry = ReducerRegistry::new();
        assert!(registry.create("autoencoder", &empty_table()).is_err());
    }

    #[test]
    fn test_config_is_passed_through() {
        let registry = ReducerRegistry::new();
        let config: Value = toml::from_str("grid = 4").unwrap();
        assert!(registry.create("mean_pool", &config).is_ok());
        let bad: Value = toml::from_str("grid = 0").unwrap();
        assert!(registry.create("mean_pool", &bad).is_err());
    }
}
