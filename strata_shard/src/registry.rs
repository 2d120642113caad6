use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::{HashModStrategy, ModuloStrategy, RangeStrategy, Result, ShardError, ShardingStrategy};

/// Strategy selection as written in configuration files.
///
/// ```yaml
/// strategy: { type: modulo }
/// strategy: { type: range, boundaries: [1000, 2000] }
/// strategy: { type: custom, name: by_region }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// [`ModuloStrategy`].
    Modulo,
    /// [`HashModStrategy`].
    HashMod,
    /// [`RangeStrategy`].
    Range {
        /// Exclusive upper bounds.
        boundaries: Vec<i64>,
    },
    /// A strategy registered in a [`StrategyRegistry`] under `name`.
    Custom {
        /// Registered name.
        name: String,
    },
}

/// Named custom strategies available to configuration.
#[derive(Debug, Default, Clone)]
pub struct StrategyRegistry {
    custom: HashMap<String, Arc<dyn ShardingStrategy>>,
}

impl StrategyRegistry {
    /// Registry with no custom strategies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a custom strategy.
    pub fn register(&mut self, name: impl Into<String>, strategy: Arc<dyn ShardingStrategy>) -> &mut Self {
        self.custom.insert(name.into(), strategy);
        self
    }

    /// Instantiate the strategy described by `config` and check it against
    /// the dimension's shard count.
    pub fn build(&self, config: &StrategyConfig, shard_count: u32) -> Result<Arc<dyn ShardingStrategy>> {
        let strategy: Arc<dyn ShardingStrategy> = match config {
            StrategyConfig::Modulo => Arc::new(ModuloStrategy),
            StrategyConfig::HashMod => Arc::new(HashModStrategy),
            StrategyConfig::Range { boundaries } => Arc::new(RangeStrategy::new(boundaries.clone())?),
            StrategyConfig::Custom { name } => self
                .custom
                .get(name)
                .cloned()
                .ok_or_else(|| ShardError::UnknownStrategy(name.clone()))?,
        };
        strategy.validate(shard_count)?;
        Ok(strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::Value;

    #[derive(Debug)]
    struct EvenOdd;

    impl ShardingStrategy for EvenOdd {
        fn name(&self) -> &str {
            "even_odd"
        }

        fn resolve(&self, value: &Value, _shard_count: u32) -> Result<u32> {
            Ok(value.as_i64().map_or(0, |v| (v & 1) as u32))
        }
    }

    #[test]
    fn parses_tagged_yaml() {
        let cfg: StrategyConfig = serde_yaml::from_str("type: range\nboundaries: [10, 20]").unwrap();
        assert_eq!(cfg, StrategyConfig::Range { boundaries: vec![10, 20] });
        let cfg: StrategyConfig = serde_yaml::from_str("type: modulo").unwrap();
        assert_eq!(cfg, StrategyConfig::Modulo);
    }

    #[test]
    fn builds_custom_strategies() {
        let mut registry = StrategyRegistry::new();
        registry.register("even_odd", Arc::new(EvenOdd));
        let s = registry.build(&StrategyConfig::Custom { name: "even_odd".into() }, 2).unwrap();
        assert_eq!(s.resolve(&Value::Int(9), 2).unwrap(), 1);
        let err = registry.build(&StrategyConfig::Custom { name: "missing".into() }, 2).unwrap_err();
        assert_eq!(err, ShardError::UnknownStrategy("missing".into()));
    }

    #[test]
    fn same_config_built_twice_routes_identically() {
        let registry = StrategyRegistry::new();
        let a = registry.build(&StrategyConfig::Modulo, 4).unwrap();
        let b = registry.build(&StrategyConfig::Modulo, 4).unwrap();
        for v in 0..500i64 {
            assert_eq!(a.resolve(&Value::Int(v), 4).unwrap(), b.resolve(&Value::Int(v), 4).unwrap());
        }
    }

    #[test]
    fn build_rejects_zero_shards() {
        let err = StrategyRegistry::new().build(&StrategyConfig::Modulo, 0).unwrap_err();
        assert_eq!(err, ShardError::ZeroShards);
    }
}
