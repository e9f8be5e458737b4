//! Target database engines.
//!
//! An engine knows how to read a live database's catalog into
//! [`GraphPrimitives`] and how to open a transient connection for running
//! generated SQL. Engines are registered by kind tag; the scan runner and the
//! query engine look them up through [`EngineRegistry`].

pub mod sqlite;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::{CoreError, CoreResult},
    models::{GraphPrimitives, Row, TargetCredentials},
};

pub use sqlite::SqliteEngine;

/// Reads a live catalog into graph primitives.
///
/// Implementations open exactly one transient connection per call and must
/// release it on every exit path. On failure no partial graph is returned.
#[async_trait]
pub trait IntrospectionStrategy: Send + Sync {
    async fn introspect(&self, target: &TargetCredentials) -> CoreResult<GraphPrimitives>;
}

/// A connection owned by a single operation. Dropping it releases it.
pub trait LiveConnection: Send {
    /// Name of the SQL dialect, as shown to the generation step.
    fn dialect(&self) -> &'static str;

    /// DDL plus a few sample rows per table.
    fn schema_context(&mut self, sample_rows: usize) -> anyhow::Result<String>;

    /// Runs `sql` verbatim and collects every row as a column-to-value map.
    fn execute(&mut self, sql: &str) -> anyhow::Result<Vec<Row>>;
}

/// Opens [`LiveConnection`]s. Blocking; call from a blocking task.
pub trait LiveConnector: Send + Sync {
    fn connect(&self, target: &TargetCredentials) -> anyhow::Result<Box<dyn LiveConnection>>;
}

pub trait DatabaseEngine: IntrospectionStrategy + LiveConnector {
    fn kind(&self) -> &'static str;
}

#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn DatabaseEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SqliteEngine::new()));
        registry
    }

    pub fn register(&mut self, engine: Arc<dyn DatabaseEngine>) {
        self.engines.insert(engine.kind().to_string(), engine);
    }

    pub fn get(&self, kind: &str) -> CoreResult<Arc<dyn DatabaseEngine>> {
        self.engines
            .get(kind)
            .cloned()
            .ok_or_else(|| CoreError::UnsupportedEngineKind(kind.to_string()))
    }

    pub fn supports(&self, kind: &str) -> bool {
        self.engines.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.engines.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_registered_kinds_only() {
        let registry = EngineRegistry::with_defaults();
        assert!(registry.supports("sqlite"));
        assert_eq!(registry.kinds(), vec!["sqlite".to_string()]);
        assert_eq!(registry.get("sqlite").expect("sqlite").kind(), "sqlite");

        let err = registry.get("postgresql").err().expect("unsupported");
        assert!(matches!(err, CoreError::UnsupportedEngineKind(kind) if kind == "postgresql"));
    }
}
