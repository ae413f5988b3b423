//! Query fragments and their validation against the engine.

use querygraph_core::{EngineError, Entity, QueryEngine, Relationship};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FragmentKey {
    Entity { name: String },
    Join { left: String, right: String },
}

impl FragmentKey {
    pub fn entity(name: impl Into<String>) -> Self {
        FragmentKey::Entity { name: name.into() }
    }

    pub fn join(left: impl Into<String>, right: impl Into<String>) -> Self {
        FragmentKey::Join {
            left: left.into(),
            right: right.into(),
        }
    }
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FragmentKey::Entity { name } => write!(f, "entity {}", name),
            FragmentKey::Join { left, right } => write!(f, "join {} -> {}", left, right),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Validation {
    Untested,
    Passed,
    Failed(String),
}

impl Validation {
    pub fn is_passed(&self) -> bool {
        matches!(self, Validation::Passed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fragment {
    pub key: FragmentKey,
    /// Access expression for entities, the join clause for joins.
    pub text: String,
    pub validation: Validation,
}

/// Fragments in insertion order. Inserting under an existing key replaces
/// only that entry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FragmentSet {
    fragments: Vec<Fragment>,
    #[serde(skip)]
    index: HashMap<FragmentKey, usize>,
}

impl FragmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fragment: Fragment) {
        match self.index.get(&fragment.key) {
            Some(&slot) => self.fragments[slot] = fragment,
            None => {
                self.index.insert(fragment.key.clone(), self.fragments.len());
                self.fragments.push(fragment);
            }
        }
    }

    pub fn get(&self, key: &FragmentKey) -> Option<&Fragment> {
        self.index.get(key).map(|&slot| &self.fragments[slot])
    }

    pub fn is_passed(&self, key: &FragmentKey) -> bool {
        self.get(key).is_some_and(|f| f.validation.is_passed())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter()
    }

    pub fn failures(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments
            .iter()
            .filter(|f| matches!(f.validation, Validation::Failed(_)))
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// `SELECT * FROM <schema.name>`
pub fn entity_access(entity: &Entity) -> String {
    format!("SELECT * FROM {}", entity.qualified_name())
}

pub fn entity_smoke_query(entity: &Entity) -> String {
    format!(
        "WITH {name}_cte AS ({access}) SELECT * FROM {name}_cte LIMIT 1",
        name = entity.name,
        access = entity_access(entity)
    )
}

pub fn join_clause(relationship: &Relationship, right: &Entity) -> String {
    format!(
        "{} JOIN {} ON {}",
        relationship.kind.as_sql(),
        right.qualified_name(),
        relationship.predicate
    )
}

pub fn join_smoke_query(relationship: &Relationship, left: &Entity, right: &Entity) -> String {
    format!(
        "SELECT COUNT(*) AS join_count FROM {} {}",
        left.qualified_name(),
        join_clause(relationship, right)
    )
}

/// Builds fragments and smoke-tests each one with a bounded query.
pub struct FragmentBuilder {
    engine: Arc<dyn QueryEngine>,
    timeout: Duration,
}

impl FragmentBuilder {
    pub fn new(engine: Arc<dyn QueryEngine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    /// Query-level failures become `Failed`; only connectivity errors escape.
    pub async fn validate(&self, sql: &str) -> Result<Validation, EngineError> {
        let outcome = tokio::time::timeout(self.timeout, self.engine.execute(sql, self.timeout)).await;
        match outcome {
            Ok(Ok(_)) => Ok(Validation::Passed),
            Ok(Err(e)) if e.is_fatal() => Err(e),
            Ok(Err(e)) => Ok(Validation::Failed(e.to_string())),
            Err(_) => Ok(Validation::Failed(format!(
                "timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    pub async fn build_entity(&self, entity: &Entity) -> Result<Fragment, EngineError> {
        let validation = self.validate(&entity_smoke_query(entity)).await?;
        debug!("Entity {} validation: {:?}", entity.name, validation);
        Ok(Fragment {
            key: FragmentKey::entity(&entity.name),
            text: entity_access(entity),
            validation,
        })
    }

    /// Joins naming an entity outside the mapping fail without an engine call.
    pub async fn build_join(
        &self,
        relationship: &Relationship,
        left: Option<&Entity>,
        right: Option<&Entity>,
    ) -> Result<Fragment, EngineError> {
        let key = FragmentKey::join(&relationship.left, &relationship.right);
        let (left, right) = match (left, right) {
            (Some(left), Some(right)) => (left, right),
            (None, _) => return Ok(unknown_endpoint(key, &relationship.left)),
            (_, None) => return Ok(unknown_endpoint(key, &relationship.right)),
        };

        let validation = self
            .validate(&join_smoke_query(relationship, left, right))
            .await?;
        debug!("{} validation: {:?}", key, validation);
        Ok(Fragment {
            key,
            text: join_clause(relationship, right),
            validation,
        })
    }
}

fn unknown_endpoint(key: FragmentKey, name: &str) -> Fragment {
    Fragment {
        key,
        text: String::new(),
        validation: Validation::Failed(format!("unknown entity '{}'", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use querygraph_core::{JoinKind, QueryResult};

    struct FixedEngine(Result<QueryResult, EngineError>);

    #[async_trait]
    impl QueryEngine for FixedEngine {
        async fn execute(&self, _sql: &str, _timeout: Duration) -> Result<QueryResult, EngineError> {
            self.0.clone()
        }
    }

    struct SlowEngine;

    #[async_trait]
    impl QueryEngine for SlowEngine {
        async fn execute(&self, _sql: &str, _timeout: Duration) -> Result<QueryResult, EngineError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(QueryResult::default())
        }
    }

    fn builder(result: Result<QueryResult, EngineError>) -> FragmentBuilder {
        FragmentBuilder::new(Arc::new(FixedEngine(result)), Duration::from_secs(10))
    }

    #[test]
    fn test_smoke_queries() {
        let orders = Entity::new("orders").with_schema("sales");
        let customers = Entity::new("customers");
        let rel = Relationship::new(
            "orders",
            "customers",
            JoinKind::Left,
            "orders.customer_id = customers.id",
        );

        assert_eq!(
            entity_smoke_query(&orders),
            "WITH orders_cte AS (SELECT * FROM sales.orders) SELECT * FROM orders_cte LIMIT 1"
        );
        assert_eq!(
            join_smoke_query(&rel, &orders, &customers),
            "SELECT COUNT(*) AS join_count FROM sales.orders LEFT JOIN customers ON orders.customer_id = customers.id"
        );
    }

    #[test]
    fn test_insert_replaces_only_same_key() {
        let mut set = FragmentSet::new();
        let fragment = |key: FragmentKey, validation| Fragment {
            key,
            text: String::new(),
            validation,
        };
        set.insert(fragment(FragmentKey::entity("a"), Validation::Passed));
        set.insert(fragment(FragmentKey::join("a", "b"), Validation::Untested));
        set.insert(fragment(FragmentKey::entity("a"), Validation::Failed("gone".into())));

        assert_eq!(set.len(), 2);
        assert!(!set.is_passed(&FragmentKey::entity("a")));
        assert_eq!(set.failures().count(), 1);
        assert_eq!(set.iter().next().unwrap().key, FragmentKey::entity("a"));
    }

    #[tokio::test]
    async fn test_rejection_is_recorded() {
        let fragment = builder(Err(EngineError::Rejected("TABLE_OR_VIEW_NOT_FOUND".into())))
            .build_entity(&Entity::new("orders"))
            .await
            .unwrap();
        assert_eq!(
            fragment.validation,
            Validation::Failed("query rejected: TABLE_OR_VIEW_NOT_FOUND".into())
        );
        assert_eq!(fragment.text, "SELECT * FROM orders");
    }

    #[tokio::test]
    async fn test_connectivity_escapes() {
        let err = builder(Err(EngineError::Connectivity("refused".into())))
            .build_entity(&Entity::new("orders"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_join_endpoint_skips_engine() {
        let rel = Relationship::new("orders", "ghost", JoinKind::Inner, "orders.g = ghost.id");
        let builder = builder(Err(EngineError::Connectivity("must not be called".into())));
        let fragment = tokio_test::block_on(builder.build_join(&rel, Some(&Entity::new("orders")), None))
            .unwrap();
        assert_eq!(
            fragment.validation,
            Validation::Failed("unknown entity 'ghost'".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_timeout_bounds_slow_engine() {
        let builder = FragmentBuilder::new(Arc::new(SlowEngine), Duration::from_secs(10));
        let validation = builder.validate("SELECT 1").await.unwrap();
        assert_eq!(validation, Validation::Failed("timed out after 10s".into()));
    }
}
