//! Final query assembly from validated fragments.

use crate::fragments::{entity_access, FragmentKey, FragmentSet};
use querygraph_core::{
    Entity, Filter, FilterClause, OutputColumn, Relationship, StructuredMapping,
};
use querygraph_graph::BuildOrder;
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("no viable base entity: every entity fragment failed validation")]
    NoViableBaseEntity,
}

pub type Result<T> = std::result::Result<T, AssemblyError>;

/// A validated join that did not make it into the FROM/JOIN chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedJoin {
    pub left: String,
    pub right: String,
    pub reason: String,
}

impl SkippedJoin {
    pub fn describe(&self) -> String {
        format!("Join {} -> {} skipped: {}", self.left, self.right, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssembledQuery {
    pub sql: String,
    pub anchor: String,
    /// Entities reached through JOIN clauses, in emission order.
    pub joined: Vec<String>,
    pub omitted_entities: Vec<String>,
    /// Validated entities that no emitted join reaches.
    pub unconnected_entities: Vec<String>,
    pub skipped_joins: Vec<SkippedJoin>,
    /// Output columns left out because their entity is not in the query.
    pub dropped_columns: Vec<String>,
    /// Row filters left out because their entity is not in the query.
    pub dropped_filters: Vec<String>,
    /// Aggregate filters, rendered but not emitted.
    pub deferred_filters: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Assembler {
    use_cte_preamble: bool,
}

impl Assembler {
    pub fn new(use_cte_preamble: bool) -> Self {
        Self { use_cte_preamble }
    }

    pub fn assemble(
        &self,
        mapping: &StructuredMapping,
        order: &BuildOrder,
        fragments: &FragmentSet,
    ) -> Result<AssembledQuery> {
        let mut survivors: Vec<&Entity> = Vec::new();
        let mut omitted_entities = Vec::new();
        for name in order.sequence() {
            match mapping.entity(name) {
                Some(entity) if fragments.is_passed(&FragmentKey::entity(name)) => {
                    survivors.push(entity)
                }
                _ => omitted_entities.push(name.clone()),
            }
        }

        let surviving: HashSet<&str> = survivors.iter().map(|e| e.name.as_str()).collect();
        let mut skipped_joins = Vec::new();
        let mut includable: Vec<&Relationship> = Vec::new();
        for rel in &mapping.relationships {
            if !fragments.is_passed(&FragmentKey::join(&rel.left, &rel.right)) {
                // Already reported when the fragment failed
                continue;
            }
            if surviving.contains(rel.left.as_str()) && surviving.contains(rel.right.as_str()) {
                includable.push(rel);
            } else {
                skipped_joins.push(skip(rel, "an endpoint entity was omitted"));
            }
        }

        let anchor = survivors
            .iter()
            .find(|e| !includable.iter().any(|rel| rel.right == e.name))
            .or_else(|| survivors.first())
            .copied()
            .ok_or(AssemblyError::NoViableBaseEntity)?;
        debug!("Anchor entity: {}", anchor.name);

        let (chain, joined) = self.join_chain(mapping, anchor, includable, &mut skipped_joins);

        let mut reachable: HashSet<String> = joined.iter().cloned().collect();
        reachable.insert(anchor.name.clone());
        // Unqualified columns and filters cannot be placed, so they stay
        let in_query = |entity: &str| entity.is_empty() || reachable.contains(entity);

        let (in_chain, unconnected): (Vec<&Entity>, Vec<&Entity>) = survivors
            .iter()
            .copied()
            .partition(|e| reachable.contains(e.name.as_str()));
        let (columns, dropped_columns): (Vec<&OutputColumn>, Vec<&OutputColumn>) = mapping
            .output_columns
            .iter()
            .partition(|c| in_query(&c.entity));
        let (row, deferred_filters): (Vec<&Filter>, Vec<&Filter>) = mapping
            .filters
            .iter()
            .partition(|f| f.clause == FilterClause::Row);
        let (row, dropped_filters): (Vec<&Filter>, Vec<&Filter>) =
            row.into_iter().partition(|f| in_query(&f.entity));

        let mut clauses = Vec::new();
        if self.use_cte_preamble {
            clauses.push(cte_preamble(&in_chain));
        }
        clauses.push(format!("SELECT {}", projection(&columns)));
        clauses.push(format!("FROM {}", self.relation(anchor)));
        clauses.extend(chain);
        if !row.is_empty() {
            let predicates: Vec<String> = row.iter().map(|f| f.predicate()).collect();
            clauses.push(format!("WHERE {}", predicates.join(" AND ")));
        }

        Ok(AssembledQuery {
            sql: clauses.join("\n"),
            anchor: anchor.name.clone(),
            joined,
            omitted_entities,
            unconnected_entities: unconnected.iter().map(|e| e.name.clone()).collect(),
            skipped_joins,
            dropped_columns: dropped_columns.iter().map(|c| c.column_ref()).collect(),
            dropped_filters: dropped_filters.iter().map(|f| f.predicate()).collect(),
            deferred_filters: deferred_filters.iter().map(|f| f.predicate()).collect(),
        })
    }

    /// Emits joins in relationship order. A join reaching the chain only
    /// through its right side is written from that side with the join kind
    /// flipped. A join touching neither side yet is retried after later joins
    /// extend the chain.
    fn join_chain(
        &self,
        mapping: &StructuredMapping,
        anchor: &Entity,
        includable: Vec<&Relationship>,
        skipped: &mut Vec<SkippedJoin>,
    ) -> (Vec<String>, Vec<String>) {
        let mut in_chain: HashSet<&str> = HashSet::from([anchor.name.as_str()]);
        let mut clauses = Vec::new();
        let mut joined = Vec::new();
        let mut pending = includable;

        loop {
            let before = pending.len();
            let mut deferred = Vec::new();
            for rel in pending {
                let has_left = in_chain.contains(rel.left.as_str());
                let has_right = in_chain.contains(rel.right.as_str());
                let (kind, target) = match (has_left, has_right) {
                    (true, true) => {
                        skipped.push(skip(rel, "both sides are already joined"));
                        continue;
                    }
                    (true, false) => (rel.kind, &rel.right),
                    (false, true) => (rel.kind.flipped(), &rel.left),
                    (false, false) => {
                        deferred.push(rel);
                        continue;
                    }
                };
                // Endpoints survived, so the lookup cannot miss
                if let Some(entity) = mapping.entity(target) {
                    clauses.push(format!(
                        "{} JOIN {} ON {}",
                        kind.as_sql(),
                        self.relation(entity),
                        rel.predicate
                    ));
                    in_chain.insert(target.as_str());
                    joined.push(target.clone());
                }
            }
            if deferred.is_empty() || deferred.len() == before {
                skipped.extend(
                    deferred
                        .into_iter()
                        .map(|rel| skip(rel, "not connected to the base entity")),
                );
                break;
            }
            pending = deferred;
        }

        (clauses, joined)
    }

    fn relation(&self, entity: &Entity) -> String {
        if self.use_cte_preamble {
            format!("{}_cte AS {}", entity.name, entity.name)
        } else {
            entity.qualified_name()
        }
    }
}

fn skip(rel: &Relationship, reason: &str) -> SkippedJoin {
    SkippedJoin {
        left: rel.left.clone(),
        right: rel.right.clone(),
        reason: reason.to_string(),
    }
}

fn cte_preamble(survivors: &[&Entity]) -> String {
    let entries: Vec<String> = survivors
        .iter()
        .map(|e| format!("{}_cte AS ({})", e.name, entity_access(e)))
        .collect();
    format!("WITH {}", entries.join(",\n"))
}

fn projection(columns: &[&OutputColumn]) -> String {
    if columns.is_empty() {
        return "*".to_string();
    }
    columns
        .iter()
        .map(|c| {
            let expr = match &c.aggregation {
                Some(agg) => format!("{}({})", agg.to_uppercase(), c.column_ref()),
                None => c.column_ref(),
            };
            match &c.alias {
                Some(alias) => format!("{} AS {}", expr, alias),
                None => expr,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Wraps the assembled query so the engine returns at most one row.
pub fn final_smoke_query(sql: &str) -> String {
    format!("SELECT * FROM ({}) AS final_smoke_test LIMIT 1", sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragments::{Fragment, Validation};
    use querygraph_core::JoinKind;
    use querygraph_graph::{plan_build_order, resolve_cycles, DependencyGraph};

    fn orders_mapping() -> StructuredMapping {
        StructuredMapping {
            entities: vec![
                Entity::new("orders").with_schema("sales"),
                Entity::new("customers"),
            ],
            relationships: vec![Relationship::new(
                "orders",
                "customers",
                JoinKind::Inner,
                "orders.customer_id = customers.id",
            )],
            output_columns: vec![OutputColumn::new("customers", "name").with_alias("customer_name")],
            filters: vec![Filter::new("orders", "status", "=", "'open'")],
            ..Default::default()
        }
    }

    fn fragments(passed: &[FragmentKey], failed: &[FragmentKey]) -> FragmentSet {
        let mut set = FragmentSet::new();
        for key in passed {
            set.insert(Fragment {
                key: key.clone(),
                text: String::new(),
                validation: Validation::Passed,
            });
        }
        for key in failed {
            set.insert(Fragment {
                key: key.clone(),
                text: String::new(),
                validation: Validation::Failed("rejected".into()),
            });
        }
        set
    }

    fn order_for(mapping: &StructuredMapping) -> BuildOrder {
        let mut graph = DependencyGraph::from_mapping(mapping);
        resolve_cycles(&mut graph);
        plan_build_order(&graph)
    }

    #[test]
    fn test_orders_customers_query() {
        let mapping = orders_mapping();
        let set = fragments(
            &[
                FragmentKey::entity("orders"),
                FragmentKey::entity("customers"),
                FragmentKey::join("orders", "customers"),
            ],
            &[],
        );

        let query = Assembler::default()
            .assemble(&mapping, &order_for(&mapping), &set)
            .unwrap();
        assert_eq!(
            query.sql,
            "SELECT customers.name AS customer_name\nFROM sales.orders\nINNER JOIN customers ON orders.customer_id = customers.id\nWHERE orders.status = 'open'"
        );
        assert_eq!(query.anchor, "orders");
        assert_eq!(query.joined, vec!["customers"]);
    }

    #[test]
    fn test_failed_join_anchors_on_first_survivor() {
        let mapping = orders_mapping();
        let set = fragments(
            &[FragmentKey::entity("orders"), FragmentKey::entity("customers")],
            &[FragmentKey::join("orders", "customers")],
        );

        let query = Assembler::default()
            .assemble(&mapping, &order_for(&mapping), &set)
            .unwrap();
        assert_eq!(query.anchor, "customers");
        assert_eq!(query.sql, "SELECT customers.name AS customer_name\nFROM customers");
        assert!(query.skipped_joins.is_empty());
        assert_eq!(query.unconnected_entities, vec!["orders"]);
        assert_eq!(query.dropped_filters, vec!["orders.status = 'open'"]);
        assert!(query.dropped_columns.is_empty());
    }

    #[test]
    fn test_unreachable_columns_and_filters_are_dropped() {
        let mut mapping = orders_mapping();
        mapping.output_columns.push(OutputColumn::new("", "created_at"));
        let set = fragments(
            &[FragmentKey::entity("orders"), FragmentKey::join("orders", "customers")],
            &[FragmentKey::entity("customers")],
        );

        let query = Assembler::default()
            .assemble(&mapping, &order_for(&mapping), &set)
            .unwrap();
        assert_eq!(query.anchor, "orders");
        assert_eq!(query.dropped_columns, vec!["customers.name"]);
        assert!(query.dropped_filters.is_empty());
        assert!(query.unconnected_entities.is_empty());
        assert_eq!(
            query.sql,
            "SELECT created_at\nFROM sales.orders\nWHERE orders.status = 'open'"
        );
    }

    #[test]
    fn test_converging_joins_are_all_emitted() {
        // Both orders and invoices point at customers
        let mapping = StructuredMapping {
            entities: vec![
                Entity::new("orders"),
                Entity::new("customers"),
                Entity::new("invoices"),
            ],
            relationships: vec![
                Relationship::new("orders", "customers", JoinKind::Left, "orders.customer_id = customers.id"),
                Relationship::new("invoices", "customers", JoinKind::Left, "invoices.customer_id = customers.id"),
            ],
            output_columns: vec![OutputColumn::new("invoices", "total")],
            ..Default::default()
        };
        let set = fragments(
            &[
                FragmentKey::entity("orders"),
                FragmentKey::entity("customers"),
                FragmentKey::entity("invoices"),
                FragmentKey::join("orders", "customers"),
                FragmentKey::join("invoices", "customers"),
            ],
            &[],
        );

        let query = Assembler::default()
            .assemble(&mapping, &order_for(&mapping), &set)
            .unwrap();
        assert_eq!(query.anchor, "orders");
        assert_eq!(query.joined, vec!["customers", "invoices"]);
        assert!(query.skipped_joins.is_empty());
        assert!(query.dropped_columns.is_empty());
        assert_eq!(
            query.sql,
            "SELECT invoices.total\nFROM orders\n\
             LEFT JOIN customers ON orders.customer_id = customers.id\n\
             RIGHT JOIN invoices ON invoices.customer_id = customers.id"
        );
    }

    #[test]
    fn test_join_between_chained_entities_is_skipped() {
        let mapping = StructuredMapping {
            entities: vec![Entity::new("a"), Entity::new("b")],
            relationships: vec![
                Relationship::new("a", "b", JoinKind::Inner, "a.b_id = b.id"),
                Relationship::new("a", "b", JoinKind::Inner, "a.alt_b_id = b.id"),
            ],
            ..Default::default()
        };
        let set = fragments(
            &[FragmentKey::entity("a"), FragmentKey::entity("b"), FragmentKey::join("a", "b")],
            &[],
        );

        let query = Assembler::default()
            .assemble(&mapping, &order_for(&mapping), &set)
            .unwrap();
        assert_eq!(query.joined, vec!["b"]);
        assert_eq!(query.skipped_joins[0].reason, "both sides are already joined");
    }

    #[test]
    fn test_no_survivors() {
        let mapping = orders_mapping();
        let set = fragments(&[], &[FragmentKey::entity("orders"), FragmentKey::entity("customers")]);
        assert_eq!(
            Assembler::default().assemble(&mapping, &order_for(&mapping), &set),
            Err(AssemblyError::NoViableBaseEntity)
        );
    }

    #[test]
    fn test_omitted_endpoint_skips_passed_join() {
        let mapping = orders_mapping();
        let set = fragments(
            &[FragmentKey::entity("orders"), FragmentKey::join("orders", "customers")],
            &[FragmentKey::entity("customers")],
        );

        let query = Assembler::default()
            .assemble(&mapping, &order_for(&mapping), &set)
            .unwrap();
        assert_eq!(query.omitted_entities, vec!["customers"]);
        assert_eq!(query.skipped_joins.len(), 1);
        assert!(query.skipped_joins[0].describe().contains("orders -> customers"));
    }

    #[test]
    fn test_projection_and_deferred_filters() {
        let mut mapping = orders_mapping();
        mapping.output_columns = vec![
            OutputColumn::new("orders", "amount")
                .with_aggregation("sum")
                .with_alias("total"),
            OutputColumn::new("customers", "region"),
        ];
        mapping.filters.push(Filter::new("orders", "amount", ">", "100").aggregate());
        let set = fragments(
            &[
                FragmentKey::entity("orders"),
                FragmentKey::entity("customers"),
                FragmentKey::join("orders", "customers"),
            ],
            &[],
        );

        let query = Assembler::default()
            .assemble(&mapping, &order_for(&mapping), &set)
            .unwrap();
        assert!(query
            .sql
            .starts_with("SELECT SUM(orders.amount) AS total, customers.region\n"));
        assert_eq!(query.deferred_filters, vec!["orders.amount > 100"]);
        assert!(!query.sql.contains("HAVING"));
    }

    #[test]
    fn test_empty_projection_selects_everything() {
        let mut mapping = orders_mapping();
        mapping.output_columns.clear();
        mapping.filters.clear();
        let set = fragments(&[FragmentKey::entity("orders")], &[FragmentKey::entity("customers")]);

        let query = Assembler::default()
            .assemble(&mapping, &order_for(&mapping), &set)
            .unwrap();
        assert_eq!(query.sql, "SELECT *\nFROM sales.orders");
    }

    #[test]
    fn test_cte_preamble() {
        let mapping = orders_mapping();
        let set = fragments(
            &[
                FragmentKey::entity("orders"),
                FragmentKey::entity("customers"),
                FragmentKey::join("orders", "customers"),
            ],
            &[],
        );

        let query = Assembler::new(true)
            .assemble(&mapping, &order_for(&mapping), &set)
            .unwrap();
        assert_eq!(
            query.sql,
            "WITH customers_cte AS (SELECT * FROM customers),\norders_cte AS (SELECT * FROM sales.orders)\n\
             SELECT customers.name AS customer_name\n\
             FROM orders_cte AS orders\n\
             INNER JOIN customers_cte AS customers ON orders.customer_id = customers.id\n\
             WHERE orders.status = 'open'"
        );
    }

    #[test]
    fn test_deferred_join_is_emitted_once_reachable() {
        // c -> b is listed before b -> a, so it waits for b to join first
        let mapping = StructuredMapping {
            entities: vec![Entity::new("a"), Entity::new("b"), Entity::new("c")],
            relationships: vec![
                Relationship::new("b", "c", JoinKind::Left, "b.c_id = c.id"),
                Relationship::new("a", "b", JoinKind::Left, "a.b_id = b.id"),
            ],
            ..Default::default()
        };
        let set = fragments(
            &[
                FragmentKey::entity("a"),
                FragmentKey::entity("b"),
                FragmentKey::entity("c"),
                FragmentKey::join("b", "c"),
                FragmentKey::join("a", "b"),
            ],
            &[],
        );

        let query = Assembler::default()
            .assemble(&mapping, &order_for(&mapping), &set)
            .unwrap();
        assert_eq!(query.anchor, "a");
        assert_eq!(query.joined, vec!["b", "c"]);
        assert_eq!(
            query.sql,
            "SELECT *\nFROM a\nLEFT JOIN b ON a.b_id = b.id\nLEFT JOIN c ON b.c_id = c.id"
        );
    }

    #[test]
    fn test_final_smoke_query() {
        assert_eq!(
            final_smoke_query("SELECT 1"),
            "SELECT * FROM (SELECT 1) AS final_smoke_test LIMIT 1"
        );
    }
}
