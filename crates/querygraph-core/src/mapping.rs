//! Structured mapping produced by the extraction service.
//!
//! Extraction output arrives as loosely shaped JSON (the keys follow the
//! extraction prompt: `tables`, `left_table`, `join_condition`, ...). It is
//! decoded into private wire structs and converted into the fixed model with
//! `TryFrom`, so malformed output is rejected here instead of reaching the
//! graph builder.

use crate::error::{QueryGraphError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// A table reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub alias: Option<String>,
    pub schema: Option<String>,
    pub columns: Vec<String>,
    pub description: String,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            schema: None,
            columns: Vec::new(),
            description: String::new(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// `schema.name` when a schema is known, the bare name otherwise.
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER",
            JoinKind::Left => "LEFT",
            JoinKind::Right => "RIGHT",
            JoinKind::Full => "FULL",
        }
    }

    /// The same join written from the other side.
    pub fn flipped(self) -> Self {
        match self {
            JoinKind::Left => JoinKind::Right,
            JoinKind::Right => JoinKind::Left,
            other => other,
        }
    }
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for JoinKind {
    type Err = QueryGraphError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
        let normalized = normalized.trim_end_matches(" JOIN").trim_end_matches("JOIN");
        match normalized.trim() {
            "" | "INNER" => Ok(JoinKind::Inner),
            "LEFT" | "LEFT OUTER" => Ok(JoinKind::Left),
            "RIGHT" | "RIGHT OUTER" => Ok(JoinKind::Right),
            "FULL" | "FULL OUTER" | "OUTER" => Ok(JoinKind::Full),
            other => Err(QueryGraphError::InvalidMapping(format!(
                "unknown join type '{}'. Must be one of: INNER, LEFT, RIGHT, FULL",
                other
            ))),
        }
    }
}

/// A join edge. The left entity depends on the right entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub left: String,
    pub right: String,
    pub kind: JoinKind,
    pub predicate: String,
    pub description: String,
}

impl Relationship {
    pub fn new(
        left: impl Into<String>,
        right: impl Into<String>,
        kind: JoinKind,
        predicate: impl Into<String>,
    ) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
            kind,
            predicate: predicate.into(),
            description: String::new(),
        }
    }
}

/// One projected column. Projection order follows mapping order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputColumn {
    /// Owning entity; empty when the extraction left the column unqualified.
    pub entity: String,
    pub column: String,
    pub alias: Option<String>,
    pub aggregation: Option<String>,
    pub transformation: Option<String>,
}

impl OutputColumn {
    pub fn new(entity: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            column: column.into(),
            alias: None,
            aggregation: None,
            transformation: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_aggregation(mut self, aggregation: impl Into<String>) -> Self {
        self.aggregation = Some(aggregation.into());
        self
    }

    pub fn column_ref(&self) -> String {
        qualify(&self.entity, &self.column)
    }
}

/// Which clause a filter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterClause {
    /// WHERE predicate.
    Row,
    /// HAVING predicate.
    Aggregate,
}

impl FromStr for FilterClause {
    type Err = QueryGraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "" | "WHERE" | "ROW" => Ok(FilterClause::Row),
            "HAVING" | "AGGREGATE" => Ok(FilterClause::Aggregate),
            other => Err(QueryGraphError::InvalidMapping(format!(
                "unknown filter condition '{}'. Must be one of: WHERE, HAVING",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub entity: String,
    pub column: String,
    pub operator: String,
    pub value: String,
    pub clause: FilterClause,
    pub description: String,
}

impl Filter {
    pub fn new(
        entity: impl Into<String>,
        column: impl Into<String>,
        operator: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            column: column.into(),
            operator: operator.into(),
            value: value.into(),
            clause: FilterClause::Row,
            description: String::new(),
        }
    }

    pub fn aggregate(mut self) -> Self {
        self.clause = FilterClause::Aggregate;
        self
    }

    /// Renders `entity.column OP value`; operators such as `IS NULL` carry no value.
    pub fn predicate(&self) -> String {
        let mut predicate = format!("{} {}", qualify(&self.entity, &self.column), self.operator);
        if !self.value.is_empty() {
            predicate.push(' ');
            predicate.push_str(&self.value);
        }
        predicate.trim().to_string()
    }
}

/// Business rule captured from the source document. Narrated, not compiled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessRule {
    pub rule: String,
    pub implementation: Option<String>,
    pub applies_to: Option<String>,
}

/// Engine connection parameters. Opaque to the orchestrator.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDetails {
    pub server_hostname: Option<String>,
    pub http_path: Option<String>,
    pub access_token: Option<String>,
    pub catalog: Option<String>,
    pub database: Option<String>,
}

impl ConnectionDetails {
    /// Fills every missing field of `self` from `fallback`.
    pub fn merged_with(&self, fallback: &ConnectionDetails) -> ConnectionDetails {
        ConnectionDetails {
            server_hostname: self
                .server_hostname
                .clone()
                .or_else(|| fallback.server_hostname.clone()),
            http_path: self.http_path.clone().or_else(|| fallback.http_path.clone()),
            access_token: self
                .access_token
                .clone()
                .or_else(|| fallback.access_token.clone()),
            catalog: self.catalog.clone().or_else(|| fallback.catalog.clone()),
            database: self.database.clone().or_else(|| fallback.database.clone()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.server_hostname.is_some() && self.http_path.is_some() && self.access_token.is_some()
    }
}

impl fmt::Debug for ConnectionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDetails")
            .field("server_hostname", &self.server_hostname)
            .field("http_path", &self.http_path)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("catalog", &self.catalog)
            .field("database", &self.database)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

/// Informational metadata reported by the extraction service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingMetadata {
    pub description: Option<String>,
    pub complexity: Option<Complexity>,
    pub estimated_tables: Option<u32>,
    pub business_domain: Option<String>,
    pub sheets_analyzed: Vec<String>,
}

/// Normalized description of tables, joins, columns, filters and rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredMapping {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub output_columns: Vec<OutputColumn>,
    pub filters: Vec<Filter>,
    pub business_rules: Vec<BusinessRule>,
    pub connection: ConnectionDetails,
    pub metadata: MappingMetadata,
}

impl StructuredMapping {
    /// Parses extraction output. Anything that is not a well-formed mapping is an
    /// extraction failure.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawMapping = serde_json::from_str(text).map_err(|e| {
            QueryGraphError::Extraction(format!("response is not a structured mapping: {}", e))
        })?;
        Self::try_from(raw)
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Checks the invariants enforced at the extraction boundary. Mappings built
    /// in code go through this before being handed to the orchestrator.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entity in &self.entities {
            if entity.name.trim().is_empty() {
                return Err(QueryGraphError::InvalidMapping(
                    "table entry without a name".to_string(),
                ));
            }
            if !seen.insert(entity.name.as_str()) {
                return Err(QueryGraphError::InvalidMapping(format!(
                    "table '{}' is declared more than once",
                    entity.name
                )));
            }
        }

        for rel in &self.relationships {
            if rel.left.trim().is_empty() || rel.right.trim().is_empty() {
                return Err(QueryGraphError::InvalidMapping(
                    "relationship is missing left_table or right_table".to_string(),
                ));
            }
            if rel.predicate.trim().is_empty() {
                return Err(QueryGraphError::InvalidMapping(format!(
                    "relationship {} -> {} has no join_condition",
                    rel.left, rel.right
                )));
            }
        }

        if let Some(col) = self.output_columns.iter().find(|c| c.column.trim().is_empty()) {
            return Err(QueryGraphError::InvalidMapping(format!(
                "output column on table '{}' has no column name",
                col.entity
            )));
        }

        if let Some(filter) = self.filters.iter().find(|f| f.column.trim().is_empty()) {
            return Err(QueryGraphError::InvalidMapping(format!(
                "filter on table '{}' has no column name",
                filter.entity
            )));
        }

        Ok(())
    }
}

fn qualify(entity: &str, column: &str) -> String {
    if entity.is_empty() {
        column.to_string()
    } else {
        format!("{}.{}", entity, column)
    }
}

// Wire format of the extraction service.

#[derive(Debug, Deserialize)]
struct RawMapping {
    #[serde(default)]
    tables: Option<Vec<RawTable>>,
    #[serde(default)]
    relationships: Option<Vec<RawRelationship>>,
    #[serde(default)]
    output_columns: Option<Vec<RawOutputColumn>>,
    #[serde(default)]
    filters: Option<Vec<RawFilter>>,
    #[serde(default)]
    business_logic: Option<Vec<RawBusinessRule>>,
    #[serde(default)]
    connection_details: Option<RawConnection>,
    #[serde(default)]
    metadata: Option<RawMetadata>,
}

#[derive(Debug, Deserialize)]
struct RawTable {
    name: Option<String>,
    alias: Option<String>,
    schema: Option<String>,
    columns: Option<Vec<String>>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRelationship {
    left_table: Option<String>,
    right_table: Option<String>,
    join_type: Option<String>,
    join_condition: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawOutputColumn {
    table: Option<String>,
    column: Option<String>,
    alias: Option<String>,
    aggregation: Option<String>,
    transformation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFilter {
    table: Option<String>,
    column: Option<String>,
    operator: Option<String>,
    value: Option<serde_json::Value>,
    condition: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBusinessRule {
    rule: Option<String>,
    implementation: Option<String>,
    applies_to: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConnection {
    server_hostname: Option<String>,
    http_path: Option<String>,
    access_token: Option<String>,
    database: Option<String>,
    catalog: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    description: Option<String>,
    complexity: Option<String>,
    estimated_tables: Option<u32>,
    business_domain: Option<String>,
    sheets_analyzed: Option<Vec<String>>,
}

/// Treats blank strings and a literal "null" as absent.
fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("null"))
}

/// Renders a filter value as SQL text. Strings are taken verbatim, since the
/// extraction prompt asks for SQL-ready literals.
fn literal(value: Option<serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.trim().to_string(),
        Some(serde_json::Value::Bool(b)) => b.to_string().to_uppercase(),
        Some(serde_json::Value::Array(items)) => {
            let rendered: Vec<String> = items.into_iter().map(|v| literal(Some(v))).collect();
            format!("({})", rendered.join(", "))
        }
        Some(other) => other.to_string(),
    }
}

impl TryFrom<RawMapping> for StructuredMapping {
    type Error = QueryGraphError;

    fn try_from(raw: RawMapping) -> Result<Self> {
        let entities = raw
            .tables
            .unwrap_or_default()
            .into_iter()
            .map(|t| Entity {
                name: present(t.name).unwrap_or_default(),
                alias: present(t.alias),
                schema: present(t.schema),
                columns: t.columns.unwrap_or_default(),
                description: present(t.description).unwrap_or_default(),
            })
            .collect();

        let relationships = raw
            .relationships
            .unwrap_or_default()
            .into_iter()
            .map(|r| -> Result<Relationship> {
                let kind = match present(r.join_type) {
                    Some(kind) => kind.parse()?,
                    None => JoinKind::Inner,
                };
                Ok(Relationship {
                    left: present(r.left_table).unwrap_or_default(),
                    right: present(r.right_table).unwrap_or_default(),
                    kind,
                    predicate: present(r.join_condition).unwrap_or_default(),
                    description: present(r.description).unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let output_columns = raw
            .output_columns
            .unwrap_or_default()
            .into_iter()
            .map(|c| OutputColumn {
                entity: present(c.table).unwrap_or_default(),
                column: present(c.column).unwrap_or_default(),
                alias: present(c.alias),
                aggregation: present(c.aggregation),
                transformation: present(c.transformation),
            })
            .collect();

        let filters = raw
            .filters
            .unwrap_or_default()
            .into_iter()
            .map(|f| -> Result<Filter> {
                let clause = match present(f.condition) {
                    Some(condition) => condition.parse()?,
                    None => FilterClause::Row,
                };
                Ok(Filter {
                    entity: present(f.table).unwrap_or_default(),
                    column: present(f.column).unwrap_or_default(),
                    operator: present(f.operator).unwrap_or_else(|| "=".to_string()),
                    value: literal(f.value),
                    clause,
                    description: present(f.description).unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let business_rules = raw
            .business_logic
            .unwrap_or_default()
            .into_iter()
            .filter_map(|b| {
                present(b.rule).map(|rule| BusinessRule {
                    rule,
                    implementation: present(b.implementation),
                    applies_to: present(b.applies_to),
                })
            })
            .collect();

        let connection = raw
            .connection_details
            .map(|c| ConnectionDetails {
                server_hostname: present(c.server_hostname),
                http_path: present(c.http_path),
                access_token: present(c.access_token),
                catalog: present(c.catalog),
                database: present(c.database),
            })
            .unwrap_or_default();

        let metadata = raw
            .metadata
            .map(|m| MappingMetadata {
                description: present(m.description),
                complexity: present(m.complexity).and_then(|c| {
                    match c.to_uppercase().as_str() {
                        "SIMPLE" => Some(Complexity::Simple),
                        "MEDIUM" => Some(Complexity::Medium),
                        "COMPLEX" => Some(Complexity::Complex),
                        _ => None,
                    }
                }),
                estimated_tables: m.estimated_tables,
                business_domain: present(m.business_domain),
                sheets_analyzed: m.sheets_analyzed.unwrap_or_default(),
            })
            .unwrap_or_default();

        let mapping = StructuredMapping {
            entities,
            relationships,
            output_columns,
            filters,
            business_rules,
            connection,
            metadata,
        };
        mapping.validate()?;
        Ok(mapping)
    }
}
