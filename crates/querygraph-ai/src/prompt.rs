//! Prompt sent to the LLM for mapping extraction.

pub const SYSTEM_PROMPT: &str =
    "You are a SQL expert. You read loosely structured spreadsheet content and \
     describe the query it asks for as JSON. You answer with JSON only.";

/// JSON shape the model must return. Keys here are the wire format parsed by
/// `StructuredMapping::from_json`.
const MAPPING_SCHEMA: &str = r#"{
    "tables": [
        {
            "name": "table_name",
            "alias": "optional_alias",
            "schema": "optional_schema",
            "columns": ["col1", "col2"],
            "description": "what this table represents"
        }
    ],
    "relationships": [
        {
            "left_table": "table1",
            "right_table": "table2",
            "join_type": "INNER|LEFT|RIGHT|FULL",
            "join_condition": "table1.id = table2.table1_id",
            "description": "how the sheet describes this join"
        }
    ],
    "output_columns": [
        {
            "table": "table_name",
            "column": "column_name",
            "alias": "optional_alias",
            "aggregation": "SUM|COUNT|AVG|MIN|MAX or null",
            "transformation": "business logic mentioned for this column"
        }
    ],
    "filters": [
        {
            "table": "table_name",
            "column": "column_name",
            "operator": "=|>|<|LIKE|IN|...",
            "value": "SQL literal, quoted when it is a string",
            "condition": "WHERE|HAVING",
            "description": "business rule behind the filter"
        }
    ],
    "business_logic": [
        {
            "rule": "description of business rule",
            "implementation": "how to implement it in SQL",
            "applies_to": "table or column this affects"
        }
    ],
    "connection_details": {
        "server_hostname": "extracted or null",
        "http_path": "extracted or null",
        "access_token": "extracted or null",
        "database": "default database if mentioned",
        "catalog": "catalog name if mentioned"
    },
    "metadata": {
        "description": "what this mapping accomplishes",
        "complexity": "SIMPLE|MEDIUM|COMPLEX",
        "estimated_tables": 0,
        "business_domain": "finance|sales|hr|... if identifiable",
        "sheets_analyzed": ["sheet names that contained useful information"]
    }
}"#;

const INSTRUCTIONS: &str = "\
- The content is often vague and incomplete. Infer reasonable defaults.
- Table names may refer to real database tables; keep them as written.
- Joins may be described in business terms. Translate them to SQL conditions.
- Column mappings may live in separate sections. Connect them.
- Sheet names often indicate what a sheet contains.
- Consolidate business rules that are scattered across sheets.
- Use null or empty arrays for missing information and say so in metadata.";

/// Builds the user prompt around the consolidated spreadsheet text.
pub fn extraction_prompt(content: &str) -> String {
    format!(
        "The spreadsheet content below describes how to build a SQL query. It may \
         contain table names, column mappings, joins written in natural language, \
         business rules, output requirements, filters and connection details spread \
         across sheets.\n\n\
         Extract the information and return ONLY a valid JSON object with exactly \
         this structure:\n{MAPPING_SCHEMA}\n\n\
         Instructions:\n{INSTRUCTIONS}\n\n\
         SPREADSHEET CONTENT:\n{content}\n\n\
         Return only the JSON object, no other text."
    )
}
