//! Query engine adapters.

pub mod databricks;
mod statement;

pub use databricks::{DatabricksConnector, DatabricksEngine};
