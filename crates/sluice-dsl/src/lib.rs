//! # Sluice DSL
//!
//! The Sluice DSL is the JSON shape vocabulary the graphical flow designer
//! emits. This crate provides functionality for parsing, validating, and
//! re-serializing those documents into the typed flow graph model that the
//! Sluice runtime executes.
//!
//! ## Features
//!
//! * JSON shape documents for defining flow graphs
//! * Shape-type dispatch with hard failures on unknown shapes
//! * Structural validation via a registered rule set, first violation wins
//! * Raw filter properties coerced at validation time, not parse time
//! * Round-trip serialization back into the shape vocabulary
//!
//! ## Example
//!
//! ```
//! use sluice_dsl::parse_and_validate_flow_graph;
//!
//! // Define a simple flow
//! let raw = r#"{
//!     "metaId": "flow-hello",
//!     "name": "hello-flow",
//!     "version": "1.0.0",
//!     "shapes": [
//!         { "metaId": "start", "type": "startNodeState", "name": "start" },
//!         { "metaId": "work", "type": "state", "name": "work",
//!           "jober": { "type": "generalJober", "fitables": ["notify.sms"] } },
//!         { "metaId": "end", "type": "endNodeState", "name": "end" },
//!         { "metaId": "e1", "type": "event", "fromShape": "start", "toShape": "work" },
//!         { "metaId": "e2", "type": "event", "fromShape": "work", "toShape": "end" }
//!     ]
//! }"#;
//!
//! let result = parse_and_validate_flow_graph(raw);
//! assert!(result.is_ok());
//! ```

mod error;
mod parser;

pub mod validation;

pub use error::GraphError;
pub use parser::{parse_flow_graph, serialize_flow_graph};
pub use validation::{error_codes, validate_flow_graph, RuleSet, ValidationError};

// The parsed graph model lives in the core crate; re-export the types a
// graph author touches so this crate works standalone.
pub use sluice_core::domain::flow_graph::{
    EventId, FilterKind, FlowDefinition, FlowEvent, FlowFilter, FlowId, FlowJober, FlowNode,
    FlowTask, JoberKind, NodeId, NodeKind, TaskKind,
};

/// Parse and validate a raw JSON flow graph.
///
/// This function performs both parsing and validation of a shape document:
/// 1. Parses the JSON into the typed flow graph model
/// 2. Validates the graph against the standard rule set
/// 3. Returns a fully validated `FlowDefinition` or a detailed error
///
/// # Arguments
///
/// * `raw_graph` - A JSON string containing a flow graph shape document
///
/// # Returns
///
/// A `Result` containing either the parsed and validated `FlowDefinition` or
/// a `GraphError`
///
/// # Errors
///
/// This function can fail for several reasons:
/// * Invalid JSON syntax
/// * An unknown shape-type, jober-type, task-type or filter-type tag
/// * An event naming an undeclared shape
/// * Validation errors (node counts, forbidden attachments, bad thresholds)
///
/// # Examples
///
/// Basic usage with a valid document:
///
/// ```
/// use sluice_dsl::parse_and_validate_flow_graph;
///
/// let raw = r#"{
///     "metaId": "flow-hello",
///     "shapes": [
///         { "metaId": "start", "type": "startNodeState" },
///         { "metaId": "end", "type": "endNodeState" },
///         { "metaId": "e1", "type": "event", "fromShape": "start", "toShape": "end" }
///     ]
/// }"#;
///
/// let definition = parse_and_validate_flow_graph(raw).unwrap();
/// assert_eq!(definition.nodes.len(), 2);
/// ```
///
/// Handling validation errors:
///
/// ```
/// use sluice_dsl::parse_and_validate_flow_graph;
///
/// // End nodes are terminal; this one illegally declares a jober
/// let invalid = r#"{
///     "metaId": "flow-bad",
///     "shapes": [
///         { "metaId": "start", "type": "startNodeState" },
///         { "metaId": "end", "type": "endNodeState",
///           "jober": { "type": "echoJober" } },
///         { "metaId": "e1", "type": "event", "fromShape": "start", "toShape": "end" }
///     ]
/// }"#;
///
/// let result = parse_and_validate_flow_graph(invalid);
/// assert!(result.is_err());
///
/// // You can extract detailed information from the error
/// if let Err(error) = result {
///     assert!(error.error_code().contains("FORBIDDEN_ATTACHMENT"));
/// }
/// ```
pub fn parse_and_validate_flow_graph(raw_graph: &str) -> Result<FlowDefinition, GraphError> {
    // First parse the JSON string into the typed graph model
    let definition = parser::parse_flow_graph(raw_graph)?;

    // Then run the standard rule set
    validation::validate_flow_graph(&definition)?;

    Ok(definition)
}

/// Returns a version string for the Sluice DSL crate
///
/// # Returns
///
/// The version of the crate as defined in Cargo.toml
///
/// # Examples
///
/// ```
/// use sluice_dsl::version;
///
/// let ver = version();
/// assert!(ver.starts_with("0."));
/// ```
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
