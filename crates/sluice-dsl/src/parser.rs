use crate::error::GraphError;
use lazy_static::lazy_static;
use serde::Deserialize;
use serde_json::json;
use sluice_core::domain::flow_graph::{
    EventId, FilterKind, FlowDefinition, FlowEvent, FlowFilter, FlowId, FlowJober, FlowNode,
    FlowTask, JoberKind, NodeId, NodeKind, TaskKind,
};
use std::collections::HashMap;

/// Raw graph document as emitted by the graphical designer
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGraph {
    meta_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    shapes: Vec<RawShape>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// One shape of the raw document. Node shapes and event shapes share this
/// struct; the handler for the shape's type tag decides which fields matter.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawShape {
    meta_id: String,
    #[serde(rename = "type")]
    shape_type: String,
    #[serde(default)]
    name: Option<String>,

    // Event shape fields
    #[serde(default)]
    from_shape: Option<String>,
    #[serde(default)]
    to_shape: Option<String>,
    #[serde(default)]
    defined_from_connector: Option<String>,
    #[serde(default)]
    condition_rule: Option<String>,

    // Node shape fields
    #[serde(default)]
    properties: HashMap<String, serde_json::Value>,
    #[serde(default)]
    jober: Option<RawJober>,
    #[serde(default)]
    task: Option<RawTask>,
    #[serde(default)]
    filters: Vec<RawFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJober {
    #[serde(rename = "type")]
    jober_type: String,
    #[serde(default)]
    fitables: Vec<String>,
    #[serde(default)]
    exception_fitables: Vec<String>,
    #[serde(default)]
    properties: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTask {
    task_id: String,
    #[serde(rename = "type")]
    task_type: String,
    #[serde(default)]
    fitables: Vec<String>,
    #[serde(default)]
    exception_fitables: Vec<String>,
    #[serde(default)]
    properties: HashMap<String, serde_json::Value>,
}

/// Filter properties stay raw strings; the rule set coerces them later.
#[derive(Debug, Deserialize)]
struct RawFilter {
    #[serde(rename = "type")]
    filter_type: String,
    #[serde(flatten)]
    properties: HashMap<String, serde_json::Value>,
}

/// What a shape handler produces
enum ShapeProduct {
    Node(FlowNode),
    Event(FlowEvent),
}

type ShapeHandler = fn(RawShape) -> Result<ShapeProduct, GraphError>;

lazy_static! {
    /// Dispatch table keyed by the shape-type tag. A tag outside this table
    /// is a hard parse failure.
    static ref SHAPE_HANDLERS: HashMap<&'static str, ShapeHandler> = {
        let mut handlers: HashMap<&'static str, ShapeHandler> = HashMap::new();
        handlers.insert("startNodeState", parse_node_shape);
        handlers.insert("state", parse_node_shape);
        handlers.insert("conditionState", parse_node_shape);
        handlers.insert("parallelState", parse_node_shape);
        handlers.insert("endNodeState", parse_node_shape);
        handlers.insert("event", parse_event_shape);
        handlers
    };
}

fn parse_node_shape(shape: RawShape) -> Result<ShapeProduct, GraphError> {
    let kind = NodeKind::from_type_tag(&shape.shape_type)
        .ok_or_else(|| GraphError::UnknownShapeType(shape.shape_type.clone()))?;

    let jober = shape.jober.map(parse_jober).transpose()?;
    let task = shape.task.map(parse_task).transpose()?;
    let filters = shape
        .filters
        .into_iter()
        .map(parse_filter)
        .collect::<Result<Vec<_>, _>>()?;

    let name = shape.name.unwrap_or_else(|| shape.meta_id.clone());
    Ok(ShapeProduct::Node(FlowNode {
        meta_id: NodeId(shape.meta_id),
        name,
        kind,
        events: Vec::new(),
        jober,
        task,
        filters,
        properties: shape.properties,
    }))
}

fn parse_event_shape(shape: RawShape) -> Result<ShapeProduct, GraphError> {
    let from = shape.from_shape.ok_or_else(|| {
        GraphError::MissingRequiredField(format!("event '{}' fromShape", shape.meta_id))
    })?;
    let to = shape.to_shape.ok_or_else(|| {
        GraphError::MissingRequiredField(format!("event '{}' toShape", shape.meta_id))
    })?;

    let name = shape.name.unwrap_or_else(|| shape.meta_id.clone());
    Ok(ShapeProduct::Event(FlowEvent {
        meta_id: EventId(shape.meta_id),
        name,
        from: NodeId(from),
        to: NodeId(to),
        condition_rule: shape.condition_rule,
        defined_from_connector: shape.defined_from_connector,
    }))
}

fn parse_jober(raw: RawJober) -> Result<FlowJober, GraphError> {
    let kind = JoberKind::from_type_tag(&raw.jober_type)
        .ok_or_else(|| GraphError::UnknownShapeType(format!("jober type '{}'", raw.jober_type)))?;
    Ok(FlowJober {
        kind,
        fitables: raw.fitables,
        exception_fitables: raw.exception_fitables,
        properties: raw.properties,
    })
}

fn parse_task(raw: RawTask) -> Result<FlowTask, GraphError> {
    let kind = TaskKind::from_type_tag(&raw.task_type)
        .ok_or_else(|| GraphError::UnknownShapeType(format!("task type '{}'", raw.task_type)))?;
    Ok(FlowTask {
        task_id: raw.task_id,
        kind,
        fitables: raw.fitables,
        exception_fitables: raw.exception_fitables,
        properties: raw.properties,
    })
}

fn parse_filter(raw: RawFilter) -> Result<FlowFilter, GraphError> {
    let kind = FilterKind::from_type_tag(&raw.filter_type)
        .ok_or_else(|| GraphError::UnknownShapeType(format!("filter type '{}'", raw.filter_type)))?;

    // Property values keep their textual form; coercion is the rule set's
    // concern, so a bad threshold fails validation instead of parsing.
    let properties = raw
        .properties
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            };
            (key, text)
        })
        .collect();

    Ok(FlowFilter { kind, properties })
}

/// Parse a raw JSON graph into a flow definition.
///
/// This handles the conversion from designer JSON to the typed graph model.
/// It does not check structural legality beyond shape resolution - that is
/// handled separately by the validation module.
pub fn parse_flow_graph(raw_graph: &str) -> Result<FlowDefinition, GraphError> {
    let document: RawGraph = serde_json::from_str(raw_graph)?;

    let mut nodes: Vec<FlowNode> = Vec::new();
    let mut events: Vec<FlowEvent> = Vec::new();
    for shape in document.shapes {
        let handler = SHAPE_HANDLERS
            .get(shape.shape_type.as_str())
            .ok_or_else(|| GraphError::UnknownShapeType(shape.shape_type.clone()))?;
        match handler(shape)? {
            ShapeProduct::Node(node) => nodes.push(node),
            ShapeProduct::Event(event) => events.push(event),
        }
    }

    // Attach events to their source nodes in shape declaration order; the
    // executor's first-match condition routing depends on that order.
    for event in events {
        if !nodes.iter().any(|node| node.meta_id == event.to) {
            return Err(GraphError::UndeclaredShapeReference {
                event: event.meta_id.0,
                shape: event.to.0,
            });
        }
        let source = nodes
            .iter_mut()
            .find(|node| node.meta_id == event.from)
            .ok_or_else(|| GraphError::UndeclaredShapeReference {
                event: event.meta_id.0.clone(),
                shape: event.from.0.clone(),
            })?;
        source.events.push(event);
    }

    let name = document.name.unwrap_or_else(|| document.meta_id.clone());
    Ok(FlowDefinition {
        id: FlowId(document.meta_id),
        name,
        version: document.version,
        nodes,
    })
}

fn jober_to_value(jober: &FlowJober) -> serde_json::Value {
    let mut value = serde_json::Map::new();
    value.insert("type".to_string(), json!(jober.kind.type_tag()));
    value.insert("fitables".to_string(), json!(jober.fitables));
    value.insert(
        "exceptionFitables".to_string(),
        json!(jober.exception_fitables),
    );
    if !jober.properties.is_empty() {
        value.insert("properties".to_string(), json!(jober.properties));
    }
    serde_json::Value::Object(value)
}

fn task_to_value(task: &FlowTask) -> serde_json::Value {
    let mut value = serde_json::Map::new();
    value.insert("taskId".to_string(), json!(task.task_id));
    value.insert("type".to_string(), json!(task.kind.type_tag()));
    value.insert("fitables".to_string(), json!(task.fitables));
    value.insert(
        "exceptionFitables".to_string(),
        json!(task.exception_fitables),
    );
    if !task.properties.is_empty() {
        value.insert("properties".to_string(), json!(task.properties));
    }
    serde_json::Value::Object(value)
}

fn filter_to_value(filter: &FlowFilter) -> serde_json::Value {
    let mut value = serde_json::Map::new();
    value.insert("type".to_string(), json!(filter.kind.type_tag()));
    for (key, raw) in &filter.properties {
        value.insert(key.clone(), json!(raw));
    }
    serde_json::Value::Object(value)
}

fn node_to_shape(node: &FlowNode) -> serde_json::Value {
    let mut shape = serde_json::Map::new();
    shape.insert("metaId".to_string(), json!(node.meta_id.0));
    shape.insert("type".to_string(), json!(node.kind.type_tag()));
    shape.insert("name".to_string(), json!(node.name));
    if !node.properties.is_empty() {
        shape.insert("properties".to_string(), json!(node.properties));
    }
    if let Some(jober) = &node.jober {
        shape.insert("jober".to_string(), jober_to_value(jober));
    }
    if let Some(task) = &node.task {
        shape.insert("task".to_string(), task_to_value(task));
    }
    if !node.filters.is_empty() {
        shape.insert(
            "filters".to_string(),
            serde_json::Value::Array(node.filters.iter().map(filter_to_value).collect()),
        );
    }
    serde_json::Value::Object(shape)
}

fn event_to_shape(event: &FlowEvent) -> serde_json::Value {
    let mut shape = serde_json::Map::new();
    shape.insert("metaId".to_string(), json!(event.meta_id.0));
    shape.insert("type".to_string(), json!("event"));
    shape.insert("name".to_string(), json!(event.name));
    shape.insert("fromShape".to_string(), json!(event.from.0));
    shape.insert("toShape".to_string(), json!(event.to.0));
    if let Some(rule) = &event.condition_rule {
        shape.insert("conditionRule".to_string(), json!(rule));
    }
    if let Some(connector) = &event.defined_from_connector {
        shape.insert("definedFromConnector".to_string(), json!(connector));
    }
    serde_json::Value::Object(shape)
}

/// Serialize a flow definition back into the raw shape vocabulary.
///
/// Node shapes come first in declared order, followed by every event in
/// node-then-declaration order, so the emitted document parses back into an
/// equal definition.
pub fn serialize_flow_graph(definition: &FlowDefinition) -> serde_json::Value {
    let mut shapes: Vec<serde_json::Value> =
        definition.nodes.iter().map(node_to_shape).collect();
    for node in &definition.nodes {
        shapes.extend(node.events.iter().map(event_to_shape));
    }

    json!({
        "metaId": definition.id.0,
        "name": definition.name,
        "version": definition.version,
        "shapes": shapes,
    })
}
