//! Workflow Data Model
//!
//! Core data structures describing an automation: nodes (triggers and
//! actions against services) and the connections between them.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: welcome_flow
//! nodes:
//!   - id: signup
//!     type: trigger
//!     title: New signup
//!
//!   - id: lookup
//!     type: action
//!     title: Find CRM contact
//!     config:
//!       service: crm
//!       action: find_contact
//!       parameters:
//!         email: ${input.email}
//!       timeout: 10
//!       fallback_service: crm_backup
//!
//!   - id: greet
//!     type: action
//!     config:
//!       service: email
//!       action: send
//!       parameters:
//!         to: ${input.email}
//!         name: ${lookup.name}
//!
//! connections:
//!   - id: c1
//!     source: signup
//!     target: lookup
//!   - id: c2
//!     source: lookup
//!     target: greet
//!     condition: ${lookup.found} == true
//! ```

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of a workflow node.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Entry marker; completes with the execution input unless it names a service
    Trigger,
    /// A call against a registered service
    #[default]
    Action,
}

/// Configuration bag carried by every node.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NodeConfig {
    /// Service name looked up in the executor registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Action passed to the service executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Parameters; string values may hold `${path}` references
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,

    /// Dispatch bound in seconds; zero or absent means unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    /// Keep the workflow going when this step fails
    #[serde(default)]
    pub continue_on_error: bool,

    /// Service retried with the same action when the primary fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_service: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,

    /// Guard evaluated before the step runs; false marks it skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A single unit of work in a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique identifier, also the root segment of `${id.path}` references
    pub id: String,

    #[serde(rename = "type", default)]
    pub node_type: NodeType,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub config: NodeConfig,
}

/// A node as it appears in a linearized plan.
pub type Step = Node;

impl Node {
    /// Creates an action node calling `action` on `service`.
    ///
    /// # Example
    ///
    /// ```
    /// use flowpilot::workflow::Node;
    ///
    /// let node = Node::action("notify", "slack", "post_message")
    ///     .with_param("channel", "#ops")
    ///     .with_timeout(5.0)
    ///     .with_fallback("email");
    /// ```
    pub fn action(
        id: impl Into<String>,
        service: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into().trim().to_string(),
            node_type: NodeType::Action,
            title: String::new(),
            config: NodeConfig {
                service: Some(service.into()),
                action: Some(action.into()),
                ..NodeConfig::default()
            },
        }
    }

    /// Creates a trigger node.
    pub fn trigger(id: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            node_type: NodeType::Trigger,
            title: String::new(),
            config: NodeConfig::default(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Adds a parameter; strings like `"${input.email}"` are references.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.config.timeout = Some(seconds);
        self
    }

    pub fn with_fallback(mut self, service: impl Into<String>) -> Self {
        self.config.fallback_service = Some(service.into());
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.config.continue_on_error = true;
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.config.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.config.output_schema = Some(schema);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.config.condition = Some(condition.into());
        self
    }

    /// Returns the configured service, ignoring blank values.
    pub fn service(&self) -> Option<&str> {
        self.config
            .service
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Returns the configured action, or an empty string.
    pub fn action_name(&self) -> &str {
        self.config.action.as_deref().unwrap_or("").trim()
    }

    /// Returns the dispatch bound, if a positive one is set.
    ///
    /// A value too large for a [`Duration`] counts as unbounded.
    pub fn timeout(&self) -> Option<Duration> {
        self.config
            .timeout
            .filter(|t| *t > 0.0)
            .and_then(|t| Duration::try_from_secs_f64(t).ok())
    }

    pub fn label(&self) -> &str {
        if self.title.is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

/// A directed edge between two nodes, optionally gated by a condition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Connection {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,

    /// Absent or blank means the connection always activates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Returns the condition expression when it is non-blank.
    pub fn condition(&self) -> Option<&str> {
        self.condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    pub fn is_conditional(&self) -> bool {
        self.condition().is_some()
    }
}

/// A complete workflow definition, immutable for the duration of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Owner, used as the notification recipient
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub connections: Vec<Connection>,

    /// Optional precomputed linear plan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Step>>,

    /// Manual effort a successful run replaces, reported to analytics
    #[serde(default)]
    pub time_saved_seconds: f64,

    #[serde(default)]
    pub business_value: f64,
}

impl WorkflowDefinition {
    /// Creates an empty workflow definition.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Adds a node, rejecting duplicate ids.
    pub fn add_node(&mut self, node: Node) -> Result<(), String> {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return Err(format!("Node '{}' already exists", node.id));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Builder form of [`add_node`](Self::add_node) for fixtures; duplicates are ignored.
    pub fn with_node(mut self, node: Node) -> Self {
        let _ = self.add_node(node);
        self
    }

    /// Adds an unconditional connection with a generated id.
    pub fn connect(mut self, source: &str, target: &str) -> Self {
        let id = format!("{}->{}", source, target);
        self.connections.push(Connection::new(id, source, target));
        self
    }

    /// Adds a connection gated by `condition`.
    pub fn connect_if(mut self, source: &str, target: &str, condition: &str) -> Self {
        let id = format!("{}->{}", source, target);
        self.connections
            .push(Connection::new(id, source, target).with_condition(condition));
        self
    }

    /// True when any connection declares a condition (graph mode).
    pub fn has_conditional_connections(&self) -> bool {
        self.connections.iter().any(Connection::is_conditional)
    }

    /// Returns the distinct services referenced by nodes, sorted.
    pub fn services(&self) -> Vec<String> {
        let set: HashSet<String> = self
            .nodes
            .iter()
            .flat_map(|n| {
                n.service()
                    .into_iter()
                    .chain(n.config.fallback_service.as_deref())
                    .map(str::to_string)
            })
            .collect();
        let mut services: Vec<String> = set.into_iter().collect();
        services.sort();
        services
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
