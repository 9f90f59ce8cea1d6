//! ## Protocols
//! Every protocol is described by an immutable [`ProtocolSpec`] and served by one
//! [`ProtocolHandler`] that knows how to frame a fuzz payload and how to read the answer.
//! Handlers are picked by name when a protocol is registered, there is no dynamic lookup
//! at execution time beyond the registry map.
//!
//! Stateful protocols (Modbus, MQTT) get a [`session::ProtocolSession`] per target, stateless
//! ones (CoAP, HTTP, gRPC) send every request on its own, unless a request asks for one of the
//! protocol's `stateful_operations` (e.g. CoAP observe).
pub mod coap;
pub mod grpc;
pub mod http;
pub mod modbus;
pub mod mqtt;
pub mod session;

use crate::target::Endpoint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

/// Protocol parameters. Spec defaults overlaid with per-request overrides.
pub type Params = BTreeMap<String, String>;

/// Parameter naming the operation of a request, checked against `stateful_operations`.
pub const OPERATION_PARAM: &str = "operation";
/// When set to `true` the payload is sent without any protocol framing.
pub const RAW_PARAM: &str = "raw";
/// Lets a spec reuse the handler of a builtin protocol under another name.
pub const HANDLER_PARAM: &str = "handler";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("protocol {0} is already registered")]
    DuplicateProtocol(String),
    #[error("protocol {name} is invalid: {reason}")]
    InvalidProtocol { name: String, reason: String },
    #[error("protocol {0} is not registered")]
    UnknownProtocol(String),
    #[error("a campaign needs at least one target")]
    NoTargets,
    #[error("target name {0} is used twice")]
    DuplicateTarget(String),
    #[error("invalid agent configuration: {0}")]
    InvalidAgent(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub fragmentation: bool,
    #[serde(default)]
    pub encryption: bool,
    #[serde(default)]
    pub authentication: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSpec {
    pub name: String,
    pub stateful: bool,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub defaults: Params,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub stateful_operations: BTreeSet<String>,
}

impl ProtocolSpec {
    pub fn new(name: impl Into<String>, stateful: bool) -> Self {
        Self {
            name: name.into(),
            stateful,
            transport: Transport::Tcp,
            defaults: Params::new(),
            capabilities: Capabilities::default(),
            stateful_operations: BTreeSet::new(),
        }
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_default(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.defaults.insert(key.into(), value.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_stateful_operation(mut self, operation: impl Into<String>) -> Self {
        self.stateful_operations.insert(operation.into());
        self
    }

    /// Whether a request with these parameters has to run inside a session.
    pub fn requires_session(&self, params: &Params) -> bool {
        self.stateful
            || params
                .get(OPERATION_PARAM)
                .is_some_and(|op| self.stateful_operations.contains(op))
    }

    pub fn resolve_params(&self, overrides: &Params) -> Params {
        let mut params = self.defaults.clone();
        params.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        params
    }

    fn handler_name(&self) -> &str {
        self.defaults
            .get(HANDLER_PARAM)
            .map(String::as_str)
            .unwrap_or(&self.name)
    }

    /// The five protocols the platform ships with.
    pub fn builtin() -> Vec<ProtocolSpec> {
        vec![
            ProtocolSpec::new("coap", false)
                .with_transport(Transport::Udp)
                .with_default("type", "con")
                .with_default("code", "0.01")
                .with_capabilities(Capabilities {
                    fragmentation: true,
                    ..Default::default()
                })
                .with_stateful_operation("observe"),
            ProtocolSpec::new("modbus", true).with_default("unit_id", "1"),
            ProtocolSpec::new("mqtt", true)
                .with_default("client_id", "fuzzgrid")
                .with_capabilities(Capabilities {
                    authentication: true,
                    ..Default::default()
                }),
            ProtocolSpec::new("http", false).with_default("method", "POST"),
            ProtocolSpec::new("grpc", false)
                .with_default("service", "grpc.health.v1.Health")
                .with_default("method", "Check")
                .with_capabilities(Capabilities {
                    fragmentation: true,
                    ..Default::default()
                }),
        ]
    }
}

/// What a single request looks like from a handler's point of view.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    pub request_id: u64,
    pub payload: &'a [u8],
    pub params: &'a Params,
    pub endpoint: &'a Endpoint,
    /// Sequence number assigned by the session, if the request runs inside one.
    pub sequence: Option<u32>,
}

impl FrameContext<'_> {
    pub fn raw(&self) -> bool {
        self.params.get(RAW_PARAM).is_some_and(|v| v == "true")
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// How a target answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseClass {
    Accepted,
    /// The target refused or flagged the request but kept working.
    Rejected(String),
    /// Protocol-level fatal answer, treated as a crash signal.
    Fatal(String),
}

pub trait ProtocolHandler: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Bytes sent once whenever a session opens a fresh connection.
    fn preamble(&self, _params: &Params) -> Option<Vec<u8>> {
        None
    }

    fn encode(&self, ctx: &FrameContext<'_>) -> Vec<u8>;

    /// Whether the target answers this request at all. Silent requests only get a short
    /// quiet window instead of the full watchdog.
    fn expects_response(&self, _ctx: &FrameContext<'_>) -> bool {
        true
    }

    fn classify(&self, ctx: &FrameContext<'_>, response: &[u8]) -> ResponseClass;

    /// Well-formed messages to mutate when no seed pool is configured.
    fn seeds(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

pub fn builtin_handler(name: &str) -> Option<Arc<dyn ProtocolHandler>> {
    let handler: Arc<dyn ProtocolHandler> = match name {
        "coap" => Arc::new(coap::CoapHandler),
        "modbus" => Arc::new(modbus::ModbusHandler),
        "mqtt" => Arc::new(mqtt::MqttHandler),
        "http" => Arc::new(http::HttpHandler),
        "grpc" => Arc::new(grpc::GrpcHandler),
        _ => return None,
    };
    Some(handler)
}

#[derive(Debug, Clone)]
pub struct RegisteredProtocol {
    pub spec: Arc<ProtocolSpec>,
    pub handler: Arc<dyn ProtocolHandler>,
}

/// Name → protocol map. Registration is append-only, specs are never mutated afterwards.
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    entries: RwLock<HashMap<String, RegisteredProtocol>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let registry = Self::new();
        for spec in ProtocolSpec::builtin() {
            // Names are distinct and all have handlers
            let _ = registry.register(spec);
        }
        registry
    }

    pub fn register(&self, spec: ProtocolSpec) -> Result<Arc<ProtocolSpec>, ConfigurationError> {
        let handler =
            builtin_handler(spec.handler_name()).ok_or_else(|| ConfigurationError::InvalidProtocol {
                name: spec.name.clone(),
                reason: format!("no handler named {}", spec.handler_name()),
            })?;
        self.register_with_handler(spec, handler)
    }

    pub fn register_with_handler(
        &self,
        spec: ProtocolSpec,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<Arc<ProtocolSpec>, ConfigurationError> {
        if spec.name.trim().is_empty() {
            return Err(ConfigurationError::InvalidProtocol {
                name: spec.name,
                reason: "empty name".to_string(),
            });
        }
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(&spec.name) {
            return Err(ConfigurationError::DuplicateProtocol(spec.name));
        }
        debug!("Registering protocol {} (stateful: {})", spec.name, spec.stateful);
        let spec = Arc::new(spec);
        entries.insert(
            spec.name.clone(),
            RegisteredProtocol {
                spec: spec.clone(),
                handler,
            },
        );
        Ok(spec)
    }

    pub fn get(&self, name: &str) -> Option<RegisteredProtocol> {
        self.entries.read().unwrap().get(name).cloned()
    }

    pub fn spec(&self, name: &str) -> Option<Arc<ProtocolSpec>> {
        self.get(name).map(|p| p.spec)
    }

    pub fn lookup(&self, name: &str) -> Result<RegisteredProtocol, ConfigurationError> {
        self.get(name)
            .ok_or_else(|| ConfigurationError::UnknownProtocol(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}
