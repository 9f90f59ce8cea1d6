//! ## Execution harness
//! Runs a single request against a target and turns whatever happens into an [`ExecutionResult`].
//! The harness itself never fails: refused connections, silent targets, handler panics and dead
//! processes all end up as outcomes.
//!
//! Requests that belong to a session reuse the session's connection so protocol state on the
//! target survives between requests. A connection that broke is dropped and reopened (with the
//! protocol preamble) by the next request of the session.
use crate::execution::{excerpt, CoverageDelta, CrashKind, CrashSignal, ExecutionRequest, ExecutionResult, Outcome};
use crate::network::{connect_to_target, Link};
use crate::process_monitor::{ExitReport, TargetMonitor};
use crate::protocol::session::SessionId;
use crate::protocol::{FrameContext, ProtocolRegistry, RegisteredProtocol, ResponseClass};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// How long to listen for an answer to a request that normally gets none
pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_millis(20);
const RESPONSE_LIMIT: usize = 64 * 1024;

/// What happened on the wire.
#[derive(Debug)]
enum Exchange {
    Answered(Vec<u8>),
    /// Nothing came back and nothing was expected
    Silent,
    TimedOut,
    /// The target closed the connection in an orderly way
    Closed,
    Reset(String),
    ConnectFailed(String),
    Io(String),
    HandlerPanic(&'static str),
}

impl Exchange {
    fn from_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Exchange::Reset(e.to_string()),
            _ => Exchange::Io(e.to_string()),
        }
    }

    fn keeps_link(&self) -> bool {
        matches!(self, Exchange::Answered(_) | Exchange::Silent)
    }
}

#[derive(Debug)]
struct SessionLink {
    target: String,
    link: Arc<tokio::sync::Mutex<Option<Link>>>,
}

#[derive(Debug)]
pub struct Harness {
    registry: Arc<ProtocolRegistry>,
    connect_timeout: Duration,
    quiet_window: Duration,
    links: Mutex<HashMap<SessionId, SessionLink>>,
    /// Hashes of (target, response class, response size) seen so far
    known_responses: Mutex<HashSet<u64>>,
    monitors: RwLock<HashMap<String, TargetMonitor>>,
}

impl Harness {
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        Self {
            registry,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            quiet_window: DEFAULT_QUIET_WINDOW,
            links: Mutex::new(HashMap::new()),
            known_responses: Mutex::new(HashSet::new()),
            monitors: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, quiet_window: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.quiet_window = quiet_window;
        self
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    /// Process exits recorded by `monitor` are attributed to requests running against `target`.
    pub fn attach_monitor(&self, target: impl Into<String>, monitor: TargetMonitor) {
        self.monitors.write().unwrap().insert(target.into(), monitor);
    }

    fn monitor(&self, target: &str) -> Option<TargetMonitor> {
        self.monitors.read().unwrap().get(target).cloned()
    }

    pub fn behaviours_seen(&self) -> usize {
        self.known_responses.lock().unwrap().len()
    }

    /// Runs the request under a watchdog of `timeout`. Never fails.
    pub async fn execute(&self, request: &ExecutionRequest, timeout: Duration) -> ExecutionResult {
        let started = Instant::now();
        let mut result = match self.registry.lookup(&request.target.protocol) {
            Ok(protocol) => self.execute_with(&protocol, request, timeout).await,
            Err(e) => {
                let mut result = ExecutionResult::new(request, Outcome::ProtocolError);
                result.excerpt = e.to_string();
                result
            }
        };
        result.latency = started.elapsed();
        trace!(
            "Request {} on {} finished as {} after {:?}",
            request.request_id,
            request.target.name,
            result.outcome,
            result.latency
        );
        result
    }

    async fn execute_with(
        &self,
        protocol: &RegisteredProtocol,
        request: &ExecutionRequest,
        timeout: Duration,
    ) -> ExecutionResult {
        let params = protocol.spec.resolve_params(&request.params);
        let ctx = FrameContext {
            request_id: request.request_id,
            payload: &request.payload,
            params: &params,
            endpoint: &request.target.endpoint,
            sequence: request.session.map(|s| s.sequence),
        };
        let monitor = self.monitor(&request.target.name);
        let generation = monitor.as_ref().map(TargetMonitor::generation);
        let session = request.session.map(|s| s.id);

        let exchange = match tokio::time::timeout(
            timeout,
            self.exchange(protocol, &ctx, session, &request.target.name),
        )
        .await
        {
            Ok(exchange) => exchange,
            Err(_) => {
                // The link may hold half a frame now
                if let Some(id) = session {
                    self.close_session(id);
                }
                Exchange::TimedOut
            }
        };
        let failed = !matches!(exchange, Exchange::Answered(_) | Exchange::Silent);
        let mut result = self.interpret(protocol, &ctx, request, exchange);

        if let (Some(monitor), Some(generation)) = (monitor, generation) {
            if let Some(exit) = self.wait_for_exit(&monitor, generation, failed).await {
                warn!(
                    "Target {} went down during request {}",
                    request.target.name, request.request_id
                );
                self.drop_links_of(&request.target.name);
                result = attribute_exit(result, exit);
            }
        }
        result
    }

    /// The supervisor reaps the process asynchronously, a broken exchange gets a short grace
    /// period for the exit to show up.
    async fn wait_for_exit(
        &self,
        monitor: &TargetMonitor,
        generation: u64,
        failed: bool,
    ) -> Option<ExitReport> {
        let deadline = Instant::now() + self.quiet_window;
        loop {
            if let Some(exit) = monitor.exit_since(generation) {
                return Some(exit);
            }
            if !failed || Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_millis(2)).await;
        }
    }

    async fn exchange(
        &self,
        protocol: &RegisteredProtocol,
        ctx: &FrameContext<'_>,
        session: Option<SessionId>,
        target: &str,
    ) -> Exchange {
        let handler = &protocol.handler;
        let Ok(frame) = catch_unwind(AssertUnwindSafe(|| handler.encode(ctx))) else {
            return Exchange::HandlerPanic("encode");
        };
        let expects_response =
            catch_unwind(AssertUnwindSafe(|| handler.expects_response(ctx))).unwrap_or(true);

        let Some(id) = session else {
            let mut link = match self.connect(protocol, ctx).await {
                Ok(link) => link,
                Err(e) => return Exchange::ConnectFailed(e.to_string()),
            };
            return self.round_trip(&mut link, &frame, expects_response).await;
        };

        let slot = self.link_slot(id, target);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            let mut link = match self.connect(protocol, ctx).await {
                Ok(link) => link,
                Err(e) => return Exchange::ConnectFailed(e.to_string()),
            };
            let Ok(preamble) = catch_unwind(AssertUnwindSafe(|| handler.preamble(ctx.params)))
            else {
                return Exchange::HandlerPanic("preamble");
            };
            if let Some(preamble) = preamble {
                if let Err(e) = link.send(&preamble).await {
                    return Exchange::from_io(e);
                }
                // The answer to the preamble (e.g. CONNACK) is not part of this request
                let mut buf = [0u8; 1024];
                let _ = tokio::time::timeout(self.quiet_window, link.recv(&mut buf)).await;
            }
            debug!("Opened connection for session {id} on {target}");
            *guard = Some(link);
        }
        let Some(link) = guard.as_mut() else {
            return Exchange::Closed;
        };
        let exchange = self.round_trip(link, &frame, expects_response).await;
        if !exchange.keeps_link() {
            *guard = None;
        }
        exchange
    }

    async fn connect(&self, protocol: &RegisteredProtocol, ctx: &FrameContext<'_>) -> io::Result<Link> {
        connect_to_target(ctx.endpoint, protocol.spec.transport, self.connect_timeout).await
    }

    async fn round_trip(&self, link: &mut Link, frame: &[u8], expects_response: bool) -> Exchange {
        if let Err(e) = link.send(frame).await {
            return Exchange::from_io(e);
        }
        let mut buf = vec![0u8; RESPONSE_LIMIT];
        let received = if expects_response {
            link.recv(&mut buf).await
        } else {
            match tokio::time::timeout(self.quiet_window, link.recv(&mut buf)).await {
                Ok(received) => received,
                Err(_) => return Exchange::Silent,
            }
        };
        match received {
            Ok(0) => Exchange::Closed,
            Ok(n) => {
                buf.truncate(n);
                Exchange::Answered(buf)
            }
            Err(e) => Exchange::from_io(e),
        }
    }

    fn interpret(
        &self,
        protocol: &RegisteredProtocol,
        ctx: &FrameContext<'_>,
        request: &ExecutionRequest,
        exchange: Exchange,
    ) -> ExecutionResult {
        let mut result = ExecutionResult::new(request, Outcome::Success);
        match exchange {
            Exchange::Answered(response) => {
                let class = catch_unwind(AssertUnwindSafe(|| {
                    protocol.handler.classify(ctx, &response)
                }))
                .unwrap_or_else(|_| {
                    ResponseClass::Rejected("handler panicked while classifying".to_string())
                });
                result.excerpt = excerpt(&response);
                result.coverage = self.observe(&request.target.name, &class, response.len());
                match class {
                    ResponseClass::Accepted => result,
                    ResponseClass::Rejected(reason) => {
                        trace!("Request {} rejected: {reason}", request.request_id);
                        result.outcome = Outcome::ProtocolError;
                        result
                    }
                    ResponseClass::Fatal(detail) => {
                        let diagnostic = result.excerpt.clone();
                        result.with_signal(CrashSignal {
                            kind: CrashKind::ProtocolFatal(detail),
                            diagnostic,
                        })
                    }
                }
            }
            Exchange::Silent => result,
            Exchange::TimedOut => {
                result.outcome = Outcome::Timeout;
                result
            }
            Exchange::Closed => {
                result.outcome = Outcome::ProtocolError;
                result.excerpt = "connection closed by target".to_string();
                result
            }
            Exchange::Reset(reason) => {
                result.excerpt = reason.clone();
                result.with_signal(CrashSignal {
                    kind: CrashKind::ConnectionReset,
                    diagnostic: reason,
                })
            }
            Exchange::ConnectFailed(reason) | Exchange::Io(reason) => {
                result.outcome = Outcome::ProtocolError;
                result.excerpt = reason;
                result
            }
            Exchange::HandlerPanic(stage) => {
                warn!("{} handler panicked during {stage}", protocol.spec.name);
                result.outcome = Outcome::ProtocolError;
                result.excerpt = format!("{} handler panicked during {stage}", protocol.spec.name);
                result
            }
        }
    }

    /// Response novelty as a cheap coverage proxy.
    fn observe(&self, target: &str, class: &ResponseClass, size: usize) -> CoverageDelta {
        let mut hasher = DefaultHasher::new();
        target.hash(&mut hasher);
        match class {
            ResponseClass::Accepted => "accepted".hash(&mut hasher),
            ResponseClass::Rejected(reason) => ("rejected", reason).hash(&mut hasher),
            ResponseClass::Fatal(detail) => ("fatal", detail).hash(&mut hasher),
        }
        size.hash(&mut hasher);
        let new = self.known_responses.lock().unwrap().insert(hasher.finish());
        CoverageDelta {
            new_behaviours: u32::from(new),
        }
    }

    fn link_slot(&self, id: SessionId, target: &str) -> Arc<tokio::sync::Mutex<Option<Link>>> {
        self.links
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| SessionLink {
                target: target.to_string(),
                link: Arc::new(tokio::sync::Mutex::new(None)),
            })
            .link
            .clone()
    }

    fn drop_links_of(&self, target: &str) {
        self.links.lock().unwrap().retain(|_, l| l.target != target);
    }

    /// Drops the session's connection. Returns false if the session had none.
    pub fn close_session(&self, id: SessionId) -> bool {
        self.links.lock().unwrap().remove(&id).is_some()
    }

    pub fn open_links(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

fn attribute_exit(result: ExecutionResult, exit: ExitReport) -> ExecutionResult {
    let kind = match exit.signal {
        Some(signal) => CrashKind::Signal(signal),
        None => CrashKind::ExitCode(exit.code.unwrap_or(-1)),
    };
    let diagnostic = if exit.stderr_tail.is_empty() {
        exit.stdout_tail
    } else {
        exit.stderr_tail
    };
    let mut result = result.with_signal(CrashSignal {
        kind,
        diagnostic: diagnostic.clone(),
    });
    result.excerpt = excerpt(diagnostic.as_bytes());
    result
}
