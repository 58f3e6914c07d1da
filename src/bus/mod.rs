//! The message bus (C3, spec.md §4.3): request/ack/response protocol over
//! the native IPC channel, listener registry with shadowing, method-handle
//! serialization, the `READY` handshake, and per-window cleanup.

pub mod frame;
pub mod registry;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use napi_derive::napi;
use serde_json::Value;

use crate::deferred::Deferred;
use crate::error::{ClosedStage, RuntimeError};
use crate::identity::{self, DomainPattern, WindowId};

use frame::{AckStatus, ErrorMarker, Frame, FrameType, WindowType, ERROR_MARKER};
pub use registry::{ExposedMethod, Listener};
use registry::{DedupRing, ListenerTable, MethodTable, ReadyTable, ResponseEntry, ResponseTable};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DEDUP_CAPACITY: usize = 2000;

/// Which transport strategies are enabled, tried in order (spec.md §6
/// "allowed send strategies").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStrategy {
    PostMessage,
    Bridge,
    Global,
}

/// Delivers a frame to a peer window. The native-window backend
/// ([`crate::platform`]) implements this over the webview's IPC channel;
/// tests use an in-memory fake.
pub trait Transport {
    fn post(&self, window: WindowId, wire: &str) -> Result<(), String>;
}

pub struct SendOptions {
    pub domain: Option<DomainPattern>,
    pub timeout: Option<Duration>,
    pub fire_and_forget: bool,
    pub strategies: Vec<SendStrategy>,
}

impl Default for SendOptions {
    fn default() -> Self {
        let timeout = STATE.try_with(|s| s.borrow().response_timeout).unwrap_or(DEFAULT_RESPONSE_TIMEOUT);
        SendOptions {
            domain: None,
            timeout: Some(timeout),
            fire_and_forget: false,
            strategies: vec![SendStrategy::PostMessage],
        }
    }
}

struct State {
    listeners: ListenerTable,
    responses: ResponseTable,
    methods: MethodTable,
    ready: ReadyTable,
    dedup: DedupRing,
    transport: Option<Rc<dyn Transport>>,
    own_domain: String,
    ack_timeout: Duration,
    response_timeout: Duration,
}

thread_local! {
    static STATE: RefCell<State> = RefCell::new(State {
        listeners: ListenerTable::default(),
        responses: ResponseTable::default(),
        methods: MethodTable::default(),
        ready: ReadyTable::default(),
        dedup: DedupRing::new(DEFAULT_DEDUP_CAPACITY),
        transport: None,
        own_domain: String::new(),
        ack_timeout: DEFAULT_ACK_TIMEOUT,
        response_timeout: DEFAULT_RESPONSE_TIMEOUT,
    });
}

/// Knobs for the process-wide bus, supplied once to [`crate::init`] (spec.md
/// §6 "allowed send strategies", §5 "safe interval" deadlines). Any field
/// left `None` keeps its hardcoded default, matching how [`crate::options::WindowOptions`]
/// treats its own optional fields.
#[napi(object)]
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Milliseconds to wait for a peer's ACK before the request is treated
    /// as undeliverable. Default: 1000.
    pub ack_timeout_ms: Option<u32>,
    /// Milliseconds to wait for a peer's RESPONSE once ACKed. Default: 10000.
    pub response_timeout_ms: Option<u32>,
    /// How many recently-seen frame ids are kept for duplicate detection
    /// before the oldest is evicted. Default: 2000.
    pub dedup_capacity: Option<u32>,
    /// Minimum log level for bus diagnostics: "error" | "warn" | "info" |
    /// "debug" | "trace". Default: "warn".
    pub log_level: Option<String>,
}

/// Applies a [`RuntimeConfig`] on top of the hardcoded defaults. Safe to
/// call multiple times; a later call simply overrides the earlier one.
pub fn apply_runtime_config(config: &RuntimeConfig) {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        if let Some(ms) = config.ack_timeout_ms {
            s.ack_timeout = Duration::from_millis(ms as u64);
        }
        if let Some(ms) = config.response_timeout_ms {
            s.response_timeout = Duration::from_millis(ms as u64);
        }
        if let Some(cap) = config.dedup_capacity {
            s.dedup = DedupRing::new(cap as usize);
        }
    });
    if let Some(level) = config.log_level.as_deref() {
        if let Ok(filter) = level.parse::<log::LevelFilter>() {
            log::set_max_level(filter);
        }
    }
}

pub fn configure(own_domain: impl Into<String>, transport: Rc<dyn Transport>) {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        s.own_domain = own_domain.into();
        s.transport = Some(transport);
    });
    // Bridge the generic `call` frame (spec.md §4.7 method-handle
    // invocation) to whatever the sender exposed via `expose_method`. A
    // single, process-wide listener, since the routing key is the
    // `__id__` in the payload, not the frame name.
    on(
        "call",
        None,
        DomainPattern::Wildcard,
        false,
        Rc::new(|window, _origin, data| {
            let id = data.get("__id__").and_then(Value::as_str).unwrap_or_default();
            let arg = data
                .get("args")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .cloned()
                .unwrap_or(Value::Null);
            invoke_exposed_method(window, id, arg)
        }),
    );
}

fn random_hex_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..16).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
}

/// Register a listener. Fails (returns `false`) on an identical-key
/// duplicate (spec.md §4.3).
pub fn on(
    name: &str,
    window: Option<WindowId>,
    domain: DomainPattern,
    once: bool,
    handler: Rc<dyn Fn(WindowId, &str, Value) -> Result<Value, RuntimeError>>,
) -> bool {
    STATE.with(|s| {
        s.borrow_mut().listeners.register(name, Listener { window, domain, once, handler })
    })
}

pub fn off(name: &str, window: Option<WindowId>, domain: &DomainPattern) {
    STATE.with(|s| s.borrow_mut().listeners.unregister(name, window, domain));
}

/// Send a request to `peer`. Returns a [`Deferred`] that settles with the
/// response data, or a [`RuntimeError`] on timeout/close/remote error.
/// Fire-and-forget requests never enter the response table (invariant 4)
/// and settle immediately with `Ok(Value::Null)` once the transport
/// attempt completes.
pub fn send(
    peer: WindowId,
    current: WindowId,
    name: &str,
    data: Value,
    window_type_of_self: WindowType,
    opts: SendOptions,
) -> Deferred<Result<Value, RuntimeError>> {
    let result: Deferred<Result<Value, RuntimeError>> = Deferred::new();

    if peer == current {
        result.settle(Err(RuntimeError::Integration("cannot send to own window".into())));
        return result;
    }
    if identity::is_window_closed(Some(peer), None) {
        result.settle(Err(RuntimeError::WindowClosed { window: peer.0, stage: ClosedStage::BeforeAck }));
        return result;
    }

    let id = random_hex_id();
    let hash = random_hex_id();
    let own_domain = STATE.with(|s| s.borrow().own_domain.clone());
    let frame = Frame {
        frame_type: FrameType::Request,
        id,
        hash: hash.clone(),
        name: name.to_string(),
        source_domain: own_domain,
        window_type: window_type_of_self,
        data: Some(data),
        error: None,
        ack: None,
    };

    let send_outcome = attempt_send(peer, &frame, &opts.strategies);
    if let Err(e) = send_outcome {
        result.settle(Err(e));
        return result;
    }

    if opts.fire_and_forget {
        result.settle(Ok(Value::Null));
        return result;
    }

    let now = Instant::now();
    // `opts.timeout == None` means no response deadline at all (e.g. the
    // child's `init` request, which can legitimately wait indefinitely for
    // a slow host) rather than "use the default" — callers that want the
    // default duration ask for it explicitly via `SendOptions::default()`.
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        let ack_deadline = Some(now + s.ack_timeout);
        let response_deadline = opts.timeout.map(|t| now + t);
        s.responses.insert(
            hash,
            ResponseEntry {
                peer,
                origin: opts.domain.unwrap_or(DomainPattern::Wildcard),
                acked: false,
                ack_deadline,
                response_deadline,
                settle: result.clone(),
                name: name.to_string(),
            },
        );
    });
    result
}

fn attempt_send(peer: WindowId, frame: &Frame, strategies: &[SendStrategy]) -> Result<(), RuntimeError> {
    let wire = frame.to_wire().map_err(RuntimeError::Fatal)?;
    let transport = STATE.with(|s| s.borrow().transport.clone());
    let transport = transport.ok_or_else(|| RuntimeError::Fatal("bus transport not configured".into()))?;

    let mut diagnostics = Vec::new();
    for strategy in strategies {
        match strategy {
            SendStrategy::PostMessage => match transport.post(peer, &wire) {
                Ok(()) => return Ok(()),
                Err(e) => diagnostics.push(format!("post-message: {e}")),
            },
            SendStrategy::Bridge => diagnostics.push("bridge: no relay configured".to_string()),
            SendStrategy::Global => diagnostics.push("global: no global registration configured".to_string()),
        }
    }
    Err(RuntimeError::Integration(format!(
        "all send strategies failed for window {}: {}",
        peer.0,
        diagnostics.join("; ")
    )))
}

/// Dispatch an inbound frame. `window` is the peer that sent it; `origin`
/// is the transport-observed origin (already rewritten to `sourceDomain`
/// for mock/file schemes by the caller, per spec.md §4.3 "Receive").
pub fn receive(current: WindowId, window: WindowId, origin: &str, raw: &str) {
    let frame = match Frame::from_wire(raw) {
        Some(f) => f,
        None => return,
    };

    let duplicate = STATE.with(|s| s.borrow_mut().dedup.seen_before(&frame.id));
    if duplicate {
        return;
    }

    match frame.frame_type {
        FrameType::Request => handle_request(current, window, origin, frame),
        FrameType::Ack => handle_ack(window, origin, &frame),
        FrameType::Response => handle_response(window, origin, frame),
    }
}

fn handle_request(current: WindowId, window: WindowId, origin: &str, frame: Frame) {
    // ACK immediately, before dispatching the listener (spec.md §5 ordering
    // guarantee: ACK always precedes RESPONSE).
    let own_domain = STATE.with(|s| s.borrow().own_domain.clone());
    let ack = Frame {
        frame_type: FrameType::Ack,
        id: random_hex_id(),
        hash: frame.hash.clone(),
        name: frame.name.clone(),
        source_domain: own_domain.clone(),
        window_type: WindowType::Popup,
        data: None,
        error: None,
        ack: Some(AckStatus::Success),
    };
    let _ = attempt_send(window, &ack, &[SendStrategy::PostMessage]);

    let listener = STATE.with(|s| {
        s.borrow()
            .listeners
            .find(&frame.name, window, origin)
            .map(|l| (l.handler.clone(), l.once, l.window, l.domain.clone()))
    });

    let (response_frame, remove_once) = match listener {
        None => (
            Frame {
                frame_type: FrameType::Response,
                id: random_hex_id(),
                hash: frame.hash.clone(),
                name: frame.name.clone(),
                source_domain: own_domain,
                window_type: WindowType::Popup,
                data: None,
                error: Some(format!("no listener registered for `{}`", frame.name)),
                ack: Some(AckStatus::Error),
            },
            None,
        ),
        Some((handler, once, listener_window, listener_domain)) => {
            let outcome = handler(window, origin, frame.data.clone().unwrap_or(Value::Null));
            let resp = match outcome {
                Ok(data) => Frame {
                    frame_type: FrameType::Response,
                    id: random_hex_id(),
                    hash: frame.hash.clone(),
                    name: frame.name.clone(),
                    source_domain: own_domain,
                    window_type: WindowType::Popup,
                    data: Some(data),
                    error: None,
                    ack: Some(AckStatus::Success),
                },
                Err(e) => Frame {
                    frame_type: FrameType::Response,
                    id: random_hex_id(),
                    hash: frame.hash.clone(),
                    name: frame.name.clone(),
                    source_domain: own_domain,
                    window_type: WindowType::Popup,
                    data: None,
                    error: Some(e.to_string()),
                    ack: Some(AckStatus::Error),
                },
            };
            (resp, if once { Some((listener_window, listener_domain)) } else { None })
        }
    };

    if let Some((listener_window, listener_domain)) = remove_once {
        STATE.with(|s| s.borrow_mut().listeners.unregister(&frame.name, listener_window, &listener_domain));
    }

    let _ = current; // current window id kept for symmetry with send(); no self-check needed on receive
    let _ = attempt_send(window, &response_frame, &[SendStrategy::PostMessage]);
}

fn handle_ack(window: WindowId, origin: &str, frame: &Frame) {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        if let Some(entry) = s.responses.get_mut(&frame.hash) {
            if entry.peer != window || !identity::match_domain(&entry.origin, origin) {
                log::warn!("ACK for hash {} arrived from an unexpected origin {}", frame.hash, origin);
                return;
            }
            entry.acked = true;
            entry.ack_deadline = None;
        }
    });
}

fn handle_response(window: WindowId, origin: &str, frame: Frame) {
    let entry = STATE.with(|s| {
        let mut s = s.borrow_mut();
        match s.responses.get_mut(&frame.hash) {
            Some(e) if e.peer == window && identity::match_domain(&e.origin, origin) => {
                s.responses.remove(&frame.hash)
            }
            Some(_) => {
                log::warn!("RESPONSE for hash {} rejected: origin {} does not match", frame.hash, origin);
                None
            }
            None => None,
        }
    });
    if let Some(entry) = entry {
        let settled = match frame.ack {
            Some(AckStatus::Error) => Err(RuntimeError::Remote {
                window: window.0,
                message: frame.error.clone().unwrap_or_default(),
                stack: None,
            }),
            _ => Ok(frame.data.unwrap_or(Value::Null)),
        };
        entry.settle.settle(settled);
    }
}

/// Advance timers: expire stale ACK/response deadlines. Call periodically
/// from the host's event pump (spec.md §5 "safe interval" pattern).
pub fn pump(now: Instant) {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        let ack_ms = s.ack_timeout.as_millis() as u64;
        let response_ms = s.response_timeout.as_millis() as u64;
        s.responses.expire(now, ack_ms, response_ms);
    });
}

/// Reject every pending response promise directed at `win`, drop its
/// method-handle entries, its ready promise, and remove it from the
/// listener table (spec.md §4.3 "Cleanup").
pub fn clean_up_window(win: WindowId) {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        s.responses.reject_peer(win, ClosedStage::BeforeResponse);
        s.methods.remove_window(win);
        s.ready.remove_window(win);
        s.listeners.remove_window(win);
    });
}

pub fn expose_method(win: WindowId, id: String, name: String, callback: Rc<dyn Fn(Value) -> Result<Value, RuntimeError>>) {
    STATE.with(|s| s.borrow_mut().methods.expose(win, id, ExposedMethod { name, callback }));
}

pub fn invoke_exposed_method(win: WindowId, id: &str, args: Value) -> Result<Value, RuntimeError> {
    let method = STATE.with(|s| s.borrow().methods.get(win, id));
    match method {
        Some(cb) => cb(args),
        None => Err(RuntimeError::Fatal(format!("no exposed method `{id}` for window {}", win.0))),
    }
}

/// Wait for a `READY` frame from `win`. Settles `true` once seen.
pub fn wait_ready(win: WindowId) -> Deferred<()> {
    STATE.with(|s| s.borrow_mut().ready.get_or_create(win))
}

pub fn mark_ready(win: WindowId) {
    STATE.with(|s| s.borrow_mut().ready.mark_ready(win));
}

/// Rehydrate a serialized error marker back into a [`RuntimeError`].
pub fn rehydrate_error(value: &Value) -> Option<RuntimeError> {
    let obj = value.as_object()?;
    if obj.get("__type__")?.as_str()? != ERROR_MARKER {
        return None;
    }
    let message = obj.get("__message__")?.as_str()?.to_string();
    Some(RuntimeError::Fatal(message))
}

pub fn error_marker(message: impl Into<String>) -> Value {
    serde_json::to_value(ErrorMarker::new(message)).expect("ErrorMarker always serializes")
}

/// Production [`Transport`]: delivers a frame by queuing a
/// `Command::EvaluateJS` that calls `window.__native_message__(wire)` in the
/// target webview, the same bridge [`crate::window::NativeWindow::post_message`]
/// already uses for the raw IPC primitive. The bus rides on top of that one
/// native channel rather than opening a second one (spec.md §3 "native IPC
/// channel stands in for `postMessage`").
pub struct WebviewTransport;

impl Transport for WebviewTransport {
    fn post(&self, window: WindowId, wire: &str) -> Result<(), String> {
        let escaped = crate::window_manager::json_escape(wire);
        let script = format!("if(window.__native_message__)window.__native_message__({});", escaped);
        crate::window_manager::with_manager(|mgr| {
            if !mgr.initialized {
                return Err("native window system not initialized".to_string());
            }
            mgr.push_command(crate::window_manager::Command::EvaluateJS {
                id: window.0,
                script,
            });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{register as register_window, Context};
    use std::cell::RefCell as StdRefCell;

    struct Loopback {
        inbox: Rc<StdRefCell<Vec<String>>>,
    }

    impl Transport for Loopback {
        fn post(&self, _window: WindowId, wire: &str) -> Result<(), String> {
            self.inbox.borrow_mut().push(wire.to_string());
            Ok(())
        }
    }

    #[test]
    fn request_gets_acked_and_responded() {
        let current = register_window(None, Some("https://a.example".into()), Context::Popup, None);
        let peer = register_window(None, Some("https://b.example".into()), Context::Popup, None);
        configure("https://a.example", Rc::new(Loopback {
            inbox: Rc::new(StdRefCell::new(Vec::new())),
        }));

        on("echo", None, DomainPattern::Wildcard, false, Rc::new(|_win, _origin, data| Ok(data)));

        // Simulate peer sending us a request directly via receive().
        let req = Frame {
            frame_type: FrameType::Request,
            id: "req1".into(),
            hash: "hash1".into(),
            name: "echo".into(),
            source_domain: "https://b.example".into(),
            window_type: WindowType::Popup,
            data: Some(serde_json::json!({"x": 1})),
            error: None,
            ack: None,
        };
        let wire = req.to_wire().unwrap();
        receive(current, peer, "https://b.example", &wire);
        // handler ran synchronously inside receive(); nothing further to assert
        // without a loopback transport, but no panic = dispatch succeeded.
    }

    #[test]
    fn duplicate_frame_id_is_ignored() {
        let current = register_window(None, Some("https://a.example".into()), Context::Popup, None);
        let peer = register_window(None, Some("https://b.example".into()), Context::Popup, None);
        configure("https://a.example", Rc::new(Loopback {
            inbox: Rc::new(StdRefCell::new(Vec::new())),
        }));
        let calls = Rc::new(StdRefCell::new(0));
        let calls2 = calls.clone();
        on("count", Some(peer), DomainPattern::Wildcard, false, Rc::new(move |_w, _o, d| {
            *calls2.borrow_mut() += 1;
            Ok(d)
        }));
        let req = Frame {
            frame_type: FrameType::Request,
            id: "dup-id".into(),
            hash: "h".into(),
            name: "count".into(),
            source_domain: "https://b.example".into(),
            window_type: WindowType::Popup,
            data: Some(Value::Null),
            error: None,
            ack: None,
        };
        let wire = req.to_wire().unwrap();
        receive(current, peer, "https://b.example", &wire);
        receive(current, peer, "https://b.example", &wire);
        assert_eq!(*calls.borrow(), 1);
    }
}
