//! Error kinds for the cross-origin component runtime (spec.md §7).

use thiserror::Error;

/// The taxonomy of failures the runtime can produce, one variant per row of
/// the error-kind table. Each carries enough context to be rehydrated into
/// a peer's local error (`RemoteError`) or surfaced to a host callback.
#[derive(Debug, Error, Clone)]
pub enum RuntimeError {
    /// The host OS/browser blocked opening a new top-level window.
    #[error("popup blocked while opening component `{tag}`")]
    PopupOpen { tag: String },

    /// Bad registration options, a missing required prop, or an unknown prop.
    #[error("integration error: {0}")]
    Integration(String),

    /// Parent origin not allowed by the child, or child origin mismatch.
    #[error("render error: {0}")]
    Render(String),

    /// An ACK or RESPONSE deadline expired.
    #[error("message `{name}` to window {window} timed out after {timeout_ms}ms")]
    MessageTimeout {
        name: String,
        window: u32,
        timeout_ms: u64,
    },

    /// The peer window closed mid-transaction.
    #[error("window {window} closed before {stage}")]
    WindowClosed { window: u32, stage: ClosedStage },

    /// The peer's listener threw or rejected.
    #[error("remote error from window {window}: {message}")]
    Remote { window: u32, message: String, stack: Option<String> },

    /// A prop failed type-checking or its required/default contract.
    #[error("validation error on prop `{prop}`: {reason}")]
    Validation { prop: String, reason: String },

    /// Internal invariant violated — domain undecidable, unrecognized parent
    /// reference, or a window-name parse failure in a strict context.
    #[error("fatal internal error: {0}")]
    Fatal(String),
}

/// Which stage of a request/response transaction the peer closed during.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedStage {
    BeforeAck,
    BeforeResponse,
    BeforeInit,
}

impl std::fmt::Display for ClosedStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClosedStage::BeforeAck => "ack",
            ClosedStage::BeforeResponse => "response",
            ClosedStage::BeforeInit => "init",
        };
        f.write_str(s)
    }
}

impl RuntimeError {
    /// True for the subset of errors that represent the peer itself having
    /// thrown, as opposed to a transport/registration failure on our side.
    pub fn is_remote(&self) -> bool {
        matches!(self, RuntimeError::Remote { .. })
    }
}

impl From<RuntimeError> for napi::Error {
    fn from(err: RuntimeError) -> Self {
        napi::Error::from_reason(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
