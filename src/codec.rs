//! Child-window-name codec (C2, spec.md §4.2).
//!
//! Packs a [`ChildDescriptor`] into the string stashed in a child window's
//! `name` attribute (here: the native window's registered `name`, see
//! [`crate::identity`]): `XC__<name>__<version>__<payload>`, where
//! `payload` is lowercase, unpadded base32 of the descriptor's JSON.

use data_encoding::{Encoding, Specification};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::identity::WindowId;

pub const SENTINEL: &str = "XC";
const SEPARATOR: &str = "__";

/// Base32 without padding, lowercase alphabet — a direct analogue of the
/// unpadded, lowercased base32 the spec calls for.
static BASE32_LOWER_NOPAD: Lazy<Encoding> = Lazy::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
    spec.encoding().expect("valid base32 specification")
});

/// How props travel: inlined for same-origin children, or by UID lookup
/// into the process-wide props map for cross-origin ones (spec.md §4.6
/// "Window-name packing").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "UPPERCASE")]
pub enum PropsTransport {
    Raw(serde_json::Value),
    Uid,
}

/// One of `DIRECT_PARENT`, `PARENT_PARENT`, or a literal window name —
/// used for both `parent` and `renderParent` fields. Represented on the
/// wire as a plain JSON string: the two reserved keywords, or any other
/// string taken as a literal window name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ParentRef {
    DirectParent,
    ParentParent,
    Named(String),
}

impl From<String> for ParentRef {
    fn from(s: String) -> Self {
        match s.as_str() {
            "DIRECT_PARENT" => ParentRef::DirectParent,
            "PARENT_PARENT" => ParentRef::ParentParent,
            _ => ParentRef::Named(s),
        }
    }
}

impl From<ParentRef> for String {
    fn from(p: ParentRef) -> Self {
        match p {
            ParentRef::DirectParent => "DIRECT_PARENT".to_string(),
            ParentRef::ParentParent => "PARENT_PARENT".to_string(),
            ParentRef::Named(s) => s,
        }
    }
}

/// `renderParent` additionally allows `PARENT_UID`, for renders targeted at
/// a foreign window whose real window handle is stashed under the instance
/// uid in the process-wide `windows` map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum RenderParentRef {
    DirectParent,
    ParentParent,
    ParentUid,
    Named(String),
}

impl From<String> for RenderParentRef {
    fn from(s: String) -> Self {
        match s.as_str() {
            "DIRECT_PARENT" => RenderParentRef::DirectParent,
            "PARENT_PARENT" => RenderParentRef::ParentParent,
            "PARENT_UID" => RenderParentRef::ParentUid,
            _ => RenderParentRef::Named(s),
        }
    }
}

impl From<RenderParentRef> for String {
    fn from(p: RenderParentRef) -> Self {
        match p {
            RenderParentRef::DirectParent => "DIRECT_PARENT".to_string(),
            RenderParentRef::ParentParent => "PARENT_PARENT".to_string(),
            RenderParentRef::ParentUid => "PARENT_UID".to_string(),
            RenderParentRef::Named(s) => s,
        }
    }
}

/// The descriptor packed into window.name. Immutable once opened (spec.md
/// invariant 6) — there is no setter, only `encode`/`decode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildDescriptor {
    pub name: String,
    pub version: String,
    pub tag: String,
    pub id: String,
    pub domain: String,
    pub parent: ParentRef,
    pub render_parent: RenderParentRef,
    pub uid: String,
    pub props: PropsTransport,
}

/// Strip non-alphanumeric characters from the edges and collapse interior
/// runs of non-alphanumerics to a single `_`.
fn normalize_segment(raw: &str) -> String {
    let trimmed = raw.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    let mut out = String::with_capacity(trimmed.len());
    let mut last_was_sep = false;
    for c in trimmed.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out
}

/// Version separators (`.`) are encoded as `_` in the human-readable
/// prefix segment only — the JSON payload always carries the exact
/// original string, so this is purely cosmetic (window names elsewhere
/// use `_` as a soft separator, so a literal `.` is kept out of the
/// prefix to avoid confusing window-name readers, not out of necessity
/// for the `__`-delimited parser itself).
fn encode_version(version: &str) -> String {
    normalize_segment(version).replace('.', "_")
}

/// `XC__<name>__<version>__<payload>`, lowercase, unpadded base32 JSON
/// payload. The `<name>`/`<version>` prefix segments are normalized,
/// human-readable labels; the payload carries the descriptor verbatim, so
/// `decode(encode(desc))` restores the exact original `name`/`version`
/// even though the prefix is a lossy, cosmetic encoding of them.
pub fn encode(desc: &ChildDescriptor) -> Result<String, String> {
    let json = serde_json::to_vec(desc).map_err(|e| e.to_string())?;
    let payload = BASE32_LOWER_NOPAD.encode(&json).to_lowercase();
    let name = normalize_segment(&desc.name).to_lowercase();
    let version = encode_version(&desc.version).to_lowercase();
    Ok(format!(
        "{SENTINEL}{SEPARATOR}{name}{SEPARATOR}{version}{SEPARATOR}{payload}"
    ))
}

/// Reject any name not starting with `XC`; on any parse failure, return
/// `None` rather than an error — the window is simply "not a component".
pub fn decode(window_name: &str) -> Option<ChildDescriptor> {
    if !window_name.starts_with(&format!("{SENTINEL}{SEPARATOR}")) {
        return None;
    }
    let rest = &window_name[SENTINEL.len() + SEPARATOR.len()..];
    let mut parts = rest.splitn(3, SEPARATOR);
    let _name = parts.next()?;
    let _version = parts.next()?;
    let payload = parts.next()?;

    let bytes = BASE32_LOWER_NOPAD.decode(payload.as_bytes()).ok()?;
    let desc: ChildDescriptor = serde_json::from_slice(&bytes).ok()?;
    Some(desc)
}

pub fn build(
    name: &str,
    version: &str,
    tag: &str,
    domain: &str,
    parent: ParentRef,
    render_parent: RenderParentRef,
    uid: &str,
    props: PropsTransport,
) -> ChildDescriptor {
    ChildDescriptor {
        name: name.to_string(),
        version: version.to_string(),
        tag: tag.to_string(),
        id: uid.to_string(),
        domain: domain.to_string(),
        parent,
        render_parent,
        uid: uid.to_string(),
        props,
    }
}

/// Generate a fresh random instance id, used for `uid`/`id`.
pub fn random_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| {
            let n: u8 = rng.gen_range(0..36);
            std::char::from_digit(n as u32, 36).unwrap()
        })
        .collect()
}

/// Resolve a `ParentRef`/`RenderParentRef` recovered from a decoded
/// descriptor into an actual window, given the window that physically sent
/// us the message and our own identity lookups.
pub fn resolve_parent_ref(parent: &ParentRef, direct_parent: WindowId, own_domain: &str) -> Option<WindowId> {
    match parent {
        ParentRef::DirectParent => Some(direct_parent),
        ParentRef::ParentParent => crate::identity::get_ancestor(direct_parent),
        ParentRef::Named(n) => crate::identity::find_frame_by_name(n, own_domain),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChildDescriptor {
        build(
            "my-comp",
            "1.0",
            "demo-comp",
            "https://a.example",
            ParentRef::DirectParent,
            RenderParentRef::DirectParent,
            "uid123",
            PropsTransport::Raw(serde_json::json!({"x": 1})),
        )
    }

    #[test]
    fn encode_round_trips() {
        let desc = sample();
        let encoded = encode(&desc).unwrap();
        assert!(encoded.starts_with("XC__my_comp__1_0__"));
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.name, "my-comp");
        assert_eq!(decoded.version, "1.0");
        assert_eq!(decoded.tag, "demo-comp");
    }

    #[test]
    fn decode_rejects_non_component_names() {
        assert!(decode("some-other-window").is_none());
        assert!(decode("XCfoo").is_none());
    }

    #[test]
    fn decode_rejects_garbage_payload() {
        assert!(decode("XC__a__1__!!!not-base32!!!").is_none());
    }

    #[test]
    fn normalize_segment_strips_and_collapses() {
        assert_eq!(normalize_segment("--my--comp--"), "my_comp");
        assert_eq!(normalize_segment("my-comp"), "my_comp");
    }
}
