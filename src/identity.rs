//! Window-identity utilities (C1, spec.md §4.1).
//!
//! There is no DOM here, so "window" means an entry in the process-wide
//! [`PeerRegistry`]: either a native window/webview this process opened
//! (see [`crate::window`]), or a reference to the window that opened *us*
//! (recovered from the child-window-name descriptor, see [`crate::codec`]).
//! All operations are total and side-effect free; none of them mutate a
//! registry entry.

use std::cell::RefCell;
use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Opaque reference to a window handle. Never dereferenced by value —
/// identity is by this id, which is stable for the lifetime of the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u32);

/// Whether a child runs inside a sub-frame of the parent document or as a
/// separately owned top-level window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    SubFrame,
    Popup,
}

impl Context {
    pub fn as_window_type(&self) -> &'static str {
        match self {
            Context::SubFrame => "sub-frame",
            Context::Popup => "popup",
        }
    }
}

/// A registered window handle. `ancestor` is the opener for a popup, or the
/// enclosing document for a sub-frame — the same "opener-if-present else
/// parent" rule `getAncestor` applies.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: WindowId,
    pub name: Option<String>,
    pub domain: Option<String>,
    pub mock_domain: Option<String>,
    pub context: Context,
    pub ancestor: Option<WindowId>,
    pub closed: bool,
}

thread_local! {
    static REGISTRY: RefCell<HashMap<WindowId, PeerRecord>> = RefCell::new(HashMap::new());
    static NEXT_ID: RefCell<u32> = RefCell::new(1);
}

/// Allocate a fresh window id and register an (initially open) entry for it.
pub fn register(
    name: Option<String>,
    domain: Option<String>,
    context: Context,
    ancestor: Option<WindowId>,
) -> WindowId {
    let id = NEXT_ID.with(|n| {
        let mut n = n.borrow_mut();
        let id = WindowId(*n);
        *n += 1;
        id
    });
    REGISTRY.with(|r| {
        r.borrow_mut().insert(
            id,
            PeerRecord {
                id,
                name,
                domain,
                mock_domain: None,
                context,
                ancestor,
                closed: false,
            },
        );
    });
    id
}

/// Register an entry under an id allocated elsewhere (the real native
/// window id from [`crate::window_manager::WindowManager::allocate_id`]),
/// rather than this registry's own counter — used for windows actually
/// opened through the platform backend, where the bus's [`WindowId`] must
/// equal the id [`crate::bus::WebviewTransport`] sends `EvaluateJS`
/// commands to. Bumps `NEXT_ID` past `id` so the two id spaces never
/// collide.
pub fn register_with_id(
    id: WindowId,
    name: Option<String>,
    domain: Option<String>,
    context: Context,
    ancestor: Option<WindowId>,
) {
    NEXT_ID.with(|n| {
        let mut n = n.borrow_mut();
        if *n <= id.0 {
            *n = id.0 + 1;
        }
    });
    REGISTRY.with(|r| {
        r.borrow_mut().insert(
            id,
            PeerRecord {
                id,
                name,
                domain,
                mock_domain: None,
                context,
                ancestor,
                closed: false,
            },
        );
    });
}

/// Mark a window as closed. Idempotent — closing twice is a no-op the
/// second time.
pub fn mark_closed(win: WindowId) {
    REGISTRY.with(|r| {
        if let Some(rec) = r.borrow_mut().get_mut(&win) {
            rec.closed = true;
        }
    });
}

/// Remove a window's registry entry entirely (called from cleanup, after
/// every interested party has had a chance to observe the close).
pub fn forget(win: WindowId) {
    REGISTRY.with(|r| {
        r.borrow_mut().remove(&win);
    });
}

/// Install a mock domain override for a window (used by tests to simulate
/// cross-origin peers without a real navigation).
pub fn set_mock_domain(win: WindowId, domain: Option<String>) {
    REGISTRY.with(|r| {
        if let Some(rec) = r.borrow_mut().get_mut(&win) {
            rec.mock_domain = domain;
        }
    });
}

fn with_record<T>(win: WindowId, f: impl FnOnce(&PeerRecord) -> T, default: T) -> T {
    REGISTRY.with(|r| r.borrow().get(&win).map(f).unwrap_or(default))
}

/// The window's real, registered domain — ignores any mock override.
pub fn get_actual_domain(win: WindowId) -> Option<String> {
    with_record(win, |rec| rec.domain.clone(), None)
}

/// The window's registered `.name` (the packed child descriptor string, for
/// a window opened via [`crate::codec::encode`]), if any.
pub fn get_name(win: WindowId) -> Option<String> {
    with_record(win, |rec| rec.name.clone(), None)
}

/// The window's domain as observed by the runtime: a mock override if one
/// was set, otherwise the actual domain. Total — an unknown window yields
/// `None` rather than panicking.
pub fn get_domain(win: WindowId) -> Option<String> {
    with_record(
        win,
        |rec| rec.mock_domain.clone().or_else(|| rec.domain.clone()),
        None,
    )
}

/// Whether `win`'s domain equals this process's own domain. A window we
/// have no record for, or whose domain we cannot determine, is
/// conservatively treated as cross-origin (`false`) — the same
/// fail-closed rule the spec requires for cross-origin access errors.
pub fn is_same_domain(win: WindowId, own_domain: &str) -> bool {
    get_domain(win).as_deref() == Some(own_domain)
}

/// Opener-if-present else parent: the window whose listener receives a
/// bubbled `READY`/close-watch relationship.
pub fn get_ancestor(win: WindowId) -> Option<WindowId> {
    with_record(win, |rec| rec.ancestor, None)
}

/// Search the registry for a window with the given `.name`. Same-origin
/// matches (as observed from `own_domain`) are preferred over cross-origin
/// ones, mirroring the browser behavior of preferring frames reachable by
/// direct property access.
pub fn find_frame_by_name(name: &str, own_domain: &str) -> Option<WindowId> {
    REGISTRY.with(|r| {
        let reg = r.borrow();
        let mut cross_origin_hit = None;
        for rec in reg.values() {
            if rec.name.as_deref() == Some(name) {
                let same = rec
                    .mock_domain
                    .as_deref()
                    .or(rec.domain.as_deref())
                    .map(|d| d == own_domain)
                    .unwrap_or(false);
                if same {
                    return Some(rec.id);
                }
                if cross_origin_hit.is_none() {
                    cross_origin_hit = Some(rec.id);
                }
            }
        }
        cross_origin_hit
    })
}

thread_local! {
    static HOST_WINDOW: RefCell<Option<WindowId>> = RefCell::new(None);
}

/// The single process-wide identity standing in for "this host process" —
/// the native analogue of the top-level document that owns every other
/// window (spec.md §3 "current window"). Registered lazily on first use,
/// under the reserved id `0` (real windows allocate from `1`).
pub fn host_window_id() -> WindowId {
    HOST_WINDOW.with(|h| {
        let mut h = h.borrow_mut();
        if let Some(id) = *h {
            return id;
        }
        let id = WindowId(0);
        REGISTRY.with(|r| {
            r.borrow_mut().insert(
                id,
                PeerRecord {
                    id,
                    name: None,
                    domain: None,
                    mock_domain: None,
                    context: Context::Popup,
                    ancestor: None,
                    closed: false,
                },
            );
        });
        *h = Some(id);
        id
    })
}

/// Known-benign cross-origin errors that, in the browser original, mean
/// "could not read `.closed`" rather than "is closed". We model this as a
/// reason string passed in by the caller instead of catching an exception.
pub const BENIGN_CROSS_ORIGIN_REASON: &str = "cross-origin-property-access-denied";

/// Whether a window should be treated as closed. `None` (no such window
/// registered) is treated as closed, matching "throws, nulls ... treated as
/// closed". A caller that caught a benign cross-origin access error when
/// probing `.closed` should pass that reason here instead of `None`, in
/// which case the window is treated as still alive.
pub fn is_window_closed(win: Option<WindowId>, benign_error: Option<&str>) -> bool {
    match win {
        None => benign_error != Some(BENIGN_CROSS_ORIGIN_REASON),
        Some(id) => REGISTRY.with(|r| {
            r.borrow()
                .get(&id)
                .map(|rec| rec.closed)
                .unwrap_or(true)
        }),
    }
}

/// One of: an exact origin, the wildcard `*`, a regex, or an ordered list
/// of any of the above (spec.md §3 "Origin pattern").
#[derive(Debug, Clone)]
pub enum DomainPattern {
    Wildcard,
    Exact(String),
    Regex(String),
    List(Vec<DomainPattern>),
}

impl DomainPattern {
    pub fn exact(s: impl Into<String>) -> Self {
        DomainPattern::Exact(s.into())
    }
}

static REGEX_CACHE: Lazy<std::sync::Mutex<HashMap<String, Regex>>> =
    Lazy::new(|| std::sync::Mutex::new(HashMap::new()));

fn compiled(pattern: &str) -> Option<Regex> {
    let mut cache = REGEX_CACHE.lock().unwrap();
    if let Some(re) = cache.get(pattern) {
        return Some(re.clone());
    }
    let re = Regex::new(pattern).ok()?;
    cache.insert(pattern.to_string(), re.clone());
    Some(re)
}

/// string-vs-string is equality or wildcard; regex-vs-string is `.test()`;
/// list matches if any element matches. The array-vs-array case (a pattern
/// that is itself a list matched against another list) is intentionally
/// unsupported here — see spec.md §9 Open Questions: the original source
/// compares arrays by JSON stringification, which is order-sensitive and
/// almost certainly an accident, so it is not reproduced.
pub fn match_domain(pattern: &DomainPattern, origin: &str) -> bool {
    match pattern {
        DomainPattern::Wildcard => true,
        DomainPattern::Exact(s) => s == "*" || s == origin,
        DomainPattern::Regex(re) => compiled(re).map(|r| r.is_match(origin)).unwrap_or(false),
        DomainPattern::List(items) => items.iter().any(|p| match_domain(p, origin)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_window_closed_null_is_closed() {
        assert!(is_window_closed(None, None));
    }

    #[test]
    fn is_window_closed_benign_error_is_alive() {
        assert!(!is_window_closed(None, Some(BENIGN_CROSS_ORIGIN_REASON)));
    }

    #[test]
    fn match_domain_wildcard() {
        assert!(match_domain(&DomainPattern::Wildcard, "https://anything.example"));
    }

    #[test]
    fn match_domain_regex() {
        let p = DomainPattern::Regex(r"^https://a\.".to_string());
        assert!(match_domain(&p, "https://a.example"));
        assert!(!match_domain(&p, "https://b.example"));
    }

    #[test]
    fn match_domain_list_any() {
        let p = DomainPattern::List(vec![
            DomainPattern::exact("https://a.example"),
            DomainPattern::exact("https://b.example"),
        ]);
        assert!(match_domain(&p, "https://b.example"));
        assert!(!match_domain(&p, "https://c.example"));
    }

    #[test]
    fn registry_round_trip() {
        let win = register(Some("child".into()), Some("https://b.example".into()), Context::Popup, None);
        assert_eq!(get_domain(win).as_deref(), Some("https://b.example"));
        assert!(!is_window_closed(Some(win), None));
        mark_closed(win);
        assert!(is_window_closed(Some(win), None));
        forget(win);
    }

    #[test]
    fn mock_domain_overrides_actual() {
        let win = register(None, Some("https://real.example".into()), Context::Popup, None);
        assert_eq!(get_actual_domain(win).as_deref(), Some("https://real.example"));
        set_mock_domain(win, Some("https://mock.example".into()));
        assert_eq!(get_domain(win).as_deref(), Some("https://mock.example"));
        assert_eq!(get_actual_domain(win).as_deref(), Some("https://real.example"));
        forget(win);
    }

    #[test]
    fn find_frame_prefers_same_origin() {
        let cross = register(Some("dup".into()), Some("https://other.example".into()), Context::Popup, None);
        let same = register(Some("dup".into()), Some("https://home.example".into()), Context::Popup, None);
        let found = find_frame_by_name("dup", "https://home.example");
        assert_eq!(found, Some(same));
        forget(cross);
        forget(same);
    }
}
