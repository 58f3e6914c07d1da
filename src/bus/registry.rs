//! The process-wide bus state (spec.md §3 "Process-wide state",
//! `__postRobot__`): listener table, response table, method-handle table,
//! ready-promise map, and the received-message dedup ring. All of it lives
//! in thread-local storage, since the crate's scheduling model is
//! single-threaded cooperative (spec.md §5).

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use serde_json::Value;

use crate::deferred::Deferred;
use crate::error::{ClosedStage, RuntimeError};
use crate::identity::{DomainPattern, WindowId};

/// A registered bus listener.
pub struct Listener {
    pub window: Option<WindowId>,
    pub domain: DomainPattern,
    pub once: bool,
    pub handler: Rc<dyn Fn(WindowId, &str, Value) -> Result<Value, RuntimeError>>,
}

fn domain_key(domain: &DomainPattern) -> String {
    match domain {
        DomainPattern::Wildcard => "*".to_string(),
        DomainPattern::Exact(s) => format!("exact:{s}"),
        DomainPattern::Regex(r) => format!("regex:{r}"),
        DomainPattern::List(items) => {
            format!("list:[{}]", items.iter().map(domain_key).collect::<Vec<_>>().join(","))
        }
    }
}

#[derive(Default)]
pub struct ListenerTable {
    by_name: HashMap<String, Vec<Listener>>,
}

impl ListenerTable {
    /// Fails (returns `false`) if an identical `(name, window, domain)` key
    /// is already registered (spec.md §4.3 "Listener registration").
    pub fn register(&mut self, name: &str, listener: Listener) -> bool {
        let bucket = self.by_name.entry(name.to_string()).or_default();
        let new_key = (listener.window, domain_key(&listener.domain));
        if bucket.iter().any(|l| (l.window, domain_key(&l.domain)) == new_key) {
            return false;
        }
        bucket.push(listener);
        true
    }

    /// Remove every listener matching the given window/domain key exactly
    /// (used to cancel a specific registration).
    pub fn unregister(&mut self, name: &str, window: Option<WindowId>, domain: &DomainPattern) {
        if let Some(bucket) = self.by_name.get_mut(name) {
            let key = (window, domain_key(domain));
            bucket.retain(|l| (l.window, domain_key(&l.domain)) != key);
        }
    }

    pub fn remove_window(&mut self, win: WindowId) {
        for bucket in self.by_name.values_mut() {
            bucket.retain(|l| l.window != Some(win));
        }
    }

    /// Find the best-matching listener per the shadowing rule (invariant
    /// 3): specific-window beats wildcard-window; within a window tier,
    /// exact-domain beats regex beats wildcard-domain. Regex entries are
    /// scanned in insertion order, after literal lookups, only within a
    /// tier that has no exact match.
    pub fn find<'a>(&'a self, name: &str, window: WindowId, origin: &str) -> Option<&'a Listener> {
        let bucket = self.by_name.get(name)?;
        let mut best: Option<(i32, &Listener)> = None;
        for l in bucket {
            let window_score = match l.window {
                Some(w) if w == window => 2,
                None => 0,
                Some(_) => continue,
            };
            let domain_score = match &l.domain {
                DomainPattern::Exact(s) if s == origin => 2,
                DomainPattern::Exact(_) => continue,
                DomainPattern::Regex(_) | DomainPattern::List(_) if crate::identity::match_domain(&l.domain, origin) => 1,
                DomainPattern::Regex(_) | DomainPattern::List(_) => continue,
                DomainPattern::Wildcard => 0,
            };
            let score = window_score * 10 + domain_score;
            if best.map(|(b, _)| score > b).unwrap_or(true) {
                best = Some((score, l));
            }
        }
        best.map(|(_, l)| l)
    }
}

/// A pending request awaiting ACK and/or RESPONSE.
pub struct ResponseEntry {
    pub peer: WindowId,
    pub origin: DomainPattern,
    pub acked: bool,
    pub ack_deadline: Option<Instant>,
    pub response_deadline: Option<Instant>,
    pub settle: Deferred<Result<Value, RuntimeError>>,
    pub name: String,
}

#[derive(Default)]
pub struct ResponseTable {
    by_hash: HashMap<String, ResponseEntry>,
}

impl ResponseTable {
    pub fn insert(&mut self, hash: String, entry: ResponseEntry) {
        self.by_hash.insert(hash, entry);
    }

    pub fn get_mut(&mut self, hash: &str) -> Option<&mut ResponseEntry> {
        self.by_hash.get_mut(hash)
    }

    pub fn remove(&mut self, hash: &str) -> Option<ResponseEntry> {
        self.by_hash.remove(hash)
    }

    /// Reject every pending request directed at `win` (spec.md invariant:
    /// `cleanUpWindow` rejects every pending response promise with that
    /// peer).
    pub fn reject_peer(&mut self, win: WindowId, stage: ClosedStage) {
        let hashes: Vec<String> = self
            .by_hash
            .iter()
            .filter(|(_, e)| e.peer == win)
            .map(|(h, _)| h.clone())
            .collect();
        for h in hashes {
            if let Some(entry) = self.by_hash.remove(&h) {
                entry.settle.settle(Err(RuntimeError::WindowClosed { window: win.0, stage }));
            }
        }
    }

    /// Expire every entry whose deadline has passed as of `now`.
    pub fn expire(&mut self, now: Instant, ack_timeout_ms: u64, response_timeout_ms: u64) {
        let expired: Vec<String> = self
            .by_hash
            .iter()
            .filter(|(_, e)| {
                let deadline = if e.acked { e.response_deadline } else { e.ack_deadline };
                deadline.map(|d| d <= now).unwrap_or(false)
            })
            .map(|(h, _)| h.clone())
            .collect();
        for h in expired {
            if let Some(entry) = self.by_hash.remove(&h) {
                let timeout_ms = if entry.acked { response_timeout_ms } else { ack_timeout_ms };
                entry.settle.settle(Err(RuntimeError::MessageTimeout {
                    name: entry.name.clone(),
                    window: entry.peer.0,
                    timeout_ms,
                }));
            }
        }
    }
}

/// A callable this side has exposed to a specific peer, reachable by the
/// peer issuing a `METHOD` request carrying this id.
pub struct ExposedMethod {
    pub name: String,
    pub callback: Rc<dyn Fn(Value) -> Result<Value, RuntimeError>>,
}

#[derive(Default)]
pub struct MethodTable {
    by_window: HashMap<WindowId, HashMap<String, ExposedMethod>>,
}

impl MethodTable {
    pub fn expose(&mut self, win: WindowId, id: String, method: ExposedMethod) {
        self.by_window.entry(win).or_default().insert(id, method);
    }

    pub fn get(&self, win: WindowId, id: &str) -> Option<Rc<dyn Fn(Value) -> Result<Value, RuntimeError>>> {
        self.by_window.get(&win)?.get(id).map(|m| m.callback.clone())
    }

    pub fn remove_window(&mut self, win: WindowId) {
        self.by_window.remove(&win);
    }
}

/// Bounded ring of recently-seen frame ids, so the bus can de-duplicate a
/// frame delivered more than once without growing unboundedly over a
/// long-lived process (spec.md §9 Open Questions).
pub struct DedupRing {
    seen: VecDeque<String>,
    set: std::collections::HashSet<String>,
    capacity: usize,
}

impl DedupRing {
    pub fn new(capacity: usize) -> Self {
        DedupRing { seen: VecDeque::with_capacity(capacity), set: Default::default(), capacity }
    }

    /// Returns `true` if `id` was already seen (i.e. this frame should be
    /// dropped as a duplicate); records it as seen either way.
    pub fn seen_before(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return true;
        }
        if self.seen.len() >= self.capacity {
            if let Some(old) = self.seen.pop_front() {
                self.set.remove(&old);
            }
        }
        self.seen.push_back(id.to_string());
        self.set.insert(id.to_string());
        false
    }
}

/// Per-window ready handshake state: settles once a `READY` frame has been
/// observed from that window.
#[derive(Default)]
pub struct ReadyTable {
    by_window: HashMap<WindowId, Deferred<()>>,
}

impl ReadyTable {
    pub fn get_or_create(&mut self, win: WindowId) -> Deferred<()> {
        self.by_window.entry(win).or_insert_with(Deferred::new).clone()
    }

    pub fn mark_ready(&mut self, win: WindowId) {
        self.get_or_create(win).settle(());
    }

    pub fn remove_window(&mut self, win: WindowId) {
        self.by_window.remove(&win);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Context, register as register_window};

    fn noop_handler() -> Rc<dyn Fn(WindowId, &str, Value) -> Result<Value, RuntimeError>> {
        Rc::new(|_win, _origin, data| Ok(data))
    }

    #[test]
    fn shadowing_prefers_specific_window_over_wildcard() {
        let win = register_window(None, Some("https://a.example".into()), Context::Popup, None);
        let mut table = ListenerTable::default();
        table.register(
            "msg",
            Listener { window: None, domain: DomainPattern::Wildcard, once: false, handler: noop_handler() },
        );
        let specific = noop_handler();
        table.register(
            "msg",
            Listener {
                window: Some(win),
                domain: DomainPattern::Exact("https://a.example".into()),
                once: false,
                handler: specific.clone(),
            },
        );
        let found = table.find("msg", win, "https://a.example").unwrap();
        assert!(Rc::ptr_eq(&found.handler, &specific));
    }

    #[test]
    fn duplicate_registration_fails() {
        let win = register_window(None, None, Context::Popup, None);
        let mut table = ListenerTable::default();
        assert!(table.register(
            "msg",
            Listener { window: Some(win), domain: DomainPattern::Wildcard, once: false, handler: noop_handler() }
        ));
        assert!(!table.register(
            "msg",
            Listener { window: Some(win), domain: DomainPattern::Wildcard, once: false, handler: noop_handler() }
        ));
    }

    #[test]
    fn dedup_ring_drops_repeats_and_is_bounded() {
        let mut ring = DedupRing::new(2);
        assert!(!ring.seen_before("a"));
        assert!(ring.seen_before("a"));
        assert!(!ring.seen_before("b"));
        assert!(!ring.seen_before("c")); // evicts "a"
        assert!(!ring.seen_before("a")); // "a" no longer remembered
    }
}
