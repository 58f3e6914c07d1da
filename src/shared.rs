//! The secondary process-wide slot (spec.md §4.3 "Process-wide state",
//! §6 `__XCOMPONENT__`): `{ props: {uid -> serialized props}, windows:
//! {uid -> window handle} }`, used for cross-window UID prop lookups.
//!
//! In the browser original this exists because a cross-origin child cannot
//! read a same-origin-only JS object except through window property
//! access; a native host process has no such boundary, so this collapses
//! to a plain thread-local map. The lookup contract (store by uid, read
//! back by uid) is kept so callers read the same as the original design.

use std::cell::RefCell;
use std::collections::HashMap;

use serde_json::Value;

use crate::identity::WindowId;

thread_local! {
    static PROPS: RefCell<HashMap<String, Value>> = RefCell::new(HashMap::new());
    static WINDOWS: RefCell<HashMap<String, WindowId>> = RefCell::new(HashMap::new());
}

pub fn store_props(uid: &str, value: Value) {
    PROPS.with(|p| p.borrow_mut().insert(uid.to_string(), value));
}

pub fn get_props(uid: &str) -> Option<Value> {
    PROPS.with(|p| p.borrow().get(uid).cloned())
}

pub fn forget_props(uid: &str) {
    PROPS.with(|p| p.borrow_mut().remove(uid));
}

pub fn store_window(uid: &str, win: WindowId) {
    WINDOWS.with(|w| w.borrow_mut().insert(uid.to_string(), win));
}

pub fn get_window(uid: &str) -> Option<WindowId> {
    WINDOWS.with(|w| w.borrow().get(uid).copied())
}

pub fn forget_window(uid: &str) {
    WINDOWS.with(|w| w.borrow_mut().remove(uid));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{register, Context};

    #[test]
    fn props_round_trip_by_uid() {
        store_props("uid1", serde_json::json!({"a": 1}));
        assert_eq!(get_props("uid1"), Some(serde_json::json!({"a": 1})));
        forget_props("uid1");
        assert_eq!(get_props("uid1"), None);
    }

    #[test]
    fn windows_round_trip_by_uid() {
        let win = register(None, None, Context::Popup, None);
        store_window("uid2", win);
        assert_eq!(get_window("uid2"), Some(win));
        forget_window("uid2");
    }
}
