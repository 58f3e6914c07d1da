//! Parent controller (C6, spec.md §4.6) and the delegate-overrides builder
//! shared with [`crate::descriptor`]'s `DELEGATE_<name>` listener.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;

use crate::bus::{self, frame::WindowType, SendOptions, SendStrategy};
use crate::codec::{self, ChildDescriptor, ParentRef, PropsTransport, RenderParentRef};
use crate::deferred::Deferred;
use crate::descriptor::ComponentDescriptor;
use crate::error::RuntimeError;
use crate::identity::{self, Context, DomainPattern, WindowId};
use crate::props::{self, NormalizedProps};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentState {
    Constructed,
    Rendering,
    Initialized,
    Closing,
    Destroyed,
}

impl std::fmt::Display for ParentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParentState::Constructed => "constructed",
            ParentState::Rendering => "rendering",
            ParentState::Initialized => "initialized",
            ParentState::Closing => "closing",
            ParentState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Where the child physically lives and how it is hosted — the native
/// analogue of "sub-frame attached to a container element" vs. "separate
/// top-level popup window" (spec.md §4.1, §4.6 step 5).
pub trait ContainerHost {
    fn open_child(&self, name: &str, context: Context, width: u32, height: u32) -> Result<WindowId, RuntimeError>;
    fn load_url(&self, win: WindowId, url: &str);
    fn show(&self, win: WindowId);
    fn hide(&self, win: WindowId);
    fn resize(&self, win: WindowId, width: u32, height: u32);
    fn destroy(&self, win: WindowId);
}

pub struct RenderOptions {
    pub context: Context,
    pub env: Option<String>,
    pub timeout: Option<Duration>,
    pub dimensions: (u32, u32),
    pub allow_resize: bool,
    /// `DIRECT_PARENT` unless this render targets a foreign render window
    /// (spec.md §4.6 "Window-name packing").
    pub render_window: Option<WindowId>,
}

/// A single rendered instance (spec.md §4.7 "Parent instance states").
pub struct ParentController {
    pub descriptor: Rc<ComponentDescriptor>,
    pub uid: String,
    pub own_window: WindowId,
    pub child_window: RefCell<Option<WindowId>>,
    pub state: RefCell<ParentState>,
    pub props: RefCell<NormalizedProps>,
    pub on_init: Deferred<Result<Value, RuntimeError>>,
    pub on_close_fired: RefCell<bool>,
    cleanup: RefCell<Vec<Box<dyn FnOnce()>>>,
    child_exports: RefCell<Option<ChildExports>>,
}

#[derive(Clone)]
struct ChildExports {
    update_props_id: String,
    close_id: String,
}

thread_local! {
    static INSTANCES: RefCell<HashMap<WindowId, Rc<ParentController>>> = RefCell::new(HashMap::new());
}

/// Look up the controller rendered into `child_window`, keyed the same way
/// `close`/`update_props`'s bus callbacks reach it (spec.md §6 API surface —
/// the napi bindings hold only the window id handle, not the `Rc` itself).
pub fn instance(child_window: WindowId) -> Option<Rc<ParentController>> {
    INSTANCES.with(|i| i.borrow().get(&child_window).cloned())
}

impl ParentController {
    /// The render pipeline (spec.md §4.6 steps 1-12), condensed to the
    /// operations a native host actually performs: resolve the child
    /// origin, open the child window with its packed name, attach
    /// listeners, build and load the URL, and arm the load timeout. DOM
    /// steps with no native counterpart (`elementReady`, sandbox
    /// sub-frame document writes) are not reproduced — the container is
    /// simply the opened native window itself.
    pub fn render(
        descriptor: Rc<ComponentDescriptor>,
        own_window: WindowId,
        raw_props: serde_json::Map<String, Value>,
        opts: RenderOptions,
        host: Rc<dyn ContainerHost>,
    ) -> Result<Rc<ParentController>, RuntimeError> {
        if !descriptor.allows_context(opts.context) {
            return Err(RuntimeError::Validation {
                prop: "context".into(),
                reason: format!("tag `{}` does not allow this render context", descriptor.options.tag),
            });
        }

        let own_domain = identity::get_domain(own_window)
            .ok_or_else(|| RuntimeError::Fatal("own window has no known origin".into()))?;

        let domain = descriptor.resolve_domain(opts.env.as_deref())?;
        if !identity::match_domain(&descriptor.options.allowed_parent_domains, &own_domain) {
            return Err(RuntimeError::Integration(format!(
                "own origin {own_domain} is not in allowedParentDomains for tag `{}`",
                descriptor.options.tag
            )));
        }

        let normalized = props::normalize(&descriptor.options.props, &raw_props)?;
        let uid = codec::random_id();

        let render_window = opts.render_window.unwrap_or(own_window);
        let (parent_ref, render_parent_ref) = pack_window_name(own_window, render_window, &uid);

        let props_transport = if render_window == own_window {
            PropsTransport::Raw(Value::Object(raw_props.clone()))
        } else {
            crate::shared::store_props(&uid, Value::Object(raw_props.clone()));
            crate::shared::store_window(&uid, render_window);
            PropsTransport::Uid
        };

        let child_descriptor = codec::build(
            &descriptor.options.tag,
            "1.0",
            &descriptor.options.tag,
            &domain_literal(&domain),
            parent_ref,
            render_parent_ref,
            &uid,
            props_transport,
        );
        let window_name = codec::encode(&child_descriptor).map_err(RuntimeError::Render)?;

        let child_window = host.open_child(&window_name, opts.context, opts.dimensions.0, opts.dimensions.1)?;
        identity::set_mock_domain(child_window, None);

        let controller = Rc::new(ParentController {
            descriptor: descriptor.clone(),
            uid: uid.clone(),
            own_window,
            child_window: RefCell::new(Some(child_window)),
            state: RefCell::new(ParentState::Rendering),
            props: RefCell::new(normalized),
            on_init: Deferred::new(),
            on_close_fired: RefCell::new(false),
            cleanup: RefCell::new(Vec::new()),
            child_exports: RefCell::new(None),
        });

        INSTANCES.with(|i| i.borrow_mut().insert(child_window, controller.clone()));
        controller.attach_listeners(host.clone());

        let query = {
            let normalized_ref = controller.props.borrow();
            props::to_query_params(&descriptor.options.props, &normalized_ref)
        };
        let url = build_url(&domain_literal(&domain), &query);
        host.load_url(child_window, &url);

        if let Some(timeout) = opts.timeout {
            controller.arm_load_timeout(timeout);
        }

        let host_for_close = host.clone();
        let win_for_close = child_window;
        controller.push_cleanup(move || host_for_close.destroy(win_for_close));

        Ok(controller)
    }

    fn attach_listeners(self: &Rc<Self>, host: Rc<dyn ContainerHost>) {
        let child = self.child_window.borrow().unwrap();
        let domain = DomainPattern::Wildcard;

        let this = self.clone();
        bus::on("init", Some(child), domain.clone(), true, Rc::new(move |win, _origin, data| {
            this.handle_init(win, data)
        }));

        let this = self.clone();
        bus::on("close", Some(child), domain.clone(), true, Rc::new(move |_win, _origin, _data| {
            this.close("child requested close");
            Ok(Value::Null)
        }));

        let this = self.clone();
        let host2 = host.clone();
        bus::on("resize", Some(child), domain.clone(), false, Rc::new(move |_win, _origin, data| {
            if let (Some(w), Some(h)) = (data.get("width").and_then(Value::as_u64), data.get("height").and_then(Value::as_u64)) {
                if let Some(win) = *this.child_window.borrow() {
                    host2.resize(win, w as u32, h as u32);
                }
            }
            Ok(Value::Null)
        }));

        let host3 = host.clone();
        let this = self.clone();
        bus::on("hide", Some(child), domain.clone(), false, Rc::new(move |_win, _origin, _data| {
            if let Some(win) = *this.child_window.borrow() {
                host3.hide(win);
            }
            Ok(Value::Null)
        }));

        let host4 = host.clone();
        let this = self.clone();
        bus::on("show", Some(child), domain.clone(), false, Rc::new(move |_win, _origin, _data| {
            if let Some(win) = *this.child_window.borrow() {
                host4.show(win);
            }
            Ok(Value::Null)
        }));

        let this = self.clone();
        bus::on("error", Some(child), domain, false, Rc::new(move |_win, _origin, data| {
            let message = data.get("message").and_then(Value::as_str).unwrap_or("child error").to_string();
            let err = RuntimeError::Remote { window: child.0, message, stack: data.get("stack").and_then(Value::as_str).map(String::from) };
            this.on_init.settle(Err(err));
            this.close("child error");
            Ok(Value::Null)
        }));
    }

    fn handle_init(self: &Rc<Self>, window: WindowId, data: Value) -> Result<Value, RuntimeError> {
        let exports = data.get("exports").cloned().unwrap_or(Value::Null);
        let update_props_id = exports.get("updateProps").and_then(|m| m.get("__id__")).and_then(Value::as_str).unwrap_or_default().to_string();
        let close_id = exports.get("close").and_then(|m| m.get("__id__")).and_then(Value::as_str).unwrap_or_default().to_string();
        *self.child_exports.borrow_mut() = Some(ChildExports { update_props_id, close_id });

        *self.state.borrow_mut() = ParentState::Initialized;
        let response = serde_json::json!({ "context": window.0, "props": Value::Object(Default::default()) });
        self.on_init.settle(Ok(response.clone()));
        Ok(response)
    }

    fn arm_load_timeout(self: &Rc<Self>, timeout: Duration) {
        // The host pump calls `check_timeout` once per tick (spec.md §5
        // "safe interval" pattern: reschedule rather than a raw host
        // timer, so a late cancel never races a pending tick).
        let deadline = std::time::Instant::now() + timeout;
        let this = self.clone();
        TIMEOUTS.with(|t| t.borrow_mut().push((deadline, this)));
    }

    /// `updateProps(partial)`: waits on `onInit`, then calls the stored
    /// child `updateProps` export (spec.md §4.6).
    pub fn update_props(self: &Rc<Self>, partial: serde_json::Map<String, Value>) {
        let this = self.clone();
        self.on_init.on_settle(move |outcome| {
            if outcome.is_err() {
                return;
            }
            let Some(exports) = this.child_exports.borrow().clone() else { return };
            let Some(child) = *this.child_window.borrow() else { return };
            let _ = bus::send(
                child,
                this.own_window,
                "call",
                serde_json::json!({ "__id__": exports.update_props_id, "args": [Value::Object(partial.clone())] }),
                WindowType::Popup,
                SendOptions { domain: None, timeout: None, fire_and_forget: false, strategies: vec![SendStrategy::PostMessage] },
            );
        });
    }

    /// Idempotent close: fires `onClose` once, runs component-close and
    /// container-close, then drains the cleanup registry in LIFO order
    /// (spec.md §4.6 "Close semantics").
    pub fn close(self: &Rc<Self>, _reason: &str) {
        if matches!(*self.state.borrow(), ParentState::Destroyed) {
            return;
        }
        *self.state.borrow_mut() = ParentState::Closing;

        if !*self.on_close_fired.borrow() {
            *self.on_close_fired.borrow_mut() = true;
            if let Some(crate::props::NormalizedValue::Function(_)) = self.props.borrow().get("onClose") {
                let _ = self.props.borrow().call("onClose", vec![]);
            }
        }

        if let Some(exports) = self.child_exports.borrow().clone() {
            if let Some(child) = *self.child_window.borrow() {
                if !identity::is_window_closed(Some(child), None) {
                    let _ = bus::send(
                        child,
                        self.own_window,
                        "call",
                        serde_json::json!({ "__id__": exports.close_id, "args": [] }),
                        WindowType::Popup,
                        SendOptions { domain: None, timeout: None, fire_and_forget: true, strategies: vec![SendStrategy::PostMessage] },
                    );
                }
            }
        }

        if let Some(child) = self.child_window.borrow_mut().take() {
            bus::clean_up_window(child);
            identity::mark_closed(child);
            INSTANCES.with(|i| i.borrow_mut().remove(&child));
        }

        for cleanup in self.cleanup.borrow_mut().drain(..).rev() {
            cleanup();
        }

        *self.state.borrow_mut() = ParentState::Destroyed;
    }

    fn push_cleanup(self: &Rc<Self>, f: impl FnOnce() + 'static) {
        self.cleanup.borrow_mut().push(Box::new(f));
    }
}

thread_local! {
    static TIMEOUTS: RefCell<Vec<(std::time::Instant, Rc<ParentController>)>> = RefCell::new(Vec::new());
}

/// Called from the host pump: fail `onInit` for any instance whose load
/// timeout has expired without an `init` round-trip (spec.md §4.6 step 12).
pub fn pump_load_timeouts(now: std::time::Instant) {
    let due: Vec<Rc<ParentController>> = TIMEOUTS.with(|t| {
        let mut t = t.borrow_mut();
        let (due, rest): (Vec<_>, Vec<_>) = t.drain(..).partition(|(d, c)| *d <= now || c.on_init.is_settled());
        *t = rest;
        due.into_iter().map(|(_, c)| c).collect()
    });
    for controller in due {
        if !controller.on_init.is_settled() {
            controller.on_init.settle(Err(RuntimeError::MessageTimeout {
                name: "init".into(),
                window: controller.child_window.borrow().map(|w| w.0).unwrap_or(0),
                timeout_ms: 0,
            }));
            controller.close("load timeout");
        }
    }
}

/// Window-name packing (spec.md §4.6 "Window-name packing"):
/// `parent = DIRECT_PARENT` if rendered in this window, else a named
/// lookup, else `PARENT_PARENT`; `renderParent` follows the same rule but
/// falls back to `PARENT_UID` for a foreign render window.
fn pack_window_name(own_window: WindowId, render_window: WindowId, uid: &str) -> (ParentRef, RenderParentRef) {
    let parent_ref = if render_window == own_window {
        ParentRef::DirectParent
    } else {
        match identity::get_ancestor(render_window) {
            Some(a) if a == own_window => ParentRef::ParentParent,
            _ => ParentRef::DirectParent,
        }
    };
    let render_parent_ref = if render_window == own_window {
        RenderParentRef::DirectParent
    } else if identity::get_ancestor(render_window) == Some(own_window) {
        RenderParentRef::ParentParent
    } else {
        crate::shared::store_window(uid, render_window);
        RenderParentRef::ParentUid
    };
    (parent_ref, render_parent_ref)
}

fn domain_literal(pattern: &DomainPattern) -> String {
    match pattern {
        DomainPattern::Exact(s) => s.clone(),
        DomainPattern::Wildcard => "*".to_string(),
        DomainPattern::Regex(r) => r.clone(),
        DomainPattern::List(items) => items.first().map(domain_literal).unwrap_or_default(),
    }
}

fn build_url(base: &str, query: &[(String, String)]) -> String {
    let mut url = url::Url::parse(base).unwrap_or_else(|_| url::Url::parse("about:blank").unwrap());
    {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }
    url.to_string()
}

/// Build the overrides bundle returned to a foreign-origin `DELEGATE_<tag>`
/// request (spec.md §4.5, §4.7 "Render delegate"). Only a small prop subset
/// and a table of override callables cross the origin boundary; everything
/// else stays local and is re-played against the delegate by the calling
/// side's own controller.
pub fn build_delegate_overrides(
    descriptor: &Rc<ComponentDescriptor>,
    requester: WindowId,
    origin: &str,
    _data: Value,
) -> Result<Value, RuntimeError> {
    if !identity::match_domain(&descriptor.options.allowed_parent_domains, origin) {
        return Err(RuntimeError::Integration(format!(
            "delegate request for tag `{}` from disallowed origin {origin}",
            descriptor.options.tag
        )));
    }
    let _ = requester;
    Ok(serde_json::json!({
        "uid": codec::random_id(),
        "overrides": ["focus", "userClose", "getDomain", "getContainerTemplate", "getComponentTemplate"],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{AllowedContext, ComponentOptions, DomainSpec};
    use crate::identity::{register as register_window};
    use crate::props::PropSchema;

    struct NullHost;
    impl ContainerHost for NullHost {
        fn open_child(&self, _name: &str, _context: Context, _w: u32, _h: u32) -> Result<WindowId, RuntimeError> {
            Ok(register_window(None, Some("https://b.example".into()), Context::SubFrame, None))
        }
        fn load_url(&self, _win: WindowId, _url: &str) {}
        fn show(&self, _win: WindowId) {}
        fn hide(&self, _win: WindowId) {}
        fn resize(&self, _win: WindowId, _w: u32, _h: u32) {}
        fn destroy(&self, _win: WindowId) {}
    }

    fn descriptor() -> Rc<ComponentDescriptor> {
        Rc::new(ComponentDescriptor {
            options: ComponentOptions {
                tag: "demo-comp".into(),
                url: DomainSpec::Literal(DomainPattern::exact("https://b.example/x.html")),
                dimensions: None,
                contexts: vec![AllowedContext::Iframe],
                allowed_parent_domains: DomainPattern::Wildcard,
                props: PropSchema::default(),
                default_context: AllowedContext::Iframe,
            },
        })
    }

    #[test]
    fn render_rejects_disallowed_context() {
        let own = register_window(None, Some("https://a.example".into()), Context::Popup, None);
        let mut d = descriptor();
        Rc::get_mut(&mut d).unwrap().options.contexts = vec![AllowedContext::Popup];
        let result = ParentController::render(
            d,
            own,
            serde_json::Map::new(),
            RenderOptions { context: Context::SubFrame, env: None, timeout: None, dimensions: (200, 200), allow_resize: true, render_window: None },
            Rc::new(NullHost),
        );
        assert!(result.is_err());
    }

    #[test]
    fn render_opens_child_and_reaches_rendering_state() {
        let own = register_window(None, Some("https://a.example".into()), Context::Popup, None);
        let controller = ParentController::render(
            descriptor(),
            own,
            serde_json::Map::new(),
            RenderOptions { context: Context::SubFrame, env: None, timeout: None, dimensions: (200, 200), allow_resize: true, render_window: None },
            Rc::new(NullHost),
        ).unwrap();
        assert_eq!(*controller.state.borrow(), ParentState::Rendering);
    }
}
