//! Public napi surface for the cross-origin component runtime (spec.md §6:
//! `create`, `render`, `renderTo`, `attach`, `getByTag`, `on`, `send`).
//!
//! Every class here follows [`crate::window::NativeWindow`]'s shape: the
//! napi-visible struct holds only a cheap handle (a window id or a tag), and
//! every method looks the real state up from the module's own thread-local
//! registry. JSON payloads cross the boundary as strings, the same way
//! [`crate::window::NativeWindow::post_message`] does, since this crate does
//! not carry the `serde-json` napi feature.

use napi::bindgen_prelude::*;
use napi::threadsafe_function::{
    ErrorStrategy, ThreadSafeCallContext, ThreadsafeFunction, ThreadsafeFunctionCallMode,
};
use napi::JsFunction;
use napi_derive::napi;

use crate::child::ChildController;
use crate::descriptor::{self, AllowedContext, ComponentOptions, DomainSpec};
use crate::error::RuntimeError;
use crate::identity::{self, Context, DomainPattern, WindowId};
use crate::options::WindowOptions;
use crate::parent::{self, ContainerHost, ParentController, RenderOptions};
use crate::props::PropSchema;
use crate::window_manager::{with_manager, Command};

fn parse_context(s: &str) -> Option<AllowedContext> {
    match s {
        "iframe" => Some(AllowedContext::Iframe),
        "popup" => Some(AllowedContext::Popup),
        _ => None,
    }
}

fn to_identity_context(c: AllowedContext) -> Context {
    match c {
        AllowedContext::Iframe => Context::SubFrame,
        AllowedContext::Popup => Context::Popup,
    }
}

fn parse_domains(list: &[String]) -> DomainPattern {
    if list.is_empty() || list.iter().any(|s| s == "*") {
        return DomainPattern::Wildcard;
    }
    if list.len() == 1 {
        DomainPattern::exact(list[0].clone())
    } else {
        DomainPattern::List(list.iter().map(|s| DomainPattern::exact(s.clone())).collect())
    }
}

fn parse_json(s: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    let v: serde_json::Value = serde_json::from_str(s)
        .map_err(|e| napi::Error::from_reason(format!("invalid JSON: {e}")))?;
    Ok(v.as_object().cloned().unwrap_or_default())
}

/// Real `ContainerHost`: opens/controls child windows through the same
/// [`crate::window_manager::Command`] queue [`crate::window::NativeWindow`]
/// drains on `pumpEvents()`, so a rendered component is an actual `tao`/
/// `wry` window rather than a test double.
pub struct WindowManagerHost;

impl ContainerHost for WindowManagerHost {
    fn open_child(&self, name: &str, context: Context, width: u32, height: u32) -> std::result::Result<WindowId, RuntimeError> {
        let id = with_manager(|mgr| -> std::result::Result<u32, RuntimeError> {
            if !mgr.initialized {
                return Err(RuntimeError::Fatal("native window system not initialized".into()));
            }
            let id = mgr.allocate_id().map_err(|e| RuntimeError::Fatal(e.to_string()))?;
            let opts = WindowOptions {
                width: Some(width as f64),
                height: Some(height as f64),
                visible: Some(matches!(context, Context::Popup)),
                ..WindowOptions::default()
            };
            mgr.push_command(Command::CreateWindow { id, options: opts });
            Ok(id)
        })?;

        let win = WindowId(id);
        identity::register_with_id(win, Some(name.to_string()), None, context, None);
        Ok(win)
    }

    fn load_url(&self, win: WindowId, url: &str) {
        with_manager(|mgr| mgr.push_command(Command::LoadURL { id: win.0, url: url.to_string() }));
    }

    fn show(&self, win: WindowId) {
        with_manager(|mgr| mgr.push_command(Command::Show { id: win.0 }));
    }

    fn hide(&self, win: WindowId) {
        with_manager(|mgr| mgr.push_command(Command::Hide { id: win.0 }));
    }

    fn resize(&self, win: WindowId, width: u32, height: u32) {
        with_manager(|mgr| mgr.push_command(Command::SetSize { id: win.0, width: width as f64, height: height as f64 }));
    }

    fn destroy(&self, win: WindowId) {
        with_manager(|mgr| mgr.push_command(Command::Close { id: win.0 }));
    }
}

/// JS-facing mirror of [`ComponentOptions`] — napi objects can't hold the
/// `Rc`/closure-bearing fields directly.
#[napi(object)]
#[derive(Debug, Clone)]
pub struct ComponentCreateOptions {
    pub tag: String,
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// `"iframe"` and/or `"popup"`. Default: both.
    pub contexts: Option<Vec<String>>,
    pub allowed_parent_domains: Option<Vec<String>>,
    /// `"iframe"` or `"popup"`. Default: `"iframe"`.
    pub default_context: Option<String>,
}

/// A registered component (spec.md §6 `create`/`getByTag`).
#[napi]
pub struct Component {
    tag: String,
}

#[napi]
impl Component {
    /// Register a component under `options.tag`. If this process's host
    /// window name decodes to a child descriptor for the same tag, the
    /// child side is instantiated immediately (spec.md §4.5) and becomes
    /// reachable through [`attach`].
    #[napi(factory)]
    pub fn create(options: ComponentCreateOptions) -> Result<Component> {
        let contexts = options
            .contexts
            .as_deref()
            .map(|cs| cs.iter().filter_map(|s| parse_context(s)).collect::<Vec<_>>())
            .filter(|cs| !cs.is_empty())
            .unwrap_or_else(|| vec![AllowedContext::Iframe, AllowedContext::Popup]);
        let default_context = options
            .default_context
            .as_deref()
            .and_then(parse_context)
            .unwrap_or(AllowedContext::Iframe);
        let allowed_parent_domains = options
            .allowed_parent_domains
            .as_deref()
            .map(parse_domains)
            .unwrap_or(DomainPattern::Wildcard);
        let dimensions = match (options.width, options.height) {
            (Some(w), Some(h)) => Some((w, h)),
            _ => None,
        };

        let opts = ComponentOptions {
            tag: options.tag.clone(),
            url: DomainSpec::Literal(DomainPattern::exact(options.url)),
            dimensions,
            contexts,
            allowed_parent_domains,
            props: PropSchema::default(),
            default_context,
        };

        let current = identity::host_window_id();
        let window_name = identity::get_name(current);
        descriptor::create(opts, current, window_name.as_deref())?;
        Ok(Component { tag: options.tag })
    }

    /// Look up a previously created component (spec.md §6 `getByTag`).
    #[napi]
    pub fn get_by_tag(tag: String) -> Option<Component> {
        descriptor::get_by_tag(&tag).map(|_| Component { tag })
    }

    #[napi(getter)]
    pub fn tag(&self) -> String {
        self.tag.clone()
    }

    /// Render this component into a freshly opened window (spec.md §6
    /// `render`). `props_json` is a JSON object string; omit for no props.
    #[napi]
    pub fn render(
        &self,
        context: Option<String>,
        own_window: Option<u32>,
        props_json: Option<String>,
    ) -> Result<ParentInstance> {
        self.render_into(context, own_window, None, props_json)
    }

    /// Render into a specific already-open window instead of a freshly
    /// opened one (spec.md §6 `renderTo`).
    #[napi]
    pub fn render_to(
        &self,
        target_window: u32,
        context: Option<String>,
        own_window: Option<u32>,
        props_json: Option<String>,
    ) -> Result<ParentInstance> {
        self.render_into(context, own_window, Some(WindowId(target_window)), props_json)
    }

    fn render_into(
        &self,
        context: Option<String>,
        own_window: Option<u32>,
        render_window: Option<WindowId>,
        props_json: Option<String>,
    ) -> Result<ParentInstance> {
        let descriptor = descriptor::get_by_tag(&self.tag)
            .ok_or_else(|| napi::Error::from_reason(format!("no component registered for tag `{}`", self.tag)))?;

        let native_context = context
            .as_deref()
            .and_then(parse_context)
            .map(to_identity_context)
            .unwrap_or_else(|| to_identity_context(descriptor.options.default_context));

        let own = own_window.map(WindowId).unwrap_or_else(identity::host_window_id);
        let (width, height) = descriptor.options.dimensions.unwrap_or((800, 600));
        let raw_props = match props_json {
            Some(s) => parse_json(&s)?,
            None => serde_json::Map::new(),
        };

        let render_opts = RenderOptions {
            context: native_context,
            env: None,
            timeout: Some(std::time::Duration::from_secs(10)),
            dimensions: (width, height),
            allow_resize: true,
            render_window,
        };

        let controller = ParentController::render(descriptor, own, raw_props, render_opts, std::rc::Rc::new(WindowManagerHost))?;
        let child_window = (*controller.child_window.borrow())
            .ok_or_else(|| napi::Error::from_reason("render did not open a child window"))?;
        Ok(ParentInstance { child_window: child_window.0 })
    }
}

/// A rendered component instance (spec.md §4.6, §4.7 "Parent instance
/// states"). Holds only the child window id — the real [`ParentController`]
/// lives in [`crate::parent`]'s thread-local registry.
#[napi]
pub struct ParentInstance {
    child_window: u32,
}

#[napi]
impl ParentInstance {
    #[napi(getter)]
    pub fn child_window(&self) -> u32 {
        self.child_window
    }

    #[napi(getter)]
    pub fn state(&self) -> Result<String> {
        Ok(self.controller()?.state.borrow().to_string())
    }

    /// Send an `updateProps` call to the child once `onInit` has settled
    /// (spec.md §4.6). `partial_json` is a JSON object string.
    #[napi]
    pub fn update_props(&self, partial_json: String) -> Result<()> {
        let partial = parse_json(&partial_json)?;
        self.controller()?.update_props(partial);
        Ok(())
    }

    /// Idempotent close: fires `onClose`, tells the child to clean up, and
    /// destroys the container window (spec.md §4.6 "Close semantics").
    #[napi]
    pub fn close(&self) -> Result<()> {
        self.controller()?.close("closed from host");
        Ok(())
    }

    /// Register a callback for the `onInit` settlement: called once with
    /// `(error, resultJson)` — `error` is `null` on success.
    #[napi(ts_args_type = "callback: (error: string | null, resultJson: string) => void")]
    pub fn on_init(&self, callback: JsFunction) -> Result<()> {
        let tsfn: ThreadsafeFunction<(Option<String>, String), ErrorStrategy::Fatal> = callback
            .create_threadsafe_function(0, |ctx: ThreadSafeCallContext<(Option<String>, String)>| {
                let err = match ctx.value.0 {
                    Some(ref e) => ctx.env.create_string(e)?.into_unknown(),
                    None => ctx.env.get_null()?.into_unknown(),
                };
                let data = ctx.env.create_string(&ctx.value.1)?;
                Ok(vec![err, data.into_unknown()])
            })?;

        self.controller()?.on_init.on_settle(move |outcome| {
            let (err, data) = match outcome {
                Ok(v) => (None, v),
                Err(e) => (Some(e.to_string()), serde_json::Value::Null),
            };
            let data_json = serde_json::to_string(&data).unwrap_or_else(|_| "null".to_string());
            tsfn.call((err, data_json), ThreadsafeFunctionCallMode::NonBlocking);
        });
        Ok(())
    }

    fn controller(&self) -> Result<std::rc::Rc<ParentController>> {
        parent::instance(WindowId(self.child_window))
            .ok_or_else(|| napi::Error::from_reason("parent instance already closed"))
    }
}

/// The child side of a component bound to this process (spec.md §6
/// `attach`). There is at most one per process: the native analogue of "this
/// document is itself running as a child" (spec.md §4.7).
#[napi]
pub struct ChildHandle {
    window: u32,
}

#[napi]
pub fn attach() -> Result<ChildHandle> {
    let controller: std::rc::Rc<ChildController> = descriptor::active_child()
        .ok_or_else(|| napi::Error::from_reason("attach() called but this process is not running as a child"))?;
    Ok(ChildHandle { window: controller.window.0 })
}

#[napi]
impl ChildHandle {
    #[napi(getter)]
    pub fn state(&self) -> Result<String> {
        Ok(self.controller()?.state().to_string())
    }

    /// Mark the child live — called once the host has finished wiring up
    /// whatever the recovered props needed (spec.md §4.7 state machine).
    #[napi]
    pub fn mark_live(&self) -> Result<()> {
        self.controller()?.mark_live();
        Ok(())
    }

    /// Register a callback for the `onInit` settlement, mirroring
    /// [`ParentInstance::on_init`].
    #[napi(ts_args_type = "callback: (error: string | null, resultJson: string) => void")]
    pub fn on_init(&self, callback: JsFunction) -> Result<()> {
        let tsfn: ThreadsafeFunction<(Option<String>, String), ErrorStrategy::Fatal> = callback
            .create_threadsafe_function(0, |ctx: ThreadSafeCallContext<(Option<String>, String)>| {
                let err = match ctx.value.0 {
                    Some(ref e) => ctx.env.create_string(e)?.into_unknown(),
                    None => ctx.env.get_null()?.into_unknown(),
                };
                let data = ctx.env.create_string(&ctx.value.1)?;
                Ok(vec![err, data.into_unknown()])
            })?;

        self.controller()?.on_init().on_settle(move |outcome| {
            let (err, data) = match outcome {
                Ok(v) => (None, v),
                Err(e) => (Some(e.to_string()), serde_json::Value::Null),
            };
            let data_json = serde_json::to_string(&data).unwrap_or_else(|_| "null".to_string());
            tsfn.call((err, data_json), ThreadsafeFunctionCallMode::NonBlocking);
        });
        Ok(())
    }

    fn controller(&self) -> Result<std::rc::Rc<ChildController>> {
        crate::child::instance(WindowId(self.window))
            .ok_or_else(|| napi::Error::from_reason("child instance already destroyed"))
    }
}

/// Register a bus listener (spec.md §6 `on`). The callback always
/// acknowledges with `null` — genuine two-way calls go back over
/// [`send`], the same way exposed methods already work
/// ([`crate::bus::expose_method`]).
#[napi(ts_args_type = "callback: (window: number, origin: string, dataJson: string) => void")]
pub fn on(name: String, window: Option<u32>, domain: Option<String>, once: bool, callback: JsFunction) -> Result<bool> {
    let tsfn: ThreadsafeFunction<(u32, String, String), ErrorStrategy::Fatal> = callback
        .create_threadsafe_function(0, |ctx: ThreadSafeCallContext<(u32, String, String)>| {
            let win = ctx.env.create_uint32(ctx.value.0)?;
            let origin = ctx.env.create_string(&ctx.value.1)?;
            let data = ctx.env.create_string(&ctx.value.2)?;
            Ok(vec![win.into_unknown(), origin.into_unknown(), data.into_unknown()])
        })?;

    let domain_pattern = domain.map(DomainPattern::exact).unwrap_or(DomainPattern::Wildcard);
    let registered = crate::bus::on(
        &name,
        window.map(WindowId),
        domain_pattern,
        once,
        std::rc::Rc::new(move |win, origin, data| {
            let data_json = serde_json::to_string(&data).unwrap_or_else(|_| "null".to_string());
            tsfn.call((win.0, origin.to_string(), data_json), ThreadsafeFunctionCallMode::NonBlocking);
            Ok(serde_json::Value::Null)
        }),
    );
    Ok(registered)
}

/// Send a request to `window` (spec.md §6 `send`). `callback` is invoked
/// once with `(error, resultJson)` when the ACK/RESPONSE round-trip settles
/// (or times out). `data_json` is a JSON value string; omit for `null`.
#[napi(ts_args_type = "callback: (error: string | null, resultJson: string) => void")]
pub fn send(
    window: u32,
    name: String,
    data_json: Option<String>,
    domain: Option<String>,
    timeout_ms: Option<u32>,
    fire_and_forget: Option<bool>,
    callback: JsFunction,
) -> Result<()> {
    let data: serde_json::Value = match data_json {
        Some(s) => serde_json::from_str(&s).map_err(|e| napi::Error::from_reason(format!("invalid JSON: {e}")))?,
        None => serde_json::Value::Null,
    };

    let tsfn: ThreadsafeFunction<(Option<String>, String), ErrorStrategy::Fatal> = callback
        .create_threadsafe_function(0, |ctx: ThreadSafeCallContext<(Option<String>, String)>| {
            let err = match ctx.value.0 {
                Some(ref e) => ctx.env.create_string(e)?.into_unknown(),
                None => ctx.env.get_null()?.into_unknown(),
            };
            let data = ctx.env.create_string(&ctx.value.1)?;
            Ok(vec![err, data.into_unknown()])
        })?;

    let current = identity::host_window_id();
    let opts = crate::bus::SendOptions {
        domain: domain.map(DomainPattern::exact),
        timeout: Some(std::time::Duration::from_millis(timeout_ms.unwrap_or(10_000) as u64)),
        fire_and_forget: fire_and_forget.unwrap_or(false),
        strategies: vec![crate::bus::SendStrategy::PostMessage],
    };

    let result = crate::bus::send(WindowId(window), current, &name, data, crate::bus::frame::WindowType::Popup, opts);
    result.on_settle(move |outcome| {
        let (err, data) = match outcome {
            Ok(v) => (None, v),
            Err(e) => (Some(e.to_string()), serde_json::Value::Null),
        };
        let data_json = serde_json::to_string(&data).unwrap_or_else(|_| "null".to_string());
        tsfn.call((err, data_json), ThreadsafeFunctionCallMode::NonBlocking);
    });
    Ok(())
}
