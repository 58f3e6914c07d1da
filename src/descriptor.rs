//! Component descriptor (C5, spec.md §4.5).
//!
//! `create(options)` validates and registers a component under a tag; if
//! the current window turns out to be a child context for that tag
//! (detected via [`crate::codec`]), a child controller is instantiated
//! immediately and bound to a well-known slot.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::child::ChildController;
use crate::codec;
use crate::error::RuntimeError;
use crate::identity::{Context, DomainPattern, WindowId};
use crate::props::PropSchema;

/// Which rendering contexts a component allows (spec.md §4.5, §6
/// "Context-aware variants validate the `contexts` allowlist").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedContext {
    Iframe,
    Popup,
}

/// How a component's domain is resolved for a given environment/URL
/// (spec.md §4.5 `getDomain`).
#[derive(Clone)]
pub enum DomainSpec {
    Literal(DomainPattern),
    ByEnv(HashMap<String, DomainPattern>),
}

pub struct ComponentOptions {
    pub tag: String,
    pub url: DomainSpec,
    pub dimensions: Option<(u32, u32)>,
    pub contexts: Vec<AllowedContext>,
    pub allowed_parent_domains: DomainPattern,
    pub props: PropSchema,
    pub default_context: AllowedContext,
}

pub struct ComponentDescriptor {
    pub options: ComponentOptions,
}

thread_local! {
    static REGISTRY: RefCell<HashMap<String, Rc<ComponentDescriptor>>> = RefCell::new(HashMap::new());
    static ACTIVE_CHILD: RefCell<Option<Rc<ChildController>>> = RefCell::new(None);
}

fn validate_tag(tag: &str) -> Result<(), RuntimeError> {
    if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(RuntimeError::Validation { prop: "tag".into(), reason: format!("`{tag}` is not a valid component tag") });
    }
    Ok(())
}

/// Validate `options` (tag shape, URL/env consistency, allowed contexts),
/// register the descriptor globally, and — if the current window is a
/// decoded child context of this tag — immediately instantiate and bind a
/// child controller (spec.md §4.5).
pub fn create(
    options: ComponentOptions,
    current_window: WindowId,
    window_name: Option<&str>,
) -> Result<Rc<ComponentDescriptor>, RuntimeError> {
    validate_tag(&options.tag)?;
    if options.contexts.is_empty() {
        return Err(RuntimeError::Validation { prop: "contexts".into(), reason: "component declares no allowed contexts".into() });
    }

    let descriptor = Rc::new(ComponentDescriptor { options });
    REGISTRY.with(|r| r.borrow_mut().insert(descriptor.options.tag.clone(), descriptor.clone()));

    if let Some(name) = window_name {
        if let Some(child_desc) = codec::decode(name) {
            if child_desc.tag == descriptor.options.tag {
                let controller = Rc::new(ChildController::instantiate(descriptor.clone(), child_desc, current_window)?);
                crate::child::register_instance(controller.clone());
                ACTIVE_CHILD.with(|c| *c.borrow_mut() = Some(controller));
            }
        }
    }

    install_delegate_listener(&descriptor);
    Ok(descriptor)
}

/// Look up a previously-created descriptor by tag (spec.md §6 `getByTag`).
pub fn get_by_tag(tag: &str) -> Option<Rc<ComponentDescriptor>> {
    REGISTRY.with(|r| r.borrow().get(tag).cloned())
}

/// The child controller bound during `create`, if this window turned out
/// to be a child context. `attach()` in the public API surfaces this,
/// throwing if absent (spec.md §6 "attach() ... throws if not running as a
/// child").
pub fn active_child() -> Option<Rc<ChildController>> {
    ACTIVE_CHILD.with(|c| c.borrow().clone())
}

impl ComponentDescriptor {
    /// Resolve the child domain for a render: literal domain pattern, or a
    /// per-environment table indexed by `env` (spec.md §4.5 `getDomain`
    /// steps a/b; steps c/d — extracting from a supplied URL — are the
    /// render pipeline's job in [`crate::parent`] since only it sees the
    /// final built URL).
    pub fn resolve_domain(&self, env: Option<&str>) -> Result<DomainPattern, RuntimeError> {
        match &self.options.url {
            DomainSpec::Literal(p) => Ok(p.clone()),
            DomainSpec::ByEnv(map) => {
                let key = env.unwrap_or("production");
                map.get(key)
                    .cloned()
                    .ok_or_else(|| RuntimeError::Validation { prop: "env".into(), reason: format!("no domain configured for env `{key}`") })
            }
        }
    }

    pub fn allows_context(&self, context: Context) -> bool {
        let wanted = match context {
            Context::SubFrame => AllowedContext::Iframe,
            Context::Popup => AllowedContext::Popup,
        };
        self.options.contexts.contains(&wanted)
    }
}

/// Install the `DELEGATE_<name>` listener: on request from a foreign-origin
/// parent, build a delegate controller and hand back its override bundle
/// (spec.md §4.5, §4.7 "Render delegate").
fn install_delegate_listener(descriptor: &Rc<ComponentDescriptor>) {
    let tag = descriptor.options.tag.clone();
    let name = format!("DELEGATE_{tag}");
    let descriptor = descriptor.clone();
    crate::bus::on(
        &name,
        None,
        DomainPattern::Wildcard,
        false,
        Rc::new(move |requester, origin, data| {
            crate::parent::build_delegate_overrides(&descriptor, requester, origin, data)
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_tag() {
        assert!(validate_tag("has spaces").is_err());
        assert!(validate_tag("demo-comp").is_ok());
    }

    #[test]
    fn create_requires_at_least_one_context() {
        let win = crate::identity::register(None, Some("https://a.example".into()), Context::Popup, None);
        let opts = ComponentOptions {
            tag: "demo".into(),
            url: DomainSpec::Literal(DomainPattern::exact("https://b.example")),
            dimensions: None,
            contexts: vec![],
            allowed_parent_domains: DomainPattern::Wildcard,
            props: PropSchema::default(),
            default_context: AllowedContext::Iframe,
        };
        assert!(create(opts, win, None).is_err());
    }
}
