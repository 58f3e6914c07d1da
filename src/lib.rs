#[macro_use]
extern crate napi_derive;

mod api;
mod bus;
mod child;
mod codec;
mod deferred;
mod descriptor;
mod error;
mod events;
mod identity;
mod options;
mod parent;
mod platform;
mod props;
mod runtime;
mod shared;
mod window;
mod window_manager;

// Re-export runtime functions and the component-runtime napi surface so
// napi-derive's codegen picks them all up at the crate root.
pub use runtime::*;
pub use bus::RuntimeConfig;
pub use api::*;

use napi::threadsafe_function::ThreadsafeFunctionCallMode;
use window_manager::{
    is_origin_trusted, with_manager, PENDING_BLURS, PENDING_CLOSES,
    PENDING_FOCUSES, PENDING_MESSAGES, PENDING_MOVES, PENDING_NAVIGATION_BLOCKED,
    PENDING_PAGE_LOADS, PENDING_RELOADS, PENDING_RESIZE_CALLBACKS, PENDING_TITLE_CHANGES,
};

/// Initialize the native window system. Must be called once before creating
/// any windows. `config` tunes the message bus (ack/response timeouts,
/// dedup ring capacity, log level) — omit it to keep the defaults.
#[napi]
pub fn init(config: Option<RuntimeConfig>) -> napi::Result<()> {
    let first_init = with_manager(|mgr| {
        if mgr.initialized {
            return Ok(false);
        }

        mgr.platform = Some(platform::Platform::new()?);
        mgr.initialized = true;
        Ok(true)
    })?;

    if first_init {
        // Every outgoing bus frame is stamped with this process's own
        // origin; the custom-protocol URL windows load `loadHtml()` content
        // under is the closest native analogue the host process has to a
        // document origin.
        bus::configure(
            platform::custom_protocol_url(),
            std::rc::Rc::new(bus::WebviewTransport),
        );
    }

    if let Some(config) = config {
        bus::apply_runtime_config(&config);
    }

    Ok(())
}

/// Process pending native UI events and execute queued commands.
/// Call this periodically (e.g., every 16ms via setInterval) to keep
/// the native windows responsive.
///
/// Uses a split-borrow approach: platform + event_handlers are temporarily
/// extracted from MANAGER so that event callbacks fired during command
/// processing and event loop pumping can access MANAGER if needed.
#[napi]
pub fn pump_events() -> napi::Result<()> {
    // Phase 1: drain commands and temporarily extract state
    let (commands, mut platform, mut event_handlers) = with_manager(|mgr| {
        if !mgr.initialized {
            return Err(napi::Error::from_reason(
                "Native window system not initialized. Call init() first.",
            ));
        }
        Ok((
            mgr.drain_commands(),
            mgr.platform.take(),
            std::mem::take(&mut mgr.event_handlers),
        ))
    })?;

    // Phase 2: process commands + pump OS events (MANAGER not borrowed)
    let result = if let Some(ref mut plat) = platform {
        let mut first_err: Option<napi::Error> = None;
        for cmd in commands {
            if let Err(e) = plat.process_command(cmd, &mut event_handlers) {
                eprintln!("[native-window] Command failed: {}", e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
                // Continue processing remaining commands
            }
        }

        plat.pump_events();
        plat.destroy_pending_closes();

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    } else {
        Ok(())
    };

    // Phase 3: put state back and flush deferred callbacks
    with_manager(|mgr| {
        mgr.platform = platform;
        mgr.event_handlers = event_handlers;

        flush_pending_callbacks(&mgr.event_handlers);
    });

    result
}

/// Flush all pending callback buffers that were deferred during pump_events.
fn flush_pending_callbacks(
    event_handlers: &std::collections::HashMap<u32, crate::events::WindowEventHandlers>,
) {
    // Flush any IPC messages that were deferred during pump_events. Every
    // inbound message is offered to the message bus first (it silently
    // ignores anything that isn't a `__postRobot__` envelope); it is also
    // forwarded to the host's raw `on_message` callback so the native-window
    // IPC primitive stays usable on its own.
    let pending: Vec<(u32, String, String)> =
        PENDING_MESSAGES.with(|p| std::mem::take(&mut *p.borrow_mut()));
    for (window_id, message, source_url) in pending {
        // Re-check trusted origins for deferred messages
        let trusted = is_origin_trusted(window_id, &source_url);
        if !trusted {
            continue;
        }
        let current = crate::identity::host_window_id();
        let peer = crate::identity::WindowId(window_id);
        let origin = crate::window_manager::extract_origin(&source_url).unwrap_or(source_url.clone());
        crate::bus::receive(current, peer, &origin, &message);

        if let Some(handlers) = event_handlers.get(&window_id) {
            if let Some(ref cb) = handlers.on_message {
                cb.call((message, source_url), ThreadsafeFunctionCallMode::NonBlocking);
            }
        }
    }

    // Flush any close events that were deferred during pump_events. Each
    // closed window is also detached from the message bus and the identity
    // registry, matching `cleanUpWindow` being called "when the core
    // detects the peer has closed" (spec.md §4.3 "Cleanup").
    let pending_closes: Vec<u32> =
        PENDING_CLOSES.with(|p| std::mem::take(&mut *p.borrow_mut()));
    for window_id in pending_closes {
        let win = crate::identity::WindowId(window_id);
        crate::bus::clean_up_window(win);
        crate::identity::mark_closed(win);

        if let Some(handlers) = event_handlers.get(&window_id) {
            if let Some(ref cb) = handlers.on_close {
                cb.call((), ThreadsafeFunctionCallMode::NonBlocking);
            }
        }
    }

    // Flush any reload events that were deferred during pump_events (keyboard shortcuts)
    let pending_reloads: Vec<u32> =
        PENDING_RELOADS.with(|p| std::mem::take(&mut *p.borrow_mut()));
    for window_id in pending_reloads {
        if let Some(handlers) = event_handlers.get(&window_id) {
            if let Some(ref cb) = handlers.on_reload {
                cb.call((), ThreadsafeFunctionCallMode::NonBlocking);
            }
        }
    }

    // Flush any resize callback events that were deferred during pump_events
    let pending_resize_cbs: Vec<(u32, f64, f64)> =
        PENDING_RESIZE_CALLBACKS.with(|p| std::mem::take(&mut *p.borrow_mut()));
    for (window_id, width, height) in pending_resize_cbs {
        if let Some(handlers) = event_handlers.get(&window_id) {
            if let Some(ref cb) = handlers.on_resize {
                cb.call((width, height), ThreadsafeFunctionCallMode::NonBlocking);
            }
        }
    }

    // Flush any move callback events that were deferred during pump_events
    let pending_moves: Vec<(u32, f64, f64)> =
        PENDING_MOVES.with(|p| std::mem::take(&mut *p.borrow_mut()));
    for (window_id, x, y) in pending_moves {
        if let Some(handlers) = event_handlers.get(&window_id) {
            if let Some(ref cb) = handlers.on_move {
                cb.call((x, y), ThreadsafeFunctionCallMode::NonBlocking);
            }
        }
    }

    // Flush any focus events that were deferred during pump_events
    let pending_focuses: Vec<u32> =
        PENDING_FOCUSES.with(|p| std::mem::take(&mut *p.borrow_mut()));
    for window_id in pending_focuses {
        if let Some(handlers) = event_handlers.get(&window_id) {
            if let Some(ref cb) = handlers.on_focus {
                cb.call((), ThreadsafeFunctionCallMode::NonBlocking);
            }
        }
    }

    // Flush any blur events that were deferred during pump_events
    let pending_blurs: Vec<u32> =
        PENDING_BLURS.with(|p| std::mem::take(&mut *p.borrow_mut()));
    for window_id in pending_blurs {
        if let Some(handlers) = event_handlers.get(&window_id) {
            if let Some(ref cb) = handlers.on_blur {
                cb.call((), ThreadsafeFunctionCallMode::NonBlocking);
            }
        }
    }

    // Flush any page load events that were deferred during pump_events
    let pending_page_loads: Vec<(u32, String, String)> =
        PENDING_PAGE_LOADS.with(|p| std::mem::take(&mut *p.borrow_mut()));
    for (window_id, event_type, url) in pending_page_loads {
        if let Some(handlers) = event_handlers.get(&window_id) {
            if let Some(ref cb) = handlers.on_page_load {
                cb.call(
                    (event_type, url),
                    ThreadsafeFunctionCallMode::NonBlocking,
                );
            }
        }
    }

    // Flush any navigation-blocked events that were deferred during pump_events
    let pending_nav_blocked: Vec<(u32, String)> =
        PENDING_NAVIGATION_BLOCKED.with(|p| std::mem::take(&mut *p.borrow_mut()));
    for (window_id, url) in pending_nav_blocked {
        if let Some(handlers) = event_handlers.get(&window_id) {
            if let Some(ref cb) = handlers.on_navigation_blocked {
                cb.call(url, ThreadsafeFunctionCallMode::NonBlocking);
            }
        }
    }

    // Flush any title change events that were deferred during pump_events
    let pending_titles: Vec<(u32, String)> =
        PENDING_TITLE_CHANGES.with(|p| std::mem::take(&mut *p.borrow_mut()));
    for (window_id, title) in pending_titles {
        if let Some(handlers) = event_handlers.get(&window_id) {
            if let Some(ref cb) = handlers.on_title_changed {
                cb.call(title, ThreadsafeFunctionCallMode::NonBlocking);
            }
        }
    }

    // Advance the bus's own timers (ACK/response deadlines, component load
    // timeouts, parent-closed detection) — the "safe interval" pattern
    // (spec.md §5) riding on this same per-tick pump rather than a host
    // timer of its own.
    let now = std::time::Instant::now();
    crate::bus::pump(now);
    crate::parent::pump_load_timeouts(now);
    crate::child::pump_parent_watch();
}
