/// Cross-platform window + webview backend using tao (windowing) and wry
/// (webview), shared across macOS, Windows, and Linux.
use std::collections::HashMap;

use tao::dpi::{LogicalPosition, LogicalSize};
use tao::event::{Event, WindowEvent};
use tao::event_loop::{ControlFlow, EventLoop};
use tao::platform::run_return::EventLoopExtRunReturn;
use tao::window::{Window, WindowBuilder};

#[cfg(target_os = "linux")]
use wry::WebViewBuilderExtUnix;
#[cfg(target_os = "windows")]
use wry::WebViewBuilderExtWindows;
use wry::{WebView, WebViewBuilder};

use crate::events::WindowEventHandlers;
use crate::options::WindowOptions;
use crate::window_manager::{
    is_host_allowed, is_origin_trusted, Command, EVENT_LOOP, PENDING_BLURS, PENDING_CLOSES,
    PENDING_FOCUSES, PENDING_MESSAGES, PENDING_MOVES, PENDING_NAVIGATION_BLOCKED,
    PENDING_PAGE_LOADS, PENDING_RESIZE_CALLBACKS, PENDING_TITLE_CHANGES,
};

/// Maximum IPC message size (10 MB).
const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Maximum pending IPC messages per window before new messages are dropped.
const MAX_PENDING_MESSAGES_PER_WINDOW: usize = 10_000;

/// Maximum queued OS-event callbacks of any one kind before new ones are
/// dropped (applies to resize/move/focus/page-load/etc buffers).
const MAX_PENDING_EVENTS: usize = 10_000;

/// Push an item to a thread-local pending buffer, enforcing MAX_PENDING_EVENTS.
/// Silently drops the item (with a one-time warning) if the buffer is full.
macro_rules! capped_push {
    ($tls:ident, $item:expr, $label:expr) => {
        $tls.with(|p| {
            let mut buf = p.borrow_mut();
            if buf.len() >= MAX_PENDING_EVENTS {
                if buf.len() == MAX_PENDING_EVENTS {
                    eprintln!(
                        "[native-window] {} buffer full ({} entries), dropping events.",
                        $label, MAX_PENDING_EVENTS
                    );
                }
                return;
            }
            buf.push($item);
        });
    };
}

/// URL for the custom protocol handler that serves `loadHtml()` content.
///
/// On Windows, `with_https_scheme(true)` maps the custom protocol to
/// `https://nativewindow.localhost/`, and wry's `load_url()` does not
/// perform that translation at runtime — only the builder's `with_url()`
/// does — so the HTTPS-mapped form must be used directly there.
pub(crate) fn custom_protocol_url() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "https://nativewindow.localhost/"
    }
    #[cfg(not(target_os = "windows"))]
    {
        "nativewindow://localhost/"
    }
}

// ── Types ──────────────────────────────────────────────────────

/// A window + webview pair managed by the platform.
struct WindowEntry {
    window: Window,
    webview: WebView,
}

/// Unified platform state backed by tao + wry.
pub struct Platform {
    windows: HashMap<u32, WindowEntry>,
    /// Reverse map: tao WindowId → our u32 window ID.
    window_id_map: HashMap<tao::window::WindowId, u32>,
}

// ── Platform initialization ────────────────────────────────────

impl Platform {
    /// Create a new platform instance and initialize the tao event loop.
    pub fn new() -> napi::Result<Self> {
        let event_loop = EventLoop::new();
        #[cfg(target_os = "macos")]
        setup_macos_menu();
        EVENT_LOOP.with(|el| {
            *el.borrow_mut() = Some(event_loop);
        });

        Ok(Self {
            windows: HashMap::new(),
            window_id_map: HashMap::new(),
        })
    }

    // ── Command processing ─────────────────────────────────────

    /// Process a single command from the command queue.
    pub fn process_command(
        &mut self,
        cmd: Command,
        _event_handlers: &mut HashMap<u32, WindowEventHandlers>,
    ) -> napi::Result<()> {
        match cmd {
            Command::CreateWindow { id, options } => {
                self.create_window(id, &options)?;
            }
            Command::LoadURL { id, url } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry
                        .webview
                        .load_url(&url)
                        .map_err(|e| napi::Error::from_reason(format!("load_url failed: {}", e)))?;
                    crate::window_manager::remove_html_content(id);
                }
            }
            Command::LoadHTML { id, html } => {
                if let Some(entry) = self.windows.get(&id) {
                    // Store HTML for the custom protocol handler, then navigate
                    // to the custom protocol URL which triggers the handler.
                    // This gives the page a proper origin (secure context) and
                    // makes Cmd+R / browser-native reload work correctly.
                    crate::window_manager::set_html_content(id, html);
                    entry.webview.load_url(custom_protocol_url()).map_err(|e| {
                        napi::Error::from_reason(format!("load_url (html) failed: {}", e))
                    })?;
                }
            }
            Command::EvaluateJS { id, script } => {
                if let Some(entry) = self.windows.get(&id) {
                    let _ = entry.webview.evaluate_script(&script);
                }
            }
            Command::SetTitle { id, title } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.set_title(&title);
                }
            }
            Command::SetSize { id, width, height } => {
                if let Some(entry) = self.windows.get(&id) {
                    let _ = entry.window.set_inner_size(LogicalSize::new(width, height));
                }
            }
            Command::SetMinSize { id, width, height } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry
                        .window
                        .set_min_inner_size(Some(LogicalSize::new(width, height)));
                }
            }
            Command::SetMaxSize { id, width, height } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry
                        .window
                        .set_max_inner_size(Some(LogicalSize::new(width, height)));
                }
            }
            Command::SetPosition { id, x, y } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.set_outer_position(LogicalPosition::new(x, y));
                }
            }
            Command::SetResizable { id, resizable } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.set_resizable(resizable);
                }
            }
            Command::SetDecorations { id, decorations } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.set_decorations(decorations);
                }
            }
            Command::SetAlwaysOnTop { id, always_on_top } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.set_always_on_top(always_on_top);
                }
            }
            Command::Show { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.set_visible(true);
                }
            }
            Command::Hide { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.set_visible(false);
                }
            }
            Command::Close { id } => {
                self.destroy_window_entry(id);
                // Event handlers are NOT removed here — they are cleaned
                // up after flush_pending_callbacks so the JS on_close
                // callback still fires.
                capped_push!(PENDING_CLOSES, id, "PENDING_CLOSES");
            }
            Command::Focus { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.set_focus();
                }
            }
            Command::Maximize { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.set_maximized(true);
                }
            }
            Command::Minimize { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.set_minimized(true);
                }
            }
            Command::Unmaximize { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.set_maximized(false);
                }
            }
            Command::Reload { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    // Custom protocol makes reload() work for both URL and
                    // HTML content — HTML pages live at nativewindow://localhost/
                    // so reload re-requests the protocol handler.
                    if let Err(e) = entry.webview.reload() {
                        eprintln!("[native-window] Reload failed: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    // ── Window destruction ──────────────────────────────────────

    /// Remove and destroy a window's native resources (tao Window + wry
    /// WebView) and clean up associated platform state. Does NOT touch
    /// `event_handlers` — those must survive until after
    /// `flush_pending_callbacks` so the JS `on_close` callback still fires.
    ///
    /// Returns `true` if the window existed and was destroyed.
    fn destroy_window_entry(&mut self, id: u32) -> bool {
        if let Some(entry) = self.windows.remove(&id) {
            let tao_id = entry.window.id();
            self.window_id_map.remove(&tao_id);
            drop(entry);
            crate::window_manager::TRUSTED_ORIGINS_MAP.with(|o| {
                o.borrow_mut().remove(&id);
            });
            crate::window_manager::ALLOWED_HOSTS_MAP.with(|h| {
                h.borrow_mut().remove(&id);
            });
            crate::window_manager::remove_html_content(id);
            true
        } else {
            false
        }
    }

    /// Destroy native resources for windows that received an OS-initiated
    /// `CloseRequested` but weren't already destroyed by `Command::Close`.
    pub fn destroy_pending_closes(&mut self) {
        PENDING_CLOSES.with(|p| {
            let pending = p.borrow();
            for &id in pending.iter() {
                // No-op if already destroyed by Command::Close
                self.destroy_window_entry(id);
            }
        });
    }

    // ── Window creation ────────────────────────────────────────

    /// Create a new tao window + wry webview.
    fn create_window(&mut self, id: u32, options: &WindowOptions) -> napi::Result<()> {
        EVENT_LOOP.with(|el| {
            let el_ref = el.borrow();
            let event_loop = el_ref
                .as_ref()
                .ok_or_else(|| napi::Error::from_reason("Event loop not initialized"))?;

            // ── Build the tao window ───────────────────────────
            let width = options.width.unwrap_or(800.0);
            let height = options.height.unwrap_or(600.0);

            let mut win_builder = WindowBuilder::new()
                .with_title(options.title.as_deref().unwrap_or(""))
                .with_inner_size(LogicalSize::new(width, height))
                .with_resizable(options.resizable.unwrap_or(true))
                .with_decorations(options.decorations.unwrap_or(true))
                .with_always_on_top(options.always_on_top.unwrap_or(false))
                .with_visible(options.visible.unwrap_or(true));

            if let (Some(x), Some(y)) = (options.x, options.y) {
                win_builder = win_builder.with_position(LogicalPosition::new(x, y));
            }
            if let (Some(min_w), Some(min_h)) = (options.min_width, options.min_height) {
                win_builder = win_builder.with_min_inner_size(LogicalSize::new(min_w, min_h));
            }
            if let (Some(max_w), Some(max_h)) = (options.max_width, options.max_height) {
                win_builder = win_builder.with_max_inner_size(LogicalSize::new(max_w, max_h));
            }
            if options.transparent.unwrap_or(false) {
                win_builder = win_builder.with_transparent(true);
            }

            let window = win_builder
                .build(event_loop)
                .map_err(|e| napi::Error::from_reason(format!("Failed to create window: {}", e)))?;

            // ── Build the wry webview ──────────────────────────
            let window_id = id; // Capture for closures

            let mut wv_builder = WebViewBuilder::new()
                .with_devtools(options.devtools.unwrap_or(false))
                .with_transparent(options.transparent.unwrap_or(false))
                .with_visible(options.visible.unwrap_or(true));

            // IPC handler — receives messages from window.ipc.postMessage().
            // Every message is handed to the component runtime's message bus
            // in `lib.rs`'s flush loop; this handler only buffers it.
            wv_builder = wv_builder.with_ipc_handler(move |req: http::Request<String>| {
                let message = req.body().clone();
                if message.len() > MAX_MESSAGE_SIZE {
                    return;
                }
                let source_url = req.uri().to_string();

                if !is_origin_trusted(window_id, &source_url) {
                    return;
                }

                PENDING_MESSAGES.with(|p| {
                    let mut buf = p.borrow_mut();
                    let count = buf.iter().filter(|(id, _, _)| *id == window_id).count();
                    if count >= MAX_PENDING_MESSAGES_PER_WINDOW {
                        eprintln!(
                            "[native-window] Window {}: pending IPC message cap ({}) reached, dropping message.",
                            window_id, MAX_PENDING_MESSAGES_PER_WINDOW
                        );
                        return;
                    }
                    buf.push((window_id, message, source_url));
                });
            });

            // Navigation handler — block dangerous schemes + enforce allowedHosts.
            wv_builder = wv_builder.with_navigation_handler(move |url: String| {
                let lower = url.to_lowercase();
                // Always allow our custom protocol for HTML content.
                if lower.starts_with("nativewindow:") {
                    return true;
                }
                if let Ok(parsed) = url::Url::parse(&url) {
                    if parsed.host_str() == Some("nativewindow.localhost") {
                        return true;
                    }
                }
                if lower.starts_with("javascript:")
                    || lower.starts_with("file:")
                    || lower.starts_with("data:")
                    || lower.starts_with("blob:")
                {
                    return false;
                }
                if !is_host_allowed(window_id, &url) {
                    capped_push!(PENDING_NAVIGATION_BLOCKED, (window_id, url), "PENDING_NAVIGATION_BLOCKED");
                    return false;
                }
                true
            });

            // Page load handler — fires on navigation start and finish.
            wv_builder = wv_builder.with_on_page_load_handler(move |event, url| {
                let event_str = match event {
                    wry::PageLoadEvent::Started => "started".to_string(),
                    wry::PageLoadEvent::Finished => "finished".to_string(),
                };
                capped_push!(PENDING_PAGE_LOADS, (window_id, event_str, url), "PENDING_PAGE_LOADS");
            });

            // Title changed handler.
            wv_builder = wv_builder.with_document_title_changed_handler(move |title| {
                capped_push!(PENDING_TITLE_CHANGES, (window_id, title), "PENDING_TITLE_CHANGES");
            });

            // Custom protocol handler — serves stored HTML content at
            // nativewindow://localhost/. Gives HTML pages a proper origin
            // (secure context) and makes native reload work.
            wv_builder = wv_builder.with_custom_protocol("nativewindow".into(), move |_webview_id, _request| {
                let html = crate::window_manager::get_html_content(window_id).unwrap_or_default();
                http::Response::builder()
                    .header("Content-Type", "text/html; charset=utf-8")
                    .header("Cache-Control", "no-store")
                    .body(std::borrow::Cow::Owned(html.into_bytes()))
                    .unwrap_or_else(|_| {
                        http::Response::builder()
                            .body(std::borrow::Cow::Owned(Vec::new()))
                            .expect("empty fallback response")
                    })
            });

            // Block popups (window.open).
            wv_builder = wv_builder.with_new_window_req_handler(move |_url, _features| {
                wry::NewWindowResponse::Deny
            });

            // On Windows, map the custom protocol to https:// for secure context.
            #[cfg(target_os = "windows")]
            {
                wv_builder = wv_builder.with_https_scheme(true);
            }

            #[cfg(target_os = "linux")]
            let webview = {
                use tao::platform::unix::WindowExtUnix;
                let gtk_window = window.gtk_window();
                wv_builder
                    .build_gtk(gtk_window)
                    .map_err(|e| napi::Error::from_reason(format!("Failed to create webview: {}", e)))?
            };

            #[cfg(not(target_os = "linux"))]
            let webview = wv_builder
                .build(&window)
                .map_err(|e| napi::Error::from_reason(format!("Failed to create webview: {}", e)))?;

            let tao_window_id = window.id();
            self.window_id_map.insert(tao_window_id, id);
            self.windows.insert(id, WindowEntry { window, webview });

            Ok(())
        })
    }

    // ── Event loop pumping ─────────────────────────────────────

    /// Pump the tao event loop (non-blocking). Processes all pending OS
    /// events and pushes them to the PENDING_* deferred callback buffers.
    pub fn pump_events(&mut self) {
        EVENT_LOOP.with(|el| {
            let mut event_loop_opt = el.borrow_mut().take();
            if let Some(ref mut event_loop) = event_loop_opt {
                let window_id_map = &self.window_id_map;
                let windows = &self.windows;

                event_loop.run_return(|event, _target, control_flow| {
                    // Non-blocking regardless of any stale ControlFlow
                    // persisted in tao's global Handler.
                    *control_flow = ControlFlow::Poll;

                    match event {
                        Event::WindowEvent {
                            window_id,
                            event: ref win_event,
                            ..
                        } => {
                            if let Some(&id) = window_id_map.get(&window_id) {
                                match win_event {
                                    WindowEvent::Resized(size) => {
                                        let scale = windows
                                            .get(&id)
                                            .map(|e| e.window.scale_factor())
                                            .unwrap_or(1.0);
                                        let logical: LogicalSize<f64> = size.to_logical(scale);
                                        capped_push!(
                                            PENDING_RESIZE_CALLBACKS,
                                            (id, logical.width, logical.height),
                                            "PENDING_RESIZE_CALLBACKS"
                                        );
                                    }
                                    WindowEvent::Moved(pos) => {
                                        let scale = windows
                                            .get(&id)
                                            .map(|e| e.window.scale_factor())
                                            .unwrap_or(1.0);
                                        let logical: LogicalPosition<f64> = pos.to_logical(scale);
                                        capped_push!(
                                            PENDING_MOVES,
                                            (id, logical.x, logical.y),
                                            "PENDING_MOVES"
                                        );
                                    }
                                    WindowEvent::Focused(focused) => {
                                        if *focused {
                                            capped_push!(PENDING_FOCUSES, id, "PENDING_FOCUSES");
                                        } else {
                                            capped_push!(PENDING_BLURS, id, "PENDING_BLURS");
                                        }
                                    }
                                    WindowEvent::CloseRequested => {
                                        capped_push!(PENDING_CLOSES, id, "PENDING_CLOSES");
                                    }
                                    _ => {}
                                }
                            }
                        }
                        Event::MainEventsCleared => {
                            *control_flow = ControlFlow::Exit;
                        }
                        _ => {}
                    }
                });
            }
            *el.borrow_mut() = event_loop_opt;
        });
    }
}

// ── macOS Edit menu setup ──────────────────────────────────────

/// On macOS, set up the Edit menu so standard keyboard shortcuts
/// (Cmd+C, Cmd+V, Cmd+X, Cmd+A, Cmd+Z) work in the webview.
/// Tao creates the NSApplication but doesn't add an Edit menu.
#[cfg(target_os = "macos")]
fn setup_macos_menu() {
    // TODO: tao 0.34 removed its menu API. To restore the Edit menu
    // (Cmd+C/V/X/A/Z) in the webview, add objc2-app-kit as a
    // macOS-only dependency and create the NSMenu directly.
}
