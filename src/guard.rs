//! Reentrancy guard and interception entry points
//!
//! Detection runs only on threads that are servicing a tracked request
//! (between [`Guard::enter_request`] and [`Guard::exit_request`]) and only
//! while the agent is globally enabled. While a check runs, detection is
//! switched off for the thread so the detectors' own file and SQL
//! operations are not intercepted again.
//!
//! The per-thread flag and request context live in thread-local storage.
//! Host worker threads are pooled, so `exit_request` must be called when
//! a request finishes; nothing is cleaned up at thread exit.

use crate::alert::{AlertAssembler, AlertSink};
use crate::config::ConfigStore;
use crate::context::{HttpRequest, HttpResponse, RequestContext};
use crate::dispatch::Dispatcher;
use crate::error::SecurityBlock;
use crate::response::BlockResponder;
use crate::types::{Action, CheckParams, CheckRequest, DetectionOutcome};
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Product identifier stamped on every tracked response
pub const PROTECTED_BY_HEADER: &str = "X-Protected-By";
pub const PROTECTED_BY_VALUE: &str = "a3s-rasp";
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

thread_local! {
    static LOCALLY_ENABLED: Cell<bool> = const { Cell::new(false) };
    static CURRENT_REQUEST: RefCell<Option<RequestContext>> = const { RefCell::new(None) };
}

/// Whether detection is on for the current thread
pub fn is_locally_enabled() -> bool {
    LOCALLY_ENABLED.with(Cell::get)
}

/// Id of the request the current thread is servicing
pub fn current_request_id() -> Option<String> {
    CURRENT_REQUEST.with(|cell| {
        cell.try_borrow()
            .ok()
            .and_then(|current| current.as_ref().map(|ctx| ctx.id().to_string()))
    })
}

/// Switches detection off for the current thread until dropped
///
/// The previous state is restored on drop, including during unwinding.
#[must_use = "detection is re-enabled as soon as the guard is dropped"]
pub struct ShieldGuard {
    previous: bool,
    // Thread-local state: the guard must be dropped on the thread that made it
    _not_send: PhantomData<*const ()>,
}

impl ShieldGuard {
    pub fn new() -> Self {
        Self {
            previous: LOCALLY_ENABLED.with(|flag| flag.replace(false)),
            _not_send: PhantomData,
        }
    }
}

impl Default for ShieldGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShieldGuard {
    fn drop(&mut self) {
        LOCALLY_ENABLED.with(|flag| flag.set(self.previous));
    }
}

/// Run `op` with detection switched off for the current thread
pub fn shield<T>(op: impl FnOnce() -> T) -> T {
    let _shield = ShieldGuard::new();
    op()
}

/// Non-blocking result of a check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Detection was off for this thread or for the agent
    Skipped,
    /// A request was already active on this thread; the entry was ignored
    Nested,
    /// Checks ran and nothing was reported
    Allowed,
    /// At least one check asked for the operation to be logged
    Logged,
}

/// Gate between interception points and the detection pipeline
pub struct Guard {
    enabled: AtomicBool,
    config: Arc<ConfigStore>,
    dispatcher: Dispatcher,
    assembler: AlertAssembler,
    sink: Arc<dyn AlertSink>,
    responder: BlockResponder,
}

impl Guard {
    /// Starts globally disabled
    pub fn new(
        config: Arc<ConfigStore>,
        dispatcher: Dispatcher,
        sink: Arc<dyn AlertSink>,
        responder: BlockResponder,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            assembler: AlertAssembler::new(Arc::clone(&config)),
            config,
            dispatcher,
            sink,
            responder,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Checks that already passed the gate are not affected
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn responder(&self) -> &BlockResponder {
        &self.responder
    }

    /// Start tracking a request on the current thread
    ///
    /// Returns [`Disposition::Nested`] without doing anything while a
    /// request is already active. Otherwise stamps the product and
    /// request-id headers on the response and runs a `request-entry`
    /// check, which may block the request.
    pub fn enter_request(
        &self,
        request: Box<dyn HttpRequest>,
        response: Option<Box<dyn HttpResponse>>,
    ) -> Result<Disposition, SecurityBlock> {
        let body_max_bytes = self.config.snapshot().body_max_bytes;
        let entered = CURRENT_REQUEST.with(|cell| {
            let Ok(mut current) = cell.try_borrow_mut() else {
                return false;
            };
            if current.is_some() {
                return false;
            }
            let mut ctx = RequestContext::new(request, response, body_max_bytes);
            let id = ctx.id().to_string();
            if let Some(response) = ctx.response_mut() {
                response.set_header(PROTECTED_BY_HEADER, PROTECTED_BY_VALUE);
                response.set_header(REQUEST_ID_HEADER, &id);
            }
            *current = Some(ctx);
            true
        });
        if !entered {
            return Ok(Disposition::Nested);
        }

        LOCALLY_ENABLED.with(|flag| flag.set(true));
        tracing::trace!(request_id = %current_request_id().unwrap_or_default(), "Request entered");
        self.check(CheckParams::RequestEntry)
    }

    /// Stop tracking the current thread's request
    pub fn exit_request(&self) {
        LOCALLY_ENABLED.with(|flag| flag.set(false));
        let ctx = CURRENT_REQUEST.with(|cell| cell.try_borrow_mut().ok().and_then(|mut c| c.take()));
        if let Some(ctx) = ctx {
            tracing::trace!(request_id = ctx.id(), "Request exited");
        }
    }

    /// Capture request body bytes as the host reads them
    ///
    /// `offset` and `len` are clamped to `buf`.
    pub fn on_body_bytes_read(&self, buf: &[u8], offset: usize, len: usize) {
        let start = offset.min(buf.len());
        let end = start.saturating_add(len).min(buf.len());
        CURRENT_REQUEST.with(|cell| {
            if let Ok(mut current) = cell.try_borrow_mut() {
                if let Some(ctx) = current.as_mut() {
                    ctx.append_body(&buf[start..end]);
                }
            }
        });
    }

    /// The host has parsed request parameters; they are now safe to read
    pub fn on_parameter_access_enabled(&self) {
        CURRENT_REQUEST.with(|cell| {
            if let Ok(mut current) = cell.try_borrow_mut() {
                if let Some(ctx) = current.as_mut() {
                    ctx.set_can_get_parameter(true);
                }
            }
        });
    }

    /// The host is about to close the current response's output stream
    ///
    /// Appends the custom block page fragment to HTML responses whose
    /// request URL starts with `inject.urlprefix`. Returns whether
    /// anything was written.
    pub fn on_response_close(&self) -> bool {
        if !self.is_enabled() || !is_locally_enabled() {
            return false;
        }
        let _shield = ShieldGuard::new();
        let prefix = self.config.snapshot().inject_url_prefix.clone();
        if prefix.is_empty() {
            return false;
        }
        let Some(fragment) = self.responder.page().content().filter(|f| !f.is_empty()) else {
            return false;
        };

        CURRENT_REQUEST.with(|cell| {
            let Ok(mut current) = cell.try_borrow_mut() else {
                return false;
            };
            let Some(ctx) = current.as_mut() else {
                return false;
            };
            let under_prefix = ctx
                .request()
                .request_url()
                .is_some_and(|url| url.starts_with(&prefix));
            if !under_prefix {
                return false;
            }
            let id = ctx.id().to_string();
            let Some(response) = ctx.response_mut() else {
                return false;
            };
            let is_html = response
                .content_type()
                .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"));
            if !is_html {
                return false;
            }
            response.send_content(&fragment);
            tracing::debug!(request_id = %id, "Custom fragment appended to response");
            true
        })
    }

    /// Check one intercepted operation of the current request
    ///
    /// On a block verdict the block page is written to the response before
    /// `Err(SecurityBlock)` is returned.
    pub fn check(&self, params: CheckParams) -> Result<Disposition, SecurityBlock> {
        if !self.is_enabled() || !is_locally_enabled() {
            return Ok(Disposition::Skipped);
        }
        let _shield = ShieldGuard::new();
        self.run(params, true)
    }

    /// Check an operation outside any request, such as a startup baseline
    pub fn check_without_request(&self, params: CheckParams) -> Result<Disposition, SecurityBlock> {
        if !self.is_enabled() {
            return Ok(Disposition::Skipped);
        }
        let _shield = ShieldGuard::new();
        self.run(params, false)
    }

    fn run(&self, params: CheckParams, with_request: bool) -> Result<Disposition, SecurityBlock> {
        let detection_type = params.detection_type();

        let outcome = CURRENT_REQUEST.with(|cell| {
            let current = cell.try_borrow().ok();
            let ctx = if with_request {
                current.as_deref().and_then(Option::as_ref)
            } else {
                None
            };
            let request = CheckRequest::new(params, ctx);

            let outcome = match catch_unwind(AssertUnwindSafe(|| self.dispatcher.dispatch(&request))) {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(detection_type = %detection_type, "Detection panicked");
                    DetectionOutcome::empty(detection_type)
                }
            };
            self.report(&request, &outcome);
            (outcome, ctx.map(|c| c.id().to_string()))
        });
        let (outcome, request_id) = outcome;

        let Some(verdict) = outcome.blocking() else {
            return Ok(match outcome.action() {
                Action::Log => Disposition::Logged,
                _ => Disposition::Allowed,
            });
        };

        if with_request {
            self.send_block_page();
        }
        tracing::warn!(
            detection_type = %detection_type,
            request_id = request_id.as_deref().unwrap_or(""),
            plugin = %verdict.source.plugin_name(),
            "Operation blocked"
        );
        Err(SecurityBlock {
            request_id,
            detection_type,
            plugin: verdict.source.plugin_name(),
            message: verdict.message.clone(),
        })
    }

    fn report(&self, request: &CheckRequest<'_>, outcome: &DetectionOutcome) {
        for verdict in outcome.reportable() {
            let emitted = catch_unwind(AssertUnwindSafe(|| {
                let record = self.assembler.assemble(request, verdict);
                self.sink.emit(&record);
            }));
            if emitted.is_err() {
                tracing::error!(detection_type = %request.detection_type, "Alert emission panicked");
            }
        }
    }

    fn send_block_page(&self) {
        CURRENT_REQUEST.with(|cell| {
            let Ok(mut current) = cell.try_borrow_mut() else {
                return;
            };
            let Some(ctx) = current.as_mut() else {
                return;
            };
            if catch_unwind(AssertUnwindSafe(|| self.responder.send_block(ctx))).is_err() {
                tracing::error!(request_id = ctx.id(), "Writing block page panicked");
            }
        });
    }
}
