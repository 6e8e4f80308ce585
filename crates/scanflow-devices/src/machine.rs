/*!
 * Scan state machine.
 *
 * Everything here runs on the event-loop thread: operation submission,
 * reply decoding, retry timers, the cancel event and the transitions
 * they drive. The frontend only ever pokes the machine through the
 * compare-and-set in `stm_cancel_req` and observes it through the state
 * atomic and the condition variable.
 */
use std::sync::Arc;

use tracing::{debug, trace};

use scanflow_core::eloop::EloopTimer;
use scanflow_core::types::Status;

use crate::device::{Device, DeviceInner, DeviceState};
use crate::geom;
use crate::http::{HttpError, HttpReply, HttpRequest};
use crate::protocol::{ProtoCtx, ProtoError, ProtoOp, ProtoPayload, ProtoResult, ProtoScanParams};

impl Device {
    /// Run `f` against the bound protocol handler with a freshly
    /// assembled context. Returns `None` when no handler or endpoint is
    /// bound, which callers treat as a hard protocol failure.
    pub(crate) fn with_proto<R>(
        &self,
        inner: &DeviceInner,
        reply: Option<&HttpReply>,
        f: impl FnOnce(&dyn crate::protocol::ProtoHandler, &ProtoCtx<'_>) -> R,
    ) -> Option<R> {
        let proto = inner.proto.as_deref()?;
        let base_uri = inner.base_uri.as_ref()?;
        let ctx = ProtoCtx {
            base_uri,
            location: inner.location.as_deref(),
            params: &inner.wire_params,
            caps: &inner.opt.caps,
            failed_attempt: inner.failed_attempt,
            retry_attempts: self.retry_attempts,
            retry_pause: self.retry_pause,
            checking_http_status: inner.checking_http_status,
            reply,
        };
        Some(f(proto, &ctx))
    }

    /// Cancel pending HTTP activity: the in-flight request and any armed
    /// retry timer
    pub(crate) fn http_cancel(&self) {
        self.http.cancel();
        self.inner.lock().stm_timer = None;
    }

    /// Transport-error callback, installed once capabilities succeeded
    pub(crate) fn http_onerror(self: &Arc<Self>, err: HttpError) {
        debug!(parent: &self.span, "{}", err);
        self.job_set_status(Status::IoError);

        if !self.stm_cancel_perform() {
            self.state_set(DeviceState::Done);
        }
    }

    /// Submit an operation request
    pub(crate) fn proto_op_submit(self: &Arc<Self>, op: ProtoOp) {
        let built = {
            let mut inner = self.inner.lock();
            debug!(parent: &self.span, "submitting: {}", op);
            inner.op_current = op;
            self.with_proto(&inner, None, |proto, ctx| match op {
                ProtoOp::Scan => proto.scan_query(ctx),
                ProtoOp::Load => proto.load_query(ctx),
                ProtoOp::Check => proto.status_query(ctx),
                ProtoOp::Cancel => proto.cancel_query(ctx),
                ProtoOp::Cleanup => proto.cleanup_query(ctx),
                ProtoOp::None | ProtoOp::Finish => Err(ProtoError::Malformed(format!(
                    "operation {} cannot be submitted",
                    op
                ))),
            })
        };

        let request: HttpRequest = match built {
            Some(Ok(request)) => request,
            other => {
                if let Some(Err(err)) = other {
                    debug!(parent: &self.span, "{} query: {}", op, err);
                }
                self.job_set_status(Status::IoError);
                // A failed CANCEL/CLEANUP build must not re-enter the
                // cancel path, or the machine would loop on itself
                if matches!(op, ProtoOp::Cancel | ProtoOp::Cleanup) || !self.stm_cancel_perform() {
                    self.state_set(DeviceState::Done);
                }
                return;
            }
        };

        let dev = self.clone();
        self.http.submit(request, move |result| dev.stm_op_callback(result));
    }

    /// Decode an operation reply. `CANCEL` and `CLEANUP` use the shared
    /// trivial decoder that always finishes the chain.
    fn proto_op_decode(&self, op: ProtoOp, reply: &HttpReply) -> Option<ProtoResult> {
        debug!(parent: &self.span, "decoding: {}", op);

        match op {
            ProtoOp::Cancel | ProtoOp::Cleanup => Some(ProtoResult::default()),
            ProtoOp::Scan | ProtoOp::Load | ProtoOp::Check => {
                let inner = self.inner.lock();
                self.with_proto(&inner, Some(reply), |proto, ctx| match op {
                    ProtoOp::Scan => proto.scan_decode(ctx),
                    ProtoOp::Load => proto.load_decode(ctx),
                    _ => proto.status_decode(ctx),
                })
            }
            ProtoOp::None | ProtoOp::Finish => None,
        }
    }

    /// Operation completion callback
    pub(crate) fn stm_op_callback(self: &Arc<Self>, result: Result<HttpReply, HttpError>) {
        let reply = match result {
            Ok(reply) => reply,
            // Transport errors reach here only before the onerror
            // callback is installed; route them the same way
            Err(err) => return self.http_onerror(err),
        };

        let op = self.inner.lock().op_current;
        let Some(result) = self.proto_op_decode(op, &reply) else {
            debug!(parent: &self.span, "spurious completion for {}", op);
            return;
        };

        if let Some(err) = &result.err {
            debug!(parent: &self.span, "{}", err);
        }

        // Save useful payload, if any
        let mut progressed = false;
        {
            let mut inner = self.inner.lock();

            match op {
                ProtoOp::Scan => {
                    if let ProtoPayload::Location(location) = &result.payload {
                        inner.location = Some(location.clone());
                        inner.failed_attempt = 0;
                        progressed = true;
                    }
                }
                ProtoOp::Load => {
                    if let ProtoPayload::Image(image) = &result.payload {
                        self.queue.push(image.clone());
                        inner.job_images_received += 1;
                        inner.failed_attempt = 0;
                        self.pollable.signal();
                        progressed = true;
                    }
                }
                _ => {}
            }

            self.job_set_status_locked(&mut inner, result.status);

            if result.next == ProtoOp::Check {
                inner.checking_http_status = Some(reply.status);
            }
        }

        if progressed {
            self.stm_cond.notify_all();
        }

        if result.next == ProtoOp::Finish {
            // A job that produced nothing and carries no better status
            // defaults to an I/O error
            if self.inner.lock().job_images_received == 0 {
                self.job_set_status(Status::IoError);
            }
            self.state_set(DeviceState::Done);
            return;
        }

        // Handle delayed cancellation
        if self.state() == DeviceState::CancelWait {
            if !self.stm_cancel_perform() {
                self.state_set(DeviceState::Done);
            }
            return;
        }

        if result.next == ProtoOp::Cancel {
            self.state_set(DeviceState::Cancelling);
        } else if result.next == ProtoOp::Cleanup {
            self.state_set(DeviceState::Cleanup);
        }

        if !result.delay.is_zero() {
            let mut inner = self.inner.lock();
            debug_assert!(inner.stm_timer.is_none());
            inner.failed_attempt += 1;
            inner.op_current = result.next;

            let dev = self.clone();
            inner.stm_timer = Some(EloopTimer::once(&self.eloop, result.delay, move || {
                let op = {
                    let mut inner = dev.inner.lock();
                    inner.stm_timer = None;
                    inner.op_current
                };
                dev.proto_op_submit(op);
            }));
            return;
        }

        self.proto_op_submit(result.next);
    }

    /// Issue the cancel request to the scanner, if a job resource exists
    /// to cancel against
    pub(crate) fn stm_cancel_perform(self: &Arc<Self>) -> bool {
        let has_location = self.inner.lock().location.is_some();
        if !has_location {
            return false;
        }

        self.http_cancel();
        self.state_set(DeviceState::Cancelling);
        self.proto_op_submit(ProtoOp::Cancel);
        self.job_set_status(Status::Cancelled);
        true
    }

    /// Cancel-event callback, delivered on the event-loop thread
    pub(crate) fn stm_cancel_event_callback(self: &Arc<Self>) {
        debug!(parent: &self.span, "cancel requested");
        if !self.stm_cancel_perform() {
            self.state_set(DeviceState::CancelWait);
        }
    }

    /// Fill the wire scan parameters from the current options and kick
    /// off the operation chain
    pub(crate) fn stm_start_scan(self: &Arc<Self>) {
        let ok = {
            let mut inner = self.inner.lock();

            let computed = {
                let opt = &inner.opt;
                opt.caps.source(opt.current.source).map(|src| {
                    let units = opt.caps.units;
                    let res = opt.current.resolution;
                    let geom_x = geom::compute(
                        opt.current.tl_x,
                        opt.current.br_x,
                        src.min_wid_px,
                        src.max_wid_px,
                        res,
                        units,
                    );
                    let geom_y = geom::compute(
                        opt.current.tl_y,
                        opt.current.br_y,
                        src.min_hei_px,
                        src.max_hei_px,
                        res,
                        units,
                    );
                    (geom_x, geom_y, res, opt.current.source, opt.current.colormode)
                })
            };

            match computed {
                Some((geom_x, geom_y, res, source, colormode)) => {
                    inner.job_skip_x = geom_x.skip;
                    inner.job_skip_y = geom_y.skip;
                    inner.wire_params = ProtoScanParams {
                        x_off: geom_x.off,
                        y_off: geom_y.off,
                        wid: geom_x.len,
                        hei: geom_y.len,
                        x_res: res,
                        y_res: res,
                        source,
                        colormode,
                    };

                    trace!(parent: &self.span, "starting scan:");
                    trace!(parent: &self.span, "  source:     {}", source);
                    trace!(parent: &self.span, "  colormode:  {}", colormode);
                    trace!(
                        parent: &self.span,
                        "  window:     {}x{}+{}+{}",
                        geom_x.len,
                        geom_y.len,
                        geom_x.off,
                        geom_y.off
                    );
                    trace!(parent: &self.span, "  resolution: {}", res);
                    trace!(
                        parent: &self.span,
                        "  skip:       {}x{}",
                        geom_x.skip,
                        geom_y.skip
                    );
                    true
                }
                None => false,
            }
        };

        if !ok {
            self.job_set_status(Status::IoError);
            self.state_set(DeviceState::Done);
            return;
        }

        self.state_set(DeviceState::Scanning);
        self.proto_op_submit(ProtoOp::Scan);
    }
}
