/*!
 * Event loop for scanflow.
 *
 * This module provides the event loop that drives all device I/O: a
 * dedicated thread running a single-threaded Tokio runtime. HTTP
 * completions, timers and cancellation events are all delivered as tasks
 * on this thread, so device state transitions never race each other.
 * Frontend callers marshal work onto the loop and synchronize through
 * condition variables; the loop itself never blocks on application state.
 */
use std::future::Future;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::runtime::Builder as TokioRuntimeBuilder;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// The event loop: a dedicated thread driving a current-thread Tokio
/// runtime
pub struct EventLoop {
    handle: EloopHandle,
    shutdown: Arc<Notify>,
    thread: Option<thread::JoinHandle<()>>,
}

/// A cloneable handle used to marshal work onto the event-loop thread
#[derive(Clone)]
pub struct EloopHandle {
    tokio: tokio::runtime::Handle,
}

impl EventLoop {
    /// Spawn the event-loop thread and wait until it is ready to accept
    /// work
    pub fn new() -> Result<Self> {
        let (handle_tx, handle_rx) = mpsc::channel();
        let shutdown = Arc::new(Notify::new());
        let loop_shutdown = shutdown.clone();

        let thread = thread::Builder::new()
            .name("scanflow-eloop".to_string())
            .spawn(move || {
                let rt = match TokioRuntimeBuilder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create event loop runtime: {}", e);
                        drop(handle_tx);
                        return;
                    }
                };

                if handle_tx.send(rt.handle().clone()).is_err() {
                    return;
                }

                debug!("event loop started");
                rt.block_on(loop_shutdown.notified());
                debug!("event loop stopped");
            })
            .map_err(|e| Error::eloop(format!("Failed to spawn event loop thread: {}", e)))?;

        let tokio = handle_rx
            .recv()
            .map_err(|_| Error::eloop("Event loop thread failed to start"))?;

        Ok(Self {
            handle: EloopHandle { tokio },
            shutdown,
            thread: Some(thread),
        })
    }

    /// Get a handle for marshalling work onto the loop
    pub fn handle(&self) -> EloopHandle {
        self.handle.clone()
    }

    /// Stop the loop and join its thread.
    ///
    /// Tasks not yet started are dropped; callers that need ordering run
    /// their teardown through [`EloopHandle::call_wait`] first.
    pub fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl EloopHandle {
    /// Run a closure on the event-loop thread, without waiting for it
    pub fn call<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tokio.spawn(async move { f() });
    }

    /// Run a closure on the event-loop thread and block until it has run.
    ///
    /// Must not be invoked from the loop thread itself; that would
    /// deadlock waiting for a task the blocked thread should execute.
    pub fn call_wait<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.tokio.spawn(async move {
            let _ = tx.send(f());
        });
        rx.recv().expect("event loop dropped a marshalled call")
    }

    /// Spawn a future on the event-loop thread
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tokio.spawn(fut)
    }
}

/// A one-shot timer whose callback runs on the event-loop thread.
///
/// Dropping the timer cancels it if it has not fired yet.
pub struct EloopTimer {
    task: JoinHandle<()>,
}

impl EloopTimer {
    /// Arm a timer firing once after `delay`
    pub fn once<F>(eloop: &EloopHandle, delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let task = eloop.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        Self { task }
    }

    /// Cancel the timer; a no-op if it already fired
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for EloopTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A cross-thread event: `trigger` may be called from any thread, the
/// callback runs on the event-loop thread.
///
/// Triggers coalesce; a callback execution consumes all triggers that
/// arrived before it ran.
pub struct EloopEvent {
    notify: Arc<Notify>,
    task: JoinHandle<()>,
}

impl EloopEvent {
    /// Install an event with the given callback
    pub fn new<F>(eloop: &EloopHandle, f: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let notify = Arc::new(Notify::new());
        let notified = notify.clone();
        let task = eloop.spawn(async move {
            loop {
                notified.notified().await;
                f();
            }
        });
        Self { notify, task }
    }

    /// Trigger the event
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

impl Drop for EloopEvent {
    fn drop(&mut self) {
        self.task.abort();
    }
}
