//! Read readiness notifications.
//!
//! While enabled, a monitor thread blocks on a duplicated OS wait primitive
//! and publishes [`DeviceEvent::ReadyRead`] once per transition of the input
//! queue from empty to non-empty. It re-arms when the owner drains the queue
//! (signalled by the device after a read) or when it observes the queue empty
//! itself. Stopping the monitor joins the thread, so neither the wait handle
//! nor a subscriber send can outlive `disable`.
//!
//! Some drivers accept only one pending readiness wait per device. While a
//! monitor runs, the device's own blocking waits therefore follow the
//! monitor's [`Readiness`] signal instead of issuing a second OS wait.

use super::os_error::OsError;
use super::traits::ReadinessWaiter;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Upper bound on how long the monitor blocks before checking for shutdown.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Notifications published by a [`SerialDevice`](super::SerialDevice).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Input became available after the queue was empty.
    ReadyRead,
    /// The device is about to release its handle.
    AboutToClose,
}

/// Receiving side of a device subscription.
pub type DeviceEvents = UnboundedReceiver<DeviceEvent>;

/// Fan-out of device events to any number of subscribers.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventHub {
    subscribers: Arc<Mutex<Vec<UnboundedSender<DeviceEvent>>>>,
}

impl EventHub {
    pub(crate) fn subscribe(&self) -> DeviceEvents {
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber, forgetting the ones that hung up.
    pub(crate) fn emit(&self, event: DeviceEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event).is_ok());
    }
}

/// Counter bumped each time the monitor's wait reports input.
#[derive(Debug, Default)]
pub(crate) struct Readiness {
    state: Mutex<ReadinessState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct ReadinessState {
    generation: u64,
    stopped: bool,
}

impl Readiness {
    fn signal(&self) {
        self.state.lock().generation += 1;
        self.changed.notify_all();
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
        self.changed.notify_all();
    }

    /// Current generation, or `None` once the monitor thread has exited.
    pub(crate) fn generation(&self) -> Option<u64> {
        let state = self.state.lock();
        (!state.stopped).then_some(state.generation)
    }

    /// Block until a signal newer than `seen`, the monitor exits, or
    /// `deadline` passes.
    pub(crate) fn wait_past(&self, seen: u64, deadline: Instant) {
        let mut state = self.state.lock();
        while state.generation == seen && !state.stopped {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
    }
}

/// A running monitor thread.
#[derive(Debug)]
pub(crate) struct ReadMonitor {
    stop: Arc<AtomicBool>,
    rearm: Arc<AtomicBool>,
    readiness: Arc<Readiness>,
    thread: Option<JoinHandle<()>>,
}

impl ReadMonitor {
    pub(crate) fn start(
        port: &str,
        waiter: Box<dyn ReadinessWaiter>,
        hub: EventHub,
    ) -> Result<Self, OsError> {
        let stop = Arc::new(AtomicBool::new(false));
        let rearm = Arc::new(AtomicBool::new(false));
        let readiness = Arc::new(Readiness::default());

        let thread = thread::Builder::new()
            .name(format!("serial-monitor-{port}"))
            .spawn({
                let stop = Arc::clone(&stop);
                let rearm = Arc::clone(&rearm);
                let readiness = Arc::clone(&readiness);
                let port = port.to_string();
                move || {
                    run(&port, waiter, hub, &stop, &rearm, &readiness);
                    readiness.stop();
                }
            })?;

        tracing::debug!(port, "read notifications enabled");
        Ok(Self {
            stop,
            rearm,
            readiness,
            thread: Some(thread),
        })
    }

    pub(crate) fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Tell the monitor the owner has drained the input queue.
    pub(crate) fn rearm(&self) {
        self.rearm.store(true, Ordering::Release);
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                tracing::warn!("read monitor thread panicked");
            }
        }
    }
}

impl Drop for ReadMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    port: &str,
    mut waiter: Box<dyn ReadinessWaiter>,
    hub: EventHub,
    stop: &AtomicBool,
    rearm: &AtomicBool,
    readiness: &Readiness,
) {
    // Input already queued at start counts as a transition.
    let mut armed = true;

    while !stop.load(Ordering::Acquire) {
        if armed {
            match waiter.wait(WAIT_SLICE) {
                Ok(true) => {
                    readiness.signal();
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    rearm.store(false, Ordering::Release);
                    hub.emit(DeviceEvent::ReadyRead);
                    armed = false;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(port, error = %err, "read monitor stopped");
                    break;
                }
            }
        } else if rearm.swap(false, Ordering::AcqRel) {
            armed = true;
        } else {
            match waiter.pending() {
                Ok(0) => armed = true,
                Ok(_) => thread::park_timeout(WAIT_SLICE),
                Err(err) => {
                    tracing::warn!(port, error = %err, "read monitor stopped");
                    break;
                }
            }
        }
    }
}
