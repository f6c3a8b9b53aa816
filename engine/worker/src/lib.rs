//! Worker threads for blocking external resources.
//!
//! The main loop must never block, so anything that does — a database
//! handle is the canonical case — lives on its own OS thread behind a
//! [`Worker`]. The embedding submits typed requests; the worker services
//! them one at a time against the resource and posts results back. A
//! reactor wake slot carries two signal bits: `READY` once the resource
//! handshake first succeeds, and `DATA` whenever results are waiting.
//!
//! Queues are plain FIFOs under a spin lock, held only across enqueue,
//! dequeue, and size reads — never across the external call. Request
//! order is preserved through to result order.

use engine_pool::SpinLock;
use io_reactor::WakeHandle;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// Signal bit: the resource handshake succeeded.
pub const READY: u32 = 1 << 0;
/// Signal bit: at least one result is queued.
pub const DATA: u32 = 1 << 1;

/// Error code attached to requests failed by a stopping worker.
pub const ERR_WORKER_STOPPED: i32 = -1;

/// Observable worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Unstarted = 0,
    Connecting = 1,
    Ready = 2,
    Servicing = 3,
    Stopping = 4,
    Stopped = 5,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Unstarted,
            1 => WorkerState::Connecting,
            2 => WorkerState::Ready,
            3 => WorkerState::Servicing,
            4 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

/// One queued request. `qid` correlates the eventual result; zero means
/// fire-and-forget, no callback.
pub struct WorkRequest<Q> {
    pub qid: u64,
    pub body: Q,
}

/// One posted result. `err` carries a request-level error code from the
/// service, or [`ERR_WORKER_STOPPED`].
pub struct WorkResult<R> {
    pub qid: u64,
    pub err: Option<i32>,
    pub payload: Option<R>,
}

/// Outcome of one handshake attempt.
#[derive(Debug)]
pub enum Handshake {
    /// Connected and usable.
    Ok,
    /// Still in progress; poll again after the retry interval.
    Pending,
    /// Unrecoverable; the worker gives up.
    Fatal,
}

/// Why an external call failed.
#[derive(Debug)]
pub enum ServiceError {
    /// The resource connection dropped. The worker re-enters the
    /// handshake phase before servicing anything else.
    Disconnected(i32),
    /// This request failed; the resource is fine.
    Request(i32),
}

/// The blocking resource a worker owns: a handshake, a call, a close.
pub trait BlockingService: Send + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// One handshake attempt. Called repeatedly at the retry interval
    /// until it stops returning [`Handshake::Pending`].
    fn connect(&mut self) -> Handshake;

    /// Execute one request. Runs with no locks held and may block.
    fn call(&mut self, req: &Self::Request) -> Result<Self::Response, ServiceError>;

    /// Release the resource on worker exit.
    fn close(&mut self);
}

/// Main-thread callbacks for one worker, dispatched from `main_routine`.
pub trait WorkerCallbacks<R> {
    /// Fires exactly once, on the first `READY` observation.
    fn on_ready(&mut self) {}

    /// One call per result, in the order the worker posted them.
    fn on_result(&mut self, qid: u64, err: Option<i32>, payload: Option<R>);
}

struct Shared<Q, R> {
    name: &'static str,
    state: AtomicU8,
    stopping: AtomicBool,
    /// True while the worker is inside an external call.
    busy: AtomicBool,
    requests: SpinLock<VecDeque<WorkRequest<Q>>>,
    results: SpinLock<VecDeque<WorkResult<R>>>,
    idle: Mutex<()>,
    wake_worker: Condvar,
    wake_main: WakeHandle,
}

impl<Q, R> Shared<Q, R> {
    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

/// Handle to one worker thread; lives on the main thread.
pub struct Worker<S: BlockingService> {
    shared: Arc<Shared<S::Request, S::Response>>,
    handle: Option<JoinHandle<()>>,
    ready_seen: bool,
}

impl<S: BlockingService> Worker<S> {
    /// Spawn the worker thread. `wake` must come from the reactor's
    /// [`wake_slot`](io_reactor::Reactor::wake_slot) so `READY`/`DATA`
    /// posts surface as wake events; `retry` paces handshake attempts.
    pub fn spawn(name: &'static str, service: S, wake: WakeHandle, retry: Duration) -> Self {
        let shared = Arc::new(Shared {
            name,
            state: AtomicU8::new(WorkerState::Unstarted as u8),
            stopping: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            requests: SpinLock::new(VecDeque::new()),
            results: SpinLock::new(VecDeque::new()),
            idle: Mutex::new(()),
            wake_worker: Condvar::new(),
            wake_main: wake,
        });

        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || thread_main(service, thread_shared, retry))
            .expect("failed to spawn worker thread");

        Self {
            shared,
            handle: Some(handle),
            ready_seen: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Queue a request for the worker. Order is preserved per worker.
    pub fn submit(&self, qid: u64, body: S::Request) {
        self.shared
            .requests
            .lock()
            .push_back(WorkRequest { qid, body });
        let _guard = self.shared.idle.lock();
        self.shared.wake_worker.notify_one();
    }

    /// `(finished, unfinished)` job counts. `unfinished` includes the
    /// request currently being serviced, so zero means quiescent.
    pub fn busy_job(&self) -> (usize, usize) {
        let finished = self.shared.results.lock().len();
        let mut unfinished = self.shared.requests.lock().len();
        if self.shared.busy.load(Ordering::Acquire) {
            unfinished += 1;
        }
        (finished, unfinished)
    }

    /// Ask the worker to stop and wait for it to exit. Pending requests
    /// are failed with [`ERR_WORKER_STOPPED`].
    pub fn stop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        {
            let _guard = self.shared.idle.lock();
            self.shared.wake_worker.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = self.shared.name, "worker thread panicked");
            }
        }
    }

    /// Dispatch posted signal bits on the main thread. `on_ready` fires
    /// on the first `READY`; `DATA` drains the result queue in order,
    /// silently discarding `qid == 0` results.
    pub fn main_routine<C: WorkerCallbacks<S::Response>>(&mut self, bits: u32, callbacks: &mut C) {
        if bits & READY != 0 && !self.ready_seen {
            self.ready_seen = true;
            callbacks.on_ready();
        }
        if bits & DATA != 0 {
            loop {
                let result = self.shared.results.lock().pop_front();
                let Some(result) = result else { break };
                if result.qid == 0 {
                    continue;
                }
                callbacks.on_result(result.qid, result.err, result.payload);
            }
        }
    }
}

impl<S: BlockingService> Drop for Worker<S> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

// ============================================================================
// Worker thread body
// ============================================================================

fn thread_main<S: BlockingService>(
    mut service: S,
    shared: Arc<Shared<S::Request, S::Response>>,
    retry: Duration,
) {
    if handshake(&mut service, &shared, retry) {
        shared.set_state(WorkerState::Ready);
        shared.wake_main.post(READY);
        info!(worker = shared.name, "ready");

        service_loop(&mut service, &shared, retry);
    }

    shared.set_state(WorkerState::Stopping);
    fail_pending(&shared);
    service.close();
    shared.set_state(WorkerState::Stopped);
    info!(worker = shared.name, "stopped");
}

/// Poll the resource handshake at the retry interval until it resolves.
/// Every sleep boundary honors the stopping flag, so shutdown stays
/// bounded even while the resource is unreachable.
fn handshake<S: BlockingService>(
    service: &mut S,
    shared: &Shared<S::Request, S::Response>,
    retry: Duration,
) -> bool {
    shared.set_state(WorkerState::Connecting);
    loop {
        if shared.stopping() {
            return false;
        }
        match service.connect() {
            Handshake::Ok => return true,
            Handshake::Pending => {}
            Handshake::Fatal => {
                error!(worker = shared.name, "handshake failed, giving up");
                return false;
            }
        }

        let mut guard = shared.idle.lock();
        if shared.stopping() {
            return false;
        }
        let _ = shared.wake_worker.wait_for(&mut guard, retry);
    }
}

fn service_loop<S: BlockingService>(
    service: &mut S,
    shared: &Shared<S::Request, S::Response>,
    retry: Duration,
) {
    loop {
        // Idle until work arrives or stop is requested.
        {
            let mut guard = shared.idle.lock();
            loop {
                if shared.stopping() || !shared.requests.lock().is_empty() {
                    break;
                }
                shared.wake_worker.wait(&mut guard);
            }
        }
        if shared.stopping() {
            return;
        }

        // Drain one request at a time; the lock is never held across the
        // external call.
        loop {
            let request = shared.requests.lock().pop_front();
            let Some(request) = request else { break };

            shared.busy.store(true, Ordering::Release);
            shared.set_state(WorkerState::Servicing);
            let outcome = service.call(&request.body);

            let (err, payload, reconnect) = match outcome {
                Ok(payload) => (None, Some(payload), false),
                Err(ServiceError::Request(code)) => (Some(code), None, false),
                Err(ServiceError::Disconnected(code)) => (Some(code), None, true),
            };
            shared.results.lock().push_back(WorkResult {
                qid: request.qid,
                err,
                payload,
            });
            shared.busy.store(false, Ordering::Release);
            shared.set_state(WorkerState::Ready);
            shared.wake_main.post(DATA);

            if reconnect {
                warn!(worker = shared.name, "resource disconnected, re-entering handshake");
                if !handshake(service, shared, retry) {
                    return;
                }
                shared.set_state(WorkerState::Ready);
            }
            if shared.stopping() {
                return;
            }
        }
    }
}

/// Fail whatever is still queued when the worker exits, so no request
/// silently vanishes.
fn fail_pending<Q, R>(shared: &Shared<Q, R>) {
    let mut failed = 0;
    loop {
        let request = shared.requests.lock().pop_front();
        let Some(request) = request else { break };
        shared.results.lock().push_back(WorkResult {
            qid: request.qid,
            err: Some(ERR_WORKER_STOPPED),
            payload: None,
        });
        failed += 1;
    }
    if failed > 0 {
        warn!(worker = shared.name, failed, "failed pending requests on stop");
        shared.wake_main.post(DATA);
    }
}
