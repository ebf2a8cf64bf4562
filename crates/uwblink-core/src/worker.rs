//! Dedicated worker thread serializing all bus access.
//!
//! One thread owns the framing context. Callers submit jobs and block until
//! they complete; at most one job is queued at any time. Interrupts raised
//! by the device are serviced on the same thread, ahead of queued jobs, and
//! can be masked with a nesting disable counter. An interrupt raised while
//! masked, or while its handler is already running, is latched and serviced
//! once when possible.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{LinkError, Result};

/// Something that can be poked when a cancellation is requested.
pub trait Waker: Send + Sync {
    fn wake(&self);
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    wakers: Mutex<Vec<Weak<dyn Waker>>>,
}

/// Cancellation signal for blocking waits.
///
/// Cloning shares the signal. Cancelling wakes every wait the token was
/// passed to.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let wakers: Vec<_> = self.inner.wakers.lock().clone();
        for waker in wakers.iter().filter_map(Weak::upgrade) {
            waker.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn register(&self, waker: Weak<dyn Waker>) {
        let mut wakers = self.inner.wakers.lock();
        wakers.retain(|w| w.strong_count() > 0);
        if !wakers.iter().any(|w| Weak::ptr_eq(w, &waker)) {
            wakers.push(waker);
        }
    }
}

type Job<C> = Box<dyn FnOnce(&mut C) + Send>;
type Isr = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
struct IrqState {
    pending: bool,
    running: bool,
    latched: bool,
    disabled: u32,
}

struct WorkState<C> {
    irq: IrqState,
    /// A submitter owns the single queue slot.
    submitting: bool,
    next_ticket: u64,
    queued: Option<(u64, Job<C>)>,
    /// Ticket of the job whose submitter is still waiting.
    current: Option<u64>,
    shutdown: bool,
}

struct Shared<C> {
    ctx: Mutex<C>,
    state: Mutex<WorkState<C>>,
    cond: Condvar,
    completed: AtomicU64,
    isr: Isr,
}

impl<C: Send + 'static> Waker for Shared<C> {
    fn wake(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }
}

/// Thread naming and scheduling.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub name: String,
    /// Pin the thread to this CPU.
    pub cpu: Option<usize>,
    /// Run with SCHED_FIFO priority.
    pub realtime: bool,
}

pub struct Worker<C: Send + 'static> {
    shared: Arc<Shared<C>>,
    thread_id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl<C: Send + 'static> Worker<C> {
    /// Start the worker thread owning `ctx`.
    ///
    /// `isr` runs on the worker thread for every serviced interrupt. The
    /// interrupt starts masked once, matching a device that starts suspended.
    pub fn spawn<I>(options: WorkerOptions, ctx: C, isr: I) -> std::io::Result<Self>
    where
        I: Fn() + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            ctx: Mutex::new(ctx),
            state: Mutex::new(WorkState {
                irq: IrqState {
                    disabled: 1,
                    ..Default::default()
                },
                submitting: false,
                next_ticket: 0,
                queued: None,
                current: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
            completed: AtomicU64::new(0),
            isr: Box::new(isr),
        });

        let thread_shared = Arc::clone(&shared);
        let cpu = options.cpu;
        let realtime = options.realtime;
        let handle = thread::Builder::new()
            .name(options.name.clone())
            .spawn(move || {
                configure_thread(cpu, realtime);
                run(&thread_shared);
            })?;
        debug!(name = %options.name, ?cpu, realtime, "Worker started");

        Ok(Self {
            thread_id: handle.thread().id(),
            shared,
            handle: Some(handle),
        })
    }

    fn on_worker(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Run `work` on the worker thread and wait for its result.
    ///
    /// Called from the worker thread itself, the job runs inline. A
    /// cancellation removes a job that is still queued; a job already
    /// running completes and its result is discarded.
    pub fn enqueue<R, F>(&self, cancel: Option<&CancelToken>, work: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut C) -> Result<R> + Send + 'static,
    {
        if self.on_worker() {
            let mut ctx = self.shared.ctx.lock();
            return work(&mut ctx);
        }

        let slot: Arc<Mutex<Option<Result<R>>>> = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let job: Job<C> = Box::new(move |ctx: &mut C| {
            let result = work(ctx);
            *out.lock() = Some(result);
        });

        if let Some(token) = cancel {
            let waker: Arc<dyn Waker> = self.shared.clone();
            token.register(Arc::downgrade(&waker));
        }
        let cancelled = || cancel.is_some_and(CancelToken::is_cancelled);

        let mut state = self.shared.state.lock();
        while state.submitting && !state.shutdown {
            if cancelled() {
                return Err(LinkError::Cancelled);
            }
            self.shared.cond.wait(&mut state);
        }
        if state.shutdown {
            return Err(LinkError::WorkerStopped);
        }

        state.submitting = true;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queued = Some((ticket, job));
        state.current = Some(ticket);
        self.shared.cond.notify_all();

        while state.current == Some(ticket) {
            if cancelled() {
                if state.queued.as_ref().is_some_and(|(t, _)| *t == ticket) {
                    state.queued = None;
                }
                state.current = None;
                state.submitting = false;
                self.shared.cond.notify_all();
                debug!(ticket, "Work cancelled");
                return Err(LinkError::Cancelled);
            }
            self.shared.cond.wait(&mut state);
        }
        state.submitting = false;
        self.shared.cond.notify_all();
        drop(state);

        slot.lock().take().unwrap_or(Err(LinkError::WorkerStopped))
    }

    /// Run `f` with exclusive access to the context from any thread.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        let mut ctx = self.shared.ctx.lock();
        f(&mut ctx)
    }

    /// Signal an interrupt from the device.
    pub fn raise_irq(&self) {
        let mut state = self.shared.state.lock();
        let irq = &mut state.irq;
        if irq.running || irq.disabled > 0 {
            irq.latched = true;
        } else if !irq.pending {
            irq.pending = true;
            self.shared.cond.notify_all();
        }
    }

    /// Mask interrupt servicing. Nests with [`Worker::enable_irq`].
    ///
    /// Waits for a running handler to finish unless called from it.
    pub fn disable_irq(&self) {
        let mut state = self.shared.state.lock();
        state.irq.disabled += 1;
        if !self.on_worker() {
            while state.irq.running && !state.shutdown {
                self.shared.cond.wait(&mut state);
            }
        }
    }

    pub fn enable_irq(&self) {
        let mut state = self.shared.state.lock();
        let irq = &mut state.irq;
        if irq.disabled == 0 {
            warn!("Unbalanced interrupt enable");
            return;
        }
        irq.disabled -= 1;
        if irq.disabled == 0 && irq.latched && !irq.running {
            irq.latched = false;
            irq.pending = true;
            self.shared.cond.notify_all();
        }
    }

    pub fn irq_disabled(&self) -> bool {
        self.shared.state.lock().irq.disabled > 0
    }

    /// Number of queued jobs run to completion so far.
    pub fn completed_work(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }
}

impl<C: Send + 'static> Drop for Worker<C> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.handle.take()
            && !self.on_worker()
            && handle.join().is_err()
        {
            warn!("Worker thread panicked");
        }
    }
}

fn run<C: Send + 'static>(shared: &Shared<C>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }

        if state.irq.pending {
            state.irq.running = true;
            MutexGuard::unlocked(&mut state, || (shared.isr)());
            let irq = &mut state.irq;
            irq.pending = false;
            irq.running = false;
            if irq.latched && irq.disabled == 0 {
                irq.latched = false;
                irq.pending = true;
            }
            shared.cond.notify_all();
            continue;
        }

        if let Some((ticket, job)) = state.queued.take() {
            MutexGuard::unlocked(&mut state, || {
                let mut ctx = shared.ctx.lock();
                job(&mut ctx);
            });
            if state.current == Some(ticket) {
                state.current = None;
            }
            shared.completed.fetch_add(1, Ordering::SeqCst);
            shared.cond.notify_all();
            continue;
        }

        shared.cond.wait(&mut state);
    }

    state.queued = None;
    state.current = None;
    shared.cond.notify_all();
    debug!("Worker stopped");
}

#[cfg(target_os = "linux")]
fn configure_thread(cpu: Option<usize>, realtime: bool) {
    if let Some(cpu) = cpu {
        // SAFETY: cpu_set_t is plain data; the set outlives the call.
        let rc = unsafe {
            let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_SET(cpu, &mut cpuset);
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset)
        };
        if rc != 0 {
            warn!(cpu, "sched_setaffinity failed");
        }
    }
    if realtime {
        // SAFETY: sched_param is plain data and pthread_self is always valid.
        let rc = unsafe {
            let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
            let param = libc::sched_param {
                sched_priority: (max - 2).max(1),
            };
            libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
        };
        if rc != 0 {
            warn!(rc, "Realtime priority not granted");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn configure_thread(cpu: Option<usize>, realtime: bool) {
    if cpu.is_some() || realtime {
        warn!("Thread affinity and priority are only supported on Linux");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn options() -> WorkerOptions {
        WorkerOptions {
            name: "uwblink-test".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_enqueue_runs_on_worker() {
        let worker = Worker::spawn(options(), 0u32, || {}).unwrap();
        let caller = thread::current().id();
        let (value, ran_elsewhere) = worker
            .enqueue(None, move |ctx: &mut u32| {
                *ctx += 5;
                Ok((*ctx, thread::current().id() != caller))
            })
            .unwrap();
        assert_eq!(value, 5);
        assert!(ran_elsewhere);
        assert_eq!(worker.completed_work(), 1);
        assert_eq!(worker.with_context(|ctx| *ctx), 5);
    }

    #[test]
    fn test_concurrent_jobs_run_in_submission_order() {
        const THREADS: usize = 4;
        const JOBS: usize = 25;
        let worker = Worker::spawn(options(), 0u64, || {}).unwrap();
        let busy = Arc::new(AtomicBool::new(false));

        let per_thread: Vec<Vec<u64>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let worker = &worker;
                    let busy = Arc::clone(&busy);
                    scope.spawn(move || {
                        let mut seen = Vec::new();
                        for _ in 0..JOBS {
                            let busy = Arc::clone(&busy);
                            let seq = worker
                                .enqueue(None, move |count: &mut u64| {
                                    assert!(!busy.swap(true, Ordering::SeqCst), "jobs overlap");
                                    *count += 1;
                                    thread::sleep(Duration::from_micros(50));
                                    busy.store(false, Ordering::SeqCst);
                                    Ok(*count)
                                })
                                .unwrap();
                            assert!(worker.completed_work() >= seq);
                            seen.push(seq);
                        }
                        seen
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for seen in &per_thread {
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }
        let mut all: Vec<u64> = per_thread.concat();
        all.sort_unstable();
        let expected: Vec<u64> = (1..=(THREADS * JOBS) as u64).collect();
        assert_eq!(all, expected);
        assert_eq!(worker.completed_work(), (THREADS * JOBS) as u64);
    }

    #[test]
    fn test_job_errors_propagate() {
        let worker = Worker::spawn(options(), (), || {}).unwrap();
        let result: Result<()> = worker.enqueue(None, |_| Err(LinkError::NotReady));
        assert!(matches!(result, Err(LinkError::NotReady)));
    }

    #[test]
    fn test_irq_masked_until_enabled() {
        let (tx, rx) = mpsc::channel();
        let worker = Worker::spawn(options(), (), move || {
            let _ = tx.send(());
        })
        .unwrap();
        assert!(worker.irq_disabled());

        worker.raise_irq();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        worker.enable_irq();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_irq_latched_while_running() {
        let (tx, rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let worker = Arc::new(
            Worker::spawn(options(), (), move || {
                let _ = tx.send(());
                let _ = gate_rx.lock().recv_timeout(Duration::from_secs(2));
            })
            .unwrap(),
        );
        worker.enable_irq();

        worker.raise_irq();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        // Raised twice while the handler runs: serviced once more.
        worker.raise_irq();
        worker.raise_irq();
        gate_tx.send(()).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        gate_tx.send(()).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_cancel_queued_job() {
        let worker = Arc::new(Worker::spawn(options(), 0u32, || {}).unwrap());
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        let blocker = {
            let worker = Arc::clone(&worker);
            let release_rx = Arc::clone(&release_rx);
            thread::spawn(move || {
                worker.enqueue(None, move |ctx: &mut u32| {
                    let _ = started_tx.send(());
                    let _ = release_rx.lock().recv_timeout(Duration::from_secs(2));
                    *ctx += 1;
                    Ok(())
                })
            })
        };
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        // The blocker owns the queue: this submitter waits, then gives up.
        let token = CancelToken::new();
        let waiter = {
            let worker = Arc::clone(&worker);
            let token = token.clone();
            thread::spawn(move || {
                worker.enqueue(Some(&token), |ctx: &mut u32| {
                    *ctx += 100;
                    Ok(())
                })
            })
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(LinkError::Cancelled)));

        release_tx.send(()).unwrap();
        blocker.join().unwrap().unwrap();
        assert_eq!(worker.with_context(|ctx| *ctx), 1);
    }

    #[test]
    fn test_cancel_running_job_discards_result() {
        let worker = Arc::new(Worker::spawn(options(), 0u32, || {}).unwrap());
        let (started_tx, started_rx) = mpsc::channel();
        let token = CancelToken::new();

        let waiter = {
            let worker = Arc::clone(&worker);
            let token = token.clone();
            thread::spawn(move || {
                worker.enqueue(Some(&token), move |ctx: &mut u32| {
                    let _ = started_tx.send(());
                    thread::sleep(Duration::from_millis(50));
                    *ctx = 7;
                    Ok(*ctx)
                })
            })
        };
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        token.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(LinkError::Cancelled)));

        // The running job still completes.
        let value = worker.enqueue(None, |ctx: &mut u32| Ok(*ctx)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_inline_enqueue_from_isr() {
        let slot: Arc<std::sync::OnceLock<Weak<Worker<u32>>>> = Arc::new(Default::default());
        let (tx, rx) = mpsc::channel();
        let isr_slot = Arc::clone(&slot);
        let worker = Arc::new(
            Worker::spawn(options(), 1u32, move || {
                if let Some(worker) = isr_slot.get().and_then(Weak::upgrade) {
                    let value = worker.enqueue(None, |ctx: &mut u32| Ok(*ctx * 10));
                    let _ = tx.send(value.ok());
                }
            })
            .unwrap(),
        );
        let _ = slot.set(Arc::downgrade(&worker));
        worker.enable_irq();
        worker.raise_irq();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Some(10));
    }
}
