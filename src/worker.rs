//! Reactor threads.
//!
//! Each [`MsgWorker`] runs one cooperative loop on its own thread:
//!
//! 1. wait for readiness, bounded by the earliest timer (or not at all when
//!    work or pollers are pending);
//! 2. dispatch ready events;
//! 3. fire due timers in deadline order;
//! 4. run the closures posted from any thread;
//! 5. progress one poller, round-robin.
//!
//! State owned by a worker is only touched on its thread; other threads
//! post closures.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use std::{fmt, io};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use quanta::Instant;

use crate::event::{EventCallback, EventPoller, Interest, Notifier, TimerId, TimerJob, TimerQueue};
use crate::utils::affinity;

/// A closure posted to a worker.
pub type Work = Box<dyn FnOnce() + Send>;

/// A closure run on every loop iteration of a worker.
pub type PollerFn = Box<dyn FnMut() + Send>;

/// Identifier of a registered poller.
pub type PollerId = u64;

/// Longest time a worker sleeps when it has nothing to do.
pub const MAX_WAIT: Duration = Duration::from_secs(30);

struct NotifyCallback(Arc<Notifier>);

impl EventCallback for NotifyCallback {
    fn on_readable(&self) {
        if let Err(e) = self.0.drain() {
            warn!("cannot drain worker notifier: {}", e);
        }
    }
}

#[derive(Default)]
struct PollerRing {
    /// A slot is `None` while its poller runs.
    slots: Vec<(PollerId, Option<PollerFn>)>,
    cursor: usize,
}

struct WorkerInner {
    id: usize,
    cpu: Option<usize>,
    poller: EventPoller,
    notifier: Arc<Notifier>,
    tx: Sender<Work>,
    rx: Mutex<Option<Receiver<Work>>>,
    queued: AtomicUsize,
    extra_jobs: AtomicIsize,
    next_id: AtomicU64,
    timers: Mutex<TimerQueue>,
    pollers: Mutex<PollerRing>,
    running: AtomicBool,
    thread_id: OnceLock<ThreadId>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a reactor thread. Cheap to clone.
#[derive(Clone)]
pub struct MsgWorker {
    inner: Arc<WorkerInner>,
}

impl fmt::Debug for MsgWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsgWorker<{}>", self.inner.id)
    }
}

impl MsgWorker {
    /// Create a worker. Its thread is not started until [`MsgWorker::start`].
    pub fn new(id: usize, cpu: Option<usize>) -> io::Result<Self> {
        let poller = EventPoller::new()?;
        let notifier = Arc::new(Notifier::new()?);
        poller.set_event(
            notifier.as_raw_fd(),
            Interest::READABLE,
            Arc::new(NotifyCallback(notifier.clone())),
        )?;
        let (tx, rx) = mpsc::channel();
        Ok(Self {
            inner: Arc::new(WorkerInner {
                id,
                cpu,
                poller,
                notifier,
                tx,
                rx: Mutex::new(Some(rx)),
                queued: AtomicUsize::new(0),
                extra_jobs: AtomicIsize::new(0),
                next_id: AtomicU64::new(1),
                timers: Mutex::new(TimerQueue::new()),
                pollers: Mutex::new(PollerRing::default()),
                running: AtomicBool::new(false),
                thread_id: OnceLock::new(),
                handle: Mutex::new(None),
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Whether the caller runs on this worker's thread.
    #[inline]
    pub fn am_self(&self) -> bool {
        self.inner.thread_id.get() == Some(&thread::current().id())
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn start(&self) -> io::Result<()> {
        let Some(rx) = self.inner.rx.lock().take() else {
            return Ok(());
        };
        self.inner.running.store(true, Ordering::Release);
        let worker = self.clone();
        let handle = thread::Builder::new()
            .name(format!("msg-worker-{}", self.inner.id))
            .spawn(move || worker.run(rx))?;
        let _ = self.inner.thread_id.set(handle.thread().id());
        *self.inner.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the loop and join the thread. Work posted before the stop is
    /// still run.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.inner.notifier.notify() {
            warn!("cannot wake worker {}: {}", self.inner.id, e);
        }
        if self.am_self() {
            return;
        }
        if let Some(handle) = self.inner.handle.lock().take() {
            if handle.join().is_err() {
                error!("worker {} panicked", self.inner.id);
            }
        }
    }

    /// Run `f` on this worker's thread.
    pub fn post_work(&self, f: impl FnOnce() + Send + 'static) {
        let was = self.inner.queued.fetch_add(1, Ordering::AcqRel);
        if self.inner.tx.send(Box::new(f)).is_err() {
            self.inner.queued.fetch_sub(1, Ordering::AcqRel);
            warn!("worker {} is gone, work dropped", self.inner.id);
            return;
        }
        if was == 0 && !self.am_self() {
            if let Err(e) = self.inner.notifier.notify() {
                warn!("cannot wake worker {}: {}", self.inner.id, e);
            }
        }
    }

    fn add_timer(&self, after: Duration, period: Option<Duration>, job: TimerJob) -> TimerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + after;
        if self.am_self() {
            self.inner.timers.lock().insert(id, deadline, period, job);
        } else {
            let worker = self.clone();
            self.post_work(move || worker.inner.timers.lock().insert(id, deadline, period, job));
        }
        id
    }

    /// Run `f` once on this worker after `us` microseconds.
    pub fn post_time_work(&self, us: u64, f: impl FnOnce() + Send + 'static) -> TimerId {
        let mut f = Some(f);
        self.add_timer(
            Duration::from_micros(us),
            None,
            Box::new(move || {
                if let Some(f) = f.take() {
                    f()
                }
            }),
        )
    }

    /// Run `f` on this worker every `us` microseconds until cancelled.
    pub fn post_periodic_work(&self, us: u64, f: impl FnMut() + Send + 'static) -> TimerId {
        let period = Duration::from_micros(us);
        self.add_timer(period, Some(period), Box::new(f))
    }

    pub fn cancel_time_work(&self, id: TimerId) {
        if self.am_self() {
            self.inner.timers.lock().cancel(id);
        } else {
            let worker = self.clone();
            self.post_work(move || {
                worker.inner.timers.lock().cancel(id);
            });
        }
    }

    /// Register a closure run on every loop iteration.
    pub fn reg_poller(&self, f: impl FnMut() + Send + 'static) -> PollerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.pollers.lock().slots.push((id, Some(Box::new(f))));
        if !self.am_self() {
            let _ = self.inner.notifier.notify();
        }
        id
    }

    pub fn unreg_poller(&self, id: PollerId) {
        self.inner.pollers.lock().slots.retain(|(pid, _)| *pid != id);
    }

    /// Register a descriptor with this worker's reactor.
    pub fn set_event(&self, fd: RawFd, interest: Interest, cb: Arc<dyn EventCallback>) -> io::Result<()> {
        self.inner.poller.set_event(fd, interest, cb)
    }

    pub fn del_event(&self, fd: RawFd) -> io::Result<()> {
        self.inner.poller.del_event(fd).map(|_| ())
    }

    /// Load of this worker: registered descriptors plus extra jobs.
    pub fn job_num(&self) -> usize {
        // The notifier is always registered.
        let events = self.inner.poller.event_num().saturating_sub(1) as isize;
        (events + self.inner.extra_jobs.load(Ordering::Relaxed)).max(0) as usize
    }

    /// Account for jobs without a registered descriptor.
    pub fn update_job_num(&self, delta: isize) {
        self.inner.extra_jobs.fetch_add(delta, Ordering::Relaxed);
    }

    fn wait_timeout(&self) -> Duration {
        if self.inner.queued.load(Ordering::Acquire) > 0 || !self.inner.pollers.lock().slots.is_empty() {
            return Duration::ZERO;
        }
        match self.inner.timers.lock().next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(MAX_WAIT),
            None => MAX_WAIT,
        }
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        loop {
            let Some(mut timer) = self.inner.timers.lock().pop_due(now) else {
                break;
            };
            (timer.job)();
            self.inner.timers.lock().restore(timer, now);
        }
    }

    fn drain_work(&self, rx: &Receiver<Work>) {
        while let Ok(work) = rx.try_recv() {
            self.inner.queued.fetch_sub(1, Ordering::AcqRel);
            work();
        }
    }

    fn poll_once(&self) {
        let taken = {
            let mut ring = self.inner.pollers.lock();
            if ring.slots.is_empty() {
                return;
            }
            let idx = ring.cursor % ring.slots.len();
            ring.cursor = idx + 1;
            let (id, slot) = &mut ring.slots[idx];
            slot.take().map(|f| (*id, f))
        };
        let Some((id, mut f)) = taken else {
            return;
        };
        f();
        let mut ring = self.inner.pollers.lock();
        if let Some((_, slot)) = ring.slots.iter_mut().find(|(pid, _)| *pid == id) {
            *slot = Some(f);
        }
    }

    fn run(&self, rx: Receiver<Work>) {
        let id = self.inner.id;
        let _ = self.inner.thread_id.set(thread::current().id());
        if let Some(cpu) = self.inner.cpu {
            match affinity::bind_current_thread(cpu) {
                Ok(()) => debug!("worker {} bound to cpu {}", id, cpu),
                Err(e) => warn!("cannot bind worker {} to cpu {}: {}", id, cpu, e),
            }
        }
        info!("worker {} started", id);

        while self.inner.running.load(Ordering::Acquire) {
            let timeout = self.wait_timeout();
            if let Err(e) = self.inner.poller.process_events(Some(timeout)) {
                error!("worker {} cannot wait for events: {}", id, e);
            }
            self.fire_timers();
            self.drain_work(&rx);
            self.poll_once();
        }

        self.drain_work(&rx);
        info!("worker {} stopped", id);
    }
}

/// A fixed set of workers.
pub struct WorkerPool {
    workers: Vec<MsgWorker>,
}

impl WorkerPool {
    /// Create `num` workers, pinned to `cpu_map[i]` when the map is not empty.
    pub fn new(num: usize, cpu_map: &[usize]) -> io::Result<Self> {
        let cpus = affinity::available_cpus();
        let workers = (0..num)
            .map(|i| {
                let cpu = cpu_map.get(i).copied();
                if let Some(cpu) = cpu.filter(|&c| c >= cpus) {
                    warn!("worker {} mapped to cpu {} of {}", i, cpu, cpus);
                }
                MsgWorker::new(i, cpu)
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self { workers })
    }

    pub fn start(&self) -> io::Result<()> {
        self.workers.iter().try_for_each(MsgWorker::start)
    }

    pub fn stop(&self) {
        for w in &self.workers {
            w.stop();
        }
        for w in &self.workers {
            w.inner.poller.clear();
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    #[inline]
    pub fn get(&self, i: usize) -> Option<&MsgWorker> {
        self.workers.get(i)
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &MsgWorker> {
        self.workers.iter()
    }

    /// The worker with the fewest jobs; the lowest id wins ties.
    pub fn lightest_load_worker(&self) -> Option<&MsgWorker> {
        self.workers.iter().min_by_key(|w| w.job_num())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn post_from_other_threads() -> anyhow::Result<()> {
        let worker = MsgWorker::new(0, None)?;
        worker.start()?;

        let (tx, rx) = mpsc::channel();
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let worker = worker.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        let w = worker.clone();
                        let tx = tx.clone();
                        worker.post_work(move || tx.send((t, i, w.am_self())).unwrap());
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let mut last = [None::<i32>; 4];
        for _ in 0..400 {
            let (t, i, on_worker) = rx.recv_timeout(Duration::from_secs(5))?;
            assert!(on_worker);
            // Per-sender order is kept.
            assert!(last[t].map_or(true, |l| l < i));
            last[t] = Some(i);
        }
        assert!(!worker.am_self());
        worker.stop();
        Ok(())
    }

    #[test]
    fn timers_fire_in_order_and_cancel() -> anyhow::Result<()> {
        let worker = MsgWorker::new(1, None)?;
        worker.start()?;

        let log = Arc::new(StdMutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        for (us, tag) in [(30_000, 3), (10_000, 1), (20_000, 2)] {
            let log = log.clone();
            worker.post_time_work(us, move || log.lock().unwrap().push(tag));
        }
        let cancelled = {
            let log = log.clone();
            worker.post_time_work(15_000, move || log.lock().unwrap().push(99))
        };
        worker.cancel_time_work(cancelled);
        worker.post_time_work(50_000, move || tx.send(()).unwrap());

        rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        worker.stop();
        Ok(())
    }

    #[test]
    fn periodic_work_and_pollers() -> anyhow::Result<()> {
        let worker = MsgWorker::new(2, None)?;
        worker.start()?;

        let ticks = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let timer = {
            let ticks = ticks.clone();
            worker.post_periodic_work(1_000, move || {
                if ticks.fetch_add(1, Ordering::SeqCst) == 2 {
                    let _ = tx.send(());
                }
            })
        };
        rx.recv_timeout(Duration::from_secs(5))?;
        worker.cancel_time_work(timer);

        let spins = Arc::new(AtomicUsize::new(0));
        let poller = {
            let spins = spins.clone();
            worker.reg_poller(move || {
                spins.fetch_add(1, Ordering::SeqCst);
            })
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while spins.load(Ordering::SeqCst) < 10 {
            assert!(std::time::Instant::now() < deadline);
            thread::yield_now();
        }
        worker.unreg_poller(poller);
        worker.stop();
        assert!(ticks.load(Ordering::SeqCst) >= 3);
        Ok(())
    }

    #[test]
    fn stop_runs_pending_work() -> anyhow::Result<()> {
        let worker = MsgWorker::new(3, None)?;
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let hits = hits.clone();
            worker.post_work(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        worker.start()?;
        worker.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        Ok(())
    }

    #[test]
    fn least_jobs_selection() -> anyhow::Result<()> {
        let pool = WorkerPool::new(3, &[])?;
        assert_eq!(pool.lightest_load_worker().unwrap().id(), 0);

        pool.get(0).unwrap().update_job_num(2);
        pool.get(1).unwrap().update_job_num(1);
        assert_eq!(pool.lightest_load_worker().unwrap().id(), 2);

        pool.get(2).unwrap().update_job_num(3);
        assert_eq!(pool.lightest_load_worker().unwrap().id(), 1);
        pool.get(1).unwrap().update_job_num(-1);
        assert_eq!(pool.get(1).unwrap().job_num(), 0);
        Ok(())
    }
}
