//! Crypto Worker Pool
//!
//! Fixed set of named worker threads sealing ring slots. Callers submit a
//! slot handle and get back a job handle; completion is observed through a
//! bounded wait on the job's condition variable.
//!
//! # Job lifecycle
//!
//! ```text
//! submit ──► Submitted ──► Running ──► Completed
//!               │             └──────► Failed
//!               ├── release ─► Cancelled
//!               ├── deadline ► TimedOut
//!               └── shutdown ► Failed (PoolShutdown)
//! ```
//!
//! A job pins its slot from submission until it reaches a terminal state,
//! so the slot cannot be released and overwritten underneath a worker.

use crate::config::{ConfigStore, PipelineFlags};
use crate::crypto::{sealed_len, CryptoContext};
use crate::error::{HyperError, HyperResult};
use crate::listener::{ListenerCell, PipelineListener};
use crate::ring::{PacketRing, SlotHandle};
use crate::stats::{PipelineStats, WorkerStats, WorkerStatsSnapshot};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Job handle `{index, generation}` into the pool's job arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle {
    index: u32,
    generation: u32,
}

impl JobHandle {
    /// Encode as a non-zero 64-bit value
    #[inline]
    pub fn as_raw(&self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64 + 1)
    }

    /// Decode a raw value; `0` is the null handle
    #[inline]
    pub fn from_raw(raw: u64) -> Option<Self> {
        let low = raw as u32;
        if low == 0 {
            return None;
        }
        Some(Self {
            index: low - 1,
            generation: (raw >> 32) as u32,
        })
    }
}

/// Job state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Queued, not yet picked up
    Submitted,
    /// A worker is sealing the slot
    Running,
    /// Output available
    Completed,
    /// Transform failed or pool shut down; no output
    Failed,
    /// Released before a worker started it
    Cancelled,
    /// Deadline passed before a worker started it
    TimedOut,
}

/// Outcome of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Job completed; output can be taken
    Ready,
    /// Job ended without output
    Failed,
    /// Still pending when the wait expired
    Timeout,
}

struct JobInner {
    state: JobState,
    output: Option<Vec<u8>>,
    error: Option<HyperError>,
}

struct Job {
    slot: SlotHandle,
    output_length: usize,
    /// Record size in effect at submission
    chunk_size: usize,
    deadline: Option<Instant>,
    inner: Mutex<JobInner>,
    done: Condvar,
}

impl Job {
    fn status(state: JobState) -> Option<WaitStatus> {
        match state {
            JobState::Submitted | JobState::Running => None,
            JobState::Completed => Some(WaitStatus::Ready),
            JobState::Failed | JobState::Cancelled | JobState::TimedOut => Some(WaitStatus::Failed),
        }
    }
}

struct JobEntry {
    generation: u32,
    job: Option<Arc<Job>>,
}

#[derive(Default)]
struct JobArena {
    entries: Vec<JobEntry>,
    free: Vec<u32>,
}

impl JobArena {
    fn insert(&mut self, job: Arc<Job>) -> JobHandle {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.job = Some(job);
            return JobHandle {
                index,
                generation: entry.generation,
            };
        }
        let index = self.entries.len() as u32;
        self.entries.push(JobEntry {
            generation: 0,
            job: Some(job),
        });
        JobHandle {
            index,
            generation: 0,
        }
    }

    fn get(&self, handle: JobHandle) -> HyperResult<&Arc<Job>> {
        self.entries
            .get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.job.as_ref())
            .ok_or(HyperError::StaleHandle)
    }

    fn remove(&mut self, handle: JobHandle) {
        if let Some(entry) = self.entries.get_mut(handle.index as usize) {
            entry.job = None;
            entry.generation = entry.generation.wrapping_add(1);
            self.free.push(handle.index);
        }
    }
}

/// State shared with workers
struct Shared {
    ring: Arc<PacketRing>,
    context: CryptoContext,
    stats: Arc<PipelineStats>,
    workers: Box<[WorkerStats]>,
    stopped: AtomicBool,
    listener: ListenerCell,
}

impl Shared {
    /// Fail a job that never started. Returns false if it already left Submitted.
    fn abort(&self, job: &Job, state: JobState, error: HyperError) -> bool {
        let mut inner = job.inner.lock();
        if inner.state != JobState::Submitted {
            return false;
        }
        self.ring.unpin(job.slot, false);
        inner.state = state;
        inner.error = Some(error);
        drop(inner);

        self.stats.record_failure();
        job.done.notify_all();
        true
    }

    fn process(&self, worker_id: usize, job: &Job) {
        {
            let mut inner = job.inner.lock();
            if inner.state != JobState::Submitted {
                return;
            }
            if job.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                drop(inner);
                self.abort(job, JobState::TimedOut, HyperError::Timeout);
                return;
            }
            inner.state = JobState::Running;
        }

        let (meta, payload) = self.ring.pinned_parts(job.slot);
        let payload_len = payload.len() as u64;
        let result = self.context.seal(payload, job.chunk_size, job.output_length);

        let mut inner = job.inner.lock();
        let mut sealed_bytes = None;
        match result {
            Ok(output) => {
                self.ring.unpin(job.slot, true);
                self.workers[worker_id].record(payload_len, meta.timestamp_ns);
                self.stats.record_complete(output.len() as u64);
                sealed_bytes = Some(output.len());
                inner.output = Some(output);
                inner.state = JobState::Completed;
            }
            Err(e) => {
                tracing::debug!(worker_id, error = %e, "crypto job failed");
                self.ring.unpin(job.slot, false);
                self.stats.record_failure();
                inner.error = Some(e);
                inner.state = JobState::Failed;
            }
        }
        drop(inner);
        job.done.notify_all();

        if let (Some(sealed_bytes), Some(listener)) = (sealed_bytes, self.listener.get()) {
            listener.on_packet_processed(job.slot, sealed_bytes);
        }
    }
}

/// Fixed-size crypto worker pool
pub struct CryptoPool {
    shared: Arc<Shared>,
    config: Arc<ConfigStore>,
    jobs: Mutex<JobArena>,
    sender: Mutex<Option<Sender<Arc<Job>>>>,
    receiver: Receiver<Arc<Job>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    worker_count: usize,
    started: AtomicBool,
}

impl CryptoPool {
    /// Create pool; workers are spawned by [`CryptoPool::start`]
    ///
    /// Jobs submitted before `start` stay queued.
    pub fn new(
        ring: Arc<PacketRing>,
        context: CryptoContext,
        config: Arc<ConfigStore>,
        stats: Arc<PipelineStats>,
    ) -> HyperResult<Self> {
        let worker_count = config.current().worker_count;
        if worker_count == 0 {
            return Err(HyperError::Initialization("worker count must be positive".into()));
        }

        let (sender, receiver) = channel::unbounded();
        let shared = Arc::new(Shared {
            ring,
            context,
            stats,
            workers: (0..worker_count).map(|_| WorkerStats::default()).collect(),
            stopped: AtomicBool::new(false),
            listener: ListenerCell::default(),
        });

        Ok(Self {
            shared,
            config,
            jobs: Mutex::new(JobArena::default()),
            sender: Mutex::new(Some(sender)),
            receiver,
            threads: Mutex::new(Vec::with_capacity(worker_count)),
            worker_count,
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the worker threads
    ///
    /// With `PIN_WORKERS` worker `i` is bound to the `i`-th core the calling
    /// thread may run on, wrapping around when there are more workers than
    /// cores.
    pub fn start(&self) -> HyperResult<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(HyperError::PoolShutdown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(HyperError::Initialization("pool already started".into()));
        }

        let cores = if self.config.flags().contains(PipelineFlags::PIN_WORKERS) {
            affinity::allowed_cores()
        } else {
            Vec::new()
        };

        let mut threads = self.threads.lock();
        for worker_id in 0..self.worker_count {
            let worker = Worker {
                id: worker_id,
                core: (!cores.is_empty()).then(|| cores[worker_id % cores.len()]),
                shared: self.shared.clone(),
                receiver: self.receiver.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("hyper-crypto-{}", worker_id))
                .spawn(move || worker.run())
                .map_err(|e| {
                    HyperError::Initialization(format!("failed to spawn crypto worker: {}", e))
                })?;
            threads.push(handle);
        }

        tracing::info!(
            workers = self.worker_count,
            algorithm = ?self.shared.context.algorithm(),
            pinned = !cores.is_empty(),
            "crypto pool started"
        );
        Ok(())
    }

    /// Number of workers
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Workers are running
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shared.stopped.load(Ordering::Acquire)
    }

    /// Register or clear the listener notified when a job is sealed
    pub fn set_listener(&self, listener: Option<Arc<dyn PipelineListener>>) {
        self.shared.listener.set(listener);
    }

    /// Context used to seal payloads
    pub fn context(&self) -> &CryptoContext {
        &self.shared.context
    }

    /// Per-worker counters
    pub fn worker_stats(&self) -> Vec<WorkerStatsSnapshot> {
        self.shared
            .workers
            .iter()
            .enumerate()
            .map(|(id, stats)| stats.snapshot(id))
            .collect()
    }

    /// Queue a read slot for sealing
    ///
    /// `output_length` is the space the caller reserves for the sealed
    /// output; it must cover [`crate::crypto::sealed_len`] of the payload.
    pub fn submit(&self, slot: SlotHandle, output_length: usize) -> HyperResult<JobHandle> {
        self.enqueue(slot, Some(output_length), None)
    }

    /// Queue a read slot with the output sized for its payload
    pub fn submit_sized(&self, slot: SlotHandle) -> HyperResult<JobHandle> {
        self.enqueue(slot, None, None)
    }

    /// Queue a slot that must be started within `max_queue_time`
    ///
    /// A job still queued past its deadline ends as `TimedOut`.
    pub fn submit_with_deadline(
        &self,
        slot: SlotHandle,
        output_length: usize,
        max_queue_time: Duration,
    ) -> HyperResult<JobHandle> {
        let deadline = Instant::now().checked_add(max_queue_time);
        self.enqueue(slot, Some(output_length), deadline)
    }

    fn enqueue(
        &self,
        slot: SlotHandle,
        output_length: Option<usize>,
        deadline: Option<Instant>,
    ) -> HyperResult<JobHandle> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(HyperError::PoolShutdown);
        }
        self.shared.ring.pin(slot)?;

        let chunk_size = self.config.chunk_size();
        let output_length = output_length.unwrap_or_else(|| {
            let (meta, _) = self.shared.ring.pinned_parts(slot);
            sealed_len(meta.length as usize, chunk_size)
        });

        let job = Arc::new(Job {
            slot,
            output_length,
            chunk_size,
            deadline,
            inner: Mutex::new(JobInner {
                state: JobState::Submitted,
                output: None,
                error: None,
            }),
            done: Condvar::new(),
        });
        let handle = self.jobs.lock().insert(job.clone());

        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            self.jobs.lock().remove(handle);
            self.shared.ring.unpin(slot, false);
            return Err(HyperError::PoolShutdown);
        }

        self.shared.stats.record_submit();
        Ok(handle)
    }

    fn lookup(&self, handle: JobHandle) -> HyperResult<Arc<Job>> {
        self.jobs.lock().get(handle).cloned()
    }

    /// Current job state
    pub fn state(&self, handle: JobHandle) -> HyperResult<JobState> {
        Ok(self.lookup(handle)?.inner.lock().state)
    }

    /// Wait up to `timeout` for the job to finish
    ///
    /// A zero timeout polls without blocking.
    pub fn wait(&self, handle: JobHandle, timeout: Duration) -> HyperResult<WaitStatus> {
        let job = self.lookup(handle)?;
        let mut inner = job.inner.lock();
        if let Some(status) = Job::status(inner.state) {
            return Ok(status);
        }
        if timeout.is_zero() {
            return Ok(WaitStatus::Timeout);
        }

        let Some(deadline) = Instant::now().checked_add(timeout) else {
            // Timeout beyond any representable instant: wait for completion
            loop {
                job.done.wait(&mut inner);
                if let Some(status) = Job::status(inner.state) {
                    return Ok(status);
                }
            }
        };
        loop {
            if job.done.wait_until(&mut inner, deadline).timed_out() {
                return Ok(Job::status(inner.state).unwrap_or(WaitStatus::Timeout));
            }
            if let Some(status) = Job::status(inner.state) {
                return Ok(status);
            }
        }
    }

    fn finished_output<R>(
        &self,
        handle: JobHandle,
        f: impl FnOnce(&mut Option<Vec<u8>>) -> Option<R>,
    ) -> HyperResult<R> {
        let job = self.lookup(handle)?;
        let mut inner = job.inner.lock();
        match inner.state {
            JobState::Completed => f(&mut inner.output).ok_or(HyperError::JobNotReady),
            JobState::Submitted | JobState::Running => Err(HyperError::JobNotReady),
            _ => Err(inner
                .error
                .clone()
                .unwrap_or_else(|| HyperError::TransformFailure("job did not complete".into()))),
        }
    }

    /// Copy of the sealed output of a completed job
    pub fn output(&self, handle: JobHandle) -> HyperResult<Vec<u8>> {
        self.finished_output(handle, |output| output.clone())
    }

    /// Move the sealed output out of a completed job
    ///
    /// Later calls fail with `JobNotReady`.
    pub fn take_output(&self, handle: JobHandle) -> HyperResult<Vec<u8>> {
        self.finished_output(handle, Option::take)
    }

    /// Release a job handle
    ///
    /// A queued job is cancelled and its slot unpinned. A running job cannot
    /// be released. Any untaken output is dropped.
    pub fn release(&self, handle: JobHandle) -> HyperResult<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get(handle)?.clone();
        {
            let mut inner = job.inner.lock();
            match inner.state {
                JobState::Running => return Err(HyperError::JobRunning),
                JobState::Submitted => {
                    self.shared.ring.unpin(job.slot, false);
                    inner.state = JobState::Cancelled;
                    self.shared.stats.record_cancel();
                    job.done.notify_all();
                }
                _ => inner.output = None,
            }
        }
        jobs.remove(handle);
        Ok(())
    }

    /// Stop workers and fail everything still queued
    pub fn shutdown(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender.lock().take();

        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("crypto worker panicked");
            }
        }

        let mut aborted = 0usize;
        while let Ok(job) = self.receiver.try_recv() {
            if self.shared.abort(&job, JobState::Failed, HyperError::PoolShutdown) {
                aborted += 1;
            }
        }
        if aborted > 0 {
            tracing::warn!(aborted, "crypto pool stopped with queued jobs");
        }
        tracing::info!("crypto pool stopped");
    }
}

impl Drop for CryptoPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker thread state
struct Worker {
    id: usize,
    /// Core to bind to before taking jobs
    core: Option<usize>,
    shared: Arc<Shared>,
    receiver: Receiver<Arc<Job>>,
}

impl Worker {
    fn run(self) {
        tracing::debug!("crypto worker {} starting", self.id);

        if let Some(core) = self.core {
            self.pin_to_core(core);
        }

        // Ends once the pool drops its sender and the queue is empty
        while let Ok(job) = self.receiver.recv() {
            if self.shared.stopped.load(Ordering::Acquire) {
                self.shared
                    .abort(&job, JobState::Failed, HyperError::PoolShutdown);
                continue;
            }
            self.shared.process(self.id, &job);
        }

        tracing::debug!("crypto worker {} stopped", self.id);
    }

    /// Pinning failure leaves the worker unbound
    fn pin_to_core(&self, core: usize) {
        match affinity::pin_current_thread(core) {
            Ok(()) => {
                tracing::debug!("pinned crypto worker {} to core {}", self.id, core);
                self.shared.workers[self.id].record_pinned(core);
            }
            Err(e) => {
                tracing::warn!(worker_id = self.id, core, error = %e, "failed to pin crypto worker");
            }
        }
    }
}

#[cfg(target_os = "linux")]
mod affinity {
    use std::io;
    use std::mem;

    /// Cores in the calling thread's affinity mask
    pub(super) fn allowed_cores() -> Vec<usize> {
        // SAFETY: cpu_set_t is plain data and the kernel writes at most its size
        unsafe {
            let mut set: libc::cpu_set_t = mem::zeroed();
            if libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
                tracing::warn!(error = %io::Error::last_os_error(), "failed to read cpu affinity");
                return Vec::new();
            }
            (0..libc::CPU_SETSIZE as usize)
                .filter(|&core| libc::CPU_ISSET(core, &set))
                .collect()
        }
    }

    /// Bind the calling thread to `core`
    pub(super) fn pin_current_thread(core: usize) -> io::Result<()> {
        // SAFETY: set is initialized by CPU_ZERO before use
        unsafe {
            let mut set: libc::cpu_set_t = mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(core, &mut set);
            if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod affinity {
    use std::io;

    pub(super) fn allowed_cores() -> Vec<usize> {
        tracing::warn!("worker pinning is only supported on Linux");
        Vec::new()
    }

    pub(super) fn pin_current_thread(_core: usize) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "worker pinning requires Linux"))
    }
}
