use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use async_channel::{Receiver, Sender};
use log::{debug, error, trace};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Completion dispatcher configuration.
///
/// Must be installed with [`configure`] before the first AIO completes;
/// afterwards the dispatcher threads are already running and the call is
/// rejected.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub thread_name: &'static str,
    pub stack_size: usize,
    pub threads: usize,
}

impl DispatcherConfig {
    pub const fn new() -> Self {
        Self {
            thread_name: "nano-aio",
            stack_size: 256 * 1024,
            threads: 2,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Background threads running AIO completions and deferred finalizers.
///
/// Nothing submitted here ever runs on the submitting thread, so a completion
/// can never re-enter the code that triggered it.
pub(crate) struct Dispatcher {
    config: Mutex<DispatcherConfig>,
    queue: OnceLock<(Sender<Job>, Receiver<Job>)>,
    started: AtomicBool,
}

impl Dispatcher {
    const fn new() -> Self {
        Self {
            config: Mutex::new(DispatcherConfig::new()),
            queue: OnceLock::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Returns `true` if the dispatcher threads are running.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Replaces the configuration. Returns `false` if the dispatcher had
    /// already been started.
    pub fn configure(&self, config: DispatcherConfig) -> bool {
        let mut current = self.config.lock().unwrap();

        if self.is_started() {
            return false;
        }

        *current = config;

        true
    }

    /// Starts the dispatcher. Returns `false` if it had been already started.
    pub fn start(&'static self) -> io::Result<bool> {
        let config = self.config.lock().unwrap().clone();

        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let (_, receiver) = self.queue();

        for index in 0..config.threads.max(1) {
            let receiver = receiver.clone();

            std::thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name))
                .stack_size(config.stack_size)
                .spawn(move || Self::run(receiver))?;
        }

        debug!(
            "Dispatcher {:?} started with {} threads",
            config.thread_name,
            config.threads.max(1)
        );

        Ok(true)
    }

    pub(crate) fn submit(&'static self, job: Job) {
        if let Err(e) = self.start() {
            error!("Dispatcher failed to start: {e}");
        }

        let (sender, _) = self.queue();

        // Both channel ends live in `self`, so the queue is never closed.
        if sender.try_send(job).is_err() {
            error!("Dispatcher queue rejected a job");
        }
    }

    fn queue(&self) -> &(Sender<Job>, Receiver<Job>) {
        self.queue.get_or_init(async_channel::unbounded)
    }

    fn run(receiver: Receiver<Job>) {
        while let Ok(job) = receiver.recv_blocking() {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("Completion callback panicked");
            }
        }

        trace!("Dispatcher thread exiting");
    }
}

pub(crate) static DISPATCHER: Dispatcher = Dispatcher::new();

/// Installs a dispatcher configuration. Returns `false` if the dispatcher is
/// already running.
pub fn configure(config: DispatcherConfig) -> bool {
    DISPATCHER.configure(config)
}

/// Schedules `job` on a dispatcher thread.
pub(crate) fn submit<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    DISPATCHER.submit(Box::new(job));
}

/// Schedules the native teardown of a resource whose last host handle was
/// just dropped.
pub(crate) fn defer<F>(finalize: F)
where
    F: FnOnce() + Send + 'static,
{
    trace!("Deferring finalization");

    DISPATCHER.submit(Box::new(finalize));
}
