//! Scheduler for background tasks.
//!
//! A [`Dispatcher`] holds a queue of [`Task`]s ordered by wake-up time and
//! priority.  Tasks run to a yield point and tell the dispatcher what to do
//! next through their [`TaskResult`].  The queue can be drained from the
//! caller's thread with [`Dispatcher::run_ready`], or by a worker thread
//! started with [`Dispatcher::start`].

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{spawn, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::sync::{Parker, Unparker};
use tracing::{debug, trace};

/// What a [`Task`] wants after running.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskResult {
    /// The task is finished and is dropped.
    Done,

    /// Run again as soon as possible, after other ready tasks.
    Reschedule,

    /// Run again after the given delay.
    Snooze(Duration),
}

/// A unit of background work.
pub trait Task: Send {
    fn run(&mut self) -> TaskResult;

    /// Human-readable description, for logging.
    fn description(&self) -> String;
}

/// Scheduling priority.  Among tasks ready at the same time, lower
/// priorities run first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    TapBgFetcher,
    Backfill,
    Flusher,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

struct Entry {
    wake_at: Instant,
    priority: Priority,
    id: TaskId,
    task: Box<dyn Task>,
}

impl Entry {
    fn key(&self) -> (Instant, Priority, TaskId) {
        (self.wake_at, self.priority, self.id)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed, so that `BinaryHeap` pops the earliest entry.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

#[derive(Default)]
struct Queue {
    tasks: BinaryHeap<Entry>,
    next_id: u64,
}

pub struct Dispatcher {
    queue: Mutex<Queue>,

    /// Wakes the worker thread, if one is running.
    unparker: Mutex<Option<Unparker>>,
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tasks", &self.len())
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            unparker: Mutex::new(None),
        }
    }

    /// Queues `task` to run as soon as possible.
    pub fn schedule(&self, task: Box<dyn Task>, priority: Priority) -> TaskId {
        let id = {
            let mut queue = self.queue.lock().unwrap();
            let id = TaskId(queue.next_id);
            queue.next_id += 1;
            debug!("scheduling task {id:?}: {}", task.description());
            queue.tasks.push(Entry {
                wake_at: Instant::now(),
                priority,
                id,
                task,
            });
            id
        };
        self.wake();
        id
    }

    /// Number of queued tasks, including snoozing ones.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time at which the earliest queued task becomes ready.
    pub fn next_wake_time(&self) -> Option<Instant> {
        self.queue.lock().unwrap().tasks.peek().map(|entry| entry.wake_at)
    }

    /// Runs once every task that is ready now.  Tasks that reschedule or
    /// snooze go back to the queue and do not run again in this call.
    /// Returns the number of tasks run.
    pub fn run_ready(&self) -> usize {
        let now = Instant::now();
        let mut ready = Vec::new();
        {
            let mut queue = self.queue.lock().unwrap();
            while queue.tasks.peek().is_some_and(|entry| entry.wake_at <= now) {
                if let Some(entry) = queue.tasks.pop() {
                    ready.push(entry);
                }
            }
        }
        ready.sort_by_key(|entry| (entry.priority, entry.id));

        let n = ready.len();
        for mut entry in ready {
            trace!("running task {:?}: {}", entry.id, entry.task.description());
            let wake_at = match entry.task.run() {
                TaskResult::Done => {
                    debug!("task {:?} finished", entry.id);
                    continue;
                }
                TaskResult::Reschedule => Instant::now(),
                TaskResult::Snooze(delay) => {
                    trace!("task {:?} snoozing for {delay:?}", entry.id);
                    Instant::now() + delay
                }
            };
            entry.wake_at = wake_at;
            self.queue.lock().unwrap().tasks.push(entry);
        }
        n
    }

    /// Runs tasks until the queue is empty, sleeping through snoozes.
    pub fn run_until_idle(&self) {
        while let Some(wake_at) = self.next_wake_time() {
            let now = Instant::now();
            if wake_at > now {
                std::thread::sleep(wake_at - now);
            }
            self.run_ready();
        }
    }

    fn wake(&self) {
        if let Some(unparker) = self.unparker.lock().unwrap().as_ref() {
            unparker.unpark();
        }
    }

    /// Starts a worker thread that runs tasks as they become ready.  The
    /// thread stops when the returned handle is dropped.
    pub fn start(self: &Arc<Self>) -> DispatcherThread {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        *self.unparker.lock().unwrap() = Some(unparker.clone());

        let exit = Arc::new(AtomicBool::new(false));
        let join_handle = {
            let dispatcher = self.clone();
            let exit = exit.clone();
            spawn(move || dispatcher.worker_thread(parker, exit))
        };
        DispatcherThread {
            dispatcher: self.clone(),
            exit,
            unparker,
            join_handle: Some(join_handle),
        }
    }

    fn worker_thread(&self, parker: Parker, exit: Arc<AtomicBool>) {
        while !exit.load(Ordering::Acquire) {
            self.run_ready();
            match self.next_wake_time() {
                Some(wake_at) => parker.park_deadline(wake_at),
                None => parker.park(),
            }
        }
    }
}

/// Handle of a dispatcher worker thread.  Dropping it stops the thread,
/// leaving unfinished tasks in the queue.
pub struct DispatcherThread {
    dispatcher: Arc<Dispatcher>,
    exit: Arc<AtomicBool>,
    unparker: Unparker,
    join_handle: Option<JoinHandle<()>>,
}

impl Drop for DispatcherThread {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::Release);
        self.unparker.unpark();
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
        *self.dispatcher.unparker.lock().unwrap() = None;
    }
}
