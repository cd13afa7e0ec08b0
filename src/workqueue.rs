//! Thread-backed reference Host Runtime executor (SPEC_FULL.md §4.4),
//! modeled on the teacher's `task::workqueue::{Work, Workqueue}`: a `Work`
//! item is an atomic Idle→Pending→Running state machine wrapping a
//! `FnOnce`; a `Workqueue` owns a queue and a worker thread parked on a
//! condition variable rather than the teacher's kthread park/unpark, since
//! there is no in-process scheduler to hook into on the host side.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

const IDLE: u8 = 0;
const PENDING: u8 = 1;
const RUNNING: u8 = 2;

/// A single unit of deferred work. Rejects re-queueing while already
/// pending or running, matching the teacher's `Work::queue` semantics.
pub struct Work {
    state: AtomicU8,
    task: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Work {
    pub fn new(task: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Work { state: AtomicU8::new(IDLE), task: Mutex::new(Some(Box::new(task))) })
    }

    fn run(self: &Arc<Self>) {
        self.state.store(RUNNING, Ordering::Release);
        if let Some(task) = self.task.lock().unwrap().take() {
            task();
        }
        self.state.store(IDLE, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }
}

struct Shared {
    queue: Mutex<VecDeque<Arc<Work>>>,
    condvar: Condvar,
    stop: Mutex<bool>,
}

/// An ordered, single-worker executor. The Block Manager/RRPC design calls
/// for two pools at the Host Runtime level (per-LUN ordered; background
/// single-threaded for reclamation); both are just instances of this type.
pub struct Workqueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Workqueue {
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(Shared { queue: Mutex::new(VecDeque::new()), condvar: Condvar::new(), stop: Mutex::new(false) });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run_loop(worker_shared))
            .expect("failed to spawn workqueue thread");
        Workqueue { shared, worker: Some(worker) }
    }

    fn run_loop(shared: Arc<Shared>) {
        loop {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if *shared.stop.lock().unwrap() {
                    return;
                }
                if let Some(work) = queue.pop_front() {
                    drop(queue);
                    work.run();
                    shared.condvar.notify_all();
                    break;
                }
                queue = shared.condvar.wait(queue).unwrap();
            }
        }
    }

    /// Enqueues `work`, rejecting it if already pending or running.
    /// Returns whether it was actually queued.
    pub fn queue(&self, work: Arc<Work>) -> bool {
        if work.state.compare_exchange(IDLE, PENDING, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return false;
        }
        self.shared.queue.lock().unwrap().push_back(work);
        self.shared.condvar.notify_all();
        true
    }

    /// Blocks until the queue has drained at least once past this call.
    pub fn flush(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        while !queue.is_empty() {
            queue = self.shared.condvar.wait(queue).unwrap();
        }
    }
}

impl Drop for Workqueue {
    fn drop(&mut self) {
        *self.shared.stop.lock().unwrap() = true;
        self.shared.condvar.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Background GC timer: a thread sleeping in a loop rather than an
/// interrupt-driven timer (§4.4), firing `tick` every `period`.
pub struct GcTimer {
    stop: Arc<Mutex<bool>>,
    worker: Option<JoinHandle<()>>,
}

impl GcTimer {
    pub fn start(period: std::time::Duration, mut tick: impl FnMut() + Send + 'static) -> Self {
        let stop = Arc::new(Mutex::new(false));
        let stop_worker = Arc::clone(&stop);
        let worker = std::thread::Builder::new()
            .name("gc-timer".to_string())
            .spawn(move || loop {
                std::thread::sleep(period);
                if *stop_worker.lock().unwrap() {
                    return;
                }
                tick();
            })
            .expect("failed to spawn gc timer thread");
        GcTimer { stop, worker: Some(worker) }
    }
}

impl Drop for GcTimer {
    fn drop(&mut self) {
        *self.stop.lock().unwrap() = true;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn queued_work_runs() {
        let wq = Workqueue::new("test");
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = Arc::clone(&ran);
        let work = Work::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wq.queue(work));
        wq.flush();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn requeue_while_pending_is_rejected() {
        let wq = Workqueue::new("test");
        let work = Work::new(|| std::thread::sleep(Duration::from_millis(20)));
        assert!(wq.queue(Arc::clone(&work)));
        assert!(!wq.queue(Arc::clone(&work)), "already pending/running, should be rejected");
        wq.flush();
    }

    #[test]
    fn destroy_joins_the_worker_thread() {
        let wq = Workqueue::new("test");
        drop(wq);
    }

    #[test]
    fn gc_timer_fires_periodically() {
        let count = Arc::new(AtomicU32::new(0));
        let count2 = Arc::clone(&count);
        let timer = GcTimer::start(Duration::from_millis(10), move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(55));
        drop(timer);
        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}
