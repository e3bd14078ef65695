//! OS thread, bounded blocking queue, and the scheduled-message thread
//! (spec §5 "Concurrency primitives", §9 "Coroutine-free scheduling").
//!
//! Grounded on `original_source/.../threading.h` (`Mutex`, `Thread`,
//! `Semaphore`) and `MessageThread.h/.cpp` (the min-heap-of-timers
//! scheduler). The bounded blocking queue is `crossbeam_channel`'s
//! bounded channel.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub type BoundedQueue<T> = crossbeam_channel::Sender<T>;

thread_local! {
    static CANCEL_CURRENT: Cell<bool> = const { Cell::new(false) };
}

type Callback = Box<dyn FnMut() + Send>;

struct PendingMessage {
    id: u64,
    interval: Option<Duration>,
    func: Callback,
}

struct Inner {
    queue: BTreeMap<(Instant, u64), PendingMessage>,
    id_keys: HashMap<u64, Instant>,
    running: bool,
}

/// A single cooperative scheduler thread driving a time-ordered set of
/// `{id, deliver_at, interval, callable}` entries — the "message
/// thread" of spec §5. No scheduler callback may block on sockets or
/// audio; this type only ever blocks on its own condition variable.
pub struct MessageThread {
    inner: std::sync::Arc<Mutex<Inner>>,
    cvar: std::sync::Arc<Condvar>,
    next_id: std::sync::Arc<AtomicU64>,
    thread_id: std::sync::Arc<Mutex<Option<thread::ThreadId>>>,
    join_handle: Option<JoinHandle<()>>,
}

impl MessageThread {
    pub fn new() -> Self {
        let inner = std::sync::Arc::new(Mutex::new(Inner {
            queue: BTreeMap::new(),
            id_keys: HashMap::new(),
            running: true,
        }));
        let cvar = std::sync::Arc::new(Condvar::new());
        let thread_id = std::sync::Arc::new(Mutex::new(None));

        let inner_for_thread = std::sync::Arc::clone(&inner);
        let cvar_for_thread = std::sync::Arc::clone(&cvar);
        let thread_id_for_thread = std::sync::Arc::clone(&thread_id);

        let join_handle = thread::Builder::new()
            .name("message-thread".into())
            .spawn(move || {
                *thread_id_for_thread.lock().unwrap() = Some(thread::current().id());
                Self::run(inner_for_thread, cvar_for_thread);
            })
            .expect("failed to spawn message thread");

        Self {
            inner,
            cvar,
            next_id: std::sync::Arc::new(AtomicU64::new(1)),
            thread_id,
            join_handle: Some(join_handle),
        }
    }

    fn run(inner: std::sync::Arc<Mutex<Inner>>, cvar: std::sync::Arc<Condvar>) {
        let mut guard = inner.lock().unwrap();
        loop {
            if !guard.running {
                return;
            }

            let now = Instant::now();
            let wait_until = guard.queue.keys().next().map(|(at, _)| *at);

            guard = match wait_until {
                None => cvar.wait(guard).unwrap(),
                Some(at) if at > now => {
                    let (g, _timeout_result) = cvar.wait_timeout(guard, at - now).unwrap();
                    g
                }
                Some(_) => guard,
            };

            if !guard.running {
                return;
            }

            let now = Instant::now();
            let mut due_keys = Vec::new();
            for (&(at, id), _) in guard.queue.iter() {
                if at <= now {
                    due_keys.push((at, id));
                } else {
                    break;
                }
            }

            let mut due_messages = Vec::with_capacity(due_keys.len());
            for key in &due_keys {
                if let Some(msg) = guard.queue.remove(key) {
                    guard.id_keys.remove(&msg.id);
                    due_messages.push(msg);
                }
            }

            drop(guard);

            for mut msg in due_messages {
                CANCEL_CURRENT.with(|c| c.set(false));
                (msg.func)();
                let cancelled = CANCEL_CURRENT.with(|c| c.get());

                if !cancelled {
                    if let Some(interval) = msg.interval {
                        let next_at = Instant::now() + interval;
                        let mut guard = inner.lock().unwrap();
                        guard.id_keys.insert(msg.id, next_at);
                        guard.queue.insert((next_at, msg.id), msg);
                    }
                }
            }

            guard = inner.lock().unwrap();
        }
    }

    /// Schedules `func` to run after `delay` (0 means "as soon as
    /// possible"), repeating every `interval` if `Some`. Returns an id
    /// usable with [`Self::cancel`].
    pub fn post(
        &self,
        func: impl FnMut() + Send + 'static,
        delay: Duration,
        interval: Option<Duration>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let deliver_at = Instant::now() + delay;
        let msg = PendingMessage { id, interval, func: Box::new(func) };

        {
            let mut guard = self.inner.lock().unwrap();
            guard.id_keys.insert(id, deliver_at);
            guard.queue.insert((deliver_at, id), msg);
        }

        let is_current = self
            .thread_id
            .lock()
            .unwrap()
            .map(|tid| tid == thread::current().id())
            .unwrap_or(false);
        if !is_current {
            self.cvar.notify_one();
        }
        id
    }

    pub fn cancel(&self, id: u64) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(at) = guard.id_keys.remove(&id) {
            guard.queue.remove(&(at, id));
        }
    }

    /// Call only from within a running callback on this same scheduler
    /// thread, to suppress its own re-scheduling.
    pub fn cancel_self(&self) {
        CANCEL_CURRENT.with(|c| c.set(true));
    }

    pub fn stop(&mut self) {
        {
            let mut guard = self.inner.lock().unwrap();
            if !guard.running {
                return;
            }
            guard.running = false;
        }
        self.cvar.notify_one();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MessageThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Default for MessageThread {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn post_runs_after_delay() {
        let mt = MessageThread::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        mt.post(move || { hits2.fetch_add(1, Ordering::SeqCst); }, Duration::from_millis(10), None);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_prevents_delivery() {
        let mt = MessageThread::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let id = mt.post(move || { hits2.fetch_add(1, Ordering::SeqCst); }, Duration::from_millis(50), None);
        mt.cancel(id);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn interval_reschedules_until_cancel_self() {
        let mt = MessageThread::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        mt.post(
            move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(10),
            Some(Duration::from_millis(10)),
        );
        thread::sleep(Duration::from_millis(100));
        assert!(hits.load(Ordering::SeqCst) >= 5);
    }

    #[test]
    fn bounded_queue_blocks_until_capacity_frees() {
        let (tx, rx) = crossbeam_channel::bounded::<i32>(1);
        tx.send(1).unwrap();
        let tx2 = tx.clone();
        let handle = thread::spawn(move || {
            tx2.send(2).unwrap();
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(rx.recv().unwrap(), 1);
        handle.join().unwrap();
        assert_eq!(rx.recv().unwrap(), 2);
    }
}
