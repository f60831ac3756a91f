use crate::handle::Handle;
use crate::message::Message;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

const DEFAULT_QUEUE_SIZE: usize = 64;
const OVERLOAD_THRESHOLD: usize = 1024;

struct Inner {
    queue: VecDeque<Message>,
    // Membership invariant: this mailbox is in the global queue iff in_global
    // is set. A new mailbox starts set so it cannot be scheduled before its
    // service finishes init; the creator pushes it explicitly afterwards.
    in_global: bool,
    release: bool,
    overload: usize,
    overload_threshold: usize,
}

/// Per-service FIFO of messages.
pub struct Mailbox {
    handle: Handle,
    inner: Mutex<Inner>,
}

impl Mailbox {
    pub fn new(handle: Handle) -> Arc<Mailbox> {
        Arc::new(Mailbox {
            handle,
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(DEFAULT_QUEUE_SIZE),
                in_global: true,
                release: false,
                overload: 0,
                overload_threshold: OVERLOAD_THRESHOLD,
            }),
        })
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Append a message. If the mailbox was idle it is handed to the global
    /// queue so a worker picks it up.
    pub fn push(self: &Arc<Self>, msg: Message, global: &GlobalQueue) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(msg);
        if !inner.in_global {
            inner.in_global = true;
            global.push(self.clone());
        }
    }

    /// Pop in FIFO order. Observing empty clears `in_global` atomically with
    /// the pop, and resets the overload threshold.
    pub fn pop(&self) -> Option<Message> {
        let mut inner = self.inner.lock().unwrap();
        match inner.queue.pop_front() {
            Some(msg) => {
                let length = inner.queue.len();
                while length > inner.overload_threshold {
                    inner.overload = length;
                    inner.overload_threshold *= 2;
                }
                Some(msg)
            }
            None => {
                inner.overload_threshold = OVERLOAD_THRESHOLD;
                inner.in_global = false;
                None
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Read and clear the overload length recorded by `pop`. Non-zero once
    /// per crossed (doubling) threshold, which bounds the warning count to
    /// log2 of the peak depth.
    pub fn take_overload(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        std::mem::replace(&mut inner.overload, 0)
    }

    /// Flag the mailbox for deletion once drained. Called when the owning
    /// context is destroyed; ensures the mailbox reaches a worker so queued
    /// messages pass through the drop handler.
    pub fn mark_release(self: &Arc<Self>, global: &GlobalQueue) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(!inner.release);
        inner.release = true;
        if !inner.in_global {
            inner.in_global = true;
            global.push(self.clone());
        }
    }

    /// Called by a worker that popped this mailbox but found no live context.
    /// If the release flag is set the queue is drained through `drop_fn`;
    /// otherwise the mailbox is requeued to wait for the flag.
    pub fn release_or_requeue<F>(self: &Arc<Self>, global: &GlobalQueue, drop_fn: F)
    where
        F: Fn(Message),
    {
        let flagged = {
            let inner = self.inner.lock().unwrap();
            inner.release
        };
        if flagged {
            while let Some(msg) = self.pop() {
                drop_fn(msg);
            }
        } else {
            let mut inner = self.inner.lock().unwrap();
            inner.in_global = true;
            global.push(self.clone());
        }
    }

    #[cfg(test)]
    pub(crate) fn in_global(&self) -> bool {
        self.inner.lock().unwrap().in_global
    }
}

struct GlobalInner {
    queue: VecDeque<Arc<Mailbox>>,
    quit: bool,
}

/// Process-wide FIFO of mailboxes with pending work. Workers park on the
/// condvar when it runs dry.
pub struct GlobalQueue {
    inner: Mutex<GlobalInner>,
    ready: Condvar,
}

impl GlobalQueue {
    pub fn new() -> GlobalQueue {
        GlobalQueue {
            inner: Mutex::new(GlobalInner {
                queue: VecDeque::new(),
                quit: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn push(&self, mailbox: Arc<Mailbox>) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(mailbox);
        drop(inner);
        self.ready.notify_one();
    }

    pub fn pop(&self) -> Option<Arc<Mailbox>> {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.pop_front()
    }

    /// Block until the queue is (probably) non-empty. Returns false when the
    /// runtime is quitting and the worker should exit instead.
    pub fn wait(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.queue.is_empty() && !inner.quit {
            inner = self.ready.wait(inner).unwrap();
        }
        !inner.quit
    }

    /// Wake every parked worker and make subsequent `wait` calls fail.
    pub fn quit(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.quit = true;
        drop(inner);
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Payload, ProtocolId};

    fn msg(session: i32) -> Message {
        Message::new(0, session, ProtocolId::TEXT, Payload::Empty)
    }

    #[test]
    fn test_fifo() {
        let global = GlobalQueue::new();
        let mbox = Mailbox::new(1);

        for i in 0..10 {
            mbox.push(msg(i), &global);
        }
        for i in 0..10 {
            assert_eq!(mbox.pop().unwrap().session, i);
        }
        assert!(mbox.pop().is_none());
    }

    #[test]
    fn test_global_membership_invariant() {
        let global = GlobalQueue::new();
        let mbox = Mailbox::new(1);

        // A new mailbox claims membership so it cannot be scheduled early.
        assert!(mbox.in_global());
        assert_eq!(global.len(), 0);

        // Drain to empty: membership clears with the pop that observed empty.
        mbox.push(msg(1), &global);
        assert_eq!(mbox.pop().unwrap().session, 1);
        assert!(mbox.pop().is_none());
        assert!(!mbox.in_global());

        // Next push enqueues exactly once.
        mbox.push(msg(2), &global);
        mbox.push(msg(3), &global);
        assert!(mbox.in_global());
        assert_eq!(global.len(), 1);
        assert!(Arc::ptr_eq(&global.pop().unwrap(), &mbox));
        assert_eq!(global.len(), 0);
    }

    #[test]
    fn test_overload_doubles() {
        let global = GlobalQueue::new();
        let mbox = Mailbox::new(1);

        // The receiver is stuck while senders pile up past the first
        // threshold, then drains a little, then the pile grows past the
        // doubled threshold.
        for i in 0..1500 {
            mbox.push(msg(i), &global);
        }

        fn drain(mbox: &Arc<Mailbox>, n: usize, warnings: &mut Vec<usize>) {
            for _ in 0..n {
                mbox.pop().unwrap();
                let overload = mbox.take_overload();
                if overload > 0 {
                    warnings.push(overload);
                }
            }
        }

        let mut warnings = Vec::new();
        drain(&mbox, 100, &mut warnings);
        // One warning at the 1024 crossing; the threshold is now 2048.
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0] > 1024);

        for i in 0..800 {
            mbox.push(msg(i), &global);
        }
        drain(&mbox, 2200, &mut warnings);
        // Exactly one more, at the 2048 crossing; nothing in between.
        assert_eq!(warnings.len(), 2);
        assert!(warnings[1] > 2048);

        // Draining empty resets the threshold back to the base.
        assert!(mbox.pop().is_none());
        for i in 0..1100 {
            mbox.push(msg(i), &global);
        }
        drain(&mbox, 1, &mut warnings);
        assert_eq!(warnings.len(), 3);
        assert!(warnings[2] > 1024 && warnings[2] < 2048);
    }

    #[test]
    fn test_release_requeues_until_flagged() {
        let global = GlobalQueue::new();
        let mbox = Mailbox::new(1);

        mbox.push(msg(7), &global);
        assert!(Arc::ptr_eq(&global.pop().unwrap(), &mbox));

        // Not flagged yet: goes back to the global queue.
        mbox.release_or_requeue(&global, |_m| panic!("must not drop yet"));
        assert_eq!(global.len(), 1);

        mbox.mark_release(&global);
        let dropped = std::cell::Cell::new(0);
        let requeued = global.pop().unwrap();
        requeued.release_or_requeue(&global, |_m| dropped.set(dropped.get() + 1));
        assert_eq!(dropped.get(), 1);
        assert!(mbox.pop().is_none());
    }

    #[test]
    fn test_quit_wakes_waiters() {
        let global = Arc::new(GlobalQueue::new());
        let g = global.clone();
        let waiter = std::thread::spawn(move || g.wait());
        std::thread::sleep(std::time::Duration::from_millis(20));
        global.quit();
        assert!(!waiter.join().unwrap());
    }
}
