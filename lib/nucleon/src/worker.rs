use crate::mailbox::Mailbox;
use crate::monitor::WorkerMonitor;
use crate::node::NodeShared;
use std::sync::Arc;

// Per-worker drain weights: the first few workers take one message at a
// time for latency, later ones drain progressively deeper batches for
// throughput.
const WEIGHTS: [i32; 32] = [
    -1, -1, -1, -1, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3,
    3, 3,
];

/// Batch weight for worker `index`.
#[inline]
pub fn weight(index: usize) -> i32 {
    if index < WEIGHTS.len() {
        WEIGHTS[index]
    } else {
        0
    }
}

/// Drain one batch from one mailbox and hand back the next mailbox to work
/// on (so an idle global queue keeps the current one hot). `None` means the
/// worker should park.
pub(crate) fn dispatch(
    node: &Arc<NodeShared>,
    monitor: &WorkerMonitor,
    queue: Option<Arc<Mailbox>>,
    weight: i32,
) -> Option<Arc<Mailbox>> {
    let queue = match queue {
        Some(queue) => queue,
        None => node.global.pop()?,
    };

    let handle = queue.handle();
    let ctx = match node.registry.grab(handle) {
        Some(ctx) => ctx,
        None => {
            // Owner is gone; queued messages bounce back to their senders
            // via the drop handler.
            queue.release_or_requeue(&node.global, |msg| node.drop_message(handle, msg));
            return node.global.pop();
        }
    };

    let mut batch = 1usize;
    let mut processed = 0usize;
    while processed < batch {
        let msg = match queue.pop() {
            Some(msg) => msg,
            None => return node.global.pop(),
        };
        if processed == 0 && weight >= 0 {
            batch = queue.len() >> weight;
        }

        let overload = queue.take_overload();
        if overload > 0 {
            node.service_error(
                handle,
                &format!("May overload, message queue length = {}", overload),
            );
        }

        monitor.trigger(msg.source, handle);
        ctx.dispatch(msg);
        monitor.trigger(0, 0);

        processed += 1;
    }

    // Yield: if other mailboxes are ready, requeue ours behind them so no
    // worker monopolizes one service.
    match node.global.pop() {
        Some(next) => {
            node.global.push(queue);
            Some(next)
        }
        None => Some(queue),
    }
}

/// Body of one worker thread.
pub(crate) fn worker_main(node: Arc<NodeShared>, monitor: Arc<WorkerMonitor>, weight: i32) {
    let mut queue = None;
    loop {
        queue = dispatch(&node, &monitor, queue.take(), weight);
        if queue.is_none() && !node.global.wait() {
            return;
        }
    }
}
