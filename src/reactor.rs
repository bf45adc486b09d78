//! Completion reactor.
//!
//! One thread per bridge polls the backend for finished commands and drives
//! the completion path. The backend lock is held only for the poll itself;
//! retirement runs lock-free with respect to the backend so submissions are
//! never stalled behind guest-memory copies.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::device::{lock, Shared};
use crate::backend::StorageBackend;

pub(crate) fn run<B: StorageBackend>(shared: Arc<Shared<B>>) {
    let batch = shared.config.poll_batch;
    let idle = Duration::from_micros(shared.config.idle_backoff_us.max(1));
    let mut completions = Vec::with_capacity(batch);

    while !shared.shutdown.load(Ordering::Acquire) {
        completions.clear();
        let reaped = match lock(&shared.backend) {
            Ok(mut backend) => backend.poll_completions(&mut completions, batch),
            Err(e) => {
                log::error!("reactor stopping, backend lock unusable: {e}");
                return;
            }
        };
        for completion in completions.drain(..) {
            shared.complete_one(completion);
        }
        if reaped == 0 {
            thread::sleep(idle);
        } else {
            thread::yield_now();
        }
    }
}
