//! Single-threaded ordered task dispatcher.
//!
//! All registry and engine state in this crate is mutated only by tasks
//! drained from one of these queues. Transport callbacks capture their
//! payload and post a task; application entry points do the same for any
//! multi-step work. Tasks posted from one thread run in posting order.

use std::sync::mpsc::{channel, Sender};
use std::thread::{self, JoinHandle};

use log::warn;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Shutdown,
}

/// An ordered task queue drained by one owned worker thread.
pub struct Dispatcher {
    tx: Sender<Message>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawns the worker thread. `name` shows up in thread listings.
    pub fn new(name: &str) -> Self {
        let (tx, rx) = channel::<Message>();
        let builder = thread::Builder::new().name(name.to_string());
        let worker = builder
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        Message::Run(task) => task(),
                        Message::Shutdown => break,
                    }
                }
            })
            .ok();
        if worker.is_none() {
            warn!("dispatcher worker thread failed to start; tasks will be dropped");
        }
        Dispatcher { tx, worker }
    }

    /// Enqueues a task. Tasks posted from the same thread execute in order.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Message::Run(Box::new(task))).is_err() {
            warn!("dispatcher queue closed; task dropped");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Already-queued tasks drain before the worker exits.
        let _ = self.tx.send(Message::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;

    #[test]
    fn tasks_run_in_posting_order() {
        let dispatcher = Dispatcher::new("test-dispatch");
        let (tx, rx) = channel();
        for i in 0..100 {
            let tx = tx.clone();
            dispatcher.post(move || {
                let _ = tx.send(i);
            });
        }
        let drained: Vec<i32> = (0..100).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(drained, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn drop_drains_pending_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let dispatcher = Dispatcher::new("test-drain");
            for _ in 0..50 {
                let counter = Arc::clone(&counter);
                dispatcher.post(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}
