// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Bounded worker pool for background spill writes.
//!
//! The pool is explicit and injected: containers hand off a prepared write
//! task and receive completion through a channel they own. A small thread
//! count keeps disk I/O from being saturated; the bounded queue refuses
//! excess tasks so callers degrade to writing inline instead of blocking
//! indefinitely.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

pub type SpillIoTask = Box<dyn FnOnce() + Send + 'static>;

pub struct SpillIoExecutor {
    inner: Arc<Inner>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

struct Inner {
    queue: Mutex<VecDeque<SpillIoTask>>,
    cv: Condvar,
    capacity: usize,
    shutdown: AtomicBool,
}

impl SpillIoExecutor {
    pub fn new(num_threads: usize, queue_capacity: usize) -> Arc<Self> {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            capacity: queue_capacity.max(1),
            shutdown: AtomicBool::new(false),
        });
        let mut workers = Vec::with_capacity(num_threads.max(1));
        for _ in 0..num_threads.max(1) {
            let inner_clone = Arc::clone(&inner);
            workers.push(thread::spawn(move || worker_loop(inner_clone)));
        }
        Arc::new(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Submit a task, returning it back to the caller if the queue is full
    /// or the pool has shut down. The caller then runs the task inline.
    pub fn try_submit(&self, task: SpillIoTask) -> Result<(), SpillIoTask> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(task);
        }
        let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.inner.capacity {
            return Err(task);
        }
        queue.push_back(task);
        drop(queue);
        self.inner.cv.notify_one();
        Ok(())
    }

    pub fn queued_tasks(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Stop accepting work, drain nothing further, and join the workers.
    /// Already dequeued tasks run to completion.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.cv.notify_all();
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SpillIoExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let task = {
            let mut queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                queue = inner
                    .cv
                    .wait(queue)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };
        match task {
            Some(task) => task(),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn tasks_run_and_complete() {
        let pool = SpillIoExecutor::new(2, 4);
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            loop {
                let tx = tx.clone();
                if pool
                    .try_submit(Box::new(move || {
                        let _ = tx.send(i);
                    }))
                    .is_ok()
                {
                    break;
                }
                thread::yield_now();
            }
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn full_queue_returns_task_to_caller() {
        let pool = SpillIoExecutor::new(1, 1);
        let blocker = Arc::new((Mutex::new(false), Condvar::new()));
        let blocker_clone = Arc::clone(&blocker);
        // Occupy the single worker.
        pool.try_submit(Box::new(move || {
            let (lock, cv) = &*blocker_clone;
            let mut done = lock.lock().unwrap();
            while !*done {
                done = cv.wait(done).unwrap();
            }
        }))
        .unwrap_or_else(|_| panic!("first submit must succeed"));
        // Wait for the worker to dequeue it, then fill the single queue slot.
        while pool.queued_tasks() > 0 {
            thread::yield_now();
        }
        pool.try_submit(Box::new(|| {}))
            .unwrap_or_else(|_| panic!("second submit must fill the queue"));
        // Worker is blocked, queue is full: the task comes back.
        assert!(pool.try_submit(Box::new(|| {})).is_err());
        let (lock, cv) = &*blocker;
        *lock.lock().unwrap() = true;
        cv.notify_all();
    }

    #[test]
    fn shutdown_joins_workers() {
        let pool = SpillIoExecutor::new(2, 2);
        pool.shutdown();
        assert!(pool.try_submit(Box::new(|| {})).is_err());
    }
}
