//! Cancellable delayed jobs, one worker thread per job.
//!
//! A [`DelayedTask`] runs its job once, `delay` after the last `schedule`.
//! Scheduling again replaces the pending run. The job receives the cookie it
//! was scheduled with; owners pass a generation number so a job that was
//! already running when it got cancelled can tell it is stale.

use crate::error::{EncoderError, Result};
use crate::sync::MayBlock;
use crossbeam_channel::{select, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

enum Command {
    Schedule { at: Instant, seq: u64, cookie: u64 },
    Cancel { ack: Option<Sender<()>> },
    Shutdown,
}

pub struct DelayedTask {
    name: &'static str,
    tx: Sender<Command>,
    /// Sequence number of the armed run, 0 when nothing is armed
    armed: Arc<AtomicU64>,
    next_seq: AtomicU64,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl DelayedTask {
    pub fn spawn<F>(name: &'static str, job: F) -> Result<Self>
    where
        F: FnMut(u64) + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let armed = Arc::new(AtomicU64::new(0));

        let worker = {
            let armed = armed.clone();
            thread::Builder::new()
                .name(format!("{}-worker", name))
                .spawn(move || run(rx, armed, job))
                .map_err(|e| {
                    log::error!("Could not spawn {} worker: {}", name, e);
                    EncoderError::WorkerSpawn(name)
                })?
        };
        let worker_id = worker.thread().id();

        Ok(Self {
            name,
            tx,
            armed,
            next_seq: AtomicU64::new(1),
            worker: Some(worker),
            worker_id,
        })
    }

    /// Run the job `delay` from now, replacing any pending run. Never blocks.
    pub fn schedule(&self, delay: Duration, cookie: u64) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.armed.store(seq, Ordering::SeqCst);
        let at = Instant::now() + delay;
        if self.tx.send(Command::Schedule { at, seq, cookie }).is_err() {
            log::warn!("{} worker is gone; dropping schedule", self.name);
            self.armed.store(0, Ordering::SeqCst);
        }
    }

    /// Drop the pending run, if any. Never blocks; a job that already
    /// started keeps running.
    pub fn cancel(&self) {
        self.armed.store(0, Ordering::SeqCst);
        let _ = self.tx.send(Command::Cancel { ack: None });
    }

    /// Drop the pending run and wait for a running job to return.
    ///
    /// Called from the job itself this degrades to [`cancel`](Self::cancel).
    pub fn cancel_sync(&self, _token: &mut MayBlock) {
        if thread::current().id() == self.worker_id {
            self.cancel();
            return;
        }
        self.armed.store(0, Ordering::SeqCst);
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.tx.send(Command::Cancel { ack: Some(ack_tx) }).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.armed.load(Ordering::SeqCst) != 0
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        self.armed.store(0, Ordering::SeqCst);
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            // The last owner may be the job itself
            if thread::current().id() != self.worker_id && worker.join().is_err() {
                log::error!("{} worker panicked", self.name);
            }
        }
    }
}

fn run<F>(rx: Receiver<Command>, armed: Arc<AtomicU64>, mut job: F)
where
    F: FnMut(u64),
{
    let mut deadline: Option<(Instant, u64, u64)> = None;

    loop {
        let timer = match deadline {
            Some((at, _, _)) => crossbeam_channel::at(at),
            None => crossbeam_channel::never(),
        };

        select! {
            recv(rx) -> cmd => match cmd {
                Ok(Command::Schedule { at, seq, cookie }) => deadline = Some((at, seq, cookie)),
                Ok(Command::Cancel { ack }) => {
                    deadline = None;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                Ok(Command::Shutdown) | Err(_) => break,
            },
            recv(timer) -> _ => {
                if let Some((_, seq, cookie)) = deadline.take() {
                    // A newer schedule may already be queued behind us
                    let _ = armed.compare_exchange(seq, 0, Ordering::SeqCst, Ordering::SeqCst);
                    job(cookie);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<u64>>>, impl FnMut(u64) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |cookie| sink.lock().push(cookie))
    }

    #[test]
    fn runs_once_after_delay() {
        let (seen, job) = recorder();
        let task = DelayedTask::spawn("test", job).unwrap();

        task.schedule(Duration::from_millis(10), 7);
        assert!(task.is_pending());
        thread::sleep(Duration::from_millis(100));

        assert_eq!(*seen.lock(), vec![7]);
        assert!(!task.is_pending());
    }

    #[test]
    fn reschedule_replaces_pending_run() {
        let (seen, job) = recorder();
        let task = DelayedTask::spawn("test", job).unwrap();

        task.schedule(Duration::from_millis(30), 1);
        task.schedule(Duration::from_millis(30), 2);
        thread::sleep(Duration::from_millis(150));

        assert_eq!(*seen.lock(), vec![2]);
    }

    #[test]
    fn cancel_sync_prevents_run() {
        let (seen, job) = recorder();
        let task = DelayedTask::spawn("test", job).unwrap();
        let mut token = MayBlock::process_context();

        task.schedule(Duration::from_millis(20), 3);
        task.cancel_sync(&mut token);
        assert!(!task.is_pending());
        thread::sleep(Duration::from_millis(60));

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn cancel_sync_waits_for_running_job() {
        let done = Arc::new(AtomicU64::new(0));
        let flag = done.clone();
        let task = DelayedTask::spawn("slow", move |_| {
            thread::sleep(Duration::from_millis(50));
            flag.store(1, Ordering::SeqCst);
        })
        .unwrap();
        let mut token = MayBlock::process_context();

        task.schedule(Duration::ZERO, 0);
        thread::sleep(Duration::from_millis(15));
        task.cancel_sync(&mut token);

        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
