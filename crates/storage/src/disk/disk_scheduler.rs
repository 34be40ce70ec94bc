use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use bytes::{Bytes, BytesMut};
use log::error;

use super::disk_manager::DiskManager;
use crate::typedef::PageId;

/// The payload of a disk request. A write carries an owned copy of the page
/// image; a read carries the shared destination buffer, which the caller must
/// keep alive until the completion signal fires.
pub enum DiskData {
    Write(Bytes),
    Read(Arc<Mutex<BytesMut>>),
}

/// A single read or write for the disk manager to execute.
pub struct DiskRequest {
    /// Id of the page being read from / written to disk.
    pub page_id: PageId,
    /// The data to write, or the buffer to read into.
    pub data: DiskData,
    /// Signals the request issuer once the request has completed.
    pub done: DiskPromise,
}

#[derive(Debug, Default)]
struct CompletionState {
    value: Mutex<Option<bool>>,
    ready: Condvar,
}

/// The producer half of a single-use completion signal.
#[derive(Debug)]
pub struct DiskPromise {
    state: Arc<CompletionState>,
}

impl DiskPromise {
    /// Fulfills the promise, waking the waiting future. Consumes the promise;
    /// a completion signal fires exactly once.
    pub fn set_value(self, value: bool) {
        let mut slot = self.state.value.lock().unwrap();
        debug_assert!(slot.is_none(), "completion signal fulfilled twice");
        *slot = Some(value);
        self.state.ready.notify_one();
    }
}

/// The consumer half of a single-use completion signal.
#[derive(Debug)]
pub struct DiskFuture {
    state: Arc<CompletionState>,
}

impl DiskFuture {
    /// Blocks until the paired promise is fulfilled.
    pub fn wait(self) -> bool {
        let mut slot = self.state.value.lock().unwrap();
        while slot.is_none() {
            slot = self.state.ready.wait(slot).unwrap();
        }
        slot.unwrap()
    }
}

/// Schedules disk read and write operations.
///
/// A request is scheduled by calling [`DiskScheduler::schedule`] with a
/// [`DiskRequest`]. A background worker thread, spawned at construction and
/// joined on drop, pops requests off a shared queue and executes them through
/// the disk manager strictly in enqueue order. The queue's `None` sentinel
/// tells the worker to exit.
#[derive(Debug)]
pub struct DiskScheduler {
    request_tx: Sender<Option<DiskRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl DiskScheduler {
    /// Creates the scheduler and spawns its worker thread.
    pub fn new(disk_manager: Arc<Mutex<DiskManager>>) -> Self {
        let (request_tx, request_rx) = mpsc::channel::<Option<DiskRequest>>();

        let worker = std::thread::spawn(move || {
            while let Ok(Some(request)) = request_rx.recv() {
                let DiskRequest {
                    page_id,
                    data,
                    done,
                } = request;
                let mut disk = disk_manager.lock().unwrap();
                let result = match data {
                    DiskData::Write(image) => disk.write(page_id, &image),
                    DiskData::Read(buffer) => {
                        let result = disk.read(page_id).map(|bytes| {
                            buffer.lock().unwrap().copy_from_slice(&bytes);
                        });
                        // Give the buffer back before signalling, so the
                        // issuer can reclaim sole ownership of it.
                        drop(buffer);
                        result
                    }
                };
                if let Err(e) = &result {
                    error!("disk request for page {} failed: {}", page_id, e);
                }
                done.set_value(result.is_ok());
            }
        });

        Self {
            request_tx,
            worker: Some(worker),
        }
    }

    /// Creates a paired completion signal for a request.
    pub fn create_promise() -> (DiskPromise, DiskFuture) {
        let state = Arc::new(CompletionState::default());
        (
            DiskPromise {
                state: Arc::clone(&state),
            },
            DiskFuture { state },
        )
    }

    /// Enqueues a request for the worker to execute. Never blocks beyond the
    /// queue synchronization itself.
    pub fn schedule(&self, request: DiskRequest) {
        self.request_tx
            .send(Some(request))
            .expect("Disk scheduler worker has terminated");
    }
}

impl Drop for DiskScheduler {
    /// Enqueues the shutdown sentinel and joins the worker.
    fn drop(&mut self) {
        let _ = self.request_tx.send(None);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
