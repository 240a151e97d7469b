// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Compression off-thread. Encoding runs significantly slower than the
//! capture rate, so each compression-capable stream hands finished source
//! buffers to a dedicated worker with its own FIFO and reports completion
//! back to the stream asynchronously.

use crate::{
    engine::{CompressionEngine, CompressionParams, EncodeScope, ResultSink},
    error::{Result, RouterError},
    stream::{PortLink, StreamId},
};
use crate::buffer::Surface;
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, warn};

/// One encode request: source surface, destination surface, and the
/// per-job settings. The thumbnail (when requested) is produced from the
/// same source as part of the same logical job.
pub(crate) struct CompressJob {
    pub frame: u64,
    pub src: Surface,
    pub dst: Surface,
    pub params: CompressionParams,
}

enum CompressMsg {
    Encode(CompressJob),
    Wake,
    Exit,
}

struct QueueState {
    queued: usize,
    busy: bool,
}

struct CompressShared {
    bypass: AtomicBool,
    state: Mutex<QueueState>,
    done: Condvar,
}

/// Sending half handed to the stream worker.
pub(crate) struct CompressionClient {
    tx: kanal::Sender<CompressMsg>,
    shared: Arc<CompressShared>,
}

impl CompressionClient {
    pub(crate) fn encode(&self, job: CompressJob) -> Result<()> {
        self.shared.state.lock().queued += 1;
        match self.tx.send(CompressMsg::Encode(job)) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.shared.state.lock().queued -= 1;
                Err(RouterError::ShutDown)
            }
        }
    }
}

/// Dedicated encode thread for one compression-capable stream.
///
/// Jobs drain strictly in order. `flush` sets the bypass flag, wakes the
/// thread, and blocks the caller until the queue is empty and no job is
/// mid-flight; bypassed jobs skip the encode and complete as errors
/// through the owning stream's normal path.
pub(crate) struct CompressionWorker {
    tx: kanal::Sender<CompressMsg>,
    shared: Arc<CompressShared>,
    thread: Option<JoinHandle<()>>,
}

impl CompressionWorker {
    pub(crate) fn spawn(
        stream: StreamId,
        engine: Box<dyn CompressionEngine>,
        port: Weak<PortLink>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        let (tx, rx) = kanal::unbounded();
        let shared = Arc::new(CompressShared {
            bypass: AtomicBool::new(false),
            state: Mutex::new(QueueState {
                queued: 0,
                busy: false,
            }),
            done: Condvar::new(),
        });

        let worker = CompressThread {
            stream,
            rx,
            shared: shared.clone(),
            engine,
            open_scope: None,
            port,
            sink,
        };
        let thread = thread::Builder::new()
            .name(format!("compress-{stream}"))
            .spawn(move || worker.run())
            .map_err(|e| RouterError::Resource(format!("compression thread: {e}")))?;

        Ok(Self {
            tx,
            shared,
            thread: Some(thread),
        })
    }

    pub(crate) fn client(&self) -> CompressionClient {
        CompressionClient {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn set_bypass(&self, on: bool) {
        self.shared.bypass.store(on, Ordering::Release);
    }

    /// Blocks until the queue is empty and nothing is mid-encode. Bypass
    /// is held for the duration so queued jobs skip their encode.
    pub(crate) fn flush(&self) {
        self.shared.bypass.store(true, Ordering::Release);
        let _ = self.tx.send(CompressMsg::Wake);

        let mut state = self.shared.state.lock();
        while state.queued > 0 || state.busy {
            self.shared.done.wait(&mut state);
        }
        drop(state);

        self.shared.bypass.store(false, Ordering::Release);
    }

    pub(crate) fn shutdown(mut self) {
        self.shared.bypass.store(true, Ordering::Release);
        let _ = self.tx.send(CompressMsg::Exit);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("compression thread panicked");
            }
        }
    }
}

struct CompressThread {
    stream: StreamId,
    rx: kanal::Receiver<CompressMsg>,
    shared: Arc<CompressShared>,
    engine: Box<dyn CompressionEngine>,
    open_scope: Option<EncodeScope>,
    port: Weak<PortLink>,
    sink: Arc<dyn ResultSink>,
}

impl CompressThread {
    fn run(mut self) {
        while let Ok(msg) = self.rx.recv() {
            match msg {
                CompressMsg::Encode(job) => {
                    {
                        let mut state = self.shared.state.lock();
                        state.queued -= 1;
                        state.busy = true;
                    }
                    self.process(job);
                    let mut state = self.shared.state.lock();
                    state.busy = false;
                    if state.queued == 0 {
                        self.shared.done.notify_all();
                    }
                }
                CompressMsg::Wake => {
                    let state = self.shared.state.lock();
                    if state.queued == 0 && !state.busy {
                        self.shared.done.notify_all();
                    }
                }
                CompressMsg::Exit => break,
            }
        }
        self.engine.close();
        debug!(stream = %self.stream, "compression worker exited");
    }

    fn process(&mut self, job: CompressJob) {
        let frame = job.frame;
        let ok = if self.shared.bypass.load(Ordering::Acquire) {
            false
        } else {
            match self.encode(&job) {
                Ok(bytes) => {
                    debug!(stream = %self.stream, frame, bytes, "encoded");
                    true
                }
                Err(e) => {
                    warn!(stream = %self.stream, frame, error = %e, "encode failed");
                    self.sink.notify_error(&e);
                    false
                }
            }
        };

        match self.port.upgrade() {
            Some(link) => link.compression_done(frame, ok),
            None => debug!(stream = %self.stream, frame, "owning stream gone, result dropped"),
        }
    }

    fn encode(&mut self, job: &CompressJob) -> Result<usize> {
        let scope = match job.params.thumbnail_size {
            Some(_) => EncodeScope::PrimaryWithThumbnail,
            None => EncodeScope::Primary,
        };

        // a scope change requires the engine to be reopened
        if self.open_scope != Some(scope) {
            if self.open_scope.is_some() {
                self.engine.close();
                self.open_scope = None;
            }
            self.engine
                .open(scope)
                .map_err(|e| RouterError::buffer(self.stream, job.frame, e.to_string()))?;
            self.open_scope = Some(scope);
        }

        self.engine
            .configure(&job.params)
            .map_err(|e| RouterError::buffer(self.stream, job.frame, e.to_string()))?;

        let thumbnail = job.params.thumbnail_size.map(|_| &job.src);
        self.engine
            .encode(&job.src, thumbnail, &job.dst)
            .map_err(|e| RouterError::buffer(self.stream, job.frame, e.to_string()))
    }
}
