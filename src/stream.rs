// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-stream worker ports. Each configured output stream owns one
//! [`StreamPort`] with a dedicated dispatch thread, a bounded command
//! channel, and a depth gauge that doubles as the backpressure throttle
//! and the drain barrier. Compression-capable streams additionally own a
//! [`CompressionWorker`](crate::compress::CompressionWorker) so a slow
//! encode never stalls dispatch of sibling jobs.

use crate::{
    buffer::{BufferPool, NativeHandle, SharedBufferHandle, Surface},
    compress::{CompressJob, CompressionClient, CompressionWorker},
    engine::{
        BufferStatus, BufferTranslator, CompressionEngine, CompressionParams, ResultSink,
        StreamResult, TransformEngine,
    },
    error::{Result, RouterError},
    geometry::{aspect_crop, FourCC, Rect, Resolution},
};
use core::fmt;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, warn};

/// Stream identity, unique within one router.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a stream participates in routing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamRole {
    /// Client-visible stream receiving cropped/scaled frames.
    Output,
    /// Client-visible stream whose final step is a compression encode.
    Compressed,
    /// Internal synthetic stream holding intermediate zoom/TNR surfaces.
    /// Performs no transform and reports nothing to the client.
    Zoom,
}

/// Static configuration of one output stream.
#[derive(Copy, Clone, Debug)]
pub struct StreamDescriptor {
    pub id: StreamId,
    pub resolution: Resolution,
    pub format: FourCC,
    /// Upper bound on the stream's pending-job queue. Submissions block
    /// once this many jobs are in flight.
    pub max_buffers: usize,
    pub role: StreamRole,
}

/// Processing state of one pending job.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Queued, no hardware completion yet.
    Initial,
    /// Eligible for the worker's synchronous dispatch step.
    Ready,
    /// Completion arrived on a compression stream, hand-off pending.
    CompressionStart,
    /// Parked while the compression worker encodes.
    CompressionWait,
}

/// Per-(stream, frame) work record.
pub struct PendingJob {
    pub frame: u64,
    pub output: NativeHandle,
    pub state: JobState,
    pub source: Option<SharedBufferHandle>,
    /// Pooled surface owned by this job on zoom-role streams; returned to
    /// the pool at dispatch.
    pub zoom: Option<Surface>,
    pub settings: Option<CompressionParams>,
    pub failed: bool,
}

impl PendingJob {
    pub fn new(frame: u64, output: NativeHandle, settings: Option<CompressionParams>) -> Self {
        Self {
            frame,
            output,
            state: JobState::Initial,
            source: None,
            zoom: None,
            settings,
            failed: false,
        }
    }
}

pub(crate) enum PortCommand {
    Submit(PendingJob),
    Completed {
        frame: u64,
        source: SharedBufferHandle,
        failed: bool,
    },
    CompressionDone {
        frame: u64,
        ok: bool,
    },
    Wake,
    Exit,
}

/// Counter tracking how many jobs a port holds. One lock and condvar
/// serve both the submission throttle and the drain barrier.
pub(crate) struct DepthGauge {
    depth: Mutex<usize>,
    changed: Condvar,
}

impl DepthGauge {
    fn new() -> Self {
        Self {
            depth: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    /// Blocks while the queue is at `max`, then counts one new job.
    fn push_blocking(&self, max: usize) {
        let mut depth = self.depth.lock();
        while *depth >= max {
            self.changed.wait(&mut depth);
        }
        *depth += 1;
    }

    fn pop(&self) {
        let mut depth = self.depth.lock();
        debug_assert!(*depth > 0);
        *depth = depth.saturating_sub(1);
        self.changed.notify_all();
    }

    fn len(&self) -> usize {
        *self.depth.lock()
    }

    fn wait_below(&self, max: usize) {
        let mut depth = self.depth.lock();
        while *depth >= max {
            self.changed.wait(&mut depth);
        }
    }

    fn wait_drained(&self) {
        let mut depth = self.depth.lock();
        while *depth > 0 {
            self.changed.wait(&mut depth);
        }
    }
}

struct PortShared {
    gauge: DepthGauge,
    bypass: AtomicBool,
    alive: AtomicBool,
}

/// Command-channel endpoint a compression worker reports back through.
/// Held weakly so a torn-down port fails promotion instead of leaking.
pub(crate) struct PortLink {
    tx: kanal::Sender<PortCommand>,
}

impl PortLink {
    pub(crate) fn compression_done(&self, frame: u64, ok: bool) {
        if self.tx.send(PortCommand::CompressionDone { frame, ok }).is_err() {
            debug!(frame, "port channel closed, dropping compression result");
        }
    }
}

/// One configured output stream: descriptor, worker thread, command
/// channel, translation table, and optional compression worker.
pub struct StreamPort {
    desc: StreamDescriptor,
    shared: Arc<PortShared>,
    link: Arc<PortLink>,
    translator: Arc<Mutex<Box<dyn BufferTranslator>>>,
    compressor: Mutex<Option<CompressionWorker>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StreamPort {
    pub(crate) fn spawn(
        desc: StreamDescriptor,
        transform: Arc<dyn TransformEngine>,
        sink: Arc<dyn ResultSink>,
        translator: Box<dyn BufferTranslator>,
        pool: Option<Arc<BufferPool>>,
        engine: Option<Box<dyn CompressionEngine>>,
    ) -> Result<Self> {
        if desc.role == StreamRole::Compressed && engine.is_none() {
            return Err(RouterError::BadParameter(format!(
                "stream {} is compressed but no compression engine was supplied",
                desc.id
            )));
        }

        // Per-job traffic is at most one submit plus one completion plus
        // one compression notification; control messages ride the slack.
        let (tx, rx) = kanal::bounded(desc.max_buffers * 3 + 8);
        let shared = Arc::new(PortShared {
            gauge: DepthGauge::new(),
            bypass: AtomicBool::new(false),
            alive: AtomicBool::new(true),
        });
        let link = Arc::new(PortLink { tx });
        let translator = Arc::new(Mutex::new(translator));

        let compressor = match engine {
            Some(engine) => Some(CompressionWorker::spawn(
                desc.id,
                engine,
                Arc::downgrade(&link),
                sink.clone(),
            )?),
            None => None,
        };

        let worker = Worker {
            desc,
            rx,
            shared: shared.clone(),
            transform,
            sink,
            translator: translator.clone(),
            pool,
            compressor: compressor.as_ref().map(|c| c.client()),
            jobs: VecDeque::new(),
        };
        let thread = thread::Builder::new()
            .name(format!("stream-{}", desc.id))
            .spawn(move || worker.run())
            .map_err(|e| RouterError::Resource(format!("stream worker thread: {e}")))?;

        Ok(Self {
            desc,
            shared,
            link,
            translator,
            compressor: Mutex::new(compressor),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.desc
    }

    pub fn queue_len(&self) -> usize {
        self.shared.gauge.len()
    }

    /// Blocks until the stream has room for another job.
    pub fn wait_available(&self) {
        self.shared.gauge.wait_below(self.desc.max_buffers);
    }

    /// Enqueues a new job, blocking while the queue is at its bound.
    pub(crate) fn submit(&self, job: PendingJob) -> Result<()> {
        if !self.shared.alive.load(Ordering::Acquire) {
            return Err(RouterError::ShutDown);
        }
        self.shared.gauge.push_blocking(self.desc.max_buffers);
        match self.link.tx.send(PortCommand::Submit(job)) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.shared.gauge.pop();
                Err(RouterError::ShutDown)
            }
        }
    }

    /// Signals that the frame's source buffer is available. The reference
    /// the router took for this stream transfers to the worker.
    pub(crate) fn completed(&self, frame: u64, source: SharedBufferHandle, failed: bool) {
        let owner = source.owner() == Some(self.desc.id);
        if self
            .link
            .tx
            .send(PortCommand::Completed {
                frame,
                source: source.clone(),
                failed,
            })
            .is_err()
        {
            warn!(stream = %self.desc.id, frame, "port gone, dropping completion");
            if !owner {
                source.release();
            }
        }
    }

    /// Flush-protocol switch: while set, every job skips its transform or
    /// compression step and is returned immediately as an error.
    pub fn set_bypass(&self, on: bool) {
        self.shared.bypass.store(on, Ordering::Release);
        if let Some(compressor) = self.compressor.lock().as_ref() {
            compressor.set_bypass(on);
        }
        if on {
            let _ = self.link.tx.send(PortCommand::Wake);
        }
    }

    /// Blocks until the pending-job queue is empty.
    pub fn wait_drained(&self) {
        self.shared.gauge.wait_drained();
    }

    /// Drain step of a router-wide flush: bypass is already set on every
    /// port, so only the wait remains.
    pub(crate) fn drain(&self) {
        if let Some(compressor) = self.compressor.lock().as_ref() {
            compressor.flush();
        }
        self.shared.gauge.wait_drained();
    }

    /// Quiesces the stream: all queued and in-flight jobs complete
    /// immediately as errors, and the call returns once the queue is
    /// empty. Idempotent on a quiesced stream.
    pub fn flush(&self) {
        self.set_bypass(true);
        if let Some(compressor) = self.compressor.lock().as_ref() {
            compressor.flush();
        }
        self.wait_drained();
        self.set_bypass(false);
    }

    pub(crate) fn translate(&self, handle: NativeHandle) -> Option<Surface> {
        self.translator.lock().to_surface(handle)
    }

    /// Teardown: stop accepting work, drain the worker, join the thread,
    /// release the translation table.
    pub(crate) fn shutdown(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        self.shared.alive.store(false, Ordering::Release);
        self.set_bypass(true);
        if let Some(compressor) = self.compressor.lock().take() {
            compressor.shutdown();
        }
        let _ = self.link.tx.send(PortCommand::Exit);
        if thread.join().is_err() {
            warn!(stream = %self.desc.id, "worker thread panicked");
        }
        self.translator.lock().clear();
        debug!(stream = %self.desc.id, "stream port torn down");
    }
}

impl Drop for StreamPort {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    desc: StreamDescriptor,
    rx: kanal::Receiver<PortCommand>,
    shared: Arc<PortShared>,
    transform: Arc<dyn TransformEngine>,
    sink: Arc<dyn ResultSink>,
    translator: Arc<Mutex<Box<dyn BufferTranslator>>>,
    pool: Option<Arc<BufferPool>>,
    compressor: Option<CompressionClient>,
    jobs: VecDeque<PendingJob>,
}

impl Worker {
    fn run(mut self) {
        loop {
            if self.shared.bypass.load(Ordering::Acquire) {
                // flush drain: everything completes as an error right now
                while let Some(job) = self.jobs.pop_front() {
                    self.dispatch(job);
                }
            }

            // oldest Ready job first; Initial and CompressionWait jobs
            // stay queued in place so a slow sibling never blocks the head
            while let Some(idx) = self
                .jobs
                .iter()
                .position(|job| job.state == JobState::Ready)
            {
                if let Some(job) = self.jobs.remove(idx) {
                    self.dispatch(job);
                }
            }

            match self.rx.recv() {
                Ok(PortCommand::Submit(job)) => self.handle_submit(job),
                Ok(PortCommand::Completed {
                    frame,
                    source,
                    failed,
                }) => self.handle_completed(frame, source, failed),
                Ok(PortCommand::CompressionDone { frame, ok }) => {
                    self.handle_compression_done(frame, ok)
                }
                Ok(PortCommand::Wake) => {}
                Ok(PortCommand::Exit) | Err(_) => break,
            }
        }

        // teardown: whatever is left completes as an error
        while let Some(mut job) = self.jobs.pop_front() {
            job.failed = true;
            self.dispatch(job);
        }
    }

    fn handle_submit(&mut self, mut job: PendingJob) {
        if self.shared.bypass.load(Ordering::Acquire) {
            job.failed = true;
            self.dispatch(job);
            return;
        }
        debug_assert_eq!(job.state, JobState::Initial);
        self.jobs.push_back(job);
    }

    fn handle_completed(&mut self, frame: u64, source: SharedBufferHandle, failed: bool) {
        let Some(idx) = self
            .jobs
            .iter()
            .position(|job| job.frame == frame && job.state == JobState::Initial)
        else {
            // stream was flushed between submit and completion
            debug!(stream = %self.desc.id, frame, "completion for unknown job");
            if source.owner() != Some(self.desc.id) {
                source.release();
            }
            return;
        };

        let job = &mut self.jobs[idx];
        job.source = Some(source);
        job.failed |= failed;

        if self.desc.role == StreamRole::Compressed
            && !job.failed
            && !self.shared.bypass.load(Ordering::Acquire)
        {
            job.state = JobState::CompressionStart;
            self.start_compression(idx);
        } else {
            job.state = JobState::Ready;
        }
    }

    fn handle_compression_done(&mut self, frame: u64, ok: bool) {
        let Some(job) = self
            .jobs
            .iter_mut()
            .find(|job| job.frame == frame && job.state == JobState::CompressionWait)
        else {
            debug!(stream = %self.desc.id, frame, "compression result for unknown job");
            return;
        };
        job.failed |= !ok;
        job.state = JobState::Ready;
    }

    fn start_compression(&mut self, idx: usize) {
        let (frame, output, settings, src) = {
            let job = &self.jobs[idx];
            debug_assert_eq!(job.state, JobState::CompressionStart);
            (
                job.frame,
                job.output,
                job.settings.clone(),
                job.source.as_ref().map(|s| *s.surface()),
            )
        };

        let hand_off = src
            .ok_or_else(|| RouterError::buffer(self.desc.id, frame, "no source buffer"))
            .and_then(|src| {
                let dst = self.translator.lock().to_surface(output).ok_or_else(|| {
                    RouterError::buffer(self.desc.id, frame, "output buffer not linked")
                })?;
                let compress_job = CompressJob {
                    frame,
                    src,
                    dst,
                    params: settings.unwrap_or_default(),
                };
                match &self.compressor {
                    Some(client) => client.encode(compress_job),
                    None => Err(RouterError::buffer(
                        self.desc.id,
                        frame,
                        "no compression worker",
                    )),
                }
            });

        match hand_off {
            Ok(()) => self.jobs[idx].state = JobState::CompressionWait,
            Err(e) => {
                warn!(stream = %self.desc.id, frame, error = %e, "compression hand-off failed");
                self.sink.notify_error(&e);
                let job = &mut self.jobs[idx];
                job.failed = true;
                job.state = JobState::Ready;
            }
        }
    }

    /// Final step for one job: transform if needed, settle the shared
    /// buffer reference, recycle the zoom surface, report the result.
    fn dispatch(&mut self, mut job: PendingJob) {
        if self.shared.bypass.load(Ordering::Acquire) {
            job.failed = true;
        }

        let source = job.source.take();
        let is_owner = source
            .as_ref()
            .map(|s| s.owner() == Some(self.desc.id))
            .unwrap_or(false);

        if !job.failed {
            let needs_transform = self.desc.role == StreamRole::Output && !is_owner;
            if needs_transform {
                if let Some(src) = source.as_ref() {
                    if let Err(e) = self.transform_output(&job, src) {
                        warn!(stream = %self.desc.id, frame = job.frame, error = %e,
                            "transform failed");
                        self.sink.notify_error(&e);
                        job.failed = true;
                    }
                } else {
                    let e = RouterError::buffer(self.desc.id, job.frame, "no source buffer");
                    self.sink.notify_error(&e);
                    job.failed = true;
                }
            }
        }

        match source {
            // the owner's storage backs the shared buffer: hold the
            // output until every reader is done with it
            Some(src) if is_owner => src.wait_released(),
            Some(src) => {
                src.release();
            }
            None => {}
        }

        if let Some(surface) = job.zoom.take() {
            if let Some(pool) = &self.pool {
                pool.release(surface);
            }
        }

        if self.desc.role != StreamRole::Zoom {
            self.sink.send_result(StreamResult {
                stream: self.desc.id,
                frame: job.frame,
                buffer: job.output,
                status: if job.failed {
                    BufferStatus::Error
                } else {
                    BufferStatus::Ok
                },
            });
        }

        self.shared.gauge.pop();
    }

    fn transform_output(&self, job: &PendingJob, source: &SharedBufferHandle) -> Result<()> {
        let dst = self.translator.lock().to_surface(job.output).ok_or_else(|| {
            RouterError::buffer(self.desc.id, job.frame, "output buffer not linked")
        })?;
        let src = source.surface();
        let crop = source.crop();

        // sample window in source pixels, aspect-corrected for this
        // stream's destination so the scale step never distorts
        let window = if crop.is_cropped() {
            crop.to_rect(src.resolution)
        } else {
            Rect::full(src.resolution)
        };
        let window = aspect_crop(window, dst.resolution);
        let rect = (window != Rect::full(src.resolution)).then_some(window);

        self.transform
            .crop_and_scale(src, rect, &dst)
            .map_err(|e| RouterError::buffer(self.desc.id, job.frame, e.to_string()))
    }
}
