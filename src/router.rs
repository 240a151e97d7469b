// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Frame routing. [`FrameRouter`] is the single entry point for "submit a
//! capture request" and "hardware reported a frame complete": it decides
//! which physical, zoom, or TNR sources a frame needs, fans the completed
//! buffer out to every participating stream worker under one shared
//! reference count, and drives the flush/teardown protocol across all of
//! them.

use crate::{
    buffer::{buffer_count_for, BufferPool, NativeHandle, SharedBufferHandle, Surface},
    config::{RouterConfig, TnrPolicy},
    engine::{
        BufferTranslator, CaptureDescriptor, CaptureDriver, CompressionEngine, CompressionParams,
        ResultSink, SourceKind, TransformEngine, TranslationTable,
    },
    error::{Result, RouterError},
    geometry::{CropRegion, Rect, Resolution},
    stream::{PendingJob, StreamDescriptor, StreamId, StreamPort, StreamRole},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

/// Reserved identity of the internal zoom stream.
pub const ZOOM_STREAM: StreamId = StreamId(u32::MAX);
/// Reserved identity of the internal TNR stream.
pub const TNR_STREAM: StreamId = StreamId(u32::MAX - 1);

const ZOOM_SURFACE_BASE: u64 = 1 << 48;
const TNR_SURFACE_BASE: u64 = 1 << 49;
const TNR_POOL_DEPTH: usize = 2;

/// Client-supplied controls in effect for one frame.
#[derive(Clone, Debug, Default)]
pub struct CaptureControls {
    /// Requested zoom window in sensor pixels. A window covering the full
    /// frame is treated as no crop.
    pub crop: Option<Rect>,
    /// Settings applied to every compression-capable stream this frame.
    pub compression: Option<CompressionParams>,
}

/// One output buffer the client wants filled for a frame.
#[derive(Copy, Clone, Debug)]
pub struct OutputTarget {
    pub stream: StreamId,
    pub buffer: NativeHandle,
}

/// One capture request as submitted by the client.
#[derive(Clone, Debug, Default)]
pub struct CaptureRequest {
    pub frame: u64,
    pub controls: CaptureControls,
    pub outputs: Vec<OutputTarget>,
    /// Reprocess input. Its presence disables TNR synthesis for the frame.
    pub input: Option<NativeHandle>,
}

/// Driver-reported fault attached to a completion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CaptureFault {
    /// The device cannot guarantee further progress.
    Device,
    /// Only this buffer is bad; the pipeline keeps running.
    Buffer,
}

/// Dynamic per-completion properties from the capture driver.
#[derive(Copy, Clone, Debug, Default)]
pub struct DynamicProps {
    pub timestamp_ns: u64,
    pub fault: Option<CaptureFault>,
}

#[derive(Clone)]
struct SourceSpec {
    kind: SourceKind,
    native: NativeHandle,
    surface: Surface,
    owner: Option<StreamId>,
    crop: CropRegion,
    consumers: Vec<StreamId>,
    routed: bool,
}

/// Per-frame association between the participating streams and the
/// capture controls in effect. Discarded once every source has routed.
struct PortMap {
    sources: Vec<SourceSpec>,
    shutter_sent: bool,
}

/// The frame-routing and buffer-lifecycle engine.
///
/// Streams are held in an explicit registry owned by the router; nothing
/// is process-global. External hardware sits behind the collaborator
/// traits in [`crate::engine`], injected at construction.
pub struct FrameRouter {
    config: RouterConfig,
    driver: Arc<dyn CaptureDriver>,
    transform: Arc<dyn TransformEngine>,
    sink: Arc<dyn ResultSink>,
    streams: Mutex<HashMap<StreamId, Arc<StreamPort>>>,
    pending: Mutex<HashMap<u64, PortMap>>,
    zoom_port: Arc<StreamPort>,
    zoom_pool: Arc<BufferPool>,
    tnr_port: Option<Arc<StreamPort>>,
    tnr_pool: Option<Arc<BufferPool>>,
    fatal: AtomicBool,
}

impl FrameRouter {
    pub fn new(
        config: RouterConfig,
        driver: Arc<dyn CaptureDriver>,
        transform: Arc<dyn TransformEngine>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        let mode = config.sensor_mode;

        let zoom_surfaces = (0..config.zoom_pool_depth)
            .map(|i| Surface {
                id: ZOOM_SURFACE_BASE + i as u64,
                resolution: mode.resolution,
                format: mode.format,
            })
            .collect();
        let zoom_pool = Arc::new(BufferPool::new(zoom_surfaces, config.acquire_timeout));
        let zoom_port = Arc::new(StreamPort::spawn(
            StreamDescriptor {
                id: ZOOM_STREAM,
                resolution: mode.resolution,
                format: mode.format,
                max_buffers: config.zoom_pool_depth.max(1),
                role: StreamRole::Zoom,
            },
            transform.clone(),
            sink.clone(),
            Box::new(TranslationTable::new()),
            Some(zoom_pool.clone()),
            None,
        )?);

        let (tnr_port, tnr_pool) = if config.tnr == TnrPolicy::Synthesize {
            let res = tnr_resolution(&config);
            let surfaces = (0..TNR_POOL_DEPTH)
                .map(|i| Surface {
                    id: TNR_SURFACE_BASE + i as u64,
                    resolution: res,
                    format: mode.format,
                })
                .collect();
            let pool = Arc::new(BufferPool::new(surfaces, config.acquire_timeout));
            let port = Arc::new(StreamPort::spawn(
                StreamDescriptor {
                    id: TNR_STREAM,
                    resolution: res,
                    format: mode.format,
                    max_buffers: TNR_POOL_DEPTH,
                    role: StreamRole::Zoom,
                },
                transform.clone(),
                sink.clone(),
                Box::new(TranslationTable::new()),
                Some(pool.clone()),
                None,
            )?);
            (Some(port), Some(pool))
        } else {
            (None, None)
        };

        Ok(Self {
            config,
            driver,
            transform,
            sink,
            streams: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            zoom_port,
            zoom_pool,
            tnr_port,
            tnr_pool,
            fatal: AtomicBool::new(false),
        })
    }

    /// Registers a new output stream and spawns its worker. A compressed
    /// stream must bring its compression engine. `max_buffers == 0`
    /// selects the resolution-based default.
    pub fn add_stream(
        &self,
        mut desc: StreamDescriptor,
        translator: Box<dyn BufferTranslator>,
        engine: Option<Box<dyn CompressionEngine>>,
    ) -> Result<()> {
        if desc.role == StreamRole::Zoom {
            return Err(RouterError::BadParameter(
                "zoom streams are created internally".into(),
            ));
        }
        if desc.id == ZOOM_STREAM || desc.id == TNR_STREAM {
            return Err(RouterError::BadParameter(format!(
                "stream id {} is reserved",
                desc.id
            )));
        }
        if desc.max_buffers == 0 {
            desc.max_buffers = buffer_count_for(desc.resolution);
        }

        let mut streams = self.streams.lock();
        if streams.contains_key(&desc.id) {
            return Err(RouterError::BadParameter(format!(
                "stream {} already configured",
                desc.id
            )));
        }
        let port = StreamPort::spawn(
            desc,
            self.transform.clone(),
            self.sink.clone(),
            translator,
            Some(self.zoom_pool.clone()),
            engine,
        )?;
        streams.insert(desc.id, Arc::new(port));
        drop(streams);

        // the owner is reconfiguring: reopen after a fatal error
        self.fatal.store(false, Ordering::Release);
        debug!(stream = %desc.id, resolution = %desc.resolution, "stream added");
        Ok(())
    }

    /// Tears one stream down: the worker drains, its thread exits, and
    /// the stream's translation table is released.
    pub fn remove_stream(&self, id: StreamId) -> Result<()> {
        let port = self
            .streams
            .lock()
            .remove(&id)
            .ok_or_else(|| RouterError::BadParameter(format!("stream {id} not configured")))?;
        port.flush();
        port.shutdown();
        self.fatal.store(false, Ordering::Release);
        Ok(())
    }

    /// Blocks until the stream can accept another job.
    pub fn wait_available_buffers(&self, id: StreamId) -> Result<()> {
        let port = self.port(id)?;
        port.wait_available();
        Ok(())
    }

    pub fn queue_len(&self, id: StreamId) -> Result<usize> {
        Ok(self.port(id)?.queue_len())
    }

    /// Routes one capture request: validates the targets, picks the frame
    /// sources, enqueues one pending job per participating stream under
    /// backpressure, and submits one hardware capture per source. A zoom
    /// surface timing out is not a request failure; the frame's buffers
    /// come back through normal per-buffer error reporting.
    pub fn route_request(&self, request: &CaptureRequest) -> Result<()> {
        if self.fatal.load(Ordering::Acquire) {
            return Err(RouterError::Resource(
                "router halted by a previous device error".into(),
            ));
        }
        if request.outputs.is_empty() {
            return Err(RouterError::BadParameter("request has no outputs".into()));
        }

        // validate and snapshot the participating ports
        let mut targets: Vec<(Arc<StreamPort>, OutputTarget)> =
            Vec::with_capacity(request.outputs.len());
        {
            let streams = self.streams.lock();
            for output in &request.outputs {
                if targets.iter().any(|(_, o)| o.stream == output.stream) {
                    return Err(RouterError::BadParameter(format!(
                        "stream {} appears twice in request",
                        output.stream
                    )));
                }
                let port = streams.get(&output.stream).ok_or_else(|| {
                    RouterError::BadParameter(format!("stream {} not configured", output.stream))
                })?;
                targets.push((port.clone(), *output));
            }
        }

        let window = self.effective_window(&request.controls);
        let consumers: Vec<StreamId> = targets.iter().map(|(_, o)| o.stream).collect();
        let mut sources = Vec::with_capacity(2);
        let mut zoom_job = None;
        let mut tnr_job = None;
        let mut source_lost = false;

        // the largest-resolution output is the default frame source
        let source_port = targets
            .iter()
            .map(|(p, _)| p)
            .max_by_key(|p| p.descriptor().resolution.area())
            .ok_or_else(|| RouterError::BadParameter("request has no outputs".into()))?;
        let source_desc = *source_port.descriptor();

        if self.needs_zoom(&source_desc, window) {
            match self.zoom_pool.acquire(request.frame) {
                Ok(surface) => {
                    let crop = match window {
                        Some(rect) => {
                            CropRegion::from_rect(rect, self.config.sensor_mode.resolution)
                        }
                        None => CropRegion::full(),
                    };
                    sources.push(SourceSpec {
                        kind: SourceKind::Zoom,
                        native: NativeHandle(surface.id),
                        surface,
                        owner: Some(ZOOM_STREAM),
                        crop,
                        consumers: consumers.clone(),
                        routed: false,
                    });
                    zoom_job = Some(PendingJob {
                        zoom: Some(surface),
                        ..PendingJob::new(request.frame, NativeHandle(surface.id), None)
                    });
                    debug!(frame = request.frame, surface = %surface, "zoom source synthesized");
                }
                Err(e) => {
                    // no capture gets submitted for the frame; the jobs
                    // still flow through the queues and come back to the
                    // client as per-buffer errors
                    warn!(frame = request.frame, error = %e, "zoom source unavailable");
                    self.sink.notify_error(&e);
                    let mode = self.config.sensor_mode;
                    sources.push(SourceSpec {
                        kind: SourceKind::Primary,
                        native: NativeHandle(0),
                        surface: Surface {
                            id: 0,
                            resolution: mode.resolution,
                            format: mode.format,
                        },
                        owner: None,
                        crop: CropRegion::full(),
                        consumers: consumers.clone(),
                        routed: false,
                    });
                    source_lost = true;
                }
            }
        } else {
            let (port, output) = targets
                .iter()
                .find(|(_, o)| o.stream == source_desc.id)
                .ok_or_else(|| RouterError::BadParameter("source stream vanished".into()))?;
            let surface = port.translate(output.buffer).ok_or_else(|| {
                RouterError::BadParameter(format!(
                    "buffer {:?} not linked to stream {}",
                    output.buffer, source_desc.id
                ))
            })?;
            sources.push(SourceSpec {
                kind: SourceKind::Primary,
                native: output.buffer,
                surface,
                owner: Some(source_desc.id),
                crop: CropRegion::full(),
                consumers: consumers.clone(),
                routed: false,
            });
        }

        if !source_lost {
            if let Some(spec) = self.plan_tnr(request)? {
                tnr_job = Some(PendingJob {
                    zoom: Some(spec.surface),
                    ..PendingJob::new(request.frame, spec.native, None)
                });
                sources.push(spec);
            }
        }

        self.pending.lock().insert(
            request.frame,
            PortMap {
                sources: sources.clone(),
                shutter_sent: false,
            },
        );

        // one pending job per participating stream, blocking while any
        // stream's queue is at its bound
        for (port, output) in &targets {
            let settings = match port.descriptor().role {
                StreamRole::Compressed => {
                    Some(request.controls.compression.clone().unwrap_or_default())
                }
                _ => None,
            };
            if let Err(e) = port.submit(PendingJob::new(request.frame, output.buffer, settings)) {
                warn!(stream = %output.stream, frame = request.frame, error = %e,
                    "stream rejected job");
                self.recycle(zoom_job.take(), tnr_job.take());
                self.fail_frame(request.frame);
                return Err(e);
            }
        }
        if let Some(job) = zoom_job.take() {
            if let Err(e) = self.zoom_port.submit(job) {
                self.recycle(None, tnr_job.take());
                self.fail_frame(request.frame);
                return Err(e);
            }
        }
        if let Some(job) = tnr_job.take() {
            if let Some(port) = &self.tnr_port {
                if let Err(e) = port.submit(job) {
                    self.fail_frame(request.frame);
                    return Err(e);
                }
            }
        }

        if source_lost {
            self.fail_frame(request.frame);
            return Ok(());
        }

        // one hardware capture per distinct source
        let tnr_rides_primary =
            self.config.tnr == TnrPolicy::ReusePrimary && request.input.is_none();
        for spec in &sources {
            let descriptor = CaptureDescriptor {
                frame: request.frame,
                kind: spec.kind,
                target: spec.surface,
                tnr: tnr_rides_primary || spec.kind == SourceKind::Tnr,
            };
            if let Err(e) = self.driver.submit_capture(&descriptor) {
                warn!(frame = request.frame, error = %e, "capture submission failed");
                self.sink.notify_error(&e);
                if e.is_fatal() {
                    self.fatal.store(true, Ordering::Release);
                }
                self.fail_frame(request.frame);
                return Err(e);
            }
        }

        Ok(())
    }

    /// Routes one hardware completion: matches the buffer to its frame's
    /// PortMap, wraps it in a shared handle, takes one reference per
    /// consuming stream, and signals every participating worker.
    pub fn route_result(
        &self,
        frame: u64,
        buffer: NativeHandle,
        props: &DynamicProps,
    ) -> Result<()> {
        let (spec, shutter) = {
            let mut pending = self.pending.lock();
            let map = pending.get_mut(&frame).ok_or_else(|| {
                RouterError::BadParameter(format!("no request pending for frame {frame}"))
            })?;
            let spec = map
                .sources
                .iter_mut()
                .find(|s| s.native == buffer && !s.routed)
                .ok_or_else(|| {
                    RouterError::BadParameter(format!(
                        "buffer {buffer:?} does not belong to frame {frame}"
                    ))
                })?;
            spec.routed = true;
            let spec = spec.clone();
            let shutter = !map.shutter_sent;
            map.shutter_sent = true;
            if map.sources.iter().all(|s| s.routed) {
                pending.remove(&frame);
            }
            (spec, shutter)
        };

        if shutter {
            self.sink.notify_shutter(frame, props.timestamp_ns);
        }

        let failed = match props.fault {
            None => false,
            Some(CaptureFault::Device) => {
                let e = RouterError::Resource(format!("capture device fault on frame {frame}"));
                warn!(frame, "device fault reported by driver");
                self.fatal.store(true, Ordering::Release);
                self.sink.notify_error(&e);
                true
            }
            Some(CaptureFault::Buffer) => {
                for stream in &spec.consumers {
                    self.sink
                        .notify_error(&RouterError::buffer(*stream, frame, "capture fault"));
                }
                true
            }
        };

        self.signal(frame, &spec, failed);
        Ok(())
    }

    /// Quiesces every stream: all queued and in-flight jobs complete as
    /// errors, the call returns once every queue is empty. Idempotent on
    /// a quiesced router.
    pub fn flush_all(&self) {
        let ports = self.all_ports();
        for port in &ports {
            port.set_bypass(true);
        }
        for port in &ports {
            port.drain();
        }
        for port in &ports {
            port.set_bypass(false);
        }
    }

    /// Flushes a single stream (scenario: client stops one consumer while
    /// the rest keep running).
    pub fn flush_stream(&self, id: StreamId) -> Result<()> {
        let port = self.port(id)?;
        port.flush();
        Ok(())
    }

    /// Full teardown: quiesce, then destroy every stream including the
    /// internal zoom/TNR ports.
    pub fn shutdown(&self) {
        self.flush_all();
        let drained: Vec<Arc<StreamPort>> = self.streams.lock().drain().map(|(_, p)| p).collect();
        for port in drained {
            port.shutdown();
        }
        self.zoom_port.shutdown();
        if let Some(port) = &self.tnr_port {
            port.shutdown();
        }
        self.pending.lock().clear();
    }

    fn port(&self, id: StreamId) -> Result<Arc<StreamPort>> {
        self.streams
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| RouterError::BadParameter(format!("stream {id} not configured")))
    }

    fn all_ports(&self) -> Vec<Arc<StreamPort>> {
        let mut ports: Vec<Arc<StreamPort>> = self.streams.lock().values().cloned().collect();
        ports.push(self.zoom_port.clone());
        if let Some(port) = &self.tnr_port {
            ports.push(port.clone());
        }
        ports
    }

    /// A crop window covering the whole sensor frame means no crop.
    fn effective_window(&self, controls: &CaptureControls) -> Option<Rect> {
        let window = controls.crop?;
        if window == Rect::full(self.config.sensor_mode.resolution) {
            return None;
        }
        Some(window)
    }

    /// Whether the frame must go through a synthesized zoom buffer
    /// instead of sampling the default source stream directly. Direct
    /// sampling requires an exact sensor-mode match: same linear layout,
    /// same resolution.
    fn needs_zoom(&self, source: &StreamDescriptor, window: Option<Rect>) -> bool {
        if window.is_some() {
            return true;
        }
        let mode = self.config.sensor_mode;
        if !source.format.is_linear() || source.format != mode.format {
            return true;
        }
        source.resolution != mode.resolution
    }

    /// TNR source decision. The policy is configuration, not inference:
    /// reprocess requests never get one, `ReusePrimary` rides the primary
    /// capture, `Synthesize` takes a dedicated clamped-resolution surface.
    fn plan_tnr(&self, request: &CaptureRequest) -> Result<Option<SourceSpec>> {
        if request.input.is_some() || self.config.tnr != TnrPolicy::Synthesize {
            return Ok(None);
        }
        let Some(pool) = &self.tnr_pool else {
            return Ok(None);
        };
        let surface = match pool.acquire(request.frame) {
            Ok(surface) => surface,
            Err(e) => {
                // TNR is best-effort: the frame proceeds without it
                warn!(frame = request.frame, error = %e, "tnr source unavailable");
                self.sink.notify_error(&e);
                return Ok(None);
            }
        };
        Ok(Some(SourceSpec {
            kind: SourceKind::Tnr,
            native: NativeHandle(surface.id),
            surface,
            owner: Some(TNR_STREAM),
            crop: CropRegion::full(),
            consumers: Vec::new(),
            routed: false,
        }))
    }

    /// Fans one completed source out: one reference per consumer that
    /// does not own the storage, then one completion signal per
    /// participating port. All references are taken before any signal so
    /// no worker can observe a premature drop to zero.
    fn signal(&self, frame: u64, spec: &SourceSpec, failed: bool) {
        let handle = SharedBufferHandle::new(spec.surface, spec.crop, spec.owner);

        let mut ports = Vec::with_capacity(spec.consumers.len() + 1);
        {
            let streams = self.streams.lock();
            for id in &spec.consumers {
                match streams.get(id) {
                    Some(port) => ports.push(port.clone()),
                    None => warn!(stream = %id, frame, "consumer removed before completion"),
                }
            }
        }
        match spec.kind {
            SourceKind::Zoom => ports.push(self.zoom_port.clone()),
            SourceKind::Tnr => {
                if let Some(port) = &self.tnr_port {
                    ports.push(port.clone());
                }
            }
            SourceKind::Primary => {}
        }

        for port in &ports {
            if Some(port.descriptor().id) != handle.owner() {
                handle.retain();
            }
        }
        for port in &ports {
            port.completed(frame, handle.clone(), failed);
        }
    }

    /// Returns pooled surfaces held by jobs that were never enqueued.
    fn recycle(&self, zoom_job: Option<PendingJob>, tnr_job: Option<PendingJob>) {
        if let Some(surface) = zoom_job.and_then(|job| job.zoom) {
            self.zoom_pool.release(surface);
        }
        if let (Some(surface), Some(pool)) = (tnr_job.and_then(|job| job.zoom), &self.tnr_pool) {
            pool.release(surface);
        }
    }

    /// Completes every source of a frame as failed after a submission
    /// error, so no pending job is left waiting forever.
    fn fail_frame(&self, frame: u64) {
        let Some(map) = self.pending.lock().remove(&frame) else {
            return;
        };
        for spec in map.sources.iter().filter(|s| !s.routed) {
            self.signal(frame, spec, true);
        }
    }
}

impl Drop for FrameRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn tnr_resolution(config: &RouterConfig) -> Resolution {
    let mode = config.sensor_mode.resolution;
    if mode.height <= config.max_tnr_height {
        return Resolution::new(mode.width & !1, mode.height & !1);
    }
    let height = config.max_tnr_height & !1;
    let width = ((mode.width as u64 * height as u64 / mode.height as u64) as u32) & !1;
    Resolution::new(width, height)
}
