// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Interfaces to the external collaborators the router drives: the capture
//! hardware, the crop/scale transform, the compression engine, and the
//! per-stream handle translation tables. The router itself carries no
//! pixel math; everything behind these traits does.

use crate::{
    buffer::{NativeHandle, Surface},
    error::{Result, RouterError},
    geometry::{Rect, Resolution},
    stream::StreamId,
};
use std::collections::HashMap;

/// Image rotation for encoder orientation tagging.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    Rotation0,
    Rotation90,
    Rotation180,
    Rotation270,
}

/// Per-job settings for a compression-capable stream.
#[derive(Clone, Debug)]
pub struct CompressionParams {
    /// Primary image quality, 1-100.
    pub quality: u8,
    /// Orientation recorded in the output metadata.
    pub orientation: Rotation,
    /// Optional embedded thumbnail; encoded as part of the same job.
    pub thumbnail_size: Option<Resolution>,
    /// Thumbnail quality, 1-100.
    pub thumbnail_quality: u8,
    /// Opaque application metadata embedded in the output.
    pub metadata: Vec<u8>,
}

impl Default for CompressionParams {
    fn default() -> Self {
        Self {
            quality: 95,
            orientation: Rotation::Rotation0,
            thumbnail_size: None,
            thumbnail_quality: 80,
            metadata: Vec::new(),
        }
    }
}

/// What the compression engine is opened for. A scope change between jobs
/// forces a close/reopen of the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncodeScope {
    Primary,
    PrimaryWithThumbnail,
}

/// Completion status attached to every buffer returned to the client.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferStatus {
    Ok,
    Error,
}

/// One finished output buffer handed back to the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamResult {
    pub stream: StreamId,
    pub frame: u64,
    pub buffer: NativeHandle,
    pub status: BufferStatus,
}

/// Narrow upward interface the router and its workers report through.
/// Injected by reference at construction; the engine never reaches back
/// into client internals beyond these three calls.
pub trait ResultSink: Send + Sync {
    /// First hardware completion observed for a frame.
    fn notify_shutter(&self, frame: u64, timestamp_ns: u64);
    /// Stream-scoped or device-fatal error notification.
    fn notify_error(&self, error: &RouterError);
    /// Finished output buffer, OK or ERROR.
    fn send_result(&self, result: StreamResult);
}

/// Logical source a capture is submitted against.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// An output stream's own buffer doubles as the frame source.
    Primary,
    /// Synthesized intermediate holding a cropped/scaled copy.
    Zoom,
    /// Secondary noise-reduction source.
    Tnr,
}

/// One hardware capture submission. The router issues one descriptor per
/// distinct physical/zoom/TNR source a frame needs.
#[derive(Clone, Debug)]
pub struct CaptureDescriptor {
    pub frame: u64,
    pub kind: SourceKind,
    pub target: Surface,
    /// Whether the driver should run temporal noise reduction on this
    /// capture. Set on every dedicated TNR capture, and on the frame
    /// source itself when the reuse-primary policy is active.
    pub tnr: bool,
}

/// Capture hardware driver. Completion arrives asynchronously through
/// `FrameRouter::route_result`.
pub trait CaptureDriver: Send + Sync {
    fn submit_capture(&self, descriptor: &CaptureDescriptor) -> Result<()>;
}

/// Synchronous crop-and-scale transform between two surfaces.
pub trait TransformEngine: Send + Sync {
    fn crop_and_scale(&self, src: &Surface, crop: Option<Rect>, dst: &Surface) -> Result<()>;
}

/// Hardware-assisted image compression. `encode` is synchronous from the
/// caller's point of view and returns the encoded byte count.
pub trait CompressionEngine: Send {
    fn open(&mut self, scope: EncodeScope) -> Result<()>;
    fn configure(&mut self, params: &CompressionParams) -> Result<()>;
    fn encode(
        &mut self,
        src: &Surface,
        thumbnail: Option<&Surface>,
        dst: &Surface,
    ) -> Result<usize>;
    fn close(&mut self);
}

/// Bidirectional native-handle to surface lookup, scoped per stream.
pub trait BufferTranslator: Send {
    fn to_surface(&self, handle: NativeHandle) -> Option<Surface>;
    fn to_native(&self, surface: &Surface) -> Option<NativeHandle>;
    /// Drops every mapping. Called on stream teardown.
    fn clear(&mut self);
}

/// HashMap-backed [`BufferTranslator`], populated by the client when it
/// registers buffers against a stream.
#[derive(Default)]
pub struct TranslationTable {
    forward: HashMap<NativeHandle, Surface>,
    reverse: HashMap<u64, NativeHandle>,
}

impl TranslationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&mut self, handle: NativeHandle, surface: Surface) {
        self.forward.insert(handle, surface);
        self.reverse.insert(surface.id, handle);
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

impl BufferTranslator for TranslationTable {
    fn to_surface(&self, handle: NativeHandle) -> Option<Surface> {
        self.forward.get(&handle).copied()
    }

    fn to_native(&self, surface: &Surface) -> Option<NativeHandle> {
        self.reverse.get(&surface.id).copied()
    }

    fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Resolution, YUYV};

    #[test]
    fn translation_table_round_trip() {
        let mut table = TranslationTable::new();
        let surface = Surface {
            id: 42,
            resolution: Resolution::new(640, 480),
            format: YUYV,
        };
        table.link(NativeHandle(7), surface);

        assert_eq!(table.to_surface(NativeHandle(7)), Some(surface));
        assert_eq!(table.to_native(&surface), Some(NativeHandle(7)));
        assert_eq!(table.to_surface(NativeHandle(8)), None);

        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.to_surface(NativeHandle(7)), None);
    }
}
