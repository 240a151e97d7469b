// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # Capture Router
//!
//! This library is the frame-routing and buffer-lifecycle engine of a
//! camera capture pipeline. For every captured frame it fans one
//! hardware-produced buffer out to any number of independently-consuming
//! output streams (raw, scaled, cropped, or compressed) and guarantees the
//! source buffer is not recycled back to the hardware until every consumer
//! has finished with it.
//!
//! ## Features
//!
//! - **Shared buffer lifecycle**: reference-counted handles with a
//!   wait-for-zero drain, so one physical buffer safely feeds N streams.
//! - **Per-stream workers**: one dispatch thread per output stream with a
//!   bounded queue; the queue bound is the backpressure mechanism.
//! - **Off-thread compression**: compression-capable streams hand encodes
//!   to a dedicated worker so a slow encode never stalls sibling streams.
//! - **Zoom synthesis**: when no output stream can serve as the crop
//!   source directly, an intermediate zoom buffer is synthesized and
//!   crop-tagged, with aspect-bias correction per destination.
//! - **Flush protocol**: every queue-owning component supports bypass,
//!   drain, and teardown with deterministic error completion.
//!
//! ## Example
//!
//! ```no_run
//! use capture_router::{
//!     config::RouterConfig,
//!     engine::TranslationTable,
//!     geometry::{Resolution, YUYV},
//!     router::{CaptureRequest, FrameRouter, OutputTarget},
//!     stream::{StreamDescriptor, StreamId, StreamRole},
//! };
//! # use std::sync::Arc;
//! # fn collaborators() -> (
//! #     Arc<dyn capture_router::engine::CaptureDriver>,
//! #     Arc<dyn capture_router::engine::TransformEngine>,
//! #     Arc<dyn capture_router::engine::ResultSink>,
//! # ) { unimplemented!() }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (driver, transform, sink) = collaborators();
//! let router = FrameRouter::new(RouterConfig::default(), driver, transform, sink)?;
//!
//! router.add_stream(
//!     StreamDescriptor {
//!         id: StreamId(0),
//!         resolution: Resolution::new(1920, 1080),
//!         format: YUYV,
//!         max_buffers: 0, // resolution-based default
//!         role: StreamRole::Output,
//!     },
//!     Box::new(TranslationTable::new()),
//!     None,
//! )?;
//!
//! router.route_request(&CaptureRequest {
//!     frame: 1,
//!     outputs: vec![OutputTarget {
//!         stream: StreamId(0),
//!         buffer: capture_router::buffer::NativeHandle(0x100),
//!     }],
//!     ..Default::default()
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! One dedicated thread per output stream plus one per compression-capable
//! stream. Cross-thread communication is message passing over bounded
//! channels; the only resource mutated by more than one worker is a shared
//! buffer's reference count, guarded by its own lock. Within one stream,
//! buffers are returned in frame-number order; across streams there is no
//! ordering guarantee.

pub mod buffer;
pub mod compress;
pub mod config;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod router;
pub mod stream;
