// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::geometry::{FourCC, Resolution, YUYV};
use std::time::Duration;

/// Active capture mode of the sensor: the resolution and layout the
/// hardware produces before any routing decision.
#[derive(Copy, Clone, Debug)]
pub struct SensorMode {
    pub resolution: Resolution,
    pub format: FourCC,
}

/// Policy for the secondary noise-reduction (TNR) source.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TnrPolicy {
    /// No TNR source is captured.
    #[default]
    Disabled,
    /// TNR rides the primary capture: no extra capture is submitted, the
    /// frame source's descriptor is flagged for noise reduction instead.
    ReusePrimary,
    /// A dedicated TNR surface is synthesized per frame, bounded by
    /// `max_tnr_height`.
    Synthesize,
}

/// Router configuration. Parsing and validation of application-level
/// settings belong to the embedding process; this is the already-resolved
/// form.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub sensor_mode: SensorMode,
    /// Upper bound on acquiring a pooled zoom surface. Exceeding it is
    /// logged and surfaces as a per-buffer error.
    pub acquire_timeout: Duration,
    /// Number of surfaces backing the zoom pool.
    pub zoom_pool_depth: usize,
    pub tnr: TnrPolicy,
    /// Tallest frame the TNR path will accept; synthesized TNR surfaces
    /// are clamped to this and aligned to even dimensions.
    pub max_tnr_height: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            sensor_mode: SensorMode {
                resolution: Resolution::new(1920, 1080),
                format: YUYV,
            },
            acquire_timeout: Duration::from_millis(1500),
            zoom_pool_depth: 4,
            tnr: TnrPolicy::Disabled,
            max_tnr_height: 1080,
        }
    }
}
