// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use core::fmt;

/// YUYV 4:2:2 YUV packed format (common camera output format)
pub const YUYV: FourCC = FourCC(*b"YUYV");

/// NV12 4:2:0 YUV semi-planar format (efficient for video encoding)
pub const NV12: FourCC = FourCC(*b"NV12");

/// RGBA 32-bit pixel format (8 bits per channel, with alpha)
pub const RGBA: FourCC = FourCC(*b"RGBA");

/// BLOB opaque byte-stream format (compressed output, no pixel layout)
pub const BLOB: FourCC = FourCC(*b"BLOB");

/// Aspect ratios closer than this are treated as equal.
pub const ASPECT_RATIO_TOLERANCE: f32 = 0.01;

/// Four-character pixel format code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Whether the format has an addressable pixel layout. `BLOB` streams
    /// carry encoder output and cannot serve as a crop/scale source.
    pub fn is_linear(&self) -> bool {
        *self != BLOB
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Image dimensions in pixels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Rectangle specification for crop operations.
///
/// Defines a rectangular region within an image for cropping or
/// region-of-interest operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Rect {
    /// X coordinate of top-left corner
    pub x: i32,
    /// Y coordinate of top-left corner
    pub y: i32,
    /// Width of the rectangle in pixels
    pub width: i32,
    /// Height of the rectangle in pixels
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The full frame of `res` as a rectangle at the origin.
    pub fn full(res: Resolution) -> Self {
        Self {
            x: 0,
            y: 0,
            width: res.width as i32,
            height: res.height as i32,
        }
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

const fn align2(v: i32) -> i32 {
    v & !1
}

/// Corrects a zoom window so its aspect ratio matches the destination.
///
/// When the window is wider than the destination the excess width is
/// trimmed symmetrically (horizontal bias); when it is taller the excess
/// height is trimmed (vertical bias). The result stays centered inside
/// the original window and both dimensions are aligned down to even
/// values so YUV subsampled sources remain addressable.
pub fn aspect_crop(zoom: Rect, dest: Resolution) -> Rect {
    let in_aspect = zoom.aspect();
    let out_aspect = dest.aspect();

    if (in_aspect - out_aspect).abs() <= ASPECT_RATIO_TOLERANCE {
        return Rect::new(zoom.x, zoom.y, align2(zoom.width), align2(zoom.height));
    }

    if in_aspect > out_aspect {
        let width = align2((zoom.height as f32 * out_aspect) as i32);
        let dx = (zoom.width - width) / 2;
        Rect::new(zoom.x + dx, zoom.y, width, align2(zoom.height))
    } else {
        let height = align2((zoom.width as f32 / out_aspect) as i32);
        let dy = (zoom.height - height) / 2;
        Rect::new(zoom.x, zoom.y + dy, align2(zoom.width), height)
    }
}

/// Fraction-of-source crop rectangle attached to a routed buffer.
///
/// Coordinates are normalized to `[0, 1]` against the source frame so the
/// region survives scaling between differently-sized surfaces. The default
/// region is the full frame, which consumers treat as "no crop".
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CropRegion {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    cropped: bool,
}

impl CropRegion {
    /// Full-frame region, `is_cropped()` reports false.
    pub fn full() -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            right: 1.0,
            bottom: 1.0,
            cropped: false,
        }
    }

    /// Normalizes a pixel rectangle against the source resolution.
    pub fn from_rect(rect: Rect, source: Resolution) -> Self {
        let w = source.width as f32;
        let h = source.height as f32;
        Self {
            left: rect.x as f32 / w,
            top: rect.y as f32 / h,
            right: (rect.x + rect.width) as f32 / w,
            bottom: (rect.y + rect.height) as f32 / h,
            cropped: true,
        }
    }

    pub fn is_cropped(&self) -> bool {
        self.cropped
    }

    /// Denormalizes the region against a concrete surface resolution.
    pub fn to_rect(&self, res: Resolution) -> Rect {
        let w = res.width as f32;
        let h = res.height as f32;
        Rect::new(
            (self.left * w) as i32,
            (self.top * h) as i32,
            align2(((self.right - self.left) * w) as i32),
            align2(((self.bottom - self.top) * h) as i32),
        )
    }
}

impl Default for CropRegion {
    fn default() -> Self {
        Self::full()
    }
}
