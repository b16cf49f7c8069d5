// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Voxelhead - 3D box geometry
//!
//! Box layout used throughout the workspace is `[x, y, z, l, w, h, heading]`
//! optionally followed by `[vx, vy]`. The length runs along the heading.
use ndarray::ArrayView1;

pub mod coder;
pub mod error;
pub mod iou;
pub mod nms;

pub use coder::BoxCoder;
pub use error::{Error, Result};
pub use iou::{rotated_iou, standup_iou};
pub use nms::{NmsKind, nms};

/// Number of geometric parameters of a box, velocity excluded.
pub const BOX_DIM: usize = 7;
/// Column holding the heading angle, in radians.
pub const HEADING_INDEX: usize = 6;
/// Column holding the x velocity, when present.
pub const VELOCITY_INDEX: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox3d {
    /// center x
    pub x: f32,
    /// center y
    pub y: f32,
    /// center z
    pub z: f32,
    /// extent along the heading direction
    pub length: f32,
    /// extent across the heading direction
    pub width: f32,
    pub height: f32,
    /// rotation around z, in radians
    pub heading: f32,
}

impl BoundingBox3d {
    /// Reads the first seven columns of a box row.
    pub fn from_row(row: ArrayView1<f32>) -> Self {
        BoundingBox3d {
            x: row[0],
            y: row[1],
            z: row[2],
            length: row[3],
            width: row[4],
            height: row[5],
            heading: row[HEADING_INDEX],
        }
    }

    pub fn center(&self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    /// Projection onto the ground plane.
    pub fn bev(&self) -> BevBox {
        BevBox {
            x: self.x,
            y: self.y,
            length: self.length,
            width: self.width,
            heading: self.heading,
        }
    }
}

impl From<BoundingBox3d> for [f32; BOX_DIM] {
    fn from(b: BoundingBox3d) -> Self {
        [b.x, b.y, b.z, b.length, b.width, b.height, b.heading]
    }
}

impl From<[f32; BOX_DIM]> for BoundingBox3d {
    fn from(arr: [f32; BOX_DIM]) -> Self {
        BoundingBox3d {
            x: arr[0],
            y: arr[1],
            z: arr[2],
            length: arr[3],
            width: arr[4],
            height: arr[5],
            heading: arr[6],
        }
    }
}

/// A rotated rectangle on the ground plane.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BevBox {
    pub x: f32,
    pub y: f32,
    pub length: f32,
    pub width: f32,
    pub heading: f32,
}

impl BevBox {
    /// Corners in counter-clockwise order.
    pub fn corners(&self) -> [[f32; 2]; 4] {
        let (sin, cos) = self.heading.sin_cos();
        let hl = self.length * 0.5;
        let hw = self.width * 0.5;
        [[-hl, -hw], [hl, -hw], [hl, hw], [-hl, hw]].map(|[dx, dy]| {
            [
                self.x + dx * cos - dy * sin,
                self.y + dx * sin + dy * cos,
            ]
        })
    }

    /// Smallest axis-aligned `[xmin, ymin, xmax, ymax]` box containing the
    /// rotated rectangle.
    pub fn to_standup(&self) -> [f32; 4] {
        self.corners().iter().fold(
            [f32::MAX, f32::MAX, f32::MIN, f32::MIN],
            |[xmin, ymin, xmax, ymax], [x, y]| {
                [xmin.min(*x), ymin.min(*y), xmax.max(*x), ymax.max(*y)]
            },
        )
    }

    pub fn area(&self) -> f32 {
        self.length * self.width
    }
}
