// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Voxelhead - multi-task anchor-based 3D detection head
//!
//! [`boxes`] holds the box geometry (coding, BEV IoU, NMS) and [`head`] the
//! per-task loss and post-processing pipeline built on top of it.
pub use voxelhead_boxes as boxes;
pub use voxelhead_head as head;

pub use voxelhead_boxes::{BevBox, BoundingBox3d, BoxCoder, NmsKind};
pub use voxelhead_head::{
    DetectBox3d, DetectorBuilder, Error, HeadConfig, LossRecord, MetricsAccumulator,
    MultiTaskDetector, Result, SampleDetections, TaskPrediction, TaskTargets,
};
