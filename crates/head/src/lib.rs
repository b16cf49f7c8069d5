// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Voxelhead - Multi-task detection head
//!
//! Every task consumes `[batch, anchors, channels]` predictions. Training
//! goes through [`MultiTaskDetector::compute_loss`], inference through
//! [`MultiTaskDetector::post_process`].
pub mod composite;
pub mod config;
pub mod detector;
pub mod error;
pub mod losses;
pub mod metrics;
pub mod postprocess;
pub mod task;
pub mod weights;

pub use composite::{CompositeLossComputer, LossInputs, LossRecord};
pub use config::{
    DirectionConfig, HeadConfig, LossConfig, NmsThresholds, PostProcessConfig, TaskConfig,
};
pub use detector::{DetectorBuilder, MultiTaskDetector, merge_task_detections};
pub use error::{Error, Result};
pub use losses::{ClassificationLoss, LocalizationLoss};
pub use metrics::{AveragePolicy, FloatPrecision, MetricsAccumulator, MetricsBatch, MetricsSnapshot};
pub use postprocess::{DetectBox3d, PostProcessor, SampleDetections};
pub use task::{TaskHead, TaskPrediction, TaskTargets};
pub use weights::{LossNormType, LossWeightAssigner, LossWeights};
