// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::{BevBox, rotated_iou, standup_iou};

/// Overlap measure used by [`nms`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NmsKind {
    /// IoU of the rotated BEV rectangles.
    #[default]
    Rotate,
    /// IoU of the axis-aligned rectangles enclosing the rotated ones.
    Standup,
}

impl FromStr for NmsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rotate" => Ok(NmsKind::Rotate),
            "standup" => Ok(NmsKind::Standup),
            other => Err(other.to_string()),
        }
    }
}

/// Greedy non-maximum suppression over BEV boxes.
///
/// Candidates are ranked by descending score (ties keep input order) and the
/// ranking is truncated to `pre_max_size`. A candidate is suppressed when its
/// IoU with an already kept box exceeds `iou_threshold`. At most
/// `post_max_size` survivors are returned, as indices into `boxes`, best
/// first.
pub fn nms(
    kind: NmsKind,
    boxes: &[BevBox],
    scores: &[f32],
    pre_max_size: Option<usize>,
    post_max_size: Option<usize>,
    iou_threshold: f32,
) -> Vec<usize> {
    debug_assert_eq!(boxes.len(), scores.len());
    let mut order: Vec<usize> = (0..boxes.len().min(scores.len())).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    if let Some(pre_max_size) = pre_max_size {
        order.truncate(pre_max_size);
    }
    let post_max_size = post_max_size.unwrap_or(usize::MAX);
    if order.is_empty() || post_max_size == 0 {
        return Vec::new();
    }

    let standup: Vec<[f32; 4]> = match kind {
        NmsKind::Standup => order.iter().map(|&i| boxes[i].to_standup()).collect(),
        NmsKind::Rotate => Vec::new(),
    };
    let overlap = |i: usize, j: usize| match kind {
        NmsKind::Rotate => rotated_iou(&boxes[order[i]], &boxes[order[j]]),
        NmsKind::Standup => standup_iou(&standup[i], &standup[j]),
    };

    let mut suppressed = vec![false; order.len()];
    let mut keep = Vec::with_capacity(order.len().min(post_max_size));
    for i in 0..order.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(order[i]);
        if keep.len() >= post_max_size {
            break;
        }
        for j in (i + 1)..order.len() {
            if suppressed[j] {
                continue;
            }
            let iou = overlap(i, j);
            if iou > iou_threshold {
                trace!("box {} suppressed by {} (iou {iou:.3})", order[j], order[i]);
                suppressed[j] = true;
            }
        }
    }
    keep
}
