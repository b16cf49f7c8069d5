// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use crate::BevBox;

const EPSILON: f32 = 1e-7;

/// IoU of two `[xmin, ymin, xmax, ymax]` boxes.
pub fn standup_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let left = a[0].max(b[0]);
    let top = a[1].max(b[1]);
    let right = a[2].min(b[2]);
    let bottom = a[3].min(b[3]);

    let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);

    // need to make sure we are not dividing by zero
    let union = (area_a + area_b - intersection).max(EPSILON);

    intersection / union
}

/// IoU of two rotated rectangles on the ground plane.
pub fn rotated_iou(a: &BevBox, b: &BevBox) -> f32 {
    let area_a = a.area();
    let area_b = b.area();
    if area_a <= EPSILON || area_b <= EPSILON {
        return 0.0;
    }
    // cheap reject before clipping
    if standup_iou(&a.to_standup(), &b.to_standup()) <= 0.0 {
        return 0.0;
    }

    let intersection = polygon_area(&clip_polygon(&a.corners(), &b.corners()));
    let union = (area_a + area_b - intersection).max(EPSILON);

    intersection / union
}

fn cross(o: [f32; 2], a: [f32; 2], b: [f32; 2]) -> f32 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

/// Sutherland-Hodgman clipping of `subject` against the convex,
/// counter-clockwise polygon `clip`.
fn clip_polygon(subject: &[[f32; 2]], clip: &[[f32; 2]]) -> Vec<[f32; 2]> {
    let mut output = subject.to_vec();
    for i in 0..clip.len() {
        if output.is_empty() {
            break;
        }
        let edge_start = clip[i];
        let edge_end = clip[(i + 1) % clip.len()];
        let input = std::mem::take(&mut output);

        let mut prev = input[input.len() - 1];
        let mut prev_side = cross(edge_start, edge_end, prev);
        for &point in &input {
            let side = cross(edge_start, edge_end, point);
            if side >= 0.0 {
                if prev_side < 0.0 {
                    output.push(intersect(prev, point, prev_side, side));
                }
                output.push(point);
            } else if prev_side >= 0.0 {
                output.push(intersect(prev, point, prev_side, side));
            }
            prev = point;
            prev_side = side;
        }
    }
    output
}

/// Point where the segment `p -> q` crosses the clip line, given the signed
/// distances of both ends. Only called when the signs differ.
fn intersect(p: [f32; 2], q: [f32; 2], side_p: f32, side_q: f32) -> [f32; 2] {
    let t = side_p / (side_p - side_q);
    [p[0] + t * (q[0] - p[0]), p[1] + t * (q[1] - p[1])]
}

fn polygon_area(points: &[[f32; 2]]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: f32 = (0..points.len())
        .map(|i| {
            let [x0, y0] = points[i];
            let [x1, y1] = points[(i + 1) % points.len()];
            x0 * y1 - x1 * y0
        })
        .sum();
    twice.abs() * 0.5
}
