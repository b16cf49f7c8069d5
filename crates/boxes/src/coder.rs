// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut1, Zip};
use serde::{Deserialize, Serialize};

use crate::{BOX_DIM, Error, HEADING_INDEX, Result, VELOCITY_INDEX};

/// Transform between absolute boxes and anchor-relative regression codes.
///
/// Centers are encoded relative to the anchor's BEV diagonal (z relative to
/// its height), sizes as log ratios (or plain ratios minus one with
/// `linear_dim`) and the heading as a plain residual. The velocity variant
/// appends `[vx, vy]` residuals; anchors without velocity columns are treated
/// as static.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoxCoder {
    GroundBox3d {
        #[serde(default)]
        linear_dim: bool,
    },
    GroundBox3dVelocity {
        #[serde(default)]
        linear_dim: bool,
    },
}

impl Default for BoxCoder {
    fn default() -> Self {
        BoxCoder::GroundBox3d { linear_dim: false }
    }
}

impl BoxCoder {
    pub fn code_size(&self) -> usize {
        match self {
            BoxCoder::GroundBox3d { .. } => BOX_DIM,
            BoxCoder::GroundBox3dVelocity { .. } => BOX_DIM + 2,
        }
    }

    fn linear_dim(&self) -> bool {
        match self {
            BoxCoder::GroundBox3d { linear_dim } | BoxCoder::GroundBox3dVelocity { linear_dim } => {
                *linear_dim
            }
        }
    }

    /// Encodes `[n, >=code_size]` ground-truth boxes against `[n, >=7]`
    /// anchors into `[n, code_size]` regression targets.
    pub fn encode(&self, boxes: ArrayView2<f32>, anchors: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_rows(boxes, anchors)?;
        if boxes.ncols() < self.code_size() {
            return Err(Error::InvalidShape(format!(
                "boxes have {} columns, coder needs at least {}",
                boxes.ncols(),
                self.code_size()
            )));
        }
        let mut codes = Array2::zeros((boxes.nrows(), self.code_size()));
        Zip::from(codes.rows_mut())
            .and(boxes.rows())
            .and(anchors.rows())
            .for_each(|code, gt, anchor| self.encode_row(gt, anchor, code));
        Ok(codes)
    }

    /// Decodes `[n, code_size]` regression codes against `[n, >=7]` anchors
    /// into absolute `[n, code_size]` boxes.
    pub fn decode(&self, codes: ArrayView2<f32>, anchors: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_rows(codes, anchors)?;
        if codes.ncols() != self.code_size() {
            return Err(Error::InvalidShape(format!(
                "codes have {} columns, coder produces {}",
                codes.ncols(),
                self.code_size()
            )));
        }
        let mut boxes = Array2::zeros((codes.nrows(), self.code_size()));
        Zip::from(boxes.rows_mut())
            .and(codes.rows())
            .and(anchors.rows())
            .for_each(|out, code, anchor| self.decode_row(code, anchor, out));
        Ok(boxes)
    }

    pub fn encode_batch(
        &self,
        boxes: ArrayView3<f32>,
        anchors: ArrayView3<f32>,
    ) -> Result<Array3<f32>> {
        let (batch, num, _) = boxes.dim();
        if anchors.dim().0 != batch {
            return Err(Error::InvalidShape(format!(
                "batch of {batch} boxes but {} anchor sets",
                anchors.dim().0
            )));
        }
        let mut codes = Array3::zeros((batch, num, self.code_size()));
        for ((mut out, b), a) in codes
            .outer_iter_mut()
            .zip(boxes.outer_iter())
            .zip(anchors.outer_iter())
        {
            out.assign(&self.encode(b, a)?);
        }
        Ok(codes)
    }

    pub fn decode_batch(
        &self,
        codes: ArrayView3<f32>,
        anchors: ArrayView3<f32>,
    ) -> Result<Array3<f32>> {
        let (batch, num, _) = codes.dim();
        if anchors.dim().0 != batch {
            return Err(Error::InvalidShape(format!(
                "batch of {batch} codes but {} anchor sets",
                anchors.dim().0
            )));
        }
        let mut boxes = Array3::zeros((batch, num, self.code_size()));
        for ((mut out, c), a) in boxes
            .outer_iter_mut()
            .zip(codes.outer_iter())
            .zip(anchors.outer_iter())
        {
            out.assign(&self.decode(c, a)?);
        }
        Ok(boxes)
    }

    fn check_rows(&self, rows: ArrayView2<f32>, anchors: ArrayView2<f32>) -> Result<()> {
        if rows.nrows() != anchors.nrows() {
            return Err(Error::InvalidShape(format!(
                "{} rows but {} anchors",
                rows.nrows(),
                anchors.nrows()
            )));
        }
        if anchors.ncols() < BOX_DIM {
            return Err(Error::InvalidShape(format!(
                "anchors have {} columns, expected at least {BOX_DIM}",
                anchors.ncols()
            )));
        }
        Ok(())
    }

    fn encode_row(&self, gt: ArrayView1<f32>, anchor: ArrayView1<f32>, mut code: ArrayViewMut1<f32>) {
        let diagonal = anchor[3].hypot(anchor[4]);
        code[0] = (gt[0] - anchor[0]) / diagonal;
        code[1] = (gt[1] - anchor[1]) / diagonal;
        code[2] = (gt[2] - anchor[2]) / anchor[5];
        for i in 3..6 {
            code[i] = if self.linear_dim() {
                gt[i] / anchor[i] - 1.0
            } else {
                (gt[i] / anchor[i]).ln()
            };
        }
        code[HEADING_INDEX] = gt[HEADING_INDEX] - anchor[HEADING_INDEX];
        for i in VELOCITY_INDEX..self.code_size() {
            code[i] = gt[i] - anchor.get(i).copied().unwrap_or(0.0);
        }
    }

    fn decode_row(&self, code: ArrayView1<f32>, anchor: ArrayView1<f32>, mut out: ArrayViewMut1<f32>) {
        let diagonal = anchor[3].hypot(anchor[4]);
        out[0] = code[0] * diagonal + anchor[0];
        out[1] = code[1] * diagonal + anchor[1];
        out[2] = code[2] * anchor[5] + anchor[2];
        for i in 3..6 {
            out[i] = if self.linear_dim() {
                (code[i] + 1.0) * anchor[i]
            } else {
                code[i].exp() * anchor[i]
            };
        }
        out[HEADING_INDEX] = code[HEADING_INDEX] + anchor[HEADING_INDEX];
        for i in VELOCITY_INDEX..self.code_size() {
            out[i] = code[i] + anchor.get(i).copied().unwrap_or(0.0);
        }
    }
}
