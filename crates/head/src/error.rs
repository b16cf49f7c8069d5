// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    Boxes(voxelhead_boxes::Error),
    Yaml(serde_yaml::Error),
    Json(serde_json::Error),
    NoConfig,
    InvalidConfig(String),
    UnknownLossNorm(String),
    UnknownNmsMode(String),
    InvalidShape(String),
    InvalidLabel(i32),
}

impl From<voxelhead_boxes::Error> for Error {
    fn from(err: voxelhead_boxes::Error) -> Self {
        Error::Boxes(err)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Yaml(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Boxes(e) => write!(f, "{e}"),
            Error::Yaml(e) => write!(f, "YAML config error: {e}"),
            Error::Json(e) => write!(f, "JSON config error: {e}"),
            Error::NoConfig => write!(f, "No configuration provided"),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {msg}"),
            Error::UnknownLossNorm(name) => write!(f, "Unknown loss normalization: {name}"),
            Error::UnknownNmsMode(name) => write!(f, "Unknown NMS mode: {name}"),
            Error::InvalidShape(msg) => write!(f, "Invalid shape: {msg}"),
            Error::InvalidLabel(label) => write!(f, "Label {label} is out of range"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Boxes(e) => Some(e),
            Error::Yaml(e) => Some(e),
            Error::Json(e) => Some(e),
            _ => None,
        }
    }
}
