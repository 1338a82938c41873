use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::state::Side;

/// Output resolution, parsed from "WIDTHxHEIGHT".
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self { width: DEFAULT_WIDTH, height: DEFAULT_HEIGHT }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let lowered = value.trim().to_lowercase();
        let (w, h) = lowered
            .split_once('x')
            .ok_or_else(|| format!("resolution {value:?} is not WIDTHxHEIGHT"))?;
        let width: u32 = w.trim().parse().map_err(|_| format!("bad width in {value:?}"))?;
        let height: u32 = h.trim().parse().map_err(|_| format!("bad height in {value:?}"))?;
        Ok(Self {
            width: width.max(MIN_WIDTH),
            height: height.max(MIN_HEIGHT),
        })
    }
}

// Unparseable values fall back to the default resolution
impl From<String> for Resolution {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Window placement handed to a player: `WxH+X+Y`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

pub fn clamp_ratio(ratio: u32) -> u32 {
    ratio.clamp(MIN_SPLIT_RATIO, MAX_SPLIT_RATIO)
}

/// Left and right widths for a splitscreen ratio (percent given to the left side).
pub fn split_widths(resolution: Resolution, ratio: u32) -> (u32, u32) {
    let ratio = clamp_ratio(ratio);
    // In u64 so the product cannot overflow; the quotient always fits back in u32
    let left = (u64::from(resolution.width) * u64::from(ratio) / 100) as u32;
    let left = left.max(1);
    let right = resolution.width.saturating_sub(left).max(1);
    (left, right)
}

/// Window geometry for a side in splitscreen mode.
pub fn split_geometry(resolution: Resolution, ratio: u32, side: Side) -> Geometry {
    let (left, right) = split_widths(resolution, ratio);
    match side {
        Side::Primary => Geometry { width: left, height: resolution.height, x: 0, y: 0 },
        Side::Secondary => Geometry { width: right, height: resolution.height, x: left, y: 0 },
    }
}

/// Pixel box a side's stills are prepared for.
pub fn target_box(resolution: Resolution, splitscreen: Option<u32>, side: Side) -> (u32, u32) {
    match splitscreen {
        Some(ratio) => {
            let geometry = split_geometry(resolution, ratio, side);
            (geometry.width, geometry.height)
        }
        None => (resolution.width, resolution.height),
    }
}
