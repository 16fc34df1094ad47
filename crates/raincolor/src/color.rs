//! RGB color values as they appear in configuration and status images.

use std::fmt;
use std::str::FromStr;

/// An 8-bit-per-channel RGB color.
///
/// Equality is exact per-channel comparison; the engine never applies
/// perceptual distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    /// Sentinel for "no usable image data".
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);

    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const RED: Rgb = Rgb::new(255, 0, 0);

    /// Neutral page background when no precipitation is rendered.
    pub const DEFAULT_BASELINE: Rgb = Rgb::new(247, 246, 237);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Rgb { r, g, b }
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.r, self.g, self.b)
    }
}

/// Error parsing a `"r g b"` color string.
#[derive(Debug, thiserror::Error)]
#[error("invalid color '{0}': expected three 0-255 channels")]
pub struct ParseRgbError(String);

impl FromStr for Rgb {
    type Err = ParseRgbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let channels: Vec<u8> = s
            .split_whitespace()
            .map(|c| c.parse())
            .collect::<Result<_, _>>()
            .map_err(|_| ParseRgbError(s.to_string()))?;
        match channels.as_slice() {
            [r, g, b] => Ok(Rgb::new(*r, *g, *b)),
            _ => Err(ParseRgbError(s.to_string())),
        }
    }
}
