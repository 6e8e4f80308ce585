/*!
 * Scanner capability model.
 *
 * Capabilities are what a protocol handler extracts from the device's
 * capability document: the supported sources with their window limits,
 * resolutions and color modes. Window limits are expressed in pixels at
 * the protocol's reference DPI (`units`), never in millimetres.
 */
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A scan source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Flatbed glass
    Platen,
    /// Automatic document feeder, front side
    AdfSimplex,
    /// Automatic document feeder, both sides
    AdfDuplex,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Platen => write!(f, "Flatbed"),
            Source::AdfSimplex => write!(f, "ADF"),
            Source::AdfDuplex => write!(f, "ADF Duplex"),
        }
    }
}

/// A color mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    /// 8-bit grayscale
    Grayscale,
    /// 24-bit RGB
    Color,
}

impl ColorMode {
    /// Bytes per pixel for this color mode
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ColorMode::Grayscale => 1,
            ColorMode::Color => 3,
        }
    }

    /// The raster frame format produced in this mode
    pub fn frame_format(self) -> FrameFormat {
        match self {
            ColorMode::Grayscale => FrameFormat::Gray,
            ColorMode::Color => FrameFormat::Rgb,
        }
    }
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorMode::Grayscale => write!(f, "Gray"),
            ColorMode::Color => write!(f, "Color"),
        }
    }
}

/// Raster frame format delivered to the frontend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFormat {
    /// One byte per pixel
    Gray,
    /// Three bytes per pixel, interleaved
    Rgb,
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameFormat::Gray => write!(f, "Gray"),
            FrameFormat::Rgb => write!(f, "RGB"),
        }
    }
}

/// Per-source capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCaps {
    /// Minimum scan width, in pixels at the reference DPI
    pub min_wid_px: i32,
    /// Maximum scan width, in pixels at the reference DPI
    pub max_wid_px: i32,
    /// Minimum scan height, in pixels at the reference DPI
    pub min_hei_px: i32,
    /// Maximum scan height, in pixels at the reference DPI
    pub max_hei_px: i32,
    /// Supported resolutions, DPI, ascending
    pub resolutions: Vec<u32>,
    /// Supported color modes
    pub colormodes: Vec<ColorMode>,
}

impl SourceCaps {
    /// Snap a requested resolution to the nearest supported one
    pub fn nearest_resolution(&self, want: u32) -> u32 {
        self.resolutions
            .iter()
            .copied()
            .min_by_key(|r| r.abs_diff(want))
            .unwrap_or(want)
    }
}

/// Device capabilities, as decoded from the capability document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCaps {
    /// Device vendor string
    pub vendor: String,
    /// Device model string
    pub model: String,
    /// Reference DPI the window limits are expressed against
    pub units: u32,
    /// Capabilities per supported source
    pub sources: BTreeMap<Source, SourceCaps>,
}

impl DeviceCaps {
    /// Look up capabilities of a source
    pub fn source(&self, src: Source) -> Option<&SourceCaps> {
        self.sources.get(&src)
    }

    /// The source selected by default: the first one the device offers
    pub fn default_source(&self) -> Option<Source> {
        self.sources.keys().next().copied()
    }

    /// Log a one-line summary of the capabilities
    pub fn dump(&self) {
        for (src, caps) in &self.sources {
            tracing::debug!(
                "caps: {}: {}x{}px @ {}dpi units, resolutions {:?}",
                src,
                caps.max_wid_px,
                caps.max_hei_px,
                self.units,
                caps.resolutions
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a4_caps() -> DeviceCaps {
        let mut sources = BTreeMap::new();
        sources.insert(
            Source::Platen,
            SourceCaps {
                min_wid_px: 32,
                max_wid_px: 2550, // 8.5" at 300 dpi
                min_hei_px: 32,
                max_hei_px: 3508, // A4 height at 300 dpi
                resolutions: vec![75, 150, 300, 600],
                colormodes: vec![ColorMode::Grayscale, ColorMode::Color],
            },
        );
        DeviceCaps {
            vendor: "Example".to_string(),
            model: "Scanner 9000".to_string(),
            units: 300,
            sources,
        }
    }

    #[test]
    fn test_nearest_resolution() {
        let caps = a4_caps();
        let src = caps.source(Source::Platen).unwrap();
        assert_eq!(src.nearest_resolution(300), 300);
        assert_eq!(src.nearest_resolution(200), 150);
        assert_eq!(src.nearest_resolution(10_000), 600);
    }

    #[test]
    fn test_default_source() {
        let caps = a4_caps();
        assert_eq!(caps.default_source(), Some(Source::Platen));
        assert_eq!(DeviceCaps::default().default_source(), None);
    }

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(ColorMode::Grayscale.bytes_per_pixel(), 1);
        assert_eq!(ColorMode::Color.bytes_per_pixel(), 3);
    }
}
