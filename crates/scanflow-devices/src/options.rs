/*!
 * Scan option state.
 *
 * This module owns the user-visible scan options and the frontend
 * parameters derived from them. Option values persist across open/close;
 * they reset to capability-derived defaults whenever capabilities are
 * (re)acquired.
 */
use scanflow_core::types::{muldiv, px_to_mm, Status};

use crate::caps::{ColorMode, DeviceCaps, FrameFormat, Source};
use crate::geom;

/// Default scan resolution, picked when the device supports it
const DEFAULT_RESOLUTION: u32 = 300;

/// Current scan option values
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    /// Selected scan source
    pub source: Source,
    /// Selected color mode
    pub colormode: ColorMode,
    /// Scan resolution, DPI
    pub resolution: u32,
    /// Window top-left X, millimetres
    pub tl_x: f64,
    /// Window top-left Y, millimetres
    pub tl_y: f64,
    /// Window bottom-right X, millimetres
    pub br_x: f64,
    /// Window bottom-right Y, millimetres
    pub br_y: f64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            source: Source::Platen,
            colormode: ColorMode::Color,
            resolution: DEFAULT_RESOLUTION,
            tl_x: 0.0,
            tl_y: 0.0,
            br_x: 0.0,
            br_y: 0.0,
        }
    }
}

/// A single option assignment, as made by the frontend
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScanOption {
    /// Select the scan source
    Source(Source),
    /// Select the color mode
    ColorMode(ColorMode),
    /// Set the scan resolution, DPI
    Resolution(u32),
    /// Set window top-left X, millimetres
    TlX(f64),
    /// Set window top-left Y, millimetres
    TlY(f64),
    /// Set window bottom-right X, millimetres
    BrX(f64),
    /// Set window bottom-right Y, millimetres
    BrY(f64),
}

/// Frontend parameters derived from the current options.
///
/// These are promised to the caller before the first image arrives, and
/// the read pipeline adjusts whatever the scanner actually returns to
/// match them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanParameters {
    /// Frame format of the delivered raster
    pub format: FrameFormat,
    /// Pixels per line
    pub pixels_per_line: i32,
    /// Number of lines
    pub lines: i32,
    /// Bytes per delivered line
    pub bytes_per_line: i32,
    /// Bits per sample
    pub depth: i32,
}

impl Default for ScanParameters {
    fn default() -> Self {
        Self {
            format: FrameFormat::Rgb,
            pixels_per_line: 0,
            lines: 0,
            bytes_per_line: 0,
            depth: 8,
        }
    }
}

/// Capability-bound option state of one device
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    /// Decoded device capabilities
    pub caps: DeviceCaps,
    /// Current option values
    pub current: ScanOptions,
    /// Parameters derived from `current`
    pub params: ScanParameters,
}

impl DeviceOptions {
    /// Install freshly decoded capabilities and reset every option to its
    /// capability-derived default
    pub fn set_caps(&mut self, caps: DeviceCaps) {
        self.caps = caps;
        self.set_defaults();
    }

    /// Reset options to capability-derived defaults: first source, first
    /// color mode, 300 DPI or nearest, full scan area
    pub fn set_defaults(&mut self) {
        let Some(source) = self.caps.default_source() else {
            self.current = ScanOptions::default();
            self.params = ScanParameters::default();
            return;
        };
        // Sources present in caps always carry at least one mode and
        // resolution; fall back to sane values if a handler was sloppy.
        let src = &self.caps.sources[&source];
        let colormode = src.colormodes.first().copied().unwrap_or(ColorMode::Color);
        let resolution = src.nearest_resolution(DEFAULT_RESOLUTION);

        self.current = ScanOptions {
            source,
            colormode,
            resolution,
            tl_x: 0.0,
            tl_y: 0.0,
            br_x: px_to_mm(src.max_wid_px, self.caps.units),
            br_y: px_to_mm(src.max_hei_px, self.caps.units),
        };
        self.recompute_params();
    }

    /// Apply a single option assignment.
    ///
    /// Enum values must be supported by the selected source; numeric
    /// values are snapped or clamped into the supported range. Derived
    /// parameters are recomputed on success.
    pub fn set(&mut self, opt: ScanOption) -> Result<(), Status> {
        match opt {
            ScanOption::Source(source) => {
                if self.caps.source(source).is_none() {
                    return Err(Status::Inval);
                }
                self.current.source = source;
                // Re-validate dependent options against the new source
                let src = &self.caps.sources[&source];
                if !src.colormodes.contains(&self.current.colormode) {
                    self.current.colormode =
                        src.colormodes.first().copied().unwrap_or(ColorMode::Color);
                }
                self.current.resolution = src.nearest_resolution(self.current.resolution);
            }
            ScanOption::ColorMode(mode) => {
                if !self.source_caps()?.colormodes.contains(&mode) {
                    return Err(Status::Inval);
                }
                self.current.colormode = mode;
            }
            ScanOption::Resolution(res) => {
                if res == 0 {
                    return Err(Status::Inval);
                }
                let snapped = self.source_caps()?.nearest_resolution(res);
                self.current.resolution = snapped;
            }
            ScanOption::TlX(mm) => {
                let mm = self.clamp_x(mm)?;
                self.current.tl_x = mm;
            }
            ScanOption::TlY(mm) => {
                let mm = self.clamp_y(mm)?;
                self.current.tl_y = mm;
            }
            ScanOption::BrX(mm) => {
                let mm = self.clamp_x(mm)?;
                self.current.br_x = mm;
            }
            ScanOption::BrY(mm) => {
                let mm = self.clamp_y(mm)?;
                self.current.br_y = mm;
            }
        }

        self.recompute_params();
        Ok(())
    }

    fn source_caps(&self) -> Result<&crate::caps::SourceCaps, Status> {
        self.caps.source(self.current.source).ok_or(Status::Inval)
    }

    fn clamp_x(&self, mm: f64) -> Result<f64, Status> {
        if !mm.is_finite() {
            return Err(Status::Inval);
        }
        let max = px_to_mm(self.source_caps()?.max_wid_px, self.caps.units);
        Ok(mm.clamp(0.0, max))
    }

    fn clamp_y(&self, mm: f64) -> Result<f64, Status> {
        if !mm.is_finite() {
            return Err(Status::Inval);
        }
        let max = px_to_mm(self.source_caps()?.max_hei_px, self.caps.units);
        Ok(mm.clamp(0.0, max))
    }

    /// Recompute the derived frontend parameters from the current options
    pub fn recompute_params(&mut self) {
        let Some(src) = self.caps.source(self.current.source) else {
            self.params = ScanParameters::default();
            return;
        };
        let units = self.caps.units;
        let res = self.current.resolution;

        let geom_x = geom::compute(
            self.current.tl_x,
            self.current.br_x,
            src.min_wid_px,
            src.max_wid_px,
            res,
            units,
        );
        let geom_y = geom::compute(
            self.current.tl_y,
            self.current.br_y,
            src.min_hei_px,
            src.max_hei_px,
            res,
            units,
        );

        let pixels_per_line = muldiv(geom_x.len, res, units);
        let lines = muldiv(geom_y.len, res, units);
        let bpp = self.current.colormode.bytes_per_pixel() as i32;

        self.params = ScanParameters {
            format: self.current.colormode.frame_format(),
            pixels_per_line,
            lines,
            bytes_per_line: pixels_per_line * bpp,
            depth: 8,
        };
    }
}
