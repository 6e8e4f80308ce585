/*!
 * Geometrical scan window computation.
 *
 * Three different units are in play: the frontend talks millimetres, the
 * scanner talks pixels at the protocol's reference DPI (`units`), and the
 * returned image is in pixels at the actual scan resolution.
 *
 * Scanners advertise a minimum window size, but exposing it to the
 * frontend would make the top-left and bottom-right option ranges depend
 * on each other. Instead the window requested from the scanner is never
 * smaller than the device minimum, and the excess is clipped out of the
 * returned image at read time.
 */
use scanflow_core::types::{bound, mm_to_px, muldiv};

/// A computed scan window along one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Window offset, in pixels at the reference DPI
    pub off: i32,
    /// Window length, in pixels at the reference DPI
    pub len: i32,
    /// Pixels to drop from the returned image, at the actual resolution
    pub skip: i32,
}

/// Compute the scan window along one axis.
///
/// `tl`/`br` are the requested top-left and bottom-right coordinates in
/// millimetres; `min_len`/`max_len` the device limits in pixels at
/// `units` DPI; `res` the actual scan resolution.
///
/// The result satisfies `off >= 0`, `off + len <= max_len` and
/// `max(min_len, 1) <= len <= max_len` for any well-formed input.
pub fn compute(tl: f64, br: f64, min_len: i32, max_len: i32, res: u32, units: u32) -> Geometry {
    let mut off = mm_to_px(tl, units);
    let mut len = mm_to_px(br - tl, units);
    let mut skip = 0;

    let min_len = min_len.max(1);
    len = bound(len, min_len, max_len);

    if off + len > max_len {
        skip = off + len - max_len;
        off -= skip;
        skip = muldiv(skip, res, units);
    }

    Geometry { off, len, skip }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNITS: u32 = 300;

    #[test]
    fn test_plain_window() {
        // A4 on a max-A4 device, no clipping
        let g = compute(0.0, 210.0, 32, 2550, 300, UNITS);
        assert_eq!(g.off, 0);
        assert_eq!(g.len, 2480);
        assert_eq!(g.skip, 0);
    }

    #[test]
    fn test_degenerate_window_uses_min_len() {
        // br == tl collapses to the device minimum
        let g = compute(50.0, 50.0, 32, 2550, 300, UNITS);
        assert_eq!(g.len, 32);
        assert_eq!(g.skip, 0);
        assert!(g.off >= 0 && g.off + g.len <= 2550);
    }

    #[test]
    fn test_zero_min_len_becomes_one() {
        let g = compute(0.0, 0.0, 0, 2550, 300, UNITS);
        assert_eq!(g.len, 1);
    }

    #[test]
    fn test_clip_beyond_edge() {
        // Window hangs over the right edge: offset is pulled back and the
        // excess is reported as skip, scaled to the actual resolution
        let g = compute(200.0, 230.0, 32, 2550, 600, UNITS);
        let off_requested = mm_to_px(200.0, UNITS);
        let len = mm_to_px(30.0, UNITS);
        let over = off_requested + len - 2550;
        assert!(over > 0);
        assert_eq!(g.off, off_requested - over);
        assert_eq!(g.len, len);
        assert_eq!(g.skip, muldiv(over, 600, UNITS));
        assert_eq!(g.off + g.len, 2550);
    }

    #[test]
    fn test_degenerate_at_far_edge() {
        // br == tl at the very edge: min-length window still fits, with
        // nonzero skip iff the padded window hangs over
        let max = 2550;
        let edge_mm = 2550.0 * 25.4 / 300.0;
        let g = compute(edge_mm, edge_mm, 32, max, 300, UNITS);
        assert_eq!(g.len, 32);
        assert!(g.off >= 0);
        assert!(g.off + g.len <= max);
        assert!(g.skip > 0);
    }

    #[test]
    fn test_idempotent() {
        let a = compute(10.0, 200.0, 32, 2550, 300, UNITS);
        let b = compute(10.0, 200.0, 32, 2550, 300, UNITS);
        assert_eq!(a, b);
    }

    #[test]
    fn test_invariants_over_grid() {
        let max = 2550;
        for tl in [0.0, 10.0, 100.0, 215.9, 400.0] {
            for br in [0.0, 10.0, 100.0, 215.9, 400.0] {
                for res in [75, 300, 600] {
                    let g = compute(tl, br, 32, max, res, UNITS);
                    assert!(g.off >= 0, "off >= 0 for tl={} br={}", tl, br);
                    assert!(g.off + g.len <= max);
                    assert!(g.len >= 32 && g.len <= max);
                }
            }
        }
    }
}
