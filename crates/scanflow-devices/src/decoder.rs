/*!
 * Image decoding.
 *
 * The read pipeline pulls encoded page images off the queue and turns
 * them into raster lines through the [`ImageDecoder`] trait. The default
 * implementation handles the JPEG and PNG frames eSCL-family scanners
 * produce.
 */
use thiserror::Error;

use crate::caps::FrameFormat;

/// Parameters of a decoded image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageParams {
    /// Frame format
    pub format: FrameFormat,
    /// Pixels per line
    pub pixels_per_line: i32,
    /// Number of lines
    pub lines: i32,
    /// Bits per sample
    pub depth: i32,
}

/// A clipping window within a decoded image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageWindow {
    /// Left edge, pixels
    pub x_off: i32,
    /// Top edge, pixels
    pub y_off: i32,
    /// Width, pixels
    pub wid: i32,
    /// Height, pixels
    pub hei: i32,
}

/// Image decoding error
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The image data could not be parsed
    #[error("image decode error: {0}")]
    Malformed(String),

    /// Called without an image under decode
    #[error("no image under decode")]
    NotStarted,

    /// Read past the last line of the window
    #[error("read past end of image")]
    PastEnd,
}

impl From<image::ImageError> for DecodeError {
    fn from(err: image::ImageError) -> Self {
        DecodeError::Malformed(err.to_string())
    }
}

/// Line-oriented decoder of one encoded image at a time
pub trait ImageDecoder: Send {
    /// Begin decoding an encoded image
    fn begin(&mut self, data: &[u8]) -> Result<(), DecodeError>;

    /// Parameters of the image under decode
    fn params(&self) -> Result<ImageParams, DecodeError>;

    /// Bytes per pixel of the image under decode
    fn bytes_per_pixel(&self) -> usize;

    /// Restrict decoding to a window of the image.
    ///
    /// The decoder may not honor the requested window exactly; the
    /// possibly adjusted window is returned and the caller compensates
    /// for the difference.
    fn set_window(&mut self, win: ImageWindow) -> Result<ImageWindow, DecodeError>;

    /// Decode the next line of the window into `buf`.
    ///
    /// `buf` must hold at least `win.wid * bytes_per_pixel()` bytes.
    fn read_line(&mut self, buf: &mut [u8]) -> Result<(), DecodeError>;

    /// Drop the image under decode, if any
    fn reset(&mut self);
}

struct DecodedImage {
    format: FrameFormat,
    width: usize,
    height: usize,
    bpp: usize,
    /// Tightly packed rows, width * bpp bytes each
    data: Vec<u8>,
    window: ImageWindow,
    next_line: usize,
}

/// Default decoder for JPEG and PNG frames.
///
/// Images are decoded up front and served line by line; grayscale
/// sources yield 8-bit gray, everything else is normalized to RGB8.
#[derive(Default)]
pub struct RasterDecoder {
    image: Option<DecodedImage>,
}

impl RasterDecoder {
    /// Create an idle decoder
    pub fn new() -> Self {
        Self::default()
    }

    fn image(&self) -> Result<&DecodedImage, DecodeError> {
        self.image.as_ref().ok_or(DecodeError::NotStarted)
    }
}

impl ImageDecoder for RasterDecoder {
    fn begin(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        let decoded = image::load_from_memory(data)?;

        let (format, bpp, width, height, data) = match decoded.color() {
            image::ColorType::L8 | image::ColorType::L16 | image::ColorType::La8 => {
                let gray = decoded.to_luma8();
                let (w, h) = gray.dimensions();
                (FrameFormat::Gray, 1, w as usize, h as usize, gray.into_raw())
            }
            _ => {
                let rgb = decoded.to_rgb8();
                let (w, h) = rgb.dimensions();
                (FrameFormat::Rgb, 3, w as usize, h as usize, rgb.into_raw())
            }
        };

        if width == 0 || height == 0 {
            return Err(DecodeError::Malformed("empty image".to_string()));
        }

        self.image = Some(DecodedImage {
            format,
            width,
            height,
            bpp,
            data,
            window: ImageWindow {
                x_off: 0,
                y_off: 0,
                wid: width as i32,
                hei: height as i32,
            },
            next_line: 0,
        });

        Ok(())
    }

    fn params(&self) -> Result<ImageParams, DecodeError> {
        let image = self.image()?;
        Ok(ImageParams {
            format: image.format,
            pixels_per_line: image.width as i32,
            lines: image.height as i32,
            depth: 8,
        })
    }

    fn bytes_per_pixel(&self) -> usize {
        self.image.as_ref().map_or(0, |image| image.bpp)
    }

    fn set_window(&mut self, win: ImageWindow) -> Result<ImageWindow, DecodeError> {
        let image = self.image.as_mut().ok_or(DecodeError::NotStarted)?;
        let width = image.width as i32;
        let height = image.height as i32;

        let x_off = win.x_off.clamp(0, width.saturating_sub(1));
        let y_off = win.y_off.clamp(0, height.saturating_sub(1));
        let wid = win.wid.clamp(1, width - x_off);
        let hei = win.hei.clamp(1, height - y_off);

        image.window = ImageWindow {
            x_off,
            y_off,
            wid,
            hei,
        };
        image.next_line = 0;

        Ok(image.window)
    }

    fn read_line(&mut self, buf: &mut [u8]) -> Result<(), DecodeError> {
        let image = self.image.as_mut().ok_or(DecodeError::NotStarted)?;
        let win = image.window;

        if image.next_line >= win.hei as usize {
            return Err(DecodeError::PastEnd);
        }

        let row = win.y_off as usize + image.next_line;
        let start = (row * image.width + win.x_off as usize) * image.bpp;
        let len = win.wid as usize * image.bpp;

        buf[..len].copy_from_slice(&image.data[start..start + len]);
        image.next_line += 1;

        Ok(())
    }

    fn reset(&mut self) {
        self.image = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::png::PngEncoder;
    use image::{ExtendedColorType, ImageEncoder};

    fn encode_gray_png(width: u32, height: u32, shade: impl Fn(u32, u32) -> u8) -> Vec<u8> {
        let mut pixels = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(shade(x, y));
            }
        }
        let mut out = Vec::new();
        PngEncoder::new(&mut out)
            .write_image(&pixels, width, height, ExtendedColorType::L8)
            .unwrap();
        out
    }

    #[test]
    fn test_begin_and_params() {
        let png = encode_gray_png(8, 4, |x, _| x as u8);
        let mut decoder = RasterDecoder::new();
        decoder.begin(&png).unwrap();

        let params = decoder.params().unwrap();
        assert_eq!(params.format, FrameFormat::Gray);
        assert_eq!(params.pixels_per_line, 8);
        assert_eq!(params.lines, 4);
        assert_eq!(params.depth, 8);
        assert_eq!(decoder.bytes_per_pixel(), 1);
    }

    #[test]
    fn test_read_lines() {
        let png = encode_gray_png(4, 2, |x, y| (10 * y + x) as u8);
        let mut decoder = RasterDecoder::new();
        decoder.begin(&png).unwrap();

        let mut buf = [0u8; 4];
        decoder.read_line(&mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3]);
        decoder.read_line(&mut buf).unwrap();
        assert_eq!(buf, [10, 11, 12, 13]);
        assert!(matches!(
            decoder.read_line(&mut buf),
            Err(DecodeError::PastEnd)
        ));
    }

    #[test]
    fn test_window_clips() {
        let png = encode_gray_png(6, 6, |x, y| (10 * y + x) as u8);
        let mut decoder = RasterDecoder::new();
        decoder.begin(&png).unwrap();

        let win = decoder
            .set_window(ImageWindow {
                x_off: 2,
                y_off: 3,
                wid: 3,
                hei: 2,
            })
            .unwrap();
        assert_eq!(win.x_off, 2);
        assert_eq!(win.y_off, 3);

        let mut buf = [0u8; 3];
        decoder.read_line(&mut buf).unwrap();
        assert_eq!(buf, [32, 33, 34]);
    }

    #[test]
    fn test_window_adjusts_out_of_range() {
        let png = encode_gray_png(4, 4, |_, _| 0);
        let mut decoder = RasterDecoder::new();
        decoder.begin(&png).unwrap();

        let win = decoder
            .set_window(ImageWindow {
                x_off: 2,
                y_off: 0,
                wid: 100,
                hei: 100,
            })
            .unwrap();
        assert_eq!(win.wid, 2);
        assert_eq!(win.hei, 4);
    }

    #[test]
    fn test_malformed_input() {
        let mut decoder = RasterDecoder::new();
        assert!(matches!(
            decoder.begin(b"not an image"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(decoder.params(), Err(DecodeError::NotStarted)));
    }

    #[test]
    fn test_reset() {
        let png = encode_gray_png(2, 2, |_, _| 0);
        let mut decoder = RasterDecoder::new();
        decoder.begin(&png).unwrap();
        decoder.reset();
        assert!(matches!(decoder.params(), Err(DecodeError::NotStarted)));
    }
}
