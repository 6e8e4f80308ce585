/*!
 * Read pipeline.
 *
 * The frontend caller pulls encoded images off the queue one at a time
 * and drains them line by line. The actual image a scanner returns may
 * differ slightly from the promised frontend parameters, so lines are
 * clipped and padded here to keep the promise: missing rows and columns
 * are synthesized as white (`0xFF`), excess leading pixels are dropped
 * according to the skip values computed at scan start.
 *
 * Frontends expect parameters to be accurate right after start returns;
 * deferring the adjustment to them would force start to block until the
 * first image is fully available.
 */
use std::sync::atomic::Ordering;

use bytes::Bytes;
use tracing::{debug, trace};

use scanflow_core::types::Status;

use crate::decoder::ImageWindow;
use crate::device::{Device, DeviceFlags, DeviceState, ReadState};
use crate::options::ScanParameters;

impl Device {
    /// Pull the next image from the queue and set up its decode
    fn read_next_image(&self, read: &mut ReadState) -> Status {
        let Some(image) = self.queue.pull() else {
            return Status::Eof;
        };

        let status = self.read_begin_image(read, &image);
        if status == Status::Good {
            read.image = Some(image);
        }
        status
    }

    fn read_begin_image(&self, read: &mut ReadState, image: &Bytes) -> Status {
        if let Err(err) = read.decoder.begin(image) {
            debug!(parent: &self.span, "{}", err);
            return Status::IoError;
        }

        let params = match read.decoder.params() {
            Ok(params) => params,
            Err(err) => {
                debug!(parent: &self.span, "{}", err);
                return Status::IoError;
            }
        };

        let (promised, skip_x, skip_y) = {
            let inner = self.inner.lock();
            (inner.opt.params, inner.job_skip_x, inner.job_skip_y)
        };

        if params.format != promised.format {
            // This is what we cannot handle
            debug!(
                parent: &self.span,
                "unexpected image format: {} instead of {}", params.format, promised.format
            );
            return Status::IoError;
        }

        let wid = params.pixels_per_line;
        let hei = params.lines;

        trace!(parent: &self.span, "image under decode:");
        trace!(parent: &self.span, "  format: {}", params.format);
        trace!(parent: &self.span, "  size:   {}x{}", wid, hei);
        trace!(parent: &self.span, "  depth:  {}", params.depth);

        let promised_bpl = promised.bytes_per_line as usize;
        let line_capacity;

        if skip_x >= wid || skip_y >= hei {
            // Trivial case, the whole image is skipped
            read.skip_lines = hei;
            read.skip_bytes = 0;
            line_capacity = promised_bpl;
        } else {
            let bpp = read.decoder.bytes_per_pixel();
            let win = ImageWindow {
                x_off: skip_x,
                y_off: skip_y,
                wid: wid - skip_x,
                hei: hei - skip_y,
            };

            let win = match read.decoder.set_window(win) {
                Ok(win) => win,
                Err(err) => {
                    debug!(parent: &self.span, "{}", err);
                    return Status::IoError;
                }
            };

            read.skip_bytes = if win.x_off != skip_x {
                bpp * (skip_x - win.x_off) as usize
            } else {
                0
            };
            read.skip_lines = if win.y_off != skip_y {
                skip_y - win.y_off
            } else {
                0
            };

            line_capacity = promised_bpl.max(wid as usize * bpp);
        }

        read.line_buf = vec![0xff; line_capacity];
        read.line_num = 0;
        read.line_off = promised_bpl;
        read.line_end = hei - read.skip_lines;

        self.pollable.signal();
        Status::Good
    }

    /// Decode the next line into the line buffer.
    ///
    /// Lines before `skip_lines` and from `line_end` on are synthesized
    /// as white; in between they come from the decoder window.
    fn read_decode_line(&self, read: &mut ReadState, params: &ScanParameters) -> Status {
        let n = read.line_num;

        if n == params.lines {
            return Status::Eof;
        }

        let promised_bpl = params.bytes_per_line as usize;
        if n < read.skip_lines || n >= read.line_end {
            read.line_buf[..promised_bpl].fill(0xff);
        } else if let Err(err) = read.decoder.read_line(&mut read.line_buf) {
            debug!(parent: &self.span, "{}", err);
            return Status::IoError;
        }

        read.line_off = read.skip_bytes;
        read.line_num += 1;

        Status::Good
    }

    /// Read decoded raster data into `data`.
    ///
    /// Blocks until data is available unless non-blocking mode is set, in
    /// which case an empty read is returned. A terminal condition (end
    /// of job, cancellation, error) is reported as `Err` after all
    /// produced data has been delivered; `read` must not be called again
    /// for this job afterwards.
    pub fn read(&self, data: &mut [u8]) -> Result<usize, Status> {
        if !self.flags().contains(DeviceFlags::READING) {
            return Err(Status::Inval);
        }

        let mut read = self.read.lock();
        let mut len = 0;
        let mut status = Status::Good;

        'job: {
            // Wait until an image is available
            if read.image.is_none() {
                {
                    let mut inner = self.inner.lock();
                    while self.state_working() && self.queue.is_empty() {
                        if self.read_non_blocking.load(Ordering::SeqCst) {
                            return Ok(0);
                        }
                        self.stm_cond.wait(&mut inner);
                    }

                    if inner.job_status == Status::Cancelled {
                        status = Status::Cancelled;
                        break 'job;
                    }

                    if self.queue.is_empty() {
                        // Job ended without producing anything further
                        status = inner.job_status;
                        debug_assert_ne!(status, Status::Good);
                        break 'job;
                    }
                }

                status = self.read_next_image(&mut read);
                if status != Status::Good {
                    break 'job;
                }
            }

            let params = self.inner.lock().opt.params;
            let promised_bpl = params.bytes_per_line as usize;

            // Deliver line by line
            while status == Status::Good && len < data.len() {
                if read.line_off == promised_bpl {
                    status = self.read_decode_line(&mut read, &params);
                } else {
                    let sz = (data.len() - len).min(promised_bpl - read.line_off);
                    data[len..len + sz]
                        .copy_from_slice(&read.line_buf[read.line_off..read.line_off + sz]);
                    read.line_off += sz;
                    len += sz;
                }
            }

            if status == Status::IoError {
                self.job_set_status(Status::IoError);
                self.stm_cancel_req();
            }
        }

        // Image exhausted with data already delivered: report it now,
        // the terminal condition surfaces on the next call
        if status == Status::Eof && len > 0 {
            status = Status::Good;
        }

        if status == Status::Good {
            return Ok(len);
        }

        // Scan and read finished, clean up
        self.flags_clear(DeviceFlags::SCANNING | DeviceFlags::READING);
        read.decoder.reset();
        read.image = None;
        read.line_buf = Vec::new();

        if self.state() == DeviceState::Done && self.queue.is_empty() {
            self.state_set(DeviceState::Idle);
        }

        Err(status)
    }
}
