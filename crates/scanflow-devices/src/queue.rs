/*!
 * Image queue and read wakeup.
 *
 * The event loop pushes encoded page images as they arrive; the frontend
 * caller pulls them one at a time for decoding. Alongside the queue
 * lives the pollable: a pipe-like file descriptor handed to frontends
 * that drive the backend through select/poll.
 */
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use bytes::Bytes;
use parking_lot::Mutex;

/// FIFO of encoded page images.
///
/// Only encoded buffers ever sit here; decoding is strictly pull-driven
/// by the reader.
#[derive(Debug, Default)]
pub struct ImageQueue {
    queue: Mutex<VecDeque<Bytes>>,
}

impl ImageQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an encoded image
    pub fn push(&self, image: Bytes) {
        self.queue.lock().push_back(image);
    }

    /// Take the oldest image, if any
    pub fn pull(&self) -> Option<Bytes> {
        self.queue.lock().pop_front()
    }

    /// Number of queued images
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drop all queued images
    pub fn purge(&self) {
        self.queue.lock().clear();
    }
}

/// A level-style wakeup with a pollable file descriptor.
///
/// `signal` makes the descriptor readable; `reset` drains it. Signalling
/// an already signalled pollable is a no-op, as is resetting an idle one.
#[derive(Debug)]
pub struct Pollable {
    reader: UnixStream,
    writer: UnixStream,
}

impl Pollable {
    /// Create a pollable in the non-signalled state
    pub fn new() -> std::io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    /// Make the descriptor readable
    pub fn signal(&self) {
        // A full pipe already reads as signalled
        let _ = (&self.writer).write(&[0u8]);
    }

    /// Drain the descriptor back to the non-signalled state
    pub fn reset(&self) {
        let mut buf = [0u8; 64];
        while matches!((&self.reader).read(&mut buf), Ok(n) if n > 0) {}
    }

    /// The descriptor to hand to select/poll
    pub fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Whether the pollable currently reads as signalled
    pub fn is_signalled(&self) -> bool {
        let mut buf = [0u8; 1];
        let fd = self.reader.as_raw_fd();
        // SAFETY: `fd` is a valid, open socket owned by `self.reader` for the
        // duration of this call; `buf` is a valid 1-byte buffer. MSG_PEEK
        // leaves any pending byte in the socket's receive queue, matching
        // the semantics of the (unstable) UnixStream::peek this replaces.
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), libc::MSG_PEEK) };
        n > 0
    }
}
