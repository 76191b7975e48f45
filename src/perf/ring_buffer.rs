//! Mmap'd ring buffer reader for a `perf_event_open(2)` file descriptor
//! (spec section 4.3). Grounded on the teacher's original ring-buffer mmap
//! handling (`anp-perf_events`), rebuilt without the `mio`/`futures` 0.1
//! stream wrapper since the sampler now polls directly.

use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use crate::error::{Error, Result};
use crate::raw::perf_event_mmap_page;

/// One mmap'd perf ring buffer: a `perf_event_mmap_page` header page
/// followed by `data_pages` pages of sample data.
pub struct RingBuffer {
    base: *mut libc::c_void,
    mmap_len: usize,
    data_pages: usize,
}

unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Maps `1 + data_pages` pages over `fd`. `data_pages` must be a power of
    /// two (enforced by the kernel; `perf_event_open(2)` rejects others).
    pub fn map(fd: RawFd, data_pages: usize) -> Result<Self> {
        let page_size = page_size::get();
        let mmap_len = (1 + data_pages) * page_size;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Mmap { inner: nix::Error::last() });
        }

        Ok(RingBuffer {
            base,
            mmap_len,
            data_pages,
        })
    }

    fn header(&self) -> &perf_event_mmap_page {
        unsafe { &*(self.base as *const perf_event_mmap_page) }
    }

    fn data_ptr(&self) -> *const u8 {
        unsafe { (self.base as *const u8).add(page_size::get()) }
    }

    fn data_len(&self) -> u64 {
        (self.data_pages * page_size::get()) as u64
    }

    /// Copies every byte currently available between `data_tail` and
    /// `data_head` into a flat buffer, handling wraparound, then advances
    /// `data_tail` to `data_head` (spec section 4.3: "the tail pointer is
    /// advanced only after a record is fully copied out").
    pub fn drain(&self) -> Vec<u8> {
        let header = self.header();
        let head = unsafe { ptr::read_volatile(&header.data_head) };
        fence(Ordering::Acquire);
        let tail = unsafe { ptr::read_volatile(&header.data_tail) };

        if head == tail {
            return Vec::new();
        }

        let len = self.data_len();
        let available = head.wrapping_sub(tail);
        let mut out = Vec::with_capacity(available as usize);

        let data = self.data_ptr();
        let start = (tail % len) as usize;
        let n = available as usize;

        if start + n <= len as usize {
            unsafe {
                out.extend_from_slice(std::slice::from_raw_parts(data.add(start), n));
            }
        } else {
            let first = len as usize - start;
            unsafe {
                out.extend_from_slice(std::slice::from_raw_parts(data.add(start), first));
                out.extend_from_slice(std::slice::from_raw_parts(data, n - first));
            }
        }

        fence(Ordering::Release);
        unsafe {
            ptr::write_volatile(&header.data_tail as *const u64 as *mut u64, head);
        }

        out
    }

    /// Resets the tail to the head without copying anything out, discarding
    /// whatever is currently buffered. Used when (re-)opening a counter
    /// group mid-run so stale records from before the reset aren't replayed
    /// (spec section 4.3's "skip-to-page-boundary" baseline reset).
    pub fn reset_baseline(&self) {
        let header = self.header();
        let head = unsafe { ptr::read_volatile(&header.data_head) };
        fence(Ordering::Release);
        unsafe {
            ptr::write_volatile(&header.data_tail as *const u64 as *mut u64, head);
        }
    }

    pub fn data_head(&self) -> u64 {
        unsafe { ptr::read_volatile(&self.header().data_head) }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.mmap_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_has_matching_head_and_tail() {
        // A freshly mmap'd, disabled counter has data_head == data_tail == 0;
        // exercised indirectly since RingBuffer::map needs a real fd, this
        // just documents the invariant drain() relies on.
        assert_eq!(0u64.wrapping_sub(0u64), 0);
    }
}
