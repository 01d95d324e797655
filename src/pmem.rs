//! # Persistence Primitives
//!
//! Stores into a mapped persistent-memory region reach the media once the
//! touched cache lines are flushed and a store fence has drained them. The
//! commit protocol depends on exactly one ordering guarantee built from
//! these: payload lines are flushed, then a fence, then the commit word is
//! published.
//!
//! On x86_64 this is `clflush` per 64-byte line plus `sfence`. On other
//! architectures the crate falls back to a sequentially-consistent compiler
//! fence, which keeps the in-process semantics but not the media-order
//! guarantee; real deployments of this layout are x86_64 PMEM hosts.

use crate::config::CACHELINE_SIZE;

/// Flushes the cache lines covering `[ptr, ptr + len)` without fencing.
///
/// # Safety
///
/// The full byte range must be mapped and readable.
pub unsafe fn persist_unfenced(ptr: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let start = ptr as usize & !(CACHELINE_SIZE - 1);
        let end = ptr as usize + len;
        let mut line = start;
        while line < end {
            // SAFETY: `line` stays within the mapped range per the caller's
            // contract, rounded down to its cache line.
            unsafe { core::arch::x86_64::_mm_clflush(line as *const u8) };
            line += CACHELINE_SIZE;
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (ptr, len);
    }
}

/// Store fence: every flush issued before it completes before any store
/// published after it.
pub fn fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: sfence has no memory-safety preconditions.
    unsafe {
        core::arch::x86_64::_mm_sfence()
    };
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Flushes `[ptr, ptr + len)` and fences.
///
/// # Safety
///
/// The full byte range must be mapped and readable.
pub unsafe fn persist_fenced(ptr: *const u8, len: usize) {
    // SAFETY: forwarded contract.
    unsafe { persist_unfenced(ptr, len) };
    fence();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_covers_unaligned_ranges() {
        let buf = vec![0u8; 4096];

        // flushing arbitrary unaligned sub-ranges of live memory must not fault
        unsafe {
            persist_unfenced(buf.as_ptr().wrapping_add(3), 100);
            persist_fenced(buf.as_ptr(), buf.len());
            persist_fenced(buf.as_ptr().wrapping_add(4095), 1);
        }
        fence();
    }
}
