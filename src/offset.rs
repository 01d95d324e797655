//! # Offset Manager
//!
//! `read` and `write` (the implicit-offset forms) need a serial order: each
//! caller atomically reserves its byte range at the shared file position and
//! receives a monotonically increasing ticket. Commits then retire in ticket
//! order, so the implicit-position accounting of concurrent writers is a
//! single linear history. `pread`/`pwrite` never touch the manager and
//! interleave freely.
//!
//! The reservation itself is one CAS loop; the only waiting happens at
//! retire time, where a transaction spins until every smaller ticket has
//! retired.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared implicit file position plus the ticket sequencer.
pub struct OffsetMgr {
    offset: AtomicU64,
    next_ticket: AtomicU64,
    retired: AtomicU64,
}

/// A reserved byte range at the implicit offset. Must be retired exactly
/// once, on every path out of the operation that acquired it.
#[derive(Debug)]
pub struct Ticket {
    pub offset: u64,
    pub count: usize,
    serial: u64,
}

impl OffsetMgr {
    pub fn new() -> Self {
        Self {
            offset: AtomicU64::new(0),
            next_ticket: AtomicU64::new(1),
            retired: AtomicU64::new(0),
        }
    }

    /// Reserves `count` bytes at the current implicit offset and advances
    /// it. With `stop_at_boundary` the reservation is clamped to
    /// `boundary` (reads stop at EOF); the clamped count may be zero.
    pub fn acquire(&self, count: usize, boundary: u64, stop_at_boundary: bool) -> Ticket {
        let mut old = self.offset.load(Ordering::Acquire);
        loop {
            let granted = if stop_at_boundary {
                (boundary.saturating_sub(old)).min(count as u64) as usize
            } else {
                count
            };
            match self.offset.compare_exchange_weak(
                old,
                old + granted as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let serial = self.next_ticket.fetch_add(1, Ordering::AcqRel);
                    return Ticket {
                        offset: old,
                        count: granted,
                        serial,
                    };
                }
                Err(seen) => old = seen,
            }
        }
    }

    /// Blocks until every ticket issued before `ticket` has retired. Commits
    /// call this so the log order of implicit-offset writes matches ticket
    /// order.
    pub fn wait_turn(&self, ticket: &Ticket) {
        let mut spins = 0u32;
        while self.retired.load(Ordering::Acquire) != ticket.serial - 1 {
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Retires the ticket. Callers must have waited for their turn.
    pub fn retire(&self, ticket: Ticket) {
        debug_assert_eq!(self.retired.load(Ordering::Acquire), ticket.serial - 1);
        self.retired.store(ticket.serial, Ordering::Release);
    }

    /// Repositions the implicit offset (`lseek`). Returns the new position,
    /// or `None` for a negative target.
    pub fn seek(&self, base: SeekBase, delta: i64) -> Option<u64> {
        match base {
            SeekBase::Start => {
                if delta < 0 {
                    return None;
                }
                self.offset.store(delta as u64, Ordering::Release);
                Some(delta as u64)
            }
            SeekBase::Current => {
                let mut old = self.offset.load(Ordering::Acquire);
                loop {
                    let new = old.checked_add_signed(delta)?;
                    match self.offset.compare_exchange_weak(
                        old,
                        new,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Some(new),
                        Err(seen) => old = seen,
                    }
                }
            }
            SeekBase::End(file_size) => {
                let new = file_size.checked_add_signed(delta)?;
                self.offset.store(new, Ordering::Release);
                Some(new)
            }
        }
    }
}

impl Default for OffsetMgr {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SeekBase {
    Start,
    Current,
    /// Resolved against the replay-derived file size at call time.
    End(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_do_not_overlap() {
        let mgr = OffsetMgr::new();

        let a = mgr.acquire(100, 0, false);
        let b = mgr.acquire(50, 0, false);

        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 100);
        assert_eq!(mgr.seek(SeekBase::Current, 0), Some(150));
    }

    #[test]
    fn tickets_retire_in_order() {
        let mgr = OffsetMgr::new();

        let a = mgr.acquire(1, 0, false);
        let b = mgr.acquire(1, 0, false);

        mgr.wait_turn(&a);
        mgr.retire(a);
        mgr.wait_turn(&b);
        mgr.retire(b);
    }

    #[test]
    fn boundary_clamps_reads() {
        let mgr = OffsetMgr::new();

        let a = mgr.acquire(100, 30, true);
        assert_eq!((a.offset, a.count), (0, 30));

        let b = mgr.acquire(100, 30, true);
        assert_eq!((b.offset, b.count), (30, 0));
    }

    #[test]
    fn concurrent_acquires_partition_the_range() {
        use std::sync::Arc;

        let mgr = Arc::new(OffsetMgr::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = Arc::clone(&mgr);
            handles.push(std::thread::spawn(move || {
                let mut offsets = Vec::new();
                for _ in 0..100 {
                    let t = mgr.acquire(512, 0, false);
                    offsets.push(t.offset);
                    mgr.wait_turn(&t);
                    mgr.retire(t);
                }
                offsets
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();

        let expected: Vec<u64> = (0..800u64).map(|i| i * 512).collect();
        assert_eq!(all, expected);
        assert_eq!(mgr.seek(SeekBase::Current, 0), Some(800 * 512));
    }

    #[test]
    fn seek_variants() {
        let mgr = OffsetMgr::new();

        assert_eq!(mgr.seek(SeekBase::Start, 100), Some(100));
        assert_eq!(mgr.seek(SeekBase::Current, -40), Some(60));
        assert_eq!(mgr.seek(SeekBase::Current, -100), None);
        assert_eq!(mgr.seek(SeekBase::End(4096), -96), Some(4000));
        assert_eq!(mgr.seek(SeekBase::Start, -1), None);
    }
}
