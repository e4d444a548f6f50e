use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::tcb::TcbKey;

/// A 64-bit monotonic tick counter. The engine's caller decides the unit
/// (this crate's tests use whole seconds, matching `stack-tcp-core.c`'s
/// `secs`-granularity timeouts).
pub type Tick = u64;

/// Timeout store keyed by tick (`SPEC_FULL.md` §4.B).
///
/// Each TCB owns at most one timer entry and entries embed nothing but a
/// `TcbKey` and the tick they were scheduled for — no raw pointers, and no
/// cyclic `Rc`/`Weak` pair between a TCB and "its" timer entry. Instead, the
/// wheel's entries are *hints*: `Table` is the single source of truth for
/// "what tick is this TCB's live timer armed for", recorded on the `Tcb`
/// itself. `remove_expired` pops hints in tick order and asks a caller
///-supplied closure whether the popped hint still matches the TCB's
/// recorded tick; if a TCB was destroyed or rescheduled since the hint was
/// pushed, the closure says so and the stale hint is silently discarded.
/// This sidesteps the classic "timer entry points back into its owning
/// struct" ownership cycle (`SPEC_FULL.md` §9 "cyclic ownership") entirely:
/// resolving `owner = base − offset` is unnecessary when the owner is
/// addressed by a generational key instead of a raw pointer.
#[derive(Debug, Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<(Tick, TcbKey)>>,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            heap: BinaryHeap::new(),
        }
    }

    /// Schedule `key` to fire at `tick`. Does not unlink any previous entry
    /// for `key`; an earlier entry simply becomes a stale hint that
    /// `remove_expired` will discard once the owner's recorded tick no
    /// longer matches it.
    pub fn add(&mut self, key: TcbKey, tick: Tick) {
        self.heap.push(Reverse((tick, key)));
    }

    /// Pop and return one TCB whose scheduled tick is `<= now`, skipping (and
    /// permanently discarding) any stale hints along the way. `current_tick`
    /// must return `Some(tick)` if `key` still has a live timer armed for
    /// `tick`, or `None`/a different tick if the hint is stale.
    pub fn remove_expired<F>(&mut self, now: Tick, current_tick: F) -> Option<TcbKey>
    where
        F: Fn(TcbKey) -> Option<Tick>,
    {
        while let Some(&Reverse((tick, key))) = self.heap.peek() {
            if tick > now {
                return None;
            }
            self.heap.pop();
            if current_tick(key) == Some(tick) {
                return Some(key);
            }
            // stale hint (TCB destroyed or rescheduled since); keep draining.
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
