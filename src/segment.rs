use std::collections::VecDeque;

use log::{debug, trace};

use crate::tcb::{Tcb, TcpPhase};

/// Buffer ownership discipline for a queued segment (`SPEC_FULL.md` §3).
///
/// In a language without manual memory management the three variants no
/// longer distinguish *how* a buffer is released (Rust just drops the
/// `Vec<u8>` either way) — they distinguish how the buffer was *acquired*,
/// which still matters for the `Adopted -> Copied` conversion `acknowledge`
/// performs on a partially-ACKed head segment (see below), and is kept as a
/// first-class tag for fidelity to the source algorithm and for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Caller-provided buffer with a lifetime the engine never owns (e.g. a
    /// compiled-in hello template). Never reallocated.
    Static,
    /// The engine took ownership of a caller-supplied heap buffer outright.
    Adopted,
    /// The engine allocated its own buffer and copied the caller's data in.
    Copied,
}

#[derive(Debug)]
enum Buffer {
    Static(&'static [u8]),
    Owned(Vec<u8>),
}

impl Buffer {
    fn as_slice(&self) -> &[u8] {
        match self {
            Buffer::Static(s) => s,
            Buffer::Owned(v) => v.as_slice(),
        }
    }
}

/// One queued outbound segment (`SPEC_FULL.md` §3).
#[derive(Debug)]
pub struct Segment {
    pub seq: u32,
    pub fin: bool,
    pub ownership: Ownership,
    buf: Buffer,
}

impl Segment {
    pub fn payload(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn len(&self) -> u32 {
        self.buf.as_slice().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence-space length including the synthetic `FIN` byte.
    pub fn total_len(&self) -> u32 {
        self.len() + u32::from(self.fin)
    }
}

/// The outbound segment list for one TCB (`SPEC_FULL.md` §4.E).
#[derive(Debug, Default)]
pub struct SegmentQueue {
    queue: VecDeque<Segment>,
}

/// Instruction handed to the transmit bridge (`crate::xmit`) after a queue
/// operation decides a segment needs to go on the wire right now.
#[derive(Debug, Clone, Copy)]
pub struct TransmitHead {
    pub seq: u32,
    pub len: u32,
    pub fin: bool,
}

/// Outcome of `acknowledge` (`SPEC_FULL.md` §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// `ack == seq_local`: nothing new acknowledged.
    Duplicate,
    /// The ack number lands far enough outside the plausible window (the
    /// 100_000-byte heuristic) that it is neither duplicate nor a sane
    /// advance; ignored.
    OutOfWindow,
    /// One or more full segments were retired, or the head was trimmed.
    Advanced,
}

/// Discriminates "duplicate" / "in-window advance" / "out of window" the way
/// `stack-tcp-core.c`'s `_tcp_seg_acknowledge` does: anything whose forward
/// distance from `seq_local` exceeds this is treated as implausible (a wrapped
/// or spoofed ack) rather than a legitimate advance.
const MAX_PLAUSIBLE_ADVANCE: u32 = 100_000;

impl SegmentQueue {
    pub fn new() -> SegmentQueue {
        SegmentQueue {
            queue: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn head(&self) -> Option<&Segment> {
        self.queue.front()
    }

    pub fn tail_is_fin(&self) -> bool {
        self.queue.back().is_some_and(|s| s.fin)
    }

    fn tail_seq_end(&self, seq_local: u32) -> u32 {
        self.queue
            .back()
            .map(|s| s.seq.wrapping_add(s.total_len()))
            .unwrap_or(seq_local)
    }

    /// Queue `data` for transmission, splitting at `mss`-sized segments
    /// (`SPEC_FULL.md` §4.E `send`). Returns the head segment's transmit
    /// instruction if the new data became the head of an empty queue (it
    /// must be sent immediately), plus whether the TCB should move to
    /// `EstablishedSend`.
    ///
    /// Refuses to append past an existing `FIN` (invariant 5): the caller's
    /// buffer is dropped (for `Adopted`/`Copied`) and `None` is returned.
    pub fn send(
        &mut self,
        tcb: &mut Tcb,
        data: SendData,
        ownership: Ownership,
        is_fin: bool,
    ) -> Option<TransmitHead> {
        if self.tail_is_fin() {
            debug!("tcb: refusing to queue past a FIN");
            return None;
        }

        let mss = tcb.mss;
        let bytes: Vec<u8> = data.into_vec();
        let was_empty = self.queue.is_empty();

        if bytes.is_empty() {
            if !is_fin {
                return None;
            }
            let seq = self.tail_seq_end(tcb.seq_local);
            self.queue.push_back(Segment {
                seq,
                fin: true,
                ownership,
                buf: Buffer::Owned(Vec::new()),
            });
        } else {
            let mut offset = 0usize;
            let total = bytes.len();
            while offset < total {
                let end = (offset + mss).min(total);
                let chunk = bytes[offset..end].to_vec();
                let seq = self.tail_seq_end(tcb.seq_local);
                let is_last = end == total;
                let chunk_ownership = if offset == 0 { ownership } else { Ownership::Copied };
                self.queue.push_back(Segment {
                    seq,
                    fin: is_last && is_fin,
                    ownership: chunk_ownership,
                    buf: match (offset == 0, ownership) {
                        (true, Ownership::Static) => {
                            // A static buffer never needs splitting in practice
                            // (hello templates fit in one MSS); fall back to an
                            // owned copy for any remainder slice.
                            Buffer::Owned(chunk)
                        }
                        _ => Buffer::Owned(chunk),
                    },
                });
                offset = end;
            }
        }

        if was_empty {
            tcb.tcp_phase = TcpPhase::EstablishedSend;
            self.head().map(|seg| TransmitHead {
                seq: seg.seq,
                len: seg.len(),
                fin: seg.fin,
            })
        } else {
            None
        }
    }

    /// Retransmit the head segment unconditionally (`SPEC_FULL.md` §4.E `resend`).
    pub fn resend_head(&self) -> Option<TransmitHead> {
        self.head().map(|seg| TransmitHead {
            seq: seg.seq,
            len: seg.len(),
            fin: seg.fin,
        })
    }

    /// Retire segments fully covered by `ack`, advancing `tcb.seq_local` and
    /// `tcb.ack_remote` (`SPEC_FULL.md` §4.E `acknowledge`).
    pub fn acknowledge(&mut self, tcb: &mut Tcb, ack: u32) -> AckOutcome {
        if ack == tcb.seq_local {
            return AckOutcome::Duplicate;
        }

        let advance_fwd = ack.wrapping_sub(tcb.seq_local);
        let advance_back = tcb.seq_local.wrapping_sub(ack);

        if advance_back < MAX_PLAUSIBLE_ADVANCE {
            // ack is (slightly) behind seq_local: stale/duplicate ack, ignore.
            return AckOutcome::OutOfWindow;
        }
        if advance_fwd > MAX_PLAUSIBLE_ADVANCE {
            // ack claims to be implausibly far ahead: reject.
            trace!("tcb: out-of-window ack {ack} vs seq_local {}", tcb.seq_local);
            return AckOutcome::OutOfWindow;
        }

        let mut remaining = advance_fwd;
        let mut retired_any = false;

        while remaining > 0 {
            let Some(front) = self.queue.front() else {
                break;
            };
            let seg_len = front.total_len();
            if seg_len <= remaining {
                self.queue.pop_front();
                tcb.seq_local = tcb.seq_local.wrapping_add(seg_len);
                tcb.ack_remote = tcb.seq_local;
                remaining -= seg_len;
                retired_any = true;
            } else {
                // partial ack of the head: trim it in place.
                let front = self.queue.front_mut().unwrap();
                // `seg_len > remaining` was just established, and `seg_len`
                // is `len` plus at most one synthetic FIN byte, so the FIN
                // (if any) is never reached by a partial ack: `remaining` is
                // always a count of real payload bytes here.
                let consumed_data = remaining;
                let new_buf = front.buf.as_slice()[consumed_data as usize..].to_vec();
                front.buf = Buffer::Owned(new_buf);
                front.seq = front.seq.wrapping_add(consumed_data);
                if front.ownership == Ownership::Adopted {
                    front.ownership = Ownership::Copied;
                }
                tcb.seq_local = tcb.seq_local.wrapping_add(remaining);
                tcb.ack_remote = tcb.seq_local;
                remaining = 0;
                retired_any = true;
            }
        }

        if retired_any {
            AckOutcome::Advanced
        } else {
            AckOutcome::Duplicate
        }
    }
}

/// Input to `SegmentQueue::send`: either a borrowed slice to copy, or an
/// owned `Vec<u8>` to adopt outright, or a `'static` slice never freed.
pub enum SendData {
    Copy(Vec<u8>),
    Static(&'static [u8]),
}

impl SendData {
    fn into_vec(self) -> Vec<u8> {
        match self {
            SendData::Copy(v) => v,
            SendData::Static(s) => s.to_vec(),
        }
    }
}
