use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

/// A raw frame handed between the RX/TX threads and the device adapter.
///
/// Buffers are always `ETHERNET_IPV4_MIN_FRAME_LEN`-or-larger fixed-size
/// slots recycled through the free-buffer ring (`SPEC_FULL.md` §5); the
/// `len` field tracks how much of the slot is actually in use.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub len: usize,
}

impl Frame {
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// The external raw-frame I/O contract (`SPEC_FULL.md` §6 "Adapter").
///
/// Grounded on the teacher's (since-removed) `phy::Device`/`RxToken`/`TxToken`
/// traits, but collapsed to the two blocking calls `SPEC_FULL.md` actually
/// specifies: a device opens once, and the RX/TX threads each own one side.
pub trait Adapter: Send {
    /// Send a complete frame. `flush` hints that the caller has no more
    /// frames queued right now and the adapter should flush any internal
    /// batching.
    fn send_frame(&mut self, buf: &[u8], flush: bool) -> std::io::Result<()>;

    /// Block until a frame arrives or `timeout` elapses, returning its
    /// length written into `buf`, or `None` on timeout.
    fn recv_frame(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<Option<usize>>;
}

/// The single-producer/single-consumer pair of lock-free rings that are the
/// *only* state the RX and TX threads share (`SPEC_FULL.md` §5).
///
/// `tx_ring` carries frames the RX thread has built and wants sent;
/// `free_ring` carries buffers the TX thread has finished with, back to the
/// RX thread for reuse. Both are `crossbeam_queue::ArrayQueue`, a true
/// bounded lock-free MPMC ring usable here as SPSC.
///
/// `Clone` just clones the two `Arc`s, so the RX and TX threads (`crate::engine`)
/// can each hold their own handle to the same underlying rings.
#[derive(Clone)]
pub struct TxRings {
    pub tx_ring: Arc<ArrayQueue<Frame>>,
    pub free_ring: Arc<ArrayQueue<Frame>>,
}

impl TxRings {
    pub fn new(capacity: usize, buffer_len: usize) -> TxRings {
        let tx_ring = Arc::new(ArrayQueue::new(capacity));
        let free_ring = Arc::new(ArrayQueue::new(capacity));
        for _ in 0..capacity {
            let _ = free_ring.push(Frame {
                data: vec![0u8; buffer_len],
                len: 0,
            });
        }
        TxRings { tx_ring, free_ring }
    }

    /// Acquire a free buffer, spinning with a short back-off if the pool is
    /// momentarily exhausted (`SPEC_FULL.md` §5 "shared resource policy").
    /// Logs a single `warn!` per process lifetime the first time it has to
    /// back off at all (`SPEC_FULL.md` §4.K).
    pub fn acquire_free(&self, warned_once: &std::sync::atomic::AtomicBool) -> Frame {
        loop {
            if let Some(frame) = self.free_ring.pop() {
                return frame;
            }
            if !warned_once.swap(true, std::sync::atomic::Ordering::Relaxed) {
                log::warn!("tx buffer pool exhausted; backing off");
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    pub fn release_free(&self, frame: Frame) {
        let _ = self.free_ring.push(frame);
    }

    pub fn enqueue_tx(&self, frame: Frame) {
        if self.tx_ring.push(frame).is_err() {
            log::error!("tx ring full, dropping frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn acquire_and_release_round_trips() {
        let rings = TxRings::new(4, 64);
        let warned = AtomicBool::new(false);
        let frame = rings.acquire_free(&warned);
        assert_eq!(frame.data.len(), 64);
        rings.release_free(frame);
        assert_eq!(rings.free_ring.len(), 4);
    }
}
