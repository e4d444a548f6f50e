//! The half of the transition table the shipped application bridge never
//! drives on its own: `CLOSE_WAIT -> LAST_ACK -> destroyed`. Reaching it
//! needs an outbound queue with real data still ahead of a queued `FIN`
//! (acking the data alone leaves the queue non-empty, so `retire_and_
//! maybe_send_sent`'s `tail_is_fin` branch fires instead of its `drained`
//! one) while the phase is still `CLOSE_WAIT` — something the shipped
//! application bridge never sets up (`DESIGN.md` Open Question 2; see the
//! doc comment on `crate::tcb::TcpPhase::LastAck`).

use super::*;
use crate::segment::{Ownership, SendData};
use crate::state::{self, Event};
use crate::tcb::TcpPhase;

#[test]
fn fin_queued_behind_pending_data_reaches_last_ack_then_destroys_on_final_ack() {
    let mut table = new_table();
    let mut tx = RecordingTransmit::default();

    let key = table.create(local_ip(), remote_ip(), LOCAL_PORT, REMOTE_PORT, 1000, 5000, 64, 0, 0);
    let seq_local_before = table.get(key).unwrap().seq_local;

    if let Some(tcb) = table.get_mut(key) {
        // Queuing onto an empty queue always promotes to ESTABLISHED_SEND
        // (`SPEC_FULL.md` §4.E); queue both segments first, then force
        // CLOSE_WAIT to set up the cell this test actually exercises.
        tcb.queue_send(SendData::Copy(vec![1, 2, 3, 4]), Ownership::Copied, false);
        tcb.queue_send(SendData::Copy(Vec::new()), Ownership::Static, true);
        tcb.tcp_phase = TcpPhase::CloseWait;
    }
    assert!(table.get(key).unwrap().segments.tail_is_fin());

    // Ack only the 4 data bytes: the FIN segment is still queued, so the
    // outbound queue is not drained and the CLOSE_WAIT -> LAST_ACK arm fires.
    state::dispatch(
        &mut table,
        key,
        Event::Ack { ack: seq_local_before.wrapping_add(4) },
        1,
        &mut tx,
    );
    assert_eq!(table.get(key).unwrap().tcp_phase, TcpPhase::LastAck);
    assert!(!table.get(key).unwrap().segments.is_empty());

    // Acking the FIN itself drains the queue and the connection is torn
    // down as a graceful close, not a reset.
    state::dispatch(
        &mut table,
        key,
        Event::Ack { ack: seq_local_before.wrapping_add(5) },
        2,
        &mut tx,
    );
    assert!(table.get(key).is_none(), "LAST_ACK drained: TCB destroyed");
    assert!(!tx.sent.iter().any(|s| matches!(s, Sent::Rst { .. })), "graceful close, not a reset");
}
