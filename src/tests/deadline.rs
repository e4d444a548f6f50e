//! Scenario 4 ("silent peer hits the connection deadline") from
//! `SPEC_FULL.md` §8.

use super::*;
use crate::state::{self, Event};
use crate::tcb::TcpPhase;

#[test]
fn silent_peer_is_rst_and_destroyed_once_conn_timeout_elapses() {
    let mut table = new_table();
    let mut tx = RecordingTransmit::default();

    let key = table.create(local_ip(), remote_ip(), LOCAL_PORT, REMOTE_PORT, 1000, 5000, 64, 0, 0);
    if let Some(tcb) = table.get_mut(key) {
        tcb.tcp_phase = TcpPhase::EstablishedRecv;
    }

    // conn_timeout_secs is 30 (new_table); nothing arrives before then, so
    // repeated safety-net timeouts must keep re-arming without tearing the
    // connection down early.
    state::dispatch(&mut table, key, Event::Timeout, 10, &mut tx);
    assert!(table.get(key).is_some(), "well within the deadline, must still be alive");
    assert!(tx.sent.is_empty(), "no RST before the deadline");

    state::dispatch(&mut table, key, Event::Timeout, 31, &mut tx);
    assert!(table.get(key).is_none(), "deadline exceeded: TCB torn down");
    assert!(matches!(tx.sent.as_slice(), [Sent::Rst { .. }]));
    assert_eq!(table.active_count(), 0);
}

#[test]
fn deadline_check_takes_priority_over_phase_specific_handling() {
    // A stalled EstablishedSend would otherwise just resend its head segment
    // on Timeout; past the deadline that must never happen, the connection
    // is torn down instead.
    let mut table = new_table();
    let mut tx = RecordingTransmit::default();

    let key = table.create(local_ip(), remote_ip(), LOCAL_PORT, REMOTE_PORT, 1000, 5000, 64, 0, 0);
    if let Some(tcb) = table.get_mut(key) {
        tcb.tcp_phase = TcpPhase::EstablishedSend;
        tcb.queue_send(crate::segment::SendData::Copy(vec![1, 2, 3]), crate::segment::Ownership::Copied, false);
    }

    state::dispatch(&mut table, key, Event::Timeout, 31, &mut tx);
    assert!(table.get(key).is_none());
    assert!(matches!(tx.sent.as_slice(), [Sent::Rst { .. }]), "no resent Segment, only the RST");
}
