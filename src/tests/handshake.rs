//! Scenario 1 ("happy-path HTTP connect") and scenario 2 ("stateless
//! rejection") from `SPEC_FULL.md` §8.

use super::*;
use crate::parser::RawBannerParser;
use crate::state::{self, Event};
use crate::tcb::TcpPhase;

#[test]
fn matching_synack_creates_tcb_and_sends_final_ack() {
    let mut table = new_table();
    table.parsers.push(Box::new(RawBannerParser::new(256)));
    let mut tx = RecordingTransmit::default();

    let cookie = handshake_cookie();
    let key = state::create_from_synack(
        &mut table,
        LOCAL(),
        REMOTE(),
        LOCAL_PORT,
        REMOTE_PORT,
        cookie,
        9000,
        64,
        0,
        0,
        &mut tx,
    );

    let tcb = table.get(key).expect("tcb created");
    assert_eq!(tcb.tcp_phase, TcpPhase::EstablishedRecv);
    assert_eq!(tcb.ack_remote, 9001);
    assert!(matches!(tx.sent.as_slice(), [Sent::Ack { ack: 9001, .. }]));
}

#[test]
fn data_then_fin_drives_banner_and_close_wait() {
    let mut table = new_table();
    table.parsers.push(Box::new(RawBannerParser::new(256)));
    let mut tx = RecordingTransmit::default();

    let cookie = handshake_cookie();
    let key = state::create_from_synack(
        &mut table, LOCAL(), REMOTE(), LOCAL_PORT, REMOTE_PORT, cookie, 9000, 64, 0, 0, &mut tx,
    );

    state::dispatch(
        &mut table,
        key,
        Event::Data { seq: 9001, ack: cookie.wrapping_add(1), payload: b"HTTP/1.0 200 OK\r\n\r\n".to_vec() },
        1,
        &mut tx,
    );
    assert_eq!(table.get(key).unwrap().banner, b"HTTP/1.0 200 OK\r\n\r\n");

    state::dispatch(
        &mut table,
        key,
        Event::Fin { seq: 9021, ack: cookie.wrapping_add(1) },
        1,
        &mut tx,
    );
    assert_eq!(table.get(key).unwrap().tcp_phase, TcpPhase::CloseWait);
}

#[test]
fn synack_with_wrong_cookie_is_rejected_before_any_tcb_exists() {
    let accepted = state::accept_synack(LOCAL(), LOCAL_PORT, REMOTE(), REMOTE_PORT, 0x1234_5678, ENTROPY);
    assert!(!accepted, "a forged ack field must never validate");

    // Nothing is created for a rejected SYN/ACK: no `Table::create` call is
    // ever reached on this path (`SPEC_FULL.md` §3 "Lifecycle").
    let table = new_table();
    assert_eq!(table.active_count(), 0);
}

#[test]
fn synack_with_right_cookie_is_accepted() {
    let cookie = handshake_cookie();
    let accepted = state::accept_synack(LOCAL(), LOCAL_PORT, REMOTE(), REMOTE_PORT, cookie.wrapping_add(1), ENTROPY);
    assert!(accepted);
}
