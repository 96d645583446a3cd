// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The built-in test-case catalogue.
//!
//! Each [`TestCase`] is a pair of `(setup, body)` queues per party: explicit
//! lists of [`Command`]s with matching `SYNC` ids across the TS and SUT
//! sides. [`catalogue`] returns a `Vec` literal, sorted by id, rather than
//! scanning a directory of case modules at runtime.

use crate::protocol::{
    Command, CommandKind, ConnectParams, DisconnectParams, ListenParams, Params, ReceiveParams,
    SendParams, SendReceiveParams,
};

/// One hundred `x` bytes, the payload repeated throughout the catalogue.
pub fn payload_x(n: usize) -> Vec<u8> {
    b"x".repeat(100 * n)
}

#[derive(Debug, Clone)]
pub struct TestCase {
    pub id: u32,
    pub name: &'static str,
    pub ts_setup: Vec<Command>,
    pub sut_setup: Vec<Command>,
    pub ts_body: Vec<Command>,
    pub sut_body: Vec<Command>,
}

fn send(test_id: i64, params: SendParams) -> Command {
    Command::new(test_id, CommandKind::Send, Params::Send(params))
}

fn recv(test_id: i64, params: ReceiveParams) -> Command {
    Command::new(test_id, CommandKind::Receive, Params::Receive(params))
}

fn send_recv(test_id: i64, send: SendParams, recv: ReceiveParams) -> Command {
    Command::new(
        test_id,
        CommandKind::SendReceive,
        Params::SendReceive(SendReceiveParams { send, recv }),
    )
}

fn listen(test_id: i64, iface: &str, src_port: u16) -> Command {
    Command::new(
        test_id,
        CommandKind::Listen,
        Params::Listen(ListenParams {
            iface: iface.to_owned(),
            src_port,
            update_ts_ack: true,
        }),
    )
}

fn connect(test_id: i64, destination: &str, src_port: u16, dst_port: u16) -> Command {
    Command::new(
        test_id,
        CommandKind::Connect,
        Params::Connect(ConnectParams {
            destination: destination.to_owned(),
            src_port,
            dst_port,
            full_handshake: true,
            expected_failure: false,
        }),
    )
}

fn disconnect(test_id: i64, half_close: bool) -> Command {
    Command::new(
        test_id,
        CommandKind::Disconnect,
        Params::Disconnect(DisconnectParams { half_close }),
    )
}

fn flags_recv(timeout: u64, flags: &str) -> ReceiveParams {
    ReceiveParams {
        timeout,
        payload: None,
        flags: Some(flags.to_owned()),
        update_ts_ack: true,
    }
}

const SCENARIO_TIMEOUT: u64 = 20;

/// Scenario 1: passive establishment. SUT `LISTEN`s, TS
/// `CONNECT`s with a full handshake.
fn scenario_1(ts_ip: &str, sut_ip: &str) -> TestCase {
    let id = 1;
    let (ts_port, sut_port) = (6001, 5001);

    let ts_body = vec![connect(id as i64, sut_ip, ts_port, sut_port), Command::sync(1, true)];
    let sut_body = vec![
        listen(id as i64, ts_ip, sut_port),
        Command::sync(1, true),
    ];

    TestCase {
        id,
        name: "Passive establishment",
        ts_setup: vec![],
        sut_setup: vec![],
        ts_body,
        sut_body,
    }
}

/// Scenario 2: invalid-ACK rejection. TS listens, SUT
/// connects; TS replies to the SYN with an out-of-window ACK and expects an
/// RST back.
fn scenario_2(ts_ip: &str, sut_ip: &str) -> TestCase {
    let id = 2;
    let (ts_port, sut_port) = (6002, 5002);

    let ts_body = vec![
        listen(id as i64, ts_ip, ts_port),
        send_recv(
            id as i64,
            SendParams {
                ack: Some(543),
                flags: Some("A".into()),
                ..Default::default()
            },
            flags_recv(SCENARIO_TIMEOUT, "R"),
        ),
        Command::sync(1, false),
        Command::sync(2, true),
    ];
    let sut_body = vec![
        Command::sync(1, false),
        connect(id as i64, ts_ip, sut_port, ts_port),
        Command::sync(2, true),
    ];

    TestCase {
        id,
        name: "Invalid-ACK rejection",
        ts_setup: vec![],
        sut_setup: vec![],
        ts_body,
        sut_body,
    }
}

/// Scenario 3: simultaneous open. Both sides `CONNECT` to
/// each other.
fn scenario_3(ts_ip: &str, sut_ip: &str) -> TestCase {
    let id = 3;
    let (ts_port, sut_port) = (6003, 5003);

    let ts_body = vec![
        Command::sync(1, false),
        connect(id as i64, sut_ip, ts_port, sut_port),
        Command::sync(2, true),
    ];
    let sut_body = vec![
        Command::sync(1, false),
        // give the TS a head start issuing its SYN so the handshake is
        // genuinely simultaneous rather than SUT racing ahead.
        Command::wait(1),
        connect(id as i64, ts_ip, sut_port, ts_port),
        Command::sync(2, true),
    ];

    TestCase {
        id,
        name: "Simultaneous open",
        ts_setup: vec![],
        sut_setup: vec![],
        ts_body,
        sut_body,
    }
}

/// Scenario 4: data transfer. After passive establishment,
/// TS sends `X` three times; SUT receives 300 bytes.
fn scenario_4(ts_ip: &str, sut_ip: &str) -> TestCase {
    let id = 4;
    let (ts_port, sut_port) = (6004, 5004);

    let ts_setup = vec![connect(id as i64, sut_ip, ts_port, sut_port), Command::sync(1, true)];
    let sut_setup = vec![listen(id as i64, ts_ip, sut_port), Command::sync(1, true)];

    let mut ts_body = Vec::new();
    for _ in 0..3 {
        ts_body.push(send(
            id as i64,
            SendParams {
                payload: Some(payload_x(1)),
                flags: Some("A".into()),
                ..Default::default()
            },
        ));
    }
    ts_body.push(Command::sync(1, true));

    let sut_body = vec![
        recv(
            id as i64,
            ReceiveParams {
                timeout: SCENARIO_TIMEOUT,
                payload: Some(payload_x(3)),
                flags: None,
                update_ts_ack: true,
            },
        ),
        Command::sync(1, true),
    ];

    TestCase {
        id,
        name: "Data transfer",
        ts_setup,
        sut_setup,
        ts_body,
        sut_body,
    }
}

/// Scenario 5: duplicate segment. TS sends `X` with a
/// fixed, non-advancing `seq`, then resends with the real `seq` and expects
/// the duplicate policy (no error) to let the second one land as a normal
/// ACK'd segment.
fn scenario_5(ts_ip: &str, sut_ip: &str) -> TestCase {
    let id = 5;
    let (ts_port, sut_port) = (6005, 5005);

    let ts_setup = vec![connect(id as i64, sut_ip, ts_port, sut_port), Command::sync(1, true)];
    let sut_setup = vec![listen(id as i64, ts_ip, sut_port), Command::sync(1, true)];

    let ts_body = vec![
        send(
            id as i64,
            SendParams {
                payload: Some(payload_x(1)),
                flags: Some("A".into()),
                update_ts_seq: false,
                ..Default::default()
            },
        ),
        send_recv(
            id as i64,
            SendParams {
                payload: Some(payload_x(1)),
                flags: Some("A".into()),
                ..Default::default()
            },
            flags_recv(SCENARIO_TIMEOUT, "A"),
        ),
        Command::sync(1, true),
    ];
    let sut_body = vec![
        recv(
            id as i64,
            ReceiveParams {
                timeout: SCENARIO_TIMEOUT,
                payload: None,
                flags: None,
                update_ts_ack: true,
            },
        ),
        Command::sync(1, true),
    ];

    TestCase {
        id,
        name: "Duplicate segment",
        ts_setup,
        sut_setup,
        ts_body,
        sut_body,
    }
}

/// Scenario 6: graceful close initiated by the SUT. After
/// establishment, the SUT disconnects; TS sees the FIN/ACK, ACKs it, sends
/// its own FIN/ACK, and expects the final ACK.
fn scenario_6(ts_ip: &str, sut_ip: &str) -> TestCase {
    let id = 6;
    let (ts_port, sut_port) = (6006, 5006);

    let ts_setup = vec![connect(id as i64, sut_ip, ts_port, sut_port), Command::sync(1, true)];
    let sut_setup = vec![listen(id as i64, ts_ip, sut_port), Command::sync(1, true)];

    let ts_body = vec![
        Command::sync(1, false),
        disconnect(id as i64, false),
        Command::sync(2, true),
    ];
    let sut_body = vec![
        Command::sync(1, false),
        disconnect(id as i64, false),
        Command::sync(2, true),
    ];

    TestCase {
        id,
        name: "Graceful close initiated by SUT",
        ts_setup,
        sut_setup,
        ts_body,
        sut_body,
    }
}

/// Scenario 12: invalid-ACK wraparound boundary. Kept at this id rather than
/// renumbered into the 1-6 sequence, since it exercises 32-bit sequence-space
/// wraparound specifically.
fn scenario_12(ts_ip: &str, sut_ip: &str) -> TestCase {
    let id = 12;
    let (ts_port, sut_port) = (6012, 5012);

    let ts_setup = vec![
        Command::sync(1, false),
        connect(id as i64, sut_ip, ts_port, sut_port),
        Command::sync(2, true),
    ];
    let sut_setup = vec![
        listen(id as i64, ts_ip, sut_port),
        Command::sync(1, false),
        Command::sync(2, true),
    ];

    let ts_body = vec![
        send_recv(
            id as i64,
            SendParams {
                ack: Some(4_294_967_196),
                flags: Some("A".into()),
                ..Default::default()
            },
            flags_recv(SCENARIO_TIMEOUT, "A"),
        ),
        Command::sync(1, true),
    ];
    let sut_body = vec![Command::sync(1, false)];

    TestCase {
        id,
        name: "Invalid-ACK wraparound",
        ts_setup,
        sut_setup,
        ts_body,
        sut_body,
    }
}

/// Returns the built-in catalogue, sorted by id.
pub fn catalogue(ts_ip: &str, sut_ip: &str) -> Vec<TestCase> {
    let mut cases = vec![
        scenario_1(ts_ip, sut_ip),
        scenario_2(ts_ip, sut_ip),
        scenario_3(ts_ip, sut_ip),
        scenario_4(ts_ip, sut_ip),
        scenario_5(ts_ip, sut_ip),
        scenario_6(ts_ip, sut_ip),
        scenario_12(ts_ip, sut_ip),
    ];
    cases.sort_by_key(|c| c.id);
    cases
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn catalogue_is_sorted_and_has_unique_ids() {
        let cases = catalogue("10.0.0.1", "10.0.0.2");
        let ids: Vec<u32> = cases.iter().map(|c| c.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        let unique: HashSet<u32> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
    }

    /// Every `SYNC` id used by one side of a case's body/setup queue must
    /// also appear on the other side, or the scheduler would deadlock
    /// waiting on a barrier nobody else arrives at.
    fn sync_ids(queue: &[Command]) -> HashSet<u64> {
        queue
            .iter()
            .filter_map(|c| c.as_sync())
            .map(|s| s.sync_id)
            .collect()
    }

    #[test]
    fn sync_ids_match_across_both_sides_of_every_queue_pair() {
        for case in catalogue("10.0.0.1", "10.0.0.2") {
            assert_eq!(
                sync_ids(&case.ts_setup),
                sync_ids(&case.sut_setup),
                "case {}: setup sync ids diverge",
                case.id
            );
            assert_eq!(
                sync_ids(&case.ts_body),
                sync_ids(&case.sut_body),
                "case {}: body sync ids diverge",
                case.id
            );
        }
    }

    #[test]
    fn payload_x_builds_repeated_hundred_byte_blocks() {
        assert_eq!(payload_x(1), b"x".repeat(100));
        assert_eq!(payload_x(3), b"x".repeat(300));
    }
}
