// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The command/result protocol shared by the Test Runner, Test Server, and
//! SUT adapter. Wire form is newline-delimited JSON, one [`Command`] per
//! line (see [`crate::link`] for the framing).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminant for [`Params`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Listen,
    Connect,
    Send,
    Receive,
    SendReceive,
    Disconnect,
    Abort,
    Result,
    Sync,
    Wait,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// `RESULT.status`. `0` on success, `1` for a user-domain (protocol
/// invariant) failure, `2` for a transport/unexpected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    UserErr = 1,
    InternalErr = 2,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenParams {
    pub iface: String,
    pub src_port: u16,
    #[serde(default = "default_true")]
    pub update_ts_ack: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    pub destination: String,
    pub src_port: u16,
    pub dst_port: u16,
    #[serde(default = "default_true")]
    pub full_handshake: bool,
    #[serde(default)]
    pub expected_failure: bool,
}

/// Any field left `None` defaults to the party's current tracking state at
/// packet-build time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    #[serde(default = "default_true")]
    pub update_ts_seq: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveParams {
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    #[serde(default = "default_true")]
    pub update_ts_ack: bool,
}

impl Default for ReceiveParams {
    fn default() -> Self {
        ReceiveParams {
            timeout: crate::config::DEFAULT_TIMEOUT_SECS,
            payload: None,
            flags: None,
            update_ts_ack: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceiveParams {
    pub send: SendParams,
    pub recv: ReceiveParams,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectParams {
    #[serde(default)]
    pub half_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncParams {
    pub sync_id: u64,
    pub wait_for_result: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitParams {
    pub seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultParams {
    pub status: Status,
    pub op: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultParams {
    pub fn ok(op: CommandKind, description: impl Into<String>) -> Self {
        ResultParams {
            status: Status::Ok,
            op,
            description: Some(description.into()),
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, Status::Ok)
    }
}

/// Sum type mirroring the enclosing [`Command`]'s `kind`. Serde's default
/// externally-tagged representation (`{"Listen": {...}}`) is used rather
/// than `#[serde(untagged)]`, so a line never needs trial-and-error probing
/// against every variant's shape to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Params {
    Listen(ListenParams),
    Connect(ConnectParams),
    Send(SendParams),
    Receive(ReceiveParams),
    SendReceive(SendReceiveParams),
    Disconnect(DisconnectParams),
    Result(ResultParams),
    Sync(SyncParams),
    Wait(WaitParams),
    None,
}

/// A tagged command record. `test_id < 0` is used by local-only commands
/// (`Sync`, `Wait`) that never cross the wire to a party's peer handler and
/// don't participate in the per-test-id reset-on-mismatch lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub test_id: i64,
    pub kind: CommandKind,
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

/// `test_id` used for commands that never trigger a reset check (`Sync`,
/// `Wait`, and ad hoc local bookkeeping) — mirrors the Python original's
/// `test_number == -2` "skip the reset check" sentinel.
pub const NO_RESET_TEST_ID: i64 = -2;

impl Command {
    pub fn new(test_id: i64, kind: CommandKind, params: Params) -> Self {
        Command {
            test_id,
            kind,
            params,
            ts: None,
        }
    }

    pub fn sync(sync_id: u64, wait_for_result: bool) -> Self {
        Command::new(
            NO_RESET_TEST_ID,
            CommandKind::Sync,
            Params::Sync(SyncParams {
                sync_id,
                wait_for_result,
            }),
        )
    }

    pub fn wait(seconds: u64) -> Self {
        Command::new(
            NO_RESET_TEST_ID,
            CommandKind::Wait,
            Params::Wait(WaitParams { seconds }),
        )
    }

    pub fn result(test_id: i64, params: ResultParams) -> Self {
        Command::new(test_id, CommandKind::Result, Params::Result(params))
    }

    /// Whether this command needs a round trip to the remote party, or is
    /// handled locally by the Test Runner driver.
    pub fn is_local(&self) -> bool {
        matches!(self.kind, CommandKind::Sync | CommandKind::Wait)
    }

    pub fn as_sync(&self) -> Option<&SyncParams> {
        match &self.params {
            Params::Sync(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_wait(&self) -> Option<&WaitParams> {
        match &self.params {
            Params::Wait(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_result(&self) -> Option<&ResultParams> {
        match &self.params {
            Params::Result(p) => Some(p),
            _ => None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cmd: &Command) {
        let encoded = serde_json::to_string(cmd).expect("encode");
        let decoded: Command = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(cmd, &decoded, "round trip mismatch for {:?}", cmd);
    }

    #[test]
    fn roundtrips_every_command_kind() {
        roundtrip(&Command::new(
            1,
            CommandKind::Listen,
            Params::Listen(ListenParams {
                iface: "eth0".into(),
                src_port: 9000,
                update_ts_ack: true,
            }),
        ));
        roundtrip(&Command::new(
            1,
            CommandKind::Connect,
            Params::Connect(ConnectParams {
                destination: "10.0.0.1".into(),
                src_port: 9000,
                dst_port: 10000,
                full_handshake: true,
                expected_failure: false,
            }),
        ));
        roundtrip(&Command::new(
            1,
            CommandKind::Send,
            Params::Send(SendParams {
                payload: Some(b"x".repeat(100)),
                seq: None,
                ack: Some(42),
                flags: Some("A".into()),
                update_ts_seq: false,
            }),
        ));
        roundtrip(&Command::new(
            1,
            CommandKind::Receive,
            Params::Receive(ReceiveParams {
                timeout: 5,
                payload: Some(b"x".repeat(300)),
                flags: Some("A".into()),
                update_ts_ack: true,
            }),
        ));
        roundtrip(&Command::new(
            1,
            CommandKind::SendReceive,
            Params::SendReceive(SendReceiveParams {
                send: SendParams {
                    flags: Some("SA".into()),
                    ..Default::default()
                },
                recv: ReceiveParams {
                    flags: Some("A".into()),
                    ..Default::default()
                },
            }),
        ));
        roundtrip(&Command::new(
            1,
            CommandKind::Disconnect,
            Params::Disconnect(DisconnectParams { half_close: true }),
        ));
        roundtrip(&Command::new(1, CommandKind::Abort, Params::None));
        roundtrip(&Command::result(
            1,
            ResultParams {
                status: Status::UserErr,
                op: CommandKind::Receive,
                description: None,
                error: Some("timeout".into()),
            },
        ));
        roundtrip(&Command::sync(3, true));
        roundtrip(&Command::wait(2));
    }

    #[test]
    fn sync_and_wait_are_local() {
        assert!(Command::sync(1, false).is_local());
        assert!(Command::wait(1).is_local());
        assert!(!Command::new(1, CommandKind::Send, Params::Send(SendParams::default())).is_local());
    }
}
