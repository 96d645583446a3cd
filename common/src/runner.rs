// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The Test Runner's dual-queue scheduler.
//!
//! Two independent drivers (one per party) each consume an input queue of
//! [`Command`]s. `Wait` sleeps locally; `Sync` is a cross-party barrier;
//! everything else is handed off to a concurrent I/O task that ferries it
//! to the remote party over that party's [`CommandLink`] and reports back
//! the `RESULT` — the driver itself never blocks waiting for one. Results
//! are only drained, and their statuses folded into the run's verdict, at
//! the next `SYNC(wait_for_result=true)` (or at the end of the queue). This
//! is what lets one party block for a long time inside a single command
//! (the Test Server's `LISTEN` sniffing for a SYN that won't arrive until
//! the other party's gated `CONNECT` crosses a `SYNC(wait_for_result=false)`
//! barrier) without wedging its own driver against that same barrier. This
//! module is transport-agnostic (generic over `T: AsyncRead + AsyncWrite`)
//! so it can be driven by real sockets in the `runner` binary or by
//! in-memory pairs in tests — see [`crate::link::in_memory_pair`].

use crate::link::CommandLink;
use crate::protocol::{Command, CommandKind, Status};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Barrier};
use tokio_util::sync::CancellationToken;

/// Capacity of a party's send queue — the channel carrying not-yet-sent
/// commands from the driver to its I/O task. Bounded so a driver that races
/// far ahead of its I/O task (e.g. issuing many sends before a sync) still
/// applies backpressure rather than buffering unboundedly.
const SEND_QUEUE_CAPACITY: usize = 32;

/// Party identifier, used only for log messages and the `HELLO` handshake
/// token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    TestServer,
    Sut,
}

impl Party {
    pub fn label(&self) -> &'static str {
        match self {
            Party::TestServer => "TS",
            Party::Sut => "SUT",
        }
    }
}

/// One rendezvous point per sync id, shared between the two drivers for the
/// lifetime of a single setup-or-body run. Built from a `tokio::sync::Barrier`
/// rather than a polled shared counter — arriving at the barrier *is*
/// publishing the sync id, and the barrier resolves for both sides the
/// instant the second one arrives, with no polling loop.
struct SyncGates {
    gates: std::sync::Mutex<HashMap<u64, Arc<Barrier>>>,
}

impl SyncGates {
    fn new() -> Self {
        SyncGates {
            gates: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, id: u64) -> Arc<Barrier> {
        self.gates
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(Barrier::new(2)))
            .clone()
    }
}

/// Outcome of driving one party's queue to completion (or to an abort).
#[derive(Debug, Default)]
pub struct DriverOutcome {
    pub failed: bool,
}

/// Waits for every command sent so far to come back, folding each result's
/// status into `since_last_sync_failed`/`any_failure`. Returns `false` if
/// the run should abort outright (transport error, the I/O task died, or
/// cancellation arrived while draining).
async fn drain_outstanding(
    outstanding: &mut u32,
    results: &mut mpsc::UnboundedReceiver<std::io::Result<Command>>,
    party: Party,
    since_last_sync_failed: &mut bool,
    any_failure: &AtomicBool,
    cancel: &CancellationToken,
) -> bool {
    while *outstanding > 0 {
        let received = tokio::select! {
            r = results.recv() => r,
            _ = cancel.cancelled() => return false,
        };
        *outstanding -= 1;

        match received {
            Some(Ok(result_cmd)) => {
                let ok = result_cmd
                    .as_result()
                    .map(|r| r.status == Status::Ok)
                    .unwrap_or(false);
                if !ok {
                    let msg = result_cmd
                        .as_result()
                        .and_then(|r| r.error.clone())
                        .unwrap_or_default();
                    tracing::warn!("{}: command failed: {}", party.label(), msg);
                    *since_last_sync_failed = true;
                    any_failure.store(true, Ordering::SeqCst);
                }
            }
            Some(Err(e)) => {
                tracing::error!("{}: transport error: {}", party.label(), e);
                *since_last_sync_failed = true;
                any_failure.store(true, Ordering::SeqCst);
                return false;
            }
            None => return false, // I/O task exited without answering every send
        }
    }
    true
}

/// Runs a single party's queue against its [`CommandLink`]. Returns once the
/// queue is exhausted, the run is cancelled, or a transport error occurs.
///
/// Non-sync, non-wait commands are handed off to a concurrent I/O task via
/// a bounded send queue rather than awaited inline, so a single
/// long-blocking command (the Test Server's `LISTEN` sniff, for instance)
/// never prevents this driver from reaching a subsequent `SYNC` that the
/// other party is waiting to release it from.
async fn drive<T>(
    party: Party,
    queue: Vec<Command>,
    link: &mut CommandLink<T>,
    gates: &SyncGates,
    start: Arc<Barrier>,
    cancel: CancellationToken,
    any_failure: Arc<AtomicBool>,
) -> DriverOutcome
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    // simultaneous-start event: neither driver issues its first command
    // until both have reached this point.
    tokio::select! {
        _ = start.wait() => {}
        _ = cancel.cancelled() => return DriverOutcome { failed: true },
    }

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(SEND_QUEUE_CAPACITY);
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<std::io::Result<Command>>();

    let io_task = async move {
        while let Some(cmd) = cmd_rx.recv().await {
            let res = link.call(cmd).await;
            let died = res.is_err();
            if result_tx.send(res).is_err() || died {
                return;
            }
        }
    };

    let driver_task = async move {
        let mut outstanding: u32 = 0;
        let mut since_last_sync_failed = false;

        for cmd in queue {
            if cancel.is_cancelled() {
                return DriverOutcome { failed: true };
            }

            match cmd.kind {
                CommandKind::Wait => {
                    let secs = cmd.as_wait().map(|w| w.seconds).unwrap_or(0);
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(secs)) => {}
                        _ = cancel.cancelled() => return DriverOutcome { failed: true },
                    }
                }
                CommandKind::Sync => {
                    let params = cmd.as_sync().expect("SYNC command carries SyncParams");

                    if params.wait_for_result {
                        let drained = drain_outstanding(
                            &mut outstanding,
                            &mut result_rx,
                            party,
                            &mut since_last_sync_failed,
                            &any_failure,
                            &cancel,
                        )
                        .await;
                        if !drained {
                            cancel.cancel();
                            return DriverOutcome { failed: true };
                        }
                        if since_last_sync_failed {
                            tracing::warn!(
                                "{}: aborting run at sync {} — a prior command failed",
                                party.label(),
                                params.sync_id
                            );
                            cancel.cancel();
                            return DriverOutcome { failed: true };
                        }
                    }
                    since_last_sync_failed = false;

                    let gate = gates.gate(params.sync_id);
                    tokio::select! {
                        _ = gate.wait() => {}
                        _ = cancel.cancelled() => return DriverOutcome { failed: true },
                    }
                }
                _ => {
                    outstanding += 1;
                    let sent = tokio::select! {
                        r = cmd_tx.send(cmd) => r.is_ok(),
                        _ = cancel.cancelled() => false,
                    };
                    if !sent {
                        tracing::error!("{}: I/O task is gone, cannot send command", party.label());
                        any_failure.store(true, Ordering::SeqCst);
                        cancel.cancel();
                        return DriverOutcome { failed: true };
                    }
                }
            }
        }

        // the queue is exhausted; drain whatever is still in flight so the
        // run's overall verdict reflects every command's result, not just
        // the ones that happened to finish before a wait_for_result sync.
        if !drain_outstanding(
            &mut outstanding,
            &mut result_rx,
            party,
            &mut since_last_sync_failed,
            &any_failure,
            &cancel,
        )
        .await
        {
            return DriverOutcome { failed: true };
        }

        DriverOutcome {
            failed: since_last_sync_failed,
        }
    };

    tokio::select! {
        outcome = driver_task => outcome,
        _ = io_task => DriverOutcome { failed: true },
    }
}

/// Drives a TS queue and a SUT queue to completion in lock-step, honoring
/// cross-party `SYNC` barriers. Returns `true` iff every result on both
/// sides had `status == Ok`.
pub async fn run_queues<T, U>(
    ts_queue: Vec<Command>,
    sut_queue: Vec<Command>,
    ts_link: &mut CommandLink<T>,
    sut_link: &mut CommandLink<U>,
) -> bool
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let gates = SyncGates::new();
    let start = Arc::new(Barrier::new(2));
    let cancel = CancellationToken::new();
    let any_failure = Arc::new(AtomicBool::new(false));

    let ts_start = Arc::clone(&start);
    let sut_start = Arc::clone(&start);
    let ts_cancel = cancel.clone();
    let sut_cancel = cancel.clone();
    let ts_failure = Arc::clone(&any_failure);
    let sut_failure = Arc::clone(&any_failure);

    let (ts_outcome, sut_outcome) = tokio::join!(
        drive(
            Party::TestServer,
            ts_queue,
            ts_link,
            &gates,
            ts_start,
            ts_cancel,
            ts_failure,
        ),
        drive(
            Party::Sut,
            sut_queue,
            sut_link,
            &gates,
            sut_start,
            sut_cancel,
            sut_failure,
        ),
    );

    !any_failure.load(Ordering::SeqCst) && !ts_outcome.failed && !sut_outcome.failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::in_memory_pair;
    use crate::protocol::{Command, CommandKind, Params, ResultParams, SendParams};

    /// A fake party that answers every non-result command with a fixed
    /// status, so scheduler tests don't need a real TS/SUT implementation.
    async fn fake_party<T>(mut link: CommandLink<T>, status: Status)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let cmd = match link.recv().await {
                Ok(c) => c,
                Err(_) => return,
            };
            let result = Command::result(
                cmd.test_id,
                ResultParams {
                    status,
                    op: cmd.kind,
                    description: None,
                    error: if status == Status::Ok {
                        None
                    } else {
                        Some("synthetic failure".into())
                    },
                },
            );
            if link.send(&result).await.is_err() {
                return;
            }
        }
    }

    fn send_cmd(test_id: i64) -> Command {
        Command::new(
            test_id,
            CommandKind::Send,
            Params::Send(SendParams::default()),
        )
    }

    #[tokio::test]
    async fn passes_when_both_sides_succeed() {
        let (mut ts_client, ts_server) = in_memory_pair();
        let (mut sut_client, sut_server) = in_memory_pair();
        tokio::spawn(fake_party(ts_server, Status::Ok));
        tokio::spawn(fake_party(sut_server, Status::Ok));

        let ts_queue = vec![send_cmd(1), Command::sync(1, true)];
        let sut_queue = vec![send_cmd(1), Command::sync(1, true)];

        let passed = run_queues(ts_queue, sut_queue, &mut ts_client, &mut sut_client).await;
        assert!(passed);
    }

    #[tokio::test]
    async fn fails_when_one_side_reports_user_error() {
        let (mut ts_client, ts_server) = in_memory_pair();
        let (mut sut_client, sut_server) = in_memory_pair();
        tokio::spawn(fake_party(ts_server, Status::UserErr));
        tokio::spawn(fake_party(sut_server, Status::Ok));

        let ts_queue = vec![send_cmd(1), Command::sync(1, true)];
        let sut_queue = vec![send_cmd(1), Command::sync(1, true)];

        let passed = run_queues(ts_queue, sut_queue, &mut ts_client, &mut sut_client).await;
        assert!(!passed);
    }

    #[tokio::test]
    async fn sync_with_wait_for_result_false_does_not_abort_on_prior_failure() {
        let (mut ts_client, ts_server) = in_memory_pair();
        let (mut sut_client, sut_server) = in_memory_pair();
        tokio::spawn(fake_party(ts_server, Status::UserErr));
        tokio::spawn(fake_party(sut_server, Status::Ok));

        // wait_for_result=false: the sync still crosses even though the
        // preceding SEND failed; the overall verdict is still a failure
        // because the run-wide AND-of-statuses check does not forget it.
        let ts_queue = vec![
            send_cmd(1),
            Command::sync(1, false),
            Command::sync(2, true),
        ];
        let sut_queue = vec![Command::sync(1, false), Command::sync(2, true)];

        let passed = run_queues(ts_queue, sut_queue, &mut ts_client, &mut sut_client).await;
        assert!(!passed);
    }

    #[tokio::test]
    async fn cross_party_sync_actually_rendezvous() {
        // TS must WAIT before SUT's sync, proving the barrier really blocks
        // SUT until TS arrives rather than just running independently.
        let (mut ts_client, ts_server) = in_memory_pair();
        let (mut sut_client, sut_server) = in_memory_pair();
        tokio::spawn(fake_party(ts_server, Status::Ok));
        tokio::spawn(fake_party(sut_server, Status::Ok));

        let ts_queue = vec![
            Command::wait(1),
            send_cmd(1),
            Command::sync(1, true),
        ];
        let sut_queue = vec![Command::sync(1, true), send_cmd(1)];

        let start = std::time::Instant::now();
        let passed = run_queues(ts_queue, sut_queue, &mut ts_client, &mut sut_client).await;
        assert!(passed);
        assert!(start.elapsed() >= std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn an_outstanding_command_does_not_block_a_non_blocking_sync() {
        // Shaped after a real deadlock: TS issues a command whose result
        // only becomes available once SUT does its part, but SUT is gated
        // behind the very sync that TS's command precedes. If the driver
        // awaited that command inline before reaching the sync, neither
        // side could ever make progress.
        let (mut ts_client, ts_server) = in_memory_pair();
        let (mut sut_client, sut_server) = in_memory_pair();

        let (unblock_tx, unblock_rx) = tokio::sync::oneshot::channel::<()>();

        let ts_task = tokio::spawn(async move {
            let mut link = ts_server;
            let cmd = link.recv().await.unwrap();
            unblock_rx.await.unwrap();
            let result = Command::result(cmd.test_id, ResultParams::ok(cmd.kind, "done"));
            link.send(&result).await.unwrap();
        });

        let sut_task = tokio::spawn(async move {
            let mut link = sut_server;
            let cmd = link.recv().await.unwrap();
            let result = Command::result(cmd.test_id, ResultParams::ok(cmd.kind, "done"));
            link.send(&result).await.unwrap();
            unblock_tx.send(()).unwrap();
        });

        let ts_queue = vec![send_cmd(1), Command::sync(1, false), Command::sync(2, true)];
        let sut_queue = vec![Command::sync(1, false), send_cmd(1), Command::sync(2, true)];

        let passed = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            run_queues(ts_queue, sut_queue, &mut ts_client, &mut sut_client),
        )
        .await
        .expect("run_queues deadlocked on a command outstanding across a non-blocking sync");
        assert!(passed);

        ts_task.await.unwrap();
        sut_task.await.unwrap();
    }
}
