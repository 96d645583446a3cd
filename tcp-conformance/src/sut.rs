// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The SUT socket adapter. A thin mapping from the command protocol onto
//! ordinary `tokio::net::TcpStream` calls — no raw sockets here, the SUT is
//! expected to be a normal TCP stack under test.

use common::config::{MAX_READ, SUT_DEFAULT_TIMEOUT_SECS};
use common::error::{TestError, TestResult};
use common::protocol::{
    Command, CommandKind, ConnectParams, DisconnectParams, ListenParams, Params, ReceiveParams,
    ResultParams, SendParams,
};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(SUT_DEFAULT_TIMEOUT_SECS);

pub struct Adapter {
    ts_ip: IpAddr,
    stream: Option<TcpStream>,
}

impl Adapter {
    pub fn new(ts_ip: IpAddr) -> Self {
        Adapter {
            ts_ip,
            stream: None,
        }
    }

    fn stream_mut(&mut self) -> TestResult<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| TestError::user("socket not initialised"))
    }

    pub async fn handle_listen(&mut self, params: ListenParams) -> TestResult<ResultParams> {
        self.stream = None;

        let bind_addr = SocketAddr::new("0.0.0.0".parse().unwrap(), params.src_port);
        let listener = TcpListener::bind(bind_addr).await.map_err(io_as_user)?;

        let (stream, peer) = tokio::time::timeout(DEFAULT_TIMEOUT, listener.accept())
            .await
            .map_err(|_| TestError::user("listen timed out"))?
            .map_err(io_as_user)?;

        self.stream = Some(stream);
        Ok(ResultParams::ok(
            CommandKind::Listen,
            format!("accepted connection from {peer}"),
        ))
    }

    pub async fn handle_connect(&mut self, params: ConnectParams) -> TestResult<ResultParams> {
        self.stream = None;

        let socket = TcpSocket::new_v4().map_err(io_as_user)?;
        socket.set_reuseaddr(true).map_err(io_as_user)?;
        socket
            .bind(SocketAddr::new("0.0.0.0".parse().unwrap(), params.src_port))
            .map_err(io_as_user)?;

        let dst = SocketAddr::new(self.ts_ip, params.dst_port);
        let stream = tokio::time::timeout(DEFAULT_TIMEOUT, socket.connect(dst))
            .await
            .map_err(|_| TestError::user("connect timed out"))?
            .map_err(io_as_user)?;

        self.stream = Some(stream);
        Ok(ResultParams::ok(CommandKind::Connect, format!("connected to {dst}")))
    }

    pub async fn handle_send(&mut self, params: SendParams) -> TestResult<ResultParams> {
        let payload = params.payload.unwrap_or_default();
        let len = payload.len();
        let stream = self.stream_mut()?;
        stream.write_all(&payload).await.map_err(io_as_user)?;
        Ok(ResultParams::ok(
            CommandKind::Send,
            format!("sent {len} bytes"),
        ))
    }

    pub async fn handle_receive(&mut self, params: ReceiveParams) -> TestResult<ResultParams> {
        let timeout = Duration::from_secs(params.timeout);
        let stream = self.stream_mut()?;
        let mut buf = vec![0u8; MAX_READ];

        let n = match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(io_as_user(e)),
            Err(_) => return Err(TestError::user("receive timed out")),
        };
        buf.truncate(n);

        if let Some(expected) = &params.payload {
            if &buf != expected {
                return Err(TestError::user(format!(
                    "invalid data received: {} bytes",
                    buf.len()
                )));
            }
        }

        Ok(ResultParams::ok(
            CommandKind::Receive,
            format!("received {n} bytes"),
        ))
    }

    /// `half_close` shuts down only the write half; a full disconnect
    /// shuts down and drops the socket entirely.
    pub async fn handle_disconnect(
        &mut self,
        params: DisconnectParams,
    ) -> TestResult<ResultParams> {
        let stream = self.stream_mut()?;
        stream.shutdown().await?;

        if !params.half_close {
            self.stream = None;
        }

        Ok(ResultParams::ok(CommandKind::Disconnect, "disconnected"))
    }

    pub async fn handle_abort(&mut self) -> TestResult<ResultParams> {
        self.stream = None;
        Ok(ResultParams::ok(CommandKind::Abort, "socket state reset"))
    }

    /// Dispatches one [`Command`] to the matching handler.
    pub async fn dispatch(&mut self, cmd: Command) -> Command {
        let test_id = cmd.test_id;
        let op = cmd.kind;

        let result: TestResult<ResultParams> = match cmd.params {
            Params::Listen(p) => self.handle_listen(p).await,
            Params::Connect(p) => self.handle_connect(p).await,
            Params::Send(p) => self.handle_send(p).await,
            Params::Receive(p) => self.handle_receive(p).await,
            Params::Disconnect(p) => self.handle_disconnect(p).await,
            Params::None if op == CommandKind::Abort => self.handle_abort().await,
            other => Err(TestError::internal(format!(
                "unsupported command for SUT: {op:?} / {other:?}"
            ))),
        };

        let params = match result {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("{op:?} failed: {e}");
                ResultParams {
                    status: e.status(),
                    op,
                    description: None,
                    error: Some(e.to_string()),
                }
            }
        };

        Command::result(test_id, params)
    }
}

/// Bind/accept/connect/send/receive failures are always a user-domain
/// result, not an internal error — this keeps that mapping explicit instead
/// of letting `TestError::Transport` (status 2) leak out where every
/// socket-layer failure should read as `FAILURE` (status 1).
fn io_as_user(err: std::io::Error) -> TestError {
    TestError::user(err.to_string())
}
