// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The framed duplex channel used for TR↔TS and TR↔SUT command traffic.
//!
//! Generic over `T: AsyncRead + AsyncWrite + Unpin + Send`, so
//! [`CommandLink<T>`] doesn't care whether `T` is a real `TcpStream` or an
//! in-memory `tokio::io::duplex` pair — useful for driving it against a fake
//! peer in tests without standing up real sockets. Framing is
//! newline-delimited JSON, one `Command` per line.

use crate::protocol::Command;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};

/// A single request/response command channel: the Test Runner sends one
/// command, the party returns exactly one command of kind `RESULT`.
/// `Sync`/`Wait` never reach this type; the Test Runner short-circuits them
/// locally.
pub struct CommandLink<T> {
    reader: BufReader<ReadHalf<T>>,
    writer: WriteHalf<T>,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> CommandLink<T> {
    pub fn new(stream: T) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        CommandLink {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    pub async fn send(&mut self, cmd: &Command) -> std::io::Result<()> {
        let mut line = serde_json::to_string(cmd)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }

    pub async fn recv(&mut self) -> std::io::Result<Command> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "command channel closed",
            ));
        }
        serde_json::from_str(line.trim_end())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Send `cmd` and block for its `RESULT`. The only call shape the
    /// protocol allows.
    pub async fn call(&mut self, cmd: Command) -> std::io::Result<Command> {
        self.send(&cmd).await?;
        self.recv().await
    }

    /// Plain-text handshake line exchanged before any JSON command flows,
    /// since raw TCP has no path routing to tell the two party roles apart
    /// the way a path-based router would. `token` is `"TS"` or `"SUT"`.
    pub async fn send_hello(&mut self, token: &str) -> std::io::Result<()> {
        let line = format!("HELLO {token}\n");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }

    /// Reads the handshake line and returns whichever token it carries
    /// (`"TS"` or `"SUT"`), without assuming in advance which one it'll be —
    /// the caller branches on the result instead of probing with a token it
    /// has already guessed.
    pub async fn recv_hello(&mut self) -> std::io::Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            ));
        }
        line.trim_end()
            .strip_prefix("HELLO ")
            .map(str::to_owned)
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("malformed handshake line: '{}'", line.trim_end()),
                )
            })
    }

    pub async fn expect_hello(&mut self, token: &str) -> std::io::Result<()> {
        let got = self.recv_hello().await?;
        if got != token {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected 'HELLO {token}', got 'HELLO {got}'"),
            ));
        }
        Ok(())
    }
}

/// Helper for tests and any caller that wants both ends of an in-memory
/// link without standing up real sockets.
pub fn in_memory_pair() -> (
    CommandLink<tokio::io::DuplexStream>,
    CommandLink<tokio::io::DuplexStream>,
) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (CommandLink::new(a), CommandLink::new(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandKind, Params, ResultParams, Status};

    #[tokio::test]
    async fn call_round_trips_over_in_memory_pair() {
        let (mut client, mut server) = in_memory_pair();

        let server_task = tokio::spawn(async move {
            let cmd = server.recv().await.unwrap();
            assert_eq!(cmd.kind, CommandKind::Abort);
            let result = crate::protocol::Command::result(
                cmd.test_id,
                ResultParams::ok(CommandKind::Abort, "done"),
            );
            server.send(&result).await.unwrap();
        });

        let cmd = crate::protocol::Command::new(7, CommandKind::Abort, Params::None);
        let result = client.call(cmd).await.unwrap();
        assert_eq!(result.as_result().unwrap().status, Status::Ok);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn hello_handshake_round_trips() {
        let (mut a, mut b) = in_memory_pair();
        let t = tokio::spawn(async move {
            a.send_hello("TS").await.unwrap();
        });
        b.expect_hello("TS").await.unwrap();
        t.await.unwrap();
    }

    #[tokio::test]
    async fn recv_on_closed_channel_is_unexpected_eof() {
        let (client, server) = in_memory_pair();
        drop(client);
        let mut server = server;
        let err = server.recv().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
