// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The SUT adapter process. Same shape as `test_server`: connects out to
//! the Test Runner, sends `HELLO SUT`, then loops
//! `recv command / dispatch / send result`.

use clap::Parser;
use common::config::Config;
use common::link::CommandLink;
use std::path::PathBuf;
use std::process::ExitCode;
use tcp_conformance::sut::Adapter;
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[clap(name = "sut", about = "TCP conformance SUT adapter")]
struct Args {
    #[clap(long, default_value = "config.ini")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config from {}: {e}", args.config.display());
            return ExitCode::from(2);
        }
    };

    let _guard = common::logging::init("sut", &config.logging);

    let addr = (config.test_runner.ip, config.test_runner.port);
    tracing::info!("connecting to test runner at {:?}", addr);

    let stream = match TcpStream::connect(addr).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("failed to connect to test runner: {e}");
            return ExitCode::from(2);
        }
    };

    let mut link = CommandLink::new(stream);
    if let Err(e) = link.send_hello("SUT").await {
        tracing::error!("failed to send HELLO: {e}");
        return ExitCode::from(2);
    }

    let mut adapter = Adapter::new(config.test_server.ip);

    loop {
        let cmd = match link.recv().await {
            Ok(c) => c,
            Err(e) => {
                tracing::info!("command channel closed: {e}");
                return ExitCode::SUCCESS;
            }
        };

        let result = adapter.dispatch(cmd).await;
        if let Err(e) = link.send(&result).await {
            tracing::error!("failed to send result: {e}");
            return ExitCode::from(2);
        }
    }
}
