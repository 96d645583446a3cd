// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The Test Server process. Connects out to the Test Runner, sends the
//! `HELLO TS` handshake token, then loops
//! `recv command / dispatch / send result` forever.

use clap::Parser;
use common::config::Config;
use common::link::CommandLink;
use std::path::PathBuf;
use std::process::ExitCode;
use tcp_conformance::ts::Engine;
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[clap(name = "test_server", about = "TCP conformance test server")]
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

    let _guard = common::logging::init("test_server", &config.logging);

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
    if let Err(e) = link.send_hello("TS").await {
        tracing::error!("failed to send HELLO: {e}");
        return ExitCode::from(2);
    }

    let own_ip = match config.test_server.ip {
        std::net::IpAddr::V4(v4) => v4,
        std::net::IpAddr::V6(_) => {
            tracing::error!("test_server.ip must be an IPv4 address");
            return ExitCode::from(2);
        }
    };
    let mut engine = Engine::new(own_ip, config.test_server.iface.clone());

    loop {
        let cmd = match link.recv().await {
            Ok(c) => c,
            Err(e) => {
                tracing::info!("command channel closed: {e}");
                return ExitCode::SUCCESS;
            }
        };

        let result = engine.dispatch(cmd).await;
        if let Err(e) = link.send(&result).await {
            tracing::error!("failed to send result: {e}");
            return ExitCode::from(2);
        }
    }
}
