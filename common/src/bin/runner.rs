// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The Test Runner process. Accepts one Test Server connection and one SUT
//! connection, then drives the built-in catalogue against them in id order,
//! printing a pass/fail table as it goes.

use clap::Parser;
use common::config::Config;
use common::link::CommandLink;
use common::runner::run_queues;
use common::testcases::{self, TestCase};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::net::{TcpListener, TcpStream};

#[derive(Parser, Debug)]
#[clap(name = "runner", about = "TCP conformance test runner")]
struct Args {
    #[clap(long, default_value = "config.ini")]
    config: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaseVerdict {
    Pass,
    Fail,
}

impl CaseVerdict {
    fn marker(&self) -> &'static str {
        match self {
            CaseVerdict::Pass => "PASS",
            CaseVerdict::Fail => "FAIL",
        }
    }
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

    let _guard = common::logging::init("runner", &config.logging);

    tracing::info!(
        "listening for TS/SUT connections on {}:{}",
        config.test_runner.ip,
        config.test_runner.port
    );

    let listener = match TcpListener::bind((config.test_runner.ip, config.test_runner.port)).await
    {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("failed to bind test_runner listener: {e}");
            return ExitCode::from(2);
        }
    };

    let (mut ts_link, mut sut_link) = match accept_both_parties(&listener).await {
        Ok(links) => links,
        Err(e) => {
            tracing::error!("failed to establish TS/SUT connections: {e}");
            return ExitCode::from(2);
        }
    };

    let cases = testcases::catalogue(
        &config.test_server.ip.to_string(),
        &config.sut.ip.to_string(),
    );

    let mut results: Vec<(u32, &'static str, CaseVerdict)> = Vec::new();

    for case in &cases {
        let verdict = run_case(case, &mut ts_link, &mut sut_link).await;
        tracing::info!("case {} ({}): {:?}", case.id, case.name, verdict);
        results.push((case.id, case.name, verdict));
        print_results_table(&results);
    }

    if results.iter().any(|(_, _, v)| *v == CaseVerdict::Fail) {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

/// Accepts exactly two inbound connections and sorts them into TS/SUT roles
/// by their `HELLO` token, since raw TCP carries no path routing to
/// dispatch on. Reads the token once per connection and branches on its
/// value — trying `expect_hello("TS")` then `expect_hello("SUT")` against
/// the same stream would consume the only handshake line on the first
/// attempt and then block forever on the second.
async fn accept_both_parties(
    listener: &TcpListener,
) -> std::io::Result<(CommandLink<TcpStream>, CommandLink<TcpStream>)> {
    let mut ts: Option<CommandLink<TcpStream>> = None;
    let mut sut: Option<CommandLink<TcpStream>> = None;

    while ts.is_none() || sut.is_none() {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!("accepted connection from {peer}");
        let mut link = CommandLink::new(stream);
        match link.recv_hello().await {
            Ok(token) if token == "TS" && ts.is_none() => ts = Some(link),
            Ok(token) if token == "SUT" && sut.is_none() => sut = Some(link),
            Ok(token) => {
                tracing::warn!("dropping connection from {peer}: unexpected or duplicate HELLO '{token}'");
            }
            Err(e) => {
                tracing::warn!("dropping connection from {peer}: {e}");
            }
        }
    }

    Ok((ts.unwrap(), sut.unwrap()))
}

/// Runs one test case's setup queue, then (only if setup passed) its body
/// queue.
async fn run_case(
    case: &TestCase,
    ts_link: &mut CommandLink<TcpStream>,
    sut_link: &mut CommandLink<TcpStream>,
) -> CaseVerdict {
    let setup_ok = run_queues(
        case.ts_setup.clone(),
        case.sut_setup.clone(),
        ts_link,
        sut_link,
    )
    .await;

    if !setup_ok {
        return CaseVerdict::Fail;
    }

    let body_ok = run_queues(
        case.ts_body.clone(),
        case.sut_body.clone(),
        ts_link,
        sut_link,
    )
    .await;

    if body_ok {
        CaseVerdict::Pass
    } else {
        CaseVerdict::Fail
    }
}

fn print_results_table(results: &[(u32, &'static str, CaseVerdict)]) {
    println!("--- results ---");
    for (id, name, verdict) in results {
        println!("{:4} {:32} {}", id, name, verdict.marker());
    }
}
