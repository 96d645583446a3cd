// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! INI configuration loading. Missing keys are a startup failure — there is
//! no "sensible default" for an IP address or interface name, so every
//! lookup in this module is a hard `TestError::Config`.

use crate::error::TestError;
use std::net::IpAddr;
use std::path::Path;

/// `ReceiveParams.timeout` default when a test case doesn't specify one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// `sut::Adapter` socket timeout default.
pub const SUT_DEFAULT_TIMEOUT_SECS: u64 = 20;

/// `sut::Adapter` read buffer size.
pub const MAX_READ: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl ConsoleLevel {
    fn parse(raw: &str) -> Result<Self, TestError> {
        match raw.to_ascii_lowercase().as_str() {
            "error" => Ok(ConsoleLevel::Error),
            "warn" | "warning" => Ok(ConsoleLevel::Warn),
            "info" => Ok(ConsoleLevel::Info),
            "debug" => Ok(ConsoleLevel::Debug),
            other => Err(TestError::Config(format!(
                "unrecognized [logging].console level: {other}"
            ))),
        }
    }

    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            ConsoleLevel::Error => tracing::Level::ERROR,
            ConsoleLevel::Warn => tracing::Level::WARN,
            ConsoleLevel::Info => tracing::Level::INFO,
            ConsoleLevel::Debug => tracing::Level::DEBUG,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub console: ConsoleLevel,
    pub file_logging: bool,
}

#[derive(Debug, Clone)]
pub struct TestRunnerConfig {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct TestServerConfig {
    pub ip: IpAddr,
    pub iface: String,
}

#[derive(Debug, Clone)]
pub struct SutConfig {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub test_runner: TestRunnerConfig,
    pub test_server: TestServerConfig,
    pub sut: SutConfig,
}

fn section<'a>(ini: &'a ini::Ini, name: &str) -> Result<&'a ini::Properties, TestError> {
    ini.section(Some(name))
        .ok_or_else(|| TestError::Config(format!("missing [{name}] section")))
}

fn required<'a>(props: &'a ini::Properties, section: &str, key: &str) -> Result<&'a str, TestError> {
    props
        .get(key)
        .ok_or_else(|| TestError::Config(format!("missing [{section}].{key}")))
}

fn parse_bool(raw: &str, section: &str, key: &str) -> Result<bool, TestError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(TestError::Config(format!(
            "[{section}].{key} must be a boolean, got {other}"
        ))),
    }
}

fn parse_port(raw: &str, section: &str, key: &str) -> Result<u16, TestError> {
    raw.parse()
        .map_err(|_| TestError::Config(format!("[{section}].{key} must be a port number, got {raw}")))
}

fn parse_ip(raw: &str, section: &str, key: &str) -> Result<IpAddr, TestError> {
    raw.parse()
        .map_err(|_| TestError::Config(format!("[{section}].{key} must be an IP address, got {raw}")))
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TestError> {
        let ini = ini::Ini::load_from_file(path.as_ref())
            .map_err(|e| TestError::Config(format!("failed to read config file: {e}")))?;

        let logging_section = section(&ini, "logging")?;
        let logging = LoggingConfig {
            console: ConsoleLevel::parse(required(logging_section, "logging", "console")?)?,
            file_logging: parse_bool(
                required(logging_section, "logging", "file_logging")?,
                "logging",
                "file_logging",
            )?,
        };

        let tr_section = section(&ini, "test_runner")?;
        let test_runner = TestRunnerConfig {
            ip: parse_ip(required(tr_section, "test_runner", "ip")?, "test_runner", "ip")?,
            port: parse_port(
                required(tr_section, "test_runner", "port")?,
                "test_runner",
                "port",
            )?,
        };

        let ts_section = section(&ini, "test_server")?;
        let test_server = TestServerConfig {
            ip: parse_ip(required(ts_section, "test_server", "ip")?, "test_server", "ip")?,
            iface: required(ts_section, "test_server", "iface")?.to_owned(),
        };

        let sut_section = section(&ini, "sut")?;
        let sut = SutConfig {
            ip: parse_ip(required(sut_section, "sut", "ip")?, "sut", "ip")?,
            port: parse_port(required(sut_section, "sut", "port")?, "sut", "port")?,
        };

        Ok(Config {
            logging,
            test_runner,
            test_server,
            sut,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_ini(contents: &str) -> tempfile_like::TempFile {
        tempfile_like::TempFile::new(contents)
    }

    /// A tiny scratch-file helper so this module doesn't need a `tempfile`
    /// dev-dependency just to exercise the INI loader.
    mod tempfile_like {
        use std::io::Write;
        use std::path::PathBuf;

        pub struct TempFile {
            pub path: PathBuf,
        }

        impl TempFile {
            pub fn new(contents: &str) -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!(
                    "tcp-conformance-test-{}-{}.ini",
                    std::process::id(),
                    super::super::test_counter()
                ));
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(contents.as_bytes()).unwrap();
                TempFile { path }
            }
        }

        impl Drop for TempFile {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    const VALID: &str = r#"
[logging]
console = info
file_logging = false

[test_runner]
ip = 127.0.0.1
port = 12345

[test_server]
ip = 127.0.0.1
iface = lo

[sut]
ip = 127.0.0.1
port = 23456
"#;

    #[test]
    fn loads_a_complete_config() {
        let f = write_ini(VALID);
        let cfg = Config::load(&f.path).expect("should parse");
        assert_eq!(cfg.logging.console, ConsoleLevel::Info);
        assert!(!cfg.logging.file_logging);
        assert_eq!(cfg.test_runner.port, 12345);
        assert_eq!(cfg.test_server.iface, "lo");
        assert_eq!(cfg.sut.port, 23456);
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let incomplete = r#"
[logging]
console = info

[test_runner]
ip = 127.0.0.1
port = 12345

[test_server]
ip = 127.0.0.1
iface = lo

[sut]
ip = 127.0.0.1
port = 23456
"#;
        let f = write_ini(incomplete);
        let err = Config::load(&f.path).unwrap_err();
        assert!(matches!(err, TestError::Config(_)));
    }

    #[test]
    fn missing_section_is_a_config_error() {
        let f = write_ini("[logging]\nconsole = info\nfile_logging = false\n");
        let err = Config::load(&f.path).unwrap_err();
        assert!(matches!(err, TestError::Config(_)));
    }
}

#[cfg(test)]
fn test_counter() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}
