// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use argh::FromArgs;
use log::{warn, Level, LevelFilter};
use tokio::signal::unix::{signal, SignalKind};

use qmi_protocol::TraceOptions;
use qmi_proxyd::proxy::{Proxy, ProxyConfig};

const DEFAULT_EMPTY_TIMEOUT_SECS: u64 = 300;

/// Proxy for sharing QMI control endpoints between processes.
#[derive(FromArgs, Debug)]
struct Args {
    /// don't exit after being idle without clients
    #[argh(switch)]
    no_exit: bool,

    /// if no clients, exit after this many seconds; 0 is equivalent to
    /// --no-exit
    #[argh(option, arg_name = "SECS")]
    empty_timeout: Option<u64>,

    /// run with verbose logs, including the debug ones
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// run with verbose logs, including the debug ones and personal info
    #[argh(switch)]
    verbose_full: bool,

    /// print version
    #[argh(switch, short = 'V')]
    version: bool,
}

fn config_from_args(args: &Args) -> Result<ProxyConfig, String> {
    if args.verbose && args.verbose_full {
        return Err("cannot specify --verbose and --verbose-full at the same time".to_string());
    }

    let empty_timeout = if args.no_exit {
        None
    } else {
        match args.empty_timeout.unwrap_or(DEFAULT_EMPTY_TIMEOUT_SECS) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    };

    Ok(ProxyConfig {
        empty_timeout,
        trace: TraceOptions {
            enabled: args.verbose || args.verbose_full,
            personal_info: args.verbose_full,
        },
    })
}

/// Timestamped logger in the daemon's traditional format: errors and
/// warnings on stderr, everything else on stdout.
struct ProxyLogger {
    level: LevelFilter,
}

impl log::Log for ProxyLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = chrono::Local::now().format("%d %b %Y, %H:%M:%S");
        match record.level() {
            Level::Error => eprintln!("[{}] -Error ** {}", now, record.args()),
            Level::Warn => eprintln!("[{}] -Warning ** {}", now, record.args()),
            Level::Debug | Level::Trace => println!("[{}] [Debug] {}", now, record.args()),
            Level::Info => println!("[{}] {}", now, record.args()),
        }
    }

    fn flush(&self) {}
}

fn print_version() {
    println!("qmi-proxyd {}", env!("CARGO_PKG_VERSION"));
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let proxy = Proxy::new(config).context("could not bind the proxy socket")?;

    let mut sigint = signal(SignalKind::interrupt()).context("could not install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("could not install SIGHUP handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("could not install SIGTERM handler")?;

    tokio::select! {
        served = proxy.run() => served.context("proxy failed")?,
        _ = sigint.recv() => warn!("caught SIGINT, stopping"),
        _ = sighup.recv() => warn!("caught SIGHUP, stopping"),
        _ = sigterm.recv() => warn!("caught SIGTERM, stopping"),
    }
    Ok(())
}

fn main() -> ExitCode {
    let args: Args = argh::from_env();

    if args.version {
        print_version();
        return ExitCode::SUCCESS;
    }

    let config = match config_from_args(&args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("error: {}", message);
            return ExitCode::FAILURE;
        }
    };

    let level = if config.trace.enabled { LevelFilter::Debug } else { LevelFilter::Info };
    let logger = Box::new(ProxyLogger { level });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: could not start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => {
            log::debug!("exiting 'qmi-proxyd'...");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(no_exit: bool, empty_timeout: Option<u64>, verbose: bool, verbose_full: bool) -> Args {
        Args { no_exit, empty_timeout, verbose, verbose_full, version: false }
    }

    #[test]
    fn test_verbose_flags_are_mutually_exclusive() {
        assert!(config_from_args(&args(false, None, true, true)).is_err());
    }

    #[test]
    fn test_default_empty_timeout() {
        let config = config_from_args(&args(false, None, false, false)).unwrap();
        assert_eq!(config.empty_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_zero_timeout_means_no_exit() {
        let config = config_from_args(&args(false, Some(0), false, false)).unwrap();
        assert_eq!(config.empty_timeout, None);
        let config = config_from_args(&args(true, None, false, false)).unwrap();
        assert_eq!(config.empty_timeout, None);
    }

    #[test]
    fn test_verbose_full_enables_personal_info() {
        let config = config_from_args(&args(false, None, false, true)).unwrap();
        assert!(config.trace.enabled);
        assert!(config.trace.personal_info);
        let config = config_from_args(&args(false, None, true, false)).unwrap();
        assert!(config.trace.enabled);
        assert!(!config.trace.personal_info);
    }
}
