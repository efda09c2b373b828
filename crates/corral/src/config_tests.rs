// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use yare::parameterized;

use super::*;

fn parse(args: &[&str]) -> Config {
    let mut full = vec!["corral"];
    full.extend_from_slice(args);
    match Config::try_parse_from(full) {
        Ok(c) => c,
        Err(e) => unreachable!("parse failed: {e}"),
    }
}

#[test]
fn defaults_are_sane() -> anyhow::Result<()> {
    let config = parse(&[]);
    config.validate()?;
    assert_eq!(config.ring_lines, 10_000);
    assert_eq!(config.idle_timeout, 3600);
    assert_eq!(config.max_lifetime, 14_400);
    assert_eq!(config.heartbeat, 30);
    Ok(())
}

#[test]
fn rejects_zero_ring() {
    let config = parse(&["--ring-lines", "0"]);
    assert!(config.validate().is_err());
}

#[test]
fn rejects_unknown_log_format() {
    let config = parse(&["--log-format", "yaml"]);
    assert!(config.validate().is_err());
}

#[parameterized(
    one = { 1 }, five = { 5 }, fifteen = { 15 }, thirty = { 30 }, sixty = { 60 },
)]
fn accepts_allowed_polling(minutes: u32) {
    let config = MonitorConfig { polling_minutes: minutes, ..MonitorConfig::default() };
    assert!(config.validate().is_ok());
}

#[parameterized(
    zero = { 0 }, seven = { 7 }, ninety = { 90 },
)]
fn rejects_other_polling(minutes: u32) {
    let config = MonitorConfig { polling_minutes: minutes, ..MonitorConfig::default() };
    assert!(config.validate().is_err());
}

#[test]
fn unknown_account_defaults_enabled() {
    let config = MonitorConfig::default();
    assert!(config.account_enabled(7));
}

#[test]
fn per_account_disable_wins() {
    let mut config = MonitorConfig::default();
    config.accounts.insert("7".to_owned(), AccountMonitorConfig { enabled: false });
    assert!(!config.account_enabled(7));
    assert!(config.account_enabled(8));
}
