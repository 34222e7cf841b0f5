//! Tests for the text command protocol against a handler whose worker is
//! not running: everything answered from the cache and the shared tables.

use ebus_rs::catalog::{csv, MessageMap};
use ebus_rs::ebus::device::RawControl;
use ebus_rs::ebus::handler::{BusConfig, BusHandler};
use ebus_rs::ebus::symbol::SymbolString;
use ebus_rs::net::{execute, CommandContext, Outcome};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

fn context_with_catalog(content: &str) -> CommandContext {
    let dir: PathBuf =
        std::env::temp_dir().join(format!("ebus-rs-client-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("test.csv"), content).unwrap();
    let mut map = MessageMap::new(false);
    csv::load_config_dir(&mut map, &dir).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
    let messages = Arc::new(RwLock::new(map));
    let handler = BusHandler::new(
        BusConfig { own_master: 0xFF, poll_interval: 0, ..BusConfig::default() },
        messages,
    );
    CommandContext {
        handler,
        raw: RawControl::new(),
        enable_hex: false,
        config_path: None,
        shutdown: Arc::new(AtomicBool::new(false)),
    }
}

fn store_pump_data(ctx: &CommandContext) {
    let map = ctx.handler.messages().read().unwrap();
    let message = map.find_by_name("main", "pump", false, false).unwrap();
    let mut master = SymbolString::new(false);
    master.parse_hex("ff08b50900", false).unwrap();
    let mut slave = SymbolString::new(false);
    slave.parse_hex("0401122600", false).unwrap();
    message.store_last_exchange(&master, &slave).unwrap();
}

fn text(outcome: Outcome) -> String {
    match outcome {
        Outcome::Text(reply) => reply,
        _ => panic!("expected a plain reply"),
    }
}

const CATALOG: &str = "r,main,Pump,,,08,b509,,flow,s,d2b,,°C,,rpm,s,uin,,,\n";

#[test]
fn test_read_from_cache() {
    let ctx = context_with_catalog(CATALOG);
    store_pump_data(&ctx);
    assert_eq!(text(execute(&ctx, "read -c main Pump")), "flow=18.004;rpm=38");
    // case-insensitive command and single field access
    assert_eq!(text(execute(&ctx, "READ -c main pump rpm")), "rpm=38");
}

#[test]
fn test_read_unknown_message() {
    let ctx = context_with_catalog(CATALOG);
    assert_eq!(text(execute(&ctx, "read NoSuch")), "ERR: element not found");
}

#[test]
fn test_find_lists_messages() {
    let ctx = context_with_catalog(CATALOG);
    assert_eq!(text(execute(&ctx, "find")), "main Pump = no data stored");
    store_pump_data(&ctx);
    assert_eq!(text(execute(&ctx, "find -c main")), "main Pump = flow=18.004;rpm=38");
    let full = text(execute(&ctx, "find -f"));
    assert!(full.starts_with("r,main,Pump"), "dump: {full}");
}

#[test]
fn test_state_without_signal() {
    let ctx = context_with_catalog(CATALOG);
    assert_eq!(text(execute(&ctx, "state")), "no signal");
}

#[test]
fn test_grab_cycle() {
    let ctx = context_with_catalog(CATALOG);
    assert_eq!(text(execute(&ctx, "grab result")), "grab disabled");
    assert_eq!(text(execute(&ctx, "grab")), "grab started");
    assert_eq!(text(execute(&ctx, "grab result")), "");
    assert_eq!(text(execute(&ctx, "grab stop")), "grab stopped");
}

#[test]
fn test_hex_requires_enabling() {
    let ctx = context_with_catalog(CATALOG);
    assert_eq!(text(execute(&ctx, "hex 08070400")), "ERR: command not enabled");
}

#[test]
fn test_unknown_command() {
    let ctx = context_with_catalog(CATALOG);
    assert_eq!(text(execute(&ctx, "frobnicate")), "ERR: command not found");
}

#[test]
fn test_quit_closes_connection() {
    let ctx = context_with_catalog(CATALOG);
    assert!(matches!(execute(&ctx, "quit"), Outcome::Quit(_)));
    assert!(matches!(execute(&ctx, "listen"), Outcome::ListenStart(_)));
    assert!(matches!(execute(&ctx, "listen stop"), Outcome::ListenStop(_)));
}

#[test]
fn test_info_reports_counts() {
    let ctx = context_with_catalog(CATALOG);
    let info = text(execute(&ctx, "info"));
    assert!(info.contains("messages: 1"), "info: {info}");
    assert!(info.contains("address: ff master #25"), "info: {info}");
}
