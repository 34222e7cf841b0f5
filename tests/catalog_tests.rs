//! Catalog-level tests: field round-trips through whole messages, chained
//! messages, telegram lookup, and poll scheduling.

use ebus_rs::catalog::field::{OutputOpts, PartType};
use ebus_rs::catalog::{csv, MessageMap};
use ebus_rs::ebus::symbol::SymbolString;
use ebus_rs::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn write_config(name: &str, content: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ebus-rs-it-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("test.csv"), content).unwrap();
    dir
}

fn load(name: &str, content: &str) -> MessageMap {
    let dir = write_config(name, content);
    let mut map = MessageMap::new(false);
    csv::load_config_dir(&mut map, &dir).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
    map
}

fn unescaped(hex: &str) -> SymbolString {
    let mut buf = SymbolString::new(false);
    buf.parse_hex(hex, false).unwrap();
    buf
}

/// Decoding `01 12 26 00` through a d2b+uin layout and encoding the same
/// values reproduces the byte sequence exactly.
#[test]
fn test_field_round_trip_through_message() {
    let map = load(
        "roundtrip",
        "r,main,Pump,,,08,b509,,flow,s,d2b,,°C,,rpm,s,uin,,,\n",
    );
    let message = map.find_by_name("main", "pump", false, false).unwrap();

    let master = unescaped("ff08b50900");
    let slave = unescaped("04011226 00");
    message.store_last_exchange(&master, &slave).unwrap();
    let decoded = message.decode_last_data(OutputOpts::default(), None, -1).unwrap();
    assert_eq!(decoded, "flow=18.004;rpm=38");

    // write side: the same value string encodes back to the same bytes
    let prepared = message.data();
    let mut out = SymbolString::new(false);
    prepared.write(PartType::Slave, "18.004;38", &mut out).unwrap();
    assert_eq!(out.as_slice(), &[0x01, 0x12, 0x26, 0x00]);
}

/// A single named field can be extracted, with units in verbose mode.
#[test]
fn test_single_field_and_verbose() {
    let map = load(
        "field",
        "r,main,Pump,,,08,b509,,flow,s,d2b,,°C,flow temperature,rpm,s,uin,,,\n",
    );
    let message = map.find_by_name("", "pump", false, false).unwrap();
    let master = unescaped("ff08b50900");
    let slave = unescaped("0401122600");
    message.store_last_exchange(&master, &slave).unwrap();

    let field = message
        .decode_last_data(OutputOpts::default(), Some("rpm"), -1)
        .unwrap();
    assert_eq!(field, "rpm=38");
    assert_eq!(
        message.decode_last_data(OutputOpts::default(), Some("nosuch"), -1),
        Err(Error::NotFound)
    );

    let verbose = message
        .decode_last_data(OutputOpts { verbose: true, numeric: false }, Some("flow"), -1)
        .unwrap();
    assert_eq!(verbose, "flow=18.004 °C [flow temperature]");
}

/// A two-part chain issues two telegrams whose payloads concatenate into
/// the declared field layout.
#[test]
fn test_chained_message_concatenates_parts() {
    let map = load(
        "chain",
        "r,main,Stats,,,08,b509,05:2;06:2,one,s,uin,,,,two,s,uin,,,\n",
    );
    let message = map.find_by_name("main", "stats", false, false).unwrap();
    assert_eq!(message.count(), 2);

    // part 0
    let master = message.prepare_master(0xFF, "", None, 0).unwrap();
    assert_eq!(master.data_str(true, true), "ff08b5090105");
    assert!(!message.store_last_data(PartType::Slave, &unescaped("022600"), 0).unwrap());
    // part 1
    let master = message.prepare_master(0xFF, "", None, 1).unwrap();
    assert_eq!(master.data_str(true, true), "ff08b5090106");
    assert!(message.store_last_data(PartType::Slave, &unescaped("023412"), 1).unwrap());

    let decoded = message.decode_last_data(OutputOpts::default(), None, -1).unwrap();
    assert_eq!(decoded, "one=38;two=4660");
}

/// Two messages with the same kind, ID, and destination cannot coexist.
#[test]
fn test_duplicate_telegram_key_rejected() {
    let dir = write_config(
        "dup",
        "r,main,A,,,08,b509,0d,temp,s,d2b,,,\nr,other,B,,,08,b509,0d,temp,s,d2b,,,\n",
    );
    let mut map = MessageMap::new(false);
    let result = csv::load_config_dir(&mut map, &dir);
    let _ = std::fs::remove_dir_all(&dir);
    assert_eq!(result, Err(Error::Duplicate));
}

/// Passive broadcast telegrams resolve through the wildcard destination
/// and update the cache.
#[test]
fn test_passive_broadcast_lookup_and_decode() {
    let map = load("bcast", "u,broadcast,Time,,,fe,0700,,time,s,bti,,,\n");
    // observed on the bus: 10 -> fe, pb 07 sb 00, 3 data bytes
    let master = unescaped("10fe070003580421");
    let message = map.find_for_master(&master, false, true, true, true).unwrap();
    assert_eq!(message.name(), "Time");
    message
        .store_last_data(PartType::Master, &master, 0)
        .unwrap();
    let decoded = message.decode_last_data(OutputOpts::default(), None, -1).unwrap();
    assert_eq!(decoded, "time=21:04:58");
}

/// A longer declared ID wins over a shorter one for the same PB/SB.
#[test]
fn test_longest_id_match_wins() {
    let map = load(
        "ids",
        "r,main,Short,,,08,b509,0d,x,s,uch,,,\nr,main,Long,,,08,b509,0d01,y,s,uch,,,\n",
    );
    let master = unescaped("ff08b509020d01");
    let message = map.find_for_master(&master, false, true, true, true).unwrap();
    assert_eq!(message.name(), "Long");

    let master = unescaped("ff08b509010d");
    let message = map.find_for_master(&master, false, true, true, true).unwrap();
    assert_eq!(message.name(), "Short");
}

/// With priorities 1 and 2 the dispatch ratio approaches 2:1 and the
/// lower-priority message never starves.
#[test]
fn test_poll_priority_fairness() {
    let map = load(
        "poll",
        "r1,main,Fast,,,08,b509,01,x,s,uch,,,\nr2,main,Slow,,,08,b509,02,y,s,uch,,,\n",
    );
    assert_eq!(map.size_poll(), 2);
    let interval = Duration::from_secs(1);
    let mut fast = 0u32;
    let mut slow = 0u32;
    for _ in 0..300 {
        let message = map.next_poll(interval).unwrap();
        match message.name() {
            "Fast" => fast += 1,
            "Slow" => slow += 1,
            other => panic!("unexpected poll message {other}"),
        }
    }
    assert!(slow >= 50, "slow starved: fast={fast} slow={slow}");
    let ratio = fast as f64 / slow as f64;
    assert!((1.6..=2.4).contains(&ratio), "ratio {ratio} (fast={fast} slow={slow})");
}

/// Conditional messages only become visible once the referenced field
/// value matches.
#[test]
fn test_condition_gates_availability() {
    let map = load(
        "cond",
        "r,main,Mode,,,08,b509,01,mode,s,uch,,,\n\
         [ison],main,Mode,,mode,,1\n\
         [ison]r,main,Extra,,,08,b509,02,x,s,uch,,,\n",
    );
    // unresolved value: the conditional message stays hidden
    assert!(map.find_by_name("main", "extra", false, false).is_none());

    let mode = map.find_by_name("main", "mode", false, false).unwrap();
    let master = unescaped("ff08b5090101");
    let slave = unescaped("0101");
    mode.store_last_exchange(&master, &slave).unwrap();
    // now mode=1 satisfies the condition
    let extra = map.find_by_name("main", "extra", false, false);
    assert!(extra.is_some(), "conditional message still hidden");
}

/// The condition source is granted an implicit poll priority.
#[test]
fn test_condition_source_gets_poll_priority() {
    let map = load(
        "condprio",
        "r,main,Mode,,,08,b509,01,mode,s,uch,,,\n\
         [ison],main,Mode,,mode,,1\n\
         [ison]r,main,Extra,,,08,b509,02,x,s,uch,,,\n",
    );
    let mode = map.find_by_name("main", "mode", false, false).unwrap();
    assert_eq!(mode.poll_priority(), ebus_rs::constants::POLL_PRIORITY_CONDITION);
    assert_eq!(map.size_poll(), 1);
}

/// Reload semantics: a fresh map replaces the definitions, derived scan
/// clones are recreated on demand.
#[test]
fn test_scan_clone_per_address() {
    let mut map = MessageMap::new(false);
    let clone = map.get_scan_message(Some(0x08)).unwrap();
    assert_eq!(clone.circuit(), "scan.08");
    assert_eq!(clone.dst_address(), 0x08);
    let again = map.get_scan_message(Some(0x08)).unwrap();
    assert!(Arc::ptr_eq(&clone, &again));
    // the identification answer decodes as ASCII
    let master = unescaped("ff08070400");
    let slave = unescaped("0a656275 73642e65 753b65");
    clone.store_last_exchange(&master, &slave).unwrap();
    let decoded = clone.decode_last_data(OutputOpts::default(), None, -1).unwrap();
    assert_eq!(decoded, "ident=ebusd.eu;e");
}

/// Value maps, divisors, and sentinel values survive the catalog loader.
#[test]
fn test_value_map_and_sentinel() {
    let map = load(
        "values",
        "r,main,State,,,08,b509,03,state,s,uch,0=off;1=on,,,temp,s,d1c,,,\n",
    );
    let message = map.find_by_name("main", "state", false, false).unwrap();
    let master = unescaped("ff08b50903");
    let slave = unescaped("020139");
    message.store_last_exchange(&master, &slave).unwrap();
    let decoded = message.decode_last_data(OutputOpts::default(), None, -1).unwrap();
    assert_eq!(decoded, "state=on;temp=28.5");

    // sentinel decodes to the missing value
    let slave = unescaped("0200ff");
    message.store_last_data(PartType::Slave, &slave, 0).unwrap();
    let decoded = message.decode_last_data(OutputOpts::default(), None, -1).unwrap();
    assert_eq!(decoded, "state=off;temp=-");
}
