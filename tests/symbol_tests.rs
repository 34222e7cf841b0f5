//! Unit tests for the symbol string, the eBUS CRC, and the bus address
//! classification.

use ebus_rs::constants::{BROADCAST, ESC, SYN};
use ebus_rs::ebus::address::{is_master, is_valid_address, master_address, master_number};
use ebus_rs::ebus::symbol::{crc_of, MasterCompare, SymbolString};
use ebus_rs::Error;

/// Escaping never leaves a raw SYN on the wire and unescaping restores the
/// original sequence together with the same CRC.
#[test]
fn test_escape_round_trip_property() {
    let samples: Vec<Vec<u8>> = vec![
        vec![],
        vec![0x00],
        vec![ESC],
        vec![SYN],
        vec![ESC, SYN, ESC, SYN],
        vec![0x10, 0x08, 0xB5, 0x09, 0x03, 0x0D, SYN, ESC],
        (0u8..=255).collect(),
    ];
    for sample in samples {
        let mut escaped = SymbolString::new(true);
        for &value in &sample {
            escaped.push_back(value, false, true).unwrap();
        }
        assert!(
            !escaped.as_slice().contains(&SYN),
            "escaped form contains raw SYN for {sample:02x?}"
        );

        let mut unescaped = SymbolString::new(false);
        for &value in escaped.as_slice() {
            unescaped.push_back(value, true, true).unwrap();
        }
        assert_eq!(unescaped.as_slice(), &sample[..]);
        assert_eq!(unescaped.crc(), escaped.crc());
    }
}

/// The incrementally computed CRC matches the batch computation.
#[test]
fn test_crc_determinism() {
    let data = [0xFFu8, 0x08, 0x07, 0x04, 0x00];
    let mut incremental = SymbolString::new(false);
    for &value in &data {
        incremental.push_back(value, false, true).unwrap();
    }
    assert_eq!(incremental.crc(), crc_of(&data));

    // escaped values enter the CRC in their expanded form
    let with_esc = [0x10u8, ESC, 0x01];
    let plain = [0x10u8, ESC, 0x00, 0x01];
    let mut buf = SymbolString::new(true);
    for &value in &plain {
        buf.push_back(value, true, true).unwrap();
    }
    assert_eq!(crc_of(&with_esc), buf.crc());
}

/// A known telegram checksum stays stable.
#[test]
fn test_crc_reference_value() {
    // the CRC table entry for a single zero byte is the identity
    assert_eq!(crc_of(&[0x00]), 0x00);
    assert_eq!(crc_of(&[0x01]), 0x01);
    // feeding the previous CRC through the table: crc(9b) after 0x01
    assert_ne!(crc_of(&[0x01, 0x00]), 0x00);
}

/// An escape prefix followed by anything but 0x00/0x01 is an error.
#[test]
fn test_invalid_escape_sequence() {
    let mut buf = SymbolString::new(false);
    assert_eq!(buf.push_back(ESC, true, true), Ok(false));
    assert_eq!(buf.push_back(0x02, true, true), Err(Error::Esc));
}

/// Hex parsing accepts whitespace between bytes and rejects odd input.
#[test]
fn test_hex_parse() {
    let mut buf = SymbolString::new(false);
    buf.parse_hex("ff 08 07 04 00", false).unwrap();
    assert_eq!(buf.as_slice(), &[0xFF, 0x08, 0x07, 0x04, 0x00]);
    assert_eq!(buf.data_str(true, false), "ff08070400");

    let mut bad = SymbolString::new(false);
    assert!(bad.parse_hex("ff0", false).is_err());
    let mut bad = SymbolString::new(false);
    assert!(bad.parse_hex("gg", false).is_err());
}

/// An escaped instance appends the CRC behind parsed hex data.
#[test]
fn test_hex_parse_escaped_appends_crc() {
    let mut buf = SymbolString::new(true);
    buf.parse_hex("ff08070400", false).unwrap();
    assert_eq!(buf.len(), 6);
    assert_eq!(buf.at(5), crc_of(&[0xFF, 0x08, 0x07, 0x04, 0x00]));
}

/// Master comparison distinguishes same data, changed source, and changed
/// payload.
#[test]
fn test_compare_master() {
    let mut a = SymbolString::new(false);
    a.parse_hex("ff08070400", false).unwrap();
    let b = a.clone();
    let mut c = SymbolString::new(false);
    c.parse_hex("1008070400", false).unwrap();
    let mut d = SymbolString::new(false);
    d.parse_hex("ff08070500", false).unwrap();
    assert_eq!(a.compare_master(&b), MasterCompare::Equal);
    assert_eq!(a.compare_master(&c), MasterCompare::AddressOnly);
    assert_eq!(a.compare_master(&d), MasterCompare::Different);
}

/// Exactly 25 addresses classify as masters and the master numbers form a
/// bijection onto 1..=25.
#[test]
fn test_address_classification() {
    let masters: Vec<u8> = (0u16..256).map(|a| a as u8).filter(|&a| is_master(a)).collect();
    assert_eq!(masters.len(), 25);

    let mut numbers: Vec<u8> = masters.iter().map(|&m| master_number(m)).collect();
    numbers.sort_unstable();
    let expected: Vec<u8> = (1..=25).collect();
    assert_eq!(numbers, expected);

    for &master in &masters {
        let slave = master.wrapping_add(5);
        assert!(!is_master(slave), "slave {slave:02x} of {master:02x} is a master");
        assert_eq!(master_address(slave), Some(master));
    }

    assert!(!is_valid_address(SYN, true));
    assert!(!is_valid_address(ESC, true));
    assert!(is_valid_address(BROADCAST, true));
    assert!(!is_valid_address(BROADCAST, false));
}
