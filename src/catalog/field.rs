//! Typed message fields.
//!
//! Every payload field of a message is a typed slice of the unescaped data
//! bytes. The base types form a closed set with a uniform decode/encode
//! contract: fixed byte width, optional sentinel ("replacement") pattern
//! decoding to the missing value `-`, optional divisor or multiplier, and
//! an optional value map translating raw numbers to symbolic names.

use crate::error::{Error, Result};
use crate::ebus::symbol::SymbolString;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;

/// Which half of the transaction a field lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartType {
    /// The master frame data bytes.
    Master,
    /// The slave frame data bytes.
    Slave,
}

/// The closed set of field base types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    /// Unsigned char, 1 byte, replacement 0xFF.
    Uch,
    /// Signed char, 1 byte, replacement 0x80.
    Sch,
    /// Signed char data value, 1 byte, replacement 0x80.
    D1b,
    /// Unsigned char data value in half units, 1 byte, replacement 0xFF.
    D1c,
    /// Signed 16-bit data value in 1/256 units, little-endian, replacement 0x8000.
    D2b,
    /// Signed 16-bit data value in 1/16 units, little-endian, replacement 0x8000.
    D2c,
    /// Signed 16-bit value in 1/1000 units, little-endian, replacement 0x8000.
    Flt,
    /// IEEE-754 32-bit float, little-endian.
    Exp,
    /// Unsigned 16-bit, little-endian, replacement 0xFFFF.
    Uin,
    /// Unsigned 16-bit, big-endian, replacement 0xFFFF.
    Uir,
    /// Signed 16-bit, little-endian, replacement 0x8000.
    Sin,
    /// Signed 16-bit, big-endian, replacement 0x8000.
    Sir,
    /// Unsigned 32-bit, little-endian, replacement 0xFFFFFFFF.
    Ulg,
    /// Unsigned 32-bit, big-endian, replacement 0xFFFFFFFF.
    Ulr,
    /// Signed 32-bit, little-endian, replacement 0x80000000.
    Slg,
    /// Signed 32-bit, big-endian, replacement 0x80000000.
    Slr,
    /// BCD number, 1 to 4 bytes little-endian, replacement 0xFF per byte.
    Bcd,
    /// Hex-coded decimal, each byte holding two decimal digits in binary.
    Hcd,
    /// PIN, 2 bytes BCD big-endian (4 digits), replacement 0xFFFF.
    Pin,
    /// Single bit.
    Bit,
    /// BCD date dd mm [ww] yy, replacement 0xFF.
    Bda,
    /// Binary date dd mm [ww] yy.
    Hda,
    /// BCD time ss mm hh, replacement 0xFF.
    Bti,
    /// Binary time hh mm ss.
    Hti,
    /// Binary time ss mm hh.
    Vti,
    /// Truncated time in 10-minute units, 1 byte.
    Ttm,
    /// Weekday 0=Mon..6=Sun, 1 byte.
    Bdy,
    /// Weekday 1=Mon..7=Sun, 1 byte.
    Hdy,
    /// Fixed-length ASCII string, padded with 0x00.
    Str,
    /// Zero-terminated ASCII string.
    Nts,
    /// Raw bytes rendered as hex.
    Hex,
    /// Ignored filler bytes.
    Ign,
}

impl BaseType {
    /// Parse a base type identifier from the catalog.
    pub fn parse(name: &str) -> Option<BaseType> {
        Some(match name {
            "uch" => BaseType::Uch,
            "sch" => BaseType::Sch,
            "d1b" => BaseType::D1b,
            "d1c" => BaseType::D1c,
            "d2b" => BaseType::D2b,
            "d2c" => BaseType::D2c,
            "flt" => BaseType::Flt,
            "exp" => BaseType::Exp,
            "uin" => BaseType::Uin,
            "uir" => BaseType::Uir,
            "sin" => BaseType::Sin,
            "sir" => BaseType::Sir,
            "ulg" => BaseType::Ulg,
            "ulr" => BaseType::Ulr,
            "slg" => BaseType::Slg,
            "slr" => BaseType::Slr,
            "bcd" => BaseType::Bcd,
            "hcd" => BaseType::Hcd,
            "pin" => BaseType::Pin,
            "bit" => BaseType::Bit,
            "bda" => BaseType::Bda,
            "hda" => BaseType::Hda,
            "bti" => BaseType::Bti,
            "hti" => BaseType::Hti,
            "vti" => BaseType::Vti,
            "ttm" => BaseType::Ttm,
            "bdy" => BaseType::Bdy,
            "hdy" => BaseType::Hdy,
            "str" => BaseType::Str,
            "nts" => BaseType::Nts,
            "hex" => BaseType::Hex,
            "ign" => BaseType::Ign,
            _ => return None,
        })
    }

    /// The default byte width of the type.
    pub fn default_length(&self) -> u8 {
        match self {
            BaseType::Uch
            | BaseType::Sch
            | BaseType::D1b
            | BaseType::D1c
            | BaseType::Bcd
            | BaseType::Ttm
            | BaseType::Bdy
            | BaseType::Hdy
            | BaseType::Bit
            | BaseType::Ign => 1,
            BaseType::D2b
            | BaseType::D2c
            | BaseType::Flt
            | BaseType::Uin
            | BaseType::Uir
            | BaseType::Sin
            | BaseType::Sir
            | BaseType::Pin => 2,
            BaseType::Bti | BaseType::Hti | BaseType::Vti => 3,
            BaseType::Exp
            | BaseType::Ulg
            | BaseType::Ulr
            | BaseType::Slg
            | BaseType::Slr
            | BaseType::Bda
            | BaseType::Hda
            | BaseType::Hcd => 4,
            BaseType::Str | BaseType::Nts | BaseType::Hex => 1,
        }
    }

    /// Whether the type accepts a `:length` modifier.
    pub fn has_variable_length(&self) -> bool {
        matches!(
            self,
            BaseType::Bcd
                | BaseType::Hcd
                | BaseType::Bda
                | BaseType::Hda
                | BaseType::Str
                | BaseType::Nts
                | BaseType::Hex
                | BaseType::Ign
        )
    }

    /// The built-in divisor of the type (negative values are multipliers).
    fn base_divisor(&self) -> i32 {
        match self {
            BaseType::D1c => 2,
            BaseType::D2b => 256,
            BaseType::D2c => 16,
            // exp raw values are scaled by 1000 on decode
            BaseType::Flt | BaseType::Exp => 1000,
            _ => 1,
        }
    }

    fn is_numeric(&self) -> bool {
        !matches!(self, BaseType::Str | BaseType::Nts | BaseType::Hex | BaseType::Ign)
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// The sentinel pattern was read (or written as `-`).
    Missing,
    /// A numeric value with print precision.
    Num { value: f64, precision: u8 },
    /// A symbolic or string value.
    Str(String),
}

impl FieldValue {
    /// The raw numeric value, if any.
    pub fn as_num(&self) -> Option<f64> {
        match self {
            FieldValue::Num { value, .. } => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Missing => write!(f, "-"),
            FieldValue::Num { value, precision } => {
                if *precision == 0 {
                    write!(f, "{}", *value as i64)
                } else {
                    write!(f, "{:.*}", *precision as usize, value)
                }
            }
            FieldValue::Str(s) => write!(f, "{s}"),
        }
    }
}

const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// A single typed field of a message.
#[derive(Debug, Clone)]
pub struct SingleField {
    pub name: String,
    pub part: PartType,
    pub base: BaseType,
    /// Byte width (bit count 1 for [`BaseType::Bit`], 0 for remainder).
    pub length: u8,
    /// Extra divisor from the catalog: >1 divides, <-1 multiplies, 0/1 none.
    pub divisor: i32,
    pub unit: String,
    pub comment: String,
    /// Optional raw-value-to-name map.
    pub values: Option<BTreeMap<i64, String>>,
}

impl SingleField {
    /// The byte width this field occupies, `remainder` substituted for
    /// variable-length fields declared with `*`.
    pub fn byte_length(&self, remainder: usize) -> usize {
        if self.length == 0 {
            remainder
        } else if self.base == BaseType::Bit {
            1
        } else {
            self.length as usize
        }
    }

    fn combined_divisor(&self) -> (f64, u8) {
        let base = self.base.base_divisor();
        let mut divisor = base as f64;
        match self.divisor {
            0 | 1 => {}
            d if d > 1 => divisor *= d as f64,
            d => divisor /= (-d) as f64,
        }
        if divisor <= 1.0 {
            return (divisor, 0);
        }
        let precision = (divisor.log10().ceil()) as u8;
        (divisor, precision)
    }

    /// Decode the field from its raw bytes.
    pub fn decode(&self, raw: &[u8]) -> Result<FieldValue> {
        if raw.len() < self.byte_length(raw.len()) {
            return Err(Error::InvalidPos);
        }
        let len = self.byte_length(raw.len());
        let raw = &raw[..len];
        match self.base {
            BaseType::Str => {
                let end = raw.iter().rposition(|&b| b != 0x00 && b != b' ').map_or(0, |p| p + 1);
                let s: String = raw[..end].iter().map(|&b| b as char).collect();
                Ok(FieldValue::Str(s))
            }
            BaseType::Nts => {
                let end = raw.iter().position(|&b| b == 0x00).unwrap_or(raw.len());
                let s: String = raw[..end].iter().map(|&b| b as char).collect();
                Ok(FieldValue::Str(s))
            }
            BaseType::Hex => {
                let parts: Vec<String> = raw.iter().map(|b| format!("{b:02x}")).collect();
                Ok(FieldValue::Str(parts.join(" ")))
            }
            BaseType::Ign => Ok(FieldValue::Str(String::new())),
            BaseType::Bda | BaseType::Hda => self.decode_date(raw),
            BaseType::Bti | BaseType::Hti | BaseType::Vti | BaseType::Ttm => self.decode_time(raw),
            BaseType::Bdy => {
                if raw[0] == 0xFF {
                    return Ok(FieldValue::Missing);
                }
                let day = raw[0] as usize;
                if day > 6 {
                    return Err(Error::OutOfRange);
                }
                Ok(FieldValue::Str(WEEKDAYS[day].to_string()))
            }
            BaseType::Hdy => {
                if raw[0] == 0xFF {
                    return Ok(FieldValue::Missing);
                }
                let day = raw[0] as usize;
                if !(1..=7).contains(&day) {
                    return Err(Error::OutOfRange);
                }
                Ok(FieldValue::Str(WEEKDAYS[day - 1].to_string()))
            }
            BaseType::Bit => {
                let value = raw[0] & 0x01;
                Ok(FieldValue::Num { value: value as f64, precision: 0 })
            }
            _ => {
                let signed = match self.raw_value(raw)? {
                    Some(v) => v,
                    None => return Ok(FieldValue::Missing),
                };
                if let Some(values) = &self.values {
                    if let Some(name) = values.get(&signed) {
                        return Ok(FieldValue::Str(name.clone()));
                    }
                }
                let (divisor, precision) = self.combined_divisor();
                Ok(FieldValue::Num { value: signed as f64 / divisor, precision })
            }
        }
    }

    /// Decode to the raw machine value, bypassing divisor and value map.
    /// Returns `None` for the sentinel pattern or a non-numeric type.
    pub fn decode_raw(&self, raw: &[u8]) -> Result<Option<i64>> {
        if !self.base.is_numeric() {
            return Ok(None);
        }
        let len = self.byte_length(raw.len());
        if raw.len() < len {
            return Err(Error::InvalidPos);
        }
        if self.base == BaseType::Bit {
            return Ok(Some((raw[0] & 0x01) as i64));
        }
        self.raw_value(&raw[..len])
    }

    fn raw_value(&self, raw: &[u8]) -> Result<Option<i64>> {
        let value: i64 = match self.base {
            BaseType::Uch | BaseType::D1c => {
                if raw[0] == 0xFF {
                    return Ok(None);
                }
                raw[0] as i64
            }
            BaseType::Sch | BaseType::D1b => {
                if raw[0] == 0x80 {
                    return Ok(None);
                }
                raw[0] as i8 as i64
            }
            BaseType::Uin => {
                let v = u16::from_le_bytes([raw[0], raw[1]]);
                if v == 0xFFFF {
                    return Ok(None);
                }
                v as i64
            }
            BaseType::Uir => {
                let v = u16::from_be_bytes([raw[0], raw[1]]);
                if v == 0xFFFF {
                    return Ok(None);
                }
                v as i64
            }
            BaseType::Sin | BaseType::D2b | BaseType::D2c | BaseType::Flt => {
                let v = i16::from_le_bytes([raw[0], raw[1]]);
                if v as u16 == 0x8000 {
                    return Ok(None);
                }
                v as i64
            }
            BaseType::Sir => {
                let v = i16::from_be_bytes([raw[0], raw[1]]);
                if v as u16 == 0x8000 {
                    return Ok(None);
                }
                v as i64
            }
            BaseType::Ulg => {
                let v = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                if v == 0xFFFF_FFFF {
                    return Ok(None);
                }
                v as i64
            }
            BaseType::Ulr => {
                let v = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
                if v == 0xFFFF_FFFF {
                    return Ok(None);
                }
                v as i64
            }
            BaseType::Slg => {
                let v = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                if v as u32 == 0x8000_0000 {
                    return Ok(None);
                }
                v as i64
            }
            BaseType::Slr => {
                let v = i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
                if v as u32 == 0x8000_0000 {
                    return Ok(None);
                }
                v as i64
            }
            BaseType::Exp => {
                let v = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                if v.is_nan() {
                    return Ok(None);
                }
                // raw value scaled by 1000 keeps three digits through the divisor path
                return Ok(Some((v as f64 * 1000.0).round() as i64));
            }
            BaseType::Bcd => {
                let mut value: i64 = 0;
                for &b in raw.iter().rev() {
                    if b == 0xFF {
                        return Ok(None);
                    }
                    if (b & 0x0F) > 9 || (b >> 4) > 9 {
                        return Err(Error::OutOfRange);
                    }
                    value = value * 100 + ((b >> 4) as i64) * 10 + (b & 0x0F) as i64;
                }
                value
            }
            BaseType::Hcd => {
                let mut value: i64 = 0;
                for &b in raw.iter().rev() {
                    if b == 0xFF {
                        return Ok(None);
                    }
                    if b > 99 {
                        return Err(Error::OutOfRange);
                    }
                    value = value * 100 + b as i64;
                }
                value
            }
            BaseType::Pin => {
                let v = u16::from_be_bytes([raw[0], raw[1]]);
                if v == 0xFFFF {
                    return Ok(None);
                }
                for &b in raw {
                    if (b & 0x0F) > 9 || (b >> 4) > 9 {
                        return Err(Error::OutOfRange);
                    }
                }
                ((raw[0] >> 4) as i64) * 1000
                    + ((raw[0] & 0x0F) as i64) * 100
                    + ((raw[1] >> 4) as i64) * 10
                    + (raw[1] & 0x0F) as i64
            }
            _ => return Err(Error::InvalidArg),
        };
        Ok(Some(value))
    }

    fn decode_date(&self, raw: &[u8]) -> Result<FieldValue> {
        let bcd = self.base == BaseType::Bda;
        let (day, month, year) = if raw.len() >= 4 {
            (raw[0], raw[1], raw[3])
        } else {
            (raw[0], raw[1], raw[2])
        };
        if day == 0xFF && month == 0xFF {
            return Ok(FieldValue::Missing);
        }
        let conv = |b: u8| -> Result<u8> {
            if !bcd {
                return Ok(b);
            }
            if (b & 0x0F) > 9 || (b >> 4) > 9 {
                return Err(Error::OutOfRange);
            }
            Ok((b >> 4) * 10 + (b & 0x0F))
        };
        let (day, month, year) = (conv(day)?, conv(month)?, conv(year)?);
        if !(1..=31).contains(&day) || !(1..=12).contains(&month) || year > 99 {
            return Err(Error::OutOfRange);
        }
        Ok(FieldValue::Str(format!("{day:02}.{month:02}.{}", 2000 + year as u16)))
    }

    fn decode_time(&self, raw: &[u8]) -> Result<FieldValue> {
        if self.base == BaseType::Ttm {
            if raw[0] == 0xFF {
                return Ok(FieldValue::Missing);
            }
            let minutes = raw[0] as u16 * 10;
            if minutes > 24 * 60 {
                return Err(Error::OutOfRange);
            }
            return Ok(FieldValue::Str(format!("{:02}:{:02}", minutes / 60, minutes % 60)));
        }
        let bcd = self.base == BaseType::Bti;
        let (h, m, s) = match self.base {
            BaseType::Hti => (raw[0], raw[1], raw[2]),
            _ => (raw[2], raw[1], raw[0]), // bti and vti store seconds first
        };
        if h == 0xFF && m == 0xFF {
            return Ok(FieldValue::Missing);
        }
        let conv = |b: u8| -> Result<u8> {
            if !bcd {
                return Ok(b);
            }
            if (b & 0x0F) > 9 || (b >> 4) > 9 {
                return Err(Error::OutOfRange);
            }
            Ok((b >> 4) * 10 + (b & 0x0F))
        };
        let (h, m, s) = (conv(h)?, conv(m)?, conv(s)?);
        if h > 23 || m > 59 || s > 59 {
            return Err(Error::OutOfRange);
        }
        Ok(FieldValue::Str(format!("{h:02}:{m:02}:{s:02}")))
    }

    /// Encode the input string into raw bytes, `-` producing the sentinel.
    pub fn encode(&self, input: &str) -> Result<Vec<u8>> {
        let input = input.trim();
        // a `*` length takes whatever the input provides
        let len = if self.length != 0 {
            self.byte_length(0)
        } else if matches!(self.base, BaseType::Str | BaseType::Nts | BaseType::Hex) {
            input.len().max(1)
        } else {
            self.base.default_length() as usize
        };
        if input == "-" {
            return Ok(self.replacement_bytes(len));
        }
        match self.base {
            BaseType::Str => {
                let mut out: Vec<u8> = input.bytes().collect();
                if out.len() > len {
                    return Err(Error::OutOfRange);
                }
                out.resize(len, 0x00);
                Ok(out)
            }
            BaseType::Nts => {
                let mut out: Vec<u8> = input.bytes().collect();
                if out.len() > len {
                    return Err(Error::OutOfRange);
                }
                if out.len() < len {
                    out.push(0x00);
                    out.resize(len, 0x00);
                }
                Ok(out)
            }
            BaseType::Hex => {
                let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
                let bytes = hex::decode(cleaned).map_err(|_| Error::InvalidNum)?;
                if self.length != 0 && bytes.len() != len {
                    return Err(Error::OutOfRange);
                }
                Ok(bytes)
            }
            BaseType::Ign => Ok(vec![0x00; len]),
            BaseType::Bda | BaseType::Hda => self.encode_date(input, len),
            BaseType::Bti | BaseType::Hti | BaseType::Vti | BaseType::Ttm => {
                self.encode_time(input, len)
            }
            BaseType::Bdy | BaseType::Hdy => {
                let day = WEEKDAYS
                    .iter()
                    .position(|d| d.eq_ignore_ascii_case(input))
                    .ok_or(Error::InvalidArg)?;
                Ok(vec![if self.base == BaseType::Bdy { day as u8 } else { day as u8 + 1 }])
            }
            BaseType::Bit => {
                let value: u8 = input.parse().map_err(|_| Error::InvalidNum)?;
                if value > 1 {
                    return Err(Error::OutOfRange);
                }
                Ok(vec![value])
            }
            _ => self.encode_numeric(input, len),
        }
    }

    fn encode_numeric(&self, input: &str, len: usize) -> Result<Vec<u8>> {
        let raw: i64 = if let Some(values) = &self.values {
            match values.iter().find(|(_, name)| name.as_str() == input) {
                Some((&raw, _)) => raw,
                None => self.parse_scaled(input)?,
            }
        } else {
            self.parse_scaled(input)?
        };
        self.raw_to_bytes(raw, len)
    }

    fn parse_scaled(&self, input: &str) -> Result<i64> {
        let value: f64 = input.parse().map_err(|_| Error::InvalidNum)?;
        let (divisor, _) = self.combined_divisor();
        Ok((value * divisor).round() as i64)
    }

    fn raw_to_bytes(&self, raw: i64, len: usize) -> Result<Vec<u8>> {
        let check_range = |min: i64, max: i64| -> Result<()> {
            if raw < min || raw > max {
                Err(Error::OutOfRange)
            } else {
                Ok(())
            }
        };
        Ok(match self.base {
            BaseType::Uch | BaseType::D1c => {
                check_range(0, 0xFE)?;
                vec![raw as u8]
            }
            BaseType::Sch | BaseType::D1b => {
                check_range(-127, 127)?;
                vec![raw as i8 as u8]
            }
            BaseType::Uin => {
                check_range(0, 0xFFFE)?;
                (raw as u16).to_le_bytes().to_vec()
            }
            BaseType::Uir => {
                check_range(0, 0xFFFE)?;
                (raw as u16).to_be_bytes().to_vec()
            }
            BaseType::Sin | BaseType::D2b | BaseType::D2c | BaseType::Flt => {
                check_range(-0x7FFF, 0x7FFF)?;
                (raw as i16).to_le_bytes().to_vec()
            }
            BaseType::Sir => {
                check_range(-0x7FFF, 0x7FFF)?;
                (raw as i16).to_be_bytes().to_vec()
            }
            BaseType::Ulg => {
                check_range(0, 0xFFFF_FFFE)?;
                (raw as u32).to_le_bytes().to_vec()
            }
            BaseType::Ulr => {
                check_range(0, 0xFFFF_FFFE)?;
                (raw as u32).to_be_bytes().to_vec()
            }
            BaseType::Slg => {
                check_range(-0x7FFF_FFFF, 0x7FFF_FFFF)?;
                (raw as i32).to_le_bytes().to_vec()
            }
            BaseType::Slr => {
                check_range(-0x7FFF_FFFF, 0x7FFF_FFFF)?;
                (raw as i32).to_be_bytes().to_vec()
            }
            BaseType::Exp => ((raw as f64 / 1000.0) as f32).to_le_bytes().to_vec(),
            BaseType::Bcd => {
                let max: i64 = 10i64.pow(2 * len as u32) - 1;
                check_range(0, max)?;
                let mut out = Vec::with_capacity(len);
                let mut rest = raw;
                for _ in 0..len {
                    let pair = (rest % 100) as u8;
                    out.push(((pair / 10) << 4) | (pair % 10));
                    rest /= 100;
                }
                out
            }
            BaseType::Hcd => {
                let max: i64 = 100i64.pow(len as u32) - 1;
                check_range(0, max)?;
                let mut out = Vec::with_capacity(len);
                let mut rest = raw;
                for _ in 0..len {
                    out.push((rest % 100) as u8);
                    rest /= 100;
                }
                out
            }
            BaseType::Pin => {
                check_range(0, 9999)?;
                let digits = [
                    (raw / 1000 % 10) as u8,
                    (raw / 100 % 10) as u8,
                    (raw / 10 % 10) as u8,
                    (raw % 10) as u8,
                ];
                vec![(digits[0] << 4) | digits[1], (digits[2] << 4) | digits[3]]
            }
            _ => return Err(Error::InvalidArg),
        })
    }

    fn encode_date(&self, input: &str, len: usize) -> Result<Vec<u8>> {
        let parts: Vec<&str> = input.split('.').collect();
        if parts.len() != 3 {
            return Err(Error::InvalidArg);
        }
        let day: u8 = parts[0].parse().map_err(|_| Error::InvalidNum)?;
        let month: u8 = parts[1].parse().map_err(|_| Error::InvalidNum)?;
        let year_full: u16 = parts[2].parse().map_err(|_| Error::InvalidNum)?;
        if !(1..=31).contains(&day) || !(1..=12).contains(&month) || !(2000..=2099).contains(&year_full) {
            return Err(Error::OutOfRange);
        }
        let year = (year_full - 2000) as u8;
        let bcd = self.base == BaseType::Bda;
        let conv = |v: u8| if bcd { ((v / 10) << 4) | (v % 10) } else { v };
        if len >= 4 {
            // the weekday byte between month and year
            let weekday = weekday_of(day, month, year_full);
            Ok(vec![conv(day), conv(month), if bcd { weekday } else { conv(weekday) }, conv(year)])
        } else {
            Ok(vec![conv(day), conv(month), conv(year)])
        }
    }

    fn encode_time(&self, input: &str, len: usize) -> Result<Vec<u8>> {
        let parts: Vec<&str> = input.split(':').collect();
        if self.base == BaseType::Ttm {
            if parts.len() != 2 {
                return Err(Error::InvalidArg);
            }
            let h: u16 = parts[0].parse().map_err(|_| Error::InvalidNum)?;
            let m: u16 = parts[1].parse().map_err(|_| Error::InvalidNum)?;
            if h > 24 || m > 59 || m % 10 != 0 {
                return Err(Error::OutOfRange);
            }
            return Ok(vec![((h * 60 + m) / 10) as u8]);
        }
        if parts.len() != 3 || len < 3 {
            return Err(Error::InvalidArg);
        }
        let h: u8 = parts[0].parse().map_err(|_| Error::InvalidNum)?;
        let m: u8 = parts[1].parse().map_err(|_| Error::InvalidNum)?;
        let s: u8 = parts[2].parse().map_err(|_| Error::InvalidNum)?;
        if h > 23 || m > 59 || s > 59 {
            return Err(Error::OutOfRange);
        }
        let bcd = self.base == BaseType::Bti;
        let conv = |v: u8| if bcd { ((v / 10) << 4) | (v % 10) } else { v };
        Ok(match self.base {
            BaseType::Hti => vec![conv(h), conv(m), conv(s)],
            _ => vec![conv(s), conv(m), conv(h)],
        })
    }

    fn replacement_bytes(&self, len: usize) -> Vec<u8> {
        match self.base {
            BaseType::Sch | BaseType::D1b => vec![0x80],
            BaseType::Sin | BaseType::D2b | BaseType::D2c | BaseType::Flt => vec![0x00, 0x80],
            BaseType::Sir => vec![0x80, 0x00],
            BaseType::Slg => vec![0x00, 0x00, 0x00, 0x80],
            BaseType::Slr => vec![0x80, 0x00, 0x00, 0x00],
            BaseType::Str | BaseType::Nts | BaseType::Ign => vec![0x00; len],
            BaseType::Bda if len >= 4 => vec![0xFF, 0xFF, 0x00, 0xFF],
            _ => vec![0xFF; len],
        }
    }
}

/// Sakamoto's method, Monday-based like the bus weekday types.
fn weekday_of(day: u8, month: u8, year: u16) -> u8 {
    const T: [u16; 12] = [0, 3, 2, 5, 0, 3, 5, 1, 4, 6, 2, 4];
    let y = if month < 3 { year - 1 } else { year };
    let sunday_based =
        (y + y / 4 - y / 100 + y / 400 + T[month as usize - 1] + day as u16) % 7;
    ((sunday_based + 6) % 7) as u8
}

/// Output rendering options for decoded fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputOpts {
    /// Append units and comments.
    pub verbose: bool,
    /// Force the machine value, bypassing value maps.
    pub numeric: bool,
}

/// An ordered list of fields forming the data layout of a message.
#[derive(Debug, Clone, Default)]
pub struct FieldSet {
    pub fields: Vec<SingleField>,
}

impl FieldSet {
    pub fn new(fields: Vec<SingleField>) -> Self {
        FieldSet { fields }
    }

    /// The number of payload bytes the fields of the given part occupy.
    pub fn length(&self, part: PartType) -> usize {
        let mut total = 0usize;
        let mut pending_bits = 0u8;
        for field in self.fields.iter().filter(|f| f.part == part) {
            if field.base == BaseType::Bit {
                if pending_bits == 0 {
                    total += 1;
                }
                pending_bits = (pending_bits + 1) % 8;
            } else {
                pending_bits = 0;
                total += field.byte_length(0);
            }
        }
        total
    }

    /// Iterate the fields of one part together with their byte offsets and
    /// bit positions inside the payload.
    fn layout(&self, part: PartType, payload_len: usize) -> Vec<(usize, u8, &SingleField)> {
        let mut out = Vec::new();
        let mut offset = 0usize;
        let mut bit = 0u8;
        for field in self.fields.iter().filter(|f| f.part == part) {
            if field.base == BaseType::Bit {
                out.push((offset, bit, field));
                bit += 1;
                if bit == 8 {
                    bit = 0;
                    offset += 1;
                }
            } else {
                if bit > 0 {
                    bit = 0;
                    offset += 1;
                }
                out.push((offset, 0, field));
                offset += field.byte_length(payload_len.saturating_sub(offset));
            }
        }
        out
    }

    fn payload<'a>(part: PartType, data: &'a SymbolString, id_extra: usize) -> &'a [u8] {
        // master data starts behind QQ ZZ PB SB NN and the extra ID bytes,
        // slave data behind NN
        let slice = data.as_slice();
        let start = match part {
            PartType::Master => 5 + id_extra,
            PartType::Slave => 1,
        };
        let declared = match part {
            PartType::Master => slice.get(4).copied().unwrap_or(0) as usize + 5,
            PartType::Slave => slice.first().copied().unwrap_or(0) as usize + 1,
        };
        let end = declared.min(slice.len());
        if start >= end {
            &[]
        } else {
            &slice[start..end]
        }
    }

    /// Decode a single field by bit position inside a payload byte.
    fn decode_one(field: &SingleField, payload: &[u8], offset: usize, bit: u8) -> Result<FieldValue> {
        if field.base == BaseType::Bit {
            let byte = payload.get(offset).copied().ok_or(Error::InvalidPos)?;
            return Ok(FieldValue::Num { value: ((byte >> bit) & 0x01) as f64, precision: 0 });
        }
        if offset > payload.len() {
            return Err(Error::InvalidPos);
        }
        field.decode(&payload[offset..])
    }

    /// Decode all fields of the given part to `name=value` text, appending
    /// to `out`. Returns whether anything was written.
    pub fn read(
        &self,
        part: PartType,
        data: &SymbolString,
        id_extra: usize,
        opts: OutputOpts,
        field_name: Option<&str>,
        field_index: i32,
        out: &mut String,
    ) -> Result<bool> {
        let payload = Self::payload(part, data, id_extra);
        let mut found = false;
        let mut name_matches = 0i32;
        for (offset, bit, field) in self.layout(part, payload.len()) {
            if field.base == BaseType::Ign {
                continue;
            }
            if let Some(wanted) = field_name {
                if !field.name.eq_ignore_ascii_case(wanted) {
                    continue;
                }
                if field_index >= 0 && name_matches != field_index {
                    name_matches += 1;
                    continue;
                }
                name_matches += 1;
            }
            let value = if opts.numeric {
                match Self::decode_raw_one(field, payload, offset, bit)? {
                    Some(v) => FieldValue::Num { value: v as f64, precision: 0 },
                    None => FieldValue::Missing,
                }
            } else {
                Self::decode_one(field, payload, offset, bit)?
            };
            if found {
                out.push(';');
            }
            out.push_str(&field.name);
            out.push('=');
            out.push_str(&value.to_string());
            if opts.verbose {
                if !field.unit.is_empty() {
                    out.push(' ');
                    out.push_str(&field.unit);
                }
                if !field.comment.is_empty() {
                    out.push_str(" [");
                    out.push_str(&field.comment);
                    out.push(']');
                }
            }
            found = true;
        }
        Ok(found)
    }

    fn decode_raw_one(
        field: &SingleField,
        payload: &[u8],
        offset: usize,
        bit: u8,
    ) -> Result<Option<i64>> {
        if field.base == BaseType::Bit {
            let byte = payload.get(offset).copied().ok_or(Error::InvalidPos)?;
            return Ok(Some(((byte >> bit) & 0x01) as i64));
        }
        if offset > payload.len() {
            return Err(Error::InvalidPos);
        }
        field.decode_raw(&payload[offset..])
    }

    /// Decode all fields of the given part into a JSON object.
    pub fn read_json(
        &self,
        part: PartType,
        data: &SymbolString,
        id_extra: usize,
        numeric: bool,
        out: &mut serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let payload = Self::payload(part, data, id_extra);
        for (offset, bit, field) in self.layout(part, payload.len()) {
            if field.base == BaseType::Ign {
                continue;
            }
            let value = if numeric {
                match Self::decode_raw_one(field, payload, offset, bit)? {
                    Some(v) => json!(v),
                    None => serde_json::Value::Null,
                }
            } else {
                match Self::decode_one(field, payload, offset, bit)? {
                    FieldValue::Missing => serde_json::Value::Null,
                    FieldValue::Num { value, .. } => json!(value),
                    FieldValue::Str(s) => json!(s),
                }
            };
            out.insert(
                field.name.clone(),
                json!({
                    "value": value,
                    "unit": field.unit,
                    "comment": field.comment,
                }),
            );
        }
        Ok(())
    }

    /// Decode a single numeric field to its raw machine value.
    pub fn read_num(
        &self,
        part: PartType,
        data: &SymbolString,
        id_extra: usize,
        field_name: Option<&str>,
    ) -> Result<Option<i64>> {
        let payload = Self::payload(part, data, id_extra);
        for (offset, bit, field) in self.layout(part, payload.len()) {
            if let Some(wanted) = field_name {
                if !field.name.eq_ignore_ascii_case(wanted) {
                    continue;
                }
            } else if !field.base.is_numeric() {
                continue;
            }
            return Self::decode_raw_one(field, payload, offset, bit);
        }
        Ok(None)
    }

    /// Decode a single field to its display value; `None` takes the first
    /// field.
    pub fn read_field(
        &self,
        part: PartType,
        data: &SymbolString,
        id_extra: usize,
        field_name: Option<&str>,
    ) -> Result<Option<FieldValue>> {
        let payload = Self::payload(part, data, id_extra);
        for (offset, bit, field) in self.layout(part, payload.len()) {
            if field.base == BaseType::Ign {
                continue;
            }
            if field_name.map_or(true, |name| field.name.eq_ignore_ascii_case(name)) {
                return Self::decode_one(field, payload, offset, bit).map(Some);
            }
        }
        Ok(None)
    }

    /// Encode the `;`-separated input values of the given part, appending
    /// the raw bytes to `out`. A trailing variable-length string field
    /// consumes the rest of the input including separators.
    pub fn write(&self, part: PartType, input: &str, out: &mut SymbolString) -> Result<()> {
        let parts: Vec<&str> = input.split(';').collect();
        let mut next_value = 0usize;
        let consuming = self
            .fields
            .iter()
            .filter(|f| f.part == part && f.base != BaseType::Ign)
            .count();
        let mut consumed = 0usize;
        let mut values = std::iter::from_fn(|| {
            consumed += 1;
            if consumed == consuming && next_value < parts.len() {
                let rest = parts[next_value..].join(";");
                next_value = parts.len();
                return Some(rest);
            }
            let value = parts.get(next_value).map(|s| s.to_string());
            next_value += 1;
            value
        });
        let mut bit_byte: Option<u8> = None;
        let mut bit_pos = 0u8;
        for field in self.fields.iter().filter(|f| f.part == part) {
            if field.base == BaseType::Bit {
                let text = values.next().unwrap_or_default();
                let value: u8 = if text.is_empty() || text == "-" {
                    0
                } else {
                    text.trim().parse().map_err(|_| Error::InvalidNum)?
                };
                if value > 1 {
                    return Err(Error::OutOfRange);
                }
                let byte = bit_byte.unwrap_or(0) | (value << bit_pos);
                bit_byte = Some(byte);
                bit_pos += 1;
                if bit_pos == 8 {
                    out.push_back(byte, false, false)?;
                    bit_byte = None;
                    bit_pos = 0;
                }
                continue;
            }
            if let Some(byte) = bit_byte.take() {
                out.push_back(byte, false, false)?;
                bit_pos = 0;
            }
            let text = if field.base == BaseType::Ign {
                "-".to_string()
            } else {
                values.next().unwrap_or_default()
            };
            if text.is_empty() && field.base != BaseType::Ign {
                return Err(Error::Eof);
            }
            for byte in field.encode(&text)? {
                out.push_back(byte, false, false)?;
            }
        }
        if let Some(byte) = bit_byte {
            out.push_back(byte, false, false)?;
        }
        Ok(())
    }

    /// Returns whether a field with the given name (and numeric property)
    /// exists.
    pub fn has_field(&self, name: Option<&str>, numeric: bool) -> bool {
        self.fields.iter().any(|f| {
            name.map_or(true, |n| f.name.eq_ignore_ascii_case(n)) && f.base.is_numeric() == numeric
        })
    }

    /// Dump the field definitions in catalog column order.
    pub fn dump(&self, out: &mut String) {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let part = match field.part {
                PartType::Master => "m",
                PartType::Slave => "s",
            };
            out.push_str(&format!("{},{},{:?}", field.name, part, field.base));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(base: BaseType, length: u8) -> SingleField {
        SingleField {
            name: "x".into(),
            part: PartType::Slave,
            base,
            length,
            divisor: 0,
            unit: String::new(),
            comment: String::new(),
            values: None,
        }
    }

    #[test]
    fn test_d2b_decode() {
        let f = field(BaseType::D2b, 2);
        let v = f.decode(&[0x01, 0x12]).unwrap();
        assert_eq!(v.to_string(), "18.004");
        assert_eq!(f.decode(&[0x00, 0x80]).unwrap(), FieldValue::Missing);
    }

    #[test]
    fn test_d2b_encode_round_trip() {
        let f = field(BaseType::D2b, 2);
        assert_eq!(f.encode("18.004").unwrap(), vec![0x01, 0x12]);
        assert_eq!(f.encode("-").unwrap(), vec![0x00, 0x80]);
    }

    #[test]
    fn test_uin_decode() {
        let f = field(BaseType::Uin, 2);
        let v = f.decode(&[0x26, 0x00]).unwrap();
        assert_eq!(v.to_string(), "38");
        assert_eq!(f.encode("38").unwrap(), vec![0x26, 0x00]);
    }

    #[test]
    fn test_bcd() {
        let f = field(BaseType::Bcd, 1);
        assert_eq!(f.decode(&[0x26]).unwrap().to_string(), "26");
        assert_eq!(f.encode("26").unwrap(), vec![0x26]);
        assert_eq!(f.decode(&[0xFF]).unwrap(), FieldValue::Missing);
        assert_eq!(f.encode("100"), Err(Error::OutOfRange));

        let f4 = field(BaseType::Bcd, 4);
        assert_eq!(f4.encode("1234567").unwrap(), vec![0x67, 0x45, 0x23, 0x01]);
        assert_eq!(f4.decode(&[0x67, 0x45, 0x23, 0x01]).unwrap().to_string(), "1234567");
    }

    #[test]
    fn test_bda_date() {
        let f = field(BaseType::Bda, 4);
        // 26.10.2014 was a Sunday
        assert_eq!(f.decode(&[0x26, 0x10, 0x06, 0x14]).unwrap().to_string(), "26.10.2014");
        assert_eq!(f.encode("26.10.2014").unwrap(), vec![0x26, 0x10, 0x06, 0x14]);
        assert_eq!(f.encode("01.01.2000").unwrap(), vec![0x01, 0x01, 0x05, 0x00]);
        assert_eq!(f.decode(&[0xFF, 0xFF, 0x00, 0xFF]).unwrap(), FieldValue::Missing);
    }

    #[test]
    fn test_bti_time() {
        let f = field(BaseType::Bti, 3);
        assert_eq!(f.decode(&[0x58, 0x04, 0x21]).unwrap().to_string(), "21:04:58");
        assert_eq!(f.encode("21:04:58").unwrap(), vec![0x58, 0x04, 0x21]);
        assert_eq!(f.decode(&[0x60, 0x59, 0x23]), Err(Error::OutOfRange));
    }

    #[test]
    fn test_value_map() {
        let mut f = field(BaseType::Uch, 1);
        let mut values = BTreeMap::new();
        values.insert(0i64, "off".to_string());
        values.insert(1i64, "on".to_string());
        f.values = Some(values);
        assert_eq!(f.decode(&[0x01]).unwrap().to_string(), "on");
        assert_eq!(f.encode("off").unwrap(), vec![0x00]);
    }

    #[test]
    fn test_divisor_and_multiplier() {
        let mut f = field(BaseType::Uch, 1);
        f.divisor = 10;
        assert_eq!(f.decode(&[0x7B]).unwrap().to_string(), "12.3");
        f.divisor = -10;
        assert_eq!(f.decode(&[0x0C]).unwrap().to_string(), "120");
    }

    #[test]
    fn test_field_set_round_trip() {
        let fields = FieldSet::new(vec![
            SingleField {
                name: "flow".into(),
                part: PartType::Slave,
                base: BaseType::D2b,
                length: 2,
                divisor: 0,
                unit: "°C".into(),
                comment: String::new(),
                values: None,
            },
            SingleField {
                name: "rpm".into(),
                part: PartType::Slave,
                base: BaseType::Uin,
                length: 2,
                divisor: 0,
                unit: String::new(),
                comment: String::new(),
                values: None,
            },
        ]);
        let mut slave = SymbolString::new(false);
        slave.parse_hex("0401122600", false).unwrap();
        let mut out = String::new();
        fields
            .read(PartType::Slave, &slave, 0, OutputOpts::default(), None, -1, &mut out)
            .unwrap();
        assert_eq!(out, "flow=18.004;rpm=38");

        let mut encoded = SymbolString::new(false);
        fields.write(PartType::Slave, "18.004;38", &mut encoded).unwrap();
        assert_eq!(encoded.as_slice(), &[0x01, 0x12, 0x26, 0x00]);
    }
}
