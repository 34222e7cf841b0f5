//! Catalog configuration files.
//!
//! Each row of a catalog file declares one message:
//!
//! ```text
//! type,circuit,name,comment,QQ,ZZ,PBSB,ID,field,part,datatype,divisor/values,unit,comment,...
//! ```
//!
//! - `type` is `r` (active read, optionally followed by a poll priority
//!   digit), `w` (active write), `u` (passive), or `uw` (passive write),
//!   optionally prefixed by one or more condition references `[name]`.
//! - `ZZ` may hold several destinations separated by `;`, producing one
//!   message per destination with the circuit suffixed by its index.
//! - `ID` holds further command ID bytes behind PB/SB; a chained message
//!   lists several `;`-separated ID suffixes, each optionally followed by
//!   `:length` for the data bytes of that part.
//! - field groups repeat in sets of six columns; `part` is `m` for master
//!   and `s` for slave data, `datatype` is a base type like `d2b`,
//!   optionally with `:length`, or the name of a template.
//!
//! Rows starting with `#` are comments. Rows starting with `*` declare
//! defaults for a message type. A row with `[name]` alone in the type
//! column declares a condition: `[name],circuit,messagename,[comment],
//! [fieldname],[ZZ],values`.
//!
//! Templates are declared in `_templates.csv` with rows of
//! `name,datatype,divisor/values,unit,comment` and referenced from the
//! `datatype` column of any field group.

use crate::constants::SYN;
use crate::ebus::address::{is_master, is_valid_address};
use crate::error::{Error, Result};
use log::{error, info};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::digit1,
    combinator::{map, opt},
    sequence::preceded,
    IResult,
};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use super::condition::{parse_condition_values, Condition, SimpleCondition};
use super::field::{BaseType, FieldSet, PartType, SingleField};
use super::message::{check_destination_kind, Message};
use super::MessageMap;

/// Named field templates shared between catalog files.
#[derive(Debug, Clone, Default)]
pub struct Templates {
    entries: HashMap<String, SingleField>,
}

impl Templates {
    pub fn new() -> Self {
        Templates::default()
    }

    /// Load template rows from `_templates.csv`.
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path).map_err(|_| Error::NotFound)?;
        let mut count = 0usize;
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let cols: Vec<&str> = line.split(',').map(str::trim).collect();
            if cols.len() < 2 {
                return Err(Error::Eof);
            }
            let name = cols[0].to_lowercase();
            let field = build_field(
                cols[0],
                PartType::Slave,
                cols[1],
                cols.get(2).copied().unwrap_or(""),
                cols.get(3).copied().unwrap_or(""),
                cols.get(4).copied().unwrap_or(""),
                self,
            )
            .map_err(|e| {
                error!("main: template {}:{}: {e}", path.display(), line_no + 1);
                e
            })?;
            self.entries.insert(name, field);
            count += 1;
        }
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<&SingleField> {
        self.entries.get(&name.to_lowercase())
    }
}

/// `datatype[:length]` with `*` for the remainder of the payload.
fn parse_type_spec(input: &str) -> IResult<&str, (&str, Option<u8>)> {
    let (rest, name) = take_while1(|c: char| c.is_ascii_alphanumeric())(input)?;
    let (rest, length) = opt(preceded(
        tag(":"),
        alt((
            map(tag("*"), |_| 0u8),
            map(digit1, |d: &str| d.parse::<u8>().unwrap_or(0)),
        )),
    ))(rest)?;
    Ok((rest, (name, length)))
}

/// `value=name` pairs separated by `;`.
fn parse_value_map(input: &str) -> Result<BTreeMap<i64, String>> {
    let mut out = BTreeMap::new();
    for pair in input.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (raw, name) = pair.split_once('=').ok_or(Error::InvalidList)?;
        let raw: i64 = raw.trim().parse().map_err(|_| Error::InvalidNum)?;
        out.insert(raw, name.trim().to_string());
    }
    if out.is_empty() {
        return Err(Error::InvalidList);
    }
    Ok(out)
}

/// Build one field from its catalog columns, resolving template references.
fn build_field(
    name: &str,
    part: PartType,
    type_spec: &str,
    divisor_or_values: &str,
    unit: &str,
    comment: &str,
    templates: &Templates,
) -> Result<SingleField> {
    let (rest, (type_name, length)) =
        parse_type_spec(type_spec.trim()).map_err(|_| Error::InvalidArg)?;
    if !rest.is_empty() {
        return Err(Error::InvalidArg);
    }
    let base = match BaseType::parse(&type_name.to_lowercase()) {
        Some(base) => base,
        None => {
            let template = templates.get(type_name).ok_or(Error::NotFound)?;
            let mut field = template.clone();
            if !name.is_empty() {
                field.name = name.to_string();
            }
            field.part = part;
            if !unit.is_empty() {
                field.unit = unit.to_string();
            }
            if !comment.is_empty() {
                field.comment = comment.to_string();
            }
            if !divisor_or_values.is_empty() {
                apply_divisor_or_values(&mut field, divisor_or_values)?;
            }
            return Ok(field);
        }
    };
    let length = match length {
        Some(len) => {
            if !base.has_variable_length() && len != base.default_length() {
                return Err(Error::OutOfRange);
            }
            len
        }
        None => base.default_length(),
    };
    if base.has_variable_length() && length > 16 && base != BaseType::Str && base != BaseType::Nts
        && base != BaseType::Hex && base != BaseType::Ign
    {
        return Err(Error::OutOfRange);
    }
    let mut field = SingleField {
        name: name.to_string(),
        part,
        base,
        length,
        divisor: 0,
        unit: unit.to_string(),
        comment: comment.to_string(),
        values: None,
    };
    if !divisor_or_values.is_empty() {
        apply_divisor_or_values(&mut field, divisor_or_values)?;
    }
    Ok(field)
}

fn apply_divisor_or_values(field: &mut SingleField, input: &str) -> Result<()> {
    if input.contains('=') {
        field.values = Some(parse_value_map(input)?);
    } else {
        field.divisor = input.trim().parse().map_err(|_| Error::InvalidNum)?;
    }
    Ok(())
}

/// Parse an ID part: hex digits, optionally separated by spaces.
pub fn parse_id(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return Ok(Vec::new());
    }
    if cleaned.len() % 2 != 0 {
        return Err(Error::InvalidArg);
    }
    hex::decode(&cleaned).map_err(|_| Error::InvalidNum)
}

/// Per-file loading state: defaults by type name and the file-scoped
/// condition keys.
struct FileContext<'a> {
    filename: String,
    defaults: HashMap<String, Vec<String>>,
    templates: &'a Templates,
}

impl FileContext<'_> {
    fn default_for(&self, type_name: &str, pos: usize, value: &str) -> String {
        if !value.is_empty() {
            return value.to_string();
        }
        self.defaults
            .get(type_name)
            .and_then(|row| row.get(pos))
            .cloned()
            .unwrap_or_default()
    }
}

/// Load one catalog file into the map. Returns the number of messages added.
pub fn load_file(map: &mut MessageMap, templates: &Templates, path: &Path) -> Result<usize> {
    let content = std::fs::read_to_string(path).map_err(|_| Error::NotFound)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut ctx = FileContext { filename, defaults: HashMap::new(), templates };
    let mut count = 0usize;
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cols: Vec<String> = line.split(',').map(|c| c.trim().to_string()).collect();
        match load_row(map, &mut ctx, &cols) {
            Ok(added) => count += added,
            Err(e) => {
                error!("main: {}:{}: {e}", path.display(), line_no + 1);
                return Err(e);
            }
        }
    }
    Ok(count)
}

fn load_row(map: &mut MessageMap, ctx: &mut FileContext, cols: &[String]) -> Result<usize> {
    let type_col = cols.first().map(String::as_str).unwrap_or("");

    if let Some(rest) = type_col.strip_prefix('*') {
        // defaults row for the given type name
        let mut row: Vec<String> = cols.to_vec();
        row[0] = rest.to_string();
        ctx.defaults.insert(rest.to_string(), row);
        return Ok(0);
    }

    if type_col.starts_with('[') && type_col.ends_with(']') {
        // condition definition row
        let name = &type_col[1..type_col.len() - 1];
        let condition = parse_condition_row(name, cols)?;
        map.add_condition(
            format!("{}:{}", ctx.filename, name),
            Arc::new(Condition::Simple(condition)),
        )?;
        return Ok(0);
    }

    // optional condition references before the type
    let (condition, type_str) = parse_condition_refs(map, ctx, type_col)?;
    parse_message_row(map, ctx, condition, type_str, cols)
}

fn parse_condition_row(name: &str, cols: &[String]) -> Result<SimpleCondition> {
    // [name],circuit,messagename,[comment],[fieldname],[ZZ],values
    let circuit = cols.get(1).map(String::as_str).unwrap_or("");
    let message_name = cols.get(2).map(String::as_str).unwrap_or("");
    let field = cols.get(4).map(String::as_str).unwrap_or("");
    let zz = cols.get(5).map(String::as_str).unwrap_or("");
    let dst_address = if zz.is_empty() {
        None
    } else {
        let dst = u8::from_str_radix(zz, 16).map_err(|_| Error::InvalidNum)?;
        if !is_valid_address(dst, false) {
            return Err(Error::InvalidAddr);
        }
        Some(dst)
    };
    if message_name.is_empty() {
        // scan message reference requires a concrete slave
        match dst_address {
            Some(dst) if !is_master(dst) => {}
            _ => return Err(Error::InvalidAddr),
        }
    }
    let values = parse_condition_values(cols.get(6).map(String::as_str).unwrap_or(""))?;
    Ok(SimpleCondition::new(name, circuit, message_name, dst_address, field, values))
}

fn parse_condition_refs<'a>(
    map: &mut MessageMap,
    ctx: &FileContext,
    type_col: &'a str,
) -> Result<(Option<Arc<Condition>>, &'a str)> {
    let mut rest = type_col;
    let mut parts: Vec<Arc<Condition>> = Vec::new();
    while rest.starts_with('[') {
        let end = rest.find(']').ok_or(Error::InvalidArg)?;
        let name = &rest[1..end];
        let key = format!("{}:{}", ctx.filename, name);
        let condition = match map.get_condition(&key) {
            Some(condition) => condition,
            None => {
                // on-the-fly derivation: [name=value] or [name>=value]
                let pos = name.find(['=', '<', '>']).ok_or(Error::NotFound)?;
                let base_key = format!("{}:{}", ctx.filename, &name[..pos]);
                let base = map.get_condition(&base_key).ok_or(Error::NotFound)?;
                let Condition::Simple(simple) = base.as_ref() else {
                    return Err(Error::InvalidArg);
                };
                let derived = Arc::new(Condition::Simple(simple.derive(&name[pos..])?));
                map.add_condition(key, derived.clone())?;
                derived
            }
        };
        parts.push(condition);
        rest = &rest[end + 1..];
    }
    let condition = match parts.len() {
        0 => None,
        1 => Some(parts.remove(0)),
        _ => Some(Arc::new(Condition::Combined(parts))),
    };
    Ok((condition, rest))
}

#[allow(clippy::too_many_arguments)]
fn parse_message_row(
    map: &mut MessageMap,
    ctx: &FileContext,
    condition: Option<Arc<Condition>>,
    type_str: &str,
    cols: &[String],
) -> Result<usize> {
    if cols.len() < 3 {
        return Err(Error::Eof);
    }
    let mut is_write = false;
    let mut is_passive = false;
    let mut poll_priority = 0u8;
    let type_str = if type_str.is_empty() { "r" } else { type_str };
    let mut default_name = type_str.to_string();
    match type_str.chars().next().unwrap().to_ascii_lowercase() {
        'r' => {
            if let Some(digit) = type_str.chars().nth(1).and_then(|c| c.to_digit(10)) {
                poll_priority = digit as u8;
                default_name.remove(1);
            }
        }
        'w' => is_write = true,
        _ => {
            is_passive = true;
            is_write = type_str.chars().nth(1).is_some_and(|c| c.eq_ignore_ascii_case(&'w'));
        }
    }

    let get = |pos: usize| cols.get(pos).map(String::as_str).unwrap_or("");
    let circuit = ctx.default_for(&default_name, 1, get(1));
    let name = get(2).to_string();
    if name.is_empty() {
        return Err(Error::InvalidArg);
    }
    let comment = ctx.default_for(&default_name, 3, get(3));

    let src_str = ctx.default_for(&default_name, 4, get(4));
    let src_address = if src_str.is_empty() {
        SYN
    } else {
        let src = u8::from_str_radix(&src_str, 16).map_err(|_| Error::InvalidNum)?;
        if !is_master(src) {
            return Err(Error::InvalidAddr);
        }
        src
    };

    let dst_str = ctx.default_for(&default_name, 5, get(5));
    let mut dst_addresses = Vec::new();
    let mut broadcast_or_master = false;
    if dst_str.is_empty() {
        dst_addresses.push(SYN);
    } else {
        for (i, token) in dst_str.split(';').enumerate() {
            let dst = u8::from_str_radix(token.trim(), 16).map_err(|_| Error::InvalidNum)?;
            if !is_valid_address(dst, true) {
                return Err(Error::InvalidAddr);
            }
            let this_kind = dst == crate::constants::BROADCAST || is_master(dst);
            if i == 0 {
                broadcast_or_master = this_kind;
            } else if broadcast_or_master != this_kind {
                return Err(Error::InvalidAddr);
            }
            dst_addresses.push(dst);
        }
    }

    let pbsb_str = ctx.default_for(&default_name, 6, get(6));
    let id = parse_id(&pbsb_str)?;
    if id.len() != 2 {
        return Err(Error::InvalidArg);
    }

    // the ID column may declare a chain of parts with per-part lengths
    let id_col = ctx.default_for(&default_name, 7, get(7));
    let mut chain_ids: Vec<Vec<u8>> = Vec::new();
    let mut chain_lengths: Vec<u8> = Vec::new();
    let mut prefix_len = id.len();
    for (i, token) in id_col.split(';').enumerate() {
        let token = token.trim();
        if token.is_empty() && i > 0 {
            continue;
        }
        let (id_part, length) = match token.split_once(':') {
            Some((id_part, len)) => {
                let len: u8 = len.trim().parse().map_err(|_| Error::InvalidNum)?;
                (id_part, len)
            }
            None => (token, crate::constants::MAX_DATA_LEN as u8),
        };
        let mut full = id.clone();
        full.extend(parse_id(id_part)?);
        if let Some(first) = chain_ids.first() {
            if full.len() != first.len() {
                return Err(Error::InvalidList);
            }
            // the shared prefix shrinks to the common leading bytes
            for pos in id.len()..prefix_len {
                if full[pos] != first[pos] {
                    prefix_len = pos;
                    break;
                }
            }
        } else {
            prefix_len = full.len();
        }
        chain_ids.push(full);
        chain_lengths.push(length);
    }
    if chain_ids.is_empty() {
        chain_ids.push(id.clone());
        chain_lengths.push(crate::constants::MAX_DATA_LEN as u8);
    }
    if chain_ids.len() > 1 && is_passive {
        return Err(Error::InvalidList);
    }

    // remaining columns are field groups of six
    let mut fields = Vec::new();
    let mut pos = 8;
    while pos < cols.len() {
        let field_name = get(pos);
        let type_spec = get(pos + 2);
        if field_name.is_empty() && type_spec.is_empty() {
            break;
        }
        let part = match get(pos + 1).to_lowercase().as_str() {
            "m" => PartType::Master,
            "s" | "" => {
                if broadcast_or_master {
                    PartType::Master
                } else {
                    PartType::Slave
                }
            }
            _ => return Err(Error::InvalidArg),
        };
        let field = build_field(
            field_name,
            part,
            type_spec,
            get(pos + 3),
            get(pos + 4),
            get(pos + 5),
            ctx.templates,
        )?;
        fields.push(field);
        pos += 6;
    }
    let data = Arc::new(FieldSet::new(fields));

    let mut added = 0usize;
    let multiple = dst_addresses.len() > 1;
    for (index, dst_address) in dst_addresses.iter().enumerate() {
        check_destination_kind(*dst_address, &data)?;
        let use_circuit = if multiple { format!("{circuit}.{index}") } else { circuit.clone() };
        let message = if chain_ids.len() > 1 {
            let base_id = chain_ids[0][..prefix_len].to_vec();
            Message::new_chained(
                &use_circuit,
                &name,
                is_write,
                &comment,
                src_address,
                *dst_address,
                base_id,
                chain_ids.clone(),
                chain_lengths.clone(),
                data.clone(),
                poll_priority,
                condition.clone(),
            )
        } else {
            Message::new(
                &use_circuit,
                &name,
                is_write,
                is_passive,
                &comment,
                src_address,
                *dst_address,
                chain_ids[0].clone(),
                data.clone(),
                poll_priority,
                condition.clone(),
            )
        };
        map.add(message, true)?;
        added += 1;
    }
    Ok(added)
}

/// Load all catalog files of a directory: `_templates.csv` first, then
/// every other `*.csv` in name order. Returns the total message count.
pub fn load_config_dir(map: &mut MessageMap, dir: &Path) -> Result<usize> {
    let mut templates = Templates::new();
    let template_path = dir.join("_templates.csv");
    if template_path.exists() {
        let count = templates.load_file(&template_path)?;
        info!("main: read templates {} ({count} entries)", template_path.display());
    }
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(|_| Error::NotFound)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension().is_some_and(|e| e == "csv")
                && p.file_name().is_some_and(|n| n != "_templates.csv")
        })
        .collect();
    paths.sort();
    let mut total = 0usize;
    for path in paths {
        let count = load_file(map, &templates, &path)?;
        info!("main: read file {} ({count} messages)", path.display());
        total += count;
    }
    map.resolve_conditions()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_str(map: &mut MessageMap, content: &str) -> Result<usize> {
        let dir = std::env::temp_dir().join(format!("ebus-rs-test-{:x}", rand_suffix(content)));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.csv");
        std::fs::write(&path, content).unwrap();
        let templates = Templates::new();
        let result = load_file(map, &templates, &path);
        let _ = std::fs::remove_dir_all(&dir);
        result
    }

    fn rand_suffix(content: &str) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        content.hash(&mut hasher);
        std::process::id().hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_load_simple_read() {
        let mut map = MessageMap::new(false);
        let count = load_str(
            &mut map,
            "r,main,Flow,flow temperature,,08,b509,0d0000,temp,s,d2b,,°C,temperature\n",
        )
        .unwrap();
        assert_eq!(count, 1);
        let message = map.find_by_name("main", "flow", false, false).unwrap();
        assert_eq!(message.dst_address(), 0x08);
        assert_eq!(message.id(), &[0xB5, 0x09, 0x0D, 0x00, 0x00]);
    }

    #[test]
    fn test_load_poll_priority() {
        let mut map = MessageMap::new(false);
        load_str(&mut map, "r2,main,Flow,,,08,b509,0d0000,temp,s,d2b,,,\n").unwrap();
        let message = map.find_by_name("main", "flow", false, false).unwrap();
        assert_eq!(message.poll_priority(), 2);
        assert_eq!(map.size_poll(), 1);
    }

    #[test]
    fn test_load_chain() {
        let mut map = MessageMap::new(false);
        load_str(&mut map, "r,main,Errors,,,08,b509,05;06,list,s,hex:*,,,\n").unwrap();
        let message = map.find_by_name("main", "errors", false, false).unwrap();
        assert_eq!(message.count(), 2);
        assert_eq!(message.chain().unwrap().ids[0], vec![0xB5, 0x09, 0x05]);
        assert_eq!(message.chain().unwrap().ids[1], vec![0xB5, 0x09, 0x06]);
    }

    #[test]
    fn test_load_condition() {
        let mut map = MessageMap::new(false);
        let content = "\
r,main,Mode,,,08,b509,0d0100,mode,s,uch,,,\n\
[hasmode],main,Mode,,mode,,1;2\n\
[hasmode]r,main,Extra,,,08,b509,0d0200,x,s,uch,,,\n";
        load_str(&mut map, content).unwrap();
        let message = map.find_by_name("main", "extra", false, false).unwrap();
        assert!(message.is_conditional());
        assert_eq!(map.size_conditions(), 1);
    }

    #[test]
    fn test_load_value_list() {
        let mut map = MessageMap::new(false);
        load_str(&mut map, "r,main,State,,,08,b509,0d0300,state,s,uch,0=off;1=on,,\n").unwrap();
        let message = map.find_by_name("main", "state", false, false).unwrap();
        let field = &message.data().fields[0];
        assert_eq!(field.values.as_ref().unwrap().get(&1), Some(&"on".to_string()));
    }

    #[test]
    fn test_defaults_row() {
        let mut map = MessageMap::new(false);
        let content = "\
*r,boiler,,,,08,b509,\n\
r,,Flow,,,,,0d0000,temp,s,d2b,,,\n";
        load_str(&mut map, content).unwrap();
        let message = map.find_by_name("boiler", "flow", false, false).unwrap();
        assert_eq!(message.dst_address(), 0x08);
        assert_eq!(message.primary_command(), 0xB5);
    }
}
