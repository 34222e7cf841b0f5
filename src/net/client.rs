//! The text command protocol.
//!
//! Each client connection sends one command per line; the reply is the
//! result text terminated by an empty line. Commands are case-insensitive;
//! unknown commands yield an error text without affecting the engine.

use crate::catalog::csv;
use crate::catalog::field::{OutputOpts, PartType};
use crate::catalog::MessageMap;
use crate::constants::SYN;
use crate::ebus::address::{is_master, master_number};
use crate::ebus::device::RawControl;
use crate::ebus::handler::BusHandler;
use crate::ebus::symbol::SymbolString;
use crate::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Everything a connection thread needs to execute commands.
#[derive(Clone)]
pub struct CommandContext {
    pub handler: Arc<BusHandler>,
    pub raw: Arc<RawControl>,
    pub enable_hex: bool,
    pub config_path: Option<PathBuf>,
    pub shutdown: Arc<AtomicBool>,
}

/// What the server loop should do after a command.
pub enum Outcome {
    /// Send the reply and read the next command.
    Text(String),
    /// Send the reply and close the connection.
    Quit(String),
    /// Send the reply and start streaming updates.
    ListenStart(String),
    /// Send the reply and stop streaming updates.
    ListenStop(String),
}

/// Execute a single command line.
pub fn execute(ctx: &CommandContext, line: &str) -> Outcome {
    let args: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = args.first() else {
        return Outcome::Text(String::new());
    };
    let args = &args[1..];
    let upper = command.to_ascii_uppercase();
    match upper.as_str() {
        "R" | "READ" => Outcome::Text(execute_read(ctx, args)),
        "W" | "WRITE" => Outcome::Text(execute_write(ctx, args)),
        "HEX" => {
            if ctx.enable_hex {
                Outcome::Text(execute_hex(ctx, args))
            } else {
                Outcome::Text("ERR: command not enabled".to_string())
            }
        }
        "F" | "FIND" => Outcome::Text(execute_find(ctx, args)),
        "L" | "LISTEN" => {
            if args.first().is_some_and(|a| a.eq_ignore_ascii_case("stop")) {
                Outcome::ListenStop("listen stopped".to_string())
            } else {
                Outcome::ListenStart("listen started".to_string())
            }
        }
        "S" | "STATE" => Outcome::Text(execute_state(ctx)),
        "I" | "INFO" => Outcome::Text(execute_info(ctx)),
        "G" | "GRAB" => Outcome::Text(execute_grab(ctx, args)),
        "SCAN" => Outcome::Text(execute_scan(ctx, args)),
        "LOG" => Outcome::Text(execute_log(args)),
        "RAW" => {
            let enable = !ctx.raw.log_raw();
            ctx.raw.set_log_raw(enable);
            Outcome::Text(format!("raw output {}", if enable { "enabled" } else { "disabled" }))
        }
        "DUMP" => {
            let enable = !ctx.raw.dump_raw();
            ctx.raw.set_dump_raw(enable);
            Outcome::Text(format!("dump {}", if enable { "enabled" } else { "disabled" }))
        }
        "RELOAD" => Outcome::Text(execute_reload(ctx)),
        "STOP" => {
            ctx.shutdown.store(true, Ordering::Relaxed);
            ctx.handler.stop();
            Outcome::Quit("daemon stopping".to_string())
        }
        "Q" | "QUIT" => Outcome::Quit("connection closed".to_string()),
        _ => Outcome::Text("ERR: command not found".to_string()),
    }
}

fn err_text(e: Error) -> String {
    e.to_string()
}

fn parse_hex_addr(input: &str) -> Result<u8, Error> {
    u8::from_str_radix(input, 16).map_err(|_| Error::InvalidNum)
}

/// Split `FIELD` or `FIELD.N` into name and index.
fn parse_field_spec(input: &str) -> (Option<String>, i32) {
    match input.rsplit_once('.') {
        Some((name, index)) => match index.parse::<i32>() {
            Ok(index) => (Some(name.to_string()), index),
            Err(_) => (Some(input.to_string()), -1),
        },
        None => (Some(input.to_string()), -1),
    }
}

fn is_fresh(message: &crate::catalog::message::Message, max_age: u64) -> bool {
    match message.last_update() {
        None => false,
        Some(at) => {
            if message.is_passive() {
                return true;
            }
            SystemTime::now()
                .duration_since(at)
                .map_or(false, |elapsed| elapsed <= Duration::from_secs(max_age))
        }
    }
}

fn execute_read(ctx: &CommandContext, args: &[&str]) -> String {
    let mut force = false;
    let mut max_age: u64 = 5 * 60;
    let mut circuit = String::new();
    let mut dst_address: Option<u8> = None;
    let mut poll_priority: Option<u8> = None;
    let mut verbose = false;
    let mut numeric = false;
    let mut input = String::new();
    let mut pos = 0usize;
    while pos < args.len() {
        match args[pos] {
            "-f" => force = true,
            "-v" => verbose = true,
            "-n" => numeric = true,
            "-m" => {
                pos += 1;
                let Some(value) = args.get(pos).and_then(|a| a.parse().ok()) else {
                    return err_text(Error::InvalidNum);
                };
                max_age = value;
            }
            "-c" => {
                pos += 1;
                let Some(value) = args.get(pos) else {
                    return err_text(Error::InvalidArg);
                };
                circuit = value.to_string();
            }
            "-d" => {
                pos += 1;
                let Some(value) = args.get(pos).and_then(|a| parse_hex_addr(a).ok()) else {
                    return err_text(Error::InvalidAddr);
                };
                dst_address = Some(value);
            }
            "-p" => {
                pos += 1;
                let Some(value) = args.get(pos).and_then(|a| a.parse().ok()) else {
                    return err_text(Error::InvalidNum);
                };
                poll_priority = Some(value);
            }
            "-i" => {
                pos += 1;
                let Some(value) = args.get(pos) else {
                    return err_text(Error::InvalidArg);
                };
                input = value.to_string();
            }
            "-h" => {
                return execute_hex_read(ctx, &args[pos + 1..]);
            }
            _ => break,
        }
        pos += 1;
    }
    let Some(&name) = args.get(pos) else {
        return err_text(Error::InvalidArg);
    };
    let (field_name, field_index) = match args.get(pos + 1) {
        Some(&spec) => parse_field_spec(spec),
        None => (None, -1),
    };

    let message = {
        let map = ctx.handler.messages().read().unwrap();
        map.find_by_name(&circuit, name, false, false)
            .or_else(|| map.find_by_name(&circuit, name, false, true))
    };
    let Some(message) = message else {
        return err_text(Error::NotFound);
    };
    if let Some(priority) = poll_priority {
        if message.set_poll_priority(priority) {
            let map = ctx.handler.messages().read().unwrap();
            map.add_poll_message(&message, false);
        }
    }
    let opts = OutputOpts { verbose, numeric };
    if (!force && max_age > 0 && is_fresh(&message, max_age)) || message.is_passive() {
        if message.last_update().is_none() {
            return err_text(Error::NotFound);
        }
        return match message.decode_last_data(opts, field_name.as_deref(), field_index) {
            Ok(data) => data,
            Err(e) => err_text(e),
        };
    }

    // active read, chained messages need one transaction per part
    for index in 0..message.count() {
        let master = match message.prepare_master(
            ctx.handler.cfg.own_master,
            &input,
            dst_address,
            index,
        ) {
            Ok(master) => master,
            Err(e) => return err_text(e),
        };
        let (result, slave) = ctx.handler.send_and_wait(&master);
        if let Err(e) = result {
            return err_text(e);
        }
        if let Err(e) = message.store_last_data(PartType::Slave, &slave, index) {
            return err_text(e);
        }
    }
    match message.decode_last_data(opts, field_name.as_deref(), field_index) {
        Ok(data) => data,
        Err(e) => err_text(e),
    }
}

fn execute_hex_read(ctx: &CommandContext, args: &[&str]) -> String {
    execute_hex(ctx, args)
}

fn execute_hex(ctx: &CommandContext, args: &[&str]) -> String {
    let Some(&hex_input) = args.first() else {
        return err_text(Error::InvalidArg);
    };
    let mut master = SymbolString::new(true);
    let own = format!("{:02x}", ctx.handler.cfg.own_master);
    if let Err(e) = master.parse_hex(&format!("{own}{hex_input}"), false) {
        return err_text(e);
    }
    // QQ ZZ PB SB NN data CRC
    let mut unescaped = SymbolString::new(false);
    for i in 0..master.len() {
        let _ = unescaped.push_back(master.at(i), true, false);
    }
    if unescaped.len() < 6 || unescaped.at(4) as usize != unescaped.len() - 6 {
        return err_text(Error::InvalidArg);
    }
    let (result, slave) = ctx.handler.send_and_wait(&master);
    match result {
        Ok(()) => {
            if slave.is_empty() {
                "done".to_string()
            } else {
                slave.data_str(true, true)
            }
        }
        Err(e) => err_text(e),
    }
}

fn execute_write(ctx: &CommandContext, args: &[&str]) -> String {
    let mut circuit = String::new();
    let mut dst_address: Option<u8> = None;
    let mut pos = 0usize;
    while pos < args.len() {
        match args[pos] {
            "-h" => {
                if !ctx.enable_hex {
                    return "ERR: command not enabled".to_string();
                }
                return execute_hex(ctx, &args[pos + 1..]);
            }
            "-c" => {
                pos += 1;
                let Some(value) = args.get(pos) else {
                    return err_text(Error::InvalidArg);
                };
                circuit = value.to_string();
            }
            "-d" => {
                pos += 1;
                let Some(value) = args.get(pos).and_then(|a| parse_hex_addr(a).ok()) else {
                    return err_text(Error::InvalidAddr);
                };
                dst_address = Some(value);
            }
            _ => break,
        }
        pos += 1;
    }
    let Some(&name) = args.get(pos) else {
        return err_text(Error::InvalidArg);
    };
    let input = args.get(pos + 1).copied().unwrap_or("");

    let message = {
        let map = ctx.handler.messages().read().unwrap();
        map.find_by_name(&circuit, name, true, false)
    };
    let Some(message) = message else {
        return err_text(Error::NotFound);
    };
    let dst = dst_address.unwrap_or(message.dst_address());
    let slave_dst = dst != crate::constants::BROADCAST && !is_master(dst);
    for index in 0..message.count() {
        let master = match message.prepare_master(
            ctx.handler.cfg.own_master,
            input,
            dst_address,
            index,
        ) {
            Ok(master) => master,
            Err(e) => return err_text(e),
        };
        let (result, slave) = ctx.handler.send_and_wait(&master);
        if let Err(e) = result {
            return err_text(e);
        }
        if slave_dst {
            if let Err(e) = message.store_last_data(PartType::Slave, &slave, index) {
                return err_text(e);
            }
        }
    }
    if !slave_dst {
        return "done".to_string();
    }
    match message.decode_last_data(OutputOpts::default(), None, -1) {
        Ok(data) if !data.is_empty() => data,
        _ => "done".to_string(),
    }
}

fn execute_find(ctx: &CommandContext, args: &[&str]) -> String {
    let mut with_read = true;
    let mut with_write = true;
    let mut with_passive = true;
    let mut full = false;
    let mut exact = false;
    let mut circuit = String::new();
    let mut pos = 0usize;
    while pos < args.len() {
        match args[pos] {
            "-r" => {
                with_write = false;
                with_passive = false;
            }
            "-w" => {
                with_read = false;
                with_passive = false;
            }
            "-p" => {
                with_read = false;
                with_write = false;
            }
            "-f" => full = true,
            "-e" => exact = true,
            "-c" => {
                pos += 1;
                let Some(value) = args.get(pos) else {
                    return err_text(Error::InvalidArg);
                };
                circuit = value.to_string();
            }
            _ => break,
        }
        pos += 1;
    }
    let name = args.get(pos).copied().unwrap_or("");

    let map = ctx.handler.messages().read().unwrap();
    let messages = map.find_all(&circuit, name, exact, with_read, with_write, with_passive);
    if messages.is_empty() {
        return err_text(Error::NotFound);
    }
    let mut out = String::new();
    for message in messages {
        if !out.is_empty() {
            out.push('\n');
        }
        if full {
            out.push_str(&message.dump());
            continue;
        }
        out.push_str(&format!("{} {}", message.circuit(), message.name()));
        if message.last_update().is_some() {
            match message.decode_last_data(OutputOpts::default(), None, -1) {
                Ok(data) => out.push_str(&format!(" = {data}")),
                Err(e) => out.push_str(&format!(" = {e}")),
            }
        } else {
            out.push_str(" = no data stored");
        }
    }
    out
}

fn execute_state(ctx: &CommandContext) -> String {
    if ctx.handler.has_signal() {
        format!(
            "signal acquired, {} symbols/sec ({} max), {} masters",
            ctx.handler.symbol_rate(),
            ctx.handler.max_symbol_rate(),
            ctx.handler.master_count()
        )
    } else {
        "no signal".to_string()
    }
}

fn execute_info(ctx: &CommandContext) -> String {
    let mut out = String::new();
    out.push_str(&format!("version: ebus-rs {}\n", env!("CARGO_PKG_VERSION")));
    out.push_str(&format!("time: {}\n", chrono::Local::now().format("%d.%m.%Y %H:%M:%S")));
    out.push_str(&format!(
        "signal: {}\n",
        if ctx.handler.has_signal() { "acquired" } else { "no signal" }
    ));
    out.push_str(&format!("symbol rate: {}\n", ctx.handler.symbol_rate()));
    out.push_str(&format!("max symbol rate: {}\n", ctx.handler.max_symbol_rate()));
    let own = ctx.handler.cfg.own_master;
    out.push_str(&format!(
        "address: {own:02x} master #{}{}\n",
        master_number(own),
        if ctx.handler.cfg.answer { ", answering" } else { "" }
    ));
    out.push_str(&format!("masters: {}\n", ctx.handler.master_count()));
    {
        let map = ctx.handler.messages().read().unwrap();
        out.push_str(&format!("messages: {}\n", map.size()));
        out.push_str(&format!("conditional: {}\n", map.size_conditional()));
        out.push_str(&format!("poll: {}\n", map.size_poll()));
    }
    out.push_str(&ctx.handler.format_seen_info());
    out
}

fn execute_grab(ctx: &CommandContext, args: &[&str]) -> String {
    match args.first().map(|a| a.to_ascii_lowercase()).as_deref() {
        None => {
            ctx.handler.enable_grab(true, false);
            "grab started".to_string()
        }
        Some("all") => {
            ctx.handler.enable_grab(true, true);
            "grab all started".to_string()
        }
        Some("stop") => {
            ctx.handler.enable_grab(false, false);
            "grab stopped".to_string()
        }
        Some("result") => ctx.handler.format_grab_result(),
        Some(_) => err_text(Error::InvalidArg),
    }
}

fn execute_scan(ctx: &CommandContext, args: &[&str]) -> String {
    match args.first().map(|a| a.to_ascii_lowercase()).as_deref() {
        None => match ctx.handler.start_scan(false) {
            Ok(()) => "scan initiated".to_string(),
            Err(Error::Eof) => "empty".to_string(),
            Err(e) => err_text(e),
        },
        Some("full") => match ctx.handler.start_scan(true) {
            Ok(()) => "scan initiated".to_string(),
            Err(Error::Eof) => "empty".to_string(),
            Err(e) => err_text(e),
        },
        Some("result") => ctx.handler.format_scan_result(),
        Some(addr) => {
            let Ok(dst_address) = u8::from_str_radix(addr, 16) else {
                return err_text(Error::InvalidNum);
            };
            match ctx.handler.scan_and_wait(dst_address) {
                Ok(()) => {
                    let map = ctx.handler.messages().read().unwrap();
                    let Some(message) = map.scan_message_for(dst_address) else {
                        return err_text(Error::NotFound);
                    };
                    match message.decode_last_data(OutputOpts::default(), None, -1) {
                        Ok(data) => format!("{dst_address:02x}{data}"),
                        Err(e) => err_text(e),
                    }
                }
                Err(e) => err_text(e),
            }
        }
    }
}

fn execute_log(args: &[&str]) -> String {
    match args.first().map(|a| a.to_ascii_lowercase()).as_deref() {
        None => format!("log level: {}", log::max_level()),
        Some(level) => {
            let filter = match level {
                "error" => log::LevelFilter::Error,
                "warn" => log::LevelFilter::Warn,
                "notice" | "info" => log::LevelFilter::Info,
                "debug" => log::LevelFilter::Debug,
                "trace" => log::LevelFilter::Trace,
                _ => return err_text(Error::InvalidArg),
            };
            log::set_max_level(filter);
            "done".to_string()
        }
    }
}

fn execute_reload(ctx: &CommandContext) -> String {
    let Some(config_path) = &ctx.config_path else {
        return err_text(Error::NotFound);
    };
    let mut new_map = MessageMap::new(false);
    match csv::load_config_dir(&mut new_map, config_path) {
        Ok(count) => {
            *ctx.handler.messages().write().unwrap() = new_map;
            // participants stay known, only scan/load progress restarts
            ctx.handler.with_shared(|shared| {
                for entry in shared.seen.iter_mut() {
                    *entry &= crate::ebus::handler::Seen::SEEN;
                }
            });
            format!("done, {count} messages")
        }
        Err(e) => err_text(e),
    }
}

/// Used by the HTTP endpoint: decode all matching messages into JSON.
pub fn data_json(
    handler: &BusHandler,
    circuit: &str,
    name: &str,
    exact: bool,
    since: Option<u64>,
    numeric: bool,
) -> serde_json::Value {
    let map = handler.messages().read().unwrap();
    let messages = map.find_all(circuit, name, exact, true, true, true);
    let mut circuits = serde_json::Map::new();
    let mut newest: Option<SystemTime> = None;
    for message in messages {
        let Some(last_update) = message.last_update() else {
            continue;
        };
        let lastup = last_update
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if let Some(since) = since {
            if lastup <= since {
                continue;
            }
        }
        newest = Some(newest.map_or(last_update, |t: SystemTime| t.max(last_update)));
        let Ok(fields) = message.decode_last_data_json(numeric) else {
            continue;
        };
        let mut entry = serde_json::Map::new();
        entry.insert("name".to_string(), serde_json::json!(message.name()));
        entry.insert("passive".to_string(), serde_json::json!(message.is_passive()));
        entry.insert("write".to_string(), serde_json::json!(message.is_write()));
        entry.insert("lastup".to_string(), serde_json::json!(lastup));
        if message.dst_address() != SYN {
            entry.insert(
                "zz".to_string(),
                serde_json::json!(format!("{:02x}", message.dst_address())),
            );
        }
        entry.insert("fields".to_string(), serde_json::Value::Object(fields));
        let circuit_entry = circuits
            .entry(message.circuit().to_string())
            .or_insert_with(|| serde_json::json!({ "messages": {} }));
        if let Some(messages_obj) = circuit_entry
            .get_mut("messages")
            .and_then(serde_json::Value::as_object_mut)
        {
            messages_obj.insert(message.name().to_string(), serde_json::Value::Object(entry));
        }
    }
    let global = GlobalInfo {
        signal: u8::from(handler.has_signal()),
        lastup: newest
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0),
    };
    circuits.insert(
        "global".to_string(),
        serde_json::to_value(global).unwrap_or_default(),
    );
    serde_json::Value::Object(circuits)
}

/// The `global` object of the HTTP data answer.
#[derive(serde::Serialize)]
struct GlobalInfo {
    signal: u8,
    lastup: u64,
}
