//! Minimal read-only HTTP interface.
//!
//! `GET /data[/circuit[/name]]` returns the matching messages with their
//! last decoded values as JSON plus a `global` object holding the signal
//! state and the newest update time. Supported query parameters:
//! `since=SECS` (only newer values), `exact=1` (exact circuit/name match),
//! `numeric=1` (machine values), `poll=PRIO` (raise the poll priority of
//! the matched messages), `required=1` (actively read missing values),
//! `verbose=1` (accepted for compatibility).

use log::{debug, info, warn};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use super::client::{data_json, CommandContext};
use crate::catalog::field::PartType;

/// Bind the HTTP listener and spawn its acceptor thread.
pub fn start(ctx: CommandContext, port: u16, local_only: bool) -> std::io::Result<()> {
    let host = if local_only { "127.0.0.1" } else { "0.0.0.0" };
    let listener = TcpListener::bind((host, port))?;
    listener.set_nonblocking(true)?;
    info!("network: http listening on {host}:{port}");
    thread::Builder::new().name("http".to_string()).spawn(move || {
        while !ctx.shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, _)) => {
                    let ctx = ctx.clone();
                    let _ = thread::Builder::new()
                        .name("http-client".to_string())
                        .spawn(move || handle_connection(ctx, stream));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    warn!("network: http accept failed: {e}");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    })?;
    Ok(())
}

fn handle_connection(ctx: CommandContext, stream: TcpStream) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let Ok(mut writer) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    // drain the header lines, the body is irrelevant for GET
    let mut header = String::new();
    while reader.read_line(&mut header).is_ok() {
        if header.trim().is_empty() {
            break;
        }
        header.clear();
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");
    debug!("network: http {method} {target}");
    if method != "GET" {
        respond(&mut writer, 405, "{\"error\":\"method not allowed\"}");
        return;
    }
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.first() != Some(&"data") {
        respond(&mut writer, 404, "{\"error\":\"not found\"}");
        return;
    }
    let circuit = segments.get(1).copied().unwrap_or("");
    let name = segments.get(2).copied().unwrap_or("");
    let params: HashMap<&str, &str> = query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .filter(|(k, _)| !k.is_empty())
        .collect();
    let since = params.get("since").and_then(|v| v.parse().ok());
    let exact = params.get("exact").is_some_and(|v| *v != "0");
    let numeric = params.get("numeric").is_some_and(|v| *v != "0");

    if let Some(priority) = params.get("poll").and_then(|v| v.parse::<u8>().ok()) {
        let map = ctx.handler.messages().read().unwrap();
        for message in map.find_all(circuit, name, exact, true, false, false) {
            if message.set_poll_priority(priority) {
                map.add_poll_message(&message, false);
            }
        }
    }
    if params.get("required").is_some_and(|v| *v != "0") {
        read_missing(&ctx, circuit, name, exact);
    }

    let body = data_json(&ctx.handler, circuit, name, exact, since, numeric);
    respond(&mut writer, 200, &body.to_string());
}

/// Actively read matched messages without stored data.
fn read_missing(ctx: &CommandContext, circuit: &str, name: &str, exact: bool) {
    let messages = {
        let map = ctx.handler.messages().read().unwrap();
        map.find_all(circuit, name, exact, true, false, false)
    };
    for message in messages {
        if message.last_update().is_some() || message.dst_address() == crate::constants::SYN {
            continue;
        }
        for index in 0..message.count() {
            let Ok(master) =
                message.prepare_master(ctx.handler.cfg.own_master, "", None, index)
            else {
                break;
            };
            let (result, slave) = ctx.handler.send_and_wait(&master);
            if result.is_err() {
                break;
            }
            if message.store_last_data(PartType::Slave, &slave, index).is_err() {
                break;
            }
        }
    }
}

fn respond(stream: &mut TcpStream, status: u16, body: &str) {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json;charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
}
