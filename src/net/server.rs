//! TCP acceptor and per-client connection threads.
//!
//! The acceptor thread hands every client socket to its own thread which
//! reads command lines, dispatches them, and writes the result followed by
//! an empty line. A client in listen mode additionally receives decoded
//! updates as they happen until it sends `LISTEN stop` or disconnects.

use log::{debug, info, warn};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::Duration;

use super::client::{execute, CommandContext, Outcome};

/// Bind the text protocol listener and spawn the acceptor thread.
pub fn start(ctx: CommandContext, port: u16, local_only: bool) -> std::io::Result<()> {
    let host = if local_only { "127.0.0.1" } else { "0.0.0.0" };
    let listener = TcpListener::bind((host, port))?;
    listener.set_nonblocking(true)?;
    info!("network: listening on {host}:{port}");
    thread::Builder::new().name("network".to_string()).spawn(move || {
        accept_loop(ctx, listener);
    })?;
    Ok(())
}

fn accept_loop(ctx: CommandContext, listener: TcpListener) {
    while !ctx.shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                debug!("network: connection from {addr}");
                let ctx = ctx.clone();
                let result = thread::Builder::new()
                    .name(format!("client-{addr}"))
                    .spawn(move || connection_loop(ctx, stream));
                if let Err(e) = result {
                    warn!("network: unable to spawn client thread: {e}");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                warn!("network: accept failed: {e}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn write_reply(stream: &mut TcpStream, reply: &str) -> std::io::Result<()> {
    stream.write_all(reply.as_bytes())?;
    stream.write_all(b"\n\n")
}

fn connection_loop(ctx: CommandContext, stream: TcpStream) {
    let Ok(mut writer) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut listening = false;
    let mut updates = None;
    // a command may arrive split across read timeouts, keep the partial line
    let mut pending = String::new();
    loop {
        if ctx.shutdown.load(Ordering::Relaxed) {
            return;
        }
        if listening {
            // forward one round of updates before polling the socket again
            let rx = updates.get_or_insert_with(|| ctx.handler.add_listener());
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(update) => {
                    if write_reply(&mut writer, &update).is_err() {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
        let timeout = if listening { Duration::from_millis(10) } else { Duration::from_secs(1) };
        let _ = reader.get_ref().set_read_timeout(Some(timeout));
        match reader.read_line(&mut pending) {
            Ok(0) => return,
            Ok(_) => {
                if !pending.ends_with('\n') {
                    continue;
                }
                let line = pending.trim().to_string();
                pending.clear();
                if line.is_empty() {
                    continue;
                }
                if !handle_line(&ctx, &mut writer, &line, &mut listening) {
                    return;
                }
                if !listening {
                    updates = None;
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => return,
        }
    }
}

/// Dispatch one command line; returns false when the connection ends.
fn handle_line(
    ctx: &CommandContext,
    writer: &mut TcpStream,
    line: &str,
    listening: &mut bool,
) -> bool {
    if line.is_empty() {
        return true;
    }
    match execute(ctx, line) {
        Outcome::Text(reply) => write_reply(writer, &reply).is_ok(),
        Outcome::Quit(reply) => {
            let _ = write_reply(writer, &reply);
            false
        }
        Outcome::ListenStart(reply) => {
            *listening = true;
            write_reply(writer, &reply).is_ok()
        }
        Outcome::ListenStop(reply) => {
            *listening = false;
            write_reply(writer, &reply).is_ok()
        }
    }
}
