//! The runtime control channel.
//!
//! A separate thread listens on a TCP socket; each connection delivers one
//! configuration block (same TOML syntax as the startup file) terminated by
//! EOF. Parsed blocks travel over a channel to the data plane, which applies
//! each group to the stage of the same name between two packets. Invalid
//! input never reaches the stages.

use std::io::Read;
use std::net::{Ipv4Addr, TcpListener};
use std::thread;

use anyhow::{bail, Context, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};

/// Parsed stage-name → settings groups of one control connection.
pub type ControlBlock = Vec<(String, toml::value::Table)>;

/// How many adjacent ports are tried when the configured one is taken.
const MAX_BIND_RETRY_COUNT: u16 = 10;

/// Binds the control socket (retrying adjacent ports) and spawns the
/// listener thread. Returns the receiving end and the port actually bound.
pub fn spawn_control_thread(port: u16) -> Result<(Receiver<ControlBlock>, u16)> {
    let mut listener = None;
    let mut bound_port = port;
    for offset in 0..MAX_BIND_RETRY_COUNT {
        let candidate = port + offset;
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, candidate)) {
            Ok(socket) => {
                listener = Some(socket);
                bound_port = candidate;
                break;
            }
            Err(_) => continue,
        }
    }
    let listener = listener.context("could not bind control port")?;
    log::info!("listening for control commands at port {}", bound_port);

    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("captool-control".to_string())
        .spawn(move || listen(listener, tx))
        .context("starting control thread")?;
    Ok((rx, bound_port))
}

fn listen(listener: TcpListener, tx: Sender<ControlBlock>) {
    loop {
        let mut stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) => {
                log::warn!("problem accepting on control socket: {}; try again", e);
                continue;
            }
        };
        log::debug!("accepted control connection");

        let mut input = String::new();
        if let Err(e) = stream.read_to_string(&mut input) {
            log::warn!("problem reading control connection: {}; try again", e);
            continue;
        }
        log::debug!("received command:\n{}", input);

        match parse_control_block(&input) {
            Ok(block) => {
                if tx.send(block).is_err() {
                    // The data plane is gone; nothing left to configure.
                    return;
                }
            }
            Err(e) => {
                log::warn!("invalid configuration on control socket: {:#}", e);
            }
        }
    }
}

/// Accepts both the startup layout (`[stages.<name>]`) and bare top-level
/// groups; the file-manager group keeps its own name.
pub fn parse_control_block(input: &str) -> Result<ControlBlock> {
    let value: toml::Value = toml::from_str(input).context("parsing control block")?;
    let Some(table) = value.as_table() else {
        bail!("control block is not a table");
    };

    let mut block = Vec::new();
    for (name, group) in table {
        match group.as_table() {
            Some(group) if name == "stages" => {
                for (stage_name, settings) in group {
                    match settings.as_table() {
                        Some(settings) => {
                            block.push((stage_name.clone(), settings.clone()));
                        }
                        None => log::warn!(
                            "invalid configuration: stage \"{}\" is not a group; skipping",
                            stage_name
                        ),
                    }
                }
            }
            Some(group) => block.push((name.clone(), group.clone())),
            None => {
                log::warn!("invalid configuration: \"{}\" is not a group; skipping", name);
            }
        }
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stage_groups_in_both_layouts() {
        let block = parse_control_block(
            "[stages.http]\nmaxBodySize = 64\n\n[files]\nsplitFiles = false\n",
        )
        .unwrap();
        assert_eq!(block.len(), 2);
        assert_eq!(block[0].0, "http");
        assert_eq!(block[0].1.get("maxBodySize").unwrap().as_integer(), Some(64));
        assert_eq!(block[1].0, "files");

        let bare = parse_control_block("[flow]\nflowTimeout = 30\n").unwrap();
        assert_eq!(bare[0].0, "flow");
    }

    #[test]
    fn scalar_group_is_skipped_not_fatal() {
        let block = parse_control_block("x = 1\n[flow]\noutputEnabled = false\n").unwrap();
        assert_eq!(block.len(), 1);
        assert_eq!(block[0].0, "flow");
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_control_block("not toml at all [").is_err());
    }
}
