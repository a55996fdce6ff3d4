// An in-memory TFTP server compliant with RFC 1350.
//
// Clients upload a named blob with a write request or download a previously
// uploaded blob with a read request. Everything lives in process memory;
// stopping the server discards every stored blob.
//
// Protocol sketch:
//
// A transfer begins with a request (RRQ or WRQ) sent to the server's
// well-known port. Data moves in 512-byte blocks, and every DATA packet must
// be acknowledged before the next one is sent. A DATA packet carrying fewer
// than 512 bytes ends the transfer, so a file whose size is a multiple of
// 512 is terminated by an empty DATA packet.
//
// Each side of a transfer speaks from its own transfer identifier (TID),
// which is simply a UDP port. The client's TID is whatever source port its
// request came from; the server answers from a freshly bound port, never
// from the well-known one, so concurrent transfers cannot be confused with
// each other.
//
// Packets (all integers big-endian):
//
// opcode   operation
// 1        Read request  | 01 | filename | 00 | mode | 00 |
// 2        Write request | 02 | filename | 00 | mode | 00 |
// 3        Data          | 03 | block # (2 bytes) | 0-512 bytes |
// 4        ACK           | 04 | block # (2 bytes) |
// 5        ERROR         | 05 | code (2 bytes) | message | 00 |
//
// Only octet (binary) mode is served. ERROR packets are a courtesy: they are
// never acknowledged or retransmitted, and most errors end the transfer.
// Lost packets are covered by a receive timeout with a bounded retry count.

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

mod processor;
mod srv_conn;
mod store;
mod tftp;

use crate::srv_conn::{send_error_packet, ServerRequestHandler};
use crate::store::BlobStore;

use anyhow::{bail, Context, Result};
use simple_logger::SimpleLogger;

/// Parses the single `host:port` command line argument. An empty host means
/// every interface; a non-empty host must be a literal IP address.
fn parse_listen_addr(arg: &str) -> Result<SocketAddr> {
    let (host, port) = arg.rsplit_once(':').context("Listen address must look like host:port")?;

    let port: u32 = port.parse().context("Port must be a number")?;
    if port == 59 {
        bail!("Port 59 is not allowed, pick another one");
    }
    if !(1024..65536).contains(&port) {
        bail!("Port must be in the range [1024, 65536)");
    }

    let ip = if host.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host.parse::<IpAddr>().context("Host must be empty or a valid IP address")?
    };

    Ok(SocketAddr::new(ip, port as u16))
}

/// The dispatcher: reads the first packet of every transfer off the
/// well-known socket and hands it to a freshly spawned handler. Handlers
/// answer from their own sockets, so this loop never waits on one.
async fn serve(mut sock: tftp::TftpSocket, store: BlobStore) -> Result<()> {
    loop {
        let (peer, parsed) = match sock.recv_from().await {
            Ok(received) => received,
            Err(e) => bail!("The listening socket failed: {e}"),
        };

        let packet = match parsed {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Malformed request from {:#?}: {e}", peer);
                send_error_packet(&mut sock, peer, tftp::ErrorCode::Illegal, "Illegal operation".to_string()).await;
                continue;
            }
        };

        match packet {
            tftp::Packet::ReadReq { .. } | tftp::Packet::WriteReq { .. } => {
                log::info!("Transfer request from {:#?}: {:#?}", peer, packet);
                let store = store.clone();
                tokio::spawn(async move {
                    match ServerRequestHandler::new(store, &packet, peer).await {
                        Ok(mut handler) => handler.handle().await,
                        Err(e) => log::warn!("Rejected request from {:#?}: {e}", peer),
                    }
                });
            }
            tftp::Packet::Error { code, message } => {
                log::warn!(
                    "Error packet on the listening socket from {:#?}: code {:#?}, '{}'",
                    peer, code, message
                );
            }
            _ => {
                // Only a read or write request can open a transfer.
                send_error_packet(&mut sock, peer, tftp::ErrorCode::Illegal, "Illegal operation".to_string()).await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    SimpleLogger::new().init()?;

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <host:port>", args[0]);
        std::process::exit(1);
    }

    let addr = parse_listen_addr(&args[1])?;
    let sock = tftp::TftpSocket::bind(addr)
        .with_context(|| format!("Could not bind the listening socket on {addr}"))?;
    log::info!("Server started at [{addr}]");

    serve(sock, BlobStore::new()).await
}
