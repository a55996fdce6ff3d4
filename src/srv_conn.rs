// This module contains the server-side transfer handler.
//
// A transfer starts when the listener receives a ReadReq or a WriteReq and
// hands it to a ServerRequestHandler. The handler binds a fresh UDP socket
// (its port is the server's TID for this one transfer), validates the request
// against the blob store, and then drives the lock-step exchange:
//
// 1. Reads send data blocks and wait for the matching acks; writes send acks
//    and wait for the next data block.
// 2. Each wait is bounded by RECV_TIMEOUT. A write resends its most recent
//    ack before re-waiting; a read just re-waits. MAX_RETRIES consecutive
//    timeouts abandon the transfer.
// 3. The transfer ends when the final short block has been exchanged, when
//    the peer sends an error packet, or when the protocol is violated badly
//    enough that the processor asks to close.
//
// The handler owns all socket I/O; the decision-making lives in the
// PacketProcessor so it can be tested without a network.

use crate::processor::{PacketProcessor, ResultAction};
use crate::store::BlobStore;
use crate::tftp;
use rand::Rng;
use std::error;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// How long a handler waits for the peer's next packet before counting a
/// timeout.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Consecutive receive timeouts a handler tolerates before giving up.
pub const MAX_RETRIES: u32 = 3;

/// An object responsible for handling a single transfer.
pub struct ServerRequestHandler {
    /// The TFTP socket used to send and receive packets. Its port is the
    /// server's TID for this transfer.
    sock: tftp::TftpSocket,

    /// The client's address. Its port is the client's TID; packets from
    /// anywhere else do not belong to this transfer.
    peer: SocketAddr,

    /// The lock-step state machine for this transfer.
    processor: PacketProcessor,
}

/// Attempts to bind to a random UDP socket until one succeeds.
fn bind_random_socket() -> tftp::TftpSocket {
    let mut rng = rand::thread_rng();
    let mut sock = tftp::TftpSocket::bind((Ipv4Addr::UNSPECIFIED, rng.gen_range(1024..65535)).into());
    while sock.is_err() {
        log::warn!("Couldn't bind socket: {:#?}", sock);
        sock = tftp::TftpSocket::bind((Ipv4Addr::UNSPECIFIED, rand::thread_rng().gen_range(1024..65535)).into());
    }
    sock.unwrap()
}

/// Sends a single ERROR packet. The packet is a courtesy; we don't care how
/// it goes.
pub async fn send_error_packet(
    sock: &mut tftp::TftpSocket,
    dst: SocketAddr,
    code: tftp::ErrorCode,
    message: String,
) {
    let _ = sock.send(&tftp::Packet::Error { code, message }, dst).await;
}

impl ServerRequestHandler {
    pub async fn new(
        store: BlobStore,
        initial_request: &tftp::Packet,
        peer: SocketAddr,
    ) -> Result<ServerRequestHandler, ServerConnectionError> {
        let mut sock = bind_random_socket();
        match initial_request {
            tftp::Packet::ReadReq { filename, mode } => {
                if !tftp::is_octet_mode(mode) {
                    send_error_packet(&mut sock, peer, tftp::ErrorCode::Illegal, "Illegal operation".to_string()).await;
                    return Err(ServerConnectionError::BadRequest(format!(
                        "Transfer mode '{mode}' is not supported, only octet is"
                    )));
                }

                match store.get(filename) {
                    Some(blob) => {
                        log::info!("Read started for [{}] ({} blocks) from {:#?}", filename, blob.block_count(), peer);
                        Ok(ServerRequestHandler {
                            sock,
                            peer,
                            processor: PacketProcessor::new_for_reading(blob),
                        })
                    }
                    None => {
                        send_error_packet(&mut sock, peer, tftp::ErrorCode::FileNotFound, "File not found".to_string()).await;
                        Err(ServerConnectionError::NotFound(filename.clone()))
                    }
                }
            }
            tftp::Packet::WriteReq { filename, mode } => {
                if !tftp::is_octet_mode(mode) {
                    send_error_packet(&mut sock, peer, tftp::ErrorCode::Illegal, "Illegal operation".to_string()).await;
                    return Err(ServerConnectionError::BadRequest(format!(
                        "Transfer mode '{mode}' is not supported, only octet is"
                    )));
                }

                if store.contains(filename) {
                    send_error_packet(&mut sock, peer, tftp::ErrorCode::FileAlreadyExists, "File already exists".to_string()).await;
                    return Err(ServerConnectionError::AlreadyExists(filename.clone()));
                }

                log::info!("Write started for [{}] from {:#?}", filename, peer);
                Ok(ServerRequestHandler {
                    sock,
                    peer,
                    processor: PacketProcessor::new_for_writing(store, filename.clone()),
                })
            }
            _ => Err(ServerConnectionError::BadRequest(
                "Only read and write requests are valid initial requests.".to_string(),
            )),
        }
    }

    /// The endpoint this handler replies from.
    pub fn local_addr(&self) -> tftp::TftpResult<SocketAddr> {
        self.sock.local_addr()
    }

    /// Does the work of sending and receiving data over the connection until
    /// the transfer completes, the peer aborts, or the retries run out.
    pub async fn handle(&mut self) {
        match self.processor.first_packet() {
            ResultAction::SendPacketAndAwait(p) => {
                if let Err(e) = self.sock.send(&p, self.peer).await {
                    log::warn!("Unable to send packet to {:#?}: {e}", self.peer);
                    return;
                }
            }
            ResultAction::TerminateWithPacket(p) => {
                let _ = self.sock.send(&p, self.peer).await;
                return;
            }
            ResultAction::CloseConnection(_) | ResultAction::RetryRecv => {
                log::error!("Packet processor produced no opening packet for {:#?}. This should never happen!", self.peer);
                return;
            }
        }

        let mut retries: u32 = 0;
        loop {
            match self.sock.recv_with_timeout(RECV_TIMEOUT).await {
                Ok((packet, src)) => {
                    // First, check whether the data came from the peer this
                    // transfer belongs to.
                    if src != self.peer {
                        log::warn!(
                            "Ignoring packet from unexpected peer {:#?} (transfer belongs to {:#?})",
                            src, self.peer
                        );
                        continue;
                    }

                    // Next, figure out how to respond.
                    match self.processor.process_packet(&packet) {
                        ResultAction::SendPacketAndAwait(p) => {
                            retries = 0;
                            if let Err(e) = self.sock.send(&p, self.peer).await {
                                log::warn!("Unable to send packet to {:#?}: {e}", self.peer);
                                return;
                            }
                        }
                        ResultAction::RetryRecv => {
                            continue;
                        }
                        ResultAction::CloseConnection(maybe_warn) => {
                            if let Some(msg) = maybe_warn {
                                log::warn!("{}", msg);
                            }
                            log::info!("Closing transfer with {:#?}", self.peer);
                            return;
                        }
                        ResultAction::TerminateWithPacket(p) => {
                            let _ = self.sock.send(&p, self.peer).await;
                            log::info!("Transfer with {:#?} complete", self.peer);
                            return;
                        }
                    }
                }
                Err(tftp::SocketError::Timeout(_)) => {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        log::warn!("Transfer with {:#?} timed out, giving up", self.peer);
                        return;
                    }
                    if let Some(p) = self.processor.retransmit_on_timeout() {
                        if let Err(e) = self.sock.send(&p, self.peer).await {
                            log::warn!("Unable to resend packet to {:#?}: {e}", self.peer);
                            return;
                        }
                    }
                }
                // If we couldn't parse the incoming packet, send an error and
                // kill the transfer.
                Err(tftp::SocketError::PacketParse(msg)) => {
                    log::warn!("Malformed packet from {:#?}: {msg}", self.peer);
                    send_error_packet(&mut self.sock, self.peer, tftp::ErrorCode::Illegal, "Illegal operation".to_string()).await;
                    return;
                }
                // A socket fault means the link is gone; there is nobody left
                // to tell.
                Err(tftp::SocketError::IO(e)) => {
                    log::warn!("Socket error on transfer with {:#?}: {:#?}", self.peer, e);
                    return;
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum ServerConnectionError {
    BadRequest(String),
    NotFound(String),
    AlreadyExists(String),
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Invalid request: {:#?}", msg),
            Self::NotFound(name) => write!(f, "No blob named {:#?} has been uploaded", name),
            Self::AlreadyExists(name) => write!(f, "A blob named {:#?} already exists", name),
        }
    }
}
