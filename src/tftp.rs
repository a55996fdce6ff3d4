use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Payload bytes carried by a full DATA packet. A payload shorter than this
/// marks the final block of a transfer.
pub const BLOCK_SIZE: usize = 512;

/// Largest well-formed TFTP datagram: 2-byte opcode, 2-byte block number and
/// a full payload. Receive buffers are sized to this; anything longer is
/// truncated at the buffer boundary.
pub const MAX_PACKET_SIZE: usize = 4 + BLOCK_SIZE;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP socket handler.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {:#?}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {:#?}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// The only transfer mode this server speaks. Requests naming any other mode
/// are answered with ERROR code 4.
pub fn is_octet_mode(mode: &str) -> bool {
    mode.eq_ignore_ascii_case("octet")
}

/// Represents a TFTP error code surfaced by a TFTP Error packet.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ErrorCode { Undefined, FileNotFound, AccessViolation, DiskFull, Illegal, UnknownTid, FileAlreadyExists, NoSuchUser }

impl ErrorCode {
    fn from_wire(raw: u16) -> ErrorCode {
        match raw {
            0 => ErrorCode::Undefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    fn to_wire(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The blob name the client wants to read.
        filename: String,

        /// The transfer mode, exactly as the client sent it.
        mode: String,
    },

    /// A write request packet
    WriteReq {
        filename: String,
        mode: String,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the block itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and
/// concatenates until it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the
/// 0 byte in the buffer it was given (or the size of the buffer, if no 0 byte
/// was encountered).
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let mut s = String::new();
    for i in 0..buf.len() {
        let c = buf[i];
        if c == 0x00 {
            return (s, i)
        }
        s.push(char::from(c));
    }

    (s, buf.len())
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0x00);
}

/// Utility function for obtaining the TFTP OpCode from a buffer
#[derive(Debug, PartialEq)]
pub enum OpCode { Rrq, Wrq, Data, Ack, Error }

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(SocketError::PacketParse(
            format!("Unknown opcode retrieved: {rawcode}"))),
    }
}

/// Extracts the two NUL-terminated strings of a request packet. Both
/// terminators must be present.
fn parse_name_and_mode(buf: &[u8]) -> TftpResult<(String, String)> {
    let (filename, name_end) = string_from_buffer(buf);

    if name_end == buf.len() {
        return Err(SocketError::PacketParse("Request does not contain a mode, but it needs to!".to_string()));
    }

    let rest = &buf[name_end + 1..];
    let (mode, mode_end) = string_from_buffer(rest);

    if mode_end == rest.len() {
        return Err(SocketError::PacketParse("Mode must be terminated with a null byte!".to_string()));
    }

    Ok((filename, mode))
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (filename, mode) = parse_name_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { filename, mode })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (filename, mode) = parse_name_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { filename, mode })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    let payload = &buf[4..];
    if payload.len() > BLOCK_SIZE {
        return Err(SocketError::PacketParse(
            format!("Data payload of {} bytes exceeds the {BLOCK_SIZE}-byte block size", payload.len())));
    }
    Ok(Packet::Data { block, data: Vec::from(payload) })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    let code = ErrorCode::from_wire(u16_from_buffer(&buf[2..4]));
    let (message, _) = string_from_buffer(&buf[4..]);
    Ok(Packet::Error { code, message })
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 4 {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    /// Serializes the packet into its RFC 1350 wire layout, big-endian
    /// integers throughout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        match self {
            Packet::ReadReq { filename, mode } => {
                put_u16(&mut buf, 1);
                put_string(&mut buf, filename);
                put_string(&mut buf, mode);
            }
            Packet::WriteReq { filename, mode } => {
                put_u16(&mut buf, 2);
                put_string(&mut buf, filename);
                put_string(&mut buf, mode);
            }
            Packet::Data { block, data } => {
                put_u16(&mut buf, 3);
                put_u16(&mut buf, *block);
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                put_u16(&mut buf, 4);
                put_u16(&mut buf, *block);
            }
            Packet::Error { code, message } => {
                put_u16(&mut buf, 5);
                put_u16(&mut buf, code.to_wire());
                put_string(&mut buf, message);
            }
        }
        buf
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
#[derive(Debug)]
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    /// The local endpoint this socket is bound to. Its port is the TID this
    /// side of a transfer speaks from.
    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.to_bytes(), dst).await?;
        Ok(())
    }

    /// Blocks until the next datagram arrives. Used by the listener, which
    /// has nothing better to do than wait. Parse failures are handed back
    /// alongside the sender's address so the caller can still answer them.
    pub async fn recv_from(&mut self) -> TftpResult<(SocketAddr, TftpResult<Packet>)> {
        let mut buf = [0; MAX_PACKET_SIZE];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;

        Ok((src, Packet::parse_from_buf(&buf[..total_written])))
    }

    pub async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0; MAX_PACKET_SIZE];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;

        let packet = Packet::parse_from_buf(&buf[..total_written])?;
        Ok((packet, src))
    }
}
