use crate::store::{Blob, BlobStore, PublishOutcome};
use crate::tftp;
use std::sync::Arc;

#[derive(Debug)]
pub enum PacketProcessor {
    Read(ReadProcessor),
    Write(WriteProcessor),
}

/// An entity that can process packets and produce a response.
///
/// Processors are pure state machines over the blob store: they never touch
/// a socket, which keeps the lock-step protocol testable without any I/O.
impl PacketProcessor {
    pub fn new_for_reading(blob: Arc<Blob>) -> PacketProcessor {
        PacketProcessor::Read(ReadProcessor::new(blob))
    }

    pub fn new_for_writing(store: BlobStore, filename: String) -> PacketProcessor {
        PacketProcessor::Write(WriteProcessor::new(store, filename))
    }

    /// The packet that opens the transfer: the first data block for a read,
    /// the zeroth ack for a write.
    pub fn first_packet(&mut self) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.next_data(),
            PacketProcessor::Write(_) => ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 0 }),
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.process_ack(packet),
            PacketProcessor::Write(p) => p.process_data(packet),
        }
    }

    /// The packet to resend when the peer goes quiet, if any. Writes resend
    /// their most recent ack in case it was lost; reads re-wait without
    /// retransmitting the outstanding data block.
    pub fn retransmit_on_timeout(&self) -> Option<tftp::Packet> {
        match self {
            PacketProcessor::Read(_) => None,
            PacketProcessor::Write(p) => Some(tftp::Packet::Ack { block: p.curr_block }),
        }
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should close the connection without sending a message, optionally logging a string.
    CloseConnection(Option<String>),

    /// Caller should try receiving the last packet again.
    RetryRecv,

    /// Caller should terminate the connection by sending the packet.
    TerminateWithPacket(tftp::Packet),
}

#[derive(Debug)]
pub struct ReadProcessor {
    blob: Arc<Blob>,
    curr_block: u16,
    awaiting_final_ack: bool,
}

impl ReadProcessor {
    fn new(blob: Arc<Blob>) -> ReadProcessor {
        ReadProcessor {
            blob,
            curr_block: 0,
            awaiting_final_ack: false,
        }
    }

    /// Advances to the next block and wraps it in a data packet. The block
    /// that comes up short of 512 bytes is the last one; a blob whose final
    /// stored block is exactly 512 bytes still owes the client a zero-length
    /// terminator.
    fn next_data(&mut self) -> ResultAction {
        let data = match self.blob.block(usize::from(self.curr_block)) {
            Some(b) => b.to_vec(),
            None => Vec::new(),
        };
        self.curr_block += 1;
        if data.len() < tftp::BLOCK_SIZE {
            self.awaiting_final_ack = true;
        }
        ResultAction::SendPacketAndAwait(tftp::Packet::Data { block: self.curr_block, data })
    }

    fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Ack { block } if *block == self.curr_block => {
                if self.awaiting_final_ack {
                    ResultAction::CloseConnection(None)
                } else {
                    self.next_data()
                }
            }
            tftp::Packet::Error { code, message } => ResultAction::CloseConnection(Some(format!(
                "Client sent error packet: code: {:#?}, message: '{}'",
                code, message
            ))),
            // Stale acks, acks for blocks not yet sent and stray packets are
            // all ignored: the transfer must not advance on anything but an
            // ack matching the outstanding block.
            _ => ResultAction::RetryRecv,
        }
    }
}

#[derive(Debug)]
pub struct WriteProcessor {
    store: BlobStore,
    filename: String,
    blocks: Vec<Vec<u8>>,
    curr_block: u16,
}

impl WriteProcessor {
    fn new(store: BlobStore, filename: String) -> WriteProcessor {
        WriteProcessor { store, filename, blocks: Vec::new(), curr_block: 0 }
    }

    fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Data { block, data } if *block == self.curr_block + 1 => {
                self.blocks.push(data.clone());
                self.curr_block += 1;
                let ack = tftp::Packet::Ack { block: self.curr_block };

                if data.len() < tftp::BLOCK_SIZE {
                    self.publish();
                    ResultAction::TerminateWithPacket(ack)
                } else {
                    ResultAction::SendPacketAndAwait(ack)
                }
            }
            tftp::Packet::Data { block, .. } => ResultAction::CloseConnection(Some(format!(
                "Out-of-order data block {block} (expected {}), discarding upload of '{}'",
                self.curr_block + 1,
                self.filename
            ))),
            tftp::Packet::Error { code, message } => ResultAction::CloseConnection(Some(format!(
                "Client sent error packet: code: {:#?}, message: '{}'",
                code, message
            ))),
            _ => ResultAction::CloseConnection(Some(format!(
                "Expected to receive a Data packet, but got {:#?} instead",
                packet
            ))),
        }
    }

    /// Offers the accumulated blocks to the store. Until this point nothing
    /// of the upload is visible to readers; losing the publish race means
    /// the upload simply evaporates.
    fn publish(&mut self) {
        let blob = Blob::from_blocks(std::mem::take(&mut self.blocks));
        let block_count = blob.block_count();
        match self.store.publish(self.filename.clone(), blob) {
            PublishOutcome::Published => {
                log::info!("Write completed for [{}] ({} blocks)", self.filename, block_count);
            }
            PublishOutcome::AlreadyExists => {
                log::info!(
                    "Discarding upload of [{}]: a concurrent writer finished first",
                    self.filename
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_processor(blocks: Vec<Vec<u8>>) -> PacketProcessor {
        PacketProcessor::new_for_reading(Arc::new(Blob::from_blocks(blocks)))
    }

    fn data(block: u16, data: Vec<u8>) -> tftp::Packet {
        tftp::Packet::Data { block, data }
    }

    fn ack(block: u16) -> tftp::Packet {
        tftp::Packet::Ack { block }
    }

    #[test]
    fn test_read_single_short_block() {
        let mut processor = read_processor(vec![b"testing".to_vec()]);

        assert_eq!(
            processor.first_packet(),
            ResultAction::SendPacketAndAwait(data(1, b"testing".to_vec()))
        );
        assert_eq!(processor.process_packet(&ack(1)), ResultAction::CloseConnection(None));
    }

    #[test]
    fn test_read_multiple_blocks() {
        let mut processor = read_processor(vec![vec![0x78; 512], b"tail".to_vec()]);

        assert_eq!(
            processor.first_packet(),
            ResultAction::SendPacketAndAwait(data(1, vec![0x78; 512]))
        );
        assert_eq!(
            processor.process_packet(&ack(1)),
            ResultAction::SendPacketAndAwait(data(2, b"tail".to_vec()))
        );
        assert_eq!(processor.process_packet(&ack(2)), ResultAction::CloseConnection(None));
    }

    #[test]
    fn test_read_replays_stored_empty_terminator() {
        // A 512-byte upload is stored as a full block plus the empty block
        // that ended it; reading it back replays both.
        let mut processor = read_processor(vec![vec![0x41; 512], vec![]]);

        assert_eq!(
            processor.first_packet(),
            ResultAction::SendPacketAndAwait(data(1, vec![0x41; 512]))
        );
        assert_eq!(
            processor.process_packet(&ack(1)),
            ResultAction::SendPacketAndAwait(data(2, vec![]))
        );
        assert_eq!(processor.process_packet(&ack(2)), ResultAction::CloseConnection(None));
    }

    #[test]
    fn test_read_synthesizes_empty_terminator() {
        // A blob whose last block is exactly 512 bytes ends with a
        // zero-length data packet even though no empty block is stored.
        let mut processor = read_processor(vec![vec![0x42; 512]]);

        assert_eq!(
            processor.first_packet(),
            ResultAction::SendPacketAndAwait(data(1, vec![0x42; 512]))
        );
        assert_eq!(
            processor.process_packet(&ack(1)),
            ResultAction::SendPacketAndAwait(data(2, vec![]))
        );
        assert_eq!(processor.process_packet(&ack(2)), ResultAction::CloseConnection(None));
    }

    #[test]
    fn test_read_ignores_mismatched_acks() {
        let mut processor = read_processor(vec![vec![0x78; 512], b"tail".to_vec()]);
        let _ = processor.first_packet();

        // Neither a stale ack nor one for an unsent block moves the
        // transfer forward.
        assert_eq!(processor.process_packet(&ack(0)), ResultAction::RetryRecv);
        assert_eq!(processor.process_packet(&ack(5)), ResultAction::RetryRecv);

        // The matching ack still works afterwards.
        assert_eq!(
            processor.process_packet(&ack(1)),
            ResultAction::SendPacketAndAwait(data(2, b"tail".to_vec()))
        );
    }

    #[test]
    fn test_read_ignores_unexpected_packet_types() {
        let mut processor = read_processor(vec![b"testing".to_vec()]);
        let _ = processor.first_packet();

        assert_eq!(
            processor.process_packet(&data(1, vec![0x01])),
            ResultAction::RetryRecv
        );
    }

    #[test]
    fn test_read_closes_on_client_error() {
        let mut processor = read_processor(vec![b"testing".to_vec()]);
        let _ = processor.first_packet();

        let action = processor.process_packet(&tftp::Packet::Error {
            code: tftp::ErrorCode::Undefined,
            message: "whoops".to_string(),
        });
        assert!(matches!(action, ResultAction::CloseConnection(Some(_))));
    }

    #[test]
    fn test_read_does_not_retransmit_on_timeout() {
        let processor = read_processor(vec![b"testing".to_vec()]);
        assert_eq!(processor.retransmit_on_timeout(), None);
    }

    #[test]
    fn test_write_first_packet_is_ack_zero() {
        let mut processor = PacketProcessor::new_for_writing(BlobStore::new(), "a.txt".to_string());
        assert_eq!(
            processor.first_packet(),
            ResultAction::SendPacketAndAwait(ack(0))
        );
    }

    #[test]
    fn test_write_accumulates_and_publishes() {
        let store = BlobStore::new();
        let mut processor = PacketProcessor::new_for_writing(store.clone(), "b.bin".to_string());
        let _ = processor.first_packet();

        assert_eq!(
            processor.process_packet(&data(1, vec![0x78; 512])),
            ResultAction::SendPacketAndAwait(ack(1))
        );
        // Nothing visible while the upload is in flight.
        assert!(!store.contains("b.bin"));

        assert_eq!(
            processor.process_packet(&data(2, b"tail".to_vec())),
            ResultAction::TerminateWithPacket(ack(2))
        );

        let mut expected = vec![0x78; 512];
        expected.extend_from_slice(b"tail");
        assert_eq!(store.get("b.bin").unwrap().contents(), expected);
    }

    #[test]
    fn test_write_stores_empty_terminator_block() {
        let store = BlobStore::new();
        let mut processor = PacketProcessor::new_for_writing(store.clone(), "b.bin".to_string());
        let _ = processor.first_packet();

        assert_eq!(
            processor.process_packet(&data(1, vec![0x41; 512])),
            ResultAction::SendPacketAndAwait(ack(1))
        );
        assert_eq!(
            processor.process_packet(&data(2, vec![])),
            ResultAction::TerminateWithPacket(ack(2))
        );

        let stored = store.get("b.bin").unwrap();
        assert_eq!(stored.block_count(), 2);
        assert_eq!(stored.contents(), vec![0x41; 512]);
    }

    #[test]
    fn test_write_aborts_on_out_of_order_data() {
        let store = BlobStore::new();
        let mut processor = PacketProcessor::new_for_writing(store.clone(), "c.dat".to_string());
        let _ = processor.first_packet();

        let action = processor.process_packet(&data(2, vec![0x01]));
        assert!(matches!(action, ResultAction::CloseConnection(Some(_))));
        assert!(!store.contains("c.dat"));
    }

    #[test]
    fn test_write_aborts_on_duplicate_data() {
        let store = BlobStore::new();
        let mut processor = PacketProcessor::new_for_writing(store.clone(), "c.dat".to_string());
        let _ = processor.first_packet();

        assert_eq!(
            processor.process_packet(&data(1, vec![0x78; 512])),
            ResultAction::SendPacketAndAwait(ack(1))
        );
        let action = processor.process_packet(&data(1, vec![0x78; 512]));
        assert!(matches!(action, ResultAction::CloseConnection(Some(_))));
        assert!(!store.contains("c.dat"));
    }

    #[test]
    fn test_write_aborts_on_unexpected_packet() {
        let store = BlobStore::new();
        let mut processor = PacketProcessor::new_for_writing(store.clone(), "c.dat".to_string());
        let _ = processor.first_packet();

        let action = processor.process_packet(&ack(1));
        assert!(matches!(action, ResultAction::CloseConnection(Some(_))));
        assert!(!store.contains("c.dat"));
    }

    #[test]
    fn test_write_aborts_on_client_error() {
        let store = BlobStore::new();
        let mut processor = PacketProcessor::new_for_writing(store.clone(), "c.dat".to_string());
        let _ = processor.first_packet();

        let action = processor.process_packet(&tftp::Packet::Error {
            code: tftp::ErrorCode::Undefined,
            message: "whoops".to_string(),
        });
        assert!(matches!(action, ResultAction::CloseConnection(Some(_))));
        assert!(!store.contains("c.dat"));
    }

    #[test]
    fn test_write_losing_the_race_discards_silently() {
        let store = BlobStore::new();
        let mut processor = PacketProcessor::new_for_writing(store.clone(), "d.dat".to_string());
        let _ = processor.first_packet();

        // Another writer finishes while this upload is in flight.
        store.publish("d.dat".to_string(), Blob::from_blocks(vec![b"winner".to_vec()]));

        // The loser still acks its final block; it just doesn't install.
        assert_eq!(
            processor.process_packet(&data(1, b"loser".to_vec())),
            ResultAction::TerminateWithPacket(ack(1))
        );
        assert_eq!(store.get("d.dat").unwrap().contents(), b"winner");
    }

    #[test]
    fn test_write_retransmits_last_ack_on_timeout() {
        let store = BlobStore::new();
        let mut processor = PacketProcessor::new_for_writing(store, "c.dat".to_string());
        let _ = processor.first_packet();

        assert_eq!(processor.retransmit_on_timeout(), Some(ack(0)));

        let _ = processor.process_packet(&data(1, vec![0x78; 512]));
        assert_eq!(processor.retransmit_on_timeout(), Some(ack(1)));
    }
}
