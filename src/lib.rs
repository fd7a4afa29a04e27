//! Reliable file transfer over plain UDP datagrams.
//!
//! A sender streams a file as CRC32-framed packets inside a fixed
//! retransmission window; a receiver reassembles them by index, verifies the
//! whole payload against a SHA-256 digest, and only then writes the file.
//! The wire format and both state machines live here; the binaries in
//! `src/bin` are thin argument-parsing shells around them.

pub mod channel;
pub mod digest;
pub mod packet;
pub mod receiver;
pub mod sender;

// Re-export key types for convenience.
pub use channel::{memory_pair, DatagramChannel, MemoryChannel, UdpChannel};
pub use digest::TransferDigest;
pub use packet::{
    decode_frame, DecodeOutcome, Packet, PacketBody, PacketType, CRC_SIZE, HASH_SIZE,
    HEADER_SIZE, MAX_DATA_SIZE, MAX_PACKET_SIZE,
};
pub use receiver::{
    run_receiver, Receiver, ReceiverConfig, RecvError, RecvReport, Step, MAX_FILE_NAME,
};
pub use sender::{
    send_file, send_stream, total_packets_for, transfer_file, SendError, SendReport,
    SenderConfig, MAX_UNACKNOWLEDGED_PACKETS,
};
