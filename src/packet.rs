//! Wire format for the transfer protocol.
//!
//! Every frame starts with a one-byte packet type and a 4-byte transmission
//! id, and ends with a 4-byte CRC32 computed over everything before it.
//! All multi-byte integers are big-endian.
//!
//! ```text
//! START (0x00):        [type][transmission_id(4)][total_packet_count(4)][file_name\0][crc(4)]
//! DATA (0x01):         [type][transmission_id(4)][index(4)][payload...][crc(4)]
//! END (0x02):          [type][transmission_id(4)][file_size(4)][sha256(32)][crc(4)]
//! END_RESPONSE (0x03): [type][transmission_id(4)][status(1)][crc(4)]
//! ACK (0x04):          [type][transmission_id(4)][echoed_type(1)][status(1)][index(4)?][crc(4)]
//! ```
//!
//! The ACK index field is present only when the echoed type is DATA.

use crc32fast::Hasher;

/// Maximum payload bytes carried by a single DATA packet.
pub const MAX_DATA_SIZE: usize = 1000;

/// Largest frame the protocol ever produces. DATA is the widest kind:
/// 5-byte header + 1000-byte payload + 4-byte CRC.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Fixed header: type byte plus transmission id.
pub const HEADER_SIZE: usize = 5;

/// Trailing checksum width.
pub const CRC_SIZE: usize = 4;

/// SHA-256 digest width.
pub const HASH_SIZE: usize = 32;

/// The five packet kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Start = 0x00,
    Data = 0x01,
    End = 0x02,
    EndResponse = 0x03,
    Ack = 0x04,
}

impl PacketType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(PacketType::Start),
            0x01 => Some(PacketType::Data),
            0x02 => Some(PacketType::End),
            0x03 => Some(PacketType::EndResponse),
            0x04 => Some(PacketType::Ack),
            _ => None,
        }
    }
}

/// Packet content, decoded once at the codec boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Start {
        total_packet_count: u32,
        file_name: String,
    },
    Data {
        index: u32,
        data: Vec<u8>,
    },
    End {
        file_size: u32,
        digest: [u8; HASH_SIZE],
    },
    EndResponse {
        status: bool,
    },
    Ack {
        echoed_type: PacketType,
        status: bool,
        /// Present only when `echoed_type` is DATA.
        index: Option<u32>,
    },
}

/// A fully decoded protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub transmission_id: u32,
    pub body: PacketBody,
}

/// Result of decoding one inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Checksum and shape are both good.
    Valid(Packet),
    /// The trailing CRC32 does not match. The header fields are readable but
    /// untrusted; the receiver echoes them in a negative acknowledgement.
    Corrupt {
        claimed_type: PacketType,
        transmission_id: u32,
        /// Claimed DATA index, when the frame is long enough to carry one.
        index: Option<u32>,
    },
    /// Too short or of unknown type. Nothing useful to echo; drop silently.
    Garbage,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self.body {
            PacketBody::Start { .. } => PacketType::Start,
            PacketBody::Data { .. } => PacketType::Data,
            PacketBody::End { .. } => PacketType::End,
            PacketBody::EndResponse { .. } => PacketType::EndResponse,
            PacketBody::Ack { .. } => PacketType::Ack,
        }
    }

    /// Serialize into a wire frame, CRC32 appended.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MAX_PACKET_SIZE);
        frame.push(self.packet_type() as u8);
        frame.extend_from_slice(&self.transmission_id.to_be_bytes());

        match &self.body {
            PacketBody::Start {
                total_packet_count,
                file_name,
            } => {
                frame.extend_from_slice(&total_packet_count.to_be_bytes());
                frame.extend_from_slice(file_name.as_bytes());
                frame.push(0); // NUL terminator
            }
            PacketBody::Data { index, data } => {
                frame.extend_from_slice(&index.to_be_bytes());
                frame.extend_from_slice(data);
            }
            PacketBody::End { file_size, digest } => {
                frame.extend_from_slice(&file_size.to_be_bytes());
                frame.extend_from_slice(digest);
            }
            PacketBody::EndResponse { status } => {
                frame.push(*status as u8);
            }
            PacketBody::Ack {
                echoed_type,
                status,
                index,
            } => {
                frame.push(*echoed_type as u8);
                frame.push(*status as u8);
                if *echoed_type == PacketType::Data {
                    debug_assert!(
                        index.is_some(),
                        "a DATA acknowledgement must carry its packet index"
                    );
                    frame.extend_from_slice(&index.unwrap_or(0).to_be_bytes());
                }
            }
        }

        let mut hasher = Hasher::new();
        hasher.update(&frame);
        frame.extend_from_slice(&hasher.finalize().to_be_bytes());
        frame
    }
}

/// Decode one inbound frame. Never panics on malformed input.
pub fn decode_frame(frame: &[u8]) -> DecodeOutcome {
    if frame.len() < HEADER_SIZE + CRC_SIZE {
        return DecodeOutcome::Garbage;
    }
    let Some(packet_type) = PacketType::from_byte(frame[0]) else {
        return DecodeOutcome::Garbage;
    };
    let transmission_id = u32::from_be_bytes(frame[1..5].try_into().unwrap());

    let (covered, crc_bytes) = frame.split_at(frame.len() - CRC_SIZE);
    let received_crc = u32::from_be_bytes(crc_bytes.try_into().unwrap());
    let mut hasher = Hasher::new();
    hasher.update(covered);
    if hasher.finalize() != received_crc {
        let index = if packet_type == PacketType::Data && frame.len() >= HEADER_SIZE + 4 + CRC_SIZE
        {
            Some(u32::from_be_bytes(frame[5..9].try_into().unwrap()))
        } else {
            None
        };
        return DecodeOutcome::Corrupt {
            claimed_type: packet_type,
            transmission_id,
            index,
        };
    }

    let payload = &covered[HEADER_SIZE..];
    let body = match packet_type {
        PacketType::Start => {
            if payload.len() < 5 {
                return DecodeOutcome::Garbage;
            }
            let total_packet_count = u32::from_be_bytes(payload[0..4].try_into().unwrap());
            let name_bytes = &payload[4..];
            let name_end = name_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(name_bytes.len());
            PacketBody::Start {
                total_packet_count,
                file_name: String::from_utf8_lossy(&name_bytes[..name_end]).into_owned(),
            }
        }
        PacketType::Data => {
            if payload.len() < 4 {
                return DecodeOutcome::Garbage;
            }
            PacketBody::Data {
                index: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                data: payload[4..].to_vec(),
            }
        }
        PacketType::End => {
            if payload.len() < 4 + HASH_SIZE {
                return DecodeOutcome::Garbage;
            }
            let mut digest = [0u8; HASH_SIZE];
            digest.copy_from_slice(&payload[4..4 + HASH_SIZE]);
            PacketBody::End {
                file_size: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                digest,
            }
        }
        PacketType::EndResponse => {
            if payload.is_empty() {
                return DecodeOutcome::Garbage;
            }
            PacketBody::EndResponse {
                status: payload[0] != 0,
            }
        }
        PacketType::Ack => {
            if payload.len() < 2 {
                return DecodeOutcome::Garbage;
            }
            let Some(echoed_type) = PacketType::from_byte(payload[0]) else {
                return DecodeOutcome::Garbage;
            };
            let index = if echoed_type == PacketType::Data {
                if payload.len() < 6 {
                    return DecodeOutcome::Garbage;
                }
                Some(u32::from_be_bytes(payload[2..6].try_into().unwrap()))
            } else {
                None
            };
            PacketBody::Ack {
                echoed_type,
                status: payload[1] != 0,
                index,
            }
        }
    };

    DecodeOutcome::Valid(Packet {
        transmission_id,
        body,
    })
}
