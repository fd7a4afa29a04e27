//! Sender transmission controller.
//!
//! One transfer runs through three phases:
//!   1. Starting:  announce the transfer, resend START until it is acknowledged
//!   2. Streaming: windowed data packets with timeout-driven retransmission
//!   3. Ending:    ship the SHA-256 digest and wait for the receiver's verdict
//!
//! Retransmission always replays the identical stored bytes, so index and CRC
//! are preserved and the receiver's deduplication-by-index stays valid.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;

use crate::channel::DatagramChannel;
use crate::digest::TransferDigest;
use crate::packet::{
    decode_frame, DecodeOutcome, Packet, PacketBody, PacketType, MAX_DATA_SIZE, MAX_PACKET_SIZE,
};

/// Cap on data packets in flight without a positive acknowledgement.
pub const MAX_UNACKNOWLEDGED_PACKETS: usize = 10;

/// Acknowledgement state of one sent data packet. Transitions into
/// `PositivelyAcknowledged` are final; a late negative never regresses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Unacknowledged,
    PositivelyAcknowledged,
    NegativelyAcknowledged,
}

/// The serialized bytes last sent for one data index, with bookkeeping for
/// the resend logic.
struct SentPacket {
    frame: Vec<u8>,
    sent_at: Instant,
    ack: AckState,
}

impl SentPacket {
    fn record_ack(&mut self, positive: bool) {
        if positive {
            self.ack = AckState::PositivelyAcknowledged;
        } else if self.ack != AckState::PositivelyAcknowledged {
            self.ack = AckState::NegativelyAcknowledged;
        }
    }

    fn awaiting_ack(&self) -> bool {
        self.ack != AckState::PositivelyAcknowledged
    }
}

/// Timing knobs for the sender. The defaults suit LAN and loopback links.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// How long one START/END attempt waits for its acknowledgement.
    pub ack_wait: Duration,
    /// Overall budget for each handshake phase.
    pub overall_timeout: Duration,
    /// Streaming aborts when no progress happens for this long.
    pub inactivity_timeout: Duration,
    /// Age after which an unacknowledged data packet is retransmitted.
    pub resend_timeout: Duration,
    /// Sleep between polls when the channel is quiet.
    pub poll_sleep: Duration,
    /// Whole-transfer attempts before a digest mismatch is given up on.
    pub max_attempts: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            ack_wait: Duration::from_secs(1),
            overall_timeout: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(10),
            resend_timeout: Duration::from_millis(500),
            poll_sleep: Duration::from_millis(10),
            max_attempts: 3,
        }
    }
}

/// Summary of a finished transfer.
#[derive(Debug)]
pub struct SendReport {
    pub total_bytes: u64,
    pub total_packets: u32,
    pub retransmits: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("no acknowledgement of the {0:?} packet within the overall timeout")]
    HandshakeTimeout(PacketType),
    #[error("receiver stopped acknowledging data packets")]
    Stalled,
    #[error("receiver reported a digest mismatch")]
    DigestMismatch,
    #[error("file is larger than the protocol's 32-bit size field allows")]
    FileTooLarge,
}

/// Number of data packets needed for a payload of `file_size` bytes.
pub fn total_packets_for(file_size: u32) -> u32 {
    let max = MAX_DATA_SIZE as u64;
    ((file_size as u64 + max - 1) / max) as u32
}

/// Send a file over `channel`, retrying the whole transfer with a fresh
/// transmission id when the receiver reports a digest mismatch.
pub fn transfer_file<C: DatagramChannel>(
    channel: &C,
    config: &SenderConfig,
    path: &Path,
) -> Result<SendReport, SendError> {
    let mut attempt = 1;
    loop {
        match send_file(channel, config, path) {
            Err(SendError::DigestMismatch) if attempt < config.max_attempts => {
                attempt += 1;
                log::warn!(
                    "digest mismatch reported by the receiver, restarting the transfer \
                     (attempt {}/{})",
                    attempt,
                    config.max_attempts
                );
            }
            other => return other,
        }
    }
}

/// Send a single file, one attempt.
pub fn send_file<C: DatagramChannel>(
    channel: &C,
    config: &SenderConfig,
    path: &Path,
) -> Result<SendReport, SendError> {
    let file = File::open(path)?;
    let file_size =
        u32::try_from(file.metadata()?.len()).map_err(|_| SendError::FileTooLarge)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_owned());

    send_stream(channel, config, BufReader::new(file), file_size, &file_name)
}

/// Send `file_size` bytes read from `source` as one transmission.
pub fn send_stream<C: DatagramChannel, R: Read>(
    channel: &C,
    config: &SenderConfig,
    mut source: R,
    file_size: u32,
    file_name: &str,
) -> Result<SendReport, SendError> {
    let total_packets = total_packets_for(file_size);
    let transmission_id = rand::thread_rng().gen_range(1..=u32::MAX);
    let started = Instant::now();

    log::info!(
        "transmission {:08x}: sending '{}' ({} bytes, {} packets)",
        transmission_id,
        file_name,
        file_size,
        total_packets
    );

    let mut transmission = Transmission {
        channel,
        config,
        transmission_id,
        packets: Vec::with_capacity(total_packets as usize),
        digest: TransferDigest::new(),
        retransmits: 0,
    };

    transmission.start(total_packets, file_name)?;
    transmission.stream(&mut source)?;
    transmission.end(file_size)?;

    Ok(SendReport {
        total_bytes: file_size as u64,
        total_packets,
        retransmits: transmission.retransmits,
        elapsed: started.elapsed(),
    })
}

struct Transmission<'a, C: DatagramChannel> {
    channel: &'a C,
    config: &'a SenderConfig,
    transmission_id: u32,
    /// Sent data packets, ordered by index.
    packets: Vec<SentPacket>,
    digest: TransferDigest,
    retransmits: u64,
}

impl<'a, C: DatagramChannel> Transmission<'a, C> {
    fn start(&mut self, total_packet_count: u32, file_name: &str) -> Result<(), SendError> {
        let frame = Packet {
            transmission_id: self.transmission_id,
            body: PacketBody::Start {
                total_packet_count,
                file_name: file_name.to_owned(),
            },
        }
        .encode();
        self.channel.send(&frame)?;
        log::debug!("transmission {:08x}: start packet sent", self.transmission_id);

        self.await_ack(PacketType::Start, &frame, false).map(|_| ())
    }

    fn stream<R: Read>(&mut self, source: &mut R) -> Result<(), SendError> {
        let mut chunk = [0u8; MAX_DATA_SIZE];
        let mut eof = false;
        let mut last_progress = Instant::now();

        loop {
            let awaiting = self.packets.iter().filter(|p| p.awaiting_ack()).count();
            if eof && awaiting == 0 {
                log::info!(
                    "transmission {:08x}: all {} data packets acknowledged",
                    self.transmission_id,
                    self.packets.len()
                );
                return Ok(());
            }
            if last_progress.elapsed() >= self.config.inactivity_timeout {
                return Err(SendError::Stalled);
            }

            // Replay overdue packets byte-identically. A negatively
            // acknowledged packet goes out right away and reverts to
            // unacknowledged until the receiver speaks again.
            let channel = self.channel;
            let resend_timeout = self.config.resend_timeout;
            let now = Instant::now();
            for sent in self.packets.iter_mut() {
                if !sent.awaiting_ack() {
                    continue;
                }
                let overdue = now.duration_since(sent.sent_at) >= resend_timeout;
                if sent.ack == AckState::NegativelyAcknowledged || overdue {
                    channel.send(&sent.frame)?;
                    sent.sent_at = now;
                    sent.ack = AckState::Unacknowledged;
                    self.retransmits += 1;
                }
            }

            if awaiting >= MAX_UNACKNOWLEDGED_PACKETS || eof {
                // Window full or nothing left to read: drain acknowledgements
                // instead of sending new data.
                if self.poll_data_ack()? {
                    last_progress = Instant::now();
                } else {
                    thread::sleep(self.config.poll_sleep);
                }
                continue;
            }

            let read = read_chunk(source, &mut chunk)?;
            if read == 0 {
                eof = true;
                log::debug!(
                    "transmission {:08x}: end of file after {} packets",
                    self.transmission_id,
                    self.packets.len()
                );
                continue;
            }

            let index = self.packets.len() as u32;
            let frame = Packet {
                transmission_id: self.transmission_id,
                body: PacketBody::Data {
                    index,
                    data: chunk[..read].to_vec(),
                },
            }
            .encode();
            self.channel.send(&frame)?;
            self.digest.update(&chunk[..read]);
            self.packets.push(SentPacket {
                frame,
                sent_at: Instant::now(),
                ack: AckState::Unacknowledged,
            });
            last_progress = Instant::now();
        }
    }

    fn end(&mut self, file_size: u32) -> Result<(), SendError> {
        let digest = std::mem::take(&mut self.digest).finalize();
        let frame = Packet {
            transmission_id: self.transmission_id,
            body: PacketBody::End { file_size, digest },
        }
        .encode();
        self.channel.send(&frame)?;
        log::info!(
            "transmission {:08x}: end packet sent, digest {}",
            self.transmission_id,
            hex::encode(digest)
        );

        match self.await_ack(PacketType::End, &frame, true)? {
            Some(true) => {
                log::info!("transmission {:08x}: transfer successful", self.transmission_id);
                return Ok(());
            }
            Some(false) => return Err(SendError::DigestMismatch),
            None => {}
        }

        // The END packet was acknowledged; wait for the receiver's verdict.
        let waited = Instant::now();
        while waited.elapsed() < self.config.overall_timeout {
            match self.try_recv_packet()? {
                None => thread::sleep(self.config.poll_sleep),
                Some(packet) if packet.transmission_id == self.transmission_id => {
                    if let PacketBody::EndResponse { status } = packet.body {
                        if status {
                            log::info!(
                                "transmission {:08x}: transfer successful",
                                self.transmission_id
                            );
                            return Ok(());
                        }
                        return Err(SendError::DigestMismatch);
                    }
                }
                Some(_) => {}
            }
        }

        // The receiver only stays around briefly after writing the file, so a
        // missing verdict after a positive END acknowledgement still counts
        // as success.
        log::warn!(
            "transmission {:08x}: no final verdict arrived, assuming the receiver \
             wrote the file and shut down",
            self.transmission_id
        );
        Ok(())
    }

    /// Resend `frame` until an ACK echoing `for_type` reports success.
    ///
    /// With `accept_verdict` set, an END_RESPONSE for this transmission
    /// short-circuits the wait and its status is returned; the receiver's
    /// verdict can race the final acknowledgement.
    fn await_ack(
        &mut self,
        for_type: PacketType,
        frame: &[u8],
        accept_verdict: bool,
    ) -> Result<Option<bool>, SendError> {
        let overall = Instant::now();
        loop {
            let attempt = Instant::now();
            let mut negative = false;
            while attempt.elapsed() < self.config.ack_wait {
                if overall.elapsed() >= self.config.overall_timeout {
                    return Err(SendError::HandshakeTimeout(for_type));
                }
                let Some(packet) = self.try_recv_packet()? else {
                    thread::sleep(self.config.poll_sleep);
                    continue;
                };
                if packet.transmission_id != self.transmission_id {
                    log::debug!(
                        "ignoring a packet for foreign transmission {:08x}",
                        packet.transmission_id
                    );
                    continue;
                }
                match packet.body {
                    PacketBody::EndResponse { status } if accept_verdict => {
                        log::debug!("verdict arrived before the end acknowledgement");
                        return Ok(Some(status));
                    }
                    PacketBody::Ack {
                        echoed_type,
                        status,
                        ..
                    } if echoed_type == for_type => {
                        if status {
                            return Ok(None);
                        }
                        log::debug!(
                            "negative acknowledgement of the {:?} packet, resending",
                            for_type
                        );
                        negative = true;
                        break;
                    }
                    _ => {}
                }
            }
            if overall.elapsed() >= self.config.overall_timeout {
                return Err(SendError::HandshakeTimeout(for_type));
            }
            if !negative {
                log::debug!("no acknowledgement of the {:?} packet yet, resending", for_type);
            }
            self.channel.send(frame)?;
            self.retransmits += 1;
        }
    }

    /// Apply one pending data acknowledgement, if any. Returns whether one
    /// was received and applied.
    fn poll_data_ack(&mut self) -> Result<bool, SendError> {
        let Some(packet) = self.try_recv_packet()? else {
            return Ok(false);
        };
        if packet.transmission_id != self.transmission_id {
            return Ok(false);
        }
        let PacketBody::Ack {
            echoed_type: PacketType::Data,
            status,
            index: Some(index),
        } = packet.body
        else {
            return Ok(false);
        };
        let Some(sent) = self.packets.get_mut(index as usize) else {
            log::debug!("acknowledgement for unknown index {}", index);
            return Ok(false);
        };
        sent.record_ack(status);
        Ok(true)
    }

    fn try_recv_packet(&self) -> Result<Option<Packet>, SendError> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        match self.channel.try_recv(&mut buf)? {
            None => Ok(None),
            Some(len) => match decode_frame(&buf[..len]) {
                DecodeOutcome::Valid(packet) => Ok(Some(packet)),
                _ => {
                    log::debug!("discarding an invalid inbound frame");
                    Ok(None)
                }
            },
        }
    }
}

/// Read until `buf` is full or the source is exhausted. UDP chunking wants
/// full buffers, which a plain `read` does not guarantee.
fn read_chunk<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_count_rounds_up() {
        assert_eq!(total_packets_for(0), 0);
        assert_eq!(total_packets_for(1), 1);
        assert_eq!(total_packets_for(1000), 1);
        assert_eq!(total_packets_for(1001), 2);
        assert_eq!(total_packets_for(2500), 3);
    }

    #[test]
    fn positive_ack_is_final() {
        let mut sent = SentPacket {
            frame: Vec::new(),
            sent_at: Instant::now(),
            ack: AckState::Unacknowledged,
        };
        sent.record_ack(false);
        assert_eq!(sent.ack, AckState::NegativelyAcknowledged);
        sent.record_ack(true);
        assert_eq!(sent.ack, AckState::PositivelyAcknowledged);
        // A late negative must not regress the state.
        sent.record_ack(false);
        assert_eq!(sent.ack, AckState::PositivelyAcknowledged);
    }

    #[test]
    fn read_chunk_fills_across_short_reads() {
        use std::io::Cursor;
        let mut source = Cursor::new(vec![7u8; 1500]);
        let mut buf = [0u8; 1000];
        assert_eq!(read_chunk(&mut source, &mut buf).unwrap(), 1000);
        assert_eq!(read_chunk(&mut source, &mut buf).unwrap(), 500);
        assert_eq!(read_chunk(&mut source, &mut buf).unwrap(), 0);
    }
}
