//! Receiver transmission controller.
//!
//! A single-admission state machine: at most one transmission is tracked at a
//! time. Inbound frames are CRC-validated first, then demultiplexed by type;
//! data packets are buffered by index until the END packet triggers digest
//! verification and the file is materialized in one pass. A frame that fails
//! its checksum is answered with a negative acknowledgement and never touches
//! the state machine.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::channel::DatagramChannel;
use crate::digest::TransferDigest;
use crate::packet::{
    decode_frame, DecodeOutcome, Packet, PacketBody, PacketType, HASH_SIZE, MAX_PACKET_SIZE,
};

/// Longest accepted destination file name, in bytes. Announced names are
/// truncated, never overrun.
pub const MAX_FILE_NAME: usize = 255;

/// Receiver configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Directory the verified file is written into.
    pub output_dir: PathBuf,
    /// How long to stay around after success to re-answer duplicate END
    /// packets whose first response was lost.
    pub grace_period: Duration,
    /// Sleep between polls when the channel is quiet.
    pub poll_sleep: Duration,
    /// Give up when the channel stays silent this long. `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            output_dir: PathBuf::from("."),
            grace_period: Duration::from_secs(3),
            poll_sleep: Duration::from_millis(10),
            idle_timeout: None,
        }
    }
}

/// What the state machine wants the surrounding loop to do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep polling.
    Continue,
    /// The file is written and verified; the success response went out.
    Complete,
    /// The declared digest did not match the reassembled data. Buffers are
    /// kept so the failure can be inspected, but the transfer cannot succeed.
    DigestMismatch,
}

/// Summary of a completed reception.
#[derive(Debug)]
pub struct RecvReport {
    pub path: PathBuf,
    pub total_bytes: u64,
    pub total_packets: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum RecvError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("sha-256 digest mismatch between sender and reassembled data")]
    DigestMismatch,
    #[error("no transfer activity within {0:?}")]
    Idle(Duration),
}

/// Reassembly state for the one admitted transmission.
struct ActiveTransmission {
    transmission_id: u32,
    file_name: String,
    total_packet_count: u32,
    /// Payload per index, `None` until that data packet arrives.
    packets: Vec<Option<Vec<u8>>>,
    received_count: u32,
    received_bytes: u64,
}

/// Cached outcome of a successful transmission, kept so that retransmitted
/// END packets can be re-answered without recomputation.
struct Completed {
    transmission_id: u32,
    response: Vec<u8>,
    path: PathBuf,
    file_size: u64,
    total_packets: u32,
}

pub struct Receiver {
    config: ReceiverConfig,
    active: Option<ActiveTransmission>,
    completed: Option<Completed>,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Receiver {
            config,
            active: None,
            completed: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// (received, total) packet counts of the admitted transmission.
    pub fn progress(&self) -> Option<(u32, u32)> {
        self.active
            .as_ref()
            .map(|t| (t.received_count, t.total_packet_count))
    }

    /// Feed one raw inbound frame through the state machine. Acknowledgements
    /// are sent on `channel`; failures to send them are logged, not fatal.
    pub fn handle_frame<C: DatagramChannel>(
        &mut self,
        frame: &[u8],
        channel: &C,
    ) -> Result<Step, RecvError> {
        match decode_frame(frame) {
            DecodeOutcome::Garbage => {
                log::debug!("dropping an unrecognizable {}-byte frame", frame.len());
                Ok(Step::Continue)
            }
            DecodeOutcome::Corrupt {
                claimed_type,
                transmission_id,
                index,
            } => {
                log::warn!(
                    "checksum failure on a {:?} frame for transmission {:08x}",
                    claimed_type,
                    transmission_id
                );
                send_ack(channel, transmission_id, claimed_type, false, index);
                Ok(Step::Continue)
            }
            DecodeOutcome::Valid(packet) => self.dispatch(packet, channel),
        }
    }

    fn dispatch<C: DatagramChannel>(
        &mut self,
        packet: Packet,
        channel: &C,
    ) -> Result<Step, RecvError> {
        let id = packet.transmission_id;
        match packet.body {
            PacketBody::Start {
                total_packet_count,
                file_name,
            } => Ok(self.on_start(id, total_packet_count, &file_name, channel)),
            PacketBody::Data { index, data } => Ok(self.on_data(id, index, data, channel)),
            PacketBody::End { file_size, digest } => self.on_end(id, file_size, digest, channel),
            PacketBody::EndResponse { .. } | PacketBody::Ack { .. } => {
                log::debug!("ignoring a packet addressed to the sender role");
                Ok(Step::Continue)
            }
        }
    }

    fn on_start<C: DatagramChannel>(
        &mut self,
        id: u32,
        total_packet_count: u32,
        file_name: &str,
        channel: &C,
    ) -> Step {
        if let Some(active) = &self.active {
            // The in-flight transmission is never replaced. A retransmitted
            // START for it is still acknowledged so the sender can unblock.
            if active.transmission_id == id {
                log::debug!("duplicate start packet for transmission {:08x}", id);
            } else {
                log::warn!(
                    "start packet for transmission {:08x} while {:08x} is in progress",
                    id,
                    active.transmission_id
                );
            }
            send_ack(channel, id, PacketType::Start, true, None);
            return Step::Continue;
        }

        let file_name = sanitize_file_name(file_name);
        log::info!(
            "transmission {:08x}: start, {} packets, file '{}'",
            id,
            total_packet_count,
            file_name
        );
        self.active = Some(ActiveTransmission {
            transmission_id: id,
            file_name,
            total_packet_count,
            packets: vec![None; total_packet_count as usize],
            received_count: 0,
            received_bytes: 0,
        });
        send_ack(channel, id, PacketType::Start, true, None);
        Step::Continue
    }

    fn on_data<C: DatagramChannel>(
        &mut self,
        id: u32,
        index: u32,
        data: Vec<u8>,
        channel: &C,
    ) -> Step {
        let Some(active) = &mut self.active else {
            log::debug!("data packet before any transmission start, dropping");
            return Step::Continue;
        };
        if index >= active.total_packet_count {
            log::warn!(
                "data packet index {} out of range (total {})",
                index,
                active.total_packet_count
            );
            return Step::Continue;
        }
        if id != active.transmission_id {
            log::warn!(
                "data packet for transmission {:08x}, expected {:08x}",
                id,
                active.transmission_id
            );
            return Step::Continue;
        }
        if active.packets[index as usize].is_some() {
            // Re-delivery of a filled index is an acknowledged no-op.
            log::debug!("packet {} already buffered, re-acknowledging", index);
            send_ack(channel, id, PacketType::Data, true, Some(index));
            return Step::Continue;
        }

        active.received_bytes += data.len() as u64;
        active.packets[index as usize] = Some(data);
        active.received_count += 1;
        log::debug!(
            "transmission {:08x}: packet {} buffered, {} remaining",
            id,
            index,
            active.total_packet_count - active.received_count
        );
        send_ack(channel, id, PacketType::Data, true, Some(index));
        Step::Continue
    }

    fn on_end<C: DatagramChannel>(
        &mut self,
        id: u32,
        file_size: u32,
        declared_digest: [u8; HASH_SIZE],
        channel: &C,
    ) -> Result<Step, RecvError> {
        if let Some(done) = &self.completed {
            if done.transmission_id == id {
                // The earlier success response was lost; replay it as-is.
                log::debug!("re-answering a duplicate end packet for {:08x}", id);
                if let Err(e) = channel.send(&done.response) {
                    log::warn!("failed to resend the end response: {}", e);
                }
                return Ok(Step::Complete);
            }
            log::debug!("end packet for unknown finished transmission {:08x}", id);
            return Ok(Step::Continue);
        }

        let Some(active) = &self.active else {
            log::warn!("end packet before any transmission start, dropping");
            return Ok(Step::Continue);
        };
        if id != active.transmission_id {
            log::warn!(
                "end packet for transmission {:08x}, expected {:08x}",
                id,
                active.transmission_id
            );
            return Ok(Step::Continue);
        }

        // Recompute the digest over the buffered payloads in index order;
        // arrival order is irrelevant.
        let mut digest = TransferDigest::new();
        for slot in active.packets.iter().flatten() {
            digest.update(slot);
        }
        let computed = digest.finalize();

        if computed != declared_digest {
            log::error!(
                "transmission {:08x}: digest mismatch ({}/{} packets buffered)",
                id,
                active.received_count,
                active.total_packet_count
            );
            log::error!("  declared: {}", hex::encode(declared_digest));
            log::error!("  computed: {}", hex::encode(computed));
            send_end_response(channel, id, false);
            return Ok(Step::DigestMismatch);
        }

        if active.received_bytes != file_size as u64 {
            log::warn!(
                "declared file size {} differs from received byte count {}",
                file_size,
                active.received_bytes
            );
        }

        // Verification passed: materialize the file. It is only created here,
        // so no partial file ever exists on a failed transfer.
        let Some(active) = self.active.take() else {
            return Ok(Step::Continue);
        };
        let path = self.config.output_dir.join(&active.file_name);
        let mut file = File::create(&path)?;
        for slot in active.packets.iter().flatten() {
            file.write_all(slot)?;
        }
        file.sync_all()?;
        log::info!(
            "transmission {:08x}: wrote {} bytes to {}",
            id,
            active.received_bytes,
            path.display()
        );

        let response = Packet {
            transmission_id: id,
            body: PacketBody::EndResponse { status: true },
        }
        .encode();
        if let Err(e) = channel.send(&response) {
            log::warn!("failed to send the end response: {}", e);
        }
        self.completed = Some(Completed {
            transmission_id: id,
            response,
            path,
            file_size: active.received_bytes,
            total_packets: active.total_packet_count,
        });
        Ok(Step::Complete)
    }

    /// Frame handling for the shutdown grace window. Only duplicate END
    /// packets for the finished transmission are re-answered; corrupt frames
    /// still draw a negative acknowledgement. A START or DATA frame arriving
    /// now is ignored so a new sender is not strung along by a process that
    /// is about to exit.
    pub fn handle_shutdown_frame<C: DatagramChannel>(&self, frame: &[u8], channel: &C) {
        match decode_frame(frame) {
            DecodeOutcome::Corrupt {
                claimed_type,
                transmission_id,
                index,
            } => {
                send_ack(channel, transmission_id, claimed_type, false, index);
            }
            DecodeOutcome::Valid(Packet {
                transmission_id,
                body: PacketBody::End { .. },
            }) => match &self.completed {
                Some(done) if done.transmission_id == transmission_id => {
                    log::debug!(
                        "re-answering a duplicate end packet for {:08x} during shutdown",
                        transmission_id
                    );
                    if let Err(e) = channel.send(&done.response) {
                        log::warn!("failed to resend the end response: {}", e);
                    }
                }
                _ => {
                    log::debug!(
                        "ignoring an end packet for {:08x} during shutdown",
                        transmission_id
                    );
                }
            },
            _ => {
                log::debug!("ignoring a frame during the shutdown grace period");
            }
        }
    }
}

/// Serve exactly one transmission to completion, then linger for the grace
/// period to re-answer retransmitted END packets before returning.
pub fn run_receiver<C: DatagramChannel>(
    channel: &C,
    config: ReceiverConfig,
) -> Result<RecvReport, RecvError> {
    let poll_sleep = config.poll_sleep;
    let grace_period = config.grace_period;
    let idle_timeout = config.idle_timeout;

    let started = Instant::now();
    let mut receiver = Receiver::new(config);
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut last_activity = Instant::now();

    loop {
        if let Some(limit) = idle_timeout {
            if last_activity.elapsed() >= limit {
                return Err(RecvError::Idle(limit));
            }
        }
        match channel.try_recv(&mut buf)? {
            None => thread::sleep(poll_sleep),
            Some(len) => {
                last_activity = Instant::now();
                match receiver.handle_frame(&buf[..len], channel)? {
                    Step::Continue => {}
                    Step::DigestMismatch => return Err(RecvError::DigestMismatch),
                    Step::Complete => break,
                }
            }
        }
    }

    // Deferred shutdown: the sender may not have seen the success response
    // yet, so duplicate END packets are re-answered until the grace period
    // runs out. Nothing new is admitted in this window.
    let deadline = Instant::now() + grace_period;
    while Instant::now() < deadline {
        match channel.try_recv(&mut buf)? {
            None => thread::sleep(poll_sleep),
            Some(len) => receiver.handle_shutdown_frame(&buf[..len], channel),
        }
    }

    let done = receiver
        .completed
        .expect("a complete step implies a finished transmission");
    Ok(RecvReport {
        path: done.path,
        total_bytes: done.file_size,
        total_packets: done.total_packets,
        elapsed: started.elapsed(),
    })
}

fn send_ack<C: DatagramChannel>(
    channel: &C,
    transmission_id: u32,
    echoed_type: PacketType,
    status: bool,
    index: Option<u32>,
) {
    let frame = Packet {
        transmission_id,
        body: PacketBody::Ack {
            echoed_type,
            status,
            index: if echoed_type == PacketType::Data {
                Some(index.unwrap_or(0))
            } else {
                None
            },
        },
    }
    .encode();
    if let Err(e) = channel.send(&frame) {
        log::warn!("failed to send an acknowledgement: {}", e);
    }
}

fn send_end_response<C: DatagramChannel>(channel: &C, transmission_id: u32, status: bool) {
    let frame = Packet {
        transmission_id,
        body: PacketBody::EndResponse { status },
    }
    .encode();
    if let Err(e) = channel.send(&frame) {
        log::warn!("failed to send the end response: {}", e);
    }
}

/// Reduce an announced file name to a safe, bounded base name.
fn sanitize_file_name(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let base = match base {
        "" | "." | ".." => "unnamed",
        other => other,
    };
    let mut end = base.len().min(MAX_FILE_NAME);
    while !base.is_char_boundary(end) {
        end -= 1;
    }
    base[..end].to_owned()
}
