//! End-to-end tests: drive both transmission controllers against an
//! in-memory lossless channel pair, plus one real UDP loopback transfer.
//! The protocol-level edge cases (duplicates, reordering, corruption, digest
//! mismatch) feed hand-built frames straight into the receiver state machine.

use std::collections::HashSet;
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use parcel_transfer::{
    decode_frame, memory_pair, run_receiver, send_file, send_stream, DatagramChannel,
    DecodeOutcome, MemoryChannel, Packet, PacketBody, PacketType, Receiver, ReceiverConfig,
    SendError, SenderConfig, Step, TransferDigest, UdpChannel, MAX_PACKET_SIZE,
    MAX_UNACKNOWLEDGED_PACKETS,
};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn sha256_of(data: &[u8]) -> [u8; 32] {
    let mut digest = TransferDigest::new();
    digest.update(data);
    digest.finalize()
}

fn test_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("parcel_transfer_test_{}", tag));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn fast_sender_config() -> SenderConfig {
    SenderConfig {
        ack_wait: Duration::from_millis(200),
        overall_timeout: Duration::from_secs(5),
        inactivity_timeout: Duration::from_secs(2),
        resend_timeout: Duration::from_millis(100),
        poll_sleep: Duration::from_millis(1),
        max_attempts: 1,
    }
}

fn fast_receiver_config(output_dir: PathBuf) -> ReceiverConfig {
    ReceiverConfig {
        output_dir,
        grace_period: Duration::from_millis(50),
        poll_sleep: Duration::from_millis(1),
        idle_timeout: Some(Duration::from_secs(5)),
    }
}

fn start_frame(id: u32, total: u32, name: &str) -> Vec<u8> {
    Packet {
        transmission_id: id,
        body: PacketBody::Start {
            total_packet_count: total,
            file_name: name.into(),
        },
    }
    .encode()
}

fn data_frame(id: u32, index: u32, data: &[u8]) -> Vec<u8> {
    Packet {
        transmission_id: id,
        body: PacketBody::Data {
            index,
            data: data.to_vec(),
        },
    }
    .encode()
}

fn end_frame(id: u32, file_size: u32, digest: [u8; 32]) -> Vec<u8> {
    Packet {
        transmission_id: id,
        body: PacketBody::End { file_size, digest },
    }
    .encode()
}

/// Decode everything the receiver sent back so far.
fn drain_replies(end: &MemoryChannel) -> Vec<Packet> {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let mut replies = Vec::new();
    while let Some(len) = end.try_recv(&mut buf).unwrap() {
        if let DecodeOutcome::Valid(packet) = decode_frame(&buf[..len]) {
            replies.push(packet);
        }
    }
    replies
}

/// Run a full transfer of `len` patterned bytes over the in-memory channel
/// and return the sender's packet count.
fn loopback_transfer(len: usize, tag: &str) -> u32 {
    let _ = env_logger::try_init();
    let dir = test_dir(tag);
    let data = pattern(len);

    let (sender_end, receiver_end) = memory_pair();
    let recv_config = fast_receiver_config(dir.clone());
    let recv_handle = thread::spawn(move || run_receiver(&receiver_end, recv_config));

    let report = send_stream(
        &sender_end,
        &fast_sender_config(),
        Cursor::new(data.clone()),
        len as u32,
        "transfer.bin",
    )
    .expect("sender failed");

    let recv_report = recv_handle
        .join()
        .expect("receiver panicked")
        .expect("receiver failed");

    assert_eq!(report.total_bytes, len as u64);
    assert_eq!(recv_report.total_bytes, len as u64);
    let written = fs::read(&recv_report.path).expect("output file missing");
    assert_eq!(written, data, "file contents differ");

    let _ = fs::remove_dir_all(&dir);
    report.total_packets
}

#[test]
fn round_trip_single_packet() {
    loopback_transfer(1, "tiny");
}

#[test]
fn round_trip_exact_packet_boundary() {
    assert_eq!(loopback_transfer(3000, "boundary"), 3);
}

#[test]
fn round_trip_larger_than_window() {
    // 25 packets, forcing the window to wrap several times.
    loopback_transfer(25_000, "windowed");
}

#[test]
fn concrete_three_packet_scenario() {
    // 2500 bytes => packets of 1000, 1000 and 500.
    assert_eq!(loopback_transfer(2500, "concrete"), 3);
}

#[test]
fn out_of_order_delivery_reassembles() {
    let _ = env_logger::try_init();
    let dir = test_dir("out_of_order");
    let data = pattern(2500);
    let chunks: Vec<&[u8]> = data.chunks(1000).collect();

    let (test_end, recv_end) = memory_pair();
    let mut receiver = Receiver::new(fast_receiver_config(dir.clone()));
    let id = 0x1234;

    receiver.handle_frame(&start_frame(id, 3, "ooo.bin"), &recv_end).unwrap();
    for i in [2usize, 0, 1] {
        let step = receiver
            .handle_frame(&data_frame(id, i as u32, chunks[i]), &recv_end)
            .unwrap();
        assert_eq!(step, Step::Continue);
    }
    assert_eq!(receiver.progress(), Some((3, 3)));

    let step = receiver
        .handle_frame(&end_frame(id, 2500, sha256_of(&data)), &recv_end)
        .unwrap();
    assert_eq!(step, Step::Complete);

    let written = fs::read(dir.join("ooo.bin")).unwrap();
    assert_eq!(written, data);

    drop(test_end);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn duplicate_data_is_acknowledged_but_not_rewritten() {
    let _ = env_logger::try_init();
    let dir = test_dir("duplicate");
    let data = pattern(1500);
    let chunks: Vec<&[u8]> = data.chunks(1000).collect();

    let (test_end, recv_end) = memory_pair();
    let mut receiver = Receiver::new(fast_receiver_config(dir.clone()));
    let id = 0x2222;

    receiver.handle_frame(&start_frame(id, 2, "dup.bin"), &recv_end).unwrap();
    let _ = drain_replies(&test_end);

    receiver.handle_frame(&data_frame(id, 0, chunks[0]), &recv_end).unwrap();
    receiver.handle_frame(&data_frame(id, 0, chunks[0]), &recv_end).unwrap();
    assert_eq!(receiver.progress(), Some((1, 2)));

    // Both deliveries must have been positively acknowledged.
    let replies = drain_replies(&test_end);
    assert_eq!(replies.len(), 2);
    for reply in replies {
        assert_eq!(
            reply.body,
            PacketBody::Ack {
                echoed_type: PacketType::Data,
                status: true,
                index: Some(0),
            }
        );
    }

    receiver.handle_frame(&data_frame(id, 1, chunks[1]), &recv_end).unwrap();
    let step = receiver
        .handle_frame(&end_frame(id, 1500, sha256_of(&data)), &recv_end)
        .unwrap();
    assert_eq!(step, Step::Complete);
    assert_eq!(fs::read(dir.join("dup.bin")).unwrap(), data);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn corrupted_frame_is_rejected_without_state_change() {
    let _ = env_logger::try_init();
    let dir = test_dir("corrupt");

    let (test_end, recv_end) = memory_pair();
    let mut receiver = Receiver::new(fast_receiver_config(dir.clone()));
    let id = 0x3333;

    receiver.handle_frame(&start_frame(id, 1, "c.bin"), &recv_end).unwrap();
    let _ = drain_replies(&test_end);

    let payload = pattern(500);
    let good = data_frame(id, 0, &payload);

    // Flip one bit in the payload, then one in the CRC itself.
    for flip_at in [10usize, good.len() - 1] {
        let mut bad = good.clone();
        bad[flip_at] ^= 0x01;
        let step = receiver.handle_frame(&bad, &recv_end).unwrap();
        assert_eq!(step, Step::Continue);
        assert_eq!(receiver.progress(), Some((0, 1)), "state must not change");

        let replies = drain_replies(&test_end);
        assert_eq!(replies.len(), 1);
        assert!(
            matches!(
                replies[0].body,
                PacketBody::Ack { status: false, .. }
            ),
            "a corrupt frame must only ever draw a negative acknowledgement"
        );
    }

    // The intact frame still goes through afterwards.
    receiver.handle_frame(&good, &recv_end).unwrap();
    assert_eq!(receiver.progress(), Some((1, 1)));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn digest_mismatch_yields_failure_and_no_file() {
    let _ = env_logger::try_init();
    let dir = test_dir("mismatch");
    let data = pattern(2500);

    let (test_end, recv_end) = memory_pair();
    let mut receiver = Receiver::new(fast_receiver_config(dir.clone()));
    let id = 0x4444;

    receiver.handle_frame(&start_frame(id, 3, "m.bin"), &recv_end).unwrap();
    for (i, chunk) in data.chunks(1000).enumerate() {
        // Silently corrupt the middle packet's payload after the fact: the
        // digest below is computed over the original bytes.
        let mut chunk = chunk.to_vec();
        if i == 1 {
            chunk[0] ^= 0xFF;
        }
        receiver.handle_frame(&data_frame(id, i as u32, &chunk), &recv_end).unwrap();
    }
    let _ = drain_replies(&test_end);

    let end = end_frame(id, 2500, sha256_of(&data));
    let step = receiver.handle_frame(&end, &recv_end).unwrap();
    assert_eq!(step, Step::DigestMismatch);
    assert!(!dir.join("m.bin").exists(), "no file may be written on mismatch");
    assert!(receiver.is_active(), "buffers are kept after a mismatch");

    let replies = drain_replies(&test_end);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].body, PacketBody::EndResponse { status: false });

    // A retried END reaches the same verdict.
    assert_eq!(receiver.handle_frame(&end, &recv_end).unwrap(), Step::DigestMismatch);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn end_before_start_is_ignored() {
    let _ = env_logger::try_init();
    let dir = test_dir("early_end");

    let (test_end, recv_end) = memory_pair();
    let mut receiver = Receiver::new(fast_receiver_config(dir.clone()));

    let step = receiver
        .handle_frame(&end_frame(0x5555, 100, [0u8; 32]), &recv_end)
        .unwrap();
    assert_eq!(step, Step::Continue);
    assert!(!receiver.is_active());
    assert!(drain_replies(&test_end).is_empty(), "no acknowledgement expected");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn second_start_does_not_replace_active_transmission() {
    let _ = env_logger::try_init();
    let dir = test_dir("second_start");

    let (test_end, recv_end) = memory_pair();
    let mut receiver = Receiver::new(fast_receiver_config(dir.clone()));

    receiver.handle_frame(&start_frame(0x6666, 5, "first.bin"), &recv_end).unwrap();
    receiver.handle_frame(&start_frame(0x7777, 9, "second.bin"), &recv_end).unwrap();

    // Still the first transmission's shape.
    assert_eq!(receiver.progress(), Some((0, 5)));
    drop(test_end);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn start_during_grace_period_is_not_admitted() {
    let _ = env_logger::try_init();
    let dir = test_dir("grace");
    let data = pattern(800);

    let (test_end, recv_end) = memory_pair();
    let config = ReceiverConfig {
        grace_period: Duration::from_millis(300),
        ..fast_receiver_config(dir.clone())
    };
    let handle = thread::spawn(move || run_receiver(&recv_end, config));

    let id = 0x8888;
    test_end.send(&start_frame(id, 1, "g.bin")).unwrap();
    test_end.send(&data_frame(id, 0, &data)).unwrap();
    test_end.send(&end_frame(id, 800, sha256_of(&data))).unwrap();

    // Wait for the success response, i.e. the start of the grace window.
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut completed = false;
    while Instant::now() < deadline && !completed {
        for reply in drain_replies(&test_end) {
            if reply.body == (PacketBody::EndResponse { status: true }) {
                completed = true;
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(completed, "transfer did not complete");

    // A new transmission and a retransmitted END, both inside the window.
    test_end.send(&start_frame(0x9999, 4, "late.bin")).unwrap();
    test_end.send(&end_frame(id, 800, sha256_of(&data))).unwrap();

    handle.join().expect("receiver panicked").expect("receiver failed");

    let replies = drain_replies(&test_end);
    assert!(
        replies
            .iter()
            .any(|r| r.body == (PacketBody::EndResponse { status: true })),
        "a duplicate END must still be re-answered"
    );
    assert!(
        !replies.iter().any(|r| matches!(
            r.body,
            PacketBody::Ack {
                echoed_type: PacketType::Start,
                ..
            }
        )),
        "no new transmission may be acknowledged during shutdown"
    );

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn window_never_exceeds_cap() {
    let _ = env_logger::try_init();

    let (test_end, sender_end) = memory_pair();
    let config = SenderConfig {
        ack_wait: Duration::from_millis(100),
        overall_timeout: Duration::from_secs(2),
        inactivity_timeout: Duration::from_millis(400),
        resend_timeout: Duration::from_millis(100),
        poll_sleep: Duration::from_millis(1),
        max_attempts: 1,
    };
    let data = pattern(50_000); // 50 packets available, none will be acked

    let handle = thread::spawn(move || {
        send_stream(&sender_end, &config, Cursor::new(data), 50_000, "big.bin")
    });

    let mut buf = [0u8; MAX_PACKET_SIZE];
    let mut start_acked = false;
    let mut indices_seen = HashSet::new();
    let deadline = Instant::now() + Duration::from_secs(5);

    while Instant::now() < deadline {
        match test_end.try_recv(&mut buf).unwrap() {
            None => {
                if handle.is_finished() {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            Some(len) => {
                if let DecodeOutcome::Valid(packet) = decode_frame(&buf[..len]) {
                    match packet.body {
                        PacketBody::Start { .. } if !start_acked => {
                            start_acked = true;
                            let ack = Packet {
                                transmission_id: packet.transmission_id,
                                body: PacketBody::Ack {
                                    echoed_type: PacketType::Start,
                                    status: true,
                                    index: None,
                                },
                            };
                            test_end.send(&ack.encode()).unwrap();
                        }
                        PacketBody::Data { index, .. } => {
                            indices_seen.insert(index);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    let result = handle.join().expect("sender panicked");
    assert!(
        matches!(result, Err(SendError::Stalled)),
        "an unacknowledged stream must end in a stall"
    );
    assert!(
        indices_seen.len() <= MAX_UNACKNOWLEDGED_PACKETS,
        "sender put {} distinct packets in flight",
        indices_seen.len()
    );
}

#[test]
fn udp_loopback_transfer() {
    let _ = env_logger::try_init();
    let dir = test_dir("udp");
    let input_dir = dir.join("in");
    let output_dir = dir.join("out");
    fs::create_dir_all(&input_dir).unwrap();
    fs::create_dir_all(&output_dir).unwrap();

    let data = pattern(10_240);
    let input_path = input_dir.join("input.bin");
    fs::write(&input_path, &data).unwrap();

    // Grab two free ports, then release them for the channels to rebind.
    let (sender_port, receiver_port) = {
        let a = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        (a.local_addr().unwrap().port(), b.local_addr().unwrap().port())
    };

    let localhost: std::net::IpAddr = "127.0.0.1".parse().unwrap();
    let sender_channel = UdpChannel::bind(
        (localhost, sender_port).into(),
        (localhost, receiver_port).into(),
    )
    .unwrap();
    let receiver_channel = UdpChannel::bind(
        (localhost, receiver_port).into(),
        (localhost, sender_port).into(),
    )
    .unwrap();

    let recv_config = fast_receiver_config(output_dir.clone());
    let recv_handle = thread::spawn(move || run_receiver(&receiver_channel, recv_config));

    // Give the receiver a moment to start polling.
    thread::sleep(Duration::from_millis(50));

    let report = send_file(&sender_channel, &fast_sender_config(), &input_path)
        .expect("sender failed");
    let recv_report = recv_handle
        .join()
        .expect("receiver panicked")
        .expect("receiver failed");

    assert_eq!(report.total_bytes, data.len() as u64);
    assert_eq!(recv_report.total_bytes, data.len() as u64);
    assert_eq!(fs::read(output_dir.join("input.bin")).unwrap(), data);

    let _ = fs::remove_dir_all(&dir);
}
