//! Sender entry point: one file transfer per invocation.
//!
//! Usage: sender <file> <receiver_port> <receiver_address> <local_port>

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process::ExitCode;

use parcel_transfer::{transfer_file, SenderConfig, UdpChannel};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 5 {
        eprintln!("usage: {} <file> <receiver_port> <receiver_address> <local_port>", args[0]);
        return ExitCode::FAILURE;
    }

    let file_path = Path::new(&args[1]);
    let (receiver_port, receiver_ip, local_port) =
        match (args[2].parse::<u16>(), args[3].parse::<IpAddr>(), args[4].parse::<u16>()) {
            (Ok(port), Ok(ip), Ok(local)) => (port, ip, local),
            _ => {
                eprintln!("invalid port or address argument");
                return ExitCode::FAILURE;
            }
        };

    let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), local_port);
    let peer = SocketAddr::new(receiver_ip, receiver_port);

    let channel = match UdpChannel::bind(local, peer) {
        Ok(channel) => channel,
        Err(e) => {
            log::error!("failed to bind the local socket: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match transfer_file(&channel, &SenderConfig::default(), file_path) {
        Ok(report) => {
            let secs = report.elapsed.as_secs_f64();
            let rate = if secs > 0.0 {
                (report.total_bytes as f64 / secs) as u64
            } else {
                0
            };
            log::info!(
                "transfer complete: {} bytes in {} packets, {:.1}s ({} B/s, {} retransmits)",
                report.total_bytes,
                report.total_packets,
                secs,
                rate,
                report.retransmits
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("transfer failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
