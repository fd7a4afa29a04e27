//! Receiver entry point: serves exactly one transmission, then exits.
//!
//! Usage: receiver <listen_port> <sender_address> <sender_port> [output_dir]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use parcel_transfer::{run_receiver, ReceiverConfig, UdpChannel};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 4 && args.len() != 5 {
        eprintln!(
            "usage: {} <listen_port> <sender_address> <sender_port> [output_dir]",
            args[0]
        );
        return ExitCode::FAILURE;
    }

    let (listen_port, sender_ip, sender_port) =
        match (args[1].parse::<u16>(), args[2].parse::<IpAddr>(), args[3].parse::<u16>()) {
            (Ok(listen), Ok(ip), Ok(port)) => (listen, ip, port),
            _ => {
                eprintln!("invalid port or address argument");
                return ExitCode::FAILURE;
            }
        };

    let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), listen_port);
    let peer = SocketAddr::new(sender_ip, sender_port);

    let channel = match UdpChannel::bind(local, peer) {
        Ok(channel) => channel,
        Err(e) => {
            log::error!("failed to bind the listening socket: {}", e);
            return ExitCode::FAILURE;
        }
    };
    log::info!("listening on port {}, acknowledging to {}", listen_port, peer);

    let config = ReceiverConfig {
        output_dir: args.get(4).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
        ..Default::default()
    };

    match run_receiver(&channel, config) {
        Ok(report) => {
            log::info!(
                "received {} bytes in {} packets ({:.1}s), wrote {}",
                report.total_bytes,
                report.total_packets,
                report.elapsed.as_secs_f64(),
                report.path.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("reception failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
