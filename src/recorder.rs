/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! The recorder supervisor.
//!
//! Joins the multicast group, demultiplexes packets by SSRC onto one
//! bounded queue per channel processor, and maintains the status snapshot.
//! Channels share nothing with each other; the queues are the only link
//! between the receive loop and the processors.

use crate::{
    channel::ChannelProcessor,
    config::{ChannelConfig, RecorderConfig},
    error::{PacketError, TimemarkResult},
    rtp::{IqPacket, PacketParser},
    socket::create_rx_socket,
    status::{ChannelStatus, RecorderStatus, SupervisorCounters, write_json_atomic},
    timing::NtpMonitor,
};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{net::UdpSocket, select, sync::mpsc};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, error, info, warn};

const PACKET_QUEUE_DEPTH: usize = 1024;
const STATUS_QUEUE_DEPTH: usize = 256;
const CHANNEL_STATUS_PUSH_SECS: u64 = 2;

enum StatusUpdate {
    Channel(String, ChannelStatus),
    Supervisor(SupervisorCounters),
}

/// Starts the receive loop, one processor subsystem per channel and the
/// status writer.
pub async fn run_recorder(
    subsys: SubsystemHandle,
    config: RecorderConfig,
    service: String,
    hostname: String,
) -> TimemarkResult<()> {
    info!(
        "Starting recorder: group {}:{}, {} channel(s)",
        config.group,
        config.port,
        config.channels.len()
    );

    let ntp = Arc::new(NtpMonitor::default());
    let (status_tx, status_rx) = mpsc::channel(STATUS_QUEUE_DEPTH);

    let mut packet_senders = HashMap::new();
    for channel in config.channels.clone() {
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_DEPTH);
        packet_senders.insert(channel.ssrc, packet_tx);

        let name = format!("channel-{}", channel.name);
        let output_dir = config.output_dir.clone();
        let startup_secs = config.startup_buffer_secs;
        let ntp = ntp.clone();
        let status_tx = status_tx.clone();
        subsys.start(SubsystemBuilder::new(name, move |s| {
            channel_task(s, channel, output_dir, startup_secs, ntp, packet_rx, status_tx)
        }));
    }

    let status_path = if config.status_file.is_relative() {
        config.output_dir.join(&config.status_file)
    } else {
        config.status_file.clone()
    };
    let interval = config.status_interval_secs.clamp(1, 10);
    subsys.start(SubsystemBuilder::new("status", move |s| {
        status_task(s, status_path, interval, status_rx, service, hostname)
    }));

    subsys.start(SubsystemBuilder::new("receiver", move |s| {
        receive_task(s, config, packet_senders, status_tx)
    }));

    Ok(())
}

async fn channel_task(
    subsys: SubsystemHandle,
    config: ChannelConfig,
    output_dir: PathBuf,
    startup_secs: u32,
    ntp: Arc<NtpMonitor>,
    mut packets: mpsc::Receiver<IqPacket>,
    status_tx: mpsc::Sender<StatusUpdate>,
) -> TimemarkResult<()> {
    let name = config.name.clone();
    info!("Channel processor '{name}' started.");
    let mut processor = ChannelProcessor::new(config, output_dir, startup_secs, ntp);
    let mut ticker = tokio::time::interval(Duration::from_secs(CHANNEL_STATUS_PUSH_SECS));

    loop {
        select! {
            packet = packets.recv() => match packet {
                Some(packet) => processor.handle_packet(packet),
                None => break,
            },
            _ = ticker.tick() => {
                status_tx
                    .try_send(StatusUpdate::Channel(name.clone(), processor.status()))
                    .ok();
            },
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    // Drain in-flight packets, then flush the partial minute.
    while let Ok(packet) = packets.try_recv() {
        processor.handle_packet(packet);
    }
    processor.shutdown();
    status_tx
        .try_send(StatusUpdate::Channel(name.clone(), processor.status()))
        .ok();
    info!("Channel processor '{name}' stopped.");
    Ok(())
}

async fn receive_task(
    subsys: SubsystemHandle,
    config: RecorderConfig,
    senders: HashMap<u32, mpsc::Sender<IqPacket>>,
    status_tx: mpsc::Sender<StatusUpdate>,
) -> TimemarkResult<()> {
    let socket = create_rx_socket(config.group, config.port, config.interface_ip)?;
    let socket = UdpSocket::from_std(socket)?;
    let mut demux = PacketDemux::new(&config.payload_types, senders);
    let mut buffer = [0u8; 65_535];
    let mut ticker = tokio::time::interval(Duration::from_secs(CHANNEL_STATUS_PUSH_SECS));

    loop {
        select! {
            received = socket.recv_from(&mut buffer) => match received {
                Ok((len, _)) => demux.handle_datagram(&buffer[..len]),
                Err(e) => {
                    demux.counters.receive_errors += 1;
                    warn!("socket receive error: {e}");
                }
            },
            _ = ticker.tick() => {
                status_tx
                    .try_send(StatusUpdate::Supervisor(demux.counters))
                    .ok();
            },
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    status_tx
        .try_send(StatusUpdate::Supervisor(demux.counters))
        .ok();
    info!("Receive loop stopped.");
    Ok(())
}

/// Parses datagrams and routes each packet to the one channel processor
/// owning its SSRC.
struct PacketDemux {
    parser: PacketParser,
    senders: HashMap<u32, mpsc::Sender<IqPacket>>,
    counters: SupervisorCounters,
    logged_payload_types: HashSet<u8>,
    logged_ssrcs: HashSet<u32>,
}

impl PacketDemux {
    fn new(payload_types: &[u8], senders: HashMap<u32, mpsc::Sender<IqPacket>>) -> Self {
        Self {
            parser: PacketParser::new(payload_types),
            senders,
            counters: SupervisorCounters::default(),
            logged_payload_types: HashSet::new(),
            logged_ssrcs: HashSet::new(),
        }
    }

    fn handle_datagram(&mut self, data: &[u8]) {
        let packet = match self.parser.parse(data) {
            Ok(packet) => packet,
            Err(PacketError::UnsupportedPayload(pt)) => {
                self.counters.unknown_payload_type += 1;
                if self.logged_payload_types.insert(pt) {
                    warn!("dropping packets with unsupported payload type {pt}");
                }
                return;
            }
            Err(e) => {
                self.counters.malformed_packets += 1;
                debug!("dropping malformed packet: {e}");
                return;
            }
        };

        let Some(sender) = self.senders.get(&packet.ssrc) else {
            self.counters.unknown_ssrc += 1;
            if self.logged_ssrcs.insert(packet.ssrc) {
                warn!("dropping packets from unknown SSRC {:#010x}", packet.ssrc);
            }
            return;
        };

        if sender.try_send(packet).is_err() {
            self.counters.queue_overflows += 1;
        }
    }
}

async fn status_task(
    subsys: SubsystemHandle,
    path: PathBuf,
    interval_secs: u64,
    mut updates: mpsc::Receiver<StatusUpdate>,
    service: String,
    hostname: String,
) -> TimemarkResult<()> {
    let mut status = RecorderStatus::new(service, hostname);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        select! {
            update = updates.recv() => match update {
                Some(update) => apply_update(&mut status, update),
                None => break,
            },
            _ = ticker.tick() => {
                status.refresh_health();
                if let Err(e) = write_json_atomic(&path, &status) {
                    error!("writing status snapshot {}: {e}", path.to_string_lossy());
                }
            },
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    while let Ok(update) = updates.try_recv() {
        apply_update(&mut status, update);
    }
    status.refresh_health();
    if let Err(e) = write_json_atomic(&path, &status) {
        error!("writing final status snapshot: {e}");
    }
    Ok(())
}

fn apply_update(status: &mut RecorderStatus, update: StatusUpdate) {
    match update {
        StatusUpdate::Channel(name, channel) => {
            status.channels.insert(name, channel);
        }
        StatusUpdate::Supervisor(counters) => status.supervisor = counters,
    }
}
