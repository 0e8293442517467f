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

use crate::error::{TimemarkError, TimemarkResult};
use socket2::{Domain, Protocol as SockProto, SockAddr, Socket, Type};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use tracing::{info, instrument};

/// Creates the non-blocking RX socket for radiod's multicast group, bound
/// to the group address with `SO_REUSEADDR` so multiple consumers can
/// listen alongside the recorder.
#[instrument]
pub fn create_rx_socket(group: IpAddr, port: u16, local_ip: IpAddr) -> TimemarkResult<UdpSocket> {
    let socket = match (group, local_ip) {
        (IpAddr::V4(group), IpAddr::V4(local)) => {
            info!("Creating IPv4 multicast RX socket for {group}:{port} at {local}");
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProto::UDP))?;
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;
            if group.is_multicast() {
                socket.join_multicast_v4(&group, &local)?;
                socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(group), port)))?;
            } else {
                socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(local), port)))?;
            }
            socket
        }
        (IpAddr::V6(group), IpAddr::V6(local)) => {
            info!("Creating IPv6 multicast RX socket for [{group}]:{port} at {local}");
            let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(SockProto::UDP))?;
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;
            if group.is_multicast() {
                socket.join_multicast_v6(&group, 0)?;
                socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V6(group), port)))?;
            } else {
                socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V6(local), port)))?;
            }
            socket
        }
        _ => {
            return Err(TimemarkError::InvalidConfig(
                "multicast group and interface IP must be the same address family".to_owned(),
            ));
        }
    };

    Ok(socket.into())
}
