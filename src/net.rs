use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::PortRange;
use crate::error::{Error, Result};

/// Bind a UDP socket on the first free port of the range. Must be called
/// from within a tokio runtime.
pub fn bind_udp_port_range(address: IpAddr, range: PortRange) -> Result<UdpSocket> {
    if range.max < range.min {
        return Err(Error::configuration("media port range is empty"));
    }
    let mut last_err = None;
    for port in range.min..=range.max {
        match bind_udp_socket(address, port) {
            Ok(socket) => return Ok(socket),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err
        .unwrap_or_else(|| Error::configuration("no usable media port in the configured range")))
}

fn bind_udp_socket(address: IpAddr, port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::new(address, port);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}
