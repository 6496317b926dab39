// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use core::net;
use core::time;
use std::net::TcpStream;
use std::thread;
use std::time::Instant;

use crate::driver::DriverError;

const POLL_INTERVAL: time::Duration = time::Duration::from_millis(500);
const CONNECT_TIMEOUT: time::Duration = time::Duration::from_secs(2);

/// Returns true if a TCP connection to the address can be established.
pub fn is_port_open(addr: net::SocketAddr) -> bool {
    TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok()
}

/// Poll until all ports accept TCP connections, or the timeout elapses.
pub fn wait_for_ports(
    addr: net::IpAddr,
    ports: &[u16],
    timeout: time::Duration,
) -> Result<(), DriverError> {
    let now = Instant::now();
    let mut pending: Vec<u16> = ports.to_vec();

    loop {
        pending.retain(|port| {
            let open = is_port_open(net::SocketAddr::new(addr, *port));
            if open {
                log::debug!("port {}:{} is open", addr, port);
            }
            !open
        });

        if pending.is_empty() {
            return Ok(());
        }

        if now.elapsed() > timeout {
            return Err(DriverError::PortsTimeout {
                addr,
                ports: pending,
                timeout,
            });
        }

        log::debug!("waiting for ports {:?} on {}", pending, addr);
        thread::sleep(POLL_INTERVAL.min(timeout));
    }
}
