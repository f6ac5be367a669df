use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use rand::Rng;

const RANDOM_ATTEMPTS: usize = 10;

/// A localhost address nothing listens on when this returns. Random ports are
/// tried first, then the OS is asked for one.
pub fn next_addr() -> SocketAddr {
    let mut rng = rand::rng();

    loop {
        for _ in 0..RANDOM_ATTEMPTS {
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, rng.random_range(15000..25000)));
            if TcpListener::bind(addr).is_ok() {
                return addr;
            }
        }

        if let Ok(addr) = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).and_then(|l| l.local_addr()) {
            return addr;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unused() {
        let addr = next_addr();

        assert!(addr.ip().is_loopback());
        // nothing listens, so the port can be bound right away
        TcpListener::bind(addr).unwrap();
    }
}
