use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::utils::Diagnostics;

/// Descripteur utilisé quand l'adresse du client ne peut pas être rendue
pub const UNKNOWN_PEER: &str = "unknown";

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Alloue l'identifiant suivant pour une nouvelle session.
///
/// Le compteur démarre à zéro et est incrémenté avant lecture : le premier
/// identifiant vaut 1 et aucune valeur n'est réutilisée tant que le
/// processus tourne.
pub fn next_session_id() -> u64 {
    SESSION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerAddrError {
    #[error("address family {0} not supported")]
    Family(i32),
    #[error("no peer address supplied")]
    Missing,
}

/// Adresse du client telle que fournie par le MTA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    Inet(SocketAddr),
    Unsupported { family: i32 },
    Missing,
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        PeerAddr::Inet(addr)
    }
}

impl PeerAddr {
    /// Décode une `struct sockaddr` brute.
    ///
    /// # Safety
    ///
    /// `addr` doit être nul ou pointer vers une structure valide dont la taille
    /// correspond à la famille annoncée dans `sa_family`.
    pub unsafe fn from_raw(addr: *const libc::sockaddr) -> Self {
        if addr.is_null() {
            return PeerAddr::Missing;
        }

        // SAFETY: non nul, l'appelant garantit au moins une struct sockaddr
        let family = unsafe { std::ptr::read_unaligned(addr) }.sa_family as libc::c_int;

        match family {
            libc::AF_INET => {
                // SAFETY: la famille AF_INET implique une sockaddr_in complète
                let sin: libc::sockaddr_in = unsafe { std::ptr::read_unaligned(addr.cast()) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                PeerAddr::Inet(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                // SAFETY: la famille AF_INET6 implique une sockaddr_in6 complète
                let sin6: libc::sockaddr_in6 = unsafe { std::ptr::read_unaligned(addr.cast()) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                PeerAddr::Inet(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    u32::from_be(sin6.sin6_flowinfo),
                    sin6.sin6_scope_id,
                )))
            }
            other => PeerAddr::Unsupported { family: other },
        }
    }
}

/// Rend l'adresse sous forme numérique : `hôte:port` en IPv4,
/// `[hôte]:port` en IPv6.
pub fn describe_peer(peer: &PeerAddr) -> Result<String, PeerAddrError> {
    match peer {
        PeerAddr::Inet(SocketAddr::V4(addr)) => Ok(format!("{}:{}", addr.ip(), addr.port())),
        PeerAddr::Inet(SocketAddr::V6(addr)) => {
            if addr.scope_id() != 0 {
                Ok(format!("[{}%{}]:{}", addr.ip(), addr.scope_id(), addr.port()))
            } else {
                Ok(format!("[{}]:{}", addr.ip(), addr.port()))
            }
        }
        PeerAddr::Unsupported { family } => Err(PeerAddrError::Family(*family)),
        PeerAddr::Missing => Err(PeerAddrError::Missing),
    }
}

/// Comme `describe_peer`, mais se replie sur `"unknown"` après avoir
/// signalé l'erreur.
pub fn network_descriptor(session: u64, peer: &PeerAddr, sink: &dyn Diagnostics) -> String {
    match describe_peer(peer) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            sink.report(Some(session), &e.to_string());
            UNKNOWN_PEER.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::Recorder;
    use std::collections::HashSet;

    #[test]
    fn formats_ipv4_as_host_port() {
        let peer = PeerAddr::from("203.0.113.5:25".parse::<SocketAddr>().unwrap());
        assert_eq!(describe_peer(&peer).unwrap(), "203.0.113.5:25");
    }

    #[test]
    fn brackets_ipv6_host() {
        let peer = PeerAddr::from("[2001:db8::1]:587".parse::<SocketAddr>().unwrap());
        assert_eq!(describe_peer(&peer).unwrap(), "[2001:db8::1]:587");
    }

    #[test]
    fn unsupported_family_degrades_to_unknown_with_one_report() {
        let recorder = Recorder::default();
        let peer = PeerAddr::Unsupported { family: libc::AF_UNIX };

        assert_eq!(network_descriptor(1, &peer, &recorder), UNKNOWN_PEER);
        assert_eq!(recorder.report_count(), 1);

        assert_eq!(network_descriptor(2, &PeerAddr::Missing, &recorder), UNKNOWN_PEER);
        assert_eq!(recorder.report_count(), 2);
    }

    #[test]
    fn resolvable_peer_emits_no_report() {
        let recorder = Recorder::default();
        let peer = PeerAddr::from("198.51.100.7:2525".parse::<SocketAddr>().unwrap());

        assert_eq!(network_descriptor(1, &peer, &recorder), "198.51.100.7:2525");
        assert_eq!(recorder.report_count(), 0);
    }

    #[test]
    fn decodes_raw_ipv4_sockaddr() {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = 25u16.to_be();
        sin.sin_addr.s_addr = u32::from(Ipv4Addr::new(203, 0, 113, 5)).to_be();

        let peer = unsafe { PeerAddr::from_raw((&sin as *const libc::sockaddr_in).cast()) };
        assert_eq!(describe_peer(&peer).unwrap(), "203.0.113.5:25");
    }

    #[test]
    fn decodes_raw_ipv6_sockaddr() {
        let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sin6.sin6_port = 587u16.to_be();
        sin6.sin6_addr.s6_addr = "2001:db8::1".parse::<Ipv6Addr>().unwrap().octets();

        let peer = unsafe { PeerAddr::from_raw((&sin6 as *const libc::sockaddr_in6).cast()) };
        assert_eq!(describe_peer(&peer).unwrap(), "[2001:db8::1]:587");
    }

    #[test]
    fn raw_unix_socket_is_unsupported() {
        let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;

        let peer = unsafe { PeerAddr::from_raw((&sun as *const libc::sockaddr_un).cast()) };
        assert_eq!(peer, PeerAddr::Unsupported { family: libc::AF_UNIX });
        assert_eq!(unsafe { PeerAddr::from_raw(std::ptr::null()) }, PeerAddr::Missing);
    }

    #[test]
    fn concurrent_allocation_never_repeats() {
        let ids: Vec<u64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| (0..500).map(|_| next_session_id()).collect::<Vec<_>>()))
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let unique: HashSet<u64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(ids.iter().all(|&id| id > 0));
    }
}
