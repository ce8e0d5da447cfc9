//! Provider discovery.
//!
//! [`getinfo`] is the entry point: it resolves node/service to a socket
//! address, checks the requested API version, and reports the provider's
//! capabilities and limits.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use bitflags::bitflags;

use crate::Flags;

/// Provider name reported in [`FabricInfo`].
pub const PROVIDER_NAME: &str = "udpe";

/// Oldest API version this provider accepts.
pub const VERSION_MIN: (u32, u32) = (1, 13);

/// Per-registration I/O vector limit.
pub const MR_IOV_LIMIT: usize = 4;
/// Transmit/receive scatter-gather limit.
pub const MSG_IOV_LIMIT: usize = 8;
/// Remote segments accepted in one RMA write.
pub const RMA_IOV_LIMIT: usize = 4;

/// Encode an API version the way callers request it.
pub const fn version(major: u32, minor: u32) -> (u32, u32) {
    (major, minor)
}

bitflags! {
    /// Memory-registration mode bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MrMode: u32 {
        /// The provider assigns region keys; requested keys are advisory.
        const PROV_KEY = 1 << 0;
        /// RMA targets are virtual addresses rather than region offsets.
        /// This provider never sets it.
        const VIRT_ADDR = 1 << 1;
    }
}

bitflags! {
    /// Flags accepted by [`getinfo`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GetInfoFlags: u32 {
        /// Resolve node/service as the local source address to bind.
        const SOURCE = 1 << 0;
    }
}

/// Endpoint type. Only reliable datagram is offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpType {
    ReliableDatagram,
}

/// Domain attributes.
#[derive(Debug, Clone)]
pub struct DomainAttr {
    pub mr_mode: MrMode,
    pub mr_iov_limit: usize,
}

/// Transmit attributes.
#[derive(Debug, Clone)]
pub struct TxAttr {
    pub iov_limit: usize,
    pub rma_iov_limit: usize,
}

/// Receive attributes.
#[derive(Debug, Clone)]
pub struct RxAttr {
    pub iov_limit: usize,
}

/// Discovery hints.
#[derive(Debug, Clone, Default)]
pub struct Hints {
    /// Required capabilities.
    pub caps: Flags,
    /// Required MR mode bits.
    pub mr_mode: MrMode,
    /// Destination name, as previously returned by `Endpoint::getname` on
    /// the peer (overrides node/service resolution for the destination).
    pub dest_name: Option<Vec<u8>>,
}

/// The provider's answer to [`getinfo`].
#[derive(Debug, Clone)]
pub struct FabricInfo {
    pub ep_type: EpType,
    pub caps: Flags,
    pub provider_name: &'static str,
    pub domain_attr: DomainAttr,
    pub tx_attr: TxAttr,
    pub rx_attr: RxAttr,
    /// Source address to bind, when discovered with [`GetInfoFlags::SOURCE`].
    pub src_addr: Option<SocketAddr>,
    /// Destination address, when node/service named the peer.
    pub dest_addr: Option<SocketAddr>,
}

fn provider_caps() -> Flags {
    Flags::MSG | Flags::RMA | Flags::REMOTE_WRITE | Flags::WRITE | Flags::SEND | Flags::RECV
}

/// Discover the provider.
///
/// `node`/`service` name a host and port. With [`GetInfoFlags::SOURCE`] the
/// resolved address becomes the local bind address, otherwise the
/// destination. `hints.dest_name` takes precedence for the destination and
/// carries an opaque name from the peer.
///
/// # Errors
/// `ENOSYS`-like error when `api_version` predates 1.13, `ENODATA`-like
/// error when the hints ask for capabilities or MR modes the provider does
/// not offer, and address-resolution failures otherwise.
pub fn getinfo(
    api_version: (u32, u32),
    node: Option<&str>,
    service: Option<&str>,
    flags: GetInfoFlags,
    hints: &Hints,
) -> io::Result<FabricInfo> {
    if api_version < VERSION_MIN {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!(
                "api version {}.{} predates provider minimum {}.{}",
                api_version.0, api_version.1, VERSION_MIN.0, VERSION_MIN.1
            ),
        ));
    }

    if !provider_caps().contains(hints.caps) {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "requested capabilities not available",
        ));
    }

    if hints.mr_mode.contains(MrMode::VIRT_ADDR) {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "provider uses offset-based MRs",
        ));
    }

    let resolved = match (node, service) {
        (Some(n), Some(s)) => Some(resolve(n, s)?),
        (None, Some(s)) => Some(resolve("0.0.0.0", s)?),
        _ => None,
    };

    let (src_addr, mut dest_addr) = if flags.contains(GetInfoFlags::SOURCE) {
        (resolved, None)
    } else {
        (None, resolved)
    };

    if let Some(name) = &hints.dest_name {
        dest_addr = Some(crate::av::decode_name(name)?);
    }

    Ok(FabricInfo {
        ep_type: EpType::ReliableDatagram,
        caps: provider_caps(),
        provider_name: PROVIDER_NAME,
        domain_attr: DomainAttr {
            mr_mode: MrMode::PROV_KEY,
            mr_iov_limit: MR_IOV_LIMIT,
        },
        tx_attr: TxAttr {
            iov_limit: MSG_IOV_LIMIT,
            rma_iov_limit: RMA_IOV_LIMIT,
        },
        rx_attr: RxAttr {
            iov_limit: MSG_IOV_LIMIT,
        },
        src_addr,
        dest_addr,
    })
}

fn resolve(node: &str, service: &str) -> io::Result<SocketAddr> {
    (node, service.parse::<u16>().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "service is not a port number")
    })?)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address resolution found nothing"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_gate() {
        let hints = Hints::default();
        assert!(getinfo(version(1, 12), None, None, GetInfoFlags::empty(), &hints).is_err());
        assert!(getinfo(version(1, 13), None, None, GetInfoFlags::empty(), &hints).is_ok());
        assert!(getinfo(version(1, 20), None, None, GetInfoFlags::empty(), &hints).is_ok());
    }

    #[test]
    fn test_source_resolution() {
        let hints = Hints {
            caps: Flags::MSG | Flags::RMA,
            ..Hints::default()
        };
        let info = getinfo(
            version(1, 13),
            Some("127.0.0.1"),
            Some("4242"),
            GetInfoFlags::SOURCE,
            &hints,
        )
        .unwrap();
        let src = info.src_addr.unwrap();
        assert_eq!(src.port(), 4242);
        assert!(info.dest_addr.is_none());
        assert!(info.domain_attr.mr_mode.contains(MrMode::PROV_KEY));
        assert!(!info.domain_attr.mr_mode.contains(MrMode::VIRT_ADDR));
    }

    #[test]
    fn test_unsupported_mr_mode() {
        let hints = Hints {
            mr_mode: MrMode::VIRT_ADDR,
            ..Hints::default()
        };
        assert!(getinfo(version(1, 13), None, None, GetInfoFlags::empty(), &hints).is_err());
    }
}
