//! Routing contacts and their liveness metadata.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use time::{Duration, OffsetDateTime};

use crate::core::kuid::Kuid;

/// The four-character code identifying the software a contact runs.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VendorCode([u8; 4]);

impl VendorCode {
    /// The code used when a contact didn't advertise one.
    pub const UNKNOWN: VendorCode = VendorCode(*b"????");

    pub const fn new(code: [u8; 4]) -> Self {
        VendorCode(code)
    }

    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }

    /// Parses exactly four printable ASCII characters.
    pub fn parse(s: &str) -> Option<Self> {
        let bytes: [u8; 4] = s.as_bytes().try_into().ok()?;
        if !bytes.iter().all(u8::is_ascii_graphic) {
            return None;
        }

        Some(VendorCode(bytes))
    }
}

impl fmt::Display for VendorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in &self.0 {
            let c = if byte.is_ascii_graphic() {
                byte as char
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }

        Ok(())
    }
}

impl fmt::Debug for VendorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VendorCode({self})")
    }
}

/// The protocol version a contact speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Version { major, minor }
    }

    /// Parses the `major.minor` form.
    pub fn parse(s: &str) -> Option<Self> {
        let (major, minor) = s.split_once('.')?;

        Some(Version {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The health classification of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    /// Not held by any bucket.
    #[default]
    Unknown,
    /// Actively responsive.
    Good,
    /// Suspected unreachable.
    Stale,
    /// Awaiting evaluation, held until a slot frees up in the good list.
    Pending,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Good => "good",
            Status::Stale => "stale",
            Status::Pending => "pending",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flag bits attached to a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    /// Answered the last RPC sent to it.
    pub alive: bool,
    /// Can't be contacted directly.
    pub firewalled: bool,
    /// Announced it is going away.
    pub shutdowning: bool,
    /// An address collision check is in flight for it.
    pub verifying: bool,
    /// Restored from a persisted table and not heard from since.
    pub cached: bool,
}

/// A routing contact: a node identifier with its address and liveness metadata.
///
/// The routing table owns the instances it holds; everything it hands out is a snapshot. Holders
/// of a snapshot check [`RoutingTable::status_of`](crate::RoutingTable::status_of) to learn whether
/// the contact is still routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Knode {
    pub(crate) id: Kuid,
    pub(crate) addr: SocketAddr,
    pub(crate) vendor: VendorCode,
    pub(crate) version: Version,
    pub(crate) status: Status,
    pub(crate) rpc_timeouts: u8,
    pub(crate) last_seen: OffsetDateTime,
    pub(crate) last_sent: Option<OffsetDateTime>,
    pub(crate) flags: Flags,
}

impl Knode {
    /// Creates a contact seen just now.
    pub fn new(id: Kuid, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            vendor: VendorCode::UNKNOWN,
            version: Version::default(),
            status: Status::Unknown,
            rpc_timeouts: 0,
            last_seen: OffsetDateTime::now_utc(),
            last_sent: None,
            flags: Flags::default(),
        }
    }

    pub fn with_vendor(mut self, vendor: VendorCode) -> Self {
        self.vendor = vendor;
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_last_seen(mut self, last_seen: OffsetDateTime) -> Self {
        self.last_seen = last_seen;
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn id(&self) -> &Kuid {
        &self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn vendor(&self) -> VendorCode {
        self.vendor
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn rpc_timeouts(&self) -> u8 {
        self.rpc_timeouts
    }

    pub fn last_seen(&self) -> OffsetDateTime {
        self.last_seen
    }

    pub fn last_sent(&self) -> Option<OffsetDateTime> {
        self.last_sent
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Returns whether enough time has passed since the last RPC to try again. The grace period
    /// doubles with every consecutive timeout.
    pub fn can_recontact(&self, now: OffsetDateTime) -> bool {
        if self.rpc_timeouts == 0 {
            return true;
        }

        match self.last_sent {
            Some(sent) => now - sent > Duration::seconds(1i64 << self.rpc_timeouts.min(30)),
            None => true,
        }
    }

    /// The network this contact counts against for diversity limits.
    pub(crate) fn network(&self) -> IpAddr {
        network_prefix(self.addr.ip())
    }
}

/// Masks an address down to the network it belongs to: a /24 for IPv4 and a /48 for IPv6.
pub fn network_prefix(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            IpAddr::V4(Ipv4Addr::new(a, b, c, 0))
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return network_prefix(IpAddr::V4(v4));
            }

            let s = v6.segments();
            IpAddr::V6(Ipv6Addr::new(s[0], s[1], s[2], 0, 0, 0, 0, 0))
        }
    }
}

/// Returns `true` for addresses no remote contact can legitimately be reached at.
pub fn is_bogon(addr: &SocketAddr) -> bool {
    if addr.port() == 0 {
        return true;
    }

    match addr.ip() {
        IpAddr::V4(v4) => {
            v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_link_local()
                || v4.octets()[0] == 0
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_bogon(&SocketAddr::new(IpAddr::V4(v4), addr.port())),
            None => v6.is_unspecified() || v6.is_loopback() || v6.is_multicast(),
        },
    }
}
