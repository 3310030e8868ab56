//! Raw-adapter bindings.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::info;

use crate::adapter::{Adapter, AdapterFactory};
use crate::config::{CapabilityFlags, InterfaceConfig, parse_mac};
use crate::error::{CoreError, Result};

/// One raw-capture binding: an interface, the adapter that exclusively owns
/// it, and the addressing resolved for it.
pub struct RawItem {
    ifname: String,
    adapter: Box<dyn Adapter>,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
    port: u16,
    mac: [u8; 6],
    router_mac: Option<[u8; 6]>,
}

impl fmt::Debug for RawItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawItem")
            .field("ifname", &self.ifname)
            .field("ipv4", &self.ipv4)
            .field("ipv6", &self.ipv6)
            .field("port", &self.port)
            .field("mac", &self.mac)
            .field("router_mac", &self.router_mac)
            .finish()
    }
}

impl RawItem {
    /// Open the adapter for `config` and resolve its addressing.
    ///
    /// A configured MAC that does not parse is an error; nothing is opened.
    pub fn open(
        config: &InterfaceConfig,
        factory: &dyn AdapterFactory,
        flags: &CapabilityFlags,
    ) -> Result<Self> {
        config.validate()?;
        let adapter =
            factory
                .open(&config.ifname, flags)
                .map_err(|source| CoreError::AdapterOpen {
                    ifname: config.ifname.clone(),
                    source,
                })?;

        let mac = config
            .mac
            .as_deref()
            .and_then(parse_mac)
            .or_else(|| adapter.mac_address())
            .ok_or_else(|| CoreError::MissingMac(config.ifname.clone()))?;
        let router_mac = config.router_mac.as_deref().and_then(parse_mac);

        Ok(Self {
            ifname: config.ifname.clone(),
            adapter,
            ipv4: config.ipv4,
            ipv6: config.ipv6,
            port: config.port,
            mac,
            router_mac,
        })
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn adapter(&self) -> &dyn Adapter {
        self.adapter.as_ref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    pub fn router_mac(&self) -> Option<[u8; 6]> {
        self.router_mac
    }

    /// Whether a datagram to `ip` is for this binding. An item without a
    /// configured address of that family accepts any destination.
    pub fn accepts(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(ip) => self.ipv4.is_none_or(|own| own == ip),
            IpAddr::V6(ip) => self.ipv6.is_none_or(|own| own == ip),
        }
    }

    /// Destination MAC for a reply to a query that came from `src_mac`.
    pub fn reply_mac(&self, src_mac: [u8; 6]) -> [u8; 6] {
        let unusable = src_mac == [0; 6] || src_mac[0] & 0x01 != 0;
        match (unusable, self.router_mac) {
            (true, Some(router)) => router,
            _ => src_mac,
        }
    }
}

/// One generation of raw-adapter bindings.
pub type RawSet = Vec<RawItem>;

/// Open an adapter for every configured interface, all or nothing.
pub fn build_raw_set(
    interfaces: &[InterfaceConfig],
    factory: &dyn AdapterFactory,
    flags: &CapabilityFlags,
) -> Result<RawSet> {
    let set = interfaces
        .iter()
        .map(|config| RawItem::open(config, factory, flags))
        .collect::<Result<RawSet>>()?;
    info!(
        adapters = set.len(),
        pfring = flags.pfring,
        offline = flags.offline,
        "built raw set"
    );
    Ok(set)
}
