use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use domain::common::entity::{Addr, AddressFamily};
use ports::secondary::address_pool_port::AddressPoolPort;
use tracing::debug;

/// Interface addresses known to the agent, keyed by interface name.
///
/// Seeded from configuration; `set_addresses` replaces an interface's list
/// when the host reports a change.
#[derive(Debug, Default)]
pub struct StaticAddressPool {
    addrs: RwLock<HashMap<String, Vec<(AddressFamily, Addr)>>>,
}

impl StaticAddressPool {
    pub fn new(entries: impl IntoIterator<Item = (String, AddressFamily, Addr)>) -> Self {
        let mut addrs: HashMap<String, Vec<(AddressFamily, Addr)>> = HashMap::new();
        for (ifname, af, addr) in entries {
            addrs.entry(ifname).or_default().push((af, addr));
        }
        Self {
            addrs: RwLock::new(addrs),
        }
    }

    pub fn set_addresses(&self, ifname: &str, list: Vec<(AddressFamily, Addr)>) {
        debug!(interface = ifname, count = list.len(), "interface addresses updated");
        let mut addrs = self.addrs.write().unwrap_or_else(PoisonError::into_inner);
        if list.is_empty() {
            addrs.remove(ifname);
        } else {
            addrs.insert(ifname.to_string(), list);
        }
    }

    pub fn interface_count(&self) -> usize {
        self.addrs.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl AddressPoolPort for StaticAddressPool {
    fn interface_address(&self, ifname: &str, af: AddressFamily) -> Option<Addr> {
        self.addrs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ifname)?
            .iter()
            .find(|(a, _)| *a == af)
            .map(|(_, addr)| *addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> StaticAddressPool {
        StaticAddressPool::new([
            ("em0".to_string(), AddressFamily::Inet, Addr::v4(0xC633_6401)),
            ("em0".to_string(), AddressFamily::Inet, Addr::v4(0xC633_6402)),
            ("em0".to_string(), AddressFamily::Inet6, Addr::v6([0x2001_0db8, 0, 0, 1])),
        ])
    }

    #[test]
    fn first_address_of_the_family_wins() {
        let p = pool();
        assert_eq!(
            p.interface_address("em0", AddressFamily::Inet),
            Some(Addr::v4(0xC633_6401))
        );
        assert_eq!(
            p.interface_address("em0", AddressFamily::Inet6),
            Some(Addr::v6([0x2001_0db8, 0, 0, 1]))
        );
    }

    #[test]
    fn unknown_interface_resolves_to_none() {
        assert_eq!(pool().interface_address("em1", AddressFamily::Inet), None);
    }

    #[test]
    fn set_addresses_replaces_and_empty_list_removes() {
        let p = pool();
        p.set_addresses("em0", vec![(AddressFamily::Inet, Addr::v4(0x0A00_0001))]);
        assert_eq!(
            p.interface_address("em0", AddressFamily::Inet),
            Some(Addr::v4(0x0A00_0001))
        );
        assert_eq!(p.interface_address("em0", AddressFamily::Inet6), None);

        p.set_addresses("em0", Vec::new());
        assert_eq!(p.interface_count(), 0);
    }
}
