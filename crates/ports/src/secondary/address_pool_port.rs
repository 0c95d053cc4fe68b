use domain::common::entity::{Addr, AddressFamily};

/// Secondary port resolving dynamic translation pool entries.
///
/// A pool entry written as an interface name (`nat-to (egress)`) follows the
/// address configured on that interface. The engine asks this port at state
/// creation time; `None` makes the translation fail with `TRANSLATE`.
pub trait AddressPoolPort: Send + Sync {
    /// First address of family `af` configured on `ifname`.
    fn interface_address(&self, ifname: &str, af: AddressFamily) -> Option<Addr>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_pool_port_is_object_safe() {
        fn _check(port: &dyn AddressPoolPort) {
            let _ = port.interface_address("em0", AddressFamily::Inet);
        }
    }
}
