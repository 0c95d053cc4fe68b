use domain::common::packet::PacketInfo;

/// Checksum primitives of the host stack.
pub trait ChecksumPort: Send + Sync {
    /// Whether the transport checksum is valid. Consulted before a packet
    /// is allowed to create state.
    fn verify(&self, pkt: &PacketInfo) -> bool;

    /// Bring checksums in line after the engine rewrote `pkt`. Clears
    /// `checksum_dirty`.
    fn recompute(&self, pkt: &mut PacketInfo);
}
