use domain::common::packet::{ChecksumStatus, PacketInfo};
use ports::secondary::checksum_port::ChecksumPort;

/// Checksum port for packets already validated by the capture layer.
///
/// The classifier records its verdict in `PacketInfo::checksum`. In strict
/// mode a packet the classifier did not check may not create state either.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifierChecksum {
    strict: bool,
}

impl ClassifierChecksum {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }
}

impl ChecksumPort for ClassifierChecksum {
    fn verify(&self, pkt: &PacketInfo) -> bool {
        match pkt.checksum {
            ChecksumStatus::Good => true,
            ChecksumStatus::Bad => false,
            ChecksumStatus::Unchecked => !self.strict,
        }
    }

    fn recompute(&self, pkt: &mut PacketInfo) {
        if pkt.checksum_dirty {
            pkt.checksum = ChecksumStatus::Good;
            pkt.checksum_dirty = false;
        }
    }
}
