//! Canned Level 0 Discovery responses.

use sedframe_proto::SscKind;

/// Parameters for building a discovery blob.
#[derive(Debug, Clone)]
pub struct DiscoveryFixture {
    /// SSC descriptor to advertise
    pub ssc: SscKind,
    /// Base ComID carried in the SSC descriptor
    pub base_com_id: u16,
    /// Number of ComIDs carried in the SSC descriptor
    pub num_com_ids: u16,
    /// Locking feature: locking supported
    pub locking_present: bool,
    /// Locking feature: Locking SP activated
    pub locking_enabled: bool,
    /// Locking feature: a range is locked
    pub locked: bool,
    /// Locking feature: media encryption
    pub media_encryption: bool,
    /// Locking feature: shadow MBR enabled
    pub mbr_enabled: bool,
    /// Locking feature: shadow MBR done
    pub mbr_done: bool,
    /// Serial written into the vendor-specific header area
    pub serial: Option<String>,
    /// Total blob size (zero-padded)
    pub total_len: usize,
}

impl Default for DiscoveryFixture {
    fn default() -> Self {
        Self {
            ssc: SscKind::Opal20,
            base_com_id: 0x07FE,
            num_com_ids: 1,
            locking_present: true,
            locking_enabled: false,
            locked: false,
            media_encryption: true,
            mbr_enabled: false,
            mbr_done: false,
            serial: None,
            total_len: 256,
        }
    }
}

impl DiscoveryFixture {
    /// The canonical 256-byte Opal 2.0 blob: TPer + Locking + Opal 2.0 at
    /// the given base ComID, locking present but not yet enabled.
    #[must_use]
    pub fn opal20(base_com_id: u16) -> Self {
        Self { base_com_id, ..Self::default() }
    }

    fn ssc_feature_code(&self) -> Option<u16> {
        match self.ssc {
            SscKind::Opal10 => Some(0x0200),
            SscKind::Opal20 => Some(0x0203),
            SscKind::Enterprise => Some(0x0100),
            SscKind::Pyrite10 => Some(0x0302),
            SscKind::Pyrite20 => Some(0x0303),
            SscKind::Unknown => None,
        }
    }

    /// Serialize the blob.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let mut features = Vec::new();

        // TPer feature: synchronous protocol supported
        push_feature(&mut features, 0x0001, 1, &[0x01]);

        if self.locking_present {
            let mut bits = 0x01u8;
            if self.locking_enabled {
                bits |= 0x02;
            }
            if self.locked {
                bits |= 0x04;
            }
            if self.media_encryption {
                bits |= 0x08;
            }
            if self.mbr_enabled {
                bits |= 0x10;
            }
            if self.mbr_done {
                bits |= 0x20;
            }
            push_feature(&mut features, 0x0002, 1, &[bits]);
        }

        if let Some(code) = self.ssc_feature_code() {
            let mut payload = vec![0u8; 16];
            payload[0..2].copy_from_slice(&self.base_com_id.to_be_bytes());
            payload[2..4].copy_from_slice(&self.num_com_ids.to_be_bytes());
            payload[5..7].copy_from_slice(&4u16.to_be_bytes()); // locking admins
            payload[7..9].copy_from_slice(&8u16.to_be_bytes()); // locking users
            push_feature(&mut features, code, 2, &payload);
        }

        let mut blob = vec![0u8; 48];
        blob.extend_from_slice(&features);
        let param_len = (blob.len() - 4) as u32;
        blob[0..4].copy_from_slice(&param_len.to_be_bytes());
        if let Some(serial) = &self.serial {
            let bytes = serial.as_bytes();
            let n = bytes.len().min(32);
            blob[16..16 + n].copy_from_slice(&bytes[..n]);
        }
        blob.resize(self.total_len.max(blob.len()), 0);
        blob
    }
}

fn push_feature(out: &mut Vec<u8>, code: u16, version: u8, payload: &[u8]) {
    out.extend_from_slice(&code.to_be_bytes());
    out.push(version << 4);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
}
