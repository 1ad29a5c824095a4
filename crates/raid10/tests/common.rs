//! Shared fixtures for the integration tests.

use std::sync::Arc;

use raid10::{
    Device, DeviceId, LayoutSetting, MemBadBlocks, MemTransport, NoBitmap, Raid10, RaidConfig,
    WriteIntentBitmap,
};

/// Per-device size used by every fixture.
pub const DEV_SECTORS: u64 = 8192;

/// Array plus the in-memory collaborators behind it.
pub struct TestArray {
    pub array: Raid10,
    pub transport: Arc<MemTransport>,
    pub bad_blocks: Arc<MemBadBlocks>,
}

/// Installs a test-friendly subscriber once; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Builds a fully in-sync array with default settings.
pub fn array(disks: usize, layout: &str) -> TestArray {
    builder(disks, layout).build()
}

/// Fixture builder for arrays that need more than the defaults.
pub struct Builder {
    config: RaidConfig,
    bad_blocks: MemBadBlocks,
    bitmap: Arc<dyn WriteIntentBitmap>,
    spares: Vec<u32>,
}

pub fn builder(disks: usize, layout: &str) -> Builder {
    Builder {
        config: RaidConfig {
            raid_disks: disks,
            layout: LayoutSetting::Named(layout.to_string()),
            ..RaidConfig::default()
        },
        bad_blocks: MemBadBlocks::new(),
        bitmap: Arc::new(NoBitmap),
        spares: Vec::new(),
    }
}

#[allow(dead_code)]
impl Builder {
    pub fn config(mut self, f: impl FnOnce(&mut RaidConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn bad_blocks(mut self, bad_blocks: MemBadBlocks) -> Self {
        self.bad_blocks = bad_blocks;
        self
    }

    pub fn bitmap(mut self, bitmap: Arc<dyn WriteIntentBitmap>) -> Self {
        self.bitmap = bitmap;
        self
    }

    pub fn spare(mut self, id: u32) -> Self {
        self.spares.push(id);
        self
    }

    pub fn build(self) -> TestArray {
        init_tracing();
        let transport = MemTransport::new();
        let bad_blocks = Arc::new(self.bad_blocks);
        let members = (0..self.config.raid_disks as u32)
            .map(|i| {
                transport.add_disk(DeviceId(i), DEV_SECTORS);
                Some(if self.spares.contains(&i) {
                    Device::spare(DeviceId(i), DEV_SECTORS)
                } else {
                    Device::new(DeviceId(i), DEV_SECTORS)
                })
            })
            .collect();
        let array = Raid10::new(
            self.config,
            transport.clone(),
            bad_blocks.clone(),
            self.bitmap,
            members,
        )
        .unwrap();
        TestArray {
            array,
            transport,
            bad_blocks,
        }
    }
}

/// `sectors` sectors filled with `byte`.
pub fn fill(byte: u8, sectors: usize) -> bytes::Bytes {
    bytes::Bytes::from(vec![byte; sectors * raid10::SECTOR_SIZE])
}
