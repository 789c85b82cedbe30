//! VirtIO MMIO transport
//!
//! Low-level access to the memory-mapped register block of a VirtIO MMIO
//! device. Covers both the modern (version 2) register set and the legacy
//! (version 1) one used by older hypervisors.
//!
//! # MMIO register layout
//!
//! | Offset | Name | Notes |
//! |--------|------|-------|
//! | 0x000  | MagicValue | "virt" = 0x74726976 |
//! | 0x004  | Version | 1 = legacy, 2 = virtio 1.0+ |
//! | 0x008  | DeviceID | |
//! | 0x00c  | VendorID | |
//! | 0x010  | DeviceFeatures | window selected by sel (v2) |
//! | 0x014  | DeviceFeaturesSel | |
//! | 0x020  | DriverFeatures | window selected by sel (v2) |
//! | 0x024  | DriverFeaturesSel | |
//! | 0x028  | GuestPageSize | v1 only |
//! | 0x030  | QueueSel | |
//! | 0x034  | QueueNumMax | |
//! | 0x038  | QueueNum | |
//! | 0x03c  | QueueAlign | v1 only |
//! | 0x040  | QueuePFN | v1 only |
//! | 0x044  | QueueReady | v2 only |
//! | 0x050  | QueueNotify | |
//! | 0x060  | InterruptStatus | |
//! | 0x064  | InterruptACK | |
//! | 0x070  | Status | |
//! | 0x080  | QueueDescLow/High | v2 only |
//! | 0x090  | QueueDriverLow/High | v2 only (avail ring) |
//! | 0x0a0  | QueueDeviceLow/High | v2 only (used ring) |
//! | 0x0fc  | ConfigGeneration | |
//! | 0x100+ | Config | device-specific blob |

use core::ptr::{read_volatile, write_volatile};

use crate::{DeviceId, DeviceStatus, VirtioError, VirtioResult};

/// VirtIO MMIO magic value ("virt" in little-endian)
pub const VIRTIO_MAGIC: u32 = 0x74726976;

/// Legacy VirtIO MMIO version
pub const VIRTIO_VERSION_LEGACY: u32 = 1;

/// VirtIO MMIO version for virtio 1.0+
pub const VIRTIO_VERSION: u32 = 2;

/// Smallest register block we accept: the fixed registers plus at least
/// the start of the config blob.
pub const REGS_MIN_SIZE: usize = 0x100;

/// MMIO register offsets
pub(crate) mod regs {
    pub const MAGIC_VALUE: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const VENDOR_ID: usize = 0x00c;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DEVICE_FEATURES_SEL: usize = 0x014;
    pub const DRIVER_FEATURES: usize = 0x020;
    pub const DRIVER_FEATURES_SEL: usize = 0x024;
    pub const GUEST_PAGE_SIZE: usize = 0x028;
    pub const QUEUE_SEL: usize = 0x030;
    pub const QUEUE_NUM_MAX: usize = 0x034;
    pub const QUEUE_NUM: usize = 0x038;
    pub const QUEUE_ALIGN: usize = 0x03c;
    pub const QUEUE_PFN: usize = 0x040;
    pub const QUEUE_READY: usize = 0x044;
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const INTERRUPT_STATUS: usize = 0x060;
    pub const INTERRUPT_ACK: usize = 0x064;
    pub const STATUS: usize = 0x070;
    pub const QUEUE_DESC_LOW: usize = 0x080;
    pub const QUEUE_DESC_HIGH: usize = 0x084;
    pub const QUEUE_DRIVER_LOW: usize = 0x090;
    pub const QUEUE_DRIVER_HIGH: usize = 0x094;
    pub const QUEUE_DEVICE_LOW: usize = 0x0a0;
    pub const QUEUE_DEVICE_HIGH: usize = 0x0a4;
    pub const CONFIG_GENERATION: usize = 0x0fc;
    pub const CONFIG: usize = 0x100;
}

/// VirtIO MMIO transport
///
/// A thin window over the device's register block. All methods are plain
/// volatile loads and stores; serialization of multi-register sequences
/// (queue select + notify, status updates) is the device layer's job.
#[derive(Clone, Copy)]
pub struct MmioTransport {
    /// Mapped base address of the register block
    base: usize,
    /// Mapped length in bytes
    len: usize,
}

impl MmioTransport {
    /// Create a transport over a mapped register block.
    ///
    /// # Safety
    /// `base..base + len` must stay mapped read/write for the lifetime of
    /// the transport and point at a VirtIO MMIO register block.
    pub const unsafe fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    /// Probe the device: verify the magic value, check the version is one
    /// we speak and that a device is actually behind the block.
    pub fn probe(&self) -> VirtioResult<(DeviceId, u32)> {
        let magic = self.read_reg(regs::MAGIC_VALUE);
        if magic != VIRTIO_MAGIC {
            return Err(VirtioError::InvalidMagic);
        }

        let version = self.read_reg(regs::VERSION);
        if version != VIRTIO_VERSION && version != VIRTIO_VERSION_LEGACY {
            return Err(VirtioError::UnsupportedVersion);
        }

        let device_id = self.read_reg(regs::DEVICE_ID);
        if device_id == 0 {
            return Err(VirtioError::DeviceNotFound);
        }

        Ok((DeviceId::from(device_id), version))
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId::from(self.read_reg(regs::DEVICE_ID))
    }

    pub fn vendor_id(&self) -> u32 {
        self.read_reg(regs::VENDOR_ID)
    }

    pub fn version(&self) -> u32 {
        self.read_reg(regs::VERSION)
    }

    /// Read the device status byte.
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits(self.read_reg(regs::STATUS) as u8)
    }

    /// Write the device status byte.
    pub fn set_status(&self, status: DeviceStatus) {
        self.write_reg(regs::STATUS, status.bits() as u32);
    }

    /// Reset the device and wait until it reports the reset completed.
    pub fn reset(&self) {
        self.write_reg(regs::STATUS, 0);
        while self.read_reg(regs::STATUS) != 0 {
            core::hint::spin_loop();
        }
    }

    /// Read one 32-bit device feature window (v2).
    pub fn device_features(&self, sel: u32) -> u32 {
        self.write_reg(regs::DEVICE_FEATURES_SEL, sel);
        self.read_reg(regs::DEVICE_FEATURES)
    }

    /// Read all 64 device feature bits (v2).
    pub fn device_features_all(&self) -> u64 {
        let low = self.device_features(0) as u64;
        let high = self.device_features(1) as u64;
        low | (high << 32)
    }

    /// Read the single legacy feature word (v1).
    pub fn device_features_legacy(&self) -> u32 {
        self.read_reg(regs::DEVICE_FEATURES)
    }

    /// Write one 32-bit driver feature window (v2).
    pub fn set_driver_features(&self, sel: u32, features: u32) {
        self.write_reg(regs::DRIVER_FEATURES_SEL, sel);
        self.write_reg(regs::DRIVER_FEATURES, features);
    }

    /// Write all 64 driver feature bits (v2).
    pub fn set_driver_features_all(&self, features: u64) {
        self.set_driver_features(0, features as u32);
        self.set_driver_features(1, (features >> 32) as u32);
    }

    /// Write the single legacy feature word (v1).
    pub fn set_driver_features_legacy(&self, features: u32) {
        self.write_reg(regs::DRIVER_FEATURES, features);
    }

    /// Tell a legacy device the guest page size it should assume (v1).
    pub fn set_guest_page_size(&self, size: u32) {
        self.write_reg(regs::GUEST_PAGE_SIZE, size);
    }

    /// Select a virtqueue for the per-queue registers below.
    pub fn select_queue(&self, queue: u16) {
        self.write_reg(regs::QUEUE_SEL, queue as u32);
    }

    /// Maximum length of the selected queue (0 = queue unavailable).
    pub fn queue_max_size(&self) -> u16 {
        self.read_reg(regs::QUEUE_NUM_MAX) as u16
    }

    /// Set the length of the selected queue.
    pub fn set_queue_size(&self, size: u16) {
        self.write_reg(regs::QUEUE_NUM, size as u32);
    }

    /// Set the ring alignment of the selected queue (v1).
    pub fn set_queue_align(&self, align: u32) {
        self.write_reg(regs::QUEUE_ALIGN, align);
    }

    /// Program the page frame number of the selected queue's arena (v1).
    /// Writing 0 deactivates the queue.
    pub fn set_queue_pfn(&self, pfn: u32) {
        self.write_reg(regs::QUEUE_PFN, pfn);
    }

    pub fn queue_ready(&self) -> bool {
        self.read_reg(regs::QUEUE_READY) != 0
    }

    /// Activate or deactivate the selected queue (v2).
    pub fn set_queue_ready(&self, ready: bool) {
        self.write_reg(regs::QUEUE_READY, ready as u32);
    }

    /// Program the descriptor table address of the selected queue (v2).
    pub fn set_queue_desc(&self, addr: u64) {
        self.write_reg(regs::QUEUE_DESC_LOW, addr as u32);
        self.write_reg(regs::QUEUE_DESC_HIGH, (addr >> 32) as u32);
    }

    /// Program the available ring address of the selected queue (v2).
    pub fn set_queue_driver(&self, addr: u64) {
        self.write_reg(regs::QUEUE_DRIVER_LOW, addr as u32);
        self.write_reg(regs::QUEUE_DRIVER_HIGH, (addr >> 32) as u32);
    }

    /// Program the used ring address of the selected queue (v2).
    pub fn set_queue_device(&self, addr: u64) {
        self.write_reg(regs::QUEUE_DEVICE_LOW, addr as u32);
        self.write_reg(regs::QUEUE_DEVICE_HIGH, (addr >> 32) as u32);
    }

    /// Tell the device new chains are waiting on `queue`.
    pub fn notify_queue(&self, queue: u16) {
        self.write_reg(regs::QUEUE_NOTIFY, queue as u32);
    }

    pub fn interrupt_status(&self) -> u32 {
        self.read_reg(regs::INTERRUPT_STATUS)
    }

    /// Acknowledge the given interrupt status bits.
    pub fn interrupt_ack(&self, status: u32) {
        self.write_reg(regs::INTERRUPT_ACK, status);
    }

    /// Config-space generation counter; changes whenever the device
    /// updates the config blob, so callers can detect torn reads.
    pub fn config_generation(&self) -> u32 {
        self.read_reg(regs::CONFIG_GENERATION)
    }

    /// Copy out of the device-specific config blob.
    pub fn read_config(&self, offset: usize, buffer: &mut [u8]) -> VirtioResult<()> {
        self.check_config_range(offset, buffer.len())?;
        for (i, byte) in buffer.iter_mut().enumerate() {
            // SAFETY: range checked against the mapped length above.
            *byte = unsafe {
                read_volatile((self.base + regs::CONFIG + offset + i) as *const u8)
            };
        }
        Ok(())
    }

    /// Copy into the device-specific config blob.
    pub fn write_config(&self, offset: usize, buffer: &[u8]) -> VirtioResult<()> {
        self.check_config_range(offset, buffer.len())?;
        for (i, byte) in buffer.iter().enumerate() {
            // SAFETY: range checked against the mapped length above.
            unsafe {
                write_volatile((self.base + regs::CONFIG + offset + i) as *mut u8, *byte);
            }
        }
        Ok(())
    }

    fn check_config_range(&self, offset: usize, len: usize) -> VirtioResult<()> {
        let end = regs::CONFIG
            .checked_add(offset)
            .and_then(|v| v.checked_add(len))
            .ok_or(VirtioError::InvalidArgument)?;
        if end > self.len {
            return Err(VirtioError::InvalidArgument);
        }
        Ok(())
    }

    fn read_reg(&self, offset: usize) -> u32 {
        // SAFETY: offset is a fixed register offset below REGS_MIN_SIZE,
        // which the device layer validated against the mapped length.
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    fn write_reg(&self, offset: usize, value: u32) {
        // SAFETY: as above.
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }
}

impl core::fmt::Debug for MmioTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmioTransport")
            .field("base", &format_args!("0x{:x}", self.base))
            .field("len", &self.len)
            .finish()
    }
}
