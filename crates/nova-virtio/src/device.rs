//! VirtIO device bring-up and driver-facing request API
//!
//! A [`VirtioDevice`] owns one MMIO transport and the virtqueues allocated
//! on it. Bring-up follows the initialization sequence from VirtIO spec
//! section 3.1:
//!
//! 1. Reset the device
//! 2. Set ACKNOWLEDGE, then DRIVER
//! 3. Negotiate features, set FEATURES_OK and re-read it
//! 4. Allocate queues and program their ring addresses
//! 5. Set DRIVER_OK
//!
//! Status bits are only ever OR'd in. A failed negotiation writes FAILED
//! and leaves DRIVER_OK unset; repeating bring-up on a live device fails
//! fast instead of re-driving the status register.
//!
//! # Locking
//!
//! One mutex per queue covers both submission and the used-ring drain, so
//! the drain path is serialized even when completions are taken inline
//! instead of from the interrupt handler. A separate device-wide register
//! lock serializes multi-register sequences (queueSel + queueNotify,
//! interrupt status + ack). Lock order is queue lock before register lock;
//! queue callbacks run without either held, so they may call back into the
//! dequeue path.

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

use crate::queue::{QueueLayout, VirtToPhys, Virtqueue, identity_translate, MAX_QUEUE_SIZE};
use crate::request::{AlwaysDone, CompletionPolicy, IoRequest, IoVec};
use crate::transport::{MmioTransport, REGS_MIN_SIZE, VIRTIO_VERSION_LEGACY};
use crate::{DeviceId, DeviceStatus, VirtioError, VirtioResult, PAGE_SIZE};

/// Interrupt status bit: the device used at least one buffer.
pub const INT_USED_RING: u32 = 1;
/// Interrupt status bit: the device configuration changed.
pub const INT_CONFIG: u32 = 2;

/// Callback invoked for a queue with pending completions.
pub type QueueCallback = Box<dyn FnMut() + Send>;
/// Callback invoked on a device configuration change.
pub type ConfigHandler = Box<dyn FnMut() + Send>;

struct QueueSlot {
    queue: Mutex<Virtqueue>,
    callback: Mutex<Option<QueueCallback>>,
}

/// One VirtIO MMIO device: transport, queues, negotiated state and
/// interrupt dispatch.
pub struct VirtioDevice {
    transport: MmioTransport,
    /// Serializes queueSel/queueNotify/status register sequences.
    reg_lock: Mutex<()>,
    device_id: DeviceId,
    vendor_id: u32,
    version: u32,
    irq: u32,
    /// Upper bound on queues, fixed at init time.
    max_queues: usize,
    translate: VirtToPhys,
    negotiated: u64,
    queues: Vec<QueueSlot>,
    config_handler: Mutex<Option<ConfigHandler>>,
    policy: Box<dyn CompletionPolicy>,
}

impl VirtioDevice {
    /// One-time transport bring-up: map check, probe and reset.
    ///
    /// `queue_count` is the most queues this device will ever allocate.
    /// The device is left in the reset state; continue with
    /// [`negotiate_features`](Self::negotiate_features),
    /// [`alloc_queues`](Self::alloc_queues) and
    /// [`driver_ok`](Self::driver_ok).
    ///
    /// # Safety
    /// `regs_base..regs_base + regs_len` must be a mapped VirtIO MMIO
    /// register block that stays valid for the device's lifetime.
    pub unsafe fn init(
        regs_base: usize,
        regs_len: usize,
        irq: u32,
        queue_count: usize,
    ) -> VirtioResult<Self> {
        if regs_len < REGS_MIN_SIZE || queue_count == 0 {
            return Err(VirtioError::InvalidArgument);
        }

        let transport = MmioTransport::new(regs_base, regs_len);
        let (device_id, version) = transport.probe()?;
        let vendor_id = transport.vendor_id();
        transport.reset();

        crate::serial_println!(
            "[virtio] device {:?} (vendor {:#x}, version {}) at {:#x}, irq {}",
            device_id, vendor_id, version, regs_base, irq
        );

        Ok(Self {
            transport,
            reg_lock: Mutex::new(()),
            device_id,
            vendor_id,
            version,
            irq,
            max_queues: queue_count,
            translate: identity_translate,
            negotiated: 0,
            queues: Vec::new(),
            config_handler: Mutex::new(None),
            policy: Box::new(AlwaysDone),
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    /// Features agreed on during negotiation.
    pub fn negotiated_features(&self) -> u64 {
        self.negotiated
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn is_legacy(&self) -> bool {
        self.version == VIRTIO_VERSION_LEGACY
    }

    /// Install the virtual-to-physical translation used for ring arenas.
    /// Must be called before [`alloc_queues`](Self::alloc_queues) on
    /// platforms without identity mapping.
    pub fn set_translate(&mut self, translate: VirtToPhys) {
        self.translate = translate;
    }

    /// Install the policy that turns used-ring completions into
    /// `Done`/`Failed` request states. The default marks everything done.
    pub fn set_completion_policy(&mut self, policy: Box<dyn CompletionPolicy>) {
        self.policy = policy;
    }

    /// Negotiate features with the device.
    ///
    /// The caller's `supported` mask is intersected with what the device
    /// offers and with what this transport implements: device-specific
    /// bits pass through, and of the reserved transport range only
    /// RING_INDIRECT_DESC, RING_EVENT_IDX and VERSION_1 are ever accepted.
    /// Returns the negotiated subset.
    pub fn negotiate_features(&mut self, supported: u64) -> VirtioResult<u64> {
        let t = &self.transport;

        if t.status().contains(DeviceStatus::DRIVER_OK) {
            return Err(VirtioError::AlreadyInitialized);
        }

        let mut status = t.status();
        status |= DeviceStatus::ACKNOWLEDGE;
        t.set_status(status);
        status |= DeviceStatus::DRIVER;
        t.set_status(status);

        let offered = if self.is_legacy() {
            t.device_features_legacy() as u64
        } else {
            t.device_features_all()
        };
        let mask = crate::features::DEVICE_FEATURE_MASK | crate::features::TRANSPORT_FEATURES;
        let negotiated = offered & supported & mask;

        if self.is_legacy() {
            t.set_driver_features_legacy(negotiated as u32);
            t.set_guest_page_size(PAGE_SIZE as u32);
        } else {
            t.set_driver_features_all(negotiated);
        }

        status |= DeviceStatus::FEATURES_OK;
        t.set_status(status);
        if !t.status().contains(DeviceStatus::FEATURES_OK) {
            // The device refused the subset. Flag the failure and stop;
            // DRIVER_OK is never set on this path.
            t.set_status(status | DeviceStatus::FAILED);
            return Err(VirtioError::FeatureNegotiationFailed);
        }

        crate::serial_println!(
            "[virtio] negotiated features {:#x} (device offered {:#x})",
            negotiated, offered
        );

        self.negotiated = negotiated;
        Ok(negotiated)
    }

    /// Finish bring-up by setting DRIVER_OK. Requires a successful
    /// feature negotiation first; fails fast if already done.
    pub fn driver_ok(&mut self) -> VirtioResult<()> {
        let status = self.transport.status();
        if status.contains(DeviceStatus::DRIVER_OK) {
            return Err(VirtioError::AlreadyInitialized);
        }
        if !status.contains(DeviceStatus::FEATURES_OK) {
            return Err(VirtioError::FeatureNegotiationFailed);
        }
        self.transport.set_status(status | DeviceStatus::DRIVER_OK);
        Ok(())
    }

    /// Allocate and activate `count` virtqueues.
    ///
    /// For each queue this selects it, sizes it from queueNumMax, builds
    /// the ring arena and programs the transport: split addresses plus
    /// queueReady on modern devices, align + PFN on legacy ones. Returns
    /// the queue handles (indices 0..count).
    pub fn alloc_queues(&mut self, count: usize) -> VirtioResult<Vec<u16>> {
        if count == 0 || count > self.max_queues {
            return Err(VirtioError::InvalidArgument);
        }
        if !self.queues.is_empty() {
            return Err(VirtioError::AlreadyInitialized);
        }

        for id in 0..count as u16 {
            let t = &self.transport;
            t.select_queue(id);

            let max = t.queue_max_size();
            if max == 0 {
                self.queues.clear();
                return Err(VirtioError::QueueNotAvailable);
            }
            let len = max.min(MAX_QUEUE_SIZE);
            t.set_queue_size(len);

            let layout = if self.is_legacy() {
                QueueLayout::legacy(len, PAGE_SIZE)
            } else {
                QueueLayout::split(len)
            };
            let queue = match Virtqueue::new(id, len, layout, self.translate) {
                Ok(queue) => queue,
                Err(err) => {
                    self.queues.clear();
                    return Err(err);
                }
            };
            let (desc, avail, used) = queue.ring_addresses();

            if self.is_legacy() {
                t.set_queue_align(PAGE_SIZE as u32);
                t.set_queue_pfn((desc >> 12) as u32);
            } else {
                t.set_queue_desc(desc);
                t.set_queue_driver(avail);
                t.set_queue_device(used);
                t.set_queue_ready(true);
            }

            crate::serial_println!("[virtio] queue {} ready, {} descriptors", id, len);

            self.queues.push(QueueSlot {
                queue: Mutex::new(queue),
                callback: Mutex::new(None),
            });
        }

        Ok((0..count as u16).collect())
    }

    /// Deactivate and drop every queue. In-flight requests are lost, so
    /// this is only sound once the device is quiesced.
    pub fn free_queues(&mut self) {
        for id in 0..self.queues.len() {
            self.transport.select_queue(id as u16);
            if self.is_legacy() {
                self.transport.set_queue_pfn(0);
            } else {
                self.transport.set_queue_ready(false);
            }
        }
        self.queues.clear();
    }

    /// Register the configuration-change handler.
    pub fn setup_interrupt(&self, handler: ConfigHandler) {
        *self.config_handler.lock() = Some(handler);
    }

    /// Register the completion callback for `queue`, invoked from
    /// [`handle_interrupt`](Self::handle_interrupt) whenever the queue has
    /// undrained used entries. The callback must not re-register handlers
    /// on the same queue.
    pub fn queue_setup_interrupt(&self, queue: u16, callback: QueueCallback) -> VirtioResult<()> {
        *self.slot(queue)?.callback.lock() = Some(callback);
        Ok(())
    }

    /// Drop all interrupt handlers.
    pub fn free_interrupts(&self) {
        for slot in &self.queues {
            *slot.callback.lock() = None;
        }
        *self.config_handler.lock() = None;
    }

    /// Interrupt entry point, called by the platform's handler for this
    /// device's IRQ. Reads the interrupt status, acknowledges exactly the
    /// bits seen, then dispatches: the used-ring bit fans out to the
    /// callback of every queue with pending completions (the status does
    /// not say which queue fired), the config bit to the config handler.
    /// Returns true when the interrupt was for this device.
    pub fn handle_interrupt(&self) -> bool {
        let status = {
            let _reg = self.reg_lock.lock();
            let status = self.transport.interrupt_status() & (INT_USED_RING | INT_CONFIG);
            if status != 0 {
                self.transport.interrupt_ack(status);
            }
            status
        };

        if status & INT_USED_RING != 0 {
            for slot in &self.queues {
                let pending = slot.queue.lock().pending_used();
                if pending {
                    if let Some(callback) = slot.callback.lock().as_mut() {
                        callback();
                    }
                }
            }
        }

        if status & INT_CONFIG != 0 {
            if let Some(handler) = self.config_handler.lock().as_mut() {
                handler();
            }
        }

        status != 0
    }

    /// Raw copy out of the device-specific config blob.
    pub fn read_device_config(&self, offset: usize, buffer: &mut [u8]) -> VirtioResult<()> {
        self.transport.read_config(offset, buffer)
    }

    /// Raw copy into the device-specific config blob.
    pub fn write_device_config(&self, offset: usize, buffer: &[u8]) -> VirtioResult<()> {
        self.transport.write_config(offset, buffer)
    }

    /// Config-space generation counter, for detecting torn reads.
    pub fn config_generation(&self) -> u32 {
        self.transport.config_generation()
    }

    /// Submit a scatter/gather request on `queue`.
    ///
    /// The first `read_count` segments are device-readable, the following
    /// `written_count` are device-writable; together they must cover
    /// `segments` exactly. On success the chain is published and the
    /// device notified. `WouldBlock` means the ring is full; the request
    /// cannot be enqueued until completions are drained, and no
    /// descriptors stay allocated.
    pub fn queue_request_v(
        &self,
        queue: u16,
        segments: &[IoVec],
        read_count: usize,
        written_count: usize,
        request: IoRequest,
    ) -> VirtioResult<()> {
        if read_count + written_count != segments.len() {
            return Err(VirtioError::InvalidArgument);
        }

        let slot = self.slot(queue)?;
        let mut q = slot.queue.lock();
        let head = q.enqueue(segments, read_count, request)?;

        if head.is_some() {
            let _reg = self.reg_lock.lock();
            self.transport.select_queue(queue);
            self.transport.notify_queue(queue);
        }
        Ok(())
    }

    /// Two-segment convenience form: an optional device-readable segment
    /// followed by an optional device-writable one.
    pub fn queue_request(
        &self,
        queue: u16,
        read: Option<IoVec>,
        written: Option<IoVec>,
        request: IoRequest,
    ) -> VirtioResult<()> {
        let mut segments = [IoVec::new(0, 0); 2];
        let mut count = 0;
        if let Some(seg) = read {
            segments[count] = seg;
            count += 1;
        }
        let read_count = count;
        if let Some(seg) = written {
            segments[count] = seg;
            count += 1;
        }
        self.queue_request_v(
            queue,
            &segments[..count],
            read_count,
            count - read_count,
            request,
        )
    }

    /// True when `queue` has no undrained completions.
    pub fn queue_is_empty(&self, queue: u16) -> VirtioResult<bool> {
        Ok(self.slot(queue)?.queue.lock().is_empty())
    }

    /// Length of `queue` in descriptors.
    pub fn queue_size(&self, queue: u16) -> VirtioResult<u16> {
        Ok(self.slot(queue)?.queue.lock().len())
    }

    /// Drain one completion from `queue`.
    ///
    /// Returns the request record with its state classified by the
    /// completion policy and the used length recorded, or `None` when
    /// nothing is ready. Callers needing blocking semantics poll this or
    /// wait on the device interrupt.
    pub fn queue_dequeue(&self, queue: u16) -> VirtioResult<Option<IoRequest>> {
        let slot = self.slot(queue)?;
        let mut q = slot.queue.lock();

        {
            let _reg = self.reg_lock.lock();
            self.transport.select_queue(queue);
        }

        match q.dequeue()? {
            None => Ok(None),
            Some((mut request, used_len)) => {
                request.state = self.policy.classify(&request, used_len);
                Ok(Some(request))
            }
        }
    }

    fn slot(&self, queue: u16) -> VirtioResult<&QueueSlot> {
        self.queues
            .get(queue as usize)
            .ok_or(VirtioError::QueueNotAvailable)
    }
}

impl core::fmt::Debug for VirtioDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtioDevice")
            .field("device_id", &self.device_id)
            .field("version", &self.version)
            .field("irq", &self.irq)
            .field("queues", &self.queues.len())
            .field("negotiated", &format_args!("{:#x}", self.negotiated))
            .finish()
    }
}
