//! NVMe block driver: one admin and one I/O queue pair per controller,
//! MSI-X completion delivery, asynchronous read/write/flush.
//!
//! Submission inserts the command's completion lock before ringing the
//! doorbell; the interrupt handler resolves the lock when the matching
//! cid reaches the completion-queue head.

pub mod regs;

use crate::drivers::pci::{MsiXCapability, PciDevice};
use crate::memory::frame_allocator::{self, FrameBlock, FrameKind};
use crate::memory::paging::{self, AddressSpace, MapSize};
use crate::memory::{phys_to_virt, FRAME_SIZE};
use crate::sync::{CommandFuture, CompletionLock};
use crate::time::timer;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use regs::{
    identify_controller_vwc, parse_identify_namespace, CompletionEntry, ControllerRegisters,
    SubmissionEntry, ADMIN_CMD_CREATE_CQ, ADMIN_CMD_CREATE_SQ, ADMIN_CMD_IDENTIFY,
    ADMIN_CMD_SET_FEATURES, FEATURE_NUMBER_OF_QUEUES, FEATURE_VOLATILE_WRITE_CACHE, IO_CMD_FLUSH,
    IO_CMD_READ, IO_CMD_WRITE, QUEUE_DEPTH,
};
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

/// Largest transfer: 512 pages (2 MiB), the capacity of one PRP list.
const MAX_TRANSFER_PAGES: u64 = 512;

/// MSI-X table index carrying I/O completions.
const IO_QUEUE_MSIX_INDEX: u16 = 1;

/// Poll iterations granted to each controller enable/disable transition.
const RESET_SPIN_LIMIT: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmeError {
    /// Controller did not leave/enter ready in time.
    DeviceTimeout,
    /// CFS set or a command completed with non-zero status.
    DeviceFault,
    /// Unaligned or oversized transfer, or unmapped buffer.
    InvalidArgument,
    /// Unknown disk id.
    NotFound,
}

impl fmt::Display for NvmeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvmeError::DeviceTimeout => write!(f, "controller timeout"),
            NvmeError::DeviceFault => write!(f, "device fault"),
            NvmeError::InvalidArgument => write!(f, "invalid argument"),
            NvmeError::NotFound => write!(f, "no such disk"),
        }
    }
}

/// The active namespace of a controller.
#[derive(Debug, Clone, Copy)]
pub struct Namespace {
    pub id: u32,
    pub lba_size: u64,
    pub lba_count: u64,
}

/// Queue state: ring memory, head/tail cursors, doorbells, cid counter.
struct NvmeQueues {
    admin_sq: *mut SubmissionEntry,
    admin_cq: *const CompletionEntry,
    io_sq: *mut SubmissionEntry,
    io_cq: *const CompletionEntry,

    admin_sq_tail: u16,
    admin_cq_head: u16,
    io_sq_tail: u16,
    io_cq_head: u16,

    admin_sq_doorbell: *mut u32,
    admin_cq_doorbell: *mut u32,
    io_sq_doorbell: *mut u32,
    io_cq_doorbell: *mut u32,

    next_cid: u16,
}

// The raw pointers target DMA rings and MMIO doorbells that live as long
// as the disk itself.
unsafe impl Send for NvmeQueues {}

impl NvmeQueues {
    fn fresh_cid(&mut self) -> u16 {
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);
        cid
    }
}

pub struct NvmeDisk {
    pub disk_id: u64,
    queues: Mutex<NvmeQueues>,
    /// cid -> lock resolving the in-flight command's future.
    command_locks: Mutex<BTreeMap<u16, Arc<CompletionLock>>>,

    pub namespace: Namespace,
    pub flush_supported: bool,
    pub io_queues_granted: (u16, u16),
    pub io_vector: u8,

    /// One PRP-list page per I/O submission slot.
    prp_pool_pa: PhysAddr,
    prp_pool_va: VirtAddr,

    msix: Option<(MsiXCapability, VirtAddr)>,
}

unsafe impl Send for NvmeDisk {}
unsafe impl Sync for NvmeDisk {}

fn irq_free<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(all(target_arch = "x86_64", not(test)))]
    {
        x86_64::instructions::interrupts::without_interrupts(f)
    }
    #[cfg(any(not(target_arch = "x86_64"), test))]
    {
        f()
    }
}

impl NvmeDisk {
    /// Queue one I/O command. The caller has already validated the
    /// transfer and resolved the buffer's physical address.
    fn submit_io(&self, opc: u8, nsid: u32, lba: u64, page_count: u64, buffer_fa: u64) -> CommandFuture {
        irq_free(|| {
            let mut q = self.queues.lock();
            let slot = q.io_sq_tail;

            let prp1 = buffer_fa;
            let prp2 = if page_count == 2 {
                prp1 + FRAME_SIZE
            } else if page_count > 2 {
                let list_pa = self.prp_pool_pa.as_u64() + slot as u64 * FRAME_SIZE;
                let list = (self.prp_pool_va.as_u64() + slot as u64 * FRAME_SIZE) as *mut u64;
                unsafe {
                    core::ptr::write_bytes(list as *mut u8, 0, FRAME_SIZE as usize);
                    for i in 0..page_count - 1 {
                        list.add(i as usize)
                            .write_volatile(prp1 + (i + 1) * FRAME_SIZE);
                    }
                }
                list_pa
            } else {
                0
            };

            let cid = q.fresh_cid();

            let mut entry = SubmissionEntry::zeroed();
            entry.opc = opc;
            entry.cid = cid;
            entry.nsid = nsid;
            entry.prp1 = prp1;
            entry.prp2 = prp2;
            entry.cdw10 = lba as u32;
            entry.cdw11 = (lba >> 32) as u32;
            if opc != IO_CMD_FLUSH {
                entry.cdw12 = (page_count - 1) as u32;
            }

            unsafe {
                q.io_sq.add(slot as usize).write_volatile(entry);
            }

            // Register the lock before the doorbell: the completion may
            // arrive the instant the controller sees the new tail.
            let lock = CompletionLock::new_locked();
            self.command_locks.lock().insert(cid, lock.clone());

            q.io_sq_tail = (q.io_sq_tail + 1) % QUEUE_DEPTH;
            unsafe {
                q.io_sq_doorbell.write_volatile(q.io_sq_tail as u32);
            }

            log::debug!(
                "nvme disk {} queued opc {:#x} cid {:#x} slot {}",
                self.disk_id,
                opc,
                cid,
                slot
            );

            CommandFuture::new(lock)
        })
    }

    /// Completion path: resolve the cid at the queue head, advance the
    /// head exactly once, ring the head doorbell.
    pub fn handle_completion(&self) {
        irq_free(|| {
            let mut q = self.queues.lock();

            let entry = unsafe { q.io_cq.add(q.io_cq_head as usize).read_volatile() };

            log::debug!(
                "nvme disk {} completion cid {:#x} sqhd {} sqid {} status {}/{}",
                self.disk_id,
                entry.cid,
                entry.sqhd,
                entry.sqid,
                entry.status_type(),
                entry.status_code()
            );

            match self.command_locks.lock().remove(&entry.cid) {
                Some(lock) => {
                    lock.release();
                }
                None => log::error!(
                    "nvme disk {}: no lock for cid {:#x}",
                    self.disk_id,
                    entry.cid
                ),
            }

            q.io_cq_head = (q.io_cq_head + 1) % QUEUE_DEPTH;
            unsafe {
                q.io_cq_doorbell.write_volatile(q.io_cq_head as u32);
            }
        });
    }

    fn clear_msix_pending(&self) {
        if let Some((cap, bar_va)) = &self.msix {
            cap.clear_pending(*bar_va, IO_QUEUE_MSIX_INDEX);
        }
    }

    /// In-flight commands (locks not yet resolved).
    pub fn outstanding_commands(&self) -> usize {
        self.command_locks.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Global disk registry
// ---------------------------------------------------------------------------

static NVME_DISKS: Mutex<BTreeMap<u64, Arc<NvmeDisk>>> = Mutex::new(BTreeMap::new());
static ISR_MAP: Mutex<BTreeMap<u8, Arc<NvmeDisk>>> = Mutex::new(BTreeMap::new());

pub fn disk(disk_id: u64) -> Option<Arc<NvmeDisk>> {
    NVME_DISKS.lock().get(&disk_id).cloned()
}

fn nvme_isr(vector: u8) {
    let disk = ISR_MAP.lock().get(&vector).cloned();

    match disk {
        Some(disk) => {
            disk.handle_completion();
            disk.clear_msix_pending();
        }
        None => log::error!("no nvme disk bound to vector {:#x}", vector),
    }

    crate::apic::eoi();
}

/// Asynchronous read of `size` bytes starting at `lba` into `buffer`.
pub fn read(disk_id: u64, lba: u64, size: u64, buffer: VirtAddr) -> Result<CommandFuture, NvmeError> {
    read_write(disk_id, lba, size, buffer, false)
}

/// Asynchronous write of `size` bytes starting at `lba` from `buffer`.
pub fn write(
    disk_id: u64,
    lba: u64,
    size: u64,
    buffer: VirtAddr,
) -> Result<CommandFuture, NvmeError> {
    read_write(disk_id, lba, size, buffer, true)
}

fn read_write(
    disk_id: u64,
    lba: u64,
    size: u64,
    buffer: VirtAddr,
    is_write: bool,
) -> Result<CommandFuture, NvmeError> {
    // Validation happens before any hardware (or registry) access.
    if size == 0 || size % FRAME_SIZE != 0 {
        log::error!("nvme transfer size {:#x} not a page multiple", size);
        return Err(NvmeError::InvalidArgument);
    }
    let page_count = size / FRAME_SIZE;
    if page_count > MAX_TRANSFER_PAGES {
        log::error!("nvme transfer of {} pages too large", page_count);
        return Err(NvmeError::InvalidArgument);
    }
    if buffer.as_u64() % FRAME_SIZE != 0 {
        log::error!("nvme buffer {:#x} not page aligned", buffer.as_u64());
        return Err(NvmeError::InvalidArgument);
    }

    let space = paging::kernel_space()
        .or_else(paging::active_space)
        .ok_or(NvmeError::InvalidArgument)?;
    let buffer_fa = space
        .translate(buffer)
        .map_err(|_| NvmeError::InvalidArgument)?;

    let disk = disk(disk_id).ok_or(NvmeError::NotFound)?;

    let opc = if is_write { IO_CMD_WRITE } else { IO_CMD_READ };
    Ok(disk.submit_io(opc, disk.namespace.id, lba, page_count, buffer_fa.as_u64()))
}

/// Flush the volatile write cache. `Ok(None)` when the controller has no
/// cache to flush.
pub fn flush(disk_id: u64) -> Result<Option<CommandFuture>, NvmeError> {
    let disk = disk(disk_id).ok_or(NvmeError::NotFound)?;

    if !disk.flush_supported {
        log::debug!("nvme disk {}: flush not supported", disk_id);
        return Ok(None);
    }

    Ok(Some(disk.submit_io(IO_CMD_FLUSH, 0xFFFF_FFFF, 0, 1, 0)))
}

// ---------------------------------------------------------------------------
// Admin command path (init-time, polled)
// ---------------------------------------------------------------------------

fn admin_submit_wait(
    q: &mut NvmeQueues,
    timeout: u64,
    mut entry: SubmissionEntry,
) -> Result<CompletionEntry, NvmeError> {
    let cid = q.fresh_cid();
    entry.cid = cid;

    unsafe {
        q.admin_sq.add(q.admin_sq_tail as usize).write_volatile(entry);
    }
    q.admin_sq_tail = (q.admin_sq_tail + 1) % QUEUE_DEPTH;
    unsafe {
        q.admin_sq_doorbell.write_volatile(q.admin_sq_tail as u32);
    }

    let completion = loop {
        let head = unsafe { q.admin_cq.add(q.admin_cq_head as usize).read_volatile() };
        if head.cid == cid {
            break head;
        }
        timer::spinsleep(500 * (timeout + 1));
    };

    q.admin_cq_head = (q.admin_cq_head + 1) % QUEUE_DEPTH;
    unsafe {
        q.admin_cq_doorbell.write_volatile(q.admin_cq_head as u32);
    }

    if completion.is_error() {
        log::error!(
            "nvme admin command {:#x} failed: {}/{}",
            entry.opc,
            completion.status_type(),
            completion.status_code()
        );
        return Err(NvmeError::DeviceFault);
    }

    Ok(completion)
}

fn admin_identify(
    q: &mut NvmeQueues,
    timeout: u64,
    cns: u32,
    nsid: u32,
    data: PhysAddr,
) -> Result<CompletionEntry, NvmeError> {
    let mut entry = SubmissionEntry::zeroed();
    entry.opc = ADMIN_CMD_IDENTIFY;
    entry.nsid = nsid;
    entry.prp1 = data.as_u64();
    entry.cdw10 = cns;
    admin_submit_wait(q, timeout, entry)
}

fn admin_set_features(
    q: &mut NvmeQueues,
    timeout: u64,
    feature: u32,
    value: u32,
) -> Result<CompletionEntry, NvmeError> {
    let mut entry = SubmissionEntry::zeroed();
    entry.opc = ADMIN_CMD_SET_FEATURES;
    entry.cdw10 = feature;
    entry.cdw11 = value;
    admin_submit_wait(q, timeout, entry)
}

fn admin_create_io_cq(
    q: &mut NvmeQueues,
    timeout: u64,
    cq_pa: PhysAddr,
    interrupt_vector: u16,
) -> Result<CompletionEntry, NvmeError> {
    let mut entry = SubmissionEntry::zeroed();
    entry.opc = ADMIN_CMD_CREATE_CQ;
    entry.prp1 = cq_pa.as_u64();
    // Queue id 1, zero-based depth in the upper half.
    entry.cdw10 = ((QUEUE_DEPTH as u32 - 1) << 16) | 1;
    // Interrupt vector, interrupts enabled, physically contiguous.
    entry.cdw11 = ((interrupt_vector as u32) << 16) | (1 << 1) | 1;
    admin_submit_wait(q, timeout, entry)
}

fn admin_create_io_sq(
    q: &mut NvmeQueues,
    timeout: u64,
    sq_pa: PhysAddr,
) -> Result<CompletionEntry, NvmeError> {
    let mut entry = SubmissionEntry::zeroed();
    entry.opc = ADMIN_CMD_CREATE_SQ;
    entry.prp1 = sq_pa.as_u64();
    entry.cdw10 = ((QUEUE_DEPTH as u32 - 1) << 16) | 1;
    // Bound to completion queue 1, physically contiguous.
    entry.cdw11 = (1 << 16) | 1;
    admin_submit_wait(q, timeout, entry)
}

// ---------------------------------------------------------------------------
// Controller initialization
// ---------------------------------------------------------------------------

fn map_device_block(space: &AddressSpace, block: &FrameBlock) -> Result<VirtAddr, NvmeError> {
    let va = phys_to_virt(block.start_address());
    for (i, pa) in block.frames().enumerate() {
        space
            .map_to(
                va + i as u64 * FRAME_SIZE,
                pa,
                MapSize::Size4KiB,
                PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
            )
            .map_err(|_| NvmeError::InvalidArgument)?;
    }
    Ok(va)
}

/// Bring up every discovered controller. Returns the number of disks
/// that made it online; a failing device is skipped, not fatal.
pub fn init(devices: &[PciDevice]) -> usize {
    let mut disk_id = 0u64;

    for dev in devices {
        match init_controller(dev, disk_id) {
            Ok(()) => disk_id += 1,
            Err(err) => log::error!(
                "nvme controller at {:02x}:{:02x}.{} failed: {}",
                dev.bus,
                dev.device,
                dev.function,
                err
            ),
        }
    }

    NVME_DISKS.lock().len()
}

fn init_controller(dev: &PciDevice, disk_id: u64) -> Result<(), NvmeError> {
    let space = paging::kernel_space()
        .or_else(paging::active_space)
        .ok_or(NvmeError::InvalidArgument)?;

    // MSI-X is mandatory for this driver.
    let msix = MsiXCapability::read(dev).ok_or(NvmeError::InvalidArgument)?;
    msix.configure(dev);
    dev.enable_bus_master();

    // Map BAR0.
    let bar = dev.bar(0).ok_or(NvmeError::InvalidArgument)?;
    let bar_frames = (bar.size + FRAME_SIZE - 1) / FRAME_SIZE;
    let bar_block = FrameBlock::new(PhysAddr::new(bar.address), bar_frames, FrameKind::Reserved);
    if frame_allocator::reserved_block_containing(PhysAddr::new(bar.address)).is_none() {
        frame_allocator::register_reserved(bar_block);
    }
    let bar_va = map_device_block(&space, &bar_block)?;

    let regs = unsafe { ControllerRegisters::new(bar_va) };
    let (major, minor) = regs.version();
    let timeout = regs.cap_timeout();
    log::debug!(
        "nvme {}: version {}.{}, mqes {}, dstrd {}",
        disk_id,
        major,
        minor,
        regs.cap_mqes(),
        regs.cap_dstrd()
    );

    // Ring storage: admin SQ, admin CQ, I/O SQ, I/O CQ, one frame each.
    let queue_block = frame_allocator::allocate_frames(4, FrameKind::Reserved)
        .map_err(|_| NvmeError::InvalidArgument)?;
    let queue_va = map_device_block(&space, &queue_block)?;
    unsafe {
        core::ptr::write_bytes(queue_va.as_mut_ptr::<u8>(), 0, 4 * FRAME_SIZE as usize);
    }
    let queue_pa = queue_block.start_address();

    // Reset: clear EN, wait for ready to drop.
    regs.set_enabled(false);
    let mut spins = RESET_SPIN_LIMIT;
    loop {
        timer::spinsleep(500 * (timeout + 1));
        if !regs.ready() {
            break;
        }
        spins -= 1;
        if spins == 0 {
            return Err(NvmeError::DeviceTimeout);
        }
    }
    if regs.fatal() {
        return Err(NvmeError::DeviceFault);
    }

    // Admin queues and controller configuration, then enable.
    regs.program_admin_queues(queue_pa.as_u64(), queue_pa.as_u64() + FRAME_SIZE);
    regs.set_enabled(true);
    let mut spins = RESET_SPIN_LIMIT;
    loop {
        timer::spinsleep(500 * (timeout + 1));
        if regs.fatal() {
            return Err(NvmeError::DeviceFault);
        }
        if regs.ready() {
            break;
        }
        spins -= 1;
        if spins == 0 {
            return Err(NvmeError::DeviceTimeout);
        }
    }

    let mut queues = NvmeQueues {
        admin_sq: queue_va.as_mut_ptr(),
        admin_cq: (queue_va + FRAME_SIZE).as_ptr(),
        io_sq: (queue_va + 2 * FRAME_SIZE).as_mut_ptr(),
        io_cq: (queue_va + 3 * FRAME_SIZE).as_ptr(),
        admin_sq_tail: 0,
        admin_cq_head: 0,
        io_sq_tail: 0,
        io_cq_head: 0,
        admin_sq_doorbell: regs.doorbell(0, false),
        admin_cq_doorbell: regs.doorbell(0, true),
        io_sq_doorbell: regs.doorbell(1, false),
        io_cq_doorbell: regs.doorbell(1, true),
        next_cid: 1,
    };

    // Identify buffers: controller, namespace, active-namespace list.
    let identify_block = frame_allocator::allocate_frames(3, FrameKind::Reserved)
        .map_err(|_| NvmeError::InvalidArgument)?;
    let identify_va = map_device_block(&space, &identify_block)?;
    unsafe {
        core::ptr::write_bytes(identify_va.as_mut_ptr::<u8>(), 0, 3 * FRAME_SIZE as usize);
    }
    let identify_pa = identify_block.start_address();

    admin_identify(&mut queues, timeout, 1, 0, identify_pa)?;
    let flush_supported = identify_controller_vwc(identify_va) & 1 != 0;
    log::debug!("nvme {}: vwc {}", disk_id, flush_supported);

    if flush_supported {
        admin_set_features(&mut queues, timeout, FEATURE_VOLATILE_WRITE_CACHE, 1)?;
    }

    // Active namespaces.
    admin_identify(
        &mut queues,
        timeout,
        2,
        0,
        PhysAddr::new(identify_pa.as_u64() + 2 * FRAME_SIZE),
    )?;

    let mut namespace = None;
    let ns_list = (identify_va + 2 * FRAME_SIZE).as_ptr::<u32>();
    for i in 0..(FRAME_SIZE as usize / 4) {
        let nsid = unsafe { ns_list.add(i).read_volatile() };
        if nsid == 0 {
            break;
        }

        if admin_identify(
            &mut queues,
            timeout,
            0,
            nsid,
            PhysAddr::new(identify_pa.as_u64() + FRAME_SIZE),
        )
        .is_err()
        {
            log::error!("nvme {}: cannot identify namespace {:#x}", disk_id, nsid);
            continue;
        }

        let identity = parse_identify_namespace(identify_va + FRAME_SIZE);
        log::debug!(
            "nvme {}: ns {:#x} size {:#x} lba {} bytes",
            disk_id,
            nsid,
            identity.nsze,
            identity.lba_size
        );

        namespace = Some(Namespace {
            id: nsid,
            lba_size: identity.lba_size,
            lba_count: identity.nsze,
        });
    }

    let namespace = namespace.ok_or(NvmeError::DeviceFault)?;

    // Ask for one I/O queue pair; the grant comes back in cdw0.
    let granted = admin_set_features(&mut queues, timeout, FEATURE_NUMBER_OF_QUEUES, 0)?;
    let granted_sq = (granted.cdw0 & 0xFFFF) as u16 + 1;
    let granted_cq = ((granted.cdw0 >> 16) & 0xFFFF) as u16 + 1;
    log::debug!("nvme {}: granted {} sq / {} cq", disk_id, granted_sq, granted_cq);

    // Completion interrupt.
    let io_vector = msix
        .set_isr(bar_va, IO_QUEUE_MSIX_INDEX, nvme_isr)
        .ok_or(NvmeError::InvalidArgument)?;

    admin_create_io_cq(
        &mut queues,
        timeout,
        PhysAddr::new(queue_pa.as_u64() + 3 * FRAME_SIZE),
        IO_QUEUE_MSIX_INDEX,
    )?;
    msix.clear_pending(bar_va, IO_QUEUE_MSIX_INDEX);

    admin_create_io_sq(
        &mut queues,
        timeout,
        PhysAddr::new(queue_pa.as_u64() + 2 * FRAME_SIZE),
    )?;

    // PRP-list pool: one page per I/O submission slot.
    let prp_block = frame_allocator::allocate_frames(QUEUE_DEPTH as u64, FrameKind::Reserved)
        .map_err(|_| NvmeError::InvalidArgument)?;
    let prp_va = map_device_block(&space, &prp_block)?;

    let disk = Arc::new(NvmeDisk {
        disk_id,
        queues: Mutex::new(queues),
        command_locks: Mutex::new(BTreeMap::new()),
        namespace,
        flush_supported,
        io_queues_granted: (granted_sq, granted_cq),
        io_vector,
        prp_pool_pa: prp_block.start_address(),
        prp_pool_va: prp_va,
        msix: Some((msix, bar_va)),
    });

    ISR_MAP.lock().insert(io_vector, disk.clone());
    NVME_DISKS.lock().insert(disk_id, disk);

    log::info!(
        "nvme disk {} online: ns {:#x}, {} blocks of {} bytes, flush {}",
        disk_id,
        namespace.id,
        namespace.lba_count,
        namespace.lba_size,
        flush_supported
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support;

    struct FakeController {
        io_sq: *mut SubmissionEntry,
        io_cq: *mut CompletionEntry,
        io_sq_doorbell: *mut u32,
        io_cq_doorbell: *mut u32,
    }

    fn leak<T>(value: T) -> *mut T {
        Box::leak(Box::new(value))
    }

    fn fake_disk(flush_supported: bool) -> (Arc<NvmeDisk>, FakeController) {
        let io_sq = leak([SubmissionEntry::zeroed(); QUEUE_DEPTH as usize]) as *mut SubmissionEntry;
        let io_cq = leak([CompletionEntry::zeroed(); QUEUE_DEPTH as usize]) as *mut CompletionEntry;
        let admin_sq =
            leak([SubmissionEntry::zeroed(); QUEUE_DEPTH as usize]) as *mut SubmissionEntry;
        let admin_cq =
            leak([CompletionEntry::zeroed(); QUEUE_DEPTH as usize]) as *mut CompletionEntry;

        let io_sq_doorbell = leak(0u32);
        let io_cq_doorbell = leak(0u32);

        let prp_block =
            frame_allocator::allocate_frames(QUEUE_DEPTH as u64, FrameKind::Reserved).unwrap();

        let disk = Arc::new(NvmeDisk {
            disk_id: 7,
            queues: Mutex::new(NvmeQueues {
                admin_sq,
                admin_cq,
                io_sq,
                io_cq,
                admin_sq_tail: 0,
                admin_cq_head: 0,
                io_sq_tail: 0,
                io_cq_head: 0,
                admin_sq_doorbell: leak(0u32),
                admin_cq_doorbell: leak(0u32),
                io_sq_doorbell,
                io_cq_doorbell,
                next_cid: 1,
            }),
            command_locks: Mutex::new(BTreeMap::new()),
            namespace: Namespace {
                id: 1,
                lba_size: 512,
                lba_count: 0x100000,
            },
            flush_supported,
            io_queues_granted: (1, 1),
            io_vector: 0x70,
            prp_pool_pa: prp_block.start_address(),
            prp_pool_va: phys_to_virt(prp_block.start_address()),
            msix: None,
        });

        (
            disk,
            FakeController {
                io_sq,
                io_cq,
                io_sq_doorbell,
                io_cq_doorbell,
            },
        )
    }

    /// A page-aligned, kernel-mapped buffer inside the test pool.
    fn dma_buffer(pages: u64) -> VirtAddr {
        let space = paging::kernel_space().unwrap();
        let block = frame_allocator::allocate_frames(pages, FrameKind::Used).unwrap();
        let va = phys_to_virt(block.start_address());
        for (i, pa) in block.frames().enumerate() {
            space
                .map_to(
                    va + i as u64 * FRAME_SIZE,
                    pa,
                    MapSize::Size4KiB,
                    PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
                )
                .unwrap();
        }
        va
    }

    fn setup() -> test_support::TestEnv {
        let env = test_support::setup();
        paging::build_kernel_space(&test_support::synthetic_layout()).unwrap();
        NVME_DISKS.lock().clear();
        ISR_MAP.lock().clear();
        env
    }

    #[test]
    fn invalid_transfers_are_rejected_before_lookup() {
        let _env = setup();

        // Unaligned size.
        assert_eq!(
            read_write(0, 0, 0x1001, VirtAddr::new(0), false).unwrap_err(),
            NvmeError::InvalidArgument
        );
        // Oversized.
        assert_eq!(
            read_write(0, 0, (MAX_TRANSFER_PAGES + 1) * FRAME_SIZE, VirtAddr::new(0), false)
                .unwrap_err(),
            NvmeError::InvalidArgument
        );
        // Unaligned buffer.
        assert_eq!(
            read_write(0, 0, 0x1000, VirtAddr::new(0x123), false).unwrap_err(),
            NvmeError::InvalidArgument
        );
        // Unmapped buffer.
        assert_eq!(
            read_write(0, 0, 0x1000, VirtAddr::new(0x7000_0000), false).unwrap_err(),
            NvmeError::InvalidArgument
        );

        // Only a fully valid request reaches the registry.
        let buffer = dma_buffer(1);
        assert_eq!(
            read_write(0, 0, 0x1000, buffer, false).unwrap_err(),
            NvmeError::NotFound
        );
    }

    #[test]
    fn submission_fills_the_wire_entry() {
        let _env = setup();
        let (disk, ctrl) = fake_disk(false);
        NVME_DISKS.lock().insert(disk.disk_id, disk.clone());

        let buffer = dma_buffer(1);
        let lba = 0x1_2345_6789u64;
        let fut = read(disk.disk_id, lba, 0x1000, buffer).unwrap();
        assert!(!fut.is_resolved());

        let entry = unsafe { ctrl.io_sq.read_volatile() };
        assert_eq!(entry.opc, IO_CMD_READ);
        assert_eq!(entry.nsid, 1);
        assert_eq!(entry.prp1, buffer.as_u64()); // identity view in tests
        assert_eq!(entry.prp2, 0);
        assert_eq!(entry.cdw10, lba as u32);
        assert_eq!(entry.cdw11, (lba >> 32) as u32);
        assert_eq!(entry.cdw12, 0);

        // Tail doorbell rang once.
        assert_eq!(unsafe { ctrl.io_sq_doorbell.read_volatile() }, 1);
        assert_eq!(disk.outstanding_commands(), 1);
    }

    #[test]
    fn large_transfer_builds_a_prp_list() {
        let _env = setup();
        let (disk, ctrl) = fake_disk(false);
        NVME_DISKS.lock().insert(disk.disk_id, disk.clone());

        let buffer = dma_buffer(4);
        write(disk.disk_id, 8, 4 * FRAME_SIZE, buffer).unwrap();

        let entry = unsafe { ctrl.io_sq.read_volatile() };
        assert_eq!(entry.opc, IO_CMD_WRITE);
        assert_eq!(entry.cdw12, 3); // zero-based block count

        // Slot 0's PRP page holds pages 2..4 of the buffer.
        assert_eq!(entry.prp2, disk.prp_pool_pa.as_u64());
        let list = disk.prp_pool_va.as_u64() as *const u64;
        unsafe {
            assert_eq!(list.read_volatile(), buffer.as_u64() + FRAME_SIZE);
            assert_eq!(list.add(1).read_volatile(), buffer.as_u64() + 2 * FRAME_SIZE);
            assert_eq!(list.add(2).read_volatile(), buffer.as_u64() + 3 * FRAME_SIZE);
            assert_eq!(list.add(3).read_volatile(), 0);
        }
    }

    #[test]
    fn two_page_transfer_uses_prp2_directly() {
        let _env = setup();
        let (disk, ctrl) = fake_disk(false);
        NVME_DISKS.lock().insert(disk.disk_id, disk.clone());

        let buffer = dma_buffer(2);
        read(disk.disk_id, 0, 2 * FRAME_SIZE, buffer).unwrap();

        let entry = unsafe { ctrl.io_sq.read_volatile() };
        assert_eq!(entry.prp1, buffer.as_u64());
        assert_eq!(entry.prp2, buffer.as_u64() + FRAME_SIZE);
    }

    #[test]
    fn concurrent_submissions_get_distinct_cids() {
        let _env = setup();
        let (disk, ctrl) = fake_disk(false);
        NVME_DISKS.lock().insert(disk.disk_id, disk.clone());

        let buffer = dma_buffer(1);
        let fut_a = read(disk.disk_id, 0, 0x1000, buffer).unwrap();
        let fut_b = read(disk.disk_id, 8, 0x1000, buffer).unwrap();

        let (cid_a, cid_b) = unsafe {
            (
                ctrl.io_sq.read_volatile().cid,
                ctrl.io_sq.add(1).read_volatile().cid,
            )
        };
        assert_ne!(cid_a, cid_b);

        // Resolve the second command first; the futures are independent.
        unsafe {
            ctrl.io_cq.write_volatile(CompletionEntry {
                cid: cid_b,
                status: 1, // phase only
                ..CompletionEntry::zeroed()
            });
        }
        disk.handle_completion();

        assert!(fut_b.is_resolved());
        assert!(!fut_a.is_resolved());

        unsafe {
            ctrl.io_cq.add(1).write_volatile(CompletionEntry {
                cid: cid_a,
                status: 1,
                ..CompletionEntry::zeroed()
            });
        }
        disk.handle_completion();
        assert!(fut_a.is_resolved());
    }

    #[test]
    fn completion_advances_head_and_rings_doorbell() {
        let _env = setup();
        let (disk, ctrl) = fake_disk(false);
        NVME_DISKS.lock().insert(disk.disk_id, disk.clone());

        let buffer = dma_buffer(1);
        let fut = read(disk.disk_id, 0, 0x1000, buffer).unwrap();
        let cid = unsafe { ctrl.io_sq.read_volatile().cid };

        unsafe {
            ctrl.io_cq.write_volatile(CompletionEntry {
                cid,
                status: 1,
                ..CompletionEntry::zeroed()
            });
        }
        disk.handle_completion();

        assert!(fut.is_resolved());
        assert_eq!(unsafe { ctrl.io_cq_doorbell.read_volatile() }, 1);
        assert_eq!(disk.outstanding_commands(), 0);
    }

    #[test]
    fn flush_depends_on_volatile_write_cache() {
        let _env = setup();

        let (no_cache, _) = fake_disk(false);
        NVME_DISKS.lock().insert(no_cache.disk_id, no_cache.clone());
        assert!(flush(no_cache.disk_id).unwrap().is_none());

        NVME_DISKS.lock().clear();
        let (cached, ctrl) = fake_disk(true);
        NVME_DISKS.lock().insert(cached.disk_id, cached.clone());

        let fut = flush(cached.disk_id).unwrap().expect("future expected");
        assert!(!fut.is_resolved());

        let entry = unsafe { ctrl.io_sq.read_volatile() };
        assert_eq!(entry.opc, IO_CMD_FLUSH);
        assert_eq!(entry.nsid, 0xFFFF_FFFF);
        assert_eq!(entry.prp1, 0);
        assert_eq!(entry.cdw12, 0);

        assert_eq!(flush(99).unwrap_err(), NvmeError::NotFound);
    }

    #[test]
    fn cid_counter_wraps_without_reuse_in_flight() {
        let _env = setup();
        let (disk, _ctrl) = fake_disk(false);

        let mut q = disk.queues.lock();
        q.next_cid = u16::MAX;
        let a = q.fresh_cid();
        let b = q.fresh_cid();
        assert_eq!(a, u16::MAX);
        assert_eq!(b, 0);
    }
}
