//! PCI configuration space access, device discovery and MSI-X.
//!
//! Configuration space is reached through the legacy I/O port pair:
//! CONFIG_ADDRESS (0xCF8) selects bus/device/function/register,
//! CONFIG_DATA (0xCFC) moves the data.

use alloc::vec::Vec;
use x86_64::instructions::port::Port;
use x86_64::VirtAddr;

/// PCI configuration address port.
const CONFIG_ADDRESS: u16 = 0xCF8;
/// PCI configuration data port.
const CONFIG_DATA: u16 = 0xCFC;

const MAX_BUS: u16 = 256;
const MAX_DEVICE: u8 = 32;
const MAX_FUNCTION: u8 = 8;

/// Mass storage class / NVM subclass / NVMe programming interface.
pub const CLASS_MASS_STORAGE: u8 = 0x01;
pub const SUBCLASS_NVM: u8 = 0x08;
pub const PROG_IF_NVME: u8 = 0x02;

/// MSI-X capability id.
pub const CAP_ID_MSIX: u8 = 0x11;

fn config_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    0x8000_0000
        | ((bus as u32) << 16)
        | ((device as u32) << 11)
        | ((function as u32) << 8)
        | ((offset as u32) & 0xFC)
}

fn config_read_u32(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    unsafe {
        Port::<u32>::new(CONFIG_ADDRESS).write(config_address(bus, device, function, offset));
        Port::<u32>::new(CONFIG_DATA).read()
    }
}

fn config_write_u32(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    unsafe {
        Port::<u32>::new(CONFIG_ADDRESS).write(config_address(bus, device, function, offset));
        Port::<u32>::new(CONFIG_DATA).write(value);
    }
}

/// One discovered PCI function.
#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
}

/// Base Address Register information.
#[derive(Debug, Clone, Copy)]
pub struct Bar {
    pub address: u64,
    pub size: u64,
    pub is_io: bool,
    pub is_64bit: bool,
    pub prefetchable: bool,
}

impl PciDevice {
    pub fn read_u32(&self, offset: u8) -> u32 {
        config_read_u32(self.bus, self.device, self.function, offset)
    }

    pub fn write_u32(&self, offset: u8, value: u32) {
        config_write_u32(self.bus, self.device, self.function, offset, value);
    }

    pub fn read_u16(&self, offset: u8) -> u16 {
        (self.read_u32(offset & 0xFC) >> ((offset & 2) * 8)) as u16
    }

    pub fn write_u16(&self, offset: u8, value: u16) {
        let aligned = offset & 0xFC;
        let shift = ((offset & 2) * 8) as u32;
        let old = self.read_u32(aligned);
        let new = (old & !(0xFFFF << shift)) | ((value as u32) << shift);
        self.write_u32(aligned, new);
    }

    pub fn read_u8(&self, offset: u8) -> u8 {
        (self.read_u32(offset & 0xFC) >> ((offset & 3) * 8)) as u8
    }

    /// Probe one BAR: address, size (all-ones write trick) and kind.
    pub fn bar(&self, index: u8) -> Option<Bar> {
        if index >= 6 {
            return None;
        }
        let offset = 0x10 + index * 4;
        let raw = self.read_u32(offset);
        if raw == 0 {
            return None;
        }

        let is_io = raw & 1 != 0;
        if is_io {
            self.write_u32(offset, 0xFFFF_FFFF);
            let mask = self.read_u32(offset);
            self.write_u32(offset, raw);
            let size = (!(mask & !0x3)).wrapping_add(1) as u64;
            return Some(Bar {
                address: (raw & !0x3) as u64,
                size,
                is_io: true,
                is_64bit: false,
                prefetchable: false,
            });
        }

        let is_64bit = (raw >> 1) & 0x3 == 0x2;
        let prefetchable = raw & 0x8 != 0;
        let mut address = (raw & !0xF) as u64;

        self.write_u32(offset, 0xFFFF_FFFF);
        let mask_lo = self.read_u32(offset) & !0xF;
        self.write_u32(offset, raw);

        let mut size_mask = mask_lo as u64;
        if is_64bit {
            let raw_hi = self.read_u32(offset + 4);
            address |= (raw_hi as u64) << 32;

            self.write_u32(offset + 4, 0xFFFF_FFFF);
            let mask_hi = self.read_u32(offset + 4);
            self.write_u32(offset + 4, raw_hi);
            size_mask |= (mask_hi as u64) << 32;
        } else {
            size_mask |= 0xFFFF_FFFF_0000_0000;
        }

        let size = (!size_mask).wrapping_add(1);
        Some(Bar {
            address,
            size,
            is_io: false,
            is_64bit,
            prefetchable,
        })
    }

    /// Walk the capability list for the first entry with the given id.
    pub fn find_capability(&self, id: u8) -> Option<u8> {
        // Status register bit 4: capability list exists.
        if self.read_u16(0x06) & (1 << 4) == 0 {
            return None;
        }

        let mut offset = self.read_u8(0x34) & 0xFC;
        let mut guard = 0;
        while offset != 0 && guard < 48 {
            let cap_id = self.read_u8(offset);
            if cap_id == id {
                return Some(offset);
            }
            offset = self.read_u8(offset + 1) & 0xFC;
            guard += 1;
        }
        None
    }

    /// Enable memory decode and bus mastering so the device can DMA.
    pub fn enable_bus_master(&self) {
        let command = self.read_u16(0x04);
        self.write_u16(0x04, command | 0x6);
    }
}

fn probe_function(bus: u8, device: u8, function: u8) -> Option<PciDevice> {
    let id = config_read_u32(bus, device, function, 0x00);
    let vendor_id = (id & 0xFFFF) as u16;
    if vendor_id == 0xFFFF {
        return None;
    }

    let class_reg = config_read_u32(bus, device, function, 0x08);
    Some(PciDevice {
        bus,
        device,
        function,
        vendor_id,
        device_id: (id >> 16) as u16,
        class: (class_reg >> 24) as u8,
        subclass: (class_reg >> 16) as u8,
        prog_if: (class_reg >> 8) as u8,
    })
}

/// Enumerate every function and keep the NVMe controllers.
pub fn scan_nvme_controllers() -> Vec<PciDevice> {
    let mut found = Vec::new();

    for bus in 0..MAX_BUS {
        for device in 0..MAX_DEVICE {
            let Some(first) = probe_function(bus as u8, device, 0) else {
                continue;
            };

            let header_type = first.read_u8(0x0E);
            let functions = if header_type & 0x80 != 0 {
                MAX_FUNCTION
            } else {
                1
            };

            for function in 0..functions {
                let Some(dev) = probe_function(bus as u8, device, function) else {
                    continue;
                };
                if dev.class == CLASS_MASS_STORAGE
                    && dev.subclass == SUBCLASS_NVM
                    && dev.prog_if == PROG_IF_NVME
                {
                    log::info!(
                        "nvme controller {:04x}:{:04x} at {:02x}:{:02x}.{}",
                        dev.vendor_id,
                        dev.device_id,
                        dev.bus,
                        dev.device,
                        dev.function
                    );
                    found.push(dev);
                }
            }
        }
    }

    found
}

// ---------------------------------------------------------------------------
// MSI-X
// ---------------------------------------------------------------------------

/// Parsed MSI-X capability.
#[derive(Debug, Clone, Copy)]
pub struct MsiXCapability {
    cap_offset: u8,
    pub table_size: u16,
    pub table_bar: u8,
    pub table_offset: u32,
    pub pba_bar: u8,
    pub pba_offset: u32,
}

impl MsiXCapability {
    pub fn read(dev: &PciDevice) -> Option<Self> {
        let cap_offset = dev.find_capability(CAP_ID_MSIX)?;

        let control = dev.read_u16(cap_offset + 2);
        let table = dev.read_u32(cap_offset + 4);
        let pba = dev.read_u32(cap_offset + 8);

        Some(Self {
            cap_offset,
            table_size: (control & 0x7FF) + 1,
            table_bar: (table & 0x7) as u8,
            table_offset: table & !0x7,
            pba_bar: (pba & 0x7) as u8,
            pba_offset: pba & !0x7,
        })
    }

    /// Enable MSI-X delivery with the function mask lifted. Individual
    /// table entries stay masked until `set_isr` claims them.
    pub fn configure(&self, dev: &PciDevice) {
        let mut control = dev.read_u16(self.cap_offset + 2);
        control |= 1 << 15; // enable
        control &= !(1 << 14); // clear function mask
        dev.write_u16(self.cap_offset + 2, control);
    }

    fn table_entry(&self, bar_va: VirtAddr, index: u16) -> *mut u32 {
        (bar_va.as_u64() + self.table_offset as u64 + index as u64 * 16) as *mut u32
    }

    /// Claim an interrupt vector for one table entry and unmask it.
    /// `bar_va` is where the BAR holding the table is mapped.
    pub fn set_isr(
        &self,
        bar_va: VirtAddr,
        index: u16,
        handler: fn(u8),
    ) -> Option<u8> {
        if index >= self.table_size {
            return None;
        }

        let vector = crate::interrupts::allocate_msix_vector(handler)?;
        let address = crate::apic::msi_address(crate::apic::local_id());

        let entry = self.table_entry(bar_va, index);
        unsafe {
            core::ptr::write_volatile(entry, address as u32);
            core::ptr::write_volatile(entry.add(1), (address >> 32) as u32);
            core::ptr::write_volatile(entry.add(2), vector as u32);
            // Vector control: clear the mask bit.
            core::ptr::write_volatile(entry.add(3), 0);
        }

        Some(vector)
    }

    /// Clear one bit in the pending-bit array after handling its vector.
    pub fn clear_pending(&self, bar_va: VirtAddr, index: u16) {
        let word = (bar_va.as_u64() + self.pba_offset as u64 + (index as u64 / 64) * 8)
            as *mut u64;
        unsafe {
            let pending = core::ptr::read_volatile(word);
            core::ptr::write_volatile(word, pending & !(1u64 << (index % 64)));
        }
    }
}
