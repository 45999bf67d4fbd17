//! Host-facing view of a logical device's configuration registers.
//!
//! ISA PnP memory and I/O addresses are stored big endian in the register file, and memory
//! ranges encode their second bound either as a length or as an upper limit. The projection
//! below normalizes all of that into native integers and always reports a size.

/// Value of a DMA channel select register when the channel is disabled.
pub const DMA_DISABLED: u8 = 4;

pub const REG_ACTIVATE: u8 = 0x30;
pub const REG_IO_RANGE_CHECK: u8 = 0x31;

/// Base registers of the four 24-bit memory descriptors.
pub const MEM_BASE_REGS: [u8; 4] = [0x40, 0x48, 0x50, 0x58];
/// Base registers of the four 32-bit memory descriptors.
pub const MEM32_BASE_REGS: [u8; 4] = [0x76, 0x80, 0x90, 0xA0];
/// First of the eight 16-bit I/O base registers (two bytes each).
pub const IO_BASE_REG: u8 = 0x60;
pub const IO_RANGE_COUNT: usize = 8;
/// First IRQ select register; each IRQ descriptor is a line byte followed by a type byte.
pub const IRQ_BASE_REG: u8 = 0x70;
pub const DMA_BASE_REG: u8 = 0x74;

/// Memory control registers holding the read-only upper-limit flag in bit 0, indexed by
/// upper-limit mask bit (24-bit slots first, then 32-bit slots).
pub const MEM_CONTROL_REGS: [u8; 8] = [0x42, 0x4A, 0x52, 0x5A, 0x7A, 0x84, 0x94, 0xA4];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemRange {
    pub base: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoRange {
    pub base: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqConfig {
    pub irq: u8,
    /// Interrupt request type bit 1: active high (vs. active low).
    pub active_high: bool,
    /// Interrupt request type bit 0: level triggered (vs. edge).
    pub level_triggered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaConfig {
    pub dma: u8,
}

impl DmaConfig {
    pub fn enabled(&self) -> bool {
        self.dma != DMA_DISABLED
    }
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self { dma: DMA_DISABLED }
    }
}

/// Configuration of one logical device, passed to
/// [`crate::IsaPnpCardHooks::config_changed`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsaPnpDeviceConfig {
    pub activate: bool,
    pub mem: [MemRange; 4],
    pub mem32: [MemRange; 4],
    pub io: [IoRange; IO_RANGE_COUNT],
    pub irq: [IrqConfig; 2],
    pub dma: [DmaConfig; 2],
}

fn be16(regs: &[u8; 256], reg: u8) -> u16 {
    let reg = usize::from(reg);
    u16::from_be_bytes([regs[reg], regs[reg + 1]])
}

fn be32(regs: &[u8; 256], reg: u8) -> u32 {
    let reg = usize::from(reg);
    u32::from_be_bytes([regs[reg], regs[reg + 1], regs[reg + 2], regs[reg + 3]])
}

impl IsaPnpDeviceConfig {
    /// Project a raw register file.
    pub fn from_regs(regs: &[u8; 256]) -> Self {
        let mut config = Self {
            activate: regs[usize::from(REG_ACTIVATE)] & 0x01 != 0,
            ..Self::default()
        };

        // 24-bit ranges: bits 23..8 of base and length/limit, control byte in between.
        for (range, &reg) in config.mem.iter_mut().zip(&MEM_BASE_REGS) {
            range.base = u32::from(be16(regs, reg)) << 8;
            range.size = u32::from(be16(regs, reg + 3)) << 8;
            if regs[usize::from(reg + 2)] & 0x01 != 0 {
                range.size = range.size.wrapping_sub(range.base);
            }
        }

        for (range, &reg) in config.mem32.iter_mut().zip(&MEM32_BASE_REGS) {
            range.base = be32(regs, reg);
            range.size = be32(regs, reg + 5);
            if regs[usize::from(reg + 4)] & 0x01 != 0 {
                range.size = range.size.wrapping_sub(range.base);
            }
        }

        for (i, io) in config.io.iter_mut().enumerate() {
            io.base = be16(regs, IO_BASE_REG + 2 * i as u8);
        }

        for (i, irq) in config.irq.iter_mut().enumerate() {
            let reg = usize::from(IRQ_BASE_REG) + 2 * i;
            irq.irq = regs[reg];
            irq.active_high = regs[reg + 1] & 0x02 != 0;
            irq.level_triggered = regs[reg + 1] & 0x01 != 0;
        }

        for (i, dma) in config.dma.iter_mut().enumerate() {
            dma.dma = regs[usize::from(DMA_BASE_REG) + i];
        }

        config
    }
}
