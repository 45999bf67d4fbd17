//! PnP cards and their logical devices.

use std::fmt;

use crate::config::{
    IsaPnpDeviceConfig, DMA_BASE_REG, DMA_DISABLED, IO_BASE_REG, IO_RANGE_COUNT, MEM_CONTROL_REGS,
};
use crate::isolation::SerialIsolation;
use crate::rom::EisaId;

/// Driver-side hooks for a PnP card.
///
/// Every method has a no-op default so drivers only implement what they consume. Hooks run
/// synchronously from inside a port access and must not touch the PnP ports themselves.
pub trait IsaPnpCardHooks {
    /// A logical device's configuration registers changed (activation, resources, or reset).
    fn config_changed(&mut self, _ldn: u8, _config: &IsaPnpDeviceConfig) {}

    /// The card's CSN changed.
    fn csn_changed(&mut self, _csn: u8) {}

    /// Read a vendor-defined register. Card-level registers (0x20-0x2F) report `ldn` 0.
    fn read_vendor_reg(&mut self, _ldn: u8, _reg: u8) -> u8 {
        0xFF
    }

    /// Write a vendor-defined register. Card-level registers (0x20-0x2F) report `ldn` 0.
    fn write_vendor_reg(&mut self, _ldn: u8, _reg: u8, _value: u8) {}
}

/// Hooks for cards whose driver does not care about any PnP events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl IsaPnpCardHooks for NoHooks {}

/// Per-card PnP protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    WaitForKey,
    Sleep,
    Isolation,
    Config,
}

/// Opaque handle returned by [`crate::IsaPnpController::add_card`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CardHandle(pub(crate) usize);

/// One configurable function of a card.
#[derive(Clone, PartialEq, Eq)]
pub struct LogicalDevice {
    number: u8,
    id: EisaId,
    regs: [u8; 256],
    upper_limit: u8,
}

impl LogicalDevice {
    pub(crate) fn new(number: u8, id: EisaId) -> Self {
        Self {
            number,
            id,
            regs: [0; 256],
            upper_limit: 0,
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    /// Logical device ID from the resource descriptor.
    pub fn id(&self) -> EisaId {
        self.id
    }

    pub fn regs(&self) -> &[u8; 256] {
        &self.regs
    }

    pub fn reg(&self, reg: u8) -> u8 {
        self.regs[usize::from(reg)]
    }

    /// Memory slots using upper-limit addressing: bits 0-3 for the 24-bit ranges, bits 4-7 for
    /// the 32-bit ranges.
    pub fn upper_limit_mask(&self) -> u8 {
        self.upper_limit
    }

    /// I/O base programmed into I/O descriptor `index` (0-7).
    pub fn io_base(&self, index: usize) -> u16 {
        let reg = usize::from(IO_BASE_REG) + 2 * index;
        u16::from_be_bytes([self.regs[reg], self.regs[reg + 1]])
    }

    pub fn io_bases(&self) -> impl Iterator<Item = u16> + '_ {
        (0..IO_RANGE_COUNT).map(move |i| self.io_base(i))
    }

    pub fn config(&self) -> IsaPnpDeviceConfig {
        IsaPnpDeviceConfig::from_regs(&self.regs)
    }

    pub(crate) fn set_upper_limit(&mut self, bit: u8, enabled: bool) {
        if enabled {
            self.upper_limit |= 1 << bit;
        } else {
            self.upper_limit &= !(1 << bit);
        }
    }

    /// Restore power-on register defaults.
    pub(crate) fn reset_regs(&mut self) {
        self.regs = [0; 256];

        let dma = usize::from(DMA_BASE_REG);
        self.regs[dma] = DMA_DISABLED;
        self.regs[dma + 1] = DMA_DISABLED;

        for (bit, &reg) in MEM_CONTROL_REGS.iter().enumerate() {
            if self.upper_limit & (1 << bit) != 0 {
                self.regs[usize::from(reg)] |= 0x01;
            }
        }
    }

    pub(crate) fn set_reg(&mut self, reg: u8, value: u8) {
        self.regs[usize::from(reg)] = value;
    }

    /// Store a configuration register (0x40 and up), keeping the read-only upper-limit flag of
    /// memory control registers.
    pub(crate) fn write_config_reg(&mut self, reg: u8, value: u8) {
        let value = if MEM_CONTROL_REGS.contains(&reg) {
            (value & !0x01) | (self.reg(reg) & 0x01)
        } else {
            value
        };
        self.set_reg(reg, value);
    }
}

impl fmt::Debug for LogicalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalDevice")
            .field("number", &self.number)
            .field("id", &self.id)
            .field("upper_limit", &format_args!("{:#04x}", self.upper_limit))
            .finish_non_exhaustive()
    }
}

/// A physical PnP card.
pub struct Card {
    pub(crate) state: CardState,
    pub(crate) csn: u8,
    pub(crate) rom: Vec<u8>,
    pub(crate) rom_pos: usize,
    pub(crate) isolation: SerialIsolation,
    pub(crate) devices: Vec<LogicalDevice>,
    pub(crate) hooks: Box<dyn IsaPnpCardHooks>,
}

impl Card {
    pub(crate) fn new(
        rom: Vec<u8>,
        devices: Vec<LogicalDevice>,
        hooks: Box<dyn IsaPnpCardHooks>,
    ) -> Self {
        Self {
            state: CardState::WaitForKey,
            csn: 0,
            rom,
            rom_pos: 0,
            isolation: SerialIsolation::default(),
            devices,
            hooks,
        }
    }

    pub fn state(&self) -> CardState {
        self.state
    }

    pub fn csn(&self) -> u8 {
        self.csn
    }

    /// Resource ROM, including the checksums filled in at attach and during isolation.
    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    pub fn vendor_id(&self) -> EisaId {
        EisaId::from_bytes([self.rom[0], self.rom[1], self.rom[2], self.rom[3]])
    }

    pub fn serial_number(&self) -> u32 {
        u32::from_le_bytes([self.rom[4], self.rom[5], self.rom[6], self.rom[7]])
    }

    pub fn isolation(&self) -> &SerialIsolation {
        &self.isolation
    }

    pub fn logical_devices(&self) -> &[LogicalDevice] {
        &self.devices
    }

    /// Look up a logical device by its device number.
    pub fn logical_device(&self, ldn: u8) -> Option<&LogicalDevice> {
        self.devices.iter().find(|ld| ld.number == ldn)
    }

    pub(crate) fn set_csn(&mut self, csn: u8) {
        self.csn = csn;
        self.hooks.csn_changed(csn);
    }

    /// Re-arm the card for isolation or configuration reads (Wake[CSN] match).
    pub(crate) fn wake(&mut self) {
        self.rom_pos = 0;
        self.isolation.wake();
    }

    /// Next byte of resource data, or 0xFF past the end of the ROM.
    pub(crate) fn next_resource_byte(&mut self) -> u8 {
        match self.rom.get(self.rom_pos) {
            Some(&byte) => {
                self.rom_pos += 1;
                byte
            }
            None => 0xFF,
        }
    }

    /// Notify the driver about the current configuration of the device at `index`.
    pub(crate) fn notify_config_changed(&mut self, index: usize) {
        let ld = &self.devices[index];
        let config = ld.config();
        self.hooks.config_changed(ld.number, &config);
    }

    pub(crate) fn vendor_read(&mut self, ldn: u8, reg: u8) -> u8 {
        self.hooks.read_vendor_reg(ldn, reg)
    }

    pub(crate) fn vendor_write(&mut self, ldn: u8, reg: u8, value: u8) {
        self.hooks.write_vendor_reg(ldn, reg, value);
    }
}

impl fmt::Debug for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Card")
            .field("vendor_id", &self.vendor_id())
            .field("serial", &format_args!("{:08X}", self.serial_number()))
            .field("state", &self.state)
            .field("csn", &self.csn)
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}
