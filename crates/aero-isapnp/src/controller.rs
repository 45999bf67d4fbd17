//! ISA PnP controller: initiation key, card state machine and the ADDRESS/WRITE_DATA/READ_DATA
//! register protocol.
//!
//! The controller is the machine-wide PnP "bus". Hosts route the fixed ADDRESS and WRITE_DATA
//! ports to it, plus reads of the relocatable READ_DATA port and of any I/O range check
//! responders. Those dynamic ports are resolved against live controller state on every access
//! (see [`IsaPnpController::dispatch_read`]), so a guest relocating them takes effect
//! immediately.
//!
//! Bus contention during isolation is not modeled: when several cards are in ISOLATION at once,
//! the first attached one drives the bus and wins the CSN.

use bitflags::bitflags;
use tracing::{debug, error, warn};

use crate::card::{Card, CardHandle, CardState, IsaPnpCardHooks};
use crate::config::{REG_ACTIVATE, REG_IO_RANGE_CHECK};
use crate::error::{IsaPnpError, Result};
use crate::isolation::{INITIATION_KEY, RESOURCE_DATA_OFFSET};
use crate::rom::parse_resources;

/// Canonical ADDRESS port (write-only).
pub const ADDRESS_PORT: u16 = 0x279;
/// Canonical WRITE_DATA port (write-only).
pub const WRITE_DATA_PORT: u16 = 0xA79;
/// Valid READ_DATA port range.
pub const READ_DATA_PORT_MIN: u16 = 0x203;
pub const READ_DATA_PORT_MAX: u16 = 0x3FF;

pub const REG_SET_RD_DATA: u8 = 0x00;
pub const REG_SERIAL_ISOLATION: u8 = 0x01;
pub const REG_CONFIG_CONTROL: u8 = 0x02;
pub const REG_WAKE: u8 = 0x03;
pub const REG_RESOURCE_DATA: u8 = 0x04;
pub const REG_STATUS: u8 = 0x05;
pub const REG_CARD_SELECT_NUMBER: u8 = 0x06;
pub const REG_LOGICAL_DEVICE_NUMBER: u8 = 0x07;

const RANGE_CHECK_ENABLE: u8 = 0x02;
const RANGE_CHECK_PATTERN_55: u8 = 0x01;

bitflags! {
    /// Config Control (register 0x02) commands. Each bit is an independent broadcast command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConfigControl: u8 {
        const RESET = 0x01;
        const WAIT_FOR_KEY = 0x02;
        const RESET_CSN = 0x04;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsaPnpConfig {
    pub address_port: u16,
    pub write_data_port: u16,
}

impl Default for IsaPnpConfig {
    fn default() -> Self {
        Self {
            address_port: ADDRESS_PORT,
            write_data_port: WRITE_DATA_PORT,
        }
    }
}

/// Index of a logical device: (card, device) positions in the owning vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LdRef {
    card: usize,
    ld: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RangeCheckResponder {
    port: u16,
    target: LdRef,
}

#[derive(Debug)]
pub struct IsaPnpController {
    config: IsaPnpConfig,
    reg: u8,
    key_pos: u8,
    read_data_port: Option<u16>,
    cards: Vec<Card>,
    isolated_card: Option<usize>,
    current_ld: Option<LdRef>,
    range_checks: Vec<RangeCheckResponder>,
    fault: Option<IsaPnpError>,
}

impl Default for IsaPnpController {
    fn default() -> Self {
        Self::new(IsaPnpConfig::default())
    }
}

impl IsaPnpController {
    pub fn new(config: IsaPnpConfig) -> Self {
        Self {
            config,
            reg: 0,
            key_pos: 0,
            read_data_port: None,
            cards: Vec::new(),
            isolated_card: None,
            current_ld: None,
            range_checks: Vec::new(),
            fault: None,
        }
    }

    pub fn config(&self) -> &IsaPnpConfig {
        &self.config
    }

    /// Attach a card described by `rom`.
    ///
    /// The ROM is parsed immediately: its resource and serial identifier checksums are filled in
    /// and its logical devices are created with default registers.
    pub fn add_card<H>(&mut self, rom: Vec<u8>, hooks: H) -> Result<CardHandle>
    where
        H: IsaPnpCardHooks + 'static,
    {
        let mut rom = rom;
        let devices = parse_resources(&mut rom).map_err(|err| {
            error!(%err, "rejecting ISA PnP card");
            err
        })?;

        let handle = CardHandle(self.cards.len());
        let card = Card::new(rom, devices, Box::new(hooks));
        debug!(
            card = %card.vendor_id(),
            serial = format_args!("{:08X}", card.serial_number()),
            devices = card.logical_devices().len(),
            "ISA PnP card attached"
        );
        self.cards.push(card);
        Ok(handle)
    }

    /// Force a card's CSN outside the isolation handshake.
    pub fn set_csn(&mut self, handle: CardHandle, csn: u8) {
        let Some(card) = self.cards.get_mut(handle.0) else {
            warn!(?handle, "set_csn on unknown card");
            return;
        };
        debug!(card = %card.vendor_id(), csn, "CSN forced");
        card.set_csn(csn);
    }

    pub fn card(&self, handle: CardHandle) -> Option<&Card> {
        self.cards.get(handle.0)
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    /// Register index most recently written to the ADDRESS port.
    pub fn register_index(&self) -> u8 {
        self.reg
    }

    /// Number of initiation key bytes matched so far.
    pub fn key_position(&self) -> u8 {
        self.key_pos
    }

    pub fn read_data_port(&self) -> Option<u16> {
        self.read_data_port
    }

    /// Ports currently answering I/O range check reads.
    pub fn range_check_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.range_checks.iter().map(|r| r.port)
    }

    /// Take the last fatal error latched by a port adapter.
    pub fn take_fault(&mut self) -> Option<IsaPnpError> {
        self.fault.take()
    }

    pub(crate) fn latch_fault(&mut self, err: IsaPnpError) {
        self.fault = Some(err);
    }

    /// Machine reset: drop key progress and the register index, then reset every card as a
    /// Config Control write of 0x07 would.
    pub fn reset(&mut self) {
        self.key_pos = 0;
        self.reg = 0;
        self.fault = None;
        self.config_control(ConfigControl::all());
    }

    /// Route a read to READ_DATA or a range check responder.
    ///
    /// Returns `None` if `port` is not currently decoded by the controller.
    pub fn dispatch_read(&mut self, port: u16) -> Option<u8> {
        if self.read_data_port == Some(port) {
            return Some(self.read_data());
        }
        self.read_range_check(port)
    }

    /// Route a write to ADDRESS or WRITE_DATA.
    ///
    /// Returns `Ok(false)` if `port` is not one of the controller's write ports.
    pub fn dispatch_write(&mut self, port: u16, value: u8) -> Result<bool> {
        if port == self.config.address_port {
            self.write_address(value);
            Ok(true)
        } else if port == self.config.write_data_port {
            self.write_data(value)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn write_address(&mut self, value: u8) {
        let Some(first) = self.cards.first() else {
            return;
        };

        // All cards leave WAIT_FOR_KEY together, so the first card stands in for the bus.
        if first.state != CardState::WaitForKey {
            self.reg = value;
            return;
        }

        if value != INITIATION_KEY[usize::from(self.key_pos)] {
            self.key_pos = 0;
            return;
        }

        self.key_pos = (self.key_pos + 1) % INITIATION_KEY.len() as u8;
        if self.key_pos == 0 {
            debug!("initiation key matched, cards to SLEEP");
            for card in &mut self.cards {
                if card.state == CardState::WaitForKey {
                    card.state = CardState::Sleep;
                }
            }
        }
    }

    pub fn write_data(&mut self, value: u8) -> Result<()> {
        let reg = self.reg;
        match reg {
            REG_SET_RD_DATA => {
                self.set_read_data_port((u16::from(value) << 2) | 0x3);
                debug!(port = ?self.read_data_port, "READ_DATA port set");
            }
            REG_CONFIG_CONTROL => self.config_control(ConfigControl::from_bits_truncate(value)),
            REG_WAKE => self.wake(value),
            REG_CARD_SELECT_NUMBER => match self.isolated_card.take() {
                Some(idx) => {
                    let card = &mut self.cards[idx];
                    debug!(card = %card.vendor_id(), csn = value, "CSN assigned");
                    card.set_csn(value);
                    card.state = CardState::Config;
                }
                None => debug!(csn = value, "CSN write with no isolated card"),
            },
            REG_LOGICAL_DEVICE_NUMBER => {
                let Some(card_idx) = self.config_card() else {
                    warn!(ldn = value, "logical device select with no card in CONFIG state");
                    return Ok(());
                };
                let card = &self.cards[card_idx];
                let Some(ld_idx) = card.devices.iter().position(|ld| ld.number() == value) else {
                    let err = IsaPnpError::UnknownLogicalDevice {
                        csn: card.csn,
                        ldn: value,
                    };
                    error!(%err, "invalid logical device select");
                    return Err(err);
                };
                debug!(csn = card.csn, ldn = value, "logical device selected");
                self.current_ld = Some(LdRef {
                    card: card_idx,
                    ld: ld_idx,
                });
            }
            REG_ACTIVATE => {
                let Some(target) = self.current_ld() else {
                    return Ok(());
                };
                let card = &mut self.cards[target.card];
                debug!(
                    csn = card.csn,
                    ldn = card.devices[target.ld].number(),
                    active = value & 0x01 != 0,
                    "activate"
                );
                card.devices[target.ld].set_reg(REG_ACTIVATE, value & 0x01);
                card.notify_config_changed(target.ld);
            }
            REG_IO_RANGE_CHECK => {
                let Some(target) = self.current_ld() else {
                    return Ok(());
                };
                self.io_range_check(target, value);
            }
            0x20..=0x2F => {
                let Some(card_idx) = self.config_card() else {
                    warn!(reg, value, "card vendor register write with no card in CONFIG state");
                    return Ok(());
                };
                let card = &mut self.cards[card_idx];
                debug!(csn = card.csn, reg, value, "card vendor register write");
                card.vendor_write(0, reg, value);
            }
            0x38..=0x3F | 0xF0..=0xFE => {
                let Some(target) = self.current_ld() else {
                    return Ok(());
                };
                let card = &mut self.cards[target.card];
                let ldn = card.devices[target.ld].number();
                debug!(csn = card.csn, ldn, reg, value, "device vendor register write");
                card.vendor_write(ldn, reg, value);
            }
            0x40..=0xFF => {
                let Some(target) = self.current_ld() else {
                    return Ok(());
                };
                let card = &mut self.cards[target.card];
                card.devices[target.ld].write_config_reg(reg, value);
                card.notify_config_changed(target.ld);
            }
            _ => debug!(reg, value, "write to read-only or reserved register"),
        }
        Ok(())
    }

    pub fn read_data(&mut self) -> u8 {
        let reg = self.reg;
        match reg {
            REG_SERIAL_ISOLATION => self.serial_isolation_read(),
            REG_RESOURCE_DATA => match self.config_card() {
                Some(idx) => self.cards[idx].next_resource_byte(),
                None => 0xFF,
            },
            REG_STATUS => u8::from(self.config_card().is_some()),
            REG_CARD_SELECT_NUMBER => self.config_card().map_or(0x00, |idx| self.cards[idx].csn),
            REG_LOGICAL_DEVICE_NUMBER => self
                .current_ld()
                .map_or(0x00, |t| self.cards[t.card].devices[t.ld].number()),
            0x20..=0x2F => match self.config_card() {
                Some(idx) => self.cards[idx].vendor_read(0, reg),
                None => 0xFF,
            },
            0x38..=0x3F | 0xF0..=0xFE => match self.current_ld() {
                Some(t) => {
                    let card = &mut self.cards[t.card];
                    let ldn = card.devices[t.ld].number();
                    card.vendor_read(ldn, reg)
                }
                None => 0xFF,
            },
            0x30..=0xFF => self
                .current_ld()
                .map_or(0xFF, |t| self.cards[t.card].devices[t.ld].reg(reg)),
            _ => 0xFF,
        }
    }

    /// Range check read: `0x55` or `0xAA` depending on the device's range check pattern bit.
    pub fn read_range_check(&self, port: u16) -> Option<u8> {
        let responder = self.range_checks.iter().find(|r| r.port == port)?;
        let ld = &self.cards[responder.target.card].devices[responder.target.ld];
        Some(if ld.reg(REG_IO_RANGE_CHECK) & RANGE_CHECK_PATTERN_55 != 0 {
            0x55
        } else {
            0xAA
        })
    }

    fn set_read_data_port(&mut self, port: u16) {
        self.read_data_port =
            (READ_DATA_PORT_MIN..=READ_DATA_PORT_MAX).contains(&port).then_some(port);
    }

    /// First card in CONFIG state, the target of card-level register accesses.
    fn config_card(&self) -> Option<usize> {
        let idx = self
            .cards
            .iter()
            .position(|card| card.state == CardState::Config);
        if idx.is_none() {
            debug!(reg = self.reg, "no card in CONFIG state");
        }
        idx
    }

    fn current_ld(&self) -> Option<LdRef> {
        if self.current_ld.is_none() {
            warn!(reg = self.reg, "no logical device selected");
        }
        self.current_ld
    }

    fn config_control(&mut self, cmd: ConfigControl) {
        if cmd.contains(ConfigControl::RESET) {
            debug!("reset");
            self.set_read_data_port(0);
            for card in &mut self.cards {
                for idx in 0..card.devices.len() {
                    card.devices[idx].reset_regs();
                    card.notify_config_changed(idx);
                }
            }
            self.range_checks.clear();
            self.current_ld = None;
            self.isolated_card = None;
        }

        if cmd.contains(ConfigControl::WAIT_FOR_KEY) {
            debug!("return to WAIT_FOR_KEY");
            for card in &mut self.cards {
                card.state = CardState::WaitForKey;
            }
        }

        if cmd.contains(ConfigControl::RESET_CSN) {
            debug!("reset CSN");
            for card in &mut self.cards {
                card.set_csn(0);
            }
        }
    }

    fn wake(&mut self, csn: u8) {
        debug!(csn, "wake");
        for card in &mut self.cards {
            if card.csn == csn {
                card.wake();
                if card.state == CardState::Sleep {
                    card.state = if csn == 0 {
                        CardState::Isolation
                    } else {
                        CardState::Config
                    };
                }
            } else {
                card.state = CardState::Sleep;
            }
        }
    }

    fn serial_isolation_read(&mut self) -> u8 {
        self.isolated_card = self
            .cards
            .iter()
            .position(|card| card.state == CardState::Isolation);

        let Some(idx) = self.isolated_card else {
            return 0xFF;
        };

        let card = &mut self.cards[idx];
        let pulse = card.isolation.read_pulse(&mut card.rom);
        if pulse.pass_complete {
            card.rom_pos = RESOURCE_DATA_OFFSET;
        }
        pulse.value
    }

    fn io_range_check(&mut self, target: LdRef, value: u8) {
        let ld = &mut self.cards[target.card].devices[target.ld];
        let was_enabled = ld.reg(REG_IO_RANGE_CHECK) & RANGE_CHECK_ENABLE != 0;
        let enable = value & RANGE_CHECK_ENABLE != 0;
        let bases: Vec<u16> = ld.io_bases().filter(|&base| base != 0).collect();
        ld.set_reg(REG_IO_RANGE_CHECK, value & 0x03);

        debug!(ldn = ld.number(), value, "I/O range check");

        // Bases may have moved since the responders were registered.
        if was_enabled {
            self.range_checks.retain(|r| r.target != target);
        }
        if enable {
            self.range_checks
                .extend(bases.into_iter().map(|port| RangeCheckResponder { port, target }));
        }
    }
}
