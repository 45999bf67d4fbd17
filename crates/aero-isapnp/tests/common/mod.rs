#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use aero_isapnp::controller::{REG_SERIAL_ISOLATION, REG_SET_RD_DATA, REG_WAKE};
use aero_isapnp::{
    IsaPnpCardHooks, IsaPnpController, IsaPnpDeviceConfig, ADDRESS_PORT, INITIATION_KEY,
    WRITE_DATA_PORT,
};

/// READ_DATA port used by the tests (`0x80 << 2 | 3`).
pub const RD_PORT: u16 = 0x203;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ConfigChanged(u8, IsaPnpDeviceConfig),
    CsnChanged(u8),
    VendorRead(u8, u8),
    VendorWrite(u8, u8, u8),
}

pub type EventLog = Rc<RefCell<Vec<Event>>>;

/// Hooks that record every callback into a shared log.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    pub events: EventLog,
    pub vendor_value: u8,
}

impl Recorder {
    pub fn new() -> (Self, EventLog) {
        let events = EventLog::default();
        (
            Self {
                events: events.clone(),
                vendor_value: 0x5A,
            },
            events,
        )
    }
}

impl IsaPnpCardHooks for Recorder {
    fn config_changed(&mut self, ldn: u8, config: &IsaPnpDeviceConfig) {
        self.events
            .borrow_mut()
            .push(Event::ConfigChanged(ldn, config.clone()));
    }

    fn csn_changed(&mut self, csn: u8) {
        self.events.borrow_mut().push(Event::CsnChanged(csn));
    }

    fn read_vendor_reg(&mut self, ldn: u8, reg: u8) -> u8 {
        self.events.borrow_mut().push(Event::VendorRead(ldn, reg));
        self.vendor_value
    }

    fn write_vendor_reg(&mut self, ldn: u8, reg: u8, value: u8) {
        self.events
            .borrow_mut()
            .push(Event::VendorWrite(ldn, reg, value));
    }
}

pub fn csn_events(log: &EventLog) -> Vec<u8> {
    log.borrow()
        .iter()
        .filter_map(|e| match e {
            Event::CsnChanged(csn) => Some(*csn),
            _ => None,
        })
        .collect()
}

pub fn config_events(log: &EventLog) -> Vec<(u8, IsaPnpDeviceConfig)> {
    log.borrow()
        .iter()
        .filter_map(|e| match e {
            Event::ConfigChanged(ldn, cfg) => Some((*ldn, cfg.clone())),
            _ => None,
        })
        .collect()
}

// Resource descriptor builders.

pub const START_DF: u8 = 0x30;
pub const END_DF: u8 = 0x38;

pub fn logical_device_id(id: [u8; 4]) -> Vec<u8> {
    let mut d = vec![0x15];
    d.extend_from_slice(&id);
    d.push(0x00);
    d
}

/// 24-bit memory range descriptor (large tag 0x01).
pub fn mem24(info: u8) -> Vec<u8> {
    let mut d = vec![0x81, 0x09, 0x00, info];
    d.extend_from_slice(&[0x00, 0x0C, 0x00, 0x0E, 0x00, 0x40, 0x00, 0x40]);
    d
}

/// 32-bit memory range descriptor (large tag 0x05).
pub fn mem32(info: u8) -> Vec<u8> {
    let mut d = vec![0x85, 0x11, 0x00, info];
    d.extend_from_slice(&[0u8; 16]);
    d
}

/// I/O port descriptor (small tag 0x08): 16-bit decode, `min..=max`, align 1, 8 ports.
pub fn io_port(min: u16, max: u16) -> Vec<u8> {
    let mut d = vec![0x47, 0x01];
    d.extend_from_slice(&min.to_le_bytes());
    d.extend_from_slice(&max.to_le_bytes());
    d.extend_from_slice(&[0x01, 0x08]);
    d
}

/// Build a card ROM: header (checksum placeholder 0), `body`, end tag with checksum placeholder.
pub fn card_rom(vendor: [u8; 4], serial: u32, body: &[u8]) -> Vec<u8> {
    let mut rom = vendor.to_vec();
    rom.extend_from_slice(&serial.to_le_bytes());
    rom.push(0x00);
    rom.extend_from_slice(body);
    rom.extend_from_slice(&[0x79, 0x00]);
    rom
}

/// A single-device card ("PNP0501").
pub fn simple_rom(serial: u32) -> Vec<u8> {
    card_rom(
        [0x41, 0xD0, 0x05, 0x01],
        serial,
        &logical_device_id([0x41, 0xD0, 0x05, 0x01]),
    )
}

// Guest-side port helpers.

pub fn outb(pnp: &mut IsaPnpController, port: u16, value: u8) {
    assert!(pnp.dispatch_write(port, value).expect("fatal ISA PnP error"));
}

pub fn inb(pnp: &mut IsaPnpController, port: u16) -> u8 {
    pnp.dispatch_read(port).unwrap_or(0xFF)
}

pub fn send_key(pnp: &mut IsaPnpController) {
    // Two zero writes reset the LFSR on real hardware; here they only reset the match position.
    outb(pnp, ADDRESS_PORT, 0x00);
    outb(pnp, ADDRESS_PORT, 0x00);
    for &b in &INITIATION_KEY {
        outb(pnp, ADDRESS_PORT, b);
    }
}

pub fn write_reg(pnp: &mut IsaPnpController, reg: u8, value: u8) {
    outb(pnp, ADDRESS_PORT, reg);
    outb(pnp, WRITE_DATA_PORT, value);
}

pub fn read_reg(pnp: &mut IsaPnpController, reg: u8) -> u8 {
    outb(pnp, ADDRESS_PORT, reg);
    inb(pnp, RD_PORT)
}

/// Unlock, map READ_DATA at [`RD_PORT`] and wake CSN 0 into isolation.
pub fn begin_isolation(pnp: &mut IsaPnpController) {
    send_key(pnp);
    write_reg(pnp, REG_SET_RD_DATA, (RD_PORT >> 2) as u8);
    write_reg(pnp, REG_WAKE, 0x00);
}

/// Shift out a full 72-bit serial identifier. Returns `None` if nothing answered.
pub fn read_serial_id(pnp: &mut IsaPnpController) -> Option<[u8; 9]> {
    outb(pnp, ADDRESS_PORT, REG_SERIAL_ISOLATION);
    let mut id = [0u8; 9];
    for bit in 0..72usize {
        let first = inb(pnp, RD_PORT);
        let second = inb(pnp, RD_PORT);
        if first == 0xFF && second == 0xFF {
            return None;
        }
        if first == 0x55 && second == 0xAA {
            id[bit / 8] |= 1 << (bit % 8);
        } else {
            assert_eq!((first, second), (0x00, 0x00), "bad isolation pair at bit {bit}");
        }
    }
    Some(id)
}
