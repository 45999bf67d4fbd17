//! Port I/O glue.
//!
//! The host's I/O bus maps one port to one device instance, so the controller is shared behind
//! `Rc<RefCell<_>>` and one [`IsaPnpPort`] is registered per decoded port. Ports route through
//! [`IsaPnpController::dispatch_read`] / [`IsaPnpController::dispatch_write`], which consult live
//! state, so the same adapter serves the fixed ADDRESS/WRITE_DATA ports as well as the READ_DATA
//! and range check ports wherever the guest moves them.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::error;

use crate::controller::IsaPnpController;

/// Byte-addressed x86 port I/O device, as dispatched by the host's I/O bus.
pub trait PortIoDevice {
    fn read(&mut self, port: u16, size: u8) -> u32;
    fn write(&mut self, port: u16, size: u8, value: u32);

    /// Reset the device back to its power-on state.
    fn reset(&mut self) {}
}

pub type SharedIsaPnp = Rc<RefCell<IsaPnpController>>;

/// I/O-port view of a shared [`IsaPnpController`].
///
/// Multi-byte accesses are split into byte accesses at consecutive ports. Reads of ports the
/// controller does not currently decode float high. Fatal errors raised by a write are latched
/// in the controller; the host collects them with [`IsaPnpController::take_fault`].
pub struct IsaPnpPort {
    pnp: SharedIsaPnp,
    port: u16,
}

impl IsaPnpPort {
    pub fn new(pnp: SharedIsaPnp, port: u16) -> Self {
        Self { pnp, port }
    }

    /// Adapters for the fixed ADDRESS and WRITE_DATA ports.
    pub fn fixed_ports(pnp: &SharedIsaPnp) -> [Self; 2] {
        let config = pnp.borrow().config().clone();
        [
            Self::new(pnp.clone(), config.address_port),
            Self::new(pnp.clone(), config.write_data_port),
        ]
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn read_u8(pnp: &mut IsaPnpController, port: u16) -> u8 {
        pnp.dispatch_read(port).unwrap_or(0xFF)
    }

    fn write_u8(pnp: &mut IsaPnpController, port: u16, value: u8) {
        if let Err(err) = pnp.dispatch_write(port, value) {
            error!(port = format_args!("{port:#x}"), %err, "fatal ISA PnP error");
            pnp.latch_fault(err);
        }
    }
}

impl PortIoDevice for IsaPnpPort {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        if size == 0 {
            return 0;
        }
        debug_assert_eq!(port, self.port);
        let mut pnp = self.pnp.borrow_mut();
        match size {
            2 => {
                let b0 = Self::read_u8(&mut pnp, port);
                let b1 = Self::read_u8(&mut pnp, port.wrapping_add(1));
                u32::from(u16::from_le_bytes([b0, b1]))
            }
            4 => {
                let b0 = Self::read_u8(&mut pnp, port);
                let b1 = Self::read_u8(&mut pnp, port.wrapping_add(1));
                let b2 = Self::read_u8(&mut pnp, port.wrapping_add(2));
                let b3 = Self::read_u8(&mut pnp, port.wrapping_add(3));
                u32::from_le_bytes([b0, b1, b2, b3])
            }
            _ => u32::from(Self::read_u8(&mut pnp, port)),
        }
    }

    fn write(&mut self, port: u16, size: u8, value: u32) {
        if size == 0 {
            return;
        }
        debug_assert_eq!(port, self.port);
        let mut pnp = self.pnp.borrow_mut();
        match size {
            2 => {
                let [b0, b1] = (value as u16).to_le_bytes();
                Self::write_u8(&mut pnp, port, b0);
                Self::write_u8(&mut pnp, port.wrapping_add(1), b1);
            }
            4 => {
                for (i, b) in value.to_le_bytes().into_iter().enumerate() {
                    Self::write_u8(&mut pnp, port.wrapping_add(i as u16), b);
                }
            }
            _ => Self::write_u8(&mut pnp, port, value as u8),
        }
    }

    fn reset(&mut self) {
        // Every adapter shares one controller; only the ADDRESS port adapter resets it.
        let mut pnp = self.pnp.borrow_mut();
        if self.port == pnp.config().address_port {
            pnp.reset();
        }
    }
}
