//! ISA Plug and Play controller emulation.
//!
//! Legacy PnP add-in cards are found and configured through three ports: ADDRESS (`0x279`),
//! WRITE_DATA (`0xA79`) and a guest-relocatable READ_DATA port. Software unlocks the cards with
//! a 32-byte initiation key, isolates unconfigured cards one at a time through a bit-serial read
//! protocol, assigns each a Card Select Number (CSN), and then programs each card's logical
//! devices through a 256-byte register file.
//!
//! Cards are attached with [`IsaPnpController::add_card`], passing the card's resource ROM and an
//! [`IsaPnpCardHooks`] implementation that receives configuration changes.
#![forbid(unsafe_code)]

pub mod card;
pub mod config;
pub mod controller;
pub mod error;
pub mod io;
pub mod isolation;
pub mod rom;

pub use card::{Card, CardHandle, CardState, IsaPnpCardHooks, LogicalDevice, NoHooks};
pub use config::{DmaConfig, IoRange, IrqConfig, IsaPnpDeviceConfig, MemRange, DMA_DISABLED};
pub use controller::{
    ConfigControl, IsaPnpConfig, IsaPnpController, ADDRESS_PORT, READ_DATA_PORT_MAX,
    READ_DATA_PORT_MIN, WRITE_DATA_PORT,
};
pub use error::{IsaPnpError, Result};
pub use io::{IsaPnpPort, PortIoDevice, SharedIsaPnp};
pub use isolation::INITIATION_KEY;
pub use rom::EisaId;
