//! Serial isolation engine.
//!
//! During isolation every unconfigured card shifts out its 72-bit serial identifier: 64 bits of
//! vendor ID + serial number (header bytes 0..8, LSB first) followed by an 8-bit checksum. Each
//! logical bit takes two reads of the READ_DATA port: the first returns `0x55` for a one (`0x00`
//! for a zero), the second returns the same pattern shifted left (`0xAA` / `0x00`).
//!
//! The checksum is the serial identifier LFSR used by real PnP cards, seeded with the first byte of
//! the initiation key. The initiation key itself is the same LFSR fed with zero bits.

/// The 32-byte ISA PnP initiation key written to the ADDRESS port to leave WAIT_FOR_KEY.
pub const INITIATION_KEY: [u8; 32] = [
    0x6A, 0xB5, 0xDA, 0xED, 0xF6, 0xFB, 0x7D, 0xBE, //
    0xDF, 0x6F, 0x37, 0x1B, 0x0D, 0x86, 0xC3, 0x61, //
    0xB0, 0x58, 0x2C, 0x16, 0x8B, 0x45, 0xA2, 0xD1, //
    0xE8, 0x74, 0x3A, 0x9D, 0xCE, 0xE7, 0x73, 0x39, //
];

/// Number of logical bits in the serial identifier (64 ID bits + 8 checksum bits).
pub const SERIAL_ID_BITS: u8 = 72;

/// Number of ID bits preceding the checksum.
const SERIAL_ID_DATA_BITS: u8 = 64;

/// Offset of the serial identifier checksum byte in the card header.
pub const SERIAL_ID_CHECKSUM_OFFSET: usize = 8;

/// Offset of the first resource descriptor, right after the 9-byte header.
pub const RESOURCE_DATA_OFFSET: usize = 9;

const PULSE_ONE: u8 = 0x55;

/// Advance the isolation LFSR by one input bit.
///
/// The new MSB is `c[0] ^ c[1] ^ bit`; the rest of the register shifts right.
pub fn lfsr_step(checksum: u8, bit: u8) -> u8 {
    let feedback = (checksum ^ (checksum >> 1) ^ bit) & 0x01;
    (checksum >> 1) | (feedback << 7)
}

/// Compute the serial identifier checksum over the 8-byte vendor ID + serial number.
///
/// `id` must hold at least 8 bytes; only the first 8 are consumed.
pub fn serial_id_checksum(id: &[u8]) -> u8 {
    id[..8].iter().fold(INITIATION_KEY[0], |checksum, &byte| {
        (0..8u8).fold(checksum, |c, bit| lfsr_step(c, (byte >> bit) & 0x01))
    })
}

/// Result of a single READ_DATA access during isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsolationPulse {
    /// Value driven onto the data bus.
    pub value: u8,
    /// Set on the second pulse of bit 71, when a full pass over the identifier has been shifted
    /// out and the resource data pointer should skip the header.
    pub pass_complete: bool,
}

/// Per-card isolation bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerialIsolation {
    checksum: u8,
    pos: u8,
    second_pulse: bool,
    last: u8,
}

impl SerialIsolation {
    /// Restart the identifier from bit 0 and reseed the checksum (Wake[CSN]).
    pub fn wake(&mut self) {
        self.checksum = INITIATION_KEY[0];
        self.pos = 0;
        self.second_pulse = false;
        self.last = 0;
    }

    /// Bit position (0-71) of the next logical bit.
    pub fn position(&self) -> u8 {
        self.pos
    }

    /// Running checksum accumulated so far.
    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Produce the next isolation pulse for a card whose header lives at the start of `rom`.
    ///
    /// When bit 64 is reached the computed checksum is written to the header checksum byte.
    pub fn read_pulse(&mut self, rom: &mut [u8]) -> IsolationPulse {
        let mut pass_complete = false;

        if self.second_pulse {
            self.last <<= 1;
            pass_complete = self.pos == 0;
        } else {
            let bit = if self.pos < SERIAL_ID_DATA_BITS {
                let byte = rom[usize::from(self.pos >> 3)];
                let bit = (byte >> (self.pos & 0x7)) & 0x01;
                self.checksum = lfsr_step(self.checksum, bit);
                bit
            } else {
                if self.pos == SERIAL_ID_DATA_BITS {
                    rom[SERIAL_ID_CHECKSUM_OFFSET] = self.checksum;
                }
                (self.checksum >> (self.pos & 0x7)) & 0x01
            };

            tracing::trace!(pos = self.pos, bit, "isolation bit");

            self.last = if bit != 0 { PULSE_ONE } else { 0x00 };
            self.pos = (self.pos + 1) % SERIAL_ID_BITS;
        }

        self.second_pulse = !self.second_pulse;

        IsolationPulse {
            value: self.last,
            pass_complete,
        }
    }
}
