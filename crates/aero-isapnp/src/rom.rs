//! Resource ROM parsing.
//!
//! A PnP card ROM starts with a 9-byte serial identifier header (vendor ID, serial number,
//! checksum) followed by a stream of small and large resource descriptors. The stream is walked
//! once at attach time to discover the card's logical devices and which of their memory ranges
//! use upper-limit rather than range-length addressing.

use std::fmt;

use tracing::{debug, trace};

use crate::card::LogicalDevice;
use crate::error::{IsaPnpError, Result};
use crate::isolation::{serial_id_checksum, RESOURCE_DATA_OFFSET, SERIAL_ID_CHECKSUM_OFFSET};

/// Smallest ROM accepted: the header plus the trailing resource checksum.
pub const MIN_ROM_LEN: usize = RESOURCE_DATA_OFFSET + 1;

const MAX_MEM_RANGES: u8 = 4;
const MEM32_UPPER_LIMIT_SHIFT: u8 = 4;

/// Memory descriptor information byte: set when the second bound is an upper limit.
const MEM_INFO_UPPER_LIMIT: u8 = 0x04;

/// Compressed EISA ID: three 5-bit letters followed by a 16-bit product/revision code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EisaId([u8; 4]);

impl EisaId {
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    fn from_payload(payload: &[u8]) -> Self {
        let mut bytes = [0u8; 4];
        for (dst, &src) in bytes.iter_mut().zip(payload) {
            *dst = src;
        }
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }

    /// The three-letter vendor prefix, e.g. `PNP`.
    pub fn vendor(&self) -> [char; 3] {
        let code = u16::from_be_bytes([self.0[0], self.0[1]]);
        let letter = |shift: u16| char::from(b'@' + ((code >> shift) & 0x1F) as u8);
        [letter(10), letter(5), letter(0)]
    }
}

impl fmt::Display for EisaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.vendor();
        write!(f, "{a}{b}{c}{:02X}{:02X}", self.0[2], self.0[3])
    }
}

impl fmt::Debug for EisaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EisaId({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceTag {
    PnpVersion,
    LogicalDeviceId,
    CompatibleDeviceId,
    Irq,
    Dma,
    StartDependent,
    EndDependent,
    IoPort,
    FixedIoPort,
    SmallVendor,
    End,
    Memory,
    AnsiIdentifier,
    UnicodeIdentifier,
    LargeVendor,
    Memory32,
    FixedMemory32,
    UnknownSmall(u8),
    UnknownLarge(u8),
}

impl ResourceTag {
    fn small(tag: u8) -> Self {
        match tag {
            0x01 => Self::PnpVersion,
            0x02 => Self::LogicalDeviceId,
            0x03 => Self::CompatibleDeviceId,
            0x04 => Self::Irq,
            0x05 => Self::Dma,
            0x06 => Self::StartDependent,
            0x07 => Self::EndDependent,
            0x08 => Self::IoPort,
            0x09 => Self::FixedIoPort,
            0x0E => Self::SmallVendor,
            0x0F => Self::End,
            other => Self::UnknownSmall(other),
        }
    }

    fn large(tag: u8) -> Self {
        match tag {
            0x01 => Self::Memory,
            0x02 => Self::AnsiIdentifier,
            0x03 => Self::UnicodeIdentifier,
            0x04 => Self::LargeVendor,
            0x05 => Self::Memory32,
            0x06 => Self::FixedMemory32,
            other => Self::UnknownLarge(other),
        }
    }
}

/// One descriptor from the resource stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource<'a> {
    /// Offset of the descriptor header within the ROM.
    pub offset: usize,
    pub tag: ResourceTag,
    /// Payload bytes; shorter than the declared length if the ROM ends early.
    pub payload: &'a [u8],
}

/// Iterator over the descriptors following the ROM header.
///
/// Iteration runs to the end of the buffer rather than stopping at the end tag.
#[derive(Debug, Clone)]
pub struct Resources<'a> {
    rom: &'a [u8],
    pos: usize,
}

impl<'a> Resources<'a> {
    pub fn new(rom: &'a [u8]) -> Self {
        Self {
            rom,
            pos: RESOURCE_DATA_OFFSET,
        }
    }
}

impl<'a> Iterator for Resources<'a> {
    type Item = Result<Resource<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let rom = self.rom;
        let offset = self.pos;
        let header = *rom.get(offset)?;

        let (tag, header_len, len) = if header & 0x80 != 0 {
            let Some(len) = rom.get(offset + 1..offset + 3) else {
                self.pos = rom.len();
                return Some(Err(IsaPnpError::TruncatedResource { offset }));
            };
            (
                ResourceTag::large(header & 0x7F),
                3,
                usize::from(u16::from_le_bytes([len[0], len[1]])),
            )
        } else {
            (
                ResourceTag::small((header >> 3) & 0x0F),
                1,
                usize::from(header & 0x07),
            )
        };

        let start = (offset + header_len).min(rom.len());
        let end = (offset + header_len + len).min(rom.len());
        self.pos = offset + header_len + len;

        Some(Ok(Resource {
            offset,
            tag,
            payload: &rom[start..end],
        }))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct MemSlots {
    mem: u8,
    mem32: u8,
}

/// Descriptor walker state for one card.
#[derive(Debug, Default)]
struct ResourceParser {
    devices: Vec<LogicalDevice>,
    slots: MemSlots,
    /// Slot positions at the start of the current dependent function set; every alternative
    /// allocates from here.
    dependent_base: MemSlots,
    in_dependent: bool,
}

impl ResourceParser {
    fn handle(&mut self, res: Resource<'_>) -> Result<()> {
        match res.tag {
            ResourceTag::LogicalDeviceId => {
                if let Some(prev) = self.devices.last_mut() {
                    prev.reset_regs();
                }

                let number = u8::try_from(self.devices.len()).map_err(|_| {
                    IsaPnpError::TooManyLogicalDevices { offset: res.offset }
                })?;
                let id = EisaId::from_payload(res.payload);
                debug!(ldn = number, %id, "logical device");
                self.devices.push(LogicalDevice::new(number, id));

                self.slots = MemSlots::default();
                self.dependent_base = MemSlots::default();
            }
            ResourceTag::StartDependent => {
                let priority = match res.payload.first() {
                    None | Some(1) => "acceptable",
                    Some(0) => "good",
                    Some(2) => "sub-optimal",
                    Some(_) => "unknown priority",
                };
                debug!(priority, "start dependent functions");

                if self.in_dependent {
                    self.slots = self.dependent_base;
                } else {
                    self.dependent_base = self.slots;
                    self.in_dependent = true;
                }
            }
            ResourceTag::EndDependent => {
                debug!("end dependent functions");
                self.in_dependent = false;
            }
            ResourceTag::Memory | ResourceTag::Memory32 => self.memory_range(res)?,
            ResourceTag::AnsiIdentifier => {
                debug!(name = %String::from_utf8_lossy(res.payload), "ANSI identifier");
            }
            ResourceTag::CompatibleDeviceId => {
                debug!(id = %EisaId::from_payload(res.payload), "compatible device ID");
            }
            ResourceTag::End => debug!("end of card resources"),
            tag => trace!(?tag, len = res.payload.len(), "resource"),
        }
        Ok(())
    }

    fn memory_range(&mut self, res: Resource<'_>) -> Result<()> {
        let offset = res.offset;
        let ld = self
            .devices
            .last_mut()
            .ok_or(IsaPnpError::ResourceOutsideLogicalDevice { offset })?;

        let bit = if res.tag == ResourceTag::Memory {
            if self.slots.mem >= MAX_MEM_RANGES {
                return Err(IsaPnpError::MemoryDescriptorOverflow { offset });
            }
            let bit = self.slots.mem;
            self.slots.mem += 1;
            bit
        } else {
            if self.slots.mem32 >= MAX_MEM_RANGES {
                return Err(IsaPnpError::Memory32DescriptorOverflow { offset });
            }
            let bit = MEM32_UPPER_LIMIT_SHIFT + self.slots.mem32;
            self.slots.mem32 += 1;
            bit
        };

        let info = *res
            .payload
            .first()
            .ok_or(IsaPnpError::TruncatedResource { offset })?;
        let upper_limit = info & MEM_INFO_UPPER_LIMIT != 0;
        debug!(
            ldn = ld.number(),
            slot = bit,
            dependent = self.in_dependent,
            upper_limit,
            "memory range"
        );
        ld.set_upper_limit(bit, upper_limit);
        Ok(())
    }

    fn finish(mut self) -> Vec<LogicalDevice> {
        if let Some(last) = self.devices.last_mut() {
            last.reset_regs();
        }
        self.devices
    }
}

/// Fill in the resource checksum (last byte) and the serial identifier checksum (header byte 8).
pub fn populate_checksums(rom: &mut [u8]) -> Result<()> {
    if rom.len() < MIN_ROM_LEN {
        return Err(IsaPnpError::RomTooShort {
            len: rom.len(),
            min: MIN_ROM_LEN,
        });
    }

    let last = rom.len() - 1;
    let sum = rom[RESOURCE_DATA_OFFSET..last]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    rom[last] = sum.wrapping_neg();
    rom[SERIAL_ID_CHECKSUM_OFFSET] = serial_id_checksum(rom);
    Ok(())
}

/// Populate the ROM checksums and build the card's logical devices with default registers.
pub fn parse_resources(rom: &mut [u8]) -> Result<Vec<LogicalDevice>> {
    populate_checksums(rom)?;

    let vendor = EisaId::from_payload(rom);
    let serial = u32::from_le_bytes([rom[4], rom[5], rom[6], rom[7]]);
    debug!(card = %vendor, serial = format_args!("{serial:08X}"), "parsing ISA PnP resources");

    let mut parser = ResourceParser::default();
    for res in Resources::new(rom) {
        parser.handle(res?)?;
    }
    Ok(parser.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [u8; 9] = [0x41, 0xD0, 0x05, 0x01, 0x78, 0x56, 0x34, 0x12, 0x00];

    fn rom(body: &[u8]) -> Vec<u8> {
        let mut rom = HEADER.to_vec();
        rom.extend_from_slice(body);
        rom.extend_from_slice(&[0x79, 0x00]);
        rom
    }

    /// Large memory range descriptor with the given information byte.
    fn mem(info: u8) -> [u8; 12] {
        [0x81, 0x09, 0x00, info, 0, 0, 0, 0, 0, 0, 0, 0]
    }

    fn mem32(info: u8) -> [u8; 20] {
        let mut d = [0u8; 20];
        d[0] = 0x85;
        d[1] = 0x11;
        d[3] = info;
        d
    }

    const LDID: [u8; 6] = [0x15, 0x41, 0xD0, 0x05, 0x01, 0x00];

    #[test]
    fn eisa_id_formats_like_pnp_ids() {
        assert_eq!(EisaId::from_bytes([0x41, 0xD0, 0x05, 0x01]).to_string(), "PNP0501");
        assert_eq!(EisaId::from_bytes([0x0E, 0x8C, 0x00, 0x36]).to_string(), "CTL0036");
    }

    #[test]
    fn resource_checksum_negates_descriptor_sum() {
        let mut rom = rom(&LDID);
        populate_checksums(&mut rom).unwrap();
        let sum = rom[9..].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        assert_eq!(sum, 0);
        assert_eq!(rom[8], serial_id_checksum(&HEADER));
    }

    #[test]
    fn short_rom_is_rejected() {
        let mut rom = HEADER.to_vec();
        assert_eq!(
            parse_resources(&mut rom),
            Err(IsaPnpError::RomTooShort { len: 9, min: 10 })
        );
    }

    #[test]
    fn logical_devices_are_numbered_in_order() {
        let mut body = LDID.to_vec();
        body.extend_from_slice(&[0x1C, 0x41, 0xD0, 0x05, 0x01]); // compatible ID
        body.extend_from_slice(&LDID);
        let devices = parse_resources(&mut rom(&body)).unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].number(), 0);
        assert_eq!(devices[1].number(), 1);
        assert_eq!(devices[1].id().to_string(), "PNP0501");
    }

    #[test]
    fn memory_slots_record_upper_limit_addressing() {
        let mut body = LDID.to_vec();
        body.extend_from_slice(&mem(0x04));
        body.extend_from_slice(&mem(0x00));
        body.extend_from_slice(&mem32(0x04));
        body.extend_from_slice(&mem32(0x04));
        let devices = parse_resources(&mut rom(&body)).unwrap();

        let ld = &devices[0];
        assert_eq!(ld.upper_limit_mask(), 0b0011_0001);
        assert_eq!(ld.reg(0x42), 0x01);
        assert_eq!(ld.reg(0x4A), 0x00);
        assert_eq!(ld.reg(0x7A), 0x01);
        assert_eq!(ld.reg(0x84), 0x01);
    }

    #[test]
    fn slot_counters_restart_per_logical_device() {
        let mut body = LDID.to_vec();
        body.extend_from_slice(&mem(0x00));
        body.extend_from_slice(&LDID);
        body.extend_from_slice(&mem(0x04));
        let devices = parse_resources(&mut rom(&body)).unwrap();

        assert_eq!(devices[0].upper_limit_mask(), 0);
        assert_eq!(devices[1].upper_limit_mask(), 0b0000_0001);
    }

    #[test]
    fn dependent_alternatives_share_slots() {
        let mut body = LDID.to_vec();
        body.extend_from_slice(&mem(0x00)); // base: slot 0
        body.extend_from_slice(&[0x31, 0x00]); // start DF (good)
        body.extend_from_slice(&mem(0x04)); // slot 1
        body.push(0x30); // start DF (acceptable)
        body.extend_from_slice(&mem(0x04)); // slot 1 again
        body.push(0x38); // end DF
        body.extend_from_slice(&mem32(0x04)); // 32-bit slot 0
        body.extend_from_slice(&mem(0x04)); // slot 2
        let devices = parse_resources(&mut rom(&body)).unwrap();

        assert_eq!(devices[0].upper_limit_mask(), 0b0001_0110);
    }

    #[test]
    fn fifth_memory_range_is_fatal() {
        let mut body = LDID.to_vec();
        for _ in 0..5 {
            body.extend_from_slice(&mem(0x00));
        }
        let err = parse_resources(&mut rom(&body)).unwrap_err();
        assert!(matches!(err, IsaPnpError::MemoryDescriptorOverflow { .. }));

        let mut body = LDID.to_vec();
        for _ in 0..5 {
            body.extend_from_slice(&mem32(0x00));
        }
        let err = parse_resources(&mut rom(&body)).unwrap_err();
        assert!(matches!(err, IsaPnpError::Memory32DescriptorOverflow { .. }));
    }

    #[test]
    fn logical_device_numbers_stop_at_255() {
        let body = LDID.repeat(256);
        let devices = parse_resources(&mut rom(&body)).unwrap();
        assert_eq!(devices.len(), 256);
        assert_eq!(devices[255].number(), 255);

        let body = LDID.repeat(257);
        let err = parse_resources(&mut rom(&body)).unwrap_err();
        assert_eq!(
            err,
            IsaPnpError::TooManyLogicalDevices {
                offset: 9 + 256 * LDID.len()
            }
        );
    }

    #[test]
    fn memory_range_without_logical_device_is_fatal() {
        let err = parse_resources(&mut rom(&mem(0x04))).unwrap_err();
        assert_eq!(err, IsaPnpError::ResourceOutsideLogicalDevice { offset: 9 });
    }

    #[test]
    fn truncated_large_header_is_reported() {
        let mut rom = HEADER.to_vec();
        rom.extend_from_slice(&[0x81, 0x09]);
        let err = parse_resources(&mut rom).unwrap_err();
        assert_eq!(err, IsaPnpError::TruncatedResource { offset: 9 });
    }

    #[test]
    fn resources_iterator_decodes_tags() {
        let mut rom = rom(&LDID);
        rom.splice(9..9, [0x82, 0x03, 0x00, b'S', b'B', b'X']);
        let tags: Vec<_> = Resources::new(&rom)
            .map(|r| r.unwrap().tag)
            .collect();
        assert_eq!(
            tags,
            [
                ResourceTag::AnsiIdentifier,
                ResourceTag::LogicalDeviceId,
                ResourceTag::End
            ]
        );
    }
}
