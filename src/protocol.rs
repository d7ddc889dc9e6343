//! Wire format shared by the agent and the host programmer
//!
//! A frame is `[length, opcode, payload.., crc0, crc1, crc2, crc3]` where
//! `length` counts every byte after itself and the little-endian CRC trailer
//! covers everything from `length` up to the trailer.

use crate::integrity;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

pub const CRC_LEN: usize = 4;

/// Smallest legal length byte (opcode and trailer)
pub const MIN_LENGTH: u8 = 1 + CRC_LEN as u8;

/// Receive buffer size, any length byte fits
pub const FRAME_CAPACITY: usize = 1 + u8::MAX as usize;

/// Largest data block a single write-memory frame can carry
pub const MAX_CHUNK: usize = u8::MAX as usize - (1 + 4 + 1 + CRC_LEN);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version
    GetVersion = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address
    /// specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory sectors.
    Erase = 0x43,

    /// Erases from one to all the Flash memory sectors using two byte addressing mode.
    ExtendedErase = 0x44,

    /// Generic command for product specific features
    Special = 0x50,

    /// Generic command carrying more data than Special
    ExtendedSpecial = 0x51,

    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,

    /// Disables the write protection for some sectors.
    WriteUnprotect = 0x73,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Changes the read protection level
    ReadoutUnprotect = 0x92,

    /// Computes a CRC over a memory area
    Checksum = 0xA1,
}

impl Command {
    pub const ALL: [Command; 15] = [
        Command::Get,
        Command::GetVersion,
        Command::GetId,
        Command::ReadMemory,
        Command::Go,
        Command::WriteMemory,
        Command::Erase,
        Command::ExtendedErase,
        Command::Special,
        Command::ExtendedSpecial,
        Command::WriteProtect,
        Command::WriteUnprotect,
        Command::ReadoutProtect,
        Command::ReadoutUnprotect,
        Command::Checksum,
    ];

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| *c as u8 == opcode)
    }
}

/// Result byte reported after an acknowledged command has been acted on
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    AddressInvalid = 0x01,
    FlashOperationFailed = 0x02,
    ProtectionOperationFailed = 0x03,
}

impl Status {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Status::Ok),
            0x01 => Some(Status::AddressInvalid),
            0x02 => Some(Status::FlashOperationFailed),
            0x03 => Some(Status::ProtectionOperationFailed),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Version {
    pub vendor: u8,
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const LEN: usize = 4;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        [self.vendor, self.major, self.minor, self.patch]
    }

    pub fn from_bytes(b: [u8; Self::LEN]) -> Self {
        Self {
            vendor: b[0],
            major: b[1],
            minor: b[2],
            patch: b[3],
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum FrameError {
    #[error("length byte {0} shorter than opcode and trailer")]
    TooShort(u8),
    #[error("{available} bytes supplied, {needed} required")]
    Truncated { needed: usize, available: usize },
    #[error("payload of {0} bytes does not fit a frame")]
    TooLong(usize),
}

/// Bounds checked view of one received frame
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Frame<'a> {
    raw: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Validate the length byte against `raw` before exposing any field
    pub fn parse(raw: &'a [u8]) -> Result<Self, FrameError> {
        let length = *raw.first().ok_or(FrameError::Truncated {
            needed: 1,
            available: 0,
        })?;

        if length < MIN_LENGTH {
            return Err(FrameError::TooShort(length));
        }

        let needed = 1 + length as usize;
        if raw.len() < needed {
            return Err(FrameError::Truncated {
                needed,
                available: raw.len(),
            });
        }

        Ok(Self { raw: &raw[..needed] })
    }

    pub fn length(&self) -> u8 {
        self.raw[0]
    }

    pub fn opcode(&self) -> u8 {
        self.raw[1]
    }

    /// Command specific bytes between opcode and trailer
    pub fn payload(&self) -> &'a [u8] {
        &self.raw[2..self.raw.len() - CRC_LEN]
    }

    /// Bytes covered by the trailer
    pub fn covered(&self) -> &'a [u8] {
        &self.raw[..self.raw.len() - CRC_LEN]
    }

    /// Trailer as sent by the host
    pub fn crc(&self) -> u32 {
        let t = &self.raw[self.raw.len() - CRC_LEN..];
        u32::from_le_bytes([t[0], t[1], t[2], t[3]])
    }
}

/// Build a frame for `opcode` / `payload` into `buff`, returning the frame bytes
pub fn encode<'b>(opcode: u8, payload: &[u8], buff: &'b mut [u8]) -> Result<&'b [u8], FrameError> {
    let length = 1 + payload.len() + CRC_LEN;
    if length > u8::MAX as usize {
        return Err(FrameError::TooLong(payload.len()));
    }

    let total = 1 + length;
    if buff.len() < total {
        return Err(FrameError::Truncated {
            needed: total,
            available: buff.len(),
        });
    }

    buff[0] = length as u8;
    buff[1] = opcode;
    buff[2..2 + payload.len()].copy_from_slice(payload);

    let body = total - CRC_LEN;
    let crc = integrity::checksum(&buff[..body]);
    buff[body..total].copy_from_slice(&crc.to_le_bytes());

    Ok(&buff[..total])
}

fn take<const N: usize>(payload: &[u8], offset: usize) -> Result<[u8; N], FrameError> {
    let needed = offset + N;
    if payload.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            available: payload.len(),
        });
    }

    let mut out = [0u8; N];
    out.copy_from_slice(&payload[offset..needed]);
    Ok(out)
}

/// Go payload: `[address: u32 le]`
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct GoRequest {
    pub address: u32,
}

impl GoRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        Ok(Self {
            address: u32::from_le_bytes(take(payload, 0)?),
        })
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        self.address.to_le_bytes()
    }
}

/// Write memory payload: `[address: u32 le, len: u8, data: [u8; len]]`
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct WriteRequest<'a> {
    pub address: u32,
    pub data: &'a [u8],
}

impl<'a> WriteRequest<'a> {
    const HEADER: usize = 5;

    pub fn parse(payload: &'a [u8]) -> Result<Self, FrameError> {
        let address = u32::from_le_bytes(take(payload, 0)?);
        let [len] = take(payload, 4)?;

        let needed = Self::HEADER + len as usize;
        if payload.len() < needed {
            return Err(FrameError::Truncated {
                needed,
                available: payload.len(),
            });
        }

        Ok(Self {
            address,
            data: &payload[Self::HEADER..needed],
        })
    }

    /// Serialise into `buff`, returning the payload bytes
    pub fn encode<'b>(&self, buff: &'b mut [u8]) -> Result<&'b [u8], FrameError> {
        if self.data.len() > MAX_CHUNK {
            return Err(FrameError::TooLong(self.data.len()));
        }

        let total = Self::HEADER + self.data.len();
        if buff.len() < total {
            return Err(FrameError::Truncated {
                needed: total,
                available: buff.len(),
            });
        }

        buff[..4].copy_from_slice(&self.address.to_le_bytes());
        buff[4] = self.data.len() as u8;
        buff[Self::HEADER..total].copy_from_slice(self.data);

        Ok(&buff[..total])
    }
}

/// Erase payload: `[sector, count]`
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct EraseRequest {
    pub sector: u8,
    pub count: u8,
}

impl EraseRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        let [sector, count] = take(payload, 0)?;
        Ok(Self { sector, count })
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        [self.sector, self.count]
    }
}

/// Write (un)protect payload: `[sector count, sector code]`
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct ProtectRequest {
    pub sector_count: u8,
    pub sector_code: u8,
}

impl ProtectRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        let [sector_count, sector_code] = take(payload, 0)?;
        Ok(Self {
            sector_count,
            sector_code,
        })
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        [self.sector_count, self.sector_code]
    }
}

/// Read-out unprotect payload: `[protocol level]`
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct LevelRequest {
    pub level: u8,
}

impl LevelRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        let [level] = take(payload, 0)?;
        Ok(Self { level })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_table_round_trips() {
        for c in Command::ALL.iter() {
            assert_eq!(Command::from_opcode(*c as u8), Some(*c));
        }
        assert_eq!(Command::from_opcode(0x03), None);
        assert_eq!(Command::from_opcode(0xFF), None);
    }

    #[test]
    fn encode_get_version() {
        let mut buff = [0u8; 16];
        let f = encode(Command::GetVersion as u8, &[], &mut buff).unwrap();

        assert_eq!(f.len(), 6);
        assert_eq!(&f[..2], &[0x05, 0x01]);
        assert_eq!(&f[2..], &integrity::checksum(&[0x05, 0x01]).to_le_bytes());
    }

    #[test]
    fn parse_exposes_fields() {
        let mut buff = [0u8; 32];
        let raw = encode(0x31, &[1, 2, 3], &mut buff).unwrap().to_vec();

        let f = Frame::parse(&raw).unwrap();
        assert_eq!(f.length(), 8);
        assert_eq!(f.opcode(), 0x31);
        assert_eq!(f.payload(), &[1, 2, 3]);
        assert_eq!(f.covered(), &raw[..5]);
        assert_eq!(f.crc(), integrity::checksum(&raw[..5]));
    }

    #[test]
    fn parse_rejects_short_length() {
        for length in 0..MIN_LENGTH {
            let raw = [length, 0, 0, 0, 0, 0];
            assert_eq!(Frame::parse(&raw), Err(FrameError::TooShort(length)));
        }
    }

    #[test]
    fn parse_rejects_missing_bytes() {
        let raw = [0x07, 0x01, 0, 0, 0];
        assert_eq!(
            Frame::parse(&raw),
            Err(FrameError::Truncated {
                needed: 8,
                available: 5
            })
        );
        assert!(Frame::parse(&[]).is_err());
    }

    #[test]
    fn encode_rejects_oversize_payload() {
        let mut buff = [0u8; FRAME_CAPACITY];
        let payload = [0u8; 251];

        assert_eq!(encode(0x31, &payload, &mut buff), Err(FrameError::TooLong(251)));
        assert!(encode(0x31, &payload[..250], &mut buff).is_ok());
    }

    #[test]
    fn write_request_layout() {
        let payload = [0x00, 0x00, 0x01, 0x08, 0x03, 0xaa, 0xbb, 0xcc, 0xdd];
        let w = WriteRequest::parse(&payload).unwrap();

        assert_eq!(w.address, 0x0801_0000);
        assert_eq!(w.data, &[0xaa, 0xbb, 0xcc]);

        let mut buff = [0u8; 16];
        assert_eq!(w.encode(&mut buff).unwrap(), &payload[..8]);
    }

    #[test]
    fn write_request_length_must_fit() {
        let payload = [0x00, 0x00, 0x01, 0x08, 0x04, 0xaa, 0xbb];

        assert_eq!(
            WriteRequest::parse(&payload),
            Err(FrameError::Truncated {
                needed: 9,
                available: 7
            })
        );
        assert!(WriteRequest::parse(&payload[..4]).is_err());
    }

    #[test]
    fn fixed_payloads() {
        assert_eq!(
            GoRequest::parse(&[0x00, 0x00, 0x01, 0x08]).unwrap().address,
            0x0801_0000
        );
        assert!(GoRequest::parse(&[0x00, 0x00, 0x01]).is_err());

        assert_eq!(
            EraseRequest::parse(&[0xff, 0x02]).unwrap(),
            EraseRequest {
                sector: 0xff,
                count: 2
            }
        );
        assert!(EraseRequest::parse(&[0x01]).is_err());

        assert_eq!(
            ProtectRequest::parse(&[0x02, 0x0c]).unwrap(),
            ProtectRequest {
                sector_count: 2,
                sector_code: 0x0c
            }
        );
        assert_eq!(LevelRequest::parse(&[0x01]).unwrap().level, 1);
        assert!(LevelRequest::parse(&[]).is_err());
    }

    #[test]
    fn status_codes() {
        for s in &[
            Status::Ok,
            Status::AddressInvalid,
            Status::FlashOperationFailed,
            Status::ProtectionOperationFailed,
        ] {
            assert_eq!(Status::from_u8(*s as u8), Some(*s));
        }
        assert_eq!(Status::from_u8(0x04), None);
    }
}
