//! Host side of the update protocol

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::config::MASS_ERASE;
use crate::protocol::{
    self, Command, EraseRequest, FrameError, GoRequest, ProtectRequest, Status, Version,
    WriteRequest, FRAME_CAPACITY, MAX_CHUNK, UART_ACK, UART_NACK,
};

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError: core::fmt::Debug> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),
    #[error("command rejected (nack)")]
    Nack,
    #[error("timeout awaiting response")]
    ResponseTimeout,
    #[error("unexpected response byte 0x{0:02x}")]
    InvalidResponse(u8),
    #[error("reply of {got} bytes, expected {expected}")]
    UnexpectedLength { expected: usize, got: usize },
    #[error("device reported {0:?}")]
    Status(Status),
    #[error("unknown status byte 0x{0:02x}")]
    UnknownStatus(u8),
    #[error("frame error: {0}")]
    Frame(FrameError),
}

impl<SerialError: core::fmt::Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub init_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 1000,
            poll_delay_ms: 1,
            init_delay_ms: 100,
        }
    }
}

pub struct Programmer<P, D, E> {
    options: Options,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            options,
            port,
            delay,
            _err: PhantomData,
        }
    }

    /// Reset the device into the bootloader unless disabled
    pub fn init(&mut self) -> Result<(), Error<E>> {
        if self.options.no_reset {
            return Ok(());
        }

        debug!("Resetting device");

        self.port.set_dtr(true)?;
        self.port.set_rts(true)?;

        self.delay.delay_ms(100u32);

        self.port.set_dtr(false)?;
        self.port.set_rts(false)?;

        self.delay.delay_ms(self.options.init_delay_ms);

        Ok(())
    }

    /// Issue a command and read its reply into `reply`, returning the reply length
    pub fn command(
        &mut self,
        command: Command,
        payload: &[u8],
        reply: &mut [u8],
    ) -> Result<usize, Error<E>> {
        let mut buff = [0u8; FRAME_CAPACITY];
        let frame = protocol::encode(command as u8, payload, &mut buff).map_err(Error::Frame)?;

        debug!("Sending {:?} ({} bytes)", command, frame.len());

        for b in frame {
            nb::block!(self.port.write(*b))?;
        }
        nb::block!(self.port.flush())?;

        self.await_ack()?;

        let len = self.read_byte()? as usize;
        if len > reply.len() {
            return Err(Error::UnexpectedLength {
                expected: reply.len(),
                got: len,
            });
        }

        for b in reply[..len].iter_mut() {
            *b = self.read_byte()?;
        }

        debug!("Reply: {:02x?}", &reply[..len]);

        Ok(len)
    }

    /// Fetch the bootloader version and supported commands
    pub fn get_help(&mut self) -> Result<(Version, [u8; 15]), Error<E>> {
        let mut reply = [0u8; Version::LEN + 15];
        self.command_exact(Command::Get, &[], &mut reply)?;

        let mut commands = [0u8; 15];
        commands.copy_from_slice(&reply[Version::LEN..]);

        Ok((Self::version_of(&reply), commands))
    }

    /// Fetch the bootloader version
    pub fn version(&mut self) -> Result<Version, Error<E>> {
        let mut reply = [0u8; Version::LEN];
        self.command_exact(Command::GetVersion, &[], &mut reply)?;

        Ok(Self::version_of(&reply))
    }

    /// Fetch the chip ID
    pub fn chip_id(&mut self) -> Result<u16, Error<E>> {
        let mut reply = [0u8; 2];
        self.command_exact(Command::GetId, &[], &mut reply)?;

        Ok(u16::from_le_bytes(reply))
    }

    /// Start execution at `address`
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        self.status_command(Command::Go, &GoRequest { address }.to_bytes())
    }

    /// Write a single block of at most [`MAX_CHUNK`] bytes
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        let mut buff = [0u8; FRAME_CAPACITY];
        let payload = WriteRequest { address, data }.encode(&mut buff).map_err(Error::Frame)?;

        self.status_command(Command::WriteMemory, payload)
    }

    /// Write `data` from `address` in as many blocks as required, calling
    /// `progress` with the running byte count
    pub fn write_all(
        &mut self,
        address: u32,
        data: &[u8],
        mut progress: impl FnMut(usize),
    ) -> Result<(), Error<E>> {
        let mut written = 0;

        for chunk in data.chunks(MAX_CHUNK) {
            self.write_memory(address.wrapping_add(written as u32), chunk)?;
            written += chunk.len();
            progress(written);
        }

        Ok(())
    }

    /// Erase `count` sectors from `sector`
    pub fn erase(&mut self, sector: u8, count: u8) -> Result<(), Error<E>> {
        self.status_command(Command::Erase, &EraseRequest { sector, count }.to_bytes())
    }

    /// Erase the whole device
    pub fn mass_erase(&mut self) -> Result<(), Error<E>> {
        self.erase(MASS_ERASE, 0)
    }

    pub fn write_protect(&mut self, sector_count: u8, sector_code: u8) -> Result<(), Error<E>> {
        let req = ProtectRequest {
            sector_count,
            sector_code,
        };
        self.status_command(Command::WriteProtect, &req.to_bytes())
    }

    pub fn write_unprotect(&mut self, sector_count: u8, sector_code: u8) -> Result<(), Error<E>> {
        let req = ProtectRequest {
            sector_count,
            sector_code,
        };
        self.status_command(Command::WriteUnprotect, &req.to_bytes())
    }

    /// Enable read protection (level 1)
    pub fn readout_protect(&mut self) -> Result<(), Error<E>> {
        self.status_command(Command::ReadoutProtect, &[])
    }

    /// Request read protection level 0 or 1
    pub fn readout_unprotect(&mut self, level: u8) -> Result<(), Error<E>> {
        self.status_command(Command::ReadoutUnprotect, &[level])
    }

    fn version_of(reply: &[u8]) -> Version {
        Version::from_bytes([reply[0], reply[1], reply[2], reply[3]])
    }

    fn command_exact(
        &mut self,
        command: Command,
        payload: &[u8],
        reply: &mut [u8],
    ) -> Result<(), Error<E>> {
        let n = self.command(command, payload, reply)?;
        if n != reply.len() {
            return Err(Error::UnexpectedLength {
                expected: reply.len(),
                got: n,
            });
        }
        Ok(())
    }

    fn status_command(&mut self, command: Command, payload: &[u8]) -> Result<(), Error<E>> {
        let mut reply = [0u8; 1];
        self.command_exact(command, payload, &mut reply)?;

        match Status::from_u8(reply[0]) {
            Some(Status::Ok) => Ok(()),
            Some(s) => Err(Error::Status(s)),
            None => Err(Error::UnknownStatus(reply[0])),
        }
    }

    fn await_ack(&mut self) -> Result<(), Error<E>> {
        match self.read_byte()? {
            UART_ACK => {
                debug!("Received bootloader ack");
                Ok(())
            }
            UART_NACK => {
                debug!("Received bootloader nack");
                Err(Error::Nack)
            }
            v => {
                debug!("Received unexpected value: 0x{:x}", v);
                Err(Error::InvalidResponse(v))
            }
        }
    }

    fn read_byte(&mut self) -> Result<u8, Error<E>> {
        let mut t = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms;

            if t > self.options.response_timeout_ms {
                error!("Receive timeout");
                return Err(Error::ResponseTimeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity;
    use embedded_hal_mock::delay::MockNoop;
    use embedded_hal_mock::serial::{Mock, Transaction};
    use embedded_hal_mock::MockError;

    impl SerialPort<MockError> for Mock<u8> {
        fn set_rts(&mut self, _level: bool) -> Result<(), MockError> {
            Ok(())
        }

        fn set_dtr(&mut self, _level: bool) -> Result<(), MockError> {
            Ok(())
        }
    }

    fn options() -> Options {
        Options {
            no_reset: true,
            ..Options::default()
        }
    }

    fn frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![1 + payload.len() as u8 + 4, opcode];
        f.extend_from_slice(payload);
        let crc = integrity::checksum(&f);
        f.extend_from_slice(&crc.to_le_bytes());
        f
    }

    fn expect(opcode: u8, payload: &[u8], response: &[u8]) -> Vec<Transaction<u8>> {
        vec![
            Transaction::write_many(frame(opcode, payload)),
            Transaction::flush(),
            Transaction::read_many(response),
        ]
    }

    #[test]
    fn test_version() {
        let expectations = expect(0x01, &[], &[UART_ACK, 4, 200, 1, 0, 0]);
        let mut port = Mock::new(&expectations);

        let mut p = Programmer::new(port.clone(), MockNoop::new(), options());
        let v = p.version().unwrap();

        assert_eq!(
            v,
            Version {
                vendor: 200,
                major: 1,
                minor: 0,
                patch: 0
            }
        );
        port.done();
    }

    #[test]
    fn test_get_help() {
        let mut response = vec![UART_ACK, 19, 200, 1, 0, 0];
        response.extend(Command::ALL.iter().map(|c| *c as u8));

        let expectations = expect(0x00, &[], &response);
        let mut port = Mock::new(&expectations);

        let mut p = Programmer::new(port.clone(), MockNoop::new(), options());
        let (v, commands) = p.get_help().unwrap();

        assert_eq!(v.vendor, 200);
        assert_eq!(commands[4], Command::Go as u8);
        assert_eq!(commands[14], Command::Checksum as u8);
        port.done();
    }

    #[test]
    fn test_chip_id() {
        let expectations = expect(0x02, &[], &[UART_ACK, 2, 0x49, 0x04]);
        let mut port = Mock::new(&expectations);

        let mut p = Programmer::new(port.clone(), MockNoop::new(), options());
        assert_eq!(p.chip_id().unwrap(), 0x449);
        port.done();
    }

    #[test]
    fn test_write_memory() {
        let payload = [0x00, 0x00, 0x01, 0x08, 0x02, 0xab, 0xcd];
        let expectations = expect(0x31, &payload, &[UART_ACK, 1, 0x00]);
        let mut port = Mock::new(&expectations);

        let mut p = Programmer::new(port.clone(), MockNoop::new(), options());
        p.write_memory(0x0801_0000, &[0xab, 0xcd]).unwrap();
        port.done();
    }

    #[test]
    fn test_write_reports_status() {
        let payload = [0x00, 0x00, 0x00, 0x10, 0x01, 0xab];
        let expectations = expect(0x31, &payload, &[UART_ACK, 1, 0x01]);
        let mut port = Mock::new(&expectations);

        let mut p = Programmer::new(port.clone(), MockNoop::new(), options());
        assert_eq!(
            p.write_memory(0x1000_0000, &[0xab]),
            Err(Error::Status(Status::AddressInvalid))
        );
        port.done();
    }

    #[test]
    fn test_write_all_chunks() {
        let data: Vec<u8> = (0..MAX_CHUNK + 10).map(|i| i as u8).collect();

        let mut first = vec![0x00, 0x00, 0x01, 0x08, MAX_CHUNK as u8];
        first.extend_from_slice(&data[..MAX_CHUNK]);

        let second_addr = 0x0801_0000u32 + MAX_CHUNK as u32;
        let mut second = second_addr.to_le_bytes().to_vec();
        second.push(10);
        second.extend_from_slice(&data[MAX_CHUNK..]);

        let mut expectations = expect(0x31, &first, &[UART_ACK, 1, 0x00]);
        expectations.extend(expect(0x31, &second, &[UART_ACK, 1, 0x00]));
        let mut port = Mock::new(&expectations);

        let mut p = Programmer::new(port.clone(), MockNoop::new(), options());
        let mut seen = vec![];
        p.write_all(0x0801_0000, &data, |n| seen.push(n)).unwrap();

        assert_eq!(seen, vec![MAX_CHUNK, MAX_CHUNK + 10]);
        port.done();
    }

    #[test]
    fn test_mass_erase() {
        let expectations = expect(0x43, &[0xff, 0x00], &[UART_ACK, 1, 0x00]);
        let mut port = Mock::new(&expectations);

        let mut p = Programmer::new(port.clone(), MockNoop::new(), options());
        p.mass_erase().unwrap();
        port.done();
    }

    #[test]
    fn test_protection_commands() {
        let mut expectations = expect(0x63, &[0x02, 0x0c], &[UART_ACK, 1, 0x00]);
        expectations.extend(expect(0x73, &[0x01, 0x04], &[UART_ACK, 1, 0x00]));
        expectations.extend(expect(0x82, &[], &[UART_ACK, 1, 0x00]));
        expectations.extend(expect(0x92, &[0x02], &[UART_ACK, 1, 0x03]));
        let mut port = Mock::new(&expectations);

        let mut p = Programmer::new(port.clone(), MockNoop::new(), options());
        p.write_protect(2, 0x0c).unwrap();
        p.write_unprotect(1, 0x04).unwrap();
        p.readout_protect().unwrap();
        assert_eq!(
            p.readout_unprotect(2),
            Err(Error::Status(Status::ProtectionOperationFailed))
        );
        port.done();
    }

    #[test]
    fn test_nack() {
        let expectations = expect(0x01, &[], &[UART_NACK]);
        let mut port = Mock::new(&expectations);

        let mut p = Programmer::new(port.clone(), MockNoop::new(), options());
        assert_eq!(p.version(), Err(Error::Nack));
        port.done();
    }

    #[test]
    fn test_invalid_response() {
        let expectations = expect(0x01, &[], &[0x42]);
        let mut port = Mock::new(&expectations);

        let mut p = Programmer::new(port.clone(), MockNoop::new(), options());
        assert_eq!(p.version(), Err(Error::InvalidResponse(0x42)));
        port.done();
    }

    #[test]
    fn test_reply_too_long() {
        let expectations = expect(0x02, &[], &[UART_ACK, 3]);
        let mut port = Mock::new(&expectations);

        let mut p = Programmer::new(port.clone(), MockNoop::new(), options());
        assert_eq!(
            p.chip_id(),
            Err(Error::UnexpectedLength { expected: 2, got: 3 })
        );
        port.done();
    }
}
