//! Device side command dispatcher
//!
//! The [`Agent`] owns the frame buffer and every collaborator, reads one
//! frame per exchange and routes it through a single opcode table. Handlers
//! verify the trailer themselves, then either NACK or ACK with the reply
//! length for their command, act, and send their reply.

use core::fmt::Debug;
use core::marker::PhantomData;

use crate::config::{Config, DEVICE_ID_MASK};
use crate::flash;
use crate::hal::{flush, recv, send, CrcUnit, Launcher, Mcu, Transport, HOST_WAIT};
use crate::integrity::{self, IntegrityError};
use crate::launch::VectorTable;
use crate::memory::Validity;
use crate::protection::{self, ProtectionError, ProtectionLevel};
use crate::protocol::{
    Command, EraseRequest, Frame, FrameError, GoRequest, LevelRequest, ProtectRequest, Status,
    Version, WriteRequest, FRAME_CAPACITY, UART_ACK, UART_NACK,
};

/// Reason an exchange ended without a command being acted on
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Fault<E> {
    #[error("transport error: {0:?}")]
    Transport(E),
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
    #[error("{0}")]
    Integrity(#[from] IntegrityError),
    #[error("unknown command 0x{0:02x}")]
    UnknownCommand(u8),
}

/// How a single exchange concluded
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ExchangeOutcome {
    /// The command was acknowledged and handled
    Ack,
    /// The command was refused, or the transport failed
    Nack,
}

type Handler<T, E> = fn(&mut T, &Frame<'_>, u8) -> Result<(), Fault<E>>;

struct Route<T, E> {
    command: Command,
    reply_len: u8,
    handler: Handler<T, E>,
}

impl<T, E> Route<T, E> {
    const fn new(command: Command, reply_len: u8, handler: Handler<T, E>) -> Self {
        Self {
            command,
            reply_len,
            handler,
        }
    }
}

struct Context<P, C, M, L, E> {
    port: P,
    crc: C,
    mcu: M,
    launcher: L,
    config: Config,
    _err: PhantomData<E>,
}

pub struct Agent<P, C, M, L, E> {
    buffer: [u8; FRAME_CAPACITY],
    ctx: Context<P, C, M, L, E>,
}

impl<P, C, M, L, E> Agent<P, C, M, L, E>
where
    P: Transport<E>,
    C: CrcUnit,
    M: Mcu,
    L: Launcher,
    E: Debug,
{
    pub fn new(port: P, crc: C, mcu: M, launcher: L, config: Config) -> Self {
        Self {
            buffer: [0u8; FRAME_CAPACITY],
            ctx: Context {
                port,
                crc,
                mcu,
                launcher,
                config,
                _err: PhantomData,
            },
        }
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn mcu(&self) -> &M {
        &self.ctx.mcu
    }

    pub fn mcu_mut(&mut self) -> &mut M {
        &mut self.ctx.mcu
    }

    /// Hand back the transport, CRC unit, device and launcher
    pub fn release(self) -> (P, C, M, L) {
        let Context {
            port, crc, mcu, launcher, ..
        } = self.ctx;
        (port, crc, mcu, launcher)
    }

    /// Supported commands with their reply lengths, in table order
    pub fn commands() -> impl Iterator<Item = (Command, u8)> {
        Context::<P, C, M, L, E>::ROUTES
            .into_iter()
            .map(|r| (r.command, r.reply_len))
    }

    /// Serve exchanges forever
    pub fn run(&mut self) -> ! {
        info!("Waiting for commands");

        loop {
            self.fetch_and_handle();
        }
    }

    /// Start the application image at the configured base
    pub fn launch_application(&mut self) -> ! {
        let base = self.ctx.config.app_base;
        self.ctx.launcher.launch(base)
    }

    /// Read one frame from the host and handle it
    pub fn fetch_and_handle(&mut self) -> ExchangeOutcome {
        match self.exchange() {
            Ok(()) => ExchangeOutcome::Ack,
            Err(Fault::Transport(e)) => {
                error!("Transport failure: {:?}", e);
                ExchangeOutcome::Nack
            }
            Err(f) => {
                warn!("Refusing frame: {}", f);
                if let Err(e) = self.ctx.reply(&[UART_NACK]) {
                    error!("Sending nack failed: {}", e);
                }
                ExchangeOutcome::Nack
            }
        }
    }

    fn exchange(&mut self) -> Result<(), Fault<E>> {
        self.receive()?;

        let Self { buffer, ctx } = self;
        let frame = Frame::parse(&buffer[..])?;

        debug!("Frame opcode 0x{:02x} length {}", frame.opcode(), frame.length());

        let route = Context::<P, C, M, L, E>::ROUTES
            .into_iter()
            .find(|r| r.command as u8 == frame.opcode())
            .ok_or(Fault::UnknownCommand(frame.opcode()))?;

        (route.handler)(ctx, &frame, route.reply_len)
    }

    fn receive(&mut self) -> Result<(), Fault<E>> {
        self.buffer.iter_mut().for_each(|b| *b = 0);

        let length = recv(&mut self.ctx.port, HOST_WAIT).map_err(Fault::Transport)?;
        self.buffer[0] = length;

        for b in self.buffer[1..=length as usize].iter_mut() {
            *b = recv(&mut self.ctx.port, HOST_WAIT).map_err(Fault::Transport)?;
        }

        Ok(())
    }
}

impl<P, C, M, L, E> Context<P, C, M, L, E>
where
    P: Transport<E>,
    C: CrcUnit,
    M: Mcu,
    L: Launcher,
    E: Debug,
{
    #[rustfmt::skip]
    const ROUTES: [Route<Self, E>; 15] = [
        Route::new(Command::Get, 19, Self::get_help),
        Route::new(Command::GetVersion, Version::LEN as u8, Self::get_version),
        Route::new(Command::GetId, 2, Self::get_id),
        Route::new(Command::ReadMemory, 0, Self::unsupported),
        Route::new(Command::Go, 1, Self::go),
        Route::new(Command::WriteMemory, 1, Self::write_memory),
        Route::new(Command::Erase, 1, Self::erase),
        Route::new(Command::ExtendedErase, 0, Self::unsupported),
        Route::new(Command::Special, 0, Self::unsupported),
        Route::new(Command::ExtendedSpecial, 0, Self::unsupported),
        Route::new(Command::WriteProtect, 1, Self::write_protect),
        Route::new(Command::WriteUnprotect, 1, Self::write_unprotect),
        Route::new(Command::ReadoutProtect, 1, Self::readout_protect),
        Route::new(Command::ReadoutUnprotect, 1, Self::readout_unprotect),
        Route::new(Command::Checksum, 0, Self::unsupported),
    ];

    fn reply(&mut self, bytes: &[u8]) -> Result<(), Fault<E>> {
        for b in bytes {
            send(&mut self.port, *b, HOST_WAIT).map_err(Fault::Transport)?;
        }
        flush(&mut self.port, HOST_WAIT).map_err(Fault::Transport)
    }

    fn verify(&mut self, frame: &Frame<'_>) -> Result<(), Fault<E>> {
        integrity::verify(&mut self.crc, frame.covered(), frame.crc())?;
        Ok(())
    }

    fn ack(&mut self, reply_len: u8) -> Result<(), Fault<E>> {
        self.reply(&[UART_ACK, reply_len])
    }

    fn status(&mut self, status: Status) -> Result<(), Fault<E>> {
        if status != Status::Ok {
            debug!("Reporting {:?}", status);
        }
        self.reply(&[status as u8])
    }

    fn get_help(&mut self, frame: &Frame<'_>, reply_len: u8) -> Result<(), Fault<E>> {
        self.verify(frame)?;
        self.ack(reply_len)?;

        let mut reply = [0u8; Version::LEN + Command::ALL.len()];
        reply[..Version::LEN].copy_from_slice(&self.config.version.to_bytes());
        for (r, c) in reply[Version::LEN..].iter_mut().zip(Command::ALL.iter()) {
            *r = *c as u8;
        }

        self.reply(&reply)
    }

    fn get_version(&mut self, frame: &Frame<'_>, reply_len: u8) -> Result<(), Fault<E>> {
        self.verify(frame)?;
        self.ack(reply_len)?;

        let version = self.config.version.to_bytes();
        self.reply(&version)
    }

    fn get_id(&mut self, frame: &Frame<'_>, reply_len: u8) -> Result<(), Fault<E>> {
        self.verify(frame)?;
        self.ack(reply_len)?;

        let id = (self.mcu.device_id() & DEVICE_ID_MASK) as u16;
        self.reply(&id.to_le_bytes())
    }

    fn go(&mut self, frame: &Frame<'_>, reply_len: u8) -> Result<(), Fault<E>> {
        self.verify(frame)?;
        let req = GoRequest::parse(frame.payload())?;
        self.ack(reply_len)?;

        if !VectorTable::fits(&self.config.memory, req.address) {
            warn!("Go to invalid address 0x{:08x}", req.address);
            return self.status(Status::AddressInvalid);
        }

        self.status(Status::Ok)?;

        info!("Go 0x{:08x}", req.address);
        self.launcher.launch(req.address)
    }

    fn write_memory(&mut self, frame: &Frame<'_>, reply_len: u8) -> Result<(), Fault<E>> {
        self.verify(frame)?;
        let req = WriteRequest::parse(frame.payload())?;
        self.ack(reply_len)?;

        // Both ends of the block must sit inside a window
        let last = (req.data.len() as u32).saturating_sub(1);
        let valid = [req.address, req.address.wrapping_add(last)]
            .iter()
            .all(|a| self.config.memory.classify(*a) == Validity::Valid);

        if !valid {
            warn!("Write of {} bytes to invalid address 0x{:08x}", req.data.len(), req.address);
            return self.status(Status::AddressInvalid);
        }

        match flash::write_payload(&mut self.mcu, req.data, req.address) {
            Ok(()) => self.status(Status::Ok),
            Err(e) => {
                warn!("Write failed: {}", e);
                self.status(Status::FlashOperationFailed)
            }
        }
    }

    fn erase(&mut self, frame: &Frame<'_>, reply_len: u8) -> Result<(), Fault<E>> {
        self.verify(frame)?;
        let req = EraseRequest::parse(frame.payload())?;
        self.ack(reply_len)?;

        let (sectors, voltage) = (self.config.sectors, self.config.voltage);
        match flash::erase(&mut self.mcu, sectors, req.sector, req.count, voltage) {
            Ok(()) => self.status(Status::Ok),
            Err(e) => {
                warn!("Erase failed: {}", e);
                self.status(Status::FlashOperationFailed)
            }
        }
    }

    fn write_protect(&mut self, frame: &Frame<'_>, reply_len: u8) -> Result<(), Fault<E>> {
        self.change_wrp(frame, reply_len, true)
    }

    fn write_unprotect(&mut self, frame: &Frame<'_>, reply_len: u8) -> Result<(), Fault<E>> {
        self.change_wrp(frame, reply_len, false)
    }

    fn change_wrp(
        &mut self,
        frame: &Frame<'_>,
        reply_len: u8,
        enable: bool,
    ) -> Result<(), Fault<E>> {
        self.verify(frame)?;
        let req = ProtectRequest::parse(frame.payload())?;
        self.ack(reply_len)?;

        let sectors = self.config.sectors;
        let result = protection::set_wrp(
            &mut self.mcu,
            sectors,
            req.sector_count,
            req.sector_code,
            enable,
        );

        self.protection_status(result)
    }

    fn readout_protect(&mut self, frame: &Frame<'_>, reply_len: u8) -> Result<(), Fault<E>> {
        self.verify(frame)?;
        self.ack(reply_len)?;

        let result = protection::set_rdp(&mut self.mcu, ProtectionLevel::Level1);
        self.protection_status(result)
    }

    fn readout_unprotect(&mut self, frame: &Frame<'_>, reply_len: u8) -> Result<(), Fault<E>> {
        self.verify(frame)?;
        let req = LevelRequest::parse(frame.payload())?;
        self.ack(reply_len)?;

        match ProtectionLevel::from_protocol(req.level) {
            Some(level) if level < ProtectionLevel::Level2 => {
                let result = protection::set_rdp(&mut self.mcu, level);
                self.protection_status(result)
            }
            _ => {
                warn!("Read-out unprotect to level {} refused", req.level);
                self.status(Status::ProtectionOperationFailed)
            }
        }
    }

    fn protection_status(&mut self, result: Result<(), ProtectionError>) -> Result<(), Fault<E>> {
        match result {
            Ok(()) => self.status(Status::Ok),
            Err(e) => {
                warn!("Protection change failed: {}", e);
                self.status(Status::ProtectionOperationFailed)
            }
        }
    }

    /// Listed in the opcode table but not acted on
    fn unsupported(&mut self, frame: &Frame<'_>, reply_len: u8) -> Result<(), Fault<E>> {
        self.verify(frame)?;
        debug!("Command 0x{:02x} has no implementation", frame.opcode());
        self.ack(reply_len)
    }
}
