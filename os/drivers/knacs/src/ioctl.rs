//! Control command encoding.
//!
//! Command numbers are split into 16-bit groups; each subsystem owns one
//! group and numbers its commands inside it.

use crate::error::{DmaError, Result};
use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;

pub const VERSION_MAJOR: i32 = 0;
pub const VERSION_MINOR: i32 = 1;

/// A raw command number.
///
/// Layout (LSB→MSB):
/// - bits 0..16: command within the group
/// - bits 16..32: group
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct IoctlCommand {
    #[bits(16)]
    pub nr: u16,
    #[bits(16)]
    pub group: u16,
}

impl IoctlCommand {
    /// `{ major, minor }` of the driver interface.
    pub const GET_VERSION: Self = Self::new().with_group(Group::General as u16).with_nr(0);
    /// Hand a [`DmaBufferDesc`] range of a DMA mapping to the transmit stream.
    pub const SEND_DMA_BUFFER: Self = Self::new().with_group(Group::DmaStream as u16).with_nr(1);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum Group {
    General = 0,
    /// Reserved; the pulse controller is driven through its register mapping.
    PulseCtrl = 1,
    DmaStream = 2,
}

impl Group {
    const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::General),
            1 => Some(Self::PulseCtrl),
            2 => Some(Self::DmaStream),
            _ => None,
        }
    }
}

/// Argument of [`IoctlCommand::SEND_DMA_BUFFER`].
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaBufferDesc {
    pub len: u64,
    pub buff: u64,
}

impl DmaBufferDesc {
    #[must_use]
    pub const fn new(buff: VirtualAddress, len: u64) -> Self {
        Self {
            len,
            buff: buff.as_u64(),
        }
    }

    #[must_use]
    pub const fn address(&self) -> VirtualAddress {
        VirtualAddress::new(self.buff)
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: i32,
    pub minor: i32,
}

/// The user argument, already copied in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlArg {
    None,
    DmaBuffer(DmaBufferDesc),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlReply {
    Done,
    Version(Version),
}

/// A decoded, supported command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Request {
    GetVersion,
    SendDmaBuffer(DmaBufferDesc),
}

impl Request {
    /// # Errors
    /// - [`DmaError::InvalidArgument`] for unknown commands, including every
    ///   command of the pulse controller group.
    /// - [`DmaError::Fault`] if `arg` does not fit the command.
    pub fn decode(command: IoctlCommand, arg: IoctlArg) -> Result<Self> {
        let group = Group::from_raw(command.group()).ok_or(DmaError::InvalidArgument("unknown command group"))?;
        match (group, command.nr()) {
            (Group::General, 0) => Ok(Self::GetVersion),
            (Group::DmaStream, 1) => match arg {
                IoctlArg::DmaBuffer(desc) => Ok(Self::SendDmaBuffer(desc)),
                IoctlArg::None => Err(DmaError::Fault("missing buffer descriptor")),
            },
            _ => Err(DmaError::InvalidArgument("unknown command")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_numbers_match_the_abi() {
        assert_eq!(IoctlCommand::GET_VERSION.into_bits(), 0);
        assert_eq!(IoctlCommand::SEND_DMA_BUFFER.into_bits(), (1 << 16) * 2 + 1);
        assert_eq!(IoctlCommand::from_bits((1 << 16) * 2 + 1), IoctlCommand::SEND_DMA_BUFFER);
    }

    #[test]
    fn pulse_group_has_no_commands() {
        for nr in [0, 1, 0xFFFF] {
            let command = IoctlCommand::new().with_group(Group::PulseCtrl as u16).with_nr(nr);
            assert!(matches!(
                Request::decode(command, IoctlArg::None),
                Err(DmaError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn unknown_commands_are_invalid() {
        for raw in [1, 1 << 16, (1 << 16) * 2, (1 << 16) * 3, u32::MAX] {
            assert!(matches!(
                Request::decode(IoctlCommand::from_bits(raw), IoctlArg::None),
                Err(DmaError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn send_requires_a_descriptor() {
        assert!(matches!(
            Request::decode(IoctlCommand::SEND_DMA_BUFFER, IoctlArg::None),
            Err(DmaError::Fault(_))
        ));
        let desc = DmaBufferDesc::new(VirtualAddress::new(0x4000), 64);
        assert_eq!(
            Request::decode(IoctlCommand::SEND_DMA_BUFFER, IoctlArg::DmaBuffer(desc)),
            Ok(Request::SendDmaBuffer(desc))
        );
    }
}
