//! Result and errors.
use std::{
    fmt::{self, Display, Formatter},
    io,
};

pub type Vip8Result<T> = std::result::Result<T, Vip8Error>;

#[derive(Debug)]
pub enum Vip8Error {
    /// Instruction word whose family or sub-family is not in the canonical
    /// table, with the address it was fetched from.
    UnknownOpcode { word: u16, addr: u16 },
    /// Attempt to load a ROM image that can't fit in VM memory.
    RomTooLarge(usize),
    /// More subroutine calls in flight than the stack holds.
    StackOverflow,
    /// Return executed with no subroutine call in flight.
    StackUnderflow,
    Io(io::Error),
    Fmt(fmt::Error),
}

impl Display for Vip8Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { word, addr } => {
                write!(f, "unknown opcode {word:04X} at {addr:04X}")
            }
            Self::RomTooLarge(size) => {
                write!(f, "ROM image of {size} bytes too large for VM memory")
            }
            Self::StackOverflow => write!(f, "call stack overflow"),
            Self::StackUnderflow => write!(f, "call stack underflow"),
            Self::Io(err) => write!(f, "{}", err),
            Self::Fmt(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Vip8Error {}

impl From<io::Error> for Vip8Error {
    fn from(err: io::Error) -> Self {
        Vip8Error::Io(err)
    }
}

impl From<fmt::Error> for Vip8Error {
    fn from(err: fmt::Error) -> Self {
        Vip8Error::Fmt(err)
    }
}
