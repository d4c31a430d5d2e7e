mod clock;
pub mod constants;
mod devices;
mod error;
mod memory;
mod opcode;
mod registers;
mod stack;
mod vm;

/// Implementation version, for host banners.
pub const IMPL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use self::vm::Hz;

pub mod prelude {
    pub use super::{
        clock::Clock,
        devices::{Framebuffer, KeyCode, Keyboard, ScreenBuffer},
        error::{Vip8Error, Vip8Result},
        memory::Memory,
        opcode::{Opcode, UnknownOpcode},
        registers::Registers,
        stack::CallStack,
        vm::{Flow, Tone, Vip8Conf, Vip8Vm},
    };
}
