//! Virtual machine.
use std::{
    fmt::{self, Write},
    time::Duration,
};

use rand::prelude::*;

use crate::{
    constants::*,
    devices::{Framebuffer, KeyCode, Keyboard},
    error::{Vip8Error, Vip8Result},
    memory::Memory,
    opcode::Opcode,
    registers::Registers,
    stack::CallStack,
};

pub struct Vip8Vm {
    registers: Registers,
    memory: Memory,
    stack: CallStack,
    keyboard: Keyboard,
    /// Target register of an `Fx0A` wait, while the machine is blocked
    /// on a keypress.
    wait_for_key: Option<u8>,
    /// ROM image retained so `reset` can reload it.
    rom: Vec<u8>,
    conf: Vip8Conf,
}

/// Control flow signal returned by a single cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Ok,
    /// Program counter has jumped to a new address.
    ///
    /// This is useful for the caller to avoid being blocked on infinite
    /// or long running loops.
    ///
    /// This is returned when the interpreter encounters:
    ///
    /// - 1nnn (`JP addr`)
    /// - Bnnn (`JP V0, addr`)
    /// - 2nnn (`CALL addr`)
    /// - 00EE (`RET`)
    Jump,
    /// The framebuffer was drawn to.
    Draw,
    /// Waiting for a keypress.
    ///
    /// This is triggered by the opcode `Fx0A` (`LD Vx, K`), which stops
    /// execution until a key is pressed, and loads the key value into `Vx`.
    /// Cycles spent waiting change no state; the cycle that observes a
    /// pressed key completes the wait.
    KeyWait,
}

/// Outcome of a timer tick, consumed by the host's audio collaborator.
///
/// `Beep` is returned for every tick during which the sound timer was
/// running; the host plays a tone for the tick's duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Silent,
    Beep,
}

/// VM Configuration Parameters.
#[derive(Default, Clone)]
pub struct Vip8Conf {
    /// Instruction execution rate. Defaults to [`CPU_FREQUENCY`].
    pub cpu_frequency: Option<Hz>,
    /// Timer countdown rate. Defaults to [`TIMER_FREQUENCY`].
    pub timer_frequency: Option<Hz>,
}

/// Clock frequency, in hertz (per second)
#[derive(Debug, Default, Clone, Copy)]
pub struct Hz(pub u64);

impl From<Hz> for Duration {
    fn from(freq: Hz) -> Self {
        if freq.0 == 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(NANOS_IN_SECOND / freq.0)
        }
    }
}

impl Vip8Vm {
    pub fn new(conf: Vip8Conf) -> Self {
        Vip8Vm {
            registers: Registers::new(),
            memory: Memory::new(),
            stack: CallStack::new(),
            keyboard: Keyboard::new(),
            wait_for_key: None,
            rom: Vec::new(),
            conf,
        }
    }

    /// Configuration that was used to instantiate the VM.
    pub fn config(&self) -> &Vip8Conf {
        &self.conf
    }

    /// Load a ROM image and prepare the machine for execution.
    pub fn load_rom(&mut self, rom: &[u8]) -> Vip8Result<()> {
        // Check capacity before tearing down the current state.
        if MEM_START + rom.len() > MEM_SIZE {
            return Err(Vip8Error::RomTooLarge(rom.len()));
        }
        self.rom = rom.to_vec();
        self.reset()
    }

    /// Reinitialize memory, registers, stack, keyboard and the wait state,
    /// then reload the ROM image.
    pub fn reset(&mut self) -> Vip8Result<()> {
        self.registers.reset();
        self.memory.reset();
        self.stack.reset();
        self.keyboard.clear();
        self.wait_for_key = None;
        self.memory.load_rom(&self.rom)
    }

    /// Sets the keyboard key input state.
    pub fn set_key(&mut self, key: KeyCode, pressed: bool) {
        self.keyboard.set_key(key, pressed);
    }

    /// Clear the keyboard input state, setting all keys to up.
    pub fn clear_keys(&mut self) {
        self.keyboard.clear();
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn stack(&self) -> &CallStack {
        &self.stack
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }
}

/// Interpreter
impl Vip8Vm {
    /// Advance the delay and sound timers by one tick.
    ///
    /// Runs on its own fixed-rate schedule (reference: 60 Hz), decoupled
    /// from how many instructions executed in the interval.
    pub fn tick_timers(&mut self) -> Tone {
        if self.registers.dt > 0 {
            self.registers.dt -= 1;
        }
        if self.registers.st > 0 {
            self.registers.st -= 1;
            Tone::Beep
        } else {
            Tone::Silent
        }
    }

    /// Execute one cycle against the given framebuffer.
    pub fn step<F: Framebuffer>(&mut self, fb: &mut F) -> Vip8Result<Flow> {
        // While blocked on Fx0A nothing is fetched; the first held key,
        // scanned in ascending order, completes the wait.
        if let Some(x) = self.wait_for_key {
            if let Some(key) = self.keyboard.first_pressed() {
                self.registers.set_v(x, key);
                self.wait_for_key = None;
            }
            return Ok(Flow::KeyWait);
        }

        let addr = self.registers.pc;
        let word = self.fetch();
        let opcode = Opcode::decode(word)
            .map_err(|unknown| Vip8Error::UnknownOpcode {
                word: unknown.0,
                addr,
            })?;
        op_trace(addr, &opcode);

        self.exec(opcode, fb)
    }

    /// Run up to `step_count` cycles.
    pub fn run_steps<F: Framebuffer>(
        &mut self,
        step_count: usize,
        fb: &mut F,
    ) -> Vip8Result<Flow> {
        let mut flow = Flow::Ok;
        for _ in 0..step_count {
            flow = self.step(fb)?;
        }
        Ok(flow)
    }

    /// Fetch the big-endian instruction word at `PC`, advancing past it.
    fn fetch(&mut self) -> u16 {
        let hi = self.memory.read(self.registers.pc);
        let lo = self.memory.read(self.registers.pc.wrapping_add(1));
        self.registers.advance();
        ((hi as u16) << 8) | lo as u16
    }

    fn exec<F: Framebuffer>(&mut self, opcode: Opcode, fb: &mut F) -> Vip8Result<Flow> {
        let mut rng = thread_rng();

        use Opcode::*;
        let flow = match opcode {
            ClearScreen => {
                fb.clear();
                Flow::Draw
            }
            Return => {
                let addr = self.stack.pop()?;
                self.registers.jump(addr);
                Flow::Jump
            }
            Jump { address } => {
                self.registers.jump(address);
                Flow::Jump
            }
            Call { address } => {
                self.stack.push(self.registers.pc)?;
                self.registers.jump(address);
                Flow::Jump
            }
            Skip_Eq_Byte { vx, nn } => {
                if self.registers.v(vx) == nn {
                    self.registers.skip();
                }
                Flow::Ok
            }
            Skip_NotEq_Byte { vx, nn } => {
                if self.registers.v(vx) != nn {
                    self.registers.skip();
                }
                Flow::Ok
            }
            Skip_Eq { vx, vy } => {
                if self.registers.v(vx) == self.registers.v(vy) {
                    self.registers.skip();
                }
                Flow::Ok
            }
            Load_Byte { vx, nn } => {
                self.registers.set_v(vx, nn);
                Flow::Ok
            }
            Add_Byte { vx, nn } => {
                let x = self.registers.v(vx);
                self.registers.set_v(vx, x.wrapping_add(nn));
                Flow::Ok
            }
            Load_Vx_Vy { vx, vy } => {
                let y = self.registers.v(vy);
                self.registers.set_v(vx, y);
                Flow::Ok
            }
            Or_Vx_Vy { vx, vy } => {
                let value = self.registers.v(vx) | self.registers.v(vy);
                self.registers.set_v(vx, value);
                Flow::Ok
            }
            And_Vx_Vy { vx, vy } => {
                let value = self.registers.v(vx) & self.registers.v(vy);
                self.registers.set_v(vx, value);
                Flow::Ok
            }
            Xor_Vx_Vy { vx, vy } => {
                let value = self.registers.v(vx) ^ self.registers.v(vy);
                self.registers.set_v(vx, value);
                Flow::Ok
            }
            Add_Vx_Vy { vx, vy } => {
                let (x, y) = (self.registers.v(vx), self.registers.v(vy));
                let (sum, carry) = x.overflowing_add(y);
                self.registers.set_v(vx, sum);
                self.registers.set_flag(carry);
                Flow::Ok
            }
            Sub_Vx_Vy { vx, vy } => {
                let (x, y) = (self.registers.v(vx), self.registers.v(vy));
                let (diff, borrow) = x.overflowing_sub(y);
                self.registers.set_v(vx, diff);
                // The flag records "no borrow": minuend >= subtrahend.
                self.registers.set_flag(!borrow);
                Flow::Ok
            }
            ShiftRight { vx } => {
                let x = self.registers.v(vx);
                self.registers.set_flag(x & 1 == 1);
                self.registers.set_v(vx, x >> 1);
                Flow::Ok
            }
            SubReverse_Vx_Vy { vx, vy } => {
                let (x, y) = (self.registers.v(vx), self.registers.v(vy));
                let (diff, borrow) = y.overflowing_sub(x);
                self.registers.set_v(vx, diff);
                self.registers.set_flag(!borrow);
                Flow::Ok
            }
            ShiftLeft { vx } => {
                let x = self.registers.v(vx);
                self.registers.set_flag(x >> 7 & 1 == 1);
                self.registers.set_v(vx, x << 1);
                Flow::Ok
            }
            Skip_NotEq { vx, vy } => {
                if self.registers.v(vx) != self.registers.v(vy) {
                    self.registers.skip();
                }
                Flow::Ok
            }
            Load_Address { address } => {
                self.registers.i = address;
                Flow::Ok
            }
            Jump_V0 { address } => {
                let v0 = self.registers.v(0) as u16;
                self.registers.jump(address.wrapping_add(v0));
                Flow::Jump
            }
            Random { vx, nn } => {
                self.registers.set_v(vx, nn & rng.gen::<u8>());
                Flow::Ok
            }
            Draw { vx, vy, n } => {
                let origin_x = self.registers.v(vx) as usize;
                let origin_y = self.registers.v(vy) as usize;

                // Every draw rewrites the collision flag.
                self.registers.set_flag(false);

                for row in 0..n as u16 {
                    let sprite = self.memory.read(self.registers.i.wrapping_add(row));
                    for col in 0..8usize {
                        if sprite >> (7 - col) & 1 == 0 {
                            continue;
                        }
                        let (x, y) = (origin_x + col, origin_y + row as usize);
                        // Pixels past the edge are clipped, not wrapped.
                        if x >= fb.width() || y >= fb.height() {
                            continue;
                        }
                        if fb.get_pixel(x, y) {
                            self.registers.set_flag(true);
                        }
                        fb.set_pixel(x, y, !fb.get_pixel(x, y));
                    }
                }
                Flow::Draw
            }
            Skip_KeyPressed { vx } => {
                if self.keyboard.is_pressed(self.registers.v(vx)) {
                    self.registers.skip();
                }
                Flow::Ok
            }
            Skip_KeyNotPressed { vx } => {
                if !self.keyboard.is_pressed(self.registers.v(vx)) {
                    self.registers.skip();
                }
                Flow::Ok
            }
            Load_Vx_Delay { vx } => {
                let dt = self.registers.dt;
                self.registers.set_v(vx, dt);
                Flow::Ok
            }
            Load_Vx_Key { vx } => {
                // PC has already advanced past this opcode; the machine
                // stalls until a key press is observed.
                self.wait_for_key = Some(vx);
                Flow::KeyWait
            }
            Load_Delay_Vx { vx } => {
                self.registers.dt = self.registers.v(vx);
                Flow::Ok
            }
            Load_Sound_Vx { vx } => {
                self.registers.st = self.registers.v(vx);
                Flow::Ok
            }
            Add_Address_Vx { vx } => {
                let sum = self.registers.i as u32 + self.registers.v(vx) as u32;
                self.registers.set_flag(sum > 0xFFF);
                self.registers.i = (sum & 0xFFF) as u16;
                Flow::Ok
            }
            Load_Font_Vx { vx } => {
                let digit = self.registers.v(vx) as u16;
                self.registers.i = FONTSET_START + digit * FONTSET_GLYPH_SIZE;
                Flow::Ok
            }
            #[rustfmt::skip]
            Store_Bcd { vx } => {
                let addr = self.registers.i;
                let x = self.registers.v(vx);
                self.memory.write(addr,                 x / 100 % 10);
                self.memory.write(addr.wrapping_add(1), x / 10  % 10);
                self.memory.write(addr.wrapping_add(2), x       % 10);
                Flow::Ok
            }
            Store_Registers { vx } => {
                let addr = self.registers.i;
                for offset in 0..=vx {
                    self.memory
                        .write(addr.wrapping_add(offset as u16), self.registers.v(offset));
                }
                self.registers.i = addr.wrapping_add(vx as u16 + 1);
                Flow::Ok
            }
            Load_Registers { vx } => {
                let addr = self.registers.i;
                for offset in 0..=vx {
                    let value = self.memory.read(addr.wrapping_add(offset as u16));
                    self.registers.set_v(offset, value);
                }
                self.registers.i = addr.wrapping_add(vx as u16 + 1);
                Flow::Ok
            }
        };

        Ok(flow)
    }
}

/// Troubleshooting
impl Vip8Vm {
    /// Returns the contents of program memory as a human readable string.
    pub fn dump_ram(&self, count: usize) -> Result<String, fmt::Error> {
        let mut buf = String::new();

        for offset in (0..count).step_by(2) {
            let addr = (MEM_START + offset) as Address;
            writeln!(
                buf,
                "{:04X}: {:02X}{:02X}",
                addr,
                self.memory.read(addr),
                self.memory.read(addr.wrapping_add(1))
            )?;
        }

        Ok(buf)
    }
}

#[cfg(feature = "op_trace")]
#[inline]
fn op_trace(addr: u16, opcode: &Opcode) {
    println!("{addr:04X}: {opcode}");
}

#[cfg(not(feature = "op_trace"))]
#[inline]
fn op_trace(_: u16, _: &Opcode) {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::devices::ScreenBuffer;

    #[test]
    fn test_clock_hz() {
        let interval: Duration = Hz(60).into();
        assert_eq!(interval.as_millis(), 16);
    }

    /// Fx0A (LD Vx, K)
    ///
    /// Wait for a keypress, then store the key value in Vx.
    /// The VM must stall while waiting, and signal the state to the host.
    #[test]
    #[rustfmt::skip]
    fn test_key_wait() {
        let mut vm = Vip8Vm::new(Vip8Conf::default());
        let mut screen = ScreenBuffer::new();
        vm.load_rom(&[
            0xF1, 0x0A, // LD v1, K
            0x62, 0x42, // LD v2, 0x42  ; sentinel
        ]).unwrap();

        // Executing Fx0A enters the wait with PC already past it.
        assert_eq!(vm.step(&mut screen).unwrap(), Flow::KeyWait);
        assert_eq!(vm.registers.pc, 0x202);

        // The machine must stall without touching any state.
        for _ in 0..5 {
            assert_eq!(vm.step(&mut screen).unwrap(), Flow::KeyWait);
            assert_eq!(vm.registers.pc, 0x202);
            assert_eq!(vm.registers.v(1), 0);
        }

        // A key press lets one cycle complete the wait.
        vm.set_key(KeyCode::Key5, true);
        assert_eq!(vm.step(&mut screen).unwrap(), Flow::KeyWait);
        assert_eq!(vm.registers.pc, 0x202);
        assert_eq!(vm.registers.v(1), 0x05);
        assert_eq!(vm.wait_for_key, None);

        // Ensure the machine is continuing.
        assert_eq!(vm.step(&mut screen).unwrap(), Flow::Ok);
        assert_eq!(vm.registers.pc, 0x204);
        assert_eq!(vm.registers.v(2), 0x42); // sentinel
    }

    #[test]
    fn test_key_wait_scans_lowest_key_first() {
        let mut vm = Vip8Vm::new(Vip8Conf::default());
        let mut screen = ScreenBuffer::new();
        vm.load_rom(&[0xF0, 0x0A]).unwrap();

        vm.step(&mut screen).unwrap();
        vm.set_key(KeyCode::KeyC, true);
        vm.set_key(KeyCode::Key3, true);
        vm.step(&mut screen).unwrap();

        assert_eq!(vm.registers.v(0), 0x3);
    }

    #[test]
    fn test_draw_collision() {
        let mut vm = Vip8Vm::new(Vip8Conf::default());
        let mut screen = ScreenBuffer::new();

        // Draw two sprite rows next to each other. The zero bits of the
        // second draw must not erase the pixels of the first draw:
        //
        //   draw 0b11110000 at x=4  ->  ____####  vf == 0
        //   draw 0b11110000 at x=0  ->  ########  vf == 0
        vm.load_rom(&[
            0xA2, 0x0C, // LD I, 0x20C  ; sprite data below
            0x60, 0x04, // LD v0, 4
            0x61, 0x00, // LD v1, 0
            0xD0, 0x11, // DRW v0, v1, 1
            0x60, 0x00, // LD v0, 0
            0xD0, 0x11, // DRW v0, v1, 1
            0xF0, 0x00, // sprite: 0b11110000, 0b00000000
        ])
        .unwrap();

        vm.run_steps(6, &mut screen).unwrap();

        for x in 0..8 {
            assert!(screen.get_pixel(x, 0), "pixel {x} off");
        }
        assert_eq!(screen.lit(), 8);
        assert_eq!(vm.registers.v(0xF), 0);
    }

    #[test]
    fn test_draw_erase_sets_collision() {
        let mut vm = Vip8Vm::new(Vip8Conf::default());
        let mut screen = ScreenBuffer::new();

        // Drawing the same glyph twice erases it completely.
        vm.load_rom(&[
            0xA0, 0x00, // LD I, 0x000  ; glyph 0
            0x60, 0x00, // LD v0, 0
            0xD0, 0x05, // DRW v0, v0, 5
            0xD0, 0x05, // DRW v0, v0, 5
        ])
        .unwrap();

        vm.run_steps(3, &mut screen).unwrap();
        assert_eq!(screen.lit(), 14); // glyph 0 has 14 set bits
        assert_eq!(vm.registers.v(0xF), 0);

        vm.run_steps(1, &mut screen).unwrap();
        assert_eq!(screen.lit(), 0);
        assert_eq!(vm.registers.v(0xF), 1);
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let mut vm = Vip8Vm::new(Vip8Conf::default());
        let mut screen = ScreenBuffer::new();
        vm.load_rom(&[0xFF, 0xFF]).unwrap();

        match vm.step(&mut screen) {
            Err(Vip8Error::UnknownOpcode { word, addr }) => {
                assert_eq!(word, 0xFFFF);
                assert_eq!(addr, 0x200);
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_timers_count_down_independently() {
        let mut vm = Vip8Vm::new(Vip8Conf::default());
        let mut screen = ScreenBuffer::new();
        vm.load_rom(&[
            0x60, 0x03, // LD v0, 3
            0xF0, 0x15, // LD DT, v0
            0x61, 0x02, // LD v1, 2
            0xF1, 0x18, // LD ST, v1
        ])
        .unwrap();
        vm.run_steps(4, &mut screen).unwrap();

        assert_eq!(vm.registers.delay_timer(), 3);
        assert_eq!(vm.registers.sound_timer(), 2);

        assert_eq!(vm.tick_timers(), Tone::Beep);
        assert_eq!(vm.tick_timers(), Tone::Beep);
        assert_eq!(vm.tick_timers(), Tone::Silent);
        assert_eq!(vm.registers.delay_timer(), 0);
        assert_eq!(vm.registers.sound_timer(), 0);
    }

    #[test]
    fn test_reset_reloads_rom() {
        let mut vm = Vip8Vm::new(Vip8Conf::default());
        let mut screen = ScreenBuffer::new();
        vm.load_rom(&[
            0x61, 0x07, // LD v1, 7
            0x12, 0x00, // JP 0x200
        ])
        .unwrap();

        vm.run_steps(3, &mut screen).unwrap();
        vm.set_key(KeyCode::Key2, true);
        assert_eq!(vm.registers.v(1), 7);

        vm.reset().unwrap();

        assert_eq!(vm.registers.pc, 0x200);
        assert_eq!(vm.registers.v(1), 0);
        assert_eq!(vm.stack.depth(), 0);
        assert_eq!(vm.wait_for_key, None);
        assert!(!vm.keyboard.is_pressed(2));
        assert_eq!(vm.memory.read(0x200), 0x61);

        // The reloaded program runs again.
        vm.step(&mut screen).unwrap();
        assert_eq!(vm.registers.v(1), 7);
    }

    #[test]
    fn test_dump_ram() {
        let mut vm = Vip8Vm::new(Vip8Conf::default());
        vm.load_rom(&[0x00, 0xE0, 0x12, 0x00]).unwrap();

        let dump = vm.dump_ram(4).unwrap();
        assert_eq!(dump, "0200: 00E0\n0202: 1200\n");
    }
}
