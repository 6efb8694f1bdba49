use bitvec::{BitArr, array::BitArray};
use rand::{SeedableRng, rngs::StdRng};

use crate::error::{FaultKind, LoadError};

pub type Timer = u8;
pub type Address = u16;

pub const MEM_SIZE: usize = 4096;
pub const FONT_ADDR: Address = 0x50;
pub const FONT_HEIGHT: usize = 5;
pub const PC_START_ADDR: Address = 0x200;
pub const MAX_ROM_SIZE: usize = MEM_SIZE - PC_START_ADDR as usize;
pub const INDEX_MASK: Address = 0x0FFF;
pub const NUM_REGISTERS: usize = 16;
pub const NUM_KEYS: usize = 16;
pub const STACK_DEPTH: usize = 16;
pub const DISPLAY_WIDTH: usize = 64;
pub const DISPLAY_HEIGHT: usize = 32;
pub const DEFAULT_FRAME_RATE: u64 = 60;
pub const DEFAULT_INSTRUCTIONS_PER_SECOND: u64 = 700;

const FONT_DATA: [u8; 16 * FONT_HEIGHT] = [
    0xF0, 0x90, 0x90, 0x90, 0xF0, // 0
    0x20, 0x60, 0x20, 0x20, 0x70, // 1
    0xF0, 0x10, 0xF0, 0x80, 0xF0, // 2
    0xF0, 0x10, 0xF0, 0x10, 0xF0, // 3
    0x90, 0x90, 0xF0, 0x10, 0x10, // 4
    0xF0, 0x80, 0xF0, 0x10, 0xF0, // 5
    0xF0, 0x80, 0xF0, 0x90, 0xF0, // 6
    0xF0, 0x10, 0x20, 0x40, 0x40, // 7
    0xF0, 0x90, 0xF0, 0x90, 0xF0, // 8
    0xF0, 0x90, 0xF0, 0x10, 0xF0, // 9
    0xF0, 0x90, 0xF0, 0x90, 0x90, // A
    0xE0, 0x90, 0xE0, 0x90, 0xE0, // B
    0xF0, 0x80, 0x80, 0x80, 0xF0, // C
    0xE0, 0x90, 0x90, 0x90, 0xE0, // D
    0xF0, 0x80, 0xF0, 0x80, 0xF0, // E
    0xF0, 0x80, 0xF0, 0x80, 0x80, // F
];

/// The 4 KiB address space. Glyphs for the hex digits sit at `FONT_ADDR`.
#[derive(Clone)]
pub struct Memory {
    data: [u8; MEM_SIZE],
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    pub fn new() -> Self {
        let data = {
            let mut data = [0; MEM_SIZE];
            let font_start = usize::from(FONT_ADDR);
            data[font_start..font_start + FONT_DATA.len()].copy_from_slice(&FONT_DATA);
            data
        };

        Memory { data }
    }

    pub fn read(&self, addr: usize) -> Result<u8, FaultKind> {
        self.data
            .get(addr)
            .copied()
            .ok_or(FaultKind::OutOfBoundsAccess { address: addr })
    }

    pub fn write(&mut self, addr: usize, value: u8) -> Result<(), FaultKind> {
        let cell = self
            .data
            .get_mut(addr)
            .ok_or(FaultKind::OutOfBoundsAccess { address: addr })?;
        *cell = value;
        Ok(())
    }

    /// Reads a big-endian instruction word.
    pub fn read_word(&self, addr: usize) -> Result<u16, FaultKind> {
        let high = u16::from(self.read(addr)?);
        let low = u16::from(self.read(addr + 1)?);
        Ok((high << 8) | low)
    }

    /// Borrows `len` bytes starting at `addr`. The whole range must be in bounds.
    pub fn slice(&self, addr: usize, len: usize) -> Result<&[u8], FaultKind> {
        let end = addr + len;
        if end > MEM_SIZE {
            return Err(FaultKind::OutOfBoundsAccess {
                address: end - 1,
            });
        }
        Ok(&self.data[addr..end])
    }

    pub fn slice_mut(&mut self, addr: usize, len: usize) -> Result<&mut [u8], FaultKind> {
        let end = addr + len;
        if end > MEM_SIZE {
            return Err(FaultKind::OutOfBoundsAccess {
                address: end - 1,
            });
        }
        Ok(&mut self.data[addr..end])
    }

    pub fn load_rom(&mut self, rom: &[u8]) -> Result<(), LoadError> {
        if rom.len() > MAX_ROM_SIZE {
            return Err(LoadError::RomTooLarge {
                size: rom.len(),
                max: MAX_ROM_SIZE,
            });
        }
        let start = usize::from(PC_START_ADDR);
        self.data[start..start + rom.len()].copy_from_slice(rom);
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Register {
    V0,
    V1,
    V2,
    V3,
    V4,
    V5,
    V6,
    V7,
    V8,
    V9,
    VA,
    VB,
    VC,
    VD,
    VE,
    VF,
}

impl Register {
    const ALL: [Register; NUM_REGISTERS] = [
        Register::V0,
        Register::V1,
        Register::V2,
        Register::V3,
        Register::V4,
        Register::V5,
        Register::V6,
        Register::V7,
        Register::V8,
        Register::V9,
        Register::VA,
        Register::VB,
        Register::VC,
        Register::VD,
        Register::VE,
        Register::VF,
    ];

    /// Only the low nibble of `value` selects the register.
    pub fn from_index(value: usize) -> Self {
        Self::ALL[value & 0x0F]
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// V0..VF. VF is an ordinary slot that flag-producing instructions overwrite.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterBank {
    registers: [u8; NUM_REGISTERS],
}

impl RegisterBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, reg: Register) -> u8 {
        self.registers[reg.index()]
    }

    pub fn write(&mut self, reg: Register, value: u8) {
        self.registers[reg.index()] = value;
    }

    pub fn as_slice(&self) -> &[u8; NUM_REGISTERS] {
        &self.registers
    }
}

/// Return addresses for `CALL`/`RET`, bounded at `STACK_DEPTH` entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallStack {
    frames: Vec<Address>,
}

impl CallStack {
    pub fn new() -> Self {
        CallStack {
            frames: Vec::with_capacity(STACK_DEPTH),
        }
    }

    pub fn push(&mut self, addr: Address) -> Result<(), FaultKind> {
        if self.frames.len() >= STACK_DEPTH {
            return Err(FaultKind::StackOverflow);
        }
        self.frames.push(addr);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Address, FaultKind> {
        self.frames.pop().ok_or(FaultKind::StackUnderflow)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[Address] {
        &self.frames
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Key {
    Key0,
    Key1,
    Key2,
    Key3,
    Key4,
    Key5,
    Key6,
    Key7,
    Key8,
    Key9,
    KeyA,
    KeyB,
    KeyC,
    KeyD,
    KeyE,
    KeyF,
}

impl Key {
    const ALL: [Key; NUM_KEYS] = [
        Key::Key0,
        Key::Key1,
        Key::Key2,
        Key::Key3,
        Key::Key4,
        Key::Key5,
        Key::Key6,
        Key::Key7,
        Key::Key8,
        Key::Key9,
        Key::KeyA,
        Key::KeyB,
        Key::KeyC,
        Key::KeyD,
        Key::KeyE,
        Key::KeyF,
    ];

    pub fn from_index(index: u8) -> Option<Key> {
        Self::ALL.get(usize::from(index)).copied()
    }

    /// Names a key by the low nibble of a register value.
    pub fn from_nibble(value: u8) -> Key {
        Self::ALL[usize::from(value & 0x0F)]
    }

    pub fn index(self) -> u8 {
        self as u8
    }
}

/// Pressed/released state of the 16 logical keys. Only the host writes it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Keypad {
    pressed: [bool; NUM_KEYS],
}

impl Keypad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press_key(&mut self, key: Key) {
        self.pressed[usize::from(key.index())] = true;
    }

    pub fn release_key(&mut self, key: Key) {
        self.pressed[usize::from(key.index())] = false;
    }

    pub fn set_all(&mut self, pressed: [bool; NUM_KEYS]) {
        self.pressed = pressed;
    }

    pub fn is_key_pressed(&self, key: Key) -> bool {
        self.pressed[usize::from(key.index())]
    }

    pub fn snapshot(&self) -> [bool; NUM_KEYS] {
        self.pressed
    }
}

/// 64x32 monochrome pixels, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Framebuffer {
    pixels: BitArr!(for DISPLAY_WIDTH * DISPLAY_HEIGHT),
}

impl Default for Framebuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framebuffer {
    pub fn new() -> Self {
        Framebuffer {
            pixels: BitArray::ZERO,
        }
    }

    pub fn clear(&mut self) {
        self.pixels.fill(false);
    }

    /// Coordinates wrap on both axes.
    pub fn pixel(&self, x: usize, y: usize) -> bool {
        self.pixels[Self::offset(x, y)]
    }

    pub fn is_blank(&self) -> bool {
        self.pixels.not_any()
    }

    pub fn lit_count(&self) -> usize {
        self.pixels.count_ones()
    }

    /// XORs `sprite` onto the buffer with its top-left corner at `(x, y)`.
    /// Returns true if any lit pixel was turned off.
    pub fn draw_sprite(&mut self, x: usize, y: usize, sprite: &[u8]) -> bool {
        let mut collision = false;

        for (row, &byte) in sprite.iter().enumerate() {
            for bit in 0..8 {
                if (byte >> (7 - bit)) & 1 == 0 {
                    continue;
                }

                let index = Self::offset(x + bit, y + row);
                let current_pixel = self.pixels[index];
                if current_pixel {
                    collision = true;
                }
                self.pixels.set(index, !current_pixel);
            }
        }
        collision
    }

    fn offset(x: usize, y: usize) -> usize {
        (y % DISPLAY_HEIGHT) * DISPLAY_WIDTH + (x % DISPLAY_WIDTH)
    }
}

/// Interpreter compatibility switches. The default is the COSMAC VIP reading.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Quirks {
    /// `8xy6`/`8xyE` shift `Vy` into `Vx` instead of shifting `Vx` in place.
    pub shift_uses_vy: bool,
    /// `Fx55`/`Fx65` leave `I` pointing past the last register transferred.
    pub load_store_increments_index: bool,
    /// `8xy1`/`8xy2`/`8xy3` clear VF.
    pub logic_resets_vf: bool,
}

pub struct Chip8State {
    pub quirks: Quirks,
    pub memory: Memory,
    pub registers: RegisterBank,
    pub pc: Address,
    pub index: Address,
    pub stack: CallStack,
    pub delay_timer: Timer,
    pub sound_timer: Timer,
    pub display: Framebuffer,
    pub display_dirty: bool,
    pub keypad: Keypad,
    pub rng: StdRng,
}

impl Chip8State {
    pub fn new(quirks: Quirks, rng: StdRng) -> Self {
        Chip8State {
            quirks,
            memory: Memory::new(),
            registers: RegisterBank::new(),
            pc: PC_START_ADDR,
            index: 0,
            stack: CallStack::new(),
            delay_timer: 0,
            sound_timer: 0,
            display: Framebuffer::new(),
            display_dirty: false,
            keypad: Keypad::new(),
            rng,
        }
    }

    pub fn with_entropy(quirks: Quirks) -> Self {
        Self::new(quirks, StdRng::from_os_rng())
    }

    /// Returns everything except quirks, keypad and the random source to the
    /// power-on baseline.
    pub fn reset(&mut self) {
        self.memory = Memory::new();
        self.registers = RegisterBank::new();
        self.pc = PC_START_ADDR;
        self.index = 0;
        self.stack = CallStack::new();
        self.delay_timer = 0;
        self.sound_timer = 0;
        self.display.clear();
        self.display_dirty = true;
    }

    pub fn set_index(&mut self, value: Address) {
        self.index = value & INDEX_MASK;
    }

    pub fn clear_display(&mut self) {
        self.display.clear();
        self.display_dirty = true;
    }

    pub fn draw_sprite(&mut self, x: u8, y: u8, rows: u8) -> Result<bool, FaultKind> {
        let sprite = self
            .memory
            .slice(usize::from(self.index), usize::from(rows))?;
        let collision = self
            .display
            .draw_sprite(usize::from(x), usize::from(y), sprite);
        self.display_dirty = true;
        Ok(collision)
    }
}
