use rand::Rng;

use crate::error::FaultKind;
use crate::state::{Address, Chip8State, FONT_ADDR, FONT_HEIGHT, Key, Register};

/// What the VM does after an instruction has run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Execution is suspended until a key goes down; its value lands in the register.
    AwaitKey(Register),
}

/// One decoded CHIP-8 instruction.
///
/// `execute` runs with `state.pc` already pointing at the following instruction.
pub trait Instruction {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind>;
    fn mnemonic(&self) -> String;
}

pub fn decode(raw: u16) -> Result<Box<dyn Instruction>, FaultKind> {
    let decoded = DecodedInstruction::new(raw);

    match decoded.opcode {
        0x0 => match decoded.nnn {
            0x0E0 => Ok(Box::new(ClearScreen)),
            0x0EE => Ok(Box::new(SubroutineReturn)),
            _ => Ok(Box::new(MachineRoutine(decoded))),
        },
        0x1 => Ok(Box::new(Jump(decoded))),
        0x2 => Ok(Box::new(SubroutineCall(decoded))),
        0x3 => Ok(Box::new(SkipEqX(decoded))),
        0x4 => Ok(Box::new(SkipNeqX(decoded))),
        0x5 if decoded.n == 0 => Ok(Box::new(SkipXEqY(decoded))),
        0x6 => Ok(Box::new(SetImmediate(decoded))),
        0x7 => Ok(Box::new(Add(decoded))),
        0x8 => match decoded.n {
            0x0 => Ok(Box::new(SetXToY(decoded))),
            0x1 => Ok(Box::new(BinaryOr(decoded))),
            0x2 => Ok(Box::new(BinaryAnd(decoded))),
            0x3 => Ok(Box::new(LogicalXor(decoded))),
            0x4 => Ok(Box::new(BinaryAdd(decoded))),
            0x5 => Ok(Box::new(SubtractYFromX(decoded))),
            0x6 => Ok(Box::new(RightShift(decoded))),
            0x7 => Ok(Box::new(SubtractXFromY(decoded))),
            0xE => Ok(Box::new(LeftShift(decoded))),
            _ => Err(FaultKind::IllegalOpcode),
        },
        0x9 if decoded.n == 0 => Ok(Box::new(SkipXNeqY(decoded))),
        0xA => Ok(Box::new(SetIndex(decoded))),
        0xB => Ok(Box::new(JumpWithOffset(decoded))),
        0xC => Ok(Box::new(Random(decoded))),
        0xD => Ok(Box::new(Draw(decoded))),
        0xE => match decoded.nn {
            0x9E => Ok(Box::new(SkipIfKeyPressed(decoded))),
            0xA1 => Ok(Box::new(SkipIfKeyNotPressed(decoded))),
            _ => Err(FaultKind::IllegalOpcode),
        },
        0xF => match decoded.nn {
            0x07 => Ok(Box::new(SetVxFromTimer(decoded))),
            0x0A => Ok(Box::new(GetKey(decoded))),
            0x15 => Ok(Box::new(SetDelayTimer(decoded))),
            0x18 => Ok(Box::new(SetSoundTimer(decoded))),
            0x1E => Ok(Box::new(AddToIndex(decoded))),
            0x29 => Ok(Box::new(FontChar(decoded))),
            0x33 => Ok(Box::new(BinaryCodedDecimal(decoded))),
            0x55 => Ok(Box::new(Store(decoded))),
            0x65 => Ok(Box::new(Load(decoded))),
            _ => Err(FaultKind::IllegalOpcode),
        },
        _ => Err(FaultKind::IllegalOpcode),
    }
}

/// Renders `raw` in assembler syntax. Words that don't decode come out as data.
pub fn disassemble(raw: u16) -> String {
    decode(raw)
        .map(|instruction| instruction.mnemonic())
        .unwrap_or_else(|_| format!("DW {raw:#06X}"))
}

struct DecodedInstruction {
    /// First nibble. Selects the instruction family.
    opcode: u8,
    /// Second nibble. Used to look up one of the 16 registers.
    x: Register,
    /// Third nibble. Used to look up one of the 16 registers.
    y: Register,
    /// Fourth nibble. A 4-bit number.
    n: u8,
    /// The second byte (third and fourth nibbles). An 8-bit immediate number.
    nn: u8,
    /// The second, third, and fourth nibbles. A 12-bit immediate address.
    nnn: Address,
}

impl DecodedInstruction {
    fn new(raw: u16) -> Self {
        DecodedInstruction {
            opcode: (raw >> 12) as u8,
            x: Register::from_index(usize::from((raw >> 8) & 0x0F)),
            y: Register::from_index(usize::from((raw >> 4) & 0x0F)),
            n: (raw & 0x0F) as u8,
            nn: (raw & 0x00FF) as u8,
            nnn: raw & 0x0FFF,
        }
    }
}

fn skip_next(state: &mut Chip8State) {
    state.pc = state.pc.wrapping_add(2);
}

struct ClearScreen;
impl Instruction for ClearScreen {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        state.clear_display();
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        "CLS".to_string()
    }
}

struct SubroutineReturn;
impl Instruction for SubroutineReturn {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        state.pc = state.stack.pop()?;
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        "RET".to_string()
    }
}

/// `0nnn`: a call into COSMAC machine code. There is no 1802 to run it, so it is ignored.
struct MachineRoutine(DecodedInstruction);
impl Instruction for MachineRoutine {
    fn execute(&self, _state: &mut Chip8State) -> Result<Flow, FaultKind> {
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("SYS {:#05X}", self.0.nnn)
    }
}

struct Jump(DecodedInstruction);
impl Instruction for Jump {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        state.pc = self.0.nnn;
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("JP {:#05X}", self.0.nnn)
    }
}

struct SubroutineCall(DecodedInstruction);
impl Instruction for SubroutineCall {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        state.stack.push(state.pc)?;
        state.pc = self.0.nnn;
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("CALL {:#05X}", self.0.nnn)
    }
}

struct SkipEqX(DecodedInstruction);
impl Instruction for SkipEqX {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        if state.registers.read(self.0.x) == self.0.nn {
            skip_next(state);
        }
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("SE {:?}, {:#04X}", self.0.x, self.0.nn)
    }
}

struct SkipNeqX(DecodedInstruction);
impl Instruction for SkipNeqX {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        if state.registers.read(self.0.x) != self.0.nn {
            skip_next(state);
        }
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("SNE {:?}, {:#04X}", self.0.x, self.0.nn)
    }
}

struct SkipXEqY(DecodedInstruction);
impl Instruction for SkipXEqY {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        if state.registers.read(self.0.x) == state.registers.read(self.0.y) {
            skip_next(state);
        }
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("SE {:?}, {:?}", self.0.x, self.0.y)
    }
}

struct SkipXNeqY(DecodedInstruction);
impl Instruction for SkipXNeqY {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        if state.registers.read(self.0.x) != state.registers.read(self.0.y) {
            skip_next(state);
        }
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("SNE {:?}, {:?}", self.0.x, self.0.y)
    }
}

struct SetImmediate(DecodedInstruction);
impl Instruction for SetImmediate {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        state.registers.write(self.0.x, self.0.nn);
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("LD {:?}, {:#04X}", self.0.x, self.0.nn)
    }
}

/// `7xkk` wraps without touching VF.
struct Add(DecodedInstruction);
impl Instruction for Add {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let value_x = state.registers.read(self.0.x);
        state
            .registers
            .write(self.0.x, value_x.wrapping_add(self.0.nn));
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("ADD {:?}, {:#04X}", self.0.x, self.0.nn)
    }
}

struct SetXToY(DecodedInstruction);
impl Instruction for SetXToY {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let value_y = state.registers.read(self.0.y);
        state.registers.write(self.0.x, value_y);
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("LD {:?}, {:?}", self.0.x, self.0.y)
    }
}

fn logic_op(
    decoded: &DecodedInstruction,
    state: &mut Chip8State,
    op: impl Fn(u8, u8) -> u8,
) -> Result<Flow, FaultKind> {
    let value_x = state.registers.read(decoded.x);
    let value_y = state.registers.read(decoded.y);

    state.registers.write(decoded.x, op(value_x, value_y));
    if state.quirks.logic_resets_vf {
        state.registers.write(Register::VF, 0);
    }
    Ok(Flow::Continue)
}

struct BinaryOr(DecodedInstruction);
impl Instruction for BinaryOr {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        logic_op(&self.0, state, |x, y| x | y)
    }

    fn mnemonic(&self) -> String {
        format!("OR {:?}, {:?}", self.0.x, self.0.y)
    }
}

struct BinaryAnd(DecodedInstruction);
impl Instruction for BinaryAnd {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        logic_op(&self.0, state, |x, y| x & y)
    }

    fn mnemonic(&self) -> String {
        format!("AND {:?}, {:?}", self.0.x, self.0.y)
    }
}

struct LogicalXor(DecodedInstruction);
impl Instruction for LogicalXor {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        logic_op(&self.0, state, |x, y| x ^ y)
    }

    fn mnemonic(&self) -> String {
        format!("XOR {:?}, {:?}", self.0.x, self.0.y)
    }
}

// The flag-producing ALU ops write the result first and VF last, so with x == F
// the flag is what survives.

struct BinaryAdd(DecodedInstruction);
impl Instruction for BinaryAdd {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let value_x = state.registers.read(self.0.x);
        let value_y = state.registers.read(self.0.y);
        let (sum, carry) = value_x.overflowing_add(value_y);

        state.registers.write(self.0.x, sum);
        state.registers.write(Register::VF, u8::from(carry));
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("ADD {:?}, {:?}", self.0.x, self.0.y)
    }
}

/// VF = NOT borrow.
struct SubtractYFromX(DecodedInstruction);
impl Instruction for SubtractYFromX {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let value_x = state.registers.read(self.0.x);
        let value_y = state.registers.read(self.0.y);

        state.registers.write(self.0.x, value_x.wrapping_sub(value_y));
        state
            .registers
            .write(Register::VF, u8::from(value_x >= value_y));
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("SUB {:?}, {:?}", self.0.x, self.0.y)
    }
}

/// VF = NOT borrow.
struct SubtractXFromY(DecodedInstruction);
impl Instruction for SubtractXFromY {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let value_x = state.registers.read(self.0.x);
        let value_y = state.registers.read(self.0.y);

        state.registers.write(self.0.x, value_y.wrapping_sub(value_x));
        state
            .registers
            .write(Register::VF, u8::from(value_y >= value_x));
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("SUBN {:?}, {:?}", self.0.x, self.0.y)
    }
}

fn shift_source(decoded: &DecodedInstruction, state: &Chip8State) -> u8 {
    if state.quirks.shift_uses_vy {
        state.registers.read(decoded.y)
    } else {
        state.registers.read(decoded.x)
    }
}

struct RightShift(DecodedInstruction);
impl Instruction for RightShift {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let value = shift_source(&self.0, state);

        state.registers.write(self.0.x, value >> 1);
        state.registers.write(Register::VF, value & 0x01);
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("SHR {:?}, {:?}", self.0.x, self.0.y)
    }
}

struct LeftShift(DecodedInstruction);
impl Instruction for LeftShift {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let value = shift_source(&self.0, state);

        state.registers.write(self.0.x, value << 1);
        state.registers.write(Register::VF, value >> 7);
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("SHL {:?}, {:?}", self.0.x, self.0.y)
    }
}

struct SetIndex(DecodedInstruction);
impl Instruction for SetIndex {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        state.set_index(self.0.nnn);
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("LD I, {:#05X}", self.0.nnn)
    }
}

/// The target may lie past the end of memory; the next fetch faults in that case.
struct JumpWithOffset(DecodedInstruction);
impl Instruction for JumpWithOffset {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        state.pc = Address::from(state.registers.read(Register::V0)) + self.0.nnn;
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("JP V0, {:#05X}", self.0.nnn)
    }
}

struct Random(DecodedInstruction);
impl Instruction for Random {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let random_value = state.rng.random::<u8>() & self.0.nn;
        state.registers.write(self.0.x, random_value);
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("RND {:?}, {:#04X}", self.0.x, self.0.nn)
    }
}

struct Draw(DecodedInstruction);
impl Instruction for Draw {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let x = state.registers.read(self.0.x);
        let y = state.registers.read(self.0.y);

        let collision = state.draw_sprite(x, y, self.0.n)?;
        state.registers.write(Register::VF, u8::from(collision));
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("DRW {:?}, {:?}, {:#03X}", self.0.x, self.0.y, self.0.n)
    }
}

struct SkipIfKeyPressed(DecodedInstruction);
impl Instruction for SkipIfKeyPressed {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let key = Key::from_nibble(state.registers.read(self.0.x));
        if state.keypad.is_key_pressed(key) {
            skip_next(state);
        }
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("SKP {:?}", self.0.x)
    }
}

struct SkipIfKeyNotPressed(DecodedInstruction);
impl Instruction for SkipIfKeyNotPressed {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let key = Key::from_nibble(state.registers.read(self.0.x));
        if !state.keypad.is_key_pressed(key) {
            skip_next(state);
        }
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("SKNP {:?}", self.0.x)
    }
}

struct SetVxFromTimer(DecodedInstruction);
impl Instruction for SetVxFromTimer {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        state.registers.write(self.0.x, state.delay_timer);
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("LD {:?}, DT", self.0.x)
    }
}

/// Leaves PC on itself; the VM finishes the instruction once a key goes down.
struct GetKey(DecodedInstruction);
impl Instruction for GetKey {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        state.pc = state.pc.wrapping_sub(2);
        Ok(Flow::AwaitKey(self.0.x))
    }

    fn mnemonic(&self) -> String {
        format!("LD {:?}, K", self.0.x)
    }
}

struct SetDelayTimer(DecodedInstruction);
impl Instruction for SetDelayTimer {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        state.delay_timer = state.registers.read(self.0.x);
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("LD DT, {:?}", self.0.x)
    }
}

struct SetSoundTimer(DecodedInstruction);
impl Instruction for SetSoundTimer {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        state.sound_timer = state.registers.read(self.0.x);
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("LD ST, {:?}", self.0.x)
    }
}

struct AddToIndex(DecodedInstruction);
impl Instruction for AddToIndex {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let value_x = state.registers.read(self.0.x);
        state.set_index(state.index.wrapping_add(Address::from(value_x)));
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("ADD I, {:?}", self.0.x)
    }
}

struct FontChar(DecodedInstruction);
impl Instruction for FontChar {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let digit = Address::from(state.registers.read(self.0.x) & 0x0F);
        state.set_index(FONT_ADDR + digit * FONT_HEIGHT as Address);
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("LD F, {:?}", self.0.x)
    }
}

struct BinaryCodedDecimal(DecodedInstruction);
impl Instruction for BinaryCodedDecimal {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let value_x = state.registers.read(self.0.x);
        let bcd = [value_x / 100, (value_x / 10) % 10, value_x % 10];
        state
            .memory
            .slice_mut(usize::from(state.index), bcd.len())?
            .copy_from_slice(&bcd);
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("LD B, {:?}", self.0.x)
    }
}

/// V0..=Vx as a count of bytes.
fn register_span(decoded: &DecodedInstruction) -> usize {
    decoded.x.index() + 1
}

fn advance_index_after_transfer(state: &mut Chip8State, span: usize) {
    if state.quirks.load_store_increments_index {
        state.set_index(state.index.wrapping_add(span as Address));
    }
}

struct Store(DecodedInstruction);
impl Instruction for Store {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let span = register_span(&self.0);
        let values = &state.registers.as_slice()[..span];
        state
            .memory
            .slice_mut(usize::from(state.index), span)?
            .copy_from_slice(values);
        advance_index_after_transfer(state, span);
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("LD [I], {:?}", self.0.x)
    }
}

struct Load(DecodedInstruction);
impl Instruction for Load {
    fn execute(&self, state: &mut Chip8State) -> Result<Flow, FaultKind> {
        let span = register_span(&self.0);
        let values = state.memory.slice(usize::from(state.index), span)?;
        for (i, &value) in values.iter().enumerate() {
            state.registers.write(Register::from_index(i), value);
        }
        advance_index_after_transfer(state, span);
        Ok(Flow::Continue)
    }

    fn mnemonic(&self) -> String {
        format!("LD {:?}, [I]", self.0.x)
    }
}
