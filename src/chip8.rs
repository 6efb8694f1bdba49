use log::{debug, error, trace};
use rand::{SeedableRng, rngs::StdRng};

use crate::error::{Fault, FaultKind, LoadError};
use crate::instruction::{Flow, decode};
use crate::state::{
    Address, Chip8State, Framebuffer, Key, Memory, NUM_KEYS, Quirks, Register, Timer,
};

/// Where the VM is in its fetch/execute cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MachineState {
    /// The next `step` executes the opcode at PC.
    Ready,
    /// `LD Vx, K` is pending. `step` does nothing until a key goes down.
    AwaitingKey { register: Register },
    /// A fault stopped the program. `step` keeps returning it.
    Halted(Fault),
}

/// A CHIP-8 virtual machine.
///
/// The host drives it with `step` at whatever instruction rate it likes and
/// with `tick_timers` at 60 Hz, and updates the keypad between steps.
pub struct Chip8 {
    state: Chip8State,
    machine: MachineState,
    /// Keys held when the wait began (or at the last step). Only a key that
    /// goes from released to pressed satisfies `LD Vx, K`.
    held_at_wait: [bool; NUM_KEYS],
}

impl Default for Chip8 {
    fn default() -> Self {
        Self::new(Quirks::default())
    }
}

impl Chip8 {
    pub fn new(quirks: Quirks) -> Self {
        Self::from_state(Chip8State::with_entropy(quirks))
    }

    /// Builds a VM whose `RND` results are reproducible.
    pub fn with_seed(quirks: Quirks, seed: u64) -> Self {
        Self::from_state(Chip8State::new(quirks, StdRng::seed_from_u64(seed)))
    }

    fn from_state(state: Chip8State) -> Self {
        Chip8 {
            state,
            machine: MachineState::Ready,
            held_at_wait: [false; NUM_KEYS],
        }
    }

    /// Resets the machine and installs `rom` at 0x200. An oversized ROM leaves
    /// the VM exactly as it was.
    pub fn load(&mut self, rom: &[u8]) -> Result<(), LoadError> {
        let mut memory = Memory::new();
        memory.load_rom(rom)?;

        self.reset();
        self.state.memory = memory;
        debug!("loaded {} byte ROM", rom.len());
        Ok(())
    }

    pub fn reset(&mut self) {
        self.state.reset();
        self.machine = MachineState::Ready;
        self.held_at_wait = [false; NUM_KEYS];
        debug!("machine reset");
    }

    /// Executes at most one instruction.
    ///
    /// While waiting for a key this returns immediately, finishing the wait if
    /// a key has been pressed since. Once halted it returns the stored fault.
    pub fn step(&mut self) -> Result<(), Fault> {
        match self.machine {
            MachineState::Halted(fault) => Err(fault),
            MachineState::AwaitingKey { register } => {
                self.poll_key(register);
                Ok(())
            }
            MachineState::Ready => self.execute_next(),
        }
    }

    fn execute_next(&mut self) -> Result<(), Fault> {
        let pc = self.state.pc;

        let raw = match self.state.memory.read_word(usize::from(pc)) {
            Ok(raw) => raw,
            Err(kind) => return Err(self.halt(kind, pc, None)),
        };
        let instruction = match decode(raw) {
            Ok(instruction) => instruction,
            Err(kind) => return Err(self.halt(kind, pc, Some(raw))),
        };
        trace!("{pc:#05X}: {raw:04X}  {}", instruction.mnemonic());

        self.state.pc = pc.wrapping_add(2);
        match instruction.execute(&mut self.state) {
            Ok(Flow::Continue) => Ok(()),
            Ok(Flow::AwaitKey(register)) => {
                debug!("waiting for key into {register:?}");
                self.held_at_wait = self.state.keypad.snapshot();
                self.machine = MachineState::AwaitingKey { register };
                Ok(())
            }
            Err(kind) => {
                // Faults don't move PC off the instruction that raised them.
                self.state.pc = pc;
                Err(self.halt(kind, pc, Some(raw)))
            }
        }
    }

    fn poll_key(&mut self, register: Register) {
        let held = self.state.keypad.snapshot();
        let pressed = (0..NUM_KEYS).find(|&i| held[i] && !self.held_at_wait[i]);
        self.held_at_wait = held;

        if let Some(key) = pressed {
            debug!("key {key:X} satisfied wait");
            self.state.registers.write(register, key as u8);
            self.state.pc = self.state.pc.wrapping_add(2);
            self.machine = MachineState::Ready;
        }
    }

    fn halt(&mut self, kind: FaultKind, pc: Address, opcode: Option<u16>) -> Fault {
        let fault = Fault::new(kind, pc, opcode);
        error!("halted: {fault}");
        self.machine = MachineState::Halted(fault);
        fault
    }

    /// Advances both timers by one 60 Hz unit.
    pub fn tick_timers(&mut self) {
        self.state.delay_timer = self.state.delay_timer.saturating_sub(1);
        self.state.sound_timer = self.state.sound_timer.saturating_sub(1);
    }

    pub fn press_key(&mut self, key: Key) {
        self.state.keypad.press_key(key);
    }

    pub fn release_key(&mut self, key: Key) {
        self.state.keypad.release_key(key);
    }

    /// Replaces the whole keypad, indexed by key value.
    pub fn set_keys(&mut self, pressed: [bool; NUM_KEYS]) {
        self.state.keypad.set_all(pressed);
    }

    pub fn sound_active(&self) -> bool {
        self.state.sound_timer > 0
    }

    pub fn delay_timer(&self) -> Timer {
        self.state.delay_timer
    }

    pub fn sound_timer(&self) -> Timer {
        self.state.sound_timer
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.state.display
    }

    /// Reports whether the framebuffer changed since the last call.
    pub fn take_redraw(&mut self) -> bool {
        std::mem::take(&mut self.state.display_dirty)
    }

    pub fn machine_state(&self) -> MachineState {
        self.machine
    }

    pub fn fault(&self) -> Option<Fault> {
        match self.machine {
            MachineState::Halted(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.machine, MachineState::Halted(_))
    }

    pub fn register(&self, reg: Register) -> u8 {
        self.state.registers.read(reg)
    }

    pub fn pc(&self) -> Address {
        self.state.pc
    }

    pub fn index(&self) -> Address {
        self.state.index
    }

    pub fn quirks(&self) -> Quirks {
        self.state.quirks
    }

    /// Read-only view of the whole machine for debuggers.
    pub fn state(&self) -> &Chip8State {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{PC_START_ADDR, STACK_DEPTH};

    fn vm_with(rom: &[u8]) -> Chip8 {
        let mut vm = Chip8::with_seed(Quirks::default(), 7);
        vm.load(rom).unwrap();
        vm
    }

    #[test]
    fn load_leaves_vm_ready_at_start_address() {
        let vm = vm_with(&[0x60, 0x05]);
        assert_eq!(vm.pc(), PC_START_ADDR);
        assert_eq!(vm.machine_state(), MachineState::Ready);
        assert_eq!(vm.state().memory.read(0x200).unwrap(), 0x60);
    }

    #[test]
    fn load_resets_previous_run() {
        let mut vm = vm_with(&[0x6A, 0x33, 0xFA, 0x15, 0x00, 0xE0]);
        vm.step().unwrap();
        vm.step().unwrap();
        assert_eq!(vm.delay_timer(), 0x33);

        vm.load(&[0x12, 0x00]).unwrap();
        assert_eq!(vm.register(Register::VA), 0);
        assert_eq!(vm.delay_timer(), 0);
        assert_eq!(vm.state().memory.read(0x202).unwrap(), 0);
    }

    #[test]
    fn oversized_rom_keeps_prior_state() {
        let mut vm = vm_with(&[0x6A, 0x33]);
        vm.step().unwrap();

        let err = vm.load(&vec![0; 3585]).unwrap_err();
        assert_eq!(
            err,
            LoadError::RomTooLarge {
                size: 3585,
                max: 3584
            }
        );
        assert_eq!(vm.register(Register::VA), 0x33);
        assert_eq!(vm.pc(), 0x202);
    }

    #[test]
    fn illegal_opcode_halts_and_is_rereported() {
        let mut vm = vm_with(&[0x60, 0x01, 0xFF, 0xFF]);
        vm.step().unwrap();

        let fault = vm.step().unwrap_err();
        assert_eq!(fault, Fault::new(FaultKind::IllegalOpcode, 0x202, Some(0xFFFF)));
        assert!(vm.is_halted());
        assert_eq!(vm.fault(), Some(fault));

        assert_eq!(vm.step().unwrap_err(), fault);
        assert_eq!(vm.pc(), 0x202);
    }

    #[test]
    fn running_off_the_end_of_memory_faults() {
        // JP 0xFFF: only one byte of the next opcode is addressable.
        let mut vm = vm_with(&[0x1F, 0xFF]);
        vm.step().unwrap();
        let fault = vm.step().unwrap_err();
        assert_eq!(
            fault.kind,
            FaultKind::OutOfBoundsAccess { address: 0x1000 }
        );
        assert_eq!(fault.pc, 0xFFF);
        assert_eq!(fault.opcode, None);
    }

    #[test]
    fn seventeenth_nested_call_overflows() {
        // CALL 0x200 recurses onto itself.
        let mut vm = vm_with(&[0x22, 0x00]);
        for _ in 0..STACK_DEPTH {
            vm.step().unwrap();
        }
        assert_eq!(vm.state().stack.depth(), STACK_DEPTH);

        let fault = vm.step().unwrap_err();
        assert_eq!(fault.kind, FaultKind::StackOverflow);
        assert_eq!(fault.pc, 0x200);
        assert!(vm.is_halted());
    }

    #[test]
    fn wait_for_key_needs_a_fresh_press() {
        let mut vm = vm_with(&[0xF3, 0x0A]);
        vm.press_key(Key::Key2);
        vm.step().unwrap();
        assert_eq!(
            vm.machine_state(),
            MachineState::AwaitingKey {
                register: Register::V3
            }
        );

        // Key 2 was already down when the wait began.
        vm.step().unwrap();
        assert_eq!(vm.pc(), 0x200);

        vm.release_key(Key::Key2);
        vm.step().unwrap();
        vm.press_key(Key::Key2);
        vm.step().unwrap();
        assert_eq!(vm.register(Register::V3), 2);
        assert_eq!(vm.pc(), 0x202);
        assert_eq!(vm.machine_state(), MachineState::Ready);
    }

    #[test]
    fn timers_floor_at_zero() {
        let mut vm = vm_with(&[0x60, 0x02, 0xF0, 0x18]);
        vm.step().unwrap();
        vm.step().unwrap();
        assert!(vm.sound_active());

        vm.tick_timers();
        assert!(vm.sound_active());
        vm.tick_timers();
        assert!(!vm.sound_active());
        vm.tick_timers();
        assert_eq!(vm.sound_timer(), 0);
    }

    #[test]
    fn redraw_flag_is_consumed() {
        let mut vm = vm_with(&[0x00, 0xE0]);
        vm.take_redraw();
        vm.step().unwrap();
        assert!(vm.take_redraw());
        assert!(!vm.take_redraw());
    }

    #[test]
    fn reset_restores_baseline() {
        let mut vm = vm_with(&[0x00, 0xEE]);
        vm.step().unwrap_err();
        vm.reset();
        assert_eq!(vm.machine_state(), MachineState::Ready);
        assert_eq!(vm.pc(), PC_START_ADDR);
        assert_eq!(vm.state().memory.read(0x200).unwrap(), 0);
        assert!(vm.framebuffer().is_blank());
    }
}
