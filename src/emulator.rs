use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use crossterm::{
    event,
    terminal::{disable_raw_mode, enable_raw_mode},
};
use log::{info, warn};
use ratatui::{
    Terminal,
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    widgets::{Block, Borders, Paragraph},
};
use rodio::{OutputStream, Sink, Source, source::SineWave};

use chip8_vm::chip8::{Chip8, MachineState};
use chip8_vm::state::{DISPLAY_HEIGHT, DISPLAY_WIDTH, Framebuffer, Key, NUM_KEYS, Quirks};

const DEFAULT_FREQUENCY: f32 = 440.0;

pub struct Settings {
    pub frame_rate: u64,
    pub ips: u64,
    pub rom: PathBuf,
    pub quirks: Quirks,
    pub seed: Option<u64>,
}

pub struct Beep {
    sink: Sink,
    #[allow(dead_code)]
    stream: OutputStream,
}

impl Beep {
    pub fn new(freq: f32) -> anyhow::Result<Self> {
        let (stream, stream_handle) = OutputStream::try_default()?;
        let sink = Sink::try_new(&stream_handle)?;
        let source = SineWave::new(freq).repeat_infinite();

        sink.append(source);
        sink.pause();

        Ok(Self { sink, stream })
    }

    pub fn on(&mut self) {
        self.sink.play();
    }

    pub fn off(&mut self) {
        self.sink.pause();
    }
}

/// Maps the left-hand 4x4 block of a QWERTY keyboard onto the hex keypad:
///
/// ```text
/// 1 2 3 4    1 2 3 C
/// Q W E R    4 5 6 D
/// A S D F    7 8 9 E
/// Z X C V    A 0 B F
/// ```
fn map_key(key: rdev::Key) -> Option<Key> {
    use rdev::Key as Physical;

    match key {
        Physical::Num1 => Some(Key::Key1),
        Physical::Num2 => Some(Key::Key2),
        Physical::Num3 => Some(Key::Key3),
        Physical::Num4 => Some(Key::KeyC),
        Physical::KeyQ => Some(Key::Key4),
        Physical::KeyW => Some(Key::Key5),
        Physical::KeyE => Some(Key::Key6),
        Physical::KeyR => Some(Key::KeyD),
        Physical::KeyA => Some(Key::Key7),
        Physical::KeyS => Some(Key::Key8),
        Physical::KeyD => Some(Key::Key9),
        Physical::KeyF => Some(Key::KeyE),
        Physical::KeyZ => Some(Key::KeyA),
        Physical::KeyX => Some(Key::Key0),
        Physical::KeyC => Some(Key::KeyB),
        Physical::KeyV => Some(Key::KeyF),
        _ => None,
    }
}

/// Key state written by the `rdev` listener thread and read once per frame.
#[derive(Clone, Default)]
struct SharedKeys {
    pressed: Arc<Mutex<[bool; NUM_KEYS]>>,
    escape: Arc<AtomicBool>,
}

impl SharedKeys {
    fn listen(&self) {
        let keys = self.clone();
        std::thread::spawn(move || {
            let result = rdev::listen(move |event| match event.event_type {
                rdev::EventType::KeyPress(rdev::Key::Escape) => {
                    keys.escape.store(true, Ordering::Relaxed);
                }
                rdev::EventType::KeyPress(physical) => keys.set(physical, true),
                rdev::EventType::KeyRelease(physical) => keys.set(physical, false),
                _ => {}
            });
            if let Err(err) = result {
                warn!("keyboard listener stopped: {err:?}");
            }
        });
    }

    fn set(&self, physical: rdev::Key, pressed: bool) {
        if let Some(key) = map_key(physical) {
            let mut keys = self.pressed.lock().unwrap_or_else(PoisonError::into_inner);
            keys[usize::from(key.index())] = pressed;
        }
    }

    fn snapshot(&self) -> [bool; NUM_KEYS] {
        *self.pressed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn escape_pressed(&self) -> bool {
        self.escape.load(Ordering::Relaxed)
    }
}

fn render_screen(framebuffer: &Framebuffer) -> String {
    let mut screen = String::with_capacity(DISPLAY_WIDTH * DISPLAY_HEIGHT + DISPLAY_HEIGHT);
    for y in 0..DISPLAY_HEIGHT {
        for x in 0..DISPLAY_WIDTH {
            screen.push(if framebuffer.pixel(x, y) { '█' } else { ' ' });
        }
        screen.push('\n');
    }
    screen
}

pub struct Emulator {
    vm: Chip8,
    /// Text rendering of the framebuffer, rebuilt only when the VM redraws.
    screen: String,
    settings: Settings,
    beeper: Beep,
    keys: SharedKeys,
}

impl Emulator {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let vm = match settings.seed {
            Some(seed) => Chip8::with_seed(settings.quirks, seed),
            None => Chip8::new(settings.quirks),
        };

        Ok(Emulator {
            screen: render_screen(vm.framebuffer()),
            vm,
            settings,
            beeper: Beep::new(DEFAULT_FREQUENCY)?,
            keys: SharedKeys::default(),
        })
    }

    fn draw(&self, frame: &mut ratatui::Frame, area: Rect, rom_name: &str) {
        // Exact size of the 64x32 display plus borders
        let game_width = (DISPLAY_WIDTH as u16) + 2;
        let game_height = (DISPLAY_HEIGHT as u16) + 2;

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(game_height),
                Constraint::Length(7),
                Constraint::Min(0),
            ])
            .split(area);

        let game_area = if chunks[0].width > game_width {
            let horizontal_chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([
                    Constraint::Min(0),
                    Constraint::Length(game_width),
                    Constraint::Min(0),
                ])
                .split(chunks[0]);
            horizontal_chunks[1]
        } else {
            chunks[0]
        };

        let game_paragraph = Paragraph::new(self.screen.as_str())
            .block(Block::default().borders(Borders::ALL).title(rom_name))
            .style(Style::default().fg(Color::White));
        frame.render_widget(game_paragraph, game_area);

        let lower = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[1]);

        let key_mapping = "Key Mapping:\n\
    1 2 3 4    →    1 2 3 C\n\
    Q W E R    →    4 5 6 D\n\
    A S D F    →    7 8 9 E\n\
    Z X C V    →    A 0 B F";
        let key_paragraph = Paragraph::new(key_mapping)
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL).title("Keypad"))
            .style(Style::default().fg(Color::Yellow));
        frame.render_widget(key_paragraph, lower[0]);

        let (status, color) = match self.vm.machine_state() {
            MachineState::Ready => ("Running".to_string(), Color::Green),
            MachineState::AwaitingKey { register } => {
                (format!("Waiting for key -> {register:?}"), Color::Cyan)
            }
            MachineState::Halted(fault) => {
                let opcode = fault
                    .opcode
                    .map(|op| format!("\nOpcode {op:#06X}"))
                    .unwrap_or_default();
                (format!("Halted: {fault}{opcode}"), Color::Red)
            }
        };
        let status = format!(
            "{status}\nPC {:#05X}  I {:#05X}\nDT {:3}  ST {:3}\nEsc to quit",
            self.vm.pc(),
            self.vm.index(),
            self.vm.delay_timer(),
            self.vm.sound_timer()
        );
        let status_paragraph = Paragraph::new(status)
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL).title("Status"))
            .style(Style::default().fg(color));
        frame.render_widget(status_paragraph, lower[1]);
    }

    /// One 60 Hz frame: timers tick once, then a frame's worth of instructions run.
    fn run_frame(&mut self, instructions_per_frame: u64) {
        self.vm.set_keys(self.keys.snapshot());
        self.vm.tick_timers();

        if self.vm.sound_active() {
            self.beeper.on();
        } else {
            self.beeper.off();
        }

        for _ in 0..instructions_per_frame {
            // Faults are kept by the VM and shown in the status panel.
            if self.vm.step().is_err() {
                self.beeper.off();
                break;
            }
        }

        if self.vm.take_redraw() {
            self.screen = render_screen(self.vm.framebuffer());
        }
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        let frame_duration = Duration::from_secs_f64(1.0 / self.settings.frame_rate as f64);
        let instructions_per_frame = (self.settings.ips / self.settings.frame_rate).max(1);
        let rom_stem: String = self
            .settings
            .rom
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Unknown ROM".to_string());
        let rom_data = std::fs::read(&self.settings.rom)
            .with_context(|| format!("failed to read ROM {}", self.settings.rom.display()))?;

        self.vm.load(&rom_data)?;
        info!(
            "running {rom_stem} at {} instructions per frame",
            instructions_per_frame
        );
        self.keys.listen();

        enable_raw_mode()?;
        let stdout = std::io::stdout();
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        'mainloop: loop {
            let frame_start = Instant::now();

            if self.keys.escape_pressed() {
                terminal.clear()?;
                break 'mainloop;
            }

            // Consume and discard any crossterm events to prevent echoing
            while event::poll(Duration::ZERO)? {
                let _ = event::read()?;
            }

            self.run_frame(instructions_per_frame);
            terminal.draw(|frame| {
                let area = frame.area();
                self.draw(frame, area, &rom_stem);
            })?;

            let elapsed = frame_start.elapsed();
            if elapsed < frame_duration {
                std::thread::sleep(frame_duration - elapsed);
            }
        }
        disable_raw_mode()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_layout_covers_every_key_once() {
        let physical = [
            rdev::Key::Num1,
            rdev::Key::Num2,
            rdev::Key::Num3,
            rdev::Key::Num4,
            rdev::Key::KeyQ,
            rdev::Key::KeyW,
            rdev::Key::KeyE,
            rdev::Key::KeyR,
            rdev::Key::KeyA,
            rdev::Key::KeyS,
            rdev::Key::KeyD,
            rdev::Key::KeyF,
            rdev::Key::KeyZ,
            rdev::Key::KeyX,
            rdev::Key::KeyC,
            rdev::Key::KeyV,
        ];
        let mut seen = [false; NUM_KEYS];
        for key in physical {
            let mapped = map_key(key).expect("mapped key");
            assert!(!seen[usize::from(mapped.index())]);
            seen[usize::from(mapped.index())] = true;
        }
        assert!(seen.iter().all(|&s| s));
        assert_eq!(map_key(rdev::Key::KeyP), None);
    }

    #[test]
    fn shared_keys_record_transitions() {
        let keys = SharedKeys::default();
        keys.set(rdev::Key::KeyX, true);
        keys.set(rdev::Key::KeyV, true);
        keys.set(rdev::Key::KeyV, false);
        let snapshot = keys.snapshot();
        assert!(snapshot[0x0]);
        assert!(!snapshot[0xF]);
        assert!(!keys.escape_pressed());
    }

    #[test]
    fn screen_text_has_one_line_per_row() {
        let mut framebuffer = Framebuffer::new();
        framebuffer.draw_sprite(0, 0, &[0x80]);
        let screen = render_screen(&framebuffer);
        let rows: Vec<&str> = screen.lines().collect();
        assert_eq!(rows.len(), DISPLAY_HEIGHT);
        assert!(rows[0].starts_with('█'));
        assert_eq!(rows[1].chars().count(), DISPLAY_WIDTH);
        assert!(rows[1].chars().all(|c| c == ' '));
    }
}
