//! Input relay boundary.
//!
//! Key and pointer events from the primary session are turned into USB HID
//! boot-protocol reports and written to the gadget's keyboard and mouse
//! nodes. The host sees a plain USB keyboard and an absolute pointer.
//!
//! ## Keyboard report (8 bytes)
//!
//! ```text
//! [0]     modifier bits (L-Ctrl 0x01, L-Shift 0x02, L-Alt 0x04, L-GUI 0x08,
//!                        R-Ctrl 0x10, R-Shift 0x20, R-Alt 0x40, R-GUI 0x80)
//! [1]     reserved
//! [2..8]  up to six pressed usage codes
//! ```
//!
//! ## Pointer report (6 bytes)
//!
//! ```text
//! [0]     buttons (bit0 left, bit1 right, bit2 middle)
//! [1..3]  x, 0..=32767, little-endian
//! [3..5]  y, 0..=32767, little-endian
//! [5]     wheel, +1 / -1
//! ```

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::{debug, trace, warn};

pub const KEYBOARD_REPORT_LEN: usize = 8;
pub const POINTER_REPORT_LEN: usize = 6;

/// Attempts per report while the gadget answers `EAGAIN`.
const WRITE_RETRIES: u32 = 5;

pub const DEFAULT_KEYBOARD_NODE: &str = "/dev/hidg0";
pub const DEFAULT_POINTER_NODE: &str = "/dev/hidg1";

// ── InputRelay ───────────────────────────────────────────────────

/// Destination for the primary session's input events.
pub trait InputRelay: Send {
    /// Called when the first session arrives.
    fn connect(&mut self) -> io::Result<()>;

    /// Called when the last session leaves.
    fn disconnect(&mut self);

    fn key_event(&mut self, down: bool, keysym: u32) -> io::Result<()>;

    /// `width`/`height` are the current frame dimensions.
    fn pointer_event(
        &mut self,
        buttons: u8,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    ) -> io::Result<()>;
}

/// Relay that discards everything.
#[derive(Debug, Default)]
pub struct NullInput;

impl InputRelay for NullInput {
    fn connect(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn key_event(&mut self, _down: bool, _keysym: u32) -> io::Result<()> {
        Ok(())
    }

    fn pointer_event(&mut self, _: u8, _: u16, _: u16, _: u16, _: u16) -> io::Result<()> {
        Ok(())
    }
}

// ── Keysym table ─────────────────────────────────────────────────

mod keysym {
    pub const SHIFT_L: u32 = 0xffe1;
    pub const SHIFT_R: u32 = 0xffe2;
    pub const CONTROL_L: u32 = 0xffe3;
    pub const CONTROL_R: u32 = 0xffe4;
    pub const CAPS_LOCK: u32 = 0xffe5;
    pub const ALT_L: u32 = 0xffe9;
    pub const ALT_R: u32 = 0xffea;
    pub const SUPER_L: u32 = 0xffeb;
    pub const SUPER_R: u32 = 0xffec;
    pub const HYPER_R: u32 = 0xffee;
}

/// X keysym → HID usage code. Lower-case letters are folded to upper case
/// before lookup.
fn usage_for(keysym: u32) -> Option<u8> {
    let code = match keysym {
        // A..Z
        0x41..=0x5a => 0x04 + (keysym - 0x41) as u8,
        // 1..9, 0
        0x31..=0x39 => 0x1e + (keysym - 0x31) as u8,
        0x30 => 0x27,
        // shifted digits: ! @ # $ % ^ & * ( )
        0x21 => 0x1e,
        0x40 => 0x1f,
        0x23 => 0x20,
        0x24 => 0x21,
        0x25 => 0x22,
        0x5e => 0x23,
        0x26 => 0x24,
        0x2a => 0x25,
        0x28 => 0x26,
        0x29 => 0x27,
        // punctuation, both shift levels
        0x3a | 0x3b => 0x33,
        0x27 | 0x22 => 0x34,
        0x2c | 0x3c => 0x36,
        0x2f | 0x3f => 0x38,
        0x2e | 0x3e => 0x37,
        0x5c | 0x7c => 0x31,
        0x5b | 0x7b => 0x2f,
        0x5d | 0x7d => 0x30,
        0x2d | 0x5f => 0x2d,
        0x3d | 0x2b => 0x2e,
        0x20 => 0x2c,
        0x60 | 0x7e => 0x35,
        // F1..F12
        0xffbe..=0xffc9 => 0x3a + (keysym - 0xffbe) as u8,
        0xff0d => 0x28, // Return
        0xff08 => 0x2a, // BackSpace
        0xff1b => 0x29, // Escape
        0xff50 => 0x4a, // Home
        0xff57 => 0x4d, // End
        0xff63 => 0x49, // Insert
        0xffff => 0x4c, // Delete
        0xff09 => 0x2b, // Tab
        keysym::CAPS_LOCK => 0x39,
        keysym::SHIFT_L => 0xe1,
        keysym::SHIFT_R => 0xe5,
        keysym::ALT_L => 0xe2,
        keysym::ALT_R => 0xe6,
        keysym::CONTROL_L => 0xe0,
        keysym::CONTROL_R => 0xe4,
        keysym::SUPER_L => 0x08,
        keysym::SUPER_R => 0x80,
        0xff61 => 0x46, // Print
        0xff52 => 0x52, // Up
        0xff51 => 0x50, // Left
        0xff54 => 0x51, // Down
        0xff53 => 0x4f, // Right
        0xff55 => 0x4b, // Prior
        0xff56 => 0x4e, // Next
        0xff7f => 0x53, // Num_Lock
        0xff14 => 0x47, // Scroll_Lock
        0xff13 => 0x48, // Pause
        // keypad digits
        0xffb1..=0xffb9 => 0x59 + (keysym - 0xffb1) as u8,
        0xffb0 => 0x62,
        0xff9e => 0x62, // KP_Insert
        0xff9c => 0x59, // KP_End
        0xff99 => 0x5a, // KP_Down
        0xff9b => 0x5b, // KP_Page_Down
        0xff96 => 0x5c, // KP_Left
        0xff98 => 0x5e, // KP_Right
        0xff95 => 0x5f, // KP_Home
        0xff97 => 0x60, // KP_Up
        0xff9a => 0x61, // KP_Page_Up
        0xffad => 0x56, // KP_Subtract
        0xffab => 0x57, // KP_Add
        0xff8d => 0x58, // KP_Enter
        0xff9f | 0xffae => 0x63,
        0xffbd => 0x67, // KP_Equal
        0xffaa => 0x55, // KP_Multiply
        0xffaf => 0x54, // KP_Divide
        0xff67 => 0x65, // Menu
        _ => return None,
    };
    Some(code)
}

fn modifier_bit(keysym: u32) -> u8 {
    match keysym {
        keysym::CONTROL_L => 0x01,
        keysym::SHIFT_L => 0x02,
        keysym::ALT_L => 0x04,
        keysym::SUPER_L => 0x08,
        keysym::CONTROL_R => 0x10,
        keysym::SHIFT_R => 0x20,
        keysym::ALT_R => 0x40,
        keysym::SUPER_R => 0x80,
        _ => 0,
    }
}

/// Keys that occupy one of the six report slots. Modifiers only set bits.
fn takes_slot(keysym: u32) -> bool {
    keysym < keysym::SHIFT_L || keysym > keysym::HYPER_R || keysym == keysym::CAPS_LOCK
}

// ── KeyboardState ────────────────────────────────────────────────

/// Pressed-key state behind the keyboard report.
#[derive(Debug, Clone, Default)]
pub struct KeyboardState {
    report: [u8; KEYBOARD_REPORT_LEN],
    last_keysym: Option<u32>,
    released_since: bool,
}

impl KeyboardState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> [u8; KEYBOARD_REPORT_LEN] {
        self.report
    }

    /// Apply one key event and return the report to send, if any.
    ///
    /// Client auto-repeat (a second press of the same key with no release
    /// in between) and unmapped keysyms produce nothing.
    pub fn key(&mut self, down: bool, keysym: u32) -> Option<[u8; KEYBOARD_REPORT_LEN]> {
        if keysym == 0 {
            return None;
        }
        if down {
            let repeat = self.last_keysym == Some(keysym) && !self.released_since;
            self.released_since = false;
            self.last_keysym = Some(keysym);
            if repeat {
                return None;
            }
        } else {
            self.released_since = true;
            self.last_keysym = Some(keysym);
        }

        let keysym = if (0x61..=0x7a).contains(&keysym) {
            keysym - 0x20
        } else {
            keysym
        };
        let code = usage_for(keysym)?;

        let bit = modifier_bit(keysym);
        if down {
            self.report[0] |= bit;
        } else {
            self.report[0] &= !bit;
        }

        if takes_slot(keysym) {
            let slots = &mut self.report[2..];
            if down {
                if let Some(slot) = slots.iter_mut().find(|s| **s == 0) {
                    *slot = code;
                }
            } else if let Some(slot) = slots.iter_mut().find(|s| **s == code) {
                *slot = 0;
            }
        }
        Some(self.report)
    }

    /// Release everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Build an absolute pointer report.
///
/// Coordinates outside the frame leave the axis at zero.
pub fn pointer_report(
    buttons: u8,
    x: u16,
    y: u16,
    width: u16,
    height: u16,
) -> [u8; POINTER_REPORT_LEN] {
    let mut report = [0u8; POINTER_REPORT_LEN];
    // RFB: 1 left, 2 middle, 4 right; HID: 1 left, 2 right, 4 middle
    report[0] = ((buttons & 0x4) >> 1) | ((buttons & 0x2) << 1) | (buttons & 0x1);

    let scale = |v: u16, extent: u16| (u32::from(v) * 32768 / u32::from(extent)) as u16;
    if x < width {
        report[1..3].copy_from_slice(&scale(x, width).to_le_bytes());
    }
    if y < height {
        report[3..5].copy_from_slice(&scale(y, height).to_le_bytes());
    }
    report[5] = match buttons {
        8 => 1,
        16 => 0xff,
        _ => 0,
    };
    report
}

/// Write one report, retrying while the gadget is busy.
fn write_report(out: &mut dyn Write, report: &[u8]) -> io::Result<()> {
    let mut last = None;
    for _ in 0..WRITE_RETRIES {
        match out.write(report) {
            Ok(n) if n == report.len() => return Ok(()),
            Ok(n) => last = Some(io::Error::new(io::ErrorKind::WriteZero, format!("short write: {n}"))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => last = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| io::Error::from(io::ErrorKind::WouldBlock)))
}

// ── HidInput ─────────────────────────────────────────────────────

type ReportWriter = Box<dyn Write + Send>;

/// USB HID gadget relay.
pub struct HidInput {
    keyboard_node: PathBuf,
    pointer_node: PathBuf,
    keyboard: Option<ReportWriter>,
    pointer: Option<ReportWriter>,
    state: KeyboardState,
}

impl HidInput {
    /// Relay writing to the given gadget nodes, opened on [`connect`](InputRelay::connect).
    pub fn new(keyboard_node: impl Into<PathBuf>, pointer_node: impl Into<PathBuf>) -> Self {
        Self {
            keyboard_node: keyboard_node.into(),
            pointer_node: pointer_node.into(),
            keyboard: None,
            pointer: None,
            state: KeyboardState::new(),
        }
    }

    /// Relay over already-open writers.
    pub fn with_writers(keyboard: ReportWriter, pointer: ReportWriter) -> Self {
        Self {
            keyboard: Some(keyboard),
            pointer: Some(pointer),
            ..Self::new(DEFAULT_KEYBOARD_NODE, DEFAULT_POINTER_NODE)
        }
    }

    pub fn is_connected(&self) -> bool {
        self.keyboard.is_some() && self.pointer.is_some()
    }

    fn open(path: &PathBuf) -> io::Result<ReportWriter> {
        let mut opts = OpenOptions::new();
        opts.write(true);
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits());
        }
        Ok(Box::new(opts.open(path)?))
    }
}

impl Default for HidInput {
    fn default() -> Self {
        Self::new(DEFAULT_KEYBOARD_NODE, DEFAULT_POINTER_NODE)
    }
}

impl InputRelay for HidInput {
    fn connect(&mut self) -> io::Result<()> {
        if self.keyboard.is_none() {
            self.keyboard = Some(Self::open(&self.keyboard_node)?);
        }
        if self.pointer.is_none() {
            self.pointer = Some(Self::open(&self.pointer_node)?);
        }
        debug!(keyboard = %self.keyboard_node.display(), pointer = %self.pointer_node.display(), "HID relay connected");
        Ok(())
    }

    fn disconnect(&mut self) {
        // let go of anything still held before dropping the nodes
        if let Some(kbd) = self.keyboard.as_deref_mut()
            && let Err(e) = write_report(kbd, &[0u8; KEYBOARD_REPORT_LEN])
        {
            warn!(error = %e, "failed to release keys");
        }
        self.state.clear();
        self.keyboard = None;
        self.pointer = None;
        debug!("HID relay disconnected");
    }

    fn key_event(&mut self, down: bool, keysym: u32) -> io::Result<()> {
        let Some(report) = self.state.key(down, keysym) else {
            trace!(keysym, down, "key ignored");
            return Ok(());
        };
        match self.keyboard.as_deref_mut() {
            Some(kbd) => write_report(kbd, &report),
            None => Ok(()),
        }
    }

    fn pointer_event(
        &mut self,
        buttons: u8,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    ) -> io::Result<()> {
        let report = pointer_report(buttons, x, y, width, height);
        match self.pointer.as_deref_mut() {
            Some(ptr) => write_report(ptr, &report),
            None => Ok(()),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture {
        reports: Arc<Mutex<Vec<Vec<u8>>>>,
        busy_for: Arc<Mutex<u32>>,
    }

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut busy = self.busy_for.lock().unwrap();
            if *busy > 0 {
                *busy -= 1;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.reports.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn letter_fills_first_slot() {
        let mut kb = KeyboardState::new();
        let r = kb.key(true, 'a' as u32).unwrap();
        assert_eq!(r, [0, 0, 0x04, 0, 0, 0, 0, 0]);
        let r = kb.key(false, 'a' as u32).unwrap();
        assert_eq!(r, [0; 8]);
    }

    #[test]
    fn shift_sets_modifier_only() {
        let mut kb = KeyboardState::new();
        let r = kb.key(true, keysym::SHIFT_L).unwrap();
        assert_eq!(r, [0x02, 0, 0, 0, 0, 0, 0, 0]);
        let r = kb.key(true, 'A' as u32).unwrap();
        assert_eq!(r, [0x02, 0, 0x04, 0, 0, 0, 0, 0]);
        let r = kb.key(false, keysym::SHIFT_L).unwrap();
        assert_eq!(r[0], 0);
    }

    #[test]
    fn caps_lock_takes_a_slot() {
        let mut kb = KeyboardState::new();
        let r = kb.key(true, keysym::CAPS_LOCK).unwrap();
        assert_eq!(r[2], 0x39);
    }

    #[test]
    fn auto_repeat_is_dropped() {
        let mut kb = KeyboardState::new();
        assert!(kb.key(true, 'x' as u32).is_some());
        assert!(kb.key(true, 'x' as u32).is_none());
        assert!(kb.key(false, 'x' as u32).is_some());
        assert!(kb.key(true, 'x' as u32).is_some());
    }

    #[test]
    fn unmapped_keysym_ignored() {
        let mut kb = KeyboardState::new();
        assert!(kb.key(true, 0x1008_ff13).is_none());
        assert!(kb.key(true, 0).is_none());
    }

    #[test]
    fn shifted_punctuation_maps_to_base_key() {
        assert_eq!(usage_for('!' as u32), Some(0x1e));
        assert_eq!(usage_for('?' as u32), Some(0x38));
        assert_eq!(usage_for('~' as u32), Some(0x35));
        assert_eq!(usage_for(0xffc9), Some(0x45)); // F12
    }

    #[test]
    fn pointer_scaling_and_buttons() {
        let r = pointer_report(0b001, 512, 384, 1024, 768);
        assert_eq!(r[0], 0x01);
        assert_eq!(u16::from_le_bytes([r[1], r[2]]), 16384);
        assert_eq!(u16::from_le_bytes([r[3], r[4]]), 16384);

        // middle and right swap
        assert_eq!(pointer_report(0b010, 0, 0, 10, 10)[0], 0b100);
        assert_eq!(pointer_report(0b100, 0, 0, 10, 10)[0], 0b010);
    }

    #[test]
    fn pointer_wheel_and_out_of_range() {
        let r = pointer_report(8, 2000, 10, 1024, 768);
        assert_eq!(r[5], 1);
        assert_eq!(&r[1..3], &[0, 0]);
        assert_eq!(pointer_report(16, 0, 0, 10, 10)[5], 0xff);
    }

    #[test]
    fn hid_relay_retries_busy_gadget() {
        let kbd = Capture::default();
        *kbd.busy_for.lock().unwrap() = 3;
        let mut relay = HidInput::with_writers(Box::new(kbd.clone()), Box::new(Capture::default()));
        relay.key_event(true, 'q' as u32).unwrap();
        assert_eq!(kbd.reports.lock().unwrap().len(), 1);

        *kbd.busy_for.lock().unwrap() = 10;
        assert!(relay.key_event(false, 'q' as u32).is_err());
    }

    #[test]
    fn disconnect_releases_keys() {
        let kbd = Capture::default();
        let mut relay = HidInput::with_writers(Box::new(kbd.clone()), Box::new(Capture::default()));
        relay.key_event(true, 'q' as u32).unwrap();
        relay.disconnect();
        let reports = kbd.reports.lock().unwrap();
        assert_eq!(reports.last().unwrap(), &vec![0u8; 8]);
        assert!(!relay.is_connected());
    }
}
