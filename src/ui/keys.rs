//! Host key events to guest input bytes
//!
//! xterm encoding in normal cursor mode; modifiers use the `1;<mod>` form.

use bitflags::bitflags;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const ALT   = 0b0010;
        const CTRL  = 0b0100;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut out = Modifiers::empty();
        out.set(Modifiers::SHIFT, mods.contains(KeyModifiers::SHIFT));
        out.set(Modifiers::ALT, mods.contains(KeyModifiers::ALT));
        out.set(Modifiers::CTRL, mods.contains(KeyModifiers::CONTROL));
        out
    }
}

impl Modifiers {
    /// xterm parameter: 1 + shift + 2*alt + 4*ctrl
    fn param(self) -> u8 {
        1 + self.bits()
    }
}

/// Bytes a terminal would send for `event`; None for releases and keys
/// without an encoding
pub fn encode_key(event: &KeyEvent) -> Option<Vec<u8>> {
    if event.kind == KeyEventKind::Release {
        return None;
    }
    let mods = Modifiers::from(event.modifiers);
    let bytes = match event.code {
        KeyCode::Char(ch) => encode_char(ch, mods),
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Tab => vec![b'\t'],
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Backspace if mods.contains(Modifiers::ALT) => vec![0x1b, 0x7f],
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Esc => vec![0x1b],
        KeyCode::Up => cursor_key(b'A', mods),
        KeyCode::Down => cursor_key(b'B', mods),
        KeyCode::Right => cursor_key(b'C', mods),
        KeyCode::Left => cursor_key(b'D', mods),
        KeyCode::Home => cursor_key(b'H', mods),
        KeyCode::End => cursor_key(b'F', mods),
        KeyCode::Insert => tilde_key(2, mods),
        KeyCode::Delete => tilde_key(3, mods),
        KeyCode::PageUp => tilde_key(5, mods),
        KeyCode::PageDown => tilde_key(6, mods),
        KeyCode::F(n) => function_key(n, mods)?,
        _ => return None,
    };
    Some(bytes)
}

fn encode_char(ch: char, mods: Modifiers) -> Vec<u8> {
    if mods.contains(Modifiers::CTRL) {
        if let Some(code) = control_code(ch) {
            return if mods.contains(Modifiers::ALT) {
                vec![0x1b, code]
            } else {
                vec![code]
            };
        }
    }
    let mut buf = [0u8; 4];
    let text = ch.encode_utf8(&mut buf).as_bytes();
    if mods.contains(Modifiers::ALT) {
        let mut out = Vec::with_capacity(text.len() + 1);
        out.push(0x1b);
        out.extend_from_slice(text);
        out
    } else {
        text.to_vec()
    }
}

fn control_code(ch: char) -> Option<u8> {
    match ch {
        'a'..='z' => Some(ch as u8 - b'a' + 1),
        'A'..='Z' => Some(ch as u8 - b'A' + 1),
        '@' | '`' | ' ' | '2' => Some(0x00),
        '[' | '3' => Some(0x1b),
        '\\' | '4' => Some(0x1c),
        ']' | '5' => Some(0x1d),
        '^' | '~' | '6' => Some(0x1e),
        '_' | '?' | '7' => Some(0x1f),
        _ => None,
    }
}

fn cursor_key(key: u8, mods: Modifiers) -> Vec<u8> {
    if mods.is_empty() {
        vec![0x1b, b'[', key]
    } else {
        format!("\x1b[1;{}{}", mods.param(), key as char).into_bytes()
    }
}

fn tilde_key(code: u8, mods: Modifiers) -> Vec<u8> {
    if mods.is_empty() {
        format!("\x1b[{}~", code).into_bytes()
    } else {
        format!("\x1b[{};{}~", code, mods.param()).into_bytes()
    }
}

fn function_key(n: u8, mods: Modifiers) -> Option<Vec<u8>> {
    // F1-F4 are SS3 finals, the rest tilde codes
    let code = match n {
        1..=4 => {
            let key = b"PQRS"[n as usize - 1];
            return Some(if mods.is_empty() {
                vec![0x1b, b'O', key]
            } else {
                format!("\x1b[1;{}{}", mods.param(), key as char).into_bytes()
            });
        }
        5 => 15,
        6..=10 => n + 11,
        11 | 12 => n + 12,
        _ => return None,
    };
    Some(tilde_key(code, mods))
}
