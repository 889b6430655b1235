//! Terminal buffer: a bounded raw-byte ring paired with a best-effort
//! rendered line grid, fed by a VT parser.
//!
//! This is the one piece of the session backend with no direct teacher
//! analogue (the teacher never renders an xterm-compatible grid); it is
//! grounded on the `vte`-driven terminal-session pattern used elsewhere in
//! the retrieval pack, scaled down to line-oriented rendering since the
//! control plane only ever needs "what did the agent print", not a faithful
//! cursor-addressable screen.

use std::collections::VecDeque;
use std::sync::Mutex;

use vte::{Params, Parser, Perform};

/// Hard cap on raw scrollback bytes retained per session (10 MiB default).
pub const DEFAULT_MAX_RAW_BYTES: usize = 10 * 1024 * 1024;

/// Hard cap on rendered scrollback lines retained per session, independent
/// of raw byte accounting (a line-oriented analogue of the same bound).
const MAX_RENDERED_LINES: usize = 20_000;

struct GridPerformer {
    cols: usize,
    current_line: String,
    lines: VecDeque<String>,
}

impl GridPerformer {
    fn new(cols: usize) -> Self {
        Self {
            cols: cols.max(1),
            current_line: String::new(),
            lines: VecDeque::new(),
        }
    }

    fn push_line(&mut self) {
        let line = std::mem::take(&mut self.current_line);
        self.lines.push_back(line);
        while self.lines.len() > MAX_RENDERED_LINES {
            self.lines.pop_front();
        }
    }

    fn newline(&mut self) {
        self.push_line();
    }

    fn carriage_return(&mut self) {
        self.current_line.clear();
    }

    fn backspace(&mut self) {
        self.current_line.pop();
    }

    fn tab(&mut self) {
        let next_stop = ((self.current_line.chars().count() / 8) + 1) * 8;
        while self.current_line.chars().count() < next_stop.min(self.cols) {
            self.current_line.push(' ');
        }
    }
}

impl Perform for GridPerformer {
    fn print(&mut self, c: char) {
        if self.current_line.chars().count() >= self.cols {
            self.push_line();
        }
        self.current_line.push(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => self.newline(),
            b'\r' => self.carriage_return(),
            b'\t' => self.tab(),
            0x08 => self.backspace(),
            _ => {}
        }
    }

    // CSI/OSC/ESC sequences (cursor movement, color, titles, …) are consumed
    // by the parser but do not affect the line-oriented rendering; the raw
    // history preserves them for faithful replay via `getHistoryAsString`.
    fn csi_dispatch(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}
    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}
    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}

struct Inner {
    parser: Parser,
    performer: GridPerformer,
    raw: VecDeque<u8>,
    max_raw_bytes: usize,
    rows: u16,
    cols: u16,
}

/// A fixed-geometry terminal emulator state plus a bounded raw-byte history.
///
/// Invariant: `raw.len() <= max_raw_bytes`; excess is dropped from the head,
/// at a line boundary when one exists within the overflow, to avoid
/// truncating mid-escape-sequence where practical.
pub struct TerminalBuffer {
    inner: Mutex<Inner>,
}

impl TerminalBuffer {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self::with_max_bytes(rows, cols, DEFAULT_MAX_RAW_BYTES)
    }

    pub fn with_max_bytes(rows: u16, cols: u16, max_raw_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                parser: Parser::new(),
                performer: GridPerformer::new(cols as usize),
                raw: VecDeque::new(),
                max_raw_bytes,
                rows,
                cols,
            }),
        }
    }

    /// Append bytes produced by the child process.
    pub fn write(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.raw.extend(bytes.iter().copied());

        if inner.raw.len() > inner.max_raw_bytes {
            let overflow = inner.raw.len() - inner.max_raw_bytes;
            let drop_to = inner
                .raw
                .iter()
                .enumerate()
                .skip(overflow)
                .find(|(_, &b)| b == b'\n')
                .map(|(i, _)| i + 1)
                .unwrap_or(overflow);
            inner.raw.drain(..drop_to);
        }

        let Inner {
            parser, performer, ..
        } = &mut *inner;
        parser.advance(performer, bytes);
    }

    /// Last `n` rendered lines, newline-joined (includes the in-progress
    /// line if non-empty).
    pub fn get_content(&self, n: usize) -> String {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<&str> = inner.performer.lines.iter().map(String::as_str).collect();
        if !inner.performer.current_line.is_empty() {
            all.push(&inner.performer.current_line);
        }
        let start = all.len().saturating_sub(n);
        all[start..].join("\n")
    }

    /// Entire rendered region (viewport + off-screen scrollback).
    pub fn get_all_content(&self) -> String {
        self.get_content(usize::MAX)
    }

    /// Raw bytes including escape sequences, for faithful replay.
    pub fn get_history_as_string(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let bytes: Vec<u8> = inner.raw.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn raw_len(&self) -> usize {
        self.inner.lock().unwrap().raw.len()
    }

    /// Reflow to a new geometry. Existing rendered lines are preserved
    /// best-effort (no re-wrap of already-completed lines); the column width
    /// used for future wrapping is updated immediately.
    pub fn resize(&self, cols: u16, rows: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.cols = cols;
        inner.rows = rows;
        inner.performer.cols = cols.max(1) as usize;
    }

    pub fn geometry(&self) -> (u16, u16) {
        let inner = self.inner.lock().unwrap();
        (inner.rows, inner.cols)
    }

    /// Release the emulator state and raw history.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.raw.clear();
        inner.performer.lines.clear();
        inner.performer.current_line.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_newline_separated_lines() {
        let buf = TerminalBuffer::new(24, 80);
        buf.write(b"hello\nworld\n");
        assert_eq!(buf.get_content(10), "hello\nworld\n");
    }

    #[test]
    fn in_progress_line_is_visible() {
        let buf = TerminalBuffer::new(24, 80);
        buf.write(b"partial");
        assert_eq!(buf.get_content(10), "partial");
    }

    #[test]
    fn get_content_returns_only_last_n_lines() {
        let buf = TerminalBuffer::new(24, 80);
        buf.write(b"a\nb\nc\nd\n");
        assert_eq!(buf.get_content(2), "c\nd");
    }

    #[test]
    fn raw_history_survives_escape_sequences() {
        let buf = TerminalBuffer::new(24, 80);
        buf.write(b"\x1b[31mred\x1b[0m\n");
        assert!(buf.get_history_as_string().contains("\x1b[31m"));
        assert_eq!(buf.get_content(1), "red");
    }

    #[test]
    fn raw_history_is_bounded() {
        let buf = TerminalBuffer::with_max_bytes(24, 80, 16);
        buf.write(b"0123456789\n0123456789\n");
        assert!(buf.raw_len() <= 16);
    }

    #[test]
    fn dispose_clears_state() {
        let buf = TerminalBuffer::new(24, 80);
        buf.write(b"hello\n");
        buf.dispose();
        assert_eq!(buf.get_all_content(), "");
        assert_eq!(buf.raw_len(), 0);
    }
}
