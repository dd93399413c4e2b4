//! Console output surface.

use std::{
    io::{self, Write},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crossterm::{
    queue,
    style::{Color, Print, ResetColor, SetForegroundColor},
    tty::IsTty,
};
use runbox_core::{Terminal, traits::TerminalStyle};
use tracing::debug;

/// Writes program output to one stream and errors to another.
///
/// Output is append-only, so `reset` has nothing to clear.
pub struct ConsoleTerminal<O, E> {
    out: Mutex<O>,
    err: Mutex<E>,
    color: bool,
}

impl ConsoleTerminal<io::Stdout, io::Stderr> {
    /// Stdout for output, stderr for errors, colored when stderr is a tty.
    #[must_use]
    pub fn stdio() -> Self {
        let err = io::stderr();
        let color = err.is_tty();
        Self::new(io::stdout(), err, color)
    }
}

impl<O: Write, E: Write> ConsoleTerminal<O, E> {
    pub const fn new(out: O, err: E, color: bool) -> Self {
        Self {
            out: Mutex::new(out),
            err: Mutex::new(err),
            color,
        }
    }

    pub fn into_parts(self) -> (O, E) {
        (
            self.out.into_inner().unwrap_or_else(PoisonError::into_inner),
            self.err.into_inner().unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn write_error(&self, text: &str) -> io::Result<()> {
        let mut err = lock(&self.err);
        if self.color {
            queue!(err, SetForegroundColor(Color::Red), Print(text), ResetColor)?;
        } else {
            err.write_all(text.as_bytes())?;
        }
        err.flush()
    }
}

fn lock<W>(writer: &Mutex<W>) -> MutexGuard<'_, W> {
    writer.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<O, E> Terminal for ConsoleTerminal<O, E>
where
    O: Write + Send,
    E: Write + Send,
{
    fn write(&self, text: &str) {
        let mut out = lock(&self.out);
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
            debug!(error = %e, "failed to write output");
        }
    }

    fn write_styled(&self, text: &str, style: TerminalStyle) {
        match style {
            TerminalStyle::Error => {
                if let Err(e) = self.write_error(text) {
                    debug!(error = %e, "failed to write error output");
                }
            }
        }
    }

    fn reset(&self) {}
}
