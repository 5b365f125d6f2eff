//! The seam between the engine and whatever owns the terminal. The command
//! layer never prints or reads directly; it goes through the `Console`
//! trait, so the interactive line editor, colors and masked password entry
//! stay outside the crate.

use std::collections::VecDeque;

/// Rendering hints; how they map to escape codes (or nothing) is the
/// console's business.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ColorCode {
    Input,
    Output,
    Value,
    /// A revealed secret value; consoles typically box or invert it.
    SecretValue,
    Error,
}

pub trait Console {
    /// Reads one line; `masked` asks for no-echo password entry.
    fn read_line(&mut self, masked: bool) -> String;

    fn print(&mut self, text: &str);

    fn print_color(&mut self, code: ColorCode);

    /// Installs a new prompt for the next read.
    fn prompt_set(&mut self, prompt: &str);
}

/// A console fed from a prepared input script, recording everything
/// printed. Drives the command layer in tests and in non-interactive
/// embeddings.
pub struct ScriptedConsole {
    inputs: VecDeque<String>,
    pub output: String,
    pub prompt: String,
}

impl ScriptedConsole {
    pub fn new(inputs: &[&str]) -> ScriptedConsole {
        ScriptedConsole {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            output: String::new(),
            prompt: String::new(),
        }
    }

    /// Lines not consumed by the dialogue.
    pub fn remaining_inputs(&self) -> usize {
        self.inputs.len()
    }
}

impl Console for ScriptedConsole {
    fn read_line(&mut self, _masked: bool) -> String {
        self.inputs.pop_front().unwrap_or_default()
    }

    fn print(&mut self, text: &str) {
        self.output.push_str(text);
    }

    fn print_color(&mut self, _code: ColorCode) {}

    fn prompt_set(&mut self, prompt: &str) {
        self.prompt = prompt.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_console_replays_inputs() {
        let mut console = ScriptedConsole::new(&["first", "second"]);
        assert_eq!(console.read_line(false), "first");
        assert_eq!(console.read_line(true), "second");
        assert_eq!(console.read_line(false), "");
        console.print("hello ");
        console.print("world");
        assert_eq!(console.output, "hello world");
        console.prompt_set("db# ");
        assert_eq!(console.prompt, "db# ");
    }
}
