use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, IsTerminal, Write};

use crate::error::{GenesisError, Result};

/// Single sink for every interactive question the engine asks. Callers pass
/// one implementation per [`crate::context::Context`]; tests use
/// [`ScriptedPrompter`].
pub trait Prompter {
    /// Yes/no confirmation. Only a literal `yes`/`y` answer confirms.
    fn confirm(&self, message: &str) -> Result<bool>;

    /// Pick one entry out of `options`, returning its index.
    fn select(&self, message: &str, options: &[String]) -> Result<usize>;
}

/// Prompter bound to the controlling terminal. Refuses to ask anything when
/// stdin is not a TTY so that scripted runs fail with a remedial hint
/// instead of hanging.
pub struct TerminalPrompter;

impl TerminalPrompter {
    fn ensure_tty(&self) -> Result<()> {
        if io::stdin().is_terminal() {
            Ok(())
        } else {
            Err(GenesisError::Prompt(
                "no controlling terminal; re-run with --no-prompt or --yes".into(),
            ))
        }
    }

    fn read_line(&self) -> Result<String> {
        let mut buf = String::new();
        io::stdin().read_line(&mut buf)?;
        Ok(buf.trim().to_string())
    }
}

impl Prompter for TerminalPrompter {
    fn confirm(&self, message: &str) -> Result<bool> {
        self.ensure_tty()?;
        print!("{message} [y/N]: ");
        io::stdout().flush()?;
        let answer = self.read_line()?.to_ascii_lowercase();
        Ok(answer == "y" || answer == "yes")
    }

    fn select(&self, message: &str, options: &[String]) -> Result<usize> {
        self.ensure_tty()?;
        println!("{message}");
        for (i, option) in options.iter().enumerate() {
            println!("  {}) {}", i + 1, option);
        }
        loop {
            print!("Select 1-{}: ", options.len());
            io::stdout().flush()?;
            let answer = self.read_line()?;
            match answer.parse::<usize>() {
                Ok(n) if n >= 1 && n <= options.len() => return Ok(n - 1),
                _ => println!("Invalid selection '{answer}'."),
            }
        }
    }
}

/// Never asks; every prompt is an error carrying the remedial flag name.
/// Installed when the caller passed `--no-prompt`.
pub struct DenyingPrompter;

impl Prompter for DenyingPrompter {
    fn confirm(&self, message: &str) -> Result<bool> {
        Err(GenesisError::Prompt(format!(
            "refusing to prompt ('{message}') because --no-prompt is set"
        )))
    }

    fn select(&self, message: &str, _options: &[String]) -> Result<usize> {
        Err(GenesisError::Prompt(format!(
            "refusing to prompt ('{message}') because --no-prompt is set"
        )))
    }
}

/// Test prompter fed with canned answers, consumed in order.
#[derive(Default)]
pub struct ScriptedPrompter {
    confirms: RefCell<VecDeque<bool>>,
    selections: RefCell<VecDeque<usize>>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_confirm(&self, answer: bool) {
        self.confirms.borrow_mut().push_back(answer);
    }

    pub fn push_selection(&self, index: usize) {
        self.selections.borrow_mut().push_back(index);
    }
}

impl Prompter for ScriptedPrompter {
    fn confirm(&self, message: &str) -> Result<bool> {
        self.confirms
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| GenesisError::Prompt(format!("unexpected confirm: {message}")))
    }

    fn select(&self, message: &str, options: &[String]) -> Result<usize> {
        let index = self
            .selections
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| GenesisError::Prompt(format!("unexpected selection: {message}")))?;
        if index >= options.len() {
            return Err(GenesisError::Prompt(format!(
                "scripted selection {index} out of range for {} options",
                options.len()
            )));
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_prompter_replays_answers() {
        let prompter = ScriptedPrompter::new();
        prompter.push_confirm(true);
        prompter.push_confirm(false);
        assert!(prompter.confirm("first").unwrap());
        assert!(!prompter.confirm("second").unwrap());
        assert!(prompter.confirm("third").is_err());
    }

    #[test]
    fn denying_prompter_names_the_flag() {
        let err = DenyingPrompter.confirm("proceed?").unwrap_err();
        assert!(format!("{err}").contains("--no-prompt"));
    }
}
