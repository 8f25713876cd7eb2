#![forbid(unsafe_code)]

/// Patterns that mark a privilege-elevation prompt on a session's stderr.
/// Matched lines are intercepted, never surfaced as command output.
const PROMPT_PATTERNS: &[&str] = &["[sudo] password for", "Password:", "password for"];

pub fn is_privilege_prompt(line: &str) -> bool {
    let trimmed = line.trim();
    PROMPT_PATTERNS
        .iter()
        .any(|pattern| trimmed.contains(pattern))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptState {
    /// No prompt seen yet, or the last response was accepted.
    Running,
    /// A prompt arrived and a secret write is owed to the session.
    AwaitingResponse,
    /// The response budget is spent; the command must fail.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAction {
    /// Write the cached secret to the session.
    Respond,
    /// Ordinary output, pass it through.
    PassThrough,
    /// Too many prompts for one command; fail it outright.
    Fail,
}

/// Per-command state machine for the interactive password-prompt protocol.
/// The bounded-attempt guarantee lives here, independent of any stream
/// callback: at most `budget` secret writes per command.
#[derive(Debug)]
pub struct PromptGuard {
    budget: u32,
    responses: u32,
    state: PromptState,
}

impl PromptGuard {
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            responses: 0,
            state: PromptState::Running,
        }
    }

    pub fn state(&self) -> PromptState {
        self.state
    }

    pub fn responses(&self) -> u32 {
        self.responses
    }

    /// Feed one stderr line through the machine.
    pub fn observe(&mut self, line: &str) -> PromptAction {
        if self.state == PromptState::Exhausted {
            return PromptAction::Fail;
        }
        if !is_privilege_prompt(line) {
            self.state = PromptState::Running;
            return PromptAction::PassThrough;
        }
        if self.responses >= self.budget {
            self.state = PromptState::Exhausted;
            return PromptAction::Fail;
        }
        self.responses += 1;
        self.state = PromptState::AwaitingResponse;
        PromptAction::Respond
    }

    /// The owed secret write happened.
    pub fn responded(&mut self) {
        if self.state == PromptState::AwaitingResponse {
            self.state = PromptState::Running;
        }
    }
}
