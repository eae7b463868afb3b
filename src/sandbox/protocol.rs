use std::fmt;

use crate::error::SandboxError;

/// Lifecycle markers printed by the container entrypoint, one per line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    CompilationStart,
    CompilationDone,
    RunStart,
    RunDone,
}

impl Milestone {
    pub fn token(self) -> &'static str {
        match self {
            Milestone::CompilationStart => "compilation.start",
            Milestone::CompilationDone => "compilation.done",
            Milestone::RunStart => "run.start",
            Milestone::RunDone => "run.done",
        }
    }

    pub fn is_compilation(self) -> bool {
        matches!(self, Milestone::CompilationStart | Milestone::CompilationDone)
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    AwaitingCompileStart,
    AwaitingCompileDone,
    AwaitingRunStart,
    AwaitingRunDone,
    Finished,
}

impl ProtocolState {
    pub fn expected(self) -> Option<Milestone> {
        match self {
            ProtocolState::AwaitingCompileStart => Some(Milestone::CompilationStart),
            ProtocolState::AwaitingCompileDone => Some(Milestone::CompilationDone),
            ProtocolState::AwaitingRunStart => Some(Milestone::RunStart),
            ProtocolState::AwaitingRunDone => Some(Milestone::RunDone),
            ProtocolState::Finished => None,
        }
    }

    fn next(self) -> ProtocolState {
        match self {
            ProtocolState::AwaitingCompileStart => ProtocolState::AwaitingCompileDone,
            ProtocolState::AwaitingCompileDone => ProtocolState::AwaitingRunStart,
            ProtocolState::AwaitingRunStart => ProtocolState::AwaitingRunDone,
            ProtocolState::AwaitingRunDone | ProtocolState::Finished => ProtocolState::Finished,
        }
    }
}

/// Milestone handshake with a container, fed one stdout line at a time.
///
/// Timeouts are the caller's business; this only checks ordering.
#[derive(Debug)]
pub struct Handshake {
    state: ProtocolState,
}

impl Handshake {
    /// Submissions in languages that are not compiled start at `run.start`.
    pub fn new(compilable: bool) -> Self {
        let state = if compilable {
            ProtocolState::AwaitingCompileStart
        } else {
            ProtocolState::AwaitingRunStart
        };
        Self { state }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn expected(&self) -> Option<Milestone> {
        self.state.expected()
    }

    /// Consumes one line of container output, which must be the expected
    /// milestone token (surrounding whitespace aside).
    pub fn accept(&mut self, line: &str) -> Result<Milestone, SandboxError> {
        let got = line.trim();
        let Some(expected) = self.expected() else {
            return Err(SandboxError::TrailingOutput(got.to_string()));
        };
        if got != expected.token() {
            return Err(SandboxError::UnexpectedMilestone {
                expected,
                got: got.to_string(),
            });
        }
        self.state = self.state.next();
        Ok(expected)
    }

    /// Stops expecting milestones, e.g. after a compilation error.
    pub fn abandon(&mut self) {
        self.state = ProtocolState::Finished;
    }
}
