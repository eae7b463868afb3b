use chrono::{DateTime, Utc};

/// How a test case's input and expected output are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Text,
    Numeric,
    Binary,
}

impl IoKind {
    pub fn code(self) -> i64 {
        match self {
            IoKind::Text => 1,
            IoKind::Numeric => 2,
            IoKind::Binary => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(IoKind::Text),
            2 => Some(IoKind::Numeric),
            3 => Some(IoKind::Binary),
            _ => None,
        }
    }
}

/// An instructor-defined check of an exercise.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub id: i64,
    pub exercise_id: i64,
    pub input_type: IoKind,
    pub output_type: IoKind,
    pub show_input: bool,
    pub show_expected_output: bool,
    pub show_user_output: bool,
    /// Bytes.
    pub max_mem_size: i64,
    /// CPU-time budget in seconds.
    pub cpu_time: f64,
    /// Bytes.
    pub stack_size: i64,
    /// Maximum output size in bytes.
    pub file_size: i64,
    /// Tolerance for numeric outputs; unset means exact.
    pub abs_error: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
    /// Auxiliary files made available next to the input.
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Incorrect,
    Correct,
    Malformed,
}

impl ResultStatus {
    pub fn code(self) -> i64 {
        match self {
            ResultStatus::Incorrect => 0,
            ResultStatus::Correct => 1,
            ResultStatus::Malformed => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ResultStatus::Incorrect),
            1 => Some(ResultStatus::Correct),
            2 => Some(ResultStatus::Malformed),
            _ => None,
        }
    }
}

/// Verdict of one (commit, test case) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCaseResult {
    pub commit_id: i64,
    pub test_case_id: i64,
    /// Seconds, as reported by the monitor.
    pub cpu_time: f64,
    pub status: ResultStatus,
    /// Raw signal text reported by the monitor; empty on a clean exit.
    pub status_message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        for kind in [IoKind::Text, IoKind::Numeric, IoKind::Binary] {
            assert_eq!(IoKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(IoKind::from_code(0), None);

        assert_eq!(ResultStatus::Incorrect.code(), 0);
        assert_eq!(ResultStatus::Correct.code(), 1);
        assert_eq!(ResultStatus::Malformed.code(), 2);
        assert_eq!(ResultStatus::from_code(2), Some(ResultStatus::Malformed));
        assert_eq!(ResultStatus::from_code(3), None);
    }
}
