use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::languages::Language;

/// Processing state of a commit, with the integer codes used in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitStatus {
    InQueue,
    Processing,
    Compiling,
    Compiled,
    Running,
    Completed,
    Incomplete,
    Error,
    InternalError,
}

impl CommitStatus {
    pub fn code(self) -> i64 {
        match self {
            CommitStatus::InQueue => 0,
            CommitStatus::Compiling => 1,
            CommitStatus::Compiled => 2,
            CommitStatus::Incomplete => 4,
            CommitStatus::Completed => 5,
            CommitStatus::Error => 6,
            CommitStatus::InternalError => 9,
            CommitStatus::Running => 10,
            CommitStatus::Processing => 11,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => CommitStatus::InQueue,
            1 => CommitStatus::Compiling,
            2 => CommitStatus::Compiled,
            // 3 is the legacy code for a running commit
            3 | 10 => CommitStatus::Running,
            4 => CommitStatus::Incomplete,
            5 => CommitStatus::Completed,
            6 => CommitStatus::Error,
            9 => CommitStatus::InternalError,
            11 => CommitStatus::Processing,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommitStatus::Completed
                | CommitStatus::Incomplete
                | CommitStatus::Error
                | CommitStatus::InternalError
        )
    }

    /// Whether the pipeline may move a commit from `self` to `next`.
    ///
    /// Non-compilable submissions go from `Processing` straight to `Running`.
    /// `InternalError` is reachable from anywhere.
    pub fn can_advance_to(self, next: CommitStatus) -> bool {
        use CommitStatus::*;

        match (self, next) {
            (_, InternalError) => true,
            (InQueue, Processing) => true,
            (Processing, Compiling | Running) => true,
            (Compiling, Compiled | Error) => true,
            (Compiled, Running) => true,
            (Running, Completed | Incomplete) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommitStatus::InQueue => "IN_QUEUE",
            CommitStatus::Processing => "PROCESSING",
            CommitStatus::Compiling => "COMPILING",
            CommitStatus::Compiled => "COMPILED",
            CommitStatus::Running => "RUNNING",
            CommitStatus::Completed => "COMPLETED",
            CommitStatus::Incomplete => "INCOMPLETE",
            CommitStatus::Error => "ERROR",
            CommitStatus::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}

/// One submission and the outcome of its latest grading run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: i64,
    pub user_email: String,
    pub exercise_id: i64,
    /// Exercise holding the test cases; differs from `exercise_id` for
    /// ghost (cloned) exercises.
    pub real_exercise_id: i64,
    pub offering_id: i64,
    pub real_offering_id: i64,
    pub course_id: i64,
    pub status: CommitStatus,
    pub commit_hash: String,
    pub corrects: i64,
    pub score: f64,
    pub is_compiled: bool,
    pub compiled_message: String,
    pub compiled_signal: Option<i64>,
    pub compiled_error: String,
    pub commit_time: DateTime<Utc>,
    pub compilation_started_time: Option<DateTime<Utc>>,
    pub compilation_finished_time: Option<DateTime<Utc>>,
    pub user_ip: Option<String>,
    /// Storage key of the submitted file.
    pub storage_key: String,
    /// Submitted file name.
    pub fname: String,
    /// Standardized extension, set while preparing the working directory.
    // Spelled with the full path so serde does not treat it as borrowed.
    #[serde(with = "known_extension")]
    pub extension: Option<&'static std::primitive::str>,
    #[serde(with = "known_language")]
    pub language: Option<&'static Language>,
    pub is_compilable: bool,
}

impl Commit {
    /// Clears every artifact of a previous run and marks the commit as
    /// being processed.
    pub fn reset(&mut self) {
        self.score = 0.0;
        self.corrects = 0;
        self.is_compiled = false;
        self.compiled_message.clear();
        self.compilation_started_time = None;
        self.compilation_finished_time = None;
        self.compiled_signal = None;
        self.compiled_error.clear();
        self.status = CommitStatus::Processing;
    }

    /// Moves to `next`, logging transitions the state machine does not allow.
    pub fn advance(&mut self, next: CommitStatus) {
        if !self.status.can_advance_to(next) {
            log::warn!("[{}] Unexpected status change {} -> {}", self.id, self.status, next);
        }
        self.status = next;
    }
}

/// Extensions travel as text and come back as their table entry.
mod known_extension {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::languages::standardize_extension;

    pub fn serialize<S: Serializer>(ext: &Option<&'static str>, s: S) -> Result<S::Ok, S::Error> {
        match ext {
            Some(ext) => s.serialize_some(ext),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<&'static str>, D::Error> {
        let ext = Option::<String>::deserialize(d)?;
        ext.map(|ext| {
            standardize_extension(&ext)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown extension `{ext}`")))
        })
        .transpose()
    }
}

/// Languages travel by name.
mod known_language {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::languages::{Language, language_by_name};

    pub fn serialize<S: Serializer>(
        lang: &Option<&'static Language>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match lang {
            Some(lang) => s.serialize_some(lang.name),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<&'static Language>, D::Error> {
        let name = Option::<String>::deserialize(d)?;
        name.map(|name| {
            language_by_name(&name)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown language `{name}`")))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit() -> Commit {
        Commit {
            id: 7,
            user_email: "someone@example.com".to_string(),
            exercise_id: 1,
            real_exercise_id: 1,
            offering_id: 1,
            real_offering_id: 1,
            course_id: 1,
            status: CommitStatus::Completed,
            commit_hash: String::new(),
            corrects: 3,
            score: 7.5,
            is_compiled: true,
            compiled_message: "ok".to_string(),
            compiled_signal: Some(1),
            compiled_error: "boom".to_string(),
            commit_time: Utc::now(),
            compilation_started_time: Some(Utc::now()),
            compilation_finished_time: Some(Utc::now()),
            user_ip: None,
            storage_key: "7/main.c".to_string(),
            fname: "main.c".to_string(),
            extension: None,
            language: None,
            is_compilable: false,
        }
    }

    #[test]
    fn reset_clears_run_state() {
        let mut c = commit();
        c.reset();
        assert_eq!(c.status, CommitStatus::Processing);
        assert_eq!(c.corrects, 0);
        assert_eq!(c.score, 0.0);
        assert!(!c.is_compiled);
        assert!(c.compiled_message.is_empty());
        assert!(c.compiled_error.is_empty());
        assert_eq!(c.compiled_signal, None);
        assert!(c.compilation_started_time.is_none());
        assert!(c.compilation_finished_time.is_none());
    }

    #[test]
    fn json_form_names_language_and_status() {
        let mut c = commit();
        c.language = crate::languages::language_from_extension("py");
        c.extension = Some("py");

        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["status"], "COMPLETED");
        assert_eq!(json["language"], "Python");
        assert_eq!(json["extension"], "py");

        let back: Commit = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(back.language.map(|l| l.name), Some("Python"));
        assert_eq!(back.extension, Some("py"));
        assert_eq!(back.compilation_started_time, c.compilation_started_time);

        let mut unknown = json;
        unknown["language"] = "Cobol".into();
        assert!(serde_json::from_value::<Commit>(unknown).is_err());
    }

    #[test]
    fn status_codes_roundtrip() {
        use CommitStatus::*;
        for status in [
            InQueue,
            Processing,
            Compiling,
            Compiled,
            Running,
            Completed,
            Incomplete,
            Error,
            InternalError,
        ] {
            assert_eq!(CommitStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(CommitStatus::from_code(3), Some(Running));
        assert_eq!(CommitStatus::from_code(42), None);
    }

    #[test]
    fn state_machine() {
        use CommitStatus::*;
        assert!(InQueue.can_advance_to(Processing));
        assert!(Processing.can_advance_to(Compiling));
        assert!(Processing.can_advance_to(Running));
        assert!(Compiling.can_advance_to(Error));
        assert!(Compiling.can_advance_to(Compiled));
        assert!(Compiled.can_advance_to(Running));
        assert!(Running.can_advance_to(Completed));
        assert!(Running.can_advance_to(Incomplete));
        assert!(Compiled.can_advance_to(InternalError));

        assert!(!InQueue.can_advance_to(Running));
        assert!(!Running.can_advance_to(Error));
        assert!(!Completed.can_advance_to(Running));
    }

    #[test]
    fn terminal_states() {
        use CommitStatus::*;
        assert!(Completed.is_terminal());
        assert!(Incomplete.is_terminal());
        assert!(Error.is_terminal());
        assert!(InternalError.is_terminal());
        assert!(!Running.is_terminal());
        assert!(!InQueue.is_terminal());
    }
}
