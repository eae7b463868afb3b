mod commit;
mod test_case;

pub use commit::{Commit, CommitStatus};
pub use test_case::{IoKind, ResultStatus, TestCase, TestCaseResult};
