use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::StorageError;
use crate::model::{Commit, TestCase};

/// Object storage holding submissions, test case files and result archives.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn fetch_commit_file(&self, commit: &Commit, dest: &Path) -> Result<(), StorageError>;

    /// `rel_path` is relative to the compilation files area, i.e.
    /// `<exercise id>/<file name>`.
    async fn fetch_exercise_file(&self, rel_path: &str, dest: &Path) -> Result<(), StorageError>;

    async fn fetch_test_case_input_file(
        &self,
        test_case: &TestCase,
        dest: &Path,
    ) -> Result<(), StorageError>;

    async fn fetch_test_case_output_file(
        &self,
        test_case: &TestCase,
        dest: &Path,
    ) -> Result<(), StorageError>;

    /// Copies every auxiliary file of the test case into `dest_dir`.
    async fn fetch_test_case_files(
        &self,
        test_case: &TestCase,
        dest_dir: &Path,
    ) -> Result<(), StorageError>;

    /// Stores the result archive of a commit together with its
    /// [`OutputMetadata`].
    async fn store_commit_output(&self, commit: &Commit, archive: &Path) -> Result<(), StorageError>;
}

/// Hands out a storage handle for each commit being processed.
pub type StorageFactory =
    Arc<dyn Fn() -> Result<Arc<dyn StorageProvider>, StorageError> + Send + Sync>;

/// Descriptive metadata attached to a stored result archive.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputMetadata {
    pub commit_id: i64,
    pub user_email: String,
    pub exercise: i64,
    pub offering_id: i64,
    pub real_offering_id: i64,
    pub course_id: i64,
}

impl From<&Commit> for OutputMetadata {
    fn from(commit: &Commit) -> Self {
        Self {
            commit_id: commit.id,
            user_email: commit.user_email.clone(),
            exercise: commit.exercise_id,
            offering_id: commit.offering_id,
            real_offering_id: commit.real_offering_id,
            course_id: commit.course_id,
        }
    }
}

const COMMITS_AREA: &str = "commits";
const COMPILATION_FILES_AREA: &str = "files/compilationfiles";
const CASES_AREA: &str = "cases";
const OUTPUT_FILES_AREA: &str = "outputfiles";

/// Storage backed by a local directory tree.
///
/// Layout under the root:
/// - `commits/<storage key>`
/// - `files/compilationfiles/<exercise id>/<name>`
/// - `cases/<test case id>/{in,out}` and `cases/<test case id>/files/<name>`
/// - `outputfiles/<archive name>` plus `outputfiles/<archive name>.meta.json`
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(StorageError::InvalidRoot(root.display().to_string()));
        }
        Ok(Self { root })
    }

    /// A factory opening `root` anew for every commit, so that a storage
    /// root that disappears is reported per commit.
    pub fn factory(root: impl Into<PathBuf>) -> StorageFactory {
        let root = root.into();
        Arc::new(move || {
            let storage = FilesystemStorage::open(root.clone())?;
            Ok(Arc::new(storage) as Arc<dyn StorageProvider>)
        })
    }

    fn case_path(&self, test_case: &TestCase) -> PathBuf {
        self.root.join(CASES_AREA).join(test_case.id.to_string())
    }

    async fn copy_object(&self, source: PathBuf, dest: &Path) -> Result<(), StorageError> {
        if !fs::try_exists(&source).await? {
            return Err(StorageError::NotFound(
                source
                    .strip_prefix(&self.root)
                    .unwrap_or(&source)
                    .display()
                    .to_string(),
            ));
        }
        fs::copy(&source, dest).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for FilesystemStorage {
    async fn fetch_commit_file(&self, commit: &Commit, dest: &Path) -> Result<(), StorageError> {
        let source = self.root.join(COMMITS_AREA).join(&commit.storage_key);
        self.copy_object(source, dest).await
    }

    async fn fetch_exercise_file(&self, rel_path: &str, dest: &Path) -> Result<(), StorageError> {
        let source = self.root.join(COMPILATION_FILES_AREA).join(rel_path);
        self.copy_object(source, dest).await
    }

    async fn fetch_test_case_input_file(
        &self,
        test_case: &TestCase,
        dest: &Path,
    ) -> Result<(), StorageError> {
        self.copy_object(self.case_path(test_case).join("in"), dest)
            .await
    }

    async fn fetch_test_case_output_file(
        &self,
        test_case: &TestCase,
        dest: &Path,
    ) -> Result<(), StorageError> {
        self.copy_object(self.case_path(test_case).join("out"), dest)
            .await
    }

    async fn fetch_test_case_files(
        &self,
        test_case: &TestCase,
        dest_dir: &Path,
    ) -> Result<(), StorageError> {
        let files_dir = self.case_path(test_case).join("files");
        for name in &test_case.files {
            // Names come from the database; never let them escape `dest_dir`
            let Some(file_name) = Path::new(name).file_name() else {
                return Err(StorageError::NotFound(name.clone()));
            };
            self.copy_object(files_dir.join(name), &dest_dir.join(file_name))
                .await?;
        }
        Ok(())
    }

    async fn store_commit_output(&self, commit: &Commit, archive: &Path) -> Result<(), StorageError> {
        let Some(key) = archive.file_name() else {
            return Err(StorageError::NotFound(archive.display().to_string()));
        };
        let area = self.root.join(OUTPUT_FILES_AREA);
        fs::create_dir_all(&area).await?;

        let metadata = serde_json::to_vec_pretty(&OutputMetadata::from(commit))?;
        let mut metadata_name = key.to_os_string();
        metadata_name.push(".meta.json");

        fs::copy(archive, area.join(key)).await?;
        fs::write(area.join(metadata_name), metadata).await?;

        log::debug!(
            "[{}] Stored output archive {}",
            commit.id,
            area.join(key).display()
        );
        Ok(())
    }
}
