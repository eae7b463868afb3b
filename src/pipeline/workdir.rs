use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::config::EngineConfig;
use crate::languages;
use crate::model::{Commit, TestCase};

// The container may run as another user and must write into the tree
const WORK_DIR_PERMISSIONS: u32 = 0o777;

/// Per-commit working directory, seen from this host (`local`) and from the
/// container daemon (`remote`).
///
/// Layout:
/// - `src/` the submission and exercise support files
/// - `<id>.in` and `test_<id>/` input and auxiliary files of each test case
/// - `<id>.output`, `<id>.monitor_out` written by the container
/// - `<id>.out` the expected output, fetched while scoring
/// - the output-file directory, archived into `<commit id>.zip`
#[derive(Debug, Clone)]
pub struct WorkDir {
    local: PathBuf,
    remote: PathBuf,
}

impl WorkDir {
    pub fn for_commit(config: &EngineConfig, commit_id: i64) -> Self {
        let name = format!("commit_{commit_id}");
        Self {
            local: config.exec_dir.join(&name),
            remote: config.exec_dir_remote().join(&name),
        }
    }

    pub fn local(&self) -> &Path {
        &self.local
    }

    pub fn remote(&self) -> &Path {
        &self.remote
    }

    pub fn input_file(&self, test_case_id: i64) -> PathBuf {
        self.local.join(format!("{test_case_id}.in"))
    }

    pub fn test_case_dir(&self, test_case_id: i64) -> PathBuf {
        self.local.join(format!("test_{test_case_id}"))
    }

    pub fn user_output_file(&self, test_case_id: i64) -> PathBuf {
        self.local.join(format!("{test_case_id}.output"))
    }

    pub fn monitor_file(&self, test_case_id: i64) -> PathBuf {
        self.local.join(format!("{test_case_id}.monitor_out"))
    }

    pub fn expected_output_file(&self, test_case_id: i64) -> PathBuf {
        self.local.join(format!("{test_case_id}.out"))
    }

    pub fn archive_file(&self, commit_id: i64) -> PathBuf {
        self.local.join(format!("{commit_id}.zip"))
    }

    /// Removes any stale copy and creates the directory afresh.
    pub async fn recreate(&self) -> io::Result<()> {
        self.purge().await?;
        make_dir(&self.local).await
    }

    pub async fn purge(&self) -> io::Result<()> {
        if tokio::fs::try_exists(&self.local).await? {
            tokio::fs::remove_dir_all(&self.local).await?;
        }
        Ok(())
    }
}

/// Creates `path` (and parents) writable by the container.
pub async fn make_dir(path: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(path).await?;
    tokio::fs::set_permissions(path, fs::Permissions::from_mode(WORK_DIR_PERMISSIONS)).await
}

/// The `key=value` descriptor read by the container entrypoint.
pub fn render_container_config(
    config: &EngineConfig,
    commit: &Commit,
    test_cases: &[TestCase],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "monitor_max_fs={}", config.monitor_max_file_size.0);
    let _ = writeln!(out, "monitor_max_ms={}", config.monitor_max_mem_size.0);
    let _ = writeln!(out, "compilation_timeout={}", config.compilation_timeout.0);
    let _ = writeln!(out, "src_file={}", shell_quote(&commit.fname));
    for test_case in test_cases {
        let _ = writeln!(out, "t_{}={}", test_case.id, test_case.cpu_time);
    }
    out
}

/// Single-quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Extracts a submission archive into `dest` and returns the standardized
/// extension dominating its entries.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<&'static str> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).context("Invalid submission archive")?;

    let names: Vec<String> = zip.file_names().map(str::to_string).collect();
    let extension = languages::deduce_language(names.iter().map(String::as_str))
        .ok_or_else(|| anyhow!("No files with known extensions in submission archive"))?;

    zip.extract(dest).context("Failed to extract submission archive")?;
    Ok(extension)
}

/// Archives every file under `output_dir` into `archive`, with entry names
/// relative to `output_dir`.
///
/// Captured `.output`/`.error` files larger than `max_file_size` are
/// truncated in place first. Returns the number of archived files; a missing
/// `output_dir` gives an empty archive.
pub fn package_outputs(output_dir: &Path, archive: &Path, max_file_size: u64) -> Result<usize> {
    let mut files = Vec::new();
    if output_dir.is_dir() {
        collect_files(output_dir, &mut files)?;
    }
    files.sort();

    let mut writer = zip::ZipWriter::new(File::create(archive)?);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for path in &files {
        if is_captured_output(path) {
            truncate_to(path, max_file_size)?;
        }
        let name = entry_name(output_dir, path)?;
        writer.start_file(name, options)?;
        let mut file = File::open(path)?;
        io::copy(&mut file, &mut writer)?;
    }

    writer.finish()?;
    Ok(files.len())
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), files)?;
        } else if file_type.is_file() {
            files.push(entry.path());
        }
    }
    Ok(())
}

fn is_captured_output(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("output" | "error")
    )
}

fn truncate_to(path: &Path, max_size: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    if file.metadata()?.len() > max_size {
        file.set_len(max_size)?;
    }
    Ok(())
}

fn entry_name(base: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(base)?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::{CommitStatus, IoKind};

    fn commit(fname: &str) -> Commit {
        Commit {
            id: 12,
            user_email: "a@b.c".to_string(),
            exercise_id: 3,
            real_exercise_id: 3,
            offering_id: 1,
            real_offering_id: 1,
            course_id: 1,
            status: CommitStatus::InQueue,
            commit_hash: String::new(),
            corrects: 0,
            score: 0.0,
            is_compiled: false,
            compiled_message: String::new(),
            compiled_signal: None,
            compiled_error: String::new(),
            commit_time: Utc::now(),
            compilation_started_time: None,
            compilation_finished_time: None,
            user_ip: None,
            storage_key: fname.to_string(),
            fname: fname.to_string(),
            extension: None,
            language: None,
            is_compilable: false,
        }
    }

    fn test_case(id: i64, cpu_time: f64) -> TestCase {
        TestCase {
            id,
            exercise_id: 3,
            input_type: IoKind::Text,
            output_type: IoKind::Text,
            show_input: false,
            show_expected_output: false,
            show_user_output: false,
            max_mem_size: 0,
            cpu_time,
            stack_size: 0,
            file_size: 0,
            abs_error: None,
            last_update: None,
            files: Vec::new(),
        }
    }

    #[test]
    fn container_config() {
        let config = EngineConfig::default();
        let rendered = render_container_config(
            &config,
            &commit("it's main.c"),
            &[test_case(5, 1.5), test_case(9, 2.0)],
        );
        assert_eq!(
            rendered,
            "monitor_max_fs=5242880\n\
             monitor_max_ms=268435456\n\
             compilation_timeout=10\n\
             src_file='it'\\''s main.c'\n\
             t_5=1.5\n\
             t_9=2\n"
        );
    }

    #[test]
    fn work_dir_paths() {
        let config = EngineConfig {
            exec_dir: PathBuf::from("/tmp/exec"),
            exec_dir_remote: Some(PathBuf::from("/host/exec")),
            ..EngineConfig::default()
        };
        let work_dir = WorkDir::for_commit(&config, 42);
        assert_eq!(work_dir.local(), Path::new("/tmp/exec/commit_42"));
        assert_eq!(work_dir.remote(), Path::new("/host/exec/commit_42"));
        assert_eq!(work_dir.input_file(7), Path::new("/tmp/exec/commit_42/7.in"));
        assert_eq!(work_dir.test_case_dir(7), Path::new("/tmp/exec/commit_42/test_7"));
        assert_eq!(work_dir.monitor_file(7), Path::new("/tmp/exec/commit_42/7.monitor_out"));
        assert_eq!(work_dir.archive_file(42), Path::new("/tmp/exec/commit_42/42.zip"));
    }

    #[tokio::test]
    async fn recreate_purges_stale_content() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            exec_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let work_dir = WorkDir::for_commit(&config, 1);
        work_dir.recreate().await.unwrap();
        fs::write(work_dir.local().join("stale"), "x").unwrap();

        work_dir.recreate().await.unwrap();
        assert!(work_dir.local().is_dir());
        assert!(!work_dir.local().join("stale").exists());

        work_dir.purge().await.unwrap();
        assert!(!work_dir.local().exists());
        // Purging twice is fine
        work_dir.purge().await.unwrap();
    }

    #[test]
    fn packaging_truncates_captured_output() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("outputfiles");
        fs::create_dir_all(output_dir.join("nested")).unwrap();
        fs::write(output_dir.join("1.output"), "0123456789").unwrap();
        fs::write(output_dir.join("1.error"), "short").unwrap();
        fs::write(output_dir.join("nested/notes.txt"), "0123456789").unwrap();

        let archive = dir.path().join("12.zip");
        let count = package_outputs(&output_dir, &archive, 4).unwrap();
        assert_eq!(count, 3);

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["1.error", "1.output", "nested/notes.txt"]);

        let mut content = String::new();
        zip.by_name("1.output")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "0123");

        content.clear();
        zip.by_name("nested/notes.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "0123456789");
    }

    #[test]
    fn packaging_without_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("1.zip");
        assert_eq!(package_outputs(&dir.path().join("none"), &archive, 10).unwrap(), 0);
        assert!(archive.exists());
    }

    #[test]
    fn extraction_deduces_language() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("sub.zip");
        let mut writer = zip::ZipWriter::new(File::create(&archive).unwrap());
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, body) in [("main.cpp", "int main(){}"), ("util.cc", ""), ("a.py", "")] {
            writer.start_file(name, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();

        let dest = dir.path().join("src");
        fs::create_dir_all(&dest).unwrap();
        assert_eq!(extract_archive(&archive, &dest).unwrap(), "cpp");
        assert_eq!(fs::read_to_string(dest.join("main.cpp")).unwrap(), "int main(){}");
    }
}
