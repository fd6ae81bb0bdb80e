//! Expected/actual output tree comparison

use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::TestError;

/// Why an expected file did not match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MismatchReason {
    /// The application did not produce the file
    NotFound,
    /// The stripped contents differ; carries the full diff when requested
    ContentDiffers(Option<String>),
}

impl fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("file not found"),
            Self::ContentDiffers(None) => f.write_str("content does not match"),
            Self::ContentDiffers(Some(diff)) => write!(f, "content does not match\n\n{}\n", diff),
        }
    }
}

/// One expected file that did not match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    /// Path relative to the expected directory
    pub path: String,
    pub reason: MismatchReason,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : {}", self.path, self.reason)
    }
}

/// Result of comparing an output tree with its expectations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub matches: bool,
    /// Problems ordered by path
    pub problems: Vec<Mismatch>,
}

/// Output tree comparison engine
#[derive(Debug, Clone)]
pub struct Comparator {
    /// Expected files at least this large are compared line by line
    diff_max_threshold: u64,
    show_diff: bool,
    ignore_files: Vec<String>,
    skip_dirs: Vec<String>,
}

impl Comparator {
    pub fn new(diff_max_threshold: u64) -> Self {
        Self {
            diff_max_threshold,
            show_diff: false,
            ignore_files: vec![".gitignore".to_string()],
            skip_dirs: Vec::new(),
        }
    }

    /// Attach the full diff to content mismatches
    pub fn show_diff(mut self, show_diff: bool) -> Self {
        self.show_diff = show_diff;
        self
    }

    /// File names in the expected tree that are never compared
    pub fn ignore_files<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_files = names.into_iter().map(Into::into).collect();
        self
    }

    /// Directory names in the expected tree that are never descended into
    pub fn skip_dirs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_dirs = names.into_iter().map(Into::into).collect();
        self
    }

    /// Compare the files produced in `actual_dir` against `expected_dir`.
    ///
    /// Files present in `actual_dir` but not in the expectations are not
    /// reported.
    pub fn compare(&self, actual_dir: &Path, expected_dir: &Path) -> Result<Comparison, TestError> {
        let mut results: BTreeMap<String, Option<MismatchReason>> = self
            .expected_files(expected_dir)?
            .into_iter()
            .map(|key| (key, Some(MismatchReason::NotFound)))
            .collect();

        for entry in WalkDir::new(actual_dir) {
            let entry = entry.map_err(|e| TestError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let key = relative_key(actual_dir, entry.path());
            let Some(slot) = results.get_mut(&key) else { continue };

            let expected_path = expected_dir.join(&key);
            *slot = self.compare_file(entry.path(), &expected_path)?;
        }

        let problems: Vec<Mismatch> = results
            .into_iter()
            .filter_map(|(path, reason)| reason.map(|reason| Mismatch { path, reason }))
            .collect();

        Ok(Comparison { matches: problems.is_empty(), problems })
    }

    fn expected_files(&self, expected_dir: &Path) -> Result<Vec<String>, TestError> {
        let mut keys = Vec::new();
        let walker = WalkDir::new(expected_dir).into_iter().filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !self.skip_dirs.iter().any(|name| entry.file_name() == name.as_str())
        });

        for entry in walker {
            let entry = entry.map_err(|e| TestError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if self.ignore_files.iter().any(|name| entry.file_name() == name.as_str()) {
                continue;
            }
            keys.push(relative_key(expected_dir, entry.path()));
        }

        Ok(keys)
    }

    fn compare_file(
        &self,
        actual: &Path,
        expected: &Path,
    ) -> Result<Option<MismatchReason>, TestError> {
        let expected_size = fs::metadata(expected)?.len();
        let actual_text = read_lossy(actual)?;
        let expected_text = read_lossy(expected)?;
        let actual_lines = stripped_lines(&actual_text);
        let expected_lines = stripped_lines(&expected_text);

        if expected_size < self.diff_max_threshold {
            let diff = TextDiff::from_slices(&expected_lines, &actual_lines);
            if diff.iter_all_changes().all(|change| change.tag() == ChangeTag::Equal) {
                return Ok(None);
            }

            let detail = self.show_diff.then(|| {
                diff.iter_all_changes()
                    .map(|change| {
                        let prefix = match change.tag() {
                            ChangeTag::Delete => "- ",
                            ChangeTag::Insert => "+ ",
                            ChangeTag::Equal => "  ",
                        };
                        format!("{}{}\n", prefix, change.value())
                    })
                    .collect::<String>()
            });
            return Ok(Some(MismatchReason::ContentDiffers(detail)));
        }

        // Large files: pairwise up to the shorter length
        let differs = actual_lines.iter().zip(expected_lines.iter()).any(|(a, e)| a != e);
        Ok(differs.then_some(MismatchReason::ContentDiffers(None)))
    }
}

impl Default for Comparator {
    fn default() -> Self {
        Self::new(1536)
    }
}

/// Lines with leading whitespace removed, dropping blank and `#` comment lines
pub fn stripped_lines(text: &str) -> Vec<&str> {
    text.split(|c| c == '\n' || c == '\r')
        .map(str::trim_start)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}

fn read_lossy(path: &Path) -> Result<String, TestError> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let path = dir.path().join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        dir
    }

    #[test]
    fn test_identical_trees_match() {
        let expected = tree(&[("a.txt", "1\n2\n"), ("data/b.dat", "x y z\n")]);
        let actual = tree(&[("a.txt", "1\n2\n"), ("data/b.dat", "x y z\n")]);

        let result = Comparator::default().compare(actual.path(), expected.path()).unwrap();
        assert!(result.matches);
        assert!(result.problems.is_empty());
    }

    #[test]
    fn test_missing_file() {
        let expected = tree(&[("a.txt", "1\n2\n")]);
        let actual = tree(&[]);

        let result = Comparator::default().compare(actual.path(), expected.path()).unwrap();
        assert!(!result.matches);
        assert_eq!(
            result.problems,
            vec![Mismatch { path: "a.txt".to_string(), reason: MismatchReason::NotFound }]
        );
        assert_eq!(result.problems[0].to_string(), "a.txt : file not found");
    }

    #[test]
    fn test_content_differs() {
        let expected = tree(&[("a.txt", "1\n2\n"), ("b.txt", "same\n")]);
        let actual = tree(&[("a.txt", "1\n3\n"), ("b.txt", "same\n")]);

        let result = Comparator::default().compare(actual.path(), expected.path()).unwrap();
        assert!(!result.matches);
        assert_eq!(result.problems.len(), 1);
        assert_eq!(result.problems[0].to_string(), "a.txt : content does not match");
    }

    #[test]
    fn test_comments_blank_lines_and_indentation_ignored() {
        let expected = tree(&[("a.txt", "# header\n\nvalue 1\n  value 2\n")]);
        let actual = tree(&[("a.txt", "# generated at some time\r\nvalue 1\r\n\r\n\tvalue 2\r\n")]);

        let result = Comparator::default().compare(actual.path(), expected.path()).unwrap();
        assert!(result.matches);
    }

    #[test]
    fn test_unexpected_output_not_reported() {
        let expected = tree(&[("a.txt", "1\n")]);
        let actual = tree(&[("a.txt", "1\n"), ("extra.txt", "new\n")]);

        let result = Comparator::default().compare(actual.path(), expected.path()).unwrap();
        assert!(result.matches);
    }

    #[test]
    fn test_large_files_compare_shorter_length() {
        let expected = tree(&[("big.dat", "1\n2\n3\n")]);
        let actual = tree(&[("big.dat", "1\n2\n")]);

        let comparator = Comparator::new(0);
        let result = comparator.compare(actual.path(), expected.path()).unwrap();
        assert!(result.matches);

        let actual = tree(&[("big.dat", "1\n9\n")]);
        let result = comparator.compare(actual.path(), expected.path()).unwrap();
        assert!(!result.matches);
    }

    #[test]
    fn test_show_diff() {
        let expected = tree(&[("a.txt", "1\n2\n")]);
        let actual = tree(&[("a.txt", "1\n3\n")]);

        let result =
            Comparator::default().show_diff(true).compare(actual.path(), expected.path()).unwrap();
        let MismatchReason::ContentDiffers(Some(diff)) = &result.problems[0].reason else {
            panic!("expected a diff, got {:?}", result.problems[0].reason);
        };
        assert!(diff.contains("  1\n"));
        assert!(diff.contains("- 2\n"));
        assert!(diff.contains("+ 3\n"));
    }

    #[test]
    fn test_ignored_files_and_metadata_dirs() {
        let expected = tree(&[
            ("a.txt", "1\n"),
            (".gitignore", ""),
            (".svn/entries", "metadata\n"),
        ]);
        let actual = tree(&[("a.txt", "1\n")]);

        let result = Comparator::default()
            .skip_dirs([".svn"])
            .compare(actual.path(), expected.path())
            .unwrap();
        assert!(result.matches);
    }

    #[test]
    fn test_problems_ordered_and_repeatable() {
        let expected = tree(&[("z.txt", "1\n"), ("a.txt", "1\n"), ("m/n.txt", "1\n")]);
        let actual = tree(&[("m/n.txt", "2\n")]);

        let comparator = Comparator::default();
        let first = comparator.compare(actual.path(), expected.path()).unwrap();
        let second = comparator.compare(actual.path(), expected.path()).unwrap();

        assert_eq!(first, second);
        let paths: Vec<_> = first.problems.iter().map(|p| p.path.clone()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
        assert_eq!(paths.len(), 3);
    }

    #[test]
    fn test_stripped_lines() {
        assert_eq!(stripped_lines("  a\n#b\n\n   \nc\r\nd"), vec!["a", "c", "d"]);
    }
}
