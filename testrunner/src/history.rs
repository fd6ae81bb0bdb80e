//! Version control adapters used to track expected results
//!
//! The backend is selected once at startup. Every external command runs
//! under one lock so concurrent workers never race on the working copy.

use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::config::{HistoryKind, RunnerConfig};
use crate::TestError;

/// Revision string used when no revision can be determined
pub const EXPORTED: &str = "exported";

/// Version control backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Untracked fixture tree
    None,
    Git {
        cmd: String,
        /// Directory the commands run in, empty for the current directory
        submodule: String,
    },
    Svn {
        cmd: String,
        svnversion: String,
        /// Metadata directory name stripped from run directories
        metadir: String,
    },
}

/// History adapter shared by all workers
#[derive(Debug)]
pub struct History {
    backend: Backend,
    lock: Mutex<()>,
}

impl History {
    pub fn new(backend: Backend) -> Self {
        Self { backend, lock: Mutex::new(()) }
    }

    /// Select the backend named by the run settings
    pub fn from_config(config: &RunnerConfig) -> Self {
        let backend = match config.scm {
            HistoryKind::None => Backend::None,
            HistoryKind::Git => {
                Backend::Git { cmd: config.git.clone(), submodule: config.git_submodule.clone() }
            }
            HistoryKind::Svn => {
                if !Path::new(&config.svnmetadir).exists() {
                    warn!("Current directory does not appear to be a SVN working copy");
                }
                Backend::Svn {
                    cmd: config.svn.clone(),
                    svnversion: config.svnversion.clone(),
                    metadir: config.svnmetadir.clone(),
                }
            }
        };

        Self::new(backend)
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Name of the metadata directory to skip when walking fixture trees
    pub fn metadata_dir(&self) -> Option<&str> {
        match &self.backend {
            Backend::Svn { metadir, .. } => Some(metadir),
            _ => None,
        }
    }

    /// Current revision of the fixture at `path`, `exported` if unknown
    pub async fn revision(&self, path: &Path) -> String {
        let output = match &self.backend {
            Backend::None => return EXPORTED.to_string(),
            Backend::Git { cmd, submodule } => {
                self.output(cmd, &["describe".into()], working_dir(submodule)).await
            }
            Backend::Svn { svnversion, .. } => {
                self.output(svnversion, &[], Some(path.to_path_buf())).await
            }
        };

        match output {
            Ok(stdout) => {
                let rev = stdout.lines().next().unwrap_or("").trim();
                if rev.is_empty() {
                    EXPORTED.to_string()
                } else {
                    rev.to_string()
                }
            }
            Err(e) => {
                debug!("Revision lookup failed: {}", e);
                EXPORTED.to_string()
            }
        }
    }

    /// Remove copied metadata directories below `dir`
    pub fn strip_metadata(&self, dir: &Path) {
        let Some(metadir) = self.metadata_dir() else { return };

        let mut found = Vec::new();
        let mut walker = WalkDir::new(dir).into_iter();
        while let Some(entry) = walker.next() {
            let Ok(entry) = entry else { continue };
            if entry.depth() > 0 && entry.file_type().is_dir() && is_metadata(entry.path(), metadir)
            {
                found.push(entry.into_path());
                walker.skip_current_dir();
            }
        }

        for path in found {
            if let Err(e) = fs::remove_dir_all(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Start tracking a newly recorded directory
    pub async fn add_directory(&self, dir: &Path) -> Result<(), TestError> {
        match &self.backend {
            Backend::None => Ok(()),
            Backend::Git { cmd, submodule } => {
                // Git does not track empty directories
                fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(".gitignore"))
                    .map_err(|e| {
                        TestError::History(format!("Failed to touch .gitignore: {}", e))
                    })?;

                self.status(cmd, &["add".into(), dir.into()], working_dir(submodule)).await
            }
            Backend::Svn { cmd, .. } => self.status(cmd, &["add".into(), dir.into()], None).await,
        }
    }

    /// Stop tracking a directory and delete it
    pub async fn remove_directory(&self, dir: &Path) -> Result<(), TestError> {
        match &self.backend {
            Backend::None => match tokio::fs::remove_dir_all(dir).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(TestError::History(
                    format!("Failed to remove {}: {}", dir.display(), e),
                )),
                _ => Ok(()),
            },
            Backend::Git { cmd, submodule } => {
                self.status(cmd, &["rm".into(), "-r".into(), dir.into()], working_dir(submodule))
                    .await?;
                if dir.exists() {
                    return Err(TestError::History(format!(
                        "{} still exists after removal",
                        dir.display()
                    )));
                }
                Ok(())
            }
            Backend::Svn { .. } => {
                Err(TestError::History("SVN does not currently support directory removal".into()))
            }
        }
    }

    async fn status(
        &self,
        cmd: &str,
        args: &[std::ffi::OsString],
        cwd: Option<PathBuf>,
    ) -> Result<(), TestError> {
        let _guard = self.lock.lock().await;
        debug!("Running {} {:?}", cmd, args);

        let mut command = Command::new(cmd);
        command.args(args).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let status = command
            .status()
            .await
            .map_err(|e| TestError::History(format!("Failed to run {}: {}", cmd, e)))?;

        if status.success() {
            Ok(())
        } else {
            Err(TestError::History(format!("{} {:?} exited with {}", cmd, args, status)))
        }
    }

    async fn output(
        &self,
        cmd: &str,
        args: &[std::ffi::OsString],
        cwd: Option<PathBuf>,
    ) -> Result<String, TestError> {
        let _guard = self.lock.lock().await;

        let mut command = Command::new(cmd);
        command.args(args).stdin(Stdio::null()).stderr(Stdio::null());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command
            .output()
            .await
            .map_err(|e| TestError::History(format!("Failed to run {}: {}", cmd, e)))?;

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn working_dir(submodule: &str) -> Option<PathBuf> {
    (!submodule.is_empty()).then(|| PathBuf::from(submodule))
}

fn is_metadata(path: &Path, metadir: &str) -> bool {
    path.file_name().map_or(false, |name| name == metadir)
}
