//! Site settings.
//!
//! Deployment-specific names live in an INI file rather than in code: which
//! environment variables the cluster adapter reads, where scratch space
//! lives, which MPI launcher to use, where the installer puts things, and
//! where the default document collection sits. Settings are resolved with
//! the following precedence:
//!
//! 1. Local configuration (`./qeglue_config.cfg`)
//! 2. User configuration (`~/.config/qeglue/qeglue_config.cfg`)
//! 3. System configuration (`/etc/qeglue/qeglue_config.cfg`)
//! 4. Built-in defaults
//!
//! # File format
//!
//! ```ini
//! [environment]
//! user = USER
//! scratch = QEGLUE_SCRATCH
//! submit_dir = PBS_O_WORKDIR
//! node_file = PBS_NODEFILE
//! job_id = PBS_JOBID
//!
//! [launcher]
//! mpiexec = mpirun
//! scratch_pattern = /scratch/{user}
//! pw_command = pw.x
//!
//! [install]
//! environments_root = /opt/builds/envs
//! lib_subdir = lib
//! installer = cargo install --path . --root {prefix}
//!
//! [database]
//! collection = atoms.jsonl
//! ```

use crate::cluster::EnvNames;
use configparser::ini::Ini;
use log::{debug, info};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading site settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// I/O error reading a configuration file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error.
    #[error("INI parsing error: {0}")]
    IniParse(String),
}

/// Settings result alias.
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Resolved site settings.
#[derive(Debug, Clone)]
pub struct SiteSettings {
    /// Environment variable holding the user identity.
    pub env_user: String,
    /// Environment variable overriding the scratch directory.
    pub env_scratch: String,
    /// Environment variable holding the queued job's submit directory.
    pub env_submit_dir: String,
    /// Environment variable holding the node-list file path.
    pub env_node_file: String,
    /// Environment variable holding the job identifier.
    pub env_job_id: String,
    /// MPI launcher executable.
    pub mpiexec: String,
    /// Preferred scratch path; `{user}` is substituted.
    pub scratch_pattern: String,
    /// Plane-wave solver executable.
    pub pw_command: String,
    /// Root directory holding named installation environments.
    pub environments_root: PathBuf,
    /// Library subdirectory created under an environment prefix.
    pub lib_subdir: String,
    /// Installer command; `{prefix}` is substituted.
    pub installer: String,
    /// Default document-collection path.
    pub collection: PathBuf,
}

impl SiteSettings {
    /// Built-in defaults for a PBS-style deployment.
    pub fn defaults() -> Self {
        Self {
            env_user: "USER".to_string(),
            env_scratch: "QEGLUE_SCRATCH".to_string(),
            env_submit_dir: "PBS_O_WORKDIR".to_string(),
            env_node_file: "PBS_NODEFILE".to_string(),
            env_job_id: "PBS_JOBID".to_string(),
            mpiexec: "mpirun".to_string(),
            scratch_pattern: "/scratch/{user}".to_string(),
            pw_command: "pw.x".to_string(),
            environments_root: PathBuf::from("/opt/builds/envs"),
            lib_subdir: "lib".to_string(),
            installer: "cargo install --path . --root {prefix}".to_string(),
            collection: PathBuf::from("atoms.jsonl"),
        }
    }

    /// Candidate configuration file paths, most specific first.
    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("qeglue_config.cfg")];
        if let Ok(home) = std::env::var("HOME") {
            paths.push(PathBuf::from(home).join(".config/qeglue/qeglue_config.cfg"));
        }
        paths.push(PathBuf::from("/etc/qeglue/qeglue_config.cfg"));
        paths
    }

    /// Loads settings from the first configuration file found, falling
    /// back to the built-in defaults when none exists.
    pub fn load() -> Result<Self> {
        for path in Self::candidate_paths() {
            if path.exists() {
                info!("loading site settings from {}", path.display());
                return Self::load_from(&path);
            }
        }
        debug!("no site settings file found, using defaults");
        Ok(Self::defaults())
    }

    /// Loads settings from an explicit file, with defaults filling any
    /// missing keys.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut ini = Ini::new();
        ini.load(path).map_err(SettingsError::IniParse)?;

        let mut settings = Self::defaults();
        let get = |section: &str, key: &str| ini.get(section, key);

        if let Some(v) = get("environment", "user") {
            settings.env_user = v;
        }
        if let Some(v) = get("environment", "scratch") {
            settings.env_scratch = v;
        }
        if let Some(v) = get("environment", "submit_dir") {
            settings.env_submit_dir = v;
        }
        if let Some(v) = get("environment", "node_file") {
            settings.env_node_file = v;
        }
        if let Some(v) = get("environment", "job_id") {
            settings.env_job_id = v;
        }
        if let Some(v) = get("launcher", "mpiexec") {
            settings.mpiexec = v;
        }
        if let Some(v) = get("launcher", "scratch_pattern") {
            settings.scratch_pattern = v;
        }
        if let Some(v) = get("launcher", "pw_command") {
            settings.pw_command = v;
        }
        if let Some(v) = get("install", "environments_root") {
            settings.environments_root = PathBuf::from(v);
        }
        if let Some(v) = get("install", "lib_subdir") {
            settings.lib_subdir = v;
        }
        if let Some(v) = get("install", "installer") {
            settings.installer = v;
        }
        if let Some(v) = get("database", "collection") {
            settings.collection = PathBuf::from(v);
        }

        Ok(settings)
    }

    /// Environment-variable names for the cluster adapter.
    pub fn env_names(&self) -> EnvNames {
        EnvNames {
            user: self.env_user.clone(),
            scratch: self.env_scratch.clone(),
            submit_dir: self.env_submit_dir.clone(),
            node_file: self.env_node_file.clone(),
            job_id: self.env_job_id.clone(),
        }
    }
}
