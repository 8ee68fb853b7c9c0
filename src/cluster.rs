//! Cluster-dependent launch configuration.
//!
//! Translates queue-system environment state (user identity, scratch
//! override, submit directory, node-list file, job identifier) into MPI
//! launch command templates for the external solver. The environment is
//! captured once into an explicit [`ClusterEnv`] snapshot so the adapter
//! can be constructed deterministically in tests; [`ClusterEnv::from_env`]
//! reads the real process environment under deployment-configurable
//! variable names.
//!
//! Without a submit-directory indicator the adapter runs in interactive
//! mode: only a scratch path is guaranteed (falling back to the system
//! temporary directory when the preferred path is absent) and no launch
//! templates exist. Under a queued job the node list is deduplicated, a
//! unique-node machine file is written to scratch, and three command
//! templates are built for per-host, per-process, and caller-specified
//! process launches.
//!
//! The invocation helpers are deliberately thin: they do not check that
//! the program exists or succeeds, and a non-zero exit status of the
//! external process is not inspected. Only spawn failures propagate.

use crate::settings::SiteSettings;
use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use thiserror::Error;

/// Errors raised while building the launch configuration.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Filesystem or spawn failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Batch mode detected but no node-list file was supplied.
    #[error("submit directory is set but no node-list file is available")]
    MissingNodeFile,
    /// The node-list file held no hostnames.
    #[error("node-list file '{0}' is empty")]
    EmptyNodeList(PathBuf),
    /// A launch helper was called in interactive mode.
    #[error("no launch templates: adapter is running interactively")]
    Interactive,
}

/// Cluster-adapter result alias.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Names of the environment variables the adapter reads. Deployment
/// specific; the defaults match a PBS-style queue system.
#[derive(Debug, Clone)]
pub struct EnvNames {
    /// Variable holding the invoking user identity.
    pub user: String,
    /// Variable overriding the scratch directory.
    pub scratch: String,
    /// Variable holding the submit (working) directory of a queued job.
    pub submit_dir: String,
    /// Variable holding the node-list file path.
    pub node_file: String,
    /// Variable holding the job identifier.
    pub job_id: String,
}

impl Default for EnvNames {
    fn default() -> Self {
        Self {
            user: "USER".to_string(),
            scratch: "QEGLUE_SCRATCH".to_string(),
            submit_dir: "PBS_O_WORKDIR".to_string(),
            node_file: "PBS_NODEFILE".to_string(),
            job_id: "PBS_JOBID".to_string(),
        }
    }
}

/// Snapshot of the environment state the adapter derives its launch
/// configuration from. Built once per job.
#[derive(Debug, Clone, Default)]
pub struct ClusterEnv {
    /// Invoking user identity.
    pub user: String,
    /// Explicit scratch-directory override, if any.
    pub scratch_override: Option<PathBuf>,
    /// Submit directory of the queued job; absence means interactive mode.
    pub submit_dir: Option<PathBuf>,
    /// Node-list file (one hostname per line) supplied by the queue.
    pub node_file: Option<PathBuf>,
    /// Queue job identifier.
    pub job_id: Option<String>,
}

impl ClusterEnv {
    /// Captures the current process environment under the given names.
    pub fn from_env(names: &EnvNames) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            user: var(&names.user).unwrap_or_else(|| "unknown".to_string()),
            scratch_override: var(&names.scratch).map(PathBuf::from),
            submit_dir: var(&names.submit_dir).map(PathBuf::from),
            node_file: var(&names.node_file).map(PathBuf::from),
            job_id: var(&names.job_id),
        }
    }
}

/// Readable/writable stream handles to a spawned external process, for
/// callers that exchange data over its standard streams.
pub struct DuplexChild {
    /// The spawned process.
    pub child: Child,
    /// Writable handle to the process's standard input.
    pub stdin: ChildStdin,
    /// Readable handle to the process's standard output.
    pub stdout: ChildStdout,
    /// Readable handle to the process's standard error, when captured.
    pub stderr: Option<ChildStderr>,
}

/// Capability for launching external commands, so solver invocations can
/// be substituted in tests.
pub trait ProcessTransport {
    /// Runs a command to completion. The exit status is not inspected;
    /// only spawn failures surface.
    fn run(&self, command: &str) -> io::Result<()>;

    /// Spawns a command holding its standard streams open.
    fn open_duplex(&self, command: &str, capture_stderr: bool) -> io::Result<DuplexChild>;
}

/// Transport running commands through `sh -c`.
pub struct ShellTransport;

impl ProcessTransport for ShellTransport {
    fn run(&self, command: &str) -> io::Result<()> {
        debug!("running: {command}");
        Command::new("sh").arg("-c").arg(command).status()?;
        Ok(())
    }

    fn open_duplex(&self, command: &str, capture_stderr: bool) -> io::Result<DuplexChild> {
        debug!("opening duplex: {command}");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if capture_stderr { Stdio::piped() } else { Stdio::inherit() })
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout not captured"))?;
        let stderr = child.stderr.take();
        Ok(DuplexChild {
            child,
            stdin,
            stdout,
            stderr,
        })
    }
}

struct LaunchTemplates {
    per_host: String,
    per_proc: String,
    per_spec_proc: String,
}

/// Derived launch configuration for one job: scratch path, MPI executable,
/// node list, and the command templates. Immutable for the process
/// lifetime.
pub struct ClusterConfig {
    /// Scratch directory for intermediate files.
    pub scratch: PathBuf,
    /// MPI launcher executable.
    pub mpiexec: String,
    /// Submit directory when running under a queued job.
    pub submit_dir: Option<PathBuf>,
    /// Queue job identifier, if any.
    pub job_id: Option<String>,
    /// Full per-process host list from the node file.
    pub procs: Vec<String>,
    /// Process count (length of the node file).
    pub nprocs: usize,
    /// Deduplicated hostnames, in first-seen order.
    pub unique_nodes: Vec<String>,
    /// Machine file holding the deduplicated hostnames.
    pub unique_node_file: Option<PathBuf>,
    templates: Option<LaunchTemplates>,
    transport: Box<dyn ProcessTransport>,
}

fn fill(template: &str, pairs: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in pairs {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

impl ClusterConfig {
    /// Builds the launch configuration from an environment snapshot and
    /// site settings, launching through `sh -c`.
    pub fn new(env: ClusterEnv, settings: &SiteSettings) -> Result<Self> {
        Self::with_transport(env, settings, Box::new(ShellTransport))
    }

    /// Like [`ClusterConfig::new`] with an explicit transport.
    pub fn with_transport(
        env: ClusterEnv,
        settings: &SiteSettings,
        transport: Box<dyn ProcessTransport>,
    ) -> Result<Self> {
        let preferred = env
            .scratch_override
            .clone()
            .unwrap_or_else(|| PathBuf::from(settings.scratch_pattern.replace("{user}", &env.user)));
        let scratch = if preferred.exists() {
            preferred
        } else {
            debug!(
                "scratch path {} absent, falling back to temp dir",
                preferred.display()
            );
            std::env::temp_dir()
        };

        let batch = env.submit_dir.is_some();
        if !batch {
            info!("no submit-directory indicator; running interactively");
            return Ok(Self {
                scratch,
                mpiexec: settings.mpiexec.clone(),
                submit_dir: None,
                job_id: env.job_id,
                procs: Vec::new(),
                nprocs: 0,
                unique_nodes: Vec::new(),
                unique_node_file: None,
                templates: None,
                transport,
            });
        }

        let node_file = env.node_file.as_deref().ok_or(ClusterError::MissingNodeFile)?;
        let procs: Vec<String> = fs::read_to_string(node_file)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if procs.is_empty() {
            return Err(ClusterError::EmptyNodeList(node_file.to_path_buf()));
        }
        let nprocs = procs.len();

        let mut unique_nodes: Vec<String> = Vec::new();
        for host in &procs {
            if !unique_nodes.contains(host) {
                unique_nodes.push(host.clone());
            }
        }
        let unique_node_file = scratch.join("uniqnodefile");
        fs::write(&unique_node_file, unique_nodes.join("\n") + "\n")?;

        let mpiexec = settings.mpiexec.clone();
        let templates = LaunchTemplates {
            per_host: format!(
                "{} -machinefile {} -np {}",
                mpiexec,
                unique_node_file.display(),
                unique_nodes.len()
            ),
            per_proc: format!(
                "{} -machinefile {} -np {} -wdir {{wdir}} {{prog}}",
                mpiexec,
                node_file.display(),
                nprocs
            ),
            per_spec_proc: format!(
                "{mpiexec} -machinefile {{machinefile}} -np {{nprocs}} -wdir {{wdir}} {{prog}}"
            ),
        };
        info!(
            "batch job {:?}: {} processes on {} nodes",
            env.job_id,
            nprocs,
            unique_nodes.len()
        );

        Ok(Self {
            scratch,
            mpiexec,
            submit_dir: env.submit_dir,
            job_id: env.job_id,
            procs,
            nprocs,
            unique_nodes,
            unique_node_file: Some(unique_node_file),
            templates: Some(templates),
            transport,
        })
    }

    fn templates(&self) -> Result<&LaunchTemplates> {
        self.templates.as_ref().ok_or(ClusterError::Interactive)
    }

    /// True when launch templates exist (queued-job mode).
    pub fn is_batch(&self) -> bool {
        self.templates.is_some()
    }

    /// Launch prefix addressing one process per allocated node.
    pub fn per_host_exec(&self) -> Result<&str> {
        Ok(&self.templates()?.per_host)
    }

    /// Formatted per-process launch command for a working directory and
    /// program.
    pub fn per_proc_command(&self, wdir: &str, program: &str) -> Result<String> {
        Ok(fill(
            &self.templates()?.per_proc,
            &[("wdir", wdir), ("prog", program)],
        ))
    }

    /// Runs the program across all allocated processes, blocking until the
    /// external process exits. The exit status is not inspected.
    pub fn run_per_proc(&self, wdir: &str, program: &str) -> Result<()> {
        let command = self.per_proc_command(wdir, program)?;
        self.transport.run(&command)?;
        Ok(())
    }

    /// Spawns the program across all allocated processes, returning stream
    /// handles for interactive exchange.
    pub fn open_per_proc(&self, wdir: &str, program: &str) -> Result<DuplexChild> {
        let command = self.per_proc_command(wdir, program)?;
        Ok(self.transport.open_duplex(&command, false)?)
    }

    /// Spawns the program on a caller-supplied machine file and process
    /// count, capturing stderr as well.
    pub fn open_per_spec_proc(
        &self,
        machinefile: &Path,
        nprocs: usize,
        wdir: &str,
        program: &str,
    ) -> Result<DuplexChild> {
        let command = fill(
            &self.templates()?.per_spec_proc,
            &[
                ("machinefile", &machinefile.display().to_string()),
                ("nprocs", &nprocs.to_string()),
                ("wdir", wdir),
                ("prog", program),
            ],
        );
        Ok(self.transport.open_duplex(&command, true)?)
    }

    /// Runs a plain local command (no MPI template) through the transport.
    /// Used for scratch housekeeping such as archiving a density directory.
    pub fn run_local(&self, command: &str) -> Result<()> {
        self.transport.run(command)?;
        Ok(())
    }
}
