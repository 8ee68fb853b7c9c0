//! External plane-wave solver driver.
//!
//! The solver is an external process: this module writes its input deck,
//! launches it through the cluster adapter's per-process template, and
//! parses energies, forces, and stress out of its text output. The
//! [`DftEngine`] trait is the seam the warm-start adapter orchestrates
//! through, and [`EngineFactory`] lets it construct a fresh engine per
//! recomputation; tests substitute both with mocks.
//!
//! Failure semantics are deliberately thin: the solver's exit status is
//! never inspected, and a missing or truncated output file surfaces as a
//! parse error, not a launch error.

use crate::atoms::AtomicStructure;
use crate::cluster::ClusterConfig;
use crate::settings::SiteSettings;
use lazy_static::lazy_static;
use log::{debug, info};
use nalgebra::Vector3;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;

/// Rydberg to electronvolt.
const RY_TO_EV: f64 = 13.605693122994;
/// Bohr radius in Angstroms.
const BOHR_TO_ANGSTROM: f64 = 0.529177210903;

/// Errors raised while driving the external solver.
#[derive(Error, Debug)]
pub enum EngineError {
    /// File system or I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Launching through the cluster adapter failed.
    #[error("launch error: {0}")]
    Launch(#[from] crate::cluster::ClusterError),
    /// Solver output could not be interpreted.
    #[error("parse error: {0}")]
    Parse(String),
    /// A quantity was requested before any solver run produced it.
    #[error("quantity '{0}' has not been computed")]
    NotComputed(&'static str),
}

/// Engine result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

/// How the solver initializes its electronic state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Build the starting density from atomic superposition.
    FromScratch,
    /// Read a previously stored potential/density from disk.
    FromFile,
}

/// Per-run engine configuration.
#[derive(Debug, Clone)]
pub struct EngineParameters {
    /// Output directory for this run.
    pub outdir: PathBuf,
    /// Starting-density mode.
    pub start_mode: StartMode,
    /// Free-form solver keywords, passed through to the input deck.
    pub keywords: BTreeMap<String, Value>,
}

/// One instance of the external solver, bound to one output directory.
pub trait DftEngine {
    /// Runs the solver to self-consistency for the structure, replacing
    /// any previous results.
    fn calculate(&mut self, structure: &AtomicStructure) -> Result<()>;

    /// Smeared (force-consistent) total energy in eV.
    fn free_energy(&self) -> Option<f64>;

    /// Zero-broadening extrapolated energy in eV.
    fn zero_energy(&self) -> Option<f64>;

    /// Forces in eV/Angstrom, one per atom.
    fn forces(&self) -> Option<&[Vector3<f64>]>;

    /// Voigt stress in eV/Angstrom^3.
    fn stress(&self) -> Option<[f64; 6]>;

    /// Ensemble energy estimates, when the functional produces them.
    fn ensemble_energies(&self) -> Option<Vec<f64>>;

    /// Archives the converged density so a later run can warm-start.
    fn save_density(&self, archive: &Path) -> Result<()>;

    /// Restores a previously archived density into this run's directory.
    fn load_density(&mut self, archive: &Path) -> Result<()>;

    /// Terminates the solver instance.
    fn stop(&mut self) -> Result<()>;
}

/// Constructs a fresh engine for each recomputation.
pub trait EngineFactory {
    /// Builds an engine bound to the given parameters.
    fn create(&self, params: &EngineParameters) -> Result<Box<dyn DftEngine>>;
}

lazy_static! {
    static ref FLOAT_RE: String = r"[-+]?(?:\d+\.\d*|\.\d+|\d+)(?:[eE][-+]?\d+)?".to_string();
    // "!    total energy              =     -32.12345678 Ry"
    static ref ENERGY_RE: Regex =
        Regex::new(&format!(r"^!\s+total energy\s+=\s+({0})\s+Ry", *FLOAT_RE)).unwrap();
    // "     smearing contrib. (-TS)   =      -0.00200000 Ry"
    static ref SMEAR_RE: Regex = Regex::new(&format!(
        r"smearing contrib\.\s+\(-TS\)\s+=\s+({0})\s+Ry",
        *FLOAT_RE
    ))
    .unwrap();
    // "     atom    1 type  1   force =     0.00000000    0.00000000    0.01000000"
    static ref FORCE_RE: Regex = Regex::new(&format!(
        r"^\s*atom\s+\d+\s+type\s+\d+\s+force\s+=\s+({0})\s+({0})\s+({0})",
        *FLOAT_RE
    ))
    .unwrap();
    static ref STRESS_ROW_RE: Regex = Regex::new(&format!(
        r"^\s*({0})\s+({0})\s+({0})",
        *FLOAT_RE
    ))
    .unwrap();
}

#[derive(Debug, Default, Clone)]
struct PwResults {
    free_energy: Option<f64>,
    zero_energy: Option<f64>,
    forces: Option<Vec<Vector3<f64>>>,
    stress: Option<[f64; 6]>,
}

fn parse_f64(s: &str) -> Result<f64> {
    s.parse()
        .map_err(|_| EngineError::Parse(format!("bad float '{s}'")))
}

/// Extracts energies, forces, and stress from solver text output. The last
/// occurrence of each block wins, matching how the solver appends per-
/// iteration output.
fn parse_output(content: &str) -> Result<PwResults> {
    let mut energy_ry = None;
    let mut smear_ry = 0.0;
    let mut forces: Vec<Vector3<f64>> = Vec::new();
    let mut stress_rows: Vec<[f64; 3]> = Vec::new();
    let mut stress_remaining = 0;

    for line in content.lines() {
        if let Some(caps) = ENERGY_RE.captures(line) {
            energy_ry = Some(parse_f64(&caps[1])?);
        } else if let Some(caps) = SMEAR_RE.captures(line) {
            smear_ry = parse_f64(&caps[1])?;
        } else if line.contains("Forces acting on atoms") {
            forces.clear();
        } else if let Some(caps) = FORCE_RE.captures(line) {
            let conv = RY_TO_EV / BOHR_TO_ANGSTROM;
            forces.push(Vector3::new(
                parse_f64(&caps[1])? * conv,
                parse_f64(&caps[2])? * conv,
                parse_f64(&caps[3])? * conv,
            ));
        } else if line.contains("total   stress") {
            stress_rows.clear();
            stress_remaining = 3;
        } else if stress_remaining > 0 {
            if let Some(caps) = STRESS_ROW_RE.captures(line) {
                stress_rows.push([
                    parse_f64(&caps[1])?,
                    parse_f64(&caps[2])?,
                    parse_f64(&caps[3])?,
                ]);
                stress_remaining -= 1;
            }
        }
    }

    let energy_ry = energy_ry
        .ok_or_else(|| EngineError::Parse("no converged total energy in solver output".to_string()))?;
    let free = energy_ry * RY_TO_EV;
    // Zero-broadening extrapolation: the printed contribution is -TS, so
    // E0 = F - (-TS)/2.
    let zero = free - 0.5 * smear_ry * RY_TO_EV;

    let stress = if stress_rows.len() == 3 {
        let conv = -RY_TO_EV / BOHR_TO_ANGSTROM.powi(3);
        let m = stress_rows;
        Some([
            m[0][0] * conv,
            m[1][1] * conv,
            m[2][2] * conv,
            m[1][2] * conv,
            m[0][2] * conv,
            m[0][1] * conv,
        ])
    } else {
        None
    };

    Ok(PwResults {
        free_energy: Some(free),
        zero_energy: Some(zero),
        forces: if forces.is_empty() { None } else { Some(forces) },
        stress,
    })
}

fn keyword_line(key: &str, value: &Value) -> String {
    match value {
        Value::Bool(true) => format!("   {key} = .true.\n"),
        Value::Bool(false) => format!("   {key} = .false.\n"),
        Value::String(s) => format!("   {key} = '{s}'\n"),
        other => format!("   {key} = {other}\n"),
    }
}

/// Renders the solver input deck for a structure and parameter set.
fn render_input(structure: &AtomicStructure, params: &EngineParameters) -> String {
    let mut deck = String::new();
    deck.push_str("&CONTROL\n");
    deck.push_str("   calculation = 'scf'\n");
    deck.push_str("   outdir = '.'\n");
    deck.push_str("   prefix = 'pwscf'\n");
    deck.push_str("   tprnfor = .true.\n");
    deck.push_str("   tstress = .true.\n");
    if params.start_mode == StartMode::FromFile {
        deck.push_str("   startingpot = 'file'\n");
    }
    deck.push_str("/\n&SYSTEM\n");
    let _ = writeln!(deck, "   nat = {}", structure.len());
    let mut species: Vec<&str> = Vec::new();
    for symbol in structure.chemical_symbols() {
        if !species.contains(&symbol) {
            species.push(symbol);
        }
    }
    let _ = writeln!(deck, "   ntyp = {}", species.len());
    for (key, value) in &params.keywords {
        deck.push_str(&keyword_line(key, value));
    }
    deck.push_str("/\n&ELECTRONS\n/\n");

    deck.push_str("ATOMIC_SPECIES\n");
    for symbol in &species {
        let mass = crate::atoms::atomic_mass(symbol).unwrap_or(1.0);
        let _ = writeln!(deck, "{symbol} {mass} {symbol}.UPF");
    }
    deck.push_str("CELL_PARAMETERS angstrom\n");
    for i in 0..3 {
        let _ = writeln!(
            deck,
            "{:.10} {:.10} {:.10}",
            structure.cell[(i, 0)],
            structure.cell[(i, 1)],
            structure.cell[(i, 2)]
        );
    }
    deck.push_str("ATOMIC_POSITIONS angstrom\n");
    for atom in &structure.atoms {
        let _ = writeln!(
            deck,
            "{} {:.10} {:.10} {:.10}",
            atom.symbol, atom.position.x, atom.position.y, atom.position.z
        );
    }
    deck
}

/// Driver for the external plane-wave solver executable.
pub struct PwEngine {
    cluster: Rc<ClusterConfig>,
    command: String,
    params: EngineParameters,
    results: PwResults,
    stopped: bool,
}

impl PwEngine {
    /// Binds a driver to a cluster configuration and run parameters.
    pub fn new(cluster: Rc<ClusterConfig>, command: String, params: EngineParameters) -> Self {
        Self {
            cluster,
            command,
            params,
            results: PwResults::default(),
            stopped: false,
        }
    }

    fn workdir(&self) -> String {
        self.params.outdir.display().to_string()
    }
}

impl DftEngine for PwEngine {
    fn calculate(&mut self, structure: &AtomicStructure) -> Result<()> {
        fs::create_dir_all(&self.params.outdir)?;
        let deck = render_input(structure, &self.params);
        fs::write(self.params.outdir.join("pw.in"), deck)?;

        let program = format!("{} -in pw.in > pw.out", self.command);
        let wdir = self.workdir();
        info!("solver run in {wdir}");
        if self.cluster.is_batch() {
            self.cluster.run_per_proc(&wdir, &program)?;
        } else {
            self.cluster.run_local(&format!("cd {wdir} && {program}"))?;
        }

        let output = fs::read_to_string(self.params.outdir.join("pw.out"))
            .map_err(|e| EngineError::Parse(format!("cannot read solver output: {e}")))?;
        self.results = parse_output(&output)?;
        debug!("solver converged: free energy {:?} eV", self.results.free_energy);
        Ok(())
    }

    fn free_energy(&self) -> Option<f64> {
        self.results.free_energy
    }

    fn zero_energy(&self) -> Option<f64> {
        self.results.zero_energy
    }

    fn forces(&self) -> Option<&[Vector3<f64>]> {
        self.results.forces.as_deref()
    }

    fn stress(&self) -> Option<[f64; 6]> {
        self.results.stress
    }

    fn ensemble_energies(&self) -> Option<Vec<f64>> {
        None
    }

    fn save_density(&self, archive: &Path) -> Result<()> {
        // The archive format is the solver's own save directory, tarred.
        self.cluster.run_local(&format!(
            "tar czf {} -C {} .",
            archive.display(),
            self.params.outdir.display()
        ))?;
        Ok(())
    }

    fn load_density(&mut self, archive: &Path) -> Result<()> {
        fs::create_dir_all(&self.params.outdir)?;
        self.cluster.run_local(&format!(
            "tar xzf {} -C {}",
            archive.display(),
            self.params.outdir.display()
        ))?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stopped = true;
        Ok(())
    }
}

/// Factory producing [`PwEngine`] instances over one cluster configuration.
pub struct PwEngineFactory {
    cluster: Rc<ClusterConfig>,
    command: String,
}

impl PwEngineFactory {
    /// Builds a factory using the site's solver executable.
    pub fn new(cluster: Rc<ClusterConfig>, settings: &SiteSettings) -> Self {
        Self {
            cluster,
            command: settings.pw_command.clone(),
        }
    }
}

impl EngineFactory for PwEngineFactory {
    fn create(&self, params: &EngineParameters) -> Result<Box<dyn DftEngine>> {
        Ok(Box::new(PwEngine::new(
            Rc::clone(&self.cluster),
            self.command.clone(),
            params.clone(),
        )))
    }
}
