//! Warm-start calculator adapter.
//!
//! Self-consistent-field convergence is expensive. For vibrational work the
//! geometries are small displacements of one equilibrium structure, so the
//! converged electronic density of the undisplaced geometry makes an
//! excellent starting guess for every displaced one. This adapter expects
//! its first calculation to be the undisplaced structure: that run is
//! performed fresh, its converged density is archived to disk, and every
//! subsequent run loads the archive and starts the solver in
//! stored-potential mode.
//!
//! One cached entry, keyed implicitly by "first call wins". A new adapter
//! instance resets the cache. Two adapters sharing one output prefix are
//! unsupported; nothing detects the collision.

use crate::atoms::AtomicStructure;
use crate::calculator::{CalculationResult, Calculator, CalculatorInfo, Quantity};
use crate::engine::{DftEngine, EngineError, EngineFactory, EngineParameters, Result, StartMode};
use log::{debug, info};
use nalgebra::Vector3;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Position tolerance in Angstroms. A component delta strictly greater
/// than this marks the cached state dirty; a delta of exactly the
/// tolerance does not.
pub const POSITION_TOLERANCE: f64 = 1e-13;

fn displaced(reference: &[Vector3<f64>], current: &[Vector3<f64>], tolerance: f64) -> bool {
    if reference.len() != current.len() {
        return true;
    }
    reference
        .iter()
        .zip(current)
        .any(|(r, c)| (r - c).amax() > tolerance)
}

/// Calculator that seeds displaced-geometry runs with the equilibrium
/// density of its first calculation.
pub struct WarmStartCalculator {
    factory: Box<dyn EngineFactory>,
    keywords: BTreeMap<String, Value>,
    outdir_prefix: String,
    density_archive: PathBuf,
    counter: usize,
    first_step: bool,
    ready: bool,
    reference: Option<Vec<Vector3<f64>>>,
    engine: Option<Box<dyn DftEngine>>,
}

impl WarmStartCalculator {
    /// Creates a cold adapter. `outdir_prefix` names the per-invocation
    /// output directories (`{prefix}_0000`, `{prefix}_0001`, ...) and the
    /// equilibrium-density archive (`{prefix}_equi.tgz`).
    pub fn new(
        factory: Box<dyn EngineFactory>,
        keywords: BTreeMap<String, Value>,
        outdir_prefix: impl Into<String>,
    ) -> Self {
        let outdir_prefix = outdir_prefix.into();
        let density_archive = PathBuf::from(format!("{outdir_prefix}_equi.tgz"));
        Self {
            factory,
            keywords,
            outdir_prefix,
            density_archive,
            counter: 0,
            first_step: true,
            ready: false,
            reference: None,
            engine: None,
        }
    }

    /// Path of the persisted equilibrium-density archive.
    pub fn density_archive(&self) -> &std::path::Path {
        &self.density_archive
    }

    /// Marks the state dirty when the structure moved beyond tolerance (or
    /// no reference exists yet), then runs the solver if needed.
    pub fn update(&mut self, structure: &AtomicStructure) -> Result<()> {
        let positions = structure.positions();
        match &self.reference {
            Some(reference) if !displaced(reference, &positions, POSITION_TOLERANCE) => {}
            _ => {
                self.ready = false;
                self.reference = Some(positions);
            }
        }
        self.runcalc(structure)
    }

    /// Runs the solver unless the cached results are still valid. The
    /// first invocation ever solves fresh and archives the converged
    /// density; every later invocation loads the archive and starts from
    /// the stored potential.
    pub fn runcalc(&mut self, structure: &AtomicStructure) -> Result<()> {
        if self.ready {
            return Ok(());
        }
        let outdir = PathBuf::from(format!("{}_{:04}", self.outdir_prefix, self.counter));
        self.counter += 1;

        let params = EngineParameters {
            outdir,
            start_mode: if self.first_step {
                StartMode::FromScratch
            } else {
                StartMode::FromFile
            },
            keywords: self.keywords.clone(),
        };
        let mut engine = self.factory.create(&params)?;

        if self.first_step {
            info!("equilibrium solve into {}", params.outdir.display());
            engine.calculate(structure)?;
            engine.save_density(&self.density_archive)?;
            self.first_step = false;
        } else {
            debug!("density-seeded solve into {}", params.outdir.display());
            engine.load_density(&self.density_archive)?;
            engine.calculate(structure)?;
            engine.stop()?;
        }
        self.engine = Some(engine);
        self.ready = true;
        Ok(())
    }

    fn engine(&self) -> Result<&dyn DftEngine> {
        self.engine
            .as_deref()
            .ok_or(EngineError::NotComputed("energy"))
    }

    /// Potential energy of the structure, recomputing if it moved. The
    /// flag selects the smeared free energy over the zero-broadening
    /// extrapolation.
    pub fn get_potential_energy(
        &mut self,
        structure: &AtomicStructure,
        force_consistent: bool,
    ) -> Result<f64> {
        self.update(structure)?;
        let engine = self.engine()?;
        let energy = if force_consistent {
            engine.free_energy()
        } else {
            engine.zero_energy()
        };
        energy.ok_or(EngineError::NotComputed("energy"))
    }

    /// Forces on the structure, recomputing if it moved.
    pub fn get_forces(&mut self, structure: &AtomicStructure) -> Result<Vec<Vector3<f64>>> {
        self.update(structure)?;
        self.engine()?
            .forces()
            .map(|f| f.to_vec())
            .ok_or(EngineError::NotComputed("forces"))
    }
}

impl Calculator for WarmStartCalculator {
    fn info(&self) -> CalculatorInfo {
        let mut parameters = self.keywords.clone();
        parameters.insert(
            "outdir_prefix".to_string(),
            Value::String(self.outdir_prefix.clone()),
        );
        CalculatorInfo {
            module: "qeglue::warmstart".to_string(),
            class: "WarmStartCalculator".to_string(),
            parameters,
        }
    }

    fn calculation_required(&self, structure: &AtomicStructure, quantity: Quantity) -> bool {
        if !self.ready {
            return true;
        }
        if let Some(reference) = &self.reference {
            if displaced(reference, &structure.positions(), POSITION_TOLERANCE) {
                return true;
            }
        } else {
            return true;
        }
        let engine = match self.engine.as_deref() {
            Some(engine) => engine,
            None => return true,
        };
        match quantity {
            Quantity::Energy => engine.zero_energy().is_none(),
            Quantity::Forces => engine.forces().is_none(),
            Quantity::Stress => engine.stress().is_none(),
        }
    }

    fn results(&self) -> CalculationResult {
        match self.engine.as_deref() {
            Some(engine) => CalculationResult {
                energy: engine.zero_energy(),
                forces: engine.forces().map(|f| f.to_vec()),
                stress: engine.stress(),
                ensemble_energies: engine.ensemble_energies(),
            },
            None => CalculationResult::default(),
        }
    }
}
