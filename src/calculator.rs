//! Calculator capability interface.
//!
//! The document codec needs to ask an attached calculator three things:
//! who it is (module/class identifiers plus its parameter set), whether a
//! given quantity would require a new solver run, and what its current
//! results are. [`Calculator`] pins those three questions down as a trait,
//! with optional quantities represented as explicit `Option` fields on
//! [`CalculationResult`] rather than probed-for methods.
//!
//! [`SinglePointCalculator`] is the decode-side counterpart: a calculator
//! that simply carries a stored result set for one fixed geometry.

use crate::atoms::AtomicStructure;
use nalgebra::Vector3;
use std::collections::BTreeMap;

/// Quantities a calculator can be asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// Potential energy in eV.
    Energy,
    /// Per-atom forces in eV/Angstrom.
    Forces,
    /// Voigt stress tensor in eV/Angstrom^3.
    Stress,
}

/// Results produced by a solver run for one geometry.
///
/// `None` is the explicit "unknown" marker: a quantity the solver did not
/// produce is absent, never zero.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalculationResult {
    /// Potential energy in eV.
    pub energy: Option<f64>,
    /// Force on each atom, same order as the structure.
    pub forces: Option<Vec<Vector3<f64>>>,
    /// Stress tensor in Voigt order (xx, yy, zz, yz, xz, xy).
    pub stress: Option<[f64; 6]>,
    /// Alternative energy estimates from an exchange-correlation ensemble.
    pub ensemble_energies: Option<Vec<f64>>,
}

/// Identity and parameter set of a calculator, as stored in the document.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculatorInfo {
    /// Module path the calculator class lives in.
    pub module: String,
    /// Class name, so a reader can reconstruct an instance later.
    pub class: String,
    /// Free-form parameter map.
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Capability interface the codec uses to embed calculator state.
pub trait Calculator {
    /// Identity and parameters for the calculator sub-document.
    fn info(&self) -> CalculatorInfo;

    /// True when producing `quantity` for `structure` would require a new
    /// solver run. Quantities flagged as required are omitted from the
    /// encoded results.
    fn calculation_required(&self, structure: &AtomicStructure, quantity: Quantity) -> bool;

    /// Current result set.
    fn results(&self) -> CalculationResult;
}

/// Calculator holding a fixed, previously computed result set.
///
/// Decoded documents come back with one of these attached so stored results
/// are reachable through the same capability interface as a live solver.
#[derive(Debug, Clone)]
pub struct SinglePointCalculator {
    results: CalculationResult,
}

impl SinglePointCalculator {
    /// Wraps a stored result set.
    pub fn new(results: CalculationResult) -> Self {
        Self { results }
    }
}

impl Calculator for SinglePointCalculator {
    fn info(&self) -> CalculatorInfo {
        CalculatorInfo {
            module: "qeglue::calculator".to_string(),
            class: "SinglePointCalculator".to_string(),
            parameters: BTreeMap::new(),
        }
    }

    fn calculation_required(&self, _structure: &AtomicStructure, quantity: Quantity) -> bool {
        match quantity {
            Quantity::Energy => self.results.energy.is_none(),
            Quantity::Forces => self.results.forces.is_none(),
            Quantity::Stress => self.results.stress.is_none(),
        }
    }

    fn results(&self) -> CalculationResult {
        self.results.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::Atom;
    use nalgebra::Matrix3;

    #[test]
    fn test_single_point_required_tracks_presence() {
        let calc = SinglePointCalculator::new(CalculationResult {
            energy: Some(-12.5),
            ..Default::default()
        });
        let s = AtomicStructure::new(
            vec![Atom::new("H", Vector3::zeros())],
            Matrix3::identity(),
            [false; 3],
        );
        assert!(!calc.calculation_required(&s, Quantity::Energy));
        assert!(calc.calculation_required(&s, Quantity::Forces));
        assert!(calc.calculation_required(&s, Quantity::Stress));
    }
}
