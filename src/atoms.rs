//! Atomic-structure data model.
//!
//! This module provides the in-memory representation of a periodic atomic
//! structure: an ordered list of [`Atom`]s together with a 3x3 cell matrix,
//! per-axis periodic-boundary flags, free-form metadata, and geometric
//! constraints. The atom count is fixed once a structure is constructed and
//! an atom's index is its position in the sequence.
//!
//! Positions are in Angstroms, momenta in amu*Angstrom/fs, masses in amu.

use crate::constraints::Constraint;
use nalgebra::{Matrix3, Vector3};
use std::collections::BTreeMap;

/// Standard atomic masses in amu, indexed by element symbol.
///
/// Covers the elements commonly seen in plane-wave DFT work; lookups for
/// anything else return `None` and surface as a codec error at encode time.
static ATOMIC_MASSES: &[(&str, f64)] = &[
    ("H", 1.008),
    ("He", 4.002602),
    ("Li", 6.94),
    ("Be", 9.0121831),
    ("B", 10.81),
    ("C", 12.011),
    ("N", 14.007),
    ("O", 15.999),
    ("F", 18.998403163),
    ("Ne", 20.1797),
    ("Na", 22.98976928),
    ("Mg", 24.305),
    ("Al", 26.9815385),
    ("Si", 28.085),
    ("P", 30.973761998),
    ("S", 32.06),
    ("Cl", 35.45),
    ("Ar", 39.948),
    ("K", 39.0983),
    ("Ca", 40.078),
    ("Sc", 44.955908),
    ("Ti", 47.867),
    ("V", 50.9415),
    ("Cr", 51.9961),
    ("Mn", 54.938044),
    ("Fe", 55.845),
    ("Co", 58.933194),
    ("Ni", 58.6934),
    ("Cu", 63.546),
    ("Zn", 65.38),
    ("Ga", 69.723),
    ("Ge", 72.63),
    ("As", 74.921595),
    ("Se", 78.971),
    ("Br", 79.904),
    ("Kr", 83.798),
    ("Rb", 85.4678),
    ("Sr", 87.62),
    ("Y", 88.90584),
    ("Zr", 91.224),
    ("Nb", 92.90637),
    ("Mo", 95.95),
    ("Tc", 98.0),
    ("Ru", 101.07),
    ("Rh", 102.9055),
    ("Pd", 106.42),
    ("Ag", 107.8682),
    ("Cd", 112.414),
    ("In", 114.818),
    ("Sn", 118.71),
    ("Sb", 121.76),
    ("Te", 127.6),
    ("I", 126.90447),
    ("Xe", 131.293),
    ("Cs", 132.90545196),
    ("Ba", 137.327),
    ("La", 138.90547),
    ("Ce", 140.116),
    ("Gd", 157.25),
    ("Hf", 178.49),
    ("Ta", 180.94788),
    ("W", 183.84),
    ("Re", 186.207),
    ("Os", 190.23),
    ("Ir", 192.217),
    ("Pt", 195.084),
    ("Au", 196.966569),
    ("Hg", 200.592),
    ("Tl", 204.38),
    ("Pb", 207.2),
    ("Bi", 208.9804),
    ("Th", 232.0377),
    ("U", 238.02891),
];

/// Look up the standard atomic mass for an element symbol.
pub fn atomic_mass(symbol: &str) -> Option<f64> {
    ATOMIC_MASSES
        .iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, m)| *m)
}

/// A single atom: chemical species plus its per-atom state.
#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    /// Chemical element symbol, e.g. "Fe".
    pub symbol: String,
    /// Cartesian position in Angstroms.
    pub position: Vector3<f64>,
    /// Integer tag for caller-defined bookkeeping (sublattices, layers).
    pub tag: i64,
    /// Momentum vector.
    pub momentum: Vector3<f64>,
    /// Initial magnetic moment in Bohr magnetons.
    pub magmom: f64,
    /// Initial charge in units of e.
    pub charge: f64,
}

impl Atom {
    /// Creates an atom at a position with all per-atom state zeroed.
    pub fn new(symbol: impl Into<String>, position: Vector3<f64>) -> Self {
        Self {
            symbol: symbol.into(),
            position,
            tag: 0,
            momentum: Vector3::zeros(),
            magmom: 0.0,
            charge: 0.0,
        }
    }
}

/// An ordered collection of atoms in a periodic cell.
///
/// The cell matrix holds the three lattice vectors as rows. The atom count
/// is fixed at construction; an atom's index equals its position in the
/// sequence, which is what the document codec relies on when it stores and
/// restores per-atom records.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicStructure {
    /// Atoms in sequence order.
    pub atoms: Vec<Atom>,
    /// Lattice vectors as rows, in Angstroms.
    pub cell: Matrix3<f64>,
    /// Periodic-boundary flags per axis.
    pub pbc: [bool; 3],
    /// Free-form metadata carried through encode/decode untouched.
    pub info: BTreeMap<String, serde_json::Value>,
    /// Geometric constraints applied to the structure.
    pub constraints: Vec<Constraint>,
}

impl AtomicStructure {
    /// Creates a structure from atoms, a cell matrix, and periodicity flags.
    pub fn new(atoms: Vec<Atom>, cell: Matrix3<f64>, pbc: [bool; 3]) -> Self {
        Self {
            atoms,
            cell,
            pbc,
            info: BTreeMap::new(),
            constraints: Vec::new(),
        }
    }

    /// Number of atoms.
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    /// True when the structure holds no atoms.
    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Positions of all atoms, in sequence order.
    pub fn positions(&self) -> Vec<Vector3<f64>> {
        self.atoms.iter().map(|a| a.position).collect()
    }

    /// Element symbols of all atoms, in sequence order.
    pub fn chemical_symbols(&self) -> Vec<&str> {
        self.atoms.iter().map(|a| a.symbol.as_str()).collect()
    }

    /// Standard atomic mass of each atom, in sequence order. `None` marks a
    /// species absent from the mass table.
    pub fn masses(&self) -> Vec<Option<f64>> {
        self.atoms.iter().map(|a| atomic_mass(&a.symbol)).collect()
    }

    /// Sum of standard atomic masses, or `None` if any species is unknown.
    pub fn total_mass(&self) -> Option<f64> {
        self.atoms
            .iter()
            .map(|a| atomic_mass(&a.symbol))
            .sum::<Option<f64>>()
    }

    /// Cell volume in cubic Angstroms, only when the cell determinant is
    /// positive. A zero or left-handed cell yields `None`.
    pub fn volume(&self) -> Option<f64> {
        let det = self.cell.determinant();
        if det > 0.0 {
            Some(det)
        } else {
            None
        }
    }
}
