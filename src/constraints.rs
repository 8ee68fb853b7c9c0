use serde::{Deserialize, Serialize};

/// Geometric constraints on an atomic structure.
///
/// The serialized form is a tagged document (`name` + `kwargs`), which is
/// also the shape the codec stores in the constraints array of the atoms
/// sub-document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "kwargs")]
pub enum Constraint {
    /// Pin the listed atoms in place.
    FixAtoms {
        /// Indices of the fixed atoms.
        indices: Vec<usize>,
    },
    /// Pin selected Cartesian components of one atom.
    FixCartesian {
        /// Index of the constrained atom.
        index: usize,
        /// Per-axis flags; `true` fixes that component.
        mask: [bool; 3],
    },
    /// Keep the distance between two atoms fixed.
    FixBondLength {
        /// Indices of the bonded pair.
        pair: [usize; 2],
    },
}

impl Constraint {
    /// Largest atom index referenced by the constraint, for shape checks
    /// against the owning structure.
    pub fn max_index(&self) -> Option<usize> {
        match self {
            Constraint::FixAtoms { indices } => indices.iter().copied().max(),
            Constraint::FixCartesian { index, .. } => Some(*index),
            Constraint::FixBondLength { pair } => Some(pair[0].max(pair[1])),
        }
    }
}
