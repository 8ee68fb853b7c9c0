//! qeglue - glue between a plane-wave DFT engine, an HPC cluster, and a
//! document database.
//!
//! This crate lets a computational chemist run plane-wave calculations on a
//! shared cluster and persist structured results (atomic structures,
//! calculator parameters, computed energies and forces) as documents for
//! later querying. It does not implement the solver, the queue system, or
//! the database server; those are external collaborators reached through
//! thin, explicit seams.
//!
//! # Components
//!
//! - [`cluster`] - translates queue-system environment state into MPI
//!   launch command templates and runs the external solver through them.
//! - [`codec`] - converts an [`atoms::AtomicStructure`] (plus attached
//!   calculator results) into a nested document and back; round-trips all
//!   modeled fields.
//! - [`db`] - thin insert/query wrapper over a document collection,
//!   lazily decoding query matches back into structures.
//! - [`warmstart`] - runs an initial unconstrained solve, archives the
//!   converged electronic density, and seeds every subsequent
//!   displaced-geometry solve with it.
//!
//! # Typical flow
//!
//! ```no_run
//! use qeglue::cluster::{ClusterConfig, ClusterEnv};
//! use qeglue::db::{AtomsDatabase, JsonlStore};
//! use qeglue::engine::PwEngineFactory;
//! use qeglue::settings::SiteSettings;
//! use qeglue::warmstart::WarmStartCalculator;
//! use std::collections::BTreeMap;
//! use std::rc::Rc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = SiteSettings::load()?;
//!     let env = ClusterEnv::from_env(&settings.env_names());
//!     let cluster = Rc::new(ClusterConfig::new(env, &settings)?);
//!
//!     let factory = PwEngineFactory::new(Rc::clone(&cluster), &settings);
//!     let mut calc =
//!         WarmStartCalculator::new(Box::new(factory), BTreeMap::new(), "out");
//!
//!     let structure = // build an AtomicStructure for the system of interest
//! #       qeglue::atoms::AtomicStructure::new(vec![], nalgebra::Matrix3::identity(), [true; 3]);
//!     let _energy = calc.get_potential_energy(&structure, false)?;
//!
//!     let doc = qeglue::codec::encode(&structure, Some(&calc), &Default::default())?;
//!     let mut db = AtomsDatabase::new(JsonlStore::open(&settings.collection)?);
//!     db.write(doc, &Default::default())?;
//!     Ok(())
//! }
//! ```
//!
//! # Error handling
//!
//! Each module carries its own error enum; no retries, no recovery logic.
//! A failing solver run, a lost database connection, or a malformed stored
//! document propagates to the caller unchanged.

pub mod atoms;
pub mod calculator;
pub mod cluster;
pub mod codec;
pub mod constraints;
pub mod db;
pub mod engine;
pub mod settings;
/// Space-group label derivation for the codec's summary fields.
pub mod symmetry;
pub mod warmstart;

pub use atoms::{Atom, AtomicStructure};
pub use calculator::{CalculationResult, Calculator, SinglePointCalculator};
pub use cluster::{ClusterConfig, ClusterEnv};
pub use codec::{decode, encode};
pub use db::{AtomsDatabase, JsonlStore};
pub use settings::SiteSettings;
pub use warmstart::WarmStartCalculator;
