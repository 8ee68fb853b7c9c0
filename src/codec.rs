//! Atoms-document codec.
//!
//! Converts an [`AtomicStructure`] (plus an optionally attached calculator)
//! into a nested key/value document suitable for a document collection, and
//! reconstructs the structure and its stored results from such a document.
//!
//! The encoded document has three sub-documents:
//!
//! - `atoms` - per-atom records, cell, pbc, metadata, constraints, and
//!   redundant summary fields for queryability (atom count, volume, mass,
//!   species set and counts, space-group label)
//! - `calculator` - module/class identifiers plus the parameter map
//! - `results` - energy, forces (+ `fmax`), stress (+ `smax`), ensemble
//!   energies; a quantity the calculator flags as requiring recomputation
//!   is omitted entirely, never stored as null
//!
//! plus provenance (`user`, `ctime`, `mtime`) and a content fingerprint
//! (`inserted_hash`). The fingerprint is a SHA-1 over the canonical JSON of
//! the document with the hash itself and both timestamps excluded, so the
//! same payload hashes identically regardless of wall-clock time. It is
//! informational only; the codec performs no deduplication.
//!
//! Round-trip contract: `decode(encode(s, r, {}))` restores species,
//! positions, tags, momenta, charges, cell, pbc, metadata, constraints, and
//! every result field that was present.

use crate::atoms::{Atom, AtomicStructure};
use crate::calculator::{CalculationResult, Calculator, Quantity};
use crate::constraints::Constraint;
use crate::symmetry;
use chrono::{DateTime, Utc};
use nalgebra::{Matrix3, Vector3};
use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors raised while encoding or decoding a document.
#[derive(Error, Debug)]
pub enum SerializationError {
    /// A numeric field is NaN or infinite.
    #[error("non-finite value in field '{field}'")]
    NonFinite {
        /// Which field held the bad value.
        field: String,
    },
    /// An array's length disagrees with the structure it belongs to.
    #[error("shape mismatch in '{field}': expected {expected}, found {found}")]
    ShapeMismatch {
        /// Which field was mis-shaped.
        field: String,
        /// Expected element count.
        expected: usize,
        /// Actual element count.
        found: usize,
    },
    /// A constraint refers to an atom index outside the structure.
    #[error("constraint references atom {index} but structure has {natoms} atoms")]
    ConstraintOutOfRange {
        /// Offending atom index.
        index: usize,
        /// Atom count of the structure.
        natoms: usize,
    },
    /// No standard mass is known for a species symbol.
    #[error("unknown species symbol '{0}'")]
    UnknownSpecies(String),
    /// A required document field is absent.
    #[error("missing document field '{0}'")]
    MissingField(String),
    /// A document field has the wrong JSON type or shape.
    #[error("malformed field '{field}': expected {expected}")]
    Malformed {
        /// Which field was malformed.
        field: String,
        /// What was expected there.
        expected: &'static str,
    },
    /// Underlying JSON formatting or parsing failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Codec result alias.
pub type Result<T> = std::result::Result<T, SerializationError>;

fn ensure_finite(field: &str, value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SerializationError::NonFinite {
            field: field.to_string(),
        })
    }
}

fn vec3_doc(field: &str, v: &Vector3<f64>) -> Result<Value> {
    for x in v.iter() {
        ensure_finite(field, *x)?;
    }
    Ok(json!([v.x, v.y, v.z]))
}

fn invoking_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

/// Serializes the structure into the `atoms` sub-document, including the
/// redundant summary fields used for querying.
pub fn atoms_to_doc(structure: &AtomicStructure) -> Result<Value> {
    let natoms = structure.len();

    for constraint in &structure.constraints {
        if let Some(index) = constraint.max_index() {
            if index >= natoms {
                return Err(SerializationError::ConstraintOutOfRange { index, natoms });
            }
        }
    }

    let mut atom_docs = Vec::with_capacity(natoms);
    for (index, atom) in structure.atoms.iter().enumerate() {
        let field = |name: &str| format!("atoms[{index}].{name}");
        atom_docs.push(json!({
            "symbol": atom.symbol,
            "position": vec3_doc(&field("position"), &atom.position)?,
            "tag": atom.tag,
            "index": index,
            "momentum": vec3_doc(&field("momentum"), &atom.momentum)?,
            "magmom": ensure_finite(&field("magmom"), atom.magmom)?,
            "charge": ensure_finite(&field("charge"), atom.charge)?,
        }));
    }

    let mut cell_rows = Vec::with_capacity(3);
    for i in 0..3 {
        let mut row = Vec::with_capacity(3);
        for j in 0..3 {
            row.push(ensure_finite(&format!("cell[{i}][{j}]"), structure.cell[(i, j)])?);
        }
        cell_rows.push(row);
    }

    let constraint_docs = structure
        .constraints
        .iter()
        .map(serde_json::to_value)
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut doc = Map::new();
    doc.insert("atoms".to_string(), Value::Array(atom_docs));
    doc.insert("cell".to_string(), json!(cell_rows));
    doc.insert("pbc".to_string(), json!(structure.pbc));
    doc.insert(
        "info".to_string(),
        Value::Object(structure.info.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    );
    doc.insert("constraints".to_string(), Value::Array(constraint_docs));

    // Redundant information for search convenience.
    doc.insert("natoms".to_string(), json!(natoms));
    if let Some(volume) = structure.volume() {
        doc.insert("volume".to_string(), json!(volume));
    }
    let mass = structure.total_mass().ok_or_else(|| {
        let unknown = structure
            .atoms
            .iter()
            .find(|a| crate::atoms::atomic_mass(&a.symbol).is_none())
            .map(|a| a.symbol.clone())
            .unwrap_or_default();
        SerializationError::UnknownSpecies(unknown)
    })?;
    doc.insert("mass".to_string(), json!(mass));

    let distinct: BTreeSet<&str> = structure.chemical_symbols().into_iter().collect();
    doc.insert("chemical_symbols".to_string(), json!(distinct));
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for symbol in structure.chemical_symbols() {
        *counts.entry(symbol).or_insert(0) += 1;
    }
    doc.insert("symbol_counts".to_string(), json!(counts));
    doc.insert("spacegroup".to_string(), json!(symmetry::spacegroup(structure)));

    Ok(Value::Object(doc))
}

fn results_doc(structure: &AtomicStructure, calc: &dyn Calculator) -> Result<Value> {
    let results = calc.results();
    let mut doc = Map::new();

    if !calc.calculation_required(structure, Quantity::Energy) {
        if let Some(energy) = results.energy {
            doc.insert("energy".to_string(), json!(ensure_finite("results.energy", energy)?));
        }
        if let Some(ensemble) = &results.ensemble_energies {
            for (i, e) in ensemble.iter().enumerate() {
                ensure_finite(&format!("results.ensemble_energies[{i}]"), *e)?;
            }
            doc.insert("ensemble_energies".to_string(), json!(ensemble));
        }
    }

    if !calc.calculation_required(structure, Quantity::Forces) {
        if let Some(forces) = &results.forces {
            if forces.len() != structure.len() {
                return Err(SerializationError::ShapeMismatch {
                    field: "results.forces".to_string(),
                    expected: structure.len(),
                    found: forces.len(),
                });
            }
            let mut rows = Vec::with_capacity(forces.len());
            let mut fmax = 0.0_f64;
            for (i, f) in forces.iter().enumerate() {
                rows.push(vec3_doc(&format!("results.forces[{i}]"), f)?);
                fmax = fmax.max(f.amax());
            }
            doc.insert("forces".to_string(), Value::Array(rows));
            doc.insert("fmax".to_string(), json!(fmax));
        }
    }

    if !calc.calculation_required(structure, Quantity::Stress) {
        if let Some(stress) = &results.stress {
            let mut smax = 0.0_f64;
            for (i, s) in stress.iter().enumerate() {
                ensure_finite(&format!("results.stress[{i}]"), *s)?;
                smax = smax.max(s.abs());
            }
            doc.insert("stress".to_string(), json!(stress));
            doc.insert("smax".to_string(), json!(smax));
        }
    }

    Ok(Value::Object(doc))
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Encodes a structure (and attached calculator state) into a persisted
/// document, stamping provenance with the current UTC time.
pub fn encode(
    structure: &AtomicStructure,
    calculator: Option<&dyn Calculator>,
    extra: &Map<String, Value>,
) -> Result<Value> {
    encode_at(structure, calculator, extra, Utc::now())
}

/// Like [`encode`] but with an explicit timestamp, so callers (and tests)
/// can pin the provenance fields. Both `ctime` and `mtime` are set to
/// `now`; callers needing distinct values update `mtime` themselves.
pub fn encode_at(
    structure: &AtomicStructure,
    calculator: Option<&dyn Calculator>,
    extra: &Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<Value> {
    let mut doc = Map::new();
    doc.insert("atoms".to_string(), atoms_to_doc(structure)?);

    if let Some(calc) = calculator {
        let info = calc.info();
        let mut calc_doc = Map::new();
        calc_doc.insert("module".to_string(), json!(info.module));
        calc_doc.insert("class".to_string(), json!(info.class));
        calc_doc.insert(
            "parameters".to_string(),
            Value::Object(info.parameters.into_iter().collect()),
        );
        doc.insert("calculator".to_string(), Value::Object(calc_doc));
        doc.insert("results".to_string(), results_doc(structure, calc)?);
    } else {
        doc.insert("results".to_string(), json!({}));
    }

    doc.insert("user".to_string(), json!(invoking_user()));
    for (key, value) in extra {
        doc.insert(key.clone(), value.clone());
    }

    // Content fingerprint over everything assembled so far; the hash field
    // itself and the timestamps stay outside it.
    let canonical = serde_json::to_string(&Value::Object(doc.clone()))?;
    doc.insert("inserted_hash".to_string(), json!(hex_digest(canonical.as_bytes())));

    let stamp = now.to_rfc3339();
    doc.insert("ctime".to_string(), json!(stamp));
    doc.insert("mtime".to_string(), json!(stamp));

    Ok(Value::Object(doc))
}

fn field<'a>(obj: &'a Map<String, Value>, name: &str) -> Result<&'a Value> {
    obj.get(name)
        .ok_or_else(|| SerializationError::MissingField(name.to_string()))
}

fn as_object<'a>(value: &'a Value, name: &str) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or(SerializationError::Malformed {
        field: name.to_string(),
        expected: "object",
    })
}

fn as_array<'a>(value: &'a Value, name: &str) -> Result<&'a Vec<Value>> {
    value.as_array().ok_or(SerializationError::Malformed {
        field: name.to_string(),
        expected: "array",
    })
}

fn as_f64(value: &Value, name: &str) -> Result<f64> {
    value.as_f64().ok_or(SerializationError::Malformed {
        field: name.to_string(),
        expected: "number",
    })
}

fn as_vec3(value: &Value, name: &str) -> Result<Vector3<f64>> {
    let arr = as_array(value, name)?;
    if arr.len() != 3 {
        return Err(SerializationError::ShapeMismatch {
            field: name.to_string(),
            expected: 3,
            found: arr.len(),
        });
    }
    Ok(Vector3::new(
        as_f64(&arr[0], name)?,
        as_f64(&arr[1], name)?,
        as_f64(&arr[2], name)?,
    ))
}

/// Reconstructs an [`AtomicStructure`] from the `atoms` sub-document.
pub fn doc_to_atoms(doc: &Value) -> Result<AtomicStructure> {
    let obj = as_object(doc, "atoms")?;

    let mut atoms = Vec::new();
    for (i, entry) in as_array(field(obj, "atoms")?, "atoms.atoms")?.iter().enumerate() {
        let rec = as_object(entry, "atoms.atoms[]")?;
        let name = |suffix: &str| format!("atoms.atoms[{i}].{suffix}");
        atoms.push(Atom {
            symbol: field(rec, "symbol")?
                .as_str()
                .ok_or(SerializationError::Malformed {
                    field: name("symbol"),
                    expected: "string",
                })?
                .to_string(),
            position: as_vec3(field(rec, "position")?, &name("position"))?,
            tag: field(rec, "tag")?
                .as_i64()
                .ok_or(SerializationError::Malformed {
                    field: name("tag"),
                    expected: "integer",
                })?,
            momentum: as_vec3(field(rec, "momentum")?, &name("momentum"))?,
            magmom: as_f64(field(rec, "magmom")?, &name("magmom"))?,
            charge: as_f64(field(rec, "charge")?, &name("charge"))?,
        });
    }

    let cell_rows = as_array(field(obj, "cell")?, "atoms.cell")?;
    if cell_rows.len() != 3 {
        return Err(SerializationError::ShapeMismatch {
            field: "atoms.cell".to_string(),
            expected: 3,
            found: cell_rows.len(),
        });
    }
    let mut cell = Matrix3::zeros();
    for (i, row) in cell_rows.iter().enumerate() {
        let v = as_vec3(row, &format!("atoms.cell[{i}]"))?;
        for j in 0..3 {
            cell[(i, j)] = v[j];
        }
    }

    let pbc_arr = as_array(field(obj, "pbc")?, "atoms.pbc")?;
    if pbc_arr.len() != 3 {
        return Err(SerializationError::ShapeMismatch {
            field: "atoms.pbc".to_string(),
            expected: 3,
            found: pbc_arr.len(),
        });
    }
    let mut pbc = [false; 3];
    for (i, v) in pbc_arr.iter().enumerate() {
        pbc[i] = v.as_bool().ok_or(SerializationError::Malformed {
            field: format!("atoms.pbc[{i}]"),
            expected: "boolean",
        })?;
    }

    let info = as_object(field(obj, "info")?, "atoms.info")?
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let constraints = as_array(field(obj, "constraints")?, "atoms.constraints")?
        .iter()
        .map(|c| serde_json::from_value::<Constraint>(c.clone()))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut structure = AtomicStructure::new(atoms, cell, pbc);
    structure.info = info;
    structure.constraints = constraints;
    Ok(structure)
}

/// Reconstructs the structure and its stored result set from a persisted
/// document. Result fields absent from the document come back as `None`,
/// the explicit "unknown" marker.
pub fn decode(doc: &Value) -> Result<(AtomicStructure, CalculationResult)> {
    let obj = as_object(doc, "document")?;
    let structure = doc_to_atoms(field(obj, "atoms")?)?;

    let mut result = CalculationResult::default();
    if let Some(results) = obj.get("results") {
        let results = as_object(results, "results")?;
        if let Some(v) = results.get("energy") {
            result.energy = Some(as_f64(v, "results.energy")?);
        }
        if let Some(v) = results.get("forces") {
            let rows = as_array(v, "results.forces")?;
            let mut forces = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                forces.push(as_vec3(row, &format!("results.forces[{i}]"))?);
            }
            result.forces = Some(forces);
        }
        if let Some(v) = results.get("stress") {
            let arr = as_array(v, "results.stress")?;
            if arr.len() != 6 {
                return Err(SerializationError::ShapeMismatch {
                    field: "results.stress".to_string(),
                    expected: 6,
                    found: arr.len(),
                });
            }
            let mut stress = [0.0; 6];
            for (i, s) in arr.iter().enumerate() {
                stress[i] = as_f64(s, &format!("results.stress[{i}]"))?;
            }
            result.stress = Some(stress);
        }
        if let Some(v) = results.get("ensemble_energies") {
            let arr = as_array(v, "results.ensemble_energies")?;
            let energies = arr
                .iter()
                .enumerate()
                .map(|(i, e)| as_f64(e, &format!("results.ensemble_energies[{i}]")))
                .collect::<Result<Vec<_>>>()?;
            result.ensemble_energies = Some(energies);
        }
    }

    Ok((structure, result))
}
