use chrono::TimeZone;
use nalgebra::{Matrix3, Vector3};
use qeglue::atoms::{Atom, AtomicStructure};
use qeglue::calculator::{
    CalculationResult, Calculator, CalculatorInfo, Quantity, SinglePointCalculator,
};
use qeglue::codec::{self, SerializationError};
use qeglue::constraints::Constraint;
use serde_json::{json, Map};

fn sample_structure() -> AtomicStructure {
    let mut top = Atom::new("O", Vector3::new(0.0, 0.0, 1.2));
    top.tag = 1;
    top.momentum = Vector3::new(0.0, 0.1, 0.0);
    top.magmom = 0.5;
    top.charge = -0.2;

    let atoms = vec![
        Atom::new("Pt", Vector3::new(0.0, 0.0, 0.0)),
        Atom::new("Pt", Vector3::new(1.96, 1.96, 0.0)),
        top,
    ];
    let cell = Matrix3::new(3.92, 0.0, 0.0, 0.0, 3.92, 0.0, 0.0, 0.0, 15.0);
    let mut s = AtomicStructure::new(atoms, cell, [true, true, false]);
    s.info.insert("name".to_string(), json!("pt-slab"));
    s.info.insert("relaxed".to_string(), json!(true));
    s.constraints.push(Constraint::FixAtoms { indices: vec![0, 1] });
    s
}

fn sample_result(natoms: usize) -> CalculationResult {
    CalculationResult {
        energy: Some(-104.25),
        forces: Some(
            (0..natoms)
                .map(|i| Vector3::new(0.01 * i as f64, -0.02, 0.003))
                .collect(),
        ),
        stress: Some([0.1, 0.1, 0.2, 0.0, 0.0, -0.05]),
        ensemble_energies: Some(vec![-104.2, -104.3, -104.27]),
    }
}

fn fixed_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

#[test]
fn test_round_trip_all_modeled_fields() {
    let s = sample_structure();
    let r = sample_result(s.len());
    let calc = SinglePointCalculator::new(r.clone());

    let doc = codec::encode(&s, Some(&calc), &Map::new()).unwrap();
    let (back_s, back_r) = codec::decode(&doc).unwrap();

    assert_eq!(back_s, s);
    assert_eq!(back_r, r);
}

#[test]
fn test_decode_defaults_absent_results_to_unknown() {
    let s = sample_structure();
    let calc = SinglePointCalculator::new(CalculationResult {
        energy: Some(-1.5),
        ..Default::default()
    });
    let doc = codec::encode(&s, Some(&calc), &Map::new()).unwrap();
    let (_, r) = codec::decode(&doc).unwrap();
    assert_eq!(r.energy, Some(-1.5));
    assert!(r.forces.is_none());
    assert!(r.stress.is_none());
    assert!(r.ensemble_energies.is_none());
}

#[test]
fn test_encode_is_deterministic_with_fixed_timestamp() {
    let s = sample_structure();
    let calc = SinglePointCalculator::new(sample_result(s.len()));
    let a = codec::encode_at(&s, Some(&calc), &Map::new(), fixed_now()).unwrap();
    let b = codec::encode_at(&s, Some(&calc), &Map::new(), fixed_now()).unwrap();
    assert_eq!(a, b);
    assert_eq!(a["atoms"]["symbol_counts"], json!({"O": 1, "Pt": 2}));
}

#[test]
fn test_hash_is_content_addressed_not_time_addressed() {
    let s = sample_structure();
    let calc = SinglePointCalculator::new(sample_result(s.len()));
    let early = codec::encode_at(&s, Some(&calc), &Map::new(), fixed_now()).unwrap();
    let later = codec::encode_at(
        &s,
        Some(&calc),
        &Map::new(),
        fixed_now() + chrono::Duration::hours(3),
    )
    .unwrap();
    assert_eq!(early["inserted_hash"], later["inserted_hash"]);
    assert_ne!(early["ctime"], later["ctime"]);

    // A different payload fingerprints differently.
    let mut extra = Map::new();
    extra.insert("project".to_string(), json!("co-adsorption"));
    let other = codec::encode_at(&s, Some(&calc), &extra, fixed_now()).unwrap();
    assert_ne!(early["inserted_hash"], other["inserted_hash"]);
}

#[test]
fn test_derived_summary_fields() {
    let s = sample_structure();
    let doc = codec::encode(&s, None, &Map::new()).unwrap();
    let atoms = &doc["atoms"];
    assert_eq!(atoms["natoms"], json!(3));
    assert_eq!(atoms["chemical_symbols"], json!(["O", "Pt"]));
    assert_eq!(atoms["symbol_counts"], json!({"O": 1, "Pt": 2}));
    assert!(atoms["volume"].as_f64().unwrap() > 0.0);
    assert!(atoms["spacegroup"].is_string());
    assert!(atoms["mass"].as_f64().unwrap() > 390.0);
}

#[test]
fn test_volume_omitted_for_nonpositive_determinant() {
    let mut s = sample_structure();
    s.cell = Matrix3::zeros();
    let doc = codec::encode(&s, None, &Map::new()).unwrap();
    assert!(doc["atoms"].get("volume").is_none());
}

#[test]
fn test_required_quantities_are_omitted_not_null() {
    // A calculator that has results but flags every quantity as requiring
    // recomputation: nothing of it may appear in the document.
    struct StaleCalculator;
    impl Calculator for StaleCalculator {
        fn info(&self) -> CalculatorInfo {
            CalculatorInfo {
                module: "tests".to_string(),
                class: "StaleCalculator".to_string(),
                parameters: Default::default(),
            }
        }
        fn calculation_required(&self, _s: &AtomicStructure, _q: Quantity) -> bool {
            true
        }
        fn results(&self) -> CalculationResult {
            sample_result(3)
        }
    }

    let s = sample_structure();
    let doc = codec::encode(&s, Some(&StaleCalculator), &Map::new()).unwrap();
    let results = doc["results"].as_object().unwrap();
    assert!(results.is_empty());
}

#[test]
fn test_partial_results_omit_missing_keys() {
    let s = sample_structure();
    let calc = SinglePointCalculator::new(CalculationResult {
        energy: Some(-2.0),
        forces: None,
        stress: None,
        ensemble_energies: None,
    });
    let doc = codec::encode(&s, Some(&calc), &Map::new()).unwrap();
    let results = doc["results"].as_object().unwrap();
    assert_eq!(results.get("energy"), Some(&json!(-2.0)));
    assert!(!results.contains_key("forces"));
    assert!(!results.contains_key("fmax"));
    assert!(!results.contains_key("stress"));
    assert!(!results.contains_key("ensemble_energies"));
}

#[test]
fn test_fmax_and_smax_are_derived() {
    let s = sample_structure();
    let mut r = sample_result(s.len());
    r.forces = Some(vec![
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(0.0, -0.7, 0.0),
        Vector3::new(0.1, 0.0, 0.2),
    ]);
    let calc = SinglePointCalculator::new(r);
    let doc = codec::encode(&s, Some(&calc), &Map::new()).unwrap();
    assert_eq!(doc["results"]["fmax"], json!(0.7));
    assert_eq!(doc["results"]["smax"], json!(0.2));
}

#[test]
fn test_non_finite_position_is_an_error() {
    let mut s = sample_structure();
    s.atoms[1].position.y = f64::NAN;
    let err = codec::encode(&s, None, &Map::new()).unwrap_err();
    assert!(matches!(err, SerializationError::NonFinite { .. }));
}

#[test]
fn test_force_shape_mismatch_is_an_error() {
    let s = sample_structure();
    let calc = SinglePointCalculator::new(CalculationResult {
        energy: Some(-1.0),
        forces: Some(vec![Vector3::zeros()]), // 1 force for 3 atoms
        ..Default::default()
    });
    let err = codec::encode(&s, Some(&calc), &Map::new()).unwrap_err();
    assert!(matches!(err, SerializationError::ShapeMismatch { .. }));
}

#[test]
fn test_constraint_out_of_range_is_an_error() {
    let mut s = sample_structure();
    s.constraints.push(Constraint::FixCartesian {
        index: 99,
        mask: [true, true, false],
    });
    let err = codec::encode(&s, None, &Map::new()).unwrap_err();
    assert!(matches!(err, SerializationError::ConstraintOutOfRange { .. }));
}

#[test]
fn test_provenance_fields() {
    let s = sample_structure();
    let doc = codec::encode_at(&s, None, &Map::new(), fixed_now()).unwrap();
    assert!(doc["user"].is_string());
    assert_eq!(doc["inserted_hash"].as_str().unwrap().len(), 40);
    assert_eq!(doc["ctime"], doc["mtime"]);
    assert_eq!(doc["ctime"], json!(fixed_now().to_rfc3339()));
}

#[test]
fn test_extra_fields_are_merged() {
    let s = sample_structure();
    let mut extra = Map::new();
    extra.insert("project".to_string(), json!("co-adsorption"));
    let doc = codec::encode(&s, None, &extra).unwrap();
    assert_eq!(doc["project"], json!("co-adsorption"));
}
