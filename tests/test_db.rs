use nalgebra::{Matrix3, Vector3};
use qeglue::atoms::{Atom, AtomicStructure};
use qeglue::calculator::{CalculationResult, SinglePointCalculator};
use qeglue::codec;
use qeglue::db::{AtomsDatabase, DocumentStore, Filter, JsonlStore};
use serde_json::{json, Map};
use tempfile::TempDir;

fn molecule(symbols: &[&str]) -> AtomicStructure {
    let atoms = symbols
        .iter()
        .enumerate()
        .map(|(i, s)| Atom::new(*s, Vector3::new(0.0, 0.0, i as f64)))
        .collect();
    AtomicStructure::new(atoms, Matrix3::identity() * 10.0, [true; 3])
}

fn encoded(structure: &AtomicStructure, energy: f64) -> serde_json::Value {
    let calc = SinglePointCalculator::new(CalculationResult {
        energy: Some(energy),
        ..Default::default()
    });
    codec::encode(structure, Some(&calc), &Map::new()).unwrap()
}

#[test]
fn test_find_on_fresh_collection_yields_nothing() {
    let dir = TempDir::new().unwrap();
    let store = JsonlStore::open(dir.path().join("atoms.jsonl")).unwrap();
    let db = AtomsDatabase::new(store);

    let hits: Vec<_> = db
        .find(&Filter::new())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(hits.is_empty());
    assert_eq!(db.get_atoms(&Filter::new()).unwrap().count(), 0);
}

#[test]
fn test_insert_assigns_sequential_ids_and_never_dedupes() {
    let dir = TempDir::new().unwrap();
    let mut store = JsonlStore::open(dir.path().join("atoms.jsonl")).unwrap();

    let doc = encoded(&molecule(&["H", "H"]), -1.0);
    assert_eq!(store.insert(&doc).unwrap(), 0);
    assert_eq!(store.insert(&doc).unwrap(), 1);

    let all: Vec<_> = store
        .find(&Filter::new())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(all.len(), 2);
}

#[test]
fn test_reopen_continues_id_sequence() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("atoms.jsonl");
    let doc = encoded(&molecule(&["H"]), -0.5);

    let mut store = JsonlStore::open(&path).unwrap();
    store.insert(&doc).unwrap();
    store.insert(&doc).unwrap();
    drop(store);

    let mut store = JsonlStore::open(&path).unwrap();
    assert_eq!(store.insert(&doc).unwrap(), 2);
}

#[test]
fn test_write_merges_extra_fields() {
    let dir = TempDir::new().unwrap();
    let store = JsonlStore::open(dir.path().join("atoms.jsonl")).unwrap();
    let mut db = AtomsDatabase::new(store);

    let mut extra = Map::new();
    extra.insert("project".to_string(), json!("dissociation"));
    db.write(encoded(&molecule(&["H", "H"]), -1.0), &extra).unwrap();

    let mut filter = Filter::new();
    filter.insert("project".to_string(), json!("dissociation"));
    let hits: Vec<_> = db
        .find(&filter)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["atoms"]["natoms"], json!(2));
}

#[test]
fn test_get_atoms_decodes_matching_documents() {
    let dir = TempDir::new().unwrap();
    let store = JsonlStore::open(dir.path().join("atoms.jsonl")).unwrap();
    let mut db = AtomsDatabase::new(store);

    let dimer = molecule(&["H", "H"]);
    let water = molecule(&["O", "H", "H"]);
    db.write(encoded(&dimer, -1.0), &Map::new()).unwrap();
    db.write(encoded(&water, -14.2), &Map::new()).unwrap();

    let mut filter = Filter::new();
    filter.insert("atoms.natoms".to_string(), json!(3));
    let hits: Vec<_> = db
        .get_atoms(&filter)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(hits.len(), 1);
    let (structure, results) = &hits[0];
    assert_eq!(*structure, water);
    assert_eq!(results.energy, Some(-14.2));
    assert!(results.forces.is_none());
}

#[test]
fn test_filter_on_nested_result_fields() {
    let dir = TempDir::new().unwrap();
    let store = JsonlStore::open(dir.path().join("atoms.jsonl")).unwrap();
    let mut db = AtomsDatabase::new(store);

    db.write(encoded(&molecule(&["H", "H"]), -1.0), &Map::new()).unwrap();
    db.write(encoded(&molecule(&["H", "H"]), -2.0), &Map::new()).unwrap();

    let mut filter = Filter::new();
    filter.insert("results.energy".to_string(), json!(-2.0));
    let hits: Vec<_> = db
        .find(&filter)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(hits.len(), 1);
}

#[test]
fn test_no_match_yields_empty_iterator() {
    let dir = TempDir::new().unwrap();
    let store = JsonlStore::open(dir.path().join("atoms.jsonl")).unwrap();
    let mut db = AtomsDatabase::new(store);
    db.write(encoded(&molecule(&["H"]), -0.5), &Map::new()).unwrap();

    let mut filter = Filter::new();
    filter.insert("atoms.natoms".to_string(), json!(99));
    assert_eq!(db.find(&filter).unwrap().count(), 0);
}
