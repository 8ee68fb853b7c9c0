use nalgebra::{Matrix3, Vector3};
use qeglue::atoms::{Atom, AtomicStructure};
use qeglue::calculator::{Calculator, Quantity};
use qeglue::engine::{DftEngine, EngineFactory, EngineParameters, Result, StartMode};
use qeglue::warmstart::{WarmStartCalculator, POSITION_TOLERANCE};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Created { mode: StartMode, outdir: PathBuf },
    Calculated,
    SavedDensity(PathBuf),
    LoadedDensity(PathBuf),
    Stopped,
}

type EventLog = Rc<RefCell<Vec<Event>>>;

struct MockEngine {
    log: EventLog,
    energy: f64,
    computed: bool,
    forces: Vec<Vector3<f64>>,
}

impl DftEngine for MockEngine {
    fn calculate(&mut self, structure: &AtomicStructure) -> Result<()> {
        self.log.borrow_mut().push(Event::Calculated);
        self.computed = true;
        self.forces = vec![Vector3::new(0.0, 0.0, 0.1); structure.len()];
        Ok(())
    }

    fn free_energy(&self) -> Option<f64> {
        self.computed.then_some(self.energy)
    }

    fn zero_energy(&self) -> Option<f64> {
        self.computed.then_some(self.energy + 0.001)
    }

    fn forces(&self) -> Option<&[Vector3<f64>]> {
        self.computed.then_some(self.forces.as_slice())
    }

    fn stress(&self) -> Option<[f64; 6]> {
        None
    }

    fn ensemble_energies(&self) -> Option<Vec<f64>> {
        None
    }

    fn save_density(&self, archive: &Path) -> Result<()> {
        self.log
            .borrow_mut()
            .push(Event::SavedDensity(archive.to_path_buf()));
        Ok(())
    }

    fn load_density(&mut self, archive: &Path) -> Result<()> {
        self.log
            .borrow_mut()
            .push(Event::LoadedDensity(archive.to_path_buf()));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.log.borrow_mut().push(Event::Stopped);
        Ok(())
    }
}

struct MockFactory {
    log: EventLog,
    created: RefCell<usize>,
}

impl MockFactory {
    fn new(log: EventLog) -> Self {
        Self {
            log,
            created: RefCell::new(0),
        }
    }
}

impl EngineFactory for MockFactory {
    fn create(&self, params: &EngineParameters) -> Result<Box<dyn DftEngine>> {
        let n = {
            let mut created = self.created.borrow_mut();
            *created += 1;
            *created
        };
        self.log.borrow_mut().push(Event::Created {
            mode: params.start_mode,
            outdir: params.outdir.clone(),
        });
        Ok(Box::new(MockEngine {
            log: Rc::clone(&self.log),
            energy: -10.0 - n as f64,
            computed: false,
            forces: Vec::new(),
        }))
    }
}

fn dimer() -> AtomicStructure {
    let atoms = vec![
        Atom::new("H", Vector3::new(0.0, 0.0, 0.0)),
        Atom::new("H", Vector3::new(0.0, 0.0, 0.74)),
    ];
    AtomicStructure::new(atoms, Matrix3::identity() * 10.0, [true; 3])
}

fn shifted(base: &AtomicStructure, index: usize, dz: f64) -> AtomicStructure {
    let mut s = base.clone();
    s.atoms[index].position.z += dz;
    s
}

fn adapter(log: &EventLog) -> WarmStartCalculator {
    WarmStartCalculator::new(
        Box::new(MockFactory::new(Rc::clone(log))),
        BTreeMap::new(),
        "out",
    )
}

fn calc_count(log: &EventLog) -> usize {
    log.borrow()
        .iter()
        .filter(|e| **e == Event::Calculated)
        .count()
}

#[test]
fn test_first_solve_is_fresh_and_archives_density() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut calc = adapter(&log);
    let s0 = dimer();

    let energy = calc.get_potential_energy(&s0, true).unwrap();
    assert_eq!(energy, -11.0);

    let archive = calc.density_archive().to_path_buf();
    assert_eq!(archive, PathBuf::from("out_equi.tgz"));
    assert_eq!(
        *log.borrow(),
        vec![
            Event::Created {
                mode: StartMode::FromScratch,
                outdir: PathBuf::from("out_0000"),
            },
            Event::Calculated,
            Event::SavedDensity(archive),
        ]
    );
}

#[test]
fn test_unmoved_structure_reuses_cached_results() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut calc = adapter(&log);
    let s0 = dimer();

    let e1 = calc.get_potential_energy(&s0, false).unwrap();
    let e2 = calc.get_potential_energy(&s0, false).unwrap();
    let forces = calc.get_forces(&s0).unwrap();

    assert_eq!(e1, e2);
    assert_eq!(forces.len(), 2);
    assert_eq!(calc_count(&log), 1);
}

#[test]
fn test_displaced_structure_loads_density_then_solves_then_stops() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut calc = adapter(&log);
    let s0 = dimer();
    calc.get_potential_energy(&s0, false).unwrap();
    log.borrow_mut().clear();

    let s1 = shifted(&s0, 1, 1e-6);
    calc.get_potential_energy(&s1, false).unwrap();

    let archive = calc.density_archive().to_path_buf();
    assert_eq!(
        *log.borrow(),
        vec![
            Event::Created {
                mode: StartMode::FromFile,
                outdir: PathBuf::from("out_0001"),
            },
            Event::LoadedDensity(archive),
            Event::Calculated,
            Event::Stopped,
        ]
    );
}

#[test]
fn test_output_directory_counter_increments_per_run() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut calc = adapter(&log);
    let s0 = dimer();

    calc.get_potential_energy(&s0, false).unwrap();
    calc.get_potential_energy(&shifted(&s0, 1, 0.01), false).unwrap();
    calc.get_potential_energy(&shifted(&s0, 1, -0.01), false).unwrap();

    let outdirs: Vec<PathBuf> = log
        .borrow()
        .iter()
        .filter_map(|e| match e {
            Event::Created { outdir, .. } => Some(outdir.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        outdirs,
        vec![
            PathBuf::from("out_0000"),
            PathBuf::from("out_0001"),
            PathBuf::from("out_0002"),
        ]
    );
}

#[test]
fn test_displacement_tolerance_is_a_strict_inequality() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut calc = adapter(&log);
    let s0 = dimer();
    calc.get_potential_energy(&s0, false).unwrap();

    // A delta of exactly the tolerance keeps the cache valid.
    let on_boundary = shifted(&s0, 0, POSITION_TOLERANCE);
    calc.get_potential_energy(&on_boundary, false).unwrap();
    assert_eq!(calc_count(&log), 1);

    let beyond = shifted(&s0, 0, 10.0 * POSITION_TOLERANCE);
    calc.get_potential_energy(&beyond, false).unwrap();
    assert_eq!(calc_count(&log), 2);
}

#[test]
fn test_atom_count_change_invalidates_cache() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut calc = adapter(&log);
    let s0 = dimer();
    calc.get_potential_energy(&s0, false).unwrap();

    let mut trimer = s0.clone();
    trimer.atoms.push(Atom::new("H", Vector3::new(0.0, 0.0, 1.48)));
    calc.get_potential_energy(&trimer, false).unwrap();
    assert_eq!(calc_count(&log), 2);
}

#[test]
fn test_energy_selection_by_consistency_flag() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut calc = adapter(&log);
    let s0 = dimer();

    let free = calc.get_potential_energy(&s0, true).unwrap();
    let zero = calc.get_potential_energy(&s0, false).unwrap();
    assert_eq!(free, -11.0);
    assert_eq!(zero, -11.0 + 0.001);
    assert_eq!(calc_count(&log), 1);
}

#[test]
fn test_calculator_trait_reports_requirements() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut calc = adapter(&log);
    let s0 = dimer();

    assert!(calc.calculation_required(&s0, Quantity::Energy));
    calc.get_potential_energy(&s0, false).unwrap();
    assert!(!calc.calculation_required(&s0, Quantity::Energy));
    assert!(!calc.calculation_required(&s0, Quantity::Forces));
    // The mock never produces stress.
    assert!(calc.calculation_required(&s0, Quantity::Stress));

    let moved = shifted(&s0, 1, 0.1);
    assert!(calc.calculation_required(&moved, Quantity::Energy));

    let results = calc.results();
    assert_eq!(results.energy, Some(-11.0 + 0.001));
    assert_eq!(results.forces.map(|f| f.len()), Some(2));
    assert!(results.stress.is_none());
}
