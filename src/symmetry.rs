//! Space-group label derivation.
//!
//! The stored `spacegroup` field exists for coarse symmetry bucketing in
//! queries. Full space-group determination belongs to a dedicated symmetry
//! library; this module derives the highest symmetry it can prove from the
//! cell metric alone. Monatomic structures on a recognized Bravais lattice
//! get that lattice's group label; everything else falls back to the label
//! every structure satisfies, "P1 (1)".

use crate::atoms::AtomicStructure;

const LENGTH_RTOL: f64 = 1e-5;
const ANGLE_TOL_DEG: f64 = 1e-3;

fn close(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol
}

fn lengths_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= LENGTH_RTOL * a.abs().max(b.abs())
}

/// Cell edge lengths and angles (a, b, c, alpha, beta, gamma), with angles
/// in degrees. Alpha is the angle between the b and c vectors.
pub fn cell_metric(structure: &AtomicStructure) -> ([f64; 3], [f64; 3]) {
    let rows: Vec<_> = (0..3)
        .map(|i| structure.cell.row(i).transpose())
        .collect();
    let lens = [rows[0].norm(), rows[1].norm(), rows[2].norm()];

    let angle = |i: usize, j: usize| -> f64 {
        let denom = lens[i] * lens[j];
        if denom == 0.0 {
            return 0.0;
        }
        let cos = (rows[i].dot(&rows[j]) / denom).clamp(-1.0, 1.0);
        cos.acos().to_degrees()
    };

    (lens, [angle(1, 2), angle(0, 2), angle(0, 1)])
}

/// Derives a space-group label for the structure.
pub fn spacegroup(structure: &AtomicStructure) -> String {
    let (lens, angs) = cell_metric(structure);
    let [a, b, c] = lens;
    if a == 0.0 || b == 0.0 || c == 0.0 || structure.is_empty() {
        return "P1 (1)".to_string();
    }
    // Only a one-atom basis lets the lattice metric decide the group.
    if structure.len() != 1 {
        return "P1 (1)".to_string();
    }

    let all_angles = |v: f64| angs.iter().all(|&x| close(x, v, ANGLE_TOL_DEG));
    let angles_equal = close(angs[0], angs[1], ANGLE_TOL_DEG) && close(angs[1], angs[2], ANGLE_TOL_DEG);
    let edges_equal = lengths_equal(a, b) && lengths_equal(b, c);

    if edges_equal && all_angles(90.0) {
        return "Pm-3m (221)".to_string();
    }
    if edges_equal && all_angles(60.0) {
        // Primitive cell of the face-centered cubic lattice.
        return "Fm-3m (225)".to_string();
    }
    if edges_equal && all_angles(109.471_220_634) {
        // Primitive cell of the body-centered cubic lattice.
        return "Im-3m (229)".to_string();
    }
    if edges_equal && angles_equal {
        return "R-3m (166)".to_string();
    }
    if lengths_equal(a, b)
        && close(angs[0], 90.0, ANGLE_TOL_DEG)
        && close(angs[1], 90.0, ANGLE_TOL_DEG)
        && close(angs[2], 120.0, ANGLE_TOL_DEG)
    {
        return "P6/mmm (191)".to_string();
    }
    if lengths_equal(a, b) && all_angles(90.0) {
        return "P4/mmm (123)".to_string();
    }
    if all_angles(90.0) {
        return "Pmmm (47)".to_string();
    }
    let right_angles = angs.iter().filter(|&&x| close(x, 90.0, ANGLE_TOL_DEG)).count();
    if right_angles == 2 {
        return "P2/m (10)".to_string();
    }
    "P-1 (2)".to_string()
}
