//! Bootstrap of the initial cell population and its adjacency.

use crate::cell::{connect, Cell};
use crate::config::{GrowthConfig, InitShape};
use crate::ply::{self, BootstrapError};
use glam::DVec3;
use std::collections::HashMap;

/// Build the initial cell population for the configured shape, with
/// symmetric adjacency wired and rings rewritten into fan order.
pub fn create_geometry(config: &GrowthConfig) -> Result<Vec<Cell>, BootstrapError> {
    let mut cells = match config.init_shape {
        InitShape::Sphere => icosphere(config.sphere_subdivisions),
        InitShape::Plane => plane(config.plane_resolution, config.spring_length, 0),
        InitShape::Environment => plane(
            config.plane_resolution,
            config.spring_length,
            config.environment_border,
        ),
        InitShape::Mesh => {
            let path = config
                .mesh_path
                .as_deref()
                .ok_or(BootstrapError::MissingMeshPath)?;
            ply::load(path)?
        }
    };
    order_rings(&mut cells);
    Ok(cells)
}

/// Wire one cell per vertex, connecting the three edges of every triangle.
/// Normals come from `normals` when given, else from normalized positions.
pub(crate) fn cells_from_mesh(
    vertices: &[DVec3],
    normals: Option<&[DVec3]>,
    faces: &[[usize; 3]],
) -> Vec<Cell> {
    let mut cells: Vec<Cell> = vertices
        .iter()
        .enumerate()
        .map(|(row, &position)| {
            let mut cell = Cell::new(row as u32);
            cell.position = position;
            cell.normal = match normals {
                Some(table) => table[row].normalize_or(DVec3::Z),
                None => position.normalize_or(DVec3::Z),
            };
            cell
        })
        .collect();
    for face in faces {
        connect(&mut cells, face[0], face[1]);
        connect(&mut cells, face[0], face[2]);
        connect(&mut cells, face[1], face[2]);
    }
    cells
}

/// Rewrite every ring into fan order by greedy adjacency chaining.
///
/// Closed fans always chain; open boundary fans may not, and are left in
/// their original order (they freeze if they ever attempt to split).
pub fn order_rings(cells: &mut [Cell]) {
    let view: &[Cell] = cells;
    let ordered: Vec<Option<Vec<u32>>> = view.iter().map(|cell| fan_order(view, cell)).collect();
    for (cell, ring) in cells.iter_mut().zip(ordered) {
        if let Some(ring) = ring {
            cell.links = ring;
        }
    }
}

fn fan_order(cells: &[Cell], cell: &Cell) -> Option<Vec<u32>> {
    let ring = &cell.links;
    let k = ring.len();
    if k < 3 {
        return None;
    }
    let mut order = Vec::with_capacity(k);
    let mut used = vec![false; k];
    order.push(ring[0]);
    used[0] = true;
    for _ in 1..k {
        let last = *order.last().expect("order is non-empty") as usize;
        let next = ring
            .iter()
            .enumerate()
            .find(|&(slot, &candidate)| !used[slot] && cells[last].connected_to(candidate))?;
        used[next.0] = true;
        order.push(*next.1);
    }
    Some(order)
}

const GOLDEN: f64 = 1.618_033_988_749_895;

/// Subdivided icosahedron on the unit sphere; `normal = position`.
fn icosphere(subdivisions: u32) -> Vec<Cell> {
    let mut vertices: Vec<DVec3> = [
        [-1.0, GOLDEN, 0.0],
        [1.0, GOLDEN, 0.0],
        [-1.0, -GOLDEN, 0.0],
        [1.0, -GOLDEN, 0.0],
        [0.0, -1.0, GOLDEN],
        [0.0, 1.0, GOLDEN],
        [0.0, -1.0, -GOLDEN],
        [0.0, 1.0, -GOLDEN],
        [GOLDEN, 0.0, -1.0],
        [GOLDEN, 0.0, 1.0],
        [-GOLDEN, 0.0, -1.0],
        [-GOLDEN, 0.0, 1.0],
    ]
    .into_iter()
    .map(|v| DVec3::from_array(v).normalize())
    .collect();

    let mut faces: Vec<[usize; 3]> = vec![
        [0, 11, 5],
        [0, 5, 1],
        [0, 1, 7],
        [0, 7, 10],
        [0, 10, 11],
        [1, 5, 9],
        [5, 11, 4],
        [11, 10, 2],
        [10, 7, 6],
        [7, 1, 8],
        [3, 9, 4],
        [3, 4, 2],
        [3, 2, 6],
        [3, 6, 8],
        [3, 8, 9],
        [4, 9, 5],
        [2, 4, 11],
        [6, 2, 10],
        [8, 6, 7],
        [9, 8, 1],
    ];

    for _ in 0..subdivisions {
        let mut midpoints: HashMap<(usize, usize), usize> = HashMap::new();
        let mut next = Vec::with_capacity(faces.len() * 4);
        for face in &faces {
            let m01 = midpoint(face[0], face[1], &mut vertices, &mut midpoints);
            let m12 = midpoint(face[1], face[2], &mut vertices, &mut midpoints);
            let m20 = midpoint(face[2], face[0], &mut vertices, &mut midpoints);
            next.push([face[0], m01, m20]);
            next.push([face[1], m12, m01]);
            next.push([face[2], m20, m12]);
            next.push([m01, m12, m20]);
        }
        faces = next;
    }

    cells_from_mesh(&vertices, None, &faces)
}

fn midpoint(
    a: usize,
    b: usize,
    vertices: &mut Vec<DVec3>,
    cache: &mut HashMap<(usize, usize), usize>,
) -> usize {
    let key = if a < b { (a, b) } else { (b, a) };
    *cache.entry(key).or_insert_with(|| {
        let mid = ((vertices[a] + vertices[b]) * 0.5).normalize();
        vertices.push(mid);
        vertices.len() - 1
    })
}

/// Regular triangular grid in the XY plane, spaced at the spring rest
/// length. Rows and columns inside the `border` band become environs
/// scaffold cells (the ENVIRONMENT shape); `border = 0` yields a plain
/// PLANE.
fn plane(resolution: usize, spacing: f64, border: usize) -> Vec<Cell> {
    let n = resolution;
    let half = (n - 1) as f64 * 0.5;
    let row_height = spacing * 3.0_f64.sqrt() * 0.5;
    let vertices: Vec<DVec3> = (0..n * n)
        .map(|row| {
            let i = row % n;
            let j = row / n;
            // stagger odd rows for equilateral triangles
            let offset = if j % 2 == 1 { 0.5 } else { 0.0 };
            DVec3::new(
                (i as f64 - half + offset) * spacing,
                (j as f64 - half) * row_height,
                0.0,
            )
        })
        .collect();
    let normals = vec![DVec3::Z; vertices.len()];

    let mut faces = Vec::with_capacity(2 * (n - 1) * (n - 1));
    for j in 0..n - 1 {
        for i in 0..n - 1 {
            let v00 = j * n + i;
            let v10 = v00 + 1;
            let v01 = v00 + n;
            let v11 = v01 + 1;
            if j % 2 == 0 {
                faces.push([v00, v10, v01]);
                faces.push([v10, v11, v01]);
            } else {
                faces.push([v00, v10, v11]);
                faces.push([v00, v11, v01]);
            }
        }
    }

    let mut cells = cells_from_mesh(&vertices, Some(&normals), &faces);
    if border > 0 {
        for cell in &mut cells {
            let row = cell.index as usize;
            let i = row % n;
            let j = row / n;
            if i < border || j < border || i >= n - border || j >= n - border {
                cell.environs = true;
            }
        }
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GrowthConfig;

    fn assert_symmetric(cells: &[Cell]) {
        for cell in cells {
            for &link in &cell.links {
                assert!(cells[link as usize].connected_to(cell.index));
            }
        }
    }

    #[test]
    fn icosphere_counts_match_subdivision() {
        let base = icosphere(0);
        assert_eq!(base.len(), 12);
        let once = icosphere(1);
        assert_eq!(once.len(), 42);
        assert_symmetric(&once);
        for cell in &once {
            assert!((cell.position.length() - 1.0).abs() < 1e-12);
            assert!(cell.position.abs_diff_eq(cell.normal, 1e-12));
        }
    }

    #[test]
    fn sphere_rings_are_good_loops_after_ordering() {
        let config = GrowthConfig {
            sphere_subdivisions: 1,
            ..GrowthConfig::default()
        };
        let cells = create_geometry(&config).expect("sphere");
        for cell in &cells {
            assert!(
                cell.good_loop(&cells),
                "cell {} has no fan order",
                cell.index
            );
            assert!(cell.links.len() == 5 || cell.links.len() == 6);
        }
    }

    #[test]
    fn plane_interior_cells_have_six_neighbors() {
        let config = GrowthConfig {
            init_shape: InitShape::Plane,
            plane_resolution: 6,
            ..GrowthConfig::default()
        };
        let cells = create_geometry(&config).expect("plane");
        assert_eq!(cells.len(), 36);
        assert_symmetric(&cells);
        let interior: Vec<_> = cells
            .iter()
            .filter(|c| {
                let i = c.index as usize % 6;
                let j = c.index as usize / 6;
                (1..5).contains(&i) && (1..5).contains(&j)
            })
            .collect();
        assert!(!interior.is_empty());
        for cell in interior {
            assert_eq!(cell.links.len(), 6);
            assert!(cell.good_loop(&cells));
        }
    }

    #[test]
    fn environment_marks_scaffold_border() {
        let config = GrowthConfig {
            init_shape: InitShape::Environment,
            plane_resolution: 8,
            environment_border: 2,
            ..GrowthConfig::default()
        };
        let cells = create_geometry(&config).expect("environment");
        let live = cells.iter().filter(|c| !c.environs).count();
        assert_eq!(live, 16, "8x8 grid with border 2 leaves a 4x4 live patch");
        // scaffold cells still appear in live cells' rings
        let seam = cells
            .iter()
            .filter(|c| !c.environs)
            .any(|c| c.links.iter().any(|&l| cells[l as usize].environs));
        assert!(seam);
    }

    #[test]
    fn missing_mesh_path_is_a_bootstrap_error() {
        let config = GrowthConfig {
            init_shape: InitShape::Mesh,
            ..GrowthConfig::default()
        };
        assert!(matches!(
            create_geometry(&config),
            Err(BootstrapError::MissingMeshPath)
        ));
    }
}
