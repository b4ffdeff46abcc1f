//! Dense mesh snapshot for the export boundary.

use crate::cell::Cell;
use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Vertex, normal, and face tables derived from the current cells.
///
/// Rows are indexed by `cell.index`. Faces are emitted per cell as
/// `(cell, links[i + 1], links[i])` around the whole ring, so triangles
/// shared by several cells appear several times; the snapshot is meant for
/// rendering, not manifold processing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeshSnapshot {
    pub vertices: Vec<DVec3>,
    pub normals: Vec<DVec3>,
    pub faces: Vec<[u32; 3]>,
}

impl MeshSnapshot {
    /// Derive the three tables from a cell population.
    #[must_use]
    pub fn from_cells(cells: &[Cell]) -> Self {
        let mut vertices = vec![DVec3::ZERO; cells.len()];
        let mut normals = vec![DVec3::ZERO; cells.len()];
        for cell in cells {
            vertices[cell.index as usize] = cell.position;
            normals[cell.index as usize] = cell.normal;
        }

        let face_count: usize = cells.iter().map(|c| c.links.len()).sum();
        let mut faces = Vec::with_capacity(face_count);
        for cell in cells {
            let k = cell.links.len();
            for i in 0..k {
                faces.push([cell.index, cell.links[(i + 1) % k], cell.links[i]]);
            }
        }

        Self {
            vertices,
            normals,
            faces,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::connect;

    #[test]
    fn snapshot_emits_one_face_per_link() {
        let mut cells: Vec<Cell> = (0..3).map(Cell::new).collect();
        cells[1].position = DVec3::X;
        cells[2].position = DVec3::Y;
        connect(&mut cells, 0, 1);
        connect(&mut cells, 0, 2);
        connect(&mut cells, 1, 2);

        let snapshot = MeshSnapshot::from_cells(&cells);
        assert_eq!(snapshot.vertices.len(), 3);
        assert_eq!(snapshot.vertices[1], DVec3::X);
        let expected: usize = cells.iter().map(|c| c.links.len()).sum();
        assert_eq!(snapshot.faces.len(), expected);
        // cell 0's fan: (0, links[1], links[0]) then (0, links[0], links[1])
        assert_eq!(snapshot.faces[0], [0, 2, 1]);
        assert_eq!(snapshot.faces[1], [0, 1, 2]);
    }
}
