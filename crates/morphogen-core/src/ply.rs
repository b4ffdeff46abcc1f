//! ASCII PLY mesh loading for the MESH init shape.
//!
//! One cell is created per vertex row, with its `index` equal to the row
//! index; normals come from the normal columns when present, otherwise from
//! the normalized position; every face contributes its three edges through
//! `connect`. Failures are fatal before the frame loop begins and carry the
//! offending path.

use crate::cell::Cell;
use crate::geometry::cells_from_mesh;
use glam::DVec3;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while bootstrapping the initial mesh.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("couldn't load mesh from [{path}]: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("couldn't parse mesh from [{path}] (line {line}): {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("init_shape = mesh requires mesh_path")]
    MissingMeshPath,
}

/// Load a triangulated ASCII PLY file into a wired cell population.
pub fn load(path: &Path) -> Result<Vec<Cell>, BootstrapError> {
    let text = std::fs::read_to_string(path).map_err(|source| BootstrapError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text).map_err(|(line, message)| BootstrapError::Parse {
        path: path.to_path_buf(),
        line,
        message,
    })
}

struct VertexLayout {
    position: [usize; 3],
    normal: Option<[usize; 3]>,
    width: usize,
}

/// Parse ASCII PLY text. Errors carry `(line number, message)`.
pub(crate) fn parse(text: &str) -> Result<Vec<Cell>, (usize, String)> {
    let mut lines = text.lines().enumerate();

    let mut vertex_count: Option<usize> = None;
    let mut face_count: Option<usize> = None;
    let mut vertex_properties: Vec<String> = Vec::new();
    let mut current_element: Option<String> = None;

    let (line_no, first) = lines
        .next()
        .ok_or((0, "empty file".to_string()))?;
    if first.trim() != "ply" {
        return Err((line_no + 1, "missing ply magic".to_string()));
    }

    let mut header_end = 0;
    for (line_no, line) in lines.by_ref() {
        let line = line.trim();
        let mut words = line.split_whitespace();
        match words.next() {
            Some("format") => {
                if words.next() != Some("ascii") {
                    return Err((line_no + 1, "only ascii format is supported".to_string()));
                }
            }
            Some("comment") | Some("obj_info") | None => {}
            Some("element") => {
                let name = words
                    .next()
                    .ok_or((line_no + 1, "element without a name".to_string()))?;
                let count: usize = words
                    .next()
                    .and_then(|w| w.parse().ok())
                    .ok_or((line_no + 1, format!("bad count for element {name}")))?;
                match name {
                    "vertex" => vertex_count = Some(count),
                    "face" => face_count = Some(count),
                    _ => {}
                }
                current_element = Some(name.to_string());
            }
            Some("property") => {
                if current_element.as_deref() == Some("vertex") {
                    if let Some(name) = words.last() {
                        vertex_properties.push(name.to_string());
                    }
                }
            }
            Some("end_header") => {
                header_end = line_no + 1;
                break;
            }
            Some(other) => {
                return Err((line_no + 1, format!("unexpected header keyword {other}")));
            }
        }
    }
    if header_end == 0 {
        return Err((0, "header never ended".to_string()));
    }
    let vertex_count = vertex_count.ok_or((header_end, "no vertex element".to_string()))?;
    let face_count = face_count.ok_or((header_end, "no face element".to_string()))?;
    let layout = vertex_layout(&vertex_properties).ok_or((
        header_end,
        "vertex element lacks x/y/z properties".to_string(),
    ))?;

    let mut vertices = Vec::with_capacity(vertex_count);
    let mut normals = layout.normal.map(|_| Vec::with_capacity(vertex_count));
    for _ in 0..vertex_count {
        let (line_no, line) = lines
            .next()
            .ok_or((header_end, "vertex table ended early".to_string()))?;
        let row: Vec<f64> = line
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|e| (line_no + 1, format!("bad vertex row: {e}")))?;
        if row.len() < layout.width {
            return Err((line_no + 1, "short vertex row".to_string()));
        }
        vertices.push(DVec3::new(
            row[layout.position[0]],
            row[layout.position[1]],
            row[layout.position[2]],
        ));
        if let (Some(normals), Some(cols)) = (normals.as_mut(), layout.normal) {
            normals.push(DVec3::new(row[cols[0]], row[cols[1]], row[cols[2]]));
        }
    }

    let mut faces = Vec::with_capacity(face_count);
    for _ in 0..face_count {
        let (line_no, line) = lines
            .next()
            .ok_or((header_end, "face table ended early".to_string()))?;
        let row: Vec<usize> = line
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|e| (line_no + 1, format!("bad face row: {e}")))?;
        match row.as_slice() {
            [3, a, b, c] => {
                for &v in &[*a, *b, *c] {
                    if v >= vertex_count {
                        return Err((
                            line_no + 1,
                            format!("face references vertex {v} of {vertex_count}"),
                        ));
                    }
                }
                faces.push([*a, *b, *c]);
            }
            [n, ..] => {
                return Err((line_no + 1, format!("expected triangles, got {n}-gon")));
            }
            [] => return Err((line_no + 1, "empty face row".to_string())),
        }
    }

    Ok(cells_from_mesh(&vertices, normals.as_deref(), &faces))
}

fn vertex_layout(properties: &[String]) -> Option<VertexLayout> {
    let col = |name: &str| properties.iter().position(|p| p == name);
    let position = [col("x")?, col("y")?, col("z")?];
    let normal = match (col("nx"), col("ny"), col("nz")) {
        (Some(nx), Some(ny), Some(nz)) => Some([nx, ny, nz]),
        _ => None,
    };
    let mut width = position.iter().copied().max().unwrap_or(0);
    if let Some(cols) = normal {
        width = width.max(cols.iter().copied().max().unwrap_or(0));
    }
    Some(VertexLayout {
        position,
        normal,
        width: width + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TETRAHEDRON: &str = "\
ply
format ascii 1.0
element vertex 4
property double x
property double y
property double z
element face 4
property list uchar int vertex_indices
end_header
1 1 1
1 -1 -1
-1 1 -1
-1 -1 1
3 0 1 2
3 0 1 3
3 0 2 3
3 1 2 3
";

    #[test]
    fn parses_a_tetrahedron() {
        let cells = parse(TETRAHEDRON).expect("tetrahedron");
        assert_eq!(cells.len(), 4);
        for cell in &cells {
            assert_eq!(cell.links.len(), 3, "tetrahedron is fully connected");
            assert!((cell.normal.length() - 1.0).abs() < 1e-12);
        }
        assert_eq!(cells[2].index, 2);
        assert_eq!(cells[0].position, DVec3::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn reads_normals_when_present() {
        let text = "\
ply
format ascii 1.0
element vertex 3
property double x
property double y
property double z
property double nx
property double ny
property double nz
element face 1
property list uchar int vertex_indices
end_header
0 0 0 0 0 2
1 0 0 0 0 2
0 1 0 0 0 2
3 0 1 2
";
        let cells = parse(text).expect("normals");
        for cell in &cells {
            assert_eq!(cell.normal, DVec3::Z, "normals are normalized on load");
        }
    }

    #[test]
    fn rejects_binary_and_polygonal_files() {
        let binary = "ply\nformat binary_little_endian 1.0\nend_header\n";
        assert!(parse(binary).is_err());

        let quad = TETRAHEDRON.replace("3 0 1 2", "4 0 1 2 3");
        let err = parse(&quad).expect_err("quads rejected");
        assert!(err.1.contains("4-gon"));
    }

    #[test]
    fn load_reports_the_path() {
        let missing = Path::new("/nonexistent/blob.ply");
        let err = load(missing).expect_err("missing file");
        assert!(err.to_string().contains("/nonexistent/blob.ply"));
    }
}
