//! Gmsh interoperability: MSH 2.2 ASCII files and `.geo` regeneration for
//! remeshing.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{Result, SculptError};
use crate::mesh::Mesh;

const TRIANGLE: usize = 2;
const TETRAHEDRON: usize = 4;

/// A mesh read from a Gmsh file together with the Gmsh tag of every vertex.
#[derive(Debug, Clone)]
pub struct GmshMesh {
    pub mesh: Mesh,
    pub node_tags: Vec<usize>,
}

/// Reads an ASCII MSH 2.2 file.
///
/// The cells are the tetrahedra if the file contains any, the triangles
/// otherwise. Nodes that belong to no cell are dropped.
pub fn read_msh(path: &Path) -> Result<GmshMesh> {
    let file = fs::File::open(path)?;
    let lines: Vec<String> = BufReader::new(file).lines().collect::<std::io::Result<_>>()?;
    let mut cursor = lines.iter().map(|l| l.trim());

    let mut nodes: HashMap<usize, [f64; 3]> = HashMap::new();
    let mut triangles: Vec<[usize; 3]> = Vec::new();
    let mut tetrahedra: Vec<[usize; 4]> = Vec::new();

    while let Some(line) = cursor.next() {
        match line {
            "$MeshFormat" => {
                let header = cursor
                    .next()
                    .ok_or_else(|| SculptError::mesh_format(path, "truncated $MeshFormat"))?;
                let version = header.split_whitespace().next().unwrap_or("");
                if !version.starts_with("2.") {
                    return Err(SculptError::mesh_format(
                        path,
                        format!("unsupported MSH version {version}, expected 2.2"),
                    ));
                }
                if header.split_whitespace().nth(1) != Some("0") {
                    return Err(SculptError::mesh_format(path, "binary MSH files are not supported"));
                }
            }
            "$Nodes" => {
                let count = parse_count(path, cursor.next())?;
                for _ in 0..count {
                    let entry = cursor
                        .next()
                        .ok_or_else(|| SculptError::mesh_format(path, "truncated $Nodes"))?;
                    let fields = parse_numbers::<f64>(path, entry)?;
                    if fields.len() < 4 {
                        return Err(SculptError::mesh_format(path, format!("bad node line `{entry}`")));
                    }
                    nodes.insert(fields[0] as usize, [fields[1], fields[2], fields[3]]);
                }
            }
            "$Elements" => {
                let count = parse_count(path, cursor.next())?;
                for _ in 0..count {
                    let entry = cursor
                        .next()
                        .ok_or_else(|| SculptError::mesh_format(path, "truncated $Elements"))?;
                    let fields = parse_numbers::<usize>(path, entry)?;
                    if fields.len() < 3 || fields.len() < 3 + fields[2] {
                        return Err(SculptError::mesh_format(path, format!("bad element line `{entry}`")));
                    }
                    let element_type = fields[1];
                    let vertices = &fields[3 + fields[2]..];
                    match (element_type, vertices.len()) {
                        (TRIANGLE, 3) => triangles.push([vertices[0], vertices[1], vertices[2]]),
                        (TETRAHEDRON, 4) => {
                            tetrahedra.push([vertices[0], vertices[1], vertices[2], vertices[3]])
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let (dim, element_tags): (usize, Vec<usize>) = if !tetrahedra.is_empty() {
        (3, tetrahedra.iter().flatten().copied().collect())
    } else if !triangles.is_empty() {
        (2, triangles.iter().flatten().copied().collect())
    } else {
        return Err(SculptError::mesh_format(path, "no triangles or tetrahedra found"));
    };

    let mut node_tags: Vec<usize> = element_tags.clone();
    node_tags.sort_unstable();
    node_tags.dedup();
    let index: HashMap<usize, usize> = node_tags.iter().enumerate().map(|(i, &t)| (t, i)).collect();

    let mut coordinates = Vec::with_capacity(node_tags.len() * dim);
    for tag in &node_tags {
        let point = nodes
            .get(tag)
            .ok_or_else(|| SculptError::mesh_format(path, format!("element references unknown node {tag}")))?;
        coordinates.extend_from_slice(&point[..dim]);
    }
    let cells = element_tags.iter().map(|t| index[t]).collect();

    debug!(path = %path.display(), vertices = node_tags.len(), dim, "read gmsh mesh");
    Ok(GmshMesh {
        mesh: Mesh::new(dim, coordinates, cells)?,
        node_tags,
    })
}

fn parse_count(path: &Path, line: Option<&str>) -> Result<usize> {
    line.and_then(|l| l.parse().ok())
        .ok_or_else(|| SculptError::mesh_format(path, "missing entity count"))
}

fn parse_numbers<T: std::str::FromStr>(path: &Path, line: &str) -> Result<Vec<T>> {
    line.split_whitespace()
        .map(|token| {
            token
                .parse()
                .map_err(|_| SculptError::mesh_format(path, format!("cannot parse `{token}`")))
        })
        .collect()
}

/// Writes `mesh` as an ASCII MSH 2.2 file with a single physical group.
pub fn write_msh(mesh: &Mesh, path: &Path) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    writeln!(out, "$MeshFormat\n2.2 0 8\n$EndMeshFormat")?;
    writeln!(out, "$Nodes\n{}", mesh.num_vertices())?;
    for v in 0..mesh.num_vertices() {
        let p = mesh.vertex(v);
        let z = if mesh.dim() == 3 { p[2] } else { 0.0 };
        writeln!(out, "{} {:.16e} {:.16e} {:.16e}", v + 1, p[0], p[1], z)?;
    }
    writeln!(out, "$EndNodes")?;
    let element_type = if mesh.dim() == 2 { TRIANGLE } else { TETRAHEDRON };
    writeln!(out, "$Elements\n{}", mesh.num_cells())?;
    for c in 0..mesh.num_cells() {
        write!(out, "{} {element_type} 2 1 1", c + 1)?;
        for &v in mesh.cell(c) {
            write!(out, " {}", v + 1)?;
        }
        writeln!(out)?;
    }
    writeln!(out, "$EndElements")?;
    out.flush()?;
    Ok(())
}

/// Copies `original` to `output`, replacing the coordinates of the nodes in
/// `node_tags` by the current coordinates of `mesh`.
///
/// Everything else (physical groups, lower-dimensional elements) is kept so that
/// the file can be fed back to Gmsh.
pub fn write_out_mesh(mesh: &Mesh, node_tags: &[usize], original: &Path, output: &Path) -> Result<()> {
    if node_tags.len() != mesh.num_vertices() {
        return Err(SculptError::invalid_input(
            "write_out_mesh",
            format!(
                "{} node tags for a mesh with {} vertices",
                node_tags.len(),
                mesh.num_vertices()
            ),
        ));
    }
    let vertex_of: HashMap<usize, usize> = node_tags.iter().enumerate().map(|(v, &t)| (t, v)).collect();
    let text = fs::read_to_string(original)?;
    let mut out = BufWriter::new(fs::File::create(output)?);

    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        writeln!(out, "{line}")?;
        if line.trim() != "$Nodes" {
            continue;
        }
        let count_line = lines
            .next()
            .ok_or_else(|| SculptError::mesh_format(original, "truncated $Nodes"))?;
        writeln!(out, "{count_line}")?;
        let count = parse_count(original, Some(count_line.trim()))?;
        for _ in 0..count {
            let entry = lines
                .next()
                .ok_or_else(|| SculptError::mesh_format(original, "truncated $Nodes"))?;
            let tag: usize = entry
                .split_whitespace()
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| SculptError::mesh_format(original, format!("bad node line `{entry}`")))?;
            match vertex_of.get(&tag) {
                Some(&v) => {
                    let p = mesh.vertex(v);
                    let z = if mesh.dim() == 3 { p[2] } else { 0.0 };
                    writeln!(out, "{tag} {:.16e} {:.16e} {:.16e}", p[0], p[1], z)?;
                }
                None => writeln!(out, "{entry}")?,
            }
        }
    }
    out.flush()?;
    Ok(())
}

/// Writes the `.geo` file used for remeshing: the deformed mesh is merged and
/// turned into a geometry, and the size-field and option lines of the original
/// `.geo` file are carried over.
pub fn generate_remesh_geo(original_geo: &Path, input_mesh: &Path, output: &Path) -> Result<()> {
    let original = fs::read_to_string(original_geo)?;
    let file_name = input_mesh
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| SculptError::invalid_input("generate_remesh_geo", "mesh path has no file name"))?;

    let mut out = BufWriter::new(fs::File::create(output)?);
    writeln!(out, "Merge '{file_name}';")?;
    writeln!(out, "CreateGeometry;")?;
    writeln!(out)?;
    for line in original.lines() {
        if keep_geo_line(line) {
            writeln!(out, "{line}")?;
        }
    }
    out.flush()?;
    Ok(())
}

fn keep_geo_line(line: &str) -> bool {
    line.chars().next().is_some_and(char::is_lowercase)
        || line.starts_with("Field")
        || line.starts_with("Background Field")
        || line.starts_with("BoundaryLayer Field")
        || line.starts_with("Mesh.")
}

/// Removes the `$Parametrizations` section that Gmsh writes for `CreateGeometry`
/// meshes, which would otherwise break the next remeshing.
pub fn remove_gmsh_parametrizations(mesh_file: &Path) -> Result<()> {
    if mesh_file.extension().and_then(|e| e.to_str()) != Some("msh") {
        return Err(SculptError::invalid_input(
            "remove_gmsh_parametrizations",
            format!("{} has to end in .msh", mesh_file.display()),
        ));
    }
    let text = fs::read_to_string(mesh_file)?;
    let mut kept = String::with_capacity(text.len());
    let mut in_section = false;
    for line in text.lines() {
        if line == "$Parametrizations" {
            in_section = true;
        }
        if !in_section {
            kept.push_str(line);
            kept.push('\n');
        }
        if line == "$EndParametrizations" {
            in_section = false;
        }
    }
    fs::write(mesh_file, kept)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::regular_mesh;

    const SQUARE: &str = "$MeshFormat
2.2 0 8
$EndMeshFormat
$Nodes
5
1 0 0 0
2 1 0 0
3 1 1 0
4 0 1 0
5 9 9 0
$EndNodes
$Elements
4
1 15 2 0 1 1
2 1 2 1 1 1 2
3 2 2 1 1 1 2 3
4 2 2 1 1 1 3 4
$EndElements
";

    #[test]
    fn test_read_msh_keeps_only_cell_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("square.msh");
        fs::write(&path, SQUARE).unwrap();
        let imported = read_msh(&path).unwrap();
        assert_eq!(imported.mesh.dim(), 2);
        assert_eq!(imported.mesh.num_cells(), 2);
        assert_eq!(imported.node_tags, vec![1, 2, 3, 4]);
        assert_eq!(imported.mesh.vertex(2), &[1.0, 1.0]);
    }

    #[test]
    fn test_write_out_mesh_replaces_coordinates_only() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("square.msh");
        fs::write(&original, SQUARE).unwrap();
        let imported = read_msh(&original).unwrap();
        let mut coords = imported.mesh.coordinates().to_vec();
        coords[4] = 1.5;
        let moved = Mesh::new(2, coords, imported.mesh.cells().to_vec()).unwrap();

        let output = dir.path().join("moved.msh");
        write_out_mesh(&moved, &imported.node_tags, &original, &output).unwrap();
        let text = fs::read_to_string(&output).unwrap();
        assert!(text.contains("5 9 9 0"));
        assert!(text.contains("1 15 2 0 1 1"));
        let reread = read_msh(&output).unwrap();
        assert_eq!(reread.mesh.vertex(2), &[1.5, 1.0]);
    }

    #[test]
    fn test_write_msh_roundtrip_preserves_topology() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.msh");
        let mesh = regular_mesh(3, 1.0, 2.0).unwrap();
        write_msh(&mesh, &path).unwrap();
        let imported = read_msh(&path).unwrap();
        assert_eq!(imported.mesh, mesh);
    }

    #[test]
    fn test_generate_remesh_geo_filters_lines() {
        let dir = tempfile::tempdir().unwrap();
        let geo = dir.path().join("domain.geo");
        fs::write(
            &geo,
            "lc = 0.1;\nPoint(1) = {0, 0, 0, lc};\nField[1] = Distance;\nBackground Field = 1;\nMesh.CharacteristicLengthMax = 0.2;\nPhysical Surface(1) = {1};\n",
        )
        .unwrap();
        let output = dir.path().join("remesh.geo");
        generate_remesh_geo(&geo, &dir.path().join("mesh_1_pre_remesh.msh"), &output).unwrap();
        let text = fs::read_to_string(&output).unwrap();
        assert!(text.starts_with("Merge 'mesh_1_pre_remesh.msh';\nCreateGeometry;\n\n"));
        assert!(text.contains("lc = 0.1;"));
        assert!(text.contains("Field[1] = Distance;"));
        assert!(text.contains("Background Field = 1;"));
        assert!(text.contains("Mesh.CharacteristicLengthMax"));
        assert!(!text.contains("Point(1)"));
        assert!(!text.contains("Physical"));
    }

    #[test]
    fn test_remove_parametrizations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.msh");
        fs::write(&path, "$MeshFormat\n$EndMeshFormat\n$Parametrizations\n1 2\n$EndParametrizations\n$Nodes\n0\n$EndNodes\n").unwrap();
        remove_gmsh_parametrizations(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "$MeshFormat\n$EndMeshFormat\n$Nodes\n0\n$EndNodes\n");

        let wrong = dir.path().join("mesh.xdmf");
        fs::write(&wrong, "").unwrap();
        assert!(remove_gmsh_parametrizations(&wrong).is_err());
    }
}
