use std::io::Cursor;

use crate::error::ComputeError;
use crate::surface::Mesh;
use crate::window::Frame;

/// Triangle-surface serialization format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MeshFormat {
    StlBinary,
    StlAscii,
}

/// STL binary layout: 80-byte header, u32 face count, then 50-byte facets.
const STL_HEADER_SIZE: usize = 80;
const STL_FACET_SIZE: usize = 50;

/// Per-facet normal from the vertex winding (counter-clockwise seen from
/// outside). Degenerate triangles get a zero normal, which STL readers
/// treat as "recompute yourself".
fn facet_normal(v0: [f32; 3], v1: [f32; 3], v2: [f32; 3]) -> [f32; 3] {
    let e1 = [v1[0] - v0[0], v1[1] - v0[1], v1[2] - v0[2]];
    let e2 = [v2[0] - v0[0], v2[1] - v0[1], v2[2] - v0[2]];
    let normal = [
        e1[1] * e2[2] - e1[2] * e2[1],
        e1[2] * e2[0] - e1[0] * e2[2],
        e1[0] * e2[1] - e1[1] * e2[0],
    ];
    let len = (normal[0] * normal[0] + normal[1] * normal[1] + normal[2] * normal[2]).sqrt();
    if len > f32::EPSILON {
        [normal[0] / len, normal[1] / len, normal[2] / len]
    } else {
        [0.0, 0.0, 0.0]
    }
}

fn write_stl_binary(mesh: &Mesh) -> Vec<u8> {
    let mut bytes =
        Vec::with_capacity(STL_HEADER_SIZE + 4 + mesh.faces.len() * STL_FACET_SIZE);

    let mut header = [b' '; STL_HEADER_SIZE];
    let text = b"Binary STL generated by reslice";
    header[..text.len()].copy_from_slice(text);
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&(mesh.faces.len() as u32).to_le_bytes());

    for &[i0, i1, i2] in &mesh.faces {
        let v0 = mesh.vertices[i0 as usize];
        let v1 = mesh.vertices[i1 as usize];
        let v2 = mesh.vertices[i2 as usize];

        for component in facet_normal(v0, v1, v2) {
            bytes.extend_from_slice(&component.to_le_bytes());
        }
        for vertex in [v0, v1, v2] {
            for component in vertex {
                bytes.extend_from_slice(&component.to_le_bytes());
            }
        }
        bytes.extend_from_slice(&0u16.to_le_bytes());
    }

    bytes
}

fn write_stl_ascii(mesh: &Mesh) -> Vec<u8> {
    use std::fmt::Write;

    let mut out = String::from("solid reslice\n");
    for &[i0, i1, i2] in &mesh.faces {
        let v0 = mesh.vertices[i0 as usize];
        let v1 = mesh.vertices[i1 as usize];
        let v2 = mesh.vertices[i2 as usize];
        let n = facet_normal(v0, v1, v2);

        let _ = writeln!(out, "  facet normal {:.6e} {:.6e} {:.6e}", n[0], n[1], n[2]);
        out.push_str("    outer loop\n");
        for v in [v0, v1, v2] {
            let _ = writeln!(out, "      vertex {:.6e} {:.6e} {:.6e}", v[0], v[1], v[2]);
        }
        out.push_str("    endloop\n");
        out.push_str("  endfacet\n");
    }
    out.push_str("endsolid reslice\n");
    out.into_bytes()
}

/// Serialize a mesh to a triangle-surface document. Stateless: the mesh is
/// the cacheable product, the bytes are derived on demand.
pub fn export_mesh(mesh: &Mesh, format: MeshFormat) -> Vec<u8> {
    match format {
        MeshFormat::StlBinary => write_stl_binary(mesh),
        MeshFormat::StlAscii => write_stl_ascii(mesh),
    }
}

/// Parse a binary STL document back into (unique vertex count, face count).
/// Positions are compared by exact bit pattern, which round-trips because
/// the exporter writes the mesh's `f32` coordinates verbatim.
pub fn read_stl_counts(bytes: &[u8]) -> Result<(usize, usize), ComputeError> {
    if bytes.len() < STL_HEADER_SIZE + 4 {
        return Err(ComputeError::Encoding("STL document too short".into()));
    }
    let face_count = u32::from_le_bytes(
        bytes[STL_HEADER_SIZE..STL_HEADER_SIZE + 4]
            .try_into()
            .map_err(|_| ComputeError::Encoding("truncated STL face count".into()))?,
    ) as usize;

    let expected = STL_HEADER_SIZE + 4 + face_count * STL_FACET_SIZE;
    if bytes.len() < expected {
        return Err(ComputeError::Encoding(format!(
            "STL facet data truncated: expected {expected} bytes, got {}",
            bytes.len()
        )));
    }

    let mut unique = std::collections::HashSet::new();
    for facet in 0..face_count {
        let base = STL_HEADER_SIZE + 4 + facet * STL_FACET_SIZE + 12;
        for vertex in 0..3 {
            let offset = base + vertex * 12;
            let key: [u8; 12] = bytes[offset..offset + 12]
                .try_into()
                .map_err(|_| ComputeError::Encoding("truncated STL vertex".into()))?;
            unique.insert(key);
        }
    }

    Ok((unique.len(), face_count))
}

/// Encode an 8-bit grayscale frame as PNG.
pub fn export_frame(frame: &Frame) -> Result<Vec<u8>, ComputeError> {
    let image = frame
        .clone()
        .into_image()
        .ok_or_else(|| ComputeError::Encoding("frame buffer does not match dimensions".into()))?;

    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|err| ComputeError::Encoding(err.to_string()))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{MeshStats, MeshStatus, SurfaceParams};

    fn tetrahedron() -> Mesh {
        let vertices = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.5, 0.866, 0.0],
            [0.5, 0.289, 0.816],
        ];
        let faces = vec![[0, 2, 1], [0, 1, 3], [1, 2, 3], [2, 0, 3]];
        Mesh {
            stats: MeshStats {
                vertex_count: vertices.len(),
                face_count: faces.len(),
                bounds_mm: ([0.0; 3], [1.0, 0.866, 0.816]),
            },
            vertices,
            faces,
            params: SurfaceParams::new(0.5, false),
            status: MeshStatus::Ready,
        }
    }

    #[test]
    fn binary_stl_has_exact_layout() {
        let mesh = tetrahedron();
        let bytes = export_mesh(&mesh, MeshFormat::StlBinary);
        assert_eq!(bytes.len(), 80 + 4 + 4 * 50);
        assert_eq!(u32::from_le_bytes(bytes[80..84].try_into().unwrap()), 4);
    }

    #[test]
    fn binary_stl_round_trips_counts() {
        let mesh = tetrahedron();
        let bytes = export_mesh(&mesh, MeshFormat::StlBinary);
        let (vertices, faces) = read_stl_counts(&bytes).unwrap();
        assert_eq!(vertices, mesh.stats.vertex_count);
        assert_eq!(faces, mesh.stats.face_count);
    }

    #[test]
    fn ascii_stl_is_well_formed() {
        let mesh = tetrahedron();
        let text = String::from_utf8(export_mesh(&mesh, MeshFormat::StlAscii)).unwrap();
        assert!(text.starts_with("solid reslice"));
        assert!(text.trim_end().ends_with("endsolid reslice"));
        assert_eq!(text.matches("facet normal").count(), 4);
        assert_eq!(text.matches("vertex").count(), 12);
    }

    #[test]
    fn facet_normals_follow_winding() {
        // Counter-clockwise in the xy plane seen from +z.
        let n = facet_normal([0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]);
        assert_eq!(n, [0.0, 0.0, 1.0]);
        // Reversed winding flips the normal.
        let n = facet_normal([0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]);
        assert_eq!(n, [0.0, 0.0, -1.0]);
    }

    #[test]
    fn truncated_stl_is_rejected() {
        let mesh = tetrahedron();
        let mut bytes = export_mesh(&mesh, MeshFormat::StlBinary);
        bytes.truncate(100);
        assert!(read_stl_counts(&bytes).is_err());
    }

    #[test]
    fn png_export_round_trips_dimensions() {
        let frame = Frame {
            width: 16,
            height: 8,
            pixels: (0u8..128).collect(),
        };
        let bytes = export_frame(&frame).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 8);
    }
}
