//! Wavefront .obj loading, backed by `tobj`.

use std::path::Path;

use crate::error::{Error, Result};
use crate::geometry::Geometry;

pub fn read_obj(path: &Path) -> Result<Geometry> {
    let (models, _materials) = tobj::load_obj(
        path,
        &tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        },
    )
    .map_err(|e| Error::file_format(path, format!("obj load failed: {e}")))?;

    let mut geo = Geometry::default();
    let mut normals: Vec<[f32; 3]> = Vec::new();
    let mut has_normals = false;
    let mut object_ids: Vec<u32> = Vec::new();
    let multi_object = models.len() > 1;

    for (object, model) in models.into_iter().enumerate() {
        let mesh = model.mesh;
        let base = geo.verts.len() as u32;
        for pos in mesh.positions.chunks_exact(3) {
            geo.verts.push([pos[0], pos[1], pos[2]]);
        }
        if mesh.normals.is_empty() {
            normals.resize(geo.verts.len(), [0.0, 0.0, 0.0]);
        } else {
            has_normals = true;
            for n in mesh.normals.chunks_exact(3) {
                normals.push([n[0], n[1], n[2]]);
            }
            normals.resize(geo.verts.len(), [0.0, 0.0, 0.0]);
        }
        for face in mesh.indices.chunks_exact(3) {
            geo.faces.push([base + face[0], base + face[1], base + face[2]]);
            object_ids.push(object as u32);
        }
    }

    if has_normals {
        geo.normals = Some(normals);
    }
    if multi_object {
        geo.object_ids = Some(object_ids);
    }
    Ok(geo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_simple_obj() {
        let text = "# tri and quad\n\
                    v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\n\
                    f 1 2 3\nf 1 2 3 4\n";
        let path = std::env::temp_dir().join(format!("tenview_{}_simple.obj", std::process::id()));
        std::fs::write(&path, text).unwrap();

        let geo = read_obj(&path).unwrap();
        assert_eq!(geo.verts.len(), 4);
        // the quad face triangulates, 1 + 2 triangles total
        assert_eq!(geo.faces.len(), 3);
        assert!(geo.normals.is_none());
        let _ = std::fs::remove_file(&path);
    }
}
