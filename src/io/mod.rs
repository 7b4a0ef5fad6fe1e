//! 3D object file reading and writing.
//!
//! Reading dispatches on the lowercased extension: `.off`, `.obj`,
//! `.ply` and `.stl`. Writing supports `.off` (ascii) and `.ply`
//! (binary little-endian).

use std::path::Path;

use crate::error::{Error, Result};
use crate::geometry::Geometry;

mod off;
mod ply;
mod stl;
mod wavefront;

pub use off::{read_off, write_off};
pub use ply::{read_ply, write_ply};
pub use stl::read_stl;
pub use wavefront::read_obj;

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// Reads a mesh file, picking the parser from the extension.
pub fn read_3dobject(path: impl AsRef<Path>) -> Result<Geometry> {
    let path = path.as_ref();
    match extension_of(path).as_deref() {
        Some("off") => read_off(path),
        Some("obj") => read_obj(path),
        Some("ply") => read_ply(path),
        Some("stl") => read_stl(path),
        other => Err(Error::file_format(
            path,
            format!("unknown 3D object extension {other:?}"),
        )),
    }
}

/// Writes a mesh file, picking the writer from the extension.
pub fn write_3dobject(path: impl AsRef<Path>, geo: &Geometry) -> Result<()> {
    let path = path.as_ref();
    match extension_of(path).as_deref() {
        Some("off") => write_off(path, geo),
        Some("ply") => write_ply(path, geo),
        other => Err(Error::file_format(
            path,
            format!("unknown 3D object extension {other:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_mesh(n: usize) -> Geometry {
        use rand::Rng;
        let mut rng = rand::rng();
        let mut geo = Geometry::default();
        for i in 0..n {
            for j in 0..n {
                geo.verts
                    .push([i as f32, j as f32, rng.random_range(-1.0f32..1.0)]);
            }
        }
        for i in 0..n - 1 {
            for j in 0..n - 1 {
                let a = (i * n + j) as u32;
                let b = ((i + 1) * n + j) as u32;
                geo.faces.push([a, b, b + 1]);
                geo.faces.push([b + 1, a + 1, a]);
            }
        }
        geo
    }

    #[test]
    fn test_counts_agree_across_formats() {
        let geo = grid_mesh(8);
        let dir = std::env::temp_dir();
        let off_path = dir.join(format!("tenview_{}_counts.off", std::process::id()));
        let ply_path = dir.join(format!("tenview_{}_counts.ply", std::process::id()));

        write_3dobject(&off_path, &geo).unwrap();
        write_3dobject(&ply_path, &geo).unwrap();

        let from_off = read_3dobject(&off_path).unwrap();
        let from_ply = read_3dobject(&ply_path).unwrap();
        assert_eq!(from_off.verts.len(), geo.verts.len());
        assert_eq!(from_ply.verts.len(), geo.verts.len());
        assert_eq!(from_off.faces.len(), geo.faces.len());
        assert_eq!(from_ply.faces.len(), geo.faces.len());
        assert_eq!(from_off.faces, from_ply.faces);

        let _ = std::fs::remove_file(&off_path);
        let _ = std::fs::remove_file(&ply_path);
    }

    #[test]
    fn test_unknown_extension() {
        let err = read_3dobject("mesh.gltf").unwrap_err();
        assert!(matches!(err, Error::FileFormat { .. }));
    }
}
