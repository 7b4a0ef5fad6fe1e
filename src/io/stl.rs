//! STL reading (binary and ascii).
//!
//! STL carries no connectivity, so every facet contributes three fresh
//! vertices and faces are a running enumeration.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::geometry::Geometry;

const BINARY_HEADER: usize = 80;
const FACET_BYTES: usize = 50;

pub fn read_stl(path: &Path) -> Result<Geometry> {
    let data = fs::read(path)?;

    if let Some(count) = binary_facet_count(&data) {
        return read_binary(path, &data, count);
    }
    read_ascii(path, &data)
}

/// A file is binary when the declared facet count matches its length.
fn binary_facet_count(data: &[u8]) -> Option<usize> {
    if data.len() < BINARY_HEADER + 4 {
        return None;
    }
    let count =
        u32::from_le_bytes(data[BINARY_HEADER..BINARY_HEADER + 4].try_into().ok()?) as usize;
    (BINARY_HEADER + 4 + count * FACET_BYTES == data.len()).then_some(count)
}

fn read_binary(path: &Path, data: &[u8], count: usize) -> Result<Geometry> {
    let mut geo = Geometry::default();
    geo.verts.reserve(count * 3);
    geo.faces.reserve(count);
    let mut normals = Vec::with_capacity(count * 3);

    let mut pos = BINARY_HEADER + 4;
    for facet in 0..count {
        let read_vec3 = |at: usize| -> Result<[f32; 3]> {
            let mut out = [0.0f32; 3];
            for (i, v) in out.iter_mut().enumerate() {
                let start = at + i * 4;
                let bytes: [u8; 4] = data
                    .get(start..start + 4)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| Error::file_format(path, "truncated facet"))?;
                *v = f32::from_le_bytes(bytes);
            }
            Ok(out)
        };

        let normal = read_vec3(pos)?;
        for corner in 0..3 {
            geo.verts.push(read_vec3(pos + 12 + corner * 12)?);
            normals.push(normal);
        }
        let base = (facet * 3) as u32;
        geo.faces.push([base, base + 1, base + 2]);
        pos += FACET_BYTES;
    }
    geo.normals = Some(normals);
    Ok(geo)
}

fn read_ascii(path: &Path, data: &[u8]) -> Result<Geometry> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::file_format(path, "neither binary nor ascii stl"))?;
    if !text.trim_start().starts_with("solid") {
        return Err(Error::file_format(path, "missing 'solid' header"));
    }

    let mut geo = Geometry::default();
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("vertex") {
            continue;
        }
        let mut vert = [0.0f32; 3];
        for v in &mut vert {
            *v = tokens
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| Error::file_format(path, "bad vertex line"))?;
        }
        geo.verts.push(vert);
    }
    if geo.verts.len() % 3 != 0 {
        return Err(Error::file_format(
            path,
            format!("{} vertices is not a facet multiple", geo.verts.len()),
        ));
    }
    geo.faces = (0..geo.verts.len() as u32 / 3)
        .map(|i| [i * 3, i * 3 + 1, i * 3 + 2])
        .collect();
    Ok(geo)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tenview_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_binary_read() {
        let mut data = vec![0u8; BINARY_HEADER];
        data.extend_from_slice(&2u32.to_le_bytes());
        for facet in 0..2u32 {
            for v in [0.0f32, 0.0, 1.0] {
                data.extend_from_slice(&v.to_le_bytes());
            }
            for corner in 0..3 {
                let x = facet as f32 + corner as f32 * 0.25;
                for v in [x, x + 1.0, 0.0] {
                    data.extend_from_slice(&v.to_le_bytes());
                }
            }
            data.extend_from_slice(&0u16.to_le_bytes());
        }
        let path = temp_path("bin.stl");
        fs::write(&path, data).unwrap();

        let geo = read_stl(&path).unwrap();
        assert_eq!(geo.verts.len(), 6);
        assert_eq!(geo.faces, vec![[0, 1, 2], [3, 4, 5]]);
        assert_eq!(geo.verts[3], [1.0, 2.0, 0.0]);
        assert_eq!(geo.normals.as_ref().unwrap()[0], [0.0, 0.0, 1.0]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_ascii_read() {
        let text = "solid demo\n facet normal 0 0 1\n  outer loop\n\
                    vertex 0 0 0\n   vertex 1 0 0\n   vertex 0 1 0\n\
                    endloop\n endfacet\nendsolid demo\n";
        let path = temp_path("ascii.stl");
        fs::write(&path, text).unwrap();
        let geo = read_stl(&path).unwrap();
        assert_eq!(geo.verts.len(), 3);
        assert_eq!(geo.faces, vec![[0, 1, 2]]);
        let _ = fs::remove_file(&path);
    }
}
