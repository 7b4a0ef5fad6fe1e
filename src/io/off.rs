//! Object File Format (.off) reading and writing.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};
use crate::geometry::{to_triangles, Geometry};

fn content_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

pub fn read_off(path: &Path) -> Result<Geometry> {
    let text = fs::read_to_string(path)?;
    let mut lines = content_lines(&text);

    let header = lines
        .next()
        .ok_or_else(|| Error::file_format(path, "empty file"))?;
    if header != "OFF" {
        return Err(Error::file_format(path, "file does not start with 'OFF'"));
    }

    let counts = lines
        .next()
        .ok_or_else(|| Error::file_format(path, "missing element counts"))?;
    let mut counts = counts.split_whitespace();
    let num_verts: usize = counts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::file_format(path, "bad vertex count"))?;
    let num_faces: usize = counts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::file_format(path, "bad face count"))?;

    let mut geo = Geometry::default();
    geo.verts.reserve(num_verts);
    for _ in 0..num_verts {
        let line = lines
            .next()
            .ok_or_else(|| Error::file_format(path, "truncated vertex list"))?;
        let mut it = line.split_whitespace();
        let mut vert = [0.0f32; 3];
        for v in &mut vert {
            *v = it
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| Error::file_format(path, "bad vertex line"))?;
        }
        geo.verts.push(vert);
    }

    for _ in 0..num_faces {
        let line = lines
            .next()
            .ok_or_else(|| Error::file_format(path, "truncated face list"))?;
        let mut it = line.split_whitespace();
        let count: usize = it
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| Error::file_format(path, "bad face line"))?;
        let mut idxs = Vec::with_capacity(count);
        for _ in 0..count {
            let idx: u32 = it
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| Error::file_format(path, "bad face index"))?;
            idxs.push(idx);
        }
        match count {
            3 => geo.faces.push([idxs[0], idxs[1], idxs[2]]),
            // quads keep the historical split order
            4 => {
                geo.faces.push([idxs[0], idxs[1], idxs[2]]);
                geo.faces.push([idxs[2], idxs[3], idxs[0]]);
            }
            _ => geo.faces.extend(to_triangles(&idxs)),
        }
    }

    Ok(geo)
}

pub fn write_off(path: &Path, geo: &Geometry) -> Result<()> {
    let mut out = fs::File::create(path)?;
    writeln!(out, "OFF")?;
    writeln!(out, "{} {} 0", geo.verts.len(), geo.faces.len())?;
    for v in &geo.verts {
        writeln!(out, "{} {} {}", v[0], v[1], v[2])?;
    }
    for f in &geo.faces {
        writeln!(out, "3 {} {} {}", f[0], f[1], f[2])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tenview_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_quad_triangulation() {
        let path = temp_path("quad.off");
        fs::write(
            &path,
            "OFF\n# a comment\n4 1 0\n0 0 0\n1 0 0\n1 1 0\n0 1 0\n4 0 1 2 3\n",
        )
        .unwrap();
        let geo = read_off(&path).unwrap();
        assert_eq!(geo.verts.len(), 4);
        assert_eq!(geo.faces, vec![[0, 1, 2], [2, 3, 0]]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_round_trip() {
        let geo = Geometry {
            verts: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.5, 1.0, 0.0]],
            faces: vec![[0, 1, 2]],
            ..Default::default()
        };
        let path = temp_path("tri.off");
        write_off(&path, &geo).unwrap();
        let back = read_off(&path).unwrap();
        assert_eq!(back.verts, geo.verts);
        assert_eq!(back.faces, geo.faces);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_bad_header() {
        let path = temp_path("bad.off");
        fs::write(&path, "NOT_OFF\n").unwrap();
        assert!(matches!(read_off(&path), Err(Error::FileFormat { .. })));
        let _ = fs::remove_file(&path);
    }
}
