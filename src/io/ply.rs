//! Stanford .ply reading and writing.
//!
//! The reader takes ascii and binary files in either endianness and
//! recovers positions, vertex colors, normals and triangulated faces.
//! The writer emits binary little-endian with `list uchar int` faces.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};
use crate::geometry::{to_triangles, Geometry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlyScalar {
    F32,
    F64,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
}

impl PlyScalar {
    fn parse(name: &str) -> Option<PlyScalar> {
        match name {
            "float" | "float32" => Some(PlyScalar::F32),
            "double" | "float64" => Some(PlyScalar::F64),
            "char" | "int8" => Some(PlyScalar::I8),
            "uchar" | "uint8" => Some(PlyScalar::U8),
            "short" | "int16" => Some(PlyScalar::I16),
            "ushort" | "uint16" => Some(PlyScalar::U16),
            "int" | "int32" => Some(PlyScalar::I32),
            "uint" | "uint32" => Some(PlyScalar::U32),
            _ => None,
        }
    }

    fn size(self) -> usize {
        match self {
            PlyScalar::I8 | PlyScalar::U8 => 1,
            PlyScalar::I16 | PlyScalar::U16 => 2,
            PlyScalar::F32 | PlyScalar::I32 | PlyScalar::U32 => 4,
            PlyScalar::F64 => 8,
        }
    }

    fn read(self, bytes: &[u8], big_endian: bool) -> f64 {
        macro_rules! load {
            ($ty:ty) => {{
                let arr: [u8; std::mem::size_of::<$ty>()] =
                    bytes[..std::mem::size_of::<$ty>()].try_into().unwrap();
                if big_endian {
                    <$ty>::from_be_bytes(arr) as f64
                } else {
                    <$ty>::from_le_bytes(arr) as f64
                }
            }};
        }
        match self {
            PlyScalar::F32 => load!(f32),
            PlyScalar::F64 => load!(f64),
            PlyScalar::I8 => bytes[0] as i8 as f64,
            PlyScalar::U8 => bytes[0] as f64,
            PlyScalar::I16 => load!(i16),
            PlyScalar::U16 => load!(u16),
            PlyScalar::I32 => load!(i32),
            PlyScalar::U32 => load!(u32),
        }
    }
}

struct PlyProperty {
    name: String,
    val_type: PlyScalar,
    /// Present for `list` properties.
    length_type: Option<PlyScalar>,
}

struct PlyElement {
    name: String,
    length: usize,
    properties: Vec<PlyProperty>,
}

enum PlyFormat {
    Ascii,
    BinaryLittle,
    BinaryBig,
}

/// Property values flattened across an element.
enum Column {
    Scalar(Vec<f64>),
    List(Vec<Vec<i64>>),
}

fn parse_header(path: &Path, data: &[u8]) -> Result<(PlyFormat, Vec<PlyElement>, usize)> {
    let mut pos = 0;
    let mut format = None;
    let mut elements: Vec<PlyElement> = Vec::new();
    let mut first = true;

    loop {
        let end = data[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| pos + i)
            .ok_or_else(|| Error::file_format(path, "unterminated header"))?;
        let line = std::str::from_utf8(&data[pos..end])
            .map_err(|_| Error::file_format(path, "non-utf8 header"))?
            .trim();
        pos = end + 1;

        if first {
            if line != "ply" {
                return Err(Error::file_format(path, "header error"));
            }
            first = false;
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.first().copied() {
            Some("comment") | Some("obj_info") | None => {}
            Some("end_header") => return Ok((
                format.ok_or_else(|| Error::file_format(path, "missing format line"))?,
                elements,
                pos,
            )),
            Some("format") => {
                format = Some(match tokens.get(1).copied() {
                    Some("ascii") => PlyFormat::Ascii,
                    Some("binary_little_endian") => PlyFormat::BinaryLittle,
                    Some("binary_big_endian") => PlyFormat::BinaryBig,
                    other => {
                        return Err(Error::file_format(
                            path,
                            format!("unknown data format {other:?}"),
                        ))
                    }
                });
            }
            Some("element") => {
                let name = tokens
                    .get(1)
                    .ok_or_else(|| Error::file_format(path, "bad element line"))?;
                let length: usize = tokens
                    .get(2)
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| Error::file_format(path, "bad element count"))?;
                elements.push(PlyElement {
                    name: name.to_string(),
                    length,
                    properties: Vec::new(),
                });
            }
            Some("property") => {
                let element = elements
                    .last_mut()
                    .ok_or_else(|| Error::file_format(path, "property before element"))?;
                if tokens.get(1).copied() == Some("list") {
                    let length_type = tokens
                        .get(2)
                        .and_then(|t| PlyScalar::parse(t))
                        .ok_or_else(|| Error::file_format(path, "unknown list length type"))?;
                    let val_type = tokens
                        .get(3)
                        .and_then(|t| PlyScalar::parse(t))
                        .ok_or_else(|| Error::file_format(path, "unknown list value type"))?;
                    let name = tokens
                        .get(4)
                        .ok_or_else(|| Error::file_format(path, "bad list property"))?;
                    element.properties.push(PlyProperty {
                        name: name.to_string(),
                        val_type,
                        length_type: Some(length_type),
                    });
                } else {
                    let val_type = tokens
                        .get(1)
                        .and_then(|t| PlyScalar::parse(t))
                        .ok_or_else(|| {
                            Error::file_format(
                                path,
                                format!("unknown ply type: {:?}", tokens.get(1)),
                            )
                        })?;
                    let name = tokens
                        .get(2)
                        .ok_or_else(|| Error::file_format(path, "bad property line"))?;
                    element.properties.push(PlyProperty {
                        name: name.to_string(),
                        val_type,
                        length_type: None,
                    });
                }
            }
            Some(_) => {}
        }
    }
}

type ElementData = HashMap<String, HashMap<String, Column>>;

fn next_tok<'a>(
    tokens: &mut std::str::SplitWhitespace<'a>,
    path: &Path,
    what: &str,
) -> Result<&'a str> {
    tokens
        .next()
        .ok_or_else(|| Error::file_format(path, format!("truncated {what} data")))
}

fn read_ascii(path: &Path, body: &[u8], elements: &[PlyElement]) -> Result<ElementData> {
    let text =
        std::str::from_utf8(body).map_err(|_| Error::file_format(path, "non-utf8 ascii body"))?;
    let mut tokens = text.split_whitespace();

    let mut out = ElementData::new();
    for element in elements {
        let mut columns: HashMap<String, Column> = element
            .properties
            .iter()
            .map(|p| {
                let col = if p.length_type.is_some() {
                    Column::List(Vec::new())
                } else {
                    Column::Scalar(Vec::new())
                };
                (p.name.clone(), col)
            })
            .collect();

        for _ in 0..element.length {
            for prop in &element.properties {
                if prop.length_type.is_some() {
                    let count: usize = next_tok(&mut tokens, path, &element.name)?
                        .parse()
                        .map_err(|_| Error::file_format(path, "bad list length"))?;
                    let mut list = Vec::with_capacity(count);
                    for _ in 0..count {
                        let v: f64 = next_tok(&mut tokens, path, &element.name)?
                            .parse()
                            .map_err(|_| Error::file_format(path, "bad list value"))?;
                        list.push(v as i64);
                    }
                    if let Some(Column::List(rows)) = columns.get_mut(&prop.name) {
                        rows.push(list);
                    }
                } else {
                    let v: f64 = next_tok(&mut tokens, path, &element.name)?
                        .parse()
                        .map_err(|_| Error::file_format(path, "bad scalar value"))?;
                    if let Some(Column::Scalar(values)) = columns.get_mut(&prop.name) {
                        values.push(v);
                    }
                }
            }
        }
        out.insert(element.name.clone(), columns);
    }
    Ok(out)
}

fn read_binary(
    path: &Path,
    body: &[u8],
    elements: &[PlyElement],
    big_endian: bool,
) -> Result<ElementData> {
    fn take<'a>(body: &'a [u8], pos: &mut usize, n: usize, path: &Path) -> Result<&'a [u8]> {
        let slice = body
            .get(*pos..*pos + n)
            .ok_or_else(|| Error::file_format(path, "truncated binary data"))?;
        *pos += n;
        Ok(slice)
    }
    let mut pos = 0usize;

    let mut out = ElementData::new();
    for element in elements {
        let mut columns: HashMap<String, Column> = element
            .properties
            .iter()
            .map(|p| {
                let col = if p.length_type.is_some() {
                    Column::List(Vec::new())
                } else {
                    Column::Scalar(Vec::new())
                };
                (p.name.clone(), col)
            })
            .collect();

        for _ in 0..element.length {
            for prop in &element.properties {
                match prop.length_type {
                    Some(length_type) => {
                        let count = length_type
                            .read(take(body, &mut pos, length_type.size(), path)?, big_endian)
                            as usize;
                        let mut list = Vec::with_capacity(count);
                        for _ in 0..count {
                            let v = prop
                                .val_type
                                .read(take(body, &mut pos, prop.val_type.size(), path)?, big_endian);
                            list.push(v as i64);
                        }
                        if let Some(Column::List(rows)) = columns.get_mut(&prop.name) {
                            rows.push(list);
                        }
                    }
                    None => {
                        let v = prop
                            .val_type
                            .read(take(body, &mut pos, prop.val_type.size(), path)?, big_endian);
                        if let Some(Column::Scalar(values)) = columns.get_mut(&prop.name) {
                            values.push(v);
                        }
                    }
                }
            }
        }
        out.insert(element.name.clone(), columns);
    }
    Ok(out)
}

fn scalar_column<'a>(
    columns: &'a HashMap<String, Column>,
    name: &str,
) -> Option<&'a Vec<f64>> {
    match columns.get(name) {
        Some(Column::Scalar(values)) => Some(values),
        _ => None,
    }
}

pub fn read_ply(path: &Path) -> Result<Geometry> {
    let data = fs::read(path)?;
    let (format, elements, body_start) = parse_header(path, &data)?;
    let body = &data[body_start..];

    let parsed = match format {
        PlyFormat::Ascii => read_ascii(path, body, &elements)?,
        PlyFormat::BinaryLittle => read_binary(path, body, &elements, false)?,
        PlyFormat::BinaryBig => read_binary(path, body, &elements, true)?,
    };

    let vertex = parsed
        .get("vertex")
        .ok_or_else(|| Error::file_format(path, "missing vertex element"))?;
    let (xs, ys, zs) = match (
        scalar_column(vertex, "x"),
        scalar_column(vertex, "y"),
        scalar_column(vertex, "z"),
    ) {
        (Some(x), Some(y), Some(z)) => (x, y, z),
        _ => return Err(Error::file_format(path, "vertex element lacks x/y/z")),
    };

    let mut geo = Geometry {
        verts: xs
            .iter()
            .zip(ys)
            .zip(zs)
            .map(|((&x, &y), &z)| [x as f32, y as f32, z as f32])
            .collect(),
        ..Default::default()
    };

    if let (Some(r), Some(g), Some(b)) = (
        scalar_column(vertex, "red"),
        scalar_column(vertex, "green"),
        scalar_column(vertex, "blue"),
    ) {
        geo.colors = Some(
            r.iter()
                .zip(g)
                .zip(b)
                .map(|((&r, &g), &b)| [r as u8, g as u8, b as u8])
                .collect(),
        );
    }

    if let (Some(nx), Some(ny), Some(nz)) = (
        scalar_column(vertex, "nx"),
        scalar_column(vertex, "ny"),
        scalar_column(vertex, "nz"),
    ) {
        geo.normals = Some(
            nx.iter()
                .zip(ny)
                .zip(nz)
                .map(|((&x, &y), &z)| [x as f32, y as f32, z as f32])
                .collect(),
        );
    }

    if let Some(face) = parsed.get("face") {
        let lists = match face
            .get("vertex_indices")
            .or_else(|| face.get("vertex_index"))
        {
            Some(Column::List(rows)) => rows,
            _ => return Err(Error::file_format(path, "face element lacks index list")),
        };
        for row in lists {
            let idxs: Vec<u32> = row.iter().map(|&v| v as u32).collect();
            geo.faces.extend(to_triangles(&idxs));
        }
    }

    Ok(geo)
}

pub fn write_ply(path: &Path, geo: &Geometry) -> Result<()> {
    if let Some(colors) = &geo.colors {
        if colors.len() != geo.verts.len() {
            return Err(Error::Shape(format!(
                "{} colors for {} vertices",
                colors.len(),
                geo.verts.len()
            )));
        }
    }
    if let Some(normals) = &geo.normals {
        if normals.len() != geo.verts.len() {
            return Err(Error::Shape(format!(
                "{} normals for {} vertices",
                normals.len(),
                geo.verts.len()
            )));
        }
    }

    let mut out = Vec::new();
    writeln!(out, "ply")?;
    writeln!(out, "format binary_little_endian 1.0")?;
    writeln!(out, "element vertex {}", geo.verts.len())?;
    writeln!(out, "property float x")?;
    writeln!(out, "property float y")?;
    writeln!(out, "property float z")?;
    if geo.colors.is_some() {
        writeln!(out, "property uchar red")?;
        writeln!(out, "property uchar green")?;
        writeln!(out, "property uchar blue")?;
    }
    if geo.normals.is_some() {
        writeln!(out, "property float nx")?;
        writeln!(out, "property float ny")?;
        writeln!(out, "property float nz")?;
    }
    if !geo.faces.is_empty() {
        writeln!(out, "element face {}", geo.faces.len())?;
        writeln!(out, "property list uchar int vertex_indices")?;
    }
    writeln!(out, "end_header")?;

    for (i, v) in geo.verts.iter().enumerate() {
        for c in v {
            out.extend_from_slice(&c.to_le_bytes());
        }
        if let Some(colors) = &geo.colors {
            out.extend_from_slice(&colors[i]);
        }
        if let Some(normals) = &geo.normals {
            for c in &normals[i] {
                out.extend_from_slice(&c.to_le_bytes());
            }
        }
    }
    for f in &geo.faces {
        out.push(3u8);
        for &idx in f {
            out.extend_from_slice(&(idx as i32).to_le_bytes());
        }
    }

    fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tenview_{}_{}", std::process::id(), name))
    }

    fn sample_geometry() -> Geometry {
        Geometry {
            verts: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 1.0, 0.0],
            ],
            faces: vec![[0, 1, 2], [0, 2, 3]],
            colors: Some(vec![[255, 0, 0], [0, 255, 0], [0, 0, 255], [10, 20, 30]]),
            normals: Some(vec![[0.0, 0.0, 1.0]; 4]),
            ..Default::default()
        }
    }

    #[test]
    fn test_binary_round_trip() {
        let geo = sample_geometry();
        let path = temp_path("rt.ply");
        write_ply(&path, &geo).unwrap();
        let back = read_ply(&path).unwrap();
        assert_eq!(back.verts, geo.verts);
        assert_eq!(back.faces, geo.faces);
        assert_eq!(back.colors, geo.colors);
        assert_eq!(back.normals, geo.normals);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_ascii_read() {
        let text = "ply\nformat ascii 1.0\ncomment made by hand\n\
                    element vertex 3\nproperty float x\nproperty float y\nproperty float z\n\
                    element face 1\nproperty list uchar int vertex_indices\n\
                    end_header\n\
                    0 0 0\n1 0 0\n0.5 1 0\n3 0 1 2\n";
        let path = temp_path("ascii.ply");
        fs::write(&path, text).unwrap();
        let geo = read_ply(&path).unwrap();
        assert_eq!(geo.verts.len(), 3);
        assert_eq!(geo.verts[2], [0.5, 1.0, 0.0]);
        assert_eq!(geo.faces, vec![[0, 1, 2]]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_big_endian_read() {
        let mut data = Vec::new();
        data.extend_from_slice(
            b"ply\nformat binary_big_endian 1.0\n\
              element vertex 1\nproperty float x\nproperty float y\nproperty float z\n\
              end_header\n",
        );
        for v in [1.5f32, -2.0, 0.25] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        let path = temp_path("be.ply");
        fs::write(&path, data).unwrap();
        let geo = read_ply(&path).unwrap();
        assert_eq!(geo.verts, vec![[1.5, -2.0, 0.25]]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_quads_are_fanned() {
        let text = "ply\nformat ascii 1.0\n\
                    element vertex 4\nproperty float x\nproperty float y\nproperty float z\n\
                    element face 1\nproperty list uchar int vertex_indices\n\
                    end_header\n\
                    0 0 0\n1 0 0\n1 1 0\n0 1 0\n4 0 1 2 3\n";
        let path = temp_path("quad.ply");
        fs::write(&path, text).unwrap();
        let geo = read_ply(&path).unwrap();
        assert_eq!(geo.faces.len(), 2);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_bad_magic() {
        let path = temp_path("bad.ply");
        fs::write(&path, "plz\n").unwrap();
        assert!(matches!(read_ply(&path), Err(Error::FileFormat { .. })));
        let _ = fs::remove_file(&path);
    }
}
