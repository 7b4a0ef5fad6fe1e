//! Host-side mesh data and spatial bounds.

use cgmath::{InnerSpace, Matrix4, Vector3};

use crate::error::{Error, Result};
use crate::tensor::{DType, Tensor};

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vector3<f32>,
    pub max: Vector3<f32>,
}

impl Bounds {
    pub fn new(min: Vector3<f32>, max: Vector3<f32>) -> Bounds {
        Bounds { min, max }
    }

    pub fn from_points<I: IntoIterator<Item = [f32; 3]>>(points: I) -> Option<Bounds> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bounds = Bounds {
            min: first.into(),
            max: first.into(),
        };
        for p in iter {
            bounds.min = bounds.min.zip(p.into(), f32::min);
            bounds.max = bounds.max.zip(p.into(), f32::max);
        }
        Some(bounds)
    }

    /// Bounds of a `[N, 3]` point tensor; `None` for an empty tensor.
    pub fn from_tensor(points: &Tensor) -> Result<Option<Bounds>> {
        if points.rank() != 2 || points.cols() != 3 {
            return Err(Error::Shape(format!(
                "bounds take [N, 3] points, got shape {:?}",
                points.shape()
            )));
        }
        let values = points.to_f32_components()?;
        Ok(Bounds::from_points(
            values.chunks_exact(3).map(|p| [p[0], p[1], p[2]]),
        ))
    }

    pub fn union(self, other: Bounds) -> Bounds {
        Bounds {
            min: self.min.zip(other.min, f32::min),
            max: self.max.zip(other.max, f32::max),
        }
    }

    pub fn center(&self) -> Vector3<f32> {
        (self.min + self.max) * 0.5
    }

    /// Radius of the bounding sphere around the center.
    pub fn radius(&self) -> f32 {
        (self.max - self.min).magnitude() * 0.5
    }

    pub fn corners(&self) -> [Vector3<f32>; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vector3::new(a.x, a.y, a.z),
            Vector3::new(b.x, a.y, a.z),
            Vector3::new(a.x, b.y, a.z),
            Vector3::new(b.x, b.y, a.z),
            Vector3::new(a.x, a.y, b.z),
            Vector3::new(b.x, a.y, b.z),
            Vector3::new(a.x, b.y, b.z),
            Vector3::new(b.x, b.y, b.z),
        ]
    }

    /// Bounds of the corners pushed through an affine transform.
    pub fn transformed(&self, transform: &Matrix4<f32>) -> Bounds {
        Bounds::from_points(self.corners().map(|corner| {
            let p = transform * corner.extend(1.0);
            [p.x, p.y, p.z]
        }))
        .expect("eight corners are never empty")
    }
}

/// Triangle mesh with optional per-vertex data, as produced by the mesh
/// readers. Faces are always triangles; polygon inputs are fanned apart
/// at load time.
#[derive(Debug, Clone, Default)]
pub struct Geometry {
    pub verts: Vec<[f32; 3]>,
    pub faces: Vec<[u32; 3]>,
    pub normals: Option<Vec<[f32; 3]>>,
    pub colors: Option<Vec<[u8; 3]>>,
    /// Per-face source object index, for multi-object files.
    pub object_ids: Option<Vec<u32>>,
}

impl Geometry {
    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::from_points(self.verts.iter().copied())
    }

    pub fn verts_tensor(&self) -> Tensor {
        flat3_tensor(&self.verts)
    }

    pub fn faces_tensor(&self) -> Tensor {
        let flat: Vec<i32> = self
            .faces
            .iter()
            .flat_map(|f| f.iter().map(|&v| v as i32))
            .collect();
        Tensor::from_vec(flat, &[self.faces.len(), 3]).expect("shape matches data")
    }

    pub fn normals_tensor(&self) -> Option<Tensor> {
        self.normals.as_ref().map(|n| flat3_tensor(n))
    }

    /// Colors as a `[N, 4]` normalized-friendly u8 tensor (alpha 255);
    /// vertex attributes need 4-component u8 data.
    pub fn colors_tensor(&self) -> Option<Tensor> {
        self.colors.as_ref().map(|colors| {
            let flat: Vec<u8> = colors
                .iter()
                .flat_map(|c| [c[0], c[1], c[2], 255])
                .collect();
            Tensor::from_vec(flat, &[colors.len(), 4]).expect("shape matches data")
        })
    }

    /// Area-weighted per-vertex normals, stored on the geometry.
    pub fn compute_normals(&mut self) {
        self.normals = Some(compute_normals(&self.verts, &self.faces));
    }
}

fn flat3_tensor(data: &[[f32; 3]]) -> Tensor {
    let flat: Vec<f32> = data.iter().flatten().copied().collect();
    Tensor::from_vec(flat, &[data.len(), 3]).expect("shape matches data")
}

/// Area-weighted vertex normals from a triangle soup.
pub fn compute_normals(verts: &[[f32; 3]], faces: &[[u32; 3]]) -> Vec<[f32; 3]> {
    let mut normals = vec![Vector3::new(0.0f32, 0.0, 0.0); verts.len()];
    for face in faces {
        let [a, b, c] = [
            Vector3::from(verts[face[0] as usize]),
            Vector3::from(verts[face[1] as usize]),
            Vector3::from(verts[face[2] as usize]),
        ];
        // cross product length carries the area weighting
        let normal = (b - a).cross(c - a);
        for &idx in face {
            normals[idx as usize] += normal;
        }
    }
    normals
        .into_iter()
        .map(|n| {
            if n.magnitude2() > 0.0 {
                n.normalize().into()
            } else {
                [0.0, 0.0, 0.0]
            }
        })
        .collect()
}

/// Fans a convex polygon into triangles.
pub fn to_triangles(polygon: &[u32]) -> Vec<[u32; 3]> {
    let mut out = Vec::new();
    for i in 1..polygon.len().saturating_sub(1) {
        out.push([polygon[0], polygon[i], polygon[i + 1]]);
    }
    out
}

/// Tensor variant of [`compute_normals`] for `[N, 3]` verts and `[M, 3]`
/// integer faces.
pub fn compute_normals_tensor(verts: &Tensor, faces: &Tensor) -> Result<Tensor> {
    if verts.rank() != 2 || verts.cols() != 3 {
        return Err(Error::Shape(format!(
            "verts must be [N, 3], got {:?}",
            verts.shape()
        )));
    }
    if faces.rank() != 2 || faces.cols() != 3 {
        return Err(Error::Shape(format!(
            "faces must be [M, 3], got {:?}",
            faces.shape()
        )));
    }
    let vert_values = verts.to_f32_components()?;
    let verts_arr: Vec<[f32; 3]> = vert_values
        .chunks_exact(3)
        .map(|p| [p[0], p[1], p[2]])
        .collect();

    let flat_faces = Tensor::from_bytes(faces.dtype(), &[faces.numel()], faces.host_bytes()?);
    let face_values = flat_faces.index_values()?;
    let faces_arr: Vec<[u32; 3]> = face_values
        .chunks_exact(3)
        .map(|f| [f[0] as u32, f[1] as u32, f[2] as u32])
        .collect();

    let normals = compute_normals(&verts_arr, &faces_arr);
    let flat: Vec<f32> = normals.into_iter().flatten().collect();
    Tensor::from_vec(flat, &[verts_arr.len(), 3])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_union_and_radius() {
        let a = Bounds::from_points([[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]]).unwrap();
        let b = Bounds::from_points([[-1.0, 0.5, 0.0], [0.5, 2.0, 0.5]]).unwrap();
        let u = a.union(b);
        assert_eq!(u.min, Vector3::new(-1.0, 0.0, 0.0));
        assert_eq!(u.max, Vector3::new(1.0, 2.0, 1.0));
        assert_eq!(u.center(), Vector3::new(0.0, 1.0, 0.5));
        assert!(u.radius() > 0.0);
    }

    #[test]
    fn test_bounds_transform() {
        let b = Bounds::from_points([[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]]).unwrap();
        let shifted = b.transformed(&Matrix4::from_translation(Vector3::new(2.0, 0.0, 0.0)));
        assert_eq!(shifted.min, Vector3::new(2.0, 0.0, 0.0));
        assert_eq!(shifted.max, Vector3::new(3.0, 1.0, 1.0));
    }

    #[test]
    fn test_triangle_normal() {
        let verts = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let faces = vec![[0u32, 1, 2]];
        let normals = compute_normals(&verts, &faces);
        for n in normals {
            assert!((n[2] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_polygon_fan() {
        assert_eq!(to_triangles(&[0, 1, 2]), vec![[0, 1, 2]]);
        assert_eq!(to_triangles(&[0, 1, 2, 3]), vec![[0, 1, 2], [0, 2, 3]]);
        assert_eq!(
            to_triangles(&[4, 5, 6, 7, 8]),
            vec![[4, 5, 6], [4, 6, 7], [4, 7, 8]]
        );
    }

    #[test]
    fn test_bounds_from_tensor_shape_check() {
        let t = Tensor::zeros(DType::Float32, &[3, 2]);
        assert!(Bounds::from_tensor(&t).is_err());
        let t = Tensor::zeros(DType::Float32, &[0, 3]);
        assert!(Bounds::from_tensor(&t).unwrap().is_none());
    }
}
