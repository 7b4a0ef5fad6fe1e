//! Canned draw programs for common visualization primitives.
//!
//! These wrap [`DrawProgram`] with built-in WGSL shaders: Phong-shaded
//! meshes, colored point clouds, quivers, a ground grid and camera
//! frustum outlines. All of them require the context to be current.

use cgmath::Matrix4;

use crate::buffer::Buffer;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::geometry::{compute_normals_tensor, Geometry};
use crate::program::{
    DrawMode, DrawProgram, MatPlaceholder, NodeRef, PolygonMode, ShaderProgram,
};
use crate::projection::Projection;
use crate::scene::Scene;
use crate::tensor::{DType, Device, Tensor};

const PHONG_WGSL: &str = include_str!("../shaders/phong.wgsl");
const POINT_WGSL: &str = include_str!("../shaders/point.wgsl");
const FLAT_WGSL: &str = include_str!("../shaders/flat.wgsl");

/// Phong-shaded triangle mesh node.
///
/// `verts` is `[N, 3]` float32 and `faces` `[M, 3]` integer. Normals are
/// area-weighted per-vertex when not supplied. Material uniforms get
/// neutral gray defaults and can be overridden through
/// [`DrawProgram::set`].
pub fn create_mesh(
    ctx: &Context,
    verts: &Tensor,
    faces: &Tensor,
    normals: Option<&Tensor>,
) -> Result<NodeRef> {
    let program = ShaderProgram::from_source(ctx, PHONG_WGSL)?;
    let node = DrawProgram::with_options(ctx, program, DrawMode::Triangles, true)?;
    {
        let mut draw = node.borrow_mut();
        draw.set("in_position", Buffer::from_tensor(ctx, verts)?)?;
        let normal_buffer = match normals {
            Some(normals) => Buffer::from_tensor(ctx, normals)?,
            None => Buffer::from_tensor(ctx, &compute_normals_tensor(verts, faces)?)?,
        };
        draw.set("in_normal", normal_buffer)?;

        draw.set("Modelview", MatPlaceholder::Modelview)?;
        draw.set("ProjModelview", MatPlaceholder::ProjectionModelview)?;
        draw.set("NormalModelview", MatPlaceholder::NormalModelview)?;
        draw.set("AmbientColor", [0.6, 0.6, 0.6, 1.0])?;
        draw.set("DiffuseColor", [0.7, 0.7, 0.7, 1.0])?;
        draw.set("SpecularColor", [0.8, 0.8, 0.8, 1.0])?;
        draw.set("Lightpos", [0.0, 50.0, 0.0, 1.0])?;
        draw.set("SpecularExp", 127.0f32)?;

        draw.set_indices(faces)?;
        draw.set_bounds(verts)?;
    }
    Ok(node)
}

/// As [`create_mesh`], from loaded [`Geometry`].
pub fn create_mesh_from_geo(ctx: &Context, geo: &Geometry) -> Result<NodeRef> {
    let verts = geo.verts_tensor();
    let faces = geo.faces_tensor();
    create_mesh(ctx, &verts, &faces, geo.normals_tensor().as_ref())
}

/// Point cloud node with per-vertex colors.
///
/// `colors` is uint8, either one color (`[3]`/`[4]`) broadcast over all
/// points or per-point rows (`[N, 3]`/`[N, 4]`); missing colors and
/// alphas default to white/opaque.
pub fn create_point_cloud(
    ctx: &Context,
    verts: &Tensor,
    colors: Option<&Tensor>,
) -> Result<NodeRef> {
    let rows = verts.rows();
    let program = ShaderProgram::from_source(ctx, POINT_WGSL)?;
    let node = DrawProgram::new(ctx, program, DrawMode::Points)?;
    {
        let mut draw = node.borrow_mut();
        draw.set("in_position", Buffer::from_tensor(ctx, verts)?)?;
        draw.set("in_color", color_buffer(ctx, colors, rows)?)?;
        draw.set("ProjModelview", MatPlaceholder::ProjectionModelview)?;
        draw.set_bounds(verts)?;
    }
    Ok(node)
}

/// Line segments from `positions` to `positions + directions`, both
/// `[N, 3]` float32, with an optional color per arrow.
pub fn create_quiver(
    ctx: &Context,
    positions: &Tensor,
    directions: &Tensor,
    colors: Option<&Tensor>,
) -> Result<NodeRef> {
    let pos = positions.to_device(ctx, Device::Host)?;
    let dir = directions.to_device(ctx, Device::Host)?;
    if pos.shape() != dir.shape() || pos.rank() != 2 || pos.cols() != 3 {
        return Err(Error::Shape(format!(
            "quiver expects matching [N, 3] tensors, got {:?} and {:?}",
            pos.shape(),
            dir.shape()
        )));
    }
    let rows = pos.rows();
    let p = pos.to_vec::<f32>()?;
    let d = dir.to_vec::<f32>()?;

    // one segment per arrow, tail then tip
    let mut verts = Vec::with_capacity(rows * 6);
    for i in 0..rows {
        verts.extend_from_slice(&p[i * 3..i * 3 + 3]);
        verts.push(p[i * 3] + d[i * 3]);
        verts.push(p[i * 3 + 1] + d[i * 3 + 1]);
        verts.push(p[i * 3 + 2] + d[i * 3 + 2]);
    }
    let verts = Tensor::from_vec(verts, &[rows * 2, 3])?;

    let colors = expand_colors(ctx, colors, rows)?;
    let mut doubled = Vec::with_capacity(rows * 8);
    for row in colors.chunks_exact(4) {
        doubled.extend_from_slice(row);
        doubled.extend_from_slice(row);
    }
    let color_tensor = Tensor::from_vec(doubled, &[rows * 2, 4])?;

    let program = ShaderProgram::from_source(ctx, POINT_WGSL)?;
    let node = DrawProgram::new(ctx, program, DrawMode::Lines)?;
    {
        let mut draw = node.borrow_mut();
        draw.set("in_position", Buffer::from_tensor(ctx, &verts)?)?;
        let color_buffer = Buffer::from_tensor(ctx, &color_tensor)?;
        color_buffer.borrow_mut().set_normalize(true);
        draw.set("in_color", color_buffer)?;
        draw.set("ProjModelview", MatPlaceholder::ProjectionModelview)?;
        draw.set_bounds(&verts)?;
    }
    Ok(node)
}

/// Wireframe grid on the XZ plane spanning `[start, end]` in both axes,
/// plus an RGB axis quiver at the grid corner. Returns a two-node scene.
pub fn create_axis_grid(ctx: &Context, start: f32, end: f32, steps: usize) -> Result<Scene> {
    let steps = steps.max(1);
    let size = steps + 1;
    let step = (end - start) / steps as f32;

    let mut verts = Vec::with_capacity(size * size * 3);
    for i in 0..size {
        for j in 0..size {
            verts.extend_from_slice(&[start + i as f32 * step, 0.0, start + j as f32 * step]);
        }
    }
    let verts = Tensor::from_vec(verts, &[size * size, 3])?;

    let mut faces = Vec::with_capacity(steps * steps * 4);
    for i in 0..steps {
        for j in 0..steps {
            faces.extend_from_slice(&[
                (i * size + j) as i32,
                ((i + 1) * size + j) as i32,
                ((i + 1) * size + j + 1) as i32,
                (i * size + j + 1) as i32,
            ]);
        }
    }
    let faces = Tensor::from_vec(faces, &[steps * steps, 4])?;

    let program = ShaderProgram::from_source(ctx, FLAT_WGSL)?;
    let grid = DrawProgram::new(ctx, program, DrawMode::Quads)?;
    {
        let mut draw = grid.borrow_mut();
        draw.style.polygon_mode = PolygonMode::Wireframe;
        draw.set("in_position", Buffer::from_tensor(ctx, &verts)?)?;
        draw.set("Color", [1.0, 1.0, 1.0, 1.0])?;
        draw.set("ProjModelview", MatPlaceholder::ProjectionModelview)?;
        draw.set_indices(&faces)?;
        draw.set_bounds(&verts)?;
    }

    let axes = axis_quiver(ctx, [start, 0.0, start], step)?;

    let mut scene = Scene::new();
    scene.add(grid);
    scene.add(axes);
    Ok(scene)
}

/// Camera frustum outline for a projection, with an axis quiver scaled
/// to the near plane. `extrinsic` is the camera-to-world transform
/// applied to both nodes.
pub fn create_virtual_camera(
    ctx: &Context,
    projection: &Projection,
    extrinsic: Matrix4<f32>,
) -> Result<Scene> {
    let (l, r, b, t) = (
        projection.left as f32,
        projection.right as f32,
        projection.bottom as f32,
        projection.top as f32,
    );
    let (fl, fr, fb, ft) = (
        projection.far_left as f32,
        projection.far_right as f32,
        projection.far_bottom as f32,
        projection.far_top as f32,
    );
    let (near, far) = (projection.near as f32, projection.far as f32);

    #[rustfmt::skip]
    let verts = Tensor::from_vec(
        vec![
            0.0, 0.0, 0.0,
            l, b, -near,
            r, b, -near,
            r, t, -near,
            l, t, -near,
            fl, fb, -far,
            fr, fb, -far,
            fr, ft, -far,
            fl, ft, -far,
        ],
        &[9, 3],
    )?;
    #[rustfmt::skip]
    let lines = Tensor::from_vec(
        vec![
            1i32, 2,  2, 3,  3, 4,  4, 1, // near window
            5, 6,  6, 7,  7, 8,  8, 5, // far window
            0, 5,  0, 6,  0, 7,  0, 8, // apex to far corners
        ],
        &[12, 2],
    )?;

    let program = ShaderProgram::from_source(ctx, FLAT_WGSL)?;
    let frustum = DrawProgram::new(ctx, program, DrawMode::Lines)?;
    {
        let mut draw = frustum.borrow_mut();
        draw.transform = extrinsic;
        draw.set("in_position", Buffer::from_tensor(ctx, &verts)?)?;
        draw.set("Color", [0.6, 0.8, 0.75, 1.0])?;
        draw.set("ProjModelview", MatPlaceholder::ProjectionModelview)?;
        draw.set_indices(&lines)?;
        draw.set_bounds(&verts)?;
    }

    let axes = axis_quiver(ctx, [0.0, 0.0, 0.0], near)?;
    axes.borrow_mut().transform = extrinsic;

    let mut scene = Scene::new();
    scene.add(frustum);
    scene.add(axes);
    Ok(scene)
}

/// RGB arrows along +X/+Y/+Z of length `scale`, rooted at `origin`.
fn axis_quiver(ctx: &Context, origin: [f32; 3], scale: f32) -> Result<NodeRef> {
    let positions = Tensor::from_vec(
        vec![
            origin[0], origin[1], origin[2],
            origin[0], origin[1], origin[2],
            origin[0], origin[1], origin[2],
        ],
        &[3, 3],
    )?;
    let directions = Tensor::from_vec(
        vec![scale, 0.0, 0.0, 0.0, scale, 0.0, 0.0, 0.0, scale],
        &[3, 3],
    )?;
    let colors = Tensor::from_vec(
        vec![255u8, 0, 0, 255, 0, 255, 0, 255, 0, 0, 255, 255],
        &[3, 4],
    )?;
    create_quiver(ctx, &positions, &directions, Some(&colors))
}

/// Normalized uint8 color attribute buffer, broadcast and padded to
/// `[rows, 4]`.
fn color_buffer(
    ctx: &Context,
    colors: Option<&Tensor>,
    rows: usize,
) -> Result<crate::buffer::BufferRef> {
    let expanded = expand_colors(ctx, colors, rows)?;
    let tensor = Tensor::from_vec(expanded, &[rows, 4])?;
    let buffer = Buffer::from_tensor(ctx, &tensor)?;
    buffer.borrow_mut().set_normalize(true);
    Ok(buffer)
}

fn expand_colors(ctx: &Context, colors: Option<&Tensor>, rows: usize) -> Result<Vec<u8>> {
    let Some(colors) = colors else {
        return Ok(vec![255u8; rows * 4]);
    };

    let host = colors.to_device(ctx, Device::Host)?;
    if host.dtype() != DType::Uint8 {
        return Err(Error::Shape(format!(
            "colors must be uint8, got {:?}",
            host.dtype()
        )));
    }
    let data = host.to_vec::<u8>()?;

    let (count, cols) = match host.rank() {
        1 => (1, host.shape()[0]),
        2 => (host.rows(), host.cols()),
        _ => {
            return Err(Error::Shape(format!(
                "colors must be rank 1 or 2, got shape {:?}",
                host.shape()
            )))
        }
    };
    if !(cols == 3 || cols == 4) || (count != 1 && count != rows) {
        return Err(Error::Shape(format!(
            "colors must be [3], [4], [{rows}, 3] or [{rows}, 4], got shape {:?}",
            host.shape()
        )));
    }

    let mut out = Vec::with_capacity(rows * 4);
    for i in 0..rows {
        let row = if count == 1 { 0 } else { i };
        let src = &data[row * cols..row * cols + cols];
        out.extend_from_slice(src);
        if cols == 3 {
            out.push(255);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::framebuffer::Framebuffer;
    use cgmath::SquareMatrix;

    fn triangle() -> (Tensor, Tensor) {
        let verts = Tensor::from_vec(
            vec![-0.5f32, -0.5, 0.0, 0.5, -0.5, 0.0, 0.0, 0.5, 0.0],
            &[3, 3],
        )
        .unwrap();
        let faces = Tensor::from_vec(vec![0i32, 1, 2], &[1, 3]).unwrap();
        (verts, faces)
    }

    #[test]
    fn test_mesh_renders() {
        let Some(mut ctx) = test_context() else {
            return;
        };
        let guard = ctx.current().unwrap();
        let (verts, faces) = triangle();
        let node = create_mesh(&ctx, &verts, &faces, None).unwrap();

        let mut scene = Scene::new();
        scene.add(node.clone());
        let mut fb = Framebuffer::new(&ctx);
        drop(guard);

        ctx.render(
            Matrix4::identity(),
            Matrix4::identity(),
            &mut fb,
            &scene,
            None,
        )
        .unwrap();
        assert_eq!(node.borrow().draw_count(), 1);

        let guard = ctx.current().unwrap();
        let image = fb.attachment(0).unwrap().borrow().to_tensor().unwrap();
        assert_eq!(image.shape(), &[64, 64, 4]);
        drop(guard);
    }

    #[test]
    fn test_scene_draw_order() {
        let Some(mut ctx) = test_context() else {
            return;
        };
        let guard = ctx.current().unwrap();
        let (verts, faces) = triangle();
        let first = create_mesh(&ctx, &verts, &faces, None).unwrap();
        let second = create_point_cloud(&ctx, &verts, None).unwrap();

        let mut scene = Scene::new();
        scene.add(first.clone());
        scene.add(second.clone());
        let mut fb = Framebuffer::new(&ctx);
        drop(guard);

        ctx.render(
            Matrix4::identity(),
            Matrix4::identity(),
            &mut fb,
            &scene,
            None,
        )
        .unwrap();

        // each node drawn exactly once, in insertion order
        assert_eq!(first.borrow().draw_count(), 1);
        assert_eq!(second.borrow().draw_count(), 1);
        assert_eq!(first.borrow().last_draw_seq(), 1);
        assert_eq!(second.borrow().last_draw_seq(), 2);
    }

    #[test]
    fn test_axis_grid_scene() {
        let Some(ctx) = test_context() else {
            return;
        };
        let _guard = ctx.current().unwrap();
        let scene = create_axis_grid(&ctx, -1.0, 1.0, 4).unwrap();
        assert_eq!(scene.len(), 2);
        assert!(scene.bounds().is_some());
    }

    #[test]
    fn test_virtual_camera_scene() {
        let Some(ctx) = test_context() else {
            return;
        };
        let _guard = ctx.current().unwrap();
        let proj = Projection::perspective(45.0, 0.1, 10.0, Some(1.0));
        let scene = create_virtual_camera(&ctx, &proj, Matrix4::identity()).unwrap();
        assert_eq!(scene.len(), 2);
    }

    #[test]
    fn test_color_expansion() {
        let Some(ctx) = test_context() else {
            return;
        };
        let _guard = ctx.current().unwrap();
        let single = Tensor::from_vec(vec![10u8, 20, 30], &[3]).unwrap();
        let out = expand_colors(&ctx, Some(&single), 2).unwrap();
        assert_eq!(out, vec![10, 20, 30, 255, 10, 20, 30, 255]);

        let bad = Tensor::from_vec(vec![1.0f32, 2.0, 3.0], &[3]).unwrap();
        assert!(expand_colors(&ctx, Some(&bad), 2).is_err());
    }
}
