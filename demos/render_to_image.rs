//! Renders a cube above an axis grid off-screen and writes a PPM image.

use std::io::Write;

use anyhow::Result;
use tenview::{min_bounding_distance, nodes, sphere_view, Context, Framebuffer, Projection, Tensor};

fn cube(ctx: &Context) -> Result<tenview::NodeRef> {
    #[rustfmt::skip]
    let verts = Tensor::from_vec(
        vec![
            -0.5f32, 0.0, -0.5,  0.5, 0.0, -0.5,  0.5, 1.0, -0.5,  -0.5, 1.0, -0.5,
            -0.5, 0.0, 0.5,  0.5, 0.0, 0.5,  0.5, 1.0, 0.5,  -0.5, 1.0, 0.5,
        ],
        &[8, 3],
    )?;
    #[rustfmt::skip]
    let faces = Tensor::from_vec(
        vec![
            0i32, 2, 1,  0, 3, 2, // back
            4, 5, 6,  4, 6, 7,    // front
            0, 1, 5,  0, 5, 4,    // bottom
            3, 7, 6,  3, 6, 2,    // top
            0, 4, 7,  0, 7, 3,    // left
            1, 2, 6,  1, 6, 5,    // right
        ],
        &[12, 3],
    )?;
    Ok(nodes::create_mesh(ctx, &verts, &faces, None)?)
}

fn main() -> Result<()> {
    env_logger::init();

    let mut ctx = Context::new(640, 480)?;
    let guard = ctx.current()?;

    let mut scene = nodes::create_axis_grid(&ctx, -2.0, 2.0, 8)?;
    scene.add(cube(&ctx)?);
    let mut framebuffer = Framebuffer::new(&ctx);
    drop(guard);

    let bounds = scene.bounds().expect("scene has bounds");
    let projection = Projection::perspective(45.0, 0.1, 100.0, Some(640.0 / 480.0));
    let fov = projection.fov_y.min(projection.fov_x) as f32;
    let distance = min_bounding_distance(bounds.radius(), fov);
    let view = sphere_view(25.0, 30.0, bounds.center(), distance);

    ctx.render(projection.to_matrix(), view, &mut framebuffer, &scene, None)?;

    let guard = ctx.current()?;
    let image = framebuffer
        .attachment(0)
        .expect("color attachment")
        .borrow()
        .to_tensor()?;
    drop(guard);

    let [height, width, channels] = [image.shape()[0], image.shape()[1], image.shape()[2]];
    let pixels = image.to_vec::<u8>()?;
    let mut file = std::fs::File::create("render.ppm")?;
    writeln!(file, "P6\n{width} {height}\n255")?;
    for pixel in pixels.chunks_exact(channels) {
        file.write_all(&pixel[..3])?;
    }
    println!("wrote render.ppm ({width}x{height})");
    Ok(())
}
