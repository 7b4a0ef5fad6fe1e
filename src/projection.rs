//! Pinhole camera projection math. Pure host-side; the GPU only ever
//! sees the final matrix.

use cgmath::Matrix4;

/// An off-axis perspective frustum described by its near-plane window.
///
/// Derived quantities (far-plane window, fields of view, aspect) are
/// computed at construction and exposed as fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub left: f64,
    pub right: f64,
    pub bottom: f64,
    pub top: f64,
    pub near: f64,
    pub far: f64,

    /// Near-plane window projected onto the far plane.
    pub far_left: f64,
    pub far_right: f64,
    pub far_bottom: f64,
    pub far_top: f64,

    /// Horizontal field of view in degrees.
    pub fov_x: f64,
    /// Vertical field of view in degrees.
    pub fov_y: f64,
    pub aspect: f64,
}

impl Projection {
    /// Frustum from explicit near-plane window extents.
    pub fn new(left: f64, right: f64, bottom: f64, top: f64, near: f64, far: f64) -> Projection {
        Projection {
            left,
            right,
            bottom,
            top,
            near,
            far,
            far_left: (left / near) * far,
            far_right: (right / near) * far,
            far_bottom: (bottom / near) * far,
            far_top: (top / near) * far,
            fov_x: (right / near).atan().to_degrees() * 2.0,
            fov_y: (top / near).atan().to_degrees() * 2.0,
            aspect: (right + left.abs()) / (top + bottom.abs()),
        }
    }

    /// Symmetric perspective from a vertical field of view in degrees.
    /// The horizontal extent comes from `aspect` when given, from
    /// `fov_x` (degrees) otherwise, and defaults to square.
    pub fn perspective(fov_y: f64, near: f64, far: f64, aspect: Option<f64>) -> Projection {
        Projection::perspective_fov(fov_y, near, far, aspect, None)
    }

    pub fn perspective_fov(
        fov_y: f64,
        near: f64,
        far: f64,
        aspect: Option<f64>,
        fov_x: Option<f64>,
    ) -> Projection {
        let top = (fov_y / 2.0).to_radians().tan() * near;
        let right = if let Some(aspect) = aspect {
            top * aspect
        } else if let Some(fov_x) = fov_x {
            (fov_x / 2.0).to_radians().tan() * near
        } else {
            top
        };
        Projection::new(-right, right, -top, top, near, far)
    }

    /// Frustum from a camera intrinsic matrix, as used in 3D
    /// reconstruction. Only `fx`, `fy` and the principal point are read.
    pub fn from_intrinsics(kcam: &[[f64; 3]; 2], near: f64, far: f64) -> Projection {
        let right = (near * kcam[0][2]) / kcam[0][0];
        let top = (near * kcam[1][2]) / kcam[1][1].abs();
        Projection::new(-right, right, -top, top, near, far)
    }

    /// Frustum from a physical sensor description (Blender-style
    /// cameras). `sensor_fit` picks which sensor dimension the render
    /// width/height is fitted to.
    #[allow(clippy::too_many_arguments)]
    pub fn from_sensor(
        sensor_w: f64,
        sensor_h: f64,
        focal_len: f64,
        render_w: u32,
        render_h: u32,
        sensor_fit: SensorFit,
        near: f64,
        far: f64,
    ) -> Projection {
        let (sensor_size, view_factor) = match sensor_fit {
            SensorFit::Horizontal => (sensor_w, render_w),
            SensorFit::Vertical => (sensor_h, render_h),
        };
        let pixel_size = ((sensor_size * near) / focal_len) / view_factor as f64;
        let right = 0.5 * render_w as f64 * pixel_size;
        let top = 0.5 * render_h as f64 * pixel_size;
        Projection::new(-right, right, -top, top, near, far)
    }

    /// The clip-space projection matrix.
    pub fn to_matrix(&self) -> Matrix4<f32> {
        let (l, r) = (self.left, self.right);
        let (b, t) = (self.bottom, self.top);
        let (n, f) = (self.near, self.far);
        // column-major constructor, written one column per row below
        Matrix4::new(
            (2.0 * n / (r - l)) as f32,
            0.0,
            0.0,
            0.0,
            0.0,
            (2.0 * n / (t - b)) as f32,
            0.0,
            0.0,
            ((r + l) / (r - l)) as f32,
            ((t + b) / (t - b)) as f32,
            (-(f + n) / (f - n)) as f32,
            -1.0,
            0.0,
            0.0,
            (-(2.0 * f * n) / (f - n)) as f32,
            0.0,
        )
    }
}

/// Which sensor dimension a physical camera fits the viewport to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorFit {
    Horizontal,
    Vertical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perspective_derived_values() {
        let proj = Projection::perspective(45.0, 1.0, 5.0, Some(0.888));
        assert!((proj.fov_x - 40.38938598965815).abs() < 1e-3);
        assert!((proj.fov_y - 45.0).abs() < 1e-6);
        assert!((proj.aspect - 0.888).abs() < 1e-6);
        assert!((proj.far_right - proj.right * 5.0).abs() < 1e-9);
        assert_eq!(proj.left, -proj.right);
    }

    #[test]
    fn test_sensor_camera() {
        let proj = Projection::from_sensor(
            32.0,
            18.0,
            35.27039762259147,
            395,
            244,
            SensorFit::Horizontal,
            0.1,
            10.0,
        );
        assert!((proj.left - -0.045363820876665274).abs() < 1e-12);
        assert!((proj.top - 0.02802220910321531).abs() < 1e-8);
        // window keeps the render aspect
        assert!((proj.top - proj.right * 244.0 / 395.0).abs() < 1e-15);
    }

    #[test]
    fn test_intrinsics() {
        let kcam = [[525.0, 0.0, 319.5], [0.0, 525.0, 239.5]];
        let proj = Projection::from_intrinsics(&kcam, 0.5, 10.0);
        assert!((proj.right - (0.5 * 319.5) / 525.0).abs() < 1e-12);
        assert!((proj.top - (0.5 * 239.5) / 525.0).abs() < 1e-12);
        assert_eq!(proj.left, -proj.right);
    }

    #[test]
    fn test_matrix_layout() {
        let proj = Projection::perspective(45.0, 1.0, 10.0, Some(1.0));
        let m = proj.to_matrix();
        // row 2 (z) and row 3 (w) of the clip transform
        assert!((m.z.z - (-(10.0 + 1.0) / 9.0) as f32).abs() < 1e-6);
        assert!((m.w.z - (-(2.0 * 10.0) / 9.0) as f32).abs() < 1e-6);
        assert_eq!(m.z.w, -1.0);
        assert_eq!(m.w.w, 0.0);
        assert_eq!(m.x.y, 0.0);
    }
}
