//! Camera math and interactive manipulators.

use cgmath::{InnerSpace, Matrix4, Point3, Vector3};

use crate::geometry::Bounds;

/// Which interaction scheme a viewer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraManipulator {
    /// WASD movement plus mouse look.
    FirstPerson,
    /// Orbit around the scene center, wheel to zoom.
    TrackBall,
}

/// Distance from a sphere's center at which the whole sphere fits a
/// camera with the given field of view (degrees).
pub fn min_bounding_distance(radius: f32, fov_deg: f32) -> f32 {
    let alpha = (fov_deg / 2.0).to_radians();
    let theta = (90.0 - fov_deg / 2.0).to_radians();
    alpha.cos() * ((theta.sin() * radius) / alpha.sin()) + theta.cos() * radius
}

/// View matrix looking at `center` from spherical coordinates (degrees).
pub fn sphere_view(
    elevation_deg: f32,
    azimuth_deg: f32,
    center: Vector3<f32>,
    distance: f32,
) -> Matrix4<f32> {
    let theta = elevation_deg.to_radians();
    let phi = azimuth_deg.to_radians() + std::f32::consts::PI * 1.5;

    let pos = Vector3::new(
        phi.cos() * distance * theta.cos(),
        theta.sin() * distance,
        -phi.sin() * distance * theta.cos(),
    ) + center;

    Matrix4::look_at_rh(
        Point3::new(pos.x, pos.y, pos.z),
        Point3::new(center.x, center.y, center.z),
        Vector3::unit_y(),
    )
}

/// Orbiting camera state used by the trackball manipulator.
#[derive(Debug, Clone, Copy)]
pub struct TrackBall {
    pub elevation: f32,
    pub azimuth: f32,
    pub distance: f32,
    pub center: Vector3<f32>,
}

impl Default for TrackBall {
    fn default() -> Self {
        TrackBall {
            elevation: 20.0,
            azimuth: 0.0,
            distance: 3.0,
            center: Vector3::new(0.0, 0.0, 0.0),
        }
    }
}

impl TrackBall {
    /// Frames the given bounds tightly for the camera's field of view.
    pub fn reset(&mut self, bounds: Option<Bounds>, fov_deg: f32) {
        let mut state = TrackBall::default();
        if let Some(bounds) = bounds {
            state.center = bounds.center();
            state.distance = min_bounding_distance(bounds.radius().max(1e-3), fov_deg);
        }
        *self = state;
    }

    pub fn rotate(&mut self, dx_deg: f32, dy_deg: f32) {
        self.azimuth += dx_deg;
        self.elevation = (self.elevation + dy_deg).clamp(-89.0, 89.0);
    }

    pub fn zoom(&mut self, steps: f32) {
        self.distance = (self.distance * (1.0 - steps * 0.1)).max(1e-3);
    }

    pub fn view_matrix(&self) -> Matrix4<f32> {
        sphere_view(self.elevation, self.azimuth, self.center, self.distance)
    }
}

/// Free-flying camera state used by the first-person manipulator.
#[derive(Debug, Clone, Copy)]
pub struct FirstPerson {
    pub eye: Point3<f32>,
    pub yaw: f32,
    pub pitch: f32,
}

impl Default for FirstPerson {
    fn default() -> Self {
        FirstPerson {
            eye: Point3::new(0.0, 0.0, 3.0),
            yaw: -90.0,
            pitch: 0.0,
        }
    }
}

impl FirstPerson {
    /// Places the camera at the framing distance in front of the bounds.
    pub fn reset(&mut self, bounds: Option<Bounds>, fov_deg: f32) {
        let mut state = FirstPerson::default();
        if let Some(bounds) = bounds {
            let center = bounds.center();
            let distance = min_bounding_distance(bounds.radius().max(1e-3), fov_deg);
            state.eye = Point3::new(center.x, center.y, center.z + distance);
        }
        *self = state;
    }

    fn forward_dir(&self) -> Vector3<f32> {
        let (yaw, pitch) = (self.yaw.to_radians(), self.pitch.to_radians());
        Vector3::new(
            yaw.cos() * pitch.cos(),
            pitch.sin(),
            yaw.sin() * pitch.cos(),
        )
        .normalize()
    }

    pub fn advance(&mut self, amount: f32) {
        self.eye += self.forward_dir() * amount;
    }

    pub fn strafe(&mut self, amount: f32) {
        let right = self.forward_dir().cross(Vector3::unit_y()).normalize();
        self.eye += right * amount;
    }

    pub fn look(&mut self, dx_deg: f32, dy_deg: f32) {
        self.yaw += dx_deg;
        self.pitch = (self.pitch + dy_deg).clamp(-89.0, 89.0);
    }

    pub fn view_matrix(&self) -> Matrix4<f32> {
        Matrix4::look_to_rh(self.eye, self.forward_dir(), Vector3::unit_y())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Transform;

    #[test]
    fn test_min_bounding_distance() {
        // at 90 degrees the tangent cone meets the sphere at 45 degrees
        let d = min_bounding_distance(1.0, 90.0);
        assert!((d - 2.0f32.sqrt()).abs() < 1e-5);
        // narrower fov pushes the camera away
        assert!(min_bounding_distance(1.0, 45.0) > d);
    }

    #[test]
    fn test_sphere_view_front() {
        let view = sphere_view(0.0, 0.0, Vector3::new(0.0, 0.0, 0.0), 5.0);
        let p = view.transform_point(Point3::new(0.0, 0.0, 0.0));
        assert!((p.x).abs() < 1e-5);
        assert!((p.y).abs() < 1e-5);
        assert!((p.z + 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_trackball_frames_bounds() {
        let bounds = Bounds::from_points([[-1.0, -1.0, -1.0], [1.0, 1.0, 1.0]]).unwrap();
        let mut cam = TrackBall::default();
        cam.reset(Some(bounds), 45.0);
        assert_eq!(cam.center, Vector3::new(0.0, 0.0, 0.0));
        assert!(cam.distance > bounds.radius());
    }
}
