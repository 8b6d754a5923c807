use nalgebra as na;
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};
use std::fmt;

/// Wrap an angle into `(-PI, PI]`.
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

/// Continuous angle equivalent to `angle` that is closest to `reference`.
///
/// Used to keep estimator angles free of wrap-around jumps.
pub fn closest_equivalent_angle(reference: f64, angle: f64) -> f64 {
    reference + wrap_angle(angle - reference)
}

/// Robot displacement expressed in the robot frame at the start of the motion.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Twist2d {
    pub dx: f64,
    pub dy: f64,
    pub dtheta: f64,
}

impl Twist2d {
    pub fn new(dx: f64, dy: f64, dtheta: f64) -> Self {
        Self { dx, dy, dtheta }
    }
}

/// Planar pose with a continuous heading.
///
/// Heading is never wrapped so that consumers can difference consecutive
/// poses without special casing the ±180° seam.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose2d {
    position: na::Point2<f64>,
    heading: f64,
}

impl Default for Pose2d {
    fn default() -> Self {
        Self::origin()
    }
}

impl Pose2d {
    pub fn from_na(position: na::Point2<f64>, heading: f64) -> Self {
        Self { position, heading }
    }

    pub fn new((x, y): (f64, f64), heading: f64) -> Self {
        Self {
            position: na::Point2::new(x, y),
            heading,
        }
    }

    pub fn origin() -> Self {
        Self::new((0.0, 0.0), 0.0)
    }

    pub fn position(&self) -> &na::Point2<f64> {
        &self.position
    }

    pub fn x(&self) -> f64 {
        self.position.x
    }

    pub fn y(&self) -> f64 {
        self.position.y
    }

    pub fn heading(&self) -> f64 {
        self.heading
    }

    pub fn rotation(&self) -> na::Rotation2<f64> {
        na::Rotation2::new(self.heading)
    }

    pub fn with_heading(&self, heading: f64) -> Self {
        Self {
            position: self.position,
            heading,
        }
    }

    /// Apply a robot-relative twist using the exponential map, so constant
    /// curvature motion over a tick is integrated exactly.
    pub fn exp(&self, twist: &Twist2d) -> Self {
        let (sin_theta, cos_theta) = twist.dtheta.sin_cos();
        let (s, c) = if twist.dtheta.abs() < 1e-9 {
            (
                1.0 - twist.dtheta * twist.dtheta / 6.0,
                0.5 * twist.dtheta,
            )
        } else {
            (sin_theta / twist.dtheta, (1.0 - cos_theta) / twist.dtheta)
        };
        let local = na::Vector2::new(twist.dx * s - twist.dy * c, twist.dx * c + twist.dy * s);
        Self {
            position: self.position + self.rotation() * local,
            heading: self.heading + twist.dtheta,
        }
    }

    /// Linear interpolation between two poses, `t` in `[0, 1]`.
    pub fn interpolate(&self, other: &Pose2d, t: f64) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self {
            position: self.position + (other.position - self.position) * t,
            heading: self.heading + (other.heading - self.heading) * t,
        }
    }
}

impl fmt::Display for Pose2d {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{:.3}, {:.3}] -> {:.1}",
            self.position.x,
            self.position.y,
            self.heading.to_degrees()
        )
    }
}
