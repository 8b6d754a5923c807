use crate::error::{DrivetrainError, Result};
use crate::geometry::{closest_equivalent_angle, wrap_angle, Twist2d};
use nalgebra as na;
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;

pub const MODULE_COUNT: usize = 4;

const SPEED_EPSILON: f64 = 1e-9;
const GEOMETRY_EPSILON: f64 = 1e-6;

/// Which frame a chassis velocity command is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    #[default]
    RobotRelative,
    FieldRelative,
}

/// Chassis motion: forward and strafe in m/s, omega in rad/s counter-clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChassisVelocity {
    pub forward: f64,
    pub strafe: f64,
    pub omega: f64,
}

impl ChassisVelocity {
    pub fn new(forward: f64, strafe: f64, omega: f64) -> Self {
        Self {
            forward,
            strafe,
            omega,
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Convert a field-relative command into the robot frame given the robot heading.
    pub fn from_field_relative(field: ChassisVelocity, heading: f64) -> Self {
        let (sin, cos) = heading.sin_cos();
        Self {
            forward: field.forward * cos + field.strafe * sin,
            strafe: -field.forward * sin + field.strafe * cos,
            omega: field.omega,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.forward.abs() < SPEED_EPSILON
            && self.strafe.abs() < SPEED_EPSILON
            && self.omega.abs() < SPEED_EPSILON
    }

    pub fn to_twist(&self, dt: f64) -> Twist2d {
        Twist2d::new(self.forward * dt, self.strafe * dt, self.omega * dt)
    }
}

/// Speed (m/s) and steering angle (rad) of a single module.
///
/// The angle is kept continuous. Use [`ModuleState::wrapped_angle`] when
/// comparing against absolute encoder readings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleState {
    pub speed: f64,
    pub angle: f64,
}

impl ModuleState {
    pub fn new(speed: f64, angle: f64) -> Self {
        Self { speed, angle }
    }

    pub fn wrapped_angle(&self) -> f64 {
        wrap_angle(self.angle)
    }

    pub fn velocity(&self) -> na::Vector2<f64> {
        let (sin, cos) = self.angle.sin_cos();
        na::Vector2::new(self.speed * cos, self.speed * sin)
    }

    /// Pick the equivalent target closest to `current_angle`.
    ///
    /// The module never steers more than 90° for a new target; beyond that
    /// the drive direction is reversed instead.
    pub fn optimize(&self, current_angle: f64) -> ModuleState {
        let target = closest_equivalent_angle(current_angle, self.angle);
        if (target - current_angle).abs() > FRAC_PI_2 {
            ModuleState::new(
                -self.speed,
                closest_equivalent_angle(current_angle, self.angle + std::f64::consts::PI),
            )
        } else {
            ModuleState::new(self.speed, target)
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwerveKinematics {
    locations: [na::Vector2<f64>; MODULE_COUNT],
    inverse_kinematics: na::SMatrix<f64, 8, 3>,
    forward_kinematics: na::SMatrix<f64, 3, 8>,
}

impl SwerveKinematics {
    pub fn new(locations: &[na::Vector2<f64>]) -> Result<Self> {
        if locations.len() != MODULE_COUNT {
            return Err(DrivetrainError::configuration(format!(
                "swerve kinematics needs {} modules, got {}",
                MODULE_COUNT,
                locations.len()
            )));
        }
        let locations: [na::Vector2<f64>; MODULE_COUNT] =
            [locations[0], locations[1], locations[2], locations[3]];
        if locations.iter().any(|l| !l.x.is_finite() || !l.y.is_finite()) {
            return Err(DrivetrainError::configuration(
                "module locations must be finite",
            ));
        }
        check_geometry(&locations)?;

        let inverse_kinematics = inverse_matrix(&locations, &na::Vector2::zeros());
        let normal = inverse_kinematics.transpose() * inverse_kinematics;
        let normal_inverse = normal.try_inverse().ok_or_else(|| {
            DrivetrainError::configuration("module geometry makes kinematics singular")
        })?;
        let forward_kinematics = normal_inverse * inverse_kinematics.transpose();

        Ok(Self {
            locations,
            inverse_kinematics,
            forward_kinematics,
        })
    }

    pub fn locations(&self) -> &[na::Vector2<f64>; MODULE_COUNT] {
        &self.locations
    }

    /// Chassis velocity to per-module targets, rotating about the chassis center.
    pub fn to_module_states(&self, velocity: &ChassisVelocity) -> [ModuleState; MODULE_COUNT] {
        states_from_matrix(&self.inverse_kinematics, velocity)
    }

    /// Chassis velocity to per-module targets, rotating about `center_of_rotation`.
    pub fn to_module_states_about(
        &self,
        velocity: &ChassisVelocity,
        center_of_rotation: &na::Vector2<f64>,
    ) -> [ModuleState; MODULE_COUNT] {
        let matrix = inverse_matrix(&self.locations, center_of_rotation);
        states_from_matrix(&matrix, velocity)
    }

    /// Least squares chassis velocity from measured module states.
    pub fn to_chassis_velocity(&self, states: &[ModuleState]) -> Result<ChassisVelocity> {
        if states.len() != MODULE_COUNT {
            return Err(DrivetrainError::DimensionMismatch {
                expected: MODULE_COUNT,
                actual: states.len(),
            });
        }
        let mut module_velocities = na::SVector::<f64, 8>::zeros();
        for (i, state) in states.iter().enumerate() {
            let velocity = state.velocity();
            module_velocities[i * 2] = velocity.x;
            module_velocities[i * 2 + 1] = velocity.y;
        }
        let chassis = self.forward_kinematics * module_velocities;
        Ok(ChassisVelocity::new(chassis[0], chassis[1], chassis[2]))
    }

    /// Scale all module speeds by the same factor so none exceeds `max_speed`.
    pub fn desaturate(states: &mut [ModuleState], max_speed: f64) {
        let max_speed = max_speed.abs();
        let largest = states
            .iter()
            .map(|state| state.speed.abs())
            .fold(0.0_f64, f64::max);
        if largest > max_speed && largest > 0.0 {
            let ratio = max_speed / largest;
            for state in states.iter_mut() {
                state.speed *= ratio;
            }
        }
    }
}

fn inverse_matrix(
    locations: &[na::Vector2<f64>; MODULE_COUNT],
    center: &na::Vector2<f64>,
) -> na::SMatrix<f64, 8, 3> {
    let mut matrix = na::SMatrix::<f64, 8, 3>::zeros();
    for (i, location) in locations.iter().enumerate() {
        let relative = location - center;
        matrix[(i * 2, 0)] = 1.0;
        matrix[(i * 2, 2)] = -relative.y;
        matrix[(i * 2 + 1, 1)] = 1.0;
        matrix[(i * 2 + 1, 2)] = relative.x;
    }
    matrix
}

fn states_from_matrix(
    matrix: &na::SMatrix<f64, 8, 3>,
    velocity: &ChassisVelocity,
) -> [ModuleState; MODULE_COUNT] {
    let module_velocities =
        matrix * na::Vector3::new(velocity.forward, velocity.strafe, velocity.omega);
    let mut states = [ModuleState::default(); MODULE_COUNT];
    for (i, state) in states.iter_mut().enumerate() {
        let vx = module_velocities[i * 2];
        let vy = module_velocities[i * 2 + 1];
        let speed = vx.hypot(vy);
        let angle = if speed < SPEED_EPSILON {
            0.0
        } else {
            vy.atan2(vx)
        };
        *state = ModuleState::new(speed, angle);
    }
    states
}

fn check_geometry(locations: &[na::Vector2<f64>; MODULE_COUNT]) -> Result<()> {
    for (i, a) in locations.iter().enumerate() {
        for b in locations.iter().skip(i + 1) {
            if (a - b).norm() < GEOMETRY_EPSILON {
                return Err(DrivetrainError::configuration(
                    "two modules share the same location",
                ));
            }
        }
    }
    // twice the largest triangle area spanned by any three modules
    let mut largest_area = 0.0_f64;
    for i in 0..MODULE_COUNT {
        for j in (i + 1)..MODULE_COUNT {
            for k in (j + 1)..MODULE_COUNT {
                let ab = locations[j] - locations[i];
                let ac = locations[k] - locations[i];
                largest_area = largest_area.max((ab.x * ac.y - ab.y * ac.x).abs());
            }
        }
    }
    if largest_area < GEOMETRY_EPSILON {
        return Err(DrivetrainError::configuration(
            "module locations are collinear",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use std::f64::consts::{FRAC_PI_4, PI};

    const HALF: f64 = 0.3683;

    fn square_kinematics() -> SwerveKinematics {
        SwerveKinematics::new(&[
            na::Vector2::new(HALF, -HALF),
            na::Vector2::new(HALF, HALF),
            na::Vector2::new(-HALF, HALF),
            na::Vector2::new(-HALF, -HALF),
        ])
        .unwrap()
    }

    #[test]
    fn pure_forward_points_all_modules_ahead() {
        let kinematics = square_kinematics();
        let states = kinematics.to_module_states(&ChassisVelocity::new(2.0, 0.0, 0.0));
        for state in states {
            assert_relative_eq!(state.speed, 2.0, epsilon = 1e-12);
            assert_relative_eq!(state.angle, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn pure_strafe_points_all_modules_left() {
        let kinematics = square_kinematics();
        let states = kinematics.to_module_states(&ChassisVelocity::new(0.0, 1.0, 0.0));
        for state in states {
            assert_relative_eq!(state.speed, 1.0, epsilon = 1e-12);
            assert_relative_eq!(state.angle, FRAC_PI_2, epsilon = 1e-12);
        }
    }

    #[test]
    fn pure_rotation_is_tangential() {
        let kinematics = square_kinematics();
        let omega = 1.5;
        let states = kinematics.to_module_states(&ChassisVelocity::new(0.0, 0.0, omega));
        let radius = (2.0 * HALF * HALF).sqrt();
        for (state, location) in states.iter().zip(kinematics.locations()) {
            assert_relative_eq!(state.speed, omega * radius, epsilon = 1e-12);
            // velocity is perpendicular to the position vector
            assert_relative_eq!(state.velocity().dot(location), 0.0, epsilon = 1e-12);
        }
        // front right module at (+x, -y) moves toward +x +y
        assert_relative_eq!(states[0].angle, FRAC_PI_4, epsilon = 1e-12);
        assert_relative_eq!(states[1].angle, 3.0 * FRAC_PI_4, epsilon = 1e-12);
    }

    #[test]
    fn rotation_speed_scales_with_distance() {
        let kinematics = SwerveKinematics::new(&[
            na::Vector2::new(1.0, 0.0),
            na::Vector2::new(0.0, 2.0),
            na::Vector2::new(-3.0, 0.0),
            na::Vector2::new(0.0, -0.5),
        ])
        .unwrap();
        let states = kinematics.to_module_states(&ChassisVelocity::new(0.0, 0.0, 2.0));
        assert_relative_eq!(states[0].speed, 2.0, epsilon = 1e-12);
        assert_relative_eq!(states[1].speed, 4.0, epsilon = 1e-12);
        assert_relative_eq!(states[2].speed, 6.0, epsilon = 1e-12);
        assert_relative_eq!(states[3].speed, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn rotation_about_front_right_module() {
        let kinematics = square_kinematics();
        let center = kinematics.locations()[0];
        let states =
            kinematics.to_module_states_about(&ChassisVelocity::new(0.0, 0.0, 1.0), &center);
        assert_relative_eq!(states[0].speed, 0.0, epsilon = 1e-12);
        assert_relative_eq!(states[2].speed, 2.0 * HALF * 2.0_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn wrong_module_count_is_configuration_error() {
        let result = SwerveKinematics::new(&[na::Vector2::new(1.0, 0.0); 3]);
        assert!(matches!(result, Err(DrivetrainError::Configuration(_))));
    }

    #[test]
    fn collinear_modules_are_rejected() {
        let result = SwerveKinematics::new(&[
            na::Vector2::new(-1.0, 0.0),
            na::Vector2::new(0.0, 0.0),
            na::Vector2::new(1.0, 0.0),
            na::Vector2::new(2.0, 0.0),
        ]);
        assert!(matches!(result, Err(DrivetrainError::Configuration(_))));
    }

    #[test]
    fn coincident_modules_are_rejected() {
        let result = SwerveKinematics::new(&[
            na::Vector2::new(1.0, 1.0),
            na::Vector2::new(1.0, 1.0),
            na::Vector2::new(-1.0, 1.0),
            na::Vector2::new(0.0, -1.0),
        ]);
        assert!(matches!(result, Err(DrivetrainError::Configuration(_))));
    }

    #[test]
    fn chassis_velocity_needs_four_states() {
        let kinematics = square_kinematics();
        let result = kinematics.to_chassis_velocity(&[ModuleState::default(); 2]);
        assert_eq!(
            result,
            Err(DrivetrainError::DimensionMismatch {
                expected: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn desaturate_is_noop_below_limit() {
        let mut states = [
            ModuleState::new(1.0, 0.0),
            ModuleState::new(-2.0, 1.0),
            ModuleState::new(0.5, 2.0),
            ModuleState::new(3.0, 3.0),
        ];
        let before = states;
        SwerveKinematics::desaturate(&mut states, 3.0);
        assert_eq!(states, before);
    }

    #[test]
    fn field_relative_rotates_by_heading() {
        let field = ChassisVelocity::new(1.0, 0.0, 0.5);
        let robot = ChassisVelocity::from_field_relative(field, FRAC_PI_2);
        assert_relative_eq!(robot.forward, 0.0, epsilon = 1e-12);
        assert_relative_eq!(robot.strafe, -1.0, epsilon = 1e-12);
        assert_relative_eq!(robot.omega, 0.5);
    }

    #[test]
    fn optimize_reverses_instead_of_half_turn() {
        let optimized = ModuleState::new(2.0, PI).optimize(0.0);
        assert_relative_eq!(optimized.speed, -2.0);
        assert_relative_eq!(optimized.angle, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn optimize_keeps_continuous_angle() {
        let current = 4.0 * PI + 0.1;
        let optimized = ModuleState::new(1.0, 0.3).optimize(current);
        assert_relative_eq!(optimized.speed, 1.0);
        assert_relative_eq!(optimized.angle, 4.0 * PI + 0.3, epsilon = 1e-9);
    }

    proptest! {
        #[test]
        fn round_trip_recovers_chassis_velocity(
            forward in -5.0..5.0_f64,
            strafe in -5.0..5.0_f64,
            omega in -10.0..10.0_f64,
        ) {
            let kinematics = square_kinematics();
            let velocity = ChassisVelocity::new(forward, strafe, omega);
            let states = kinematics.to_module_states(&velocity);
            let recovered = kinematics.to_chassis_velocity(&states).unwrap();
            prop_assert!((recovered.forward - forward).abs() < 1e-9);
            prop_assert!((recovered.strafe - strafe).abs() < 1e-9);
            prop_assert!((recovered.omega - omega).abs() < 1e-9);
        }

        #[test]
        fn desaturate_scales_uniformly(
            speeds in proptest::array::uniform4(-10.0..10.0_f64),
            max_speed in 0.5..6.0_f64,
        ) {
            let mut states = speeds.map(|speed| ModuleState::new(speed, 0.0));
            SwerveKinematics::desaturate(&mut states, max_speed);
            let largest_input = speeds.iter().fold(0.0_f64, |acc, s| acc.max(s.abs()));
            let largest_output = states.iter().fold(0.0_f64, |acc, s| acc.max(s.speed.abs()));
            if largest_input > max_speed {
                prop_assert!((largest_output - max_speed).abs() < 1e-9);
                let ratio = max_speed / largest_input;
                for (state, speed) in states.iter().zip(speeds.iter()) {
                    prop_assert!((state.speed - speed * ratio).abs() < 1e-9);
                }
            } else {
                for (state, speed) in states.iter().zip(speeds.iter()) {
                    prop_assert_eq!(state.speed, *speed);
                }
            }
        }
    }
}
