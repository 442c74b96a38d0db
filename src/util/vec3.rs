use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Index, Mul, MulAssign, Neg, Sub, SubAssign};

/// 3D vector in world units (z is up)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };
    pub const ONE: Vec3 = Vec3 { x: 1.0, y: 1.0, z: 1.0 };
    pub const UP: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 1.0 };
    pub const DOWN: Vec3 = Vec3 { x: 0.0, y: 0.0, z: -1.0 };
    pub const FORWARD: Vec3 = Vec3 { x: 1.0, y: 0.0, z: 0.0 };
    pub const LEFT: Vec3 = Vec3 { x: 0.0, y: 1.0, z: 0.0 };

    #[inline]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub const fn splat(v: f32) -> Self {
        Self { x: v, y: v, z: v }
    }

    /// Horizontal unit vector for a yaw angle in degrees
    #[inline]
    pub fn from_yaw(yaw_deg: f32) -> Self {
        let r = yaw_deg.to_radians();
        Self::new(r.cos(), r.sin(), 0.0)
    }

    /// Unit forward vector for pitch/yaw angles in degrees (positive pitch looks down)
    pub fn from_angles(pitch_deg: f32, yaw_deg: f32) -> Self {
        let (sp, cp) = pitch_deg.to_radians().sin_cos();
        let (sy, cy) = yaw_deg.to_radians().sin_cos();
        Self::new(cp * cy, cp * sy, -sp)
    }

    /// Returns (pitch, yaw) in degrees for this direction
    pub fn to_angles(&self) -> (f32, f32) {
        if self.x == 0.0 && self.y == 0.0 {
            let pitch = if self.z > 0.0 { -90.0 } else { 90.0 };
            return (pitch, 0.0);
        }
        let yaw = self.y.atan2(self.x).to_degrees();
        let forward = (self.x * self.x + self.y * self.y).sqrt();
        let pitch = -self.z.atan2(forward).to_degrees();
        (pitch, yaw)
    }

    #[inline]
    pub fn length(&self) -> f32 {
        self.length_sq().sqrt()
    }

    #[inline]
    pub fn length_sq(&self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Length ignoring the vertical component
    #[inline]
    pub fn length_xy(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn normalize(&self) -> Self {
        let len = self.length();
        if len > 0.0 {
            *self * (1.0 / len)
        } else {
            Self::ZERO
        }
    }

    #[inline]
    pub fn dot(&self, other: Vec3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    #[inline]
    pub fn cross(&self, other: Vec3) -> Vec3 {
        Vec3 {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    #[inline]
    pub fn distance_to(&self, other: Vec3) -> f32 {
        (*self - other).length()
    }

    #[inline]
    pub fn distance_sq_to(&self, other: Vec3) -> f32 {
        (*self - other).length_sq()
    }

    /// Copy with the vertical component zeroed
    #[inline]
    pub fn flat(&self) -> Self {
        Self::new(self.x, self.y, 0.0)
    }

    pub fn clamp_length(&self, max: f32) -> Self {
        let len = self.length();
        if len > max && len > 0.0 {
            *self * (max / len)
        } else {
            *self
        }
    }

    pub fn lerp(&self, other: Vec3, t: f32) -> Self {
        *self + (other - *self) * t
    }

    /// Rotate around the z axis by `angle` radians
    pub fn rotate_z(&self, angle: f32) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self {
            x: self.x * cos - self.y * sin,
            y: self.x * sin + self.y * cos,
            z: self.z,
        }
    }

    /// Horizontal perpendicular (rotated 90 degrees counter-clockwise about z)
    pub fn perpendicular_xy(&self) -> Self {
        Self::new(-self.y, self.x, 0.0)
    }

    /// Unsigned angle in radians between two vectors
    pub fn angle_between(&self, other: Vec3) -> f32 {
        let denom = self.length() * other.length();
        if denom <= f32::EPSILON {
            return 0.0;
        }
        (self.dot(other) / denom).clamp(-1.0, 1.0).acos()
    }

    /// Component-wise min
    pub fn min(&self, other: Vec3) -> Self {
        Self::new(self.x.min(other.x), self.y.min(other.y), self.z.min(other.z))
    }

    /// Component-wise max
    pub fn max(&self, other: Vec3) -> Self {
        Self::new(self.x.max(other.x), self.y.max(other.y), self.z.max(other.z))
    }

    /// Check if vector is approximately zero
    pub fn is_zero(&self, epsilon: f32) -> bool {
        self.x.abs() < epsilon && self.y.abs() < epsilon && self.z.abs() < epsilon
    }

    /// Check if vector is approximately equal to another
    pub fn approx_eq(&self, other: Vec3, epsilon: f32) -> bool {
        (*self - other).is_zero(epsilon)
    }
}

impl Add for Vec3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Mul<Vec3> for f32 {
    type Output = Vec3;
    fn mul(self, rhs: Vec3) -> Vec3 {
        rhs * self
    }
}

impl Neg for Vec3 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
        self.z += rhs.z;
    }
}

impl SubAssign for Vec3 {
    fn sub_assign(&mut self, rhs: Self) {
        self.x -= rhs.x;
        self.y -= rhs.y;
        self.z -= rhs.z;
    }
}

impl MulAssign<f32> for Vec3 {
    fn mul_assign(&mut self, rhs: f32) {
        self.x *= rhs;
        self.y *= rhs;
        self.z *= rhs;
    }
}

impl Index<usize> for Vec3 {
    type Output = f32;
    fn index(&self, axis: usize) -> &f32 {
        match axis {
            0 => &self.x,
            1 => &self.y,
            _ => &self.z,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-4;

    fn approx_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < EPSILON
    }

    #[test]
    fn test_length() {
        let v = Vec3::new(2.0, 3.0, 6.0);
        assert!(approx_eq(v.length(), 7.0));
        assert!(approx_eq(v.length_sq(), 49.0));
        assert!(approx_eq(v.length_xy(), 13.0f32.sqrt()));
    }

    #[test]
    fn test_normalize_zero() {
        assert_eq!(Vec3::ZERO.normalize(), Vec3::ZERO);
    }

    #[test]
    fn test_cross() {
        let z = Vec3::FORWARD.cross(Vec3::LEFT);
        assert!(z.approx_eq(Vec3::UP, EPSILON));
    }

    #[test]
    fn test_angles_roundtrip() {
        let dir = Vec3::from_angles(30.0, 45.0);
        let (pitch, yaw) = dir.to_angles();
        assert!(approx_eq(pitch, 30.0));
        assert!(approx_eq(yaw, 45.0));
    }

    #[test]
    fn test_looking_down_has_positive_pitch() {
        let (pitch, _) = Vec3::new(1.0, 0.0, -1.0).to_angles();
        assert!(approx_eq(pitch, 45.0));
    }

    #[test]
    fn test_rotate_z() {
        let v = Vec3::FORWARD.rotate_z(std::f32::consts::FRAC_PI_2);
        assert!(v.approx_eq(Vec3::LEFT, EPSILON));
        assert!(Vec3::FORWARD.perpendicular_xy().approx_eq(Vec3::LEFT, EPSILON));
    }

    #[test]
    fn test_angle_between() {
        let a = Vec3::FORWARD;
        let b = Vec3::LEFT;
        assert!(approx_eq(a.angle_between(b), std::f32::consts::FRAC_PI_2));
        assert!(approx_eq(a.angle_between(Vec3::ZERO), 0.0));
    }

    #[test]
    fn test_serde() {
        let v = Vec3::new(1.5, -2.5, 64.0);
        let encoded = bincode::serde::encode_to_vec(v, bincode::config::standard()).unwrap();
        let (decoded, _): (Vec3, usize) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(v, decoded);
    }
}
