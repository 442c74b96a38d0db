pub mod ring;
pub mod vec3;

pub use ring::RingBuffer;
pub use vec3::Vec3;

/// Gaussian sample (Box-Muller) with the given standard deviation
pub fn gaussian<R: rand::Rng + ?Sized>(rng: &mut R, std_dev: f32) -> f32 {
    let u1: f32 = rng.gen::<f32>().clamp(f32::MIN_POSITIVE, 1.0);
    let u2: f32 = rng.gen::<f32>();
    (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos() * std_dev
}

/// Wrap an angle in degrees into [-180, 180)
pub fn wrap_degrees(angle: f32) -> f32 {
    let wrapped = (angle + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped.is_nan() {
        0.0
    } else {
        wrapped
    }
}
