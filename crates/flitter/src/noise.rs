//! Deterministic coherent noise over one to three coordinates.
//!
//! Classic gradient noise: pseudo-random gradients are derived from the seed
//! and the integer lattice point, blended with a quintic fade. The value at
//! every integer lattice point is exactly zero, outputs are clamped to
//! `[-1, 1]`, and the same seed always produces the same field.

use crate::hashing::mix;

/// Quintic fade, zero slope at both ends.
fn fade(t: f64) -> f64 {
    t * t * t * t.mul_add(t.mul_add(6.0, -15.0), 10.0)
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    (b - a).mul_add(t, a)
}

fn lattice(seed: u64, ix: i64, iy: i64, iz: i64) -> u64 {
    let mut h = mix(seed, u64::from_ne_bytes(ix.to_ne_bytes()));
    h = mix(h, u64::from_ne_bytes(iy.to_ne_bytes()));
    mix(h, u64::from_ne_bytes(iz.to_ne_bytes()))
}

/// A gradient slope in `[-1, 1]`.
fn grad1(h: u64) -> f64 {
    (h as f64 / u64::MAX as f64).mul_add(2.0, -1.0)
}

fn grad2(h: u64, dx: f64, dy: f64) -> f64 {
    // Eight directions: axes and diagonals.
    match h & 7 {
        0 => dx,
        1 => -dx,
        2 => dy,
        3 => -dy,
        4 => dx + dy,
        5 => dx - dy,
        6 => -dx + dy,
        _ => -dx - dy,
    }
}

fn grad3(h: u64, dx: f64, dy: f64, dz: f64) -> f64 {
    // The twelve edge directions of a cube.
    match h % 12 {
        0 => dx + dy,
        1 => -dx + dy,
        2 => dx - dy,
        3 => -dx - dy,
        4 => dx + dz,
        5 => -dx + dz,
        6 => dx - dz,
        7 => -dx - dz,
        8 => dy + dz,
        9 => -dy + dz,
        10 => dy - dz,
        _ => -dy - dz,
    }
}

fn noise1(seed: u64, x: f64) -> f64 {
    let ix = x.floor() as i64;
    let fx = x - x.floor();
    let g0 = grad1(lattice(seed, ix, 0, 0)) * fx;
    let g1 = grad1(lattice(seed, ix + 1, 0, 0)) * (fx - 1.0);
    2.0 * lerp(g0, g1, fade(fx))
}

fn noise2(seed: u64, x: f64, y: f64) -> f64 {
    let (ix, iy) = (x.floor() as i64, y.floor() as i64);
    let (fx, fy) = (x - x.floor(), y - y.floor());
    let (ux, uy) = (fade(fx), fade(fy));
    let n00 = grad2(lattice(seed, ix, iy, 0), fx, fy);
    let n10 = grad2(lattice(seed, ix + 1, iy, 0), fx - 1.0, fy);
    let n01 = grad2(lattice(seed, ix, iy + 1, 0), fx, fy - 1.0);
    let n11 = grad2(lattice(seed, ix + 1, iy + 1, 0), fx - 1.0, fy - 1.0);
    0.7 * lerp(lerp(n00, n10, ux), lerp(n01, n11, ux), uy)
}

fn noise3(seed: u64, x: f64, y: f64, z: f64) -> f64 {
    let (ix, iy, iz) = (x.floor() as i64, y.floor() as i64, z.floor() as i64);
    let (fx, fy, fz) = (x - x.floor(), y - y.floor(), z - z.floor());
    let (ux, uy, uz) = (fade(fx), fade(fy), fade(fz));
    let n000 = grad3(lattice(seed, ix, iy, iz), fx, fy, fz);
    let n100 = grad3(lattice(seed, ix + 1, iy, iz), fx - 1.0, fy, fz);
    let n010 = grad3(lattice(seed, ix, iy + 1, iz), fx, fy - 1.0, fz);
    let n110 = grad3(lattice(seed, ix + 1, iy + 1, iz), fx - 1.0, fy - 1.0, fz);
    let n001 = grad3(lattice(seed, ix, iy, iz + 1), fx, fy, fz - 1.0);
    let n101 = grad3(lattice(seed, ix + 1, iy, iz + 1), fx - 1.0, fy, fz - 1.0);
    let n011 = grad3(lattice(seed, ix, iy + 1, iz + 1), fx, fy - 1.0, fz - 1.0);
    let n111 = grad3(lattice(seed, ix + 1, iy + 1, iz + 1), fx - 1.0, fy - 1.0, fz - 1.0);
    let front = lerp(lerp(n000, n100, ux), lerp(n010, n110, ux), uy);
    let back = lerp(lerp(n001, n101, ux), lerp(n011, n111, ux), uy);
    0.6 * lerp(front, back, uz)
}

/// Noise at one to three coordinates, clamped to `[-1, 1]`.
///
/// # Panics
/// Panics when called with zero or more than three coordinates; callers
/// validate arity first.
#[must_use]
pub fn sample(seed: u64, coords: &[f64]) -> f64 {
    let value = match coords {
        [x] => noise1(seed, *x),
        [x, y] => noise2(seed, *x, *y),
        [x, y, z] => noise3(seed, *x, *y, *z),
        _ => panic!("noise requires 1 to 3 coordinates"),
    };
    value.clamp(-1.0, 1.0)
}

/// Octave-aggregated noise: each octave doubles the frequency and scales by
/// `roughness`; the sum is normalized by the total weight.
#[must_use]
pub fn octave_sample(seed: u64, octaves: u32, roughness: f64, coords: &[f64]) -> f64 {
    let octaves = octaves.max(1);
    let mut total = 0.0;
    let mut weight = 1.0;
    let mut weight_sum = 0.0;
    let mut scale = 1.0;
    let mut scaled = coords.to_vec();
    for octave in 0..octaves {
        for (slot, coord) in scaled.iter_mut().zip(coords.iter()) {
            *slot = coord * scale;
        }
        total += weight * sample(mix(seed, u64::from(octave)), &scaled);
        weight_sum += weight;
        weight *= roughness;
        scale *= 2.0;
    }
    if weight_sum == 0.0 {
        return 0.0;
    }
    (total / weight_sum).clamp(-1.0, 1.0)
}
