//! Small numeric helpers shared by tile math and style evaluation.

/// Wraps `value` into the half-open range `[min, max)`.
///
/// Values exactly at `max` map to `min`, negative values wrap from the top:
/// `wrap(-3.0, 0.0, 12.0) == 9.0`.
pub fn wrap(value: f64, min: f64, max: f64) -> f64 {
    let d = max - min;
    if d <= 0.0 || !d.is_finite() {
        return min;
    }
    let r = (value - min).rem_euclid(d);
    // rem_euclid can round up to `d` for tiny negative inputs
    let r = if r >= d { 0.0 } else { r };
    r + min
}

/// Wraps an integer tile column into `[0, 2^z)` and reports how many whole
/// worlds it was shifted by.
pub fn wrap_tile_x(x: i64, z: u8) -> (u32, i16) {
    let n = 1i64 << z;
    let wrap = x.div_euclid(n);
    let wrapped = x.rem_euclid(n);
    (wrapped as u32, wrap.clamp(i16::MIN as i64, i16::MAX as i64) as i16)
}

pub fn clamp<T: PartialOrd>(value: T, min: T, max: T) -> T {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

/// Linear interpolation between two scalars.
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wrap_boundaries() {
        assert_eq!(wrap(-3.0, 0.0, 12.0), 9.0);
        assert_eq!(wrap(12.0, 0.0, 12.0), 0.0);
        assert_eq!(wrap(0.0, 0.0, 12.0), 0.0);
        assert_eq!(wrap(16.0, 0.0, 12.0), 4.0);
        assert_eq!(wrap(-12.0, 0.0, 12.0), 0.0);
        assert_eq!(wrap(190.0, -180.0, 180.0), -170.0);
    }

    #[test]
    fn test_wrap_tiny_negative_stays_in_range() {
        let w = wrap(-1e-18, 0.0, 12.0);
        assert!((0.0..12.0).contains(&w));
    }

    #[test]
    fn test_wrap_tile_x() {
        assert_eq!(wrap_tile_x(-1, 2), (3, -1));
        assert_eq!(wrap_tile_x(4, 2), (0, 1));
        assert_eq!(wrap_tile_x(2, 2), (2, 0));
        assert_eq!(wrap_tile_x(-9, 3), (7, -2));
    }

    proptest! {
        #[test]
        fn wrap_lands_in_range(x in -1.0e6f64..1.0e6) {
            let w = wrap(x, 0.0, 12.0);
            prop_assert!(w >= 0.0 && w < 12.0);
        }

        #[test]
        fn wrap_is_idempotent(x in -1.0e6f64..1.0e6) {
            let w = wrap(x, 0.0, 12.0);
            prop_assert_eq!(wrap(w, 0.0, 12.0), w);
        }
    }
}
