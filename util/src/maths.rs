//! Utility maths functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use num_traits::Float;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Degrees in one full turn.
pub const DEG_PER_TURN: f64 = 360.0;

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Clamp a value between `min` and `max`.
pub fn clamp<T>(value: T, min: T, max: T) -> T
where
    T: Float,
{
    let mut ret = value;

    if ret > max {
        ret = max
    }
    if ret < min {
        ret = min
    }

    ret
}

/// Get the shortest signed angular distance, in degrees, needed to go from `current` to `goal`.
///
/// The result lies in `(-180, 180]`. Swapping the arguments negates the result, except at
/// exactly 180 degrees where both directions are reported as `+180`.
pub fn shortest_signed_difference<T>(goal: T, current: T) -> T
where
    T: Float,
{
    let full: T = deg_per_turn();
    let half: T = full / (T::one() + T::one());

    let mut d = rem_euclid(goal - current, full);

    // Float round off can put a tiny negative remainder at exactly `full`
    if d >= full {
        d = d - full;
    }

    if d > half {
        d - full
    } else {
        d
    }
}

/// Wrap an angle in degrees into `[0, 360)`.
pub fn wrap_deg<T>(deg: T) -> T
where
    T: Float,
{
    let full: T = deg_per_turn();
    let w = rem_euclid(deg, full);

    if w >= full {
        w - full
    } else {
        w
    }
}

/// Convert a target angle in degrees into the absolute turn count nearest to `current_turns`.
///
/// The returned value is never more than half a turn away from `current_turns`, so the motor
/// always takes the short way round.
pub fn nearest_turns<T>(current_turns: T, target_deg: T) -> T
where
    T: Float,
{
    let full: T = deg_per_turn();

    let current_deg = wrap_deg(current_turns * full);
    let delta_deg = shortest_signed_difference(target_deg, current_deg);

    current_turns + delta_deg / full
}

/// [`DEG_PER_TURN`] in the caller's float type.
fn deg_per_turn<T: Float>() -> T {
    T::from(DEG_PER_TURN).unwrap_or_else(T::nan)
}

/// Calculates the least nonnegative remainder of `lhs (mod rhs)`.
///
/// This function is taken from the std library as num is missing it.
///
/// In particular, the return value `r` satisfies `0.0 <= r < rhs.abs()` in
/// most cases. However, due to a floating point round-off error it can
/// result in `r == rhs.abs()`, violating the mathematical definition, if
/// `self` is much smaller than `rhs.abs()` in magnitude and `self < 0.0`.
pub fn rem_euclid<T>(lhs: T, rhs: T) -> T
where
    T: Float,
{
    let r = lhs % rhs;
    if r < T::zero() {
        r + rhs.abs()
    } else {
        r
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TOL: f64 = 1e-9;

    #[test]
    fn test_shortest_signed_difference() {
        assert_eq!(shortest_signed_difference(350f64, 10f64), -20f64);
        assert_eq!(shortest_signed_difference(10f64, 350f64), 20f64);
        assert_eq!(shortest_signed_difference(0f64, 360f64), 0f64);
        assert_eq!(shortest_signed_difference(180f64, 0f64), 180f64);
        assert_eq!(shortest_signed_difference(0f64, 180f64), 180f64);
        assert_eq!(shortest_signed_difference(-90f64, 720f64), -90f64);
    }

    #[test]
    fn test_shortest_signed_difference_range_and_symmetry() {
        let mut goal = -725.0f64;
        while goal < 725.0 {
            let mut current = -725.0f64;
            while current < 725.0 {
                let d = shortest_signed_difference(goal, current);
                assert!(d > -180.0 && d <= 180.0, "{} from {} gave {}", goal, current, d);

                if (d.abs() - 180.0).abs() > TOL {
                    let r = shortest_signed_difference(current, goal);
                    assert!((d + r).abs() < TOL, "{} vs {}", d, r);
                }
                current += 13.7;
            }
            goal += 11.3;
        }
    }

    #[test]
    fn test_nearest_turns_short_path() {
        // 10 degrees commanded to 350 goes backwards by 20 degrees
        let t = nearest_turns(10.0 / 360.0, 350.0f64);
        assert!((t * 360.0 - (-10.0)).abs() < TOL);

        // Multi-turn positions are preserved
        let t = nearest_turns(3.0 + 10.0 / 360.0, 350.0f64);
        assert!((t - (3.0 - 10.0 / 360.0)).abs() < TOL);
    }

    #[test]
    fn test_nearest_turns_bounds() {
        let mut current = -4.3f64;
        while current < 4.3 {
            let mut target = -400.0f64;
            while target < 400.0 {
                let t = nearest_turns(current, target);
                assert!((t - current).abs() <= 0.5 + TOL);

                let reached = wrap_deg(t * 360.0);
                let wanted = wrap_deg(target);
                let err = shortest_signed_difference(reached, wanted).abs();
                assert!(err < 1e-6, "{} -> {}: {} vs {}", current, target, reached, wanted);
                target += 17.9;
            }
            current += 0.137;
        }
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(5.0f64, 10.0, 20.0), 10.0);
        assert_eq!(clamp(25.0f64, 10.0, 20.0), 20.0);
        assert_eq!(clamp(15.0f64, 10.0, 20.0), 15.0);
    }
}
