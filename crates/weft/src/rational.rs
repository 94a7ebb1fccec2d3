use std::fmt;

use num_rational::Ratio;

/// Rational number of seconds (or a frequency in 1/s) used for all
/// simulation time keeping. Clock periods divide exactly, so ticks of
/// derived clocks never drift against their parents.
pub type ClockRational = Ratio<u64>;

pub fn rational(num: u64, denom: u64) -> ClockRational {
    Ratio::new(num, denom)
}

#[allow(dead_code)]
pub fn floor(v: ClockRational) -> u64 {
    v.numer() / v.denom()
}

#[allow(dead_code)]
pub fn ceil(v: ClockRational) -> u64 {
    (v.numer() + v.denom() - 1) / v.denom()
}

pub fn to_double(v: ClockRational) -> f64 {
    *v.numer() as f64 / *v.denom() as f64
}

#[allow(dead_code)]
pub fn to_nanoseconds(v: ClockRational) -> f64 {
    *v.numer() as f64 * 1e9 / *v.denom() as f64
}

/// Formats a time in the largest unit that yields a mantissa >= 1.
pub fn format_time(f: &mut fmt::Formatter<'_>, time: ClockRational) -> fmt::Result {
    if *time.numer() == 0 {
        return write!(f, "0 s");
    }
    let seconds = to_double(time);
    for (scale, unit) in [
        (1.0, "s"),
        (1e-3, "ms"),
        (1e-6, "us"),
        (1e-9, "ns"),
        (1e-12, "ps"),
    ] {
        if seconds >= scale {
            return write!(f, "{} {}", seconds / scale, unit);
        }
    }
    write!(f, "{} fs", seconds / 1e-15)
}

/// Display adapter for [`format_time`].
pub struct DisplayTime(pub ClockRational);

impl fmt::Display for DisplayTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_time(f, self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_and_ceil() {
        assert_eq!(floor(rational(7, 2)), 3);
        assert_eq!(ceil(rational(7, 2)), 4);
        assert_eq!(floor(rational(4, 2)), 2);
        assert_eq!(ceil(rational(4, 2)), 2);
    }

    #[test]
    fn time_formatting() {
        assert_eq!(format!("{}", DisplayTime(rational(1, 100_000_000))), "10 ns");
        assert_eq!(format!("{}", DisplayTime(rational(0, 1))), "0 s");
        assert_eq!(format!("{}", DisplayTime(rational(3, 2))), "1.5 s");
    }

    #[test]
    fn periods_divide_exactly() {
        let f = rational(100_000_000, 1);
        let half_period = rational(1, 2) / f;
        assert_eq!(half_period + half_period, rational(1, 1) / f);
    }
}
