//! Decay curves used to size stage worker pools
//!
//! Every curve maps a requested concurrency `x >= 0` to a value that starts at
//! `amplitude` for `x = 0` and decays monotonically towards `floor`:
//!
//! `f(x) = floor + (amplitude - floor) * d(x)` with `d(0) = 1`, `d(∞) = 0`.
//!
//! The result is always clamped to `[floor, amplitude]`.

/// Shape of the decaying factor `d(x)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecayShape {
    /// `e^(-rate·x)`
    Exponential,
    /// `1 / (1 + ln(1 + rate·x))`
    Logarithmic,
    /// `1 / (1 + (x / saturation)^rate)`
    Power { saturation: f64 },
    /// `1 / (1 + rate·x)`
    Inverse,
    /// `1 - tanh(rate·x)`
    Tanh,
}

/// A pure, clamped decay curve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayFn {
    pub amplitude: f64,
    pub rate: f64,
    pub floor: f64,
    pub shape: DecayShape,
}

impl DecayFn {
    fn with_shape(amplitude: f64, rate: f64, floor: f64, shape: DecayShape) -> Self {
        // keep the clamp range well formed even for odd parameters
        let floor = floor.max(0.0);
        let amplitude = amplitude.max(floor);
        Self {
            amplitude,
            rate: rate.max(0.0),
            floor,
            shape,
        }
    }

    pub fn exponential(amplitude: f64, rate: f64, floor: f64) -> Self {
        Self::with_shape(amplitude, rate, floor, DecayShape::Exponential)
    }

    pub fn logarithmic(amplitude: f64, rate: f64, floor: f64) -> Self {
        Self::with_shape(amplitude, rate, floor, DecayShape::Logarithmic)
    }

    pub fn power(amplitude: f64, exponent: f64, saturation: f64, floor: f64) -> Self {
        let saturation = if saturation > 0.0 { saturation } else { 1.0 };
        Self::with_shape(amplitude, exponent, floor, DecayShape::Power { saturation })
    }

    pub fn inverse(amplitude: f64, rate: f64, floor: f64) -> Self {
        Self::with_shape(amplitude, rate, floor, DecayShape::Inverse)
    }

    pub fn tanh(amplitude: f64, rate: f64, floor: f64) -> Self {
        Self::with_shape(amplitude, rate, floor, DecayShape::Tanh)
    }

    fn factor(&self, x: f64) -> f64 {
        let x = x.max(0.0);
        match self.shape {
            DecayShape::Exponential => (-self.rate * x).exp(),
            DecayShape::Logarithmic => 1.0 / (1.0 + (self.rate * x).ln_1p()),
            DecayShape::Power { saturation } => 1.0 / (1.0 + (x / saturation).powf(self.rate)),
            DecayShape::Inverse => 1.0 / (1.0 + self.rate * x),
            DecayShape::Tanh => 1.0 - (self.rate * x).tanh(),
        }
    }

    /// Evaluate the curve
    pub fn eval(&self, x: f64) -> f64 {
        let y = self.floor + (self.amplitude - self.floor) * self.factor(x);
        if y.is_nan() {
            return self.floor;
        }
        y.clamp(self.floor, self.amplitude)
    }
}

/// Round half up to a non-negative integer
pub fn round_half_up(x: f64) -> usize {
    if x.is_nan() || x <= 0.0 {
        0
    } else {
        (x + 0.5).floor() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn families() -> Vec<(&'static str, DecayFn)> {
        vec![
            ("exp", DecayFn::exponential(500.0, 0.001, 100.0)),
            ("log", DecayFn::logarithmic(500.0, 0.01, 100.0)),
            ("power", DecayFn::power(500.0, 1.1, 32.0, 100.0)),
            ("inv", DecayFn::inverse(500.0, 0.02, 100.0)),
            ("tanh", DecayFn::tanh(500.0, 0.0004, 100.0)),
        ]
    }

    #[test]
    fn test_curves_start_at_amplitude() {
        for (name, f) in families() {
            assert!((f.eval(0.0) - 500.0).abs() < 1e-9, "{}", name);
        }
    }

    #[test]
    fn test_curves_stay_within_bounds() {
        for (name, f) in families() {
            for x in (0..=100_000).step_by(97) {
                let y = f.eval(x as f64);
                assert!((100.0..=500.0).contains(&y), "{} at {} gave {}", name, x, y);
            }
            assert_eq!(f.eval(f64::INFINITY), 100.0, "{}", name);
            assert_eq!(f.eval(-5.0), f.eval(0.0), "{}", name);
        }
    }

    #[test]
    fn test_curves_are_monotone_decreasing() {
        for (name, f) in families() {
            let mut prev = f.eval(0.0);
            for x in (10..=20_000).step_by(10) {
                let y = f.eval(x as f64);
                assert!(y <= prev + 1e-9, "{} increased at {}", name, x);
                prev = y;
            }
        }
    }

    #[test]
    fn test_inverted_parameters_are_normalized() {
        let f = DecayFn::exponential(10.0, 0.1, 50.0);
        assert_eq!(f.amplitude, 50.0);
        assert_eq!(f.eval(3.0), 50.0);
    }

    #[test]
    fn test_round_half_up() {
        assert_eq!(round_half_up(2.5), 3);
        assert_eq!(round_half_up(2.4999), 2);
        assert_eq!(round_half_up(0.5), 1);
        assert_eq!(round_half_up(-3.0), 0);
        assert_eq!(round_half_up(f64::NAN), 0);
    }
}
