//! Kernel weighting of observations by temporal distance.

use ndarray::Array1;

/// Weighting kernel over day offsets. Selected once at configuration time;
/// the engine calls `values` for every query date.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
    /// `exp(-(t - c)^2 / (2 * bandwidth))`. Strictly positive everywhere, so
    /// every observation keeps some influence; the engine's weight threshold
    /// is what bounds the effective window.
    Gaussian { bandwidth: f64 },
    /// Uniform window: 1 inside `|t - c| <= bandwidth / 2` (boundary
    /// inclusive), 0 outside.
    Box { bandwidth: f64 },
}

impl Kernel {
    /// Computes the kernel weight between `center` and every entry of
    /// `offsets`, both expressed in days.
    pub fn values(&self, center: f64, offsets: &Array1<f64>) -> Array1<f64> {
        match *self {
            Kernel::Gaussian { bandwidth } => {
                offsets.mapv(|t| (-(t - center).powi(2) / (2.0 * bandwidth)).exp())
            }
            Kernel::Box { bandwidth } => offsets.mapv(|t| {
                if (t - center).abs() <= bandwidth / 2.0 {
                    1.0
                } else {
                    0.0
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn gaussian_is_positive_and_peaks_at_center() {
        let kernel = Kernel::Gaussian { bandwidth: 10.0 };
        let offsets = array![-30.0, -5.0, 0.0, 1.0, 12.5, 100.0];
        let weights = kernel.values(0.0, &offsets);
        for &w in weights.iter() {
            assert!(w > 0.0 && w <= 1.0);
        }
        assert_abs_diff_eq!(weights[2], 1.0, epsilon = 1e-15);
        // Symmetric and decaying with distance.
        assert!(weights[1] > weights[4]);
        assert_abs_diff_eq!(
            kernel.values(0.0, &array![3.0])[0],
            kernel.values(0.0, &array![-3.0])[0],
            epsilon = 1e-15
        );
    }

    #[test]
    fn box_support_boundary_is_inclusive() {
        let kernel = Kernel::Box { bandwidth: 4.0 };
        let offsets = array![-2.1, -2.0, -1.0, 0.0, 1.99, 2.0, 2.0001];
        let weights = kernel.values(0.0, &offsets);
        assert_eq!(weights.to_vec(), vec![0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn offsets_are_relative_to_center() {
        let kernel = Kernel::Box { bandwidth: 2.0 };
        let weights = kernel.values(5.0, &array![4.0, 5.0, 6.5]);
        assert_eq!(weights.to_vec(), vec![1.0, 1.0, 0.0]);
    }
}
