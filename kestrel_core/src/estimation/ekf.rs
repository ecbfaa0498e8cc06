// kestrel_core/src/estimation/ekf.rs

use crate::error::NumericalIssue;
use crate::types::{Matrix, Vector};
use nalgebra::{Matrix3, Vector3};

/// The result of one EKF correction: the error-state update and the posterior covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub delta: Vector,
    pub covariance: Matrix,
}

/// PURE FUNCTION: Performs one EKF measurement correction in error-state form.
///
/// `covariance` is the joint prior covariance `P`, `h` the measurement Jacobian
/// with respect to the same error state, `residual` the innovation `r` and `r_noise`
/// the measurement noise `R`. The covariance update uses the Joseph form and the
/// result is symmetrized and checked before it is returned.
pub fn correct(
    covariance: &Matrix,
    h: &Matrix,
    residual: &Vector,
    r_noise: &Matrix,
) -> Result<Correction, NumericalIssue> {
    let n = covariance.nrows();
    let m = residual.nrows();
    if covariance.ncols() != n || h.nrows() != m || h.ncols() != n {
        return Err(NumericalIssue::DimensionMismatch(format!(
            "P is {}x{}, H is {}x{}, r has {} rows",
            covariance.nrows(),
            covariance.ncols(),
            h.nrows(),
            h.ncols(),
            m
        )));
    }
    if r_noise.nrows() != m || r_noise.ncols() != m {
        return Err(NumericalIssue::DimensionMismatch(format!(
            "R is {}x{}, expected {m}x{m}",
            r_noise.nrows(),
            r_noise.ncols()
        )));
    }
    if !residual.iter().all(|v| v.is_finite()) {
        return Err(NumericalIssue::NonFiniteResidual);
    }

    let ht = h.transpose();
    let s = symmetrize(&(h * covariance * &ht + r_noise));
    let s_inv = s.try_inverse().ok_or(NumericalIssue::SingularInnovation)?;
    let k_gain = covariance * &ht * s_inv;

    let delta = &k_gain * residual;
    if !delta.iter().all(|v| v.is_finite()) {
        return Err(NumericalIssue::NonFiniteResidual);
    }

    // Joseph form: (I - KH) P (I - KH)^T + K R K^T
    let i_kh = Matrix::identity(n, n) - &k_gain * h;
    let posterior = &i_kh * covariance * i_kh.transpose() + &k_gain * r_noise * k_gain.transpose();
    let posterior = symmetrize(&posterior);

    if !is_valid_covariance(&posterior) {
        return Err(NumericalIssue::InvalidCovariance);
    }

    Ok(Correction {
        delta,
        covariance: posterior,
    })
}

/// Returns `(m + mᵀ) / 2`.
pub fn symmetrize(m: &Matrix) -> Matrix {
    (m + m.transpose()) * 0.5
}

/// Relative slack on symmetry and on the smallest eigenvalue, scaled by the largest variance.
const COVARIANCE_TOLERANCE: f64 = 1e-9;

/// Square, finite, symmetric and positive semi-definite up to rounding.
pub fn is_valid_covariance(m: &Matrix) -> bool {
    if !m.is_square() || !m.iter().all(|v| v.is_finite()) {
        return false;
    }
    if m.is_empty() {
        return true;
    }
    let tolerance = COVARIANCE_TOLERANCE * m.diagonal().amax().max(1.0);
    if (m - m.transpose()).amax() > tolerance {
        return false;
    }
    symmetrize(m).symmetric_eigen().eigenvalues.min() >= -tolerance
}

/// The cross-product matrix `[v]x`, so that `skew(a) * b == a.cross(&b)`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};

    #[test]
    fn scalar_correction_matches_closed_form() {
        // P = 4, R = 1, H = 1: K = 0.8, P+ = 0.8
        let p = DMatrix::from_element(1, 1, 4.0);
        let h = DMatrix::from_element(1, 1, 1.0);
        let r = DMatrix::from_element(1, 1, 1.0);
        let residual = DVector::from_element(1, 2.0);

        let c = correct(&p, &h, &residual, &r).expect("valid correction");
        assert_relative_eq!(c.delta[0], 1.6, epsilon = 1e-12);
        assert_relative_eq!(c.covariance[(0, 0)], 0.8, epsilon = 1e-12);
    }

    #[test]
    fn unobserved_states_keep_their_variance() {
        let p = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 2.0]));
        let h = DMatrix::from_row_slice(1, 2, &[1.0, 0.0]);
        let r = DMatrix::from_element(1, 1, 1.0);
        let residual = DVector::from_element(1, 1.0);

        let c = correct(&p, &h, &residual, &r).expect("valid correction");
        assert_relative_eq!(c.delta[1], 0.0);
        assert_relative_eq!(c.covariance[(1, 1)], 2.0, epsilon = 1e-12);
        assert_relative_eq!(c.covariance[(0, 0)], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn rejects_non_finite_residual() {
        let p = DMatrix::identity(2, 2);
        let h = DMatrix::identity(2, 2);
        let r = DMatrix::identity(2, 2);
        let residual = DVector::from_vec(vec![f64::NAN, 0.0]);
        assert_eq!(
            correct(&p, &h, &residual, &r),
            Err(NumericalIssue::NonFiniteResidual)
        );
    }

    #[test]
    fn rejects_singular_innovation() {
        let p = DMatrix::zeros(2, 2);
        let h = DMatrix::identity(2, 2);
        let r = DMatrix::zeros(2, 2);
        let residual = DVector::from_vec(vec![1.0, 0.0]);
        assert_eq!(
            correct(&p, &h, &residual, &r),
            Err(NumericalIssue::SingularInnovation)
        );
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let p = DMatrix::identity(3, 3);
        let h = DMatrix::identity(2, 2);
        let r = DMatrix::identity(2, 2);
        let residual = DVector::zeros(2);
        assert!(matches!(
            correct(&p, &h, &residual, &r),
            Err(NumericalIssue::DimensionMismatch(_))
        ));
    }

    #[test]
    fn covariance_validity() {
        assert!(is_valid_covariance(&DMatrix::identity(3, 3)));
        let mut bad = DMatrix::identity(3, 3);
        bad[(1, 1)] = -1e-3;
        assert!(!is_valid_covariance(&bad));
        bad[(1, 1)] = f64::INFINITY;
        assert!(!is_valid_covariance(&bad));
        assert!(is_valid_covariance(&DMatrix::zeros(0, 0)));
    }

    #[test]
    fn indefinite_matrix_with_positive_diagonal_is_rejected() {
        // Eigenvalues 3 and -1.
        let indefinite = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(!is_valid_covariance(&indefinite));

        let correlated = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0]);
        assert!(is_valid_covariance(&correlated));
        let singular = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert!(is_valid_covariance(&singular));

        let asymmetric = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        assert!(!is_valid_covariance(&asymmetric));
    }

    #[test]
    fn skew_is_the_cross_product() {
        let a = Vector3::new(1.0, -2.0, 0.5);
        let b = Vector3::new(0.3, 4.0, -1.0);
        assert_relative_eq!(skew(&a) * b, a.cross(&b), epsilon = 1e-12);
    }
}
