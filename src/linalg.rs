//! Dense factorizations on top of ndarray used when projecting a PLDA model.

use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};

const JACOBI_MAX_SWEEPS: usize = 100;

fn ensure_square(a: ArrayView2<f64>, what: &str) -> Result<usize> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(Error::DimensionMismatch(format!(
            "{what} needs a square matrix, got {rows}x{cols}"
        )));
    }
    Ok(rows)
}

/// General inverse by Gauss-Jordan elimination with partial pivoting.
pub fn invert(a: ArrayView2<f64>) -> Result<Array2<f64>> {
    let n = ensure_square(a, "invert")?;
    let mut work = a.to_owned();
    let mut inv = Array2::<f64>::eye(n);
    let scale = a.iter().fold(0.0f64, |m, v| m.max(v.abs())).max(1.0);

    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| work[[i, col]].abs().total_cmp(&work[[j, col]].abs()))
            .unwrap_or(col);
        if work[[pivot, col]].abs() <= f64::EPSILON * scale {
            return Err(Error::Linalg("matrix is singular".into()));
        }
        if pivot != col {
            for k in 0..n {
                work.swap([pivot, k], [col, k]);
                inv.swap([pivot, k], [col, k]);
            }
        }

        let p = work[[col, col]];
        for k in 0..n {
            work[[col, k]] /= p;
            inv[[col, k]] /= p;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = work[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for k in 0..n {
                work[[row, k]] -= factor * work[[col, k]];
                inv[[row, k]] -= factor * inv[[col, k]];
            }
        }
    }
    Ok(inv)
}

/// Lower-triangular `L` with `a = L Lᵀ`.
pub fn cholesky(a: ArrayView2<f64>) -> Result<Array2<f64>> {
    let n = ensure_square(a, "cholesky")?;
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 {
                    return Err(Error::Linalg(
                        "matrix is not positive definite".into(),
                    ));
                }
                l[[i, i]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Ok(l)
}

/// Inverse of a lower-triangular matrix by forward substitution.
pub fn invert_lower_triangular(l: ArrayView2<f64>) -> Result<Array2<f64>> {
    let n = ensure_square(l, "triangular inverse")?;
    let mut inv = Array2::<f64>::zeros((n, n));
    for col in 0..n {
        for row in col..n {
            let diag = l[[row, row]];
            if diag == 0.0 {
                return Err(Error::Linalg("triangular matrix is singular".into()));
            }
            let mut sum = if row == col { 1.0 } else { 0.0 };
            for k in col..row {
                sum -= l[[row, k]] * inv[[k, col]];
            }
            inv[[row, col]] = sum / diag;
        }
    }
    Ok(inv)
}

/// Symmetric eigendecomposition `a = U diag(s) Uᵀ` by cyclic Jacobi
/// rotations. Eigenvectors are the columns of `U`, in no particular order.
pub fn symmetric_eigen(a: ArrayView2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    let n = ensure_square(a, "eigendecomposition")?;
    // Symmetrize so rounding noise in the input does not bias the rotations.
    let mut work = (&a + &a.t()) * 0.5;
    let mut u = Array2::<f64>::eye(n);
    let total: f64 = work.iter().map(|v| v * v).sum();

    for _ in 0..JACOBI_MAX_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|p| (0..n).filter(move |&q| q != p).map(move |q| (p, q)))
            .map(|(p, q)| work[[p, q]] * work[[p, q]])
            .sum();
        if off <= f64::EPSILON * f64::EPSILON * total.max(f64::MIN_POSITIVE) {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = work[[p, q]];
                if apq == 0.0 {
                    continue;
                }
                let theta = (work[[q, q]] - work[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let t = if theta == 0.0 { 1.0 } else { t };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = work[[k, p]];
                    let akq = work[[k, q]];
                    work[[k, p]] = c * akp - s * akq;
                    work[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = work[[p, k]];
                    let aqk = work[[q, k]];
                    work[[p, k]] = c * apk - s * aqk;
                    work[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let ukp = u[[k, p]];
                    let ukq = u[[k, q]];
                    u[[k, p]] = c * ukp - s * ukq;
                    u[[k, q]] = s * ukp + c * ukq;
                }
            }
        }
    }

    let eigenvalues = work.diag().to_owned();
    if eigenvalues.iter().any(|v| !v.is_finite()) {
        return Err(Error::Linalg("eigendecomposition did not converge".into()));
    }
    Ok((eigenvalues, u))
}

/// Orders eigenvalues from greatest to smallest, permuting the eigenvector
/// columns along with them.
pub fn sort_eigen_descending(
    values: &Array1<f64>,
    vectors: &Array2<f64>,
) -> (Array1<f64>, Array2<f64>) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| values[j].total_cmp(&values[i]));
    let sorted_values = order.iter().map(|&i| values[i]).collect();
    let sorted_vectors = vectors.select(Axis(1), &order);
    (sorted_values, sorted_vectors)
}
