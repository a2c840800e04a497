//! Small dense kernels for projected problems. Every rank runs them on the
//! same reduced data, so results agree bit for bit.

/// Row-major square matrix.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Dense {
    n: usize,
    data: Vec<f64>,
}

impl Dense {
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    pub fn set(&mut self, i: usize, j: usize, v: f64) {
        self.data[i * self.n + j] = v;
    }

    /// `(self + selfᵀ) / 2`.
    pub fn symmetrize(&mut self) {
        for i in 0..self.n {
            for j in i + 1..self.n {
                let m = 0.5 * (self.get(i, j) + self.get(j, i));
                self.set(i, j, m);
                self.set(j, i, m);
            }
        }
    }

    fn off_norm(&self) -> f64 {
        let mut s = 0.0;
        for i in 0..self.n {
            for j in 0..self.n {
                if i != j {
                    s += self.get(i, j) * self.get(i, j);
                }
            }
        }
        s.sqrt()
    }
}

/// Cyclic Jacobi eigensolver for a symmetric matrix.
///
/// Returns the eigenvalues and the eigenvectors as columns of a row-major
/// matrix (`vectors.get(i, k)` is component `i` of eigenvector `k`), in the
/// order the rotations leave them.
pub(crate) fn symmetric_eigen(a: &Dense) -> (Vec<f64>, Dense) {
    const MAX_SWEEPS: usize = 100;
    let n = a.n();
    let mut m = a.clone();
    let mut v = Dense::zeros(n);
    for i in 0..n {
        v.set(i, i, 1.0);
    }
    let scale = m.data.iter().fold(0.0f64, |acc, x| acc.max(x.abs()));
    for _ in 0..MAX_SWEEPS {
        if m.off_norm() <= f64::EPSILON * scale * n as f64 {
            break;
        }
        for p in 0..n {
            for q in p + 1..n {
                let apq = m.get(p, q);
                if apq == 0.0 {
                    continue;
                }
                let theta = (m.get(q, q) - m.get(p, p)) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let mkp = m.get(k, p);
                    let mkq = m.get(k, q);
                    m.set(k, p, c * mkp - s * mkq);
                    m.set(k, q, s * mkp + c * mkq);
                }
                for k in 0..n {
                    let mpk = m.get(p, k);
                    let mqk = m.get(q, k);
                    m.set(p, k, c * mpk - s * mqk);
                    m.set(q, k, s * mpk + c * mqk);
                }
                for k in 0..n {
                    let vkp = v.get(k, p);
                    let vkq = v.get(k, q);
                    v.set(k, p, c * vkp - s * vkq);
                    v.set(k, q, s * vkp + c * vkq);
                }
            }
        }
    }
    ((0..n).map(|i| m.get(i, i)).collect(), v)
}

/// Back substitution with the leading `k × k` upper triangle of the
/// column-major Hessenberg storage `h[j][i]` (column `j`, row `i`).
pub(crate) fn solve_upper(h: &[Vec<f64>], g: &[f64], k: usize) -> Vec<f64> {
    let mut y = vec![0.0; k];
    for i in (0..k).rev() {
        let mut s = g[i];
        for j in i + 1..k {
            s -= h[j][i] * y[j];
        }
        y[i] = if h[i][i] != 0.0 { s / h[i][i] } else { 0.0 };
    }
    y
}

/// Givens rotation `(c, s)` zeroing `b` in `(a, b)`.
pub(crate) fn givens(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        (1.0, 0.0)
    } else {
        let r = a.hypot(b);
        (a / r, b / r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn eigen_of_tridiagonal() {
        let n = 4;
        let mut a = Dense::zeros(n);
        for i in 0..n {
            a.set(i, i, 2.0);
            if i + 1 < n {
                a.set(i, i + 1, -1.0);
                a.set(i + 1, i, -1.0);
            }
        }
        let (mut vals, vecs) = symmetric_eigen(&a);
        // A v = λ v for every returned pair
        for k in 0..n {
            for i in 0..n {
                let av: f64 = (0..n).map(|j| a.get(i, j) * vecs.get(j, k)).sum();
                assert_relative_eq!(av, vals[k] * vecs.get(i, k), epsilon = 1e-12);
            }
        }
        vals.sort_by(f64::total_cmp);
        for (k, v) in vals.iter().enumerate() {
            let exact = 2.0 - 2.0 * ((k + 1) as f64 * std::f64::consts::PI / 5.0).cos();
            assert_relative_eq!(*v, exact, epsilon = 1e-12);
        }
    }

    #[test]
    fn upper_solve_and_rotation() {
        // columns: [2, 0], [1, 4]
        let h = vec![vec![2.0, 0.0], vec![1.0, 4.0]];
        assert_eq!(solve_upper(&h, &[4.0, 8.0], 2), vec![1.0, 2.0]);
        let (c, s) = givens(3.0, 4.0);
        assert_relative_eq!(c, 0.6);
        assert_relative_eq!(s, 0.8);
    }
}
