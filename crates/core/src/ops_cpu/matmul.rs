/// Column-major GEMM: `C = alpha * op(A) * op(B) + beta * C`.
///
/// `op(A)` is `m x k` and `op(B)` is `k x n`. When `trans_a` is set, `a` holds
/// the `k x m` matrix that gets transposed; likewise for `trans_b`. With
/// `beta == 0.0` the previous contents of `c` are ignored entirely.
#[allow(clippy::too_many_arguments)]
pub fn gemm(
    a: &[f32], trans_a: bool,
    b: &[f32], trans_b: bool,
    c: &mut [f32],
    m: usize, n: usize, k: usize,
    alpha: f32, beta: f32,
) {
    debug_assert!(a.len() >= m * k);
    debug_assert!(b.len() >= k * n);
    debug_assert!(c.len() >= m * n);

    for j in 0..n {
        for i in 0..m {
            let mut sum = 0.0f32;
            for p in 0..k {
                let a_ip = if trans_a { a[p + i * k] } else { a[i + p * m] };
                let b_pj = if trans_b { b[j + p * n] } else { b[p + j * k] };
                sum += a_ip * b_pj;
            }
            let idx = i + j * m;
            c[idx] = if beta == 0.0 {
                alpha * sum
            } else {
                alpha * sum + beta * c[idx]
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A = [1 3 5; 2 4 6] (2x3), stored column-major
    const A: [f32; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

    #[test]
    fn plain_product() {
        // B = [1 0; 0 1; 1 1] (3x2)
        let b = [1.0, 0.0, 1.0, 0.0, 1.0, 1.0];
        let mut c = [0.0; 4];
        gemm(&A, false, &b, false, &mut c, 2, 2, 3, 1.0, 0.0);
        assert_eq!(c, [6.0, 8.0, 8.0, 10.0]);
    }

    #[test]
    fn transposed_operands() {
        // A^T * A is 3x3
        let mut c = [0.0; 9];
        gemm(&A, true, &A, false, &mut c, 3, 3, 2, 1.0, 0.0);
        assert_eq!(c, [5.0, 11.0, 17.0, 11.0, 25.0, 39.0, 17.0, 39.0, 61.0]);

        // A * A^T is 2x2
        let mut c = [0.0; 4];
        gemm(&A, false, &A, true, &mut c, 2, 2, 3, 1.0, 0.0);
        assert_eq!(c, [35.0, 44.0, 44.0, 56.0]);
    }

    #[test]
    fn beta_accumulates_and_zero_beta_ignores_garbage() {
        let b = [1.0, 1.0, 1.0];
        let mut c = [10.0, 20.0];
        gemm(&A, false, &b, false, &mut c, 2, 1, 3, 1.0, 1.0);
        assert_eq!(c, [19.0, 32.0]);

        let mut c = [f32::NAN, f32::NAN];
        gemm(&A, false, &b, false, &mut c, 2, 1, 3, 2.0, 0.0);
        assert_eq!(c, [18.0, 24.0]);
    }
}
