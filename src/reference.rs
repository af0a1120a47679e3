// reference.rs — scalar CPU implementations of the math kernels.
//
// These are the ground truth every device result is compared against, and
// the bodies of the host device's kernels. They must stay numerically
// identical to src/shaders/math.wgsl: same operation order, f32 throughout.

/// `out[i] = a[i] * b[i]` over the shortest of the three slices.
pub fn mult(a: &[f32], b: &[f32], out: &mut [f32]) {
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x * y;
    }
}

/// `out[i] = input[i]^n` over the shorter of the two slices.
pub fn pown(input: &[f32], out: &mut [f32], n: i32) {
    for (o, &x) in out.iter_mut().zip(input) {
        *o = pow_int(x, n);
    }
}

/// Integer power by squaring, at most 32 steps for any `n`. Negative
/// exponents give the reciprocal of the positive power; `x^0` is 1 for
/// every `x`.
pub fn pow_int(x: f32, n: i32) -> f32 {
    let mut r = 1.0f32;
    let mut base = x;
    let mut m = n.unsigned_abs();
    while m > 0 {
        if m & 1 == 1 {
            r *= base;
        }
        m >>= 1;
        if m > 0 {
            base *= base;
        }
    }
    if n < 0 {
        1.0 / r
    } else {
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mult_elementwise() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [2.0, 0.5, -1.0, 0.0];
        let mut out = [9.0; 4];
        mult(&a, &b, &mut out);
        assert_eq!(out, [2.0, 1.0, -3.0, 0.0]);
    }

    #[test]
    fn test_pow_int() {
        assert_eq!(pow_int(3.0, 0), 1.0);
        assert_eq!(pow_int(0.0, 0), 1.0);
        assert_eq!(pow_int(2.0, 10), 1024.0);
        assert_eq!(pow_int(-2.0, 3), -8.0);
        assert_eq!(pow_int(2.0, -2), 0.25);
        assert!(pow_int(0.0, -1).is_infinite());
    }

    #[test]
    fn test_pow_int_extreme_exponents() {
        assert_eq!(pow_int(1.0, i32::MIN), 1.0);
        assert_eq!(pow_int(-1.0, i32::MAX), -1.0);
        assert_eq!(pow_int(2.0, i32::MIN), 0.0);
        assert!(pow_int(0.5, i32::MIN).is_infinite());
        assert_eq!(pow_int(1.5, 3), 1.5 * 1.5 * 1.5);
    }

    #[test]
    fn test_pown_respects_shorter_slice() {
        let input = [2.0, 3.0, 4.0];
        let mut out = [0.0; 2];
        pown(&input, &mut out, 2);
        assert_eq!(out, [4.0, 9.0]);
    }
}
