//! Statistical kernels used by the distribution monitor.
//!
//! Binomial, Poisson and chi-squared distributions with the inverse-CDF
//! operations the monitor needs on its slow paths. Everything is evaluated
//! with hand-rolled special functions (Lanczos log-gamma, regularized
//! incomplete gamma, a rational normal quantile, Brent root-finding); the
//! precision is good to many more digits than the thresholds require, but
//! callers treat the chi-squared inverse as approximate and apply their own
//! safety margins.
//!
//! All kernels are total for finite inputs. A NaN or non-positive
//! distribution parameter is a programmer error and panics in debug builds.

use std::fmt;

const LN_GAMMA_COEFFS: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
];
const LN_GAMMA_G: f64 = 7.0;

/// Lanczos approximation of `ln(Gamma(x))` for `x > 0` (g = 7, n = 9).
pub(crate) fn ln_gamma(x: f64) -> f64 {
    debug_assert!(x.is_finite());
    if x <= 0.0 {
        return f64::INFINITY;
    }
    if x < 0.5 {
        // Reflection formula keeps the Lanczos sum in its accurate range.
        let sin_val = (std::f64::consts::PI * x).sin();
        return std::f64::consts::PI.ln() - sin_val.abs().ln() - ln_gamma(1.0 - x);
    }
    let z = x - 1.0;
    let mut sum = LN_GAMMA_COEFFS[0];
    for (i, &c) in LN_GAMMA_COEFFS[1..].iter().enumerate() {
        sum += c / (z + i as f64 + 1.0);
    }
    let t = z + LN_GAMMA_G + 0.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (z + 0.5) * t.ln() - t + sum.ln()
}

const GAMMA_EPS: f64 = 1e-15;
const GAMMA_MAX_ITERS: usize = 10_000;
const GAMMA_FPMIN: f64 = 1e-300;

/// Regularized lower incomplete gamma `P(a, x)`.
pub(crate) fn regularized_gamma_p(a: f64, x: f64) -> f64 {
    debug_assert!(a > 0.0 && x >= 0.0);
    if x == 0.0 {
        return 0.0;
    }
    if x < a + 1.0 {
        gamma_p_series(a, x)
    } else {
        1.0 - gamma_q_continued_fraction(a, x)
    }
}

/// Regularized upper incomplete gamma `Q(a, x) = 1 - P(a, x)`.
pub(crate) fn regularized_gamma_q(a: f64, x: f64) -> f64 {
    debug_assert!(a > 0.0 && x >= 0.0);
    if x == 0.0 {
        return 1.0;
    }
    if x < a + 1.0 {
        1.0 - gamma_p_series(a, x)
    } else {
        gamma_q_continued_fraction(a, x)
    }
}

fn gamma_p_series(a: f64, x: f64) -> f64 {
    let mut term = 1.0 / a;
    let mut sum = term;
    let mut n = a;
    for _ in 0..GAMMA_MAX_ITERS {
        n += 1.0;
        term *= x / n;
        sum += term;
        if term.abs() < sum.abs() * GAMMA_EPS {
            break;
        }
    }
    sum * (-x + a * x.ln() - ln_gamma(a)).exp()
}

// Modified Lentz evaluation of the continued fraction for Q(a, x).
fn gamma_q_continued_fraction(a: f64, x: f64) -> f64 {
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / GAMMA_FPMIN;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..=GAMMA_MAX_ITERS {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < GAMMA_FPMIN {
            d = GAMMA_FPMIN;
        }
        c = b + an / c;
        if c.abs() < GAMMA_FPMIN {
            c = GAMMA_FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < GAMMA_EPS {
            break;
        }
    }
    (-x + a * x.ln() - ln_gamma(a)).exp() * h
}

/// Quantile of the standard normal distribution (Acklam's rational
/// approximation, relative error below 1.15e-9 over the open unit interval).
pub(crate) fn normal_quantile(p: f64) -> f64 {
    debug_assert!(p > 0.0 && p < 1.0);
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_690e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.02425;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// Brent's method on `f` over `[a, b]`; requires `f(a)` and `f(b)` to have
/// opposite signs.
fn brent_root(f: impl Fn(f64) -> f64, mut a: f64, mut b: f64, tol: f64) -> f64 {
    const MAX_ITERS: usize = 200;
    let mut fa = f(a);
    let mut fb = f(b);
    debug_assert!(fa * fb <= 0.0, "root not bracketed: f({a}) = {fa}, f({b}) = {fb}");
    let mut c = a;
    let mut fc = fa;
    let mut d = b - a;
    let mut e = d;
    for _ in 0..MAX_ITERS {
        if fb.abs() > fc.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }
        let tol1 = 2.0 * f64::EPSILON * b.abs() + 0.5 * tol;
        let xm = 0.5 * (c - b);
        if xm.abs() <= tol1 || fb == 0.0 {
            return b;
        }
        if e.abs() >= tol1 && fa.abs() > fb.abs() {
            // Inverse quadratic interpolation, falling back to secant.
            let s = fb / fa;
            let (mut p, mut q) = if a == c {
                (2.0 * xm * s, 1.0 - s)
            } else {
                let q = fa / fc;
                let r = fb / fc;
                (
                    s * (2.0 * xm * q * (q - r) - (b - a) * (r - 1.0)),
                    (q - 1.0) * (r - 1.0) * (s - 1.0),
                )
            };
            if p > 0.0 {
                q = -q;
            }
            p = p.abs();
            let min1 = 3.0 * xm * q - (tol1 * q).abs();
            let min2 = (e * q).abs();
            if 2.0 * p < min1.min(min2) {
                e = d;
                d = p / q;
            } else {
                d = xm;
                e = d;
            }
        } else {
            d = xm;
            e = d;
        }
        a = b;
        fa = fb;
        if d.abs() > tol1 {
            b += d;
        } else {
            b += tol1.copysign(xm);
        }
        fb = f(b);
        if (fb > 0.0) == (fc > 0.0) {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
    }
    b
}

/// Binomial distribution over `n` trials with success probability `p`.
#[derive(Clone, Copy)]
pub struct Binomial {
    n: u32,
    p: f64,
}

impl Binomial {
    pub fn new(n: u32, p: f64) -> Self {
        debug_assert!(n > 0 && p > 0.0 && p < 1.0);
        Self { n, p }
    }

    fn ln_pmf(&self, k: u32) -> f64 {
        let n = self.n as f64;
        let k = k as f64;
        ln_gamma(n + 1.0) - ln_gamma(k + 1.0) - ln_gamma(n - k + 1.0)
            + k * self.p.ln()
            + (n - k) * (1.0 - self.p).ln()
    }

    /// `P[X <= k]`. Negative `k` is allowed and yields 0.
    pub fn cdf(&self, k: i64) -> f64 {
        if k < 0 {
            return 0.0;
        }
        if k >= self.n as i64 {
            return 1.0;
        }
        let mut sum = 0.0;
        for i in 0..=k as u32 {
            sum += self.ln_pmf(i).exp();
        }
        sum.min(1.0)
    }

    /// `P[X > k]`.
    pub fn ccdf(&self, k: i64) -> f64 {
        // Summing the tail directly keeps precision when the CDF is close
        // to one, which is exactly where the reporting thresholds live.
        if k < 0 {
            return 1.0;
        }
        if k >= self.n as i64 {
            return 0.0;
        }
        let mut sum = 0.0;
        for i in (k as u32 + 1)..=self.n {
            sum += self.ln_pmf(i).exp();
        }
        sum.min(1.0)
    }

    /// Smallest `k` such that `CDF(k) >= q`.
    pub fn inverse_cdf(&self, q: f64) -> u32 {
        debug_assert!(q > 0.0 && q <= 1.0);
        let mut cdf = 0.0;
        for k in 0..self.n {
            cdf += self.ln_pmf(k).exp();
            if cdf >= q {
                return k;
            }
        }
        self.n
    }
}

impl fmt::Display for Binomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Binomial(n = {}, p = {})", self.n, self.p)
    }
}

/// Poisson distribution with the given mean.
#[derive(Clone, Copy)]
pub struct Poisson {
    mean: f64,
}

impl Poisson {
    pub fn new(mean: f64) -> Self {
        debug_assert!(mean.is_finite() && mean > 0.0);
        Self { mean }
    }

    /// `P[X <= k]`, evaluated as the regularized upper incomplete gamma
    /// `Q(k + 1, mean)`. Negative `k` is allowed and yields 0.
    pub fn cdf(&self, k: i64) -> f64 {
        if k < 0 {
            return 0.0;
        }
        regularized_gamma_q(k as f64 + 1.0, self.mean)
    }

    /// Smallest `k` such that `CDF(k) >= q`.
    ///
    /// When `q` is a reporting threshold this value is the "max non-reported"
    /// count: the threshold probability falls on the bar of the returned
    /// histogram value, so the value itself is still unremarkable and only
    /// counts strictly above it are reportable.
    pub fn inverse_cdf(&self, q: f64) -> u64 {
        debug_assert!(q > 0.0 && q <= 1.0);
        if self.cdf(0) >= q {
            return 0;
        }
        // Bracket above the target, then binary-search the monotone CDF.
        let mut hi = (self.mean + 10.0 * self.mean.sqrt() + 10.0).ceil() as u64;
        while self.cdf(hi as i64) < q {
            hi *= 2;
        }
        let mut lo = 0u64; // invariant: cdf(lo) < q <= cdf(hi)
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.cdf(mid as i64) >= q {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        hi
    }
}

impl fmt::Display for Poisson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Poisson(mean = {})", self.mean)
    }
}

/// Chi-squared distribution with `df` degrees of freedom.
#[derive(Clone, Copy)]
pub struct ChiSquared {
    df: f64,
}

impl ChiSquared {
    pub fn new(df: f64) -> Self {
        debug_assert!(df.is_finite() && df > 0.0);
        Self { df }
    }

    pub fn cdf(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return 0.0;
        }
        regularized_gamma_p(self.df / 2.0, x / 2.0)
    }

    /// Smallest `x` with `CDF(x) >= q`, found by Brent's method seeded with
    /// the Wilson-Hilferty cube approximation.
    pub fn inverse_cdf(&self, q: f64) -> f64 {
        debug_assert!(q > 0.0 && q < 1.0);
        let df = self.df;
        let z = normal_quantile(q);
        let a = 2.0 / (9.0 * df);
        let wilson_hilferty = df * (1.0 - a + z * a.sqrt()).powi(3);
        let mut hi = wilson_hilferty.max(df) * 2.0 + 10.0;
        while self.cdf(hi) < q {
            hi *= 2.0;
        }
        brent_root(|x| self.cdf(x) - q, 0.0, hi, 1e-10)
    }
}

impl fmt::Display for ChiSquared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChiSquared(df = {})", self.df)
    }
}

/// The mean `lambda` for which `CDF[Poisson(lambda), k] = cdf`, via the
/// classical identity with the chi-squared quantile:
/// `lambda = ChiSquared(2 * (k + 1)).inverse_cdf(1 - cdf) / 2`.
///
/// The precision of this value is only as good as the chi-squared inverse;
/// callers are expected to pad the result rather than trust its last digits.
pub fn poisson_mean_by_cdf(k: i64, cdf: f64) -> f64 {
    debug_assert!(cdf > 0.0 && cdf < 1.0);
    if k < 0 {
        // CDF(-1) is identically zero, no mean can reach a positive target.
        return 0.0;
    }
    ChiSquared::new(2.0 * (k as f64 + 1.0)).inverse_cdf(1.0 - cdf) / 2.0
}
