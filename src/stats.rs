//! Missing-aware column statistics.
//!
//! All functions take `Option<f64>` slices straight from
//! [`Table::numeric_column`](crate::table::Table::numeric_column) and skip `None`.

fn present(v: &[Option<f64>]) -> Vec<f64> {
    v.iter().flatten().copied().filter(|x| x.is_finite()).collect()
}

pub fn count_present(v: &[Option<f64>]) -> usize {
    v.iter().flatten().filter(|x| x.is_finite()).count()
}

pub fn count_missing(v: &[Option<f64>]) -> usize {
    v.len() - count_present(v)
}

pub fn sum(v: &[Option<f64>]) -> f64 {
    present(v).iter().sum()
}

pub fn mean(v: &[Option<f64>]) -> Option<f64> {
    let xs = present(v);
    if xs.is_empty() {
        return None;
    }
    Some(xs.iter().sum::<f64>() / xs.len() as f64)
}

pub fn median(v: &[Option<f64>]) -> Option<f64> {
    let mut xs = present(v);
    let n = xs.len();
    if n == 0 {
        return None;
    }
    xs.sort_by(|a, b| a.total_cmp(b));
    if n % 2 == 1 {
        Some(xs[n / 2])
    } else {
        Some((xs[n / 2 - 1] + xs[n / 2]) / 2.0)
    }
}

/// Sample standard deviation (n - 1); needs two present values.
pub fn sample_std(v: &[Option<f64>]) -> Option<f64> {
    let xs = present(v);
    if xs.len() < 2 {
        return None;
    }
    let m = xs.iter().sum::<f64>() / xs.len() as f64;
    let ss: f64 = xs.iter().map(|x| (x - m) * (x - m)).sum();
    Some((ss / (xs.len() - 1) as f64).sqrt())
}

/// Population standard deviation (n); needs one present value.
pub fn population_std(v: &[Option<f64>]) -> Option<f64> {
    let xs = present(v);
    if xs.is_empty() {
        return None;
    }
    let m = xs.iter().sum::<f64>() / xs.len() as f64;
    let ss: f64 = xs.iter().map(|x| (x - m) * (x - m)).sum();
    Some((ss / xs.len() as f64).sqrt())
}

/// Two-sided band `mean ± k·sd` using the sample SD.
pub fn sd_band(v: &[Option<f64>], k: f64) -> Option<(f64, f64)> {
    let m = mean(v)?;
    let sd = sample_std(v)?;
    Some((m - k * sd, m + k * sd))
}
