//! Collection of utility functions.

mod cumsum;

pub use self::cumsum::*;

use crate::prelude::*;

/// Divide `x` by `y` and round up towards infinity. For example, `21/5 = 4.2`
/// thus `div_ceil(21, 5) == 5`.
pub fn div_ceil(x: i64, y: i64) -> i64 {
    let (q, r) = (x / y, x % y);
    if r != 0 && (x >= 0) == (y >= 0) {
        q + 1
    } else {
        q
    }
}

/// Floored modulo: the result takes the sign of `y`, matching the modulo used
/// by the per-block phase arithmetic of strided slices.
pub fn pymod(x: i64, y: i64) -> i64 {
    let r = x % y;
    if r != 0 && (r < 0) != (y < 0) {
        r + y
    } else {
        r
    }
}

/// Hard cap on the number of positions [`bounded_range`] will generate.
pub const MAX_RANGE_LEN: u64 = 1 << 26;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("range of {len} positions exceeds the cap of {cap}")]
pub struct RangeOverflow {
    pub len: u64,
    pub cap: u64,
}

/// Expands a `(start, stop, step)` range into explicit positions, refusing to
/// generate more than `MAX_RANGE_LEN` of them.
pub fn bounded_range(start: i64, stop: i64, step: i64) -> Result<Vec<i64>, RangeOverflow> {
    assert!(step != 0, "range step cannot be zero");

    let len = max(div_ceil(stop - start, step), 0) as u64;
    if len > MAX_RANGE_LEN {
        return Err(RangeOverflow {
            len,
            cap: MAX_RANGE_LEN,
        });
    }

    let mut out = Vec::with_capacity(len as usize);
    let mut v = start;
    while (step > 0 && v < stop) || (step < 0 && v > stop) {
        out.push(v);
        v += step;
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_div_ceil() {
        // Div ceil is tricky to get right for negative numbers.
        assert_eq!(div_ceil(-1, 5), 0);
        assert_eq!(div_ceil(0, 5), 0);
        assert_eq!(div_ceil(1, 5), 1);

        assert_eq!(div_ceil(9, 5), 2);
        assert_eq!(div_ceil(10, 5), 2);
        assert_eq!(div_ceil(11, 5), 3);

        assert_eq!(div_ceil(-9, -5), 2);
        assert_eq!(div_ceil(-10, -5), 2);
        assert_eq!(div_ceil(-11, -5), 3);

        assert_eq!(div_ceil(9, -5), -1);
        assert_eq!(div_ceil(-87, -3), 29);
    }

    #[test]
    fn test_pymod() {
        assert_eq!(pymod(7, 3), 1);
        assert_eq!(pymod(-7, 3), 2);
        assert_eq!(pymod(7, -3), -2);
        assert_eq!(pymod(-7, -3), -1);
        assert_eq!(pymod(20, -3), -1);
        assert_eq!(pymod(-19, 27), 8);
        assert_eq!(pymod(6, 3), 0);
        assert_eq!(pymod(-6, 3), 0);
    }

    #[test]
    fn test_bounded_range() {
        assert_eq!(bounded_range(0, 5, 1).unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(bounded_range(5, 0, -2).unwrap(), vec![5, 3, 1]);
        assert_eq!(bounded_range(3, 3, 1).unwrap(), Vec::<i64>::new());
        assert_eq!(bounded_range(5, 0, 1).unwrap(), Vec::<i64>::new());

        let err = bounded_range(0, (MAX_RANGE_LEN as i64) + 1, 1).unwrap_err();
        assert_eq!(err.cap, MAX_RANGE_LEN);
        assert_eq!(err.len, MAX_RANGE_LEN + 1);
    }
}
