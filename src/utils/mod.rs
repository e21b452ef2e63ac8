//! Various utilities functions and types

mod geometry;

pub use self::geometry::{Buffer, Coordinate, Physical, Point, Rectangle, Size, Transform};

/// Convert a floating point value into the 16.16 fixed point representation
/// used by the `SRC_*` plane properties.
#[inline]
pub fn to_fixed<N: Coordinate>(n: N) -> u32 {
    f64::round(n.to_f64() * (1 << 16) as f64) as u32
}
