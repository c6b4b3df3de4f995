//! User-facing chunked-array handles composing the planners.

mod array;

pub use self::array::{ArrayPlan, Reduction};
