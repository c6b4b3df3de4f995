//! Deterministic, content-derived names for computed arrays and layers.
//!
//! A name is a pure function of the operation label and the canonical
//! encoding of every argument. Arrays are referenced by their own
//! deterministic name, never by object identity, so independently
//! constructed but logically identical operations collide on the same name
//! and merge structurally when their graphs are combined.

use std::hash::{Hash, Hasher};

/// Derives `label-<hash>` from the label and the canonical token parts.
pub fn deterministic_name<S: AsRef<str>>(label: &str, parts: &[S]) -> String {
    let mut hasher = fxhash::FxHasher::default();
    for part in parts {
        // `str::hash` is length-prefixed, so part boundaries cannot alias.
        part.as_ref().hash(&mut hasher);
    }

    format!("{}-{:016x}", label, hasher.finish())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_idempotent() {
        let a = deterministic_name("inc", &["x", "2"]);
        let b = deterministic_name("inc", &["x", "2"]);
        assert_eq!(a, b);
        assert!(a.starts_with("inc-"));
    }

    #[test]
    fn test_distinguishes_inputs() {
        assert_ne!(
            deterministic_name("inc", &["x", "2"]),
            deterministic_name("inc", &["x", "3"])
        );
        assert_ne!(
            deterministic_name("inc", &["x"]),
            deterministic_name("inc", &["y"])
        );
        assert_ne!(
            deterministic_name("inc", &["x"]),
            deterministic_name("dec", &["x"])
        );
    }

    #[test]
    fn test_part_boundaries() {
        assert_ne!(
            deterministic_name("op", &["ab", "c"]),
            deterministic_name("op", &["a", "bc"])
        );
    }
}
