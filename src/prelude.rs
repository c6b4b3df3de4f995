pub use tessera_core::prelude::*;

pub use crate::error::{ErrorKind, PlanError};
