//! External service integrations.

pub mod lead_fetch {
    pub use crate::lead_fetch::*;
}

pub mod lead_models {
    pub use crate::lead_models::*;
}

pub mod store {
    pub use crate::store::*;
}
