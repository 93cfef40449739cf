// Domain-layer modules and shared errors/models
pub mod normalizer {
    pub use crate::normalizer::*;
}

pub mod matching {
    pub use crate::matching::*;
}

pub mod dedup {
    pub use crate::dedup::*;
}

pub mod pipeline {
    pub use crate::pipeline::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
