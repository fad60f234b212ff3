mod bootstrap;

pub use bootstrap::*;
