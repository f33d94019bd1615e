pub mod fixtures;
pub mod probes;
pub mod stages;

pub use fixtures::*;
pub use probes::*;
pub use stages::*;
