pub mod cli;
pub mod run;
pub mod scheduler;

pub use cli::*;
pub use run::*;
pub use scheduler::*;
