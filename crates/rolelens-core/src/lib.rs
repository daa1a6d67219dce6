pub mod config;
pub mod confirm;
pub mod corpus;
pub mod few_shot;
pub mod orchestrator;
pub mod parser;
pub mod prompt;
pub mod retry;
pub mod status;

pub use config::*;
pub use confirm::*;
pub use corpus::*;
pub use few_shot::*;
pub use orchestrator::*;
pub use parser::*;
pub use prompt::*;
pub use retry::*;
pub use status::*;
