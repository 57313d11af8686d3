pub mod config;
pub mod parser;
pub mod report;
pub mod types;

pub use config::Config;
pub use parser::{parse, parse_text, ParsedOutput};
pub use report::{write_reports, JsonReport, ReportPaths};
pub use types::*;
