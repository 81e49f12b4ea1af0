pub mod pipeline;

pub use pipeline::{Config, Input, Report, Verdict, verify, verify_with};
