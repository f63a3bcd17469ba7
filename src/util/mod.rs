//! Utility functions shared by the parser and the CLI.
//!
//! - **URL validation**: scheme and host policy for operator-entered feed URLs
//! - **Text processing**: control-character stripping and text-run joining

mod text;
mod url_validator;

pub use text::{join_text_runs, strip_control_chars};
pub use url_validator::{validate_url, UrlValidationError};
