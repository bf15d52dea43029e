//! Fuzz testing for schema validation.
//!
//! Feeds arbitrary bytes to the body and query parsers. Validation must
//! never panic: every input ends in either a typed value or a Validation
//! error.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run the validation fuzz target
//! cargo +nightly fuzz run fuzz_validation
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_validation -- -max_total_time=60
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use request_pipeline::error::ErrorKind;
use request_pipeline::validation::{FieldRule, Schema};
use serde::Deserialize;
use validator::Validate;

#[allow(dead_code)]
#[derive(Debug, Deserialize, Validate)]
struct Target {
    #[validate(length(min = 1, max = 64))]
    name: String,
    #[serde(default)]
    count: Option<i64>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    enabled: Option<bool>,
}

fn schema() -> Schema<Target> {
    Schema::new()
        .field(FieldRule::string("name").required().length(Some(1), Some(64)))
        .field(FieldRule::integer("count").range(Some(0.0), Some(1000.0)))
        .field(FieldRule::array("tags").length(None, Some(8)))
        .field(FieldRule::boolean("enabled"))
}

fuzz_target!(|data: &[u8]| {
    let schema = schema();

    if let Err(e) = schema.validate_body(data) {
        assert_eq!(e.kind(), ErrorKind::Validation);
    }

    if let Ok(query) = std::str::from_utf8(data)
        && let Err(e) = schema.validate_query(Some(query))
    {
        assert_eq!(e.kind(), ErrorKind::Validation);
    }
});
