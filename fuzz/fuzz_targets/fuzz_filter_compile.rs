//! Fuzz target for filter compilation.
//!
//! This tests that compiling arbitrary selectors and filter bodies never
//! panics and never yields a design doc outside the run's namespace.

#![no_main]

use libfuzzer_sys::fuzz_target;
use repdyno::filter::{compile, FilterArg, FilterRequest};

fuzz_target!(|data: (u8, &str)| {
    let (kind, input) = data;
    let request = match kind % 4 {
        0 => FilterRequest::js(FilterArg::Custom(input.to_string())),
        1 => match serde_json::from_str(input) {
            Ok(selector) => FilterRequest::mango(FilterArg::Custom(selector)),
            Err(_) => return,
        },
        2 => FilterRequest::doc_ids(FilterArg::Custom(
            input.split(',').map(str::to_string).collect(),
        )),
        _ => FilterRequest::view(FilterArg::Custom(input.to_string())),
    };

    // Should never panic
    if let Ok(artifact) = compile("fuzz", &request) {
        if let Some(ddoc) = artifact.design_doc {
            let id = ddoc.get("_id").and_then(|v| v.as_str()).unwrap_or_default();
            assert!(id.starts_with("_design/fuzz_"));
        }
    }
});
