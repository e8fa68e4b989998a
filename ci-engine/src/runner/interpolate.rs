//! Substitution of earlier step outputs into command arguments.
//!
//! References take the form `${{ steps.<step_id>.output.<VAR> }}`. A
//! reference to a step or variable that is not in the stage output is left
//! as written.

use crate::core::StageOutput;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*steps\.([A-Za-z0-9_\-]+)\.output\.([A-Za-z0-9_]+)\s*\}\}")
        .expect("reference pattern is valid")
});

/// Replaces every resolvable reference in `input`.
#[must_use]
pub fn interpolate<'a>(input: &'a str, outputs: &StageOutput) -> Cow<'a, str> {
    REFERENCE.replace_all(input, |caps: &Captures<'_>| {
        outputs
            .lookup(&caps[1], &caps[2])
            .map_or_else(|| caps[0].to_string(), ToString::to_string)
    })
}

/// Returns true if `input` contains at least one reference.
#[must_use]
pub fn has_references(input: &str) -> bool {
    REFERENCE.is_match(input)
}
