//! Step progress protocol. Long operations on both sides of the harness
//! print a start glyph, then exactly one completion glyph; the log streamer
//! recognises these lines and colorises them on the driver's terminal.

use std::fmt;
use std::future::Future;

pub const STEP_START: char = '‣';
pub const STEP_OK: char = '✓';
pub const STEP_FAIL: char = '✗';

/// A named long-running step. Printing the start event happens on creation;
/// completion is reported through [`Step::complete`] or [`Step::fail`].
pub struct Step {
    name: String,
}

impl Step {
    pub fn start(name: impl Into<String>) -> Self {
        let name = name.into();
        println!("{STEP_START} {name}");
        Self { name }
    }

    pub fn complete(self) {
        println!("{STEP_OK} {}", self.name);
    }

    pub fn fail(self, err: &dyn fmt::Display) {
        println!("{STEP_FAIL} {}: {err}", self.name);
    }
}

/// Wraps `fut` in start/complete/fail events.
pub async fn step<T, E>(name: &str, fut: impl Future<Output = Result<T, E>>) -> Result<T, E>
where
    E: fmt::Display,
{
    let step = Step::start(name);
    match fut.await {
        Ok(value) => {
            step.complete();
            Ok(value)
        }
        Err(err) => {
            step.fail(&err);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_step_passes_result_through() {
        let ok: Result<u32, String> = step("add", async { Ok(41 + 1) }).await;
        assert_eq!(ok, Ok(42));

        let err: Result<u32, String> = step("boom", async { Err("nope".to_string()) }).await;
        assert_eq!(err, Err("nope".to_string()));
    }
}
