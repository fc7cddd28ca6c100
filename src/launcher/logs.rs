//! Best-effort log streaming: once a worker container is ready its `job`
//! container log is followed and forwarded line by line to the driver's
//! stdout. Progress glyph lines are colorised; the stream is not reopened
//! on close.

use crate::constants::JOB_CONTAINER;
use crate::progress::{STEP_FAIL, STEP_OK, STEP_START};
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;

const CYAN: &str = "\x1b[36m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Follows the `job` container of `pod` and forwards each line to stdout.
pub async fn stream_pod_logs(pods: Api<Pod>, pod: String, worker: String) {
    let params = LogParams {
        container: Some(JOB_CONTAINER.to_string()),
        follow: true,
        ..Default::default()
    };

    let stream = match pods.log_stream(&pod, &params).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("cannot stream logs of pod {pod}: {err}");
            return;
        }
    };

    let mut lines = stream.lines();
    loop {
        match lines.try_next().await {
            Ok(Some(line)) => println!("{}", render_line(&worker, &line)),
            Ok(None) => return,
            Err(err) => {
                debug!("log stream of pod {pod} closed: {err}");
                return;
            }
        }
    }
}

/// One forwarded line: severity prefix, worker name, glyph colorisation.
pub(crate) fn render_line(worker: &str, line: &str) -> String {
    let (severity, colored) = if line.starts_with(STEP_START) {
        ('I', format!("{CYAN}{line}{RESET}"))
    } else if line.starts_with(STEP_OK) {
        ('I', format!("{GREEN}{line}{RESET}"))
    } else if line.starts_with(STEP_FAIL) {
        ('E', format!("{RED}{line}{RESET}"))
    } else {
        ('I', line.to_string())
    };

    format!("{severity} {worker} | {colored}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_line_colorises_glyphs() {
        assert_eq!(
            render_line("worker-0", "‣ Create job worker-0"),
            "I worker-0 | \x1b[36m‣ Create job worker-0\x1b[0m"
        );
        assert_eq!(
            render_line("worker-0", "✓ Create job worker-0"),
            "I worker-0 | \x1b[32m✓ Create job worker-0\x1b[0m"
        );
        assert_eq!(
            render_line("worker-1", "✗ Copy binary: no such file"),
            "E worker-1 | \x1b[31m✗ Copy binary: no such file\x1b[0m"
        );
        assert_eq!(render_line("worker-1", "plain output"), "I worker-1 | plain output");
    }
}
