//! Exec-based file injection. Archives are streamed over a pod exec pipe to
//! `tar -xzf -`; gate files are written with a shell `echo`. Stderr of the
//! in-container command is captured for diagnostics, never swallowed.

use crate::constants::{BIN_READY_FILE, JOB_CONTAINER, JOB_READY_FILE};
use crate::errors::HarnessError;
use flate2::Compression;
use flate2::write::GzEncoder;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::AttachParams;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use walkdir::WalkDir;

/// Uploads the executable under `/` and releases the bin-ready gate with its
/// basename; the in-container supervisor then execs it.
pub(crate) async fn inject_executable(
    pods: &Api<Pod>,
    pod: &str,
    executable: &Path,
) -> Result<String, HarnessError> {
    let name = file_name(executable)?;
    let archive = archive_file(executable, Path::new(&name))?;
    exec(pods, pod, &["tar", "-xzf", "-", "-C", "/"], Some(&archive)).await?;
    write_file(pods, pod, BIN_READY_FILE, &name).await?;

    Ok(name)
}

/// Copies one value file to the identical path inside the pod.
pub(crate) async fn inject_file(pods: &Api<Pod>, pod: &str, path: &Path) -> Result<(), HarnessError> {
    let archive = archive_file(path, path)?;
    exec(pods, pod, &["tar", "-xzf", "-", "-C", "/"], Some(&archive)).await
}

/// Copies the context directory under the container working directory and
/// returns its basename, the worker's working-directory hint.
pub(crate) async fn inject_context(pods: &Api<Pod>, pod: &str, dir: &Path) -> Result<String, HarnessError> {
    let name = file_name(dir)?;
    let archive = archive_dir(dir, Path::new(&name))?;
    exec(pods, pod, &["tar", "-xzf", "-"], Some(&archive)).await?;

    Ok(name)
}

/// Releases the job-ready gate; `contents` is the context basename hint.
pub(crate) async fn release_job_ready(pods: &Api<Pod>, pod: &str, contents: &str) -> Result<(), HarnessError> {
    write_file(pods, pod, JOB_READY_FILE, contents).await
}

async fn write_file(pods: &Api<Pod>, pod: &str, path: &str, contents: &str) -> Result<(), HarnessError> {
    let command = format!("echo {contents} > {path}");
    exec(pods, pod, &["/bin/sh", "-c", &command], None).await
}

/// Runs `command` in the job container, optionally streaming `stdin_data`
/// into it, and fails loudly on a non-success exit.
async fn exec(
    pods: &Api<Pod>,
    pod: &str,
    command: &[&str],
    stdin_data: Option<&[u8]>,
) -> Result<(), HarnessError> {
    let params = AttachParams::default()
        .container(JOB_CONTAINER)
        .stdin(stdin_data.is_some())
        .stdout(false)
        .stderr(true);
    let mut process = pods.exec(pod, command.iter().copied(), &params).await?;
    let status = process.take_status();
    let stderr = process.stderr();

    if let Some(data) = stdin_data {
        let mut stdin = process
            .stdin()
            .ok_or_else(|| HarnessError::Injection(format!("exec stdin channel unavailable on pod {pod}")))?;
        stdin
            .write_all(data)
            .await
            .map_err(|err| HarnessError::Injection(format!("cannot stream archive into pod {pod}: {err}")))?;
        stdin
            .shutdown()
            .await
            .map_err(|err| HarnessError::Injection(format!("cannot close exec stdin on pod {pod}: {err}")))?;
        drop(stdin);
    }

    let mut diagnostics = String::new();
    if let Some(mut stderr) = stderr {
        let mut buffer = Vec::new();
        if stderr.read_to_end(&mut buffer).await.is_ok() {
            diagnostics = String::from_utf8_lossy(&buffer).trim().to_string();
        }
    }

    if let Some(status) = status {
        if let Some(status) = status.await {
            if status.status.as_deref() == Some("Failure") {
                return Err(HarnessError::Injection(format!(
                    "`{}` failed on pod {pod}: {} {diagnostics}",
                    command.join(" "),
                    status.message.unwrap_or_default(),
                )));
            }
        }
    }

    process.join().await.map_err(|err| {
        HarnessError::Injection(format!("`{}` on pod {pod}: {err} {diagnostics}", command.join(" ")))
    })?;

    Ok(())
}

/// Gzip tar holding one file stored under `name`. Absolute names are
/// re-rooted so extraction with `-C /` recreates the original path.
pub(crate) fn archive_file(path: &Path, name: &Path) -> Result<Vec<u8>, HarnessError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_path_with_name(path, strip_root(name))
        .map_err(|err| HarnessError::Injection(format!("cannot archive {}: {err}", path.display())))?;

    finish(builder)
}

/// Gzip tar of a directory tree stored under `name`.
pub(crate) fn archive_dir(dir: &Path, name: &Path) -> Result<Vec<u8>, HarnessError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::fast());
    let mut builder = tar::Builder::new(encoder);

    for entry in WalkDir::new(dir).follow_links(true) {
        let entry =
            entry.map_err(|err| HarnessError::Injection(format!("cannot walk {}: {err}", dir.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|err| HarnessError::Injection(format!("cannot relativize {}: {err}", entry.path().display())))?;
        builder
            .append_path_with_name(entry.path(), strip_root(name).join(relative))
            .map_err(|err| HarnessError::Injection(format!("cannot archive {}: {err}", entry.path().display())))?;
    }

    finish(builder)
}

fn finish(builder: tar::Builder<GzEncoder<Vec<u8>>>) -> Result<Vec<u8>, HarnessError> {
    let encoder = builder
        .into_inner()
        .map_err(|err| HarnessError::Injection(format!("cannot finish archive: {err}")))?;
    encoder
        .finish()
        .map_err(|err| HarnessError::Injection(format!("cannot compress archive: {err}")))
}

fn strip_root(name: &Path) -> &Path {
    name.strip_prefix("/").unwrap_or(name)
}

fn file_name(path: &Path) -> Result<String, HarnessError> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| HarnessError::Injection(format!("{} has no file name", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::BTreeSet;
    use std::fs;
    use std::io::Read;

    fn entry_names(archive: &[u8]) -> BTreeSet<String> {
        let mut tar = tar::Archive::new(GzDecoder::new(archive));
        tar.entries()
            .expect("error reading archive entries")
            .map(|entry| {
                let entry = entry.expect("error reading entry");
                entry.path().expect("error reading entry path").to_string_lossy().into_owned()
            })
            .collect()
    }

    #[test]
    fn test_archive_file_re_roots_absolute_names() {
        // setup:
        let dir = tempfile::tempdir().expect("error creating temporary dir");
        let file = dir.path().join("values.yaml");
        fs::write(&file, "replicas: 3\n").expect("error writing file");

        // execute:
        let archive = archive_file(&file, Path::new("/etc/values/values.yaml")).expect("error archiving file");

        // verify: name lost its leading slash and the content round-trips
        assert_eq!(entry_names(&archive), BTreeSet::from(["etc/values/values.yaml".to_string()]));

        let mut tar = tar::Archive::new(GzDecoder::new(archive.as_slice()));
        let mut content = String::new();
        tar.entries()
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "replicas: 3\n");
    }

    #[test]
    fn test_archive_dir_stores_tree_under_basename() {
        // setup:
        let dir = tempfile::tempdir().expect("error creating temporary dir");
        let context = dir.path().join("charts");
        fs::create_dir_all(context.join("templates")).expect("error creating directory");
        fs::write(context.join("Chart.yaml"), "name: demo").expect("error writing file");
        fs::write(context.join("templates/svc.yaml"), "kind: Service").expect("error writing file");

        // execute:
        let archive = archive_dir(&context, Path::new("charts")).expect("error archiving dir");

        // verify:
        assert_eq!(
            entry_names(&archive),
            BTreeSet::from(["charts/Chart.yaml".to_string(), "charts/templates/svc.yaml".to_string()])
        );
    }

    #[test]
    fn test_file_name_rejects_root() {
        assert!(file_name(Path::new("/")).is_err());
        assert_eq!(file_name(Path::new("/tmp/runner")).unwrap(), "runner");
    }
}
