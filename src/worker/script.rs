//! Runs the deployment script and streams its output into the job log.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::job::JobContext;
use crate::error::Error;
use crate::queue::JobQueue;

/// Invokes `bash <script>` from the content root.
///
/// stderr is folded into stdout inside the shell, so lines reach the log in
/// exactly the order the script wrote them.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    script: PathBuf,
}

impl ScriptRunner {
    #[must_use]
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
        }
    }

    /// Runs the script to completion.
    ///
    /// Each output line is decoded lossily, stripped of trailing whitespace
    /// and written through `ctx`.
    ///
    /// # Errors
    ///
    /// - [`Error::ContentNotFound`] if the script is missing from `root`;
    /// - [`Error::ScriptFailed`] on a non-zero exit;
    /// - [`Error::LeaseLost`] if a write finds the job taken over (the script
    ///   is killed).
    pub async fn run<Q: JobQueue>(
        &self,
        root: &Path,
        env: &[(String, String)],
        ctx: &JobContext<'_, Q>,
    ) -> Result<(), Error> {
        let script = root.join(&self.script);
        if !script.is_file() {
            return Err(Error::ContentNotFound(format!(
                "deployment script {} not found",
                self.script.display()
            )));
        }

        let mut child = Command::new("bash")
            .arg("-c")
            .arg(r#"exec bash "$0" 2>&1"#)
            .arg(&script)
            .current_dir(root)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("script stdout not captured")))?;
        let mut lines = BufReader::new(stdout).split(b'\n');
        while let Some(bytes) = lines.next_segment().await? {
            let line = String::from_utf8_lossy(&bytes);
            ctx.write(line.trim_end()).await?;
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::ScriptFailed {
                exit_code: status.code(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobState, MemoryQueue};
    use crate::queue::tests::payload;

    fn content_with(script: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Scripts/sh");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("data_load.sh"), script).unwrap();
        dir
    }

    async fn run(script: &str) -> (Result<(), Error>, Vec<String>) {
        let queue = MemoryQueue::new();
        let id = queue.enqueue(payload(), &[]).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        let ctx = JobContext::new(&queue, &job.lease, None, false);

        let dir = content_with(script);
        let runner = ScriptRunner::new("Scripts/sh/data_load.sh");
        let env = vec![("SF_TARGET_ORG".to_string(), "Dev1".to_string())];
        let result = runner.run(dir.path(), &env, &ctx).await;

        let status = queue.status(&id).await.unwrap();
        assert_eq!(status.status, JobState::Running);
        let lines = status
            .logs
            .iter()
            .map(|l| l.split_once("] ").map_or(l.clone(), |(_, rest)| rest.to_string()))
            .collect();
        (result, lines)
    }

    #[tokio::test]
    async fn streams_combined_output_in_order() {
        let (result, lines) =
            run("echo one\necho two >&2\nprintf 'three   \\n'\necho \"org=$SF_TARGET_ORG\"\n").await;
        result.unwrap();
        assert_eq!(lines, ["one", "two", "three", "org=Dev1"]);
    }

    #[tokio::test]
    async fn non_zero_exit_is_script_failed() {
        let (result, lines) = run("echo partial\nexit 4\n").await;
        assert!(matches!(result, Err(Error::ScriptFailed { exit_code: Some(4) })));
        assert_eq!(lines, ["partial"]);
    }

    #[tokio::test]
    async fn secrets_in_output_are_redacted() {
        let (result, lines) = run("echo 'access_token=00Dabc!xyz'\n").await;
        result.unwrap();
        assert_eq!(lines, ["access_token=***"]);
    }

    #[tokio::test]
    async fn missing_script_is_content_not_found() {
        let queue = MemoryQueue::new();
        queue.enqueue(payload(), &[]).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        let ctx = JobContext::new(&queue, &job.lease, None, false);
        let dir = tempfile::tempdir().unwrap();

        let runner = ScriptRunner::new("Scripts/sh/data_load.sh");
        let err = runner.run(dir.path(), &[], &ctx).await.unwrap_err();
        assert!(matches!(err, Error::ContentNotFound(_)));
    }
}
