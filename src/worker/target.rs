//! The target environment, reached through its command-line tool.

use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;
use tokio::process::Command;
use url::Url;

use crate::error::Error;
use crate::queue::Credentials;
use crate::redact;

/// Account attributes the eligibility policy needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgInfo {
    pub is_sandbox: bool,
    pub instance_name: Option<String>,
}

/// Something that can open an authenticated session on a target account.
pub trait TargetEnvironment: Send + Sync + 'static {
    type Session: TargetSession;

    /// Establish a credentialed session registered under `alias`.
    ///
    /// Failures are [`Error::AuthenticationFailed`].
    fn authenticate(
        &self,
        alias: &str,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Self::Session, Error>> + Send;
}

/// An authenticated session against one target account.
pub trait TargetSession: Send + Sync {
    /// Login name, for display only.
    fn username(&self) -> impl Future<Output = Result<Option<String>, Error>> + Send;

    fn org_info(&self) -> impl Future<Output = Result<OrgInfo, Error>> + Send;

    /// Number of records of `object` in the account.
    fn count_records(&self, object: &str) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Environment for subprocesses that must act on this account.
    fn script_env(&self) -> Vec<(String, String)>;
}

/// Command environment shared by every tool invocation.
const TOOL_ENV: [(&str, &str); 2] = [("SF_AUTOUPDATE_DISABLE", "1"), ("NODE_NO_WARNINGS", "1")];

/// Points the tool's home and XDG directories at `dir`, so its alias table
/// and stored auth live there and nowhere else.
fn state_env(dir: &Path) -> Vec<(String, String)> {
    let dir = dir.to_string_lossy().into_owned();
    ["HOME", "XDG_CONFIG_HOME", "XDG_DATA_HOME", "XDG_CACHE_HOME", "XDG_STATE_HOME"]
        .into_iter()
        .map(|key| (key.to_string(), dir.clone()))
        .collect()
}

/// [`TargetEnvironment`] driven by the platform CLI (`sf` by default).
#[derive(Debug, Clone)]
pub struct CliTarget {
    program: String,
    client_id: String,
    timeout: Duration,
}

impl CliTarget {
    #[must_use]
    pub fn new(program: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            client_id: client_id.into(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Upper bound for a single CLI call.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs `<program> --version` and returns the first output line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TargetQuery`] if the tool cannot be started or fails.
    pub async fn probe(&self) -> Result<String, Error> {
        let stdout = run_tool(&self.program, &["--version"], &[], self.timeout).await?;
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }
}

impl TargetEnvironment for CliTarget {
    type Session = CliSession;

    /// Every call logs in inside a fresh state directory, so sessions sharing
    /// an alias never see each other's org. The directory, and the refresh
    /// token the tool stores in it, go away with the last session clone.
    async fn authenticate(&self, alias: &str, credentials: &Credentials) -> Result<CliSession, Error> {
        let auth_url = auth_url(&self.client_id, credentials);
        let state = tempfile::Builder::new()
            .prefix("orgdeploy-cli-")
            .tempdir()
            .map_err(|e| Error::AuthenticationFailed(format!("state dir: {e}")))?;
        let env = state_env(state.path());

        // The URL carries the refresh token, so it goes to the tool by file, never argv.
        let mut file = tempfile::Builder::new()
            .prefix("auth-")
            .suffix(".sfdxurl")
            .tempfile_in(state.path())
            .map_err(|e| Error::AuthenticationFailed(format!("auth file: {e}")))?;
        file.write_all(auth_url.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| Error::AuthenticationFailed(format!("auth file: {e}")))?;
        let path = file.path().to_string_lossy().into_owned();

        run_tool(
            &self.program,
            &["org", "login", "sfdx-url", "--sfdx-url-file", &path, "-a", alias],
            &env,
            self.timeout,
        )
        .await
        .map_err(|e| match e {
            Error::TargetQuery(msg) => Error::AuthenticationFailed(msg),
            other => other,
        })?;
        drop(file);

        tracing::debug!(alias, "Target login completed");
        Ok(CliSession {
            program: self.program.clone(),
            alias: alias.to_string(),
            timeout: self.timeout,
            env,
            _state: Arc::new(state),
        })
    }
}

/// A CLI login registered under an alias in its own state directory.
#[derive(Debug, Clone)]
pub struct CliSession {
    program: String,
    alias: String,
    timeout: Duration,
    env: Vec<(String, String)>,
    _state: Arc<TempDir>,
}

impl CliSession {
    async fn query(&self, soql: &str) -> Result<Value, Error> {
        let stdout = run_tool(
            &self.program,
            &["data", "query", "-q", soql, "--json", "-o", &self.alias],
            &self.env,
            self.timeout,
        )
        .await?;
        parse_json(&stdout)
    }
}

impl TargetSession for CliSession {
    async fn username(&self) -> Result<Option<String>, Error> {
        let stdout = run_tool(
            &self.program,
            &["org", "display", "--json", "-o", &self.alias],
            &self.env,
            self.timeout,
        )
        .await?;
        let json = parse_json(&stdout)?;
        Ok(json["result"]["username"]
            .as_str()
            .filter(|u| !u.is_empty())
            .map(str::to_string))
    }

    async fn org_info(&self) -> Result<OrgInfo, Error> {
        let json = self
            .query("SELECT IsSandbox, InstanceName FROM Organization LIMIT 1")
            .await?;
        Ok(org_info_from(&json))
    }

    async fn count_records(&self, object: &str) -> Result<u64, Error> {
        if !object.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Config(format!("invalid object name: {object}")));
        }
        let json = self.query(&format!("SELECT COUNT() FROM {object}")).await?;
        Ok(json["result"]["totalSize"].as_u64().unwrap_or(0))
    }

    fn script_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = TOOL_ENV
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        env.extend(self.env.iter().cloned());
        env.push(("SF_TARGET_ORG".into(), self.alias.clone()));
        env
    }
}

/// `force://<client_id>::<refresh_token>@<host>`, the CLI's auth URL form.
fn auth_url(client_id: &str, credentials: &Credentials) -> String {
    let host = Url::parse(&credentials.instance_url)
        .ok()
        .and_then(|u| {
            u.host_str().map(|h| match u.port() {
                Some(port) => format!("{h}:{port}"),
                None => h.to_string(),
            })
        })
        .unwrap_or_else(|| {
            credentials
                .instance_url
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        });
    format!(
        "force://{}::{}@{}",
        urlencoding::encode(client_id),
        urlencoding::encode(&credentials.refresh_token),
        host
    )
}

fn org_info_from(json: &Value) -> OrgInfo {
    let record = &json["result"]["records"][0];
    let is_sandbox = match &record["IsSandbox"] {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    };
    let instance_name = record["InstanceName"]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase);
    OrgInfo {
        is_sandbox,
        instance_name,
    }
}

fn parse_json(stdout: &str) -> Result<Value, Error> {
    serde_json::from_str(stdout)
        .map_err(|e| Error::TargetQuery(format!("unreadable CLI output: {e}")))
}

/// Runs the tool to completion and returns stdout.
///
/// A non-zero exit becomes [`Error::TargetQuery`] carrying the tool's own
/// message (from `--json` output when present, else stderr), redacted.
async fn run_tool(
    program: &str,
    args: &[&str],
    env: &[(String, String)],
    timeout: Duration,
) -> Result<String, Error> {
    let mut command = Command::new(program);
    command
        .args(args)
        .envs(TOOL_ENV)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| Error::TargetQuery(format!("{program} timed out after {}s", timeout.as_secs())))?
        .map_err(|e| Error::TargetQuery(format!("could not run {program}: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }

    let message = serde_json::from_str::<Value>(&stdout)
        .ok()
        .and_then(|json| json["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if stderr.is_empty() {
                format!("{program} exited with {}", output.status)
            } else {
                stderr.to_string()
            }
        });
    Err(Error::TargetQuery(redact::sanitize(&message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn credentials(instance_url: &str) -> Credentials {
        Credentials {
            access_token: "access".into(),
            refresh_token: "5Aep/861+x".into(),
            instance_url: instance_url.into(),
        }
    }

    #[test]
    fn auth_url_encodes_secrets_and_keeps_host() {
        let url = auth_url("3MVG9 id", &credentials("https://acme.my.salesforce.com/"));
        assert_eq!(url, "force://3MVG9%20id::5Aep%2F861%2Bx@acme.my.salesforce.com");
    }

    #[test]
    fn auth_url_tolerates_bare_host() {
        let url = auth_url("cid", &credentials("acme.my.salesforce.com/"));
        assert!(url.ends_with("@acme.my.salesforce.com"));
    }

    #[test]
    fn org_info_accepts_bool_or_string_flag() {
        let info = org_info_from(&json!({
            "result": { "records": [{ "IsSandbox": "TRUE", "InstanceName": "cs42" }] }
        }));
        assert_eq!(
            info,
            OrgInfo {
                is_sandbox: true,
                instance_name: Some("CS42".into())
            }
        );

        let info = org_info_from(&json!({ "result": { "records": [] } }));
        assert!(!info.is_sandbox);
        assert_eq!(info.instance_name, None);
    }

    /// A stand-in CLI that keeps its alias table under `$HOME`, the way the
    /// real tool does, and reports the instance named by the login URL's host.
    const FAKE_CLI: &str = r#"#!/bin/sh
case "$1 $2" in
  "org login")
    mkdir -p "$HOME/aliases"
    sed 's/.*@//; s/\..*//' "$5" > "$HOME/aliases/$7"
    ;;
  "data query")
    printf '{"result":{"records":[{"IsSandbox":false,"InstanceName":"%s"}]}}' "$(cat "$HOME/aliases/$7")"
    ;;
  *)
    exit 1
    ;;
esac
"#;

    fn fake_cli(dir: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("sf");
        std::fs::write(&path, FAKE_CLI).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn sessions_sharing_an_alias_stay_on_their_own_org() {
        let bin = tempfile::tempdir().unwrap();
        let target = CliTarget::new(fake_cli(bin.path()), "cid");

        let a = target
            .authenticate("LSStarterConfigSandbox", &credentials("https://na1.salesforce.com"))
            .await
            .unwrap();
        let b = target
            .authenticate("LSStarterConfigSandbox", &credentials("https://na2.salesforce.com"))
            .await
            .unwrap();

        assert_eq!(a.org_info().await.unwrap().instance_name.as_deref(), Some("NA1"));
        assert_eq!(b.org_info().await.unwrap().instance_name.as_deref(), Some("NA2"));
    }

    #[tokio::test]
    async fn state_dir_is_removed_with_the_session() {
        let bin = tempfile::tempdir().unwrap();
        let target = CliTarget::new(fake_cli(bin.path()), "cid");
        let session = target
            .authenticate("Dev1", &credentials("https://na1.salesforce.com"))
            .await
            .unwrap();

        let env = session.script_env();
        assert!(env.contains(&("SF_TARGET_ORG".into(), "Dev1".into())));
        assert!(env.contains(&("SF_AUTOUPDATE_DISABLE".into(), "1".into())));
        let (_, home) = env.iter().find(|(k, _)| k == "HOME").unwrap();
        let home = std::path::PathBuf::from(home);
        assert!(home.join("aliases/Dev1").is_file());

        let copy = session.clone();
        drop(session);
        assert!(home.is_dir());
        drop(copy);
        assert!(!home.exists());
    }

    #[tokio::test]
    async fn failing_tool_reports_redacted_message() {
        let err = run_tool(
            "sh",
            &["-c", "echo 'bad refresh_token=abc' >&2; exit 3"],
            &[],
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        let Error::TargetQuery(msg) = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(msg, "bad refresh_token=***");
    }

    #[tokio::test]
    async fn missing_tool_is_reported() {
        let target = CliTarget::new("orgdeploy-no-such-tool", "cid");
        assert!(matches!(target.probe().await, Err(Error::TargetQuery(_))));
    }
}
