//! Command execution inside database pods
//!
//! [`PodRunner`] is the transport for everything the operator runs in a pod:
//! the fact gather script, vsql statements, the install indicator write and
//! admin tool invocations.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use vdb_common::{Error, Result, SERVER_CONTAINER};

/// Captured output of a command run in a pod
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Whether the command exited with status 0
    pub success: bool,
}

impl ExecOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
        }
    }

    /// Failed output with the given stderr
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
        }
    }
}

/// Runs commands in a container of a pod
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodRunner: Send + Sync {
    /// Run `command` in `container` of `pod` and wait for it to exit.
    ///
    /// A command that runs and exits non-zero is `Ok` with `success == false`;
    /// `Err` means the command could not be run at all.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput>;

    /// Like [`PodRunner::exec`], with `input` written to the command's stdin
    /// before it is closed. Secrets travel this way so they never appear in
    /// the exec request or the pod's process list.
    async fn exec_with_input(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
        input: String,
    ) -> Result<ExecOutput>;
}

/// Reads the password from the first stdin line; vsql reads the rest
const VSQL_WITH_PASSWORD: &str =
    r#"read -r VSQL_PASSWORD && export VSQL_PASSWORD && exec vsql -U "$0" -v ON_ERROR_STOP=on -tA"#;

/// Run a SQL statement through vsql in the server container.
///
/// The statement and any password are fed on stdin. A non-zero exit is
/// turned into [`Error::Exec`] carrying stderr.
pub async fn exec_vsql(
    runner: &dyn PodRunner,
    namespace: &str,
    pod: &str,
    user: &str,
    password: Option<&str>,
    sql: &str,
) -> Result<String> {
    let (command, input) = match password.filter(|p| !p.is_empty()) {
        Some(pw) => (
            vec![
                "bash".to_string(),
                "-c".to_string(),
                VSQL_WITH_PASSWORD.to_string(),
                user.to_string(),
            ],
            format!("{pw}\n{sql}\n"),
        ),
        None => (
            vec![
                "vsql".to_string(),
                "-U".to_string(),
                user.to_string(),
                "-v".to_string(),
                "ON_ERROR_STOP=on".to_string(),
                "-tA".to_string(),
            ],
            format!("{sql}\n"),
        ),
    };

    let output = runner
        .exec_with_input(namespace, pod, SERVER_CONTAINER, command, input)
        .await?;
    if !output.success {
        return Err(Error::exec(pod, output.stderr));
    }
    Ok(output.stdout)
}

/// Production implementation using the pod exec subresource
pub struct KubePodRunner {
    client: Client,
}

impl KubePodRunner {
    /// Create a runner using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn attach(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
        input: Option<String>,
    ) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(input.is_some())
            .stdout(true)
            .stderr(true);

        debug!(pod, container, program = ?command.first(), "exec in pod");

        let mut attached = pods
            .exec(pod, command, &params)
            .await
            .map_err(|e| Error::exec(pod, e.to_string()))?;

        if let (Some(input), Some(mut stdin)) = (input, attached.stdin()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| Error::exec(pod, format!("failed writing stdin: {e}")))?;
            // EOF lets the command finish reading
            if let Err(e) = stdin.shutdown().await {
                debug!(pod, error = %e, "failed closing exec stdin");
            }
        }

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let (stdout, stderr) = tokio::join!(read_all(stdout_reader), read_all(stderr_reader));

        // The status channel reports the exit code once the process is gone
        let success = match attached.take_status() {
            Some(status) => status
                .await
                .and_then(|s| s.status)
                .is_some_and(|s| s == "Success"),
            None => false,
        };

        if let Err(e) = attached.join().await {
            debug!(pod, error = %e, "exec session did not close cleanly");
        }

        Ok(ExecOutput {
            stdout,
            stderr,
            success,
        })
    }
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut r) = reader {
        if let Err(e) = r.read_to_string(&mut buf).await {
            debug!(error = %e, "failed reading exec stream");
        }
    }
    buf
}

#[async_trait]
impl PodRunner for KubePodRunner {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        self.attach(namespace, pod, container, command, None).await
    }

    async fn exec_with_input(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
        input: String,
    ) -> Result<ExecOutput> {
        self.attach(namespace, pod, container, command, Some(input))
            .await
    }
}
