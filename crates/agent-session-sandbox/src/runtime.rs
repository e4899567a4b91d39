//! `SandboxRuntime`: separates "what provisioning does" from "how it talks
//! to the remote sandbox process" behind a narrow async trait. Production
//! wires a real transport; tests use an in-memory fake.

use std::collections::HashMap;

use agent_session_types::{SessionError, SessionResult};
use async_trait::async_trait;

#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn mkdir_p(&self, path: &str) -> SessionResult<()>;
    async fn path_exists(&self, path: &str) -> SessionResult<bool>;
    async fn write_file(&self, path: &str, contents: &str) -> SessionResult<()>;

    /// Free bytes on the filesystem backing `path`; a probe failure is
    /// warn-only at the call site (§4.5 step 4), never fatal.
    async fn disk_free_bytes(&self, path: &str) -> SessionResult<u64>;

    /// Runs `program` with `args` in `cwd` with `env`, waiting at most
    /// `timeout_secs`. A timeout is reported as `SessionError::SandboxRetryable`
    /// so `with_sandbox_retry` can decide whether to try again.
    async fn run(
        &self,
        cwd: &str,
        program: &str,
        args: &[String],
        env: &HashMap<String, String>,
        timeout_secs: u64,
    ) -> SessionResult<CommandOutput>;
}

/// Production transport: runs every operation directly against the local
/// filesystem and process table. Suitable for a single-node deployment where
/// the "sandbox" is a directory tree on the same host as the server binary;
/// a multi-tenant deployment would swap this for a transport that talks to a
/// remote sandbox process instead, without touching anything in this crate.
pub struct LocalProcessSandboxRuntime;

#[async_trait]
impl SandboxRuntime for LocalProcessSandboxRuntime {
    async fn mkdir_p(&self, path: &str) -> SessionResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| SessionError::SandboxFatal(format!("mkdir_p {path}: {e}")))
    }

    async fn path_exists(&self, path: &str) -> SessionResult<bool> {
        Ok(tokio::fs::metadata(path).await.is_ok())
    }

    async fn write_file(&self, path: &str, contents: &str) -> SessionResult<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SessionError::SandboxFatal(format!("write_file {path} (mkdir parent): {e}")))?;
        }
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| SessionError::SandboxFatal(format!("write_file {path}: {e}")))
    }

    async fn disk_free_bytes(&self, path: &str) -> SessionResult<u64> {
        fs2::available_space(path).map_err(|e| SessionError::SandboxRetryable(format!("disk_free_bytes {path}: {e}")))
    }

    async fn run(
        &self,
        cwd: &str,
        program: &str,
        args: &[String],
        env: &HashMap<String, String>,
        timeout_secs: u64,
    ) -> SessionResult<CommandOutput> {
        let mut command = tokio::process::Command::new(program);
        command.current_dir(cwd).args(args).envs(env).kill_on_drop(true);

        let output = tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), command.output())
            .await
            .map_err(|_| SessionError::SandboxRetryable(format!("{program} timed out after {timeout_secs}s")))?
            .map_err(|e| SessionError::SandboxRetryable(format!("{program} spawn failed: {e}")))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod local_process_tests {
    use super::*;

    fn scratch_dir() -> String {
        format!("{}/agent-session-sandbox-test-{}", std::env::temp_dir().display(), rand::random::<u64>())
    }

    #[tokio::test]
    async fn mkdir_write_and_path_exists_round_trip() {
        let runtime = LocalProcessSandboxRuntime;
        let dir = scratch_dir();
        assert!(!runtime.path_exists(&dir).await.unwrap());
        runtime.mkdir_p(&dir).await.unwrap();
        assert!(runtime.path_exists(&dir).await.unwrap());

        let file = format!("{dir}/nested/settings.json");
        runtime.write_file(&file, "{}").await.unwrap();
        assert!(runtime.path_exists(&file).await.unwrap());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn run_captures_exit_code_and_output() {
        let runtime = LocalProcessSandboxRuntime;
        let output = runtime
            .run("/", "echo", &["hello".to_string()], &HashMap::new(), 5)
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn run_times_out_on_a_slow_command() {
        let runtime = LocalProcessSandboxRuntime;
        let err = runtime
            .run("/", "sleep", &["5".to_string()], &HashMap::new(), 0)
            .await
            .unwrap_err();
        assert!(err.is_sandbox_retryable());
    }
}

/// In-memory fake used by provisioning tests: scripted responses keyed by
/// the exact command line, a virtual filesystem set, and a recording of
/// every call made so assertions can inspect ordering.
#[cfg(any(test, feature = "test-fixtures"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeSandboxRuntime {
        pub existing_paths: Mutex<std::collections::HashSet<String>>,
        pub scripted_outputs: Mutex<HashMap<String, CommandOutput>>,
        pub calls: Mutex<Vec<String>>,
        pub written_files: Mutex<HashMap<String, String>>,
        pub fail_mkdir: Mutex<bool>,
    }

    impl FakeSandboxRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_existing_path(self, path: impl Into<String>) -> Self {
            self.existing_paths.lock().unwrap().insert(path.into());
            self
        }

        pub fn script(&self, command_line: impl Into<String>, output: CommandOutput) {
            self.scripted_outputs.lock().unwrap().insert(command_line.into(), output);
        }

        fn command_line(program: &str, args: &[String]) -> String {
            format!("{program} {}", args.join(" "))
        }
    }

    #[async_trait]
    impl SandboxRuntime for FakeSandboxRuntime {
        async fn mkdir_p(&self, path: &str) -> SessionResult<()> {
            self.calls.lock().unwrap().push(format!("mkdir_p {path}"));
            if *self.fail_mkdir.lock().unwrap() {
                return Err(SessionError::SandboxFatal("mkdir_p failed".into()));
            }
            self.existing_paths.lock().unwrap().insert(path.to_string());
            Ok(())
        }

        async fn path_exists(&self, path: &str) -> SessionResult<bool> {
            Ok(self.existing_paths.lock().unwrap().contains(path))
        }

        async fn write_file(&self, path: &str, contents: &str) -> SessionResult<()> {
            self.calls.lock().unwrap().push(format!("write_file {path}"));
            self.written_files.lock().unwrap().insert(path.to_string(), contents.to_string());
            Ok(())
        }

        async fn disk_free_bytes(&self, _path: &str) -> SessionResult<u64> {
            Ok(10 * 1024 * 1024 * 1024)
        }

        async fn run(
            &self,
            cwd: &str,
            program: &str,
            args: &[String],
            _env: &HashMap<String, String>,
            _timeout_secs: u64,
        ) -> SessionResult<CommandOutput> {
            let line = Self::command_line(program, args);
            self.calls.lock().unwrap().push(format!("run[{cwd}] {line}"));
            Ok(self
                .scripted_outputs
                .lock()
                .unwrap()
                .get(&line)
                .cloned()
                .unwrap_or(CommandOutput { exit_code: 0, stdout: String::new(), stderr: String::new() }))
        }
    }
}
