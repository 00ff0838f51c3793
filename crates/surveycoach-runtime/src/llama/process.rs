//! Spawning llama-server and draining its output.

use std::net::TcpListener;
use std::process::Stdio;

use surveycoach_core::{Backend, EngineSpec};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::debug;

use super::LlamaServerSettings;
use super::error::LlamaServerError;

/// Offload every layer on GPU, none on CPU.
pub(crate) const fn gpu_layers(backend: Backend) -> u32 {
    match backend {
        Backend::Gpu => 999,
        Backend::Cpu => 0,
    }
}

/// Ask the OS for an unused local port.
pub(crate) fn free_port() -> Result<u16, LlamaServerError> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(LlamaServerError::Port)?;
    let port = listener
        .local_addr()
        .map_err(LlamaServerError::Port)?
        .port();
    Ok(port)
}

/// Build the llama-server command line for `spec`.
pub(crate) fn build_command(settings: &LlamaServerSettings, spec: &EngineSpec, port: u16) -> Command {
    let mut cmd = Command::new(&settings.server_path);
    cmd.arg("-m")
        .arg(&spec.model_path)
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port.to_string())
        .arg("-c")
        .arg(settings.effective_context(spec.max_tokens).to_string())
        .arg("-ngl")
        .arg(gpu_layers(spec.backend).to_string());

    for arg in &settings.extra_args {
        cmd.arg(arg);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Spawn llama-server. Must run inside a Tokio runtime.
pub(crate) fn spawn_server(
    settings: &LlamaServerSettings,
    spec: &EngineSpec,
    port: u16,
) -> Result<Child, LlamaServerError> {
    if !settings.server_path.exists() {
        return Err(LlamaServerError::NotFound {
            path: settings.server_path.clone(),
        });
    }
    let mut child = build_command(settings, spec, port)
        .spawn()
        .map_err(LlamaServerError::Spawn)?;
    spawn_log_readers(&mut child, port);
    Ok(child)
}

/// Forward stdout/stderr lines to tracing until the streams close.
fn spawn_log_readers(child: &mut Child, port: u16) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(text)) = lines.next_line().await {
                debug!(port, "stdout: {}", text);
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(text)) = lines.next_line().await {
                debug!(port, "stderr: {}", text);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn spec(backend: Backend) -> EngineSpec {
        EngineSpec {
            model_path: PathBuf::from("/models/gemma.gguf"),
            backend,
            max_tokens: 2048,
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn gpu_command_offloads_all_layers() {
        let settings = LlamaServerSettings::new("/usr/local/bin/llama-server");
        let cmd = build_command(&settings, &spec(Backend::Gpu), 9000);
        let args = args(&cmd);

        let ngl = args.iter().position(|a| a == "-ngl").unwrap();
        assert_eq!(args[ngl + 1], "999");
        let ctx = args.iter().position(|a| a == "-c").unwrap();
        assert_eq!(args[ctx + 1], "4096");
        assert!(args.contains(&"9000".to_string()));
    }

    #[test]
    fn context_never_drops_below_generation_cap() {
        let context = |settings: &LlamaServerSettings| {
            let argv = args(&build_command(settings, &spec(Backend::Cpu), 9003));
            let ctx = argv.iter().position(|a| a == "-c").unwrap();
            argv[ctx + 1].clone()
        };
        let settings = LlamaServerSettings::new("/usr/local/bin/llama-server");
        assert_eq!(context(&settings.clone().with_context_size(1024)), "2048");
        assert_eq!(context(&settings.with_context_size(8192)), "8192");
    }

    #[test]
    fn cpu_command_keeps_layers_on_host() {
        let mut settings = LlamaServerSettings::new("/usr/local/bin/llama-server");
        settings.extra_args = vec!["--threads".into(), "4".into()];
        let args = args(&build_command(&settings, &spec(Backend::Cpu), 9001));

        let ngl = args.iter().position(|a| a == "-ngl").unwrap();
        assert_eq!(args[ngl + 1], "0");
        assert_eq!(&args[args.len() - 2..], ["--threads", "4"]);
    }

    #[test]
    fn missing_binary_is_reported() {
        let settings = LlamaServerSettings::new("/definitely/not/llama-server");
        let err = spawn_server(&settings, &spec(Backend::Cpu), 9002).unwrap_err();
        assert!(matches!(err, LlamaServerError::NotFound { .. }));
    }

    #[test]
    fn free_port_is_nonzero() {
        assert_ne!(free_port().unwrap(), 0);
    }
}
