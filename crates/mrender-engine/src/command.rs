//! Render engine command builder and runner.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// Default number of output lines buffered between the pipe reader and the consumer.
pub const DEFAULT_LINE_BUFFER: usize = 256;

/// Renderer backend passed to `--renderer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Renderer {
    #[default]
    Cairo,
    OpenGl,
}

impl Renderer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Renderer::Cairo => "cairo",
            Renderer::OpenGl => "opengl",
        }
    }
}

impl FromStr for Renderer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cairo" => Ok(Renderer::Cairo),
            "opengl" => Ok(Renderer::OpenGl),
            other => Err(format!("unknown renderer: {}", other)),
        }
    }
}

/// Quality preset flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    /// 480p15 (`-ql`)
    #[default]
    Low,
    /// 720p30 (`-qm`)
    Medium,
    /// 1080p60 (`-qh`)
    High,
    /// 1440p60 (`-qp`)
    Production,
    /// 2160p60 (`-qk`)
    FourK,
}

impl Quality {
    pub fn flag(&self) -> &'static str {
        match self {
            Quality::Low => "-ql",
            Quality::Medium => "-qm",
            Quality::High => "-qh",
            Quality::Production => "-qp",
            Quality::FourK => "-qk",
        }
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" | "l" => Ok(Quality::Low),
            "medium" | "m" => Ok(Quality::Medium),
            "high" | "h" => Ok(Quality::High),
            "production" | "p" => Ok(Quality::Production),
            "fourk" | "4k" | "k" => Ok(Quality::FourK),
            other => Err(format!("unknown quality preset: {}", other)),
        }
    }
}

/// Builder for render engine commands.
#[derive(Debug, Clone)]
pub struct RenderCommand {
    /// Engine executable
    program: String,
    /// Arguments placed before the render flags (e.g. `-m manim`)
    leading_args: Vec<String>,
    /// Renderer backend
    renderer: Renderer,
    /// Quality preset
    quality: Quality,
    /// Extra flags placed after the preset
    extra_args: Vec<String>,
    /// Source file to render
    source: PathBuf,
    /// Scene class to render
    scene: String,
}

impl RenderCommand {
    /// Create a new render command.
    pub fn new(program: impl Into<String>, source: impl AsRef<Path>, scene: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            renderer: Renderer::default(),
            quality: Quality::default(),
            extra_args: Vec::new(),
            source: source.as_ref().to_path_buf(),
            scene: scene.into(),
        }
    }

    /// Add arguments placed right after the program.
    pub fn leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set renderer backend.
    pub fn renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = renderer;
        self
    }

    /// Set quality preset.
    pub fn quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    /// Add an extra flag after the quality preset.
    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Engine executable.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Scene class to render.
    pub fn scene(&self) -> &str {
        &self.scene
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = self.leading_args.clone();

        args.push("--renderer".to_string());
        args.push(self.renderer.as_str().to_string());
        args.push(self.quality.flag().to_string());
        args.extend(self.extra_args.iter().cloned());

        args.push(self.source.to_string_lossy().to_string());
        args.push(self.scene.clone());

        args
    }
}

/// Spawns render engine processes.
#[derive(Debug, Clone)]
pub struct RenderRunner {
    line_buffer: usize,
}

impl Default for RenderRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderRunner {
    /// Create a new runner.
    pub fn new() -> Self {
        Self {
            line_buffer: DEFAULT_LINE_BUFFER,
        }
    }

    /// Set how many lines may queue up between the pipe reader and the consumer.
    pub fn with_line_buffer(mut self, lines: usize) -> Self {
        self.line_buffer = lines.max(1);
        self
    }

    /// Spawn the engine with `cwd` as working directory.
    ///
    /// Standard output and standard error share one pipe, so lines come out
    /// in the order the engine wrote them. Must be called from within a tokio
    /// runtime.
    pub fn spawn(&self, cmd: &RenderCommand, cwd: &Path) -> EngineResult<RenderProcess> {
        check_engine(cmd.program())?;

        let args = cmd.build_args();
        debug!("Running engine: {} {}", cmd.program(), args.join(" "));

        let (reader, writer) = std::io::pipe().map_err(EngineError::Pipe)?;
        let writer_err = writer.try_clone().map_err(EngineError::Pipe)?;

        // The command holds the parent's copies of the write end; it has to be
        // dropped before the reader can observe EOF.
        let child = {
            let mut command = Command::new(cmd.program());
            command
                .args(&args)
                .current_dir(cwd)
                .stdin(Stdio::null())
                .stdout(writer)
                .stderr(writer_err)
                .kill_on_drop(true);
            command
                .spawn()
                .map_err(|e| EngineError::spawn_failed(cmd.program(), e))?
        };

        info!(
            pid = child.id().unwrap_or_default(),
            scene = %cmd.scene(),
            "Render engine started"
        );

        let (tx, rx) = mpsc::channel(self.line_buffer);
        tokio::task::spawn_blocking(move || read_lines(reader, tx));

        Ok(RenderProcess {
            child,
            lines: rx,
            program: cmd.program().to_string(),
        })
    }
}

/// A running render engine process.
pub struct RenderProcess {
    child: Child,
    lines: mpsc::Receiver<String>,
    program: String,
}

impl RenderProcess {
    /// Next line of combined output, or `None` once the pipe is closed.
    ///
    /// Cancel-safe: dropping the future never loses a line.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// OS process id, while the process has not been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> EngineResult<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Ask the process to stop, escalating to a kill after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> EngineResult<ExitStatus> {
        #[cfg(unix)]
        if let Some(pid) = self.child.id().and_then(|pid| i32::try_from(pid).ok()) {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => {
                    if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
                        return Ok(status?);
                    }
                    warn!(
                        pid,
                        "{} ignored SIGTERM for {:?}, killing process", self.program, grace
                    );
                }
                Err(e) => debug!(pid, "SIGTERM failed: {}", e),
            }
        }

        #[cfg(not(unix))]
        let _ = grace;

        self.child.kill().await?;
        Ok(self.child.wait().await?)
    }
}

/// Read newline-terminated chunks from the pipe until EOF or until the consumer goes away.
fn read_lines(reader: impl Read, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if tx.blocking_send(decode_line(&buf)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Failed to read engine output: {}", e);
                break;
            }
        }
    }
}

/// Decode raw output bytes, replacing invalid UTF-8 and dropping the line terminator.
fn decode_line(buf: &[u8]) -> String {
    let decoded = String::from_utf8_lossy(buf);
    let line: &str = &decoded;
    line.strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(line)
        .to_string()
}

/// Check if the render engine is available.
pub fn check_engine(program: &str) -> EngineResult<PathBuf> {
    which::which(program).map_err(|_| EngineError::EngineNotFound(program.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder_default_flags() {
        let cmd = RenderCommand::new("manim", "/artifacts/job/input.py", "MyScene");

        assert_eq!(
            cmd.build_args(),
            vec!["--renderer", "cairo", "-ql", "/artifacts/job/input.py", "MyScene"]
        );
    }

    #[test]
    fn test_command_builder_leading_and_extra_args() {
        let cmd = RenderCommand::new("python3", "input.py", "Intro")
            .leading_args(["-m", "manim"])
            .renderer(Renderer::OpenGl)
            .quality(Quality::High)
            .extra_arg("--disable_caching");

        let args = cmd.build_args();
        assert_eq!(&args[..2], &["-m", "manim"]);
        assert!(args.contains(&"opengl".to_string()));
        assert!(args.contains(&"-qh".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("Intro"));
        assert_eq!(args[args.len() - 3], "--disable_caching");
    }

    #[test]
    fn test_parse_presets() {
        assert_eq!("LOW".parse::<Quality>().unwrap(), Quality::Low);
        assert_eq!("4k".parse::<Quality>().unwrap(), Quality::FourK);
        assert!("ultra".parse::<Quality>().is_err());
        assert_eq!("OpenGL".parse::<Renderer>().unwrap(), Renderer::OpenGl);
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[test]
    fn test_missing_engine() {
        let err = check_engine("definitely-not-a-render-engine-xyz").unwrap_err();
        assert!(matches!(err, EngineError::EngineNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_merges_stdout_and_stderr_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = RenderCommand::new("sh", "input.py", "Scene").leading_args([
            "-c",
            "echo one; echo two >&2; echo three; exit 3",
            "sh",
        ]);

        let mut process = RenderRunner::new().spawn(&cmd, dir.path()).unwrap();
        let mut lines = Vec::new();
        while let Some(line) = process.next_line().await {
            lines.push(line);
        }
        let status = process.wait().await.unwrap();

        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(status.code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_uses_workspace_as_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = RenderCommand::new("sh", "input.py", "Scene").leading_args(["-c", "pwd", "sh"]);

        let mut process = RenderRunner::new().spawn(&cmd, dir.path()).unwrap();
        let line = process.next_line().await.unwrap();
        process.wait().await.unwrap();

        let expected = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(std::fs::canonicalize(line).unwrap(), expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_long_render() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = RenderCommand::new("sh", "input.py", "Scene")
            .leading_args(["-c", "echo started; exec sleep 30", "sh"]);

        let mut process = RenderRunner::new().spawn(&cmd, dir.path()).unwrap();
        assert_eq!(process.next_line().await.as_deref(), Some("started"));

        let status = process.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(!status.success());
    }
}
