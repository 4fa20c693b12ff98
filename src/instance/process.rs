//! Engine process handles.
//!
//! [`Launcher`] turns a [`CommandSpec`] into a running [`EngineProcess`]. The
//! production pair is [`ProcessLauncher`] / [`ChildProcess`]; tests substitute
//! their own implementations of the same contract.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

/// Lines of stdout/stderr retained per stream.
pub const TAIL_LINES: usize = 50;

/// Fully resolved command line and environment overlay for one engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub instance_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Last lines written by a process to its captured streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// A spawned engine process.
pub trait EngineProcess: Send {
    fn id(&self) -> u32;

    /// Non-blocking exit check. Keeps returning the exit once observed.
    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>>;

    /// Ask the process to exit on its own.
    fn terminate(&mut self) -> io::Result<()>;

    /// Unconditional kill.
    fn kill(&mut self) -> io::Result<()>;

    fn output(&self) -> CapturedOutput;
}

pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &CommandSpec) -> io::Result<Box<dyn EngineProcess>>;
}

/// Spawns engines as OS child processes with captured stdout/stderr.
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, spec: &CommandSpec) -> io::Result<Box<dyn EngineProcess>> {
        let mut cmd = Command::new(resolve_program(&spec.program));
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let stdout = LineTail::default();
        let stderr = LineTail::default();

        let readers = [
            child
                .stdout
                .take()
                .map(|s| stdout.follow(s, format!("{}-stdout", spec.instance_id))),
            child
                .stderr
                .take()
                .map(|s| stderr.follow(s, format!("{}-stderr", spec.instance_id))),
        ];
        for reader in readers.into_iter().flatten() {
            if let Err(err) = reader {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        }

        Ok(Box::new(ChildProcess {
            child,
            exit: None,
            stdout,
            stderr,
        }))
    }
}

fn resolve_program(program: &str) -> PathBuf {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return PathBuf::from(program);
    }
    which::which(program).unwrap_or_else(|_| PathBuf::from(program))
}

pub struct ChildProcess {
    child: Child,
    exit: Option<ExitInfo>,
    stdout: LineTail,
    stderr: LineTail,
}

impl EngineProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?.map(ExitInfo::from_status);
        }
        Ok(self.exit)
    }

    #[cfg(unix)]
    #[allow(unsafe_code)]
    fn terminate(&mut self) -> io::Result<()> {
        // A reaped pid may already belong to another process.
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        let pid = libc::pid_t::try_from(self.child.id())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: `pid` is our own unreaped child, so it cannot have been recycled,
        // and kill(2) touches no memory.
        let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.kill()
    }

    fn output(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: self.stdout.lines(),
            stderr: self.stderr.lines(),
        }
    }
}

/// Bounded buffer of the most recent lines read from a stream.
#[derive(Debug, Clone, Default)]
struct LineTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl LineTail {
    fn follow<R>(&self, stream: R, name: String) -> io::Result<thread::JoinHandle<()>>
    where
        R: Read + Send + 'static,
    {
        let lines = Arc::clone(&self.lines);
        thread::Builder::new().name(name).spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            // Keep draining until EOF so the child never blocks on a full pipe.
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                        let mut lock = lines.lock();
                        if lock.len() >= TAIL_LINES {
                            lock.pop_front();
                        }
                        lock.push_back(line);
                    }
                }
            }
        })
    }

    fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            instance_id: "test".to_string(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![("GREETING".to_string(), "hello".to_string())],
        }
    }

    fn wait_for_exit(process: &mut Box<dyn EngineProcess>, limit: Duration) -> Option<ExitInfo> {
        let start = Instant::now();
        while start.elapsed() < limit {
            if let Some(exit) = process.try_wait().unwrap() {
                return Some(exit);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }

    #[test]
    fn test_captures_output_and_env() {
        let mut process = ProcessLauncher::new()
            .launch(&sh("echo \"$GREETING\"; echo oops >&2; exit 3"))
            .unwrap();

        let exit = wait_for_exit(&mut process, Duration::from_secs(5)).unwrap();
        assert_eq!(exit.code, Some(3));

        // Readers may lag slightly behind the exit.
        thread::sleep(Duration::from_millis(100));
        let output = process.output();
        assert_eq!(output.stdout, vec!["hello"]);
        assert_eq!(output.stderr, vec!["oops"]);
    }

    #[test]
    fn test_tail_is_bounded() {
        let mut process = ProcessLauncher::new()
            .launch(&sh("i=0; while [ $i -lt 80 ]; do echo line$i; i=$((i+1)); done"))
            .unwrap();
        wait_for_exit(&mut process, Duration::from_secs(5)).unwrap();
        thread::sleep(Duration::from_millis(100));

        let output = process.output();
        assert_eq!(output.stdout.len(), TAIL_LINES);
        assert_eq!(output.stdout.last().map(String::as_str), Some("line79"));
    }

    #[test]
    fn test_terminate_sends_sigterm() {
        let mut process = ProcessLauncher::new().launch(&sh("exec sleep 30")).unwrap();
        process.terminate().unwrap();

        let exit = wait_for_exit(&mut process, Duration::from_secs(5)).unwrap();
        assert_eq!(exit.signal, Some(libc::SIGTERM));
        // Signalling an exited process is a no-op.
        process.terminate().unwrap();
        process.kill().unwrap();
    }

    #[test]
    fn test_missing_program_fails_to_launch() {
        let spec = CommandSpec {
            program: "/nonexistent/simulation-engine".to_string(),
            ..sh("true")
        };
        assert!(ProcessLauncher::new().launch(&spec).is_err());
    }
}
