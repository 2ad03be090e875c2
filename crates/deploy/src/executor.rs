use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use schemapatch_types::{DeployConfig, Execution, PatchError, Result, ScriptExecutor};
use tracing::{debug, warn};

/// Runs scripts through an external SQL shell: `<program> <args..> <target>`,
/// script on stdin followed by `EXIT`, stdout and stderr captured.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        ShellExecutor {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &DeployConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.args.clone(),
            Duration::from_secs(config.timeout_seconds),
        )
    }

    fn spawn(&self, target: &str, working_dir: &Path) -> Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(target)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so a launcher's children die with it on timeout.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        cmd.spawn().map_err(|e| {
            PatchError::Execution(format!("{} {}: {}", self.program, self.args.join(" "), e))
        })
    }
}

/// Kills the shell and every process it started.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(child.id() as i32);
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            warn!(pid = child.id(), error = %e, "failed to kill process group");
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

impl ScriptExecutor for ShellExecutor {
    fn execute(&self, target: &str, script: &str, working_dir: &Path) -> Result<Execution> {
        let start = Instant::now();
        let mut child = self.spawn(target, working_dir)?;

        // Output is drained while input is still being written.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let input = format!("{}\nEXIT\n", script);
        let stdin = child.stdin.take();
        let writer = std::thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                let _ = stdin.write_all(input.as_bytes());
            }
        });

        let mut timed_out = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if start.elapsed() >= self.timeout {
                        warn!(target, timeout_s = self.timeout.as_secs(), "script timed out, killing");
                        kill_tree(&mut child);
                        timed_out = true;
                        break None;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(PatchError::Execution(format!("wait for {}: {}", self.program, e))),
            }
        };

        let _ = writer.join();
        let mut output = stdout.join().unwrap_or_default();
        let errors = stderr.join().unwrap_or_default();
        if !errors.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&errors);
        }
        if timed_out {
            output.push_str(&format!("\nkilled by timeout after {}s\n", self.timeout.as_secs()));
        }

        let exit_code = status.and_then(|s| s.code());
        debug!(target, ?exit_code, elapsed_ms = start.elapsed().as_millis() as u64, "script finished");
        Ok(Execution { output, exit_code })
    }
}
