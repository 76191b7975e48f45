//! Launches and supervises the target child process (spec section 6: "the
//! child-process launcher and signal plumbing" are external collaborators,
//! implemented here at the thin level needed to fork/exec and forward
//! signals — not reimplemented as a shell). Grounded directly on
//! `run_program`/`redirect_output` in `examples/original_source/src/main.cpp`:
//! `fork()`, optional `dup2` redirection of stdout/stderr, then either
//! `execvp` or `/bin/sh -c` depending on `--shell`.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Instant;

use libc::pid_t;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execv, execvp, fork, ForkResult, Pid};

use crate::error::{Error, Result};

pub struct ChildSpawnOptions {
    pub command: Vec<String>,
    pub shell: bool,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// A running (or recently-exited) child process. Owns nothing but its pid
/// and start time; the process tree (spec section 4.2) tracks everything
/// else about it and its descendants.
pub struct Child {
    pub pid: pid_t,
    started: Instant,
    exited: Option<(i32, std::time::Duration)>,
}

impl Child {
    /// Forks and execs the configured command. In the parent, returns
    /// immediately with the child's pid; the child branch never returns
    /// (it either `exec`s successfully or calls `_exit`).
    pub fn spawn(opts: &ChildSpawnOptions) -> Result<Self> {
        if opts.command.is_empty() {
            return Err(Error::Setup {
                inner: "no child command given".into(),
            });
        }

        let command_str = opts.command.join(" ");
        info!("executing child process: {}", command_str);

        match unsafe { fork() }.map_err(|e| Error::Setup {
            inner: format!("fork failed: {}", e),
        })? {
            ForkResult::Child => {
                if let Some(path) = &opts.stdout {
                    redirect(path, libc::STDOUT_FILENO);
                }
                if let Some(path) = &opts.stderr {
                    redirect(path, libc::STDERR_FILENO);
                }

                let err = if opts.shell {
                    let shell = CString::new("/bin/sh").unwrap();
                    let args = [
                        CString::new("sh").unwrap(),
                        CString::new("-c").unwrap(),
                        CString::new(command_str.as_str()).unwrap(),
                    ];
                    execv(&shell, &args)
                } else {
                    let prog = CString::new(opts.command[0].as_str()).unwrap();
                    let args: Vec<CString> = opts
                        .command
                        .iter()
                        .map(|a| CString::new(a.as_str()).unwrap())
                        .collect();
                    execvp(&prog, &args)
                };

                // execv*/execvp only returns on failure.
                eprintln!("error executing {}: {}", command_str, err.unwrap_err());
                unsafe { libc::_exit(127) };
            }
            ForkResult::Parent { child } => {
                info!("child process (pid {}) created: {}", child.as_raw(), command_str);
                Ok(Child {
                    pid: child.as_raw(),
                    started: Instant::now(),
                    exited: None,
                })
            }
        }
    }

    /// Non-blocking check for whether the child has exited (spec section 5:
    /// "on SIGCHLD from the tracked child, the loop exits cleanly after
    /// finishing the current tick"). Reaps the zombie if so.
    pub fn poll_exit(&mut self) -> bool {
        if self.exited.is_some() {
            return true;
        }
        match waitpid(Pid::from_raw(self.pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                self.exited = Some((code, self.started.elapsed()));
                true
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                self.exited = Some((128 + sig as i32, self.started.elapsed()));
                true
            }
            _ => false,
        }
    }

    pub fn runtime(&self) -> std::time::Duration {
        self.exited.map(|(_, d)| d).unwrap_or_else(|| self.started.elapsed())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exited.map(|(code, _)| code)
    }
}

fn redirect(path: &PathBuf, target_fd: RawFd) {
    let c_path = match CString::new(path.to_string_lossy().as_bytes()) {
        Ok(p) => p,
        Err(_) => return,
    };
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC, 0o644) };
    if fd >= 0 {
        let _ = dup2(fd, target_fd);
        unsafe {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawns_and_reaps_a_short_lived_child() {
        let opts = ChildSpawnOptions {
            command: vec!["true".to_string()],
            shell: false,
            stdout: None,
            stderr: None,
        };
        let mut child = Child::spawn(&opts).unwrap();
        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        while !child.poll_exit() && Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(child.exit_code().is_some());
    }
}
