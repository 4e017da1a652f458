//! Job process setup between `fork` and `execve`.
//!
//! [`ChildProcessRunner::prepare`] runs in the daemon and resolves every
//! string the child needs. [`ChildProcessRunner::run`] runs in the forked
//! child, touches only that prepared copy and never returns: any failed step
//! ends the child with `_exit(127)`.

use std::convert::Infallible;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::errno::Errno;
use nix::sys::signal::{sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{self, alarm, Pid, Uid, User};

use crate::config::SbdConfig;
use crate::error::{Result, SbdError};
use crate::job::spec::expand_stdio_path;
use crate::job::Job;

/// Exit code of a child that failed before reaching the job script.
pub const CHILD_SETUP_FAILED: i32 = 127;

const SCRIPT_NAME: &str = "job.sh";
const SCRIPT_TMP_NAME: &str = "job.sh.tmp";
const FALLBACK_CWD: &str = "/tmp";

/// Everything the forked child needs, resolved before the fork.
#[derive(Debug, Clone)]
pub struct ChildProcessRunner {
    job_id: i64,
    debug: bool,
    close_fds: Vec<RawFd>,
    user_name: String,
    user_id: u32,
    /// Environment pairs, later entries win
    env: Vec<(OsString, OsString)>,
    /// Slot in `env` holding `LS_JOBPID`, filled in by the child
    jobpid_slot: usize,
    umask: u32,
    job_dir: PathBuf,
    script: Vec<u8>,
    exec_cwd: PathBuf,
    hooks: Vec<String>,
    stdin: Option<PathBuf>,
    stdout: PathBuf,
    stderr: PathBuf,
}

/// A child setup step that failed.
#[derive(Debug)]
struct StepFailed {
    step: &'static str,
    detail: String,
}

impl StepFailed {
    fn new(step: &'static str, detail: impl std::fmt::Display) -> Self {
        Self {
            step,
            detail: detail.to_string(),
        }
    }
}

type StepResult<T> = std::result::Result<T, StepFailed>;

impl ChildProcessRunner {
    pub fn prepare(job: &Job, config: &SbdConfig, jfiles_dir: &Path, state_dir: &Path) -> Result<Self> {
        let spec = &job.spec;

        if spec.job_file.is_empty() || spec.job_file.contains('/') {
            return Err(SbdError::InvalidArgument(format!(
                "job {} has invalid job file name {:?}",
                job.job_id, spec.job_file
            )));
        }

        let mut env: Vec<(OsString, OsString)> = std::env::vars_os().collect();
        let mut set = |key: &str, value: &OsStr| env.push((key.into(), value.to_os_string()));
        set("LSB_SUB_HOST", OsStr::new(&spec.from_host));
        set("LSB_JOBID", OsStr::new(&job.job_id.to_string()));
        set("LAVALITE_JOB_ID", OsStr::new(&job.job_id.to_string()));
        set("LSB_QUEUE", OsStr::new(&spec.queue));
        set("LSB_JOBNAME", OsStr::new(&spec.job_name));
        set("LS_JOBPID", OsStr::new(""));
        set("LAVALITE_JOB_STATE_DIR", state_dir.as_os_str());
        let jobpid_slot = env.len() - 2;

        for entry in &spec.env {
            match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    env.push((key.into(), value.into()));
                }
                _ => {
                    tracing::debug!(job_id = job.job_id, entry, "Skipping env entry without '='");
                }
            }
        }

        let mut hooks = Vec::new();
        for cmd in [&spec.queue_pre_cmd, &spec.pre_exec_cmd] {
            if !cmd.trim().is_empty() {
                hooks.push(cmd.clone());
            }
        }

        let stdin = if spec.in_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(expand_stdio_path(&spec.in_file, job.job_id)?))
        };
        let stdio_path = |template: &str, default: &str| -> Result<PathBuf> {
            if template.is_empty() {
                Ok(PathBuf::from(default))
            } else {
                Ok(PathBuf::from(expand_stdio_path(template, job.job_id)?))
            }
        };

        Ok(Self {
            job_id: job.job_id,
            debug: config.debug,
            close_fds: config.close_fds.clone(),
            user_name: job.exec_username.clone(),
            user_id: spec.user_id,
            env,
            jobpid_slot,
            umask: spec.umask,
            job_dir: jfiles_dir.join(&spec.job_file),
            script: spec.job_file_data.clone(),
            exec_cwd: PathBuf::from(&job.exec_cwd),
            hooks,
            stdin,
            stdout: stdio_path(&spec.out_file, "stdout")?,
            stderr: stdio_path(&spec.err_file, "stderr")?,
        })
    }

    /// Runs the child setup and execs the job script.
    pub fn run(mut self) -> ! {
        self.set_job_pid();
        let err = match self.exec() {
            Ok(never) => match never {},
            Err(err) => err,
        };

        let msg = format!(
            "sbatchd: job {}: {} failed: {}\n",
            self.job_id, err.step, err.detail
        );
        // SAFETY: write(2) and _exit(2) are async-signal-safe.
        unsafe {
            libc::write(2, msg.as_ptr().cast(), msg.len());
            libc::_exit(CHILD_SETUP_FAILED)
        }
    }

    fn exec(&self) -> StepResult<Infallible> {
        for &fd in &self.close_fds {
            match unistd::close(fd) {
                Ok(()) | Err(Errno::EBADF) => {}
                Err(e) => return Err(StepFailed::new("close", e)),
            }
        }

        unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
            .map_err(|e| StepFailed::new("setpgid", e))?;

        if !self.debug {
            self.set_ids()?;
        }

        let envp = self.envp()?;

        umask(Mode::from_bits_truncate(self.umask as libc::mode_t));

        let script = materialize_script(&self.job_dir, &self.script)
            .map_err(|e| StepFailed::new("materialize", e))?;

        if unistd::chdir(&self.exec_cwd).is_err() {
            unistd::chdir(FALLBACK_CWD).map_err(|e| StepFailed::new("chdir", e))?;
        }

        reset_signals().map_err(|e| StepFailed::new("signals", e))?;

        for hook in &self.hooks {
            self.run_hook(hook)?;
        }

        self.redirect_stdio()
            .map_err(|e| StepFailed::new("stdio", e))?;

        let path = CString::new(script.as_os_str().as_bytes())
            .map_err(|e| StepFailed::new("execve", e))?;
        let argv = [path.clone()];
        unistd::execve(&path, &argv, &envp).map_err(|e| StepFailed::new("execve", e))
    }

    fn set_ids(&self) -> StepResult<()> {
        let user = match User::from_name(&self.user_name) {
            Ok(Some(user)) => user,
            _ => User::from_uid(Uid::from_raw(self.user_id))
                .ok()
                .flatten()
                .ok_or_else(|| StepFailed::new("getpwnam", &self.user_name))?,
        };
        let name = CString::new(user.name.as_str()).map_err(|e| StepFailed::new("initgroups", e))?;

        unistd::initgroups(&name, user.gid).map_err(|e| StepFailed::new("initgroups", e))?;
        unistd::setgid(user.gid).map_err(|e| StepFailed::new("setgid", e))?;
        unistd::setuid(user.uid).map_err(|e| StepFailed::new("setuid", e))?;
        Ok(())
    }

    fn set_job_pid(&mut self) {
        if let Some((_, value)) = self.env.get_mut(self.jobpid_slot) {
            *value = unistd::getpid().to_string().into();
        }
    }

    /// `KEY=VALUE` strings for execve, one per key.
    fn envp(&self) -> StepResult<Vec<CString>> {
        let mut pairs: Vec<(&OsStr, &OsStr)> = Vec::with_capacity(self.env.len());
        for (key, value) in &self.env {
            pairs.retain(|(k, _)| *k != key.as_os_str());
            pairs.push((key.as_os_str(), value.as_os_str()));
        }

        pairs
            .into_iter()
            .map(|(key, value)| {
                let mut entry = key.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                CString::new(entry).map_err(|e| StepFailed::new("environment", e))
            })
            .collect()
    }

    fn run_hook(&self, cmd: &str) -> StepResult<()> {
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .status()
            .map_err(|e| StepFailed::new("pre-exec hook", e))?;
        if !status.success() {
            return Err(StepFailed::new(
                "pre-exec hook",
                format!("{:?} exited with {}", cmd, status),
            ));
        }
        Ok(())
    }

    fn redirect_stdio(&self) -> io::Result<()> {
        let stdin = match &self.stdin {
            Some(path) => File::open(path)?,
            None => File::open("/dev/null")?,
        };
        dup_onto(&stdin, libc::STDIN_FILENO)?;

        let open_out = |path: &Path| {
            OpenOptions::new()
                .append(true)
                .create(true)
                .mode(0o644)
                .open(path)
        };
        dup_onto(&open_out(&self.stdout)?, libc::STDOUT_FILENO)?;
        dup_onto(&open_out(&self.stderr)?, libc::STDERR_FILENO)?;
        Ok(())
    }
}

fn dup_onto(file: &File, target: RawFd) -> io::Result<()> {
    unistd::dup2(file.as_raw_fd(), target)?;
    Ok(())
}

/// Default dispositions, SIGHUP ignored, empty mask, no pending alarm.
fn reset_signals() -> nix::Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in Signal::iterator() {
        if sig == Signal::SIGKILL || sig == Signal::SIGSTOP {
            continue;
        }
        // SAFETY: installs SIG_DFL, no handler code runs.
        unsafe { sigaction(sig, &default) }?;
    }

    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: installs SIG_IGN, no handler code runs.
    unsafe { sigaction(Signal::SIGHUP, &ignore) }?;

    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)?;
    alarm::cancel();
    Ok(())
}

/// Writes the job script to `<dir>/job.sh` through `job.sh.tmp`.
///
/// The payload must hold more than a single byte.
pub fn materialize_script(dir: &Path, data: &[u8]) -> io::Result<PathBuf> {
    if data.len() <= 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("job script payload of {} bytes", data.len()),
        ));
    }

    match DirBuilder::new().mode(0o700).create(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }

    let tmp = dir.join(SCRIPT_TMP_NAME);
    let path = dir.join(SCRIPT_NAME);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o700)
        .open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o700))?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}
