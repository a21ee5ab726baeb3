use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// Replaces every `(placeholder, value)` pair in each argument.
pub fn substitute(args: &[String], replacements: &[(&str, &str)]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            replacements
                .iter()
                .fold(arg.clone(), |acc, (from, to)| acc.replace(from, to))
        })
        .collect()
}

/// Builds a command running in a fresh process group so the whole tree can be
/// signalled at once. Output is discarded.
pub fn group_command(argv: &[String], working_dir: Option<&Path>) -> Option<Command> {
    let (program, args) = argv.split_first()?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    Some(cmd)
}

fn signal_group(pgid: u32, signal: libc::c_int) {
    // SAFETY: killpg only sends a signal; an already reaped group yields ESRCH.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc != 0 {
        debug!(pgid, signal, "killpg failed, group already gone");
    }
}

/// Kills whatever is left of a group whose leader already exited.
pub fn kill_group(pgid: u32) {
    signal_group(pgid, libc::SIGKILL);
}

/// Terminates the child's process group and reaps the child.
///
/// Sends SIGTERM, waits up to `grace`, then sends SIGKILL.
pub fn terminate_group(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let pgid = child.id();
    signal_group(pgid, libc::SIGTERM);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => {
                signal_group(pgid, libc::SIGKILL);
                return Some(status);
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(10)),
            Err(e) => {
                warn!(pgid, error = %e, "Failed to poll target during shutdown");
                break;
            }
        }
    }
    signal_group(pgid, libc::SIGKILL);
    match child.wait() {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(pgid, error = %e, "Failed to reap target");
            None
        }
    }
}

/// Exit code and terminating signal of `status`.
pub fn exit_parts(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_substituted_everywhere() {
        let args = vec![
            "run".to_string(),
            "--conf={config}".to_string(),
            "{test}:{config}".to_string(),
        ];
        let out = substitute(&args, &[("{config}", "/tmp/a.xml"), ("{test}", "TestX")]);
        assert_eq!(out, vec!["run", "--conf=/tmp/a.xml", "TestX:/tmp/a.xml"]);
    }

    #[test]
    fn empty_argv_yields_no_command() {
        assert!(group_command(&[], None).is_none());
    }

    #[test]
    fn terminate_kills_the_whole_group() {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "sleep 30 & sleep 30".to_string(),
        ];
        let mut child = group_command(&argv, None).unwrap().spawn().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let status = terminate_group(&mut child, Duration::from_millis(200)).unwrap();
        assert!(!status.success());
        let (_, signal) = exit_parts(&status);
        assert!(signal.is_some());
    }
}
