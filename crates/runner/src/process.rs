/// Kill the whole process group led by `pid` via `killpg(SIGKILL)`.
///
/// The leader must have been spawned with `process_group(0)` so that its
/// PGID equals its PID. No-op for `None` or a PID that does not fit `i32`;
/// a group that is already gone is ignored.
pub(crate) fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid
        && let Ok(pid) = i32::try_from(pid)
    {
        let pgid = nix::unistd::Pid::from_raw(pid);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}
