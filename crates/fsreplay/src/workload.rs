use fsreplay_exec::Executor;

/// Built-in replay sequence. Exercises every operation the executor exposes,
/// chaining descriptor values the way a recorded failing sequence would;
/// swap this module out to replay a different one.
pub fn run(exec: &mut Executor) {
    exec.mkdir("/foo", 0o775);
    exec.create("/foo/bar", 0o775);
    let fd = exec.open("/foo/bar");
    exec.write(fd, 999, 1024);
    exec.fsync(fd);
    exec.close(fd);
    exec.hardlink("/foo/bar", "/baz");
    let fd = exec.open("/baz");
    exec.read(fd, 1024);
    exec.close(fd);
    exec.rename("/baz", "/gaz");
    exec.remove("/foo");
    exec.remove("/gaz");
}
