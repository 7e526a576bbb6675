//! Namespace sandbox: the production execution environment.
//!
//! Every environment gets its own tmpfs root with the host's system
//! directories bind-mounted read-only. Code and library installers run as
//! children in fresh PID and mount namespaces, chrooted into that root and
//! constrained by rlimits. Requires root (CAP_SYS_ADMIN).

use crate::config::SandboxLimits;
use crate::environment::{
    EnvironmentError, EnvironmentFactory, ExecutionEnvironment, ExecutionOutput, Language,
};
use nix::fcntl::OFlag;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, execvpe, pipe2};
use std::ffi::CString;
use std::fs;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const WORKSPACE: &str = "/workspace";
const LIBS: &str = "/opt/libs";

/// How to install libraries and run code for one language.
struct Toolchain {
    source_file: &'static str,
    interpreter: &'static [&'static str],
    installer: &'static [&'static str],
    env: &'static [(&'static str, &'static str)],
}

fn toolchain(language: Language) -> Toolchain {
    match language {
        Language::Python => Toolchain {
            source_file: "main.py",
            interpreter: &["python3"],
            installer: &[
                "python3",
                "-m",
                "pip",
                "install",
                "--quiet",
                "--disable-pip-version-check",
                "--no-cache-dir",
                "--target",
                LIBS,
            ],
            env: &[("PYTHONPATH", LIBS), ("PYTHONUNBUFFERED", "1")],
        },
        Language::JavaScript => Toolchain {
            source_file: "main.js",
            interpreter: &["node"],
            installer: &["npm", "install", "--silent", "--no-audit", "--no-fund", "--prefix", LIBS],
            env: &[("NODE_PATH", "/opt/libs/node_modules")],
        },
        Language::Ruby => Toolchain {
            source_file: "main.rb",
            interpreter: &["ruby"],
            installer: &["gem", "install", "--no-document", "--install-dir", LIBS],
            env: &[("GEM_HOME", LIBS), ("GEM_PATH", LIBS)],
        },
    }
}

/// A single command to run inside the sandbox.
#[derive(Debug, Clone)]
struct RunConfig {
    command: Vec<String>,
    env: Vec<(String, String)>,
    cwd: String,
}

/// Creates namespace sandboxes under one base directory.
#[derive(Debug, Clone)]
pub struct NamespaceSandboxFactory {
    base_dir: PathBuf,
    limits: SandboxLimits,
}

impl NamespaceSandboxFactory {
    pub fn new(base_dir: impl Into<PathBuf>, limits: SandboxLimits) -> Self {
        Self {
            base_dir: base_dir.into(),
            limits,
        }
    }
}

impl EnvironmentFactory for NamespaceSandboxFactory {
    fn create(&self, language: Language, keep_template: bool) -> Box<dyn ExecutionEnvironment> {
        Box::new(NamespaceSandbox::new(
            &self.base_dir,
            language,
            keep_template,
            self.limits.clone(),
        ))
    }
}

#[derive(Debug)]
pub struct NamespaceSandbox {
    root: PathBuf,
    template_dir: Option<PathBuf>,
    language: Language,
    limits: SandboxLimits,
    open: bool,
}

impl NamespaceSandbox {
    /// With `keep_template`, installed libraries live in a per-language
    /// directory under `base_dir/templates` that outlives the sandbox.
    pub fn new(
        base_dir: &Path,
        language: Language,
        keep_template: bool,
        limits: SandboxLimits,
    ) -> Self {
        let root = base_dir.join(format!("sandbox-{}", uuid::Uuid::new_v4()));
        let template_dir =
            keep_template.then(|| base_dir.join("templates").join(language.as_str()));
        Self {
            root,
            template_dir,
            language,
            limits,
            open: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_command(&self, command: Vec<String>) -> Result<ExecutionOutput, EnvironmentError> {
        let toolchain = toolchain(self.language);
        let mut env: Vec<(String, String)> = vec![
            ("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string()),
            ("HOME".to_string(), "/home".to_string()),
            ("TMPDIR".to_string(), "/tmp".to_string()),
        ];
        env.extend(
            toolchain
                .env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        let config = RunConfig {
            command,
            env,
            cwd: WORKSPACE.to_string(),
        };
        run_in_sandbox(&self.root, &config, &self.limits).map_err(EnvironmentError::Sandbox)
    }
}

impl ExecutionEnvironment for NamespaceSandbox {
    fn open(&mut self) -> Result<(), EnvironmentError> {
        if self.open {
            return Err(EnvironmentError::AlreadyOpen);
        }
        info!(root = ?self.root, language = %self.language, "Opening sandbox");
        if let Err(e) = setup_sandbox_dir(&self.root, self.template_dir.as_deref()) {
            cleanup_sandbox(&self.root);
            let _ = fs::remove_dir_all(&self.root);
            return Err(EnvironmentError::Sandbox(e));
        }
        self.open = true;
        Ok(())
    }

    fn run(
        &mut self,
        code: &str,
        libraries: &[String],
    ) -> Result<ExecutionOutput, EnvironmentError> {
        if !self.open {
            return Err(EnvironmentError::NotOpen);
        }
        let toolchain = toolchain(self.language);

        if !libraries.is_empty() {
            info!(language = %self.language, libraries = ?libraries, "Installing libraries");
            let mut command: Vec<String> =
                toolchain.installer.iter().map(|s| s.to_string()).collect();
            command.extend(libraries.iter().cloned());
            let installed = self.run_command(command)?;
            if installed.exit_code != 0 {
                warn!(exit_code = installed.exit_code, "Library installation failed");
                return Ok(installed);
            }
        }

        let source = format!("{}/{}", WORKSPACE, toolchain.source_file);
        write_file_in_sandbox(&self.root, &source, code.as_bytes())
            .map_err(EnvironmentError::Sandbox)?;

        let mut command: Vec<String> =
            toolchain.interpreter.iter().map(|s| s.to_string()).collect();
        command.push(source);
        self.run_command(command)
    }

    fn close(&mut self) -> Result<(), EnvironmentError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        info!(root = ?self.root, "Closing sandbox");
        cleanup_sandbox(&self.root);
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(EnvironmentError::Io {
                context: format!("remove {}", self.root.display()),
                source,
            }),
        }
    }
}

impl Drop for NamespaceSandbox {
    fn drop(&mut self) {
        if self.open {
            warn!(root = ?self.root, "Sandbox dropped while open, cleaning up");
            let _ = self.close();
        }
    }
}

/// Write a file into the sandbox filesystem from the host side.
fn write_file_in_sandbox(sandbox_root: &Path, path: &str, content: &[u8]) -> Result<(), String> {
    let full_path = sandbox_root.join(path.trim_start_matches('/'));

    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("mkdir parent: {}", e))?;
    }

    fs::write(&full_path, content).map_err(|e| format!("write file: {}", e))?;
    fs::set_permissions(&full_path, fs::Permissions::from_mode(0o644))
        .map_err(|e| format!("chmod: {}", e))?;

    Ok(())
}

fn setup_sandbox_dir(sandbox_root: &Path, template_dir: Option<&Path>) -> Result<(), String> {
    if sandbox_root.exists() {
        cleanup_sandbox(sandbox_root);
    }

    fs::create_dir_all(sandbox_root).map_err(|e| format!("mkdir: {}", e))?;

    mount(
        Some("tmpfs"),
        sandbox_root,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("size=2G,mode=755"),
    )
    .map_err(|e| format!("mount tmpfs: {}", e))?;

    // Host system directories, read-only
    for dir in ["/bin", "/lib", "/lib64", "/usr", "/etc"] {
        let target = sandbox_root.join(&dir[1..]);
        if !Path::new(dir).exists() {
            continue;
        }
        fs::create_dir_all(&target).map_err(|e| format!("mkdir {}: {}", dir, e))?;
        mount(
            Some(dir),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| format!("bind mount {}: {}", dir, e))?;
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| format!("remount ro {}: {}", dir, e))?;
    }

    create_dir_with_mode(&sandbox_root.join("tmp"), 0o1777)?;

    let dev_dir = sandbox_root.join("dev");
    fs::create_dir_all(&dev_dir).map_err(|e| format!("mkdir dev: {}", e))?;
    for dev in DEVICES {
        let host_dev = format!("/dev/{}", dev);
        let sandbox_dev = dev_dir.join(dev);
        if Path::new(&host_dev).exists() {
            fs::write(&sandbox_dev, "").map_err(|e| format!("touch {}: {}", dev, e))?;
            mount(
                Some(host_dev.as_str()),
                &sandbox_dev,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| format!("bind mount {}: {}", dev, e))?;
        }
    }

    let proc_dir = sandbox_root.join("proc");
    fs::create_dir_all(&proc_dir).map_err(|e| format!("mkdir proc: {}", e))?;
    mount(
        Some("proc"),
        &proc_dir,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| format!("mount proc: {}", e))?;

    create_dir_with_mode(&sandbox_root.join("home"), 0o755)?;
    create_dir_with_mode(&sandbox_root.join(&WORKSPACE[1..]), 0o777)?;

    let libs_dir = sandbox_root.join(&LIBS[1..]);
    create_dir_with_mode(&libs_dir, 0o755)?;
    if let Some(template) = template_dir {
        fs::create_dir_all(template).map_err(|e| format!("mkdir template: {}", e))?;
        mount(
            Some(template),
            &libs_dir,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| format!("bind mount template: {}", e))?;
    }

    Ok(())
}

const DEVICES: [&str; 4] = ["null", "zero", "urandom", "random"];

fn create_dir_with_mode(dir: &Path, mode: u32) -> Result<(), String> {
    fs::create_dir_all(dir).map_err(|e| format!("mkdir {}: {}", dir.display(), e))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(mode))
        .map_err(|e| format!("chmod {}: {}", dir.display(), e))
}

/// Everything the child needs, converted before `clone` so the child only execs.
struct ChildCommand {
    program: CString,
    args: Vec<CString>,
    env: Vec<CString>,
    root: PathBuf,
    cwd: String,
}

impl ChildCommand {
    fn new(sandbox_root: &Path, config: &RunConfig) -> Result<Self, String> {
        let program = config
            .command
            .first()
            .ok_or_else(|| "empty command".to_string())
            .and_then(|c| CString::new(c.as_str()).map_err(|e| format!("cmd: {}", e)))?;
        let args = config
            .command
            .iter()
            .map(|s| CString::new(s.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("arg: {}", e))?;
        let env = config
            .env
            .iter()
            .map(|(k, v)| CString::new(format!("{}={}", k, v)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("env: {}", e))?;
        Ok(Self {
            program,
            args,
            env,
            root: sandbox_root.to_path_buf(),
            cwd: config.cwd.clone(),
        })
    }
}

fn run_in_sandbox(
    sandbox_root: &Path,
    config: &RunConfig,
    limits: &SandboxLimits,
) -> Result<ExecutionOutput, String> {
    debug!(command = ?config.command, sandbox_root = ?sandbox_root, "Running command");
    debug!(
        time_ms = limits.time_ms,
        mem_kb = limits.mem_kb,
        fsize_kb = limits.fsize_kb,
        nofile = limits.nofile,
        "Limits"
    );

    let child = ChildCommand::new(sandbox_root, config)?;
    let limits = limits.clone();

    let (stdout_read, stdout_write) = output_pipe()?;
    let (stderr_read, stderr_write) = output_pipe()?;
    let stdout_write_fd = stdout_write.as_raw_fd();
    let stderr_write_fd = stderr_write.as_raw_fd();

    const STACK_SIZE: usize = 1024 * 1024;
    let mut stack = vec![0u8; STACK_SIZE];

    let clone_flags = CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS;

    let child_fn = Box::new(move || {
        unsafe {
            libc::dup2(stdout_write_fd, 1);
            libc::dup2(stderr_write_fd, 2);
            libc::close(stdout_write_fd);
            libc::close(stderr_write_fd);
        }

        if let Err(e) = run_child(&child, &limits) {
            eprintln!("sandbox: {}", e);
        }
        127
    });

    let child_pid = unsafe {
        clone(
            child_fn,
            &mut stack,
            clone_flags,
            Some(Signal::SIGCHLD as i32),
        )
    }
    .map_err(|e| format!("clone: {}", e))?;
    debug!(child_pid = ?child_pid, "Child spawned");

    // Close write ends in parent so readers see EOF
    drop(stdout_write);
    drop(stderr_write);

    // Drain both pipes while the child runs; a full pipe would block it forever.
    let stdout_reader = std::thread::spawn(move || read_from_fd(stdout_read));
    let stderr_reader = std::thread::spawn(move || read_from_fd(stderr_read));

    let status = waitpid(child_pid, None).map_err(|e| format!("waitpid: {}", e))?;
    debug!(status = ?status, "Child exited");

    let stdout = stdout_reader.join().map_err(|_| "stdout reader panicked".to_string())?;
    let stderr = stderr_reader.join().map_err(|_| "stderr reader panicked".to_string())?;

    let exit_code = match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
        other => return Err(format!("unexpected wait status: {:?}", other)),
    };

    Ok(ExecutionOutput {
        stdout,
        stderr,
        exit_code,
    })
}

/// Both ends are close-on-exec, so programs started concurrently for other
/// sandboxes never inherit them. The child's `dup2` onto 1 and 2 yields
/// copies without the flag.
fn output_pipe() -> Result<(OwnedFd, OwnedFd), String> {
    pipe2(OFlag::O_CLOEXEC).map_err(|e| format!("pipe: {}", e))
}

fn read_from_fd(fd: OwnedFd) -> String {
    let mut file = fs::File::from(fd);
    let mut output = Vec::new();
    let _ = file.read_to_end(&mut output);
    String::from_utf8_lossy(&output).into_owned()
}

fn run_child(child: &ChildCommand, limits: &SandboxLimits) -> Result<(), String> {
    chroot(child.root.as_path()).map_err(|e| format!("chroot: {}", e))?;
    chdir(child.cwd.as_str()).map_err(|e| format!("chdir: {}", e))?;
    set_resource_limits(limits)?;
    execvpe(&child.program, &child.args, &child.env).map_err(|e| format!("exec: {}", e))?;
    Ok(())
}

fn set_resource_limits(limits: &SandboxLimits) -> Result<(), String> {
    let cpu_seconds = std::cmp::max(1, limits.time_ms / 1000);
    setrlimit(Resource::RLIMIT_CPU, cpu_seconds, cpu_seconds)
        .map_err(|e| format!("rlimit cpu: {}", e))?;

    let mem_bytes = limits.mem_kb * 1024;
    setrlimit(Resource::RLIMIT_AS, mem_bytes, mem_bytes)
        .map_err(|e| format!("rlimit as: {}", e))?;

    let fsize_bytes = limits.fsize_kb * 1024;
    setrlimit(Resource::RLIMIT_FSIZE, fsize_bytes, fsize_bytes)
        .map_err(|e| format!("rlimit fsize: {}", e))?;

    setrlimit(Resource::RLIMIT_NOFILE, limits.nofile, limits.nofile)
        .map_err(|e| format!("rlimit nofile: {}", e))?;

    setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(|e| format!("rlimit core: {}", e))?;
    setrlimit(Resource::RLIMIT_NPROC, 64, 64).map_err(|e| format!("rlimit nproc: {}", e))?;

    Ok(())
}

/// Detach every mount under the sandbox root. Errors are ignored; the
/// caller decides whether the remaining directory is a failure.
fn cleanup_sandbox(sandbox_root: &Path) {
    let lib_mount = sandbox_root.join(&LIBS[1..]);
    if lib_mount.exists() {
        let _ = umount2(&lib_mount, MntFlags::MNT_DETACH);
    }
    for mp in ["proc", "etc", "usr", "lib64", "lib", "bin"] {
        let path = sandbox_root.join(mp);
        if path.exists() {
            let _ = umount2(&path, MntFlags::MNT_DETACH);
        }
    }
    let dev_dir = sandbox_root.join("dev");
    if dev_dir.exists() {
        for dev in DEVICES {
            let dev_path = dev_dir.join(dev);
            if dev_path.exists() {
                let _ = umount2(&dev_path, MntFlags::MNT_DETACH);
            }
        }
    }
    let _ = umount2(sandbox_root, MntFlags::MNT_DETACH);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_template_uses_shared_language_dir() {
        let base = Path::new("/tmp/isolate-test");
        let kept = NamespaceSandbox::new(base, Language::Ruby, true, SandboxLimits::default());
        let fresh = NamespaceSandbox::new(base, Language::Ruby, false, SandboxLimits::default());

        assert_eq!(
            kept.template_dir.as_deref(),
            Some(Path::new("/tmp/isolate-test/templates/ruby"))
        );
        assert!(fresh.template_dir.is_none());
        assert_ne!(kept.root(), fresh.root());
        assert!(kept.root().starts_with(base));
    }

    #[test]
    fn run_before_open_is_rejected() {
        let base = Path::new("/tmp/isolate-test");
        let mut sandbox =
            NamespaceSandbox::new(base, Language::Python, false, SandboxLimits::default());
        assert!(matches!(sandbox.run("print(1)", &[]), Err(EnvironmentError::NotOpen)));
        assert!(sandbox.close().is_ok());
    }

    #[test]
    fn child_command_rejects_nul_bytes() {
        let config = RunConfig {
            command: vec!["python3".to_string(), "a\0b".to_string()],
            env: vec![],
            cwd: "/".to_string(),
        };
        assert!(ChildCommand::new(Path::new("/tmp"), &config).is_err());

        let empty = RunConfig {
            command: vec![],
            env: vec![],
            cwd: "/".to_string(),
        };
        assert!(ChildCommand::new(Path::new("/tmp"), &empty).is_err());
    }

    #[test]
    fn output_pipes_are_close_on_exec() {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};

        let (read, write) = output_pipe().unwrap();
        for fd in [&read, &write] {
            let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn toolchains_install_into_shared_lib_dir() {
        for language in [Language::Python, Language::JavaScript, Language::Ruby] {
            let toolchain = toolchain(language);
            assert!(toolchain.installer.contains(&LIBS));
            assert!(!toolchain.interpreter.is_empty());
        }
    }
}
