//! The real runner: a forked child process driven over shared memory.
//!
//! The scheduler process owns a POSIX shared-memory region mapped at the
//! same fixed address in every process. The checked program is launched
//! once as a *template process* (its intercept library parks in a fork
//! loop before `main`); each execution of the program is a fresh fork of
//! that template, so static initializers run only once. Rendezvous with
//! individual runner threads goes through one semaphore pair per thread.
//!
//! After backtracking, the engine cannot rewind the child's address
//! space; it kills the child with SIGUSR1 and forks a new one, replaying
//! the recorded prefix thread by thread.

use crate::{Runner, RunnerError};
use log::{debug, warn};
use mcmini_model::Tid;
use mcmini_protocol::{
    shared_region_name, Descriptor, SharedRegion, ENV_TEMPLATE_LOOP, MAX_THREADS,
    SHARED_REGION_ADDR, SHARED_REGION_SIZE, TEMPLATE_FORK_FAILED,
};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::ffi::CString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::ptr::NonNull;

/// How to launch the program under test.
#[derive(Debug, Clone)]
pub struct ForkedRunnerConfig {
    /// Path to the target executable.
    pub program: PathBuf,
    /// Arguments passed to the target.
    pub args: Vec<String>,
    /// Intercept library to preload into the target, if not already
    /// linked in.
    pub preload: Option<PathBuf>,
}

/// A [`Runner`] whose execution lives in a forked child of a template
/// process, rendezvousing through the shared region.
pub struct ForkedRunner {
    config: ForkedRunnerConfig,
    region: NonNull<SharedRegion>,
    shm_name: String,
    template: Option<Child>,
    child: Option<Pid>,
}

impl ForkedRunner {
    /// Create the shared region and launch the template process.
    pub fn new(config: ForkedRunnerConfig) -> Result<Self, RunnerError> {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
        let shm_name = shared_region_name(&user, std::process::id());
        let region = map_shared_region(&shm_name)?;

        // Every semaphore starts at zero: threads park until scheduled.
        unsafe {
            let r = region.as_ptr();
            for i in 0..MAX_THREADS {
                sem_init(&mut (*r).rendezvous[i].runner_wakeup)?;
                sem_init(&mut (*r).rendezvous[i].scheduler_wakeup)?;
            }
            sem_init(&mut (*r).template.libmcmini_sem)?;
            sem_init(&mut (*r).template.mcmini_process_sem)?;
            (*r).template.cpid = 0;
        }

        let mut command = Command::new(&config.program);
        command.args(&config.args).env(ENV_TEMPLATE_LOOP, "1");
        if let Some(preload) = &config.preload {
            command.env("LD_PRELOAD", preload);
        }
        let template = command.spawn()?;
        debug!(
            "template process {} running {:?}",
            template.id(),
            config.program
        );

        Ok(Self {
            config,
            region,
            shm_name,
            template: Some(template),
            child: None,
        })
    }

    fn region(&self) -> *mut SharedRegion {
        self.region.as_ptr()
    }

    pub fn config(&self) -> &ForkedRunnerConfig {
        &self.config
    }

    /// Ask the template loop for a fresh child process.
    fn fork_from_template(&mut self) -> Result<Pid, RunnerError> {
        unsafe {
            let r = self.region();
            sem_post(&mut (*r).template.libmcmini_sem)?;
            sem_wait(&mut (*r).template.mcmini_process_sem)?;
            let cpid = (*r).template.cpid;
            if cpid == TEMPLATE_FORK_FAILED {
                return Err(RunnerError::TemplateForkFailed);
            }
            Ok(Pid::from_raw(cpid))
        }
    }

    /// Re-arm every rendezvous semaphore before a new execution.
    fn reset_rendezvous(&mut self) -> Result<(), RunnerError> {
        unsafe {
            let r = self.region();
            for i in 0..MAX_THREADS {
                sem_destroy(&mut (*r).rendezvous[i].runner_wakeup);
                sem_destroy(&mut (*r).rendezvous[i].scheduler_wakeup);
                sem_init(&mut (*r).rendezvous[i].runner_wakeup)?;
                sem_init(&mut (*r).rendezvous[i].scheduler_wakeup)?;
            }
        }
        Ok(())
    }
}

impl Runner for ForkedRunner {
    fn start(&mut self) -> Result<(), RunnerError> {
        self.kill();
        self.reset_rendezvous()?;
        let child = self.fork_from_template()?;
        debug!("checked process forked as {child}");
        self.child = Some(child);
        Ok(())
    }

    fn advance(&mut self, tid: Tid) -> Result<Descriptor, RunnerError> {
        if self.child.is_none() {
            return Err(RunnerError::NotStarted);
        }
        let descriptor = unsafe {
            let r = self.region();
            sem_post(&mut (*r).rendezvous[tid as usize].runner_wakeup)?;
            sem_wait(&mut (*r).rendezvous[tid as usize].scheduler_wakeup)?;
            Descriptor::decode(&(*r).descriptor)?
        };
        if descriptor.executor != tid {
            return Err(RunnerError::WrongExecutor {
                expected: tid,
                got: descriptor.executor,
            });
        }
        Ok(descriptor)
    }

    fn release(&mut self, tid: Tid) -> Result<(), RunnerError> {
        if self.child.is_none() {
            return Err(RunnerError::NotStarted);
        }
        unsafe {
            let r = self.region();
            sem_post(&mut (*r).rendezvous[tid as usize].runner_wakeup)?;
        }
        Ok(())
    }

    fn kill(&mut self) {
        let Some(child) = self.child.take() else {
            return;
        };
        if let Err(e) = kill(child, Signal::SIGUSR1) {
            warn!("failed to signal checked process {child}: {e}");
        }
        if let Err(e) = waitpid(child, None) {
            warn!("failed to reap checked process {child}: {e}");
        }
    }
}

impl Drop for ForkedRunner {
    fn drop(&mut self) {
        self.kill();
        if let Some(mut template) = self.template.take() {
            let pid = Pid::from_raw(template.id() as i32);
            let _ = kill(pid, Signal::SIGUSR1);
            let _ = template.wait();
        }
        unsafe {
            libc::munmap(self.region() as *mut libc::c_void, SHARED_REGION_SIZE);
        }
        if let Ok(name) = CString::new(self.shm_name.clone()) {
            unsafe {
                libc::shm_unlink(name.as_ptr());
            }
        }
    }
}

/// Create (or reopen) and map the shared region at its fixed address.
fn map_shared_region(name: &str) -> Result<NonNull<SharedRegion>, RunnerError> {
    let c_name = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    unsafe {
        let fd = libc::shm_open(
            c_name.as_ptr(),
            libc::O_CREAT | libc::O_RDWR,
            (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
        );
        if fd == -1 {
            return Err(io::Error::last_os_error().into());
        }
        if libc::ftruncate(fd, SHARED_REGION_SIZE as libc::off_t) == -1 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(e.into());
        }
        let addr = libc::mmap(
            SHARED_REGION_ADDR as *mut libc::c_void,
            SHARED_REGION_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            0,
        );
        libc::close(fd);
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        NonNull::new(addr as *mut SharedRegion)
            .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable).into())
    }
}

fn sem_init(sem: *mut libc::sem_t) -> io::Result<()> {
    if unsafe { libc::sem_init(sem, 1, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sem_destroy(sem: *mut libc::sem_t) {
    unsafe {
        libc::sem_destroy(sem);
    }
}

fn sem_post(sem: *mut libc::sem_t) -> io::Result<()> {
    if unsafe { libc::sem_post(sem) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sem_wait(sem: *mut libc::sem_t) -> io::Result<()> {
    loop {
        if unsafe { libc::sem_wait(sem) } == 0 {
            return Ok(());
        }
        let e = io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::EINTR) {
            return Err(e);
        }
    }
}

/// Child-side helpers for intercept shims.
///
/// A shim fills the descriptor slot, posts the scheduler, and waits to
/// be scheduled; only then does it invoke the real primitive. These are
/// the entire contract between the checker and the intercept library.
pub mod shim {
    use super::{sem_post, sem_wait};
    use mcmini_protocol::{SharedRegion, WireOp, TEMPLATE_FORK_FAILED};
    use std::io;

    /// Park before the thread's very first visible operation. No
    /// descriptor is written and the scheduler is not notified; the
    /// engine synthesizes the start transition itself.
    pub fn await_first_schedule(region: *mut SharedRegion, tid: u32) -> io::Result<()> {
        unsafe { sem_wait(&mut (*region).rendezvous[tid as usize].runner_wakeup) }
    }

    /// Announce the operation the thread is about to perform, then park
    /// until the scheduler allows it to proceed.
    pub fn notify_and_wait(region: *mut SharedRegion, tid: u32, op: WireOp) -> io::Result<()> {
        unsafe {
            op.encode(tid, &mut (*region).descriptor);
            sem_post(&mut (*region).rendezvous[tid as usize].scheduler_wakeup)?;
            sem_wait(&mut (*region).rendezvous[tid as usize].runner_wakeup)
        }
    }

    /// Announce a thread-ending operation and park. When the scheduler
    /// releases the thread it simply continues into its real exit path.
    pub fn notify_and_wait_for_end(
        region: *mut SharedRegion,
        tid: u32,
        op: WireOp,
    ) -> io::Result<()> {
        notify_and_wait(region, tid, op)
    }

    /// The template-process loop: wait for a fork request, fork,
    /// publish the child pid, repeat. Returns only in the forked child.
    pub fn template_loop(region: *mut SharedRegion) -> io::Result<()> {
        unsafe {
            loop {
                sem_wait(&mut (*region).template.libmcmini_sem)?;
                let pid = libc::fork();
                if pid < 0 {
                    (*region).template.cpid = TEMPLATE_FORK_FAILED;
                } else if pid == 0 {
                    install_sigusr1_exit();
                    return Ok(());
                } else {
                    (*region).template.cpid = pid;
                }
                sem_post(&mut (*region).template.mcmini_process_sem)?;
            }
        }
    }

    extern "C" fn exit_on_sigusr1(_: libc::c_int) {
        unsafe { libc::_exit(0) }
    }

    /// Arrange for SIGUSR1 to tear the process down immediately,
    /// bypassing atexit handlers that would park on a rendezvous.
    pub fn install_sigusr1_exit() {
        unsafe {
            libc::signal(libc::SIGUSR1, exit_on_sigusr1 as libc::sighandler_t);
        }
    }

    /// Disable address-space randomization so descriptor-embedded
    /// addresses replay identically across forks.
    pub fn disable_aslr() -> io::Result<()> {
        if unsafe { libc::personality(libc::ADDR_NO_RANDOMIZE as libc::c_ulong) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_carries_target_and_preload() {
        let config = ForkedRunnerConfig {
            program: PathBuf::from("/bin/true"),
            args: vec!["--flag".into()],
            preload: Some(PathBuf::from("/usr/lib/libmcmini.so")),
        };
        assert_eq!(config.program, PathBuf::from("/bin/true"));
        assert_eq!(config.args.len(), 1);
        assert!(config.preload.is_some());
    }
}
