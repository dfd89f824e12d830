//! Launches the tunnel helper binary as a detached child process.
//!
//! `launch` returns as soon as the child exists. It never waits for or reaps
//! the child: the pid belongs to the caller, who terminates and reaps it with
//! [`terminate`], [`force_kill`] and [`poll_exit`], or hands it to a
//! [`HelperMonitor`].

mod monitor;

pub use monitor::{HelperDeath, HelperMonitor, DEFAULT_MONITOR_INTERVAL};

use crate::ffi::{self, BridgeHelperConfig};
use crate::logger::{self, BreadcrumbFlags};
use smallvec::SmallVec;
use std::ffi::{c_char, CString};
use std::io;
use std::ptr;
use thiserror::Error;

/// Exit status of a child whose `execv` failed.
pub const EXEC_FAILED_STATUS: i32 = 127;

/// Pid reported across the C boundary when the launch failed in the parent.
pub const LAUNCH_FAILED_PID: i32 = -1;

/// Largest argument vector `launch` builds; the pointer array adds one null.
const MAX_ARGS: usize = 15;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("helper binary path is empty")]
    EmptyBinaryPath,
    #[error("{0} contains an interior NUL byte")]
    InteriorNul(&'static str),
    #[error("fork failed: {0}")]
    Fork(#[source] io::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HelperConfig {
    pub binary_path: String,
    pub tun_fd: i32,
    pub address: String,
    pub netmask: String,
    pub socks_server: String,
    /// Empty disables the UDP gateway flag.
    pub udpgw_addr: String,
    /// Empty disables the DNS gateway flag.
    pub dnsgw_addr: String,
}

impl HelperConfig {
    /// Copies a C-side config. Returns `None` when a required string is null
    /// or not UTF-8; null gateways read as empty.
    ///
    /// # Safety
    /// Every non-null pointer in `raw` must reference a NUL-terminated string.
    pub unsafe fn from_ffi(raw: &BridgeHelperConfig) -> Option<Self> {
        let optional = |value: *const c_char| -> Option<String> {
            if value.is_null() {
                Some(String::new())
            } else {
                unsafe { ffi::borrow_str(value) }.map(str::to_owned)
            }
        };
        Some(Self {
            binary_path: unsafe { ffi::borrow_str(raw.binary_path) }?.to_owned(),
            tun_fd: raw.tun_fd,
            address: unsafe { ffi::borrow_str(raw.address) }?.to_owned(),
            netmask: unsafe { ffi::borrow_str(raw.netmask) }?.to_owned(),
            socks_server: unsafe { ffi::borrow_str(raw.socks_server) }?.to_owned(),
            udpgw_addr: optional(raw.udpgw_addr)?,
            dnsgw_addr: optional(raw.dnsgw_addr)?,
        })
    }

    /// Arguments after the program name, in the order the helper binary
    /// expects. Changing flag names or order breaks compatibility with it.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--tunfd".to_string(),
            self.tun_fd.to_string(),
            "--netif-ipaddr".to_string(),
            self.address.clone(),
            "--netif-netmask".to_string(),
            self.netmask.clone(),
            "--socks-server-addr".to_string(),
            self.socks_server.clone(),
        ];
        if !self.udpgw_addr.is_empty() {
            args.push("--udpgw-remote-server-addr".to_string());
            args.push(self.udpgw_addr.clone());
        }
        if !self.dnsgw_addr.is_empty() {
            args.push("--dnsgw".to_string());
            args.push(self.dnsgw_addr.clone());
        }
        args.push("--loglevel".to_string());
        args.push("notice".to_string());
        args
    }

    /// Full vector passed to `execv`: the binary path followed by [`Self::args`].
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(MAX_ARGS);
        argv.push(self.binary_path.clone());
        argv.extend(self.args());
        argv
    }

    fn validate(&self) -> Result<(), LaunchError> {
        if self.binary_path.is_empty() {
            return Err(LaunchError::EmptyBinaryPath);
        }
        let fields = [
            ("binary path", &self.binary_path),
            ("address", &self.address),
            ("netmask", &self.netmask),
            ("socks server", &self.socks_server),
            ("udpgw address", &self.udpgw_addr),
            ("dnsgw address", &self.dnsgw_addr),
        ];
        for (name, value) in fields {
            if value.contains('\0') {
                return Err(LaunchError::InteriorNul(name));
            }
        }
        Ok(())
    }
}

/// A launched helper: its pid and the argv it was started with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelperProcess {
    pid: libc::pid_t,
    argv: Vec<String>,
}

impl HelperProcess {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelperExit {
    Exited(i32),
    Signaled(i32),
}

impl HelperExit {
    pub fn is_exec_failure(self) -> bool {
        self == HelperExit::Exited(EXEC_FAILED_STATUS)
    }
}

/// Forks and execs the helper. Everything the child touches is allocated
/// before `fork`; the child only calls `execv` and `_exit`.
pub fn launch(config: &HelperConfig) -> Result<HelperProcess, LaunchError> {
    config.validate()?;
    let argv = config.argv();

    let c_args = argv
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<SmallVec<[CString; MAX_ARGS]>, _>>()
        .map_err(|_| LaunchError::InteriorNul("argument"))?;
    let mut pointers: SmallVec<[*const c_char; MAX_ARGS + 1]> =
        c_args.iter().map(|arg| arg.as_ptr()).collect();
    pointers.push(ptr::null());

    match unsafe { libc::fork() } {
        -1 => {
            let error = io::Error::last_os_error();
            logger::error(format!("helper fork failed: {error}"));
            Err(LaunchError::Fork(error))
        }
        0 => unsafe {
            libc::execv(pointers[0], pointers.as_ptr());
            // Skip atexit handlers and destructors: the runtime state in this
            // copy belongs to the parent.
            libc::_exit(EXEC_FAILED_STATUS)
        },
        pid => {
            logger::info(format!(
                "launched helper pid={pid}: {}",
                argv.join(" ")
            ));
            Ok(HelperProcess { pid, argv })
        }
    }
}

/// Asks the helper to exit (SIGTERM).
pub fn terminate(pid: libc::pid_t) -> io::Result<()> {
    signal(pid, libc::SIGTERM)
}

pub fn force_kill(pid: libc::pid_t) -> io::Result<()> {
    signal(pid, libc::SIGKILL)
}

fn signal(pid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    if pid <= 0 {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    if unsafe { libc::kill(pid, signal) } == 0 {
        logger::breadcrumb(
            BreadcrumbFlags::PROCESS,
            format!("sent signal {signal} to helper pid={pid}"),
        );
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Non-blocking exit check. Reaps the child only if it has already exited.
pub fn poll_exit(pid: libc::pid_t) -> io::Result<Option<HelperExit>> {
    if pid <= 0 {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    let mut status: libc::c_int = 0;
    match unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } {
        0 => Ok(None),
        -1 => Err(io::Error::last_os_error()),
        _ => {
            let exit = if libc::WIFSIGNALED(status) {
                HelperExit::Signaled(libc::WTERMSIG(status))
            } else {
                HelperExit::Exited(libc::WEXITSTATUS(status))
            };
            logger::breadcrumb(
                BreadcrumbFlags::PROCESS,
                format!("helper pid={pid} exited: {exit:?}"),
            );
            Ok(Some(exit))
        }
    }
}
