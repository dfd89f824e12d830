//! Scoped attachment of native threads to the host runtime.

use crate::host::HostRuntime;
use crate::logger::{self, BreadcrumbFlags};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachState {
    /// The thread was attached before this call.
    Attached,
    /// This call attached the thread.
    NewlyAttached,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DetachPolicy {
    /// Leave threads attached after the callback; engine workers are long-lived.
    #[default]
    KeepAttached,
    /// Detach threads this guard attached as soon as it drops.
    DetachOnExit,
}

impl DetachPolicy {
    pub fn from_flag(detach_after_callback: bool) -> Self {
        if detach_after_callback {
            Self::DetachOnExit
        } else {
            Self::KeepAttached
        }
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("host runtime refused to attach the current thread (status {0})")]
    Refused(i32),
}

/// Keeps the current thread attached for its lifetime. Dropping it detaches
/// only when the guard did the attaching and the policy asks for it.
pub struct AttachGuard<'a> {
    host: &'a dyn HostRuntime,
    detach_on_drop: bool,
}

impl<'a> AttachGuard<'a> {
    pub fn acquire(host: &'a dyn HostRuntime, policy: DetachPolicy) -> Result<Self, AttachError> {
        let state = host.attach_current_thread()?;
        let detach_on_drop =
            state == AttachState::NewlyAttached && policy == DetachPolicy::DetachOnExit;
        if state == AttachState::NewlyAttached {
            logger::breadcrumb(
                BreadcrumbFlags::ATTACH,
                format!(
                    "attached thread {:?} (detach_on_drop={detach_on_drop})",
                    std::thread::current().id()
                ),
            );
        }
        Ok(Self {
            host,
            detach_on_drop,
        })
    }
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        if self.detach_on_drop {
            self.host.detach_current_thread();
            logger::breadcrumb(
                BreadcrumbFlags::ATTACH,
                format!("detached thread {:?}", std::thread::current().id()),
            );
        }
    }
}

/// Runs `f` on a thread attached to the host runtime.
pub fn with_host_thread<R>(
    host: &dyn HostRuntime,
    policy: DetachPolicy,
    f: impl FnOnce() -> R,
) -> Result<R, AttachError> {
    let _guard = AttachGuard::acquire(host, policy)?;
    Ok(f())
}

#[cfg(test)]
mod tests;
