use std::time::Duration;

use tokio::process::Child;

use crate::port_alloc::PortLease;

/// Owning reference to a spawned node, used only to stop it.
pub trait NodeHandle: Send + 'static {
    fn pid(&self) -> Option<u32>;

    /// Signals the node to exit. Consumes the handle, so it can run once.
    fn terminate(self: Box<Self>);
}

/// A node running as a child process in its own process group.
///
/// The termination signal is sent at most once, and only while the child has
/// not been reaped yet, so the pid (and group id) cannot have been recycled.
/// Dropping an unterminated handle terminates the child.
#[derive(Debug)]
pub struct ChildNode {
    child: Option<Child>,
    pid: Option<u32>,
    lease: Option<PortLease>,
    grace: Duration,
}

impl ChildNode {
    pub fn new(child: Child, lease: Option<PortLease>, grace: Duration) -> Self {
        let pid = child.id();
        Self {
            child: Some(child),
            pid,
            lease,
            grace,
        }
    }

    /// Non-blocking exit check, used while waiting for the node to come up.
    pub fn exit_status(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("wait failed: {e}")),
        }
    }

    fn shutdown(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let lease = self.lease.take();

        if let Ok(Some(_)) = child.try_wait() {
            // Already reaped: nothing to signal.
            return;
        }

        match self.pid {
            Some(pid) => signal_group(pid, Signal::Term),
            None => {
                let _ = child.start_kill();
            }
        }

        let grace = self.grace;
        let pid = self.pid;
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if tokio::time::timeout(grace, child.wait()).await.is_err() {
                        tracing::warn!(?pid, "node ignored SIGTERM, sending SIGKILL");
                        match pid {
                            Some(pid) => signal_group(pid, Signal::Kill),
                            None => {
                                let _ = child.start_kill();
                            }
                        }
                        let _ = child.wait().await;
                    }
                    drop(lease);
                });
            }
            Err(_) => {
                // No runtime to reap on; `Child` is reaped by tokio's orphan queue.
                drop(lease);
            }
        }
    }
}

impl NodeHandle for ChildNode {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(mut self: Box<Self>) {
        self.shutdown();
    }
}

impl Drop for ChildNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone, Copy, Debug)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: Signal) {
    let signo = match sig {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child called setsid(), so its pid is also its process group id.
    unsafe {
        libc::kill(-(pid as i32), signo);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _sig: Signal) {}
