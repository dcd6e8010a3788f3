//! Socket activation.
//!
//! A service manager may open our listening sockets for us and pass
//! them down as consecutively numbered descriptors. It describes them
//! with two environment variables: `LISTEN_PID`, the pid the sockets
//! are intended for, and `LISTEN_FDS`, the number of descriptors.
use std::collections::HashMap;
use std::net::TcpListener;
use std::os::fd::{FromRawFd, RawFd};

/// The lowest inherited descriptor; fixed by the protocol
pub const LISTEN_FDS_START: RawFd = 3;

const LISTEN_PID: &str = "LISTEN_PID";
const LISTEN_FDS: &str = "LISTEN_FDS";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenFds {
    descriptors: Vec<RawFd>,
}

impl ListenFds {
    pub fn new(descriptors: Vec<RawFd>) -> Self {
        Self { descriptors }
    }

    /// Inspect the process environment. When the descriptors are meant
    /// for this process, the variables are removed so that any child
    /// we spawn doesn't believe it owns them too.
    pub fn from_environment() -> Self {
        let mut vars: HashMap<String, String> = [LISTEN_PID, LISTEN_FDS]
            .into_iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.to_string(), value)))
            .collect();

        let fds = Self::from_vars(&mut vars, LISTEN_FDS_START, std::process::id());

        for name in [LISTEN_PID, LISTEN_FDS] {
            if !vars.contains_key(name) && std::env::var_os(name).is_some() {
                std::env::remove_var(name);
            }
        }

        if !fds.is_empty() {
            tracing::debug!("inherited listening descriptors {:?}", fds.descriptors);
        }
        fds
    }

    /// Interpret `vars` as though it were the environment of process
    /// `pid`. The two variables are removed from `vars` if and only if
    /// they were consumed.
    pub fn from_vars(vars: &mut HashMap<String, String>, start: RawFd, pid: u32) -> Self {
        let Some(listen_pid) = vars.get(LISTEN_PID).and_then(|v| v.trim().parse::<u32>().ok())
        else {
            return Self::default();
        };
        if listen_pid != pid {
            return Self::default();
        }
        let Some(count) = vars.get(LISTEN_FDS).and_then(|v| v.trim().parse::<RawFd>().ok())
        else {
            return Self::default();
        };

        vars.remove(LISTEN_PID);
        vars.remove(LISTEN_FDS);
        Self::new((start..start.saturating_add(count.max(0))).collect())
    }

    pub fn descriptors(&self) -> &[RawFd] {
        &self.descriptors
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Take ownership of the inherited descriptors as TCP listeners.
    /// A second call yields nothing.
    pub fn take_tcp_listeners(&mut self) -> Vec<TcpListener> {
        std::mem::take(&mut self.descriptors)
            .into_iter()
            // SAFETY: the descriptors were handed to this process to
            // own, and are only ever taken once
            .map(|fd| unsafe { TcpListener::from_raw_fd(fd) })
            .collect()
    }
}
