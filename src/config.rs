use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

/// Default interval of the sbatchd maintenance timer.
pub const DEFAULT_TIMER_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for one sbatchd instance.
#[derive(Debug, Clone)]
pub struct SbdConfig {
    /// Root of the shared LavaLite tree (`LSB_SHAREDIR`)
    pub sharedir: PathBuf,
    /// Address of the local client listener (`LSB_SBD_PORT`)
    pub listen_addr: SocketAddr,
    /// mbatchd address in `host:port` form
    pub mbd_addr: String,
    /// Name this daemon registers with
    pub hostname: String,
    /// Single-user debug mode: jobs run as the daemon's own user
    pub debug: bool,
    /// Period of the maintenance timer (reap, resend, rusage)
    pub timer_interval: Duration,
    /// Descriptors the forked child closes before running the job
    pub close_fds: Vec<RawFd>,
}

impl Default for SbdConfig {
    fn default() -> Self {
        Self {
            sharedir: PathBuf::from("/var/lib/lavalite"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 6882)),
            mbd_addr: "127.0.0.1:6881".to_string(),
            hostname: "localhost".to_string(),
            debug: false,
            timer_interval: DEFAULT_TIMER_INTERVAL,
            close_fds: Vec::new(),
        }
    }
}

impl SbdConfig {
    pub fn new(sharedir: impl Into<PathBuf>) -> Self {
        Self {
            sharedir: sharedir.into(),
            ..Default::default()
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_mbd_addr(mut self, addr: impl Into<String>) -> Self {
        self.mbd_addr = addr.into();
        self
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_timer_interval(mut self, interval: Duration) -> Self {
        self.timer_interval = interval;
        self
    }

    /// `<sharedir>/sbatchd`
    pub fn sbd_root(&self) -> PathBuf {
        self.sharedir.join("sbatchd")
    }

    /// Directory holding one durable record per job.
    pub fn state_dir(&self) -> PathBuf {
        self.sbd_root().join("state")
    }

    /// Directory holding the materialized job scripts.
    pub fn jfiles_dir(&self) -> PathBuf {
        self.sbd_root().join("jfiles")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbd_config_default() {
        let cfg = SbdConfig::default();
        assert_eq!(cfg.sharedir, PathBuf::from("/var/lib/lavalite"));
        assert_eq!(cfg.listen_addr.port(), 6882);
        assert_eq!(cfg.timer_interval, Duration::from_secs(30));
        assert!(!cfg.debug);
        assert!(cfg.close_fds.is_empty());
    }

    #[test]
    fn sbd_config_dirs() {
        let cfg = SbdConfig::new("/share");
        assert_eq!(cfg.sbd_root(), PathBuf::from("/share/sbatchd"));
        assert_eq!(cfg.state_dir(), PathBuf::from("/share/sbatchd/state"));
        assert_eq!(cfg.jfiles_dir(), PathBuf::from("/share/sbatchd/jfiles"));
    }

    #[test]
    fn sbd_config_builders() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let cfg = SbdConfig::new("/share")
            .with_debug(true)
            .with_mbd_addr("master:6881")
            .with_listen_addr(addr)
            .with_hostname("node01")
            .with_timer_interval(Duration::from_millis(100));
        assert!(cfg.debug);
        assert_eq!(cfg.mbd_addr, "master:6881");
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.hostname, "node01");
        assert_eq!(cfg.timer_interval, Duration::from_millis(100));
    }
}
