//! Safety policies shared by the tool profiles.
//!
//! Path checks canonicalise before comparing so `..`, symlinks, and
//! platform prefixes cannot escape the allowed roots. Keys for the KV
//! store are validated before any filesystem call. The process-wide
//! latches (robot estop, rate rings, bridge token bucket) live on a
//! long-lived state value threaded through the dispatcher rather than in
//! globals.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Allowed filesystem roots for tool file access.
///
/// In sandbox builds there is a single fixed root; otherwise the process
/// working directory plus the conventional temp prefix.
pub struct PathPolicy {
    roots: Vec<PathBuf>,
    workspace: PathBuf,
}

impl PathPolicy {
    pub fn new(workspace: PathBuf, extra_roots: Vec<PathBuf>) -> Self {
        let mut roots = Vec::new();
        for root in std::iter::once(workspace.clone()).chain(extra_roots) {
            match root.canonicalize() {
                Ok(canonical) => roots.push(canonical),
                Err(e) => log::warn!("dropping unreadable root {}: {e}", root.display()),
            }
        }
        Self { roots, workspace }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn join_workspace(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace.join(p)
        }
    }

    fn check(&self, canonical: &Path, shown: &str) -> Result<(), String> {
        if self.roots.iter().any(|root| canonical.starts_with(root)) {
            Ok(())
        } else {
            Err(format!("Path not allowed: {shown}"))
        }
    }

    /// Resolve a path that must already exist.
    pub fn resolve_existing(&self, path: &str) -> Result<PathBuf, String> {
        let canonical = self
            .join_workspace(path)
            .canonicalize()
            .map_err(|e| format!("Cannot access {path}: {e}"))?;
        self.check(&canonical, path)?;
        Ok(canonical)
    }

    /// Resolve a path that may not exist yet (write case): canonicalise
    /// the nearest existing ancestor, rejoin the remaining components, and
    /// only then check. Missing parent directories are created after the
    /// check passes.
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, String> {
        let target = self.join_workspace(path);
        let mut existing = target.clone();
        let mut remainder = Vec::new();
        loop {
            if existing.exists() {
                break;
            }
            match existing.file_name() {
                Some(name) => remainder.push(name.to_os_string()),
                None => return Err(format!("Path not allowed: {path}")),
            }
            existing = match existing.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
        }
        let mut canonical = existing
            .canonicalize()
            .map_err(|e| format!("Cannot access {path}: {e}"))?;
        for component in remainder.iter().rev() {
            canonical.push(component);
        }
        self.check(&canonical, path)?;
        if let Some(parent) = canonical.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Cannot create {}: {e}", parent.display()))?;
        }
        Ok(canonical)
    }
}

/// Validate a KV store key: `[A-Za-z0-9_.-]{1,128}`, no `..`.
pub fn validate_kv_key(key: &str) -> Result<(), String> {
    if key.is_empty() || key.len() > 128 {
        return Err(format!("Invalid key length: {}", key.len()));
    }
    if key.contains("..") {
        return Err("Invalid key: '..' not allowed".to_string());
    }
    if let Some(bad) = key
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(format!("Invalid key character: {bad:?}"));
    }
    Ok(())
}

/// Fixed-slot ring of second-granular timestamps.
///
/// Allows at most `N` events per `window_secs`: an attempt is rejected
/// while the oldest recorded timestamp is still inside the window.
pub struct RateRing<const N: usize> {
    slots: [u64; N],
    idx: usize,
    window_secs: u64,
}

impl<const N: usize> RateRing<N> {
    pub fn new(window_secs: u64) -> Self {
        Self {
            slots: [0; N],
            idx: 0,
            window_secs,
        }
    }

    pub fn allow(&mut self, now_secs: u64) -> bool {
        let oldest = self.slots[self.idx];
        if oldest != 0 && now_secs.saturating_sub(oldest) < self.window_secs {
            return false;
        }
        self.slots[self.idx] = now_secs;
        self.idx = (self.idx + 1) % N;
        true
    }
}

/// Process-wide mutable latches, init at first use, reset on teardown.
pub struct SafetyState {
    estop: AtomicBool,
    /// Robot command rate: 10 per second.
    robot_ring: Mutex<RateRing<10>>,
    /// Bridge-delegated tool rate: 30 per minute, shared across tools.
    bridge_ring: Mutex<RateRing<30>>,
}

impl Default for SafetyState {
    fn default() -> Self {
        Self {
            estop: AtomicBool::new(false),
            robot_ring: Mutex::new(RateRing::new(1)),
            bridge_ring: Mutex::new(RateRing::new(60)),
        }
    }
}

impl SafetyState {
    pub fn estop_active(&self) -> bool {
        self.estop.load(Ordering::SeqCst)
    }

    pub fn set_estop(&self, active: bool) {
        self.estop.store(active, Ordering::SeqCst);
    }

    pub fn allow_robot_command(&self, now_secs: u64) -> bool {
        self.robot_ring
            .lock()
            .map(|mut ring| ring.allow(now_secs))
            .unwrap_or(false)
    }

    pub fn allow_bridge_call(&self, now_secs: u64) -> bool {
        self.bridge_ring
            .lock()
            .map(|mut ring| ring.allow(now_secs))
            .unwrap_or(false)
    }
}

pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_key_grammar() {
        assert!(validate_kv_key("sensor.living-room_1").is_ok());
        assert!(validate_kv_key(&"k".repeat(128)).is_ok());
        assert!(validate_kv_key("").is_err());
        assert!(validate_kv_key(&"k".repeat(129)).is_err());
        assert!(validate_kv_key("a/b").is_err());
        assert!(validate_kv_key("..").is_err());
        assert!(validate_kv_key("a..b").is_err());
        assert!(validate_kv_key("spaced key").is_err());
        assert!(validate_kv_key("emoji🦀").is_err());
    }

    #[test]
    fn rate_ring_caps_per_window() {
        let mut ring: RateRing<3> = RateRing::new(1);
        assert!(ring.allow(100));
        assert!(ring.allow(100));
        assert!(ring.allow(100));
        assert!(!ring.allow(100));
        // The next second frees all three slots one by one.
        assert!(ring.allow(101));
        assert!(ring.allow(101));
        assert!(ring.allow(101));
        assert!(!ring.allow(101));
        let mut ring: RateRing<3> = RateRing::new(60);
        assert!(ring.allow(1000));
        assert!(ring.allow(1001));
        assert!(ring.allow(1002));
        assert!(!ring.allow(1059));
        assert!(ring.allow(1061));
    }

    #[test]
    fn estop_latches_until_reset() {
        let safety = SafetyState::default();
        assert!(!safety.estop_active());
        safety.set_estop(true);
        assert!(safety.estop_active());
        assert!(safety.estop_active());
        safety.set_estop(false);
        assert!(!safety.estop_active());
    }

    #[test]
    fn path_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inside.txt"), "ok").unwrap();
        let policy = PathPolicy::new(dir.path().to_path_buf(), Vec::new());

        assert!(policy.resolve_existing("inside.txt").is_ok());
        let err = policy.resolve_existing("../../etc/passwd").unwrap_err();
        assert!(err.contains("Path not allowed"), "{err}");
        let err = policy.resolve_existing("/etc/passwd").unwrap_err();
        assert!(err.contains("Path not allowed"), "{err}");
    }

    #[test]
    fn write_resolution_rejoins_missing_components() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PathPolicy::new(dir.path().to_path_buf(), Vec::new());

        let target = policy.resolve_for_write("new/nested/file.txt").unwrap();
        assert!(target.starts_with(dir.path().canonicalize().unwrap()));
        // The check passed, so the parent now exists.
        assert!(target.parent().unwrap().is_dir());

        assert!(policy.resolve_for_write("../outside.txt").is_err());
        assert!(policy.resolve_for_write("ok/../../outside.txt").is_err());
    }

    #[test]
    fn symlink_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();
        let policy = PathPolicy::new(dir.path().to_path_buf(), Vec::new());
        assert!(policy.resolve_existing("link/secret").is_err());
    }
}
