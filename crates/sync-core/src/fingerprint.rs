//! Device fingerprinting from stable host signals.
//!
//! The fingerprint binds the encrypted credential blob to one installation.
//! It is not a secret: anyone on the device can recompute it. Its only job
//! is to make the blob unreadable when copied to a different machine or
//! profile, which forces the re-enter-password unlock flow there.

use sha2::{Digest, Sha256};

/// Compute the fingerprint for the current installation, as lowercase hex.
///
/// Signals are chosen to be stable across process restarts but differ
/// between machines and OS users. A changed signal (new machine, renamed
/// host) invalidates stored credentials by design.
pub fn device_fingerprint() -> String {
    fingerprint_from_signals(&collect_signals())
}

pub(crate) fn fingerprint_from_signals(signals: &[String]) -> String {
    let mut hasher = Sha256::new();
    for signal in signals {
        hasher.update(signal.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn collect_signals() -> Vec<String> {
    let mut signals = vec![
        format!("os:{}", std::env::consts::OS),
        format!("arch:{}", std::env::consts::ARCH),
        format!("host:{}", hostname()),
        format!("user:{}", username()),
    ];
    if let Some(id) = machine_id() {
        signals.push(format!("machine:{}", id));
    }
    signals
}

/// Best-effort hostname. Env vars cover Linux/macOS shells and Windows.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown-user".to_string())
}

/// Machine id where the platform provides one (systemd or dbus).
fn machine_id() -> Option<String> {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = device_fingerprint();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_stable_within_process() {
        assert_eq!(device_fingerprint(), device_fingerprint());
    }

    #[test]
    fn test_different_signals_change_fingerprint() {
        let a = fingerprint_from_signals(&["os:linux".into(), "host:alpha".into()]);
        let b = fingerprint_from_signals(&["os:linux".into(), "host:beta".into()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_signal_boundaries_matter() {
        // "ab" + "c" must not collide with "a" + "bc"
        let a = fingerprint_from_signals(&["ab".into(), "c".into()]);
        let b = fingerprint_from_signals(&["a".into(), "bc".into()]);
        assert_ne!(a, b);
    }
}
