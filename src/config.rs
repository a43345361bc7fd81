//! Recognized configuration surface.
//!
//! The core does not parse config files; a host hands it key/value
//! pairs and only the keys below are understood. Everything else is
//! silently ignored.

/// Tuning for the pack read side.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// `core.packedGitLimit`: total bytes the window cache may pin.
    pub packed_git_limit: u64,
    /// `core.packedGitWindowSize`: bytes per window.
    pub packed_git_window_size: usize,
    /// `core.packedGitMMAP`: map windows instead of reading them.
    pub packed_git_mmap: bool,
    /// `core.deltaBaseCacheLimit`: byte cap on reconstructed bases.
    pub delta_base_cache_limit: usize,
    /// `core.packIndexVersion`: force an index version when set.
    pub pack_index_version: Option<u32>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            packed_git_limit: 10 * 1024 * 1024,
            packed_git_window_size: 8 * 1024,
            packed_git_mmap: false,
            delta_base_cache_limit: 10 * 1024 * 1024,
            pack_index_version: None,
        }
    }
}

/// Policy knobs for the receive side of a push.
#[derive(Clone, Debug, Default)]
pub struct ReceiveConfig {
    /// `receive.fsckObjects`
    pub fsck_objects: bool,
    /// `receive.denyDeletes`
    pub deny_deletes: bool,
    /// `receive.denyNonFastForwards`
    pub deny_non_fast_forwards: bool,
}

/// `daemon.<service>` switches.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub upload_pack: bool,
    pub receive_pack: bool,
    /// Serve repositories without a `git-daemon-export-ok` marker.
    pub export_all: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            upload_pack: true,
            receive_pack: false,
            export_all: false,
        }
    }
}

impl CoreConfig {
    /// Apply one recognized `core.*` pair; unknown keys are ignored.
    pub fn set(&mut self, key: &str, value: &str) {
        match key {
            "core.packedGitLimit" => {
                if let Some(v) = parse_size(value) {
                    self.packed_git_limit = v;
                }
            }
            "core.packedGitWindowSize" => {
                if let Some(v) = parse_size(value) {
                    self.packed_git_window_size = v as usize;
                }
            }
            "core.packedGitMMAP" => self.packed_git_mmap = parse_bool(value),
            "core.deltaBaseCacheLimit" => {
                if let Some(v) = parse_size(value) {
                    self.delta_base_cache_limit = v as usize;
                }
            }
            "core.packIndexVersion" => self.pack_index_version = value.parse().ok(),
            _ => {}
        }
    }
}

impl ReceiveConfig {
    pub fn set(&mut self, key: &str, value: &str) {
        match key {
            "receive.fsckObjects" => self.fsck_objects = parse_bool(value),
            "receive.denyDeletes" => self.deny_deletes = parse_bool(value),
            "receive.denyNonFastForwards" => self.deny_non_fast_forwards = parse_bool(value),
            _ => {}
        }
    }
}

impl DaemonConfig {
    pub fn set(&mut self, key: &str, value: &str) {
        match key {
            "daemon.uploadpack" => self.upload_pack = parse_bool(value),
            "daemon.receivepack" => self.receive_pack = parse_bool(value),
            _ => {}
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}

// Sizes accept the usual k/m/g suffixes.
fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, mul) = match value.as_bytes().last()? {
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * mul)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_core_keys_apply() {
        let mut config = CoreConfig::default();
        config.set("core.packedGitWindowSize", "64k");
        config.set("core.packedGitMMAP", "true");
        config.set("core.packIndexVersion", "2");
        config.set("core.somethingElse", "whatever");
        assert_eq!(config.packed_git_window_size, 64 * 1024);
        assert!(config.packed_git_mmap);
        assert_eq!(config.pack_index_version, Some(2));
    }

    #[test]
    fn receive_keys_apply() {
        let mut config = ReceiveConfig::default();
        config.set("receive.denyNonFastForwards", "yes");
        assert!(config.deny_non_fast_forwards);
        assert!(!config.deny_deletes);
    }
}
