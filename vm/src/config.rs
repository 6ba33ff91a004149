use std::path::PathBuf;

/// Tunables for a VM instance.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Sends and backward jumps between interrupt checks.
    pub check_interval: u32,
    /// Allocations between automatic collections.
    pub gc_threshold: usize,
    /// Stop after this many bytecodes; 0 runs forever.
    pub max_bytecodes: u64,
    /// Answered by the screen size primitive.
    pub screen_size: (u32, u32),
    /// Target of the snapshot primitive. Snapshots fail without one.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            check_interval: 1000,
            gc_threshold: 250_000,
            max_bytecodes: 0,
            screen_size: (640, 480),
            snapshot_path: None,
        }
    }
}
