//! # Runtime Configuration
//!
//! Tunables that affect how the backing file is grown and mapped, read once
//! from the environment when a file is opened. None of them are part of the
//! on-disk format, so two processes may open the same file with different
//! settings.
//!
//! | Variable                 | Meaning                                | Default |
//! |--------------------------|----------------------------------------|---------|
//! | `ULAYFS_GROW_UNIT_SHIFT` | log2 of the file growth quantum        | 21 (2 MiB) |
//! | `ULAYFS_PREALLOC_BLOCKS` | initial size of a fresh file, in blocks| one grow unit |
//! | `ULAYFS_HUGEPAGE`        | map with 2 MiB huge pages (`1`/`true`) | off |

pub mod constants;

pub use constants::*;

/// Growth and mapping tunables for one opened file.
#[derive(Debug, Clone)]
pub struct Config {
    /// log2 of the growth quantum in bytes. Clamped to `[16, 30]` so a grow
    /// unit is always a whole number of blocks and mappings stay reasonable.
    pub grow_unit_shift: u32,
    /// Initial size of a freshly created file, in blocks. Rounded up to a
    /// whole grow unit.
    pub prealloc_blocks: u32,
    /// Map grow units with `MAP_HUGETLB` (2 MiB pages).
    pub use_hugepage: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(shift) = env_u32("ULAYFS_GROW_UNIT_SHIFT") {
            cfg.grow_unit_shift = shift.clamp(16, 30);
        }
        if let Some(blocks) = env_u32("ULAYFS_PREALLOC_BLOCKS") {
            cfg.prealloc_blocks = blocks;
        }
        if let Ok(v) = std::env::var("ULAYFS_HUGEPAGE") {
            cfg.use_hugepage = matches!(v.as_str(), "1" | "true" | "yes" | "on");
        }

        // a fresh file must hold at least one whole grow unit
        cfg.prealloc_blocks = cfg
            .prealloc_blocks
            .max(cfg.grow_unit_blocks())
            .next_multiple_of(cfg.grow_unit_blocks());
        cfg
    }

    /// Bytes in one grow unit.
    pub fn grow_unit_bytes(&self) -> u64 {
        1u64 << self.grow_unit_shift
    }

    /// Blocks in one grow unit.
    pub fn grow_unit_blocks(&self) -> u32 {
        1u32 << (self.grow_unit_shift - BLOCK_SHIFT)
    }

    /// First block of the grow unit containing `lidx`.
    pub fn grow_unit_base(&self, lidx: u32) -> u32 {
        lidx & !(self.grow_unit_blocks() - 1)
    }

    /// Block count after growing to cover `lidx`, i.e. the end of its unit.
    pub fn grow_target_blocks(&self, lidx: u32) -> u32 {
        let shift = self.grow_unit_shift - BLOCK_SHIFT;
        ((lidx >> shift) + 1) << shift
    }
}

impl Default for Config {
    fn default() -> Self {
        let grow_unit_shift = DEFAULT_GROW_UNIT_SHIFT;
        Self {
            grow_unit_shift,
            prealloc_blocks: 1 << (grow_unit_shift - BLOCK_SHIFT),
            use_hugepage: false,
        }
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grow_unit_is_2mib() {
        let cfg = Config::default();

        assert_eq!(cfg.grow_unit_bytes(), 2 * 1024 * 1024);
        assert_eq!(cfg.grow_unit_blocks(), 512);
        assert_eq!(cfg.prealloc_blocks, 512);
    }

    #[test]
    fn grow_unit_base_masks_low_bits() {
        let cfg = Config::default();

        assert_eq!(cfg.grow_unit_base(0), 0);
        assert_eq!(cfg.grow_unit_base(511), 0);
        assert_eq!(cfg.grow_unit_base(512), 512);
        assert_eq!(cfg.grow_unit_base(1300), 1024);
    }

    #[test]
    fn grow_target_covers_requested_block() {
        let cfg = Config::default();

        assert_eq!(cfg.grow_target_blocks(0), 512);
        assert_eq!(cfg.grow_target_blocks(511), 512);
        assert_eq!(cfg.grow_target_blocks(512), 1024);
    }
}
