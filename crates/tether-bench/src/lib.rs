//! Benchmark profiles for the Tether marshalling pipeline.
//!
//! - [`reference_config`]: 60 Hz fixed steps, interpolation on, inline stepping
//! - [`threaded_config`]: the same profile on the simulation thread
//! - [`grid_positions`]: deterministic spawn positions on a square grid

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use tether_core::Vec3;
use tether_engine::{BlockMode, InterpolationConfig, SolverConfig, ThreadingMode};

/// Fixed 1/60 s steps, one step of render delay, single-threaded.
pub fn reference_config() -> SolverConfig {
    SolverConfig {
        fixed_dt: Some(1.0 / 60.0),
        max_substeps: 4,
        interpolation: InterpolationConfig {
            delay_steps: 1.0,
            result_history: 4,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// [`reference_config`] on the simulation thread with the given block mode.
pub fn threaded_config(block_mode: BlockMode) -> SolverConfig {
    SolverConfig {
        threading: ThreadingMode::TaskThread,
        block_mode,
        ..reference_config()
    }
}

/// `count` positions on a square grid in the XZ plane, `spacing` apart.
pub fn grid_positions(count: usize, spacing: f32) -> Vec<Vec3> {
    let side = (count as f64).sqrt().ceil().max(1.0) as usize;
    (0..count)
        .map(|i| {
            let (row, col) = (i / side, i % side);
            Vec3::new(col as f32 * spacing, 0.0, row as f32 * spacing)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_validate() {
        assert!(reference_config().validate().is_ok());
        assert!(threaded_config(BlockMode::BlockOnSecondLatest)
            .validate()
            .is_ok());
    }

    #[test]
    fn grid_positions_are_distinct() {
        let positions = grid_positions(10, 2.0);
        assert_eq!(positions.len(), 10);
        assert_eq!(positions[5], Vec3::new(2.0, 0.0, 2.0));
        for (i, a) in positions.iter().enumerate() {
            assert!(positions[i + 1..].iter().all(|b| a != b));
        }
    }
}
