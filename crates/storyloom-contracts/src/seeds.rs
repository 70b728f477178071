/// Sentinel asking the backend to pick its own seed.
pub const RANDOM_SEED: i64 = -1;

/// Distance between the seed ranges of consecutive scenes. Larger than any
/// realistic per-scene image count, so ranges never overlap.
pub const SCENE_STRIDE: i64 = 10_000;

/// Deterministic seed for one image of one scene.
///
/// Returns [`RANDOM_SEED`] for every call when `base_seed` is itself the
/// sentinel; seeds are then not reproducible across runs.
pub fn seed(base_seed: i64, scene_offset: usize, image_index: usize) -> i64 {
    match scene_origin(base_seed, scene_offset) {
        Some(origin) => origin.saturating_add(image_index as i64),
        None => RANDOM_SEED,
    }
}

/// First seed of a scene's range; `None` when seeds are left to the backend.
///
/// Only `base_seed` itself is compared with the sentinel. A derived origin
/// that happens to equal -1 is still a fixed seed.
pub fn scene_origin(base_seed: i64, scene_offset: usize) -> Option<i64> {
    if base_seed == RANDOM_SEED {
        return None;
    }
    Some(base_seed.saturating_add((scene_offset as i64).saturating_mul(SCENE_STRIDE)))
}
