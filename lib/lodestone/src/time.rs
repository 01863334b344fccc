use std::time::SystemTime;

/// Seconds since the unix epoch. Stamps operator-facing event records; every
/// data-path deadline uses monotonic `Instant`s instead.
#[inline]
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_secs_is_current_era() {
        // 2020-01-01 as a floor; monotonicity across two reads.
        let first = unix_secs();
        assert!(first > 1_577_836_800);
        assert!(unix_secs() >= first);
    }
}
