use rand::Rng;
use std::time::Duration;

/// Generates a random election timeout in `[deadline, 1.5 * deadline)`
pub fn random_election_timeout(deadline: Duration) -> Duration {
    let base_ms = deadline.as_millis() as u64;
    let spread_ms = base_ms / 2;
    if spread_ms == 0 {
        return deadline;
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(base_ms + rng.gen_range(0..spread_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_within_range() {
        let deadline = Duration::from_millis(200);
        for _ in 0..1000 {
            let timeout = random_election_timeout(deadline);
            assert!(timeout >= Duration::from_millis(200));
            assert!(timeout < Duration::from_millis(300));
        }
    }

    #[test]
    fn test_tiny_deadline_is_returned_as_is() {
        let deadline = Duration::from_millis(1);
        assert_eq!(random_election_timeout(deadline), deadline);
    }
}
