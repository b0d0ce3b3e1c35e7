//! Scale-down victim selection.

/// Deletion priority for instances on scale-down.
///
/// Lower values are deleted first. Instances serving a session have no
/// priority at all and are never selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeletionPriority {
    /// No state reported yet (delete first).
    Pending = 0,

    /// Process is starting up.
    Initializing = 1,

    /// Idle and allocatable (delete last).
    StandingBy = 2,
}

/// Select up to `count` instances to delete.
///
/// `get_priority` returns `None` for instances that must not be deleted.
/// Ordering within a priority follows the input order.
pub fn select_for_deletion<T, F>(instances: Vec<T>, count: usize, get_priority: F) -> Vec<T>
where
    F: Fn(&T) -> Option<DeletionPriority>,
{
    let mut eligible: Vec<_> = instances
        .into_iter()
        .filter_map(|i| get_priority(&i).map(|p| (p, i)))
        .collect();

    // stable, so input order is kept within a priority
    eligible.sort_by_key(|(p, _)| *p);
    eligible.into_iter().take(count).map(|(_, i)| i).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum State {
        Pending,
        Initializing,
        StandingBy,
        Active,
    }

    fn priority(s: &(&str, State)) -> Option<DeletionPriority> {
        match s.1 {
            State::Pending => Some(DeletionPriority::Pending),
            State::Initializing => Some(DeletionPriority::Initializing),
            State::StandingBy => Some(DeletionPriority::StandingBy),
            State::Active => None,
        }
    }

    #[test]
    fn test_pending_then_initializing_first() {
        let mut instances = Vec::new();
        for i in 0..4 {
            instances.push((["s0", "s1", "s2", "s3"][i], State::StandingBy));
        }
        for i in 0..4 {
            instances.push((["i0", "i1", "i2", "i3"][i], State::Initializing));
        }
        instances.push(("p0", State::Pending));
        instances.push(("p1", State::Pending));

        let picked: Vec<&str> = select_for_deletion(instances, 3, priority)
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(picked, vec!["p0", "p1", "i0"]);
    }

    #[test]
    fn test_active_never_selected() {
        let instances = vec![("a0", State::Active), ("a1", State::Active), ("s0", State::StandingBy)];
        let picked = select_for_deletion(instances, 3, priority);
        assert_eq!(picked, vec![("s0", State::StandingBy)]);
    }

    #[test]
    fn test_zero_count() {
        let instances = vec![("p0", State::Pending)];
        assert!(select_for_deletion(instances, 0, priority).is_empty());
    }
}
