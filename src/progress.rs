// src/progress.rs

//! Byte progress estimation shared by the download and unpack phases

/// Progress of one package
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressItem {
    pub done: u64,
    /// Live total reported by the transport or archive, once known
    pub total: Option<u64>,
    /// Size declared up front, used until the live total is known
    pub estimate: Option<u64>,
}

impl ProgressItem {
    pub fn known_total(&self) -> Option<u64> {
        self.total.or(self.estimate)
    }
}

/// Sum of bytes done over all items
pub fn total_done(items: &[ProgressItem]) -> u64 {
    items.iter().map(|i| i.done).sum()
}

/// Estimated grand total
///
/// Items with a known total sum to T over K items; the remaining N - K
/// items are assumed to average the same, giving `T + T * (N - K) / K`.
/// With no known item the total is unknown.
pub fn estimate_total(items: &[ProgressItem]) -> Option<u64> {
    let count = items.len() as u64;
    let (known, total) = items
        .iter()
        .filter_map(ProgressItem::known_total)
        .fold((0u64, 0u64), |(k, t), size| (k + 1, t + size));

    if known == 0 {
        return None;
    }
    Some(total + total * (count - known) / known)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(done: u64, total: Option<u64>, estimate: Option<u64>) -> ProgressItem {
        ProgressItem {
            done,
            total,
            estimate,
        }
    }

    #[test]
    fn test_extrapolates_unknown_items() {
        // T = 300 over K = 2, N = 5: 300 + 300 * 3 / 2
        let items = [
            item(50, Some(100), None),
            item(0, Some(200), None),
            item(0, None, None),
            item(0, None, None),
            item(0, None, None),
        ];
        assert_eq!(estimate_total(&items), Some(750));
        assert_eq!(total_done(&items), 50);
    }

    #[test]
    fn test_estimate_stands_in_for_live_total() {
        let items = [item(0, None, Some(400)), item(0, Some(100), Some(999))];
        assert_eq!(estimate_total(&items), Some(500));
    }

    #[test]
    fn test_unknown_when_nothing_is_known() {
        assert_eq!(estimate_total(&[item(10, None, None)]), None);
        assert_eq!(estimate_total(&[]), None);
    }
}
