use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// An unordered pair of participants.
///
/// Two pairs are equal when they hold the same two participants in either order. The pair still
/// remembers the order it was built in: `first` takes slot A of a new match and `second` slot B.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pair<T> {
    pub first: T,
    pub second: T,
}

impl<T> Pair<T>
where
    T: Ord + Copy,
{
    pub fn new(first: T, second: T) -> Self {
        Self { first, second }
    }

    /// Whether `participant` is one of the two sides.
    pub fn contains(&self, participant: T) -> bool {
        self.first == participant || self.second == participant
    }

    /// The two sides, smallest first.
    fn sorted(&self) -> (T, T) {
        if self.first <= self.second {
            (self.first, self.second)
        } else {
            (self.second, self.first)
        }
    }
}

impl<T> PartialEq for Pair<T>
where
    T: Ord + Copy,
{
    fn eq(&self, other: &Self) -> bool {
        self.sorted() == other.sorted()
    }
}

impl<T> Eq for Pair<T> where T: Ord + Copy {}

impl<T> Hash for Pair<T>
where
    T: Ord + Copy + Hash,
{
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sorted().hash(state);
    }
}

/// Every pairing of a round-robin group.
///
/// Yields each unordered pair `{participants[i], participants[j]}` with `i < j` exactly once, in
/// row-major order over `(i, j)`. The same input order always gives the same output order. Fewer
/// than two participants give no pairs.
pub fn round_robin_pairs<T>(participants: &[T]) -> Vec<Pair<T>>
where
    T: Ord + Copy,
{
    let n = participants.len();
    let mut pairs = Vec::with_capacity(n * n.saturating_sub(1) / 2);
    for (i, &first) in participants.iter().enumerate() {
        for &second in &participants[i + 1..] {
            pairs.push(Pair::new(first, second));
        }
    }
    pairs
}
