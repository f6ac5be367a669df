use std::collections::BTreeSet;

/// Remembers the artifacts (file paths, secret keys or object names) of the
/// last successful write, so artifacts which are not written anymore can be
/// removed.
///
/// The state only changes in `commit`, a write which fails before that keeps
/// the previous set, and the next write computes the difference against it.
#[derive(Debug)]
pub struct Reconciler<T> {
    previous: BTreeSet<T>,
}

impl<T> Default for Reconciler<T> {
    fn default() -> Self {
        Reconciler {
            previous: BTreeSet::new(),
        }
    }
}

impl<T: Ord + Clone> Reconciler<T> {
    pub fn previous(&self) -> &BTreeSet<T> {
        &self.previous
    }

    /// Artifacts of the last write which are not in `current`.
    pub fn stale<'a>(&'a self, current: &'a BTreeSet<T>) -> impl Iterator<Item = &'a T> + 'a {
        self.previous.difference(current)
    }

    /// Replace the state with `current`. Stale artifacts which could not be
    /// deleted are kept too, so the deletion is retried by the next write.
    pub fn commit(&mut self, mut current: BTreeSet<T>, undeleted: impl IntoIterator<Item = T>) {
        current.extend(undeleted);
        self.previous = current;
    }
}
