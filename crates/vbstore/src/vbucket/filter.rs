use std::fmt::{self, Display, Formatter};

use vbstore_types::VBucketId;

/// A set of vbucket ids used to select the vbuckets a replication connection
/// is interested in.
///
/// An empty filter accepts every vbucket.  The combinators below are plain set
/// operations, so a result that comes out empty also accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VBucketFilter {
    /// Sorted and free of duplicates.
    acceptable: Vec<VBucketId>,
}

impl VBucketFilter {
    /// A filter that accepts every vbucket.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(vbuckets: impl IntoIterator<Item = VBucketId>) -> Self {
        let mut acceptable: Vec<_> = vbuckets.into_iter().collect();
        acceptable.sort_unstable();
        acceptable.dedup();
        Self { acceptable }
    }

    pub fn accepts(&self, vbucket: VBucketId) -> bool {
        self.acceptable.is_empty() || self.acceptable.binary_search(&vbucket).is_ok()
    }

    /// Adds `vbucket` to the set.  Returns false if it was already there.
    pub fn add_vbucket(&mut self, vbucket: VBucketId) -> bool {
        match self.acceptable.binary_search(&vbucket) {
            Ok(_) => false,
            Err(index) => {
                self.acceptable.insert(index, vbucket);
                true
            }
        }
    }

    /// Returns the vbuckets in exactly one of `self` and `other`.
    pub fn filter_diff(&self, other: &Self) -> Self {
        let mut acceptable = Vec::new();
        let mut a = self.acceptable.iter().peekable();
        let mut b = other.acceptable.iter().peekable();
        loop {
            match (a.peek(), b.peek()) {
                (Some(&&x), Some(&&y)) if x < y => {
                    acceptable.push(x);
                    a.next();
                }
                (Some(&&x), Some(&&y)) if x > y => {
                    acceptable.push(y);
                    b.next();
                }
                (Some(_), Some(_)) => {
                    a.next();
                    b.next();
                }
                (Some(&&x), None) => {
                    acceptable.push(x);
                    a.next();
                }
                (None, Some(&&y)) => {
                    acceptable.push(y);
                    b.next();
                }
                (None, None) => break,
            }
        }
        Self { acceptable }
    }

    /// Returns the vbuckets in both `self` and `other`.
    pub fn filter_intersection(&self, other: &Self) -> Self {
        Self {
            acceptable: self
                .acceptable
                .iter()
                .copied()
                .filter(|vb| other.acceptable.binary_search(vb).is_ok())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.acceptable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acceptable.is_empty()
    }

    /// The explicitly listed vbuckets, in ascending order.
    pub fn as_slice(&self) -> &[VBucketId] {
        &self.acceptable
    }
}

impl FromIterator<VBucketId> for VBucketFilter {
    fn from_iter<I: IntoIterator<Item = VBucketId>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl Display for VBucketFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.acceptable.is_empty() {
            return f.write_str("{ empty }");
        }
        f.write_str("{ ")?;
        for (i, vb) in self.acceptable.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{vb}")?;
        }
        f.write_str(" }")
    }
}

#[cfg(test)]
mod test {
    use super::VBucketFilter;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use vbstore_types::VBucketId;

    #[test]
    fn empty_accepts_everything() {
        let filter = VBucketFilter::all();
        assert!(filter.is_empty());
        assert!(filter.accepts(0));
        assert!(filter.accepts(VBucketId::MAX));
        assert_eq!(filter.to_string(), "{ empty }");
    }

    #[test]
    fn explicit_set() {
        let mut filter = VBucketFilter::new([7, 3, 3, 1]);
        assert_eq!(filter.as_slice(), &[1, 3, 7]);
        assert!(filter.accepts(3));
        assert!(!filter.accepts(2));

        assert!(filter.add_vbucket(2));
        assert!(!filter.add_vbucket(7));
        assert!(filter.accepts(2));
        assert_eq!(filter.to_string(), "{ 1, 2, 3, 7 }");
    }

    #[test]
    fn combinators() {
        let a = VBucketFilter::new([1, 2, 3, 5]);
        let b = VBucketFilter::new([2, 4, 5, 6]);
        assert_eq!(a.filter_diff(&b).as_slice(), &[1, 3, 4, 6]);
        assert_eq!(a.filter_intersection(&b).as_slice(), &[2, 5]);

        // Disjoint intersection is empty, which accepts everything.
        let c = VBucketFilter::new([9]);
        assert!(a.filter_intersection(&c).accepts(100));
    }

    proptest! {
        #[test]
        fn combinators_match_set_operations(
            a in prop::collection::btree_set(0u16..64, 0..32),
            b in prop::collection::btree_set(0u16..64, 0..32),
        ) {
            let fa: VBucketFilter = a.iter().copied().collect();
            let fb: VBucketFilter = b.iter().copied().collect();

            let diff: Vec<_> = a.symmetric_difference(&b).copied().collect();
            let fdiff = fa.filter_diff(&fb);
            prop_assert_eq!(fdiff.as_slice(), diff.as_slice());

            let both: Vec<_> = a.intersection(&b).copied().collect();
            let fboth = fa.filter_intersection(&fb);
            prop_assert_eq!(fboth.as_slice(), both.as_slice());

            let union: BTreeSet<_> = a.union(&b).copied().collect();
            let mut grown = fa.clone();
            for vb in &b {
                grown.add_vbucket(*vb);
            }
            let union: Vec<_> = union.into_iter().collect();
            prop_assert_eq!(grown.as_slice(), union.as_slice());
        }
    }
}
