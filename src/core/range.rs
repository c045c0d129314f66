use super::{Encoding, Result};
use std::ops::Bound;

/// A resolved, encoded key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Bound<Vec<u8>>,
    pub upper: Bound<Vec<u8>>,
}

impl KeyRange {
    pub fn full() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// `[start, end)`
    pub fn half_open(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            lower: Bound::Included(start.into()),
            upper: Bound::Excluded(end.into()),
        }
    }

    pub fn prefix(prefix: &[u8]) -> Self {
        if prefix.is_empty() {
            return Self::full();
        }
        Self {
            lower: Bound::Included(prefix.to_vec()),
            upper: prefix_upper_bound(prefix),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let above = match &self.lower {
            Bound::Included(k) => key >= k.as_slice(),
            Bound::Excluded(k) => key > k.as_slice(),
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(k) => key <= k.as_slice(),
            Bound::Excluded(k) => key < k.as_slice(),
            Bound::Unbounded => true,
        };
        above && below
    }

    /// True when no key can fall inside the range.
    pub fn is_empty(&self) -> bool {
        match (bound_key(&self.lower), bound_key(&self.upper)) {
            (Some(lo), Some(hi)) => {
                lo > hi
                    || (lo == hi
                        && !(matches!(self.lower, Bound::Included(_))
                            && matches!(self.upper, Bound::Included(_))))
            }
            _ => false,
        }
    }

    /// The part of the range still ahead of `key` in traversal order.
    pub fn after(&self, key: &[u8], reverse: bool) -> Self {
        let cut = Bound::Excluded(key.to_vec());
        if reverse {
            Self {
                lower: self.lower.clone(),
                upper: tighter_upper(self.upper.clone(), cut),
            }
        } else {
            Self {
                lower: tighter_lower(self.lower.clone(), cut),
                upper: self.upper.clone(),
            }
        }
    }

    /// Narrow the far end of the range to `key` (inclusive).
    pub fn until(&self, key: &[u8], reverse: bool) -> Self {
        let cut = Bound::Included(key.to_vec());
        if reverse {
            Self {
                lower: tighter_lower(self.lower.clone(), cut),
                upper: self.upper.clone(),
            }
        } else {
            Self {
                lower: self.lower.clone(),
                upper: tighter_upper(self.upper.clone(), cut),
            }
        }
    }

    /// Borrowed bounds usable with `BTreeMap::range`. Check `is_empty` first.
    pub fn as_slices(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        (
            self.lower.as_ref().map(|k| k.as_slice()),
            self.upper.as_ref().map(|k| k.as_slice()),
        )
    }
}

/// Smallest key greater than every key starting with `prefix`.
///
/// Trailing `0xff` bytes cannot be incremented and are dropped; a prefix made
/// only of `0xff` bytes has no upper bound.
pub fn prefix_upper_bound(prefix: &[u8]) -> Bound<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Bound::Excluded(end);
        }
    }
    Bound::Unbounded
}

fn bound_key(bound: &Bound<Vec<u8>>) -> Option<&[u8]> {
    match bound {
        Bound::Included(k) | Bound::Excluded(k) => Some(k.as_slice()),
        Bound::Unbounded => None,
    }
}

fn tighter_lower(a: Bound<Vec<u8>>, b: Bound<Vec<u8>>) -> Bound<Vec<u8>> {
    match (bound_key(&a), bound_key(&b)) {
        (None, _) => b,
        (_, None) => a,
        (Some(ka), Some(kb)) if ka > kb => a,
        (Some(ka), Some(kb)) if ka < kb => b,
        _ => {
            if matches!(a, Bound::Excluded(_)) {
                a
            } else {
                b
            }
        }
    }
}

fn tighter_upper(a: Bound<Vec<u8>>, b: Bound<Vec<u8>>) -> Bound<Vec<u8>> {
    match (bound_key(&a), bound_key(&b)) {
        (None, _) => b,
        (_, None) => a,
        (Some(ka), Some(kb)) if ka < kb => a,
        (Some(ka), Some(kb)) if ka > kb => b,
        _ => {
            if matches!(a, Bound::Excluded(_)) {
                a
            } else {
                b
            }
        }
    }
}

/// Caller-facing range and traversal options.
///
/// When several bounds are given for the same side (`gt` and `gte`, or a
/// `prefix` plus an explicit bound) the tighter one wins: the bound that
/// admits fewer keys, and for equal keys the exclusive one.
#[derive(Debug, Clone, Default)]
pub struct RangeOptions {
    pub gt: Option<Vec<u8>>,
    pub gte: Option<Vec<u8>>,
    pub lt: Option<Vec<u8>>,
    pub lte: Option<Vec<u8>>,
    pub prefix: Option<Vec<u8>>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl RangeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gt(mut self, key: impl AsRef<[u8]>) -> Self {
        self.gt = Some(key.as_ref().to_vec());
        self
    }

    pub fn gte(mut self, key: impl AsRef<[u8]>) -> Self {
        self.gte = Some(key.as_ref().to_vec());
        self
    }

    pub fn lt(mut self, key: impl AsRef<[u8]>) -> Self {
        self.lt = Some(key.as_ref().to_vec());
        self
    }

    pub fn lte(mut self, key: impl AsRef<[u8]>) -> Self {
        self.lte = Some(key.as_ref().to_vec());
        self
    }

    pub fn prefix(mut self, prefix: impl AsRef<[u8]>) -> Self {
        self.prefix = Some(prefix.as_ref().to_vec());
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Encode every bound with `encoding` and combine them into one range.
    pub fn resolve(&self, encoding: Encoding) -> Result<KeyRange> {
        let mut range = match &self.prefix {
            Some(prefix) => KeyRange::prefix(&encoding.encode(prefix)?),
            None => KeyRange::full(),
        };

        if let Some(key) = &self.gte {
            range.lower = tighter_lower(range.lower, Bound::Included(encoding.encode(key)?));
        }
        if let Some(key) = &self.gt {
            range.lower = tighter_lower(range.lower, Bound::Excluded(encoding.encode(key)?));
        }
        if let Some(key) = &self.lte {
            range.upper = tighter_upper(range.upper, Bound::Included(encoding.encode(key)?));
        }
        if let Some(key) = &self.lt {
            range.upper = tighter_upper(range.upper, Bound::Excluded(encoding.encode(key)?));
        }

        Ok(range)
    }
}
