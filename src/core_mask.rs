use std::{ fmt, str::FromStr };

use crate::error::CoreSetError;

/// Number of cores a [`CoreMask`] can address.
pub const MAX_CORES: usize = u64::BITS as usize;

/// A validated set of CPU cores, stored as a bitmask with bit `i` standing for core `i`.
///
/// Masks are built from a core count ([`CoreMask::with_count`]) or from a specification such as
/// `"0-3,8,10-11"` ([`CoreMask::parse`]). Equality and hashing only look at the bits, and the
/// [`Display`](fmt::Display) form is the decimal value of the mask read as a signed 64-bit
/// integer.
///
/// [`CoreMask::EMPTY`] has every bit set and means the caller did not ask for any restriction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreMask {
    bits: u64,
}

impl CoreMask {
    /// No restriction requested. Rosters built from it spread workers over every available core.
    ///
    /// A mask that selects all [`MAX_CORES`] cores has the same bits, so it is this value too.
    pub const EMPTY: CoreMask = CoreMask { bits: u64::MAX };

    /// The first `count` cores, starting at core 0.
    ///
    /// `with_count(64)` selects every bit and therefore equals [`CoreMask::EMPTY`], which rosters
    /// expand to the cores the process may use rather than to cores `0..64`.
    pub fn with_count(count: i64) -> Result<Self, CoreSetError> {
        if count <= 0 {
            return Err(CoreSetError::invalid(count.to_string(), "core count must be positive"));
        }
        if count as u64 > MAX_CORES as u64 {
            return Err(CoreSetError::OutOfRange { index: (count - 1) as u64, limit: MAX_CORES });
        }

        let bits = if count as usize == MAX_CORES { u64::MAX } else { (1u64 << count) - 1 };
        Ok(Self { bits })
    }

    /// A mask selecting only `core`.
    pub fn single(core: usize) -> Result<Self, CoreSetError> {
        if core >= MAX_CORES {
            return Err(CoreSetError::OutOfRange { index: core as u64, limit: MAX_CORES });
        }
        Ok(Self { bits: 1 << core })
    }

    /// Wraps raw mask bits. At least one bit must be set.
    pub fn from_bits(bits: u64) -> Result<Self, CoreSetError> {
        if bits == 0 {
            return Err(CoreSetError::invalid("0", "mask selects no cores"));
        }
        Ok(Self { bits })
    }

    /// Parses a comma-separated list of core indices and inclusive `low-high` ranges.
    ///
    /// Whitespace around tokens, commas and hyphens is ignored. Overlapping or repeated indices
    /// are accepted and collapse into the same bits.
    pub fn parse(spec: &str) -> Result<Self, CoreSetError> {
        if spec.trim().is_empty() {
            return Err(CoreSetError::invalid(spec, "specification is empty"));
        }

        let mut bits = 0u64;
        for token in spec.split(',') {
            let token = token.trim();
            if token.is_empty() {
                return Err(CoreSetError::invalid(spec, "empty entry in list"));
            }

            let (low, high) = match token.split_once('-') {
                Some((low, high)) => {
                    let low = parse_index(low, token)?;
                    let high = parse_index(high, token)?;
                    if low > high {
                        return Err(
                            CoreSetError::invalid(token, "range start exceeds range end")
                        );
                    }
                    (low, high)
                }
                None => {
                    let index = parse_index(token, token)?;
                    (index, index)
                }
            };

            if high >= MAX_CORES as u64 {
                return Err(CoreSetError::OutOfRange { index: high, limit: MAX_CORES });
            }
            for core in low..=high {
                bits |= 1u64 << core;
            }
        }

        Ok(Self { bits })
    }

    /// The mask as a signed 64-bit value; [`CoreMask::EMPTY`] is `-1`.
    pub fn mask(&self) -> i64 {
        self.bits as i64
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// Whether this is [`CoreMask::EMPTY`], i.e. no pinning was requested.
    pub fn is_unrestricted(&self) -> bool {
        self.bits == u64::MAX
    }

    pub fn contains(&self, core: usize) -> bool {
        core < MAX_CORES && self.bits & (1u64 << core) != 0
    }

    /// Number of selected cores.
    pub fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Selected core indices in ascending order.
    pub fn cores(&self) -> impl Iterator<Item = usize> {
        let mask = *self;
        (0..MAX_CORES).filter(move |&core| mask.contains(core))
    }

    /// Canonical list form, e.g. `"0-3,8"`. Parsing it yields an equal mask.
    pub fn to_spec(&self) -> String {
        let mut parts = Vec::new();
        let mut cores = self.cores().peekable();
        while let Some(start) = cores.next() {
            let mut end = start;
            while cores.peek() == Some(&(end + 1)) {
                end += 1;
                cores.next();
            }
            if start == end {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{}-{}", start, end));
            }
        }
        parts.join(",")
    }
}

fn parse_index(text: &str, token: &str) -> Result<u64, CoreSetError> {
    let text = text.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoreSetError::invalid(token, "expected a non-negative integer or a range"));
    }
    // All digits, so the only possible failure is overflow.
    text.parse::<u64>().map_err(|_| CoreSetError::OutOfRange {
        index: u64::MAX,
        limit: MAX_CORES,
    })
}

impl FromStr for CoreMask {
    type Err = CoreSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for CoreMask {
    type Error = CoreSetError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<i64> for CoreMask {
    type Error = CoreSetError;

    fn try_from(count: i64) -> Result<Self, Self::Error> {
        Self::with_count(count)
    }
}

impl fmt::Display for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mask())
    }
}

impl fmt::Debug for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unrestricted() {
            f.write_str("CoreMask(EMPTY)")
        } else {
            write!(f, "CoreMask({})", self.to_spec())
        }
    }
}
