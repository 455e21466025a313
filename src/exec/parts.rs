use std::fmt;

/// How much is known about the total amount of work.
///
/// Variants are ordered from least to most certain, so the aggregate of
/// several estimates is their minimum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EstimateKind {
    /// Nothing is known beyond the parts seen so far.
    Unknown,
    /// `total` is an estimate; more parts may still appear.
    LowerBound,
    /// `known` is the final number of parts.
    Finalized,
}

/// Snapshot of progress counters.
///
/// Always satisfies `done <= known <= total`; for a finalized estimate
/// `total == known`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressParts {
    pub done: u64,
    pub known: u64,
    pub total: u64,
    pub kind: EstimateKind,
}

impl ProgressParts {
    pub fn new(done: u64, known: u64, total: u64, kind: EstimateKind) -> Self {
        Self {
            done,
            known,
            total,
            kind,
        }
        .normalised()
    }

    pub fn unknown(done: u64, known: u64) -> Self {
        Self::new(done, known, known, EstimateKind::Unknown)
    }

    pub fn estimated(done: u64, known: u64, total: u64) -> Self {
        Self::new(done, known, total, EstimateKind::LowerBound)
    }

    pub fn finalized(done: u64, known: u64) -> Self {
        Self::new(done, known, known, EstimateKind::Finalized)
    }

    /// Clamp the counters into a consistent shape.
    pub fn normalised(self) -> Self {
        let done = self.done.min(self.known);
        let total = match self.kind {
            EstimateKind::Finalized => self.known,
            _ => self.total.max(self.known),
        };
        Self {
            done,
            known: self.known,
            total,
            kind: self.kind,
        }
    }

    /// Add up parts from independent operations. The result carries the
    /// least certain of the input estimates; an empty input is a finished
    /// zero-part operation.
    pub fn sum<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = ProgressParts>,
    {
        let mut acc = Self::finalized(0, 0);
        for p in parts {
            acc.done += p.done;
            acc.known += p.known;
            acc.total += p.total;
            acc.kind = acc.kind.min(p.kind);
        }
        acc.normalised()
    }

    /// One part per sub-operation, done once that operation is done.
    pub fn count_of<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = ProgressParts>,
    {
        let (mut done, mut known) = (0, 0);
        for p in parts {
            known += 1;
            if p.is_done() {
                done += 1;
            }
        }
        Self::finalized(done, known)
    }

    /// `known`, if it is the final part count.
    pub fn finalized_total(&self) -> Option<u64> {
        (self.kind == EstimateKind::Finalized).then_some(self.known)
    }

    pub fn is_done(&self) -> bool {
        self.kind == EstimateKind::Finalized && self.done == self.known
    }

    pub fn is_started(&self) -> bool {
        self.known > 0 || self.kind == EstimateKind::Finalized
    }

    /// Completed fraction of the best available total, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return if self.is_done() { 1.0 } else { 0.0 };
        }
        self.done as f64 / self.total as f64
    }

    pub fn percent(&self) -> String {
        format!("{:.1}%", self.fraction() * 100.0)
    }
}

impl Default for ProgressParts {
    fn default() -> Self {
        Self::unknown(0, 0)
    }
}

impl fmt::Display for ProgressParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EstimateKind::Finalized => write!(f, "{}/{}/{}", self.done, self.known, self.total),
            EstimateKind::LowerBound => write!(f, "{}/{}/~{}", self.done, self.known, self.total),
            EstimateKind::Unknown => write!(f, "{}/{}/??", self.done, self.known),
        }
    }
}
