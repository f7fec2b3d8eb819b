//! Metric descriptor table (C3, spec §3.5, §4.3).

use thiserror::Error;

/// What kind of value a metric's per-node accumulator represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Inclusive,
    Exclusive,
    Derived,
}

/// The bitmask fields named in spec §3.5, expressed as plain booleans
/// rather than a packed integer — there's no wire requirement that they
/// stay packed in memory, only in the serialized `flags:u32` (spec §4.8).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricFlags {
    pub asynchronous: bool,
    /// Set when this slot is a placeholder ("NIL") not yet configured.
    pub nil: bool,
    /// True: this metric counts raw events. False: it counts samples.
    pub counts_events: bool,
}

impl MetricFlags {
    pub fn to_bits(self) -> u32 {
        (self.asynchronous as u32) | ((self.nil as u32) << 1) | ((self.counts_events as u32) << 2)
    }

    pub fn from_bits(bits: u32) -> Self {
        MetricFlags {
            asynchronous: bits & 1 != 0,
            nil: bits & 2 != 0,
            counts_events: bits & 4 != 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricDescriptor {
    pub name: String,
    pub period: u64,
    pub flags: MetricFlags,
    pub kind: MetricKind,
    pub index: usize,
}

/// A handle into the table, returned by [`MetricDescriptorTable::new_metric`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricId(pub usize);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetricTableError {
    #[error("PROF_MAX_METRICS must be between 0 and 10, got {0}")]
    MaxOutOfRange(usize),
    #[error("set_max must be called before new_metric")]
    MaxNotSet,
    #[error("metric descriptor table is full (max {0})")]
    Full(usize),
    #[error("metric id {0:?} was never allocated via new_metric")]
    UnknownId(MetricId),
    #[error("metric descriptor table is already immutable (sampling has started)")]
    Frozen,
}

/// Ordered list of metric descriptors, process-wide and immutable once
/// sampling begins (spec §4.3). Per-node accumulator vectors are sized to
/// `width()`, laid out at the tail of each [`crate::cct::Node`].
#[derive(Debug, Default)]
pub struct MetricDescriptorTable {
    max: Option<usize>,
    descriptors: Vec<Option<MetricDescriptor>>,
    frozen: bool,
}

/// Hard ceiling named by `PROF_MAX_METRICS` (spec §6.2).
pub const MAX_METRICS_CEILING: usize = 10;

impl MetricDescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_max(&mut self, n: usize) -> Result<(), MetricTableError> {
        if self.frozen {
            return Err(MetricTableError::Frozen);
        }
        if n > MAX_METRICS_CEILING {
            return Err(MetricTableError::MaxOutOfRange(n));
        }
        self.max = Some(n);
        self.descriptors = (0..n).map(|_| None).collect();
        Ok(())
    }

    pub fn new_metric(&mut self) -> Result<MetricId, MetricTableError> {
        if self.frozen {
            return Err(MetricTableError::Frozen);
        }
        let max = self.max.ok_or(MetricTableError::MaxNotSet)?;
        let index = self.descriptors.iter().position(|d| d.is_none());
        match index {
            Some(i) => Ok(MetricId(i)),
            None => Err(MetricTableError::Full(max)),
        }
    }

    pub fn set_info(
        &mut self,
        id: MetricId,
        name: impl Into<String>,
        flags: MetricFlags,
        period: u64,
        kind: MetricKind,
    ) -> Result<(), MetricTableError> {
        if self.frozen {
            return Err(MetricTableError::Frozen);
        }
        let slot = self
            .descriptors
            .get_mut(id.0)
            .ok_or(MetricTableError::UnknownId(id))?;
        *slot = Some(MetricDescriptor {
            name: name.into(),
            period,
            flags,
            kind,
            index: id.0,
        });
        Ok(())
    }

    /// Called once, right before the timer starts, to fix the table for
    /// the rest of the process's life.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// The fixed per-node accumulator width: every configured slot, even
    /// ones left at their zero value, counts toward it.
    pub fn width(&self) -> usize {
        self.max.unwrap_or(0)
    }

    pub fn get(&self, id: MetricId) -> Option<&MetricDescriptor> {
        self.descriptors.get(id.0).and_then(|d| d.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricDescriptor> {
        self.descriptors.iter().filter_map(|d| d.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_max_above_ceiling() {
        let mut table = MetricDescriptorTable::new();
        assert_eq!(
            table.set_max(11),
            Err(MetricTableError::MaxOutOfRange(11))
        );
    }

    #[test]
    fn new_metric_before_set_max_errors() {
        let mut table = MetricDescriptorTable::new();
        assert_eq!(table.new_metric(), Err(MetricTableError::MaxNotSet));
    }

    #[test]
    fn allocates_slots_up_to_max() {
        let mut table = MetricDescriptorTable::new();
        table.set_max(2).unwrap();
        let a = table.new_metric().unwrap();
        let b = table.new_metric().unwrap();
        assert_ne!(a, b);
        assert_eq!(table.new_metric(), Err(MetricTableError::Full(2)));
        table
            .set_info(a, "WALLCLOCK", MetricFlags::default(), 5000, MetricKind::Exclusive)
            .unwrap();
        assert_eq!(table.width(), 2);
    }

    #[test]
    fn frozen_table_rejects_mutation() {
        let mut table = MetricDescriptorTable::new();
        table.set_max(1).unwrap();
        table.freeze();
        assert_eq!(table.set_max(2), Err(MetricTableError::Frozen));
        assert_eq!(table.new_metric(), Err(MetricTableError::Frozen));
    }
}
