//! Value objects controlling bounding, monitoring, and the bulk sink's
//! target table (spec.md §4.5).

use std::time::Duration;

/// Sentinel meaning "no bound" for [`Options::bounded_capacity`].
pub const UNBOUNDED: usize = usize::MAX;

/// Whether the monitor loop logs zero-valued buffer statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorMode {
    /// Only non-zero buffer counts are logged.
    #[default]
    Default,
    /// Every interval is logged, including all-zero ones.
    Verbose,
}

/// Construction options shared by every graph node and its primitive
/// blocks.
///
/// Defaults (spec.md does not fix these; resolved in `DESIGN.md`):
/// unbounded capacity, monitoring off, [`MonitorMode::Default`], a 5 second
/// monitor interval.
#[derive(Debug, Clone)]
pub struct Options {
    /// Max in-flight items for each primitive block; [`UNBOUNDED`] for no
    /// bound.
    pub bounded_capacity: usize,
    /// Emit this node's aggregate buffer status every monitor interval.
    pub flow_monitor_enabled: bool,
    /// Emit each child's buffer status every monitor interval.
    pub block_monitor_enabled: bool,
    /// Whether zero-valued statuses are included when monitoring is on.
    pub monitor_mode: MonitorMode,
    /// How often the monitor loop wakes up.
    pub monitor_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            bounded_capacity: UNBOUNDED,
            flow_monitor_enabled: false,
            block_monitor_enabled: false,
            monitor_mode: MonitorMode::Default,
            monitor_interval: Duration::from_secs(5),
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bounded_capacity(mut self, capacity: usize) -> Self {
        self.bounded_capacity = capacity;
        self
    }

    pub fn with_flow_monitor(mut self, enabled: bool) -> Self {
        self.flow_monitor_enabled = enabled;
        self
    }

    pub fn with_block_monitor(mut self, enabled: bool) -> Self {
        self.block_monitor_enabled = enabled;
        self
    }

    pub fn with_monitor_mode(mut self, mode: MonitorMode) -> Self {
        self.monitor_mode = mode;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// True if either monitor flag is on.
    pub fn monitoring_enabled(&self) -> bool {
        self.flow_monitor_enabled || self.block_monitor_enabled
    }

    /// Projection of these options onto the batcher's primitive block
    /// (spec.md §4.5 "grouping-block-options").
    pub fn grouping_block_options(&self) -> Options {
        self.clone()
    }

    /// Projection of these options onto the executor's primitive block
    /// (spec.md §4.5 "execution-block-options"), with the concurrency bound
    /// derived by dividing the row-level bound by the bulk size so the
    /// effective row pressure stays within `bounded_capacity`.
    pub fn execution_block_options(&self, bulk_size: usize) -> Options {
        let capacity = if self.bounded_capacity == UNBOUNDED {
            UNBOUNDED
        } else {
            (self.bounded_capacity / bulk_size.max(1)).max(1)
        };
        Options {
            bounded_capacity: capacity,
            ..self.clone()
        }
    }
}

/// Connection parameters, physical table name and mapping label describing
/// the batched bulk sink's target (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct TargetTable {
    /// Opaque connection string/parameters for the target store.
    pub connection_string: String,
    /// Physical table name at the target.
    pub table_name: String,
    /// Label identifying the object-to-column mapping to use (external
    /// mapper, out of scope — spec.md §1).
    pub mapping_label: String,
}

impl TargetTable {
    pub fn new(
        connection_string: impl Into<String>,
        table_name: impl Into<String>,
        mapping_label: impl Into<String>,
    ) -> Self {
        Self {
            connection_string: connection_string.into(),
            table_name: table_name.into(),
            mapping_label: mapping_label.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_block_options_divides_row_bound() {
        let opts = Options::new().with_bounded_capacity(10_000);
        let exec = opts.execution_block_options(8192);
        assert_eq!(exec.bounded_capacity, 1);

        let opts = Options::new().with_bounded_capacity(100_000);
        let exec = opts.execution_block_options(8192);
        assert_eq!(exec.bounded_capacity, 12);
    }

    #[test]
    fn unbounded_stays_unbounded() {
        let opts = Options::new();
        let exec = opts.execution_block_options(8192);
        assert_eq!(exec.bounded_capacity, UNBOUNDED);
    }
}
