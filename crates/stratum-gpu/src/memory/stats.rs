//! Allocation statistics and the text report.

use crate::backend::MemoryFlags;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use stratum_core::math::format_bytes;
use stratum_core::ResourceType;

/// Number of named allocations listed in a report.
const REPORT_TOP_NAMES: usize = 16;

/// Count and byte total of a set of allocations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    pub count: u64,
    pub bytes: u64,
}

impl Tally {
    fn add(&mut self, bytes: u64) {
        self.count += 1;
        self.bytes += bytes;
    }

    fn remove(&mut self, bytes: u64) {
        self.count = self.count.saturating_sub(1);
        self.bytes = self.bytes.saturating_sub(bytes);
    }
}

/// Live allocation statistics.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub total: Tally,
    pub per_type: [Tally; ResourceType::COUNT],
    /// Keyed by debug name, for leak hunting.
    pub per_name: HashMap<String, Tally>,
    /// Keyed by the property flags of the memory type actually used.
    pub per_flags: BTreeMap<MemoryFlags, Tally>,
}

impl Stats {
    pub(crate) fn record(&mut self, name: &str, ty: ResourceType, flags: MemoryFlags, bytes: u64) {
        self.total.add(bytes);
        self.per_type[ty.index()].add(bytes);
        self.per_name.entry(name.to_string()).or_default().add(bytes);
        self.per_flags.entry(flags).or_default().add(bytes);
    }

    pub(crate) fn release(&mut self, name: &str, ty: ResourceType, flags: MemoryFlags, bytes: u64) {
        self.total.remove(bytes);
        self.per_type[ty.index()].remove(bytes);
        if let Some(tally) = self.per_name.get_mut(name) {
            tally.remove(bytes);
            if tally.count == 0 {
                self.per_name.remove(name);
            }
        }
        if let Some(tally) = self.per_flags.get_mut(&flags) {
            tally.remove(bytes);
            if tally.count == 0 {
                self.per_flags.remove(&flags);
            }
        }
    }

    /// Statistics for one resource type.
    #[inline]
    pub fn by_type(&self, ty: ResourceType) -> Tally {
        self.per_type[ty.index()]
    }

    /// Human-readable report: totals, per type, per memory flags and the
    /// largest allocations by name.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "GPU memory: {} allocations, {}",
            self.total.count,
            format_bytes(self.total.bytes)
        );

        let _ = writeln!(out, "By type:");
        for ty in ResourceType::ALL {
            let tally = self.by_type(ty);
            if tally.count > 0 {
                let _ = writeln!(
                    out,
                    "  {:<14} {:>6} {:>12}",
                    ty.name(),
                    tally.count,
                    format_bytes(tally.bytes)
                );
            }
        }

        let _ = writeln!(out, "By memory flags:");
        for (flags, tally) in &self.per_flags {
            let _ = writeln!(
                out,
                "  {:<40} {:>6} {:>12}",
                flag_names(*flags),
                tally.count,
                format_bytes(tally.bytes)
            );
        }

        let mut names: Vec<_> = self.per_name.iter().collect();
        names.sort_by(|a, b| b.1.bytes.cmp(&a.1.bytes).then_with(|| a.0.cmp(b.0)));
        let _ = writeln!(out, "Largest by name:");
        for (name, tally) in names.into_iter().take(REPORT_TOP_NAMES) {
            let _ = writeln!(
                out,
                "  {:<40} {:>6} {:>12}",
                name,
                tally.count,
                format_bytes(tally.bytes)
            );
        }
        out
    }
}

fn flag_names(flags: MemoryFlags) -> String {
    if flags.is_empty() {
        return "NONE".to_string();
    }
    flags
        .iter_names()
        .map(|(name, _)| name)
        .collect::<Vec<_>>()
        .join(" | ")
}
