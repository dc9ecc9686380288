//! CPU time samples read from `/proc/stat`.

use std::fs;

use nix::unistd::{sysconf, SysconfVar};
use quanta::{Clock, Instant};

use crate::{
    error::{Error, Result},
    message::{Tick, Ticks, T_N},
};

const PROC_STAT: &str = "/proc/stat";

/// Source of CPU tick snapshots. `Real` is derived from a monotonic clock
/// so that every bucket is expressed in the same unit.
#[derive(Debug, Clone)]
pub struct TickSource {
    clock: Clock,
    epoch: Instant,
    no_ticks: u32,
    no_cpus: u32,
}

impl TickSource {
    pub fn new(clock: Clock) -> Result<Self> {
        let no_ticks = sysconf(SysconfVar::CLK_TCK)
            .map_err(|e| Error::os("sysconf(CLK_TCK)", e))?
            .ok_or_else(|| Error::Internal("CLK_TCK is not defined".into()))?;

        let no_cpus = fs::read_to_string(PROC_STAT)
            .map(|text| count_cpus(&text))
            .unwrap_or(0);

        let epoch = clock.now();
        Ok(Self {
            clock,
            epoch,
            no_ticks: no_ticks as u32,
            no_cpus,
        })
    }

    pub fn no_ticks(&self) -> u32 {
        self.no_ticks
    }

    pub fn no_cpus(&self) -> u32 {
        self.no_cpus
    }

    /// Samples every bucket, taking `Real` from `at`.
    pub fn sample_at(&self, at: Instant) -> Result<Ticks> {
        let text = fs::read_to_string(PROC_STAT).map_err(|e| Error::io(PROC_STAT, e))?;
        let mut ticks = parse_cpu_line(&text)?;
        let elapsed = at.saturating_duration_since(self.epoch);
        ticks[Tick::Real as usize] =
            (elapsed.as_nanos() * u128::from(self.no_ticks) / 1_000_000_000) as u64;
        Ok(ticks)
    }

    pub fn sample(&self) -> Result<Ticks> {
        self.sample_at(self.clock.now())
    }
}

fn count_cpus(text: &str) -> u32 {
    text.lines()
        .filter(|line| {
            line.strip_prefix("cpu")
                .and_then(|rest| rest.chars().next())
                .is_some_and(|c| c.is_ascii_digit())
        })
        .count() as u32
}

/// Parses the aggregate `cpu` line: user nice system idle iowait irq
/// softirq steal. Kernels that report fewer columns leave the rest zero.
fn parse_cpu_line(text: &str) -> Result<Ticks> {
    let line = text
        .lines()
        .find(|line| line.split_whitespace().next() == Some("cpu"))
        .ok_or_else(|| Error::Internal(format!("no aggregate cpu line in {PROC_STAT}")))?;

    let mut ticks = [0u64; T_N];
    for (slot, field) in ticks[..Tick::Real as usize]
        .iter_mut()
        .zip(line.split_whitespace().skip(1))
    {
        *slot = field
            .parse()
            .map_err(|_| Error::Internal(format!("bad cpu field {field:?} in {PROC_STAT}")))?;
    }
    Ok(ticks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
cpu  10132153 290696 3084719 46828483 16683 0 25195 0 175628 0
cpu0 1393280 32966 572056 13343292 6130 0 17875 0 23933 0
cpu1 1335861 26855 415298 13412245 2908 0 1296 0 31417 0
intr 1462898 48 0 0
ctxt 2307479
";

    #[test]
    fn parses_aggregate_line() {
        let ticks = parse_cpu_line(SAMPLE).unwrap();
        assert_eq!(ticks[Tick::User as usize], 10132153);
        assert_eq!(ticks[Tick::Idle as usize], 46828483);
        assert_eq!(ticks[Tick::SoftIrq as usize], 25195);
        assert_eq!(ticks[Tick::Steal as usize], 0);
        assert_eq!(ticks[Tick::Real as usize], 0);
    }

    #[test]
    fn counts_per_cpu_lines() {
        assert_eq!(count_cpus(SAMPLE), 2);
    }

    #[test]
    fn short_lines_are_padded() {
        let ticks = parse_cpu_line("cpu 1 2 3 4\n").unwrap();
        assert_eq!(&ticks[..5], &[1, 2, 3, 4, 0]);
    }

    #[test]
    fn missing_line_is_an_error() {
        assert!(parse_cpu_line("intr 1 2\n").is_err());
    }
}
