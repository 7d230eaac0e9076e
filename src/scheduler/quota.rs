//! Quota arithmetic. Quantities arrive as Kubernetes strings (`500m`,
//! `10Gi`) and are normalized to cpu millis and memory bytes; cpu and memory
//! slice counts are computed independently and the larger governs.

use serde::{Deserialize, Serialize};

use crate::errors::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Quota {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

impl Quota {
    pub fn new(cpu_millis: i64, memory_bytes: i64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    pub fn parse(cpu: &str, memory: &str) -> Result<Self, Error> {
        Ok(Self {
            cpu_millis: parse_cpu(cpu)?,
            memory_bytes: parse_memory(memory)?,
        })
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0
    }

    pub fn saturating_add(&self, other: &Quota) -> Quota {
        Quota {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }

    pub fn saturating_sub(&self, other: &Quota) -> Quota {
        Quota {
            cpu_millis: (self.cpu_millis - other.cpu_millis).max(0),
            memory_bytes: (self.memory_bytes - other.memory_bytes).max(0),
        }
    }

    pub fn scaled(&self, n: u32) -> Quota {
        Quota {
            cpu_millis: self.cpu_millis.saturating_mul(n as i64),
            memory_bytes: self.memory_bytes.saturating_mul(n as i64),
        }
    }

    pub fn fits(&self, within: &Quota) -> bool {
        self.cpu_millis <= within.cpu_millis && self.memory_bytes <= within.memory_bytes
    }
}

/// `max(ceil(cpu / cpu_slice), ceil(mem / mem_slice))`; a zero slice
/// dimension contributes nothing.
pub fn total_slices(quota: &Quota, slice: &Quota) -> u32 {
    let cpu = ceil_div(quota.cpu_millis, slice.cpu_millis);
    let mem = ceil_div(quota.memory_bytes, slice.memory_bytes);
    cpu.max(mem)
}

fn ceil_div(n: i64, d: i64) -> u32 {
    if d <= 0 || n <= 0 {
        return 0;
    }
    n.div_ceil(d).min(u32::MAX as i64) as u32
}

/// Cores or millicores: `2`, `1.5`, `500m`.
pub fn parse_cpu(s: &str) -> Result<i64, Error> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    if let Some(millis) = s.strip_suffix('m') {
        return millis
            .parse::<i64>()
            .map_err(|_| Error::InvalidConfig(format!("bad cpu quantity {s:?}")));
    }
    let cores: f64 = s
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("bad cpu quantity {s:?}")))?;
    Ok((cores * 1000.0).round() as i64)
}

/// Bytes with binary or decimal suffixes: `10Gi`, `512Mi`, `1G`, `1024`.
pub fn parse_memory(s: &str) -> Result<i64, Error> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    const UNITS: &[(&str, i64)] = &[
        ("Ti", 1 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
        ("T", 1_000_000_000_000),
        ("G", 1_000_000_000),
        ("M", 1_000_000),
        ("k", 1_000),
    ];
    for (suffix, factor) in UNITS {
        if let Some(num) = s.strip_suffix(suffix) {
            let value: f64 = num
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("bad memory quantity {s:?}")))?;
            return Ok((value * *factor as f64).round() as i64);
        }
    }
    s.parse::<i64>()
        .map_err(|_| Error::InvalidConfig(format!("bad memory quantity {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_parsing() {
        assert_eq!(parse_cpu("2").expect("cores"), 2000);
        assert_eq!(parse_cpu("500m").expect("millis"), 500);
        assert_eq!(parse_cpu("1.5").expect("fractional"), 1500);
        assert!(parse_cpu("two").is_err());
    }

    #[test]
    fn memory_parsing() {
        assert_eq!(parse_memory("1Gi").expect("gibi"), 1 << 30);
        assert_eq!(parse_memory("512Mi").expect("mebi"), 512 << 20);
        assert_eq!(parse_memory("1G").expect("giga"), 1_000_000_000);
        assert_eq!(parse_memory("1024").expect("bytes"), 1024);
        assert!(parse_memory("lots").is_err());
    }

    #[test]
    fn slice_count_takes_the_larger_dimension() {
        let quota = Quota::parse("10", "10Gi").expect("quota");
        let slice = Quota::parse("1", "1Gi").expect("slice");
        assert_eq!(total_slices(&quota, &slice), 10);

        // Memory dominates: 10 cpu slices but 20 memory slices.
        let quota = Quota::parse("10", "20Gi").expect("quota");
        assert_eq!(total_slices(&quota, &slice), 20);

        // Rounding up: 2.5 cpu slices -> 3.
        let quota = Quota::parse("2500m", "1Gi").expect("quota");
        assert_eq!(total_slices(&quota, &slice), 3);
    }

    #[test]
    fn zero_slice_dimension_is_ignored() {
        let quota = Quota::new(1000, 0);
        let slice = Quota::new(100, 0);
        assert_eq!(total_slices(&quota, &slice), 10);
    }
}
