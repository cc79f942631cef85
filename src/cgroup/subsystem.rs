//! The resource-control files a container cgroup is driven through.
//!
//! Each subsystem owns one file and a typed value with a parse/serialize
//! pair matching the kernel's text format.

use std::fmt;

use crate::cgroup::size::parse_size;
use crate::error::{Error, Result};

pub const LITERAL_MAX: &str = "max";
pub const DEFAULT_CPU_PERIOD: u64 = 100_000;
/// Smallest quota the kernel accepts in `cpu.max`, in microseconds.
pub const MIN_CPU_QUOTA: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubsystemKind {
    Procs,
    CpuMax,
    MemoryMax,
}

impl SubsystemKind {
    /// Order in which the manager writes the files.
    pub const SYNC_ORDER: [Self; 3] = [Self::CpuMax, Self::MemoryMax, Self::Procs];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Procs => "cgroup.procs",
            Self::CpuMax => "cpu.max",
            Self::MemoryMax => "memory.max",
        }
    }
}

impl fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// `cpu.max`: quota per period in microseconds, `None` quota meaning no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMax {
    pub quota: Option<u64>,
    pub period: u64,
}

impl Default for CpuMax {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl CpuMax {
    pub const fn unlimited() -> Self {
        Self {
            quota: None,
            period: DEFAULT_CPU_PERIOD,
        }
    }

    /// Accepts the kernel format (`"50000 100000"`, `"max 100000"`), a bare
    /// `"max"`, an empty string, or a fractional core count such as `"0.5"`.
    pub fn parse(data: &str) -> Result<Self> {
        let fields: Vec<&str> = data.split_whitespace().collect();
        match fields.as_slice() {
            [] => Ok(Self::unlimited()),
            [LITERAL_MAX] => Ok(Self::unlimited()),
            [cores] => Self::from_cores(cores),
            [quota, period] => {
                let quota = match *quota {
                    LITERAL_MAX => None,
                    q => Some(parse_u64(q, data)?),
                };
                Ok(Self {
                    quota,
                    period: parse_u64(period, data)?,
                })
            }
            _ => Err(Error::MalformedType(format!("invalid cpu.max {data:?}"))),
        }
    }

    fn from_cores(cores: &str) -> Result<Self> {
        let cores: f64 = cores
            .parse()
            .map_err(|_| Error::MalformedType(format!("invalid cpu limit {cores:?}")))?;
        if cores <= 0.0 || !cores.is_finite() {
            return Err(Error::MalformedType(format!("invalid cpu limit {cores}")));
        }
        let quota = (cores * DEFAULT_CPU_PERIOD as f64) as u64;
        if quota < MIN_CPU_QUOTA {
            return Err(Error::MalformedType(format!(
                "cpu limit {cores} is below {} cores",
                MIN_CPU_QUOTA as f64 / DEFAULT_CPU_PERIOD as f64
            )));
        }
        Ok(Self {
            quota: Some(quota),
            period: DEFAULT_CPU_PERIOD,
        })
    }

    pub fn serialize(&self) -> String {
        match self.quota {
            Some(quota) => format!("{quota} {}", self.period),
            None => format!("{LITERAL_MAX} {}", self.period),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::unlimited() || (self.quota == Some(0) && self.period == 0)
    }
}

/// `memory.max`: byte limit, `None` meaning no limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryMax(pub Option<u64>);

impl MemoryMax {
    pub fn parse(data: &str) -> Result<Self> {
        match data.trim() {
            "" | LITERAL_MAX => Ok(Self(None)),
            s => parse_size(s).map(|bytes| Self(Some(bytes))),
        }
    }

    pub fn serialize(&self) -> String {
        match self.0 {
            Some(bytes) => bytes.to_string(),
            None => LITERAL_MAX.to_string(),
        }
    }
}

fn parse_u64(field: &str, data: &str) -> Result<u64> {
    field
        .parse()
        .map_err(|_| Error::MalformedType(format!("invalid number {field:?} in {data:?}")))
}

fn parse_pids(data: &str) -> Result<Vec<i32>> {
    data.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse()
                .map_err(|_| Error::MalformedType(format!("invalid pid {line:?}")))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Procs(Vec<i32>),
    CpuMax(CpuMax),
    MemoryMax(MemoryMax),
}

/// What `set` adds and `delete` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Item {
    Pid(i32),
    CpuMax(CpuMax),
    MemoryMax(MemoryMax),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subsystem {
    kind: SubsystemKind,
    value: Value,
}

impl Subsystem {
    pub fn parse(kind: SubsystemKind, data: &str) -> Result<Self> {
        let value = match kind {
            SubsystemKind::Procs => Value::Procs(parse_pids(data)?),
            SubsystemKind::CpuMax => Value::CpuMax(CpuMax::parse(data)?),
            SubsystemKind::MemoryMax => Value::MemoryMax(MemoryMax::parse(data)?),
        };
        Ok(Self { kind, value })
    }

    pub fn kind(&self) -> SubsystemKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.file_name()
    }

    pub fn get(&self) -> &Value {
        &self.value
    }

    pub fn empty(&self) -> bool {
        match &self.value {
            Value::Procs(pids) => pids.is_empty(),
            Value::CpuMax(cpu) => cpu.is_empty(),
            Value::MemoryMax(mem) => mem.0.is_none(),
        }
    }

    /// Adding a pid that is already present is a no-op.
    pub fn set(&mut self, item: Item) -> Result<()> {
        let kind = self.kind;
        match (&mut self.value, item) {
            (Value::Procs(pids), Item::Pid(pid)) => {
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
            (Value::CpuMax(cpu), Item::CpuMax(new)) => *cpu = new,
            (Value::MemoryMax(mem), Item::MemoryMax(new)) => *mem = new,
            (_, item) => return Err(mismatch(kind, item)),
        }
        Ok(())
    }

    /// Removes a pid, or resets a limit to unlimited.
    pub fn delete(&mut self, item: Item) -> Result<()> {
        let kind = self.kind;
        match (&mut self.value, item) {
            (Value::Procs(pids), Item::Pid(pid)) => {
                if pids.is_empty() {
                    return Err(Error::ProcsEmpty);
                }
                let pos = pids
                    .iter()
                    .position(|p| *p == pid)
                    .ok_or(Error::ProcsPidNotFound(pid))?;
                pids.remove(pos);
            }
            (Value::CpuMax(cpu), Item::CpuMax(_)) => *cpu = CpuMax::unlimited(),
            (Value::MemoryMax(mem), Item::MemoryMax(_)) => *mem = MemoryMax(None),
            (_, item) => return Err(mismatch(kind, item)),
        }
        Ok(())
    }

    /// Text for the cgroup file. For procs this is one pid per line.
    pub fn serialize(&self) -> String {
        match &self.value {
            Value::Procs(pids) => pids
                .iter()
                .map(i32::to_string)
                .collect::<Vec<_>>()
                .join("\n"),
            Value::CpuMax(cpu) => cpu.serialize(),
            Value::MemoryMax(mem) => mem.serialize(),
        }
    }
}

fn mismatch(kind: SubsystemKind, item: Item) -> Error {
    Error::MalformedType(format!("{item:?} does not apply to {kind}"))
}
