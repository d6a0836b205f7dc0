use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use dosre_mem::SegmentedAddress;
use serde::Serialize;

use super::overrides::OverrideFn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CallType {
    Near,
    Far,
    Interrupt,
    /// The root frame the machine pushes around the whole run.
    Machine,
}

/// A return instruction: how it returns and where it sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FunctionReturn {
    pub kind: CallType,
    pub address: SegmentedAddress,
}

impl fmt::Display for FunctionReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} return at {}", self.kind, self.address)
    }
}

/// Return instruction to the targets it was seen returning to.
pub type ReturnTargets = BTreeMap<FunctionReturn, BTreeSet<SegmentedAddress>>;

/// One frame of the shadow call stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionCall {
    pub kind: CallType,
    pub entry: SegmentedAddress,
    /// `None` when the return target cannot be predicted, e.g. hardware
    /// interrupts.
    pub expected_return: Option<SegmentedAddress>,
    /// SS:SP right after the return information was pushed.
    pub stack_at_call: SegmentedAddress,
    pub record_return: bool,
}

/// Everything learnt about one function entry point during a run.
pub struct FunctionInformation {
    address: SegmentedAddress,
    name: String,
    returns: ReturnTargets,
    unaligned_returns: ReturnTargets,
    callers: BTreeSet<SegmentedAddress>,
    called_count: u64,
    override_fn: Option<OverrideFn>,
}

impl FunctionInformation {
    pub fn new(address: SegmentedAddress, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            returns: BTreeMap::new(),
            unaligned_returns: BTreeMap::new(),
            callers: BTreeSet::new(),
            called_count: 0,
            override_fn: None,
        }
    }

    pub fn with_override(
        address: SegmentedAddress,
        name: impl Into<String>,
        override_fn: OverrideFn,
    ) -> Self {
        Self {
            override_fn: Some(override_fn),
            ..Self::new(address, name)
        }
    }

    pub fn address(&self) -> SegmentedAddress {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<name>_<SSSS>_<OOOO>_<PPPPP>`.
    pub fn qualified_name(&self) -> String {
        format!(
            "{}_{:04X}_{:04X}_{:05X}",
            self.name,
            self.address.segment(),
            self.address.offset(),
            self.address.physical()
        )
    }

    pub fn returns(&self) -> &ReturnTargets {
        &self.returns
    }

    pub fn unaligned_returns(&self) -> &ReturnTargets {
        &self.unaligned_returns
    }

    pub fn callers(&self) -> &BTreeSet<SegmentedAddress> {
        &self.callers
    }

    pub fn called_count(&self) -> u64 {
        self.called_count
    }

    pub fn has_override(&self) -> bool {
        self.override_fn.is_some()
    }

    pub(crate) fn override_fn_mut(&mut self) -> Option<&mut OverrideFn> {
        self.override_fn.as_mut()
    }

    pub(crate) fn enter(&mut self, caller: Option<SegmentedAddress>) {
        self.called_count += 1;
        if let Some(caller) = caller {
            self.callers.insert(caller);
        }
    }

    pub(crate) fn add_return(
        &mut self,
        ret: FunctionReturn,
        target: Option<SegmentedAddress>,
        aligned: bool,
    ) {
        let map = if aligned {
            &mut self.returns
        } else {
            &mut self.unaligned_returns
        };
        let targets = map.entry(ret).or_default();
        if let Some(target) = target {
            targets.insert(target);
        }
    }

    /// Keeps the richer name and any override when two sources describe the
    /// same entry point.
    pub(crate) fn merge(&mut self, other: FunctionInformation) {
        if self.name == super::UNKNOWN_FUNCTION_NAME {
            self.name = other.name;
        }
        if other.override_fn.is_some() {
            self.override_fn = other.override_fn;
        }
    }
}

impl fmt::Debug for FunctionInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionInformation")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("called_count", &self.called_count)
            .field("callers", &self.callers)
            .field("returns", &self.returns)
            .field("unaligned_returns", &self.unaligned_returns)
            .field("overridden", &self.override_fn.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReturnSummary {
    pub kind: CallType,
    pub address: SegmentedAddress,
    pub targets: Vec<SegmentedAddress>,
}

/// Serializable view of a [`FunctionInformation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionSummary {
    pub name: String,
    pub address: SegmentedAddress,
    pub called_count: u64,
    pub callers: Vec<SegmentedAddress>,
    pub returns: Vec<ReturnSummary>,
    pub unaligned_returns: Vec<ReturnSummary>,
    pub overridden: bool,
}

fn summarize(returns: &ReturnTargets) -> Vec<ReturnSummary> {
    returns
        .iter()
        .map(|(ret, targets)| ReturnSummary {
            kind: ret.kind,
            address: ret.address,
            targets: targets.iter().copied().collect(),
        })
        .collect()
}

impl From<&FunctionInformation> for FunctionSummary {
    fn from(info: &FunctionInformation) -> Self {
        Self {
            name: info.name.clone(),
            address: info.address,
            called_count: info.called_count,
            callers: info.callers.iter().copied().collect(),
            returns: summarize(&info.returns),
            unaligned_returns: summarize(&info.unaligned_returns),
            overridden: info.has_override(),
        }
    }
}
