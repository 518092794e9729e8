//! Control engine
//!
//! Controllers, the expressions that combine them, and the failure-count
//! bucket tables used by the zone and driver overlays.

mod boost;
mod controller;
mod expr;
mod pid;
mod table;

pub use boost::{BucketTable, DeadFanOverlay, FanDeadPolicy, MultiFanFail};
pub use controller::{Controller, ProfileSpec, TickContext};
pub use expr::{compile, Bindings, CompiledExpr, ExprNode, Expression};
pub use pid::{Feedforward, IncrementPid, IndependentPid, Pid};
pub use table::{CurveSelection, TablePoint, ThresholdTable, ThresholdTable4Curve};
