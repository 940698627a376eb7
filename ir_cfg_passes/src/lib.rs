//! Rewrites on [`ir_cfg::Function`].
//!
//! Passes run in this order: [`ConstantFold`], [`EliminateDead`], then for
//! coroutines [`StateMachine`], followed by [`Stackify`] and [`GcDiscover`].
use ir_cfg::{Function, IrError};
use middleware::GlobalContext;

mod constant_fold;
mod eliminate_dead;
mod gc_discover;
mod stackify;
mod state_machine;

pub use constant_fold::ConstantFold;
pub use eliminate_dead::EliminateDead;
pub use gc_discover::GcDiscover;
pub use stackify::Stackify;
pub use state_machine::{StateMachine, StepLayout};

pub trait CfgPass<'ctx> {
    fn run_pass(&mut self, ctx: &GlobalContext<'ctx>, function: &mut Function) -> Result<(), IrError>;
}
